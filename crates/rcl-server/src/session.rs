use std::collections::HashSet;

use rcl_core::HandleAllocator;
use rcl_protocol::handle::{NetworkHandle, ResourceType};

/// Per-client session state on the server side.
///
/// Handles are valid for every session on the node (a peer node reads
/// buffers created by other clients); the session only remembers what it
/// allocated so it can release leftovers on disconnect.
pub struct Session {
    client_name: String,
    allocator: HandleAllocator,
    allocated_handles: parking_lot::RwLock<HashSet<NetworkHandle>>,
    /// Device indices this session may open (None = all)
    allowed_devices: Option<Vec<u32>>,
}

impl Session {
    pub fn new(
        session_id: u32,
        server_id: u16,
        client_name: String,
        allowed_devices: Option<Vec<u32>>,
    ) -> Self {
        Self {
            client_name,
            allocator: HandleAllocator::new(server_id, session_id),
            allocated_handles: parking_lot::RwLock::new(HashSet::new()),
            allowed_devices,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.allocator.session_id()
    }

    pub fn server_id(&self) -> u16 {
        self.allocator.server_id()
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Allocate a new network handle with the given resource type.
    pub fn alloc_handle(&self, resource_type: ResourceType) -> NetworkHandle {
        let handle = self.allocator.alloc(resource_type);
        self.allocated_handles.write().insert(handle);
        handle
    }

    /// Stop tracking `handle`. Returns false if this session did not allocate it.
    pub fn remove_handle(&self, handle: &NetworkHandle) -> bool {
        self.allocated_handles.write().remove(handle)
    }

    /// Drain all tracked handles (for cleanup).
    pub fn take_handles(&self) -> Vec<NetworkHandle> {
        self.allocated_handles.write().drain().collect()
    }

    pub fn handle_count(&self) -> usize {
        self.allocated_handles.read().len()
    }

    pub fn may_open(&self, device_index: u32) -> bool {
        self.allowed_devices
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&device_index))
    }
}
