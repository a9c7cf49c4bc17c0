use std::sync::atomic::{AtomicU64, Ordering};

use rcl_protocol::handle::{NetworkHandle, ResourceType};

/// Server-side handle allocator. Generates unique NetworkHandles for a session.
pub struct HandleAllocator {
    server_id: u16,
    session_id: u32,
    next_id: AtomicU64,
}

impl HandleAllocator {
    pub fn new(server_id: u16, session_id: u32) -> Self {
        Self {
            server_id,
            session_id,
            // Start from 1 so no live handle is ever null
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a new network handle with the given resource type.
    pub fn alloc(&self, resource_type: ResourceType) -> NetworkHandle {
        NetworkHandle {
            server_id: self.server_id,
            session_id: self.session_id,
            resource_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            resource_type,
        }
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }
}
