use serde::{Deserialize, Serialize};

/// A network-safe handle that uniquely identifies a compute resource.
/// Opaque to the client -- the server assigns these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct NetworkHandle {
    /// Which server (node) owns this resource
    pub server_id: u16,
    /// Which client session created it
    pub session_id: u32,
    /// Unique resource identifier within the session
    pub resource_id: u64,
    /// Type tag for debugging and validation
    pub resource_type: ResourceType,
}

impl NetworkHandle {
    /// Create a null/invalid handle.
    pub fn null() -> Self {
        Self {
            server_id: 0,
            session_id: 0,
            resource_id: 0,
            resource_type: ResourceType::None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.resource_type == ResourceType::None && self.resource_id == 0
    }

    /// True if this handle was allocated by the given node.
    pub fn is_on(&self, server_id: u16) -> bool {
        self.server_id == server_id
    }
}

impl std::fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}#{}@{}/{}",
            self.resource_type, self.resource_id, self.server_id, self.session_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ResourceType {
    None,
    Device,
    Buffer,
    Event,
    Program,
    Kernel,
}
