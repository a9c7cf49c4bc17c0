use serde::{Deserialize, Serialize};

/// Accelerator capability information, shared between server and client.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name
    pub device_name: String,
    /// Vendor string reported by the driver
    pub vendor: String,
    /// Driver/platform version string (e.g. "OpenCL 1.2 ...")
    pub version: String,
    /// Device type classification
    pub device_type: DeviceType,
    /// Global memory in bytes
    pub global_mem_size: u64,
    /// Whether the command queue runs out of order
    pub out_of_order: bool,
    /// Whether profiling is enabled on the command queue
    pub profiling: bool,
    /// Whether patterned fill is available
    pub supports_fill: bool,
    /// Server-side device index (argument of `OpenDevice`)
    pub server_device_index: u32,
    /// Which server this device belongs to
    #[serde(default)]
    pub server_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum DeviceType {
    Gpu,
    Cpu,
    Accelerator,
    Other,
}
