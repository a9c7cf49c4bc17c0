//! Native accelerator driver abstraction.
//!
//! The [`Driver`] trait mirrors the subset of the OpenCL 1.2 runtime the
//! device layer needs. [`OpenClDriver`] binds the system ICD loader at
//! runtime; [`HostDriver`] emulates an out-of-order queue in-process and is
//! used when no OpenCL runtime is installed.

pub mod host;
pub mod opencl;

pub use host::{HostDeviceSpec, HostDriver};
pub use opencl::OpenClDriver;

use rcl_protocol::cl_commands::{CopyRegion, MemFlags};
use rcl_protocol::device_info::DeviceType;

macro_rules! native_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub u64);
        )*
    };
}

native_handle!(
    /// `cl_device_id`
    NativeDevice,
    /// `cl_context`
    NativeContext,
    /// `cl_command_queue`
    NativeQueue,
    /// `cl_mem`
    NativeMem,
    /// `cl_event`; also the completion token the device registries are keyed by.
    NativeEvent,
    /// `cl_program`
    NativeProgram,
    /// `cl_kernel`
    NativeKernel,
);

// Status codes used outside the OpenCL binding.
pub const CL_SUCCESS: i32 = 0;
pub const CL_DEVICE_NOT_FOUND: i32 = -1;
pub const CL_OUT_OF_RESOURCES: i32 = -5;
pub const CL_OUT_OF_HOST_MEMORY: i32 = -6;
pub const CL_MEM_COPY_OVERLAP: i32 = -8;
pub const CL_BUILD_PROGRAM_FAILURE: i32 = -11;
pub const CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: i32 = -14;
pub const CL_INVALID_VALUE: i32 = -30;
pub const CL_INVALID_DEVICE: i32 = -33;
pub const CL_INVALID_CONTEXT: i32 = -34;
pub const CL_INVALID_COMMAND_QUEUE: i32 = -36;
pub const CL_INVALID_HOST_PTR: i32 = -37;
pub const CL_INVALID_MEM_OBJECT: i32 = -38;
pub const CL_INVALID_BINARY: i32 = -42;
pub const CL_INVALID_PROGRAM: i32 = -44;
pub const CL_INVALID_PROGRAM_EXECUTABLE: i32 = -45;
pub const CL_INVALID_KERNEL_NAME: i32 = -46;
pub const CL_INVALID_KERNEL: i32 = -48;
pub const CL_INVALID_EVENT_WAIT_LIST: i32 = -57;
pub const CL_INVALID_EVENT: i32 = -58;
pub const CL_INVALID_OPERATION: i32 = -59;
pub const CL_INVALID_BUFFER_SIZE: i32 = -61;
pub const CL_PLATFORM_NOT_FOUND_KHR: i32 = -1001;

/// Map an OpenCL status code to its symbolic name.
pub fn cl_error_name(code: i32) -> &'static str {
    match code {
        0 => "CL_SUCCESS",
        -1 => "CL_DEVICE_NOT_FOUND",
        -2 => "CL_DEVICE_NOT_AVAILABLE",
        -3 => "CL_COMPILER_NOT_AVAILABLE",
        -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
        -5 => "CL_OUT_OF_RESOURCES",
        -6 => "CL_OUT_OF_HOST_MEMORY",
        -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
        -8 => "CL_MEM_COPY_OVERLAP",
        -11 => "CL_BUILD_PROGRAM_FAILURE",
        -12 => "CL_MAP_FAILURE",
        -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
        -30 => "CL_INVALID_VALUE",
        -31 => "CL_INVALID_DEVICE_TYPE",
        -32 => "CL_INVALID_PLATFORM",
        -33 => "CL_INVALID_DEVICE",
        -34 => "CL_INVALID_CONTEXT",
        -35 => "CL_INVALID_QUEUE_PROPERTIES",
        -36 => "CL_INVALID_COMMAND_QUEUE",
        -37 => "CL_INVALID_HOST_PTR",
        -38 => "CL_INVALID_MEM_OBJECT",
        -42 => "CL_INVALID_BINARY",
        -43 => "CL_INVALID_BUILD_OPTIONS",
        -44 => "CL_INVALID_PROGRAM",
        -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
        -46 => "CL_INVALID_KERNEL_NAME",
        -48 => "CL_INVALID_KERNEL",
        -57 => "CL_INVALID_EVENT_WAIT_LIST",
        -58 => "CL_INVALID_EVENT",
        -59 => "CL_INVALID_OPERATION",
        -61 => "CL_INVALID_BUFFER_SIZE",
        -1001 => "CL_PLATFORM_NOT_FOUND_KHR",
        _ => "CL_UNKNOWN_ERROR",
    }
}

/// A native call returned a non-success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{call} failed: {} ({code})", cl_error_name(*code))]
pub struct DriverError {
    pub call: &'static str,
    pub code: i32,
}

impl DriverError {
    pub fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

/// Turn a raw status into a `Result`.
pub fn check(call: &'static str, code: i32) -> Result<(), DriverError> {
    if code == CL_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::new(call, code))
    }
}

/// `CL_EVENT_COMMAND_EXECUTION_STATUS` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// Terminated abnormally with this (negative) status.
    Error(i32),
}

impl EventStatus {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            3 => EventStatus::Queued,
            2 => EventStatus::Submitted,
            1 => EventStatus::Running,
            0 => EventStatus::Complete,
            code => EventStatus::Error(code),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            EventStatus::Queued => 3,
            EventStatus::Submitted => 2,
            EventStatus::Running => 1,
            EventStatus::Complete => 0,
            EventStatus::Error(code) => code,
        }
    }

    /// Complete or failed; no further transitions happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Error(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProperties {
    pub out_of_order: bool,
    pub profiling: bool,
}

/// One enumerated accelerator.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub native: NativeDevice,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub device_type: DeviceType,
    pub global_mem_size: u64,
    /// Queue properties the device supports.
    pub queue_caps: QueueProperties,
    pub supports_fill: bool,
}

/// Invoked once with the terminal status of an event.
pub type CompletionCallback = Box<dyn FnOnce(EventStatus) + Send + 'static>;

/// The native runtime calls the device layer is built on.
///
/// Every enqueue call is non-blocking and returns the event of the new
/// command; `deps` is the wait list the command is gated on.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, DriverError>;

    fn create_context(&self, device: NativeDevice) -> Result<NativeContext, DriverError>;
    fn release_context(&self, context: NativeContext) -> Result<(), DriverError>;

    fn create_queue(
        &self,
        context: NativeContext,
        device: NativeDevice,
        properties: QueueProperties,
    ) -> Result<NativeQueue, DriverError>;
    fn flush(&self, queue: NativeQueue) -> Result<(), DriverError>;
    /// Block until every command enqueued on `queue` has completed.
    fn finish(&self, queue: NativeQueue) -> Result<(), DriverError>;
    fn release_queue(&self, queue: NativeQueue) -> Result<(), DriverError>;

    fn create_buffer(
        &self,
        context: NativeContext,
        flags: MemFlags,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<NativeMem, DriverError>;
    fn release_mem(&self, mem: NativeMem) -> Result<(), DriverError>;

    /// # Safety
    /// `dst` must be valid for `size` bytes of writes until the returned
    /// event reaches a terminal status.
    unsafe fn enqueue_read(
        &self,
        queue: NativeQueue,
        mem: NativeMem,
        offset: usize,
        size: usize,
        dst: *mut u8,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError>;

    /// # Safety
    /// `src` must be valid for `size` bytes of reads until the returned
    /// event reaches a terminal status.
    unsafe fn enqueue_write(
        &self,
        queue: NativeQueue,
        mem: NativeMem,
        offset: usize,
        size: usize,
        src: *const u8,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError>;

    fn enqueue_fill(
        &self,
        queue: NativeQueue,
        mem: NativeMem,
        pattern: &[u8],
        offset: usize,
        size: usize,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError>;

    fn enqueue_copy(
        &self,
        queue: NativeQueue,
        src: NativeMem,
        dst: NativeMem,
        region: CopyRegion,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError>;

    fn create_user_event(&self, context: NativeContext) -> Result<NativeEvent, DriverError>;
    /// `status` must be `Complete` or `Error(_)`.
    fn set_user_event_status(
        &self,
        event: NativeEvent,
        status: EventStatus,
    ) -> Result<(), DriverError>;
    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError>;
    /// Run `callback` once the event is terminal. Runs immediately (on the
    /// calling thread or a driver thread) if it already is.
    fn on_completion(
        &self,
        event: NativeEvent,
        callback: CompletionCallback,
    ) -> Result<(), DriverError>;
    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError>;

    fn create_program_with_source(
        &self,
        context: NativeContext,
        source: &str,
    ) -> Result<NativeProgram, DriverError>;
    fn create_program_with_binary(
        &self,
        context: NativeContext,
        device: NativeDevice,
        binary: &[u8],
    ) -> Result<NativeProgram, DriverError>;
    fn build_program(
        &self,
        program: NativeProgram,
        device: NativeDevice,
        options: &str,
    ) -> Result<(), DriverError>;
    fn program_build_log(
        &self,
        program: NativeProgram,
        device: NativeDevice,
    ) -> Result<String, DriverError>;
    /// Empty until the program has been built.
    fn program_binary(&self, program: NativeProgram) -> Result<Vec<u8>, DriverError>;
    fn release_program(&self, program: NativeProgram) -> Result<(), DriverError>;

    fn create_kernel(&self, program: NativeProgram, name: &str) -> Result<NativeKernel, DriverError>;
    fn release_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError>;
}

/// Parse "OpenCL <major>.<minor> ..." version strings.
pub fn parse_cl_version(version: &str) -> Option<(u32, u32)> {
    let rest = version.strip_prefix("OpenCL ")?;
    let number = rest.split_whitespace().next()?;
    let (major, minor) = number.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}
