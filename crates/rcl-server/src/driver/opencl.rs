//! Dynamic loading of the system OpenCL ICD loader.
//!
//! Uses `libloading` to load `OpenCL.dll` (Windows), `libOpenCL.so.1`
//! (Linux) or the OpenCL framework (macOS) and implements [`Driver`] on top
//! of the raw OpenCL 1.2 entry points.

use std::ffi::{c_char, c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use libloading::{Library, Symbol};
use tracing::{debug, info, warn};

use rcl_protocol::cl_commands::{CopyRegion, MemFlags};
use rcl_protocol::device_info::DeviceType;

use super::{
    check, parse_cl_version, CompletionCallback, DeviceDescriptor, Driver, DriverError,
    EventStatus, NativeContext, NativeDevice, NativeEvent, NativeKernel, NativeMem,
    NativeProgram, NativeQueue, QueueProperties, CL_INVALID_OPERATION, CL_INVALID_VALUE,
    CL_PLATFORM_NOT_FOUND_KHR,
};

pub type ClInt = i32;
pub type ClUint = u32;
pub type ClBitfield = u64;

pub type ClPlatformId = *mut c_void;
pub type ClDeviceId = *mut c_void;
pub type ClContext = *mut c_void;
pub type ClCommandQueue = *mut c_void;
pub type ClMem = *mut c_void;
pub type ClEvent = *mut c_void;
pub type ClProgram = *mut c_void;
pub type ClKernel = *mut c_void;

const CL_TRUE: ClUint = 1;
const CL_FALSE: ClUint = 0;
const CL_COMPLETE: ClInt = 0;

const CL_DEVICE_TYPE_CPU: ClBitfield = 1 << 1;
const CL_DEVICE_TYPE_GPU: ClBitfield = 1 << 2;
const CL_DEVICE_TYPE_ACCELERATOR: ClBitfield = 1 << 3;
const CL_DEVICE_TYPE_ALL: ClBitfield = 0xFFFF_FFFF;

const CL_DEVICE_TYPE: ClUint = 0x1000;
const CL_DEVICE_GLOBAL_MEM_SIZE: ClUint = 0x101F;
const CL_DEVICE_QUEUE_PROPERTIES: ClUint = 0x102A;
const CL_DEVICE_NAME: ClUint = 0x102B;
const CL_DEVICE_VENDOR: ClUint = 0x102C;
const CL_DEVICE_VERSION: ClUint = 0x102F;

const CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE: ClBitfield = 1 << 0;
const CL_QUEUE_PROFILING_ENABLE: ClBitfield = 1 << 1;

const CL_EVENT_COMMAND_EXECUTION_STATUS: ClUint = 0x11D3;

const CL_PROGRAM_NUM_DEVICES: ClUint = 0x1162;
const CL_PROGRAM_BINARY_SIZES: ClUint = 0x1165;
const CL_PROGRAM_BINARIES: ClUint = 0x1166;
const CL_PROGRAM_BUILD_LOG: ClUint = 0x1183;

type FnGetPlatformIds =
    unsafe extern "C" fn(num_entries: ClUint, platforms: *mut ClPlatformId, num_platforms: *mut ClUint) -> ClInt;
type FnGetDeviceIds = unsafe extern "C" fn(
    platform: ClPlatformId,
    device_type: ClBitfield,
    num_entries: ClUint,
    devices: *mut ClDeviceId,
    num_devices: *mut ClUint,
) -> ClInt;
type FnGetDeviceInfo = unsafe extern "C" fn(
    device: ClDeviceId,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;

type ContextNotify = unsafe extern "C" fn(*const c_char, *const c_void, usize, *mut c_void);
type FnCreateContext = unsafe extern "C" fn(
    properties: *const isize,
    num_devices: ClUint,
    devices: *const ClDeviceId,
    notify: Option<ContextNotify>,
    user_data: *mut c_void,
    errcode: *mut ClInt,
) -> ClContext;
type FnReleaseContext = unsafe extern "C" fn(context: ClContext) -> ClInt;

type FnCreateCommandQueue = unsafe extern "C" fn(
    context: ClContext,
    device: ClDeviceId,
    properties: ClBitfield,
    errcode: *mut ClInt,
) -> ClCommandQueue;
type FnQueueOp = unsafe extern "C" fn(queue: ClCommandQueue) -> ClInt;

type FnCreateBuffer = unsafe extern "C" fn(
    context: ClContext,
    flags: ClBitfield,
    size: usize,
    host_ptr: *mut c_void,
    errcode: *mut ClInt,
) -> ClMem;
type FnReleaseMemObject = unsafe extern "C" fn(mem: ClMem) -> ClInt;

type FnEnqueueReadBuffer = unsafe extern "C" fn(
    queue: ClCommandQueue,
    mem: ClMem,
    blocking: ClUint,
    offset: usize,
    size: usize,
    ptr: *mut c_void,
    num_events: ClUint,
    wait_list: *const ClEvent,
    event: *mut ClEvent,
) -> ClInt;
type FnEnqueueWriteBuffer = unsafe extern "C" fn(
    queue: ClCommandQueue,
    mem: ClMem,
    blocking: ClUint,
    offset: usize,
    size: usize,
    ptr: *const c_void,
    num_events: ClUint,
    wait_list: *const ClEvent,
    event: *mut ClEvent,
) -> ClInt;
type FnEnqueueFillBuffer = unsafe extern "C" fn(
    queue: ClCommandQueue,
    mem: ClMem,
    pattern: *const c_void,
    pattern_size: usize,
    offset: usize,
    size: usize,
    num_events: ClUint,
    wait_list: *const ClEvent,
    event: *mut ClEvent,
) -> ClInt;
type FnEnqueueCopyBuffer = unsafe extern "C" fn(
    queue: ClCommandQueue,
    src: ClMem,
    dst: ClMem,
    src_offset: usize,
    dst_offset: usize,
    size: usize,
    num_events: ClUint,
    wait_list: *const ClEvent,
    event: *mut ClEvent,
) -> ClInt;

type FnCreateUserEvent = unsafe extern "C" fn(context: ClContext, errcode: *mut ClInt) -> ClEvent;
type FnSetUserEventStatus = unsafe extern "C" fn(event: ClEvent, status: ClInt) -> ClInt;
type FnGetEventInfo = unsafe extern "C" fn(
    event: ClEvent,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;
type EventNotify = unsafe extern "C" fn(event: ClEvent, status: ClInt, user_data: *mut c_void);
type FnSetEventCallback = unsafe extern "C" fn(
    event: ClEvent,
    command_type: ClInt,
    notify: EventNotify,
    user_data: *mut c_void,
) -> ClInt;
type FnReleaseEvent = unsafe extern "C" fn(event: ClEvent) -> ClInt;

type FnCreateProgramWithSource = unsafe extern "C" fn(
    context: ClContext,
    count: ClUint,
    strings: *const *const c_char,
    lengths: *const usize,
    errcode: *mut ClInt,
) -> ClProgram;
type FnCreateProgramWithBinary = unsafe extern "C" fn(
    context: ClContext,
    num_devices: ClUint,
    devices: *const ClDeviceId,
    lengths: *const usize,
    binaries: *const *const u8,
    binary_status: *mut ClInt,
    errcode: *mut ClInt,
) -> ClProgram;
type BuildNotify = unsafe extern "C" fn(program: ClProgram, user_data: *mut c_void);
type FnBuildProgram = unsafe extern "C" fn(
    program: ClProgram,
    num_devices: ClUint,
    devices: *const ClDeviceId,
    options: *const c_char,
    notify: Option<BuildNotify>,
    user_data: *mut c_void,
) -> ClInt;
type FnGetProgramBuildInfo = unsafe extern "C" fn(
    program: ClProgram,
    device: ClDeviceId,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;
type FnGetProgramInfo = unsafe extern "C" fn(
    program: ClProgram,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;
type FnReleaseProgram = unsafe extern "C" fn(program: ClProgram) -> ClInt;
type FnCreateKernel =
    unsafe extern "C" fn(program: ClProgram, name: *const c_char, errcode: *mut ClInt) -> ClKernel;
type FnReleaseKernel = unsafe extern "C" fn(kernel: ClKernel) -> ClInt;

/// Loaded OpenCL runtime.
pub struct OpenClDriver {
    _lib: Library,

    cl_get_platform_ids: FnGetPlatformIds,
    cl_get_device_ids: FnGetDeviceIds,
    cl_get_device_info: FnGetDeviceInfo,
    cl_create_context: FnCreateContext,
    cl_release_context: FnReleaseContext,
    cl_create_command_queue: FnCreateCommandQueue,
    cl_flush: FnQueueOp,
    cl_finish: FnQueueOp,
    cl_release_command_queue: FnQueueOp,
    cl_create_buffer: FnCreateBuffer,
    cl_release_mem_object: FnReleaseMemObject,
    cl_enqueue_read_buffer: FnEnqueueReadBuffer,
    cl_enqueue_write_buffer: FnEnqueueWriteBuffer,
    /// OpenCL 1.2+
    cl_enqueue_fill_buffer: Option<FnEnqueueFillBuffer>,
    cl_enqueue_copy_buffer: FnEnqueueCopyBuffer,
    cl_create_user_event: FnCreateUserEvent,
    cl_set_user_event_status: FnSetUserEventStatus,
    cl_get_event_info: FnGetEventInfo,
    cl_set_event_callback: FnSetEventCallback,
    cl_release_event: FnReleaseEvent,
    cl_create_program_with_source: FnCreateProgramWithSource,
    cl_create_program_with_binary: FnCreateProgramWithBinary,
    cl_build_program: FnBuildProgram,
    cl_get_program_build_info: FnGetProgramBuildInfo,
    cl_get_program_info: FnGetProgramInfo,
    cl_release_program: FnReleaseProgram,
    cl_create_kernel: FnCreateKernel,
    cl_release_kernel: FnReleaseKernel,
}

// Function pointers into a loaded library; the ICD loader is thread-safe.
unsafe impl Send for OpenClDriver {}
unsafe impl Sync for OpenClDriver {}

fn to_ptr(handle: u64) -> *mut c_void {
    handle as usize as *mut c_void
}

fn from_ptr(ptr: *mut c_void) -> u64 {
    ptr as usize as u64
}

fn wait_list(deps: &[NativeEvent]) -> Vec<ClEvent> {
    deps.iter().map(|e| to_ptr(e.0)).collect()
}

fn wait_list_ptr(list: &[ClEvent]) -> *const ClEvent {
    if list.is_empty() {
        ptr::null()
    } else {
        list.as_ptr()
    }
}

unsafe extern "C" fn completion_trampoline(_event: ClEvent, status: ClInt, user_data: *mut c_void) {
    // SAFETY: user_data was produced by Box::into_raw in on_completion and is consumed once.
    let callback = unsafe { Box::from_raw(user_data as *mut CompletionCallback) };
    let status = EventStatus::from_raw(status);
    if catch_unwind(AssertUnwindSafe(move || callback(status))).is_err() {
        warn!("completion callback panicked");
    }
}

impl OpenClDriver {
    /// Load the OpenCL library and resolve all function pointers.
    pub fn load() -> Result<Arc<Self>, String> {
        let lib = Self::load_library()?;

        unsafe {
            let driver = Self {
                cl_get_platform_ids: Self::load_fn(&lib, "clGetPlatformIDs")?,
                cl_get_device_ids: Self::load_fn(&lib, "clGetDeviceIDs")?,
                cl_get_device_info: Self::load_fn(&lib, "clGetDeviceInfo")?,
                cl_create_context: Self::load_fn(&lib, "clCreateContext")?,
                cl_release_context: Self::load_fn(&lib, "clReleaseContext")?,
                cl_create_command_queue: Self::load_fn(&lib, "clCreateCommandQueue")?,
                cl_flush: Self::load_fn(&lib, "clFlush")?,
                cl_finish: Self::load_fn(&lib, "clFinish")?,
                cl_release_command_queue: Self::load_fn(&lib, "clReleaseCommandQueue")?,
                cl_create_buffer: Self::load_fn(&lib, "clCreateBuffer")?,
                cl_release_mem_object: Self::load_fn(&lib, "clReleaseMemObject")?,
                cl_enqueue_read_buffer: Self::load_fn(&lib, "clEnqueueReadBuffer")?,
                cl_enqueue_write_buffer: Self::load_fn(&lib, "clEnqueueWriteBuffer")?,
                cl_enqueue_fill_buffer: Self::load_fn_opt(&lib, "clEnqueueFillBuffer"),
                cl_enqueue_copy_buffer: Self::load_fn(&lib, "clEnqueueCopyBuffer")?,
                cl_create_user_event: Self::load_fn(&lib, "clCreateUserEvent")?,
                cl_set_user_event_status: Self::load_fn(&lib, "clSetUserEventStatus")?,
                cl_get_event_info: Self::load_fn(&lib, "clGetEventInfo")?,
                cl_set_event_callback: Self::load_fn(&lib, "clSetEventCallback")?,
                cl_release_event: Self::load_fn(&lib, "clReleaseEvent")?,
                cl_create_program_with_source: Self::load_fn(&lib, "clCreateProgramWithSource")?,
                cl_create_program_with_binary: Self::load_fn(&lib, "clCreateProgramWithBinary")?,
                cl_build_program: Self::load_fn(&lib, "clBuildProgram")?,
                cl_get_program_build_info: Self::load_fn(&lib, "clGetProgramBuildInfo")?,
                cl_get_program_info: Self::load_fn(&lib, "clGetProgramInfo")?,
                cl_release_program: Self::load_fn(&lib, "clReleaseProgram")?,
                cl_create_kernel: Self::load_fn(&lib, "clCreateKernel")?,
                cl_release_kernel: Self::load_fn(&lib, "clReleaseKernel")?,
                _lib: lib,
            };

            if driver.cl_enqueue_fill_buffer.is_none() {
                info!("clEnqueueFillBuffer not exported, patterned fill disabled");
            }

            Ok(Arc::new(driver))
        }
    }

    fn load_library() -> Result<Library, String> {
        #[cfg(target_os = "windows")]
        let lib_names = &["OpenCL.dll"];

        #[cfg(target_os = "linux")]
        let lib_names = &["libOpenCL.so.1", "libOpenCL.so"];

        #[cfg(target_os = "macos")]
        let lib_names = &["/System/Library/Frameworks/OpenCL.framework/OpenCL"];

        let mut last_err = String::new();
        for name in lib_names {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded OpenCL runtime from: {}", name);
                    return Ok(lib);
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }

        Err(format!("failed to load OpenCL library: {}", last_err))
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, String> {
        let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }
            .map_err(|e| format!("failed to load {}: {}", name, e))?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        unsafe { lib.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
    }

    // ── Info queries ──────────────────────────────────────────────

    fn device_info_bytes(&self, device: ClDeviceId, param: ClUint) -> Result<Vec<u8>, DriverError> {
        let mut size = 0usize;
        check("clGetDeviceInfo", unsafe {
            (self.cl_get_device_info)(device, param, 0, ptr::null_mut(), &mut size)
        })?;
        let mut value = vec![0u8; size];
        check("clGetDeviceInfo", unsafe {
            (self.cl_get_device_info)(device, param, size, value.as_mut_ptr() as *mut c_void, ptr::null_mut())
        })?;
        Ok(value)
    }

    fn device_info_string(&self, device: ClDeviceId, param: ClUint) -> Result<String, DriverError> {
        let bytes = self.device_info_bytes(device, param)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).trim().to_string())
    }

    fn device_info_u64(&self, device: ClDeviceId, param: ClUint) -> Result<u64, DriverError> {
        let mut value = 0u64;
        check("clGetDeviceInfo", unsafe {
            (self.cl_get_device_info)(
                device,
                param,
                std::mem::size_of::<u64>(),
                &mut value as *mut u64 as *mut c_void,
                ptr::null_mut(),
            )
        })?;
        Ok(value)
    }

    fn describe(&self, device: ClDeviceId) -> Result<DeviceDescriptor, DriverError> {
        let version = self.device_info_string(device, CL_DEVICE_VERSION)?;
        let device_type = match self.device_info_u64(device, CL_DEVICE_TYPE)? {
            t if t & CL_DEVICE_TYPE_GPU != 0 => DeviceType::Gpu,
            t if t & CL_DEVICE_TYPE_CPU != 0 => DeviceType::Cpu,
            t if t & CL_DEVICE_TYPE_ACCELERATOR != 0 => DeviceType::Accelerator,
            _ => DeviceType::Other,
        };
        let queue_props = self.device_info_u64(device, CL_DEVICE_QUEUE_PROPERTIES)?;
        let supports_fill = self.cl_enqueue_fill_buffer.is_some()
            && parse_cl_version(&version).is_some_and(|v| v >= (1, 2));

        Ok(DeviceDescriptor {
            native: NativeDevice(from_ptr(device)),
            name: self.device_info_string(device, CL_DEVICE_NAME)?,
            vendor: self.device_info_string(device, CL_DEVICE_VENDOR)?,
            version,
            device_type,
            global_mem_size: self.device_info_u64(device, CL_DEVICE_GLOBAL_MEM_SIZE)?,
            queue_caps: QueueProperties {
                out_of_order: queue_props & CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE != 0,
                profiling: queue_props & CL_QUEUE_PROFILING_ENABLE != 0,
            },
            supports_fill,
        })
    }

    fn program_info_bytes(&self, program: ClProgram, param: ClUint) -> Result<Vec<u8>, DriverError> {
        let mut size = 0usize;
        check("clGetProgramInfo", unsafe {
            (self.cl_get_program_info)(program, param, 0, ptr::null_mut(), &mut size)
        })?;
        let mut value = vec![0u8; size];
        check("clGetProgramInfo", unsafe {
            (self.cl_get_program_info)(program, param, size, value.as_mut_ptr() as *mut c_void, ptr::null_mut())
        })?;
        Ok(value)
    }
}

impl Driver for OpenClDriver {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, DriverError> {
        let mut num_platforms: ClUint = 0;
        let res = unsafe { (self.cl_get_platform_ids)(0, ptr::null_mut(), &mut num_platforms) };
        if res == CL_PLATFORM_NOT_FOUND_KHR || num_platforms == 0 {
            return Ok(Vec::new());
        }
        check("clGetPlatformIDs", res)?;

        let mut platforms = vec![ptr::null_mut(); num_platforms as usize];
        check("clGetPlatformIDs", unsafe {
            (self.cl_get_platform_ids)(num_platforms, platforms.as_mut_ptr(), ptr::null_mut())
        })?;

        let mut descriptors = Vec::new();
        for platform in platforms {
            let mut num_devices: ClUint = 0;
            let res = unsafe {
                (self.cl_get_device_ids)(platform, CL_DEVICE_TYPE_ALL, 0, ptr::null_mut(), &mut num_devices)
            };
            if res != 0 || num_devices == 0 {
                debug!("platform {:p} reports no devices ({})", platform, res);
                continue;
            }
            let mut devices = vec![ptr::null_mut(); num_devices as usize];
            check("clGetDeviceIDs", unsafe {
                (self.cl_get_device_ids)(
                    platform,
                    CL_DEVICE_TYPE_ALL,
                    num_devices,
                    devices.as_mut_ptr(),
                    ptr::null_mut(),
                )
            })?;
            for device in devices {
                match self.describe(device) {
                    Ok(descriptor) => descriptors.push(descriptor),
                    Err(e) => warn!("skipping device {:p}: {}", device, e),
                }
            }
        }
        Ok(descriptors)
    }

    fn create_context(&self, device: NativeDevice) -> Result<NativeContext, DriverError> {
        let devices = [to_ptr(device.0)];
        let mut err: ClInt = 0;
        let context = unsafe {
            (self.cl_create_context)(ptr::null(), 1, devices.as_ptr(), None, ptr::null_mut(), &mut err)
        };
        check("clCreateContext", err)?;
        Ok(NativeContext(from_ptr(context)))
    }

    fn release_context(&self, context: NativeContext) -> Result<(), DriverError> {
        check("clReleaseContext", unsafe { (self.cl_release_context)(to_ptr(context.0)) })
    }

    fn create_queue(
        &self,
        context: NativeContext,
        device: NativeDevice,
        properties: QueueProperties,
    ) -> Result<NativeQueue, DriverError> {
        let mut bits: ClBitfield = 0;
        if properties.out_of_order {
            bits |= CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE;
        }
        if properties.profiling {
            bits |= CL_QUEUE_PROFILING_ENABLE;
        }
        let mut err: ClInt = 0;
        let queue = unsafe {
            (self.cl_create_command_queue)(to_ptr(context.0), to_ptr(device.0), bits, &mut err)
        };
        check("clCreateCommandQueue", err)?;
        Ok(NativeQueue(from_ptr(queue)))
    }

    fn flush(&self, queue: NativeQueue) -> Result<(), DriverError> {
        check("clFlush", unsafe { (self.cl_flush)(to_ptr(queue.0)) })
    }

    fn finish(&self, queue: NativeQueue) -> Result<(), DriverError> {
        check("clFinish", unsafe { (self.cl_finish)(to_ptr(queue.0)) })
    }

    fn release_queue(&self, queue: NativeQueue) -> Result<(), DriverError> {
        check("clReleaseCommandQueue", unsafe {
            (self.cl_release_command_queue)(to_ptr(queue.0))
        })
    }

    fn create_buffer(
        &self,
        context: NativeContext,
        flags: MemFlags,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<NativeMem, DriverError> {
        let host_ptr = match host_data {
            Some(bytes) if bytes.len() < size => {
                return Err(DriverError::new("clCreateBuffer", CL_INVALID_VALUE))
            }
            // COPY_HOST_PTR only reads the pointer during the call.
            Some(bytes) => bytes.as_ptr() as *mut c_void,
            None => ptr::null_mut(),
        };
        let mut err: ClInt = 0;
        let mem = unsafe {
            (self.cl_create_buffer)(to_ptr(context.0), flags.bits(), size, host_ptr, &mut err)
        };
        check("clCreateBuffer", err)?;
        Ok(NativeMem(from_ptr(mem)))
    }

    fn release_mem(&self, mem: NativeMem) -> Result<(), DriverError> {
        check("clReleaseMemObject", unsafe { (self.cl_release_mem_object)(to_ptr(mem.0)) })
    }

    unsafe fn enqueue_read(
        &self,
        queue: NativeQueue,
        mem: NativeMem,
        offset: usize,
        size: usize,
        dst: *mut u8,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        let list = wait_list(deps);
        let mut event: ClEvent = ptr::null_mut();
        check("clEnqueueReadBuffer", unsafe {
            (self.cl_enqueue_read_buffer)(
                to_ptr(queue.0),
                to_ptr(mem.0),
                CL_FALSE,
                offset,
                size,
                dst as *mut c_void,
                list.len() as ClUint,
                wait_list_ptr(&list),
                &mut event,
            )
        })?;
        Ok(NativeEvent(from_ptr(event)))
    }

    unsafe fn enqueue_write(
        &self,
        queue: NativeQueue,
        mem: NativeMem,
        offset: usize,
        size: usize,
        src: *const u8,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        let list = wait_list(deps);
        let mut event: ClEvent = ptr::null_mut();
        check("clEnqueueWriteBuffer", unsafe {
            (self.cl_enqueue_write_buffer)(
                to_ptr(queue.0),
                to_ptr(mem.0),
                CL_FALSE,
                offset,
                size,
                src as *const c_void,
                list.len() as ClUint,
                wait_list_ptr(&list),
                &mut event,
            )
        })?;
        Ok(NativeEvent(from_ptr(event)))
    }

    fn enqueue_fill(
        &self,
        queue: NativeQueue,
        mem: NativeMem,
        pattern: &[u8],
        offset: usize,
        size: usize,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        let fill = self
            .cl_enqueue_fill_buffer
            .ok_or(DriverError::new("clEnqueueFillBuffer", CL_INVALID_OPERATION))?;
        let list = wait_list(deps);
        let mut event: ClEvent = ptr::null_mut();
        // The pattern is copied by the runtime before the call returns.
        check("clEnqueueFillBuffer", unsafe {
            fill(
                to_ptr(queue.0),
                to_ptr(mem.0),
                pattern.as_ptr() as *const c_void,
                pattern.len(),
                offset,
                size,
                list.len() as ClUint,
                wait_list_ptr(&list),
                &mut event,
            )
        })?;
        Ok(NativeEvent(from_ptr(event)))
    }

    fn enqueue_copy(
        &self,
        queue: NativeQueue,
        src: NativeMem,
        dst: NativeMem,
        region: CopyRegion,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        let list = wait_list(deps);
        let mut event: ClEvent = ptr::null_mut();
        check("clEnqueueCopyBuffer", unsafe {
            (self.cl_enqueue_copy_buffer)(
                to_ptr(queue.0),
                to_ptr(src.0),
                to_ptr(dst.0),
                region.src_offset as usize,
                region.dst_offset as usize,
                region.size as usize,
                list.len() as ClUint,
                wait_list_ptr(&list),
                &mut event,
            )
        })?;
        Ok(NativeEvent(from_ptr(event)))
    }

    fn create_user_event(&self, context: NativeContext) -> Result<NativeEvent, DriverError> {
        let mut err: ClInt = 0;
        let event = unsafe { (self.cl_create_user_event)(to_ptr(context.0), &mut err) };
        check("clCreateUserEvent", err)?;
        Ok(NativeEvent(from_ptr(event)))
    }

    fn set_user_event_status(
        &self,
        event: NativeEvent,
        status: EventStatus,
    ) -> Result<(), DriverError> {
        if !status.is_terminal() {
            return Err(DriverError::new("clSetUserEventStatus", CL_INVALID_VALUE));
        }
        check("clSetUserEventStatus", unsafe {
            (self.cl_set_user_event_status)(to_ptr(event.0), status.as_raw())
        })
    }

    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError> {
        let mut raw: ClInt = 0;
        check("clGetEventInfo", unsafe {
            (self.cl_get_event_info)(
                to_ptr(event.0),
                CL_EVENT_COMMAND_EXECUTION_STATUS,
                std::mem::size_of::<ClInt>(),
                &mut raw as *mut ClInt as *mut c_void,
                ptr::null_mut(),
            )
        })?;
        Ok(EventStatus::from_raw(raw))
    }

    fn on_completion(
        &self,
        event: NativeEvent,
        callback: CompletionCallback,
    ) -> Result<(), DriverError> {
        let user_data = Box::into_raw(Box::new(callback)) as *mut c_void;
        let res = unsafe {
            (self.cl_set_event_callback)(to_ptr(event.0), CL_COMPLETE, completion_trampoline, user_data)
        };
        if res != 0 {
            // Not registered, so the trampoline will never reclaim it.
            drop(unsafe { Box::from_raw(user_data as *mut CompletionCallback) });
        }
        check("clSetEventCallback", res)
    }

    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError> {
        check("clReleaseEvent", unsafe { (self.cl_release_event)(to_ptr(event.0)) })
    }

    fn create_program_with_source(
        &self,
        context: NativeContext,
        source: &str,
    ) -> Result<NativeProgram, DriverError> {
        let strings = [source.as_ptr() as *const c_char];
        let lengths = [source.len()];
        let mut err: ClInt = 0;
        let program = unsafe {
            (self.cl_create_program_with_source)(
                to_ptr(context.0),
                1,
                strings.as_ptr(),
                lengths.as_ptr(),
                &mut err,
            )
        };
        check("clCreateProgramWithSource", err)?;
        Ok(NativeProgram(from_ptr(program)))
    }

    fn create_program_with_binary(
        &self,
        context: NativeContext,
        device: NativeDevice,
        binary: &[u8],
    ) -> Result<NativeProgram, DriverError> {
        let devices = [to_ptr(device.0)];
        let lengths = [binary.len()];
        let binaries = [binary.as_ptr()];
        let mut binary_status: ClInt = 0;
        let mut err: ClInt = 0;
        let program = unsafe {
            (self.cl_create_program_with_binary)(
                to_ptr(context.0),
                1,
                devices.as_ptr(),
                lengths.as_ptr(),
                binaries.as_ptr(),
                &mut binary_status,
                &mut err,
            )
        };
        check("clCreateProgramWithBinary", err)?;
        if binary_status != 0 {
            let _ = unsafe { (self.cl_release_program)(program) };
            return Err(DriverError::new("clCreateProgramWithBinary", binary_status));
        }
        Ok(NativeProgram(from_ptr(program)))
    }

    fn build_program(
        &self,
        program: NativeProgram,
        device: NativeDevice,
        options: &str,
    ) -> Result<(), DriverError> {
        let options = CString::new(options)
            .map_err(|_| DriverError::new("clBuildProgram", CL_INVALID_VALUE))?;
        let devices = [to_ptr(device.0)];
        check("clBuildProgram", unsafe {
            (self.cl_build_program)(
                to_ptr(program.0),
                1,
                devices.as_ptr(),
                options.as_ptr(),
                None,
                ptr::null_mut(),
            )
        })
    }

    fn program_build_log(
        &self,
        program: NativeProgram,
        device: NativeDevice,
    ) -> Result<String, DriverError> {
        let (program, device) = (to_ptr(program.0), to_ptr(device.0));
        let mut size = 0usize;
        check("clGetProgramBuildInfo", unsafe {
            (self.cl_get_program_build_info)(program, device, CL_PROGRAM_BUILD_LOG, 0, ptr::null_mut(), &mut size)
        })?;
        let mut log = vec![0u8; size];
        check("clGetProgramBuildInfo", unsafe {
            (self.cl_get_program_build_info)(
                program,
                device,
                CL_PROGRAM_BUILD_LOG,
                size,
                log.as_mut_ptr() as *mut c_void,
                ptr::null_mut(),
            )
        })?;
        let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
        Ok(String::from_utf8_lossy(&log[..end]).into_owned())
    }

    fn program_binary(&self, program: NativeProgram) -> Result<Vec<u8>, DriverError> {
        let program = to_ptr(program.0);

        let num_devices = self.program_info_bytes(program, CL_PROGRAM_NUM_DEVICES)?;
        let num_devices = match num_devices.get(..4) {
            Some(b) => u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as usize,
            None => 0,
        };
        if num_devices == 0 {
            return Ok(Vec::new());
        }

        let mut sizes = vec![0usize; num_devices];
        check("clGetProgramInfo", unsafe {
            (self.cl_get_program_info)(
                program,
                CL_PROGRAM_BINARY_SIZES,
                sizes.len() * std::mem::size_of::<usize>(),
                sizes.as_mut_ptr() as *mut c_void,
                ptr::null_mut(),
            )
        })?;

        let mut binaries: Vec<Vec<u8>> = sizes.iter().map(|&s| vec![0u8; s]).collect();
        let mut pointers: Vec<*mut u8> = binaries.iter_mut().map(|b| b.as_mut_ptr()).collect();
        check("clGetProgramInfo", unsafe {
            (self.cl_get_program_info)(
                program,
                CL_PROGRAM_BINARIES,
                pointers.len() * std::mem::size_of::<*mut u8>(),
                pointers.as_mut_ptr() as *mut c_void,
                ptr::null_mut(),
            )
        })?;

        // Programs are always created for a single device.
        Ok(binaries.swap_remove(0))
    }

    fn release_program(&self, program: NativeProgram) -> Result<(), DriverError> {
        check("clReleaseProgram", unsafe { (self.cl_release_program)(to_ptr(program.0)) })
    }

    fn create_kernel(&self, program: NativeProgram, name: &str) -> Result<NativeKernel, DriverError> {
        let name =
            CString::new(name).map_err(|_| DriverError::new("clCreateKernel", CL_INVALID_VALUE))?;
        let mut err: ClInt = 0;
        let kernel = unsafe { (self.cl_create_kernel)(to_ptr(program.0), name.as_ptr(), &mut err) };
        check("clCreateKernel", err)?;
        Ok(NativeKernel(from_ptr(kernel)))
    }

    fn release_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError> {
        check("clReleaseKernel", unsafe { (self.cl_release_kernel)(to_ptr(kernel.0)) })
    }
}
