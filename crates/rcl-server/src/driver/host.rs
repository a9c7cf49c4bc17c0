//! In-process emulation of an OpenCL device.
//!
//! Each queue owns a small pool of worker threads fed through a
//! `crossbeam-channel`. A command is handed to the pool once every event in
//! its wait list has reached a terminal status; a failed dependency fails the
//! command with `CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST`. In-order
//! queues chain each command onto the previous one.

use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use rcl_protocol::cl_commands::{CopyRegion, MemFlags};
use rcl_protocol::device_info::DeviceType;

use super::{
    CompletionCallback, DeviceDescriptor, Driver, DriverError, EventStatus, NativeContext,
    NativeDevice, NativeEvent, NativeKernel, NativeMem, NativeProgram, NativeQueue,
    QueueProperties, CL_BUILD_PROGRAM_FAILURE, CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
    CL_INVALID_BINARY, CL_INVALID_BUFFER_SIZE, CL_INVALID_COMMAND_QUEUE, CL_INVALID_CONTEXT,
    CL_INVALID_DEVICE, CL_INVALID_EVENT, CL_INVALID_EVENT_WAIT_LIST, CL_INVALID_HOST_PTR,
    CL_INVALID_KERNEL, CL_INVALID_KERNEL_NAME, CL_INVALID_MEM_OBJECT, CL_INVALID_OPERATION,
    CL_INVALID_PROGRAM, CL_INVALID_PROGRAM_EXECUTABLE, CL_INVALID_VALUE, CL_MEM_COPY_OVERLAP,
    CL_OUT_OF_HOST_MEMORY,
};

/// Prefix of binaries produced by the host "compiler".
pub const HOST_BINARY_MAGIC: &[u8] = b"RCLHOSTBIN\0";

const WORKERS_PER_QUEUE: usize = 2;

/// Shape of one emulated device.
#[derive(Debug, Clone)]
pub struct HostDeviceSpec {
    pub name: String,
    pub global_mem_size: u64,
    pub supports_fill: bool,
    pub out_of_order: bool,
}

impl Default for HostDeviceSpec {
    fn default() -> Self {
        Self {
            name: "RCL Host Device".to_string(),
            global_mem_size: 1 << 30,
            supports_fill: true,
            out_of_order: true,
        }
    }
}

impl HostDeviceSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

struct EventState {
    status: EventStatus,
    callbacks: Vec<CompletionCallback>,
}

struct HostEvent {
    context: u64,
    user: bool,
    state: Mutex<EventState>,
}

impl HostEvent {
    fn new(context: u64, user: bool, status: EventStatus) -> Arc<Self> {
        Arc::new(Self {
            context,
            user,
            state: Mutex::new(EventState {
                status,
                callbacks: Vec::new(),
            }),
        })
    }

    fn status(&self) -> EventStatus {
        self.state.lock().status
    }

    fn set_running(&self) {
        let mut state = self.state.lock();
        if !state.status.is_terminal() {
            state.status = EventStatus::Running;
        }
    }

    /// Move to a terminal status and run the registered callbacks outside the lock.
    fn complete(&self, status: EventStatus) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(status);
        }
        true
    }

    fn on_complete(&self, callback: CompletionCallback) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            let status = state.status;
            drop(state);
            callback(status);
        } else {
            state.callbacks.push(callback);
        }
    }
}

struct HostMem {
    context: u64,
    data: Mutex<Vec<u8>>,
}

impl HostMem {
    fn check_range(&self, call: &'static str, offset: usize, size: usize) -> Result<(), DriverError> {
        let len = self.data.lock().len();
        match offset.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(DriverError::new(call, CL_INVALID_VALUE)),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct HostQueue {
    context: u64,
    device_index: usize,
    out_of_order: bool,
    sender: Mutex<Option<Sender<Job>>>,
    /// Most recent command, for in-order chaining.
    last: Mutex<Option<Arc<HostEvent>>>,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl HostQueue {
    fn retire(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

/// Releases a queued command once every dependency has arrived.
struct Gate {
    remaining: AtomicUsize,
    failed: Arc<AtomicI32>,
    job: Mutex<Option<Job>>,
    sender: Sender<Job>,
}

impl Gate {
    fn arrive(&self, failure: Option<i32>) {
        if let Some(code) = failure {
            let _ = self
                .failed
                .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(job) = self.job.lock().take() {
                // Workers are gone only after the queue was released; run inline then.
                if let Err(unsent) = self.sender.send(job) {
                    (unsent.0)();
                }
            }
        }
    }
}

struct SendPtr<T>(*mut T);

// The caller of enqueue_read/enqueue_write guarantees the pointee outlives the command.
unsafe impl<T> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    fn get(&self) -> *mut T {
        self.0
    }
}

struct ProgramState {
    built: bool,
    log: String,
    binary: Vec<u8>,
}

struct HostProgram {
    context: u64,
    source: String,
    state: Mutex<ProgramState>,
}

struct HostKernel {
    _program: u64,
    _name: String,
}

/// Emulated OpenCL runtime backed by host memory and worker threads.
pub struct HostDriver {
    specs: Vec<HostDeviceSpec>,
    next_id: AtomicU64,
    /// context -> device index
    contexts: DashMap<u64, usize>,
    queues: DashMap<u64, Arc<HostQueue>>,
    mems: DashMap<u64, Arc<HostMem>>,
    events: DashMap<u64, Arc<HostEvent>>,
    programs: DashMap<u64, Arc<HostProgram>>,
    kernels: DashMap<u64, HostKernel>,
}

impl HostDriver {
    pub fn new(specs: Vec<HostDeviceSpec>) -> Self {
        Self {
            specs,
            next_id: AtomicU64::new(1),
            contexts: DashMap::new(),
            queues: DashMap::new(),
            mems: DashMap::new(),
            events: DashMap::new(),
            programs: DashMap::new(),
            kernels: DashMap::new(),
        }
    }

    /// `count` identical default devices.
    pub fn with_devices(count: u32) -> Self {
        let specs = (0..count)
            .map(|i| HostDeviceSpec::named(format!("RCL Host Device {}", i)))
            .collect();
        Self::new(specs)
    }

    /// Number of live native memory objects.
    pub fn live_mem_objects(&self) -> usize {
        self.mems.len()
    }

    /// Number of native events not yet released.
    pub fn live_events(&self) -> usize {
        self.events.len()
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn device_index(&self, call: &'static str, device: NativeDevice) -> Result<usize, DriverError> {
        let index = (device.0 as usize).wrapping_sub(1);
        if index < self.specs.len() {
            Ok(index)
        } else {
            Err(DriverError::new(call, CL_INVALID_DEVICE))
        }
    }

    fn queue(&self, call: &'static str, queue: NativeQueue) -> Result<Arc<HostQueue>, DriverError> {
        self.queues
            .get(&queue.0)
            .map(|q| q.clone())
            .ok_or(DriverError::new(call, CL_INVALID_COMMAND_QUEUE))
    }

    fn mem(
        &self,
        call: &'static str,
        mem: NativeMem,
        context: u64,
    ) -> Result<Arc<HostMem>, DriverError> {
        let mem = self
            .mems
            .get(&mem.0)
            .map(|m| m.clone())
            .ok_or(DriverError::new(call, CL_INVALID_MEM_OBJECT))?;
        if mem.context != context {
            return Err(DriverError::new(call, CL_INVALID_CONTEXT));
        }
        Ok(mem)
    }

    fn event(&self, call: &'static str, event: NativeEvent) -> Result<Arc<HostEvent>, DriverError> {
        self.events
            .get(&event.0)
            .map(|e| e.clone())
            .ok_or(DriverError::new(call, CL_INVALID_EVENT))
    }

    fn program(
        &self,
        call: &'static str,
        program: NativeProgram,
    ) -> Result<Arc<HostProgram>, DriverError> {
        self.programs
            .get(&program.0)
            .map(|p| p.clone())
            .ok_or(DriverError::new(call, CL_INVALID_PROGRAM))
    }

    /// Enqueue `work` on `queue`, gated on `deps`.
    fn submit<F>(
        &self,
        call: &'static str,
        queue: &Arc<HostQueue>,
        deps: &[NativeEvent],
        work: F,
    ) -> Result<NativeEvent, DriverError>
    where
        F: FnOnce() -> Result<(), i32> + Send + 'static,
    {
        let sender = queue
            .sender
            .lock()
            .clone()
            .ok_or(DriverError::new(call, CL_INVALID_COMMAND_QUEUE))?;

        // (event, propagate failure)
        let mut waits = Vec::with_capacity(deps.len() + 1);
        for dep in deps {
            let event = self
                .events
                .get(&dep.0)
                .map(|e| e.clone())
                .ok_or(DriverError::new(call, CL_INVALID_EVENT_WAIT_LIST))?;
            if event.context != queue.context {
                return Err(DriverError::new(call, CL_INVALID_CONTEXT));
            }
            waits.push((event, true));
        }

        let event = HostEvent::new(queue.context, false, EventStatus::Queued);
        let id = self.alloc_id();
        self.events.insert(id, event.clone());

        if !queue.out_of_order {
            if let Some(previous) = queue.last.lock().replace(event.clone()) {
                waits.push((previous, false));
            }
        }

        *queue.in_flight.lock() += 1;

        let failed = Arc::new(AtomicI32::new(0));
        let job: Job = {
            let event = event.clone();
            let queue = queue.clone();
            let failed = failed.clone();
            Box::new(move || {
                let status = match failed.load(Ordering::Acquire) {
                    0 => {
                        event.set_running();
                        match work() {
                            Ok(()) => EventStatus::Complete,
                            Err(code) => EventStatus::Error(code),
                        }
                    }
                    _ => EventStatus::Error(CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST),
                };
                event.complete(status);
                queue.retire();
            })
        };

        // One extra arrival for the submitter so the job cannot start mid-registration.
        let gate = Arc::new(Gate {
            remaining: AtomicUsize::new(waits.len() + 1),
            failed,
            job: Mutex::new(Some(job)),
            sender,
        });
        for (dep, propagate) in waits {
            let gate = gate.clone();
            dep.on_complete(Box::new(move |status| {
                let failure = match status {
                    EventStatus::Error(code) if propagate => Some(code),
                    _ => None,
                };
                gate.arrive(failure);
            }));
        }
        gate.arrive(None);

        trace!(event = id, "{} enqueued", call);
        Ok(NativeEvent(id))
    }
}

/// Names of `kernel void name(` / `__kernel void name(` declarations.
fn declared_kernels(source: &str) -> Vec<&str> {
    let tokens: Vec<&str> = source
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|t| !t.is_empty())
        .collect();
    tokens
        .windows(3)
        .filter(|w| (w[0] == "kernel" || w[0] == "__kernel") && w[1] == "void")
        .map(|w| w[2])
        .collect()
}

impl Driver for HostDriver {
    fn name(&self) -> &'static str {
        "host"
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, DriverError> {
        Ok(self
            .specs
            .iter()
            .enumerate()
            .map(|(i, spec)| DeviceDescriptor {
                native: NativeDevice(i as u64 + 1),
                name: spec.name.clone(),
                vendor: "RCL".to_string(),
                version: "OpenCL 1.2 RCL host emulation".to_string(),
                device_type: DeviceType::Cpu,
                global_mem_size: spec.global_mem_size,
                queue_caps: QueueProperties {
                    out_of_order: spec.out_of_order,
                    profiling: true,
                },
                supports_fill: spec.supports_fill,
            })
            .collect())
    }

    fn create_context(&self, device: NativeDevice) -> Result<NativeContext, DriverError> {
        let index = self.device_index("clCreateContext", device)?;
        let id = self.alloc_id();
        self.contexts.insert(id, index);
        Ok(NativeContext(id))
    }

    fn release_context(&self, context: NativeContext) -> Result<(), DriverError> {
        self.contexts
            .remove(&context.0)
            .map(|_| ())
            .ok_or(DriverError::new("clReleaseContext", CL_INVALID_CONTEXT))
    }

    fn create_queue(
        &self,
        context: NativeContext,
        device: NativeDevice,
        properties: QueueProperties,
    ) -> Result<NativeQueue, DriverError> {
        const CALL: &str = "clCreateCommandQueue";
        let device_index = self.device_index(CALL, device)?;
        match self.contexts.get(&context.0) {
            Some(index) if *index == device_index => {}
            Some(_) => return Err(DriverError::new(CALL, CL_INVALID_DEVICE)),
            None => return Err(DriverError::new(CALL, CL_INVALID_CONTEXT)),
        }
        if properties.out_of_order && !self.specs[device_index].out_of_order {
            return Err(DriverError::new(CALL, CL_INVALID_VALUE));
        }

        let id = self.alloc_id();
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        for worker in 0..WORKERS_PER_QUEUE {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("rcl-host-q{}-{}", id, worker))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|_| DriverError::new(CALL, CL_OUT_OF_HOST_MEMORY))?;
        }

        self.queues.insert(
            id,
            Arc::new(HostQueue {
                context: context.0,
                device_index,
                out_of_order: properties.out_of_order,
                sender: Mutex::new(Some(tx)),
                last: Mutex::new(None),
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
            }),
        );
        debug!(queue = id, out_of_order = properties.out_of_order, "host queue created");
        Ok(NativeQueue(id))
    }

    fn flush(&self, queue: NativeQueue) -> Result<(), DriverError> {
        self.queue("clFlush", queue).map(|_| ())
    }

    fn finish(&self, queue: NativeQueue) -> Result<(), DriverError> {
        let queue = self.queue("clFinish", queue)?;
        let mut in_flight = queue.in_flight.lock();
        while *in_flight > 0 {
            queue.idle.wait(&mut in_flight);
        }
        Ok(())
    }

    fn release_queue(&self, queue: NativeQueue) -> Result<(), DriverError> {
        let (_, queue) = self
            .queues
            .remove(&queue.0)
            .ok_or(DriverError::new("clReleaseCommandQueue", CL_INVALID_COMMAND_QUEUE))?;
        // Workers exit once the last pending gate drops its sender.
        queue.sender.lock().take();
        queue.last.lock().take();
        Ok(())
    }

    fn create_buffer(
        &self,
        context: NativeContext,
        flags: MemFlags,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<NativeMem, DriverError> {
        const CALL: &str = "clCreateBuffer";
        let device_index = *self
            .contexts
            .get(&context.0)
            .ok_or(DriverError::new(CALL, CL_INVALID_CONTEXT))?;
        if size == 0 || size as u64 > self.specs[device_index].global_mem_size {
            return Err(DriverError::new(CALL, CL_INVALID_BUFFER_SIZE));
        }

        let wants_host = flags.intersects(MemFlags::COPY_HOST_PTR | MemFlags::USE_HOST_PTR);
        let data = match (wants_host, host_data) {
            (true, Some(bytes)) if bytes.len() >= size => bytes[..size].to_vec(),
            (true, Some(_)) => return Err(DriverError::new(CALL, CL_INVALID_VALUE)),
            (false, None) => vec![0u8; size],
            _ => return Err(DriverError::new(CALL, CL_INVALID_HOST_PTR)),
        };

        let id = self.alloc_id();
        self.mems.insert(
            id,
            Arc::new(HostMem {
                context: context.0,
                data: Mutex::new(data),
            }),
        );
        Ok(NativeMem(id))
    }

    fn release_mem(&self, mem: NativeMem) -> Result<(), DriverError> {
        self.mems
            .remove(&mem.0)
            .map(|_| ())
            .ok_or(DriverError::new("clReleaseMemObject", CL_INVALID_MEM_OBJECT))
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
        const CALL: &str = "clEnqueueReadBuffer";
        let queue = self.queue(CALL, queue)?;
        let mem = self.mem(CALL, mem, queue.context)?;
        mem.check_range(CALL, offset, size)?;
        let dst = SendPtr(dst);
        self.submit(CALL, &queue, deps, move || {
            let data = mem.data.lock();
            // SAFETY: range checked above; the caller keeps dst alive until completion.
            unsafe { std::ptr::copy_nonoverlapping(data[offset..].as_ptr(), dst.get(), size) };
            Ok(())
        })
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
        const CALL: &str = "clEnqueueWriteBuffer";
        let queue = self.queue(CALL, queue)?;
        let mem = self.mem(CALL, mem, queue.context)?;
        mem.check_range(CALL, offset, size)?;
        let src = SendPtr(src as *mut u8);
        self.submit(CALL, &queue, deps, move || {
            let mut data = mem.data.lock();
            // SAFETY: range checked above; the caller keeps src alive until completion.
            unsafe { std::ptr::copy_nonoverlapping(src.get() as *const u8, data[offset..].as_mut_ptr(), size) };
            Ok(())
        })
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
        const CALL: &str = "clEnqueueFillBuffer";
        let queue = self.queue(CALL, queue)?;
        if !self.specs[queue.device_index].supports_fill {
            return Err(DriverError::new(CALL, CL_INVALID_OPERATION));
        }
        if pattern.is_empty() || offset % pattern.len() != 0 || size % pattern.len() != 0 {
            return Err(DriverError::new(CALL, CL_INVALID_VALUE));
        }
        let mem = self.mem(CALL, mem, queue.context)?;
        mem.check_range(CALL, offset, size)?;
        let pattern = pattern.to_vec();
        self.submit(CALL, &queue, deps, move || {
            let mut data = mem.data.lock();
            for chunk in data[offset..offset + size].chunks_mut(pattern.len()) {
                chunk.copy_from_slice(&pattern);
            }
            Ok(())
        })
    }

    fn enqueue_copy(
        &self,
        queue: NativeQueue,
        src: NativeMem,
        dst: NativeMem,
        region: CopyRegion,
        deps: &[NativeEvent],
    ) -> Result<NativeEvent, DriverError> {
        const CALL: &str = "clEnqueueCopyBuffer";
        let queue = self.queue(CALL, queue)?;
        let src_offset = region.src_offset as usize;
        let dst_offset = region.dst_offset as usize;
        let size = region.size as usize;

        let src_mem = self.mem(CALL, src, queue.context)?;
        let dst_mem = self.mem(CALL, dst, queue.context)?;
        src_mem.check_range(CALL, src_offset, size)?;
        dst_mem.check_range(CALL, dst_offset, size)?;

        if src == dst {
            let overlaps = src_offset < dst_offset + size && dst_offset < src_offset + size;
            if overlaps {
                return Err(DriverError::new(CALL, CL_MEM_COPY_OVERLAP));
            }
            return self.submit(CALL, &queue, deps, move || {
                src_mem
                    .data
                    .lock()
                    .copy_within(src_offset..src_offset + size, dst_offset);
                Ok(())
            });
        }

        self.submit(CALL, &queue, deps, move || {
            // Staged so the two locks are never held together.
            let staged = src_mem.data.lock()[src_offset..src_offset + size].to_vec();
            dst_mem.data.lock()[dst_offset..dst_offset + size].copy_from_slice(&staged);
            Ok(())
        })
    }

    fn create_user_event(&self, context: NativeContext) -> Result<NativeEvent, DriverError> {
        if !self.contexts.contains_key(&context.0) {
            return Err(DriverError::new("clCreateUserEvent", CL_INVALID_CONTEXT));
        }
        let id = self.alloc_id();
        self.events
            .insert(id, HostEvent::new(context.0, true, EventStatus::Submitted));
        Ok(NativeEvent(id))
    }

    fn set_user_event_status(
        &self,
        event: NativeEvent,
        status: EventStatus,
    ) -> Result<(), DriverError> {
        const CALL: &str = "clSetUserEventStatus";
        let event = self.event(CALL, event)?;
        if !event.user {
            return Err(DriverError::new(CALL, CL_INVALID_EVENT));
        }
        if !status.is_terminal() {
            return Err(DriverError::new(CALL, CL_INVALID_VALUE));
        }
        if event.complete(status) {
            Ok(())
        } else {
            Err(DriverError::new(CALL, CL_INVALID_OPERATION))
        }
    }

    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError> {
        Ok(self.event("clGetEventInfo", event)?.status())
    }

    fn on_completion(
        &self,
        event: NativeEvent,
        callback: CompletionCallback,
    ) -> Result<(), DriverError> {
        self.event("clSetEventCallback", event)?.on_complete(callback);
        Ok(())
    }

    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError> {
        self.events
            .remove(&event.0)
            .map(|_| ())
            .ok_or(DriverError::new("clReleaseEvent", CL_INVALID_EVENT))
    }

    fn create_program_with_source(
        &self,
        context: NativeContext,
        source: &str,
    ) -> Result<NativeProgram, DriverError> {
        const CALL: &str = "clCreateProgramWithSource";
        if !self.contexts.contains_key(&context.0) {
            return Err(DriverError::new(CALL, CL_INVALID_CONTEXT));
        }
        if source.is_empty() {
            return Err(DriverError::new(CALL, CL_INVALID_VALUE));
        }
        let id = self.alloc_id();
        self.programs.insert(
            id,
            Arc::new(HostProgram {
                context: context.0,
                source: source.to_string(),
                state: Mutex::new(ProgramState {
                    built: false,
                    log: String::new(),
                    binary: Vec::new(),
                }),
            }),
        );
        Ok(NativeProgram(id))
    }

    fn create_program_with_binary(
        &self,
        context: NativeContext,
        device: NativeDevice,
        binary: &[u8],
    ) -> Result<NativeProgram, DriverError> {
        const CALL: &str = "clCreateProgramWithBinary";
        self.device_index(CALL, device)?;
        let source = binary
            .strip_prefix(HOST_BINARY_MAGIC)
            .and_then(|body| std::str::from_utf8(body).ok())
            .ok_or(DriverError::new(CALL, CL_INVALID_BINARY))?;
        if !self.contexts.contains_key(&context.0) {
            return Err(DriverError::new(CALL, CL_INVALID_CONTEXT));
        }
        let id = self.alloc_id();
        self.programs.insert(
            id,
            Arc::new(HostProgram {
                context: context.0,
                source: source.to_string(),
                state: Mutex::new(ProgramState {
                    built: false,
                    log: String::new(),
                    binary: Vec::new(),
                }),
            }),
        );
        Ok(NativeProgram(id))
    }

    fn build_program(
        &self,
        program: NativeProgram,
        device: NativeDevice,
        options: &str,
    ) -> Result<(), DriverError> {
        const CALL: &str = "clBuildProgram";
        let device_index = self.device_index(CALL, device)?;
        let program = self.program(CALL, program)?;
        if self.contexts.get(&program.context).map(|i| *i) != Some(device_index) {
            return Err(DriverError::new(CALL, CL_INVALID_DEVICE));
        }

        let errors: Vec<String> = program
            .source
            .lines()
            .enumerate()
            .filter_map(|(n, line)| {
                line.trim_start()
                    .strip_prefix("#error")
                    .map(|msg| format!("<source>:{}: error: {}", n + 1, msg.trim()))
            })
            .collect();

        let mut state = program.state.lock();
        if errors.is_empty() {
            let mut binary = HOST_BINARY_MAGIC.to_vec();
            binary.extend_from_slice(program.source.as_bytes());
            state.built = true;
            state.binary = binary;
            state.log = if options.is_empty() {
                String::new()
            } else {
                format!("options: {}\n", options)
            };
            Ok(())
        } else {
            state.built = false;
            state.binary.clear();
            state.log = errors.join("\n") + "\n";
            Err(DriverError::new(CALL, CL_BUILD_PROGRAM_FAILURE))
        }
    }

    fn program_build_log(
        &self,
        program: NativeProgram,
        device: NativeDevice,
    ) -> Result<String, DriverError> {
        const CALL: &str = "clGetProgramBuildInfo";
        self.device_index(CALL, device)?;
        Ok(self.program(CALL, program)?.state.lock().log.clone())
    }

    fn program_binary(&self, program: NativeProgram) -> Result<Vec<u8>, DriverError> {
        let program = self.program("clGetProgramInfo", program)?;
        let state = program.state.lock();
        Ok(if state.built { state.binary.clone() } else { Vec::new() })
    }

    fn release_program(&self, program: NativeProgram) -> Result<(), DriverError> {
        self.programs
            .remove(&program.0)
            .map(|_| ())
            .ok_or(DriverError::new("clReleaseProgram", CL_INVALID_PROGRAM))
    }

    fn create_kernel(&self, program: NativeProgram, name: &str) -> Result<NativeKernel, DriverError> {
        const CALL: &str = "clCreateKernel";
        let host_program = self.program(CALL, program)?;
        if !host_program.state.lock().built {
            return Err(DriverError::new(CALL, CL_INVALID_PROGRAM_EXECUTABLE));
        }
        if !declared_kernels(&host_program.source).contains(&name) {
            return Err(DriverError::new(CALL, CL_INVALID_KERNEL_NAME));
        }
        let id = self.alloc_id();
        self.kernels.insert(
            id,
            HostKernel {
                _program: program.0,
                _name: name.to_string(),
            },
        );
        Ok(NativeKernel(id))
    }

    fn release_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError> {
        self.kernels
            .remove(&kernel.0)
            .map(|_| ())
            .ok_or(DriverError::new("clReleaseKernel", CL_INVALID_KERNEL))
    }
}
