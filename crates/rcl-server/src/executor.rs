use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use rcl_protocol::cl_commands::{ClCommand, ClResponse, MemFlags, ProgramSource};
use rcl_protocol::device_info::DeviceInfo;
use rcl_protocol::handle::{NetworkHandle, ResourceType};

use crate::buffer::{Buffer, CopySource, PeerReader};
use crate::device::Device;
use crate::discovery::{self, ExposedDevice};
use crate::driver::Driver;
use crate::error::ClError;
use crate::event::{Event, EventKind};
use crate::program::{Kernel, Program};
use crate::session::Session;

/// Executes compute commands against the node's devices.
///
/// Every live object is reachable through exactly one directory entry per
/// handle; removing the entry drops the server's reference and the object
/// cleans up after itself once nothing else holds it.
pub struct ClExecutor {
    driver: Arc<dyn Driver>,
    exposed: Vec<ExposedDevice>,
    server_id: u16,
    enable_profiling: bool,
    peers: Option<Arc<dyn PeerReader>>,

    /// Device index -> opened device; each index is opened at most once
    opened: DashMap<u32, Arc<Device>>,
    open_lock: Mutex<()>,

    device_handles: DashMap<NetworkHandle, Arc<Device>>,
    buffer_handles: DashMap<NetworkHandle, Arc<Buffer>>,
    event_handles: DashMap<NetworkHandle, Arc<Event>>,
    program_handles: DashMap<NetworkHandle, Arc<Program>>,
    kernel_handles: DashMap<NetworkHandle, Arc<Kernel>>,
}

impl ClExecutor {
    pub fn new(
        driver: Arc<dyn Driver>,
        exposed: Vec<ExposedDevice>,
        server_id: u16,
        enable_profiling: bool,
    ) -> Self {
        Self {
            driver,
            exposed,
            server_id,
            enable_profiling,
            peers: None,
            opened: DashMap::new(),
            open_lock: Mutex::new(()),
            device_handles: DashMap::new(),
            buffer_handles: DashMap::new(),
            event_handles: DashMap::new(),
            program_handles: DashMap::new(),
            kernel_handles: DashMap::new(),
        }
    }

    /// Route copies from buffers on other nodes through `peers`.
    pub fn with_peers(mut self, peers: Arc<dyn PeerReader>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Capabilities of every exposed device.
    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        self.exposed
            .iter()
            .map(|d| match self.opened.get(&d.index) {
                Some(device) => device.info(),
                None => discovery::device_info(
                    &d.descriptor,
                    d.index,
                    self.server_id,
                    discovery::queue_properties(&d.descriptor, self.enable_profiling),
                ),
            })
            .collect()
    }

    /// Number of live handles across all directories.
    pub fn handle_count(&self) -> usize {
        self.device_handles.len()
            + self.buffer_handles.len()
            + self.event_handles.len()
            + self.program_handles.len()
            + self.kernel_handles.len()
    }

    /// The opened device with server index `index`, if any.
    pub fn opened_device(&self, index: u32) -> Option<Arc<Device>> {
        self.opened.get(&index).map(|d| d.clone())
    }

    /// Execute a command and return the response.
    pub fn execute(&self, session: &Session, cmd: ClCommand) -> ClResponse {
        let name = cmd.name();
        match self.dispatch(session, cmd) {
            Ok(response) => {
                debug!(session_id = session.session_id(), "{} -> {}", name, summary(&response));
                response
            }
            Err(e) => {
                debug!(session_id = session.session_id(), "{} failed: {}", name, e);
                e.to_response()
            }
        }
    }

    fn dispatch(&self, session: &Session, cmd: ClCommand) -> Result<ClResponse, ClError> {
        match cmd {
            // ── Device ──────────────────────────────────────
            ClCommand::OpenDevice { index } => {
                if !session.may_open(index) {
                    return Err(ClError::InvalidArgument(format!(
                        "device {} is not available to {}",
                        index,
                        session.client_name()
                    )));
                }
                let device = self.open_device(index)?;
                let handle = session.alloc_handle(ResourceType::Device);
                self.device_handles.insert(handle, device);
                Ok(ClResponse::Device(handle))
            }

            ClCommand::CreateBuffer {
                device,
                flags,
                size,
                initial_data,
            } => {
                let device = self.device(device)?;
                let flags = MemFlags::from_bits(flags).ok_or_else(|| {
                    ClError::InvalidArgument(format!("unknown memory flags {:#x}", flags))
                })?;
                let buffer = Buffer::create(&device, flags, size, initial_data.as_deref())?;
                let handle = session.alloc_handle(ResourceType::Buffer);
                self.buffer_handles.insert(handle, buffer);
                Ok(ClResponse::Buffer(handle))
            }

            ClCommand::CreateUserEvent { device } => {
                let event = self.device(device)?.create_user_event()?;
                Ok(ClResponse::Event(self.register_event(session, event)))
            }

            ClCommand::CreateProgram { device, source } => {
                let device = self.device(device)?;
                let program = match source {
                    ProgramSource::Source(text) => Program::from_source(&device, &text)?,
                    ProgramSource::Binary(binary) => Program::from_binary(&device, &binary)?,
                };
                let handle = session.alloc_handle(ResourceType::Program);
                self.program_handles.insert(handle, program);
                Ok(ClResponse::Program(handle))
            }

            // ── Buffer ──────────────────────────────────────
            ClCommand::BufferSize { buffer } => Ok(ClResponse::Size(self.buffer(buffer)?.size())),

            ClCommand::BufferRead {
                buffer,
                offset,
                size,
                deps,
            } => {
                let buffer = self.buffer(buffer)?;
                let deps = self.local_events(&deps)?;
                let event = buffer.read(offset, size, &deps)?;
                Ok(ClResponse::Event(self.register_event(session, event)))
            }

            ClCommand::BufferWrite {
                buffer,
                offset,
                data,
                deps,
            } => {
                let buffer = self.buffer(buffer)?;
                let deps = self.local_events(&deps)?;
                let event = buffer.write(offset, data, &deps)?;
                Ok(ClResponse::Event(self.register_event(session, event)))
            }

            ClCommand::BufferFill {
                buffer,
                pattern,
                offset,
                size,
                deps,
            } => {
                let buffer = self.buffer(buffer)?;
                let deps = self.local_events(&deps)?;
                let event = buffer.fill(&pattern, offset, size, &deps)?;
                Ok(ClResponse::Event(self.register_event(session, event)))
            }

            ClCommand::BufferCopy {
                dst,
                src,
                region,
                deps,
            } => {
                let dst = self.buffer(dst)?;
                let (source, deps) = if src.is_on(self.server_id) {
                    (CopySource::Local(self.buffer(src)?), self.local_events(&deps)?)
                } else {
                    let reader = self.peers.clone().ok_or_else(|| {
                        ClError::Unsupported(format!(
                            "no peer connection configured for node {}",
                            src.server_id
                        ))
                    })?;
                    let mut local = Vec::new();
                    let mut remote = Vec::new();
                    for dep in deps {
                        if dep.is_on(self.server_id) {
                            local.push(self.event(dep)?);
                        } else if dep.is_on(src.server_id) {
                            remote.push(dep);
                        } else {
                            return Err(ClError::InvalidHandle(format!(
                                "{} belongs to neither the source nor the destination node",
                                dep
                            )));
                        }
                    }
                    let source = CopySource::Remote {
                        buffer: src,
                        reader,
                        deps: remote,
                    };
                    (source, local)
                };
                let event = dst.copy(source, region, &deps)?;
                Ok(ClResponse::Event(self.register_event(session, event)))
            }

            // ── Event ───────────────────────────────────────
            ClCommand::EventAwait { event } => {
                self.event(event)?.wait()?;
                Ok(ClResponse::Success)
            }

            ClCommand::EventFinished { event } => {
                Ok(ClResponse::Finished(self.event(event)?.finished()?))
            }

            ClCommand::EventTrigger { event } => {
                self.event(event)?.trigger()?;
                Ok(ClResponse::Success)
            }

            ClCommand::EventGetData { event } => Ok(ClResponse::Data(self.event(event)?.data()?)),

            // ── Program ─────────────────────────────────────
            ClCommand::ProgramBuild { program, options } => {
                self.program(program)?.build(&options)?;
                Ok(ClResponse::Success)
            }

            ClCommand::ProgramGetBinary { program } => {
                Ok(ClResponse::Binary(self.program(program)?.binary()?))
            }

            ClCommand::ProgramCreateKernel { program, name } => {
                let kernel = self.program(program)?.create_kernel(&name)?;
                let handle = session.alloc_handle(ResourceType::Kernel);
                self.kernel_handles.insert(handle, kernel);
                Ok(ClResponse::Kernel(handle))
            }

            // ── Lifetime ────────────────────────────────────
            ClCommand::Release { handle } => {
                session.remove_handle(&handle);
                if self.release(handle) {
                    Ok(ClResponse::Success)
                } else {
                    Err(ClError::InvalidHandle(format!("{} is not live on this node", handle)))
                }
            }
        }
    }

    fn open_device(&self, index: u32) -> Result<Arc<Device>, ClError> {
        if let Some(device) = self.opened.get(&index) {
            return Ok(device.clone());
        }

        let exposed = self
            .exposed
            .iter()
            .find(|d| d.index == index)
            .ok_or_else(|| ClError::InvalidArgument(format!("no device with index {}", index)))?;

        let _guard = self.open_lock.lock();
        if let Some(device) = self.opened.get(&index) {
            return Ok(device.clone());
        }
        let device = Device::open(
            self.driver.clone(),
            exposed.descriptor.clone(),
            index,
            self.server_id,
            self.enable_profiling,
        )?;
        self.opened.insert(index, device.clone());
        Ok(device)
    }

    fn register_event(&self, session: &Session, event: Arc<Event>) -> NetworkHandle {
        let handle = session.alloc_handle(ResourceType::Event);
        self.event_handles.insert(handle, event);
        handle
    }

    fn lookup<T>(
        &self,
        directory: &DashMap<NetworkHandle, Arc<T>>,
        handle: NetworkHandle,
        expected: ResourceType,
    ) -> Result<Arc<T>, ClError> {
        if !handle.is_on(self.server_id) {
            return Err(ClError::InvalidHandle(format!(
                "{} is owned by node {}, this is node {}",
                handle, handle.server_id, self.server_id
            )));
        }
        if handle.resource_type != expected {
            return Err(ClError::InvalidHandle(format!(
                "{} is not a {:?}",
                handle, expected
            )));
        }
        directory
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClError::InvalidHandle(format!("{} is not live on this node", handle)))
    }

    fn device(&self, handle: NetworkHandle) -> Result<Arc<Device>, ClError> {
        self.lookup(&self.device_handles, handle, ResourceType::Device)
    }

    fn buffer(&self, handle: NetworkHandle) -> Result<Arc<Buffer>, ClError> {
        self.lookup(&self.buffer_handles, handle, ResourceType::Buffer)
    }

    fn event(&self, handle: NetworkHandle) -> Result<Arc<Event>, ClError> {
        self.lookup(&self.event_handles, handle, ResourceType::Event)
    }

    fn program(&self, handle: NetworkHandle) -> Result<Arc<Program>, ClError> {
        self.lookup(&self.program_handles, handle, ResourceType::Program)
    }

    /// Resolve dependencies that must all live on this node.
    fn local_events(&self, deps: &[NetworkHandle]) -> Result<Vec<Arc<Event>>, ClError> {
        deps.iter().map(|dep| self.event(*dep)).collect()
    }

    /// Drop the directory entry for `handle`. Returns false if there was none.
    fn release(&self, handle: NetworkHandle) -> bool {
        if !handle.is_on(self.server_id) {
            return false;
        }
        match handle.resource_type {
            ResourceType::Device => self.device_handles.remove(&handle).is_some(),
            ResourceType::Buffer => self.buffer_handles.remove(&handle).is_some(),
            ResourceType::Event => self.event_handles.remove(&handle).is_some(),
            ResourceType::Program => self.program_handles.remove(&handle).is_some(),
            ResourceType::Kernel => self.kernel_handles.remove(&handle).is_some(),
            ResourceType::None => false,
        }
    }

    fn complete_orphaned(&self, event: &Event) -> bool {
        if event.kind() != EventKind::User || !matches!(event.finished(), Ok(false)) {
            return false;
        }
        match event.trigger() {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to complete orphaned user event: {}", e);
                false
            }
        }
    }

    /// Release every handle a disconnected session left behind.
    pub fn cleanup_session(&self, session: &Session) {
        let mut handles = session.take_handles();
        if handles.is_empty() {
            return;
        }

        // Nobody can trigger these any more; complete them so operations
        // gated on them drain instead of pinning the release below.
        let triggered = handles
            .iter()
            .filter(|h| h.resource_type == ResourceType::Event)
            .filter_map(|h| self.event_handles.get(h).map(|e| e.value().clone()))
            .filter(|event| self.complete_orphaned(event))
            .count();
        if triggered > 0 {
            debug!(
                session_id = session.session_id(),
                "completed {} untriggered user event(s)", triggered
            );
        }

        // Dependents before the objects they hold.
        handles.sort_by_key(|h| match h.resource_type {
            ResourceType::Kernel => 0,
            ResourceType::Event => 1,
            ResourceType::Program => 2,
            ResourceType::Buffer => 3,
            ResourceType::Device | ResourceType::None => 4,
        });

        let cleaned = handles.into_iter().filter(|h| self.release(*h)).count();
        if cleaned > 0 {
            info!(
                session_id = session.session_id(),
                "released {} handle(s) left by {}",
                cleaned,
                session.client_name()
            );
        }
    }

    /// Tear down every opened device and drop all handles.
    pub fn shutdown(&self) {
        for entry in self.opened.iter() {
            let report = entry.value().teardown();
            if report.memory_leaked > 0 {
                warn!(
                    device = entry.key(),
                    "{} memory object(s) leaked at shutdown", report.memory_leaked
                );
            }
        }

        self.kernel_handles.clear();
        self.event_handles.clear();
        self.program_handles.clear();
        self.buffer_handles.clear();
        self.device_handles.clear();
        self.opened.clear();
        info!(server_id = self.server_id, "executor shut down");
    }
}

/// Keep payloads out of debug logs.
fn summary(response: &ClResponse) -> String {
    match response {
        ClResponse::Data(data) => format!("Data({} bytes)", data.len()),
        ClResponse::Binary(binary) => format!("Binary({} bytes)", binary.len()),
        other => format!("{:?}", other),
    }
}
