//! One accelerator context and its command queue.
//!
//! A `Device` turns the driver's one-shot completion callbacks into waitable
//! completions and owns the bookkeeping that keeps host memory alive while
//! native commands use it:
//!
//! * result data: host buffers native reads write into
//! * source data: host buffers native writes read from
//! * wait registry: at most one completion per token
//! * user events and pending memory deletions
//!
//! Native memory is only released while no user event is outstanding, since
//! a command gated on a user event may still reference it. When both are
//! needed, `user_events` is locked before `pending_deletions`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use rcl_protocol::device_info::DeviceInfo;

use crate::discovery;
use crate::driver::{
    DeviceDescriptor, Driver, DriverError, EventStatus, NativeContext, NativeDevice, NativeEvent,
    NativeMem, NativeQueue, QueueProperties, CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
    CL_OUT_OF_HOST_MEMORY,
};
use crate::error::ClError;
use crate::event::{Event, EventKind};
use crate::host_buffer::HostBuffer;
use crate::sync::WaitRegistry;

/// Bookkeeping for an untriggered user event.
#[derive(Debug, Clone, Copy, Default)]
struct UserEventEntry {
    /// No handle refers to the token any more; release it natively once triggered.
    orphaned: bool,
}

type UserEvents = HashMap<NativeEvent, UserEventEntry>;

/// Outcome of [`Device::teardown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// User events that were still pending and had to be force-triggered.
    pub user_events_triggered: usize,
    /// Native memory objects released during teardown.
    pub memory_released: usize,
    /// Native memory objects that could not be released.
    pub memory_leaked: usize,
}

/// Native tokens to gate a command on, plus an optional bridge event for
/// dependencies owned by other devices. The bridge is released on drop,
/// after the command using it has been enqueued.
pub(crate) struct WaitList {
    device: Arc<Device>,
    tokens: Vec<NativeEvent>,
    bridge: Option<NativeEvent>,
}

impl WaitList {
    pub(crate) fn tokens(&self) -> &[NativeEvent] {
        &self.tokens
    }
}

impl Drop for WaitList {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge {
            self.device.release_event(bridge);
        }
    }
}

pub struct Device {
    driver: Arc<dyn Driver>,
    descriptor: DeviceDescriptor,
    index: u32,
    server_id: u16,
    context: NativeContext,
    queue: NativeQueue,
    properties: QueueProperties,

    result_data: DashMap<NativeEvent, Arc<HostBuffer>>,
    source_data: DashMap<NativeEvent, Arc<HostBuffer>>,
    waits: Arc<WaitRegistry>,
    user_events: Mutex<UserEvents>,
    pending_deletions: Mutex<VecDeque<NativeMem>>,

    torn_down: AtomicBool,
}

impl Device {
    /// Create a context and command queue on `descriptor`.
    ///
    /// Out-of-order execution is enabled when the device supports it,
    /// profiling when requested and supported.
    pub fn open(
        driver: Arc<dyn Driver>,
        descriptor: DeviceDescriptor,
        index: u32,
        server_id: u16,
        enable_profiling: bool,
    ) -> Result<Arc<Self>, ClError> {
        let context = driver.create_context(descriptor.native)?;

        let properties = discovery::queue_properties(&descriptor, enable_profiling);
        let queue = match driver.create_queue(context, descriptor.native, properties) {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(release_err) = driver.release_context(context) {
                    warn!("{}", release_err);
                }
                return Err(e.into());
            }
        };

        info!(
            device = index,
            out_of_order = properties.out_of_order,
            profiling = properties.profiling,
            "opened device {} ({} driver)",
            descriptor.name,
            driver.name()
        );

        Ok(Arc::new(Self {
            driver,
            descriptor,
            index,
            server_id,
            context,
            queue,
            properties,
            result_data: DashMap::new(),
            source_data: DashMap::new(),
            waits: Arc::new(WaitRegistry::new()),
            user_events: Mutex::new(HashMap::new()),
            pending_deletions: Mutex::new(VecDeque::new()),
            torn_down: AtomicBool::new(false),
        }))
    }

    pub fn info(&self) -> DeviceInfo {
        discovery::device_info(&self.descriptor, self.index, self.server_id, self.properties)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn supports_fill(&self) -> bool {
        self.descriptor.supports_fill
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn native(&self) -> NativeDevice {
        self.descriptor.native
    }

    pub fn context(&self) -> NativeContext {
        self.context
    }

    pub fn queue(&self) -> NativeQueue {
        self.queue
    }

    // ── Completion ──────────────────────────────────────────

    /// Block until `token` reaches a terminal status.
    ///
    /// The first waiter registers the native callback; later waiters share
    /// the same completion. A token that terminated abnormally yields a
    /// `DriverError` carrying its status.
    pub fn wait_for_event(&self, token: NativeEvent) -> Result<(), ClError> {
        let (completion, inserted) = self.waits.get_or_insert(token);

        if inserted {
            let registry = Arc::downgrade(&self.waits);
            let registered = self.driver.on_completion(
                token,
                Box::new(move |status| {
                    if let Some(registry) = registry.upgrade() {
                        registry.signal(token, status);
                    }
                }),
            );
            if let Err(e) = registered {
                // Release anyone who raced in behind us before dropping the entry.
                completion.signal(EventStatus::Error(e.code));
                self.waits.remove(token);
                return Err(e.into());
            }
        }

        match completion.wait() {
            EventStatus::Error(code) => Err(DriverError::new("event completion", code).into()),
            _ => Ok(()),
        }
    }

    /// Non-blocking poll; true once the token is complete or failed.
    pub fn event_finished(&self, token: NativeEvent) -> Result<bool, ClError> {
        Ok(self.driver.event_status(token)?.is_terminal())
    }

    pub fn put_result_data(&self, token: NativeEvent, data: Arc<HostBuffer>) {
        self.result_data.insert(token, data);
    }

    pub fn put_source_data(&self, token: NativeEvent, data: Arc<HostBuffer>) {
        self.source_data.insert(token, data);
    }

    /// Wait for `token`, then copy out the data registered under it.
    ///
    /// Fails with `ProtocolMisuse` when nothing was registered; checked
    /// before waiting so a token with no payload never blocks.
    pub fn get_result_data(&self, token: NativeEvent) -> Result<Vec<u8>, ClError> {
        if !self.result_data.contains_key(&token) {
            return Err(ClError::ProtocolMisuse(
                "get_data() on an event without associated data".to_string(),
            ));
        }

        self.wait_for_event(token)?;

        let data = self
            .result_data
            .get(&token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ClError::ProtocolMisuse("event data was released while waiting".to_string())
            })?;
        // SAFETY: the command writing into the buffer has completed.
        Ok(unsafe { data.to_vec() })
    }

    /// Drop all bookkeeping for `token`, waiting first if data or waiters
    /// are attached so nothing is freed under a running command.
    pub fn release_event_resources(&self, token: NativeEvent) {
        let needs_wait = self.result_data.contains_key(&token)
            || self.source_data.contains_key(&token)
            || self.waits.contains(token);

        if needs_wait {
            if let Err(e) = self.wait_for_event(token) {
                debug!("released event finished with error: {}", e);
            }
        }

        self.waits.remove(token);
        self.result_data.remove(&token);
        self.source_data.remove(&token);
    }

    /// The last handle to `token` went away.
    ///
    /// Untriggered user events stay registered (and natively alive) until
    /// they are triggered or the device is torn down.
    pub fn release_event(&self, token: NativeEvent) {
        self.release_event_resources(token);

        {
            let mut user_events = self.user_events.lock();
            if let Some(entry) = user_events.get_mut(&token) {
                entry.orphaned = true;
                return;
            }
        }

        if let Err(e) = self.driver.release_event(token) {
            warn!(device = self.index, "{}", e);
        }
    }

    // ── User events ─────────────────────────────────────────

    pub fn create_user_event(self: &Arc<Self>) -> Result<Arc<Event>, ClError> {
        let token = self.register_user_event()?;
        Ok(Event::new(self.clone(), token, EventKind::User))
    }

    fn register_user_event(&self) -> Result<NativeEvent, ClError> {
        // Held across creation so no deletion can slip in before registration.
        let mut user_events = self.user_events.lock();
        // `teardown` sets the flag before taking this lock, so an event
        // registered here is always seen by its force-trigger pass.
        if self.torn_down.load(Ordering::Acquire) {
            return Err(ClError::ProtocolMisuse(format!(
                "device {} has been torn down",
                self.index
            )));
        }
        let token = self.driver.create_user_event(self.context)?;
        user_events.insert(token, UserEventEntry::default());
        Ok(token)
    }

    /// Complete a user event and retry pending deletions. Tokens that are
    /// not (or no longer) registered user events are ignored.
    pub fn trigger_user_event(&self, token: NativeEvent) -> Result<(), ClError> {
        let mut user_events = self.user_events.lock();
        self.trigger_user_event_locked(&mut user_events, token, EventStatus::Complete)
            .map(|_| ())
    }

    /// Returns the number of memory objects the trigger unblocked and released.
    fn trigger_user_event_locked(
        &self,
        user_events: &mut UserEvents,
        token: NativeEvent,
        status: EventStatus,
    ) -> Result<usize, ClError> {
        let entry = match user_events.remove(&token) {
            Some(entry) => entry,
            None => return Ok(0),
        };

        if let Err(e) = self.driver.set_user_event_status(token, status) {
            user_events.insert(token, entry);
            return Err(e.into());
        }

        if entry.orphaned {
            if let Err(e) = self.driver.release_event(token) {
                warn!(device = self.index, "{}", e);
            }
        }

        Ok(self.try_delete_memory_locked(user_events))
    }

    pub fn user_event_count(&self) -> usize {
        self.user_events.lock().len()
    }

    // ── Deferred memory release ─────────────────────────────

    pub fn schedule_memory_deletion(&self, mem: NativeMem) {
        self.pending_deletions.lock().push_back(mem);
        self.try_delete_memory();
    }

    pub fn try_delete_memory(&self) -> usize {
        let user_events = self.user_events.lock();
        self.try_delete_memory_locked(&user_events)
    }

    /// Requires the `user_events` lock. Returns the number of objects released.
    fn try_delete_memory_locked(&self, user_events: &UserEvents) -> usize {
        if !user_events.is_empty() {
            return 0;
        }

        let mut pending = self.pending_deletions.lock();
        let mut released = 0;
        let mut failed = VecDeque::new();
        while let Some(mem) = pending.pop_front() {
            match self.driver.release_mem(mem) {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!(device = self.index, "{}", e);
                    failed.push_back(mem);
                }
            }
        }
        *pending = failed;
        released
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.pending_deletions.lock().len()
    }

    // ── Dependencies ────────────────────────────────────────

    /// Build the native wait list for `deps`. Events of other devices on
    /// this node are folded into one bridge user event that completes once
    /// all of them have.
    pub(crate) fn wait_list(self: &Arc<Self>, deps: &[Arc<Event>]) -> Result<WaitList, ClError> {
        let mut tokens = Vec::with_capacity(deps.len() + 1);
        let mut foreign = Vec::new();
        for dep in deps {
            if Arc::ptr_eq(dep.device(), self) {
                tokens.push(dep.token());
            } else {
                foreign.push(dep.clone());
            }
        }

        let bridge = if foreign.is_empty() {
            None
        } else {
            let bridge = self.bridge_events(foreign)?;
            tokens.push(bridge);
            Some(bridge)
        };

        Ok(WaitList {
            device: self.clone(),
            tokens,
            bridge,
        })
    }

    fn bridge_events(self: &Arc<Self>, foreign: Vec<Arc<Event>>) -> Result<NativeEvent, ClError> {
        let token = self.register_user_event()?;
        let device = Arc::downgrade(self);

        let spawned = std::thread::Builder::new()
            .name("rcl-bridge".to_string())
            .spawn(move || {
                let mut status = EventStatus::Complete;
                for event in &foreign {
                    if let Err(e) = event.wait() {
                        debug!("bridged dependency failed: {}", e);
                        status = EventStatus::Error(CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
                    }
                }
                drop(foreign);
                if let Some(device) = device.upgrade() {
                    device.complete_internal_event(token, status);
                }
            });

        if spawned.is_err() {
            self.complete_internal_event(token, EventStatus::Error(CL_OUT_OF_HOST_MEMORY));
            self.release_event(token);
            return Err(DriverError::new("spawn bridge thread", CL_OUT_OF_HOST_MEMORY).into());
        }
        Ok(token)
    }

    /// Register an internal user event that an operation completes itself.
    pub(crate) fn create_internal_event(&self) -> Result<NativeEvent, ClError> {
        self.register_user_event()
    }

    pub(crate) fn complete_internal_event(&self, token: NativeEvent, status: EventStatus) {
        let mut user_events = self.user_events.lock();
        if let Err(e) = self.trigger_user_event_locked(&mut user_events, token, status) {
            warn!(device = self.index, "failed to complete internal event: {}", e);
        }
    }

    // ── Teardown ────────────────────────────────────────────

    /// Force-trigger every outstanding user event and drain pending
    /// deletions. Failures are logged, never returned. Runs once; later
    /// calls return an empty report, and the device accepts no new user
    /// events (nor operations that need one) afterwards.
    pub fn teardown(&self) -> TeardownReport {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return TeardownReport::default();
        }

        let mut report = TeardownReport::default();
        let mut user_events = self.user_events.lock();

        let leftover: Vec<NativeEvent> = user_events.keys().copied().collect();
        for token in leftover {
            match self.trigger_user_event_locked(&mut user_events, token, EventStatus::Complete) {
                Ok(released) => {
                    report.user_events_triggered += 1;
                    report.memory_released += released;
                }
                Err(e) => warn!(device = self.index, "failed to trigger user event: {}", e),
            }
        }
        if report.user_events_triggered > 0 {
            info!(
                device = self.index,
                "force-triggered {} outstanding user event(s)", report.user_events_triggered
            );
        }

        report.memory_released += self.try_delete_memory_locked(&user_events);
        report.memory_leaked = self.pending_deletions.lock().len();
        if report.memory_leaked > 0 {
            error!(
                device = self.index,
                "{}",
                ClError::ResourceLeak(format!(
                    "unable to release {} memory object(s)",
                    report.memory_leaked
                ))
            );
        }

        report
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.teardown();

        if let Err(e) = self.driver.finish(self.queue) {
            warn!(device = self.index, "{}", e);
        }
        if let Err(e) = self.driver.release_queue(self.queue) {
            warn!(device = self.index, "{}", e);
        }
        if let Err(e) = self.driver.release_context(self.context) {
            warn!(device = self.index, "{}", e);
        }
        debug!(device = self.index, "device released");
    }
}
