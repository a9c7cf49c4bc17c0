use std::sync::Arc;

use crate::device::Device;
use crate::driver::NativeEvent;
use crate::error::ClError;

/// How an event reaches completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Created by the caller and completed through [`Event::trigger`].
    User,
    /// Produced by an enqueued operation; completes on its own.
    Operation,
}

/// A completion token owned by one device.
pub struct Event {
    device: Arc<Device>,
    token: NativeEvent,
    kind: EventKind,
}

impl Event {
    pub(crate) fn new(device: Arc<Device>, token: NativeEvent, kind: EventKind) -> Arc<Self> {
        Arc::new(Self {
            device,
            token,
            kind,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn token(&self) -> NativeEvent {
        self.token
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Block until the event completes.
    pub fn wait(&self) -> Result<(), ClError> {
        self.device.wait_for_event(self.token)
    }

    pub fn finished(&self) -> Result<bool, ClError> {
        self.device.event_finished(self.token)
    }

    pub fn trigger(&self) -> Result<(), ClError> {
        match self.kind {
            EventKind::User => self.device.trigger_user_event(self.token),
            EventKind::Operation => Err(ClError::ProtocolMisuse(
                "trigger() is only valid on user events".to_string(),
            )),
        }
    }

    /// Wait, then return the bytes the operation produced.
    pub fn data(&self) -> Result<Vec<u8>, ClError> {
        self.device.get_result_data(self.token)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.device.release_event(self.token);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.device.index())
            .field("token", &self.token)
            .field("kind", &self.kind)
            .finish()
    }
}
