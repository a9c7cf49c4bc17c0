//! Waitable completion primitives bridging native callbacks to blocking waiters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::driver::{EventStatus, NativeEvent};

/// A one-shot, sticky completion flag carrying the terminal event status.
pub struct Completion {
    status: Mutex<Option<EventStatus>>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Record the terminal status and wake all waiters. Later signals are ignored.
    pub fn signal(&self, status: EventStatus) {
        let mut slot = self.status.lock();
        if slot.is_none() {
            *slot = Some(status);
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) -> EventStatus {
        let mut slot = self.status.lock();
        loop {
            if let Some(status) = *slot {
                return status;
            }
            self.cond.wait(&mut slot);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// At most one [`Completion`] per token. Native callbacks look their
/// completion up here by token instead of holding a pointer to it.
#[derive(Default)]
pub struct WaitRegistry {
    entries: Mutex<HashMap<NativeEvent, Arc<Completion>>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the completion for `token` and whether it was just created.
    pub fn get_or_insert(&self, token: NativeEvent) -> (Arc<Completion>, bool) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&token) {
            return (existing.clone(), false);
        }
        let completion = Arc::new(Completion::new());
        entries.insert(token, completion.clone());
        (completion, true)
    }

    pub fn signal(&self, token: NativeEvent, status: EventStatus) {
        let completion = self.entries.lock().get(&token).cloned();
        if let Some(completion) = completion {
            completion.signal(status);
        }
    }

    pub fn contains(&self, token: NativeEvent) -> bool {
        self.entries.lock().contains_key(&token)
    }

    pub fn remove(&self, token: NativeEvent) {
        self.entries.lock().remove(&token);
    }
}
