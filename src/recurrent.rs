//! Per-thread ordered list of RECURRENT events, fired once per tick.

use crate::event::EventHandle;
use crate::mask::Interest;
use std::time::Instant;

/// A single loop thread's recurrent list. Thread-local, never shared.
#[derive(Default)]
pub struct RecurrentList {
    events: Vec<EventHandle>,
}

impl RecurrentList {
    pub fn new() -> RecurrentList {
        RecurrentList::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append `e` unless an event with the same identity is already present.
    pub fn add_recurrent(&mut self, e: EventHandle) {
        if self.events.iter().any(|existing| EventHandle::ptr_eq(existing, &e)) {
            e.deref();
            return;
        }
        self.events.push(e);
    }

    /// Remove and return the matching event, if present.
    pub fn remove_recurrent(&mut self, pred: impl Fn(&EventHandle) -> bool) -> Option<EventHandle> {
        let idx = self.events.iter().position(|e| pred(e))?;
        Some(self.events.remove(idx))
    }

    /// Invoke every event in registration order with mask RECURRENT. The
    /// returned mask is ignored; removal only happens via
    /// [`RecurrentList::remove_recurrent`].
    pub fn dispatch_recurrent(&self, now: Instant) {
        for e in &self.events {
            let _ = e.invoke(Interest::RECURRENT, now);
        }
    }
}
