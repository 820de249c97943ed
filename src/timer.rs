//! Per-thread min-heap of TIMER events, keyed by absolute deadline.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::event::EventHandle;
use crate::mask::Interest;

struct Entry {
    deadline: Instant,
    event: EventHandle,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// A single loop thread's timer heap. Not `Send`/`Sync` on its own; the
/// runtime owns one per loop thread and never shares it across threads
/// (cross-thread scheduling goes through [`crate::wakeup`] instead).
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a TIMER event at `e.whence()`. Takes ownership of the logical
    /// reference the caller holds; it is returned to the caller via the
    /// callback's invocation or released on eventual removal.
    pub fn add_timed(&mut self, e: EventHandle) {
        let deadline = e.whence();
        self.heap.push(Reverse(Entry { deadline, event: e }));
    }

    /// Remove and deref the first event for which `pred` returns true, if
    /// any. O(n): the heap has no secondary index from event identity to
    /// position, matching the ambiguity the original `remove_timed` leaves
    /// open when the caller doesn't already know the heap slot.
    pub fn remove_timed(&mut self, pred: impl Fn(&EventHandle) -> bool) -> Option<EventHandle> {
        let items: Vec<Reverse<Entry>> = self.heap.drain().collect();
        let mut found = None;
        let mut rest = BinaryHeap::with_capacity(items.len());
        for Reverse(entry) in items {
            if found.is_none() && pred(&entry.event) {
                found = Some(entry.event);
            } else {
                rest.push(Reverse(entry));
            }
        }
        self.heap = rest;
        found
    }

    /// Invoke `f` with every currently-heaped event, in unspecified order.
    pub fn foreach_timedevent(&self, mut f: impl FnMut(&EventHandle)) {
        for Reverse(entry) in self.heap.iter() {
            f(&entry.event);
        }
    }

    /// The next deadline due, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Pop and invoke every event whose deadline is `<= now`. A callback
    /// returning a mask that still includes TIMER is re-inserted at its
    /// (possibly self-mutated) `whence()`; a callback returning
    /// [`Interest::NONE`] releases the event's logical reference.
    ///
    /// Re-insertion reads `whence()` *after* the callback returns: a
    /// self-rescheduling timer is expected to write its own next deadline
    /// before returning TIMER. A callback that returns TIMER without moving
    /// `whence` forward will be re-dispatched immediately on the next call —
    /// that's a caller bug, not something this heap guards against.
    pub fn dispatch_timed(&mut self, now: Instant) {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            due.push(entry);
        }

        for entry in due {
            let result = entry.event.invoke(Interest::TIMER, now);
            if result.contains(Interest::TIMER) {
                let deadline = entry.event.whence();
                self.heap.push(Reverse(Entry { deadline, event: entry.event }));
            } else {
                entry.event.deref();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventHandle;
    use std::time::Duration;

    fn noop(_e: &EventHandle, _mask: Interest, _now: Instant) -> Interest {
        Interest::NONE
    }

    #[test]
    fn dispatch_fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        let e1 = EventHandle::alloc(noop);
        e1.set_whence(base + Duration::from_millis(30));
        let e2 = EventHandle::alloc(noop);
        e2.set_whence(base + Duration::from_millis(10));
        let e3 = EventHandle::alloc(noop);
        e3.set_whence(base + Duration::from_millis(20));

        heap.add_timed(e1);
        heap.add_timed(e2);
        heap.add_timed(e3);

        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(10)));
        heap.dispatch_timed(base + Duration::from_millis(25));
        // the 10ms and 20ms entries fired (both derefed, NONE); 30ms remains.
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(30)));
        heap.dispatch_timed(base + Duration::from_millis(30));
        assert!(heap.is_empty());
    }

    fn reschedule_once(e: &EventHandle, _mask: Interest, now: Instant) -> Interest {
        e.set_whence(now + Duration::from_millis(5));
        Interest::TIMER
    }

    #[test]
    fn timer_callback_can_reschedule_itself() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let e = EventHandle::alloc(reschedule_once);
        e.set_whence(base);
        heap.add_timed(e);

        heap.dispatch_timed(base);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(5)));

        heap.dispatch_timed(base + Duration::from_millis(5));
        assert_eq!(heap.len(), 1, "second dispatch reschedules again");
    }

    #[test]
    fn remove_timed_finds_by_predicate() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let e1 = EventHandle::alloc(noop).with_fd(-1);
        e1.set_whence(base);
        let target_fd = 42;
        let e2 = EventHandle::alloc(noop).with_fd(target_fd);
        e2.set_whence(base + Duration::from_millis(1));
        heap.add_timed(e1);
        heap.add_timed(e2);

        let removed = heap.remove_timed(|e| e.fd() == target_fd);
        assert!(removed.is_some());
        removed.unwrap().deref();
        assert_eq!(heap.len(), 1);
        heap.foreach_timedevent(|e| assert_ne!(e.fd(), target_fd));
        heap.remove_timed(|_| true).unwrap().deref();
    }
}
