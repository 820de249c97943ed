use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use evrt::{allocations_current, Backend, EventHandle, FdRegistry, Interest, Readiness};

struct NullBackend;

impl Backend for NullBackend {
    fn arm(&self, _fd: i32, _token: usize, _interest: Interest) -> evrt::Result<()> {
        Ok(())
    }
    fn rearm(&self, _fd: i32, _token: usize, _interest: Interest) -> evrt::Result<()> {
        Ok(())
    }
    fn disarm(&self, _fd: i32, _token: usize) -> evrt::Result<()> {
        Ok(())
    }
    fn poll(&self, _timeout: Option<Duration>) -> evrt::Result<Vec<Readiness>> {
        Ok(Vec::new())
    }
    fn wake_token(&self) -> usize {
        usize::MAX
    }
}

static CALLS: AtomicU32 = AtomicU32::new(0);

fn terminal_read_cb(_e: &EventHandle, _mask: Interest, _now: Instant) -> Interest {
    CALLS.fetch_add(1, Ordering::SeqCst);
    Interest::NONE
}

#[test]
fn a_removed_fd_event_finishes_its_invocation_and_never_fires_again() {
    CALLS.store(0, Ordering::SeqCst);

    let backend: Arc<dyn Backend> = Arc::new(NullBackend);
    let registry = FdRegistry::new(16);

    let e = EventHandle::alloc(terminal_read_cb).with_fd(5);
    e.set_mask(Interest::READ);
    registry.add(e, backend, None).expect("register fd 5");

    let before = allocations_current();

    // `remove_fd` pulls the event out of the slot table before the callback
    // runs; the runtime's `trigger` always invokes outside the registered
    // state, so a concurrent remove can never race a live dispatch.
    let pulled = registry.remove_fd(5).expect("fd 5 was registered");
    registry.trigger(pulled, Interest::READ, Instant::now());

    assert_eq!(CALLS.load(Ordering::SeqCst), 1, "callback ran exactly once");
    assert!(registry.find_fd(5).is_none(), "fd 5 stays removed");
    assert_eq!(allocations_current(), before - 1, "event was derefed after returning an empty mask");
}
