//! Cross-thread wakeup: lets one loop thread interrupt another thread's
//! blocked backend wait, so a cross-thread `add`/`remove`/`update` becomes
//! visible before the owner's next scheduled timeout.

use std::sync::Arc;

use mio::{Registry, Token};

use crate::error::{Error, Result};

/// Reserved token a loop thread's own wake channel is registered under.
/// Fd events never use this token; the registry refuses to hand it out.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// One loop thread's wake channel. `wake()` is safe to call from any thread;
/// the owning thread observes it as a READABLE event at [`WAKE_TOKEN`] the
/// next time its backend wait returns.
pub struct Wakeup {
    waker: Arc<mio::Waker>,
}

impl Wakeup {
    /// Register a wake channel with `registry` at [`WAKE_TOKEN`].
    pub fn register(registry: &Registry) -> Result<Wakeup> {
        let waker = mio::Waker::new(registry, WAKE_TOKEN).map_err(|source| Error::BackendFailure {
            fd: -1,
            source,
        })?;
        Ok(Wakeup { waker: Arc::new(waker) })
    }

    /// Signal the owning thread. Spurious wakes (more than one signal
    /// coalesced into a single readiness event) are harmless: the owner
    /// just re-polls its intake queues and finds nothing new.
    pub fn wake(&self) -> Result<()> {
        self.waker
            .wake()
            .map_err(|source| Error::BackendFailure { fd: -1, source })
    }

    /// A cloneable handle other threads can hold onto to call [`Wakeup::wake`]
    /// without needing a reference back into the owning thread's state.
    pub fn handle(&self) -> WakeupHandle {
        WakeupHandle { waker: Arc::clone(&self.waker) }
    }
}

/// A thread-safe handle to another loop thread's wake channel.
#[derive(Clone)]
pub struct WakeupHandle {
    waker: Arc<mio::Waker>,
}

impl WakeupHandle {
    pub fn wake(&self) -> Result<()> {
        self.waker
            .wake()
            .map_err(|source| Error::BackendFailure { fd: -1, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::time::Duration;

    #[test]
    fn waking_unblocks_a_poll_wait() {
        let mut poll = Poll::new().expect("poll");
        let wakeup = Wakeup::register(poll.registry()).expect("register waker");
        let handle = wakeup.handle();

        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.wake().expect("wake");
        });

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).expect("poll wait");
        assert!(events.iter().any(|e| e.token() == WAKE_TOKEN));
        thread.join().unwrap();
    }
}
