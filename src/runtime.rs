//! Top-level runtime: owns the loop-thread pool, drives each thread's tick,
//! and exposes the lifecycle callers actually interact with.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::EventHandle;
use crate::fdreg::{Backend, FdRegistry, MioBackend};
use crate::jobqueue::BackQueueRegistry;
use crate::pool::{Pool, PoolRegistry, ThreadId, DEFAULT_POOL};
use crate::recurrent::RecurrentList;
use crate::timer::TimerHeap;
use crate::wakeup::Wakeup;

const MAX_SLEEPTIME: Duration = Duration::from_millis(500);

/// Wall-clock time a loop thread began its current tick. `get_epoch()`
/// reads the calling thread's value.
thread_local! {
    static EPOCH: std::cell::Cell<Option<Instant>> = const { std::cell::Cell::new(None) };
}

/// The start-of-tick wall time for the calling loop thread, if it is one.
pub fn get_epoch() -> Option<Instant> {
    EPOCH.with(|e| e.get())
}

#[cfg(unix)]
fn raise_rlim_nofiles(target: u64) -> Result<u64> {
    use std::mem::MaybeUninit;
    unsafe {
        let mut limits = MaybeUninit::<libc::rlimit>::uninit();
        if libc::getrlimit(libc::RLIMIT_NOFILE, limits.as_mut_ptr()) != 0 {
            return Err(Error::ResourceExhausted("getrlimit(RLIMIT_NOFILE) failed"));
        }
        let mut limits = limits.assume_init();
        let want = target.min(limits.rlim_max as u64);
        if want > limits.rlim_cur as u64 {
            limits.rlim_cur = want as libc::rlim_t;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &limits) != 0 {
                warn!("setrlimit(RLIMIT_NOFILE, {want}) failed, continuing with current limit");
            }
        }
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) != 0 {
            return Err(Error::ResourceExhausted("getrlimit(RLIMIT_NOFILE) failed"));
        }
        Ok(limits.rlim_cur as u64)
    }
}

#[cfg(not(unix))]
fn raise_rlim_nofiles(target: u64) -> Result<u64> {
    Ok(target)
}

struct LoopThreadState {
    timers: Mutex<TimerHeap>,
    recurrent: Mutex<RecurrentList>,
    /// Each loop thread owns its own backend (`Poll`/`Registry`/`Waker`):
    /// mio documents that only a single `Waker` may be active per `Poll`, so
    /// a wake channel per thread requires a `Poll` per thread too. This also
    /// means a thread's `poll()` call can only ever surface readiness for
    /// fds armed through its own registry, i.e. fds it owns.
    backend: Arc<MioBackend>,
    wakeup: Wakeup,
    last_heartbeat: Mutex<Instant>,
}

/// The multi-threaded event dispatch runtime. One instance per process;
/// construct via [`Runtime::init`].
pub struct Runtime {
    config: Config,
    pools: Arc<PoolRegistry>,
    fds: Arc<FdRegistry>,
    backqueues: Arc<BackQueueRegistry>,
    threads: Vec<Arc<LoopThreadState>>,
}

impl Runtime {
    /// Initialize global state: raise the open-file rlimit, build the
    /// default pool with `config.concurrency()` threads, and set up each
    /// thread's fd registry backend, timer heap, recurrent list, and wake
    /// channel. Does not start any threads; call [`Runtime::run`] on each
    /// thread that should become a loop thread.
    pub fn init(config: Config) -> Result<Runtime> {
        let raised = raise_rlim_nofiles(config.rlim_nofiles())?;
        debug!("rlim_nofiles raised to {raised}");

        let pools = Arc::new(PoolRegistry::new());
        let pool = pools.create_pool(DEFAULT_POOL, config.concurrency());
        pool.set_watchdog_timeout(config.watchdog_timeout());

        let fds = Arc::new(FdRegistry::new(raised as usize));
        let backqueues = Arc::new(BackQueueRegistry::new());

        let threads = pool
            .threads()
            .iter()
            .map(|&id| -> Result<Arc<LoopThreadState>> {
                backqueues.register(id);
                let backend = Arc::new(MioBackend::new(1024)?);
                let wakeup = Wakeup::register(backend.registry())
                    .expect("failed to register this thread's wake channel");
                Ok(Arc::new(LoopThreadState {
                    timers: Mutex::new(TimerHeap::new()),
                    recurrent: Mutex::new(RecurrentList::new()),
                    backend,
                    wakeup,
                    last_heartbeat: Mutex::new(Instant::now()),
                }))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Runtime { config, pools, fds, backqueues, threads })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn fds(&self) -> &Arc<FdRegistry> {
        &self.fds
    }

    pub fn default_pool(&self) -> Arc<Pool> {
        self.pools.default_pool()
    }

    /// The pool that owns `e`'s current thread, if it has one.
    pub fn pool_for_event(&self, e: &EventHandle) -> Option<Arc<Pool>> {
        self.pools.pool_for_thread(e.owner()?)
    }

    /// How long since loop thread `id` last completed a tick. An embedder's
    /// own watchdog compares this against `Pool::watchdog_timeout()` to
    /// detect a stalled thread; this crate publishes the heartbeat but
    /// deliberately does not abort the process itself, since that decision
    /// belongs to the embedding application, not a library.
    pub fn heartbeat_age(&self, id: ThreadId) -> Duration {
        self.threads[id.index()].last_heartbeat.lock().elapsed()
    }

    /// Schedule a TIMER event onto its owner thread's heap, waking that
    /// thread if it isn't the calling one.
    pub fn add_timed(&self, e: EventHandle) {
        let owner = e.owner().unwrap_or(ThreadId(0));
        let state = &self.threads[owner.index()];
        state.timers.lock().add_timed(e);
        if ThreadId::current() != Some(owner) {
            let _ = state.wakeup.wake();
        }
    }

    /// Add an event to its owner's recurrent list.
    pub fn add_recurrent(&self, e: EventHandle) {
        let owner = e.owner().unwrap_or(ThreadId(0));
        let state = &self.threads[owner.index()];
        state.recurrent.lock().add_recurrent(e);
    }

    /// Register an fd event, arming it against its owner thread's backend
    /// (defaulting to thread 0, matching [`Runtime::add_timed`]) and waking
    /// that thread if it's not the caller.
    pub fn add_fd(&self, e: EventHandle) -> Result<()> {
        let owner = e.owner().unwrap_or(ThreadId(0));
        let current = ThreadId::current();
        let backend = Arc::clone(&self.threads[owner.index()].backend) as Arc<dyn Backend>;
        let needs_wake = self.fds.add(e, backend, current)?;
        if needs_wake {
            let _ = self.threads[owner.index()].wakeup.wake();
        }
        Ok(())
    }

    /// Run the calling thread as loop thread `id` forever. Binds
    /// `ThreadId::current()` for the duration of the call.
    pub fn run(&self, id: ThreadId) -> Result<()> {
        id.bind_current();
        let state = &self.threads[id.index()];
        loop {
            self.tick(id, state)?;
        }
    }

    fn tick(&self, id: ThreadId, state: &LoopThreadState) -> Result<()> {
        let now = Instant::now();
        EPOCH.with(|e| e.set(Some(now)));

        state.timers.lock().dispatch_timed(now);

        let next = state.timers.lock().next_deadline();
        let timeout = match next {
            Some(deadline) => deadline.saturating_duration_since(now).min(MAX_SLEEPTIME),
            None => MAX_SLEEPTIME,
        };

        let readiness = state.backend.poll(Some(timeout))?;
        let wake_token = state.backend.wake_token();
        for ready in readiness {
            if ready.token == wake_token {
                trace!("thread {} woke via cross-thread signal", id.index());
                continue;
            }
            let fd = ready.token as i32;
            // trigger() requires the event already pulled from its slot;
            // an fd that's been removed since poll() returned just misses here.
            if let Ok(event) = self.fds.remove_fd(fd) {
                self.fds.set_executing(fd, Some(id));
                self.fds.trigger(event, ready.mask, Instant::now());
                self.fds.set_executing(fd, None);
            }
        }

        self.backqueues.drain(id, Instant::now());
        state.recurrent.lock().dispatch_recurrent(Instant::now());
        *state.last_heartbeat.lock() = Instant::now();

        trace!("thread {} tick complete", id.index());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Interest;

    #[test]
    fn init_builds_the_default_pool_at_configured_concurrency() {
        let config = Config::builder().concurrency(2).rlim_nofiles(256).build();
        let runtime = Runtime::init(config).expect("init");
        assert_eq!(runtime.default_pool().concurrency(), 2);
    }

    #[test]
    fn epoch_is_none_off_a_loop_thread() {
        assert_eq!(get_epoch(), None);
    }

    #[test]
    fn pool_for_event_is_none_for_an_event_with_no_owner() {
        let config = Config::builder().concurrency(2).rlim_nofiles(256).build();
        let runtime = Runtime::init(config).expect("init");
        let e = EventHandle::alloc(|_, _, _| Interest::NONE);
        assert!(runtime.pool_for_event(&e).is_none());
        e.deref();
    }
}
