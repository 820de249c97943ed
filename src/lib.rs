//! Multi-threaded, multiplexed I/O and timer scheduler for network service
//! hot paths: a fixed pool of loop threads, each running fd readiness,
//! timers, recurrent housekeeping, and asynch job completions through a
//! single tick body.

pub use callback_registry::{
    callback_for_name, name_callback, name_callback_ext, name_for_callback, name_for_callback_e,
};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, NotFoundKind, Result};
pub use event::{
    allocations_current, allocations_total, at, in_, in_s_us, CallbackFn, Closure, EventHandle,
    FdOps, PosixFdOps,
};
pub use fdreg::{Backend, FdRegistry, MioBackend, Readiness};
pub use jobqueue::{default_backq, BackQueueHandle, BackQueueRegistry, JobHandle, JobQueue};
pub use mask::Interest;
pub use pool::{cpu_sockets_and_cores, Pool, PoolRegistry, ThreadId, DEFAULT_POOL};
pub use recurrent::RecurrentList;
pub use runtime::{get_epoch, Runtime};
pub use timer::TimerHeap;
pub use wakeup::{Wakeup, WakeupHandle, WAKE_TOKEN};

mod callback_registry;
mod config;
mod error;
mod event;
mod fdreg;
mod jobqueue;
mod mask;
mod pool;
mod recurrent;
mod runtime;
mod timer;
mod wakeup;
