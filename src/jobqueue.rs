//! Named worker pools that run blocking (ASYNCH_WORK) bodies off the loop
//! threads, then route completion (ASYNCH_CLEANUP) back onto a specific
//! loop thread via a back-queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;

use crate::event::EventHandle;
use crate::mask::Interest;
use crate::pool::ThreadId;

struct Job {
    event: EventHandle,
    cancel: Arc<AtomicU32>,
}

/// A cooperative-cancellation token returned by [`JobQueue::add_asynch`].
/// Dropping it has no effect; cancellation only happens via an explicit call.
#[derive(Clone)]
pub struct JobHandle {
    cancel: Arc<AtomicU32>,
}

impl JobHandle {
    /// Request cancellation with the given policy
    /// ([`Interest::CANCEL_DEFERRED`] or [`Interest::CANCEL_ASYNCH`]). A
    /// worker observes this the next time it checks the job, cooperatively —
    /// there is no preemption of a job already running its WORK body.
    pub fn cancel(&self, policy: Interest) {
        self.cancel.fetch_or(policy.bits(), Ordering::AcqRel);
    }
}

/// Per-loop-thread queue of completed jobs awaiting their CLEANUP callback.
struct BackQueue {
    sender: Sender<(EventHandle, Interest)>,
    receiver: Receiver<(EventHandle, Interest)>,
}

/// A cloneable handle other threads (job workers) use to post a completion
/// back to a specific loop thread without holding a reference to its state.
#[derive(Clone)]
pub struct BackQueueHandle {
    sender: Sender<(EventHandle, Interest)>,
}

impl BackQueueHandle {
    fn push(&self, event: EventHandle, mask: Interest) {
        // An unbounded channel only errs if every receiver was dropped,
        // which happens when the owning loop thread has shut down; in that
        // case the event is leaked deliberately rather than double-derefed
        // from two different threads.
        let _ = self.sender.send((event, mask));
    }
}

/// Process-wide registry of per-thread back-queues, and the "submitting
/// thread" fallback used when a job has no explicit owner.
#[derive(Default)]
pub struct BackQueueRegistry {
    queues: RwLock<HashMap<ThreadId, BackQueue>>,
}

impl BackQueueRegistry {
    pub fn new() -> BackQueueRegistry {
        BackQueueRegistry::default()
    }

    /// Register a back-queue for `thread`. Called once by the runtime when
    /// a loop thread starts.
    pub fn register(&self, thread: ThreadId) {
        let (sender, receiver) = unbounded();
        self.queues.write().insert(thread, BackQueue { sender, receiver });
    }

    pub fn handle(&self, thread: ThreadId) -> Option<BackQueueHandle> {
        self.queues.read().get(&thread).map(|q| BackQueueHandle { sender: q.sender.clone() })
    }

    /// Drain and invoke every completed job queued for `thread`, in FIFO
    /// order. Each callback runs with `ASYNCH_CLEANUP` (and any cancellation
    /// bits set on the job); its return value is discarded and the event is
    /// derefed, matching the worker-side logical reference handed off at
    /// submission.
    pub fn drain(&self, thread: ThreadId, now: Instant) {
        let items: Vec<(EventHandle, Interest)> = {
            let queues = self.queues.read();
            match queues.get(&thread) {
                Some(q) => q.receiver.try_iter().collect(),
                None => return,
            }
        };
        for (event, mask) in items {
            let _ = event.invoke(mask, now);
            event.deref();
        }
    }
}

/// Default back-queue owner for a freshly-submitted event: its own `owner()`
/// if set, otherwise the calling thread.
pub fn default_backq(e: &EventHandle) -> Option<ThreadId> {
    e.owner().or_else(ThreadId::current)
}

/// A named worker pool with a FIFO of pending ASYNCH_WORK events.
pub struct JobQueue {
    name: String,
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Spawn `workers` worker threads draining a shared FIFO, routing
    /// completions through `backqueues`.
    pub fn new(name: &str, workers: usize, backqueues: Arc<BackQueueRegistry>) -> JobQueue {
        assert!(workers > 0, "job queue {name} needs at least one worker");
        let (sender, receiver) = unbounded::<Job>();
        let handles = (0..workers)
            .map(|i| {
                let receiver = receiver.clone();
                let backqueues = Arc::clone(&backqueues);
                let thread_name = format!("evrt-jobq-{name}-{i}");
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || worker_loop(receiver, backqueues))
                    .expect("failed to spawn job queue worker")
            })
            .collect();
        JobQueue { name: name.to_owned(), sender, workers: handles }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit `e` for asynchronous execution. `e.mask()` must include
    /// `ASYNCH_WORK`, matching spec §4.6's submission precondition. Consumes
    /// `e`'s logical reference either way; on failure the reference is
    /// released here rather than handed back to the caller.
    pub fn add_asynch(&self, e: EventHandle) -> crate::Result<JobHandle> {
        if !e.mask().contains(Interest::ASYNCH_WORK) {
            e.deref();
            return Err(crate::Error::Misuse("add_asynch requires ASYNCH_WORK in the event's mask"));
        }
        let cancel = Arc::new(AtomicU32::new(0));
        let job = Job { event: e, cancel: Arc::clone(&cancel) };
        if let Err(err) = self.sender.send(job) {
            err.0.event.deref();
            return Err(crate::Error::Misuse("job queue has been shut down"));
        }
        Ok(JobHandle { cancel })
    }

    /// Shut the queue down with the `EVIL_BRUTAL` policy: stop accepting new
    /// jobs and let workers exit on their next channel read. Jobs still
    /// sitting in the channel when it disconnects are dropped without
    /// running WORK or CLEANUP — this is the only shutdown policy available
    /// since Rust gives no safe way to preempt a thread mid-job; cooperative
    /// `CANCEL_DEFERRED`/`CANCEL_ASYNCH` are per-job, not queue-wide.
    pub fn shutdown(self) {
        drop(self.sender);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: Receiver<Job>, backqueues: Arc<BackQueueRegistry>) {
    while let Ok(job) = receiver.recv() {
        let cancel_bits = job.cancel.load(Ordering::Acquire);
        let skip_work = Interest::from_bits(cancel_bits).contains(Interest::CANCEL_ASYNCH);
        if !skip_work {
            let now = Instant::now();
            let _ = job.event.invoke(Interest::ASYNCH_WORK, now);
        }

        let cancel_bits = job.cancel.load(Ordering::Acquire);
        let cleanup_mask = Interest::ASYNCH_CLEANUP | Interest::from_bits(cancel_bits);
        let owner = default_backq(&job.event).unwrap_or(ThreadId(0));
        match backqueues.handle(owner) {
            Some(handle) => handle.push(job.event, cleanup_mask),
            None => {
                // Owner thread never registered a back-queue (already shut
                // down); run CLEANUP inline so the event is still derefed.
                let _ = job.event.invoke(cleanup_mask, Instant::now());
                job.event.deref();
            }
        }
    }
}
