//! Named groups of peer loop threads, and the deterministic owner-selection
//! policy that spreads thread-unsafe vs. thread-safe workloads across them.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

pub const DEFAULT_POOL: &str = "default";

/// A loop thread's identity, unique across every pool in a [`crate::Runtime`].
/// `ThreadId`s are small dense indices assigned in spawn order, not
/// [`std::thread::ThreadId`] — the latter has no ordering we can use for
/// `choose_owner`'s "thread 1 + (n-1) mod (concurrency-1)" arithmetic.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub(crate) usize);

thread_local! {
    static CURRENT: Cell<Option<usize>> = const { Cell::new(None) };
}

impl ThreadId {
    /// The `ThreadId` of the calling thread, if it is a loop thread.
    pub fn current() -> Option<ThreadId> {
        CURRENT.with(|c| c.get()).map(ThreadId)
    }

    /// Bind the calling thread to this id. Called once by the runtime when
    /// a loop thread starts; never called by user code.
    pub(crate) fn bind_current(self) {
        CURRENT.with(|c| c.set(Some(self.0)));
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// A named group of peer loop threads.
#[derive(Debug)]
pub struct Pool {
    name: String,
    threads: Vec<ThreadId>,
    watchdog_timeout: RwLock<Duration>,
}

impl Pool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.threads.len()
    }

    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    pub fn watchdog_timeout(&self) -> Duration {
        *self.watchdog_timeout.read()
    }

    pub fn set_watchdog_timeout(&self, timeout: Duration) {
        *self.watchdog_timeout.write() = timeout;
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains(&id)
    }

    /// Choose a thread within this pool by `n mod concurrency`. For the
    /// default pool, prefer [`PoolRegistry::choose_owner`] instead, which
    /// applies the thread-0-is-reserved carve-out.
    pub fn choose_owner_pool(&self, n: i64) -> ThreadId {
        assert!(!self.threads.is_empty(), "pool {} has no threads", self.name);
        let c = self.threads.len() as i64;
        let idx = n.rem_euclid(c) as usize;
        self.threads[idx]
    }
}

/// Process-wide registry of named pools, plus the next-id counter used to
/// assign dense [`ThreadId`]s as pools are built.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    next_id: AtomicUsize,
}

impl Default for PoolRegistry {
    fn default() -> PoolRegistry {
        PoolRegistry {
            pools: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl PoolRegistry {
    pub fn new() -> PoolRegistry {
        PoolRegistry::default()
    }

    /// Create and register a pool with `concurrency` freshly-allocated
    /// thread ids. Fails (by panicking, it's a startup-time programmer
    /// error) if the name is already registered.
    pub fn create_pool(&self, name: &str, concurrency: usize) -> Arc<Pool> {
        assert!(concurrency > 0, "pool {name} must have at least one thread");
        let threads: Vec<ThreadId> = (0..concurrency)
            .map(|_| ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed)))
            .collect();
        let pool = Arc::new(Pool {
            name: name.to_owned(),
            threads,
            watchdog_timeout: RwLock::new(Duration::from_secs(0)),
        });
        let mut pools = self.pools.write();
        assert!(
            pools.insert(name.to_owned(), Arc::clone(&pool)).is_none(),
            "pool {name} already registered"
        );
        pool
    }

    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(name).cloned()
    }

    pub fn default_pool(&self) -> Arc<Pool> {
        self.pool(DEFAULT_POOL)
            .expect("default pool not initialized; call Runtime::init first")
    }

    /// `choose_owner(n)`: if the default pool has concurrency 1, always
    /// return that thread. Otherwise `n == 0` returns thread 0 (reserved for
    /// thread-unsafe workloads); any other `n` is spread across threads
    /// `1..concurrency` via `1 + ((n - 1) mod (concurrency - 1))`.
    pub fn choose_owner(&self, n: i64) -> ThreadId {
        let pool = self.default_pool();
        let c = pool.concurrency();
        if c == 1 {
            return pool.threads()[0];
        }
        if n == 0 {
            return pool.threads()[0];
        }
        let idx = 1 + ((n - 1).rem_euclid((c - 1) as i64)) as usize;
        pool.threads()[idx]
    }

    pub fn choose_owner_pool(&self, pool: &Pool, n: i64) -> ThreadId {
        pool.choose_owner_pool(n)
    }

    /// Total thread count of the default pool.
    pub fn loop_concurrency(&self) -> usize {
        self.default_pool().concurrency()
    }

    /// Whether `id` participates in the loop of *any* registered pool.
    pub fn is_loop(&self, id: ThreadId) -> bool {
        self.pools.read().values().any(|p| p.contains(id))
    }

    /// The pool that owns a given thread, if any.
    pub fn pool_for_thread(&self, id: ThreadId) -> Option<Arc<Pool>> {
        self.pools.read().values().find(|p| p.contains(id)).cloned()
    }

    pub fn all_threads(&self) -> Vec<ThreadId> {
        self.pools
            .read()
            .values()
            .flat_map(|p| p.threads().to_vec())
            .collect()
    }
}

/// Advisory CPU topology probe, used only to pick a sane default
/// concurrency when the caller doesn't configure one explicitly.
/// Source-derived (`eventer_cpu_sockets_and_cores`); this crate has no way
/// to tell sockets from cores portably, so both are approximated from
/// [`std::thread::available_parallelism`].
pub fn cpu_sockets_and_cores() -> (usize, usize) {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (1, cores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_owner_zero_is_always_thread_zero() {
        let reg = PoolRegistry::new();
        reg.create_pool(DEFAULT_POOL, 4);
        assert_eq!(reg.choose_owner(0), ThreadId(0));
    }

    #[test]
    fn choose_owner_spreads_nonzero_across_non_reserved_threads() {
        let reg = PoolRegistry::new();
        reg.create_pool(DEFAULT_POOL, 4);
        for n in 1..=20i64 {
            let t = reg.choose_owner(n);
            assert!(t.index() >= 1 && t.index() <= 3, "n={n} chose {t:?}");
        }
    }

    #[test]
    fn choose_owner_single_thread_pool_always_returns_it() {
        let reg = PoolRegistry::new();
        reg.create_pool(DEFAULT_POOL, 1);
        for n in 0..5i64 {
            assert_eq!(reg.choose_owner(n), ThreadId(0));
        }
    }

    #[test]
    fn choose_owner_pool_is_plain_modulo() {
        let reg = PoolRegistry::new();
        let p = reg.create_pool("workers", 3);
        assert_eq!(p.choose_owner_pool(0).index() % 3, p.threads()[0].index() % 3);
        let a = p.choose_owner_pool(5);
        let b = p.choose_owner_pool(5);
        assert_eq!(a, b);
    }

    #[test]
    fn is_loop_reflects_pool_membership() {
        let reg = PoolRegistry::new();
        let p = reg.create_pool(DEFAULT_POOL, 2);
        assert!(reg.is_loop(p.threads()[0]));
        assert!(!reg.is_loop(ThreadId(9999)));
    }
}
