//! The event record: the universal scheduling unit, reference-counted and
//! shareable across loop threads.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::mask::Interest;
use crate::pool::ThreadId;

/// Global allocation counters. Atomic, process-wide, matching the source
/// project's `eventer_allocations_current`/`eventer_allocations_total`.
static ALLOCATIONS_CURRENT: AtomicI64 = AtomicI64::new(0);
static ALLOCATIONS_TOTAL: AtomicI64 = AtomicI64::new(0);

/// Number of events currently live (allocated but not yet fully derefed).
pub fn allocations_current() -> i64 {
    ALLOCATIONS_CURRENT.load(Ordering::Relaxed)
}

/// Number of events ever allocated over the life of the process. Monotonically
/// non-decreasing.
pub fn allocations_total() -> i64 {
    ALLOCATIONS_TOTAL.load(Ordering::Relaxed)
}

/// A callback invoked with `(event, mask, now)` returning the mask the event
/// should be re-armed with; a return of [`Interest::NONE`] means "remove me".
///
/// The source project passes `callback` and `closure` as two separate
/// fields (a function pointer plus an opaque `void *`). In idiomatic Rust
/// those collapse naturally onto a boxed `FnMut`'s code pointer and captured
/// environment — except the callback *name registry* (§4.2) keys on
/// callback identity across many events that share a function but differ in
/// closure, which a boxed closure can't give us. So, like the source, we
/// keep them separate: `CallbackFn` is a plain `fn` pointer (comparable,
/// nameable), and [`Closure`] is the per-event opaque payload.
pub type CallbackFn = fn(&EventHandle, Interest, Instant) -> Interest;

/// Opaque per-event user data, downcast by the callback that owns it.
pub type Closure = Box<dyn Any + Send>;

/// Accept/read/write/close vtable used by fd-event callbacks instead of raw
/// syscalls, so the transport (plain socket vs. TLS) is pluggable.
///
/// On would-block, implementations write the interest bits needed to make
/// progress into `out_mask` and return [`crate::Error::WouldBlock`].
pub trait FdOps: Send + Sync {
    fn accept(&self, fd: i32, out_mask: &mut Interest) -> crate::Result<i32>;
    fn read(&self, fd: i32, buf: &mut [u8], out_mask: &mut Interest) -> crate::Result<usize>;
    fn write(&self, fd: i32, buf: &[u8], out_mask: &mut Interest) -> crate::Result<usize>;
    fn close(&self, fd: i32, out_mask: &mut Interest) -> crate::Result<()>;
    fn name(&self) -> &'static str;
}

/// The default fd-ops implementation for plain (non-TLS) sockets and pipes.
/// Mirrors the source project's POSIX fd opset.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixFdOps;

impl FdOps for PosixFdOps {
    fn accept(&self, fd: i32, out_mask: &mut Interest) -> crate::Result<i32> {
        #[cfg(unix)]
        {
            let r = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    *out_mask = Interest::READ;
                    return Err(crate::Error::WouldBlock);
                }
                return Err(crate::Error::BackendFailure { fd, source: err });
            }
            Ok(r)
        }
        #[cfg(not(unix))]
        {
            let _ = (fd, out_mask);
            unimplemented!("PosixFdOps::accept is only implemented on unix")
        }
    }

    fn read(&self, fd: i32, buf: &mut [u8], out_mask: &mut Interest) -> crate::Result<usize> {
        #[cfg(unix)]
        {
            let r = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    *out_mask = Interest::READ;
                    return Err(crate::Error::WouldBlock);
                }
                return Err(crate::Error::BackendFailure { fd, source: err });
            }
            Ok(r as usize)
        }
        #[cfg(not(unix))]
        {
            let _ = (fd, buf, out_mask);
            unimplemented!("PosixFdOps::read is only implemented on unix")
        }
    }

    fn write(&self, fd: i32, buf: &[u8], out_mask: &mut Interest) -> crate::Result<usize> {
        #[cfg(unix)]
        {
            let r = unsafe {
                libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    *out_mask = Interest::WRITE;
                    return Err(crate::Error::WouldBlock);
                }
                return Err(crate::Error::BackendFailure { fd, source: err });
            }
            Ok(r as usize)
        }
        #[cfg(not(unix))]
        {
            let _ = (fd, buf, out_mask);
            unimplemented!("PosixFdOps::write is only implemented on unix")
        }
    }

    fn close(&self, fd: i32, _out_mask: &mut Interest) -> crate::Result<()> {
        #[cfg(unix)]
        {
            let r = unsafe { libc::close(fd) };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                return Err(crate::Error::BackendFailure { fd, source: err });
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = fd;
            unimplemented!("PosixFdOps::close is only implemented on unix")
        }
    }

    fn name(&self) -> &'static str {
        "posix"
    }
}

const NO_OWNER: usize = usize::MAX;

struct EventInner {
    callback: CallbackFn,
    closure: Mutex<Option<Closure>>,
    mask: AtomicU32,
    fd: i32,
    whence: Mutex<Instant>,
    owner: AtomicUsize,
    fd_ops: Option<Arc<dyn FdOps>>,
    ops_ctx: Mutex<Option<Box<dyn Any + Send>>>,
    logical_refs: AtomicI64,
    /// Index into the owning timer heap's backing vec, `usize::MAX` when not
    /// resident in a heap. Lets `remove_timed` run in O(log n) instead of a
    /// linear scan when the caller already knows roughly where it lives.
    heap_index: AtomicUsize,
}

/// A reference-counted handle to an [`EventInner`].
///
/// `alloc()` returns a handle with a logical refcount of 1. Cloning this
/// handle (via [`EventHandle::ref_`]) is how the source project's
/// `eventer_ref` publishes a pointer to a second thread; [`EventHandle::deref`]
/// is `eventer_deref`. The underlying allocation is an `Arc`, so memory is
/// actually freed once the last clone drops — the `logical_refs` counter
/// exists purely to make the C-style ref/deref contract (and its "refcount
/// underflow is a bug" invariant) observable and enforceable in its own
/// right, independent of `Arc`'s bookkeeping.
pub struct EventHandle(Arc<EventInner>);

impl Clone for EventHandle {
    /// Clones the handle *without* touching the logical refcount. Internal
    /// bookkeeping (e.g. handing a handle to a registry slot) uses this;
    /// user code that is establishing a new independent holder across
    /// threads should call [`EventHandle::ref_`] instead.
    fn clone(&self) -> EventHandle {
        EventHandle(Arc::clone(&self.0))
    }
}

impl EventHandle {
    /// Allocate a new event, attached to the calling thread, with a logical
    /// refcount of 1.
    pub fn alloc(callback: CallbackFn) -> EventHandle {
        ALLOCATIONS_CURRENT.fetch_add(1, Ordering::Relaxed);
        ALLOCATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
        EventHandle(Arc::new(EventInner {
            callback,
            closure: Mutex::new(None),
            mask: AtomicU32::new(0),
            fd: -1,
            whence: Mutex::new(Instant::now()),
            owner: AtomicUsize::new(ThreadId::current().map(|t| t.0).unwrap_or(NO_OWNER)),
            fd_ops: None,
            ops_ctx: Mutex::new(None),
            logical_refs: AtomicI64::new(1),
            heap_index: AtomicUsize::new(usize::MAX),
        }))
    }

    /// Add a reference. Returns a new handle for the new holder (e.g. to
    /// hand to another thread before publishing the fd/pointer there).
    pub fn ref_(&self) -> EventHandle {
        let prev = self.0.logical_refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "ref() on an event with non-positive refcount");
        self.clone()
    }

    /// Release a reference. Consumes this handle; once the logical refcount
    /// reaches zero the allocation counter is decremented. The underlying
    /// `Arc` frees the memory once the *last* clone (logical or internal)
    /// is dropped, which callers that follow the ref/deref discipline reach
    /// at the same moment.
    pub fn deref(self) {
        let prev = self.0.logical_refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "refcount underflow: deref() called too many times");
        if prev == 1 {
            ALLOCATIONS_CURRENT.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Current logical refcount. For tests/diagnostics only.
    pub fn refcount(&self) -> i64 {
        self.0.logical_refs.load(Ordering::Acquire)
    }

    pub fn mask(&self) -> Interest {
        Interest::from_bits(self.0.mask.load(Ordering::Acquire))
    }

    pub fn set_mask(&self, mask: Interest) {
        self.0.mask.store(mask.bits(), Ordering::Release);
    }

    pub fn fd(&self) -> i32 {
        self.0.fd
    }

    /// Only settable at construction via [`EventHandle::with_fd`]; fd events
    /// are otherwise immutable in identity (one event per live fd, per the
    /// registry invariant).
    pub fn with_fd(self, fd: i32) -> EventHandle {
        // `fd` isn't atomic, so rebuild the allocation rather than mutate it
        // through a shared `Arc`. Intended to be called once, immediately
        // after `alloc`, before the handle is shared anywhere.
        let inner = &*self.0;
        let new = EventHandle(Arc::new(EventInner {
            callback: inner.callback,
            closure: Mutex::new(inner.closure.lock().take()),
            mask: AtomicU32::new(inner.mask.load(Ordering::Acquire)),
            fd,
            whence: Mutex::new(*inner.whence.lock()),
            owner: AtomicUsize::new(inner.owner.load(Ordering::Acquire)),
            fd_ops: inner.fd_ops.clone(),
            ops_ctx: Mutex::new(inner.ops_ctx.lock().take()),
            logical_refs: AtomicI64::new(inner.logical_refs.load(Ordering::Acquire)),
            heap_index: AtomicUsize::new(usize::MAX),
        }));
        new
    }

    pub fn with_fd_ops(self, ops: Arc<dyn FdOps>) -> EventHandle {
        let inner = &*self.0;
        EventHandle(Arc::new(EventInner {
            callback: inner.callback,
            closure: Mutex::new(inner.closure.lock().take()),
            mask: AtomicU32::new(inner.mask.load(Ordering::Acquire)),
            fd: inner.fd,
            whence: Mutex::new(*inner.whence.lock()),
            owner: AtomicUsize::new(inner.owner.load(Ordering::Acquire)),
            fd_ops: Some(ops),
            ops_ctx: Mutex::new(inner.ops_ctx.lock().take()),
            logical_refs: AtomicI64::new(inner.logical_refs.load(Ordering::Acquire)),
            heap_index: AtomicUsize::new(usize::MAX),
        }))
    }

    pub fn fd_ops(&self) -> Option<&Arc<dyn FdOps>> {
        self.0.fd_ops.as_ref()
    }

    pub fn whence(&self) -> Instant {
        *self.0.whence.lock()
    }

    pub fn set_whence(&self, whence: Instant) {
        *self.0.whence.lock() = whence;
    }

    pub fn owner(&self) -> Option<ThreadId> {
        let raw = self.0.owner.load(Ordering::Acquire);
        if raw == NO_OWNER {
            None
        } else {
            Some(ThreadId(raw))
        }
    }

    pub fn set_owner(&self, owner: ThreadId) {
        self.0.owner.store(owner.0, Ordering::Release);
    }

    pub fn set_closure(&self, closure: Closure) {
        *self.0.closure.lock() = Some(closure);
    }

    pub fn with_closure(&self, f: impl FnOnce(Option<&mut Closure>)) {
        f(self.0.closure.lock().as_mut())
    }

    pub(crate) fn heap_index(&self) -> usize {
        self.0.heap_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_heap_index(&self, idx: usize) {
        self.0.heap_index.store(idx, Ordering::Release);
    }

    /// Invoke the callback, returning the mask it reports.
    pub fn invoke(&self, mask: Interest, now: Instant) -> Interest {
        (self.0.callback)(self, mask, now)
    }

    /// Identity comparison: two handles refer to the same underlying event
    /// iff they point at the same allocation.
    pub fn ptr_eq(a: &EventHandle, b: &EventHandle) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// The callback's function-pointer identity, as used by the name
    /// registry (§4.2).
    pub fn callback_fn(&self) -> CallbackFn {
        self.0.callback
    }

    /// Whether the calling thread is this event's declared owner. Intended
    /// for debug assertions inside callback bodies that must never run off
    /// their owner thread.
    pub fn thread_check(&self) -> bool {
        ThreadId::current().is_some() && ThreadId::current() == self.owner()
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("fd", &self.0.fd)
            .field("mask", &self.mask())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Build an unregistered TIMER event firing at an absolute deadline.
/// Source-derived convenience (`eventer_at`); does not schedule the event —
/// the caller still calls `add`/`add_timed`.
pub fn at(callback: CallbackFn, closure: Closure, whence: Instant) -> EventHandle {
    let e = EventHandle::alloc(callback);
    e.set_mask(Interest::TIMER);
    e.set_whence(whence);
    e.set_closure(closure);
    e
}

/// Build an unregistered TIMER event firing `delay` from now. Source-derived
/// convenience (`eventer_in`).
pub fn in_(callback: CallbackFn, closure: Closure, delay: Duration) -> EventHandle {
    at(callback, closure, Instant::now() + delay)
}

/// Build an unregistered TIMER event firing `secs` seconds and `micros`
/// microseconds from now. Source-derived convenience (`eventer_in_s_us`),
/// preserved as a `Duration`-taking overload of [`in_`] for API symmetry.
pub fn in_s_us(callback: CallbackFn, closure: Closure, secs: u64, micros: u64) -> EventHandle {
    in_(callback, closure, Duration::new(secs, 0) + Duration::from_micros(micros))
}
