//! Process-wide mapping between callback function identity and a
//! human-readable name, optionally augmented with a per-event describer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;

use parking_lot::RwLock;

use crate::event::{CallbackFn, EventHandle};

type Describer = fn(&EventHandle, &mut String);

#[derive(Clone, Copy)]
struct Registration {
    f: CallbackFn,
    name: &'static str,
    describer: Option<Describer>,
}

struct Registry {
    by_fn: HashMap<usize, Registration>,
    by_name: HashMap<&'static str, usize>,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            by_fn: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

static REGISTRY: RwLock<Option<Registry>> = RwLock::new(None);

fn with_registry<T>(f: impl FnOnce(&mut Registry) -> T) -> T {
    let mut guard = REGISTRY.write();
    if guard.is_none() {
        *guard = Some(Registry::new());
    }
    f(guard.as_mut().unwrap())
}

fn fn_key(f: CallbackFn) -> usize {
    f as usize
}

thread_local! {
    static SCRATCH: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Register a human-readable name for a callback function. Insert-only: a
/// second call with the same `(name, f)` pair is a no-op; a call with the
/// same name bound to a *different* function fails.
pub fn name_callback(name: &'static str, f: CallbackFn) -> crate::Result<()> {
    name_callback_ext(name, f, None)
}

/// Like [`name_callback`], additionally storing a describer invoked by
/// [`name_for_callback_e`] to render event-specific detail (e.g. "fd 7,
/// connected to 10.0.0.1:443").
pub fn name_callback_ext(
    name: &'static str,
    f: CallbackFn,
    describer: Option<Describer>,
) -> crate::Result<()> {
    with_registry(|reg| {
        let key = fn_key(f);
        if let Some(existing) = reg.by_name.get(name) {
            if *existing != key {
                return Err(crate::Error::Misuse(
                    "callback name already registered to a different function",
                ));
            }
            return Ok(());
        }
        reg.by_name.insert(name, key);
        reg.by_fn.insert(key, Registration { f, name, describer });
        Ok(())
    })
}

/// Look up the callback registered under `name`, if any.
pub fn callback_for_name(name: &str) -> Option<CallbackFn> {
    with_registry(|reg| {
        let key = *reg.by_name.get(name)?;
        reg.by_fn.get(&key).map(|r| r.f)
    })
}

/// Returns the registered name for `f`, or a synthetic `"fn@0x..."` string
/// if none was registered. The returned string is thread-local scratch,
/// valid only until the next call to `name_for_callback`/`name_for_callback_e`
/// on this thread — copy it if you need to retain it.
pub fn name_for_callback(f: CallbackFn) -> String {
    let key = fn_key(f);
    let name = with_registry(|reg| reg.by_fn.get(&key).map(|r| r.name));
    SCRATCH.with(|s| {
        let mut buf = s.borrow_mut();
        buf.clear();
        match name {
            Some(n) => buf.push_str(n),
            None => {
                let _ = write!(buf, "fn@{key:#x}");
            }
        }
        buf.clone()
    })
}

/// Like [`name_for_callback`], additionally invoking the registered
/// describer (if any) with `e` and appending its output.
pub fn name_for_callback_e(f: CallbackFn, e: &EventHandle) -> String {
    let key = fn_key(f);
    let found = with_registry(|reg| reg.by_fn.get(&key).map(|r| (r.name, r.describer)));

    let mut out = match found {
        Some((n, _)) => n.to_owned(),
        None => format!("fn@{key:#x}"),
    };
    if let Some((_, Some(describer))) = found {
        describer(e, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Interest;
    use std::time::Instant;

    fn cb_a(_e: &EventHandle, _mask: Interest, _now: Instant) -> Interest {
        Interest::NONE
    }

    fn cb_b(_e: &EventHandle, _mask: Interest, _now: Instant) -> Interest {
        Interest::NONE
    }

    #[test]
    fn register_and_lookup_roundtrips() {
        name_callback("evrt.test.cb_a", cb_a).unwrap();
        assert_eq!(name_for_callback(cb_a), "evrt.test.cb_a");
        assert_eq!(callback_for_name("evrt.test.cb_a"), Some(cb_a as CallbackFn));
    }

    #[test]
    fn duplicate_name_same_fn_is_idempotent() {
        name_callback("evrt.test.idempotent", cb_a).unwrap();
        assert!(name_callback("evrt.test.idempotent", cb_a).is_ok());
    }

    #[test]
    fn duplicate_name_different_fn_fails() {
        name_callback("evrt.test.conflict", cb_a).unwrap();
        let err = name_callback("evrt.test.conflict", cb_b).unwrap_err();
        assert!(matches!(err, crate::Error::Misuse(_)));
    }

    #[test]
    fn unregistered_callback_gets_synthetic_name() {
        fn cb_c(_e: &EventHandle, _mask: Interest, _now: Instant) -> Interest {
            Interest::NONE
        }
        let name = name_for_callback(cb_c);
        assert!(name.starts_with("fn@0x"));
    }

    #[test]
    fn describer_is_appended_for_name_for_callback_e() {
        fn describe(_e: &EventHandle, out: &mut String) {
            out.push_str(" [described]");
        }
        fn cb_d(_e: &EventHandle, _mask: Interest, _now: Instant) -> Interest {
            Interest::NONE
        }
        name_callback_ext("evrt.test.cb_d", cb_d, Some(describe)).unwrap();
        let e = EventHandle::alloc(cb_d);
        assert_eq!(name_for_callback_e(cb_d, &e), "evrt.test.cb_d [described]");
        e.deref();
    }
}
