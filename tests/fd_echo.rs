#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use evrt::{Backend, EventHandle, FdRegistry, Interest, MioBackend, PosixFdOps};

fn echo_cb(e: &EventHandle, mask: Interest, _now: Instant) -> Interest {
    if !mask.contains(Interest::READ) {
        return Interest::READ;
    }
    let mut buf = [0u8; 64];
    let mut out_mask = Interest::NONE;
    let ops = e.fd_ops().expect("fd ops attached");
    match ops.read(e.fd(), &mut buf, &mut out_mask) {
        Ok(n) if n > 0 => {
            let _ = ops.write(e.fd(), &buf[..n], &mut out_mask);
        }
        _ => {}
    }
    Interest::READ
}

#[test]
fn echoed_bytes_come_back_before_the_one_second_deadline() {
    let mut fds = [0i32; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "socketpair failed");
    let [a, b] = fds;

    let mio_backend = Arc::new(MioBackend::new(8).expect("backend"));
    let registry = FdRegistry::new(64);

    let e = EventHandle::alloc(echo_cb).with_fd(a).with_fd_ops(Arc::new(PosixFdOps));
    e.set_mask(Interest::READ);
    registry
        .add(e, Arc::clone(&mio_backend) as Arc<dyn Backend>, None)
        .expect("register fd a");

    let ping = b"ping";
    let n = unsafe { libc::write(b, ping.as_ptr() as *const libc::c_void, ping.len()) };
    assert_eq!(n as usize, ping.len());

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut got = [0u8; 4];
    let mut received = false;
    while Instant::now() < deadline {
        let readiness = mio_backend.poll(Some(Duration::from_millis(50))).expect("poll");
        for r in readiness {
            if let Ok(ev) = registry.remove_fd(a) {
                registry.trigger(ev, r.mask, Instant::now());
            }
        }
        let n = unsafe { libc::read(b, got.as_mut_ptr() as *mut libc::c_void, got.len()) };
        if n == 4 {
            received = true;
            break;
        }
    }

    unsafe {
        libc::close(b);
    }
    registry.remove_fd(a).map(|e| e.deref()).ok();

    assert!(received, "did not receive echoed bytes within 1s");
    assert_eq!(&got, ping);
}
