//! C ABI exports for hosts that are not written in Rust.
//!
//! All functions are `#[no_mangle] pub extern "C"` and use only FFI-safe types.
//! The loop is an opaque pointer owned by the caller between
//! `hostloop_create` and `hostloop_destroy`.

use std::ffi::c_void;
use std::ptr;

use crate::{EventLoop, Interest, LoopConfig};

/// Message callback: runs once on the loop thread.
pub type HostloopCallback = extern "C" fn(user_data: *mut c_void);

/// Descriptor callback: runs on the loop thread whenever `fd` is ready.
pub type HostloopFdCallback = extern "C" fn(fd: i32, user_data: *mut c_void);

/// Caller-owned pointer carried across threads. The caller promises that
/// whatever it points to may be used from the loop thread.
struct UserData(*mut c_void);

unsafe impl Send for UserData {}

impl UserData {
    // Accessed through a method so closures capture the whole (Send) wrapper
    // rather than the raw pointer field.
    fn get(&self) -> *mut c_void {
        self.0
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// Create a loop owned by the calling thread. Returns null on failure.
/// `install_interrupt_handler`: 1 = capture SIGINT (standalone apps), 0 = leave
/// signals to the host.
#[no_mangle]
pub extern "C" fn hostloop_create(install_interrupt_handler: u8) -> *mut EventLoop {
    let config = LoopConfig::new().install_interrupt_handler(install_interrupt_handler != 0);
    match EventLoop::create(config) {
        Ok(event_loop) => Box::into_raw(Box::new(event_loop)),
        Err(err) => {
            tracing::error!(message = "hostloop_create failed", %err);
            ptr::null_mut()
        }
    }
}

/// Shut down and free a loop. Null is ignored.
///
/// # Safety
///
/// `event_loop` must come from `hostloop_create` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn hostloop_destroy(event_loop: *mut EventLoop) {
    if event_loop.is_null() {
        return;
    }
    Box::from_raw(event_loop).shutdown();
}

// ── Cross-thread ────────────────────────────────────────────────────

/// Queue `callback(user_data)` on the loop thread. Returns 1 if accepted,
/// 0 if the loop is null or shutting down.
///
/// # Safety
///
/// `event_loop` must be null or a live pointer from `hostloop_create`.
#[no_mangle]
pub unsafe extern "C" fn hostloop_post(
    event_loop: *const EventLoop,
    callback: HostloopCallback,
    user_data: *mut c_void,
) -> u8 {
    let Some(event_loop) = event_loop.as_ref() else {
        return 0;
    };
    let user_data = UserData(user_data);
    u8::from(event_loop.post(move || callback(user_data.get())))
}

/// Register `callback` for `fd`. `mask` bits: 1 = readable, 2 = writable,
/// 4 = error. Returns 0 = ok, -1 = null loop.
///
/// # Safety
///
/// `event_loop` must be null or a live pointer from `hostloop_create`.
#[no_mangle]
pub unsafe extern "C" fn hostloop_register_fd(
    event_loop: *const EventLoop,
    fd: i32,
    mask: u8,
    callback: HostloopFdCallback,
    user_data: *mut c_void,
) -> i32 {
    let Some(event_loop) = event_loop.as_ref() else {
        return -1;
    };
    let user_data = UserData(user_data);
    event_loop.register_fd_callback(fd, Interest::from_bits(mask), move |fd| {
        callback(fd, user_data.get());
    });
    0
}

/// Remove the registration for `fd`. Unknown descriptors are a no-op.
/// Returns 0 = ok, -1 = null loop.
///
/// # Safety
///
/// `event_loop` must be null or a live pointer from `hostloop_create`.
#[no_mangle]
pub unsafe extern "C" fn hostloop_unregister_fd(event_loop: *const EventLoop, fd: i32) -> i32 {
    let Some(event_loop) = event_loop.as_ref() else {
        return -1;
    };
    event_loop.unregister_fd_callback(fd);
    0
}

/// Ask the host to quit. Returns 0 = ok, -1 = null loop.
///
/// # Safety
///
/// `event_loop` must be null or a live pointer from `hostloop_create`.
#[no_mangle]
pub unsafe extern "C" fn hostloop_request_quit(event_loop: *const EventLoop) -> i32 {
    let Some(event_loop) = event_loop.as_ref() else {
        return -1;
    };
    event_loop.request_quit();
    0
}

// ── Loop thread ─────────────────────────────────────────────────────

/// Pump the loop once. Returns 1 = dispatched something, 0 = idle or quit
/// requested, -1 = error (null loop, wrong thread, poll failure).
///
/// # Safety
///
/// `event_loop` must be null or a live pointer from `hostloop_create`.
#[no_mangle]
pub unsafe extern "C" fn hostloop_dispatch_next(
    event_loop: *const EventLoop,
    return_if_idle: u8,
) -> i32 {
    let Some(event_loop) = event_loop.as_ref() else {
        return -1;
    };
    match event_loop.dispatch_next(return_if_idle != 0) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(err) => {
            tracing::error!(message = "hostloop_dispatch_next failed", %err);
            -1
        }
    }
}

/// Returns 1 once a quit has been requested (by SIGINT or
/// `hostloop_request_quit`), 0 otherwise or for a null loop.
///
/// # Safety
///
/// `event_loop` must be null or a live pointer from `hostloop_create`.
#[no_mangle]
pub unsafe extern "C" fn hostloop_is_quit_requested(event_loop: *const EventLoop) -> u8 {
    event_loop
        .as_ref()
        .map_or(0, |event_loop| u8::from(event_loop.is_quit_requested()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    extern "C" fn bump(user_data: *mut c_void) {
        let counter = unsafe { &*(user_data as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn bump_fd(_fd: i32, user_data: *mut c_void) {
        bump(user_data);
    }

    fn as_user_data(counter: &AtomicUsize) -> *mut c_void {
        counter as *const AtomicUsize as *mut c_void
    }

    #[test]
    fn create_post_dispatch_destroy() {
        let counter = AtomicUsize::new(0);
        let event_loop = hostloop_create(0);
        assert!(!event_loop.is_null());

        unsafe {
            assert_eq!(hostloop_post(event_loop, bump, as_user_data(&counter)), 1);
            assert_eq!(hostloop_post(event_loop, bump, as_user_data(&counter)), 1);
            assert_eq!(hostloop_dispatch_next(event_loop, 1), 1);
            assert_eq!(hostloop_dispatch_next(event_loop, 1), 0);
            hostloop_destroy(event_loop);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fd_registration_round_trip() {
        let counter = AtomicUsize::new(0);
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();
        let event_loop = hostloop_create(0);

        unsafe {
            assert_eq!(
                hostloop_register_fd(event_loop, rx.as_raw_fd(), 1, bump_fd, as_user_data(&counter)),
                0
            );
            assert_eq!(hostloop_dispatch_next(event_loop, 1), 1);
            assert_eq!(hostloop_unregister_fd(event_loop, rx.as_raw_fd()), 0);
            assert_eq!(hostloop_dispatch_next(event_loop, 1), 0);
            hostloop_destroy(event_loop);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quit_request_is_visible() {
        let event_loop = hostloop_create(0);
        unsafe {
            assert_eq!(hostloop_is_quit_requested(event_loop), 0);
            assert_eq!(hostloop_request_quit(event_loop), 0);
            assert_eq!(hostloop_is_quit_requested(event_loop), 1);
            assert_eq!(hostloop_dispatch_next(event_loop, 0), 0);
            hostloop_destroy(event_loop);
        }
    }

    #[test]
    fn null_loop_is_rejected() {
        let counter = AtomicUsize::new(0);
        unsafe {
            assert_eq!(hostloop_post(ptr::null(), bump, as_user_data(&counter)), 0);
            assert_eq!(hostloop_register_fd(ptr::null(), 0, 1, bump_fd, ptr::null_mut()), -1);
            assert_eq!(hostloop_unregister_fd(ptr::null(), 0), -1);
            assert_eq!(hostloop_dispatch_next(ptr::null(), 1), -1);
            assert_eq!(hostloop_request_quit(ptr::null()), -1);
            assert_eq!(hostloop_is_quit_requested(ptr::null()), 0);
            hostloop_destroy(ptr::null_mut());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
