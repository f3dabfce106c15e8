//! Cross-thread shutdown plumbing.
//!
//! `shutdown_requested` and its companions are atomics because they're read
//! and written from whichever thread happens to notice a shutdown first, with
//! no lock to serialize the two. The harder problem is *waking* a thread
//! blocked in another thread's `corort::Runtime`: runtimes are thread-local,
//! so one thread can never reach into another's coroutine table directly.
//! This module bridges that gap with a self-pipe — a pipe whose read end is
//! parked on by a small coroutine on the main thread, alongside the listening
//! socket, in the very same `libc::poll` set. Any thread can wake the main
//! thread by writing a byte to the write end; no cross-thread access to a
//! foreign `Runtime` is ever needed.
//!
//! `SIGUSR1`/`pthread_kill` is layered on top of that: a worker that decides
//! to terminate arms a one-shot latch and signals the main thread, whose
//! handler does the one thing a signal handler is allowed to do here — write
//! a byte to the self-pipe. Given the self-pipe is already polled directly,
//! the signal is belt-and-suspenders rather than load-bearing, but it covers
//! the case where the main thread's poll set somehow never sees the pipe
//! become readable (a missed edge, a platform quirk) — the signal forces a
//! spurious wakeup regardless.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use crate::dispatcher::Client;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_CLIENT_FD: AtomicI32 = AtomicI32::new(-1);
static BROADCAST_ARMED: AtomicBool = AtomicBool::new(false);
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);
static MAIN_THREAD: AtomicU64 = AtomicU64::new(0);

/// Record the main thread's pthread id and the write end of its self-pipe.
/// Called once, from `Server::bind`, before any worker can observe either.
pub(crate) fn init(main_thread: libc::pthread_t, notify_write_fd: i32) {
    MAIN_THREAD.store(main_thread as u64, Ordering::SeqCst);
    NOTIFY_FD.store(notify_write_fd, Ordering::SeqCst);
    install_signal_handler();
}

/// Reset all shutdown state. Used by tests that stand up more than one
/// `Server` in the same process.
pub(crate) fn reset() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    SHUTDOWN_CLIENT_FD.store(-1, Ordering::SeqCst);
    BROADCAST_ARMED.store(false, Ordering::SeqCst);
}

/// Wake whatever is parked on the main thread's self-pipe, regardless of
/// which thread calls this. A pipe write is safe to issue from any thread
/// (and, for the signal handler's sake, from a signal handler too).
fn notify() {
    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 0u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Request process-wide shutdown. Records `client`'s descriptor for
/// diagnostics, wakes slot 0 of the *caller's own* runtime (a same-thread
/// convenience for callers that happen to be running on the main thread
/// already), and otherwise relies on the self-pipe/signal path to reach the
/// main thread.
pub fn request_shutdown(client: &Client) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    SHUTDOWN_CLIENT_FD.store(client.fd(), Ordering::SeqCst);
    log::info!("shutdown requested by client fd {}", client.fd());

    corort::wake_up(corort::SlotId::ROOT);
    notify();
    if BROADCAST_ARMED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        let main = MAIN_THREAD.load(Ordering::SeqCst) as libc::pthread_t;
        if main != 0 {
            unsafe {
                libc::pthread_kill(main, libc::SIGUSR1);
            }
        }
    }
}

/// Whether shutdown has been requested. Checked by the listener before every
/// accept and by workers before spawning another serving coroutine.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// The client descriptor that triggered shutdown, for diagnostics. `-1` if
/// shutdown has not been requested.
pub fn shutdown_origin_fd() -> i32 {
    SHUTDOWN_CLIENT_FD.load(Ordering::SeqCst)
}

extern "C" fn handle_sigusr1(_signum: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 0u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn install_signal_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigusr1 as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn shutdown_requested_is_false_until_set() {
        reset();
        NOTIFY_FD.store(-1, Ordering::SeqCst);
        assert!(!shutdown_requested());
        let client = Client::for_test(42, Ipv4Addr::LOCALHOST, 9999);
        request_shutdown(&client);
        assert!(shutdown_requested());
        assert_eq!(shutdown_origin_fd(), 42);
        reset();
    }
}
