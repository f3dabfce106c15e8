//! The readiness poll that moves parked coroutines back to runnable.
//!
//! A thin wrapper around `libc::poll` over the parked set's two parallel
//! arrays, kept in its own small module next to the scheduler it drives
//! rather than inlined into it.

/// Poll the parked set for readiness.
///
/// If `parked_slots` is empty, returns immediately with an empty vector —
/// there is nothing to wait on. Otherwise polls with timeout `0`
/// (`blocking == false`, a non-blocking drain used between scheduling hops)
/// or infinite (`blocking == true`, used when the thread has no other
/// runnable work). On `EINTR`, retries if `blocking` (there is nothing
/// better to do) and gives up immediately (returning no newly-ready slots)
/// otherwise, leaving scheduling to pick up whatever is already runnable.
///
/// Ready entries are removed from both parallel arrays (swap-with-last, to
/// keep them compact and in lockstep) and their slot ids returned for the
/// caller to push onto the runnable ring.
pub(crate) fn poll(parked_slots: &mut Vec<u32>, parked_fds: &mut Vec<libc::pollfd>, blocking: bool) -> Vec<u32> {
    if parked_slots.is_empty() {
        return Vec::new();
    }

    let timeout = if blocking { -1 } else { 0 };
    loop {
        let rc = unsafe { libc::poll(parked_fds.as_mut_ptr(), parked_fds.len() as libc::nfds_t, timeout) };
        if rc >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            if blocking {
                continue;
            }
            return Vec::new();
        }
        log::warn!("poll on {} parked descriptor(s) failed: {err}", parked_fds.len());
        return Vec::new();
    }

    let mut ready = Vec::new();
    let mut i = 0;
    while i < parked_fds.len() {
        if parked_fds[i].revents != 0 {
            parked_fds.swap_remove(i);
            ready.push(parked_slots.swap_remove(i));
        } else {
            i += 1;
        }
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parked_set_returns_immediately() {
        let mut slots = Vec::new();
        let mut fds = Vec::new();
        assert_eq!(poll(&mut slots, &mut fds, true), Vec::<u32>::new());
    }

    fn open_pipe() -> [i32; 2] {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        fds
    }

    #[test]
    fn ready_pipe_is_migrated_and_removed_from_the_parked_set() {
        let [read_fd, write_fd] = open_pipe();
        let _ = unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };

        let mut slots = vec![7u32];
        let mut fds = vec![libc::pollfd { fd: read_fd, events: libc::POLLRDNORM, revents: 0 }];

        let ready = poll(&mut slots, &mut fds, false);
        assert_eq!(ready, vec![7]);
        assert!(slots.is_empty());
        assert!(fds.is_empty());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn not_yet_ready_descriptor_stays_parked() {
        let [read_fd, write_fd] = open_pipe();

        let mut slots = vec![3u32];
        let mut fds = vec![libc::pollfd { fd: read_fd, events: libc::POLLRDNORM, revents: 0 }];

        let ready = poll(&mut slots, &mut fds, false);
        assert!(ready.is_empty());
        assert_eq!(slots, vec![3]);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
