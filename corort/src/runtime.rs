//! The per-thread scheduler: a coroutine table, a runnable ring, and a
//! parked set tied to descriptor readiness. Scoped to a single OS thread via
//! `thread_local!` rather than a global per-CPU table — there is no
//! cross-thread coroutine migration in this design, so a `RefCell` behind a
//! `thread_local!` is
//! sufficient where the kernel needed `Mutex<BTreeMap<..>>`.

use std::cell::RefCell;
use std::os::fd::RawFd;

use crate::context::{self, EntryFn, SuspendReason};
use crate::reactor;
use crate::slot::{Destructor, LiveCoroutine, Slot, SlotId};
use crate::stack::{Stack, StackPolicy};

/// Construction-time parameters for a thread's [`Runtime`]. Replaces the
/// original's compile-time `#define`s — this is a linkable library, not a
/// single statically-configured binary, so the knobs are runtime values.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub max_coroutines: usize,
    pub stack_size: usize,
    pub stack_policy: StackPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { max_coroutines: 1024, stack_size: 32 * 1024, stack_policy: StackPolicy::default() }
    }
}

/// One OS thread's coroutine scheduler. Never constructed directly outside
/// this module; reached through the `thread_local!` handle and the free
/// functions below.
pub struct Runtime {
    config: RuntimeConfig,
    slots: Vec<Slot>,
    /// Head of the free-list; `0` means empty (slot 0 is never freed).
    free_head: u32,
    runnable: Vec<u32>,
    cursor: usize,
    parked_slots: Vec<u32>,
    parked_fds: Vec<libc::pollfd>,
    current: u32,
}

thread_local! {
    static RUNTIME: RefCell<Runtime> = RefCell::new(Runtime::new(RuntimeConfig::default()));
}

impl Runtime {
    fn new(config: RuntimeConfig) -> Self {
        let root = Slot::Occupied(LiveCoroutine { stack: Stack::root(), saved_sp: std::ptr::null_mut(), destructor: None });
        Runtime {
            config,
            slots: vec![root],
            free_head: 0,
            runnable: vec![0],
            cursor: 0,
            parked_slots: Vec::new(),
            parked_fds: Vec::new(),
            current: 0,
        }
    }

    /// Replace this thread's runtime wholesale. Intended to be called once,
    /// before any coroutine is spawned — reusing a runtime that already has
    /// live coroutines silently discards them without running destructors,
    /// the same hazard `destroy_all` documents.
    pub fn configure(config: RuntimeConfig) {
        RUNTIME.with(|rt| *rt.borrow_mut() = Runtime::new(config));
    }

    /// Spawn a coroutine on the calling thread's runtime. `payload` is
    /// copied near the top of the new stack; `entry` receives a pointer to
    /// that copy as its sole argument. Returns `None` if the table is full
    /// (free-list empty and at `max_coroutines`) or the stack allocation
    /// failed.
    pub fn spawn(entry: EntryFn, payload: &[u8], destructor: Option<Destructor>) -> Option<SlotId> {
        RUNTIME.with(|rt| rt.borrow_mut().spawn_inner(entry, payload, destructor))
    }

    /// Deallocate every non-root stack and reset the table. Only valid from
    /// the root coroutine (slot 0); debug-asserted.
    pub fn destroy_all() {
        RUNTIME.with(|rt| rt.borrow_mut().destroy_all_inner());
    }

    fn spawn_inner(&mut self, entry: EntryFn, payload: &[u8], destructor: Option<Destructor>) -> Option<SlotId> {
        let stack_size = self.config.stack_size;
        let (index, stack) = if let Some((index, stack)) = self.pop_free() {
            if stack.size() >= stack_size {
                (index, stack)
            } else {
                drop(stack);
                (index, Stack::allocate(stack_size, &self.config.stack_policy)?)
            }
        } else if self.slots.len() < self.config.max_coroutines {
            let stack = Stack::allocate(stack_size, &self.config.stack_policy)?;
            let index = self.slots.len() as u32;
            // Placeholder; overwritten below once the stack is primed. Using
            // Stack::root() here avoids allocating a second real stack just
            // to satisfy the enum's shape.
            self.slots.push(Slot::Free { next: 0, stack: Stack::root() });
            (index, stack)
        } else {
            return None;
        };

        let sp = unsafe { context::prime_stack(stack.top(), payload, entry, retire_sentinel) };
        self.slots[index as usize] = Slot::Occupied(LiveCoroutine { stack, saved_sp: sp, destructor });
        self.runnable.push(index);
        Some(SlotId(index))
    }

    fn pop_free(&mut self) -> Option<(u32, Stack)> {
        if self.free_head == 0 {
            return None;
        }
        let index = self.free_head;
        let slot = std::mem::replace(&mut self.slots[index as usize], Slot::Free { next: 0, stack: Stack::root() });
        match slot {
            Slot::Free { next, stack } => {
                self.free_head = next;
                Some((index, stack))
            }
            Slot::Occupied(_) => unreachable!("free-list head pointed at an occupied slot"),
        }
    }

    fn destroy_all_inner(&mut self) {
        debug_assert_eq!(self.current, 0, "destroy_all must be called from the root coroutine");
        self.slots.truncate(1);
        self.free_head = 0;
        self.runnable = vec![0];
        self.cursor = 0;
        self.parked_slots.clear();
        self.parked_fds.clear();
        self.current = 0;
    }

    fn wake_up_inner(&mut self, id: SlotId) {
        if let Some(pos) = self.parked_slots.iter().position(|&s| s == id.0) {
            self.parked_slots.swap_remove(pos);
            self.parked_fds.swap_remove(pos);
            self.runnable.push(id.0);
        }
    }

    /// Called from `switch_context_trampoline` with the sp the suspending
    /// coroutine just saved. Returns the sp of whichever coroutine runs
    /// next.
    fn handle_suspend(&mut self, fd: RawFd, reason: SuspendReason, sp: *mut u8) -> *mut u8 {
        if let Some(live) = self.slots[self.current as usize].as_live_mut() {
            live.saved_sp = sp;
        }

        match reason {
            SuspendReason::Yield => {
                self.cursor = (self.cursor + 1) % self.runnable.len();
                let ready = reactor::poll(&mut self.parked_slots, &mut self.parked_fds, false);
                self.runnable.extend(ready);
            }
            SuspendReason::WaitRead | SuspendReason::WaitWrite => {
                self.park_current(fd, reason);
            }
        }
        self.pick_next()
    }

    fn park_current(&mut self, fd: RawFd, reason: SuspendReason) {
        let events = match reason {
            SuspendReason::WaitRead => libc::POLLRDNORM,
            SuspendReason::WaitWrite => libc::POLLWRNORM,
            SuspendReason::Yield => unreachable!("yield never parks"),
        };
        let id = self.current;
        self.runnable.swap_remove(self.cursor);
        self.parked_slots.push(id);
        self.parked_fds.push(libc::pollfd { fd, events, revents: 0 });
    }

    fn retire_current(&mut self) -> *mut u8 {
        let current = self.current;
        debug_assert_ne!(current, 0, "the root coroutine cannot retire");
        self.runnable.swap_remove(self.cursor);

        let slot = std::mem::replace(&mut self.slots[current as usize], Slot::Free { next: 0, stack: Stack::root() });
        if let Slot::Occupied(live) = slot {
            if let Some(destructor) = live.destructor {
                unsafe { destructor(live.stack.base(), live.stack.size()) };
            }
            self.slots[current as usize] = Slot::Free { next: self.free_head, stack: live.stack };
            self.free_head = current;
        }

        self.pick_next()
    }

    /// Select the coroutine at the (possibly wrapped) cursor position,
    /// blocking in the reactor first if nothing is runnable.
    fn pick_next(&mut self) -> *mut u8 {
        if self.runnable.is_empty() {
            let ready = reactor::poll(&mut self.parked_slots, &mut self.parked_fds, true);
            debug_assert!(!ready.is_empty(), "a blocking poll must return at least one ready descriptor");
            self.runnable.extend(ready);
        }
        if self.cursor >= self.runnable.len() {
            self.cursor = 0;
        }
        self.current = self.runnable[self.cursor];
        self.slots[self.current as usize]
            .as_live()
            .expect("scheduled slot has no live coroutine state")
            .saved_sp
    }
}

/// Entry trampoline reached by a tail-jump out of each arch's
/// `switch_and_save`. Runs on the *suspending* coroutine's stack (the jump
/// doesn't move the stack pointer) right up until it calls `restore_context`
/// into whichever coroutine runs next.
///
/// # Safety
/// Only ever reached via the naked `switch_and_save` shims.
pub(crate) unsafe extern "C" fn switch_context_trampoline(fd: i32, reason: i32, sp: *mut u8) -> ! {
    let reason = unsafe { SuspendReason::from_raw(reason) };
    let next_sp = RUNTIME.with(|rt| rt.borrow_mut().handle_suspend(fd, reason, sp));
    unsafe { context::restore_context(next_sp) }
}

/// Reached when a coroutine's entry function returns. Retires the current
/// slot (destructor, free-list) and restores the next runnable coroutine.
///
/// # Safety
/// Only ever reached as the return address baked in by `prime_stack`.
pub(crate) unsafe extern "C" fn retire_sentinel() -> ! {
    let next_sp = RUNTIME.with(|rt| rt.borrow_mut().retire_current());
    unsafe { context::restore_context(next_sp) }
}

/// Suspend the current coroutine and let the scheduler pick another
/// runnable one. The current coroutine stays in the runnable ring.
pub fn yield_now() {
    unsafe { context::switch_and_save(0, SuspendReason::Yield) };
}

/// Park the current coroutine until `fd` is readable, then resume.
pub fn wait_read(fd: RawFd) {
    unsafe { context::switch_and_save(fd, SuspendReason::WaitRead) };
}

/// Park the current coroutine until `fd` is writable, then resume.
pub fn wait_write(fd: RawFd) {
    unsafe { context::switch_and_save(fd, SuspendReason::WaitWrite) };
}

/// The slot id of the coroutine currently executing on this thread.
pub fn current_id() -> SlotId {
    RUNTIME.with(|rt| SlotId(rt.borrow().current))
}

/// Move a parked coroutine back to the runnable ring. A no-op if `id` is
/// not currently parked (already runnable, already retired, or unknown).
pub fn wake_up(id: SlotId) {
    RUNTIME.with(|rt| rt.borrow_mut().wake_up_inner(id));
}

/// Number of coroutines runnable on this thread right now (root included).
pub fn active_count() -> usize {
    RUNTIME.with(|rt| rt.borrow().runnable.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    thread_local! {
        static LOG: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
    }

    unsafe extern "C" fn record_twice_then_retire(payload: *mut u8) {
        let id = unsafe { *(payload as *const u32) };
        LOG.with(|log| log.borrow_mut().push(id));
        yield_now();
        LOG.with(|log| log.borrow_mut().push(id));
    }

    #[test]
    fn yield_round_robin_alternates_two_coroutines() {
        Runtime::configure(RuntimeConfig::default());
        LOG.with(|log| log.borrow_mut().clear());

        let a_id: u32 = 1;
        let b_id: u32 = 2;
        Runtime::spawn(record_twice_then_retire, &a_id.to_ne_bytes(), None).expect("spawn a");
        Runtime::spawn(record_twice_then_retire, &b_id.to_ne_bytes(), None).expect("spawn b");

        while active_count() > 1 {
            yield_now();
        }

        LOG.with(|log| {
            assert_eq!(&*log.borrow(), &[1, 2, 1, 2]);
        });
    }

    unsafe extern "C" fn retire_immediately(_payload: *mut u8) {}

    #[test]
    fn spawn_then_retire_reuses_stack_regions() {
        Runtime::configure(RuntimeConfig::default());

        for _ in 0..4 {
            Runtime::spawn(retire_immediately, &[], None).expect("spawn");
            while active_count() > 1 {
                yield_now();
            }
        }
        let after_first_round = RUNTIME.with(|rt| rt.borrow().slots.len());

        for _ in 0..4 {
            Runtime::spawn(retire_immediately, &[], None).expect("spawn");
            while active_count() > 1 {
                yield_now();
            }
        }
        let after_second_round = RUNTIME.with(|rt| rt.borrow().slots.len());

        assert_eq!(after_first_round, after_second_round, "free-list should have been reused, not grown");
    }

    #[test]
    fn wake_up_is_idempotent_on_an_already_runnable_slot() {
        Runtime::configure(RuntimeConfig::default());
        wake_up(SlotId::ROOT);
        assert_eq!(active_count(), 1);
    }

    #[test]
    fn spawn_fails_once_table_is_full() {
        Runtime::configure(RuntimeConfig { max_coroutines: 2, ..RuntimeConfig::default() });
        let first = Runtime::spawn(retire_immediately, &[], None);
        assert!(first.is_some());
        let second = Runtime::spawn(retire_immediately, &[], None);
        assert!(second.is_none(), "table has only room for slot 0 and one spawned coroutine");
    }

    #[test]
    fn retiring_a_slot_frees_capacity_for_the_next_spawn() {
        Runtime::configure(RuntimeConfig { max_coroutines: 2, ..RuntimeConfig::default() });
        let first = Runtime::spawn(retire_immediately, &[], None).expect("spawn first");
        assert!(Runtime::spawn(retire_immediately, &[], None).is_none(), "table should be full");

        while active_count() > 1 {
            yield_now();
        }

        let second = Runtime::spawn(retire_immediately, &[], None);
        assert!(second.is_some(), "retiring the first coroutine should have freed its slot");
        assert_eq!(second.unwrap().index(), first.index(), "the free-list should hand back the same slot");
    }

    static DESTROYED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    unsafe fn mark_destroyed(_base: *mut u8, _size: usize) {
        DESTROYED.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    unsafe extern "C" fn do_nothing(_payload: *mut u8) {}

    #[test]
    fn destructor_runs_on_retirement() {
        Runtime::configure(RuntimeConfig::default());
        DESTROYED.store(false, std::sync::atomic::Ordering::SeqCst);
        Runtime::spawn(do_nothing, &[], Some(mark_destroyed)).expect("spawn");
        while active_count() > 1 {
            yield_now();
        }
        assert!(DESTROYED.load(std::sync::atomic::Ordering::SeqCst));
    }
}
