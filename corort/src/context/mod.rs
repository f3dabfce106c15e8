//! Machine-level context switching.
//!
//! This is the one part of the runtime that is fundamentally architectural:
//! the exact register set saved/restored and the stack layout a freshly
//! spawned coroutine is primed with differ per target. Each arch submodule
//! exposes the same three `naked_asm!`-based primitives:
//!
//! - `switch_and_save` — a `#[naked]` shim called as an ordinary function;
//!   it pushes callee-saved state and tail-jumps into
//!   [`crate::runtime::switch_context_trampoline`] with the just-saved stack
//!   pointer as a third argument. It never returns to its caller directly —
//!   control comes back only when some later `restore_context` call resumes
//!   *this* coroutine.
//! - `restore_context` — loads callee-saved state from a previously saved
//!   stack pointer and returns into whichever call (this function, or the
//!   freshly primed entry trampoline) is waiting there.
//! - `prime_stack` — lays out a brand-new stack so that the first
//!   `restore_context` on it jumps into the coroutine's entry function with
//!   the payload pointer as its argument, and so that the entry function
//!   returning lands in `retire_sentinel` instead of undefined memory.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{prime_stack, restore_context, switch_and_save};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{prime_stack, restore_context, switch_and_save};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("corort's context switcher only supports x86_64 and aarch64");

/// The entry function every spawned coroutine starts in. Receives a pointer
/// into its own stack where the payload was copied; the coroutine itself is
/// responsible for interpreting it (typically by reading it out immediately
/// and not holding onto the raw pointer beyond that).
pub type EntryFn = unsafe extern "C" fn(*mut u8);

/// Why a coroutine is suspending, passed through to
/// [`crate::runtime::switch_context_trampoline`]. `#[repr(i32)]` to keep the
/// value register-sized regardless of target, matching the argument-passing
/// assumptions baked into the naked shims.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Yield = 0,
    WaitRead = 1,
    WaitWrite = 2,
}

impl SuspendReason {
    /// # Safety
    /// `value` must be one of the discriminants written by `switch_and_save`.
    pub(crate) unsafe fn from_raw(value: i32) -> Self {
        match value {
            0 => SuspendReason::Yield,
            1 => SuspendReason::WaitRead,
            2 => SuspendReason::WaitWrite,
            _ => unreachable!("invalid SuspendReason discriminant {value}"),
        }
    }
}
