//! x86-64 (SysV ABI) context switching.
//!
//! Callee-saved registers per the SysV ABI are rbx, rbp, r12–r15; we also
//! save rdi (the argument register) purely for stack-layout symmetry between
//! a freshly primed stack and one saved mid-suspension — see `prime_stack`.

use super::{EntryFn, SuspendReason};
use core::arch::naked_asm;

/// Number of machine words pushed/popped by `switch_and_save`/`restore_context`:
/// rdi, rbp, rbx, r12, r13, r14, r15.
const SAVED_WORDS: usize = 7;

/// Build a fresh stack for a coroutine that has never run.
///
/// Copies `payload` to 16-byte-aligned space just below `stack_top`, then lays
/// out, from high to low address: `retire_sentinel`, `entry`, a pointer to the
/// copied payload (occupying the "saved rdi" slot), then zeros for the
/// remaining six saved registers. The returned pointer is what
/// `restore_context` needs to resume this coroutine for the first time.
///
/// # Safety
/// `stack_top` must be the (8-byte-aligned) top of a stack at least
/// `payload.len()` (rounded up to 16) + `SAVED_WORDS * 8` bytes in size, and
/// must not be concurrently accessed.
pub unsafe fn prime_stack(
    stack_top: *mut u8,
    payload: &[u8],
    entry: EntryFn,
    retire_sentinel: unsafe extern "C" fn() -> !,
) -> *mut u8 {
    let payload_size = (payload.len() + 15) & !15;
    let payload_top = unsafe { stack_top.sub(payload_size) };
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), payload_top, payload.len());
    }

    let mut ptr = payload_top as *mut usize;
    let mut push = |value: usize| unsafe {
        ptr = ptr.sub(1);
        ptr.write(value);
    };

    push(retire_sentinel as usize);
    push(entry as usize);
    push(payload_top as usize); // saved rdi
    push(0); // rbp
    push(0); // rbx
    push(0); // r12
    push(0); // r13
    push(0); // r14
    push(0); // r15

    ptr as *mut u8
}

/// Push callee-saved state for the current coroutine and tail-jump into
/// [`crate::runtime::switch_context_trampoline`] with the saved stack
/// pointer as its third argument.
///
/// Never returns to its caller directly: control returns to whatever called
/// `switch_and_save` only via a later `restore_context` of this same
/// coroutine's saved stack pointer.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_and_save(_fd: i32, _reason: SuspendReason) {
    naked_asm!(
        "push rdi",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdx, rsp",
        "jmp {trampoline}",
        trampoline = sym crate::runtime::switch_context_trampoline,
    )
}

/// Resume a coroutine previously suspended (or freshly primed) at `sp`.
///
/// # Safety
/// `sp` must be a stack pointer previously produced by `prime_stack` or saved
/// by `switch_and_save` for a stack that is still live.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(_sp: *mut u8) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "pop rdi",
        "ret",
    )
}

const _: () = assert!(SAVED_WORDS == 7);
