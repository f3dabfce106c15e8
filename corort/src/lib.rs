//! Stackful, cooperatively-scheduled coroutines for one OS thread at a time.
//!
//! Each thread that uses this crate gets its own [`Runtime`]: a fixed-size
//! table of coroutine slots, a runnable ring, and a set of coroutines parked
//! on descriptor readiness. Coroutines never migrate between threads —
//! spawn on the thread you intend to run on. There is no `async`/`Future`
//! surface here: `wait_read`/`wait_write` look and behave like ordinary
//! blocking calls from the coroutine's point of view, and can be called at
//! any depth in its call stack, which is the entire point of paying for a
//! real machine stack per coroutine instead of a state machine.
//!
//! ```text
//! stack        -> owns the memory a coroutine runs on
//! context      -> the arch-specific register save/restore primitives
//! slot         -> the coroutine table entry (live or free-listed)
//! runtime      -> the per-thread scheduler tying the above together
//! reactor      -> the libc::poll readiness step the scheduler calls into
//! ```

mod context;
mod reactor;
mod runtime;
mod slot;
mod stack;

pub use runtime::{active_count, current_id, wait_read, wait_write, wake_up, yield_now, Runtime, RuntimeConfig};
pub use slot::{Destructor, SlotId};
pub use stack::{StackAllocator, StackPolicy};

/// The entry function signature every spawned coroutine starts in. See
/// [`Runtime::spawn`].
pub use context::EntryFn;
