//! The coroutine table: a fixed-capacity arena of slots, indices standing in
//! for pointers rather than a global `BTreeMap` keyed on task id, since this
//! table is per-thread and never shared.

use crate::stack::Stack;

/// Index into a [`crate::runtime::Runtime`]'s slot table. Slot 0 always
/// denotes the thread's root coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub(crate) u32);

impl SlotId {
    pub const ROOT: SlotId = SlotId(0);

    pub fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Invoked on retirement with the stack's base pointer and size, before the
/// stack is pushed onto the free-list for reuse.
pub type Destructor = unsafe fn(*mut u8, usize);

pub struct LiveCoroutine {
    pub stack: Stack,
    /// Valid only while this coroutine is not the one executing.
    pub saved_sp: *mut u8,
    pub destructor: Option<Destructor>,
}

/// One entry of the coroutine table.
///
/// `Free` slots form a LIFO free-list threaded through `next`; `0` means
/// "end of list" since slot 0 (the root) is never freed. A retired stack is
/// kept mapped and parked here rather than deallocated immediately: the
/// coroutine retiring into this slot is still running on that very memory
/// until it switches away, so freeing it here would unmap the ground out
/// from under the next few instructions. [`crate::runtime::Runtime::spawn`]
/// reclaims it (or drops it, if undersized) once some other coroutine calls in.
pub enum Slot {
    Free { next: u32, stack: Stack },
    Occupied(LiveCoroutine),
}

impl Slot {
    pub fn as_live(&self) -> Option<&LiveCoroutine> {
        match self {
            Slot::Occupied(live) => Some(live),
            Slot::Free { .. } => None,
        }
    }

    pub fn as_live_mut(&mut self) -> Option<&mut LiveCoroutine> {
        match self {
            Slot::Occupied(live) => Some(live),
            Slot::Free { .. } => None,
        }
    }
}
