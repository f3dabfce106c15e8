//! Execution stacks for coroutines.
//!
//! A [`Stack`] is a contiguous, 16-byte-high-aligned byte region suitable for
//! use as a call stack. Allocation policy is pluggable: `mmap`-backed
//! (default on unix), a plain heap allocation, or a user-supplied pair of
//! callbacks for embedders that want to manage the backing memory themselves.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::sync::Arc;

/// How a [`Stack`]'s backing memory is obtained and released.
#[derive(Clone)]
pub enum StackPolicy {
    /// Anonymous, private, read/write pages via `mmap`. Uses `MAP_STACK`
    /// where the platform defines it so the kernel can apply stack-specific
    /// heuristics (e.g. growth hints); this crate still treats the region as
    /// fixed-size, it never actually grows it.
    Mmap,
    /// A plain heap allocation, 16-byte aligned.
    Heap,
    /// Caller-supplied allocate/deallocate pair, for embedders with their
    /// own arena or huge-page allocator.
    Custom(Arc<dyn StackAllocator>),
}

impl Default for StackPolicy {
    fn default() -> Self {
        StackPolicy::Mmap
    }
}

impl std::fmt::Debug for StackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackPolicy::Mmap => f.write_str("StackPolicy::Mmap"),
            StackPolicy::Heap => f.write_str("StackPolicy::Heap"),
            StackPolicy::Custom(_) => f.write_str("StackPolicy::Custom(..)"),
        }
    }
}

/// A user-supplied stack allocator.
///
/// `allocate` returns `None` on failure; the caller turns that into a spawn
/// failure rather than panicking, mirroring every other allocation path in
/// this crate.
pub trait StackAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Option<*mut u8>;
    /// # Safety
    /// `ptr`/`size` must be a region previously returned by `allocate`.
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize);
}

/// An owned execution stack.
///
/// `base` is the lowest address, `top` is `base + size` (one-past-the-end,
/// matching the convention that stacks grow down from `top`). The root
/// coroutine's stack is unmanaged: `base` is null and `top`/`size` are zero.
pub struct Stack {
    base: *mut u8,
    size: usize,
    policy: StackPolicy,
}

// Safety: a Stack is only ever touched by the thread-local runtime that owns
// it; it never crosses a thread boundary while live.
unsafe impl Send for Stack {}

impl Stack {
    /// The unmanaged stack standing in for slot 0, the thread's bootstrap
    /// execution. It is never allocated and never deallocated.
    pub fn root() -> Self {
        Stack { base: std::ptr::null_mut(), size: 0, policy: StackPolicy::Heap }
    }

    pub fn is_root(&self) -> bool {
        self.base.is_null()
    }

    /// Allocate a stack of at least `size` bytes (rounded up to the allocator's
    /// granularity) under `policy`. Returns `None` on allocation failure.
    pub fn allocate(size: usize, policy: &StackPolicy) -> Option<Self> {
        let base = match policy {
            StackPolicy::Mmap => unsafe { mmap_stack(size) },
            StackPolicy::Heap => unsafe { heap_stack(size) },
            StackPolicy::Custom(allocator) => allocator.allocate(size)?,
        };
        if base.is_null() {
            return None;
        }
        Some(Stack { base, size, policy: policy.clone() })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.size) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        match &self.policy {
            StackPolicy::Mmap => unsafe { munmap_stack(self.base, self.size) },
            StackPolicy::Heap => unsafe { dealloc_heap_stack(self.base, self.size) },
            StackPolicy::Custom(allocator) => unsafe { allocator.deallocate(self.base, self.size) },
        }
    }
}

const STACK_ALIGN: usize = 16;

unsafe fn mmap_stack(size: usize) -> *mut u8 {
    let mut flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
    #[cfg(target_os = "linux")]
    {
        flags |= libc::MAP_STACK;
    }
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        flags,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        log::warn!("mmap stack allocation of {size} bytes failed: {}", std::io::Error::last_os_error());
        std::ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

unsafe fn munmap_stack(ptr: *mut u8, size: usize) {
    if libc::munmap(ptr as *mut c_void, size) != 0 {
        log::warn!("munmap of stack at {ptr:p} failed: {}", std::io::Error::last_os_error());
    }
}

unsafe fn heap_stack(size: usize) -> *mut u8 {
    let layout = match Layout::from_size_align(size, STACK_ALIGN) {
        Ok(layout) => layout,
        Err(_) => return std::ptr::null_mut(),
    };
    alloc::alloc(layout)
}

unsafe fn dealloc_heap_stack(ptr: *mut u8, size: usize) {
    if let Ok(layout) = Layout::from_size_align(size, STACK_ALIGN) {
        alloc::dealloc(ptr, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_stack_is_aligned_and_writable() {
        let stack = Stack::allocate(32 * 1024, &StackPolicy::Mmap).expect("allocation failed");
        assert_eq!(stack.top() as usize % STACK_ALIGN, 0);
        unsafe {
            std::ptr::write_bytes(stack.base(), 0xAA, stack.size());
        }
    }

    #[test]
    fn heap_stack_is_aligned_and_writable() {
        let stack = Stack::allocate(32 * 1024, &StackPolicy::Heap).expect("allocation failed");
        assert_eq!(stack.top() as usize % STACK_ALIGN, 0);
        unsafe {
            std::ptr::write_bytes(stack.base(), 0xAA, stack.size());
        }
    }

    #[test]
    fn root_stack_is_unmanaged() {
        let root = Stack::root();
        assert!(root.is_root());
        assert_eq!(root.size(), 0);
    }

    struct CountingAllocator {
        allocations: std::sync::atomic::AtomicUsize,
    }

    impl StackAllocator for CountingAllocator {
        fn allocate(&self, size: usize) -> Option<*mut u8> {
            self.allocations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            unsafe { Some(heap_stack(size)) }
        }
        unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
            unsafe { dealloc_heap_stack(ptr, size) };
        }
    }

    #[test]
    fn custom_allocator_is_used() {
        let allocator = Arc::new(CountingAllocator { allocations: std::sync::atomic::AtomicUsize::new(0) });
        let policy = StackPolicy::Custom(allocator.clone());
        let stack = Stack::allocate(16 * 1024, &policy).expect("allocation failed");
        assert_eq!(allocator.allocations.load(std::sync::atomic::Ordering::SeqCst), 1);
        drop(stack);
    }
}
