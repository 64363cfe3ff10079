//! Segregated free-list allocator for `#![no_std]`
//!
//! This crate provides two types: the [`RawAllocator`], a `malloc`/`free`/
//! `realloc`-style allocator handing out offsets into its own heap, and the
//! [`Allocator`], which wraps the raw allocator behind a spin lock and
//! implements the [`core::alloc::GlobalAlloc`]-trait, which is required to use
//! the [`alloc`-crate][alloc] on `#![no_std]`-targets.
//!
//! # Usage
//! Copy the following into your binary crate and adjust the maximum number of
//! bytes of the heap (here 64K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: segalloc::Allocator<65536> = segalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! The heap memory is part of the static and zero-initialized, so it is placed
//! into `.bss`. Only the used part of it is touched: the heap starts small and
//! grows on demand (by at least [`CHUNK_SIZE`] bytes) until it reaches `N`.
//!
//! The raw allocator can also be used directly, e.g. for a private arena:
//! ```
//! let mut heap = segalloc::RawAllocator::<8192>::new();
//! let p = heap.alloc(16).unwrap();
//! heap.memory_of_mut(p).unwrap()[..5].copy_from_slice(b"hello");
//! let p = heap.realloc(Some(p), 64).unwrap().unwrap();
//! assert_eq!(&heap.memory_of(p).unwrap()[..5], b"hello");
//! heap.free(p).unwrap();
//! heap.check().unwrap();
//! ```
//!
//! # Implementation
//! Every block carries a header and a footer word holding the block size and
//! an "allocated"-bit. The heap is bounded by a prologue and an epilogue block,
//! which are always allocated:
//! ```text
//! pad  hdr  ftr  hdr  payload ...          ftr  hdr
//! 0000 8/1  8/1  24/1 xxxx xxxx xxxx xxxx  24/1 0/1
//!      ^-------^ ^-----------------------------^ ^--
//!      prologue  allocated block (size 24)       epilogue
//! ```
//! 1.  Free blocks use their payload to store two links: the offsets of the
//!     previous and the next free block of the same size class. There are 20
//!     size classes, each covering a power-of-two range of sizes. Inside of a
//!     class the blocks are sorted by ascending size.
//! 2.  An allocation searches the size class of the request first and moves on
//!     to the larger classes. The first block large enough is taken, which is
//!     the best fit of its class. If the rest of that block can form a block
//!     of its own, it is split off and put back into the free lists.
//! 3.  If no block fits, the heap is grown. The new memory replaces the old
//!     epilogue and is merged with the last block, if that was free.
//! 4.  Freeing a block immediately merges it with its physical neighbors. The
//!     following block is found via the size in the header, the previous one
//!     via its footer, which lies right in front of the header:
//!     ```text
//!     ... 24/0  | 24/0 xxxx xxxx xxxx xxxx 24/0 | 32/1 ...
//!         ^---- footer of the previous block, read backwards
//!     ```
//!     Therefore there are never two adjacent free blocks.
//! 5.  A reallocation to a smaller size keeps the block. A larger size first
//!     tries to absorb free neighbors and only then moves the allocation.
//!
//! The [`check()`](RawAllocator::check)-method walks the heap and the free
//! lists independently and reports any inconsistency as a [`Violation`].
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

mod raw_allocator;

pub use raw_allocator::{
    Exhausted, FreeError, Payload, RawAllocator, Violation, ALIGNMENT, CHUNK_SIZE, MIN_BLOCK_SIZE,
    MIN_HEAP_SIZE,
};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// The size of the word storing the real payload of an over-aligned
/// allocation.
const STASH_SIZE: usize = core::mem::size_of::<u32>();

/// The memory allocator for `#![no_std]` targets.
///
/// This is a [`RawAllocator`] with a heap of at most `N` bytes, guarded by a
/// spin lock, so that it can be shared between threads. It implements the
/// [`GlobalAlloc`]-trait.
///
/// Its usage is simple: just copy and paste the following in the binary crate
/// you're developing. The maximum heap size is `65536` or 64K in this example.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: segalloc::Allocator<65536> = segalloc::Allocator::new();
/// ```
/// Allocations with an alignment of up to [`ALIGNMENT`] are served directly.
/// Larger alignments cost an additional `align` bytes per allocation.
///
/// Note, that the allocator may log (via the `log`-crate) while holding its
/// lock. A logger used together with this global allocator must therefore not
/// allocate.
pub struct Allocator<const N: usize> {
    raw: spin::Mutex<RawAllocator<N>>,
}
impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied heap size, i.e. `N` is less
    /// than [`MIN_HEAP_SIZE`] or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= MIN_HEAP_SIZE, "too small heap memory: N must be at least `MIN_HEAP_SIZE`");
        assert!(N % ALIGNMENT == 0, "memory size has to be divisible by 8");
        Self {
            raw: spin::Mutex::new(RawAllocator::new()),
        }
    }

    /// Verify the consistency of the heap.
    ///
    /// # Errors
    /// The first broken invariant is reported.
    pub fn check(&self) -> Result<(), Violation> {
        self.raw.lock().check()
    }

    /// The number of bytes the heap has grown to so far.
    pub fn heap_size(&self) -> usize {
        self.raw.lock().heap_size()
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut raw = self.raw.lock();
        if layout.align() <= ALIGNMENT {
            return match raw.alloc(layout.size()) {
                Some(payload) => raw.as_mut_ptr(payload),
                None => ptr::null_mut(),
            };
        }

        // Over-aligned: the payload is moved up to the next boundary (by at
        // least 8 bytes) and the real payload offset is stored in front of it.
        let Some(size) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let Some(payload) = raw.alloc(size) else {
            return ptr::null_mut();
        };
        let start = raw.as_mut_ptr(payload);
        let shift = match start.align_offset(layout.align()) {
            0 => layout.align(),
            shift => shift,
        };
        #[allow(clippy::cast_possible_truncation)] // heap offsets fit into u32
        let stash = payload.offset() as u32;
        // SAFETY: `shift` is at most `align` and at least `ALIGNMENT`, so both
        // the aligned pointer with `layout.size()` bytes and the stash word in
        // front of it are inside of the allocated payload.
        unsafe {
            let aligned = start.add(shift);
            aligned.sub(STASH_SIZE).cast::<u32>().write_unaligned(stash);
            aligned
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut raw = self.raw.lock();
        let payload = if layout.align() <= ALIGNMENT {
            raw.payload_of(ptr)
        } else {
            // SAFETY: over-aligned pointers are always preceded by the stash
            // word written in `alloc()`.
            let stash = unsafe { ptr.sub(STASH_SIZE).cast::<u32>().read_unaligned() };
            Payload::from_offset(stash as usize)
        };
        // allocators must not unwind, the error is already logged
        let _ = raw.free(payload);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            // SAFETY: the caller guarantees a valid size for this alignment
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            // SAFETY: the layouts are forwarded from the caller, the two
            // allocations are distinct, as `ptr` is still allocated.
            unsafe {
                let new = self.alloc(new_layout);
                if !new.is_null() {
                    ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
                return new;
            }
        }

        let mut raw = self.raw.lock();
        let payload = raw.payload_of(ptr);
        match raw.realloc(Some(payload), new_size) {
            Ok(Some(payload)) => raw.as_mut_ptr(payload),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }
}
