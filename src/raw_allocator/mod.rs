//! This module provides the raw allocator and its support types.
//!
//! A "raw allocator" is one, that simply gets requests for a specific memory
//! size and hands out 8-byte aligned payload offsets into its heap. It does not
//! know anything about raw pointers or [`Layout`](core::alloc::Layout)s, this
//! is left to the [`Allocator`](crate::Allocator).
mod buffer;
mod checker;
mod free_list;
mod tag;

pub use buffer::Exhausted;
pub use checker::Violation;
pub use tag::{ALIGNMENT, CHUNK_SIZE, MIN_BLOCK_SIZE};

use buffer::Buffer;
use free_list::{bucket_for, FreeLists, BUCKET_COUNT};
use tag::{align, Tag, DWORD, WORD};

/// The payload offset of the prologue block.
const PROLOGUE: usize = 2 * WORD;
/// The payload offset of the first real block.
const FIRST_BLOCK: usize = PROLOGUE + DWORD;
/// The bytes used by the padding, the prologue and the initial epilogue.
const SENTINEL_SIZE: usize = 4 * WORD;
/// The size of the very first heap extension done by [`RawAllocator::init()`].
const INITIAL_EXTENSION: usize = CHUNK_SIZE / DWORD;

/// The smallest heap size, that can be initialized at all.
pub const MIN_HEAP_SIZE: usize = SENTINEL_SIZE + INITIAL_EXTENSION;

/// An error occurred when calling `free()` or `realloc()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FreeError {
    /// There is a double-free detected. An already freed-up-block is freed up
    /// again.
    #[error("double free of the block at offset {0}")]
    DoubleFreeDetected(usize),
    /// An invalid offset was freed up (either an offset outside of the heap
    /// memory or one, that is not the start of a block).
    #[error("no allocation at offset {0}")]
    AllocationNotFound(usize),
}

/// A handle to an allocation: the offset of its payload inside of the heap.
///
/// The offset is always a multiple of [`ALIGNMENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(usize);
impl Payload {
    pub(crate) const fn from_offset(offset: usize) -> Self {
        Self(offset)
    }

    /// The offset of the first payload byte from the start of the heap.
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// The block size needed to serve a request of `n` bytes.
///
/// This includes the header and footer and is at least [`MIN_BLOCK_SIZE`], so
/// that the block can hold its list links once it is freed.
fn block_size_for(n: usize) -> Option<usize> {
    if n <= DWORD {
        Some(MIN_BLOCK_SIZE)
    } else {
        align(n.checked_add(DWORD)?)
    }
}

/// A raw memory allocator with segregated explicit free lists.
///
/// The heap is a buffer of `N` bytes, that is grown on demand. Every block
/// carries a header and a footer tag, free blocks are additionally linked into
/// one of the size classes of the free-list index.
///
/// The allocator is single-threaded: all operations take `&mut self` and run
/// to completion. Multiple instances are completely independent.
pub struct RawAllocator<const N: usize> {
    heap: Buffer<N>,
    free_lists: FreeLists,
    initialized: bool,
}
impl<const N: usize> RawAllocator<N> {
    /// Create a new [`RawAllocator`] with a given maximum heap size.
    ///
    /// The heap is not set up until the first allocation or an explicit call
    /// to [`init()`](Self::init).
    pub const fn new() -> Self {
        Self {
            heap: Buffer::new(),
            free_lists: FreeLists::new(),
            initialized: false,
        }
    }

    /// Set up an empty heap.
    ///
    /// All size classes are emptied, the prologue and epilogue are written and
    /// the heap is extended once. Calling this on an already used allocator
    /// discards all previous allocations.
    ///
    /// # Errors
    /// If the heap cannot even hold the initial extension, [`Exhausted`] is
    /// returned and the allocator stays uninitialized.
    pub fn init(&mut self) -> Result<(), Exhausted> {
        self.initialized = false;
        self.free_lists.clear();
        self.heap.reset();

        let start = self.heap.sbrk(SENTINEL_SIZE).map_err(|err| {
            log::warn!("cannot initialize heap: {err}");
            err
        })?;
        self.heap.set_tag(start, Tag::free(0)); // alignment padding
        self.heap.set_tag(start + WORD, Tag::used(DWORD)); // prologue header
        self.heap.set_tag(start + 2 * WORD, Tag::used(DWORD)); // prologue footer
        self.heap.set_tag(start + 3 * WORD, Tag::used(0)); // epilogue header

        if self.extend_heap(INITIAL_EXTENSION).is_none() {
            return Err(Exhausted {
                requested: INITIAL_EXTENSION,
                available: N - self.heap.size(),
            });
        }
        self.initialized = true;
        log::debug!("initialized heap of {} bytes (capacity {N})", self.heap.size());
        Ok(())
    }

    /// Whether the heap has been set up already.
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The number of bytes the heap has grown to so far.
    pub const fn heap_size(&self) -> usize {
        self.heap.size()
    }

    fn ensure_initialized(&mut self) -> Option<()> {
        if !self.initialized {
            self.init().ok()?;
        }
        Some(())
    }

    /// Allocate a new memory block of size `n`.
    ///
    /// The size classes are searched starting with the class of the request.
    /// Inside of a class the first block, that is large enough, is used. As
    /// the classes are sorted, this is the best fit of that class. If no class
    /// has a fitting block, the heap is extended.
    ///
    /// A request of zero bytes as well as an exhausted heap result in `None`.
    /// In both cases the allocator is unchanged.
    pub fn alloc(&mut self, n: usize) -> Option<Payload> {
        if n == 0 {
            return None;
        }
        self.ensure_initialized()?;

        let size = block_size_for(n).filter(|&size| size <= N)?;
        let bp = match self.find_fit(size) {
            Some(bp) => bp,
            None => self.extend_heap(size.max(CHUNK_SIZE))?,
        };
        let bp = self.place(bp, size);
        log::trace!("alloc({n}) -> {bp}");
        Some(Payload(bp))
    }

    /// Free a previously allocated block.
    ///
    /// The block is marked as free, linked into its size class and merged
    /// with its physical neighbors, if those are free as well.
    ///
    /// # Errors
    /// The offset is validated before anything is changed: if it is not the
    /// payload of a block, [`FreeError::AllocationNotFound`] is reported. If
    /// the block is already free, [`FreeError::DoubleFreeDetected`] is
    /// reported.
    pub fn free(&mut self, ptr: Payload) -> Result<(), FreeError> {
        let bp = self.validate(ptr).map_err(|err| {
            log::warn!("rejected free: {err}");
            err
        })?;
        self.release(bp);
        log::trace!("free({bp})");
        Ok(())
    }

    /// Resize an allocation to `n` bytes.
    ///
    /// A `None` pointer is a plain [`alloc()`](Self::alloc), a size of zero a
    /// plain [`free()`](Self::free) (returning `Ok(None)`). A block large
    /// enough already is kept as is. Otherwise the block tries to absorb its
    /// free physical neighbors. Only if that does not suffice, a new block is
    /// allocated and the old one is freed. The contents are preserved up to
    /// the smaller of the old and new size.
    ///
    /// `Ok(None)` is returned, if the heap is exhausted. The old allocation is
    /// still valid and unchanged in that case.
    ///
    /// # Errors
    /// Same as [`free()`](Self::free).
    pub fn realloc(&mut self, ptr: Option<Payload>, n: usize) -> Result<Option<Payload>, FreeError> {
        let Some(ptr) = ptr else {
            return Ok(self.alloc(n));
        };
        if n == 0 {
            self.free(ptr)?;
            return Ok(None);
        }
        let bp = self.validate(ptr)?;

        let old_size = self.heap.header(bp).size();
        let Some(size) = block_size_for(n).filter(|&size| size <= N) else {
            return Ok(None);
        };
        if size <= old_size {
            self.heap.write_block(bp, Tag::used(old_size));
            return Ok(Some(ptr));
        }

        if let Some(new_bp) = self.grow_in_place(bp, size) {
            if new_bp != bp {
                self.heap.copy(bp, new_bp, old_size - DWORD);
            }
            log::trace!("realloc({bp}, {n}) -> {new_bp} (grown in place)");
            return Ok(Some(Payload(new_bp)));
        }

        let Some(new) = self.alloc(n) else {
            log::warn!("realloc({bp}, {n}) failed, heap exhausted");
            return Ok(None);
        };
        self.heap.copy(bp, new.0, old_size - DWORD);
        self.release(bp);
        log::trace!("realloc({bp}, {n}) -> {} (moved)", new.0);
        Ok(Some(new))
    }

    /// The number of payload bytes usable through `ptr`.
    ///
    /// This is at least the size requested, but may be more.
    pub fn usable_size(&self, ptr: Payload) -> Option<usize> {
        let bp = self.validate(ptr).ok()?;
        Some(self.heap.header(bp).size() - DWORD)
    }

    /// The payload memory of an allocation.
    ///
    /// Returns `None` if `ptr` is not a live allocation.
    pub fn memory_of(&self, ptr: Payload) -> Option<&[u8]> {
        let len = self.usable_size(ptr)?;
        Some(self.heap.bytes(ptr.0..ptr.0 + len))
    }

    /// The mutable payload memory of an allocation.
    ///
    /// Returns `None` if `ptr` is not a live allocation.
    pub fn memory_of_mut(&mut self, ptr: Payload) -> Option<&mut [u8]> {
        let len = self.usable_size(ptr)?;
        Some(self.heap.bytes_mut(ptr.0..ptr.0 + len))
    }

    /// A raw pointer to the first payload byte of `ptr`.
    pub(crate) fn as_mut_ptr(&self, ptr: Payload) -> *mut u8 {
        self.heap.as_mut_ptr(ptr.0)
    }

    /// The payload offset of a raw pointer previously obtained through
    /// [`as_mut_ptr()`](Self::as_mut_ptr).
    pub(crate) fn payload_of(&self, ptr: *mut u8) -> Payload {
        let base = self.heap.as_mut_ptr(0) as usize;
        Payload((ptr as usize).wrapping_sub(base))
    }

    /// Check, that `ptr` is the payload of an allocated block.
    fn validate(&self, ptr: Payload) -> Result<usize, FreeError> {
        let bp = ptr.0;
        let not_found = FreeError::AllocationNotFound(bp);
        if !self.initialized || bp % ALIGNMENT != 0 || bp < FIRST_BLOCK || bp >= self.heap.size() {
            return Err(not_found);
        }
        let header = self.heap.header(bp);
        let size = header.size();
        if size < MIN_BLOCK_SIZE || bp + size > self.heap.size() {
            return Err(not_found);
        }
        if self.heap.footer(bp) != header {
            return Err(not_found);
        }
        if header.is_free() {
            return Err(FreeError::DoubleFreeDetected(bp));
        }
        Ok(bp)
    }

    /// Search the size classes for a free block of at least `size` bytes.
    fn find_fit(&self, size: usize) -> Option<usize> {
        (bucket_for(size)..BUCKET_COUNT).find_map(|bucket| {
            self.free_lists
                .iter(&self.heap, bucket)
                .find(|&bp| self.heap.header(bp).size() >= size)
        })
    }

    /// Allocate `size` bytes of the free block `bp`.
    ///
    /// The block is split, if the rest is large enough to form a free block on
    /// its own. Otherwise the whole block is handed out.
    fn place(&mut self, bp: usize, size: usize) -> usize {
        let block_size = self.heap.header(bp).size();
        let rest = block_size - size;
        self.free_lists.remove(&mut self.heap, bp);

        if rest < MIN_BLOCK_SIZE {
            self.heap.write_block(bp, Tag::used(block_size));
        } else {
            self.heap.write_block(bp, Tag::used(size));
            let remainder = bp + size;
            self.heap.write_block(remainder, Tag::free(rest));
            self.free_lists.insert(&mut self.heap, remainder);
        }
        bp
    }

    /// Mark an allocated block as free and merge it with its neighbors.
    fn release(&mut self, bp: usize) {
        let size = self.heap.header(bp).size();
        self.heap.write_block(bp, Tag::free(size));
        self.free_lists.insert(&mut self.heap, bp);
        self.coalesce(bp);
    }

    /// Whether the block in front of `bp` is allocated.
    ///
    /// This is read from the footer of that block. The prologue counts as
    /// allocated.
    fn prev_allocated(&self, bp: usize) -> bool {
        self.heap.prev_footer(bp).map_or(true, Tag::is_allocated)
    }

    /// Merge the free (and listed) block `bp` with its free neighbors.
    ///
    /// Returns the payload offset of the merged block, which is different from
    /// `bp`, if the block was merged into its predecessor.
    fn coalesce(&mut self, bp: usize) -> usize {
        let next = self.heap.next_block(bp);
        let prev_free = !self.prev_allocated(bp);
        let next_free = self.heap.header(next).is_free();
        if !prev_free && !next_free {
            return bp;
        }

        let mut start = bp;
        let mut size = self.heap.header(bp).size();
        self.free_lists.remove(&mut self.heap, bp);
        if next_free {
            size += self.heap.header(next).size();
            self.free_lists.remove(&mut self.heap, next);
        }
        if prev_free {
            if let Some(prev) = self.heap.prev_block(bp) {
                size += self.heap.header(prev).size();
                self.free_lists.remove(&mut self.heap, prev);
                start = prev;
            }
        }

        self.heap.write_block(start, Tag::free(size));
        self.free_lists.insert(&mut self.heap, start);
        start
    }

    /// Let the allocated block `bp` absorb free neighbors to reach `size`.
    ///
    /// Nothing is changed, if the neighbors are allocated or too small, in
    /// which case `None` is returned. Otherwise the payload offset of the grown
    /// block is returned, which is the offset of the predecessor, if that was
    /// absorbed. The payload itself is not moved.
    fn grow_in_place(&mut self, bp: usize, size: usize) -> Option<usize> {
        let next = self.heap.next_block(bp);
        let next_size = self.heap.header(next);
        let next_size = if next_size.is_free() { next_size.size() } else { 0 };
        let (prev, prev_size) = match self.heap.prev_block(bp) {
            Some(prev) if !self.prev_allocated(bp) => (prev, self.heap.header(prev).size()),
            _ => (bp, 0),
        };
        if prev_size == 0 && next_size == 0 {
            return None;
        }

        let total = prev_size + self.heap.header(bp).size() + next_size;
        if total < size {
            return None;
        }
        if next_size != 0 {
            self.free_lists.remove(&mut self.heap, next);
        }
        if prev_size != 0 {
            self.free_lists.remove(&mut self.heap, prev);
        }
        self.heap.write_block(prev, Tag::used(total));
        Some(prev)
    }

    /// Grow the heap by (at least) `size` bytes.
    ///
    /// The new bytes form a free block in place of the old epilogue, which is
    /// merged with the last block of the heap, if that is free. The payload
    /// offset of the resulting free block is returned or `None`, if the heap
    /// cannot grow anymore.
    fn extend_heap(&mut self, size: usize) -> Option<usize> {
        let size = align(size)?;
        let bp = match self.heap.sbrk(size) {
            Ok(bp) => bp,
            Err(err) => {
                log::warn!("cannot extend heap: {err}");
                return None;
            }
        };
        log::debug!("extended heap by {size} bytes to {}", self.heap.size());

        self.heap.write_block(bp, Tag::free(size));
        self.heap.set_tag(bp + size - WORD, Tag::used(0)); // new epilogue
        self.free_lists.insert(&mut self.heap, bp);
        Some(self.coalesce(bp))
    }
}
