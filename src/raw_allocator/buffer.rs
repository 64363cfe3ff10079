use super::tag::{Tag, DWORD, WORD};

use core::cell::UnsafeCell;
use core::num::NonZeroU32;
use core::ops::Range;
use core::{ptr, slice};

/// The heap could not be grown by the requested amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("heap exhausted: requested {requested} more bytes, but only {available} are left")]
pub struct Exhausted {
    /// The number of bytes the heap should have been grown by.
    pub requested: usize,
    /// The number of bytes the heap could still grow by.
    pub available: usize,
}

/// A link field inside of a free block: the payload offset of another block.
///
/// The offset `0` is never a payload (it is the alignment padding in front of
/// the prologue), therefore it encodes "no link".
pub type Link = Option<NonZeroU32>;

/// The raw bytes, aligned to 8 so that all aligned offsets are aligned
/// addresses as well.
#[repr(align(8))]
struct Memory<const N: usize>(UnsafeCell<[u8; N]>);

/// The heap region backing the allocator.
///
/// This is the growth primitive of the allocator: a fixed backing array of `N`
/// bytes of which only the first [`size()`](Self::size) bytes are in use. The
/// in-use part grows monotonically via [`sbrk()`](Self::sbrk) and never
/// shrinks (except for a full [`reset()`](Self::reset)).
///
/// All metadata accessors take byte offsets and check them against the current
/// break. The bytes are kept in an [`UnsafeCell`], so that pointers handed out
/// to clients never alias a reference held by the allocator.
pub struct Buffer<const N: usize> {
    memory: Memory<N>,
    brk: usize,
}
impl<const N: usize> Buffer<N> {
    /// Create a new, empty heap region.
    ///
    /// # Panics
    /// This function panics, if `N` does not fit into a 32-bit word, since all
    /// sizes and links are stored as words.
    pub const fn new() -> Self {
        assert!(N <= u32::MAX as usize, "heap too large: maximum size is 4 GiB");
        Self {
            memory: Memory(UnsafeCell::new([0; N])),
            brk: 0,
        }
    }

    /// Grow the heap by `delta` bytes.
    ///
    /// On success the offset of the first new byte (i.e. the old break) is
    /// returned. On failure nothing is changed.
    pub fn sbrk(&mut self, delta: usize) -> Result<usize, Exhausted> {
        let available = N - self.brk;
        if delta > available {
            return Err(Exhausted {
                requested: delta,
                available,
            });
        }
        let old = self.brk;
        self.brk += delta;
        Ok(old)
    }

    /// Drop the whole heap, i.e. move the break back to the start.
    pub fn reset(&mut self) {
        self.brk = 0;
    }

    /// The number of bytes currently in use by the heap.
    pub const fn size(&self) -> usize {
        self.brk
    }

    /// The offset of the first byte of the heap.
    pub const fn low(&self) -> usize {
        0
    }

    /// The offset of the last byte of the heap.
    pub const fn high(&self) -> usize {
        self.brk.saturating_sub(1)
    }

    /// Obtain a raw pointer to the byte at `offset`.
    ///
    /// # Panics
    /// This function panics if the offset lies past the current break.
    pub fn as_mut_ptr(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.brk, "offset {offset} outside of heap");
        // SAFETY: the offset is inside (or one past) the backing array, which
        // is checked by the assertion above, since `brk <= N` always holds.
        unsafe { self.base().add(offset) }
    }

    fn base(&self) -> *mut u8 {
        self.memory.0.get().cast::<u8>()
    }

    /// Read the word at `offset`.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of 4 or the word
    /// would not be in the heap.
    fn word(&self, offset: usize) -> [u8; WORD] {
        assert!(offset % WORD == 0, "unaligned word at {offset}");
        assert!(offset + WORD <= self.brk, "word at {offset} outside of heap");

        // SAFETY: the bounds are checked by the assertions above. A byte array
        // has an alignment of 1, so any offset is suitably aligned.
        unsafe { ptr::read(self.base().add(offset).cast::<[u8; WORD]>()) }
    }

    /// Write the word at `offset`.
    ///
    /// # Panics
    /// Same as [`word()`](Self::word).
    fn set_word(&mut self, offset: usize, word: [u8; WORD]) {
        assert!(offset % WORD == 0, "unaligned word at {offset}");
        assert!(offset + WORD <= self.brk, "word at {offset} outside of heap");

        // SAFETY: same as `word()`
        unsafe { ptr::write(self.base().add(offset).cast::<[u8; WORD]>(), word) }
    }

    /// Read the boundary tag stored at `offset`.
    pub fn tag(&self, offset: usize) -> Tag {
        Tag::from_raw(self.word(offset))
    }

    /// Store a boundary tag at `offset`.
    pub fn set_tag(&mut self, offset: usize, tag: Tag) {
        self.set_word(offset, tag.as_raw());
    }

    /// Read the link field stored at `offset`.
    pub fn link(&self, offset: usize) -> Link {
        NonZeroU32::new(u32::from_ne_bytes(self.word(offset)))
    }

    /// Store a link field at `offset`.
    pub fn set_link(&mut self, offset: usize, link: Link) {
        let raw = link.map_or(0, NonZeroU32::get);
        self.set_word(offset, raw.to_ne_bytes());
    }

    /// The header of the block with payload offset `bp`.
    pub fn header(&self, bp: usize) -> Tag {
        self.tag(bp - WORD)
    }

    /// The footer of the block with payload offset `bp`.
    ///
    /// The position of the footer is derived from the size in the header.
    pub fn footer(&self, bp: usize) -> Tag {
        let size = self.header(bp).size();
        self.tag(bp + size - DWORD)
    }

    /// Write the same tag into the header and the footer of a block.
    pub fn write_block(&mut self, bp: usize, tag: Tag) {
        self.set_tag(bp - WORD, tag);
        self.set_tag(bp + tag.size() - DWORD, tag);
    }

    /// The payload offset of the block physically following `bp`.
    pub fn next_block(&self, bp: usize) -> usize {
        bp + self.header(bp).size()
    }

    /// The footer of the block physically preceding `bp`.
    ///
    /// The footer lies directly in front of the header of `bp`. `None` is
    /// returned, if that would be below the heap (i.e. for the prologue).
    pub fn prev_footer(&self, bp: usize) -> Option<Tag> {
        let at = bp.checked_sub(DWORD)?;
        (at >= self.low() + WORD).then(|| self.tag(at))
    }

    /// The payload offset of the block physically preceding `bp`.
    pub fn prev_block(&self, bp: usize) -> Option<usize> {
        match self.prev_footer(bp)?.size() {
            0 => None,
            size => bp.checked_sub(size),
        }
    }

    /// The bytes in the given range.
    ///
    /// # Panics
    /// This function panics if the range is not completely inside the heap.
    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        assert!(range.start <= range.end && range.end <= self.brk);
        // SAFETY: the range is inside the initialized backing array (checked
        // above). The returned slice borrows `self`, so the allocator cannot
        // modify the heap while the slice is alive.
        unsafe { slice::from_raw_parts(self.base().add(range.start), range.len()) }
    }

    /// The mutable bytes in the given range.
    ///
    /// # Panics
    /// This function panics if the range is not completely inside the heap.
    pub fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        assert!(range.start <= range.end && range.end <= self.brk);
        // SAFETY: same as `bytes()`, the exclusive borrow of `self` makes this
        // slice the only reference into the heap.
        unsafe { slice::from_raw_parts_mut(self.base().add(range.start), range.len()) }
    }

    /// Copy `len` bytes from `src` to `dst`. The two ranges may overlap.
    ///
    /// # Panics
    /// This function panics if any of the ranges is not inside the heap.
    pub fn copy(&mut self, src: usize, dst: usize, len: usize) {
        assert!(src + len <= self.brk && dst + len <= self.brk);
        // SAFETY: both ranges are inside the heap (checked above) and
        // `ptr::copy` allows overlapping ranges.
        unsafe { ptr::copy(self.base().add(src), self.base().add(dst), len) }
    }

    /// Iterate over all blocks starting with the one at payload offset `bp`.
    pub fn blocks(&self, bp: usize) -> BlockIter<N> {
        BlockIter::new(self, bp)
    }
}

/// An iterator over the physical blocks of the heap.
///
/// It yields the payload offset and the header of every block. The iteration
/// stops at the epilogue (a block of size zero) or as soon as a header would
/// lie outside of the heap. [`position()`](Self::position) tells, where the
/// iteration stopped.
pub struct BlockIter<'buffer, const N: usize> {
    buffer: &'buffer Buffer<N>,
    offset: usize,
}
impl<'buffer, const N: usize> BlockIter<'buffer, N> {
    /// Create a block iterator over the given [`Buffer`].
    pub const fn new(buffer: &'buffer Buffer<N>, bp: usize) -> Self {
        Self { buffer, offset: bp }
    }

    /// The payload offset of the block that would be read next.
    pub const fn position(&self) -> usize {
        self.offset
    }
}
impl<'buffer, const N: usize> Iterator for BlockIter<'buffer, N> {
    type Item = (usize, Tag);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset < WORD || self.offset > self.buffer.size() || self.offset % WORD != 0 {
            return None;
        }
        let tag = self.buffer.header(self.offset);
        if tag.size() == 0 {
            return None;
        }
        let bp = self.offset;
        self.offset += tag.size();
        Some((bp, tag))
    }
}
