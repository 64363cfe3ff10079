//! The boundary tag stored in the header and footer of every block.
//!
//! A block looks like this (offsets relative to the payload offset `bp`):
//! ```text
//!  bp - 4     bp                                  bp + size - 8
//!  +--------+------------------------------------+--------+
//!  | header | payload (or pred/succ links)       | footer |
//!  +--------+------------------------------------+--------+
//!  ^--------------------- size ------------------------^
//! ```
//! Header and footer hold the same [`Tag`]. The footer lets the block after
//! this one find the start of this block by reading one word backwards.

/// The size of a single word, i.e. of a header, a footer or a link field.
pub const WORD: usize = 4;
/// The size of a double word, i.e. the header plus the footer overhead.
pub const DWORD: usize = 8;
/// Every payload offset and every block size is a multiple of this.
pub const ALIGNMENT: usize = 8;
/// The smallest block: header, two link fields and footer.
pub const MIN_BLOCK_SIZE: usize = 2 * DWORD;
/// The default amount of bytes the heap is extended by.
pub const CHUNK_SIZE: usize = 1 << 12;

const ALLOCATED: u32 = 0b1;
const SIZE_MASK: u32 = !(ALIGNMENT as u32 - 1);

/// Round `size` up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` if that would overflow.
pub const fn align(size: usize) -> Option<usize> {
    match size.checked_add(ALIGNMENT - 1) {
        Some(size) => Some(size & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// A packed pair of block size and allocated-bit.
///
/// The size always is a multiple of [`ALIGNMENT`], therefore the low bits are
/// free to hold the allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag(u32);
impl Tag {
    /// Create a tag for a free block of `size` bytes (including the tags).
    ///
    /// # Panics
    /// This function panics, if the size is not a multiple of [`ALIGNMENT`] or
    /// does not fit into a single word.
    pub const fn free(size: usize) -> Self {
        Self::new(size, false)
    }

    /// Create a tag for an allocated block of `size` bytes.
    ///
    /// # Panics
    /// Same as [`free()`](Self::free).
    pub const fn used(size: usize) -> Self {
        Self::new(size, true)
    }

    const fn new(size: usize, allocated: bool) -> Self {
        assert!(size % ALIGNMENT == 0, "block size must be aligned");
        assert!(size <= SIZE_MASK as usize, "block size exceeds a word");
        #[allow(clippy::cast_possible_truncation)] // checked above
        let size = size as u32;
        if allocated {
            Self(size | ALLOCATED)
        } else {
            Self(size)
        }
    }

    /// The full size of the block in bytes, header and footer included.
    pub const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    pub const fn is_free(self) -> bool {
        !self.is_allocated()
    }

    /// The in-memory representation of this tag.
    pub const fn as_raw(self) -> [u8; WORD] {
        self.0.to_ne_bytes()
    }

    /// Reinterpret a word read from the heap as a tag.
    pub const fn from_raw(raw: [u8; WORD]) -> Self {
        Self(u32::from_ne_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::{align, Tag, ALIGNMENT, MIN_BLOCK_SIZE};

    #[test]
    fn size_and_state() {
        let tag = Tag::free(24);
        assert_eq!(tag.size(), 24);
        assert!(tag.is_free());
        assert!(!tag.is_allocated());

        let tag = Tag::used(4096);
        assert_eq!(tag.size(), 4096);
        assert!(tag.is_allocated());
    }

    #[test]
    fn sentinel_tag() {
        let epilogue = Tag::used(0);
        assert_eq!(epilogue.size(), 0);
        assert!(epilogue.is_allocated());
    }

    #[test]
    fn raw_representation() {
        assert_eq!(Tag::used(16).as_raw(), 17u32.to_ne_bytes());
        assert_eq!(Tag::from_raw(17u32.to_ne_bytes()), Tag::used(16));
        assert_eq!(Tag::from_raw(Tag::free(32).as_raw()), Tag::free(32));
    }

    #[test]
    #[should_panic(expected = "block size must be aligned")]
    fn unaligned_size_is_rejected() {
        let _tag = Tag::free(MIN_BLOCK_SIZE + 1);
    }

    #[test]
    fn alignment() {
        assert_eq!(align(0), Some(0));
        assert_eq!(align(1), Some(ALIGNMENT));
        assert_eq!(align(8), Some(8));
        assert_eq!(align(13), Some(16));
        assert_eq!(align(usize::MAX), None);
    }
}
