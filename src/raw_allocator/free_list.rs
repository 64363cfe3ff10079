//! The segregated free-list index.
//!
//! Free blocks are grouped into [`BUCKET_COUNT`] size classes. Every class is
//! a doubly-linked list, whose nodes are the free blocks themselves: the first
//! payload word holds the offset of the predecessor, the second word the
//! offset of the successor. Inside a class the blocks are sorted by ascending
//! size, so the first block large enough for a request is also the smallest
//! one of that class.
use super::buffer::{Buffer, Link};
use super::tag::WORD;

use core::num::NonZeroU32;

/// The number of size classes.
pub const BUCKET_COUNT: usize = 20;

/// The exclusive upper size bound of every size class but the last one.
///
/// Class `k` holds the blocks with sizes in `[2^(k + 4), 2^(k + 5))`, the
/// first class additionally every smaller size and the last class every size
/// not covered by the others.
const CLASS_LIMITS: [usize; BUCKET_COUNT - 1] = [
    1 << 5,
    1 << 6,
    1 << 7,
    1 << 8,
    1 << 9,
    1 << 10,
    1 << 11,
    1 << 12,
    1 << 13,
    1 << 14,
    1 << 15,
    1 << 16,
    1 << 17,
    1 << 18,
    1 << 19,
    1 << 20,
    1 << 21,
    1 << 22,
    1 << 23,
];

/// The size class of a block of `size` bytes.
pub fn bucket_for(size: usize) -> usize {
    CLASS_LIMITS
        .iter()
        .position(|&limit| size < limit)
        .unwrap_or(BUCKET_COUNT - 1)
}

/// Offset of the predecessor link inside of a free block.
const fn pred_of(bp: usize) -> usize {
    bp
}

/// Offset of the successor link inside of a free block.
const fn succ_of(bp: usize) -> usize {
    bp + WORD
}

fn to_link(bp: usize) -> Link {
    u32::try_from(bp).ok().and_then(NonZeroU32::new)
}

fn from_link(link: NonZeroU32) -> usize {
    link.get() as usize
}

/// The heads of all size classes.
pub struct FreeLists {
    heads: [Link; BUCKET_COUNT],
}
impl FreeLists {
    /// Create an index with all classes empty.
    pub const fn new() -> Self {
        Self {
            heads: [None; BUCKET_COUNT],
        }
    }

    /// Forget all blocks.
    pub fn clear(&mut self) {
        self.heads = [None; BUCKET_COUNT];
    }

    /// The first (smallest) block of a size class.
    pub fn head(&self, bucket: usize) -> Option<usize> {
        self.heads[bucket].map(from_link)
    }

    /// Insert the free block `bp` into the class matching its size.
    ///
    /// The block is linked in front of the first block, that is at least as
    /// large as itself. The header of `bp` must already hold the final size.
    pub fn insert<const N: usize>(&mut self, heap: &mut Buffer<N>, bp: usize) {
        let size = heap.header(bp).size();
        let bucket = bucket_for(size);

        let mut pred = None;
        let mut succ = self.head(bucket);
        while let Some(node) = succ {
            if heap.header(node).size() >= size {
                break;
            }
            pred = Some(node);
            succ = heap.link(succ_of(node)).map(from_link);
        }

        heap.set_link(pred_of(bp), pred.and_then(to_link));
        heap.set_link(succ_of(bp), succ.and_then(to_link));
        match pred {
            Some(pred) => heap.set_link(succ_of(pred), to_link(bp)),
            None => self.heads[bucket] = to_link(bp),
        }
        if let Some(succ) = succ {
            heap.set_link(pred_of(succ), to_link(bp));
        }
    }

    /// Unlink the free block `bp` from its class.
    ///
    /// The header of `bp` must still hold the size the block was inserted
    /// with, since that determines the class.
    pub fn remove<const N: usize>(&mut self, heap: &mut Buffer<N>, bp: usize) {
        let bucket = bucket_for(heap.header(bp).size());
        let pred = heap.link(pred_of(bp));
        let succ = heap.link(succ_of(bp));

        match pred {
            Some(pred) => heap.set_link(succ_of(from_link(pred)), succ),
            None => {
                debug_assert_eq!(self.head(bucket), Some(bp), "unlinked block without predecessor");
                self.heads[bucket] = succ;
            }
        }
        if let Some(succ) = succ {
            heap.set_link(pred_of(from_link(succ)), pred);
        }
    }

    /// Iterate over the blocks of a size class in ascending size order.
    pub fn iter<'a, const N: usize>(&self, heap: &'a Buffer<N>, bucket: usize) -> ListIter<'a, N> {
        ListIter {
            heap,
            next: self.head(bucket),
        }
    }

    /// The predecessor of `bp` inside of its class.
    pub fn pred<const N: usize>(heap: &Buffer<N>, bp: usize) -> Option<usize> {
        heap.link(pred_of(bp)).map(from_link)
    }

    /// The successor of `bp` inside of its class.
    pub fn succ<const N: usize>(heap: &Buffer<N>, bp: usize) -> Option<usize> {
        heap.link(succ_of(bp)).map(from_link)
    }
}

/// An iterator following the successor links of a size class.
pub struct ListIter<'a, const N: usize> {
    heap: &'a Buffer<N>,
    next: Option<usize>,
}
impl<'a, const N: usize> Iterator for ListIter<'a, N> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let bp = self.next?;
        self.next = FreeLists::succ(self.heap, bp);
        Some(bp)
    }
}
