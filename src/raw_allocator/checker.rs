//! The heap consistency checker.
//!
//! The checker walks the physical heap and the free lists independently and
//! cross-validates the results. It only reads, never allocates and reports the
//! first violation found. A violation always means, that the metadata of the
//! allocator is corrupted.
use super::free_list::{bucket_for, FreeLists, BUCKET_COUNT};
use super::tag::{Tag, ALIGNMENT, DWORD, MIN_BLOCK_SIZE, WORD};
use super::{RawAllocator, FIRST_BLOCK, SENTINEL_SIZE};

/// A broken heap invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// The prologue or epilogue is damaged or the block walk does not end at
    /// the epilogue.
    #[error("prologue or epilogue damaged")]
    BrokenSentinel,
    /// A block lies (partially) outside of the heap.
    #[error("block at {0} lies outside of the heap")]
    OutOfBounds(usize),
    /// A payload offset is not aligned or a block is smaller than the minimum.
    #[error("block at {0} is misaligned or too small")]
    Misaligned(usize),
    /// Header and footer of a block differ.
    #[error("header and footer of the block at {0} differ")]
    TagMismatch(usize),
    /// Two physically adjacent blocks are both free.
    #[error("adjacent free blocks at {0} and {1}")]
    Uncoalesced(usize, usize),
    /// A free block is not linked into its size class.
    #[error("free block at {0} is not in its free list")]
    NotListed(usize),
    /// An allocated block is linked into a size class.
    #[error("allocated block at {0} is in free list {1}")]
    AllocatedInList(usize, usize),
    /// A free block is linked into a size class not matching its size.
    #[error("block at {0} is in the wrong free list {1}")]
    WrongBucket(usize, usize),
    /// A size class is not sorted by ascending size.
    #[error("free list {0} is not sorted at block {1}")]
    Unsorted(usize, usize),
    /// The predecessor link of a block does not match the list order or the
    /// list does not terminate.
    #[error("free list links of the block at {0} are broken")]
    BrokenLink(usize),
    /// The number of listed blocks and free blocks in the heap differ.
    #[error("{listed} blocks are listed, but the heap has {free} free blocks")]
    CountMismatch { listed: usize, free: usize },
}

impl<const N: usize> RawAllocator<N> {
    /// Verify all heap invariants.
    ///
    /// An uninitialized allocator is always consistent.
    ///
    /// # Errors
    /// The first [`Violation`] found is reported.
    pub fn check(&self) -> Result<(), Violation> {
        if !self.initialized {
            return Ok(());
        }
        let result = self.check_sentinels().and_then(|()| {
            let listed = self.check_lists()?;
            let free = self.check_heap()?;
            if listed == free {
                Ok(())
            } else {
                Err(Violation::CountMismatch { listed, free })
            }
        });
        if let Err(violation) = result {
            log::error!("heap inconsistent: {violation}");
        }
        result
    }

    fn check_sentinels(&self) -> Result<(), Violation> {
        let size = self.heap.size();
        if size < SENTINEL_SIZE
            || self.heap.tag(WORD) != Tag::used(DWORD)
            || self.heap.tag(2 * WORD) != Tag::used(DWORD)
            || self.heap.tag(size - WORD) != Tag::used(0)
        {
            return Err(Violation::BrokenSentinel);
        }
        Ok(())
    }

    /// Check a single block and return its (validated) header.
    fn check_block(&self, bp: usize) -> Result<Tag, Violation> {
        if bp < FIRST_BLOCK || bp >= self.heap.size() {
            return Err(Violation::OutOfBounds(bp));
        }
        if bp % ALIGNMENT != 0 {
            return Err(Violation::Misaligned(bp));
        }
        let header = self.heap.header(bp);
        if header.size() < MIN_BLOCK_SIZE {
            return Err(Violation::Misaligned(bp));
        }
        if bp - WORD < self.heap.low() || bp + header.size() - 1 > self.heap.high() {
            return Err(Violation::OutOfBounds(bp));
        }
        if self.heap.footer(bp) != header {
            return Err(Violation::TagMismatch(bp));
        }
        Ok(header)
    }

    /// Walk all size classes and count the listed blocks.
    fn check_lists(&self) -> Result<usize, Violation> {
        let limit = self.heap.size() / MIN_BLOCK_SIZE;
        let mut listed = 0;
        for bucket in 0..BUCKET_COUNT {
            let mut pred = None;
            let mut last_size = 0;
            let mut node = self.free_lists.head(bucket);
            while let Some(bp) = node {
                if listed >= limit {
                    return Err(Violation::BrokenLink(bp));
                }
                let header = self.check_block(bp)?;
                if header.is_allocated() {
                    return Err(Violation::AllocatedInList(bp, bucket));
                }
                if bucket_for(header.size()) != bucket {
                    return Err(Violation::WrongBucket(bp, bucket));
                }
                if header.size() < last_size {
                    return Err(Violation::Unsorted(bucket, bp));
                }
                if FreeLists::pred(&self.heap, bp) != pred {
                    return Err(Violation::BrokenLink(bp));
                }

                listed += 1;
                last_size = header.size();
                pred = Some(bp);
                node = FreeLists::succ(&self.heap, bp);
            }
        }
        Ok(listed)
    }

    /// Walk all blocks of the heap and count the free ones.
    ///
    /// The free lists have to be validated before.
    fn check_heap(&self) -> Result<usize, Violation> {
        let mut free = 0;
        let mut prev_free = None;
        let mut blocks = self.heap.blocks(FIRST_BLOCK);
        for (bp, _) in &mut blocks {
            let header = self.check_block(bp)?;
            if header.is_free() {
                if let Some(prev) = prev_free {
                    return Err(Violation::Uncoalesced(prev, bp));
                }
                let bucket = bucket_for(header.size());
                if !self.free_lists.iter(&self.heap, bucket).any(|node| node == bp) {
                    return Err(Violation::NotListed(bp));
                }
                free += 1;
            }
            prev_free = header.is_free().then_some(bp);
        }
        if blocks.position() != self.heap.size() {
            return Err(Violation::BrokenSentinel);
        }
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::Violation;
    use crate::raw_allocator::buffer::Link;
    use crate::raw_allocator::tag::{Tag, DWORD, WORD};
    use crate::raw_allocator::{Payload, RawAllocator};

    use core::num::NonZeroU32;

    fn allocator() -> RawAllocator<8192> {
        let mut allocator = RawAllocator::new();
        allocator.init().unwrap();
        allocator
    }

    #[test]
    fn fresh_heap_is_consistent() {
        let allocator = allocator();
        assert_eq!(allocator.check(), Ok(()));
        assert_eq!(RawAllocator::<64>::new().check(), Ok(()));
    }

    #[test]
    fn detects_torn_tags() {
        let mut allocator = allocator();
        let p = allocator.alloc(40).unwrap().offset();
        let size = allocator.heap.header(p).size();
        allocator.heap.set_tag(p + size - DWORD, Tag::used(size + 8));
        assert_eq!(allocator.check(), Err(Violation::TagMismatch(p)));
    }

    #[test]
    fn detects_out_of_bounds_block() {
        let mut allocator = allocator();
        let p = allocator.alloc(40).unwrap().offset();
        allocator.heap.set_tag(p - WORD, Tag::used(1 << 20));
        assert_eq!(allocator.check(), Err(Violation::OutOfBounds(p)));
    }

    #[test]
    fn detects_missing_coalescing() {
        let mut allocator = allocator();
        let a = allocator.alloc(16).unwrap().offset();
        let b = allocator.alloc(16).unwrap().offset();
        let _guard = allocator.alloc(16).unwrap();
        allocator.free(Payload::from_offset(a)).unwrap();

        // free `b` behind the allocator's back, without merging
        let size = allocator.heap.header(b).size();
        allocator.heap.write_block(b, Tag::free(size));
        allocator.free_lists.insert(&mut allocator.heap, b);
        assert_eq!(allocator.check(), Err(Violation::Uncoalesced(a, b)));
    }

    #[test]
    fn detects_unlisted_free_block() {
        let mut allocator = allocator();
        let p = allocator.alloc(16).unwrap().offset();
        let _guard = allocator.alloc(16).unwrap();
        let size = allocator.heap.header(p).size();
        allocator.heap.write_block(p, Tag::free(size));
        assert_eq!(allocator.check(), Err(Violation::NotListed(p)));
    }

    fn link(offset: usize) -> Link {
        NonZeroU32::new(u32::try_from(offset).unwrap())
    }

    #[test]
    fn detects_successor_in_allocated_block() {
        let mut allocator = allocator();
        let a = allocator.alloc(16).unwrap().offset();
        let b = allocator.alloc(16).unwrap().offset();
        allocator.free(Payload::from_offset(a)).unwrap();
        assert_eq!(allocator.check(), Ok(()));

        allocator.heap.set_link(a + WORD, link(b));
        assert_eq!(allocator.check(), Err(Violation::AllocatedInList(b, 0)));
    }

    #[test]
    fn detects_broken_predecessor() {
        let mut allocator = allocator();
        let a = allocator.alloc(16).unwrap().offset();
        let b = allocator.alloc(16).unwrap().offset();
        let c = allocator.alloc(16).unwrap().offset();
        let _guard = allocator.alloc(16).unwrap();
        allocator.free(Payload::from_offset(a)).unwrap();
        allocator.free(Payload::from_offset(c)).unwrap();
        assert_eq!(allocator.check(), Ok(()));

        // the list is `c -> a`, so `a` must point back to `c`
        allocator.heap.set_link(a, link(b));
        assert_eq!(allocator.check(), Err(Violation::BrokenLink(a)));

        // the head must not have a predecessor
        allocator.heap.set_link(a, link(c));
        allocator.heap.set_link(c, link(a));
        assert_eq!(allocator.check(), Err(Violation::BrokenLink(c)));
    }

    #[test]
    fn detects_self_referencing_successor() {
        let mut allocator = allocator();
        let a = allocator.alloc(16).unwrap().offset();
        let _guard = allocator.alloc(16).unwrap();
        allocator.free(Payload::from_offset(a)).unwrap();

        allocator.heap.set_link(a + WORD, link(a));
        assert_eq!(allocator.check(), Err(Violation::BrokenLink(a)));
    }

    #[test]
    fn corrupted_links_are_reported() {
        let offsets = [4, 12, 16, 20, 40, 44, 64, 96, 528, 9000, u32::MAX as usize - 7];
        for offset in offsets {
            for field in [0, WORD] {
                let mut allocator = allocator();
                let a = allocator.alloc(16).unwrap().offset();
                let _b = allocator.alloc(16).unwrap();
                allocator.free(Payload::from_offset(a)).unwrap();

                allocator.heap.set_link(a + field, link(offset));
                assert!(
                    allocator.check().is_err(),
                    "link {field} of {a} set to {offset} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn detects_wrong_bucket() {
        let mut allocator = allocator();
        let a = allocator.alloc(16).unwrap().offset();
        let b = allocator.alloc(16).unwrap().offset();
        let _guard = allocator.alloc(16).unwrap();
        allocator.free(Payload::from_offset(a)).unwrap();

        // grow the listed block over `b`, so that it belongs into class 1
        let size = allocator.heap.header(a).size() + allocator.heap.header(b).size();
        allocator.heap.write_block(a, Tag::free(size));
        assert_eq!(allocator.check(), Err(Violation::WrongBucket(a, 0)));
    }

    #[test]
    fn detects_unsorted_list() {
        let mut allocator = allocator();
        let a = allocator.alloc(32).unwrap().offset();
        let _guard = allocator.alloc(16).unwrap();
        let b = allocator.alloc(48).unwrap().offset();
        let _guard = allocator.alloc(16).unwrap();
        allocator.free(Payload::from_offset(a)).unwrap();
        allocator.free(Payload::from_offset(b)).unwrap();
        assert_eq!(allocator.heap.header(a).size(), 40);
        assert_eq!(allocator.heap.header(b).size(), 56);
        assert_eq!(allocator.check(), Ok(()));

        // shrink the second node below the first one of the same class
        allocator.heap.write_block(b, Tag::free(32));
        assert_eq!(allocator.check(), Err(Violation::Unsorted(1, b)));
    }

    #[test]
    fn detects_listed_block_outside_of_the_heap_walk() {
        let mut allocator = allocator();
        let p = allocator.alloc(48).unwrap().offset();

        // forge a free block inside of the payload of `p` and list it
        let forged = p + 2 * DWORD;
        allocator.heap.write_block(forged, Tag::free(24));
        allocator.free_lists.insert(&mut allocator.heap, forged);
        assert_eq!(
            allocator.check(),
            Err(Violation::CountMismatch { listed: 2, free: 1 })
        );
    }

    #[test]
    fn detects_allocated_block_in_list() {
        let mut allocator = allocator();
        let p = allocator.alloc(16).unwrap().offset();
        allocator.free_lists.insert(&mut allocator.heap, p);
        assert_eq!(allocator.check(), Err(Violation::AllocatedInList(p, 0)));
    }

    #[test]
    fn detects_damaged_epilogue() {
        let mut allocator = allocator();
        let end = allocator.heap_size();
        allocator.heap.set_tag(end - WORD, Tag::free(0));
        assert_eq!(allocator.check(), Err(Violation::BrokenSentinel));
    }
}
