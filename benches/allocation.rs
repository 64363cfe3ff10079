#![feature(test)]
extern crate test;
use test::Bencher;

use std::alloc::{GlobalAlloc as _, Layout};

mod repeated_allocation_deallocation {
    use super::*;

    /// Run a benchmark, which repeatedly allocates and deallocates the same
    /// block. The benchmark will allocate the given amount of blocks beforehand
    /// (before running the actual benchmark) in order to fill up the free lists
    /// with unrelated blocks.
    ///
    /// Every second pre-allocation is freed again, so that the size classes
    /// contain many small free blocks the search has to skip.
    ///
    /// # Panics
    /// This will panic, if the requested pre-allocations will fill up the whole
    /// heap (so the actual benchmark cannot allocate blocks anymore).
    fn benchmark_with_preallocation(b: &mut Bencher, pre_allocations: usize) {
        let allocator = segalloc::Allocator::<{ 512 * 1024 }>::new();
        let small = Layout::new::<u8>();
        let pointers: Vec<_> = (0..pre_allocations)
            .map(|_| unsafe { allocator.alloc(small) })
            .collect();
        for &ptr in pointers.iter().step_by(2) {
            unsafe { allocator.dealloc(ptr, small) };
        }

        let layout = Layout::from_size_align(256, 8).unwrap();

        // make sure, that there is enough room for the next allocation
        let ptr = unsafe { allocator.alloc(layout) };
        assert_ne!(ptr, std::ptr::null_mut::<u8>());
        unsafe { allocator.dealloc(ptr, layout) };

        // run actual benchmark: allocate & deallocate the same block repeatedly
        b.iter(|| {
            let ptr = unsafe { allocator.alloc(layout) };
            let ptr = test::black_box(ptr);
            unsafe { allocator.dealloc(ptr, layout) };
        });
    }

    #[bench]
    fn no_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 0);
    }

    #[bench]
    fn low_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 8);
    }

    #[bench]
    fn medium_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 510);
    }

    #[bench]
    fn high_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 8190);
    }
}

mod reallocation {
    use super::*;

    #[bench]
    fn grow_in_place(b: &mut Bencher) {
        let allocator = segalloc::Allocator::<{ 512 * 1024 }>::new();
        let layout = Layout::from_size_align(16, 8).unwrap();

        b.iter(|| unsafe {
            let mut ptr = allocator.alloc(layout);
            let mut old = layout;
            for size in (32..4096).step_by(64) {
                ptr = allocator.realloc(ptr, old, size);
                old = Layout::from_size_align_unchecked(size, 8);
            }
            allocator.dealloc(test::black_box(ptr), old);
        });
    }
}
