//! Mapping from request sizes to size classes.
//!
//! Class `i` holds blocks of `(i + 1) * ALIGNMENT` bytes and serves every
//! request in `(i * ALIGNMENT, (i + 1) * ALIGNMENT]`. Requests above
//! [`MAX_BYTES`] are "oversized" and never reach the pooled tiers.

use core::alloc::Layout;

use static_assertions::const_assert;

use crate::page_cache::PAGE_SIZE;

/// Granularity of every pooled block, in bytes.
pub const ALIGNMENT: usize = 8;

/// Largest request (inclusive) served by the pooled tiers.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes.
pub const FREE_LIST_SIZE: usize = MAX_BYTES / ALIGNMENT;

// A free block stores its successor link in its first word, so the smallest
// class must be able to hold a pointer.
const_assert!(ALIGNMENT >= core::mem::size_of::<usize>());
const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(MAX_BYTES % ALIGNMENT == 0);
const_assert!(PAGE_SIZE % ALIGNMENT == 0);

/// Round `size` up to the nearest multiple of [`ALIGNMENT`].
pub const fn round_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Zero-sized requests are served as the smallest class.
pub const fn normalize(size: usize) -> usize {
    if size == 0 {
        ALIGNMENT
    } else {
        size
    }
}

/// The size class serving `size`.
///
/// `size` must be in `1..=MAX_BYTES`; callers check [`is_oversized`] first.
pub const fn class_index(size: usize) -> usize {
    round_up(size) / ALIGNMENT - 1
}

/// The block size handed out by class `index`.
pub const fn block_size(index: usize) -> usize {
    (index + 1) * ALIGNMENT
}

pub const fn is_oversized(size: usize) -> bool {
    size > MAX_BYTES
}

/// The layout used when an oversized request is passed to the system
/// allocator. Allocation and deallocation must agree on it, so both sides go
/// through here.
pub fn oversize_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, ALIGNMENT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(9), 16);
        assert_eq!(round_up(MAX_BYTES - 1), MAX_BYTES);
        assert_eq!(round_up(MAX_BYTES), MAX_BYTES);
    }

    #[test]
    fn test_class_index_exact_and_rounded() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(8), 0);
        assert_eq!(class_index(9), 1);
        assert_eq!(class_index(16), 1);
        assert_eq!(class_index(17), 2);
        assert_eq!(class_index(MAX_BYTES), FREE_LIST_SIZE - 1);
    }

    #[test]
    fn test_block_size_roundtrip() {
        for index in 0..FREE_LIST_SIZE {
            let size = block_size(index);
            assert_eq!(size % ALIGNMENT, 0);
            assert_eq!(class_index(size), index);
        }
    }

    #[test]
    fn test_same_class_same_block() {
        // Every size in a class rounds to the same block.
        for size in 1..=4096 {
            let index = class_index(size);
            assert_eq!(round_up(size), block_size(index));
            assert!(block_size(index) >= size);
            assert!(block_size(index) - size < ALIGNMENT);
        }
    }

    #[test]
    fn test_monotonic() {
        let mut last = class_index(1);
        for size in 2..=MAX_BYTES {
            let index = class_index(size);
            assert!(index == last || index == last + 1);
            last = index;
        }
    }

    #[test]
    fn test_oversize_boundary() {
        assert!(!is_oversized(MAX_BYTES));
        assert!(is_oversized(MAX_BYTES + 1));
        assert_eq!(normalize(0), ALIGNMENT);
        assert_eq!(normalize(3), 3);

        let layout = oversize_layout(MAX_BYTES + 1).unwrap();
        assert_eq!(layout.size(), MAX_BYTES + 1);
        assert_eq!(layout.align(), ALIGNMENT);
    }
}
