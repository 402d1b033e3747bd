//! Constructing and destroying values of a type in pooled memory.
//!
//! This sits on top of [`allocate`](crate::allocate) and
//! [`deallocate`](crate::deallocate) and adds nothing to the allocator itself.

use core::alloc::Layout;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use std::alloc::{GlobalAlloc, System};

use crate::page_cache::PAGE_SIZE;
use crate::size_class::{is_oversized, ALIGNMENT};

// Blocks of a class sit at multiples of the block size from a page-aligned
// span start. A type's size is a multiple of its alignment, so a pooled block
// is aligned for `T` as long as that alignment does not exceed a page.
fn pooled<T>() -> bool {
    let align = align_of::<T>();
    align <= ALIGNMENT || (align <= PAGE_SIZE && !is_oversized(size_of::<T>()))
}

/// Move `value` into freshly allocated memory.
///
/// Returns `None` (dropping `value`) if no memory could be obtained.
/// Zero-sized types take no memory.
pub fn construct<T>(value: T) -> Option<NonNull<T>> {
    let ptr: NonNull<T> = if size_of::<T>() == 0 {
        NonNull::dangling()
    } else if pooled::<T>() {
        crate::allocate(size_of::<T>())?.cast()
    } else {
        NonNull::new(unsafe { System.alloc(Layout::new::<T>()) })?.cast()
    };

    unsafe { ptr.as_ptr().write(value) };
    Some(ptr)
}

/// Drop the value at `ptr` and release its memory.
///
/// # Safety
///
/// `ptr` must have come from [`construct`] with the same `T`, and must not be
/// used afterwards.
pub unsafe fn destroy<T>(ptr: NonNull<T>) {
    core::ptr::drop_in_place(ptr.as_ptr());

    if size_of::<T>() == 0 {
        return;
    }
    if pooled::<T>() {
        crate::deallocate(ptr.as_ptr() as *mut u8, size_of::<T>());
    } else {
        System.dealloc(ptr.as_ptr() as *mut u8, Layout::new::<T>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    use crate::size_class::MAX_BYTES;

    use test_log::test;

    struct Tracked {
        drops: Rc<Cell<usize>>,
        payload: [u64; 5],
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn test_construct_destroy_runs_drop_once() {
        let drops = Rc::new(Cell::new(0));
        let ptr = construct(Tracked {
            drops: Rc::clone(&drops),
            payload: [1, 2, 3, 4, 5],
        })
        .unwrap();

        assert_eq!(unsafe { ptr.as_ref() }.payload, [1, 2, 3, 4, 5]);
        assert_eq!(drops.get(), 0);

        unsafe { destroy(ptr) };
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_over_aligned_types() {
        #[repr(align(64))]
        struct Line([u8; 64]);

        let ptr = construct(Line([9; 64])).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        assert_eq!(unsafe { ptr.as_ref() }.0[63], 9);
        unsafe { destroy(ptr) };

        assert!(pooled::<Line>());
        assert!(pooled::<u64>());
    }

    #[test]
    fn test_zero_sized_and_oversized() {
        let unit = construct(()).unwrap();
        unsafe { destroy(unit) };

        #[allow(dead_code)]
        #[repr(align(16))]
        struct Big([u8; MAX_BYTES + 16]);
        assert!(!pooled::<Big>());

        let ptr = construct([7u64; MAX_BYTES / 8 + 1]).unwrap();
        assert_eq!(unsafe { ptr.as_ref() }[MAX_BYTES / 8], 7);
        unsafe { destroy(ptr) };
    }
}
