//! Sources of fresh pages for the page cache.
//!
//! ## Basic Types
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to obtain more memory. The page cache is generic over it.
//!
//! ### [`LibcHeapGrower`](struct.LibcHeapGrower.html)
//!
//! Uses `libc::mmap` to map anonymous, private, zero-filled pages. This is what
//! the process-wide allocator runs on.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed-size, page-aligned arena that can pretend to be the OS,
//! and implements `HeapGrower` for such a purpose. It is mainly useful for
//! testing: it counts growths and runs out on purpose.

use core::fmt;
use core::ptr::{null_mut, NonNull};
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

use errno::Errno;

use crate::page_cache::PAGE_SIZE;

// Round up value to the nearest multiple of increment, or None if that
// doesn't fit in a usize
fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

pub trait HeapGrower {
    type Err: fmt::Debug;
    /// Grow the heap by at least size. Returns a pointer and the size of the
    /// memory available at that pointer.
    ///
    /// # Safety
    ///
    /// This is pretty much entirely unsafe.
    ///
    /// For this to function properly with the other types in this crate:
    ///
    /// - The return value may be an error, indicating allocation failure.
    /// - The return value may be (ptr, new_size), where new_size >= size, ptr
    ///   is aligned to [`PAGE_SIZE`], the memory is zero-filled, and the memory
    ///   pointed to by ptr is available and untracked by any other rust code,
    ///   including the allocator itself.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err>;
}

/// LibcHeapGrower uses virtual memory to grow the heap upon request.
#[derive(Default, Debug)]
pub struct LibcHeapGrower {
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

impl LibcHeapGrower {
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn growths(&self) -> usize {
        self.growths
    }
}

impl HeapGrower for LibcHeapGrower {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err> {
        if size == 0 {
            return Ok((null_mut(), 0));
        }
        // The OS page may be bigger than ours; a multiple of it is always a
        // multiple of PAGE_SIZE too.
        let pagesize = sysconf::page::pagesize().max(PAGE_SIZE);
        let to_allocate = match round_up(size, pagesize) {
            Some(bytes) => bytes,
            None => return Err(Errno(libc::ENOMEM)),
        };

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory. Anonymous pages come back zero-filled.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // No file, so no descriptor.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok((ptr as *mut u8, to_allocate))
    }
}

/// A page-aligned arena of fixed capacity standing in for the OS.
pub struct ToyHeap {
    /// Granularity of each growth; a multiple of [`PAGE_SIZE`].
    pub page_size: usize,
    /// Bytes handed out so far.
    pub size: usize,
    /// Number of successful growths.
    pub growths: usize,
    capacity: usize,
    heap: NonNull<u8>,
}

// The arena is plain memory owned by this value.
unsafe impl Send for ToyHeap {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl ToyHeap {
    /// An arena of `capacity_pages` pages of [`PAGE_SIZE`] bytes.
    pub fn new(capacity_pages: usize) -> Self {
        Self::with_page_size(capacity_pages, PAGE_SIZE)
    }

    /// An arena that grows in units of `page_size` bytes, as an OS with a
    /// larger page than ours would.
    pub fn with_page_size(capacity_pages: usize, page_size: usize) -> Self {
        assert!(
            page_size >= PAGE_SIZE && page_size % PAGE_SIZE == 0,
            "page_size must be a multiple of {}",
            PAGE_SIZE
        );
        let capacity = capacity_pages.max(1) * PAGE_SIZE;
        let layout = Self::layout(capacity);
        let heap = match NonNull::new(unsafe { alloc_zeroed(layout) }) {
            Some(heap) => heap,
            None => handle_alloc_error(layout),
        };

        ToyHeap {
            page_size,
            size: 0,
            growths: 0,
            capacity,
            heap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity, PAGE_SIZE).expect("toy heap capacity overflows a Layout")
    }
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new(1024)
    }
}

impl Drop for ToyHeap {
    fn drop(&mut self) {
        unsafe { dealloc(self.heap.as_ptr(), Self::layout(self.capacity)) };
    }
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err> {
        let available = self.capacity - self.size;
        let allocating = match round_up(size, self.page_size) {
            Some(allocating) if allocating <= available => allocating,
            _ => {
                return Err(ToyHeapOverflowError {
                    requested: size,
                    available,
                })
            }
        };

        let ptr = self.heap.as_ptr().add(self.size);
        self.size += allocating;
        self.growths += 1;
        Ok((ptr, allocating))
    }
}
