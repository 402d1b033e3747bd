//! A tiered memory allocator.
//!
//! Memory moves through three caches:
//!
//! - A [`ThreadCache`] per thread, holding free blocks per size class. Most
//!   allocations and frees start and end here without any locking.
//! - A [`CentralCache`] shared by all threads, with one spin-locked free list
//!   per size class. Thread caches refill from it and drain back into it in
//!   batches.
//! - A [`PageCache`] owned by the central cache, handing out spans of whole
//!   pages that the central cache slices into blocks. It is the only tier that
//!   talks to the OS, through a [`HeapGrower`].
//!
//! Requests larger than [`MAX_BYTES`](size_class::MAX_BYTES) skip all three
//! and go to the system allocator.
//!
//! [`allocate`] and [`deallocate`] use a process-wide central cache (see
//! [`global`]) and a thread-local thread cache. Independent instances can be
//! built from the parts, e.g. over a [`ToyHeap`]:
//!
//! ```
//! use std::sync::Arc;
//! use tiered_allocator::{CentralCache, ThreadCache, ToyHeap};
//!
//! let central = Arc::new(CentralCache::new(ToyHeap::new(64)));
//! let mut cache = ThreadCache::new(Arc::clone(&central));
//! let p = cache.allocate(24).unwrap();
//! unsafe { cache.deallocate(p.as_ptr(), 24) };
//! ```

use core::cell::RefCell;
use core::ptr::NonNull;
use std::sync::Arc;

use spin::Lazy;

pub mod allocators;
pub mod central_cache;
pub mod freelist;
pub mod page_cache;
pub mod size_class;
pub mod thread_cache;
pub mod typed;

pub use allocators::{HeapGrower, LibcHeapGrower, ToyHeap};
pub use central_cache::CentralCache;
pub use page_cache::PageCache;
pub use thread_cache::ThreadCache;
pub use typed::{construct, destroy};

use size_class::{class_index, is_oversized, normalize};
use thread_cache::{allocate_oversized, deallocate_oversized};

static GLOBAL: Lazy<Arc<CentralCache<LibcHeapGrower>>> =
    Lazy::new(|| Arc::new(CentralCache::default()));

thread_local! {
    static THREAD_CACHE: RefCell<ThreadCache<LibcHeapGrower>> =
        RefCell::new(ThreadCache::new(Arc::clone(global())));
}

/// The process-wide central cache, built on first use.
pub fn global() -> &'static Arc<CentralCache<LibcHeapGrower>> {
    Lazy::force(&GLOBAL)
}

// Returns None if the thread-local cache is gone (or not yet usable) because
// the thread is being torn down.
fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache<LibcHeapGrower>) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|cache| f(&mut cache.borrow_mut()))
        .ok()
}

/// Allocate `size` bytes from the calling thread's cache.
///
/// A `size` of 0 is served as the smallest class. Returns `None` if memory
/// could not be obtained. The contents are not initialized.
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    match with_thread_cache(|cache| cache.allocate(size)) {
        Some(result) => result,
        None => allocate_from_central(size),
    }
}

/// Return memory obtained from [`allocate`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] with the same `size`, and must not be
/// used afterwards.
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    if with_thread_cache(|cache| cache.deallocate(ptr, size)).is_none() {
        deallocate_to_central(ptr, size);
    }
}

// Used while the thread cache is unavailable: single blocks straight from and
// to the shared tier.
fn allocate_from_central(size: usize) -> Option<NonNull<u8>> {
    let size = normalize(size);
    if is_oversized(size) {
        return allocate_oversized(size);
    }
    let index = class_index(size);
    let mut chain = global().fetch_range(index)?;
    let ptr = chain.pop()?;
    global().return_range(chain, index);
    Some(ptr)
}

unsafe fn deallocate_to_central(ptr: *mut u8, size: usize) {
    let ptr = match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => return,
    };
    let size = normalize(size);
    if is_oversized(size) {
        deallocate_oversized(ptr, size);
        return;
    }

    let mut chain = freelist::FreeList::new();
    chain.push(ptr);
    global().return_range(chain, class_index(size));
}
