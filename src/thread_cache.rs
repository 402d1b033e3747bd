//! The per-thread tier.
//!
//! A `ThreadCache` is owned by exactly one thread and needs no locking: every
//! operation takes `&mut self`. It refills from, and drains to, a shared
//! [`CentralCache`] in batches.

use core::ptr::NonNull;
use std::alloc::{GlobalAlloc, System};
use std::sync::Arc;

use crate::allocators::HeapGrower;
use crate::central_cache::CentralCache;
use crate::freelist::FreeList;
use crate::size_class::{class_index, is_oversized, normalize, oversize_layout, FREE_LIST_SIZE};

/// Once a class holds more free blocks than this, most of them go back to the
/// central cache.
pub const RETURN_THRESHOLD: usize = 64;

/// Oversized requests bypass every tier.
pub(crate) fn allocate_oversized(size: usize) -> Option<NonNull<u8>> {
    let layout = oversize_layout(size)?;
    NonNull::new(unsafe { System.alloc(layout) })
}

/// # Safety
///
/// `ptr` must come from [`allocate_oversized`] with the same `size`.
pub(crate) unsafe fn deallocate_oversized(ptr: NonNull<u8>, size: usize) {
    if let Some(layout) = oversize_layout(size) {
        System.dealloc(ptr.as_ptr(), layout);
    }
}

/// A per-thread cache of free blocks, one list per size class.
pub struct ThreadCache<G: HeapGrower> {
    central: Arc<CentralCache<G>>,
    lists: Box<[FreeList]>,
}

impl<G: HeapGrower> ThreadCache<G> {
    pub fn new(central: Arc<CentralCache<G>>) -> Self {
        ThreadCache {
            central,
            lists: (0..FREE_LIST_SIZE).map(|_| FreeList::new()).collect(),
        }
    }

    pub fn central(&self) -> &Arc<CentralCache<G>> {
        &self.central
    }

    /// Number of free blocks of class `index` held by this thread.
    pub fn local_len(&self, index: usize) -> usize {
        self.lists.get(index).map_or(0, FreeList::len)
    }

    /// Allocate `size` bytes, aligned to [`ALIGNMENT`](crate::size_class::ALIGNMENT).
    ///
    /// Returns `None` when the page tier is exhausted (or, for oversized
    /// requests, when the system allocator fails). Contents are not
    /// initialized.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = normalize(size);
        if is_oversized(size) {
            return allocate_oversized(size);
        }

        let index = class_index(size);
        if let Some(ptr) = self.lists[index].pop() {
            return Some(ptr);
        }
        self.fetch_from_central(index)
    }

    /// Return memory obtained from [`allocate`](Self::allocate). Null is
    /// ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated with the same `size` by a `ThreadCache`
    /// sharing this one's central cache (or be oversized), and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, size: usize) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };
        let size = normalize(size);
        if is_oversized(size) {
            deallocate_oversized(ptr, size);
            return;
        }

        let index = class_index(size);
        let list = &mut self.lists[index];
        list.push(ptr);
        if list.len() > RETURN_THRESHOLD {
            self.return_to_central(index);
        }
    }

    fn fetch_from_central(&mut self, index: usize) -> Option<NonNull<u8>> {
        let mut chain = self.central.fetch_range(index)?;
        let first = chain.pop()?;
        self.lists[index].prepend(chain);
        Some(first)
    }

    // Keep a quarter of the list (at least one block) and send the rest back.
    fn return_to_central(&mut self, index: usize) {
        let list = &mut self.lists[index];
        let count = list.len();
        if count <= 1 {
            return;
        }

        let keep = (count / 4).max(1);
        let batch = list.split_off(keep);
        log::debug!(
            "Returning {} of {} blocks of class {} to the central cache",
            batch.len(),
            count,
            index
        );
        self.central.return_range(batch, index);
    }

    /// Hand every locally held block back to the central cache.
    pub fn flush(&mut self) {
        for (index, list) in self.lists.iter_mut().enumerate() {
            if !list.is_empty() {
                self.central.return_range(list.take(), index);
            }
        }
    }
}

impl<G: HeapGrower> Drop for ThreadCache<G> {
    fn drop(&mut self) {
        self.flush();
    }
}
