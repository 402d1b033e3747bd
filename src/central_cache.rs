//! The shared tier: one free list per size class, each behind its own lock.
//!
//! Threads only meet here when they work on the same size class. A list that
//! runs dry is refilled by carving a fresh span from the [`PageCache`].

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::mutex::SpinMutex;
use spin::relax::Yield;

use crate::allocators::HeapGrower;
use crate::freelist::{FreeList, Stats, Validity};
use crate::page_cache::{PageCache, PAGE_SIZE, SPAN_PAGES};
use crate::size_class::{block_size, FREE_LIST_SIZE};

/// Pages to carve for a class whose blocks are `block_size` bytes.
///
/// Small classes share a fixed span size; a block bigger than that gets a span
/// of exactly enough pages to hold one.
pub fn span_pages(block_size: usize) -> usize {
    if block_size <= SPAN_PAGES * PAGE_SIZE {
        SPAN_PAGES
    } else {
        (block_size + PAGE_SIZE - 1) / PAGE_SIZE
    }
}

fn single(ptr: NonNull<u8>) -> FreeList {
    let mut chain = FreeList::new();
    unsafe { chain.push(ptr) };
    chain
}

/// Free lists shared by every thread, one per size class.
///
/// Each list is guarded by a spin lock that yields the CPU between attempts.
/// Critical sections never block on anything but the page cache, and the
/// guard releases the lock on every way out of them.
pub struct CentralCache<G> {
    lists: Box<[SpinMutex<FreeList, Yield>]>,
    // Blocks ever carved per class; only grows.
    carved: Box<[AtomicUsize]>,
    page_cache: PageCache<G>,
}

impl<G: HeapGrower + Default> Default for CentralCache<G> {
    fn default() -> Self {
        Self::new(G::default())
    }
}

impl<G: HeapGrower> CentralCache<G> {
    pub fn new(grower: G) -> Self {
        Self::with_page_cache(PageCache::new(grower))
    }

    pub fn with_page_cache(page_cache: PageCache<G>) -> Self {
        CentralCache {
            lists: (0..FREE_LIST_SIZE)
                .map(|_| SpinMutex::new(FreeList::new()))
                .collect(),
            carved: (0..FREE_LIST_SIZE).map(|_| AtomicUsize::new(0)).collect(),
            page_cache,
        }
    }

    pub fn page_cache(&self) -> &PageCache<G> {
        &self.page_cache
    }

    /// Get at least one free block of class `index`.
    ///
    /// Pops the head of the shared list; if the list is empty, carves a new
    /// span, keeps all but the first block, and returns that one. Returns
    /// `None` if `index` is out of range or the page cache is exhausted.
    pub fn fetch_range(&self, index: usize) -> Option<FreeList> {
        let slot = self.lists.get(index)?;
        let mut list = slot.lock();

        if let Some(ptr) = list.pop() {
            return Some(single(ptr));
        }

        let mut fresh = self.fetch_from_page_cache(index)?;
        let first = fresh.pop()?;
        debug_assert!(list.is_empty());
        *list = fresh;

        Some(single(first))
    }

    /// Splice `chain`, a list of blocks of class `index`, onto the front of
    /// the shared list.
    pub fn return_range(&self, chain: FreeList, index: usize) {
        if chain.is_empty() {
            return;
        }
        let slot = match self.lists.get(index) {
            Some(slot) => slot,
            None => {
                log::warn!(
                    "Dropping {} blocks returned to nonexistent size class {}",
                    chain.len(),
                    index
                );
                return;
            }
        };

        slot.lock().prepend(chain);
    }

    // Called with the class lock held.
    fn fetch_from_page_cache(&self, index: usize) -> Option<FreeList> {
        let size = block_size(index);
        let pages = span_pages(size);
        let span = self.page_cache.allocate_span(pages)?;

        let count = pages * PAGE_SIZE / size;
        self.carved[index].fetch_add(count, Ordering::Relaxed);
        log::debug!(
            "Carving {} blocks of {} bytes from the {}-page span at {:?}",
            count,
            size,
            pages,
            span
        );

        Some(unsafe { FreeList::carve(span, size, count) })
    }

    /// Number of blocks in the shared list of class `index`.
    pub fn free_len(&self, index: usize) -> usize {
        self.lists.get(index).map_or(0, |slot| slot.lock().len())
    }

    /// Number of blocks of class `index` ever carved from spans.
    pub fn carved(&self, index: usize) -> usize {
        self.carved
            .get(index)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Check the shared list of one class.
    pub fn class_stats(&self, index: usize) -> (Validity, Stats) {
        match self.lists.get(index) {
            Some(slot) => slot.lock().stats(block_size(index)),
            None => Default::default(),
        }
    }

    /// Check every shared list, one lock at a time.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        for index in 0..self.lists.len() {
            let (v, s) = self.class_stats(index);
            validity.merge(v);
            stats.merge(s);
        }
        (validity, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::allocators::ToyHeap;
    use crate::size_class::{class_index, MAX_BYTES};

    use test_log::test;

    fn central(capacity_pages: usize) -> CentralCache<ToyHeap> {
        CentralCache::new(ToyHeap::new(capacity_pages))
    }

    #[test]
    fn test_span_pages() {
        assert_eq!(span_pages(8), SPAN_PAGES);
        assert_eq!(span_pages(SPAN_PAGES * PAGE_SIZE), SPAN_PAGES);
        assert_eq!(span_pages(SPAN_PAGES * PAGE_SIZE + 8), SPAN_PAGES + 1);
        assert_eq!(span_pages(MAX_BYTES), MAX_BYTES / PAGE_SIZE);
    }

    #[test]
    fn test_first_fetch_carves_a_span() {
        let cache = central(64);
        let chain = cache.fetch_range(0).unwrap();
        assert_eq!(chain.len(), 1);

        let expected = SPAN_PAGES * PAGE_SIZE / 8;
        assert_eq!(cache.carved(0), expected);
        assert_eq!(cache.free_len(0), expected - 1);
        assert_eq!(cache.page_cache().stats().os_acquisitions, 1);

        // The next fetch is served from the shared list.
        let second = cache.fetch_range(0).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(cache.free_len(0), expected - 2);
        assert_eq!(cache.carved(0), expected);
        assert_eq!(cache.page_cache().stats().os_acquisitions, 1);
    }

    #[test]
    fn test_carved_blocks_are_distinct_and_in_span() {
        let cache = central(64);
        let index = class_index(24);
        let count = SPAN_PAGES * PAGE_SIZE / 24;

        let mut seen = HashSet::new();
        let mut chains = Vec::new();
        for _ in 0..count {
            let mut chain = cache.fetch_range(index).unwrap();
            let ptr = chain.pop().unwrap();
            assert!(seen.insert(ptr.as_ptr() as usize));
            unsafe { chain.push(ptr) };
            chains.push(chain);
        }
        assert_eq!(cache.free_len(index), 0);
        assert_eq!(cache.carved(index), count);

        let lowest = *seen.iter().min().unwrap();
        let highest = *seen.iter().max().unwrap();
        assert_eq!(lowest % PAGE_SIZE, 0);
        assert!(highest + 24 <= lowest + SPAN_PAGES * PAGE_SIZE);
        for addr in &seen {
            assert_eq!((addr - lowest) % 24, 0);
        }

        for chain in chains {
            cache.return_range(chain, index);
        }
        assert_eq!(cache.free_len(index), count);
        assert!(cache.class_stats(index).0.is_valid());
    }

    #[test]
    fn test_large_classes_get_exact_spans() {
        let cache = central(128);

        let index = class_index(MAX_BYTES);
        let chain = cache.fetch_range(index).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(cache.carved(index), 1);
        assert_eq!(cache.free_len(index), 0);

        let index = class_index(40_000);
        let _chain = cache.fetch_range(index).unwrap();
        assert_eq!(cache.carved(index), 40 * 1024 / 40_000);

        let stats = cache.page_cache().stats();
        assert_eq!(stats.os_acquisitions, 2);
        assert_eq!(stats.pages_acquired, MAX_BYTES / PAGE_SIZE + 10);
    }

    #[test]
    fn test_return_range_goes_to_front() {
        let cache = central(64);
        let mut chain = FreeList::new();
        for _ in 0..3 {
            let mut one = cache.fetch_range(5).unwrap();
            let ptr = one.pop().unwrap();
            unsafe { chain.push(ptr) };
        }
        let before = cache.free_len(5);
        let head = chain.iter().next().unwrap();

        cache.return_range(chain, 5);
        assert_eq!(cache.free_len(5), before + 3);

        let mut again = cache.fetch_range(5).unwrap();
        assert_eq!(again.pop(), Some(head));
    }

    #[test]
    fn test_exhaustion_and_bad_index() {
        let cache = central(SPAN_PAGES - 1);
        assert!(cache.fetch_range(0).is_none());
        assert_eq!(cache.carved(0), 0);

        // A failed carve leaves the class unlocked.
        assert!(cache.fetch_range(0).is_none());
        assert_eq!(cache.free_len(0), 0);
        let mut backing = [0u64; 1];
        let block = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        cache.return_range(single(block), 0);
        assert_eq!(cache.free_len(0), 1);
        let mut again = cache.fetch_range(0).unwrap();
        assert_eq!(again.pop(), Some(block));
        assert_eq!(cache.free_len(0), 0);

        assert!(cache.fetch_range(FREE_LIST_SIZE).is_none());
        cache.return_range(FreeList::new(), FREE_LIST_SIZE);
        assert_eq!(cache.free_len(FREE_LIST_SIZE), 0);
        assert_eq!(cache.carved(FREE_LIST_SIZE), 0);
    }

    #[test]
    fn test_concurrent_fetch_and_return() {
        let cache = Arc::new(central(256));
        let index = class_index(64);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut held = FreeList::new();
                        for _ in 0..10 {
                            let mut chain = cache.fetch_range(index).unwrap();
                            let ptr = chain.pop().unwrap();
                            unsafe { ptr.as_ptr().write_bytes(0x5A, 64) };
                            unsafe { held.push(ptr) };
                        }
                        cache.return_range(held, index);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.free_len(index), cache.carved(index));
        let (validity, stats) = cache.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.length, cache.carved(index));
    }
}
