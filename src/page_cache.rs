//! The page tier: spans of whole pages obtained from a [`HeapGrower`].
//!
//! Free spans are kept in per-page-count lists, linked through a small header
//! written at the start of each free span. Lookups are exact-fit only: a free
//! span is never split, and neighbouring free spans are never merged. Memory
//! is never handed back to the OS.

use core::ptr::NonNull;
use std::collections::BTreeMap;

use spin::mutex::Mutex;
use spin::relax::Yield;

use crate::allocators::HeapGrower;

/// Size of one page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Pages requested from the OS at once when a request is smaller than this.
pub const SPAN_PAGES: usize = 8;

/// A contiguous run of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: NonNull<u8>,
    pub pages: usize,
}

impl Span {
    pub fn bytes(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    fn addr(&self) -> usize {
        self.start.as_ptr() as usize
    }
}

// Written into the first bytes of a span while it is free.
#[repr(C)]
struct SpanHeader {
    next: Option<NonNull<SpanHeader>>,
    pages: usize,
}

// All free spans of one page count.
#[derive(Default)]
struct SpanList {
    head: Option<NonNull<SpanHeader>>,
    len: usize,
}

// Free spans are owned by the list; they move with it.
unsafe impl Send for SpanList {}

impl SpanList {
    // Safety: `span` must be unused memory of `span.pages` pages owned by the
    // page cache, and not already in any list.
    unsafe fn push(&mut self, span: Span) {
        let header: NonNull<SpanHeader> = span.start.cast();
        core::ptr::write(
            header.as_ptr(),
            SpanHeader {
                next: self.head.take(),
                pages: span.pages,
            },
        );
        self.head = Some(header);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Span> {
        let header = self.head?;
        let SpanHeader { next, pages } = unsafe { header.as_ptr().read() };
        self.head = next;
        self.len -= 1;
        Some(Span {
            start: header.cast(),
            pages,
        })
    }

    fn contains(&self, start: NonNull<u8>) -> bool {
        let mut next = self.head;
        while let Some(header) = next {
            if header.cast::<u8>() == start {
                return true;
            }
            next = unsafe { header.as_ref().next };
        }
        false
    }
}

/// Counters describing the page tier.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    /// Number of times the grower was asked for memory successfully.
    pub os_acquisitions: usize,
    /// Pages obtained from the grower in total.
    pub pages_acquired: usize,
    /// Spans currently free.
    pub free_spans: usize,
    /// Pages in free spans.
    pub free_pages: usize,
}

struct PageState<G> {
    grower: G,
    // page count -> free spans of exactly that many pages
    free_spans: BTreeMap<usize, SpanList>,
    // span start address -> page count, for every span ever created
    span_map: BTreeMap<usize, usize>,
    os_acquisitions: usize,
    pages_acquired: usize,
}

impl<G: HeapGrower> PageState<G> {
    fn pop_free(&mut self, pages: usize) -> Option<Span> {
        let list = self.free_spans.get_mut(&pages)?;
        let span = list.pop();
        if list.len == 0 {
            self.free_spans.remove(&pages);
        }
        span
    }

    unsafe fn push_free(&mut self, span: Span) {
        let list = self.free_spans.entry(span.pages).or_default();
        debug_assert!(!list.contains(span.start), "span {:?} freed twice", span.start);
        list.push(span);
    }

    // One trip to the grower, for `max(pages, SPAN_PAGES)` pages. The first
    // `pages` pages are returned; whatever else came back becomes a free span.
    fn acquire(&mut self, pages: usize) -> Option<Span> {
        let batch = pages.max(SPAN_PAGES);
        let bytes = batch.checked_mul(PAGE_SIZE)?;

        let (ptr, size) = match unsafe { self.grower.grow_heap(bytes) } {
            Ok(growth) => growth,
            Err(err) => {
                log::warn!("Could not obtain {} pages from the OS: {:?}", batch, err);
                return None;
            }
        };
        let start = NonNull::new(ptr)?;
        let got = size / PAGE_SIZE;
        if got < pages {
            log::warn!(
                "Grower returned {} bytes at {:?}, less than the {} pages requested",
                size,
                start,
                pages
            );
            return None;
        }

        self.os_acquisitions += 1;
        self.pages_acquired += got;
        log::debug!(
            "Acquired {} pages at {:?} from the OS for a {}-page span",
            got,
            start,
            pages
        );

        let span = Span { start, pages };
        self.span_map.insert(span.addr(), pages);

        if got > pages {
            let surplus = Span {
                start: unsafe { NonNull::new_unchecked(start.as_ptr().add(span.bytes())) },
                pages: got - pages,
            };
            self.span_map.insert(surplus.addr(), surplus.pages);
            unsafe { self.push_free(surplus) };
        }

        Some(span)
    }
}

/// The page tier, shared by every size class.
///
/// A single lock guards both registries and the grower. Page-level operations
/// are rare compared to block-level ones, so all size classes contending here
/// is acceptable.
pub struct PageCache<G> {
    state: Mutex<PageState<G>, Yield>,
}

impl<G: HeapGrower + Default> Default for PageCache<G> {
    fn default() -> Self {
        Self::new(G::default())
    }
}

impl<G: HeapGrower> PageCache<G> {
    pub fn new(grower: G) -> Self {
        PageCache {
            state: Mutex::new(PageState {
                grower,
                free_spans: BTreeMap::new(),
                span_map: BTreeMap::new(),
                os_acquisitions: 0,
                pages_acquired: 0,
            }),
        }
    }

    /// Get `pages` contiguous, zero-filled pages.
    ///
    /// A free span of exactly `pages` pages is reused if there is one;
    /// otherwise the grower is asked once. Returns `None` for zero pages or
    /// when the grower fails.
    pub fn allocate_span(&self, pages: usize) -> Option<NonNull<u8>> {
        if pages == 0 {
            return None;
        }

        let mut state = self.state.lock();
        if let Some(span) = state.pop_free(pages) {
            log::trace!("Reusing free span at {:?} of {} pages", span.start, pages);
            unsafe { core::ptr::write_bytes(span.start.as_ptr(), 0, span.bytes()) };
            return Some(span.start);
        }

        state.acquire(pages).map(|span| span.start)
    }

    /// Give a span back for reuse by a later request of the same page count.
    ///
    /// Spans this cache never created are ignored. The page count recorded at
    /// creation wins over `pages` if they disagree.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate_span`](Self::allocate_span)
    /// on this cache, must not be used after this call, and must not be
    /// deallocated twice.
    pub unsafe fn deallocate_span(&self, ptr: NonNull<u8>, pages: usize) {
        let mut state = self.state.lock();
        let recorded = match state.span_map.get(&(ptr.as_ptr() as usize)) {
            Some(&recorded) => recorded,
            None => {
                log::warn!("Ignoring free of unknown span at {:?}", ptr);
                return;
            }
        };
        if recorded != pages {
            log::warn!(
                "Span at {:?} freed as {} pages but was created with {}",
                ptr,
                pages,
                recorded
            );
        }

        log::trace!("Span at {:?} of {} pages is free", ptr, recorded);
        state.push_free(Span {
            start: ptr,
            pages: recorded,
        });
    }

    /// The page count of the span starting at `ptr`, if this cache created it.
    pub fn span_pages(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.state
            .lock()
            .span_map
            .get(&(ptr.as_ptr() as usize))
            .copied()
    }

    pub fn stats(&self) -> PageStats {
        let state = self.state.lock();
        let mut stats = PageStats {
            os_acquisitions: state.os_acquisitions,
            pages_acquired: state.pages_acquired,
            ..PageStats::default()
        };
        for (&pages, list) in state.free_spans.iter() {
            stats.free_spans += list.len;
            stats.free_pages += pages * list.len;
        }
        stats
    }
}
