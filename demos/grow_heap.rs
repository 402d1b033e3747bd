//! This is a very minimal example to show using the HeapGrower functions, and
//! the page cache on top of them.

use tiered_allocator::allocators::{HeapGrower, LibcHeapGrower};
use tiered_allocator::page_cache::{PageCache, SPAN_PAGES};

fn main() {
    env_logger::init();

    // LibcHeapGrower uses libc to call mmap
    let mut lhg = LibcHeapGrower::default();
    let (p, sz) = unsafe { lhg.grow_heap(8).unwrap() };
    println!("Returned: ({:p}={}, {})", p, p as i64, sz);

    // The page cache asks for SPAN_PAGES pages at once, and keeps the rest.
    let pages = PageCache::new(lhg);
    let span = pages.allocate_span(1).unwrap();
    println!("1-page span at {:p}", span);
    println!("Stats: {:?}", pages.stats());

    let rest = pages.allocate_span(SPAN_PAGES - 1).unwrap();
    println!("{}-page span at {:p}", SPAN_PAGES - 1, rest);
    println!("Stats: {:?}", pages.stats());

    unsafe { pages.deallocate_span(span, 1) };
    println!("After freeing the first span: {:?}", pages.stats());
}
