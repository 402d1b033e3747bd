use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::size_class::ALIGNMENT;

/// The link stored in the first word of every free block.
///
/// While a block is free, its memory is reinterpreted as a `FreeNode`; while it
/// is live, the allocator never looks at it. Nothing else is stored, so a block
/// of [`ALIGNMENT`] bytes is enough to hold it.
#[repr(C)]
pub struct FreeNode {
    next: Option<FreeBlock>,
}

const_assert!(core::mem::size_of::<FreeNode>() <= ALIGNMENT);
const_assert!(core::mem::align_of::<FreeNode>() <= ALIGNMENT);

/// An owned, free block of memory of some size class.
///
/// A `FreeBlock` is the "free" half of a block's two states: it is created from
/// a live pointer by writing a link into it ([`FreeBlock::from_raw`]), and goes
/// back to being live storage through [`FreeBlock::decompose`]. Live blocks are
/// plain `NonNull<u8>` owned by the caller.
///
/// Like the blocks in a `Box`, these are unique, but they don't assume any
/// allocator, so they implement neither `Clone` nor `Drop`.
pub struct FreeBlock {
    node: NonNull<FreeNode>,
}

impl FreeBlock {
    /// Reinterpret the memory at `ptr` as a free block linking to `next`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`ALIGNMENT`] bytes, aligned to
    /// [`ALIGNMENT`], that are not in use by or accessible to any program
    /// logic. Ownership of the memory passes to the returned block.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<u8>, next: Option<FreeBlock>) -> FreeBlock {
        let node: NonNull<FreeNode> = ptr.cast();
        core::ptr::write(node.as_ptr(), FreeNode { next });
        FreeBlock { node }
    }

    /// The address of this block.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.node.cast()
    }

    fn next(&self) -> Option<&FreeBlock> {
        unsafe { self.node.as_ref().next.as_ref() }
    }

    /// Consume this block, returning its address as live storage and the rest
    /// of the chain it was linked into.
    #[must_use]
    pub fn decompose(mut self) -> (NonNull<u8>, Option<FreeBlock>) {
        let next = unsafe { self.node.as_mut().next.take() };
        (self.as_ptr(), next)
    }
}

// Walk forward from `start` until `n` nodes (including `start`) have been
// visited, or the chain ends. Returns the last node visited and how many nodes
// were visited.
unsafe fn walk(start: NonNull<FreeNode>, n: usize) -> (NonNull<FreeNode>, usize) {
    let mut node = start;
    let mut visited = 1;
    while visited < n {
        match (*node.as_ptr()).next {
            Some(ref next) => node = next.node,
            None => break,
        }
        visited += 1;
    }
    (node, visited)
}

/// A singly linked, intrusive list of free blocks of one size class.
///
/// Insertion and removal both happen at the head (LIFO). The list records its
/// own length so callers can apply thresholds without walking it.
///
/// Invariants:
///
/// - Each block links to the next, with the last one linking to `None`.
/// - `len` is the number of blocks reachable from `head`.
/// - Every block in one list has the same size.
#[derive(Default)]
pub struct FreeList {
    head: Option<FreeBlock>,
    len: usize,
}

// A chain of free blocks may move between threads as a whole; nothing else
// references the memory while it is in a list. It is not `Sync`: shared lists
// live behind a lock.
unsafe impl Send for FreeList {}

pub struct FreeListIter<'list> {
    next: Option<&'list FreeBlock>,
}

impl<'list> Iterator for FreeListIter<'list> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block.as_ptr())
    }
}

impl<'list> IntoIterator for &'list FreeList {
    type Item = NonNull<u8>;
    type IntoIter = FreeListIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList[{}](", self.len)?;
        let mut start = true;
        for ptr in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", ptr)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// FreeList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of blocks whose address is not a multiple of [`ALIGNMENT`].
    ///
    /// This likely indicates corruption.
    pub misaligned: usize,

    /// Number of lists whose recorded length differs from the number of
    /// reachable blocks.
    pub length_mismatches: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.misaligned == 0 && self.length_mismatches == 0
    }

    pub fn merge(&mut self, other: Validity) {
        self.misaligned += other.misaligned;
        self.length_mismatches += other.length_mismatches;
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of free blocks.
    pub length: usize,
    /// Total bytes held in free blocks.
    pub size: usize,
}

impl Stats {
    pub fn merge(&mut self, other: Stats) {
        self.length += other.length;
        self.size += other.size;
    }
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList { head: None, len: 0 }
    }

    /// Slice `count` blocks of `block_size` bytes out of the memory starting
    /// at `start`, linked in address order.
    ///
    /// # Safety
    ///
    /// `start` must point to at least `block_size * count` bytes of unused
    /// memory, aligned to [`ALIGNMENT`], and ownership of that memory passes to
    /// the list. `block_size` must be a non-zero multiple of [`ALIGNMENT`].
    pub unsafe fn carve(start: NonNull<u8>, block_size: usize, count: usize) -> FreeList {
        debug_assert!(block_size >= ALIGNMENT && block_size % ALIGNMENT == 0);
        let mut list = FreeList::new();
        // Push from the back so the head ends up at `start`.
        for i in (0..count).rev() {
            list.push(NonNull::new_unchecked(start.as_ptr().add(i * block_size)));
        }
        list
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> FreeListIter<'_> {
        FreeListIter {
            next: self.head.as_ref(),
        }
    }

    /// Take every block out of this list, leaving it empty.
    #[must_use]
    pub fn take(&mut self) -> FreeList {
        core::mem::take(self)
    }

    /// Add a block at the head of the list. Takes ownership of `ptr`.
    ///
    /// # Safety
    ///
    /// See [`FreeBlock::from_raw`]. `ptr` must also be a block of the same size
    /// as the other blocks in this list, and not already be in any list.
    pub unsafe fn push(&mut self, ptr: NonNull<u8>) {
        let block = FreeBlock::from_raw(ptr, self.head.take());
        self.head = Some(block);
        self.len += 1;
    }

    /// Remove the block at the head of the list and hand it out as live
    /// storage.
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let (ptr, next) = self.head.take()?.decompose();
        self.head = next;
        self.len -= 1;
        Some(ptr)
    }

    /// Keep the first `keep` blocks, and return the rest as a new list.
    ///
    /// Walks exactly `keep` nodes from the head; the node reached last becomes
    /// the new tail of this list.
    #[must_use]
    pub fn split_off(&mut self, keep: usize) -> FreeList {
        if keep == 0 {
            return self.take();
        }
        if keep >= self.len {
            return FreeList::new();
        }
        let head = match self.head {
            Some(ref block) => block.node,
            None => return FreeList::new(),
        };

        let (tail, kept) = unsafe { walk(head, keep) };
        debug_assert_eq!(kept, keep, "free list shorter than its recorded length");
        let rest = unsafe { (*tail.as_ptr()).next.take() };
        let moved = self.len - kept;
        self.len = kept;

        FreeList {
            head: rest,
            len: moved,
        }
    }

    /// Splice `chain` onto the front of this list.
    ///
    /// The chain's internal links are trusted; its tail is found by walking at
    /// most `chain.len()` nodes.
    pub fn prepend(&mut self, mut chain: FreeList) {
        let chain_head = match chain.head {
            Some(ref block) => block.node,
            None => return,
        };

        let (tail, walked) = unsafe { walk(chain_head, chain.len) };
        debug_assert_eq!(walked, chain.len, "chain shorter than its recorded length");
        unsafe {
            debug_assert!((*tail.as_ptr()).next.is_none(), "chain longer than its recorded length");
            (*tail.as_ptr()).next = self.head.take();
        }

        self.head = chain.head.take();
        self.len += walked;
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self, block_size: usize) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        for ptr in self {
            if (ptr.as_ptr() as usize) % ALIGNMENT != 0 {
                validity.misaligned += 1;
            }
            stats.length += 1;
            stats.size += block_size;
        }

        if stats.length != self.len {
            validity.length_mismatches += 1;
        }

        (validity, stats)
    }
}
