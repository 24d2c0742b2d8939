//! Intrusive free lists threaded through the first word of each block.
//!
//! All pointer chasing of the allocator lives here. A block on a list is
//! owned by that list: nothing else may read or write it until it is
//! popped. Lists are either confined to one thread (the owner's allocation
//! cache) or guarded by the global lock.

use std::{fmt, mem, ptr::NonNull};

const WORD: usize = mem::size_of::<usize>();

/// Address of a small-object block. Plain data, it does not own the block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPtr(NonNull<u8>);

// SAFETY: a BlockPtr is an address; access to the memory behind it is
// governed by the list that currently holds it.
unsafe impl Send for BlockPtr {}
// SAFETY: see above
unsafe impl Sync for BlockPtr {}

impl BlockPtr {
    /// # Safety
    /// `ptr` must be word aligned and point to at least one writable word
    /// of heap memory.
    #[inline(always)]
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        debug_assert!((ptr.as_ptr() as usize).is_multiple_of(WORD));
        Self(ptr)
    }

    /// # Safety
    /// same as [`BlockPtr::new`] for a non-zero `addr`.
    #[inline(always)]
    pub(crate) unsafe fn from_addr(addr: usize) -> Option<Self> {
        // SAFETY: contract of the caller
        NonNull::new(addr as *mut u8).map(|p| unsafe { Self::new(p) })
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// the block must be owned by the caller's list.
    #[inline(always)]
    unsafe fn link(self) -> usize {
        // SAFETY: aligned, at least one word, owned by the caller
        unsafe { self.0.as_ptr().cast::<usize>().read() }
    }

    /// # Safety
    /// the block must be owned by the caller's list.
    #[inline(always)]
    unsafe fn set_link(self, next: usize) {
        // SAFETY: aligned, at least one word, owned by the caller
        unsafe { self.0.as_ptr().cast::<usize>().write(next) }
    }
}

impl fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPtr({:#x})", self.addr())
    }
}

/// Pops the head of a raw chain, returning the block and the new head.
///
/// # Safety
/// `head` must be a chain built by this module whose blocks the caller
/// owns.
#[inline(always)]
pub(crate) unsafe fn pop_raw(head: BlockPtr) -> (BlockPtr, usize) {
    // SAFETY: contract of the caller
    let next = unsafe { head.link() };
    // SAFETY: the block leaves the list, clear the link word
    unsafe { head.set_link(0) };
    (head, next)
}

/// Pushes `block` in front of the raw chain `head` and returns the new head.
///
/// # Safety
/// the caller must own `block` and the chain.
#[inline(always)]
pub(crate) unsafe fn push_raw(block: BlockPtr, head: usize) -> usize {
    // SAFETY: contract of the caller
    unsafe { block.set_link(head) };
    block.addr()
}

/// An owned chain of free blocks of one size.
#[derive(Default)]
pub struct FreeList {
    head: usize,
    len: usize,
}

// SAFETY: the list owns its blocks, moving it moves that ownership.
unsafe impl Send for FreeList {}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: 0, len: 0 }
    }

    /// Takes ownership of a raw chain and counts it.
    ///
    /// # Safety
    /// every block reachable from `head` must be owned by the caller and
    /// the chain must be zero terminated.
    pub(crate) unsafe fn from_raw(head: usize) -> Self {
        let mut len = 0;
        let mut cur = head;
        // SAFETY: contract of the caller
        while let Some(block) = unsafe { BlockPtr::from_addr(cur) } {
            len += 1;
            // SAFETY: owned chain
            cur = unsafe { block.link() };
        }
        Self { head, len }
    }

    /// Releases the chain without touching it.
    pub(crate) fn into_raw(self) -> usize {
        let head = self.head;
        mem::forget(self);
        head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    /// # Safety
    /// `block` must be owned by the caller, not on any list, and large
    /// enough to hold one word.
    #[inline]
    pub unsafe fn push(&mut self, block: BlockPtr) {
        // SAFETY: contract of the caller
        self.head = unsafe { push_raw(block, self.head) };
        self.len += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<BlockPtr> {
        // SAFETY: every non-zero head was pushed by `push` or `from_raw`
        let head = unsafe { BlockPtr::from_addr(self.head) }?;
        // SAFETY: we own the chain
        let (block, next) = unsafe { pop_raw(head) };
        self.head = next;
        self.len -= 1;
        Some(block)
    }

    /// Moves up to `count` blocks into a new list.
    pub fn split_off(&mut self, count: usize) -> FreeList {
        let mut taken = FreeList::new();
        let mut tail: Option<BlockPtr> = None;
        while taken.len < count {
            // SAFETY: owned chain
            let Some(block) = (unsafe { BlockPtr::from_addr(self.head) }) else {
                break;
            };
            // SAFETY: owned chain
            self.head = unsafe { block.link() };
            self.len -= 1;
            // SAFETY: block left self and goes to the end of `taken`
            unsafe { block.set_link(0) };
            match tail {
                // SAFETY: tail is owned by `taken`
                Some(t) => unsafe { t.set_link(block.addr()) },
                None => taken.head = block.addr(),
            }
            tail = Some(block);
            taken.len += 1;
        }
        taken
    }

    /// Concatenates `other` in front of this list.
    pub fn append(&mut self, other: FreeList) {
        if other.is_empty() {
            return;
        }
        let mut tail = other.head;
        loop {
            // SAFETY: `other` owns its chain
            let Some(block) = (unsafe { BlockPtr::from_addr(tail) }) else {
                break;
            };
            // SAFETY: owned chain
            let next = unsafe { block.link() };
            if next == 0 {
                // SAFETY: the tail now links into our chain, which we own
                unsafe { block.set_link(self.head) };
                break;
            }
            tail = next;
        }
        self.len += other.len;
        self.head = other.into_raw();
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head,
            _list: self,
        }
    }
}

impl fmt::Debug for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("head", &format_args!("{:#x}", self.head))
            .field("len", &self.len)
            .finish()
    }
}

pub struct Iter<'a> {
    cur: usize,
    _list: &'a FreeList,
}

impl Iterator for Iter<'_> {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<BlockPtr> {
        // SAFETY: the borrowed list owns the chain and cannot change
        let block = unsafe { BlockPtr::from_addr(self.cur) }?;
        // SAFETY: owned chain
        self.cur = unsafe { block.link() };
        Some(block)
    }
}

/// Walks a raw chain without taking ownership.
///
/// # Safety
/// nothing may modify the chain while the walk runs.
pub(crate) unsafe fn for_each_raw(head: usize, mut f: impl FnMut(BlockPtr)) {
    let mut cur = head;
    // SAFETY: contract of the caller
    while let Some(block) = unsafe { BlockPtr::from_addr(cur) } {
        // SAFETY: contract of the caller
        cur = unsafe { block.link() };
        f(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Arena {
        words: Box<[usize]>,
    }

    impl Arena {
        fn new(blocks: usize) -> Self {
            Self {
                words: vec![0usize; blocks * 2].into_boxed_slice(),
            }
        }

        fn block(&mut self, i: usize) -> BlockPtr {
            let ptr = NonNull::from(&mut self.words[i * 2]).cast::<u8>();
            // SAFETY: two aligned words per block
            unsafe { BlockPtr::new(ptr) }
        }
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut arena = Arena::new(3);
        let blocks: Vec<_> = (0..3).map(|i| arena.block(i)).collect();
        let mut list = FreeList::new();
        for &b in &blocks {
            // SAFETY: arena blocks are exclusively ours
            unsafe { list.push(b) };
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop(), Some(blocks[2]));
        assert_eq!(list.pop(), Some(blocks[1]));
        assert_eq!(list.pop(), Some(blocks[0]));
        assert_eq!(list.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn popped_block_has_cleared_link() {
        let mut arena = Arena::new(2);
        let (a, b) = (arena.block(0), arena.block(1));
        let mut list = FreeList::new();
        // SAFETY: arena blocks are exclusively ours
        unsafe {
            list.push(a);
            list.push(b);
        }
        let popped = list.pop().unwrap();
        // SAFETY: popped block belongs to us
        assert_eq!(unsafe { popped.as_ptr().cast::<usize>().read() }, 0);
    }

    #[test]
    fn append_keeps_every_block() {
        let mut arena = Arena::new(5);
        let blocks: Vec<_> = (0..5).map(|i| arena.block(i)).collect();
        let mut left = FreeList::new();
        let mut right = FreeList::new();
        // SAFETY: arena blocks are exclusively ours
        unsafe {
            left.push(blocks[0]);
            left.push(blocks[1]);
            right.push(blocks[2]);
            right.push(blocks[3]);
            right.push(blocks[4]);
        }
        left.append(right);
        assert_eq!(left.len(), 5);
        let mut seen: Vec<_> = left.iter().collect();
        seen.sort();
        let mut expected = blocks.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn split_off_takes_prefix() {
        let mut arena = Arena::new(4);
        let blocks: Vec<_> = (0..4).map(|i| arena.block(i)).collect();
        let mut list = FreeList::new();
        for &b in &blocks {
            // SAFETY: arena blocks are exclusively ours
            unsafe { list.push(b) };
        }
        let taken = list.split_off(3);
        assert_eq!(taken.len(), 3);
        assert_eq!(list.len(), 1);
        assert_eq!(taken.iter().count(), 3);
        assert_eq!(list.iter().next(), Some(blocks[0]));
    }

    #[test]
    fn raw_round_trip_recounts() {
        let mut arena = Arena::new(3);
        let mut list = FreeList::new();
        for i in 0..3 {
            let b = arena.block(i);
            // SAFETY: arena blocks are exclusively ours
            unsafe { list.push(b) };
        }
        let head = list.into_raw();
        // SAFETY: chain built above
        let list = unsafe { FreeList::from_raw(head) };
        assert_eq!(list.len(), 3);
    }
}
