//! Thread-local free lists, the allocation fast path.
//!
//! Each slot is one word:
//! - `0`: the local list ran dry, refill on next use
//! - `1..=COUNT_LIMIT`: counting granules served by the global path
//! - `RETIRED`: flushed at thread exit, never followed again
//! - anything else: head of a local free list
//!
//! Only the owning thread writes slots. The coordinator reads them while
//! the owner is stopped, with acquire loads.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    freelist::{self, BlockPtr, FreeList},
    heap::{GlobalHeap, ObjectKind, SIZE_CLASSES, class_granules},
};

/// Slot values up to this are counters. No heap object lives this low.
pub const COUNT_LIMIT: usize = crate::OS_PAGE_SIZE;
const EXHAUSTED: usize = 0;
const FRESH: usize = 1;
const RETIRED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Exhausted,
    Counting(usize),
    List(BlockPtr),
    Retired,
}

#[inline(always)]
fn decode(word: usize) -> Slot {
    match word {
        EXHAUSTED => Slot::Exhausted,
        RETIRED => Slot::Retired,
        w if w > COUNT_LIMIT => {
            // SAFETY: only heap blocks are stored above COUNT_LIMIT
            match unsafe { BlockPtr::from_addr(w) } {
                Some(head) => Slot::List(head),
                None => Slot::Exhausted,
            }
        }
        w => Slot::Counting(w),
    }
}

/// Result of the lock-free half of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FastAlloc {
    Hit(BlockPtr),
    /// Serve one object from the global heap.
    Global,
    /// Take a batch from the global heap and install it.
    Refill,
}

pub(crate) struct LocalCache {
    slots: [[AtomicUsize; SIZE_CLASSES]; ObjectKind::COUNT],
}

impl LocalCache {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| std::array::from_fn(|_| AtomicUsize::new(FRESH))),
        }
    }

    #[inline(always)]
    fn slot(&self, kind: ObjectKind, class: usize) -> &AtomicUsize {
        &self.slots[kind.index()][class]
    }

    /// Puts every slot back to counting from one. The previous contents
    /// must have been flushed.
    pub(crate) fn init(&self) {
        for slot in self.slots.iter().flatten() {
            debug_assert!(matches!(
                decode(slot.load(Ordering::Relaxed)),
                Slot::Counting(_) | Slot::Retired | Slot::Exhausted
            ));
            slot.store(FRESH, Ordering::Relaxed);
        }
    }

    /// Owner only.
    #[inline]
    pub(crate) fn try_alloc(&self, kind: ObjectKind, class: usize, direct_granules: usize) -> FastAlloc {
        let slot = self.slot(kind, class);
        match decode(slot.load(Ordering::Relaxed)) {
            Slot::List(head) => {
                // SAFETY: the list is confined to this thread
                let (block, next) = unsafe { freelist::pop_raw(head) };
                slot.store(next, Ordering::Release);
                FastAlloc::Hit(block)
            }
            Slot::Counting(n) if n <= direct_granules => {
                slot.store(n + class_granules(class) + 1, Ordering::Relaxed);
                FastAlloc::Global
            }
            Slot::Counting(_) | Slot::Exhausted => FastAlloc::Refill,
            Slot::Retired => FastAlloc::Global,
        }
    }

    /// Owner only. Installs a refill batch and pops its first object.
    pub(crate) fn install(&self, kind: ObjectKind, class: usize, mut batch: FreeList) -> Option<BlockPtr> {
        let slot = self.slot(kind, class);
        debug_assert!(matches!(
            decode(slot.load(Ordering::Relaxed)),
            Slot::Counting(_) | Slot::Exhausted
        ));
        let first = batch.pop();
        slot.store(batch.into_raw(), Ordering::Release);
        first
    }

    /// Owner only. Pushes `block` on the local list if the class runs
    /// locally; returns false when the caller must free it globally.
    ///
    /// # Safety
    /// `block` must be an unreferenced object of this kind and class.
    pub(crate) unsafe fn free(&self, kind: ObjectKind, class: usize, block: BlockPtr) -> bool {
        let slot = self.slot(kind, class);
        let head = match decode(slot.load(Ordering::Relaxed)) {
            Slot::List(head) => head.addr(),
            Slot::Exhausted => 0,
            Slot::Counting(_) | Slot::Retired => return false,
        };
        // SAFETY: contract of the caller, the list is confined to this thread
        let new_head = unsafe { freelist::push_raw(block, head) };
        slot.store(new_head, Ordering::Release);
        true
    }

    /// Flushes every local list onto the global lists and retires the
    /// slots. Returns the number of objects handed back.
    ///
    /// # Safety
    /// global lock held; the owner is the caller or is stopped for good.
    pub(crate) unsafe fn destroy(&self, heap: &mut GlobalHeap) -> usize {
        let mut flushed = 0;
        for kind in ObjectKind::ALL {
            for class in 0..SIZE_CLASSES {
                let word = self.slot(kind, class).swap(RETIRED, Ordering::AcqRel);
                if let Slot::List(head) = decode(word) {
                    // SAFETY: the chain belonged to this cache and is detached now
                    let list = unsafe { FreeList::from_raw(head.addr()) };
                    flushed += list.len();
                    heap.give_back(kind, class, list);
                }
            }
        }
        flushed
    }

    /// Visits every object sitting on a local list.
    ///
    /// # Safety
    /// global lock held and the owner stopped (or the caller).
    pub(crate) unsafe fn for_each_cached(&self, f: &mut dyn FnMut(ObjectKind, usize, BlockPtr)) {
        for kind in ObjectKind::ALL {
            for class in 0..SIZE_CLASSES {
                if let Slot::List(head) = decode(self.slot(kind, class).load(Ordering::Acquire)) {
                    // SAFETY: contract of the caller, the chain cannot change
                    unsafe { freelist::for_each_raw(head.addr(), |b| f(kind, class, b)) };
                }
            }
        }
    }

    /// Objects on the local list of one class.
    ///
    /// # Safety
    /// same as [`LocalCache::for_each_cached`].
    pub(crate) unsafe fn cached_len(&self, kind: ObjectKind, class: usize) -> usize {
        let mut len = 0;
        if let Slot::List(head) = decode(self.slot(kind, class).load(Ordering::Acquire)) {
            // SAFETY: contract of the caller
            unsafe { freelist::for_each_raw(head.addr(), |_| len += 1) };
        }
        len
    }

    #[cfg(test)]
    pub(crate) fn is_local(&self, kind: ObjectKind, class: usize) -> bool {
        matches!(
            decode(self.slot(kind, class).load(Ordering::Acquire)),
            Slot::List(_) | Slot::Exhausted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::class_bytes;

    const DIRECT: usize = 16;

    fn alloc(cache: &LocalCache, heap: &mut GlobalHeap, kind: ObjectKind, class: usize) -> BlockPtr {
        match cache.try_alloc(kind, class, DIRECT) {
            FastAlloc::Hit(b) => b,
            FastAlloc::Global => heap.alloc(kind, class).unwrap(),
            FastAlloc::Refill => {
                let batch = heap.alloc_many(kind, class).unwrap();
                cache.install(kind, class, batch).unwrap()
            }
        }
    }

    #[test]
    fn counts_before_switching_to_local() {
        let mut heap = GlobalHeap::new(16 * 1024);
        let cache = LocalCache::new();
        let class = 3;
        let step = class_granules(class) + 1;
        let global_allocs = (DIRECT - FRESH) / step + 1;

        for i in 0..global_allocs {
            assert_eq!(
                cache.try_alloc(ObjectKind::Normal, class, DIRECT),
                FastAlloc::Global,
                "allocation {i} must still use the global path"
            );
        }
        assert_eq!(cache.try_alloc(ObjectKind::Normal, class, DIRECT), FastAlloc::Refill);
        let batch = heap.alloc_many(ObjectKind::Normal, class).unwrap();
        assert!(cache.install(ObjectKind::Normal, class, batch).is_some());
        assert!(cache.is_local(ObjectKind::Normal, class));
        assert!(matches!(
            cache.try_alloc(ObjectKind::Normal, class, DIRECT),
            FastAlloc::Hit(_)
        ));
    }

    #[test]
    fn refills_never_hand_out_a_block_twice() {
        let mut heap = GlobalHeap::new(16 * 1024);
        let cache = LocalCache::new();
        let class = SIZE_CLASSES - 1;
        let per_refill = crate::heap::REFILL_BYTES / class_bytes(class);
        let total = per_refill * 5;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..total {
            let block = alloc(&cache, &mut heap, ObjectKind::PointerFree, class);
            assert!(seen.insert(block), "{block:?} handed out twice");
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn free_goes_local_only_in_local_mode() {
        let mut heap = GlobalHeap::new(16 * 1024);
        let cache = LocalCache::new();
        let block = heap.alloc(ObjectKind::Normal, 2).unwrap();
        // SAFETY: unreferenced block of class 2
        assert!(!unsafe { cache.free(ObjectKind::Normal, 2, block) }, "counting slot declines");

        for _ in 0..64 {
            let _ = alloc(&cache, &mut heap, ObjectKind::Normal, 2);
        }
        assert!(cache.is_local(ObjectKind::Normal, 2));
        // SAFETY: cache owned by this thread
        let before = unsafe { cache.cached_len(ObjectKind::Normal, 2) };
        // SAFETY: unreferenced block of class 2
        assert!(unsafe { cache.free(ObjectKind::Normal, 2, block) });
        // SAFETY: cache owned by this thread
        assert_eq!(unsafe { cache.cached_len(ObjectKind::Normal, 2) }, before + 1);
    }

    #[test]
    fn destroy_conserves_blocks() {
        let mut heap = GlobalHeap::new(16 * 1024);
        let cache = LocalCache::new();
        let class = 5;
        let mut live = Vec::new();
        for _ in 0..150 {
            live.push(alloc(&cache, &mut heap, ObjectKind::Normal, class));
        }
        for block in live.drain(..75) {
            // SAFETY: unreferenced block of this class
            if !unsafe { cache.free(ObjectKind::Normal, class, block) } {
                // SAFETY: as above
                unsafe { heap.free(ObjectKind::Normal, class, block) };
            }
        }
        // SAFETY: cache owned by this thread
        let cached = unsafe { cache.cached_len(ObjectKind::Normal, class) };
        let global = heap.free_len(ObjectKind::Normal, class);
        let carved = heap.carved(ObjectKind::Normal, class);
        assert_eq!(global + cached + live.len(), carved);

        // SAFETY: owner flushing its own cache
        let flushed = unsafe { cache.destroy(&mut heap) };
        assert_eq!(flushed, cached);
        assert_eq!(heap.free_len(ObjectKind::Normal, class) + live.len(), carved);
        assert_eq!(
            cache.try_alloc(ObjectKind::Normal, class, DIRECT),
            FastAlloc::Global,
            "retired slots must not be followed"
        );
    }

    #[test]
    fn for_each_cached_visits_every_local_block() {
        let mut heap = GlobalHeap::new(16 * 1024);
        let cache = LocalCache::new();
        for _ in 0..40 {
            let _ = alloc(&cache, &mut heap, ObjectKind::Normal, 1);
        }
        let mut visited = 0;
        // SAFETY: cache owned by this thread
        unsafe {
            cache.for_each_cached(&mut |kind, class, block| {
                assert_eq!(kind, ObjectKind::Normal);
                assert_eq!(class, 1);
                assert!(heap.owns(block));
                visited += 1;
            })
        };
        // SAFETY: cache owned by this thread
        assert_eq!(visited, unsafe { cache.cached_len(ObjectKind::Normal, 1) });
        assert!(visited > 0);
    }
}
