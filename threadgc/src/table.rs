//! Thread record storage.
//!
//! [`ThreadTable`] is the hashed store used with explicit registration,
//! [`SlotTable`] the fixed array used when threads attach without taking
//! the global lock. [`Registry`] selects one of them at construction.

use std::{
    alloc::Layout,
    cell::UnsafeCell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use parking_lot::MutexGuard;

use crate::{StackBounds, ThreadError, ThreadFlags, ThreadId, ThreadRecord, heap::GlobalHeap};

/// Proof that the global allocation lock is held.
pub(crate) type HeapLock<'a> = MutexGuard<'a, GlobalHeap>;

// ── Bootstrap allocator ───────────────────────────────────────────────

/// Raw memory for thread records, usable before the collector is up.
pub trait RecordAllocator: Send + Sync {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `alloc_zeroed` with the same layout.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl RecordAllocator for SystemAllocator {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: ThreadRecord has a non-zero size
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: contract of the caller
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

// ── Explicit: hashed store ────────────────────────────────────────────

pub(crate) struct ThreadTable {
    buckets: Box<[AtomicPtr<ThreadRecord>]>,
    /// Record for the first registration, never handed to the allocator.
    bootstrap: ThreadRecord,
    bootstrap_used: AtomicBool,
    /// Removed records waiting for reuse. Guarded by the global lock.
    spare: UnsafeCell<Vec<NonNull<ThreadRecord>>>,
    /// Every record obtained from the allocator. Guarded by the global lock.
    owned: UnsafeCell<Vec<NonNull<ThreadRecord>>>,
    allocator: Box<dyn RecordAllocator>,
}

// SAFETY: chains are published through atomics; the cells are only
// touched with the global lock held.
unsafe impl Send for ThreadTable {}
// SAFETY: see above
unsafe impl Sync for ThreadTable {}

impl ThreadTable {
    pub(crate) fn new(buckets: usize, allocator: Box<dyn RecordAllocator>) -> Self {
        debug_assert!(buckets.is_power_of_two());
        Self {
            buckets: (0..buckets).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            bootstrap: ThreadRecord::new(),
            bootstrap_used: AtomicBool::new(false),
            spare: UnsafeCell::new(Vec::new()),
            owned: UnsafeCell::new(Vec::new()),
            allocator,
        }
    }

    #[inline]
    fn bucket(&self, id: ThreadId) -> &AtomicPtr<ThreadRecord> {
        &self.buckets[id.bucket(self.buckets.len())]
    }

    fn is_bootstrap(&self, record: &ThreadRecord) -> bool {
        ptr::eq(record, &self.bootstrap)
    }

    /// Walks the chain of `id`, newest record first.
    ///
    /// # Safety
    /// the global lock is held, or the caller tolerates being diverted into
    /// another chain by a concurrent removal (records are never freed while
    /// the table lives).
    unsafe fn chain(&self, id: ThreadId) -> impl Iterator<Item = &ThreadRecord> {
        let mut cur = self.bucket(id).load(Ordering::Acquire);
        std::iter::from_fn(move || {
            // SAFETY: every linked record stays allocated while the table lives
            let record = unsafe { cur.as_ref() }?;
            cur = record.next.load(Ordering::Acquire);
            Some(record)
        })
    }

    pub(crate) fn lookup(&self, _lock: &HeapLock<'_>, id: ThreadId) -> Option<&ThreadRecord> {
        // SAFETY: lock held
        unsafe { self.chain(id) }.find(|r| r.id() == id)
    }

    /// Lock-free lookup of the caller's own live record.
    ///
    /// Only the owner removes its live record, so a live match cannot
    /// disappear under the caller. A concurrent removal of another record
    /// may divert the walk and produce a spurious miss; callers retry under
    /// the lock.
    pub(crate) fn lookup_own(&self, id: ThreadId) -> Option<&ThreadRecord> {
        // SAFETY: records are never freed while the table lives
        unsafe { self.chain(id) }
            .take(self.buckets.len() * 4)
            .find(|r| r.id() == id && !r.is_finished() && r.stack_base() != 0)
    }

    pub(crate) fn insert(
        &self,
        lock: &HeapLock<'_>,
        id: ThreadId,
        kernel_id: Option<u64>,
        bounds: StackBounds,
    ) -> Result<&ThreadRecord, ThreadError> {
        let record = self.acquire_record(lock)?;
        // SAFETY: lock held, the record is not linked anywhere
        unsafe { record.reset(id, kernel_id, bounds) };
        let bucket = self.bucket(id);
        record.next.store(bucket.load(Ordering::Relaxed), Ordering::Relaxed);
        bucket.store(ptr::from_ref(record).cast_mut(), Ordering::Release);
        Ok(record)
    }

    fn acquire_record(&self, _lock: &HeapLock<'_>) -> Result<&ThreadRecord, ThreadError> {
        if !self.bootstrap_used.swap(true, Ordering::Relaxed) {
            return Ok(&self.bootstrap);
        }
        // SAFETY: lock held
        let spare = unsafe { &mut *self.spare.get() };
        if let Some(record) = spare.pop() {
            // SAFETY: spare records stay allocated while the table lives
            return Ok(unsafe { record.as_ref() });
        }

        let layout = Layout::new::<ThreadRecord>();
        let Some(raw) = self.allocator.alloc_zeroed(layout) else {
            log::warn!("thread record allocation failed");
            return Err(ThreadError::OutOfMemory);
        };
        let record = raw.cast::<ThreadRecord>();
        // SAFETY: fresh allocation with ThreadRecord's layout
        unsafe { record.as_ptr().write(ThreadRecord::new()) };
        // SAFETY: lock held
        unsafe { (*self.owned.get()).push(record) };
        // SAFETY: initialized above, freed only in Drop
        Ok(unsafe { record.as_ref() })
    }

    /// Unlinks `record` and keeps it for reuse.
    pub(crate) fn remove(&self, _lock: &HeapLock<'_>, record: &ThreadRecord) {
        let target = ptr::from_ref(record).cast_mut();
        let mut link = self.bucket(record.id());
        loop {
            let cur = link.load(Ordering::Acquire);
            if cur.is_null() {
                debug_assert!(false, "removing unlinked record {}", record.id());
                return;
            }
            if cur == target {
                link.store(record.next.load(Ordering::Relaxed), Ordering::Release);
                break;
            }
            // SAFETY: linked records stay allocated
            link = unsafe { &(*cur).next };
        }
        record.clear_stack_base();

        if self.is_bootstrap(record) {
            self.bootstrap_used.store(false, Ordering::Relaxed);
        } else {
            // SAFETY: lock held
            unsafe { (*self.spare.get()).push(NonNull::from(record)) };
        }
    }

    pub(crate) fn for_each<'a>(&'a self, _lock: &HeapLock<'_>, mut f: impl FnMut(&'a ThreadRecord)) {
        for bucket in self.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire);
            // SAFETY: lock held, linked records stay allocated
            while let Some(record) = unsafe { cur.as_ref() } {
                cur = record.next.load(Ordering::Acquire);
                f(record);
            }
        }
    }
}

impl Drop for ThreadTable {
    fn drop(&mut self) {
        let layout = Layout::new::<ThreadRecord>();
        for record in self.owned.get_mut().drain(..) {
            // SAFETY: allocated and initialized by acquire_record, unreachable now
            unsafe {
                ptr::drop_in_place(record.as_ptr());
                self.allocator.dealloc(record.cast(), layout);
            }
        }
    }
}

// ── Implicit: fixed slot array ────────────────────────────────────────

struct Slot {
    in_use: AtomicBool,
    record: ThreadRecord,
}

pub(crate) struct SlotTable {
    slots: Box<[Slot]>,
    /// One past the highest slot ever claimed.
    max_index: AtomicUsize,
    attached_while_stopped: AtomicBool,
}

impl SlotTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    in_use: AtomicBool::new(false),
                    record: ThreadRecord::new(),
                })
                .collect(),
            max_index: AtomicUsize::new(0),
            attached_while_stopped: AtomicBool::new(false),
        }
    }

    /// Claims a slot without the global lock. The record becomes visible to
    /// the coordinator with the final store of its stack base; if a stop was
    /// requested by then, the attachment is flagged so the coordinator
    /// rescans.
    pub(crate) fn claim(
        &self,
        id: ThreadId,
        kernel_id: Option<u64>,
        bounds: StackBounds,
        stop_requested: &AtomicBool,
    ) -> Result<(&ThreadRecord, bool), ThreadError> {
        let Some(index) = self.slots.iter().position(|s| {
            s.in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        }) else {
            log::warn!("no free thread slot among {}", self.slots.len());
            return Err(ThreadError::OutOfMemory);
        };
        self.max_index.fetch_max(index + 1, Ordering::AcqRel);

        let record = &self.slots[index].record;
        // SAFETY: the slot is exclusively ours; stack_base is still 0 so the
        // coordinator skips it until reset publishes it
        unsafe { record.reset(id, kernel_id, bounds) };

        let raced = stop_requested.load(Ordering::SeqCst);
        if raced {
            self.attached_while_stopped.store(true, Ordering::SeqCst);
        }
        Ok((record, raced))
    }

    /// Live record of `id`.
    pub(crate) fn lookup_own(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.iter_claimed()
            .find(|r| r.id() == id && !r.is_finished() && r.stack_base() != 0)
    }

    /// Live record of `id`, or a finished one waiting for its join.
    pub(crate) fn lookup(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.lookup_own(id)
            .or_else(|| self.iter_claimed().find(|r| r.id() == id && r.is_finished()))
    }

    pub(crate) fn release(&self, record: &ThreadRecord) {
        let Some(slot) = self.slots.iter().find(|s| ptr::eq(&s.record, record)) else {
            debug_assert!(false, "record {} is not in the slot table", record.id());
            return;
        };
        record.add_flag(ThreadFlags::FINISHED);
        record.clear_stack_base();
        slot.in_use.store(false, Ordering::Release);
    }

    fn iter_claimed(&self) -> impl Iterator<Item = &ThreadRecord> {
        let max = self.max_index.load(Ordering::Acquire).min(self.slots.len());
        self.slots[..max]
            .iter()
            .filter(|s| s.in_use.load(Ordering::Acquire))
            .map(|s| &s.record)
    }

    pub(crate) fn for_each<'a>(&'a self, f: impl FnMut(&'a ThreadRecord)) {
        self.iter_claimed().filter(|r| r.stack_base() != 0).for_each(f);
    }

    pub(crate) fn clear_attached(&self) {
        self.attached_while_stopped.store(false, Ordering::SeqCst);
    }

    pub(crate) fn take_attached(&self) -> bool {
        self.attached_while_stopped.swap(false, Ordering::SeqCst)
    }
}

// ── Registry ──────────────────────────────────────────────────────────

/// Where records live, chosen once when the collector is built.
pub(crate) enum Registry {
    Explicit(ThreadTable),
    Implicit(SlotTable),
}

impl Registry {
    /// Lock-free lookup of the caller's own live record.
    pub(crate) fn lookup_own(&self, id: ThreadId) -> Option<&ThreadRecord> {
        match self {
            Registry::Explicit(table) => table.lookup_own(id),
            Registry::Implicit(slots) => slots.lookup_own(id),
        }
    }

    /// Newest record for `id`, finished or not.
    pub(crate) fn lookup(&self, lock: &HeapLock<'_>, id: ThreadId) -> Option<&ThreadRecord> {
        match self {
            Registry::Explicit(table) => table.lookup(lock, id),
            Registry::Implicit(slots) => slots.lookup(id),
        }
    }

    pub(crate) fn for_each<'a>(&'a self, lock: &HeapLock<'_>, f: impl FnMut(&'a ThreadRecord)) {
        match self {
            Registry::Explicit(table) => table.for_each(lock, f),
            Registry::Implicit(slots) => slots.for_each(f),
        }
    }

    pub(crate) fn clear_attached(&self) {
        if let Registry::Implicit(slots) = self {
            slots.clear_attached();
        }
    }

    /// True when a thread attached while a stop was in progress.
    pub(crate) fn take_attached(&self) -> bool {
        match self {
            Registry::Explicit(_) => false,
            Registry::Implicit(slots) => slots.take_attached(),
        }
    }

    pub(crate) fn remove(&self, lock: &HeapLock<'_>, record: &ThreadRecord) {
        match self {
            Registry::Explicit(table) => table.remove(lock, record),
            Registry::Implicit(slots) => slots.release(record),
        }
    }
}
