//! Per-thread control blocks.

use std::{
    cell::{Cell, UnsafeCell},
    fmt,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

use crate::{ThreadError, local_alloc::LocalCache, system};

/// Sentinel for a stack minimum that has not been measured yet.
pub const ADDR_LIMIT: usize = usize::MAX;

/// Words saved per register snapshot.
pub const REGISTER_WORDS: usize = 16;

// ── Identity ──────────────────────────────────────────────────────────

/// Native thread identifier as handed out by the OS threading layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Bucket of this id in a table of `buckets` entries (a power of two).
    ///
    /// Mixes in the id shifted by 8 (and 16 on 64-bit) so that sequential
    /// or pointer-derived ids spread across buckets.
    #[inline]
    pub fn bucket(self, buckets: usize) -> usize {
        debug_assert!(buckets.is_power_of_two());
        let id = self.0 as usize;
        #[cfg(target_pointer_width = "64")]
        let mixed = id ^ (id >> 8) ^ (id >> 16);
        #[cfg(not(target_pointer_width = "64"))]
        let mixed = id ^ (id >> 8);
        mixed & (buckets - 1)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ── Flags ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadFlags(pub u8);

impl ThreadFlags {
    pub const NONE: Self = Self(0);
    /// The thread exited, the record waits for a join.
    pub const FINISHED: Self = Self(1 << 0);
    /// Nobody will join, the record goes away at exit.
    pub const DETACHED: Self = Self(1 << 1);
    pub const MAIN_THREAD: Self = Self(1 << 2);
    /// The thread left with collection disabled on its behalf.
    pub const DISABLED_GC: Self = Self(1 << 3);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

/// Lifecycle position of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Active,
    /// Running foreign code with its stack pointer published.
    Blocked,
    Finished,
}

// ── Stack / registers ─────────────────────────────────────────────────

/// Stack extent of a thread. `cold` is the base (highest address),
/// `hot` the innermost boundary known so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub cold: usize,
    pub hot: usize,
}

impl StackBounds {
    pub const fn new(cold: usize, hot: usize) -> Self {
        Self { cold, hot }
    }

    /// Bounds of the calling frame: everything below the caller is scanned.
    #[inline(never)]
    pub fn here() -> Self {
        let sp = system::approx_sp();
        Self { cold: sp, hot: sp }
    }

    pub fn validate(&self) -> Result<(), ThreadError> {
        if self.cold == 0 || self.hot == 0 || self.hot > self.cold {
            return Err(ThreadError::InvalidStackBounds {
                cold: self.cold,
                hot: self.hot,
            });
        }
        Ok(())
    }
}

/// Register state captured from a stopped thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub sp: usize,
    pub registers: [usize; REGISTER_WORDS],
}

impl RegisterSnapshot {
    pub const fn at(sp: usize) -> Self {
        Self {
            sp,
            registers: [0; REGISTER_WORDS],
        }
    }
}

/// A stretch of stack entered through `call_with_gc_active` from inside a
/// blocking region. Frames between `saved_sp` of the enclosing blocking
/// region and `frame` are foreign and never scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackSection {
    pub frame: usize,
    pub saved_sp: usize,
}

// ── ThreadRecord ──────────────────────────────────────────────────────

/// Control block of one registered thread.
///
/// Owner-only fields (the allocation cache, finalizer counters, the handle
/// count) are touched
/// by the owning thread, or by the coordinator while the owner is stopped.
/// `blocked_sp` is written lock-free by the owner. Everything else changes
/// only under the global lock.
pub struct ThreadRecord {
    pub(crate) next: AtomicPtr<ThreadRecord>,
    id: AtomicU64,
    kernel_id: AtomicU64,
    flags: AtomicU8,
    stack_base: AtomicUsize,
    last_stack_min: AtomicUsize,
    blocked_sp: AtomicUsize,
    suspended: AtomicBool,
    context: UnsafeCell<Option<RegisterSnapshot>>,
    sections: UnsafeCell<Vec<StackSection>>,
    finalizer_nested: Cell<u8>,
    finalizer_skipped: Cell<u16>,
    /// Live `Mutator` handles of the owner.
    handles: Cell<u32>,
    pub(crate) cache: LocalCache,
}

// SAFETY: shared fields are atomics; the cells are guarded by the global
// lock or confined to the owning thread as documented above.
unsafe impl Send for ThreadRecord {}
// SAFETY: see above
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            id: AtomicU64::new(0),
            kernel_id: AtomicU64::new(0),
            flags: AtomicU8::new(0),
            stack_base: AtomicUsize::new(0),
            last_stack_min: AtomicUsize::new(ADDR_LIMIT),
            blocked_sp: AtomicUsize::new(0),
            suspended: AtomicBool::new(false),
            context: UnsafeCell::new(None),
            sections: UnsafeCell::new(Vec::new()),
            finalizer_nested: Cell::new(0),
            finalizer_skipped: Cell::new(0),
            handles: Cell::new(0),
            cache: LocalCache::new(),
        }
    }

    /// Resets a fresh or recycled record for `id`.
    ///
    /// # Safety
    /// global lock held (or the slot exclusively claimed), the record is not
    /// visible to the coordinator yet and its previous owner is gone.
    pub(crate) unsafe fn reset(&self, id: ThreadId, kernel_id: Option<u64>, bounds: StackBounds) {
        self.kernel_id.store(kernel_id.unwrap_or(0), Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.last_stack_min.store(bounds.hot, Ordering::Relaxed);
        self.blocked_sp.store(0, Ordering::Relaxed);
        self.suspended.store(false, Ordering::Relaxed);
        // SAFETY: contract of the caller
        unsafe {
            *self.context.get() = None;
            (*self.sections.get()).clear();
        }
        self.finalizer_nested.set(0);
        self.finalizer_skipped.set(0);
        debug_assert_eq!(self.handles.get(), 0, "recycling a record with live handles");
        self.handles.set(0);
        self.cache.init();
        self.id.store(id.0, Ordering::Release);
        self.stack_base.store(bounds.cold, Ordering::SeqCst);
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        ThreadId(self.id.load(Ordering::Acquire))
    }

    pub fn kernel_id(&self) -> Option<u64> {
        match self.kernel_id.load(Ordering::Relaxed) {
            0 => None,
            k => Some(k),
        }
    }

    #[inline]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_flag(&self, flag: ThreadFlags) -> bool {
        self.flags().contains(flag)
    }

    pub(crate) fn add_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_or(flag.0, Ordering::AcqRel);
    }

    pub(crate) fn remove_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_and(!flag.0, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.has_flag(ThreadFlags::FINISHED)
    }

    pub fn state(&self) -> ThreadState {
        if self.is_finished() {
            ThreadState::Finished
        } else if self.blocked_sp() != 0 {
            ThreadState::Blocked
        } else {
            ThreadState::Active
        }
    }

    // ── stack ─────────────────────────────────────────────────────────

    /// Cold end of the stack, 0 while registration is incomplete or after
    /// the thread was found dead.
    #[inline]
    pub fn stack_base(&self) -> usize {
        self.stack_base.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_stack_base(&self) {
        self.stack_base.store(0, Ordering::SeqCst);
    }

    pub fn last_stack_min(&self) -> usize {
        self.last_stack_min.load(Ordering::Relaxed)
    }

    /// Folds `sp` into the cached hot boundary and returns the boundary.
    pub(crate) fn observe_sp(&self, sp: usize) -> usize {
        let prev = self.last_stack_min.fetch_min(sp, Ordering::Relaxed);
        prev.min(sp)
    }

    // ── blocked region ────────────────────────────────────────────────

    #[inline]
    pub fn blocked_sp(&self) -> usize {
        self.blocked_sp.load(Ordering::Acquire)
    }

    /// Owner only, lock-free. Pairs with the coordinator's acquire load.
    #[inline]
    pub(crate) fn publish_blocked_sp(&self, sp: usize) {
        debug_assert_ne!(sp, 0);
        self.blocked_sp.store(sp, Ordering::Release);
    }

    /// Owner only, with the global lock held.
    #[inline]
    pub(crate) fn clear_blocked_sp(&self) {
        self.blocked_sp.store(0, Ordering::Release);
    }

    /// # Safety
    /// global lock held.
    pub(crate) unsafe fn push_section(&self, section: StackSection) {
        // SAFETY: contract of the caller
        unsafe { (*self.sections.get()).push(section) };
    }

    /// # Safety
    /// global lock held.
    pub(crate) unsafe fn pop_section(&self) -> Option<StackSection> {
        // SAFETY: contract of the caller
        unsafe { (*self.sections.get()).pop() }
    }

    /// # Safety
    /// global lock held.
    pub(crate) unsafe fn sections(&self) -> &[StackSection] {
        // SAFETY: contract of the caller
        unsafe { &*self.sections.get() }
    }

    // ── suspension ────────────────────────────────────────────────────

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// # Safety
    /// global lock held by the suspending coordinator.
    pub(crate) unsafe fn mark_suspended(&self, context: RegisterSnapshot) {
        debug_assert!(!self.is_suspended(), "thread {} suspended twice", self.id());
        // SAFETY: contract of the caller
        unsafe { *self.context.get() = Some(context) };
        self.suspended.store(true, Ordering::Release);
    }

    /// # Safety
    /// global lock held by the coordinator that suspended this record.
    pub(crate) unsafe fn mark_resumed(&self) {
        // SAFETY: contract of the caller
        unsafe { *self.context.get() = None };
        self.suspended.store(false, Ordering::Release);
    }

    /// # Safety
    /// global lock held.
    pub(crate) unsafe fn context(&self) -> Option<RegisterSnapshot> {
        // SAFETY: contract of the caller
        unsafe { *self.context.get() }
    }

    // ── handles ───────────────────────────────────────────────────────

    /// Owner only.
    pub(crate) fn acquire_handle(&self) {
        self.handles.set(self.handles.get() + 1);
    }

    /// Owner only.
    pub(crate) fn release_handle(&self) {
        debug_assert_ne!(self.handles.get(), 0);
        self.handles.set(self.handles.get().saturating_sub(1));
    }

    pub(crate) fn handles(&self) -> u32 {
        self.handles.get()
    }

    // ── finalizers ────────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) fn finalizer_nested(&self) -> u8 {
        self.finalizer_nested.get()
    }

    pub(crate) fn set_finalizer_nested(&self, level: u8) {
        self.finalizer_nested.set(level);
    }

    /// Decides whether finalizers may run at the current nesting depth,
    /// skipping all but one in `2^depth` calls while nested.
    pub(crate) fn enter_finalizers(&self) -> Option<u8> {
        let level = self.finalizer_nested.get();
        if level > 0 {
            let skipped = self.finalizer_skipped.get().saturating_add(1);
            let limit = 1u32 << level.min(15);
            if u32::from(skipped) < limit {
                self.finalizer_skipped.set(skipped);
                return None;
            }
            self.finalizer_skipped.set(0);
        }
        self.finalizer_nested.set(level.saturating_add(1));
        Some(level)
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id(),
            kernel_id: self.kernel_id(),
            flags: self.flags(),
            bounds: StackBounds {
                cold: self.stack_base(),
                hot: self.last_stack_min(),
            },
            state: self.state(),
            suspended: self.is_suspended(),
        }
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id())
            .field("flags", &self.flags())
            .field("stack_base", &format_args!("{:#x}", self.stack_base()))
            .field("blocked_sp", &format_args!("{:#x}", self.blocked_sp()))
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

/// Copy of a record's public state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub id: ThreadId,
    pub kernel_id: Option<u64>,
    pub flags: ThreadFlags,
    pub bounds: StackBounds,
    pub state: ThreadState,
    pub suspended: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_spreads_sequential_ids() {
        let mut used = std::collections::HashSet::new();
        for i in 0..64u64 {
            used.insert(ThreadId(i).bucket(256));
        }
        assert_eq!(used.len(), 64, "small sequential ids must not collide");
    }

    #[test]
    fn bucket_spreads_page_aligned_ids() {
        let mut used = std::collections::HashSet::new();
        for i in 1..=32u64 {
            used.insert(ThreadId(0x7f00_0000_0000 + i * 0x1000).bucket(256));
        }
        assert!(used.len() > 16, "aligned ids landed in {} buckets", used.len());
    }

    #[test]
    fn flags_compose() {
        let f = ThreadFlags::NONE
            .with(ThreadFlags::DETACHED)
            .with(ThreadFlags::MAIN_THREAD);
        assert!(f.contains(ThreadFlags::DETACHED));
        assert!(!f.contains(ThreadFlags::FINISHED));
        assert!(!f.without(ThreadFlags::DETACHED).contains(ThreadFlags::DETACHED));
    }

    #[test]
    fn stack_bounds_validation() {
        assert!(StackBounds::new(0x2000, 0x1000).validate().is_ok());
        assert!(StackBounds::new(0x2000, 0x2000).validate().is_ok());
        assert_eq!(
            StackBounds::new(0x1000, 0x2000).validate(),
            Err(ThreadError::InvalidStackBounds { cold: 0x1000, hot: 0x2000 })
        );
        assert!(StackBounds::new(0, 0).validate().is_err());
    }

    #[test]
    fn reset_publishes_identity_and_bounds() {
        let record = ThreadRecord::new();
        // SAFETY: record not shared
        unsafe { record.reset(ThreadId(7), Some(99), StackBounds::new(0x8000, 0x7000)) };
        let snap = record.snapshot();
        assert_eq!(snap.id, ThreadId(7));
        assert_eq!(snap.kernel_id, Some(99));
        assert_eq!(snap.bounds, StackBounds::new(0x8000, 0x7000));
        assert_eq!(snap.state, ThreadState::Active);
        assert!(!snap.suspended);
    }

    #[test]
    fn stack_min_only_shrinks() {
        let record = ThreadRecord::new();
        // SAFETY: record not shared
        unsafe { record.reset(ThreadId(1), None, StackBounds::new(0x9000, 0x8000)) };
        assert_eq!(record.observe_sp(0x7000), 0x7000);
        assert_eq!(record.observe_sp(0x7800), 0x7000, "minimum must not grow back");
        assert_eq!(record.last_stack_min(), 0x7000);
    }

    #[test]
    fn blocked_state_follows_published_sp() {
        let record = ThreadRecord::new();
        // SAFETY: record not shared
        unsafe { record.reset(ThreadId(3), None, StackBounds::new(0x9000, 0x9000)) };
        record.publish_blocked_sp(0x8800);
        assert_eq!(record.state(), ThreadState::Blocked);
        record.clear_blocked_sp();
        assert_eq!(record.state(), ThreadState::Active);
        record.add_flag(ThreadFlags::FINISHED);
        assert_eq!(record.state(), ThreadState::Finished);
    }

    #[test]
    fn nested_finalizers_are_throttled() {
        let record = ThreadRecord::new();
        assert_eq!(record.enter_finalizers(), Some(0));
        // depth 1: one call in two runs
        assert_eq!(record.enter_finalizers(), None);
        assert_eq!(record.enter_finalizers(), Some(1));
        assert_eq!(record.finalizer_nested(), 2);
        record.set_finalizer_nested(0);
        assert_eq!(record.enter_finalizers(), Some(0));
    }
}
