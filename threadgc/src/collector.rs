//! The process-wide collector state and the thread lifecycle built on it.

use std::{
    fmt,
    marker::PhantomData,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    CollectorConfig, DiscoveryKind, ParkingControl, RecordSnapshot, StackBounds, ThreadControl,
    ThreadError, ThreadFlags, ThreadId, ThreadRecord,
    freelist::BlockPtr,
    heap::{GlobalHeap, ObjectKind, SIZE_CLASSES},
    local_alloc::FastAlloc,
    marker::MarkerPool,
    record::StackSection,
    system,
    table::{HeapLock, RecordAllocator, Registry, SlotTable, SystemAllocator, ThreadTable},
};

/// Lock-free self lookups retried before reporting a miss.
const OWN_LOOKUP_TRIES: usize = 4;

pub struct Collector {
    config: CollectorConfig,
    pub(crate) heap: Mutex<GlobalHeap>,
    pub(crate) registry: Registry,
    pub(crate) control: Arc<dyn ThreadControl>,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) markers: Option<MarkerPool>,
    pub(crate) world_stops: AtomicU64,
    /// Threads that exited with collection disabled on their behalf.
    dont_gc: AtomicUsize,
    spawned: AtomicU64,
}

impl Collector {
    pub fn new(config: CollectorConfig, control: Arc<dyn ThreadControl>) -> Result<Arc<Self>, ThreadError> {
        Self::with_allocator(config, control, Box::new(SystemAllocator))
    }

    pub fn with_allocator(
        config: CollectorConfig,
        control: Arc<dyn ThreadControl>,
        allocator: Box<dyn RecordAllocator>,
    ) -> Result<Arc<Self>, ThreadError> {
        config.validate().map_err(ThreadError::InvalidConfig)?;
        Ok(Arc::new(Self::build(config, control, allocator)))
    }

    fn build(config: CollectorConfig, control: Arc<dyn ThreadControl>, allocator: Box<dyn RecordAllocator>) -> Self {
        let registry = match config.discovery {
            DiscoveryKind::Explicit => Registry::Explicit(ThreadTable::new(config.table_buckets, allocator)),
            DiscoveryKind::Implicit => Registry::Implicit(SlotTable::new(config.implicit_slots)),
        };
        let markers = (config.markers > 0).then(|| MarkerPool::start(config.markers));
        log::debug!("collector up: {:?} discovery, {} markers", config.discovery, config.markers);
        Self {
            heap: Mutex::new(GlobalHeap::new(config.chunk_bytes)),
            registry,
            control,
            stop_requested: AtomicBool::new(false),
            markers,
            world_stops: AtomicU64::new(0),
            dont_gc: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
            config,
        }
    }

    /// The process-wide collector, configured from the environment.
    pub fn global() -> &'static Arc<Collector> {
        static GLOBAL: OnceLock<Arc<Collector>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let mut config = CollectorConfig::from_env();
            if let Err(reason) = config.validate() {
                log::warn!("ignoring environment configuration: {reason}");
                config = CollectorConfig::default();
            }
            let control = Arc::new(ParkingControl::new(config.ack_timeout));
            Arc::new(Self::build(config, control, Box::new(SystemAllocator)))
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn world_stops(&self) -> u64 {
        self.world_stops.load(Ordering::Relaxed)
    }

    /// False while a thread that exited with collection disabled still
    /// holds its record.
    pub fn collection_allowed(&self) -> bool {
        self.dont_gc.load(Ordering::Acquire) == 0
    }

    // ── Locking ───────────────────────────────────────────────────────

    /// Live record of the calling thread.
    pub(crate) fn current_record(&self) -> Option<&ThreadRecord> {
        let id = self.control.current_thread_id();
        (0..OWN_LOOKUP_TRIES).find_map(|_| self.registry.lookup_own(id))
    }

    /// Takes the global lock on behalf of a registered thread. While the
    /// lock is contended the thread counts as blocked, so a coordinator
    /// holding the lock does not wait for it to stop.
    pub(crate) fn lock_heap_as(&self, record: &ThreadRecord) -> HeapLock<'_> {
        if let Some(heap) = self.heap.try_lock() {
            return heap;
        }
        let publish = record.blocked_sp() == 0;
        if publish {
            record.publish_blocked_sp(system::approx_sp());
        }
        let heap = self.heap.lock();
        if publish {
            record.clear_blocked_sp();
        }
        heap
    }

    pub(crate) fn lock_heap(&self) -> HeapLock<'_> {
        match self.current_record() {
            Some(record) => self.lock_heap_as(record),
            None => self.heap.lock(),
        }
    }

    /// Runs `wait` inside a blocking region when the caller is registered
    /// and not already blocked. `wait` must not touch the heap.
    #[inline(never)]
    fn blocking_wait<R>(&self, wait: impl FnOnce() -> R) -> R {
        let Some(record) = self.current_record().filter(|r| r.blocked_sp() == 0) else {
            return wait();
        };
        record.publish_blocked_sp(system::approx_sp());
        let result = wait();
        let _heap = self.heap.lock();
        record.clear_blocked_sp();
        result
    }

    // ── Registration ──────────────────────────────────────────────────

    /// Registers the calling thread with the stack extent `bounds`.
    pub fn register_thread(&self, bounds: StackBounds) -> Result<ThreadId, ThreadError> {
        self.register_with(bounds, ThreadFlags::NONE).map(ThreadRecord::id)
    }

    pub fn register_main_thread(&self, bounds: StackBounds) -> Result<ThreadId, ThreadError> {
        self.register_with(bounds, ThreadFlags::MAIN_THREAD).map(ThreadRecord::id)
    }

    fn register_with(&self, bounds: StackBounds, flags: ThreadFlags) -> Result<&ThreadRecord, ThreadError> {
        bounds.validate()?;
        let id = self.control.current_thread_id();
        let kernel_id = self.control.current_kernel_id();
        if self.registry.lookup_own(id).is_some() {
            log::warn!("thread {id} registered twice");
            return Err(ThreadError::DuplicateRegistration(id));
        }

        let record = match &self.registry {
            Registry::Explicit(table) => {
                let heap = self.heap.lock();
                if let Some(existing) = table.lookup(&heap, id) {
                    if !existing.is_finished() {
                        return Err(ThreadError::DuplicateRegistration(id));
                    }
                    // the id was reused before anyone joined the old thread
                    table.remove(&heap, existing);
                }
                self.control.attach(id);
                let record = table.insert(&heap, id, kernel_id, bounds).inspect_err(|_| {
                    self.control.detach(id);
                })?;
                record.add_flag(flags);
                record
            }
            Registry::Implicit(slots) => {
                if slots.lookup(id).is_some_and(ThreadRecord::is_finished) {
                    let _heap = self.heap.lock();
                    // a join may have reclaimed it meanwhile
                    if let Some(stale) = slots.lookup(id).filter(|r| r.is_finished()) {
                        slots.release(stale);
                    }
                }
                self.control.attach(id);
                let (record, raced) = slots
                    .claim(id, kernel_id, bounds, &self.stop_requested)
                    .inspect_err(|_| self.control.detach(id))?;
                record.add_flag(flags);
                if raced {
                    // wait out the stop that may have missed us
                    drop(self.lock_heap_as(record));
                }
                record
            }
        };
        log::debug!("registered thread {id}, stack {:#x}..{:#x}", bounds.hot, bounds.cold);
        Ok(record)
    }

    /// Retires the calling thread: flushes its allocation cache and either
    /// removes its record (detached) or keeps it for a join.
    pub fn unregister_thread(&self) -> Result<(), ThreadError> {
        let id = self.control.current_thread_id();
        let record = self.current_record().ok_or(ThreadError::NotRegistered(id))?;
        debug_assert_eq!(record.blocked_sp(), 0, "unregistering inside a blocking region");
        // the record is recycled once retired, a live handle would alias it
        if record.handles() != 0 {
            return Err(ThreadError::StillInUse(id));
        }

        let mut heap = self.lock_heap_as(record);
        // SAFETY: the owner flushes its own cache with the lock held
        let flushed = unsafe { record.cache.destroy(&mut heap) };
        if record.has_flag(ThreadFlags::DISABLED_GC) {
            record.remove_flag(ThreadFlags::DISABLED_GC);
            self.dont_gc.fetch_sub(1, Ordering::AcqRel);
        }
        record.add_flag(ThreadFlags::FINISHED);
        let detached = record.has_flag(ThreadFlags::DETACHED);
        if detached {
            self.registry.remove(&heap, record);
        }
        self.control.detach(id);
        drop(heap);
        log::debug!("unregistered thread {id}, flushed {flushed} cached objects, detached: {detached}");
        Ok(())
    }

    /// Reclaims the record of a finished, joinable thread.
    pub fn join_thread(&self, id: ThreadId) -> Result<(), ThreadError> {
        let heap = self.lock_heap();
        let record = self.registry.lookup(&heap, id).ok_or(ThreadError::NotRegistered(id))?;
        if !record.is_finished() {
            return Err(ThreadError::StillRunning(id));
        }
        self.registry.remove(&heap, record);
        log::debug!("joined thread {id}");
        Ok(())
    }

    /// Marks `id` as never to be joined. A finished record goes at once.
    pub fn detach_thread(&self, id: ThreadId) -> Result<(), ThreadError> {
        let heap = self.lock_heap();
        let record = self.registry.lookup(&heap, id).ok_or(ThreadError::NotRegistered(id))?;
        if record.is_finished() {
            self.registry.remove(&heap, record);
        } else {
            record.add_flag(ThreadFlags::DETACHED);
        }
        log::debug!("detached thread {id}");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.current_record().is_some()
    }

    /// Registered threads that have not finished.
    pub fn thread_count(&self) -> usize {
        let heap = self.lock_heap();
        let mut count = 0;
        self.registry.for_each(&heap, |r| {
            if !r.is_finished() {
                count += 1;
            }
        });
        count
    }

    pub fn lookup(&self, id: ThreadId) -> Option<RecordSnapshot> {
        let heap = self.lock_heap();
        self.registry.lookup(&heap, id).map(ThreadRecord::snapshot)
    }

    /// Objects on the global free list of one size class.
    pub fn free_objects(&self, kind: ObjectKind, class: usize) -> usize {
        self.lock_heap().free_len(kind, class)
    }

    /// Objects ever carved for one size class.
    pub fn carved_objects(&self, kind: ObjectKind, class: usize) -> usize {
        self.lock_heap().carved(kind, class)
    }

    /// Handle for the calling thread, if it is registered.
    pub fn mutator(&self) -> Option<Mutator<'_>> {
        self.current_record().map(|record| Mutator::new(self, record))
    }

    // ── Managed threads ───────────────────────────────────────────────

    /// Starts a thread that is registered for its whole life.
    pub fn spawn<T, F>(self: &Arc<Self>, f: F) -> Result<ManagedThread<T>, ThreadError>
    where
        F: FnOnce(&Mutator<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (id, handle) = self.spawn_managed(ThreadFlags::NONE, f)?;
        Ok(ManagedThread {
            id,
            handle,
            collector: self.clone(),
        })
    }

    /// Starts a registered thread whose record goes away when it exits.
    pub fn spawn_detached<F>(self: &Arc<Self>, f: F) -> Result<ThreadId, ThreadError>
    where
        F: FnOnce(&Mutator<'_>) + Send + 'static,
    {
        self.spawn_managed(ThreadFlags::DETACHED, f).map(|(id, _)| id)
    }

    fn spawn_managed<T, F>(
        self: &Arc<Self>,
        flags: ThreadFlags,
        f: F,
    ) -> Result<(ThreadId, JoinHandle<Option<T>>), ThreadError>
    where
        F: FnOnce(&Mutator<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let collector = self.clone();
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name(format!("mutator-{n}"))
            .spawn(move || {
                let anchor = 0usize;
                let cold = std::ptr::from_ref(std::hint::black_box(&anchor)) as usize;
                run_managed(&collector, cold, flags, ready_tx, f)
            })
            .map_err(|err| {
                log::warn!("mutator thread creation failed: {err}");
                ThreadError::OutOfMemory
            })?;

        match self.blocking_wait(|| ready_rx.recv()) {
            Ok(Ok(id)) => Ok((id, handle)),
            Ok(Err(err)) => {
                let _ = self.blocking_wait(|| handle.join());
                Err(err)
            }
            Err(_) => {
                let _ = self.blocking_wait(|| handle.join());
                Err(ThreadError::NotRegistered(ThreadId(0)))
            }
        }
    }
}

/// Body of a managed thread below its entry frame.
#[inline(never)]
fn run_managed<T, F>(
    collector: &Collector,
    cold: usize,
    flags: ThreadFlags,
    ready: mpsc::SyncSender<Result<ThreadId, ThreadError>>,
    f: F,
) -> Option<T>
where
    F: FnOnce(&Mutator<'_>) -> T,
{
    let bounds = StackBounds::new(cold, system::approx_sp().min(cold));
    let record = match collector.register_with(bounds, flags) {
        Ok(record) => record,
        Err(err) => {
            // the spawner joins us and reports the error
            let _ = ready.send(Err(err));
            return None;
        }
    };
    let _ = ready.send(Ok(record.id()));
    let _exit = ExitGuard { collector };
    let mutator = Mutator::new(collector, record);
    let value = f(&mutator);
    drop(mutator);
    Some(value)
}

/// Unregisters the thread when it leaves its body, also while unwinding.
struct ExitGuard<'a> {
    collector: &'a Collector,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.collector.unregister_thread() {
            log::warn!("managed thread exit: {err}");
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("discovery", &self.config.discovery)
            .field("world_stops", &self.world_stops())
            .field("markers", &self.markers.as_ref().map_or(0, MarkerPool::helpers))
            .finish()
    }
}

/// A thread started through [`Collector::spawn`].
pub struct ManagedThread<T> {
    id: ThreadId,
    handle: JoinHandle<Option<T>>,
    collector: Arc<Collector>,
}

impl<T> ManagedThread<T> {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Waits for the thread and reclaims its record.
    pub fn join(self) -> thread::Result<T> {
        let handle = self.handle;
        let result = self.collector.blocking_wait(|| handle.join());
        if let Err(err) = self.collector.join_thread(self.id) {
            log::warn!("reclaiming thread {}: {err}", self.id);
        }
        match result {
            Ok(Some(value)) => Ok(value),
            // only a failed registration yields None, and `spawn` reports
            // that before a handle exists
            Ok(None) => Err(Box::new(ThreadError::NotRegistered(self.id))),
            Err(panic) => Err(panic),
        }
    }
}

// ── Mutator ───────────────────────────────────────────────────────────

/// The calling thread's view of the collector. Not `Send`: every method
/// acts on the thread that created it.
pub struct Mutator<'a> {
    collector: &'a Collector,
    record: &'a ThreadRecord,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Mutator<'a> {
    fn new(collector: &'a Collector, record: &'a ThreadRecord) -> Self {
        record.acquire_handle();
        Self {
            collector,
            record,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.record.id()
    }

    pub fn collector(&self) -> &'a Collector {
        self.collector
    }

    /// Parks here if a stop of the world is pending.
    #[inline]
    pub fn safepoint(&self) {
        self.collector.control.safepoint(self.record.id());
    }

    /// Allocates one object of `class`. Never fails because a local list
    /// ran dry, only when the heap cannot grow.
    #[inline]
    pub fn alloc_small(&self, kind: ObjectKind, class: usize) -> Result<BlockPtr, ThreadError> {
        debug_assert!(class < SIZE_CLASSES);
        debug_assert_eq!(self.record.blocked_sp(), 0, "allocating inside a blocking region");
        self.safepoint();
        match self
            .record
            .cache
            .try_alloc(kind, class, self.collector.config.direct_granules)
        {
            FastAlloc::Hit(block) => Ok(block),
            miss => self.alloc_slow(kind, class, miss),
        }
    }

    #[cold]
    #[inline(never)]
    fn alloc_slow(&self, kind: ObjectKind, class: usize, miss: FastAlloc) -> Result<BlockPtr, ThreadError> {
        let mut heap = self.collector.lock_heap_as(self.record);
        match miss {
            FastAlloc::Refill => {
                let batch = heap.alloc_many(kind, class)?;
                self.record
                    .cache
                    .install(kind, class, batch)
                    .ok_or(ThreadError::OutOfMemory)
            }
            FastAlloc::Global | FastAlloc::Hit(_) => heap.alloc(kind, class),
        }
    }

    /// Returns an object to the local list of its class, or to the global
    /// list while the class still runs on the global path.
    ///
    /// # Safety
    /// `block` came from `alloc_small` with the same kind and class and is
    /// no longer referenced.
    pub unsafe fn free_small(&self, block: BlockPtr, kind: ObjectKind, class: usize) {
        // SAFETY: contract of the caller, the cache belongs to this thread
        if unsafe { self.record.cache.free(kind, class, block) } {
            return;
        }
        let mut heap = self.collector.lock_heap_as(self.record);
        // SAFETY: contract of the caller
        unsafe { heap.free(kind, class, block) };
    }

    /// Objects waiting on this thread's local list of one class.
    pub fn cached_objects(&self, kind: ObjectKind, class: usize) -> usize {
        // SAFETY: the owner reads its own cache
        unsafe { self.record.cache.cached_len(kind, class) }
    }

    // ── Blocking regions ──────────────────────────────────────────────

    /// Publishes the current stack pointer; until the matching
    /// [`Mutator::leave_blocking_region`] the thread must not touch the heap
    /// and will not be suspended.
    #[inline(never)]
    pub fn enter_blocking_region(&self) {
        debug_assert_eq!(self.record.blocked_sp(), 0, "blocking regions do not nest");
        self.record.publish_blocked_sp(system::approx_sp());
    }

    /// Waits for any stop in progress, then becomes active again.
    pub fn leave_blocking_region(&self) {
        debug_assert_ne!(self.record.blocked_sp(), 0, "not in a blocking region");
        let _heap = self.collector.heap.lock();
        self.record.clear_blocked_sp();
    }

    /// Runs `f` inside a blocking region.
    pub fn do_blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_blocking_region();
        let _region = BlockingRegion { mutator: self };
        f()
    }

    /// From inside a blocking region, runs `f` as an active thread again.
    /// The frames between the region's entry and this call are not
    /// scanned while `f` runs.
    pub fn call_with_gc_active<R>(&self, f: impl FnOnce(&Mutator<'a>) -> R) -> R {
        let saved_sp = self.record.blocked_sp();
        if saved_sp == 0 {
            return f(self);
        }
        let anchor = 0usize;
        let frame = std::ptr::from_ref(std::hint::black_box(&anchor)) as usize;
        {
            let _heap = self.collector.heap.lock();
            // SAFETY: global lock held
            unsafe { self.record.push_section(StackSection { frame, saved_sp }) };
            self.record.clear_blocked_sp();
        }
        let _section = ActiveSection { mutator: self };
        f(self)
    }

    // ── Misc ──────────────────────────────────────────────────────────

    /// Enters a finalizer run, or returns `None` when this nesting depth
    /// should skip it.
    pub fn check_finalizer_nested(&self) -> Option<FinalizerNesting<'_>> {
        let previous = self.record.enter_finalizers()?;
        Some(FinalizerNesting {
            record: self.record,
            previous,
        })
    }

    pub fn reset_finalizer_nested(&self) {
        self.record.set_finalizer_nested(0);
    }

    pub fn stack_base(&self) -> usize {
        self.record.stack_base()
    }

    /// Keeps collection disabled until this thread is unregistered, for a
    /// thread whose foreign frames still reference the heap at exit.
    pub fn exit_with_gc_disabled(&self) {
        let _heap = self.collector.lock_heap_as(self.record);
        if !self.record.has_flag(ThreadFlags::DISABLED_GC) {
            self.record.add_flag(ThreadFlags::DISABLED_GC);
            self.collector.dont_gc.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        self.record.snapshot()
    }
}

impl Drop for Mutator<'_> {
    fn drop(&mut self) {
        self.record.release_handle();
    }
}

struct BlockingRegion<'m, 'a> {
    mutator: &'m Mutator<'a>,
}

impl Drop for BlockingRegion<'_, '_> {
    fn drop(&mut self) {
        self.mutator.leave_blocking_region();
    }
}

struct ActiveSection<'m, 'a> {
    mutator: &'m Mutator<'a>,
}

impl Drop for ActiveSection<'_, '_> {
    fn drop(&mut self) {
        let record = self.mutator.record;
        let _heap = self.mutator.collector.lock_heap_as(record);
        // SAFETY: global lock held
        let section = unsafe { record.pop_section() };
        if let Some(section) = section {
            record.publish_blocked_sp(section.saved_sp);
        }
    }
}

/// Restores the finalizer nesting level when dropped.
pub struct FinalizerNesting<'a> {
    record: &'a ThreadRecord,
    previous: u8,
}

impl FinalizerNesting<'_> {
    /// Nesting level this run was entered at.
    pub fn level(&self) -> u8 {
        self.previous
    }
}

impl Drop for FinalizerNesting<'_> {
    fn drop(&mut self) {
        self.record.set_finalizer_nested(self.previous);
    }
}
