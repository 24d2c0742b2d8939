//! Parallel marker helpers.
//!
//! Helpers sleep on `mark_cv` until the generation counter moves, run the
//! published work once for the generation they observe and report back by
//! decrementing `busy`. Stopping the world first waits for `busy == 0`, so
//! helper threads are never suspended and never touch mutator state.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::system;

/// Exponential spin bound before blocking on the marker lock.
pub const SPIN_MAX: u32 = 128;

/// What a helper is asked to do for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkTask {
    pub helper: usize,
    pub helpers: usize,
    pub generation: u64,
}

pub type MarkWork = Arc<dyn Fn(MarkTask) + Send + Sync>;

/// Stack extent of one helper, scanned like a mutator stack.
#[derive(Debug)]
pub struct ParallelMarkerSlot {
    stack_base: AtomicUsize,
    sp: AtomicUsize,
    stack_min: AtomicUsize,
}

impl ParallelMarkerSlot {
    fn new() -> Self {
        Self {
            stack_base: AtomicUsize::new(0),
            sp: AtomicUsize::new(0),
            stack_min: AtomicUsize::new(crate::ADDR_LIMIT),
        }
    }

    pub fn stack_base(&self) -> usize {
        self.stack_base.load(Ordering::Acquire)
    }

    /// Stack pointer saved when the helper last went idle.
    pub fn sp(&self) -> usize {
        self.sp.load(Ordering::Acquire)
    }

    pub fn stack_min(&self) -> usize {
        self.stack_min.load(Ordering::Relaxed)
    }

    fn save_sp(&self, sp: usize) {
        self.sp.store(sp, Ordering::Release);
        self.stack_min.fetch_min(sp, Ordering::Relaxed);
    }
}

struct PoolState {
    mark_no: u64,
    /// Helpers that have not reached the wait point for `mark_no`.
    busy: usize,
    helpers: usize,
    work: Option<MarkWork>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    mark_cv: Condvar,
    builder_cv: Condvar,
    slots: Box<[ParallelMarkerSlot]>,
}

#[cold]
#[inline(never)]
fn lock_contended(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    let mut pause = 1;
    while pause <= SPIN_MAX {
        for _ in 0..pause {
            std::hint::spin_loop();
        }
        if let Some(guard) = state.try_lock() {
            return guard;
        }
        pause *= 2;
    }
    state.lock()
}

#[inline]
fn lock_spinning(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    match state.try_lock() {
        Some(guard) => guard,
        None => lock_contended(state),
    }
}

pub struct MarkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl MarkerPool {
    /// Starts up to `helpers` threads. Fewer are kept if the OS refuses
    /// to create more.
    pub fn start(helpers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                mark_no: 0,
                busy: 0,
                helpers: 0,
                work: None,
                shutdown: false,
            }),
            mark_cv: Condvar::new(),
            builder_cv: Condvar::new(),
            slots: (0..helpers).map(|_| ParallelMarkerSlot::new()).collect(),
        });

        let mut handles = Vec::with_capacity(helpers);
        for index in 0..helpers {
            let worker = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("marker-{index}"))
                .spawn(move || {
                    let anchor = 0usize;
                    let base = std::ptr::from_ref(std::hint::black_box(&anchor)) as usize;
                    helper_loop(&worker, index, base);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    log::warn!("marker thread creation failed: {err}; running with {index} helpers");
                    break;
                }
            }
        }
        log::debug!("started {} parallel markers", handles.len());
        Self { shared, handles }
    }

    pub fn helpers(&self) -> usize {
        self.handles.len()
    }

    pub fn slots(&self) -> &[ParallelMarkerSlot] {
        &self.shared.slots[..self.handles.len()]
    }

    pub fn generation(&self) -> u64 {
        lock_spinning(&self.shared.state).mark_no
    }

    /// Publishes `work` as the next generation and wakes every helper.
    pub fn start_generation(&self, work: MarkWork) -> u64 {
        let mut state = lock_spinning(&self.shared.state);
        state.mark_no += 1;
        state.busy = self.handles.len();
        state.helpers = self.handles.len();
        state.work = Some(work);
        self.shared.mark_cv.notify_all();
        state.mark_no
    }

    /// Blocks until every helper is back at its wait point.
    pub fn wait_until_idle(&self) {
        let mut state = lock_spinning(&self.shared.state);
        while state.busy > 0 {
            self.shared.builder_cv.wait(&mut state);
        }
        state.work = None;
    }

    /// One generation from start to finish.
    pub fn run(&self, work: MarkWork) -> u64 {
        let generation = self.start_generation(work);
        self.wait_until_idle();
        generation
    }
}

fn helper_loop(shared: &Shared, index: usize, base: usize) {
    let slot = &shared.slots[index];
    slot.stack_base.store(base, Ordering::Release);

    let mut seen = 0;
    let mut state = lock_spinning(&shared.state);
    loop {
        while state.mark_no == seen && !state.shutdown {
            slot.save_sp(system::approx_sp());
            shared.mark_cv.wait(&mut state);
        }
        if state.shutdown {
            break;
        }
        // generations missed while asleep are not replayed
        seen = state.mark_no;
        let helpers = state.helpers;
        let work = state.work.clone();
        drop(state);

        if let Some(work) = work {
            work(MarkTask {
                helper: index,
                helpers,
                generation: seen,
            });
        }

        state = lock_spinning(&shared.state);
        if state.mark_no != seen {
            // a newer generation started meanwhile and counts us again
            continue;
        }
        state.busy -= 1;
        if state.busy == 0 {
            shared.builder_cv.notify_all();
        }
    }
    slot.stack_base.store(0, Ordering::Release);
}

impl Drop for MarkerPool {
    fn drop(&mut self) {
        {
            let mut state = lock_spinning(&self.shared.state);
            state.shutdown = true;
            self.shared.mark_cv.notify_all();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("marker thread panicked");
            }
        }
    }
}
