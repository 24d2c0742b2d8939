//! The OS threading seam.
//!
//! The coordinator only ever talks to threads through [`ThreadControl`].
//! [`ParkingControl`] is the portable implementation: a suspend request is
//! acknowledged by the target at its next safepoint poll, where it parks
//! until resumed.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{OsError, OsOp, RegisterSnapshot, ThreadId, system};

pub trait ThreadControl: Send + Sync {
    fn current_thread_id(&self) -> ThreadId;

    /// Secondary id used for signal delivery, where the OS has one.
    fn current_kernel_id(&self) -> Option<u64> {
        None
    }

    /// Called on the thread itself before its record becomes visible.
    fn attach(&self, _id: ThreadId) {}

    /// Called on the thread itself once its record is retired.
    fn detach(&self, _id: ThreadId) {}

    /// Requests that `id` stop. May return before the thread has stopped.
    fn suspend(&self, id: ThreadId) -> Result<(), OsError>;

    fn resume(&self, id: ThreadId) -> Result<(), OsError>;

    /// Register state of a stopped thread, `None` while it is not (yet)
    /// in a state that can be captured.
    fn capture_context(&self, id: ThreadId) -> Option<RegisterSnapshot>;

    /// False once the OS thread behind `id` has exited.
    fn is_alive(&self, _id: ThreadId) -> bool {
        true
    }

    /// Poll point for implementations that stop threads cooperatively.
    fn safepoint(&self, _id: ThreadId) {}
}

// ── Thread tokens ─────────────────────────────────────────────────────

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

struct ThreadToken {
    id: u64,
    alive: Arc<AtomicBool>,
}

impl Drop for ThreadToken {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

thread_local! {
    static THREAD_TOKEN: ThreadToken = ThreadToken {
        id: NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed),
        alive: Arc::new(AtomicBool::new(true)),
    };
}

/// Process-unique id of the calling thread. Never reused.
pub fn current_thread_token() -> ThreadId {
    THREAD_TOKEN.with(|t| ThreadId(t.id))
}

fn current_liveness() -> Arc<AtomicBool> {
    THREAD_TOKEN.with(|t| t.alive.clone())
}

// ── ParkingControl ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CellState {
    /// Outstanding suspend requests.
    count: u32,
    /// Context published by the parked thread.
    parked: Option<RegisterSnapshot>,
}

#[derive(Debug)]
struct SuspendCell {
    state: Mutex<CellState>,
    cv: Condvar,
    pending: AtomicU32,
    alive: Arc<AtomicBool>,
}

/// Cooperative suspension over std threads.
#[derive(Debug)]
pub struct ParkingControl {
    cells: Mutex<HashMap<ThreadId, Arc<SuspendCell>>>,
    requests: AtomicUsize,
    ack_timeout: Duration,
}

impl Default for ParkingControl {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl ParkingControl {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
            ack_timeout,
        }
    }

    fn cell(&self, id: ThreadId) -> Option<Arc<SuspendCell>> {
        self.cells.lock().get(&id).cloned()
    }

    fn unknown(op: OsOp, id: ThreadId) -> OsError {
        OsError::new(op, format!("thread {id} is not attached"))
    }

    /// Threads currently parked at a safepoint.
    pub fn parked_threads(&self) -> usize {
        self.cells
            .lock()
            .values()
            .filter(|c| c.state.lock().parked.is_some())
            .count()
    }
}

impl ThreadControl for ParkingControl {
    fn current_thread_id(&self) -> ThreadId {
        current_thread_token()
    }

    fn attach(&self, id: ThreadId) {
        let cell = Arc::new(SuspendCell {
            state: Mutex::new(CellState::default()),
            cv: Condvar::new(),
            pending: AtomicU32::new(0),
            alive: current_liveness(),
        });
        self.cells.lock().insert(id, cell);
    }

    fn detach(&self, id: ThreadId) {
        if let Some(cell) = self.cells.lock().remove(&id) {
            debug_assert_eq!(cell.state.lock().count, 0, "detaching a suspended thread");
        }
    }

    fn suspend(&self, id: ThreadId) -> Result<(), OsError> {
        let cell = self.cell(id).ok_or_else(|| Self::unknown(OsOp::Suspend, id))?;
        let mut state = cell.state.lock();
        state.count += 1;
        cell.pending.store(state.count, Ordering::Release);
        self.requests.fetch_add(1, Ordering::AcqRel);

        let deadline = Instant::now() + self.ack_timeout;
        while state.parked.is_none() && cell.alive.load(Ordering::Acquire) {
            if cell.cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Ok(())
    }

    fn resume(&self, id: ThreadId) -> Result<(), OsError> {
        let cell = self.cell(id).ok_or_else(|| Self::unknown(OsOp::Resume, id))?;
        let mut state = cell.state.lock();
        if state.count == 0 {
            return Err(OsError::new(OsOp::Resume, "thread is not suspended"));
        }
        state.count -= 1;
        cell.pending.store(state.count, Ordering::Release);
        self.requests.fetch_sub(1, Ordering::AcqRel);
        if state.count == 0 {
            cell.cv.notify_all();
        }
        Ok(())
    }

    fn capture_context(&self, id: ThreadId) -> Option<RegisterSnapshot> {
        let cell = self.cell(id)?;
        let state = cell.state.lock();
        if state.count == 0 {
            return None;
        }
        state.parked
    }

    fn is_alive(&self, id: ThreadId) -> bool {
        self.cell(id)
            .is_some_and(|c| c.alive.load(Ordering::Acquire))
    }

    fn safepoint(&self, id: ThreadId) {
        if self.requests.load(Ordering::Acquire) == 0 {
            return;
        }
        let Some(cell) = self.cell(id) else {
            return;
        };
        if cell.pending.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut state = cell.state.lock();
        if state.count == 0 {
            return;
        }
        state.parked = Some(RegisterSnapshot::at(system::approx_sp()));
        cell.cv.notify_all();
        while state.count > 0 {
            cell.cv.wait(&mut state);
        }
        state.parked = None;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Barrier, thread};

    #[test]
    fn tokens_are_unique_per_thread() {
        let here = current_thread_token();
        assert_eq!(here, current_thread_token(), "stable within a thread");
        let other = thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn suspend_unknown_thread_fails() {
        let control = ParkingControl::default();
        let err = control.suspend(ThreadId(u64::MAX)).unwrap_err();
        assert_eq!(err.op, OsOp::Suspend);
    }

    #[test]
    fn resume_without_suspend_fails() {
        let control = ParkingControl::default();
        let id = control.current_thread_id();
        control.attach(id);
        assert!(control.resume(id).is_err());
        control.detach(id);
    }

    #[test]
    fn polling_thread_parks_and_resumes() {
        let control = Arc::new(ParkingControl::new(Duration::from_millis(50)));
        let ready = Arc::new(Barrier::new(2));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let control = control.clone();
            let ready = ready.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let id = control.current_thread_id();
                control.attach(id);
                ready.wait();
                while !stop.load(Ordering::Acquire) {
                    control.safepoint(id);
                    thread::yield_now();
                }
                control.detach(id);
                id
            })
        };
        ready.wait();

        // the worker id is only known to the worker, find it via the map
        let id = *control.cells.lock().keys().next().expect("worker attached");

        let start = Instant::now();
        let context = loop {
            control.suspend(id).unwrap();
            if let Some(ctx) = control.capture_context(id) {
                break ctx;
            }
            control.resume(id).unwrap();
            assert!(start.elapsed() < Duration::from_secs(5), "worker never parked");
        };
        assert_ne!(context.sp, 0);
        assert_eq!(control.parked_threads(), 1);

        control.resume(id).unwrap();
        stop.store(true, Ordering::Release);
        assert_eq!(worker.join().unwrap(), id);
        assert_eq!(control.requests.load(Ordering::Acquire), 0);
    }

    #[test]
    fn exited_thread_is_not_alive() {
        let control = Arc::new(ParkingControl::default());
        let id = {
            let control = control.clone();
            thread::spawn(move || {
                let id = control.current_thread_id();
                control.attach(id);
                id
            })
            .join()
            .unwrap()
        };
        assert!(!control.is_alive(id), "token dropped with the thread");
    }
}
