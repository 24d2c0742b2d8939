//! Stop-the-world coordination.
//!
//! [`Collector::stop_world`] takes the global lock, suspends every other
//! registered thread that is not in a blocking region and returns a
//! [`WorldStopped`] guard. The world restarts when the guard is consumed by
//! [`WorldStopped::start_world`] or dropped.

use std::{
    ops::Range,
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant},
};

use crate::{
    Collector, OsOp, RecordSnapshot, RegisterSnapshot, ThreadId, ThreadRecord,
    error::fatal,
    freelist::BlockPtr,
    heap::{GlobalHeap, ObjectKind},
    marker::{MarkTask, MarkWork},
    system,
    table::HeapLock,
};

/// Suspend attempts between two progress warnings.
const REPORT_EVERY: u32 = 1000;
const SPIN_ATTEMPTS: u32 = 8;
const YIELD_ATTEMPTS: u32 = 64;
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Pause before suspend attempt number `attempt`: spin, then yield, then
/// sleep with a bounded exponential step.
pub fn backoff_sleep(attempt: u32) {
    if attempt < SPIN_ATTEMPTS {
        for _ in 0..(1u32 << attempt) {
            std::hint::spin_loop();
        }
    } else if attempt < YIELD_ATTEMPTS {
        thread::yield_now();
    } else {
        let shift = (attempt - YIELD_ATTEMPTS).min(10);
        thread::sleep(Duration::from_micros(1 << shift).min(MAX_SLEEP));
    }
}

/// Whose stack a [`ThreadStack`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOwner {
    Mutator(ThreadId),
    /// Parallel marker helper by index.
    Marker(usize),
}

/// Scan ranges of one stack, innermost first. Each range is `hot..cold`.
#[derive(Debug, Clone)]
pub struct ThreadStack {
    pub owner: StackOwner,
    pub ranges: Vec<Range<usize>>,
    pub registers: Option<RegisterSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackScanSummary {
    pub threads: usize,
    pub bytes: usize,
}

impl Collector {
    /// Stops every other registered thread. Blocks while another stop is in
    /// progress or parallel markers are still busy.
    pub fn stop_world(&self) -> WorldStopped<'_> {
        let heap = self.lock_heap();
        if let Some(markers) = &self.markers {
            markers.wait_until_idle();
        }
        let started = Instant::now();
        let me = self.control.current_thread_id();
        self.registry.clear_attached();
        self.stop_requested.store(true, Ordering::SeqCst);

        let mut stopped = WorldStopped {
            collector: self,
            heap,
            me,
            suspended: Vec::new(),
            started,
            rescans: 0,
            running: false,
        };
        stopped.suspend_all();
        log::debug!(
            "world stopped: {} threads suspended in {:?}",
            stopped.suspended.len(),
            started.elapsed()
        );
        stopped
    }
}

/// The stopped world. Holds the global lock until the world restarts.
pub struct WorldStopped<'a> {
    collector: &'a Collector,
    heap: HeapLock<'a>,
    me: ThreadId,
    suspended: Vec<&'a ThreadRecord>,
    started: Instant,
    rescans: usize,
    running: bool,
}

impl<'a> WorldStopped<'a> {
    fn suspend_all(&mut self) {
        let collector = self.collector;
        loop {
            let mut candidates = Vec::new();
            collector.registry.for_each(&self.heap, |r| candidates.push(r));
            for record in candidates {
                if record.id() == self.me || record.is_suspended() {
                    continue;
                }
                if self.suspend_record(record) {
                    self.suspended.push(record);
                }
            }
            if !collector.registry.take_attached() {
                break;
            }
            self.rescans += 1;
            log::debug!("thread attached during stop, rescanning");
        }
    }

    /// Suspends one record, retrying transient failures. Returns false when
    /// the thread needs no suspension.
    fn suspend_record(&self, record: &'a ThreadRecord) -> bool {
        let control = &self.collector.control;
        let limit = self.collector.config().suspend_retry_limit;
        let id = record.id();
        let mut attempt = 0u32;
        let mut failed_op = OsOp::Suspend;
        loop {
            if record.stack_base() == 0 || record.is_finished() {
                return false;
            }
            if record.blocked_sp() != 0 {
                log::trace!("thread {id} is blocked, not suspending");
                return false;
            }
            if !control.is_alive(id) {
                log::debug!("thread {id} exited without unregistering");
                record.clear_stack_base();
                return false;
            }
            if attempt >= limit {
                fatal(
                    failed_op,
                    id,
                    &format_args!("gave up after {attempt} attempts"),
                );
            }

            match control.suspend(id) {
                Ok(()) => match control.capture_context(id) {
                    Some(context) => {
                        // SAFETY: we hold the global lock as the coordinator
                        unsafe { record.mark_suspended(context) };
                        log::trace!("suspended thread {id} at sp {:#x}", context.sp);
                        return true;
                    }
                    None => {
                        failed_op = OsOp::CaptureContext;
                        if let Err(err) = control.resume(id) {
                            fatal(OsOp::Resume, id, &err);
                        }
                    }
                },
                Err(err) => {
                    failed_op = OsOp::Suspend;
                    log::trace!("suspend of thread {id} failed: {err}");
                }
            }

            attempt += 1;
            if attempt.is_multiple_of(REPORT_EVERY) {
                log::warn!("still trying to suspend thread {id} after {attempt} attempts");
            }
            backoff_sleep(attempt);
        }
    }

    /// Ids of the threads this stop suspended.
    pub fn suspended_threads(&self) -> Vec<ThreadId> {
        self.suspended.iter().map(|r| r.id()).collect()
    }

    /// Every record currently in the registry.
    pub fn threads(&self) -> Vec<RecordSnapshot> {
        let mut out = Vec::new();
        self.collector
            .registry
            .for_each(&self.heap, |r| out.push(r.snapshot()));
        out
    }

    /// Times the registry was walked again because a thread attached
    /// while the stop was in progress.
    pub fn rescans(&self) -> usize {
        self.rescans
    }

    pub fn heap(&mut self) -> &mut GlobalHeap {
        &mut self.heap
    }

    /// Hot end of the stack of `record`, or `None` when it has no stack to
    /// scan right now.
    fn hot_end(&self, record: &ThreadRecord) -> Option<(usize, Option<RegisterSnapshot>)> {
        if record.id() == self.me {
            return Some((system::approx_sp(), None));
        }
        let blocked = record.blocked_sp();
        if blocked != 0 {
            return Some((blocked, None));
        }
        // SAFETY: global lock held
        let context = unsafe { record.context() }?;
        Some((context.sp, Some(context)))
    }

    /// Reports the scan ranges of every registered thread and every idle
    /// marker helper.
    pub fn for_each_thread_stack(&self, mut f: impl FnMut(&ThreadStack)) -> StackScanSummary {
        let mut summary = StackScanSummary::default();
        let mut stacks = Vec::new();
        self.collector.registry.for_each(&self.heap, |r| {
            if r.stack_base() != 0 && !r.is_finished() {
                stacks.push(r);
            }
        });

        for record in stacks {
            let id = record.id();
            let base = record.stack_base();
            let Some((hot, registers)) = self.hot_end(record) else {
                log::warn!("thread {id} is neither stopped nor blocked, skipping its stack");
                continue;
            };
            if hot == 0 || hot > base {
                log::warn!("thread {id}: sp {hot:#x} outside its stack (base {base:#x})");
                continue;
            }
            let previous_min = record.last_stack_min();
            if record.observe_sp(hot) < previous_min && previous_min != crate::ADDR_LIMIT {
                log::trace!("thread {id}: stack grew to {hot:#x}");
            }

            // SAFETY: global lock held
            let sections = unsafe { record.sections() };
            let stack = ThreadStack {
                owner: StackOwner::Mutator(id),
                ranges: scan_ranges(hot, base, sections.iter().rev().map(|s| (s.frame, s.saved_sp))),
                registers,
            };
            summary.threads += 1;
            summary.bytes += stack.ranges.iter().map(|r| r.len()).sum::<usize>();
            f(&stack);
        }

        if let Some(markers) = &self.collector.markers {
            for (index, slot) in markers.slots().iter().enumerate() {
                let (base, sp) = (slot.stack_base(), slot.sp());
                if base == 0 || sp == 0 || sp > base {
                    continue;
                }
                let stack = ThreadStack {
                    owner: StackOwner::Marker(index),
                    ranges: vec![sp..base],
                    registers: None,
                };
                summary.threads += 1;
                summary.bytes += base - sp;
                f(&stack);
            }
        }
        summary
    }

    /// Visits every object on the thread-local free lists of the stopped
    /// threads, so marking can treat them as reachable.
    pub fn mark_thread_local_free_lists(&self, mut f: impl FnMut(ThreadId, ObjectKind, usize, BlockPtr)) {
        let mut records = Vec::new();
        self.collector.registry.for_each(&self.heap, |r| {
            if !r.is_finished() && r.stack_base() != 0 {
                records.push(r);
            }
        });
        for record in records {
            let id = record.id();
            // SAFETY: lock held; the owner is stopped, blocked, or is us
            unsafe { record.cache.for_each_cached(&mut |kind, class, block| f(id, kind, class, block)) };
        }
    }

    /// Runs `work` on the parallel markers, or on the calling thread when
    /// there are none. Returns the number of helpers that ran it.
    pub fn parallel_mark(&self, work: impl Fn(MarkTask) + Send + Sync + 'static) -> usize {
        match &self.collector.markers {
            Some(markers) if markers.helpers() > 0 => {
                let work: MarkWork = Arc::new(work);
                markers.run(work);
                markers.helpers()
            }
            _ => {
                work(MarkTask {
                    helper: 0,
                    helpers: 1,
                    generation: 0,
                });
                1
            }
        }
    }

    pub fn start_world(mut self) {
        self.restart();
    }

    fn restart(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        let control = &self.collector.control;
        for record in self.suspended.drain(..) {
            let id = record.id();
            if !record.is_suspended() {
                fatal(OsOp::Resume, id, &"record was never suspended");
            }
            if let Err(err) = control.resume(id) {
                fatal(OsOp::Resume, id, &err);
            }
            // SAFETY: global lock held by the coordinator that suspended it
            unsafe { record.mark_resumed() };
            log::trace!("resumed thread {id}");
        }
        self.collector.stop_requested.store(false, Ordering::SeqCst);
        self.collector.world_stops.fetch_add(1, Ordering::Relaxed);

        let elapsed = self.started.elapsed();
        if elapsed > Duration::from_secs(1) {
            log::warn!("world was stopped for {elapsed:?}");
        } else {
            log::debug!("world restarted after {elapsed:?}");
        }
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        self.restart();
    }
}

/// Splits `hot..cold` around traced sections given innermost first as
/// `(frame, saved_sp)`: `hot..frame` is scanned, `frame..saved_sp` is
/// foreign and skipped, scanning resumes at `saved_sp`.
fn scan_ranges(hot: usize, cold: usize, sections: impl Iterator<Item = (usize, usize)>) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut lo = hot;
    for (frame, saved_sp) in sections {
        if lo < frame {
            ranges.push(lo..frame);
        }
        lo = lo.max(saved_sp);
    }
    if lo < cold {
        ranges.push(lo..cold);
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CollectorConfig, DiscoveryKind, StackBounds, ThreadState,
        control::mock::{MockControl, act_as},
    };
    const COORDINATOR: ThreadId = ThreadId(0xc0);

    fn bounds(n: u64) -> StackBounds {
        let cold = 0x100_0000 * (n as usize + 1);
        StackBounds::new(cold, cold - 0x1000)
    }

    fn collector(discovery: DiscoveryKind, mock: &Arc<MockControl>) -> Arc<Collector> {
        let config = CollectorConfig {
            discovery,
            suspend_retry_limit: 100,
            ..Default::default()
        };
        Collector::new(config, mock.clone()).expect("valid config")
    }

    /// Registers `ids` from the calling test thread, then acts as the
    /// unregistered coordinator.
    fn register_all(collector: &Collector, mock: &MockControl, ids: &[u64]) {
        for &n in ids {
            act_as(ThreadId(n));
            collector.register_thread(bounds(n)).expect("register");
            mock.set_sp(ThreadId(n), bounds(n).cold - 0x800);
        }
        act_as(COORDINATOR);
    }

    #[test]
    fn stops_and_restarts_every_registered_thread() {
        let mock = Arc::new(MockControl::default());
        let gc = collector(DiscoveryKind::Explicit, &mock);
        register_all(&gc, &mock, &[1, 2, 3, 4]);

        let stopped = gc.stop_world();
        let mut ids = stopped.suspended_threads();
        ids.sort();
        assert_eq!(ids, vec![ThreadId(1), ThreadId(2), ThreadId(3), ThreadId(4)]);
        assert!(stopped.threads().iter().all(|t| t.suspended));
        stopped.start_world();

        assert!(mock.stopped().is_empty(), "every suspend was matched by a resume");
        assert_eq!(mock.count(OsOp::Suspend), 4);
        assert_eq!(mock.count(OsOp::Resume), 4);
        for n in 1..=4 {
            assert!(!gc.lookup(ThreadId(n)).unwrap().suspended);
        }
    }

    #[test]
    fn coordinator_does_not_suspend_itself() {
        let mock = Arc::new(MockControl::default());
        let gc = collector(DiscoveryKind::Explicit, &mock);
        register_all(&gc, &mock, &[1, 2]);
        act_as(ThreadId(2));

        let stopped = gc.stop_world();
        assert_eq!(stopped.suspended_threads(), vec![ThreadId(1)]);
        let me = stopped.threads().into_iter().find(|t| t.id == ThreadId(2)).unwrap();
        assert!(!me.suspended);
        drop(stopped);
        assert_eq!(mock.count(OsOp::Suspend), 1);
        assert_eq!(mock.count(OsOp::Resume), 1);
    }

    #[test]
    fn capture_failures_are_retried() {
        let mock = Arc::new(MockControl::default());
        let gc = collector(DiscoveryKind::Explicit, &mock);
        register_all(&gc, &mock, &[7]);
        mock.capture_failures.store(3, Ordering::Relaxed);
        mock.suspend_failures.store(2, Ordering::Relaxed);

        let stopped = gc.stop_world();
        assert_eq!(stopped.suspended_threads(), vec![ThreadId(7)]);
        drop(stopped);
        // two refused suspends, three suspends whose capture failed, one good
        assert_eq!(mock.count(OsOp::Suspend), 6);
        // three resumes undoing failed captures, one at restart
        assert_eq!(mock.count(OsOp::Resume), 4);
    }

    #[test]
    fn blocked_threads_are_skipped() {
        let mock = Arc::new(MockControl::default());
        let gc = collector(DiscoveryKind::Explicit, &mock);
        register_all(&gc, &mock, &[1, 2]);
        let blocked_sp = bounds(2).cold - 0x400;
        {
            let heap = gc.lock_heap();
            let record = gc.registry.lookup(&heap, ThreadId(2)).unwrap();
            record.publish_blocked_sp(blocked_sp);
        }

        let stopped = gc.stop_world();
        assert_eq!(stopped.suspended_threads(), vec![ThreadId(1)]);
        let snap = stopped.threads().into_iter().find(|t| t.id == ThreadId(2)).unwrap();
        assert_eq!(snap.state, ThreadState::Blocked);
        assert!(!snap.suspended);

        let mut seen = Vec::new();
        stopped.for_each_thread_stack(|s| seen.push(s.clone()));
        let blocked = seen
            .iter()
            .find(|s| s.owner == StackOwner::Mutator(ThreadId(2)))
            .expect("blocked thread is still scanned");
        assert_eq!(blocked.ranges, vec![blocked_sp..bounds(2).cold]);
        assert!(blocked.registers.is_none());
    }

    #[test]
    fn dead_threads_lose_their_stack() {
        let mock = Arc::new(MockControl::default());
        let gc = collector(DiscoveryKind::Explicit, &mock);
        register_all(&gc, &mock, &[1, 2]);
        mock.kill(ThreadId(1));

        let stopped = gc.stop_world();
        assert_eq!(stopped.suspended_threads(), vec![ThreadId(2)]);
        let summary = stopped.for_each_thread_stack(|s| {
            assert_eq!(s.owner, StackOwner::Mutator(ThreadId(2)));
        });
        assert_eq!(summary.threads, 1);
        assert_eq!(summary.bytes, 0x800);
    }

    #[test]
    fn stack_ranges_report_captured_sp() {
        let mock = Arc::new(MockControl::default());
        let gc = collector(DiscoveryKind::Explicit, &mock);
        register_all(&gc, &mock, &[3]);

        let stopped = gc.stop_world();
        let mut ranges = Vec::new();
        let summary = stopped.for_each_thread_stack(|s| {
            assert_eq!(s.registers.map(|r| r.sp), Some(bounds(3).cold - 0x800));
            ranges.extend(s.ranges.iter().cloned());
        });
        assert_eq!(ranges, vec![bounds(3).cold - 0x800..bounds(3).cold]);
        assert_eq!(summary, StackScanSummary { threads: 1, bytes: 0x800 });
        let min = stopped.threads()[0].bounds.hot;
        assert_eq!(min, bounds(3).hot, "stack min stays at the registered hot end");
    }

    #[test]
    fn sections_split_the_stack() {
        let sections = [(0x5000, 0x6000), (0x7000, 0x8000)];
        assert_eq!(
            scan_ranges(0x4000, 0x9000, sections.into_iter()),
            vec![0x4000..0x5000, 0x6000..0x7000, 0x8000..0x9000]
        );
        assert_eq!(scan_ranges(0x4000, 0x9000, std::iter::empty()), vec![0x4000..0x9000]);
    }

    #[test]
    fn implicit_attach_during_stop_forces_rescan() {
        let mock = Arc::new(MockControl::default());
        let gc = collector(DiscoveryKind::Implicit, &mock);
        register_all(&gc, &mock, &[1]);

        // while thread 1 is being suspended, thread 9 attaches lock-free
        let weak = Arc::downgrade(&gc);
        let mut fired = false;
        let hook_mock = Arc::downgrade(&mock);
        mock.on_suspend(move |_| {
            if std::mem::replace(&mut fired, true) {
                return;
            }
            let gc = weak.upgrade().expect("collector alive");
            let crate::table::Registry::Implicit(slots) = &gc.registry else {
                unreachable!("implicit collector")
            };
            let (_, raced) = slots
                .claim(ThreadId(9), None, bounds(9), &gc.stop_requested)
                .expect("free slot");
            assert!(raced, "stop was requested before the claim");
            if let Some(mock) = hook_mock.upgrade() {
                mock.set_sp(ThreadId(9), bounds(9).cold - 0x800);
            }
        });

        let stopped = gc.stop_world();
        assert!(stopped.rescans() >= 1);
        let mut ids = stopped.suspended_threads();
        ids.sort();
        assert_eq!(ids, vec![ThreadId(1), ThreadId(9)]);
    }

    #[test]
    fn backoff_is_bounded() {
        let start = Instant::now();
        for attempt in 0..YIELD_ATTEMPTS + 12 {
            backoff_sleep(attempt);
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
