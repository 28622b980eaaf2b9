//! Barriers: wait-groups over a growing set of jobs.
//!
//! A barrier counts the jobs it tracks that have not finished yet. Jobs may
//! be added while another thread is already waiting, which is how jobs that
//! spawn siblings mid-run keep the waiter blocked until their fan-out drains.
//!
//! Registration increments the outstanding count *before* the job's
//! completion slot is claimed, so the count can never touch zero while a
//! registration is in flight. A job that already finished rejects the claim
//! and the increment is rolled back.

use crate::job::JobHandle;
use crate::job_system::JobPool;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct BarrierState {
    outstanding: AtomicUsize,
    jobs: Mutex<Vec<JobHandle>>,
    waiting: AtomicBool,
    /// Set when the owning `Barrier` was dropped with jobs outstanding. The
    /// slot stays out of the free list until the last of them reports in.
    retired: AtomicBool,
    signal: Mutex<()>,
    drained: Condvar,
}

impl BarrierState {
    fn new() -> Self {
        BarrierState {
            outstanding: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
            waiting: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            signal: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Returns how many of `handles` had already finished and were not counted.
    fn register(&self, index: u32, handles: &[JobHandle]) -> usize {
        if handles.is_empty() {
            return 0;
        }
        self.outstanding.fetch_add(handles.len(), Ordering::AcqRel);

        let mut already_done = 0;
        {
            let mut jobs = self.jobs.lock();
            for handle in handles {
                if handle.set_barrier(index) {
                    jobs.push(handle.clone());
                } else {
                    already_done += 1;
                }
            }
        }
        already_done
    }

    /// Called by a job after it is marked done, or when it is dropped unrun.
    /// Returns `true` if this drained the barrier.
    pub(crate) fn on_job_finished(&self) -> bool {
        self.finish(1)
    }

    fn finish(&self, count: usize) -> bool {
        let previous = self.outstanding.fetch_sub(count, Ordering::SeqCst);
        assert!(previous >= count, "barrier finished more jobs than it tracks");
        if previous != count {
            return false;
        }
        let _guard = self.signal.lock();
        self.drained.notify_all();
        true
    }

    pub(crate) fn begin_wait(&self) {
        assert!(
            !self.waiting.swap(true, Ordering::AcqRel),
            "only one thread may wait on a barrier at a time"
        );
    }

    /// Blocks for at most `timeout` unless the barrier drains first.
    pub(crate) fn park(&self, timeout: Duration) {
        let mut guard = self.signal.lock();
        if self.is_done() {
            return;
        }
        self.drained.wait_for(&mut guard, timeout);
    }

    pub(crate) fn end_wait(&self) {
        let finished = std::mem::take(&mut *self.jobs.lock());
        // Dropping handles may recycle job slots; do it outside the lock.
        drop(finished);
        self.waiting.store(false, Ordering::Release);
    }
}

/// Fixed-capacity storage for barriers.
pub(crate) struct BarrierArena {
    slots: Box<[BarrierState]>,
    free: Mutex<Vec<u32>>,
}

impl BarrierArena {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "barrier arena needs at least one slot");
        BarrierArena {
            slots: (0..capacity).map(|_| BarrierState::new()).collect(),
            free: Mutex::new((0..capacity as u32).rev().collect()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn allocate(&self) -> Option<u32> {
        self.free.lock().pop()
    }

    pub(crate) fn get(&self, index: u32) -> &BarrierState {
        &self.slots[index as usize]
    }

    pub(crate) fn job_finished(&self, index: u32) {
        if self.get(index).on_job_finished() {
            self.try_recycle(index);
        }
    }

    fn retire(&self, index: u32) {
        self.get(index).retired.store(true, Ordering::SeqCst);
        self.try_recycle(index);
    }

    /// Returns a retired slot to the free list once nothing is outstanding.
    /// Both the dropping thread and the last finishing job call this; the
    /// `retired` flag lets exactly one of them push the slot.
    fn try_recycle(&self, index: u32) {
        let state = self.get(index);
        if state.outstanding.load(Ordering::SeqCst) == 0
            && state
                .retired
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.free.lock().push(index);
        }
    }
}

/// Owned handle to a barrier slot. Dropping it destroys the barrier.
pub struct Barrier {
    pool: Arc<JobPool>,
    index: u32,
}

impl Barrier {
    pub(crate) fn new(pool: Arc<JobPool>, index: u32) -> Self {
        Barrier { pool, index }
    }

    fn state(&self) -> &BarrierState {
        self.pool.barriers().get(self.index)
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn pool(&self) -> &Arc<JobPool> {
        &self.pool
    }

    /// Tracks `job`. Legal while another thread waits on this barrier.
    pub fn add_job(&self, job: &JobHandle) {
        self.add_jobs(std::slice::from_ref(job));
    }

    /// Tracks every job in `jobs`. Jobs that already finished are skipped.
    pub fn add_jobs(&self, jobs: &[JobHandle]) {
        for job in jobs {
            assert!(
                Arc::ptr_eq(job.pool(), &self.pool),
                "job '{}' belongs to a different job pool than the barrier",
                job.name()
            );
        }
        let already_done = self.state().register(self.index, jobs);
        if already_done > 0 {
            self.state().finish(already_done);
        }
    }

    /// Number of tracked jobs that have not finished.
    pub fn outstanding(&self) -> usize {
        self.state().outstanding.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        let state = self.state();
        let outstanding = state.outstanding.load(Ordering::Acquire);
        if outstanding != 0 {
            log::error!(
                "barrier {} destroyed with {outstanding} unfinished job(s); \
                 its slot is reused once they finish",
                self.index
            );
        }
        let jobs = std::mem::take(&mut *state.jobs.lock());
        self.pool.barriers().retire(self.index);
        // Jobs freed here without running report to the retired slot.
        drop(jobs);
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("index", &self.index)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::job_system::{JobSystem, JobSystemSingleThreaded};
    use crate::JobSystemError;

    #[test]
    fn test_barrier_counts_unfinished_jobs() {
        let system = JobSystemSingleThreaded::new(16, 2);
        let barrier = system.create_barrier().unwrap();
        let a = system.create_job("a", 0, Box::new(|| {})).unwrap();
        let b = system.create_job("b", 1, Box::new(|| {})).unwrap();

        barrier.add_jobs(&[a.clone(), b.clone()]);
        assert_eq!(barrier.outstanding(), 2);

        a.execute();
        assert_eq!(barrier.outstanding(), 1);
        b.remove_dependency(1);
        b.execute();
        assert!(barrier.is_done());
    }

    #[test]
    fn test_finished_job_is_not_counted() {
        let system = JobSystemSingleThreaded::new(16, 2);
        let barrier = system.create_barrier().unwrap();
        let job = system.create_job("done", 0, Box::new(|| {})).unwrap();
        job.execute();

        barrier.add_job(&job);
        assert!(barrier.is_done());
    }

    #[test]
    #[should_panic(expected = "already tracked by barrier")]
    fn test_job_cannot_join_two_barriers() {
        let system = JobSystemSingleThreaded::new(16, 2);
        let first = system.create_barrier().unwrap();
        let second = system.create_barrier().unwrap();
        let job = system.create_job("shared", 1, Box::new(|| {})).unwrap();
        first.add_job(&job);
        second.add_job(&job);
    }

    #[test]
    fn test_barrier_slots_are_recycled() {
        let system = JobSystemSingleThreaded::new(4, 1);
        let barrier = system.create_barrier().unwrap();
        assert_eq!(
            system.create_barrier().unwrap_err(),
            JobSystemError::BarrierPoolExhausted { capacity: 1 }
        );
        drop(barrier);
        assert!(system.create_barrier().is_ok());
    }

    #[test]
    fn test_dropped_barrier_slot_waits_for_outstanding_jobs() {
        let system = JobSystemSingleThreaded::new(8, 1);
        let job = system.create_job("late", 1, Box::new(|| {})).unwrap();
        {
            let barrier = system.create_barrier().unwrap();
            barrier.add_job(&job);
        }
        assert_eq!(
            system.create_barrier().unwrap_err(),
            JobSystemError::BarrierPoolExhausted { capacity: 1 }
        );

        job.remove_dependency(1);
        job.execute();
        let barrier = system.create_barrier().unwrap();
        assert_eq!(barrier.outstanding(), 0);
        assert!(barrier.is_done());
    }

    #[test]
    fn test_job_dropped_unrun_releases_retired_slot() {
        let system = JobSystemSingleThreaded::new(8, 1);
        let job = system.create_job("never", 1, Box::new(|| {})).unwrap();
        let barrier = system.create_barrier().unwrap();
        barrier.add_job(&job);
        drop(barrier);

        drop(job);
        let barrier = system.create_barrier().unwrap();
        assert_eq!(barrier.outstanding(), 0);
        system.wait_for_jobs(&barrier);
    }
}
