//! Job definitions, the job arena and shareable job handles.
//!
//! Jobs live in a fixed-capacity arena owned by a [`JobPool`] and are addressed
//! by generation-checked [`JobId`]s. A [`JobHandle`] is a reference-counted
//! owner of one arena slot: the slot is recycled when the last handle is
//! dropped. The ready queue and executing workers hold handles too, so a job
//! cannot be recycled while it is queued or running.
//!
//! Each job carries a dependency counter and a tagged [`JobState`]:
//!
//! ```text
//! Pending (deps > 0) ──last remove──▶ Ready ──execute──▶ Executing ──▶ Done
//! ```

use crate::completion::{AttachError, CompletionSlot};
use crate::error::JobSystemError;
use crate::job_system::JobPool;
use crate::profiler;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// The work executed by a job.
pub type JobFunction = Box<dyn FnOnce() + Send + 'static>;

/// Arena address of a job. The generation changes every time a slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    index: u32,
    generation: u32,
}

impl JobId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Lifecycle of a job slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    /// Slot is on the free list.
    Free = 0,
    /// Waiting for dependencies.
    Pending = 1,
    /// No dependencies left; may be queued and picked up.
    Ready = 2,
    /// A thread is running the work function.
    Executing = 3,
    /// Finished. Terminal until the slot is recycled.
    Done = 4,
}

impl JobState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => JobState::Free,
            1 => JobState::Pending,
            2 => JobState::Ready,
            3 => JobState::Executing,
            4 => JobState::Done,
            _ => unreachable!("invalid job state {raw}"),
        }
    }
}

/// Result of [`JobHandle::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// This call ran the job.
    Executed,
    /// Dependencies remain; the job was not run.
    Blocked { remaining: u32 },
    /// Another caller already started (or finished) the job.
    AlreadyStarted(JobState),
}

struct JobBody {
    name: &'static str,
    work: Option<JobFunction>,
}

pub(crate) struct JobSlot {
    generation: AtomicU32,
    ref_count: AtomicU32,
    state: AtomicU8,
    dependencies: AtomicU32,
    completion: CompletionSlot,
    body: Mutex<JobBody>,
}

impl JobSlot {
    fn new() -> Self {
        JobSlot {
            generation: AtomicU32::new(0),
            ref_count: AtomicU32::new(0),
            state: AtomicU8::new(JobState::Free as u8),
            dependencies: AtomicU32::new(0),
            completion: CompletionSlot::new(),
            body: Mutex::new(JobBody {
                name: "",
                work: None,
            }),
        }
    }

    fn state(&self) -> JobState {
        JobState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: JobState, to: JobState) -> Result<(), JobState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(JobState::from_raw)
    }
}

/// Fixed-capacity storage for jobs with a free list of slot indices.
pub(crate) struct JobArena {
    slots: Box<[JobSlot]>,
    free: Mutex<Vec<u32>>,
}

impl JobArena {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "job arena needs at least one slot");
        assert!(capacity < u32::MAX as usize, "job arena capacity too large");
        let slots = (0..capacity).map(|_| JobSlot::new()).collect();
        // Reversed so low indices are handed out first.
        let free = (0..capacity as u32).rev().collect();
        JobArena {
            slots,
            free: Mutex::new(free),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.lock().len()
    }

    pub(crate) fn allocate(
        &self,
        name: &'static str,
        dependency_count: u32,
        work: JobFunction,
    ) -> Result<JobId, JobSystemError> {
        let index = self
            .free
            .lock()
            .pop()
            .ok_or(JobSystemError::JobPoolExhausted {
                capacity: self.slots.len(),
            })?;
        let slot = &self.slots[index as usize];
        debug_assert_eq!(slot.state(), JobState::Free);

        {
            let mut body = slot.body.lock();
            body.name = name;
            body.work = Some(work);
        }
        slot.completion.reset();
        slot.dependencies.store(dependency_count, Ordering::Relaxed);
        slot.ref_count.store(1, Ordering::Relaxed);
        let initial = if dependency_count == 0 {
            JobState::Ready
        } else {
            JobState::Pending
        };
        slot.state.store(initial as u8, Ordering::Release);

        Ok(JobId {
            index,
            generation: slot.generation.load(Ordering::Relaxed),
        })
    }

    fn slot(&self, id: JobId) -> &JobSlot {
        let slot = &self.slots[id.index as usize];
        debug_assert_eq!(
            slot.generation.load(Ordering::Relaxed),
            id.generation,
            "stale job id {id}"
        );
        slot
    }

    /// Returns a slot to the free list once its last handle is gone.
    ///
    /// A job that never ran is sealed here instead of in `execute`; the
    /// barrier it was attached to, if any, is returned so the caller can
    /// stop waiting for it.
    fn release(&self, id: JobId) -> Option<u32> {
        let slot = self.slot(id);
        let state = slot.state();
        let barrier = if state == JobState::Done {
            None
        } else {
            slot.completion.finalize()
        };
        let work = {
            let mut body = slot.body.lock();
            if state != JobState::Done {
                log::warn!(
                    "job '{}' ({id}) dropped in state {state:?} before it ran",
                    body.name
                );
            }
            body.name = "";
            body.work.take()
        };
        // Run the closure's destructor outside the body lock.
        drop(work);

        slot.generation.fetch_add(1, Ordering::Relaxed);
        slot.state.store(JobState::Free as u8, Ordering::Release);
        self.free.lock().push(id.index);
        barrier
    }
}

/// Shared, reference-counted handle to a job in a [`JobPool`].
pub struct JobHandle {
    pool: Arc<JobPool>,
    id: JobId,
}

impl JobHandle {
    /// Wraps a freshly allocated slot whose reference count is already one.
    pub(crate) fn adopt(pool: Arc<JobPool>, id: JobId) -> Self {
        JobHandle { pool, id }
    }

    fn slot(&self) -> &JobSlot {
        self.pool.jobs().slot(self.id)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// The pool this job was created in.
    pub fn pool(&self) -> &Arc<JobPool> {
        &self.pool
    }

    pub fn name(&self) -> &'static str {
        self.slot().body.lock().name
    }

    pub fn state(&self) -> JobState {
        self.slot().state()
    }

    pub fn is_done(&self) -> bool {
        self.state() == JobState::Done
    }

    pub fn dependency_count(&self) -> u32 {
        self.slot().dependencies.load(Ordering::Acquire)
    }

    /// Adds `count` dependencies.
    ///
    /// Only legal before the job starts running; the caller guarantees no
    /// concurrent removal can drive the counter to zero meanwhile.
    ///
    /// # Panics
    ///
    /// Panics if the job is already executing or done.
    pub fn add_dependency(&self, count: u32) {
        let slot = self.slot();
        let state = slot.state();
        assert!(
            matches!(state, JobState::Pending | JobState::Ready),
            "cannot add dependencies to job '{}' in state {state:?}",
            self.name()
        );
        let previous = slot.dependencies.fetch_add(count, Ordering::AcqRel);
        if previous == 0 && count > 0 {
            // Not queued yet (caller's contract), so it simply waits again.
            let _ = slot.transition(JobState::Ready, JobState::Pending);
        }
    }

    /// Removes `count` dependencies. Returns `true` exactly once: for the call
    /// that brings the counter to zero.
    ///
    /// # Panics
    ///
    /// Panics if more dependencies are removed than were added.
    pub fn remove_dependency(&self, count: u32) -> bool {
        if count == 0 {
            return false;
        }
        let slot = self.slot();
        let previous = slot.dependencies.fetch_sub(count, Ordering::AcqRel);
        assert!(
            previous >= count,
            "job '{}' over-released: removed {count} with {previous} outstanding",
            self.name()
        );
        if previous != count {
            return false;
        }
        if let Err(state) = slot.transition(JobState::Pending, JobState::Ready) {
            panic!(
                "job '{}' reached zero dependencies in state {state:?}",
                self.name()
            );
        }
        true
    }

    /// Removes `count` dependencies and queues the job if it became runnable.
    pub fn remove_dependency_and_queue(&self, count: u32) {
        if self.remove_dependency(count) {
            self.pool.queue_job(self.clone());
        }
    }

    /// Removes `count` dependencies from every job in `handles` and submits
    /// the ones that became runnable to the ready queue in one batch.
    ///
    /// Returns how many jobs were queued.
    ///
    /// # Panics
    ///
    /// Panics if the handles do not all belong to the same pool.
    pub fn remove_dependencies(handles: &[JobHandle], count: u32) -> usize {
        let Some(first) = handles.first() else {
            return 0;
        };
        let mut runnable = Vec::with_capacity(handles.len());
        for handle in handles {
            assert!(
                Arc::ptr_eq(&handle.pool, &first.pool),
                "batched dependency removal across different job pools"
            );
            if handle.remove_dependency(count) {
                runnable.push(handle.clone());
            }
        }
        let queued = runnable.len();
        if queued > 0 {
            first.pool.queue_jobs(runnable);
        }
        queued
    }

    /// Attaches the job to a barrier. Returns `false` if the job already
    /// finished, in which case the barrier must not count it.
    ///
    /// # Panics
    ///
    /// Panics if the job is already attached to a barrier.
    pub(crate) fn set_barrier(&self, barrier: u32) -> bool {
        match self.slot().completion.try_attach(barrier) {
            Ok(()) => true,
            Err(AttachError::Finalized) => false,
            Err(AttachError::AlreadyAttached(other)) => panic!(
                "job '{}' is already tracked by barrier {other}",
                self.name()
            ),
        }
    }

    /// Runs the job if it is runnable and nobody started it yet.
    ///
    /// The barrier slot is sealed after the work function returns, and the
    /// barrier is notified only after the job is marked done, so a waiter
    /// woken by the barrier always observes the job as finished.
    pub fn execute(&self) -> ExecuteOutcome {
        let slot = self.slot();
        if let Err(state) = slot.transition(JobState::Ready, JobState::Executing) {
            return match state {
                JobState::Pending => ExecuteOutcome::Blocked {
                    remaining: slot.dependencies.load(Ordering::Acquire),
                },
                other => ExecuteOutcome::AlreadyStarted(other),
            };
        }

        let (name, work) = {
            let mut body = slot.body.lock();
            (body.name, body.work.take())
        };
        if let Some(work) = work {
            let _scope = profiler::ProfileScope::new(name);
            log::trace!("executing job '{name}' ({})", self.id);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                self.pool.record_panic(name, payload.as_ref());
            }
        }

        let barrier = slot.completion.finalize();
        slot.state.store(JobState::Done as u8, Ordering::Release);
        if let Some(barrier) = barrier {
            self.pool.barrier_job_finished(barrier);
        }
        #[cfg(feature = "metrics")]
        self.pool
            .metrics()
            .jobs_executed
            .fetch_add(1, Ordering::Relaxed);
        ExecuteOutcome::Executed
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> Self {
        self.slot().ref_count.fetch_add(1, Ordering::Relaxed);
        JobHandle {
            pool: self.pool.clone(),
            id: self.id,
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if self.slot().ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(barrier) = self.pool.jobs().release(self.id) {
                self.pool.barrier_job_finished(barrier);
            }
        }
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool) && self.id == other.id
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_system::{JobSystem, JobSystemSingleThreaded};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn system() -> JobSystemSingleThreaded {
        JobSystemSingleThreaded::new(64, 4)
    }

    #[test]
    fn test_job_execution() {
        let system = system();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let job = system
            .create_job(
                "set_flag",
                0,
                Box::new(move || executed_clone.store(true, Ordering::SeqCst)),
            )
            .unwrap();

        assert_eq!(job.state(), JobState::Ready);
        assert_eq!(job.execute(), ExecuteOutcome::Executed);
        assert!(executed.load(Ordering::SeqCst));
        assert!(job.is_done());
    }

    #[test]
    fn test_blocked_job_does_not_run() {
        let system = system();
        let job = system.create_job("blocked", 2, Box::new(|| {})).unwrap();
        assert_eq!(job.execute(), ExecuteOutcome::Blocked { remaining: 2 });
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn test_execute_runs_once() {
        let system = system();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let job = system
            .create_job(
                "once",
                0,
                Box::new(move || {
                    runs_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(job.execute(), ExecuteOutcome::Executed);
        assert_eq!(
            job.execute(),
            ExecuteOutcome::AlreadyStarted(JobState::Done)
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_last_removal_makes_runnable() {
        let system = system();
        let job = system.create_job("three", 3, Box::new(|| {})).unwrap();
        assert!(!job.remove_dependency(1));
        assert!(!job.remove_dependency(1));
        assert_eq!(job.state(), JobState::Pending);
        assert!(job.remove_dependency(1));
        assert_eq!(job.state(), JobState::Ready);
    }

    #[test]
    fn test_add_dependency_moves_ready_back_to_pending() {
        let system = system();
        let job = system.create_job("ready", 0, Box::new(|| {})).unwrap();
        job.add_dependency(2);
        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.dependency_count(), 2);
        assert!(job.remove_dependency(2));
    }

    #[test]
    #[should_panic(expected = "over-released")]
    fn test_over_release_panics() {
        let system = system();
        let job = system.create_job("over", 1, Box::new(|| {})).unwrap();
        job.remove_dependency(2);
    }

    #[test]
    #[should_panic(expected = "cannot add dependencies")]
    fn test_add_dependency_after_done_panics() {
        let system = system();
        let job = system.create_job("done", 0, Box::new(|| {})).unwrap();
        job.execute();
        job.add_dependency(1);
    }

    #[test]
    fn test_slot_recycled_with_new_generation() {
        let system = JobSystemSingleThreaded::new(1, 1);
        let first = system.create_job("first", 0, Box::new(|| {})).unwrap();
        let first_id = first.id();
        first.execute();
        drop(first);

        let second = system.create_job("second", 0, Box::new(|| {})).unwrap();
        assert_eq!(second.id().index(), first_id.index());
        assert_ne!(second.id().generation(), first_id.generation());
    }

    #[test]
    fn test_pool_exhaustion_is_reported() {
        let system = JobSystemSingleThreaded::new(2, 1);
        let _a = system.create_job("a", 1, Box::new(|| {})).unwrap();
        let _b = system.create_job("b", 1, Box::new(|| {})).unwrap();
        let err = system.create_job("c", 0, Box::new(|| {})).unwrap_err();
        assert_eq!(err, JobSystemError::JobPoolExhausted { capacity: 2 });
        // Release the pending jobs so nothing is dropped unrun.
        _a.remove_dependency(1);
        _b.remove_dependency(1);
        _a.execute();
        _b.execute();
    }

    #[test]
    fn test_clone_keeps_slot_alive() {
        let system = JobSystemSingleThreaded::new(1, 1);
        let job = system.create_job("shared", 0, Box::new(|| {})).unwrap();
        let other = job.clone();
        job.execute();
        drop(job);
        assert!(other.is_done());
        assert_eq!(system.pool().jobs().in_use(), 1);
        drop(other);
        assert_eq!(system.pool().jobs().in_use(), 0);
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let system = system();
        let job = system
            .create_job("boom", 0, Box::new(|| panic!("Intentional panic for testing")))
            .unwrap();
        assert_eq!(job.execute(), ExecuteOutcome::Executed);
        assert!(job.is_done());
        assert_eq!(system.pool().panicked_jobs(), 1);
    }
}
