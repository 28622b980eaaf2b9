//! High-level job system interface.
//!
//! [`JobPool`] is the scheduler state every job points back to: the job and
//! barrier arenas, the global ready queue and the stealers of any worker
//! deques. [`JobSystem`] is the abstract interface the physics step builder
//! programs against. Two implementations ship with the crate:
//!
//! - [`JobSystemThreadPool`](crate::worker::JobSystemThreadPool): worker
//!   threads with work-stealing deques.
//! - [`JobSystemSingleThreaded`]: no workers; everything runs on the thread
//!   that waits on a barrier.
//!
//! Whatever the implementation, the thread calling
//! [`JobSystem::wait_for_jobs`] executes ready jobs while it waits. A graph
//! therefore always makes progress, even with zero worker threads.

use crate::barrier::{Barrier, BarrierArena};
use crate::error::JobSystemError;
use crate::job::{JobArena, JobFunction, JobHandle, JobState};
use crate::PinningStrategy;
use crossbeam::deque::{Injector, Steal, Stealer};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

const MIN_WAIT_BACKOFF: Duration = Duration::from_micros(1);
const MAX_WAIT_BACKOFF: Duration = Duration::from_millis(1);

/// Configuration for a job system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// Worker threads to spawn. Default: available parallelism.
    pub num_threads: usize,
    /// Job arena capacity. Default: 2048.
    pub max_jobs: usize,
    /// Barrier arena capacity. Default: 8.
    pub max_barriers: usize,
    /// How worker threads are pinned to cores.
    pub pinning: PinningStrategy,
    /// Record job spans for chrome-trace export.
    pub record_trace: bool,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_jobs: 2048,
            max_barriers: 8,
            pinning: PinningStrategy::None,
            record_trace: false,
        }
    }
}

/// Shared scheduler state referenced by every job and barrier.
pub struct JobPool {
    jobs: JobArena,
    barriers: BarrierArena,
    injector: Injector<JobHandle>,
    stealers: Vec<Stealer<JobHandle>>,
    idle: Mutex<()>,
    work_available: Condvar,
    shutdown: AtomicBool,
    max_concurrency: usize,
    panicked_jobs: AtomicUsize,
    #[cfg(feature = "metrics")]
    metrics: Metrics,
}

impl JobPool {
    pub(crate) fn new(
        max_jobs: usize,
        max_barriers: usize,
        max_concurrency: usize,
        stealers: Vec<Stealer<JobHandle>>,
    ) -> Arc<Self> {
        Arc::new(JobPool {
            jobs: JobArena::new(max_jobs),
            barriers: BarrierArena::new(max_barriers),
            injector: Injector::new(),
            stealers,
            idle: Mutex::new(()),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            max_concurrency: max_concurrency.max(1),
            panicked_jobs: AtomicUsize::new(0),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        })
    }

    pub(crate) fn jobs(&self) -> &JobArena {
        &self.jobs
    }

    pub(crate) fn barriers(&self) -> &BarrierArena {
        &self.barriers
    }

    pub(crate) fn injector(&self) -> &Injector<JobHandle> {
        &self.injector
    }

    pub(crate) fn stealers(&self) -> &[Stealer<JobHandle>] {
        &self.stealers
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// How many jobs can make progress at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of job slots currently allocated.
    pub fn jobs_in_use(&self) -> usize {
        self.jobs.in_use()
    }

    pub fn job_capacity(&self) -> usize {
        self.jobs.capacity()
    }

    /// Number of job functions that panicked since the pool was created.
    pub fn panicked_jobs(&self) -> usize {
        self.panicked_jobs.load(Ordering::Relaxed)
    }

    /// Allocates a job. A job created with zero dependencies is not queued
    /// automatically.
    pub fn create_job(
        self: &Arc<Self>,
        name: &'static str,
        dependency_count: u32,
        work: JobFunction,
    ) -> Result<JobHandle, JobSystemError> {
        let id = self.jobs.allocate(name, dependency_count, work)?;
        Ok(JobHandle::adopt(self.clone(), id))
    }

    pub fn create_barrier(self: &Arc<Self>) -> Result<Barrier, JobSystemError> {
        let index = self
            .barriers
            .allocate()
            .ok_or(JobSystemError::BarrierPoolExhausted {
                capacity: self.barriers.capacity(),
            })?;
        Ok(Barrier::new(self.clone(), index))
    }

    /// Pushes a runnable job onto the ready queue.
    ///
    /// # Panics
    ///
    /// Panics if the job still has dependencies.
    pub fn queue_job(&self, job: JobHandle) {
        assert_eq!(
            job.state(),
            JobState::Ready,
            "queued job '{}' is not runnable",
            job.name()
        );
        self.injector.push(job);
        #[cfg(feature = "metrics")]
        self.metrics.single_submissions.fetch_add(1, Ordering::Relaxed);
        let _guard = self.idle.lock();
        self.work_available.notify_one();
    }

    /// Pushes many runnable jobs and wakes workers once.
    pub fn queue_jobs(&self, jobs: Vec<JobHandle>) {
        if jobs.is_empty() {
            return;
        }
        let count = jobs.len();
        for job in jobs {
            debug_assert_eq!(job.state(), JobState::Ready);
            self.injector.push(job);
        }
        #[cfg(feature = "metrics")]
        self.metrics.batch_submissions.fetch_add(1, Ordering::Relaxed);
        let _guard = self.idle.lock();
        if count == 1 {
            self.work_available.notify_one();
        } else {
            self.work_available.notify_all();
        }
    }

    /// Takes one job from the global queue, then from worker deques.
    pub(crate) fn try_take_ready(&self) -> Option<JobHandle> {
        loop {
            match self.injector.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        self.stealers.iter().find_map(|stealer| loop {
            match stealer.steal() {
                Steal::Success(job) => break Some(job),
                Steal::Empty => break None,
                Steal::Retry => continue,
            }
        })
    }

    /// Blocks until every job tracked by `barrier` has finished, executing
    /// ready jobs on the calling thread in the meantime.
    ///
    /// # Panics
    ///
    /// Panics if another thread is already waiting on the same barrier, or
    /// if the barrier belongs to another pool.
    pub fn wait_for_jobs(&self, barrier: &Barrier) {
        assert!(
            std::ptr::eq(Arc::as_ptr(barrier.pool()), self),
            "barrier belongs to a different job pool"
        );
        let state = self.barriers.get(barrier.index());
        state.begin_wait();

        let mut backoff = MIN_WAIT_BACKOFF;
        while !state.is_done() {
            if let Some(job) = self.try_take_ready() {
                #[cfg(feature = "metrics")]
                self.metrics.waiter_executions.fetch_add(1, Ordering::Relaxed);
                job.execute();
                backoff = MIN_WAIT_BACKOFF;
                continue;
            }
            state.park(backoff);
            backoff = (backoff * 2).min(MAX_WAIT_BACKOFF);
        }

        state.end_wait();
    }

    pub(crate) fn record_panic(&self, name: &str, payload: &(dyn Any + Send)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        log::error!("job '{name}' panicked: {message}");
        self.panicked_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn barrier_job_finished(&self, barrier: u32) {
        self.barriers.job_finished(barrier);
    }

    /// Parks an idle worker until work is queued, shutdown starts or `timeout` elapses.
    pub(crate) fn park_idle(&self, timeout: Duration) {
        let mut guard = self.idle.lock();
        if !self.injector.is_empty() || self.is_shutting_down() {
            return;
        }
        self.work_available.wait_for(&mut guard, timeout);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.idle.lock();
        self.work_available.notify_all();
    }

    /// Drops every queued handle. Jobs still queued at this point never run.
    pub(crate) fn drain_ready(&self) -> usize {
        let mut dropped = 0;
        while let Some(job) = self.try_take_ready() {
            log::warn!("discarding queued job '{}' at shutdown", job.name());
            dropped += 1;
        }
        dropped
    }
}

/// Abstract scheduler contract used by the physics step builder.
///
/// Implementors only provide their [`JobPool`]; every operation has a default
/// built on it. A thread pool plugged in here must guarantee that queued jobs
/// eventually execute; the waiting thread participating in execution covers
/// the case where it has no free workers.
pub trait JobSystem: Send + Sync {
    fn pool(&self) -> &Arc<JobPool>;

    fn max_concurrency(&self) -> usize {
        self.pool().max_concurrency()
    }

    fn create_job(
        &self,
        name: &'static str,
        dependency_count: u32,
        work: JobFunction,
    ) -> Result<JobHandle, JobSystemError> {
        self.pool().create_job(name, dependency_count, work)
    }

    fn create_barrier(&self) -> Result<Barrier, JobSystemError> {
        self.pool().create_barrier()
    }

    fn queue_job(&self, job: &JobHandle) {
        self.pool().queue_job(job.clone());
    }

    fn queue_jobs(&self, jobs: &[JobHandle]) {
        self.pool().queue_jobs(jobs.to_vec());
    }

    fn wait_for_jobs(&self, barrier: &Barrier) {
        self.pool().wait_for_jobs(barrier);
    }
}

/// Job system without worker threads: jobs run inside `wait_for_jobs`.
pub struct JobSystemSingleThreaded {
    pool: Arc<JobPool>,
}

impl JobSystemSingleThreaded {
    pub fn new(max_jobs: usize, max_barriers: usize) -> Self {
        JobSystemSingleThreaded {
            pool: JobPool::new(max_jobs, max_barriers, 1, Vec::new()),
        }
    }
}

impl Default for JobSystemSingleThreaded {
    fn default() -> Self {
        let config = JobSystemConfig::default();
        Self::new(config.max_jobs, config.max_barriers)
    }
}

impl JobSystem for JobSystemSingleThreaded {
    fn pool(&self) -> &Arc<JobPool> {
        &self.pool
    }
}

impl Drop for JobSystemSingleThreaded {
    fn drop(&mut self) {
        // Queued handles keep the pool alive; release them.
        self.pool.drain_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_config_defaults() {
        let config = JobSystemConfig::default();
        assert!(config.num_threads >= 1);
        assert_eq!(config.max_jobs, 2048);
        assert_eq!(config.max_barriers, 8);
        assert_eq!(config.pinning, PinningStrategy::None);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: JobSystemConfig =
            serde_json::from_str(r#"{ "num_threads": 3, "pinning": "Linear" }"#).unwrap();
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.pinning, PinningStrategy::Linear);
        assert_eq!(config.max_jobs, 2048);
    }

    #[test]
    fn test_single_threaded_runs_on_waiter() {
        let system = JobSystemSingleThreaded::new(32, 2);
        assert_eq!(system.max_concurrency(), 1);
        let executed = Arc::new(AtomicUsize::new(0));
        let barrier = system.create_barrier().unwrap();

        let mut jobs = Vec::new();
        for _ in 0..10 {
            let executed = executed.clone();
            jobs.push(
                system
                    .create_job(
                        "count",
                        0,
                        Box::new(move || {
                            executed.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .unwrap(),
            );
        }
        barrier.add_jobs(&jobs);
        system.queue_jobs(&jobs);
        // Nothing runs until someone waits.
        assert_eq!(executed.load(Ordering::SeqCst), 0);

        system.wait_for_jobs(&barrier);
        assert_eq!(executed.load(Ordering::SeqCst), 10);
        assert!(jobs.iter().all(JobHandle::is_done));
    }

    #[test]
    #[should_panic(expected = "not runnable")]
    fn test_queueing_pending_job_panics() {
        let system = JobSystemSingleThreaded::new(4, 1);
        let job = system.create_job("pending", 1, Box::new(|| {})).unwrap();
        system.queue_job(&job);
    }

    #[test]
    fn test_barrier_released_after_wait() {
        let system = JobSystemSingleThreaded::new(4, 1);
        let barrier = system.create_barrier().unwrap();
        let job = system.create_job("one", 0, Box::new(|| {})).unwrap();
        barrier.add_job(&job);
        system.queue_job(&job);
        drop(job);
        system.wait_for_jobs(&barrier);
        // The barrier dropped its handle, so the slot went back to the arena.
        assert_eq!(system.pool().jobs_in_use(), 0);
    }
}
