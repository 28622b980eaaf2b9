//! Worker threads and the thread-pool backed job system.
//!
//! Each worker owns a FIFO deque. It drains its own deque first, then steals
//! a batch from the global injector, then single jobs from its peers. A
//! worker that finds nothing parks on the pool's idle condvar until work is
//! queued (or a short timeout passes, which covers jobs sitting in a peer's
//! deque).

use crate::error::JobSystemError;
use crate::job::JobHandle;
use crate::job_system::{JobPool, JobSystem, JobSystemConfig};
use crate::{profiler, PinningStrategy};
use crossbeam::deque::{Steal, Worker as Deque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;

const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// A worker thread executing jobs from a [`JobPool`].
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        local_queue: Deque<JobHandle>,
        pool: Arc<JobPool>,
        core: Option<core_affinity::CoreId>,
    ) -> Self {
        let handle = thread::spawn(move || {
            if let Some(core) = core {
                if !core_affinity::set_for_current(core) {
                    log::warn!("worker {id} could not be pinned to core {}", core.id);
                }
            }
            profiler::set_thread_id(id + 1);
            log::debug!("worker {id} started");

            Worker::run_loop(id, &local_queue, &pool);

            profiler::collect_local_trace();
            log::debug!("worker {id} stopped");
        });

        Worker {
            id,
            handle: Some(handle),
        }
    }

    fn find_job(id: usize, local_queue: &Deque<JobHandle>, pool: &JobPool) -> Option<JobHandle> {
        if let Some(job) = local_queue.pop() {
            return Some(job);
        }

        loop {
            match pool.injector().steal_batch_and_pop(local_queue) {
                Steal::Success(job) => {
                    #[cfg(feature = "metrics")]
                    pool.metrics().injector_steals.fetch_add(1, Ordering::Relaxed);
                    return Some(job);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        let stealers = pool.stealers();
        let count = stealers.len();
        // Start at the next peer so victims are spread out.
        (1..count)
            .map(|offset| &stealers[(id + offset) % count])
            .find_map(|stealer| loop {
                match stealer.steal() {
                    Steal::Success(job) => {
                        #[cfg(feature = "metrics")]
                        pool.metrics().worker_steals.fetch_add(1, Ordering::Relaxed);
                        break Some(job);
                    }
                    Steal::Empty => break None,
                    Steal::Retry => continue,
                }
            })
    }

    fn run_loop(id: usize, local_queue: &Deque<JobHandle>, pool: &JobPool) {
        while !pool.is_shutting_down() {
            match Worker::find_job(id, local_queue, pool) {
                Some(job) => {
                    job.execute();
                }
                None => {
                    #[cfg(feature = "metrics")]
                    pool.metrics().idle_parks.fetch_add(1, Ordering::Relaxed);
                    pool.park_idle(IDLE_PARK_TIMEOUT);
                }
            }
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn join(&mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn core_for_worker(
    strategy: PinningStrategy,
    worker: usize,
    cores: &[core_affinity::CoreId],
) -> Option<core_affinity::CoreId> {
    if cores.is_empty() {
        return None;
    }
    match strategy {
        PinningStrategy::None => None,
        PinningStrategy::Linear => cores.get(worker % cores.len()).copied(),
        PinningStrategy::AvoidSMT => {
            // Even logical processors map to distinct physical cores on common SMT layouts.
            let physical: Vec<_> = cores.iter().copied().step_by(2).collect();
            physical.get(worker % physical.len()).copied()
        }
    }
}

/// Job system backed by a fixed pool of worker threads.
///
/// `max_concurrency()` reports the worker count. The thread blocked in
/// [`JobSystem::wait_for_jobs`] runs jobs as well, on top of that.
pub struct JobSystemThreadPool {
    pool: Arc<JobPool>,
    workers: Vec<Worker>,
}

impl JobSystemThreadPool {
    pub fn new(config: &JobSystemConfig) -> Self {
        let num_threads = config.num_threads;
        if config.record_trace {
            profiler::set_enabled(true);
        }

        let mut local_queues = Vec::with_capacity(num_threads);
        let mut stealers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            local_queues.push(deque);
        }

        let pool = JobPool::new(
            config.max_jobs,
            config.max_barriers,
            num_threads,
            stealers,
        );

        let cores = match config.pinning {
            PinningStrategy::None => Vec::new(),
            _ => core_affinity::get_core_ids().unwrap_or_default(),
        };
        let workers = local_queues
            .into_iter()
            .enumerate()
            .map(|(id, local_queue)| {
                let core = core_for_worker(config.pinning, id, &cores);
                Worker::spawn(id, local_queue, pool.clone(), core)
            })
            .collect();

        log::debug!(
            "job system started with {num_threads} worker(s), {} job slots, {} barrier slots",
            config.max_jobs,
            config.max_barriers
        );
        JobSystemThreadPool { pool, workers }
    }

    /// Convenience constructor with default capacities.
    pub fn with_threads(num_threads: usize) -> Self {
        Self::new(&JobSystemConfig {
            num_threads,
            ..JobSystemConfig::default()
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn stop(&mut self) -> Result<(), JobSystemError> {
        self.pool.begin_shutdown();

        let mut panicked = 0;
        for mut worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("worker {} panicked", worker.id());
                panicked += 1;
            }
        }

        // Queued handles point back at the pool; drop them so it can be freed.
        let discarded = self.pool.drain_ready();
        if discarded > 0 {
            log::warn!("{discarded} queued job(s) discarded at shutdown");
        }

        if panicked > 0 {
            Err(JobSystemError::WorkersPanicked { count: panicked })
        } else {
            Ok(())
        }
    }

    /// Stops every worker and waits for it to exit.
    ///
    /// Jobs still queued are discarded; wait on their barrier first.
    pub fn shutdown(mut self) -> Result<(), JobSystemError> {
        self.stop()
    }
}

impl JobSystem for JobSystemThreadPool {
    fn pool(&self) -> &Arc<JobPool> {
        &self.pool
    }
}

impl Drop for JobSystemThreadPool {
    fn drop(&mut self) {
        if self.workers.is_empty() && self.pool.is_shutting_down() {
            return;
        }
        if let Err(err) = self.stop() {
            log::error!("job system shutdown failed: {err}");
        }
    }
}
