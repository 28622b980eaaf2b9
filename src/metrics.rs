#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional scheduler counters, enabled with the `metrics` feature.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Jobs whose work function ran to completion (or panicked).
    pub jobs_executed: AtomicU64,
    /// Single jobs pushed to the global queue.
    pub single_submissions: AtomicU64,
    /// Batched pushes to the global queue.
    pub batch_submissions: AtomicU64,
    /// Jobs a worker took from the global queue.
    pub injector_steals: AtomicU64,
    /// Jobs a worker stole from another worker's deque.
    pub worker_steals: AtomicU64,
    /// Jobs executed by a thread blocked in `wait_for_jobs`.
    pub waiter_executions: AtomicU64,
    /// Times a worker parked because no work was available.
    pub idle_parks: AtomicU64,
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_executed: AtomicU64::new(0),
            single_submissions: AtomicU64::new(0),
            batch_submissions: AtomicU64::new(0),
            injector_steals: AtomicU64::new(0),
            worker_steals: AtomicU64::new(0),
            waiter_executions: AtomicU64::new(0),
            idle_parks: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            single_submissions: self.single_submissions.load(Ordering::Relaxed),
            batch_submissions: self.batch_submissions.load(Ordering::Relaxed),
            injector_steals: self.injector_steals.load(Ordering::Relaxed),
            worker_steals: self.worker_steals.load(Ordering::Relaxed),
            waiter_executions: self.waiter_executions.load(Ordering::Relaxed),
            idle_parks: self.idle_parks.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Metrics`].
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_executed: u64,
    pub single_submissions: u64,
    pub batch_submissions: u64,
    pub injector_steals: u64,
    pub worker_steals: u64,
    pub waiter_executions: u64,
    pub idle_parks: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Share of executed jobs that ran on a waiting thread rather than a worker.
    pub fn waiter_share(&self) -> f64 {
        if self.jobs_executed == 0 {
            0.0
        } else {
            self.waiter_executions as f64 / self.jobs_executed as f64
        }
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use crate::job_system::{JobSystem, JobSystemSingleThreaded};

    #[test]
    fn test_metrics_creation() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.jobs_executed, 0);
        assert_eq!(snapshot.worker_steals, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
        assert_eq!(snapshot.waiter_share(), 0.0);
    }

    #[test]
    fn test_waiter_executions_are_counted() {
        let system = JobSystemSingleThreaded::new(8, 1);
        let barrier = system.create_barrier().unwrap();
        let jobs: Vec<_> = (0..3)
            .map(|_| system.create_job("noop", 0, Box::new(|| {})).unwrap())
            .collect();
        barrier.add_jobs(&jobs);
        system.queue_jobs(&jobs);
        system.wait_for_jobs(&barrier);

        let snapshot = system.pool().metrics().snapshot();
        assert_eq!(snapshot.jobs_executed, 3);
        assert_eq!(snapshot.waiter_executions, 3);
        assert_eq!(snapshot.batch_submissions, 1);
        assert_eq!(snapshot.waiter_share(), 1.0);
    }
}
