//! # stepfiber - dependency-graph job system and parallel physics step scheduler
//!
//! A job system in which every job carries a dependency counter, plus a
//! per-update job-graph builder that uses it to run one physics update
//! across a pool of worker threads.
//!
//! ## Architecture
//!
//! - **Jobs**: arena-allocated units of work addressed by generation-checked
//!   ids and shared through reference-counted [`JobHandle`]s
//! - **Barriers**: wait-groups over a set of jobs that may keep growing while
//!   a thread waits on it
//! - **Job systems**: the [`JobSystem`] trait, with a work-stealing thread
//!   pool and a single-threaded implementation
//! - **Physics step**: [`physics::PhysicsSystem`] builds the whole
//!   multi-sub-step graph for one update, sizes each phase from the workload
//!   and spawns extra collision jobs on demand
//!
//! ## Example
//!
//! ```no_run
//! use stepfiber::{JobSystem, JobSystemThreadPool};
//!
//! let job_system = JobSystemThreadPool::with_threads(4);
//! let barrier = job_system.create_barrier().unwrap();
//!
//! let first = job_system
//!     .create_job("first", 0, Box::new(|| println!("runs first")))
//!     .unwrap();
//! let second = job_system
//!     .create_job("second", 1, Box::new(|| println!("runs second")))
//!     .unwrap();
//!
//! barrier.add_jobs(&[first.clone(), second.clone()]);
//! job_system.queue_job(&first);
//! // `second` becomes runnable once its single dependency is removed.
//! second.remove_dependency_and_queue(1);
//! job_system.wait_for_jobs(&barrier);
//! ```

pub mod active_mask;
pub mod allocator;
pub mod barrier;
pub mod completion;
pub mod error;
pub mod job;
pub mod job_system;
pub mod metrics;
pub mod physics;
pub mod profiler;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

pub use allocator::{HeapTempAllocator, LinearTempAllocator, ScratchSlice, TempAllocator};
pub use barrier::Barrier;
pub use error::{JobSystemError, StepError};
pub use job::{ExecuteOutcome, JobFunction, JobHandle, JobId, JobState};
pub use job_system::{JobPool, JobSystem, JobSystemConfig, JobSystemSingleThreaded};
pub use worker::JobSystemThreadPool;

#[cfg(test)]
mod tests;
