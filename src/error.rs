//! Error types for the job system and the physics step scheduler.
//!
//! Only recoverable conditions live here. Malformed graphs (over-released
//! dependencies, a second barrier attach, dependencies added to a running
//! job) are programming errors and panic at the call site.

use thiserror::Error;

/// Errors raised while creating jobs or barriers, or tearing down a pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobSystemError {
    /// Every job slot in the arena is in use.
    #[error("job pool exhausted: all {capacity} job slots are in use")]
    JobPoolExhausted { capacity: usize },

    /// Every barrier slot in the arena is in use.
    #[error("barrier pool exhausted: all {capacity} barrier slots are in use")]
    BarrierPoolExhausted { capacity: usize },

    /// One or more worker threads died while the pool was running.
    #[error("{count} worker thread(s) panicked")]
    WorkersPanicked { count: usize },
}

/// Fatal errors that prevent a physics update from being scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// `update` was called with zero collision sub-steps.
    #[error("an update needs at least one sub-step")]
    ZeroSubSteps,

    /// The scratch allocator could not provide the per-step buffers.
    #[error("scratch allocator exhausted: requested {requested} bytes, {available} available")]
    ScratchExhausted { requested: usize, available: usize },

    /// A job of the update panicked. The graph still drained, but the world
    /// may be partially stepped.
    #[error("job '{job}' of sub-step {step} panicked")]
    JobPanicked { job: &'static str, step: usize },

    /// The job system ran out of job or barrier slots while building the graph.
    #[error(transparent)]
    JobSystem(#[from] JobSystemError),
}
