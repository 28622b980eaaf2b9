//! State shared by the jobs of one update.
//!
//! An [`UpdateContext`] is built at the start of `PhysicsSystem::update` and
//! dropped when it returns. Jobs refer to it weakly: the updating thread owns
//! the only strong reference, so a graph that fails to build is torn down by
//! dropping the context, and no job ever keeps it alive.

use super::body_pair_queue::BodyPairQueues;
use super::interfaces::BodyId;
use super::job_counts::StepJobCounts;
use super::settings::PhysicsSettings;
use super::spawner::initial_mask;
use super::system::Collaborators;
use super::update_errors::AtomicUpdateErrors;
use crate::active_mask::ActiveJobMask;
use crate::allocator::{ScratchSlice, TempAllocator};
use crate::barrier::Barrier;
use crate::error::StepError;
use crate::job::JobHandle;
use crate::job_system::JobPool;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Handles of every job in one sub-step.
pub(crate) struct StepJobs {
    pub broad_phase_prepare: JobHandle,
    pub apply_gravity: Vec<JobHandle>,
    pub determine_active_constraints: Vec<JobHandle>,
    pub build_islands: JobHandle,
    pub setup_velocity: Vec<JobHandle>,
    pub find_collisions: Vec<JobHandle>,
    pub finalize_islands: JobHandle,
    pub body_set_island_index: JobHandle,
    pub solve_velocity: Vec<JobHandle>,
    pub pre_integrate: JobHandle,
    pub integrate_velocity: Vec<JobHandle>,
    pub post_integrate: JobHandle,
    pub resolve_ccd: JobHandle,
    pub solve_position: Vec<JobHandle>,
    pub broad_phase_finalize: JobHandle,
    /// Present on every step but the last.
    pub start_next_step: Option<JobHandle>,
    /// Present on the last step only.
    pub contact_removed_callbacks: Option<JobHandle>,
}

impl StepJobs {
    /// Jobs that wait on the previous step (or nothing, on the first step).
    pub fn initial(&self) -> Vec<JobHandle> {
        let mut jobs = Vec::with_capacity(
            1 + self.apply_gravity.len() + self.determine_active_constraints.len(),
        );
        jobs.push(self.broad_phase_prepare.clone());
        jobs.extend(self.apply_gravity.iter().cloned());
        jobs.extend(self.determine_active_constraints.iter().cloned());
        jobs
    }

    /// The two jobs that wait on every find-collisions job.
    pub fn collision_fan_in(&self) -> [JobHandle; 2] {
        [
            self.finalize_islands.clone(),
            self.broad_phase_finalize.clone(),
        ]
    }

    pub fn all(&self) -> impl Iterator<Item = &JobHandle> + '_ {
        std::iter::once(&self.broad_phase_prepare)
            .chain(&self.apply_gravity)
            .chain(&self.determine_active_constraints)
            .chain(std::iter::once(&self.build_islands))
            .chain(&self.setup_velocity)
            .chain(&self.find_collisions)
            .chain(std::iter::once(&self.finalize_islands))
            .chain(std::iter::once(&self.body_set_island_index))
            .chain(&self.solve_velocity)
            .chain(std::iter::once(&self.pre_integrate))
            .chain(&self.integrate_velocity)
            .chain(std::iter::once(&self.post_integrate))
            .chain(std::iter::once(&self.resolve_ccd))
            .chain(&self.solve_position)
            .chain(std::iter::once(&self.broad_phase_finalize))
            .chain(self.start_next_step.iter())
            .chain(self.contact_removed_callbacks.iter())
    }
}

/// Claim-based work splitting over `0..len` in fixed-size batches.
#[derive(Default)]
pub(crate) struct BatchCursor(AtomicUsize);

impl BatchCursor {
    pub fn claim(&self, batch_size: usize, len: usize) -> Option<Range<usize>> {
        let start = self.0.fetch_add(batch_size, Ordering::Relaxed);
        (start < len).then(|| start..(start + batch_size).min(len))
    }

    /// Items in `0..len` nobody has claimed yet.
    pub fn unclaimed(&self, len: usize) -> usize {
        len.saturating_sub(self.0.load(Ordering::Relaxed))
    }
}

/// Append-only list of ids filled concurrently, then sorted by one job.
pub(crate) struct IdList {
    ids: ScratchSlice<AtomicU32>,
    len: AtomicUsize,
}

impl IdList {
    fn new(allocator: &Arc<dyn TempAllocator>, capacity: usize) -> Result<Self, StepError> {
        Ok(IdList {
            ids: ScratchSlice::new(allocator, capacity)?,
            len: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, id: u32) {
        let index = self.len.fetch_add(1, Ordering::Relaxed);
        assert!(index < self.ids.len(), "id list overflow at {index}");
        self.ids[index].store(id, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(self.ids.len())
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.ids[..self.len()]
            .iter()
            .map(|id| id.load(Ordering::Relaxed))
            .collect()
    }

    pub fn get_range(&self, range: Range<usize>) -> Vec<u32> {
        self.ids[range]
            .iter()
            .map(|id| id.load(Ordering::Relaxed))
            .collect()
    }

    /// Sorts the pushed ids. Only one thread may call this, after every push.
    pub fn sort(&self) {
        let mut sorted = self.to_vec();
        sorted.sort_unstable();
        for (slot, id) in self.ids.iter().zip(sorted) {
            slot.store(id, Ordering::Relaxed);
        }
    }
}

/// Per-sub-step descriptor.
pub(crate) struct StepContext {
    pub index: usize,
    pub is_last: bool,
    jobs: OnceLock<StepJobs>,
    pub gravity_cursor: BatchCursor,
    pub active_body_cursor: BatchCursor,
    pub constraint_cursor: BatchCursor,
    pub setup_velocity_cursor: BatchCursor,
    pub integrate_cursor: BatchCursor,
    pub solve_velocity_island: BatchCursor,
    pub solve_position_island: BatchCursor,
    pub active_constraints: IdList,
    pub ccd_bodies: IdList,
    pub active_find_collisions: ActiveJobMask,
    pub pair_queues: BodyPairQueues,
}

impl StepContext {
    pub fn new(
        index: usize,
        is_last: bool,
        counts: &StepJobCounts,
        settings: &PhysicsSettings,
        num_active_bodies: usize,
        num_constraints: usize,
        allocator: &Arc<dyn TempAllocator>,
    ) -> Result<Self, StepError> {
        Ok(StepContext {
            index,
            is_last,
            jobs: OnceLock::new(),
            gravity_cursor: BatchCursor::default(),
            active_body_cursor: BatchCursor::default(),
            constraint_cursor: BatchCursor::default(),
            setup_velocity_cursor: BatchCursor::default(),
            integrate_cursor: BatchCursor::default(),
            solve_velocity_island: BatchCursor::default(),
            solve_position_island: BatchCursor::default(),
            active_constraints: IdList::new(allocator, num_constraints)?,
            ccd_bodies: IdList::new(allocator, num_active_bodies)?,
            active_find_collisions: initial_mask(counts),
            pair_queues: BodyPairQueues::new(
                allocator,
                counts.max_concurrency,
                settings.max_in_flight_body_pairs,
            )?,
        })
    }

    /// # Panics
    ///
    /// Panics if called before the step's jobs were created.
    pub fn jobs(&self) -> &StepJobs {
        self.jobs
            .get()
            .unwrap_or_else(|| panic!("jobs of step {} used before they were created", self.index))
    }

    pub fn set_jobs(&self, jobs: StepJobs) {
        if self.jobs.set(jobs).is_err() {
            panic!("jobs of step {} created twice", self.index);
        }
    }
}

/// Everything one `update` call shares with its jobs.
pub(crate) struct UpdateContext {
    pub weak_self: Weak<UpdateContext>,
    pub settings: PhysicsSettings,
    pub world: Collaborators,
    pub pool: Arc<JobPool>,
    pub barrier: Barrier,
    pub counts: StepJobCounts,
    pub step_dt: f32,
    pub active_bodies: Vec<BodyId>,
    pub num_constraints: usize,
    pub steps: Vec<StepContext>,
    pub errors: AtomicUpdateErrors,
    pub num_body_pairs: AtomicUsize,
    pub num_manifolds: AtomicUsize,
    /// Find-collisions jobs spawned at runtime, over all steps.
    pub spawned_jobs: AtomicUsize,
    /// Most find-collisions jobs alive at once in any step.
    pub peak_find_collisions: AtomicUsize,
    /// First job that panicked, with its step.
    pub panicked: OnceLock<(&'static str, usize)>,
}

impl UpdateContext {
    pub fn step(&self, index: usize) -> &StepContext {
        &self.steps[index]
    }

    /// Marks the update as failed. Only the first panic is kept.
    pub fn record_panic(&self, job: &'static str, step: usize) {
        if self.panicked.set((job, step)).is_ok() {
            log::error!("job '{job}' of step {step} panicked; skipping the rest of the update");
        }
    }

    pub fn has_panicked(&self) -> bool {
        self.panicked.get().is_some()
    }

    /// Prepares the island builder and contact manager for `step`.
    pub fn arm_step(&self, step: &StepContext) {
        let islands = &self.world.islands;
        islands.reset_islands();
        islands.prepare(&self.active_bodies);
        islands.prepare_contact_constraints(self.world.contacts.max_contact_constraints());
        self.world.contacts.prepare_step();
        log::trace!("armed step {}", step.index);
    }
}
