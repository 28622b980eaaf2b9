use super::interfaces::{
    AllowAllLayers, BodyDynamics, BroadPhase, ContactManager, IslandBuilder, ObjectLayerPairFilter,
};
use super::job_counts::StepJobCounts;
use super::settings::PhysicsSettings;
use super::step_context::{StepContext, UpdateContext};
use super::step_graph::build_step;
use super::update_errors::{AtomicUpdateErrors, UpdateErrors};
use crate::allocator::TempAllocator;
use crate::error::StepError;
use crate::job::JobHandle;
use crate::job_system::JobSystem;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// The collaborators an update drives.
#[derive(Clone)]
pub struct Collaborators {
    pub broad_phase: Arc<dyn BroadPhase>,
    pub islands: Arc<dyn IslandBuilder>,
    pub contacts: Arc<dyn ContactManager>,
    pub bodies: Arc<dyn BodyDynamics>,
    pub layer_filter: Arc<dyn ObjectLayerPairFilter>,
}

impl Collaborators {
    pub fn new(
        broad_phase: Arc<dyn BroadPhase>,
        islands: Arc<dyn IslandBuilder>,
        contacts: Arc<dyn ContactManager>,
        bodies: Arc<dyn BodyDynamics>,
    ) -> Self {
        Collaborators {
            broad_phase,
            islands,
            contacts,
            bodies,
            layer_filter: Arc::new(AllowAllLayers),
        }
    }

    pub fn with_layer_filter(mut self, filter: Arc<dyn ObjectLayerPairFilter>) -> Self {
        self.layer_filter = filter;
        self
    }
}

/// Summary of the last update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStats {
    pub collision_steps: usize,
    pub active_bodies: usize,
    /// Jobs created while building the graph.
    pub jobs_created: usize,
    /// Find-collisions jobs added at runtime.
    pub find_collisions_spawned: usize,
    /// Most find-collisions jobs alive at once in one step.
    pub peak_find_collisions: usize,
    pub body_pairs: usize,
    pub manifolds: usize,
    pub errors: Option<UpdateErrors>,
    pub elapsed_ms: f64,
}

/// Runs physics updates as job graphs on a [`JobSystem`].
///
/// Updates are serialized: a second thread calling [`update`](Self::update)
/// blocks until the first one returns.
pub struct PhysicsSystem {
    settings: PhysicsSettings,
    job_system: Arc<dyn JobSystem>,
    world: Collaborators,
    updating: Mutex<UpdateStats>,
}

impl PhysicsSystem {
    pub fn new(
        mut settings: PhysicsSettings,
        job_system: Arc<dyn JobSystem>,
        world: Collaborators,
    ) -> Self {
        settings.sanitize();
        PhysicsSystem {
            settings,
            job_system,
            world,
            updating: Mutex::new(UpdateStats::default()),
        }
    }

    pub fn settings(&self) -> &PhysicsSettings {
        &self.settings
    }

    pub fn job_system(&self) -> &Arc<dyn JobSystem> {
        &self.job_system
    }

    pub fn last_update_stats(&self) -> UpdateStats {
        self.updating.lock().clone()
    }

    /// Advances the simulation by `delta_time`, split into `collision_steps`
    /// sub-steps, and blocks until every job of the update has finished.
    ///
    /// Soft capacity limits hit along the way are returned in `Ok`; the
    /// update still completes with whatever fit.
    pub fn update(
        &self,
        delta_time: f32,
        collision_steps: usize,
        allocator: &Arc<dyn TempAllocator>,
    ) -> Result<UpdateErrors, StepError> {
        let mut stats = self.updating.lock();
        if collision_steps == 0 {
            return Err(StepError::ZeroSubSteps);
        }
        let started = Instant::now();

        let active_bodies = self.world.bodies.active_bodies();
        // NaN and infinite steps are skipped like zero ones.
        if !(delta_time.is_finite() && delta_time > 0.0) || active_bodies.is_empty() {
            self.world.broad_phase.prepare_update();
            self.world.broad_phase.finalize_update();
            self.world.contacts.finalize_contact_cache(0, 0);
            *stats = UpdateStats {
                collision_steps,
                elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                errors: Some(UpdateErrors::empty()),
                ..UpdateStats::default()
            };
            log::debug!("update skipped: dt {delta_time}, {} active bodies", active_bodies.len());
            return Ok(UpdateErrors::empty());
        }

        let ctx = self.build_context(delta_time, collision_steps, active_bodies, allocator)?;
        let jobs_created = self.build_graph(&ctx)?;
        self.job_system.wait_for_jobs(&ctx.barrier);

        if let Some(&(job, step)) = ctx.panicked.get() {
            *stats = UpdateStats {
                collision_steps,
                active_bodies: ctx.active_bodies.len(),
                jobs_created,
                elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                ..UpdateStats::default()
            };
            return Err(StepError::JobPanicked { job, step });
        }

        let errors = ctx.errors.load();
        *stats = UpdateStats {
            collision_steps,
            active_bodies: ctx.active_bodies.len(),
            jobs_created,
            find_collisions_spawned: ctx.spawned_jobs.load(Ordering::Relaxed),
            peak_find_collisions: ctx.peak_find_collisions.load(Ordering::Relaxed),
            body_pairs: ctx.num_body_pairs.load(Ordering::Relaxed),
            manifolds: ctx.num_manifolds.load(Ordering::Relaxed),
            errors: Some(errors),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        if !errors.is_empty() {
            log::warn!("update hit capacity limits: {errors:?}");
        }
        log::debug!(
            "update finished in {:.3} ms: {} jobs, {} spawned, {} body pairs",
            stats.elapsed_ms,
            stats.jobs_created,
            stats.find_collisions_spawned,
            stats.body_pairs
        );
        Ok(errors)
    }

    fn build_context(
        &self,
        delta_time: f32,
        collision_steps: usize,
        active_bodies: Vec<u32>,
        allocator: &Arc<dyn TempAllocator>,
    ) -> Result<Arc<UpdateContext>, StepError> {
        let num_constraints = self.world.bodies.num_constraints();
        let counts = StepJobCounts::compute(
            &self.settings,
            self.job_system.max_concurrency(),
            active_bodies.len(),
            num_constraints,
        );
        log::debug!(
            "update: dt {delta_time}, {collision_steps} step(s), {} active bodies, {num_constraints} constraints, {counts:?}",
            active_bodies.len()
        );

        let steps = (0..collision_steps)
            .map(|index| {
                StepContext::new(
                    index,
                    index + 1 == collision_steps,
                    &counts,
                    &self.settings,
                    active_bodies.len(),
                    num_constraints,
                    allocator,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let barrier = self.job_system.create_barrier()?;

        Ok(Arc::new_cyclic(|weak_self| UpdateContext {
            weak_self: weak_self.clone(),
            settings: self.settings.clone(),
            world: self.world.clone(),
            pool: self.job_system.pool().clone(),
            barrier,
            counts,
            step_dt: delta_time / collision_steps as f32,
            active_bodies,
            num_constraints,
            steps,
            errors: AtomicUpdateErrors::new(),
            num_body_pairs: AtomicUsize::new(0),
            num_manifolds: AtomicUsize::new(0),
            spawned_jobs: AtomicUsize::new(0),
            peak_find_collisions: AtomicUsize::new(counts.find_collisions),
            panicked: OnceLock::new(),
        }))
    }

    /// Creates the jobs of every step, then starts the first step.
    fn build_graph(&self, ctx: &Arc<UpdateContext>) -> Result<usize, StepError> {
        for step in &ctx.steps {
            step.set_jobs(build_step(ctx, step)?);
        }

        let all: Vec<JobHandle> = ctx
            .steps
            .iter()
            .flat_map(|step| step.jobs().all().cloned())
            .collect();
        ctx.barrier.add_jobs(&all);

        let first = ctx.step(0);
        ctx.arm_step(first);
        self.job_system.queue_jobs(&first.jobs().initial());

        // Release the finish-building dependency of every step.
        let finalize_islands: Vec<JobHandle> = ctx
            .steps
            .iter()
            .map(|step| step.jobs().finalize_islands.clone())
            .collect();
        JobHandle::remove_dependencies(&finalize_islands, 1);

        Ok(all.len())
    }
}
