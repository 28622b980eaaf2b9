//! Construction of the per-update job graph and the bodies of its jobs.
//!
//! Every sub-step gets the same set of phases. Dependency counts follow the
//! edges below; "init" is 0 on the first sub-step and 1 on later ones, where
//! the previous sub-step's StartNextStep job releases it.
//!
//! ```text
//! BroadPhasePrepare ─────────────────────────────────┐
//! ApplyGravity ──▶ FindCollisions ─────┬─────────────▶ FinalizeIslands ──▶ BodySetIslandIndex ─┐
//! DetermineActiveConstraints ──▶ BuildIslands ──────┘          │                               │
//!                                  └──▶ SetupVelocity ──▶ SolveVelocity ◀─┘                     │
//! SolveVelocity ──▶ PreIntegrate ──▶ IntegrateVelocity ──▶ PostIntegrate ──▶ ResolveCcd ──▶ SolvePosition ◀─┘
//! FindCollisions, SolvePosition ──▶ BroadPhaseFinalize ──▶ StartNextStep | ContactRemovedCallbacks
//! ```
//!
//! FinalizeIslands also waits on a "finish building" dependency that is
//! released once the graph of every sub-step exists.

use super::spawner::create_find_collisions_job;
use super::step_context::{StepContext, StepJobs, UpdateContext};
use crate::error::JobSystemError;
use crate::job::JobHandle;
use std::sync::atomic::Ordering;

/// Releases the successors of a phase job when it goes out of scope.
///
/// Runs on unwind too, so a panicking phase still drains the graph; the
/// panic is recorded on the update and later phases skip their work.
struct ReleaseOnExit<'a, R: FnOnce(&UpdateContext, &StepContext)> {
    ctx: &'a UpdateContext,
    step: &'a StepContext,
    name: &'static str,
    release: Option<R>,
}

impl<R: FnOnce(&UpdateContext, &StepContext)> Drop for ReleaseOnExit<'_, R> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.ctx.record_panic(self.name, self.step.index);
        }
        if let Some(release) = self.release.take() {
            release(self.ctx, self.step);
        }
    }
}

/// Creates a job of `step` that runs `body`, then `release`.
///
/// `release` runs even if `body` panics, and alone once an earlier job of
/// the update has panicked.
pub(crate) fn step_job<F, R>(
    ctx: &UpdateContext,
    step: usize,
    name: &'static str,
    dependency_count: u32,
    body: F,
    release: R,
) -> Result<JobHandle, JobSystemError>
where
    F: FnOnce(&UpdateContext, &StepContext) + Send + 'static,
    R: FnOnce(&UpdateContext, &StepContext) + Send + 'static,
{
    let weak = ctx.weak_self.clone();
    ctx.pool.create_job(
        name,
        dependency_count,
        Box::new(move || {
            let Some(ctx) = weak.upgrade() else {
                log::debug!("job '{name}' of step {step} outlived its update");
                return;
            };
            let step_ctx = ctx.step(step);
            let _release = ReleaseOnExit {
                ctx: &*ctx,
                step: step_ctx,
                name,
                release: Some(release),
            };
            if ctx.has_panicked() {
                log::trace!("skipping job '{name}' of step {step}: update already failed");
                return;
            }
            body(&*ctx, step_ctx);
        }),
    )
}

type Phase = fn(&UpdateContext, &StepContext);

fn single(
    ctx: &UpdateContext,
    step: usize,
    name: &'static str,
    dependency_count: u32,
    (body, release): (Phase, Phase),
) -> Result<JobHandle, JobSystemError> {
    step_job(ctx, step, name, dependency_count, body, release)
}

fn fan_out(
    ctx: &UpdateContext,
    step: usize,
    name: &'static str,
    count: usize,
    dependency_count: u32,
    (body, release): (Phase, Phase),
) -> Result<Vec<JobHandle>, JobSystemError> {
    (0..count)
        .map(|_| step_job(ctx, step, name, dependency_count, body, release))
        .collect()
}

fn deps(count: usize) -> u32 {
    u32::try_from(count).unwrap_or_else(|_| panic!("dependency count {count} overflows"))
}

// Each phase pairs its work with the release of its successors.
const BROAD_PHASE_PREPARE: (Phase, Phase) = (broad_phase_prepare, release_finalize_islands);
const APPLY_GRAVITY: (Phase, Phase) = (apply_gravity, release_find_collisions);
const DETERMINE_ACTIVE_CONSTRAINTS: (Phase, Phase) =
    (determine_active_constraints, release_build_islands);
const BUILD_ISLANDS: (Phase, Phase) =
    (build_islands_from_constraints, release_after_build_islands);
const SETUP_VELOCITY: (Phase, Phase) = (setup_velocity_constraints, release_solve_velocity);
const FINALIZE_ISLANDS: (Phase, Phase) = (finalize_islands, release_after_finalize_islands);
const BODY_SET_ISLAND_INDEX: (Phase, Phase) = (body_set_island_index, release_solve_position);
const SOLVE_VELOCITY: (Phase, Phase) = (solve_velocity_constraints, release_pre_integrate);
const PRE_INTEGRATE: (Phase, Phase) = (pre_integrate_velocity, release_integrate_velocity);
const INTEGRATE_VELOCITY: (Phase, Phase) = (integrate_velocity, release_post_integrate);
const POST_INTEGRATE: (Phase, Phase) = (post_integrate_velocity, release_resolve_ccd);
const RESOLVE_CCD: (Phase, Phase) = (resolve_ccd_contacts, release_solve_position);
const SOLVE_POSITION: (Phase, Phase) = (solve_position_constraints, release_broad_phase_finalize);
const BROAD_PHASE_FINALIZE: (Phase, Phase) = (broad_phase_finalize, release_step_tail);
const START_NEXT_STEP: (Phase, Phase) = (arm_next_step, release_next_step);
const CONTACT_REMOVED_CALLBACKS: (Phase, Phase) = (contact_removed_callbacks, release_nothing);

/// Creates every job of `step` with its dependency count.
pub(crate) fn build_step(ctx: &UpdateContext, step: &StepContext) -> Result<StepJobs, JobSystemError> {
    let counts = &ctx.counts;
    let index = step.index;
    let init = u32::from(index > 0);

    let broad_phase_prepare = single(ctx, index, "BroadPhasePrepare", init, BROAD_PHASE_PREPARE)?;
    let apply_gravity = fan_out(ctx, index, "ApplyGravity", counts.apply_gravity, init, APPLY_GRAVITY)?;
    let determine_active_constraints = fan_out(
        ctx,
        index,
        "DetermineActiveConstraints",
        counts.determine_active_constraints,
        init,
        DETERMINE_ACTIVE_CONSTRAINTS,
    )?;
    let build_islands = single(
        ctx,
        index,
        "BuildIslandsFromConstraints",
        deps(counts.determine_active_constraints),
        BUILD_ISLANDS,
    )?;
    let setup_velocity = fan_out(
        ctx,
        index,
        "SetupVelocityConstraints",
        counts.setup_velocity_constraints,
        1,
        SETUP_VELOCITY,
    )?;
    let find_collisions = (0..counts.find_collisions)
        .map(|slot| create_find_collisions_job(ctx, index, slot, deps(counts.apply_gravity)))
        .collect::<Result<Vec<_>, _>>()?;
    // Find collisions, BroadPhasePrepare, BuildIslands and finish building.
    let finalize_islands = single(
        ctx,
        index,
        "FinalizeIslands",
        deps(counts.find_collisions + 3),
        FINALIZE_ISLANDS,
    )?;
    let body_set_island_index = single(ctx, index, "BodySetIslandIndex", 1, BODY_SET_ISLAND_INDEX)?;
    let solve_velocity = fan_out(
        ctx,
        index,
        "SolveVelocityConstraints",
        counts.solve_velocity,
        deps(1 + counts.setup_velocity_constraints),
        SOLVE_VELOCITY,
    )?;
    let pre_integrate = single(
        ctx,
        index,
        "PreIntegrateVelocity",
        deps(counts.solve_velocity),
        PRE_INTEGRATE,
    )?;
    let integrate_velocity = fan_out(
        ctx,
        index,
        "IntegrateVelocity",
        counts.integrate_velocity,
        1,
        INTEGRATE_VELOCITY,
    )?;
    let post_integrate = single(
        ctx,
        index,
        "PostIntegrateVelocity",
        deps(counts.integrate_velocity),
        POST_INTEGRATE,
    )?;
    let resolve_ccd = single(ctx, index, "ResolveCCDContacts", 1, RESOLVE_CCD)?;
    // ResolveCcd and BodySetIslandIndex.
    let solve_position = fan_out(
        ctx,
        index,
        "SolvePositionConstraints",
        counts.solve_position,
        2,
        SOLVE_POSITION,
    )?;
    let broad_phase_finalize = single(
        ctx,
        index,
        "BroadPhaseFinalize",
        deps(counts.find_collisions + counts.solve_position),
        BROAD_PHASE_FINALIZE,
    )?;
    let (start_next_step, contact_removed_callbacks) = if step.is_last {
        let callbacks = single(
            ctx,
            index,
            "ContactRemovedCallbacks",
            1,
            CONTACT_REMOVED_CALLBACKS,
        )?;
        (None, Some(callbacks))
    } else {
        (Some(single(ctx, index, "StartNextStep", 1, START_NEXT_STEP)?), None)
    };

    Ok(StepJobs {
        broad_phase_prepare,
        apply_gravity,
        determine_active_constraints,
        build_islands,
        setup_velocity,
        find_collisions,
        finalize_islands,
        body_set_island_index,
        solve_velocity,
        pre_integrate,
        integrate_velocity,
        post_integrate,
        resolve_ccd,
        solve_position,
        broad_phase_finalize,
        start_next_step,
        contact_removed_callbacks,
    })
}

fn broad_phase_prepare(ctx: &UpdateContext, _step: &StepContext) {
    ctx.world.broad_phase.prepare_update();
}

fn apply_gravity(ctx: &UpdateContext, step: &StepContext) {
    let batch_size = ctx.settings.apply_gravity_batch_size;
    while let Some(batch) = step.gravity_cursor.claim(batch_size, ctx.active_bodies.len()) {
        ctx.world
            .bodies
            .apply_gravity(&ctx.active_bodies[batch], ctx.settings.gravity, ctx.step_dt);
    }
}

fn determine_active_constraints(ctx: &UpdateContext, step: &StepContext) {
    let batch_size = ctx.settings.determine_active_constraints_batch_size;
    let bodies = &ctx.world.bodies;
    while let Some(batch) = step.constraint_cursor.claim(batch_size, ctx.num_constraints) {
        for constraint in batch {
            let constraint = constraint as u32;
            if bodies.is_constraint_active(constraint) {
                step.active_constraints.push(constraint);
            }
        }
    }
}

fn build_islands_from_constraints(ctx: &UpdateContext, step: &StepContext) {
    // Creation order depends on thread timing; solve order must not.
    step.active_constraints.sort();
    let active = step.active_constraints.to_vec();

    let islands = &ctx.world.islands;
    islands.prepare_non_contact_constraints(active.len());
    for &constraint in &active {
        let pair = ctx.world.bodies.constraint_bodies(constraint);
        islands.link_bodies(pair.a, pair.b);
        islands.link_constraint(constraint, pair.a, pair.b);
    }
}

fn setup_velocity_constraints(ctx: &UpdateContext, step: &StepContext) {
    let batch_size = ctx.settings.setup_velocity_constraints_batch_size;
    let len = step.active_constraints.len();
    while let Some(batch) = step.setup_velocity_cursor.claim(batch_size, len) {
        let constraints = step.active_constraints.get_range(batch);
        ctx.world
            .bodies
            .setup_velocity_constraints(&constraints, ctx.step_dt);
    }
}

fn finalize_islands(ctx: &UpdateContext, step: &StepContext) {
    let islands = &ctx.world.islands;
    islands.finalize(&ctx.active_bodies);
    log::trace!(
        "step {}: {} island(s) over {} active bodies",
        step.index,
        islands.num_islands(),
        ctx.active_bodies.len()
    );
}

fn body_set_island_index(ctx: &UpdateContext, _step: &StepContext) {
    let islands = &ctx.world.islands;
    for island in 0..islands.num_islands() {
        for body in islands.bodies_in_island(island) {
            ctx.world.bodies.set_island_index(body, island as u32);
        }
    }
}

fn sorted_island_contacts(ctx: &UpdateContext, island: usize) -> Vec<u32> {
    let mut contacts = ctx.world.islands.contacts_in_island(island);
    ctx.world.contacts.sort_contacts(&mut contacts);
    contacts
}

fn solve_velocity_constraints(ctx: &UpdateContext, step: &StepContext) {
    let world = &ctx.world;
    let num_islands = world.islands.num_islands();
    while let Some(islands) = step.solve_velocity_island.claim(1, num_islands) {
        for island in islands {
            let constraints = world.islands.constraints_in_island(island);
            let contacts = sorted_island_contacts(ctx, island);

            world.bodies.warm_start_constraints(&constraints);
            world
                .contacts
                .warm_start_velocity_constraints(&contacts, world.bodies.as_ref());
            for _ in 0..ctx.settings.num_velocity_steps {
                world.bodies.solve_velocity_constraints(&constraints, ctx.step_dt);
                world
                    .contacts
                    .solve_velocity_constraints(&contacts, world.bodies.as_ref(), ctx.step_dt);
            }
        }
    }
}

/// Fan-in point between the solver and integration: the solve jobs finish in
/// any order, and the integrate jobs are released together in one batch only
/// after the last of them, so no body moves while its velocity is solved.
fn pre_integrate_velocity(_ctx: &UpdateContext, step: &StepContext) {
    debug_assert_eq!(step.ccd_bodies.len(), 0);
}

fn integrate_velocity(ctx: &UpdateContext, step: &StepContext) {
    let batch_size = ctx.settings.integrate_velocity_batch_size;
    while let Some(batch) = step.integrate_cursor.claim(batch_size, ctx.active_bodies.len()) {
        ctx.world.bodies.integrate_velocities(
            &ctx.active_bodies[batch],
            ctx.step_dt,
            &mut |body| step.ccd_bodies.push(body),
        );
    }
}

fn post_integrate_velocity(_ctx: &UpdateContext, step: &StepContext) {
    step.ccd_bodies.sort();
}

fn resolve_ccd_contacts(ctx: &UpdateContext, step: &StepContext) {
    let bodies = step.ccd_bodies.to_vec();
    if !bodies.is_empty() {
        log::trace!("step {}: resolving CCD for {} bod(ies)", step.index, bodies.len());
        ctx.world.bodies.resolve_ccd(&bodies, ctx.step_dt);
    }
}

fn solve_position_constraints(ctx: &UpdateContext, step: &StepContext) {
    let world = &ctx.world;
    let num_islands = world.islands.num_islands();
    while let Some(islands) = step.solve_position_island.claim(1, num_islands) {
        for island in islands {
            let constraints = world.islands.constraints_in_island(island);
            let contacts = sorted_island_contacts(ctx, island);
            for _ in 0..ctx.settings.num_position_steps {
                world.bodies.solve_position_constraints(&constraints);
                world
                    .contacts
                    .solve_position_constraints(&contacts, world.bodies.as_ref());
            }
        }
    }
}

fn broad_phase_finalize(ctx: &UpdateContext, _step: &StepContext) {
    ctx.world.broad_phase.finalize_update();
}

fn arm_next_step(ctx: &UpdateContext, step: &StepContext) {
    ctx.arm_step(ctx.step(step.index + 1));
}

fn contact_removed_callbacks(ctx: &UpdateContext, _step: &StepContext) {
    ctx.world.contacts.finalize_contact_cache(
        ctx.num_body_pairs.load(Ordering::Relaxed),
        ctx.num_manifolds.load(Ordering::Relaxed),
    );
}

fn release_finalize_islands(_ctx: &UpdateContext, step: &StepContext) {
    step.jobs().finalize_islands.remove_dependency_and_queue(1);
}

fn release_find_collisions(_ctx: &UpdateContext, step: &StepContext) {
    JobHandle::remove_dependencies(&step.jobs().find_collisions, 1);
}

fn release_build_islands(_ctx: &UpdateContext, step: &StepContext) {
    step.jobs().build_islands.remove_dependency_and_queue(1);
}

fn release_after_build_islands(_ctx: &UpdateContext, step: &StepContext) {
    let jobs = step.jobs();
    JobHandle::remove_dependencies(&jobs.setup_velocity, 1);
    jobs.finalize_islands.remove_dependency_and_queue(1);
}

fn release_solve_velocity(_ctx: &UpdateContext, step: &StepContext) {
    JobHandle::remove_dependencies(&step.jobs().solve_velocity, 1);
}

fn release_after_finalize_islands(_ctx: &UpdateContext, step: &StepContext) {
    let jobs = step.jobs();
    jobs.body_set_island_index.remove_dependency_and_queue(1);
    JobHandle::remove_dependencies(&jobs.solve_velocity, 1);
}

fn release_solve_position(_ctx: &UpdateContext, step: &StepContext) {
    JobHandle::remove_dependencies(&step.jobs().solve_position, 1);
}

fn release_pre_integrate(_ctx: &UpdateContext, step: &StepContext) {
    step.jobs().pre_integrate.remove_dependency_and_queue(1);
}

fn release_integrate_velocity(_ctx: &UpdateContext, step: &StepContext) {
    JobHandle::remove_dependencies(&step.jobs().integrate_velocity, 1);
}

fn release_post_integrate(_ctx: &UpdateContext, step: &StepContext) {
    step.jobs().post_integrate.remove_dependency_and_queue(1);
}

fn release_resolve_ccd(_ctx: &UpdateContext, step: &StepContext) {
    step.jobs().resolve_ccd.remove_dependency_and_queue(1);
}

fn release_broad_phase_finalize(_ctx: &UpdateContext, step: &StepContext) {
    step.jobs().broad_phase_finalize.remove_dependency_and_queue(1);
}

fn release_step_tail(_ctx: &UpdateContext, step: &StepContext) {
    let jobs = step.jobs();
    if let Some(next) = &jobs.start_next_step {
        next.remove_dependency_and_queue(1);
    }
    if let Some(callbacks) = &jobs.contact_removed_callbacks {
        callbacks.remove_dependency_and_queue(1);
    }
}

fn release_next_step(ctx: &UpdateContext, step: &StepContext) {
    JobHandle::remove_dependencies(&ctx.step(step.index + 1).jobs().initial(), 1);
}

fn release_nothing(_ctx: &UpdateContext, _step: &StepContext) {}
