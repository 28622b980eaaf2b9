//! Find-collisions jobs and the spawner that adds more of them at runtime.
//!
//! A find-collisions job alternates between claiming batches of active
//! bodies for the broad phase and running the narrow phase on queued body
//! pairs. While it produces more pairs than it can consume, it asks the
//! spawner for help. Every live find-collisions job owns one bit of the
//! step's [`ActiveJobMask`] and one dependency on each of the two jobs that
//! wait for the phase to end (FinalizeIslands and BroadPhaseFinalize).

use super::interfaces::{BodyPair, ContactCapacityError};
use super::job_counts::StepJobCounts;
use super::step_context::{StepContext, UpdateContext};
use super::step_graph::step_job;
use super::update_errors::UpdateErrors;
use crate::active_mask::{ActiveJobMask, Claim};
use crate::error::JobSystemError;
use crate::job::JobHandle;
use std::sync::atomic::Ordering;

/// Mask for a fresh step: the initial find-collisions jobs own the low slots.
pub(crate) fn initial_mask(counts: &StepJobCounts) -> ActiveJobMask {
    ActiveJobMask::with_initial(counts.max_concurrency, counts.find_collisions)
}

/// Number of find-collisions jobs the current backlog justifies.
pub(crate) fn desired_find_collision_jobs(
    ctx: &UpdateContext,
    step: &StepContext,
) -> usize {
    let settings = &ctx.settings;
    let backlog = step.pair_queues.backlog();
    let unclaimed = step.active_body_cursor.unclaimed(ctx.active_bodies.len());
    let wanted = backlog.div_ceil(settings.narrow_phase_batch_size)
        + unclaimed.div_ceil(settings.active_bodies_batch_size);
    wanted.min(ctx.counts.max_concurrency)
}

pub(crate) fn create_find_collisions_job(
    ctx: &UpdateContext,
    step: usize,
    slot: usize,
    dependency_count: u32,
) -> Result<JobHandle, JobSystemError> {
    step_job(
        ctx,
        step,
        "FindCollisions",
        dependency_count,
        move |ctx, step| find_collisions(ctx, step, slot),
        move |_ctx, step| leave_find_collisions(step, slot),
    )
}

/// Spawns at most one extra find-collisions job. Returns the claimed slot.
///
/// Must be called from a live find-collisions job of `step`, whose own
/// dependencies keep the fan-in jobs from starting meanwhile.
pub(crate) fn try_spawn_find_collisions(ctx: &UpdateContext, step: &StepContext) -> Option<usize> {
    let desired = desired_find_collision_jobs(ctx, step);
    let slot = match step.active_find_collisions.try_claim_below(desired) {
        Claim::Claimed(slot) => slot,
        Claim::Contended | Claim::Saturated => return None,
    };

    let fan_in = step.jobs().collision_fan_in();
    for job in &fan_in {
        job.add_dependency(1);
    }

    match create_find_collisions_job(ctx, step.index, slot, 0) {
        Ok(job) => {
            ctx.barrier.add_job(&job);
            ctx.pool.queue_job(job);
            ctx.spawned_jobs.fetch_add(1, Ordering::Relaxed);
            ctx.peak_find_collisions
                .fetch_max(step.active_find_collisions.count(), Ordering::Relaxed);
            log::trace!(
                "step {}: spawned find-collisions job in slot {slot} (desired {desired})",
                step.index
            );
            Some(slot)
        }
        Err(err) => {
            step.active_find_collisions.release(slot);
            for job in &fan_in {
                job.remove_dependency(1);
            }
            log::warn!("step {}: could not spawn find-collisions job: {err}", step.index);
            None
        }
    }
}

/// Job body of a find-collisions job owning `slot` of the step's mask.
pub(crate) fn find_collisions(ctx: &UpdateContext, step: &StepContext, slot: usize) {
    let settings = &ctx.settings;
    let queues = &step.pair_queues;
    let num_active = ctx.active_bodies.len();

    loop {
        // Keep our own queue short first; it is the only one we feed.
        if let Some(pair) = queues.pop(slot) {
            process_body_pair(ctx, pair);
            continue;
        }

        if let Some(batch) = step
            .active_body_cursor
            .claim(settings.active_bodies_batch_size, num_active)
        {
            ctx.world.broad_phase.find_colliding_pairs(
                &ctx.active_bodies[batch],
                settings.speculative_contact_distance,
                ctx.world.layer_filter.as_ref(),
                &mut |pair| match queues.push(slot, pair) {
                    Ok(()) => {
                        if queues.len(slot) >= settings.narrow_phase_batch_size {
                            try_spawn_find_collisions(ctx, step);
                        }
                    }
                    Err(pair) => process_body_pair(ctx, pair),
                },
            );
            if queues.backlog() > 0 || step.active_body_cursor.unclaimed(num_active) > 0 {
                try_spawn_find_collisions(ctx, step);
            }
            continue;
        }

        if let Some(pair) = queues.pop_any(slot) {
            process_body_pair(ctx, pair);
            continue;
        }

        break;
    }
}

/// Gives up `slot` and this job's share of the fan-in dependencies.
fn leave_find_collisions(step: &StepContext, slot: usize) {
    step.active_find_collisions.release(slot);
    JobHandle::remove_dependencies(&step.jobs().collision_fan_in(), 1);
}

/// Runs the narrow phase for one pair and records the resulting contact.
pub(crate) fn process_body_pair(ctx: &UpdateContext, pair: BodyPair) {
    let world = &ctx.world;
    ctx.num_body_pairs.fetch_add(1, Ordering::Relaxed);

    let Some(handle) = world.contacts.add_body_pair(pair) else {
        ctx.errors.raise(UpdateErrors::BODY_PAIR_CACHE_FULL);
        return;
    };

    let cached = world.contacts.get_contacts_from_cache(handle);
    if cached.handled {
        ctx.num_manifolds.fetch_add(1, Ordering::Relaxed);
        if let Some(contact) = cached.constraint {
            world.islands.link_bodies(pair.a, pair.b);
            world.islands.link_contact(contact, pair.a, pair.b);
        }
        return;
    }

    let Some(manifold) = world
        .bodies
        .collide(pair, ctx.settings.speculative_contact_distance)
    else {
        return;
    };
    ctx.num_manifolds.fetch_add(1, Ordering::Relaxed);

    match world.contacts.add_contact_constraint(handle, &manifold) {
        Ok(Some(contact)) => {
            world.islands.link_bodies(pair.a, pair.b);
            world.islands.link_contact(contact, pair.a, pair.b);
        }
        Ok(None) => {}
        Err(ContactCapacityError::ManifoldCacheFull) => {
            ctx.errors.raise(UpdateErrors::MANIFOLD_CACHE_FULL)
        }
        Err(ContactCapacityError::ContactConstraintsFull) => {
            ctx.errors.raise(UpdateErrors::CONTACT_CONSTRAINTS_FULL)
        }
    }
}
