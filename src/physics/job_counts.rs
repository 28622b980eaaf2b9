//! Per-phase fan-out for one sub-step.
//!
//! Phases that run next to the find-collisions jobs leave two slots of the
//! concurrency budget for them; the rest may use all of it.

use super::settings::PhysicsSettings;

/// Number of jobs created for each parallel phase of a sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepJobCounts {
    pub max_concurrency: usize,
    pub apply_gravity: usize,
    pub determine_active_constraints: usize,
    pub setup_velocity_constraints: usize,
    /// Find-collisions jobs created up front; more may be spawned at runtime.
    pub find_collisions: usize,
    pub integrate_velocity: usize,
    pub solve_velocity: usize,
    pub solve_position: usize,
}

fn batches(items: usize, batch_size: usize) -> usize {
    items.div_ceil(batch_size.max(1))
}

impl StepJobCounts {
    /// `job_system_concurrency` is what the job system reports; the settings
    /// cap it further.
    pub fn compute(
        settings: &PhysicsSettings,
        job_system_concurrency: usize,
        num_active_bodies: usize,
        num_constraints: usize,
    ) -> Self {
        let max_concurrency = job_system_concurrency
            .min(settings.max_concurrency)
            .clamp(1, crate::active_mask::MAX_SLOTS);
        let shared = max_concurrency.saturating_sub(2);

        let apply_gravity = batches(num_active_bodies, settings.apply_gravity_batch_size)
            .min(shared)
            .max(1);
        let determine_active_constraints = batches(
            num_constraints,
            settings.determine_active_constraints_batch_size,
        )
        .min(shared)
        .max(1);
        let setup_velocity_constraints = batches(
            num_constraints,
            settings.setup_velocity_constraints_batch_size,
        )
        .min(max_concurrency)
        .max(1);
        let find_collisions_floor = if max_concurrency > 1 { 2 } else { 1 };
        let find_collisions = batches(num_active_bodies, settings.active_bodies_batch_size)
            .min(max_concurrency)
            .max(find_collisions_floor);
        let integrate_velocity = batches(num_active_bodies, settings.integrate_velocity_batch_size)
            .min(max_concurrency)
            .max(1);

        StepJobCounts {
            max_concurrency,
            apply_gravity,
            determine_active_constraints,
            setup_velocity_constraints,
            find_collisions,
            integrate_velocity,
            solve_velocity: max_concurrency,
            solve_position: max_concurrency,
        }
    }

    /// Jobs created per sub-step, excluding runtime-spawned find-collisions jobs.
    pub fn jobs_per_step(&self) -> usize {
        // BroadPhasePrepare, BuildIslands, FinalizeIslands, BodySetIslandIndex,
        // PreIntegrate, PostIntegrate, ResolveCcd, BroadPhaseFinalize and
        // StartNextStep or ContactRemovedCallbacks.
        const SINGLE_JOBS: usize = 9;
        SINGLE_JOBS
            + self.apply_gravity
            + self.determine_active_constraints
            + self.setup_velocity_constraints
            + self.find_collisions
            + self.integrate_velocity
            + self.solve_velocity
            + self.solve_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PhysicsSettings {
        PhysicsSettings::default()
    }

    #[test]
    fn test_single_thread_counts() {
        let counts = StepJobCounts::compute(&settings(), 1, 1000, 1000);
        assert_eq!(counts.max_concurrency, 1);
        assert_eq!(counts.apply_gravity, 1);
        assert_eq!(counts.determine_active_constraints, 1);
        assert_eq!(counts.find_collisions, 1);
        assert_eq!(counts.solve_velocity, 1);
    }

    #[test]
    fn test_counts_scale_with_workload() {
        let counts = StepJobCounts::compute(&settings(), 8, 100, 300);
        assert_eq!(counts.max_concurrency, 8);
        // ceil(100 / 16) = 7, capped at 8 - 2.
        assert_eq!(counts.apply_gravity, 6);
        // ceil(300 / 64) = 5.
        assert_eq!(counts.determine_active_constraints, 5);
        // ceil(300 / 256) = 2.
        assert_eq!(counts.setup_velocity_constraints, 2);
        assert_eq!(counts.find_collisions, 7);
        // ceil(100 / 64) = 2.
        assert_eq!(counts.integrate_velocity, 2);
    }

    #[test]
    fn test_find_collisions_floor_is_two_when_parallel() {
        let counts = StepJobCounts::compute(&settings(), 4, 1, 0);
        assert_eq!(counts.find_collisions, 2);
        assert_eq!(counts.determine_active_constraints, 1);
    }

    #[test]
    fn test_settings_cap_concurrency() {
        let mut capped = settings();
        capped.max_concurrency = 3;
        let counts = StepJobCounts::compute(&capped, 64, 10_000, 0);
        assert_eq!(counts.max_concurrency, 3);
        assert_eq!(counts.find_collisions, 3);
        assert_eq!(counts.apply_gravity, 1);
    }
}
