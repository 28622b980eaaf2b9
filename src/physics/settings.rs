use serde::{Deserialize, Serialize};

/// Tuning knobs for [`PhysicsSystem::update`](super::PhysicsSystem::update).
///
/// Batch sizes decide how finely each parallel phase is split; the limits
/// bound the per-update scratch memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsSettings {
    /// Body pairs that can be queued between broad and narrow phase, summed
    /// over all per-job queues.
    pub max_in_flight_body_pairs: usize,
    pub apply_gravity_batch_size: usize,
    /// Active bodies claimed at once by a find-collisions job.
    pub active_bodies_batch_size: usize,
    pub determine_active_constraints_batch_size: usize,
    pub setup_velocity_constraints_batch_size: usize,
    pub integrate_velocity_batch_size: usize,
    /// Queued body pairs that justify one extra find-collisions job.
    pub narrow_phase_batch_size: usize,
    pub speculative_contact_distance: f32,
    pub num_velocity_steps: u32,
    pub num_position_steps: u32,
    /// Upper bound on parallel jobs per phase, at most 32.
    pub max_concurrency: usize,
    pub gravity: [f32; 3],
}

impl Default for PhysicsSettings {
    fn default() -> Self {
        Self {
            max_in_flight_body_pairs: 16384,
            apply_gravity_batch_size: 16,
            active_bodies_batch_size: 16,
            determine_active_constraints_batch_size: 64,
            setup_velocity_constraints_batch_size: 256,
            integrate_velocity_batch_size: 64,
            narrow_phase_batch_size: 16,
            speculative_contact_distance: 0.02,
            num_velocity_steps: 10,
            num_position_steps: 2,
            max_concurrency: 32,
            gravity: [0.0, -9.81, 0.0],
        }
    }
}

impl PhysicsSettings {
    /// Parses settings from JSON. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let mut settings: Self = serde_json::from_str(json)?;
        settings.sanitize();
        Ok(settings)
    }

    /// Clamps values that would make the scheduler divide by zero or overflow the job mask.
    pub fn sanitize(&mut self) {
        for batch in [
            &mut self.apply_gravity_batch_size,
            &mut self.active_bodies_batch_size,
            &mut self.determine_active_constraints_batch_size,
            &mut self.setup_velocity_constraints_batch_size,
            &mut self.integrate_velocity_batch_size,
            &mut self.narrow_phase_batch_size,
        ] {
            *batch = (*batch).max(1);
        }
        self.max_concurrency = self.max_concurrency.clamp(1, crate::active_mask::MAX_SLOTS);
        self.max_in_flight_body_pairs = self.max_in_flight_body_pairs.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = PhysicsSettings::from_json_str(
            r#"{ "max_in_flight_body_pairs": 64, "num_velocity_steps": 4 }"#,
        )
        .unwrap();
        assert_eq!(settings.max_in_flight_body_pairs, 64);
        assert_eq!(settings.num_velocity_steps, 4);
        assert_eq!(settings.active_bodies_batch_size, 16);
        assert_eq!(settings.gravity, [0.0, -9.81, 0.0]);
    }

    #[test]
    fn test_sanitize_clamps_degenerate_values() {
        let settings = PhysicsSettings::from_json_str(
            r#"{ "narrow_phase_batch_size": 0, "max_concurrency": 100 }"#,
        )
        .unwrap();
        assert_eq!(settings.narrow_phase_batch_size, 1);
        assert_eq!(settings.max_concurrency, 32);
    }
}
