//! Collaborators the step scheduler drives.
//!
//! The scheduler decides *when* each piece of work runs and on which batch;
//! these traits do the work. Every method may be called concurrently from
//! several jobs, on disjoint batches unless stated otherwise, so
//! implementations synchronize internally.

use std::fmt;
use thiserror::Error;

pub type BodyId = u32;
pub type ObjectLayer = u16;
/// Handle returned by [`ContactManager::add_body_pair`].
pub type PairHandle = u32;

/// Two bodies proposed by the broad phase. `a` is always the lower id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyPair {
    pub a: BodyId,
    pub b: BodyId,
}

impl BodyPair {
    pub fn new(first: BodyId, second: BodyId) -> Self {
        BodyPair {
            a: first.min(second),
            b: first.max(second),
        }
    }

    pub fn pack(self) -> u64 {
        (u64::from(self.a) << 32) | u64::from(self.b)
    }

    pub fn unpack(packed: u64) -> Self {
        BodyPair {
            a: (packed >> 32) as BodyId,
            b: packed as BodyId,
        }
    }
}

impl fmt::Display for BodyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.a, self.b)
    }
}

/// Contact between the bodies of a pair. `normal` points from `a` to `b`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactManifold {
    pub normal: [f32; 3],
    /// Positive when overlapping, negative for a speculative contact.
    pub penetration_depth: f32,
    pub points: Vec<[f32; 3]>,
}

/// Why a contact could not be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContactCapacityError {
    #[error("manifold cache is full")]
    ManifoldCacheFull,
    #[error("contact constraint buffer is full")]
    ContactConstraintsFull,
}

/// Result of looking a pair up in the contact cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLookup {
    /// The cached manifold was reused; skip the narrow phase.
    pub handled: bool,
    /// Contact constraint created from the cached manifold.
    pub constraint: Option<u32>,
}

pub trait ObjectLayerPairFilter: Send + Sync {
    fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool;
}

/// Lets every layer collide with every other layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllLayers;

impl ObjectLayerPairFilter for AllowAllLayers {
    fn should_collide(&self, _a: ObjectLayer, _b: ObjectLayer) -> bool {
        true
    }
}

pub trait BroadPhase: Send + Sync {
    /// Runs once per sub-step before any pair query.
    fn prepare_update(&self);

    /// Reports candidate pairs for a batch of active bodies. Each pair must be
    /// reported by at most one body of the batch set.
    fn find_colliding_pairs(
        &self,
        bodies: &[BodyId],
        speculative_distance: f32,
        filter: &dyn ObjectLayerPairFilter,
        sink: &mut dyn FnMut(BodyPair),
    );

    /// Runs once per sub-step after every position solve.
    fn finalize_update(&self);
}

/// Groups bodies connected by constraints or contacts into islands.
pub trait IslandBuilder: Send + Sync {
    /// Forgets the islands of the previous step.
    fn reset_islands(&self);
    /// Starts a step over `active_bodies`.
    fn prepare(&self, active_bodies: &[BodyId]);
    fn prepare_contact_constraints(&self, max_contacts: usize);
    fn prepare_non_contact_constraints(&self, num_constraints: usize);
    /// Merges the islands of `a` and `b`. Bodies outside the active set are ignored.
    fn link_bodies(&self, a: BodyId, b: BodyId);
    /// Records `constraint` for the island of its active end. Does not merge;
    /// callers link the bodies separately.
    fn link_constraint(&self, constraint: u32, a: BodyId, b: BodyId);
    fn link_contact(&self, contact: u32, a: BodyId, b: BodyId);
    /// Builds the islands. Called once, after every link of the step.
    fn finalize(&self, active_bodies: &[BodyId]);
    fn num_islands(&self) -> usize;
    fn bodies_in_island(&self, island: usize) -> Vec<BodyId>;
    fn constraints_in_island(&self, island: usize) -> Vec<u32>;
    fn contacts_in_island(&self, island: usize) -> Vec<u32>;
}

/// Stores body pairs, manifolds and contact constraints for one update.
pub trait ContactManager: Send + Sync {
    /// Starts a sub-step: contact constraints of the previous sub-step are dropped.
    fn prepare_step(&self);
    fn max_contact_constraints(&self) -> usize;
    /// `None` when the body pair cache is full.
    fn add_body_pair(&self, pair: BodyPair) -> Option<PairHandle>;
    fn get_contacts_from_cache(&self, handle: PairHandle) -> CacheLookup;
    /// Stores `manifold` and creates a contact constraint for it.
    fn add_contact_constraint(
        &self,
        handle: PairHandle,
        manifold: &ContactManifold,
    ) -> Result<Option<u32>, ContactCapacityError>;
    /// Bodies of a contact constraint.
    fn contact_bodies(&self, contact: u32) -> BodyPair;
    /// Orders contacts independently of the order they were created in.
    fn sort_contacts(&self, contacts: &mut [u32]);
    fn warm_start_velocity_constraints(&self, contacts: &[u32], dynamics: &dyn BodyDynamics);
    fn solve_velocity_constraints(&self, contacts: &[u32], dynamics: &dyn BodyDynamics, dt: f32);
    fn solve_position_constraints(&self, contacts: &[u32], dynamics: &dyn BodyDynamics);
    /// Ends the update: manifolds not refreshed this update are removed.
    fn finalize_contact_cache(&self, num_body_pairs: usize, num_manifolds: usize);
}

/// Rigid-body state and constraint math.
pub trait BodyDynamics: Send + Sync {
    /// Ids of the bodies simulated this update, ascending.
    fn active_bodies(&self) -> Vec<BodyId>;
    fn num_constraints(&self) -> usize;
    fn apply_gravity(&self, bodies: &[BodyId], gravity: [f32; 3], dt: f32);
    fn is_constraint_active(&self, constraint: u32) -> bool;
    fn constraint_bodies(&self, constraint: u32) -> BodyPair;
    fn setup_velocity_constraints(&self, constraints: &[u32], dt: f32);
    /// Narrow phase. `None` when the bodies are farther apart than `speculative_distance`.
    fn collide(&self, pair: BodyPair, speculative_distance: f32) -> Option<ContactManifold>;
    fn set_island_index(&self, body: BodyId, island: u32);
    fn warm_start_constraints(&self, constraints: &[u32]);
    fn solve_velocity_constraints(&self, constraints: &[u32], dt: f32);
    /// Integrates a batch. Bodies that need continuous collision detection
    /// are reported through `ccd`.
    fn integrate_velocities(&self, bodies: &[BodyId], dt: f32, ccd: &mut dyn FnMut(BodyId));
    /// Resolves the bodies reported during integration. `bodies` is sorted.
    fn resolve_ccd(&self, bodies: &[BodyId], dt: f32);
    fn solve_position_constraints(&self, constraints: &[u32]);
    fn apply_contact_impulse(&self, pair: BodyPair, normal: [f32; 3], impulse: f32);
    /// Solves one contact and updates its accumulated normal impulse.
    fn solve_contact_velocity(
        &self,
        pair: BodyPair,
        manifold: &ContactManifold,
        accumulated_impulse: &mut f32,
        dt: f32,
    );
    fn solve_contact_position(&self, pair: BodyPair, manifold: &ContactManifold);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_ordered_and_packs() {
        let pair = BodyPair::new(9, 2);
        assert_eq!(pair, BodyPair { a: 2, b: 9 });
        assert_eq!(BodyPair::unpack(pair.pack()), pair);
        assert_eq!(BodyPair::unpack(BodyPair::new(u32::MAX, 0).pack()).b, u32::MAX);
    }
}
