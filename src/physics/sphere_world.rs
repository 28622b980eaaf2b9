//! A small world of spheres and distance constraints.
//!
//! Enough physics to drive every phase of the step graph: a brute-force
//! broad phase, sphere-sphere narrow phase, sequential impulses for contacts
//! and distance constraints, and swept-sphere CCD for fast bodies. Bodies
//! with zero inverse mass are static and never simulated.

use super::interfaces::{
    BodyDynamics, BodyId, BodyPair, BroadPhase, ContactManager, ContactManifold, ObjectLayer,
    ObjectLayerPairFilter,
};
use super::island_builder::UnionFindIslandBuilder;
use super::system::Collaborators;
use glam::Vec3;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const POSITION_BAUMGARTE: f32 = 0.2;
const PENETRATION_SLOP: f32 = 0.005;
const NO_ISLAND: u32 = u32::MAX;

/// Unit vector from `from` to `to`, or up when the points coincide.
fn direction(from: Vec3, to: Vec3) -> (Vec3, f32) {
    let delta = to - from;
    let len = delta.length();
    if len > 1.0e-6 {
        (delta / len, len)
    } else {
        (Vec3::Y, len)
    }
}

/// Initial state of one sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphereDesc {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub radius: f32,
    /// Zero makes the sphere static.
    pub inv_mass: f32,
    pub layer: ObjectLayer,
}

impl Default for SphereDesc {
    fn default() -> Self {
        SphereDesc {
            position: [0.0; 3],
            velocity: [0.0; 3],
            radius: 0.5,
            inv_mass: 1.0,
            layer: 0,
        }
    }
}

impl SphereDesc {
    pub fn dynamic(position: [f32; 3], radius: f32) -> Self {
        SphereDesc {
            position,
            radius,
            ..SphereDesc::default()
        }
    }

    pub fn fixed(position: [f32; 3], radius: f32) -> Self {
        SphereDesc {
            position,
            radius,
            inv_mass: 0.0,
            ..SphereDesc::default()
        }
    }

    pub fn with_velocity(mut self, velocity: [f32; 3]) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_layer(mut self, layer: ObjectLayer) -> Self {
        self.layer = layer;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Shape {
    radius: f32,
    inv_mass: f32,
    layer: ObjectLayer,
}

impl Shape {
    fn is_static(&self) -> bool {
        self.inv_mass == 0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    position: Vec3,
    velocity: Vec3,
    island: u32,
}

#[derive(Debug, Default)]
struct ConstraintState {
    axis: Vec3,
    effective_mass: f32,
    impulse: f32,
}

struct DistanceConstraint {
    pair: BodyPair,
    rest_length: f32,
    state: Mutex<ConstraintState>,
}

pub struct SphereWorld {
    shapes: Vec<Shape>,
    motions: Vec<Mutex<Motion>>,
    constraints: Vec<DistanceConstraint>,
    broad_phase_updates: AtomicUsize,
}

impl SphereWorld {
    pub fn new(spheres: &[SphereDesc]) -> Self {
        SphereWorld {
            shapes: spheres
                .iter()
                .map(|desc| Shape {
                    radius: desc.radius,
                    inv_mass: desc.inv_mass.max(0.0),
                    layer: desc.layer,
                })
                .collect(),
            motions: spheres
                .iter()
                .map(|desc| {
                    Mutex::new(Motion {
                        position: Vec3::from(desc.position),
                        velocity: if desc.inv_mass > 0.0 {
                            Vec3::from(desc.velocity)
                        } else {
                            Vec3::ZERO
                        },
                        island: NO_ISLAND,
                    })
                })
                .collect(),
            constraints: Vec::new(),
            broad_phase_updates: AtomicUsize::new(0),
        }
    }

    /// Ties two bodies at their current distance. Returns the constraint index.
    pub fn add_distance_constraint(&mut self, a: BodyId, b: BodyId) -> u32 {
        assert_ne!(a, b, "a constraint needs two different bodies");
        let rest_length = self.motion_position(b).distance(self.motion_position(a));
        self.constraints.push(DistanceConstraint {
            pair: BodyPair::new(a, b),
            rest_length,
            state: Mutex::new(ConstraintState::default()),
        });
        (self.constraints.len() - 1) as u32
    }

    pub fn num_bodies(&self) -> usize {
        self.shapes.len()
    }

    pub fn position(&self, body: BodyId) -> [f32; 3] {
        self.motion_position(body).to_array()
    }

    pub fn velocity(&self, body: BodyId) -> [f32; 3] {
        self.motions[body as usize].lock().velocity.to_array()
    }

    fn motion_position(&self, body: BodyId) -> Vec3 {
        self.motions[body as usize].lock().position
    }

    /// Island of `body` in the last step, if it was simulated.
    pub fn island_index(&self, body: BodyId) -> Option<u32> {
        let island = self.motions[body as usize].lock().island;
        (island != NO_ISLAND).then_some(island)
    }

    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.motions.iter().map(|motion| motion.lock().position.to_array()).collect()
    }

    /// Sub-steps the broad phase has finished.
    pub fn broad_phase_updates(&self) -> usize {
        self.broad_phase_updates.load(Ordering::Relaxed)
    }

    /// Wires this world into a [`Collaborators`] set with a fresh island builder.
    pub fn collaborators(self: &Arc<Self>, contacts: Arc<dyn ContactManager>) -> Collaborators {
        Collaborators::new(
            self.clone(),
            Arc::new(UnionFindIslandBuilder::new(self.num_bodies())),
            contacts,
            self.clone(),
        )
    }

    fn lock_pair(&self, pair: BodyPair) -> (MutexGuard<'_, Motion>, MutexGuard<'_, Motion>) {
        debug_assert!(pair.a < pair.b);
        let a = self.motions[pair.a as usize].lock();
        let b = self.motions[pair.b as usize].lock();
        (a, b)
    }

    fn inv_masses(&self, pair: BodyPair) -> (f32, f32) {
        (
            self.shapes[pair.a as usize].inv_mass,
            self.shapes[pair.b as usize].inv_mass,
        )
    }

    fn apply_impulse(&self, pair: BodyPair, a: &mut Motion, b: &mut Motion, axis: Vec3, impulse: f32) {
        let (inv_a, inv_b) = self.inv_masses(pair);
        a.velocity -= axis * (impulse * inv_a);
        b.velocity += axis * (impulse * inv_b);
    }

    /// Earliest fraction of `motion` at which the sphere of `body` touches another body.
    fn time_of_impact(&self, body: BodyId, start: Vec3, motion: Vec3) -> Option<(f32, BodyId)> {
        let radius = self.shapes[body as usize].radius;
        let motion_sq = motion.length_squared();
        if motion_sq == 0.0 {
            return None;
        }
        let mut earliest: Option<(f32, BodyId)> = None;
        for (other, shape) in self.shapes.iter().enumerate() {
            let other = other as BodyId;
            if other == body {
                continue;
            }
            let reach = radius + shape.radius;
            let offset = start - self.motion_position(other);
            let c = offset.length_squared() - reach * reach;
            if c <= 0.0 {
                // Already touching; the position solver owns this one.
                continue;
            }
            let b = offset.dot(motion);
            if b >= 0.0 {
                continue;
            }
            let discriminant = b * b - motion_sq * c;
            if discriminant < 0.0 {
                continue;
            }
            let t = (-b - discriminant.sqrt()) / motion_sq;
            if (0.0..=1.0).contains(&t) && earliest.map_or(true, |(best, _)| t < best) {
                earliest = Some((t, other));
            }
        }
        earliest
    }
}

impl BroadPhase for SphereWorld {
    fn prepare_update(&self) {}

    fn find_colliding_pairs(
        &self,
        bodies: &[BodyId],
        speculative_distance: f32,
        filter: &dyn ObjectLayerPairFilter,
        sink: &mut dyn FnMut(BodyPair),
    ) {
        for &body in bodies {
            let shape = self.shapes[body as usize];
            let position = self.motion_position(body);
            for (other, other_shape) in self.shapes.iter().enumerate() {
                let other = other as BodyId;
                // Active pairs are reported by their lower body only.
                if other == body || (!other_shape.is_static() && other < body) {
                    continue;
                }
                if !filter.should_collide(shape.layer, other_shape.layer) {
                    continue;
                }
                let reach = shape.radius + other_shape.radius + speculative_distance;
                if self.motion_position(other).distance_squared(position) <= reach * reach {
                    sink(BodyPair::new(body, other));
                }
            }
        }
    }

    fn finalize_update(&self) {
        self.broad_phase_updates.fetch_add(1, Ordering::Relaxed);
    }
}

impl BodyDynamics for SphereWorld {
    fn active_bodies(&self) -> Vec<BodyId> {
        self.shapes
            .iter()
            .enumerate()
            .filter(|(_, shape)| !shape.is_static())
            .map(|(body, _)| body as BodyId)
            .collect()
    }

    fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    fn apply_gravity(&self, bodies: &[BodyId], gravity: [f32; 3], dt: f32) {
        let delta = Vec3::from(gravity) * dt;
        for &body in bodies {
            let mut motion = self.motions[body as usize].lock();
            motion.velocity += delta;
        }
    }

    fn is_constraint_active(&self, constraint: u32) -> bool {
        let pair = self.constraints[constraint as usize].pair;
        let (inv_a, inv_b) = self.inv_masses(pair);
        inv_a > 0.0 || inv_b > 0.0
    }

    fn constraint_bodies(&self, constraint: u32) -> BodyPair {
        self.constraints[constraint as usize].pair
    }

    fn setup_velocity_constraints(&self, constraints: &[u32], _dt: f32) {
        for &index in constraints {
            let constraint = &self.constraints[index as usize];
            let (axis, _) = direction(
                self.motion_position(constraint.pair.a),
                self.motion_position(constraint.pair.b),
            );
            let (inv_a, inv_b) = self.inv_masses(constraint.pair);
            let mut state = constraint.state.lock();
            state.axis = axis;
            state.effective_mass = 1.0 / (inv_a + inv_b);
        }
    }

    fn collide(&self, pair: BodyPair, speculative_distance: f32) -> Option<ContactManifold> {
        let shape_a = self.shapes[pair.a as usize];
        let shape_b = self.shapes[pair.b as usize];
        if shape_a.is_static() && shape_b.is_static() {
            return None;
        }
        let position_a = self.motion_position(pair.a);
        let (normal, distance) = direction(position_a, self.motion_position(pair.b));
        let separation = distance - shape_a.radius - shape_b.radius;
        if separation > speculative_distance {
            return None;
        }
        let penetration_depth = -separation;
        Some(ContactManifold {
            normal: normal.to_array(),
            penetration_depth,
            points: vec![
                (position_a + normal * (shape_a.radius - 0.5 * penetration_depth)).to_array(),
            ],
        })
    }

    fn set_island_index(&self, body: BodyId, island: u32) {
        self.motions[body as usize].lock().island = island;
    }

    fn warm_start_constraints(&self, constraints: &[u32]) {
        for &index in constraints {
            let constraint = &self.constraints[index as usize];
            let state = constraint.state.lock();
            if state.impulse != 0.0 {
                let (mut a, mut b) = self.lock_pair(constraint.pair);
                self.apply_impulse(constraint.pair, &mut a, &mut b, state.axis, state.impulse);
            }
        }
    }

    fn solve_velocity_constraints(&self, constraints: &[u32], _dt: f32) {
        for &index in constraints {
            let constraint = &self.constraints[index as usize];
            let mut state = constraint.state.lock();
            let (mut a, mut b) = self.lock_pair(constraint.pair);
            let relative = (b.velocity - a.velocity).dot(state.axis);
            let lambda = -relative * state.effective_mass;
            state.impulse += lambda;
            self.apply_impulse(constraint.pair, &mut a, &mut b, state.axis, lambda);
        }
    }

    fn integrate_velocities(&self, bodies: &[BodyId], dt: f32, ccd: &mut dyn FnMut(BodyId)) {
        for &body in bodies {
            let radius = self.shapes[body as usize].radius;
            let mut motion = self.motions[body as usize].lock();
            let displacement = motion.velocity * dt;
            if displacement.length() > radius {
                // Moved by resolve_ccd instead.
                ccd(body);
            } else {
                motion.position += displacement;
            }
        }
    }

    fn resolve_ccd(&self, bodies: &[BodyId], dt: f32) {
        for &body in bodies {
            let (start, velocity) = {
                let motion = self.motions[body as usize].lock();
                (motion.position, motion.velocity)
            };
            let displacement = velocity * dt;
            let hit = self
                .time_of_impact(body, start, displacement)
                .map(|(fraction, other)| (fraction, other, self.motion_position(other)));

            let mut motion = self.motions[body as usize].lock();
            match hit {
                Some((fraction, other, other_position)) => {
                    motion.position = start + displacement * fraction;
                    let (normal, _) = direction(other_position, motion.position);
                    let approach = motion.velocity.dot(normal);
                    if approach < 0.0 {
                        motion.velocity -= normal * approach;
                    }
                    log::trace!("body {body} swept into body {other} at {fraction:.3}");
                }
                None => motion.position = start + displacement,
            }
        }
    }

    fn solve_position_constraints(&self, constraints: &[u32]) {
        for &index in constraints {
            let constraint = &self.constraints[index as usize];
            let (inv_a, inv_b) = self.inv_masses(constraint.pair);
            let (mut a, mut b) = self.lock_pair(constraint.pair);
            let (axis, distance) = direction(a.position, b.position);
            let error = distance - constraint.rest_length;
            let correction = POSITION_BAUMGARTE * error / (inv_a + inv_b);
            a.position += axis * (correction * inv_a);
            b.position -= axis * (correction * inv_b);
        }
    }

    fn apply_contact_impulse(&self, pair: BodyPair, normal: [f32; 3], impulse: f32) {
        let (mut a, mut b) = self.lock_pair(pair);
        self.apply_impulse(pair, &mut a, &mut b, Vec3::from(normal), impulse);
    }

    fn solve_contact_velocity(
        &self,
        pair: BodyPair,
        manifold: &ContactManifold,
        accumulated_impulse: &mut f32,
        dt: f32,
    ) {
        let (inv_a, inv_b) = self.inv_masses(pair);
        let (mut a, mut b) = self.lock_pair(pair);
        let normal = Vec3::from(manifold.normal);
        let relative = (b.velocity - a.velocity).dot(normal);
        // A speculative contact may still close the gap this step.
        let target = if manifold.penetration_depth < 0.0 && dt > 0.0 {
            manifold.penetration_depth / dt
        } else {
            0.0
        };
        let lambda = (target - relative) / (inv_a + inv_b);
        let total = (*accumulated_impulse + lambda).max(0.0);
        let applied = total - *accumulated_impulse;
        *accumulated_impulse = total;
        self.apply_impulse(pair, &mut a, &mut b, normal, applied);
    }

    fn solve_contact_position(&self, pair: BodyPair, manifold: &ContactManifold) {
        let shape_a = self.shapes[pair.a as usize];
        let shape_b = self.shapes[pair.b as usize];
        let (mut a, mut b) = self.lock_pair(pair);
        let normal = Vec3::from(manifold.normal);
        let distance = (b.position - a.position).dot(normal);
        let penetration = shape_a.radius + shape_b.radius - distance;
        if penetration <= PENETRATION_SLOP {
            return;
        }
        let correction =
            POSITION_BAUMGARTE * (penetration - PENETRATION_SLOP) / (shape_a.inv_mass + shape_b.inv_mass);
        a.position -= normal * (correction * shape_a.inv_mass);
        b.position += normal * (correction * shape_b.inv_mass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::interfaces::AllowAllLayers;

    struct SkipLayerOne;

    impl ObjectLayerPairFilter for SkipLayerOne {
        fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
            a != 1 && b != 1
        }
    }

    fn pairs(world: &SphereWorld, bodies: &[BodyId], filter: &dyn ObjectLayerPairFilter) -> Vec<BodyPair> {
        let mut found = Vec::new();
        world.find_colliding_pairs(bodies, 0.0, filter, &mut |pair| found.push(pair));
        found.sort();
        found
    }

    #[test]
    fn test_each_pair_reported_once() {
        let world = SphereWorld::new(&[
            SphereDesc::dynamic([0.0, 0.0, 0.0], 0.5),
            SphereDesc::dynamic([0.8, 0.0, 0.0], 0.5),
            SphereDesc::fixed([0.0, -0.9, 0.0], 0.5),
            SphereDesc::dynamic([10.0, 0.0, 0.0], 0.5),
        ]);
        let active = world.active_bodies();
        assert_eq!(active, vec![0, 1, 3]);

        let mut found = Vec::new();
        for &body in &active {
            world.find_colliding_pairs(&[body], 0.0, &AllowAllLayers, &mut |pair| found.push(pair));
        }
        found.sort();
        assert_eq!(found, vec![BodyPair::new(0, 1), BodyPair::new(0, 2)]);
    }

    #[test]
    fn test_layer_filter_applies() {
        let world = SphereWorld::new(&[
            SphereDesc::dynamic([0.0, 0.0, 0.0], 0.5),
            SphereDesc::dynamic([0.8, 0.0, 0.0], 0.5).with_layer(1),
        ]);
        assert!(pairs(&world, &[0, 1], &SkipLayerOne).is_empty());
        assert_eq!(pairs(&world, &[0, 1], &AllowAllLayers).len(), 1);
    }

    #[test]
    fn test_collide_reports_penetration() {
        let world = SphereWorld::new(&[
            SphereDesc::dynamic([0.0, 0.0, 0.0], 0.5),
            SphereDesc::dynamic([0.0, 0.8, 0.0], 0.5),
        ]);
        let manifold = world.collide(BodyPair::new(0, 1), 0.0).unwrap();
        assert_eq!(manifold.normal, [0.0, 1.0, 0.0]);
        assert!((manifold.penetration_depth - 0.2).abs() < 1e-5);

        let apart = SphereWorld::new(&[
            SphereDesc::dynamic([0.0, 0.0, 0.0], 0.5),
            SphereDesc::dynamic([0.0, 1.5, 0.0], 0.5),
        ]);
        assert!(apart.collide(BodyPair::new(0, 1), 0.1).is_none());
        assert!(apart.collide(BodyPair::new(0, 1), 0.6).is_some());
    }

    #[test]
    fn test_coincident_centers_separate_along_up() {
        let world = SphereWorld::new(&[
            SphereDesc::dynamic([1.0, 2.0, 3.0], 0.5),
            SphereDesc::dynamic([1.0, 2.0, 3.0], 0.5),
        ]);
        let manifold = world.collide(BodyPair::new(0, 1), 0.0).unwrap();
        assert_eq!(manifold.normal, [0.0, 1.0, 0.0]);
        assert!((manifold.penetration_depth - 1.0).abs() < 1e-6);
        assert_eq!(manifold.points, vec![[1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_contact_stops_approach_and_leaves_static_alone() {
        let world = SphereWorld::new(&[
            SphereDesc::dynamic([0.0, 0.9, 0.0], 0.5).with_velocity([0.0, -2.0, 0.0]),
            SphereDesc::fixed([0.0, 0.0, 0.0], 0.5),
        ]);
        let pair = BodyPair::new(0, 1);
        let manifold = world.collide(pair, 0.0).unwrap();
        let mut impulse = 0.0;
        world.solve_contact_velocity(pair, &manifold, &mut impulse, 1.0 / 60.0);

        assert!(impulse > 0.0);
        assert!(world.velocity(0)[1].abs() < 1e-5);
        assert_eq!(world.velocity(1), [0.0; 3]);

        world.solve_contact_position(pair, &manifold);
        assert_eq!(world.position(1), [0.0; 3]);
        assert!(world.position(0)[1] > 0.9);
    }

    #[test]
    fn test_distance_constraint_holds_length() {
        let mut world = SphereWorld::new(&[
            SphereDesc::dynamic([0.0, 0.0, 0.0], 0.1).with_velocity([-1.0, 0.0, 0.0]),
            SphereDesc::dynamic([2.0, 0.0, 0.0], 0.1).with_velocity([1.0, 0.0, 0.0]),
        ]);
        let constraint = world.add_distance_constraint(0, 1);
        assert!(world.is_constraint_active(constraint));

        world.setup_velocity_constraints(&[constraint], 1.0 / 60.0);
        world.solve_velocity_constraints(&[constraint], 1.0 / 60.0);
        assert!(world.velocity(0)[0].abs() < 1e-5);
        assert!(world.velocity(1)[0].abs() < 1e-5);
    }

    #[test]
    fn test_fast_body_goes_through_ccd() {
        let world = SphereWorld::new(&[
            SphereDesc::dynamic([0.0, 5.0, 0.0], 0.25).with_velocity([0.0, -600.0, 0.0]),
            SphereDesc::fixed([0.0, 0.0, 0.0], 1.0),
        ]);
        let mut flagged = Vec::new();
        world.integrate_velocities(&[0], 1.0 / 60.0, &mut |body| flagged.push(body));
        assert_eq!(flagged, vec![0]);
        assert_eq!(world.position(0), [0.0, 5.0, 0.0]);

        world.resolve_ccd(&flagged, 1.0 / 60.0);
        let position = world.position(0);
        assert!((position[1] - 1.25).abs() < 1e-3, "stopped at {position:?}");
        assert!(world.velocity(0)[1] >= 0.0);
    }
}
