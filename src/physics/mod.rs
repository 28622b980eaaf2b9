//! Parallel physics step scheduling.
//!
//! [`PhysicsSystem::update`] builds one job graph per call covering every
//! collision sub-step, sizes each parallel phase from the workload, hands
//! the graph to a [`JobSystem`](crate::JobSystem) and waits for it to drain.
//! The physics itself is delegated to the collaborator traits in
//! [`interfaces`]; [`sphere_world`], [`island_builder`] and [`contact_cache`]
//! provide working implementations.

pub mod body_pair_queue;
pub mod contact_cache;
pub mod interfaces;
pub mod island_builder;
pub mod job_counts;
pub mod settings;
pub mod sphere_world;
pub mod update_errors;

mod spawner;
mod step_context;
mod step_graph;
mod system;

pub use contact_cache::ContactCache;
pub use interfaces::{
    AllowAllLayers, BodyDynamics, BodyId, BodyPair, BroadPhase, CacheLookup,
    ContactCapacityError, ContactManager, ContactManifold, IslandBuilder, ObjectLayer,
    ObjectLayerPairFilter, PairHandle,
};
pub use island_builder::UnionFindIslandBuilder;
pub use job_counts::StepJobCounts;
pub use settings::PhysicsSettings;
pub use sphere_world::{SphereDesc, SphereWorld};
pub use system::{Collaborators, PhysicsSystem, UpdateStats};
pub use update_errors::{AtomicUpdateErrors, UpdateErrors};
