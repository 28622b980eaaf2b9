//! Fixed-capacity store for body pairs, manifolds and contact constraints.

use super::interfaces::{
    BodyDynamics, BodyPair, CacheLookup, ContactCapacityError, ContactManager, ContactManifold,
    PairHandle,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct CachedManifold {
    manifold: ContactManifold,
    impulse: f32,
}

#[derive(Debug)]
struct ContactConstraint {
    pair: BodyPair,
    manifold: ContactManifold,
    impulse: f32,
}

#[derive(Default)]
struct PairTable {
    handles: HashMap<BodyPair, PairHandle>,
    pairs: Vec<BodyPair>,
}

/// Reference [`ContactManager`] with hard limits on everything it stores.
///
/// Manifolds live for one update and seed the next one: accumulated impulses
/// warm-start contacts between the same bodies, and with
/// [`set_reuse_cached_manifolds`](Self::set_reuse_cached_manifolds) the
/// previous manifold replaces the narrow phase entirely.
pub struct ContactCache {
    max_body_pairs: usize,
    max_manifolds: usize,
    reuse_manifolds: AtomicBool,
    pairs: Mutex<PairTable>,
    current: Mutex<HashMap<BodyPair, CachedManifold>>,
    previous: Mutex<HashMap<BodyPair, CachedManifold>>,
    constraints: Box<[Mutex<Option<ContactConstraint>>]>,
    num_constraints: AtomicUsize,
    last_update_pairs: AtomicUsize,
    last_update_removed: AtomicUsize,
}

impl ContactCache {
    pub fn new(max_body_pairs: usize, max_manifolds: usize, max_contact_constraints: usize) -> Self {
        ContactCache {
            max_body_pairs,
            max_manifolds,
            reuse_manifolds: AtomicBool::new(false),
            pairs: Mutex::new(PairTable::default()),
            current: Mutex::new(HashMap::new()),
            previous: Mutex::new(HashMap::new()),
            constraints: (0..max_contact_constraints).map(|_| Mutex::new(None)).collect(),
            num_constraints: AtomicUsize::new(0),
            last_update_pairs: AtomicUsize::new(0),
            last_update_removed: AtomicUsize::new(0),
        }
    }

    pub fn set_reuse_cached_manifolds(&self, reuse: bool) {
        self.reuse_manifolds.store(reuse, Ordering::Relaxed);
    }

    /// Body pairs stored by the last finished update.
    pub fn body_pairs_last_update(&self) -> usize {
        self.last_update_pairs.load(Ordering::Relaxed)
    }

    /// Manifolds carried over into the next update.
    pub fn cached_manifolds(&self) -> usize {
        self.previous.lock().len()
    }

    /// Manifolds of the previous update that were not refreshed by the last one.
    pub fn removed_last_update(&self) -> usize {
        self.last_update_removed.load(Ordering::Relaxed)
    }

    pub fn num_contact_constraints(&self) -> usize {
        self.num_constraints.load(Ordering::Acquire)
    }

    fn pair(&self, handle: PairHandle) -> BodyPair {
        self.pairs.lock().pairs[handle as usize]
    }

    fn store(
        &self,
        pair: BodyPair,
        manifold: &ContactManifold,
    ) -> Result<Option<u32>, ContactCapacityError> {
        let impulse = {
            let mut current = self.current.lock();
            let impulse = match current.get(&pair) {
                Some(cached) => cached.impulse,
                None => {
                    if current.len() >= self.max_manifolds {
                        return Err(ContactCapacityError::ManifoldCacheFull);
                    }
                    self.previous.lock().get(&pair).map_or(0.0, |cached| cached.impulse)
                }
            };
            current.insert(
                pair,
                CachedManifold {
                    manifold: manifold.clone(),
                    impulse,
                },
            );
            impulse
        };

        let index = self
            .num_constraints
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.constraints.len()).then_some(n + 1)
            })
            .map_err(|_| ContactCapacityError::ContactConstraintsFull)?;
        *self.constraints[index].lock() = Some(ContactConstraint {
            pair,
            manifold: manifold.clone(),
            impulse,
        });
        Ok(Some(index as u32))
    }

    /// Writes solved impulses back into the manifolds and drops the constraints.
    fn retire_constraints(&self) {
        let count = self.num_constraints.swap(0, Ordering::AcqRel);
        let mut current = self.current.lock();
        for slot in &self.constraints[..count] {
            if let Some(constraint) = slot.lock().take() {
                if let Some(cached) = current.get_mut(&constraint.pair) {
                    cached.impulse = constraint.impulse;
                }
            }
        }
    }

    fn with_constraint(&self, contact: u32, f: impl FnOnce(&mut ContactConstraint)) {
        let mut slot = self.constraints[contact as usize].lock();
        if let Some(constraint) = slot.as_mut() {
            f(constraint);
        }
    }
}

impl ContactManager for ContactCache {
    fn prepare_step(&self) {
        self.retire_constraints();
    }

    fn max_contact_constraints(&self) -> usize {
        self.constraints.len()
    }

    fn add_body_pair(&self, pair: BodyPair) -> Option<PairHandle> {
        let mut table = self.pairs.lock();
        if let Some(&handle) = table.handles.get(&pair) {
            return Some(handle);
        }
        if table.pairs.len() >= self.max_body_pairs {
            return None;
        }
        let handle = table.pairs.len() as PairHandle;
        table.pairs.push(pair);
        table.handles.insert(pair, handle);
        Some(handle)
    }

    fn get_contacts_from_cache(&self, handle: PairHandle) -> CacheLookup {
        if !self.reuse_manifolds.load(Ordering::Relaxed) {
            return CacheLookup::default();
        }
        let pair = self.pair(handle);
        let Some(cached) = self.previous.lock().get(&pair).cloned() else {
            return CacheLookup::default();
        };
        match self.store(pair, &cached.manifold) {
            Ok(constraint) => CacheLookup {
                handled: true,
                constraint,
            },
            // Let the regular path run and report the limit.
            Err(_) => CacheLookup::default(),
        }
    }

    fn add_contact_constraint(
        &self,
        handle: PairHandle,
        manifold: &ContactManifold,
    ) -> Result<Option<u32>, ContactCapacityError> {
        self.store(self.pair(handle), manifold)
    }

    fn contact_bodies(&self, contact: u32) -> BodyPair {
        let slot = self.constraints[contact as usize].lock();
        slot.as_ref()
            .map(|constraint| constraint.pair)
            .unwrap_or_else(|| panic!("contact {contact} does not exist"))
    }

    fn sort_contacts(&self, contacts: &mut [u32]) {
        contacts.sort_by_cached_key(|&contact| self.contact_bodies(contact));
    }

    fn warm_start_velocity_constraints(&self, contacts: &[u32], dynamics: &dyn BodyDynamics) {
        for &contact in contacts {
            self.with_constraint(contact, |c| {
                if c.impulse != 0.0 {
                    dynamics.apply_contact_impulse(c.pair, c.manifold.normal, c.impulse);
                }
            });
        }
    }

    fn solve_velocity_constraints(&self, contacts: &[u32], dynamics: &dyn BodyDynamics, dt: f32) {
        for &contact in contacts {
            self.with_constraint(contact, |c| {
                dynamics.solve_contact_velocity(c.pair, &c.manifold, &mut c.impulse, dt);
            });
        }
    }

    fn solve_position_constraints(&self, contacts: &[u32], dynamics: &dyn BodyDynamics) {
        for &contact in contacts {
            self.with_constraint(contact, |c| dynamics.solve_contact_position(c.pair, &c.manifold));
        }
    }

    fn finalize_contact_cache(&self, num_body_pairs: usize, num_manifolds: usize) {
        self.retire_constraints();

        let current = std::mem::take(&mut *self.current.lock());
        let mut previous = self.previous.lock();
        let removed = previous.keys().filter(|pair| !current.contains_key(pair)).count();
        *previous = current;

        let stored_pairs = {
            let mut table = self.pairs.lock();
            let stored = table.pairs.len();
            *table = PairTable::default();
            stored
        };
        self.last_update_pairs.store(stored_pairs, Ordering::Relaxed);
        self.last_update_removed.store(removed, Ordering::Relaxed);
        log::trace!(
            "contact cache: {num_body_pairs} pair(s) and {num_manifolds} manifold(s) found, \
             {stored_pairs} pair(s) stored, {removed} contact(s) removed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifold() -> ContactManifold {
        ContactManifold {
            normal: [0.0, 1.0, 0.0],
            penetration_depth: 0.01,
            points: vec![[0.0; 3]],
        }
    }

    #[test]
    fn test_body_pair_capacity() {
        let cache = ContactCache::new(2, 8, 8);
        let a = cache.add_body_pair(BodyPair::new(0, 1)).unwrap();
        assert_eq!(cache.add_body_pair(BodyPair::new(0, 1)), Some(a));
        assert!(cache.add_body_pair(BodyPair::new(0, 2)).is_some());
        assert_eq!(cache.add_body_pair(BodyPair::new(1, 2)), None);
        cache.finalize_contact_cache(3, 0);
        assert_eq!(cache.body_pairs_last_update(), 2);
    }

    #[test]
    fn test_manifold_and_constraint_limits() {
        let cache = ContactCache::new(8, 1, 8);
        let first = cache.add_body_pair(BodyPair::new(0, 1)).unwrap();
        let second = cache.add_body_pair(BodyPair::new(0, 2)).unwrap();
        assert_eq!(cache.add_contact_constraint(first, &manifold()), Ok(Some(0)));
        assert_eq!(
            cache.add_contact_constraint(second, &manifold()),
            Err(ContactCapacityError::ManifoldCacheFull)
        );

        let cache = ContactCache::new(8, 8, 1);
        let first = cache.add_body_pair(BodyPair::new(0, 1)).unwrap();
        let second = cache.add_body_pair(BodyPair::new(0, 2)).unwrap();
        cache.add_contact_constraint(first, &manifold()).unwrap();
        assert_eq!(
            cache.add_contact_constraint(second, &manifold()),
            Err(ContactCapacityError::ContactConstraintsFull)
        );
    }

    #[test]
    fn test_reuse_and_removal_across_updates() {
        let cache = ContactCache::new(8, 8, 8);
        let handle = cache.add_body_pair(BodyPair::new(3, 4)).unwrap();
        assert_eq!(cache.get_contacts_from_cache(handle), CacheLookup::default());
        cache.add_contact_constraint(handle, &manifold()).unwrap();
        cache.finalize_contact_cache(1, 1);
        assert_eq!(cache.cached_manifolds(), 1);

        cache.set_reuse_cached_manifolds(true);
        cache.prepare_step();
        let handle = cache.add_body_pair(BodyPair::new(3, 4)).unwrap();
        let lookup = cache.get_contacts_from_cache(handle);
        assert!(lookup.handled);
        assert_eq!(lookup.constraint, Some(0));
        cache.finalize_contact_cache(1, 1);
        assert_eq!(cache.removed_last_update(), 0);

        // Nothing touches the pair this time.
        cache.finalize_contact_cache(0, 0);
        assert_eq!(cache.removed_last_update(), 1);
        assert_eq!(cache.cached_manifolds(), 0);
    }

    #[test]
    fn test_sort_contacts_orders_by_pair() {
        let cache = ContactCache::new(8, 8, 8);
        for pair in [BodyPair::new(5, 6), BodyPair::new(1, 2), BodyPair::new(3, 4)] {
            let handle = cache.add_body_pair(pair).unwrap();
            cache.add_contact_constraint(handle, &manifold()).unwrap();
        }
        let mut contacts = vec![0, 1, 2];
        cache.sort_contacts(&mut contacts);
        assert_eq!(contacts, vec![1, 2, 0]);
    }
}
