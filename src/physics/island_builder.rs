//! Concurrent union-find island builder.
//!
//! Links may arrive from many jobs at once. Every union points the higher
//! root at the lower one, so each island's root is its smallest body id no
//! matter in which order links were made; islands, and the lists inside
//! them, come out in the same order on every run.

use super::interfaces::{BodyId, IslandBuilder};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
struct Islands {
    bodies: Vec<Vec<BodyId>>,
    constraints: Vec<Vec<u32>>,
    contacts: Vec<Vec<u32>>,
}

pub struct UnionFindIslandBuilder {
    parent: Box<[AtomicU32]>,
    /// A body is active when its entry equals the current epoch.
    active_epoch: Box<[AtomicU32]>,
    epoch: AtomicU32,
    constraint_links: Mutex<Vec<(u32, BodyId)>>,
    contact_links: Mutex<Vec<(u32, BodyId)>>,
    islands: RwLock<Islands>,
}

impl UnionFindIslandBuilder {
    pub fn new(max_bodies: usize) -> Self {
        UnionFindIslandBuilder {
            parent: (0..max_bodies as u32).map(AtomicU32::new).collect(),
            active_epoch: (0..max_bodies).map(|_| AtomicU32::new(u32::MAX)).collect(),
            epoch: AtomicU32::new(0),
            constraint_links: Mutex::new(Vec::new()),
            contact_links: Mutex::new(Vec::new()),
            islands: RwLock::new(Islands::default()),
        }
    }

    pub fn max_bodies(&self) -> usize {
        self.parent.len()
    }

    fn is_active(&self, body: BodyId) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);
        self.active_epoch
            .get(body as usize)
            .is_some_and(|e| e.load(Ordering::Acquire) == epoch)
    }

    fn find(&self, mut body: BodyId) -> BodyId {
        loop {
            let parent = self.parent[body as usize].load(Ordering::Acquire);
            if parent == body {
                return body;
            }
            let grandparent = self.parent[parent as usize].load(Ordering::Acquire);
            if grandparent != parent {
                // Path halving; losing this race only costs a longer walk next time.
                let _ = self.parent[body as usize].compare_exchange(
                    parent,
                    grandparent,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
            body = parent;
        }
    }

    fn union(&self, a: BodyId, b: BodyId) {
        loop {
            let root_a = self.find(a);
            let root_b = self.find(b);
            if root_a == root_b {
                return;
            }
            let (low, high) = (root_a.min(root_b), root_a.max(root_b));
            if self.parent[high as usize]
                .compare_exchange(high, low, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// The active end of a link, which decides the island it lands in.
    fn anchor(&self, a: BodyId, b: BodyId) -> Option<BodyId> {
        match (self.is_active(a), self.is_active(b)) {
            (true, _) => Some(a),
            (false, true) => Some(b),
            (false, false) => None,
        }
    }
}

impl IslandBuilder for UnionFindIslandBuilder {
    fn reset_islands(&self) {
        *self.islands.write() = Islands::default();
        self.constraint_links.lock().clear();
        self.contact_links.lock().clear();
    }

    fn prepare(&self, active_bodies: &[BodyId]) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        for &body in active_bodies {
            assert!(
                (body as usize) < self.parent.len(),
                "body {body} exceeds island builder capacity {}",
                self.parent.len()
            );
            self.parent[body as usize].store(body, Ordering::Relaxed);
            self.active_epoch[body as usize].store(epoch, Ordering::Relaxed);
        }
    }

    fn prepare_contact_constraints(&self, max_contacts: usize) {
        let mut links = self.contact_links.lock();
        links.clear();
        links.reserve(max_contacts);
    }

    fn prepare_non_contact_constraints(&self, num_constraints: usize) {
        let mut links = self.constraint_links.lock();
        links.clear();
        links.reserve(num_constraints);
    }

    fn link_bodies(&self, a: BodyId, b: BodyId) {
        if self.is_active(a) && self.is_active(b) {
            self.union(a, b);
        }
    }

    fn link_constraint(&self, constraint: u32, a: BodyId, b: BodyId) {
        if let Some(anchor) = self.anchor(a, b) {
            self.constraint_links.lock().push((constraint, anchor));
        }
    }

    fn link_contact(&self, contact: u32, a: BodyId, b: BodyId) {
        if let Some(anchor) = self.anchor(a, b) {
            self.contact_links.lock().push((contact, anchor));
        }
    }

    fn finalize(&self, active_bodies: &[BodyId]) {
        let mut sorted = active_bodies.to_vec();
        sorted.sort_unstable();

        // Roots are the smallest member, so they are visited before the rest.
        let mut island_of_root = std::collections::HashMap::new();
        let mut islands = Islands::default();
        for &body in &sorted {
            let root = self.find(body);
            let island = *island_of_root.entry(root).or_insert_with(|| {
                islands.bodies.push(Vec::new());
                islands.bodies.len() - 1
            });
            islands.bodies[island].push(body);
        }
        islands.constraints = vec![Vec::new(); islands.bodies.len()];
        islands.contacts = vec![Vec::new(); islands.bodies.len()];

        for &(constraint, anchor) in self.constraint_links.lock().iter() {
            if let Some(&island) = island_of_root.get(&self.find(anchor)) {
                islands.constraints[island].push(constraint);
            }
        }
        for &(contact, anchor) in self.contact_links.lock().iter() {
            if let Some(&island) = island_of_root.get(&self.find(anchor)) {
                islands.contacts[island].push(contact);
            }
        }
        for list in islands.constraints.iter_mut().chain(islands.contacts.iter_mut()) {
            list.sort_unstable();
        }

        *self.islands.write() = islands;
    }

    fn num_islands(&self) -> usize {
        self.islands.read().bodies.len()
    }

    fn bodies_in_island(&self, island: usize) -> Vec<BodyId> {
        self.islands.read().bodies[island].clone()
    }

    fn constraints_in_island(&self, island: usize) -> Vec<u32> {
        self.islands.read().constraints[island].clone()
    }

    fn contacts_in_island(&self, island: usize) -> Vec<u32> {
        self.islands.read().contacts[island].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_links_merge_islands() {
        let builder = UnionFindIslandBuilder::new(8);
        let active = [0, 1, 2, 3, 4];
        builder.prepare(&active);
        builder.link_bodies(3, 1);
        builder.link_bodies(4, 3);
        builder.link_constraint(7, 4, 3);
        builder.link_contact(2, 0, 6); // 6 is not active
        builder.finalize(&active);

        assert_eq!(builder.num_islands(), 3);
        assert_eq!(builder.bodies_in_island(0), vec![0]);
        assert_eq!(builder.bodies_in_island(1), vec![1, 3, 4]);
        assert_eq!(builder.bodies_in_island(2), vec![2]);
        assert_eq!(builder.constraints_in_island(1), vec![7]);
        assert_eq!(builder.contacts_in_island(0), vec![2]);
    }

    #[test]
    fn test_recorded_links_do_not_merge_on_their_own() {
        let builder = UnionFindIslandBuilder::new(4);
        let active = [0, 1];
        builder.prepare(&active);
        builder.link_contact(5, 1, 0);
        builder.finalize(&active);

        assert_eq!(builder.num_islands(), 2);
        assert_eq!(builder.contacts_in_island(1), vec![5]);
    }

    #[test]
    fn test_reset_starts_fresh() {
        let builder = UnionFindIslandBuilder::new(4);
        builder.prepare(&[0, 1]);
        builder.link_bodies(0, 1);
        builder.finalize(&[0, 1]);
        assert_eq!(builder.num_islands(), 1);

        builder.reset_islands();
        builder.prepare(&[0, 1]);
        builder.finalize(&[0, 1]);
        assert_eq!(builder.num_islands(), 2);
    }

    #[test]
    fn test_concurrent_links_are_deterministic() {
        let active: Vec<BodyId> = (0..256).collect();
        let builder = Arc::new(UnionFindIslandBuilder::new(256));
        builder.prepare(&active);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let builder = builder.clone();
                thread::spawn(move || {
                    // Chain bodies of equal residue mod 8 together.
                    for body in (t..248).step_by(4) {
                        builder.link_bodies(body as BodyId, body as BodyId + 8);
                        builder.link_contact(body, body as BodyId, body as BodyId + 8);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        builder.finalize(&active);

        assert_eq!(builder.num_islands(), 8);
        for island in 0..8 {
            let bodies = builder.bodies_in_island(island);
            assert_eq!(bodies[0], island as BodyId);
            assert!(bodies.iter().all(|b| b % 8 == island as BodyId));
            assert_eq!(bodies.len(), 32);
        }
    }
}
