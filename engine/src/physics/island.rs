//! Simulation islands
//!
//! Active dynamic bodies that touch each other, directly or through a chain of
//! contacts and constraints, end up in the same island. Islands are solved
//! independently and go to sleep as a whole.

use crate::physics::body::BodyId;
use std::collections::HashMap;
use tracing::debug;

/// Union-find over the bodies taking part in a step
#[derive(Debug, Default)]
pub struct IslandBuilder {
    index_of: HashMap<BodyId, usize>,
    bodies: Vec<BodyId>,
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl IslandBuilder {
    pub fn new(bodies: &[BodyId]) -> Self {
        let mut builder = Self {
            index_of: HashMap::with_capacity(bodies.len()),
            bodies: Vec::with_capacity(bodies.len()),
            parent: Vec::with_capacity(bodies.len()),
            rank: Vec::with_capacity(bodies.len()),
        };
        for id in bodies {
            builder.add_body(*id);
        }
        builder
    }

    /// Add a body woken up during the step; adding twice is a no-op
    pub fn add_body(&mut self, id: BodyId) -> usize {
        if let Some(index) = self.index_of.get(&id) {
            return *index;
        }
        let index = self.bodies.len();
        self.index_of.insert(id, index);
        self.bodies.push(id);
        self.parent.push(index);
        self.rank.push(0);
        index
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.index_of.contains_key(&id)
    }

    pub fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    /// Put two bodies in the same island. Bodies not taking part (static,
    /// kinematic, the world) do not connect islands and are ignored.
    pub fn link(&mut self, a: BodyId, b: BodyId) {
        if let (Some(&a), Some(&b)) = (self.index_of.get(&a), self.index_of.get(&b)) {
            self.union(a, b);
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // Path halving
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        match self.rank[root_a].cmp(&self.rank[root_b]) {
            std::cmp::Ordering::Less => self.parent[root_a] = root_b,
            std::cmp::Ordering::Greater => self.parent[root_b] = root_a,
            std::cmp::Ordering::Equal => {
                self.parent[root_b] = root_a;
                self.rank[root_a] += 1;
            }
        }
    }

    /// Group the bodies; islands and their members keep insertion order
    pub fn finalize(mut self) -> Islands {
        let mut island_of_root: HashMap<usize, usize> = HashMap::new();
        let mut islands: Vec<Island> = Vec::new();
        let mut island_of = HashMap::with_capacity(self.bodies.len());

        for index in 0..self.bodies.len() {
            let root = self.find(index);
            let island = *island_of_root.entry(root).or_insert_with(|| {
                islands.push(Island::default());
                islands.len() - 1
            });
            let id = self.bodies[index];
            islands[island].bodies.push(id);
            island_of.insert(id, island);
        }

        debug!(islands = islands.len(), bodies = self.bodies.len(), "Built islands");
        Islands { islands, island_of }
    }
}

/// Bodies solved together
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Island {
    pub bodies: Vec<BodyId>,
}

/// Result of [`IslandBuilder::finalize`]
#[derive(Debug, Default)]
pub struct Islands {
    islands: Vec<Island>,
    island_of: HashMap<BodyId, usize>,
}

impl Islands {
    pub fn len(&self) -> usize {
        self.islands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.islands.is_empty()
    }

    pub fn island_of(&self, id: BodyId) -> Option<usize> {
        self.island_of.get(&id).copied()
    }

    pub fn get(&self, index: usize) -> Option<&Island> {
        self.islands.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Island> {
        self.islands.iter()
    }

    pub fn as_slice(&self) -> &[Island] {
        &self.islands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u32) -> Vec<BodyId> {
        (0..n).map(|i| BodyId::new(i, 1)).collect()
    }

    #[test]
    fn test_unlinked_bodies_are_separate() {
        let islands = IslandBuilder::new(&ids(3)).finalize();
        assert_eq!(islands.len(), 3);
        assert_eq!(islands.island_of(BodyId::new(2, 1)), Some(2));
    }

    #[test]
    fn test_chain_forms_one_island() {
        let bodies = ids(5);
        let mut builder = IslandBuilder::new(&bodies);
        builder.link(bodies[0], bodies[1]);
        builder.link(bodies[3], bodies[1]);
        builder.link(bodies[2], bodies[4]);
        let islands = builder.finalize();

        assert_eq!(islands.len(), 2);
        assert_eq!(
            islands.get(0).map(|island| island.bodies.clone()),
            Some(vec![bodies[0], bodies[1], bodies[3]])
        );
        assert_eq!(islands.island_of(bodies[4]), islands.island_of(bodies[2]));
    }

    #[test]
    fn test_links_to_outsiders_are_ignored() {
        let bodies = ids(2);
        let mut builder = IslandBuilder::new(&bodies);
        let floor = BodyId::new(10, 1);
        builder.link(bodies[0], floor);
        builder.link(floor, bodies[1]);
        builder.link(bodies[0], BodyId::INVALID);

        let islands = builder.finalize();
        assert_eq!(islands.len(), 2);
        assert_eq!(islands.island_of(floor), None);
    }

    #[test]
    fn test_bodies_added_late() {
        let bodies = ids(2);
        let mut builder = IslandBuilder::new(&bodies[..1]);
        assert!(!builder.contains(bodies[1]));
        builder.add_body(bodies[1]);
        builder.add_body(bodies[1]);
        builder.link(bodies[0], bodies[1]);

        assert_eq!(builder.num_bodies(), 2);
        assert_eq!(builder.finalize().len(), 1);
    }
}
