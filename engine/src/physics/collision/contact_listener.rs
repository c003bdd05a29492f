//! Contact callbacks and the cross-step contact cache

use super::Contact;
use crate::physics::body::{Body, BodyId};
use glam::Vec3;
use std::collections::HashMap;

/// Unordered body pair, stored with the lower id first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyPair {
    pub a: BodyId,
    pub b: BodyId,
}

impl BodyPair {
    pub fn new(a: BodyId, b: BodyId) -> Self {
        if a <= b {
            Self { a, b }
        } else {
            Self { a: b, b: a }
        }
    }
}

/// Material response of a contact; listeners may override it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactSettings {
    pub combined_friction: f32,
    pub combined_restitution: f32,
    /// Report the contact but do not resolve it
    pub is_sensor: bool,
}

impl ContactSettings {
    /// Geometric mean friction, maximum restitution
    pub fn combine(a: &Body, b: &Body) -> Self {
        Self {
            combined_friction: (a.friction() * b.friction()).sqrt(),
            combined_restitution: a.restitution().max(b.restitution()),
            is_sensor: a.is_sensor() || b.is_sensor(),
        }
    }
}

/// Receives contact events from the simulation step.
///
/// Called from the stepping thread while the scene is being updated; the
/// bodies must not be modified through a [`crate::physics::body::BodyInterface`]
/// from inside a callback.
pub trait ContactListener: Send + Sync {
    /// A pair that was not touching in the previous step started touching
    fn on_contact_added(&self, _a: &Body, _b: &Body, _contact: &Contact, _settings: &mut ContactSettings) {}

    /// A pair that was touching in the previous step is still touching
    fn on_contact_persisted(
        &self,
        _a: &Body,
        _b: &Body,
        _contact: &Contact,
        _settings: &mut ContactSettings,
    ) {
    }

    /// A pair stopped touching (or one of the bodies was removed)
    fn on_contact_removed(&self, _pair: BodyPair) {}
}

/// Solver state kept for a touching pair between steps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedContact {
    pub normal: Vec3,
    pub normal_impulse: f32,
    pub tangent_impulse: f32,
    pub bitangent_impulse: f32,
}

impl CachedContact {
    pub fn new(normal: Vec3) -> Self {
        Self {
            normal,
            normal_impulse: 0.0,
            tangent_impulse: 0.0,
            bitangent_impulse: 0.0,
        }
    }
}

/// Pairs touching in the previous and the current step.
///
/// Pairs of sleeping bodies are carried over untouched so they do not get
/// reported as removed while asleep.
#[derive(Debug, Default)]
pub struct ContactCache {
    previous: HashMap<BodyPair, CachedContact>,
    current: HashMap<BodyPair, CachedContact>,
    max_pairs: usize,
}

impl ContactCache {
    pub fn new(max_pairs: usize) -> Self {
        Self {
            previous: HashMap::new(),
            current: HashMap::with_capacity(max_pairs.min(1024)),
            max_pairs,
        }
    }

    /// Start a new step; the current pairs become the previous ones
    pub fn begin_step(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.current);
        self.current.clear();
    }

    pub fn previous(&self, pair: &BodyPair) -> Option<&CachedContact> {
        self.previous.get(pair)
    }

    pub fn current(&self, pair: &BodyPair) -> Option<&CachedContact> {
        self.current.get(pair)
    }

    /// Record a touching pair. Returns `false` when the cache is full.
    pub fn insert(&mut self, pair: BodyPair, contact: CachedContact) -> bool {
        if self.current.len() >= self.max_pairs && !self.current.contains_key(&pair) {
            return false;
        }
        self.current.insert(pair, contact);
        true
    }

    /// Keep a pair from the previous step alive without new collision data
    pub fn carry_over(&mut self, pair: &BodyPair) -> bool {
        match self.previous.get(pair) {
            Some(contact) => {
                let contact = *contact;
                self.insert(*pair, contact)
            }
            None => false,
        }
    }

    /// Write back the impulses the solver ended up with
    pub fn store_impulses(&mut self, pair: &BodyPair, normal: f32, tangent: f32, bitangent: f32) {
        if let Some(contact) = self.current.get_mut(pair) {
            contact.normal_impulse = normal;
            contact.tangent_impulse = tangent;
            contact.bitangent_impulse = bitangent;
        }
    }

    /// Pairs touching in the previous step but not in this one
    pub fn removed_pairs(&self) -> Vec<BodyPair> {
        let mut removed: Vec<BodyPair> = self
            .previous
            .keys()
            .filter(|pair| !self.current.contains_key(pair))
            .copied()
            .collect();
        removed.sort();
        removed
    }

    /// Pairs of the previous step involving `id`
    pub fn previous_pairs_of(&self, id: BodyId) -> Vec<BodyPair> {
        self.previous
            .keys()
            .filter(|pair| pair.a == id || pair.b == id)
            .copied()
            .collect()
    }

    pub fn num_pairs(&self) -> usize {
        self.current.len()
    }

    pub fn clear(&mut self) {
        self.previous.clear();
        self.current.clear();
    }
}
