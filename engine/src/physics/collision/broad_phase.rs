//! Broad phase: coarse spatial index of body bounds
//!
//! The broad phase stores a proxy per body and answers bounding box queries.
//! It never touches bodies directly; callers hand it [`BroadPhaseBody`] proxies
//! built under the appropriate body locks.
//!
//! Query collectors are called with the broad phase lock held and must not
//! lock bodies or call back into the broad phase.

use super::layers::{BroadPhaseLayer, CollisionLayer};
use super::AABB;
use crate::physics::body::BodyId;
use glam::Vec3;
use parking_lot::RwLock;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// What the broad phase knows about a body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BroadPhaseBody {
    pub id: BodyId,
    pub bounds: AABB,
    pub collision_layer: CollisionLayer,
    pub broad_phase_layer: BroadPhaseLayer,
}

/// Opaque result of [`BroadPhase::add_bodies_prepare`]; must be passed to
/// exactly one of `add_bodies_finalize` or `add_bodies_abort`
pub type AddState = Box<dyn Any + Send>;

/// Spatial index over body bounds
pub trait BroadPhase: Send + Sync {
    /// Do the expensive part of inserting a batch without taking the broad
    /// phase lock. May reorder `bodies`.
    fn add_bodies_prepare(&self, bodies: &mut [BroadPhaseBody]) -> AddState;

    /// Make a prepared batch visible to queries; returns the ids actually inserted
    fn add_bodies_finalize(&self, state: AddState) -> Vec<BodyId>;

    /// Throw a prepared batch away
    fn add_bodies_abort(&self, state: AddState);

    fn remove_bodies(&self, ids: &[BodyId]);

    /// Refresh the stored bounds of bodies that moved or changed shape
    fn notify_bodies_aabb_changed(&self, bodies: &[BroadPhaseBody]);

    /// Move bodies to their new broad phase layer
    fn notify_bodies_layer_changed(&self, bodies: &[BroadPhaseBody]);

    /// Report every body whose bounds overlap `bounds` in a layer accepted by `layer_filter`
    fn collide_aabox(
        &self,
        bounds: &AABB,
        layer_filter: &dyn Fn(BroadPhaseLayer) -> bool,
        collector: &mut dyn FnMut(&BroadPhaseBody),
    );

    /// Sweep `bounds` along `displacement` and report each body it touches with
    /// the fraction of the displacement at which it is first hit
    fn cast_aabox(
        &self,
        bounds: &AABB,
        displacement: Vec3,
        layer_filter: &dyn Fn(BroadPhaseLayer) -> bool,
        collector: &mut dyn FnMut(&BroadPhaseBody, f32),
    );

    /// Rebuild internal structures for faster queries
    fn optimize(&self);

    fn num_bodies(&self) -> usize;

    fn contains(&self, id: BodyId) -> bool;
}

struct PreparedBodies {
    bodies: Vec<BroadPhaseBody>,
}

/// Axis for sweep and prune
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn min(self, bounds: &AABB) -> f32 {
        match self {
            Axis::X => bounds.min.x,
            Axis::Y => bounds.min.y,
            Axis::Z => bounds.min.z,
        }
    }

    fn max(self, bounds: &AABB) -> f32 {
        match self {
            Axis::X => bounds.max.x,
            Axis::Y => bounds.max.y,
            Axis::Z => bounds.max.z,
        }
    }
}

/// Determine the axis along which the bounds are spread the most
fn determine_best_axis(bodies: &[BroadPhaseBody]) -> Axis {
    if bodies.is_empty() {
        return Axis::X;
    }

    let mut mean = Vec3::ZERO;
    for body in bodies {
        mean += body.bounds.center();
    }
    mean /= bodies.len() as f32;

    let mut variance = Vec3::ZERO;
    for body in bodies {
        let diff = body.bounds.center() - mean;
        variance += diff * diff;
    }

    if variance.x > variance.y && variance.x > variance.z {
        Axis::X
    } else if variance.y > variance.z {
        Axis::Y
    } else {
        Axis::Z
    }
}

/// Proxies of one broad phase layer
#[derive(Default)]
struct LayerProxies {
    bodies: Vec<BroadPhaseBody>,
    lookup: HashMap<BodyId, usize>,
    /// Set while `bodies` is sorted by their minimum along this axis
    sorted_axis: Option<Axis>,
}

impl LayerProxies {
    fn insert(&mut self, body: BroadPhaseBody) {
        self.lookup.insert(body.id, self.bodies.len());
        self.bodies.push(body);
        self.sorted_axis = None;
    }

    fn remove(&mut self, id: BodyId) -> Option<BroadPhaseBody> {
        let index = self.lookup.remove(&id)?;
        let removed = self.bodies.swap_remove(index);
        if let Some(moved) = self.bodies.get(index) {
            self.lookup.insert(moved.id, index);
        }
        self.sorted_axis = None;
        Some(removed)
    }

    fn update(&mut self, body: &BroadPhaseBody) {
        if let Some(&index) = self.lookup.get(&body.id) {
            self.bodies[index] = *body;
            self.sorted_axis = None;
        }
    }

    fn optimize(&mut self) {
        let axis = determine_best_axis(&self.bodies);
        self.bodies.sort_by(|a, b| {
            axis.min(&a.bounds)
                .partial_cmp(&axis.min(&b.bounds))
                .unwrap_or(Ordering::Equal)
        });
        self.lookup = self
            .bodies
            .iter()
            .enumerate()
            .map(|(index, body)| (body.id, index))
            .collect();
        self.sorted_axis = Some(axis);
    }

    fn query(&self, bounds: &AABB, collector: &mut dyn FnMut(&BroadPhaseBody)) {
        match self.sorted_axis {
            Some(axis) => {
                let limit = axis.max(bounds);
                for body in self.bodies.iter().take_while(|b| axis.min(&b.bounds) <= limit) {
                    if body.bounds.overlaps(bounds) {
                        collector(body);
                    }
                }
            }
            None => {
                for body in self.bodies.iter().filter(|b| b.bounds.overlaps(bounds)) {
                    collector(body);
                }
            }
        }
    }
}

struct BroadPhaseState {
    layers: Vec<LayerProxies>,
    location: HashMap<BodyId, BroadPhaseLayer>,
}

impl BroadPhaseState {
    fn layer_mut(&mut self, layer: BroadPhaseLayer) -> Option<&mut LayerProxies> {
        self.layers.get_mut(usize::from(layer.0))
    }
}

/// Broad phase keeping one sweep-and-prune list per broad phase layer.
///
/// [`BroadPhase::optimize`] sorts each list along its axis of largest spread
/// so queries can stop early; edits leave a list unsorted until the next
/// optimize.
pub struct SweepAndPruneBroadPhase {
    state: RwLock<BroadPhaseState>,
}

impl SweepAndPruneBroadPhase {
    pub fn new(num_broad_phase_layers: u32) -> Self {
        Self {
            state: RwLock::new(BroadPhaseState {
                layers: (0..num_broad_phase_layers.max(1))
                    .map(|_| LayerProxies::default())
                    .collect(),
                location: HashMap::new(),
            }),
        }
    }

    /// Stored proxy of a body, if present
    pub fn proxy(&self, id: BodyId) -> Option<BroadPhaseBody> {
        let state = self.state.read();
        let layer = state.location.get(&id)?;
        let proxies = state.layers.get(usize::from(layer.0))?;
        proxies.lookup.get(&id).map(|&index| proxies.bodies[index])
    }
}

impl BroadPhase for SweepAndPruneBroadPhase {
    fn add_bodies_prepare(&self, bodies: &mut [BroadPhaseBody]) -> AddState {
        bodies.sort_by_key(|body| body.broad_phase_layer);
        Box::new(PreparedBodies {
            bodies: bodies.to_vec(),
        })
    }

    fn add_bodies_finalize(&self, state: AddState) -> Vec<BodyId> {
        let Ok(prepared) = state.downcast::<PreparedBodies>() else {
            warn!("Add state was not produced by this broad phase");
            return Vec::new();
        };

        let mut state = self.state.write();
        let mut inserted = Vec::with_capacity(prepared.bodies.len());
        for body in prepared.bodies {
            let Some(layer) = state.layer_mut(body.broad_phase_layer) else {
                warn!(id = %body.id, layer = body.broad_phase_layer.0, "Unknown broad phase layer");
                continue;
            };
            layer.insert(body);
            state.location.insert(body.id, body.broad_phase_layer);
            inserted.push(body.id);
        }
        inserted
    }

    fn add_bodies_abort(&self, state: AddState) {
        drop(state);
    }

    fn remove_bodies(&self, ids: &[BodyId]) {
        let mut state = self.state.write();
        for id in ids {
            let Some(layer) = state.location.remove(id) else {
                continue;
            };
            if let Some(proxies) = state.layer_mut(layer) {
                proxies.remove(*id);
            }
        }
    }

    fn notify_bodies_aabb_changed(&self, bodies: &[BroadPhaseBody]) {
        let mut state = self.state.write();
        for body in bodies {
            let Some(&layer) = state.location.get(&body.id) else {
                continue;
            };
            if let Some(proxies) = state.layer_mut(layer) {
                proxies.update(body);
            }
        }
    }

    fn notify_bodies_layer_changed(&self, bodies: &[BroadPhaseBody]) {
        let mut state = self.state.write();
        for body in bodies {
            let Some(&old_layer) = state.location.get(&body.id) else {
                continue;
            };
            if old_layer == body.broad_phase_layer {
                if let Some(proxies) = state.layer_mut(old_layer) {
                    proxies.update(body);
                }
                continue;
            }
            if state.layer_mut(body.broad_phase_layer).is_none() {
                warn!(id = %body.id, layer = body.broad_phase_layer.0, "Unknown broad phase layer");
                continue;
            }
            if let Some(proxies) = state.layer_mut(old_layer) {
                proxies.remove(body.id);
            }
            if let Some(proxies) = state.layer_mut(body.broad_phase_layer) {
                proxies.insert(*body);
            }
            state.location.insert(body.id, body.broad_phase_layer);
        }
    }

    fn collide_aabox(
        &self,
        bounds: &AABB,
        layer_filter: &dyn Fn(BroadPhaseLayer) -> bool,
        collector: &mut dyn FnMut(&BroadPhaseBody),
    ) {
        let state = self.state.read();
        for (index, proxies) in state.layers.iter().enumerate() {
            if layer_filter(BroadPhaseLayer(index as u8)) {
                proxies.query(bounds, collector);
            }
        }
    }

    fn cast_aabox(
        &self,
        bounds: &AABB,
        displacement: Vec3,
        layer_filter: &dyn Fn(BroadPhaseLayer) -> bool,
        collector: &mut dyn FnMut(&BroadPhaseBody, f32),
    ) {
        let mut swept = *bounds;
        swept.expand_to_include(bounds.min + displacement);
        swept.expand_to_include(bounds.max + displacement);

        let origin = bounds.center();
        let half_extents = bounds.half_extents();
        let state = self.state.read();
        for (index, proxies) in state.layers.iter().enumerate() {
            if !layer_filter(BroadPhaseLayer(index as u8)) {
                continue;
            }
            proxies.query(&swept, &mut |body| {
                // Minkowski sum turns the box sweep into a ray test
                let grown = AABB::new(body.bounds.min - half_extents, body.bounds.max + half_extents);
                if let Some(fraction) = grown.segment_hit_fraction(origin, displacement) {
                    collector(body, fraction);
                }
            });
        }
    }

    fn optimize(&self) {
        let mut state = self.state.write();
        for proxies in &mut state.layers {
            proxies.optimize();
        }
        debug!(num_bodies = state.location.len(), "Optimized broad phase");
    }

    fn num_bodies(&self) -> usize {
        self.state.read().location.len()
    }

    fn contains(&self, id: BodyId) -> bool {
        self.state.read().location.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::collision::layers::{BP_MOVING, BP_NON_MOVING, MOVING, NON_MOVING};

    fn proxy(index: u32, min: Vec3, max: Vec3, moving: bool) -> BroadPhaseBody {
        BroadPhaseBody {
            id: BodyId::new(index, 1),
            bounds: AABB::new(min, max),
            collision_layer: if moving { MOVING } else { NON_MOVING },
            broad_phase_layer: if moving { BP_MOVING } else { BP_NON_MOVING },
        }
    }

    fn query_ids(broad_phase: &dyn BroadPhase, bounds: &AABB) -> Vec<BodyId> {
        let mut hits = Vec::new();
        broad_phase.collide_aabox(bounds, &|_| true, &mut |body| hits.push(body.id));
        hits.sort();
        hits
    }

    fn populated() -> SweepAndPruneBroadPhase {
        let broad_phase = SweepAndPruneBroadPhase::new(2);
        let mut bodies = vec![
            proxy(0, Vec3::ZERO, Vec3::ONE, true),
            proxy(1, Vec3::splat(0.5), Vec3::splat(1.5), false),
            proxy(2, Vec3::splat(10.0), Vec3::splat(11.0), true),
        ];
        let state = broad_phase.add_bodies_prepare(&mut bodies);
        broad_phase.add_bodies_finalize(state);
        broad_phase
    }

    #[test]
    fn test_prepared_bodies_are_invisible_until_finalized() {
        let broad_phase = SweepAndPruneBroadPhase::new(2);
        let mut bodies = vec![proxy(0, Vec3::ZERO, Vec3::ONE, true)];
        let state = broad_phase.add_bodies_prepare(&mut bodies);
        assert_eq!(broad_phase.num_bodies(), 0);

        broad_phase.add_bodies_abort(state);
        assert_eq!(broad_phase.num_bodies(), 0);

        let state = broad_phase.add_bodies_prepare(&mut bodies);
        assert_eq!(broad_phase.add_bodies_finalize(state), vec![BodyId::new(0, 1)]);
        assert!(broad_phase.contains(BodyId::new(0, 1)));
    }

    #[test]
    fn test_query_overlaps() {
        let broad_phase = populated();
        let hits = query_ids(&broad_phase, &AABB::new(Vec3::splat(0.9), Vec3::splat(1.0)));
        assert_eq!(hits, vec![BodyId::new(0, 1), BodyId::new(1, 1)]);

        // Sorting must not change the answer
        broad_phase.optimize();
        let hits = query_ids(&broad_phase, &AABB::new(Vec3::splat(0.9), Vec3::splat(1.0)));
        assert_eq!(hits, vec![BodyId::new(0, 1), BodyId::new(1, 1)]);
    }

    #[test]
    fn test_layer_filter() {
        let broad_phase = populated();
        let mut hits = Vec::new();
        broad_phase.collide_aabox(
            &AABB::new(Vec3::ZERO, Vec3::splat(2.0)),
            &|layer| layer == BP_MOVING,
            &mut |body| hits.push(body.id),
        );
        assert_eq!(hits, vec![BodyId::new(0, 1)]);
    }

    #[test]
    fn test_remove_and_update() {
        let broad_phase = populated();
        broad_phase.remove_bodies(&[BodyId::new(0, 1)]);
        assert!(!broad_phase.contains(BodyId::new(0, 1)));
        assert_eq!(broad_phase.num_bodies(), 2);

        let moved = proxy(2, Vec3::ZERO, Vec3::ONE, true);
        broad_phase.notify_bodies_aabb_changed(&[moved]);
        let hits = query_ids(&broad_phase, &AABB::new(Vec3::ZERO, Vec3::splat(0.2)));
        assert_eq!(hits, vec![BodyId::new(2, 1)]);
    }

    #[test]
    fn test_layer_change_moves_proxy() {
        let broad_phase = populated();
        let changed = proxy(2, Vec3::splat(10.0), Vec3::splat(11.0), false);
        broad_phase.notify_bodies_layer_changed(&[changed]);
        assert_eq!(
            broad_phase.proxy(BodyId::new(2, 1)).map(|p| p.broad_phase_layer),
            Some(BP_NON_MOVING)
        );
    }

    #[test]
    fn test_cast_reports_first_hit_fraction() {
        let broad_phase = SweepAndPruneBroadPhase::new(2);
        let mut bodies = vec![proxy(0, Vec3::new(5.0, -1.0, -1.0), Vec3::new(6.0, 1.0, 1.0), false)];
        let state = broad_phase.add_bodies_prepare(&mut bodies);
        broad_phase.add_bodies_finalize(state);

        let mut hits = Vec::new();
        broad_phase.cast_aabox(
            &AABB::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5)),
            Vec3::new(10.0, 0.0, 0.0),
            &|_| true,
            &mut |body, fraction| hits.push((body.id, fraction)),
        );
        assert_eq!(hits.len(), 1);
        assert!((hits[0].1 - 0.45).abs() < 1e-5);
    }
}
