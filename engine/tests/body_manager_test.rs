//! Integration tests for body registration, slot reuse and the active set

use glam::{Quat, Vec3};
use rigid_engine::physics::body::{
    BodyActivationListener, BodyCreateInfo, BodyError, BodyId, BodyLockInterfaceLocking,
    BodyLockRead, BodyManager, MotionType,
};
use rigid_engine::physics::collision::layers::{TwoLayerSetup, MOVING, NON_MOVING};
use rigid_engine::physics::collision::shapes::Shape;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn create_manager(max_bodies: u32, num_body_mutexes: u32) -> Arc<BodyManager> {
    Arc::new(BodyManager::new(max_bodies, num_body_mutexes, Arc::new(TwoLayerSetup)))
}

fn static_info() -> BodyCreateInfo {
    BodyCreateInfo::new(Shape::sphere(0.5), Vec3::ZERO, Quat::IDENTITY, MotionType::Static, NON_MOVING)
}

fn dynamic_info(position: Vec3) -> BodyCreateInfo {
    BodyCreateInfo::new(Shape::sphere(0.5), position, Quat::IDENTITY, MotionType::Dynamic, MOVING)
}

fn add_dynamic(manager: &BodyManager, count: u32) -> Vec<BodyId> {
    (0..count)
        .map(|i| {
            let body = manager.allocate_body(&dynamic_info(Vec3::new(i as f32 * 2.0, 0.0, 0.0)));
            manager.add_body(body).expect("Failed to add body")
        })
        .collect()
}

/// Check that every active body sits where its back index says it does
fn assert_active_set_consistent(manager: &BodyManager) {
    let active = manager.active_bodies();
    assert_eq!(active.len() as u32, manager.num_active_bodies());
    for (position, id) in active.iter().enumerate() {
        assert_eq!(manager.active_index_of(*id), Some(position as u32));
    }
}

#[derive(Default)]
struct CountingListener {
    activated: AtomicU32,
    deactivated: AtomicU32,
}

impl BodyActivationListener for CountingListener {
    fn on_body_activated(&self, _id: BodyId, _user_data: u64) {
        self.activated.fetch_add(1, Ordering::SeqCst);
    }

    fn on_body_deactivated(&self, _id: BodyId, _user_data: u64) {
        self.deactivated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Small deterministic generator for the random operation sequence
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn test_custom_ids_and_slot_reuse() {
    let manager = create_manager(4, 1);
    let locks = BodyLockInterfaceLocking::new(manager.clone());

    let ids: Vec<BodyId> = (0..4)
        .map(|index| {
            let body = manager.allocate_body(&static_info());
            manager
                .add_body_with_custom_id(body, BodyId::new(index, 1))
                .expect("Failed to add body with custom id")
        })
        .collect();
    assert_eq!(manager.num_bodies(), 4);

    manager.destroy_bodies(&[ids[1]]);
    assert_eq!(manager.num_bodies(), 3);
    assert!(!BodyLockRead::new(&locks, ids[1]).succeeded());

    // The freed slot is reused with a new sequence number
    let reused = manager
        .add_body(manager.allocate_body(&static_info()))
        .expect("Failed to reuse slot");
    assert_eq!(reused.index(), 1);
    assert_ne!(reused.sequence(), ids[1].sequence());
    assert_ne!(reused, ids[1]);

    // The stale id still does not resolve
    assert!(!BodyLockRead::new(&locks, ids[1]).succeeded());
    assert!(BodyLockRead::new(&locks, reused).succeeded());
}

#[test]
fn test_capacity_exhausted() {
    let manager = create_manager(4, 2);
    for _ in 0..4 {
        manager
            .add_body(manager.allocate_body(&static_info()))
            .expect("Failed to add body");
    }

    let result = manager.try_add_body(manager.allocate_body(&static_info()));
    match result {
        Err((BodyError::CapacityExhausted { max_bodies }, body)) => {
            assert_eq!(max_bodies, 4);
            // The body comes back unregistered
            assert!(!body.id().is_valid());
        }
        other => panic!("expected capacity error, got {:?}", other.map_err(|(e, _)| e)),
    }
    assert_eq!(manager.num_bodies(), 4);
}

#[test]
fn test_custom_id_errors() {
    let manager = create_manager(8, 2);
    manager
        .add_body_with_custom_id(manager.allocate_body(&static_info()), BodyId::new(2, 5))
        .expect("Failed to add body");

    let in_use = manager.add_body_with_custom_id(manager.allocate_body(&static_info()), BodyId::new(2, 6));
    assert!(matches!(in_use, Err(BodyError::BodyIdInUse(_))));

    let out_of_range = manager.add_body_with_custom_id(manager.allocate_body(&static_info()), BodyId::new(8, 1));
    assert!(matches!(out_of_range, Err(BodyError::InvalidBodyId(_))));

    let invalid = manager.add_body_with_custom_id(manager.allocate_body(&static_info()), BodyId::INVALID);
    assert!(matches!(invalid, Err(BodyError::InvalidBodyId(_))));

    assert_eq!(manager.num_bodies(), 1);
}

#[test]
fn test_custom_id_past_end_fills_free_list() {
    let manager = create_manager(4, 1);
    manager
        .add_body_with_custom_id(manager.allocate_body(&static_info()), BodyId::new(3, 1))
        .expect("Failed to add body");

    let stats = manager.slot_stats();
    assert_eq!(stats.num_bodies, 1);
    assert_eq!(stats.free_list_len, 3);
    assert_eq!(stats.slot_array_size, 4);

    // The skipped slots are handed out before capacity runs out
    let mut indices: Vec<u32> = (0..3)
        .map(|_| {
            manager
                .add_body(manager.allocate_body(&static_info()))
                .expect("Failed to add body")
                .index()
        })
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2]);

    assert!(manager.add_body(manager.allocate_body(&static_info())).is_err());
    assert_eq!(manager.slot_stats().free_list_len, 0);
}

#[test]
fn test_lookup_returns_matching_body() {
    let manager = create_manager(16, 4);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let ids = add_dynamic(&manager, 10);

    for id in &ids {
        let lock = BodyLockRead::new(&locks, *id);
        assert_eq!(lock.body().map(|body| body.id()), Some(*id));
    }

    let mut registered = manager.body_ids();
    registered.sort_by_key(|id| id.index());
    assert_eq!(registered, ids);
}

#[test]
fn test_random_add_remove_keeps_free_list_intact() {
    const MAX_BODIES: u32 = 64;
    let manager = create_manager(MAX_BODIES, 8);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
    let mut live: Vec<BodyId> = Vec::new();

    for _ in 0..2000 {
        if !live.is_empty() && rng.next() % 3 == 0 {
            let victim = live.swap_remove((rng.next() % live.len() as u64) as usize);
            manager.destroy_bodies(&[victim]);
            assert!(!BodyLockRead::new(&locks, victim).succeeded());
        } else {
            let result = manager.add_body(manager.allocate_body(&static_info()));
            if live.len() < MAX_BODIES as usize {
                live.push(result.expect("Failed to add body below capacity"));
            } else {
                assert!(matches!(result, Err(BodyError::CapacityExhausted { .. })));
            }
        }

        let stats = manager.slot_stats();
        assert_eq!(stats.num_bodies + stats.free_list_len, stats.slot_array_size);
        assert_eq!(stats.num_bodies as usize, live.len());
        manager.validate_free_list();
    }

    let registered: HashSet<BodyId> = manager.body_ids().into_iter().collect();
    let expected: HashSet<BodyId> = live.iter().copied().collect();
    assert_eq!(registered, expected);
}

#[test]
fn test_active_set_stays_consistent() {
    let manager = create_manager(32, 4);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let ids = add_dynamic(&manager, 12);

    manager.activate_bodies(&ids, &locks);
    assert_eq!(manager.num_active_bodies(), 12);
    assert_active_set_consistent(&manager);

    // Remove from the front, the middle and the end of the active array
    manager.deactivate_bodies(&[ids[0], ids[5], ids[11]], &locks);
    assert_eq!(manager.num_active_bodies(), 9);
    assert_active_set_consistent(&manager);
    assert!(!manager.is_active(ids[5]));
    assert!(manager.is_active(ids[6]));

    manager.activate_bodies(&[ids[5]], &locks);
    assert_active_set_consistent(&manager);

    manager.deactivate_bodies(&ids, &locks);
    assert_eq!(manager.num_active_bodies(), 0);
    assert!(manager.active_bodies().is_empty());
}

#[test]
fn test_static_bodies_never_become_active() {
    let manager = create_manager(8, 2);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let id = manager
        .add_body(manager.allocate_body(&static_info()))
        .expect("Failed to add body");

    manager.activate_bodies(&[id], &locks);
    assert!(!manager.is_active(id));
    assert_eq!(manager.num_active_bodies(), 0);
}

#[test]
fn test_activation_listener_fires_once_per_change() {
    let manager = create_manager(8, 2);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let listener = Arc::new(CountingListener::default());
    let registered: Arc<dyn BodyActivationListener> = listener.clone();
    manager.set_body_activation_listener(Some(registered));

    let ids = add_dynamic(&manager, 2);
    let floor = manager
        .add_body(manager.allocate_body(&static_info()))
        .expect("Failed to add body");

    manager.activate_bodies(&ids, &locks);
    manager.activate_bodies(&ids, &locks);
    manager.activate_bodies(&[floor], &locks);
    assert_eq!(listener.activated.load(Ordering::SeqCst), 2);

    manager.deactivate_bodies(&[ids[0]], &locks);
    manager.deactivate_bodies(&[ids[0]], &locks);
    assert_eq!(listener.deactivated.load(Ordering::SeqCst), 1);

    manager.set_body_activation_listener(None);
    manager.activate_bodies(&[ids[0]], &locks);
    assert_eq!(listener.activated.load(Ordering::SeqCst), 2);
}

#[test]
fn test_body_stats() {
    let manager = create_manager(16, 4);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let dynamic = add_dynamic(&manager, 3);
    manager
        .add_body(manager.allocate_body(&static_info()))
        .expect("Failed to add body");
    let kinematic = BodyCreateInfo {
        motion_type: MotionType::Kinematic,
        ..dynamic_info(Vec3::new(0.0, 5.0, 0.0))
    };
    manager
        .add_body(manager.allocate_body(&kinematic))
        .expect("Failed to add body");

    manager.activate_bodies(&dynamic[..2], &locks);

    let stats = manager.body_stats();
    assert_eq!(stats.num_bodies, 5);
    assert_eq!(stats.max_bodies, 16);
    assert_eq!(stats.num_bodies_static, 1);
    assert_eq!(stats.num_bodies_dynamic, 3);
    assert_eq!(stats.num_active_bodies_dynamic, 2);
    assert_eq!(stats.num_bodies_kinematic, 1);
    assert_eq!(stats.num_active_bodies_kinematic, 0);
}

#[test]
fn test_removed_bodies_are_returned_unregistered() {
    let manager = create_manager(8, 2);
    let ids = add_dynamic(&manager, 3);

    let removed = manager.remove_bodies(&[ids[0], ids[2], BodyId::new(7, 9)]);
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|body| !body.id().is_valid()));
    assert_eq!(manager.num_bodies(), 1);

    // A returned body can be registered again
    let body = removed.into_iter().next().expect("removed body");
    let id = manager.add_body(body).expect("Failed to re-add body");
    assert!(id.is_valid());
    assert_eq!(manager.num_bodies(), 2);
}
