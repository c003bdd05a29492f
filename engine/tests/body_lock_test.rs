//! Concurrency tests for the striped body locks and the active set

use glam::{Quat, Vec3};
use rigid_engine::physics::body::{
    BodyCreateInfo, BodyId, BodyLockInterfaceLocking, BodyLockInterfaceNoLock, BodyLockMultiWrite,
    BodyLockRead, BodyLockWrite, BodyManager, MotionType,
};
use rigid_engine::physics::collision::layers::{TwoLayerSetup, MOVING};
use rigid_engine::physics::collision::shapes::Shape;
use std::sync::Arc;
use std::thread;

const THREADS: usize = 8;
const ITERATIONS: u64 = 500;

fn setup(num_bodies: u32, num_body_mutexes: u32) -> (Arc<BodyManager>, Vec<BodyId>) {
    let manager = Arc::new(BodyManager::new(64, num_body_mutexes, Arc::new(TwoLayerSetup)));
    let ids = (0..num_bodies)
        .map(|i| {
            let info = BodyCreateInfo::new(
                Shape::sphere(0.5),
                Vec3::new(i as f32 * 2.0, 0.0, 0.0),
                Quat::IDENTITY,
                MotionType::Dynamic,
                MOVING,
            );
            manager
                .add_body(manager.allocate_body(&info))
                .expect("Failed to add body")
        })
        .collect();
    (manager, ids)
}

fn user_data(locks: &BodyLockInterfaceLocking, id: BodyId) -> u64 {
    BodyLockRead::new(locks, id)
        .body()
        .map(|body| body.user_data())
        .unwrap_or_default()
}

#[test]
fn test_concurrent_writers_are_exclusive() {
    let (manager, ids) = setup(1, 4);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let id = ids[0];

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..ITERATIONS {
                    let mut lock = BodyLockWrite::new(&locks, id);
                    if let Some(body) = lock.body_mut() {
                        // Split read and write so a lost update would show
                        let value = body.user_data();
                        thread::yield_now();
                        body.set_user_data(value + 1);
                    }
                }
            });
        }
    });

    assert_eq!(user_data(&locks, id), THREADS as u64 * ITERATIONS);
}

#[test]
fn test_multi_locks_in_opposite_order_do_not_deadlock() {
    let (manager, ids) = setup(6, 4);
    let locks = BodyLockInterfaceLocking::new(manager.clone());
    let forward = ids.clone();
    let backward: Vec<BodyId> = ids.iter().rev().copied().collect();

    thread::scope(|scope| {
        for thread_index in 0..THREADS {
            let order = if thread_index % 2 == 0 { &forward } else { &backward };
            let locks = &locks;
            scope.spawn(move || {
                for _ in 0..ITERATIONS {
                    let mut lock = BodyLockMultiWrite::new(locks, order);
                    for i in 0..lock.len() {
                        if let Some(body) = lock.body_mut(i) {
                            let value = body.user_data();
                            body.set_user_data(value + 1);
                        }
                    }
                }
            });
        }
    });

    for id in &ids {
        assert_eq!(user_data(&locks, *id), THREADS as u64 * ITERATIONS);
    }
}

#[test]
fn test_single_stripe_serializes_everything() {
    let (manager, ids) = setup(4, 1);
    assert_eq!(manager.body_mutexes().num_mutexes(), 1);
    let locks = BodyLockInterfaceLocking::new(manager.clone());

    thread::scope(|scope| {
        for thread_index in 0..THREADS {
            let id = ids[thread_index % ids.len()];
            let locks = &locks;
            scope.spawn(move || {
                for _ in 0..ITERATIONS {
                    let mut lock = BodyLockWrite::new(locks, id);
                    if let Some(body) = lock.body_mut() {
                        let value = body.user_data();
                        body.set_user_data(value + 1);
                    }
                }
            });
        }
    });

    let total: u64 = ids.iter().map(|id| user_data(&locks, *id)).sum();
    assert_eq!(total, THREADS as u64 * ITERATIONS);
}

#[test]
fn test_concurrent_activation_builds_consistent_active_set() {
    let (manager, ids) = setup(48, 8);
    let locks = BodyLockInterfaceLocking::new(manager.clone());

    thread::scope(|scope| {
        for chunk in ids.chunks(6) {
            let manager = &manager;
            let locks = &locks;
            scope.spawn(move || {
                for id in chunk {
                    manager.activate_bodies(&[*id], locks);
                }
            });
        }
    });

    assert_eq!(manager.num_active_bodies(), 48);
    let active = manager.active_bodies();
    for (position, id) in active.iter().enumerate() {
        assert_eq!(manager.active_index_of(*id), Some(position as u32));
    }

    // Deactivate half from several threads at once
    thread::scope(|scope| {
        for chunk in ids.chunks(12) {
            let manager = &manager;
            let locks = &locks;
            scope.spawn(move || manager.deactivate_bodies(&chunk[..6], locks));
        }
    });

    assert_eq!(manager.num_active_bodies(), 24);
    let active = manager.active_bodies();
    assert_eq!(active.len(), 24);
    for (position, id) in active.iter().enumerate() {
        assert_eq!(manager.active_index_of(*id), Some(position as u32));
    }
}

#[test]
fn test_readers_see_complete_active_entries() {
    let (manager, ids) = setup(32, 4);
    let locks = BodyLockInterfaceLocking::new(manager.clone());

    thread::scope(|scope| {
        let writer_manager = &manager;
        let writer_locks = &locks;
        let writer_ids = &ids;
        scope.spawn(move || {
            for id in writer_ids {
                writer_manager.activate_bodies(&[*id], writer_locks);
            }
        });

        // Index below the published count without the active-body mutex;
        // every entry there must already be a registered body
        let reader_manager = &manager;
        scope.spawn(move || {
            let mut seen = 0;
            while seen < 32 {
                let count = reader_manager.num_active_bodies();
                assert!(count >= seen, "count went backwards");
                for index in 0..count {
                    let id = reader_manager.active_body_at(index);
                    assert!(id.is_valid(), "entry {index} read before it was written");
                    assert!(id.index() < 32);
                }
                seen = count;
            }
        });
    });

    assert_eq!(manager.num_active_bodies(), 32);
    let mut active: Vec<u32> = (0..32).map(|i| manager.active_body_at(i).index()).collect();
    active.sort_unstable();
    assert_eq!(active, (0..32).collect::<Vec<u32>>());
}

#[test]
fn test_no_lock_interface_reads_and_writes() {
    let (manager, ids) = setup(2, 2);
    // SAFETY: this test is single threaded
    let locks = unsafe { BodyLockInterfaceNoLock::new(manager.clone()) };

    {
        let mut lock = BodyLockWrite::new(&locks, ids[1]);
        if let Some(body) = lock.body_mut() {
            body.set_user_data(7);
        }
    }

    let lock = BodyLockRead::new(&locks, ids[1]);
    assert_eq!(lock.body().map(|body| body.user_data()), Some(7));
    assert!(!BodyLockRead::new(&locks, BodyId::INVALID).succeeded());
}
