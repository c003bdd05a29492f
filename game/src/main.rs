//! Headless sandbox: drops a pile of bodies onto a floor and logs how they settle
//!
//! Usage: `sandbox [config.json] [seconds]`

use rigid_engine::prelude::*;
use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Frame times the sandbox pretends to render at
const FRAME_TIMES: [f32; 3] = [1.0 / 60.0, 1.0 / 45.0, 1.0 / 75.0];

/// Logs bodies going to sleep and waking up
#[derive(Default)]
struct SleepLogger {
    sleeping: AtomicU32,
}

impl BodyActivationListener for SleepLogger {
    fn on_body_activated(&self, id: BodyId, _user_data: u64) {
        tracing::debug!(%id, "Body woke up");
    }

    fn on_body_deactivated(&self, id: BodyId, _user_data: u64) {
        self.sleeping.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%id, "Body fell asleep");
    }
}

fn main() -> Result<(), ConfigError> {
    rigid_engine::init_logging();
    info!("Starting physics sandbox");

    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) => SceneConfig::load_from_file(path)?,
        None => SceneConfig::default(),
    };
    let seconds: f32 = match args.next() {
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(%value, "Invalid duration, using 10 seconds");
            10.0
        }),
        None => 10.0,
    };

    let mut scene = PhysicsScene::new(&config, LayerFilters::two_layer())?;
    let sleep_logger = Arc::new(SleepLogger::default());
    let listener: Arc<dyn BodyActivationListener> = sleep_logger.clone();
    scene.set_body_activation_listener(Some(listener));

    let bodies = create_demo_scene(&mut scene);
    scene.optimize_broad_phase();
    info!(bodies = bodies.len(), seconds, "Demo scene created");

    let accumulator = StepAccumulator::default();
    let mut elapsed = 0.0;
    let mut next_report = 0.0;
    let mut frame = 0usize;
    while elapsed < seconds {
        let frame_time = FRAME_TIMES[frame % FRAME_TIMES.len()];
        frame += 1;
        elapsed += frame_time;

        let steps = accumulator.accumulate(frame_time);
        if steps > 0 {
            let errors = scene.update(accumulator.fixed_timestep * steps as f32, steps);
            if !errors.is_empty() {
                warn!(?errors, "Scene ran out of capacity");
            }
        }

        if elapsed >= next_report {
            next_report += 1.0;
            report(&scene, &bodies, elapsed);
        }
    }

    report(&scene, &bodies, elapsed);
    info!(
        sleep_events = sleep_logger.sleeping.load(Ordering::Relaxed),
        contact_pairs = scene.num_contact_pairs(),
        "Sandbox finished"
    );
    Ok(())
}

/// Floor, a tower of boxes, a row of balls and a pendulum
fn create_demo_scene(scene: &mut PhysicsScene) -> Vec<BodyId> {
    let interface = scene.body_interface();
    let mut bodies = Vec::new();

    let floor = BodyCreateInfo::new(
        Shape::cuboid(Vec3::new(30.0, 1.0, 30.0)),
        Vec3::new(0.0, -1.0, 0.0),
        Quat::IDENTITY,
        MotionType::Static,
        NON_MOVING,
    );
    if let Err(error) = interface.create_and_add_body(&floor, Activation::DontActivate) {
        warn!(%error, "Failed to create floor");
        return bodies;
    }

    let box_shape = Shape::cuboid(Vec3::splat(0.5));
    for level in 0..5 {
        let position = Vec3::new(-4.0, 0.5 + level as f32 * 1.05, 0.0);
        let info = BodyCreateInfo::new(box_shape.clone(), position, Quat::IDENTITY, MotionType::Dynamic, MOVING);
        match interface.create_and_add_body(&info, Activation::Activate) {
            Ok(id) => bodies.push(id),
            Err(error) => warn!(%error, "Failed to create box"),
        }
    }

    let ball_shape = Shape::sphere(0.4);
    for i in 0..8 {
        let mut info = BodyCreateInfo::new(
            ball_shape.clone(),
            Vec3::new(i as f32 * 1.2, 3.0 + i as f32 * 0.5, 2.0),
            Quat::IDENTITY,
            MotionType::Dynamic,
            MOVING,
        );
        info.restitution = 0.3;
        match interface.create_and_add_body(&info, Activation::Activate) {
            Ok(id) => bodies.push(id),
            Err(error) => warn!(%error, "Failed to create ball"),
        }
    }

    let bob = BodyCreateInfo::new(
        Shape::capsule(0.2, 0.3),
        Vec3::new(6.0, 6.0, -3.0),
        Quat::IDENTITY,
        MotionType::Dynamic,
        MOVING,
    );
    let pendulum = interface.create_and_add_body(&bob, Activation::Activate);
    match pendulum {
        Ok(id) => {
            bodies.push(id);
            scene.add_constraint(Box::new(DistanceConstraint::new(
                BodyId::INVALID,
                id,
                Vec3::new(4.0, 6.0, -3.0),
                Vec3::ZERO,
                2.0,
                2.0,
            )));
        }
        Err(error) => warn!(%error, "Failed to create pendulum"),
    }

    bodies
}

fn report(scene: &PhysicsScene, bodies: &[BodyId], elapsed: f32) {
    let interface = scene.body_interface();
    let stats = scene.body_manager().body_stats();
    info!(
        elapsed,
        active = stats.num_active_bodies_dynamic,
        dynamic = stats.num_bodies_dynamic,
        "Scene state"
    );
    for id in bodies {
        let position = interface.get_position(*id);
        tracing::debug!(%id, ?position, active = interface.is_active(*id), "Body");
    }
}
