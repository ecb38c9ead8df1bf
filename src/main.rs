// src/main.rs
//! Demo: fling a crate through a pair of linked gateways and print what the
//! subsystem reports. Run with RUST_LOG=debug for the full play-by-play.

use glam::{Quat, Vec3};
use std::f32::consts::FRAC_PI_2;

use riftgate::{
    body_flags, BodyDesc, BodyId, EmptyWorld, GatewayPose, LoggingEffects, PortalSim, ShapeDesc,
    SimulationConfig,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = SimulationConfig::default();
    config.gravity = [0.0, 0.0, 0.0];
    let mut sim = PortalSim::new(config);

    // Orange on a wall at the origin facing +X, blue far away facing back.
    let orange = sim.add_gateway(
        GatewayPose::new(Vec3::ZERO, Quat::from_rotation_y(-FRAC_PI_2)),
        0.5,
        1.0,
    );
    let blue = sim.add_gateway(
        GatewayPose::new(Vec3::new(50.0, 0.0, 0.0), Quat::from_rotation_y(FRAC_PI_2)),
        0.5,
        1.0,
    );
    if let Err(err) = sim.link_gateways(orange, blue) {
        log::error!("link failed: {}", err);
        return;
    }

    let crate_body = BodyId(1);
    sim.add_body(
        crate_body,
        BodyDesc::new(ShapeDesc::cuboid(Vec3::splat(0.2)), body_flags::SOLID),
        Vec3::new(-2.0, 0.0, 0.0),
        Quat::IDENTITY,
    );
    sim.set_body_velocity(crate_body, Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO);

    let mut effects = LoggingEffects;
    for _ in 0..180 {
        sim.step(&EmptyWorld, &mut effects);
        for notice in sim.take_teleports() {
            log::info!(
                "tick {}: body {} went through gateway {} -> {}, exit velocity {:?}",
                notice.tick,
                notice.body.0,
                notice.from.0,
                notice.to.0,
                notice.velocity
            );
        }
        for touch in sim.take_touch_events() {
            log::debug!(
                "touch {} body {} / body {}",
                if touch.started { "start" } else { "end" },
                touch.a.0,
                touch.b.0
            );
        }
    }

    let state = sim.body_state(crate_body).expect("crate still registered");
    log::info!(
        "final: position {:?}, velocity {:?}, owner {}",
        state.position,
        state.linvel,
        sim.owner_of(crate_body)
    );
    match serde_json::to_string_pretty(&sim.metrics()) {
        Ok(json) => println!("{}", json),
        Err(err) => log::error!("metrics serialization failed: {}", err),
    }
}
