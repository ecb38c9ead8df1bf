// src/external.rs
//! Narrow contracts to the rest of the engine.
//!
//! The simulation consumes map geometry, effects, and sound only through
//! these traits. They are deliberately tiny: no trait method couples back
//! into simulation state, and every call is safe to ignore.

use glam::{Quat, Vec3};

use crate::body::ShapeDesc;

/// A piece of static world collision returned from a query.
#[derive(Debug, Clone)]
pub struct StaticShape {
    pub shape: ShapeDesc,
    pub position: Vec3,
    pub rotation: Quat,
}

/// Result of a ray/box cast against the static world.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceHit {
    pub point: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

/// "Give me the world collision near a point." Used to clone the linked
/// gateway's surroundings into a local environment and for destination
/// sanity checks.
pub trait WorldCollisionQuery {
    /// Static shapes whose bounds intersect a sphere around `center`.
    fn shapes_near(&self, center: Vec3, radius: f32) -> Vec<StaticShape>;

    /// Nearest static surface along a ray, if any.
    fn cast_ray(&self, origin: Vec3, dir: Vec3, max_dist: f32) -> Option<SurfaceHit>;
}

/// Fire-and-forget effect/sound dispatch. No return value, no coupling back
/// into the simulation.
pub trait EffectDispatch {
    fn play(&mut self, name: &str, position: Vec3, rotation: Quat);
}

/// Empty world: no static geometry, no hits. Default collaborator for tests
/// and the demo binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyWorld;

impl WorldCollisionQuery for EmptyWorld {
    fn shapes_near(&self, _center: Vec3, _radius: f32) -> Vec<StaticShape> {
        Vec::new()
    }

    fn cast_ray(&self, _origin: Vec3, _dir: Vec3, _max_dist: f32) -> Option<SurfaceHit> {
        None
    }
}

/// Logs dispatched effects instead of playing them.
#[derive(Debug, Default)]
pub struct LoggingEffects;

impl EffectDispatch for LoggingEffects {
    fn play(&mut self, name: &str, position: Vec3, _rotation: Quat) {
        log::debug!("effect '{}' at {:?}", name, position);
    }
}
