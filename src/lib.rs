// src/lib.rs
//! riftgate: cross-portal physics simulation.
//!
//! Two linked spatial gateways, each backed by its own physics environment,
//! with exclusive per-body ownership arbitration, kinematic shadow-clone
//! mirrors on the far side, unified collision event routing, and an atomic
//! teleport protocol that carries position, orientation, and velocity
//! through the gateway transform in a single step.
//!
//! The host drives everything through [`PortalSim`]: register bodies, place
//! and link gateways, call [`PortalSim::step`] at a fixed rate, and drain
//! the event queues afterwards.

pub mod body;
pub mod config;
pub mod coordinator;
pub mod environment;
pub mod error;
pub mod external;
pub mod gateway;
pub mod math;
pub mod mirror;
pub mod router;
pub mod save;
pub mod trigger;

pub use body::{body_flags, BodyDesc, BodyId, BodyRegistry, BodyState, EnvId, ShapeDesc};
pub use config::SimulationConfig;
pub use coordinator::{PortalSim, StepMetrics, TeleportNotice};
pub use environment::{EnvStage, SimulationEnvironment};
pub use error::{Error, Result};
pub use external::{
    EffectDispatch, EmptyWorld, LoggingEffects, StaticShape, SurfaceHit, WorldCollisionQuery,
};
pub use gateway::{Gateway, GatewayId, GatewaySet};
pub use math::{GatewayPose, Plane, TransformPair};
pub use mirror::{Mirror, MirrorId, MirrorSet, MirrorTag};
pub use router::{
    CollisionRouter, DamageEvent, DeferredOp, FrictionEvent, PenetrationEvent, PenetrationPhase,
    TouchEvent,
};
pub use trigger::{OwnershipChange, OwnershipTable, TriggerTracker};
