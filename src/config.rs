// src/config.rs
//! Tunable parameters for the whole subsystem, in one serde-friendly struct.
//!
//! Defaults match the values the simulation was tuned against. Hosts load a
//! config once at world init and hand it to [`crate::PortalSim::new`]; nothing
//! reads tunables from ambient globals.

use serde::{Deserialize, Serialize};

/// Configuration for the portal simulation subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Fixed simulation timestep in seconds.
    pub fixed_dt: f32,

    /// Process-wide cap on live mirrors. Requests past this are refused with
    /// a logged diagnostic, never a crash.
    pub mirror_budget: usize,

    /// Maximum gateway pairs that may be linked at once.
    pub max_linked_gateways: usize,

    /// Iteration bound for the end-of-step deferred queue drain loop.
    pub drain_bound: usize,

    /// Seconds of sustained penetration before the per-pair machine escalates
    /// out of its initial state.
    pub penetration_escalate_secs: f32,

    /// Seconds a solver phase gets to separate a pair before the machine
    /// moves to the next escalation.
    pub penetration_solver_secs: f32,

    /// Seconds without penetration before a disabled pair is re-enabled.
    pub penetration_clear_secs: f32,

    /// Depth (in meters) below which contact overlap is not treated as
    /// penetration at all.
    pub penetration_slop: f32,

    /// Half-depth of the proximity cloning trigger volume, along the gateway
    /// normal.
    pub trigger_depth: f32,

    /// Scale applied to the opening half-extents to size the trigger volume.
    pub trigger_scale: f32,

    /// Extra scale for the eager wake-and-pre-touch sweep volume.
    pub pretouch_scale: f32,

    /// Minimum exit speed when teleporting floor gateway -> floor gateway.
    pub min_speed_floor_to_floor: f32,

    /// Minimum exit speed when teleporting floor gateway -> wall/ceiling.
    pub min_speed_floor_to_other: f32,

    /// Minimum exit speed for players leaving a floor gateway.
    pub min_speed_player: f32,

    /// Hard cap on teleport exit speed.
    pub max_teleport_speed: f32,

    /// Depth of the collision "tube" generated behind a gateway plane.
    pub tube_depth: f32,

    /// Thickness of the generated hole-frame wall colliders.
    pub wall_thickness: f32,

    /// Radius around a linked gateway within which static world collision is
    /// cloned into the local environment.
    pub linked_collision_radius: f32,

    /// Gravity applied inside every simulation environment.
    pub gravity: [f32; 3],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            mirror_budget: 200,
            max_linked_gateways: 4,
            drain_bound: 20,
            penetration_escalate_secs: 3.0,
            penetration_solver_secs: 1.5,
            penetration_clear_secs: 1.0,
            penetration_slop: 0.005,
            trigger_depth: 1.0,
            trigger_scale: 1.25,
            pretouch_scale: 1.5,
            min_speed_floor_to_floor: 0.5,
            min_speed_floor_to_other: 2.0,
            min_speed_player: 3.0,
            max_teleport_speed: 60.0,
            tube_depth: 2.0,
            wall_thickness: 0.1,
            linked_collision_radius: 4.0,
            gravity: [0.0, -9.81, 0.0],
        }
    }
}

impl SimulationConfig {
    #[inline]
    pub fn gravity_vec(&self) -> glam::Vec3 {
        glam::Vec3::from_array(self.gravity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_json() {
        let cfg = SimulationConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SimulationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mirror_budget, 200);
        assert_eq!(back.drain_bound, 20);
        assert!((back.fixed_dt - 1.0 / 60.0).abs() < 1e-9);
    }
}
