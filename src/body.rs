// src/body.rs
//! Body registry: identity, capability flags, and relation tables.
//!
//! Everything that used to be answered with a dynamic type check ("is this a
//! ragdoll", "is this a vehicle wheel") is answered here through a stable
//! capability-flag set. Cross references between bodies (parent hierarchy,
//! sub-body membership) are id -> id relation tables, so destruction of
//! either side is a lookup miss, never a dangling pointer.

use std::collections::HashMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::gateway::GatewayId;

/// Stable body identifier handed out by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(pub u32);

impl BodyId {
    #[inline]
    pub(crate) fn from_user_data(data: u128) -> BodyId {
        BodyId(data as u32)
    }

    #[inline]
    pub(crate) fn to_user_data(self) -> u128 {
        self.0 as u128
    }
}

/// Capability flag bits. Plain consts on a `u32`, same shape as a collision
/// layer mask.
pub mod body_flags {
    /// Participates in contact generation.
    pub const SOLID: u32 = 1 << 0;
    /// Sensor volume; fires trigger touches, produces no contact response.
    pub const TRIGGER: u32 = 1 << 1;
    /// Static world geometry (concave map collision). Never mirrored, never
    /// owned by a gateway environment.
    pub const WORLD_GEOMETRY: u32 = 1 << 2;
    /// Constrained to the world (ropes, mounted props). Two such bodies
    /// never collide with each other.
    pub const CONSTRAINED_TO_WORLD: u32 = 1 << 3;
    /// Player-controlled character.
    pub const PLAYER: u32 = 1 << 4;
    /// Multi-sub-body composite (ragdoll-like). Touch end must recount every
    /// sub-body pair.
    pub const COMPOSITE: u32 = 1 << 5;
    /// Vehicle wheel; collides with world geometry only.
    pub const VEHICLE_WHEEL: u32 = 1 << 6;
    /// Small loose debris, preferred target for the entity solver.
    pub const DEBRIS: u32 = 1 << 7;
    /// Sub-bodies of this body never collide with each other.
    pub const NO_SELF_COLLIDE: u32 = 1 << 8;
    /// Non-authoritative shadow clone. Never mirrored again.
    pub const MIRROR: u32 = 1 << 9;

    #[inline]
    pub fn has(flags: u32, bit: u32) -> bool {
        flags & bit != 0
    }
}

/// Shape description kept on the registry so a body can be rebuilt inside
/// any simulation environment (and serialized flat).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ShapeDesc {
    Cuboid { half_extents: [f32; 3] },
    Ball { radius: f32 },
    Capsule { half_height: f32, radius: f32 },
}

impl ShapeDesc {
    pub fn cuboid(half_extents: Vec3) -> Self {
        ShapeDesc::Cuboid {
            half_extents: half_extents.to_array(),
        }
    }

    pub fn ball(radius: f32) -> Self {
        ShapeDesc::Ball { radius }
    }
}

/// Static description of a registered body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyDesc {
    pub shape: ShapeDesc,
    pub flags: u32,
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
}

impl BodyDesc {
    pub fn new(shape: ShapeDesc, flags: u32) -> Self {
        Self {
            shape,
            flags,
            density: 1.0,
            friction: 0.5,
            restitution: 0.1,
        }
    }
}

/// Which simulation environment a body lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvId {
    /// The host world's own physics space.
    Main,
    /// The environment owned by one gateway.
    Gateway(GatewayId),
}

impl std::fmt::Display for EnvId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvId::Main => write!(f, "main"),
            EnvId::Gateway(g) => write!(f, "gateway {}", g.0),
        }
    }
}

/// Last-known kinematic state, updated after every step. `last_position`
/// lags one tick behind and feeds the implicit-velocity fallback.
#[derive(Debug, Clone, Copy)]
pub struct BodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub linvel: Vec3,
    pub angvel: Vec3,
    pub last_position: Vec3,
    /// Legacy entity velocity supplied by the host for bodies without live
    /// rigid dynamics (parented props, animation-driven movers).
    pub legacy_velocity: Vec3,
}

impl BodyState {
    fn at(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            linvel: Vec3::ZERO,
            angvel: Vec3::ZERO,
            last_position: position,
            legacy_velocity: Vec3::ZERO,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BodyRecord {
    pub desc: BodyDesc,
    pub state: BodyState,
    /// Parent in the rigid hierarchy, if any. Bodies sharing a root never
    /// collide with each other.
    pub parent: Option<BodyId>,
    /// Sub-bodies of a composite; used by the touch recount.
    pub sub_bodies: SmallVec<[BodyId; 4]>,
    pub alive: bool,
}

/// Registry of every body the subsystem tracks.
#[derive(Debug, Default)]
pub struct BodyRegistry {
    records: HashMap<BodyId, BodyRecord>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: BodyId, desc: BodyDesc, position: Vec3, rotation: Quat) {
        let record = BodyRecord {
            desc,
            state: BodyState::at(position, rotation),
            parent: None,
            sub_bodies: SmallVec::new(),
            alive: true,
        };
        if self.records.insert(id, record).is_some() {
            log::warn!("body {} re-registered, previous record replaced", id.0);
        }
    }

    pub fn unregister(&mut self, id: BodyId) -> bool {
        if let Some(rec) = self.records.remove(&id) {
            // Detach children so their root lookup falls back to themselves.
            for sub in rec.sub_bodies {
                if let Some(child) = self.records.get_mut(&sub) {
                    child.parent = None;
                }
            }
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = BodyId> + '_ {
        self.records.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn flags(&self, id: BodyId) -> u32 {
        self.records.get(&id).map(|r| r.desc.flags).unwrap_or(0)
    }

    pub fn desc(&self, id: BodyId) -> Option<&BodyDesc> {
        self.records.get(&id).map(|r| &r.desc)
    }

    pub fn state(&self, id: BodyId) -> Option<&BodyState> {
        self.records.get(&id).map(|r| &r.state)
    }

    pub fn state_mut(&mut self, id: BodyId) -> Option<&mut BodyState> {
        self.records.get_mut(&id).map(|r| &mut r.state)
    }

    /// Establish a rigid hierarchy link. Children of the same root are
    /// excluded from mutual collision.
    pub fn set_parent(&mut self, child: BodyId, parent: Option<BodyId>) {
        if let Some(old) = self.records.get(&child).and_then(|r| r.parent) {
            if let Some(rec) = self.records.get_mut(&old) {
                rec.sub_bodies.retain(|b| *b != child);
            }
        }
        if let Some(rec) = self.records.get_mut(&child) {
            rec.parent = parent;
        }
        if let Some(p) = parent {
            if let Some(rec) = self.records.get_mut(&p) {
                if !rec.sub_bodies.contains(&child) {
                    rec.sub_bodies.push(child);
                }
            }
        }
    }

    /// Root of the rigid hierarchy containing `id` (itself if unparented).
    pub fn hierarchy_root(&self, id: BodyId) -> BodyId {
        let mut cur = id;
        // Bounded walk; cycles would be a host bug, not ours to loop on.
        for _ in 0..16 {
            match self.records.get(&cur).and_then(|r| r.parent) {
                Some(p) => cur = p,
                None => break,
            }
        }
        cur
    }

    /// True if the two bodies share a hierarchical root.
    pub fn shares_parent(&self, a: BodyId, b: BodyId) -> bool {
        if a == b {
            return true;
        }
        self.hierarchy_root(a) == self.hierarchy_root(b)
    }

    /// All sub-bodies in `id`'s hierarchy, including the root itself.
    pub fn hierarchy_members(&self, id: BodyId) -> SmallVec<[BodyId; 4]> {
        let root = self.hierarchy_root(id);
        let mut out: SmallVec<[BodyId; 4]> = SmallVec::new();
        out.push(root);
        let mut i = 0;
        while i < out.len() {
            if let Some(rec) = self.records.get(&out[i]) {
                for sub in &rec.sub_bodies {
                    if !out.contains(sub) {
                        out.push(*sub);
                    }
                }
            }
            i += 1;
        }
        out
    }

    /// Record the host-supplied legacy velocity for a body.
    pub fn set_legacy_velocity(&mut self, id: BodyId, vel: Vec3) {
        if let Some(state) = self.state_mut(id) {
            state.legacy_velocity = vel;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg_with(ids: &[u32]) -> BodyRegistry {
        let mut reg = BodyRegistry::new();
        for &i in ids {
            reg.register(
                BodyId(i),
                BodyDesc::new(ShapeDesc::ball(0.5), body_flags::SOLID),
                Vec3::ZERO,
                Quat::IDENTITY,
            );
        }
        reg
    }

    #[test]
    fn test_hierarchy_root_and_sharing() {
        let mut reg = reg_with(&[1, 2, 3, 4]);
        reg.set_parent(BodyId(2), Some(BodyId(1)));
        reg.set_parent(BodyId(3), Some(BodyId(2)));
        assert_eq!(reg.hierarchy_root(BodyId(3)), BodyId(1));
        assert!(reg.shares_parent(BodyId(2), BodyId(3)));
        assert!(!reg.shares_parent(BodyId(3), BodyId(4)));
    }

    #[test]
    fn test_unregister_detaches_children() {
        let mut reg = reg_with(&[1, 2]);
        reg.set_parent(BodyId(2), Some(BodyId(1)));
        assert!(reg.unregister(BodyId(1)));
        assert_eq!(reg.hierarchy_root(BodyId(2)), BodyId(2));
        assert!(!reg.shares_parent(BodyId(1), BodyId(2)));
    }

    #[test]
    fn test_hierarchy_members_collects_all() {
        let mut reg = reg_with(&[1, 2, 3]);
        reg.set_parent(BodyId(2), Some(BodyId(1)));
        reg.set_parent(BodyId(3), Some(BodyId(1)));
        let members = reg.hierarchy_members(BodyId(3));
        assert_eq!(members.len(), 3);
        assert!(members.contains(&BodyId(1)));
        assert!(members.contains(&BodyId(2)));
    }
}
