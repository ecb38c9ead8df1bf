// src/mirror.rs
//! Shadow-clone mirrors.
//!
//! A mirror is a kinematic stand-in for a body that physically lives in
//! another environment. It is pushed to the source's transformed pose every
//! tick, shoves dynamic bodies around on its side of a gateway, and is never
//! authoritative: damage, pickup, and death all redirect to the source.
//!
//! Creation is budgeted process-wide. An over-budget or ineligible request
//! returns `None` with a logged diagnostic; neither is an error.

use std::collections::HashMap;

use glam::Affine3A;
use smallvec::SmallVec;

use crate::body::{body_flags as bf, BodyDesc, BodyId, BodyRegistry, EnvId};
use crate::environment::SimulationEnvironment;
use crate::gateway::GatewayId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirrorId(pub u32);

/// Why a mirror exists; gateway mirrors track their gateway's transform,
/// fixed mirrors keep the transform they were created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorTag {
    Gateway(GatewayId),
    Fixed,
}

#[derive(Debug, Clone)]
pub struct Mirror {
    pub id: MirrorId,
    /// Authoritative body being shadowed.
    pub source: BodyId,
    /// Registered id of the shadow body itself.
    pub body: BodyId,
    pub env: EnvId,
    pub tag: MirrorTag,
    /// Source world -> mirror world.
    pub transform: Affine3A,
}

/// Body-id range reserved for shadow bodies, disjoint from host ids.
const MIRROR_BODY_BASE: u32 = 0x4000_0000;

/// Capability flags a mirror inherits from its source.
const INHERITED_FLAGS: u32 =
    bf::SOLID | bf::TRIGGER | bf::COMPOSITE | bf::PLAYER | bf::DEBRIS | bf::NO_SELF_COLLIDE;

#[derive(Debug)]
pub struct MirrorSet {
    budget: usize,
    mirrors: HashMap<MirrorId, Mirror>,
    by_source: HashMap<BodyId, SmallVec<[MirrorId; 2]>>,
    by_body: HashMap<BodyId, MirrorId>,
    next_mirror: u32,
    next_body: u32,
}

impl MirrorSet {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            mirrors: HashMap::new(),
            by_source: HashMap::new(),
            by_body: HashMap::new(),
            next_mirror: 0,
            next_body: MIRROR_BODY_BASE,
        }
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn budget_remaining(&self) -> usize {
        self.budget.saturating_sub(self.mirrors.len())
    }

    /// Create a shadow of `source` inside `env`, posed through `transform`.
    /// Returns `None` when the source is ineligible or the budget is spent.
    pub fn create(
        &mut self,
        registry: &mut BodyRegistry,
        env: &mut SimulationEnvironment,
        source: BodyId,
        tag: MirrorTag,
        transform: Affine3A,
    ) -> Option<MirrorId> {
        let flags = registry.flags(source);
        if bf::has(flags, bf::WORLD_GEOMETRY) {
            log::debug!("mirror refused: body {} is static world geometry", source.0);
            return None;
        }
        if bf::has(flags, bf::MIRROR) {
            log::debug!("mirror refused: body {} is itself a mirror", source.0);
            return None;
        }
        if flags & (bf::SOLID | bf::TRIGGER) == 0 {
            log::debug!("mirror refused: body {} is neither solid nor trigger", source.0);
            return None;
        }
        if bf::has(flags, bf::CONSTRAINED_TO_WORLD) {
            log::debug!("mirror refused: body {} is constrained to the world", source.0);
            return None;
        }
        if self.mirrors.len() >= self.budget {
            log::warn!(
                "mirror budget exhausted ({} live), refusing shadow of body {}",
                self.budget,
                source.0
            );
            return None;
        }

        let src_desc = registry.desc(source)?.clone();
        let src_state = *registry.state(source)?;

        let id = MirrorId(self.next_mirror);
        self.next_mirror += 1;
        let body = BodyId(self.next_body);
        self.next_body += 1;

        let position = transform.transform_point3(src_state.position);
        let (_, t_rot, _) = transform.to_scale_rotation_translation();
        let rotation = (t_rot * src_state.rotation).normalize();

        let desc = BodyDesc {
            flags: (src_desc.flags & INHERITED_FLAGS) | bf::MIRROR,
            ..src_desc
        };
        registry.register(body, desc.clone(), position, rotation);
        env.insert_kinematic(body, &desc, position, rotation);

        let mirror = Mirror {
            id,
            source,
            body,
            env: env.env_id,
            tag,
            transform,
        };
        self.mirrors.insert(id, mirror);
        self.by_source.entry(source).or_default().push(id);
        self.by_body.insert(body, id);
        Some(id)
    }

    /// Remove one mirror, tearing down its shadow body everywhere.
    pub fn remove(
        &mut self,
        id: MirrorId,
        registry: &mut BodyRegistry,
        env: &mut SimulationEnvironment,
    ) -> bool {
        let Some(mirror) = self.mirrors.remove(&id) else {
            return false;
        };
        self.unlink(&mirror);
        registry.unregister(mirror.body);
        env.remove_body(mirror.body);
        true
    }

    /// Detach and return every mirror of `source`. The caller tears down the
    /// shadow bodies in their environments in the same tick; the index is
    /// already consistent when this returns.
    pub fn take_for_source(&mut self, source: BodyId) -> SmallVec<[Mirror; 2]> {
        let ids = self.by_source.remove(&source).unwrap_or_default();
        let mut out = SmallVec::new();
        for id in ids {
            if let Some(mirror) = self.mirrors.remove(&id) {
                self.by_body.remove(&mirror.body);
                out.push(mirror);
            }
        }
        out
    }

    /// Detach and return every mirror living in `env`.
    pub fn take_for_env(&mut self, env: EnvId) -> Vec<Mirror> {
        let ids: Vec<MirrorId> = self
            .mirrors
            .values()
            .filter(|m| m.env == env)
            .map(|m| m.id)
            .collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mirror) = self.mirrors.remove(&id) {
                self.unlink(&mirror);
                out.push(mirror);
            }
        }
        out
    }

    fn unlink(&mut self, mirror: &Mirror) {
        self.by_body.remove(&mirror.body);
        if let Some(list) = self.by_source.get_mut(&mirror.source) {
            list.retain(|m| *m != mirror.id);
            if list.is_empty() {
                self.by_source.remove(&mirror.source);
            }
        }
    }

    pub fn get(&self, id: MirrorId) -> Option<&Mirror> {
        self.mirrors.get(&id)
    }

    pub fn mirrors_of(&self, source: BodyId) -> &[MirrorId] {
        self.by_source
            .get(&source)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_mirror_body(&self, body: BodyId) -> bool {
        self.by_body.contains_key(&body)
    }

    /// Redirect an interaction target: a shadow body resolves to its source,
    /// anything else resolves to itself.
    pub fn resolve_source(&self, body: BodyId) -> BodyId {
        self.by_body
            .get(&body)
            .and_then(|id| self.mirrors.get(id))
            .map(|m| m.source)
            .unwrap_or(body)
    }

    /// Update the transform of every gateway-tagged mirror of `gateway`.
    pub fn retarget_gateway(&mut self, gateway: GatewayId, transform: Affine3A) {
        for mirror in self.mirrors.values_mut() {
            if mirror.tag == MirrorTag::Gateway(gateway) {
                mirror.transform = transform;
            }
        }
    }

    /// Push every mirror living in `env` to its source's transformed pose.
    /// Kinematic targets; rapier derives the shove velocity.
    pub fn refresh_into(&self, registry: &BodyRegistry, env: &mut SimulationEnvironment) {
        for mirror in self.mirrors.values() {
            if mirror.env != env.env_id {
                continue;
            }
            let Some(state) = registry.state(mirror.source) else {
                continue;
            };
            let position = mirror.transform.transform_point3(state.position);
            let (_, t_rot, _) = mirror.transform.to_scale_rotation_translation();
            let rotation = (t_rot * state.rotation).normalize();
            env.set_next_kinematic_pose(mirror.body, position, rotation);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mirror> {
        self.mirrors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ShapeDesc;
    use glam::{Quat, Vec3};

    fn setup() -> (BodyRegistry, SimulationEnvironment) {
        let mut reg = BodyRegistry::new();
        reg.register(
            BodyId(1),
            BodyDesc::new(ShapeDesc::ball(0.3), bf::SOLID),
            Vec3::new(1.0, 0.0, 0.0),
            Quat::IDENTITY,
        );
        let env = SimulationEnvironment::new(
            EnvId::Gateway(GatewayId(0)),
            Vec3::new(0.0, -9.81, 0.0),
        );
        (reg, env)
    }

    #[test]
    fn test_create_and_resolve() {
        let (mut reg, mut env) = setup();
        let mut mirrors = MirrorSet::new(10);
        let offset = Affine3A::from_translation(Vec3::new(100.0, 0.0, 0.0));
        let id = mirrors
            .create(&mut reg, &mut env, BodyId(1), MirrorTag::Fixed, offset)
            .unwrap();
        let mirror = mirrors.get(id).unwrap().clone();
        assert!(bf::has(reg.flags(mirror.body), bf::MIRROR));
        assert_eq!(mirrors.resolve_source(mirror.body), BodyId(1));
        assert_eq!(mirrors.resolve_source(BodyId(1)), BodyId(1));
        let (pos, _) = env.read_pose(mirror.body).unwrap();
        assert!(pos.distance(Vec3::new(101.0, 0.0, 0.0)) < 1e-4);
    }

    #[test]
    fn test_ineligible_sources_refused() {
        let (mut reg, mut env) = setup();
        reg.register(
            BodyId(2),
            BodyDesc::new(ShapeDesc::ball(1.0), bf::SOLID | bf::WORLD_GEOMETRY),
            Vec3::ZERO,
            Quat::IDENTITY,
        );
        reg.register(
            BodyId(3),
            BodyDesc::new(ShapeDesc::ball(1.0), bf::SOLID | bf::CONSTRAINED_TO_WORLD),
            Vec3::ZERO,
            Quat::IDENTITY,
        );
        reg.register(
            BodyId(4),
            BodyDesc::new(ShapeDesc::ball(1.0), 0),
            Vec3::ZERO,
            Quat::IDENTITY,
        );
        let mut mirrors = MirrorSet::new(10);
        let t = Affine3A::IDENTITY;
        assert!(mirrors.create(&mut reg, &mut env, BodyId(2), MirrorTag::Fixed, t).is_none());
        assert!(mirrors.create(&mut reg, &mut env, BodyId(3), MirrorTag::Fixed, t).is_none());
        assert!(mirrors.create(&mut reg, &mut env, BodyId(4), MirrorTag::Fixed, t).is_none());

        // Mirror of a mirror is refused too.
        let id = mirrors
            .create(&mut reg, &mut env, BodyId(1), MirrorTag::Fixed, t)
            .unwrap();
        let shadow = mirrors.get(id).unwrap().body;
        assert!(mirrors.create(&mut reg, &mut env, shadow, MirrorTag::Fixed, t).is_none());
    }

    #[test]
    fn test_budget_refusal_is_not_a_crash() {
        let (mut reg, mut env) = setup();
        let budget = 200;
        let mut mirrors = MirrorSet::new(budget);
        for i in 0..budget {
            reg.register(
                BodyId(10 + i as u32),
                BodyDesc::new(ShapeDesc::ball(0.1), bf::SOLID),
                Vec3::ZERO,
                Quat::IDENTITY,
            );
            assert!(mirrors
                .create(
                    &mut reg,
                    &mut env,
                    BodyId(10 + i as u32),
                    MirrorTag::Fixed,
                    Affine3A::IDENTITY,
                )
                .is_some());
        }
        assert_eq!(mirrors.budget_remaining(), 0);
        // The 201st request returns None and the set stays intact.
        assert!(mirrors
            .create(&mut reg, &mut env, BodyId(1), MirrorTag::Fixed, Affine3A::IDENTITY)
            .is_none());
        assert_eq!(mirrors.len(), budget);
    }

    #[test]
    fn test_take_for_source_clears_indices() {
        let (mut reg, mut env) = setup();
        let mut mirrors = MirrorSet::new(10);
        let t = Affine3A::IDENTITY;
        mirrors.create(&mut reg, &mut env, BodyId(1), MirrorTag::Fixed, t).unwrap();
        mirrors.create(&mut reg, &mut env, BodyId(1), MirrorTag::Fixed, t).unwrap();
        assert_eq!(mirrors.mirrors_of(BodyId(1)).len(), 2);

        let taken = mirrors.take_for_source(BodyId(1));
        assert_eq!(taken.len(), 2);
        assert!(mirrors.is_empty());
        assert!(mirrors.mirrors_of(BodyId(1)).is_empty());
        for m in &taken {
            assert!(!mirrors.is_mirror_body(m.body));
        }
    }

    #[test]
    fn test_refresh_follows_source() {
        let (mut reg, mut env) = setup();
        let mut mirrors = MirrorSet::new(10);
        let offset = Affine3A::from_translation(Vec3::new(100.0, 0.0, 0.0));
        let id = mirrors
            .create(&mut reg, &mut env, BodyId(1), MirrorTag::Fixed, offset)
            .unwrap();
        let body = mirrors.get(id).unwrap().body;

        reg.state_mut(BodyId(1)).unwrap().position = Vec3::new(2.0, 1.0, 0.0);
        mirrors.refresh_into(&reg, &mut env);
        // One step applies the queued kinematic target.
        env.step(1.0 / 60.0, &());
        let (pos, _) = env.read_pose(body).unwrap();
        assert!(pos.distance(Vec3::new(102.0, 1.0, 0.0)) < 1e-3);
    }
}
