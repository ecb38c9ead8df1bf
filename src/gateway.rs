// src/gateway.rs
//! Gateway records and the pairing table.
//!
//! A gateway is a placed opening with a pose, physical extents, and (once
//! linked) a transform pair to its partner. Linking is always symmetric:
//! both sides update together or not at all, and the transforms held by the
//! two sides are exact inverses of each other.

use glam::{Affine3A, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::body::BodyId;
use crate::config::SimulationConfig;
use crate::error::{Error, Result};
use crate::math::{GatewayPose, TransformPair};

/// Stable gateway identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GatewayId(pub u32);

/// A floor gateway points mostly up; exits from one get different minimum
/// speed handling.
const FLOOR_NORMAL_DOT: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct Gateway {
    pub id: GatewayId,
    pub pose: GatewayPose,
    pub half_width: f32,
    pub half_height: f32,
    /// Linkage group this gateway pairs within. Defaults to a group of its
    /// own, so ungrouped gateways only ever link explicitly.
    pub group: u32,
    /// Polarity within the group: a group links one primary to one secondary.
    pub secondary: bool,
    /// Inactive gateways keep their placement but never pair or teleport.
    pub active: bool,
    pub linked: Option<GatewayId>,
    /// Identity while unlinked.
    pub transform: TransformPair,
    /// Sensor body owning the proximity trigger volume.
    pub trigger_body: BodyId,
    /// Pseudo-body owning the frame/tube/cloned static colliders.
    pub frame_body: BodyId,
}

impl Gateway {
    pub fn new(
        id: GatewayId,
        pose: GatewayPose,
        half_width: f32,
        half_height: f32,
        trigger_body: BodyId,
        frame_body: BodyId,
    ) -> Self {
        Self {
            id,
            pose,
            half_width,
            half_height,
            group: id.0,
            secondary: false,
            active: true,
            linked: None,
            transform: TransformPair::default(),
            trigger_body,
            frame_body,
        }
    }

    pub fn with_group(mut self, group: u32, secondary: bool) -> Self {
        self.group = group;
        self.secondary = secondary;
        self
    }

    /// Gateway lies flat enough on the ground that bodies fall into it.
    #[inline]
    pub fn is_floor(&self) -> bool {
        self.pose.normal().dot(Vec3::Y) > FLOOR_NORMAL_DOT
    }

    /// Center of the proximity trigger volume. The volume straddles the
    /// plane so approach from either side is noticed before the crossing.
    pub fn trigger_center(&self, _cfg: &SimulationConfig) -> Vec3 {
        self.pose.origin
    }

    /// Half-extents of the proximity trigger volume, in the gateway frame
    /// (x right, y up, z along the normal).
    pub fn trigger_half_extents(&self, cfg: &SimulationConfig) -> Vec3 {
        Vec3::new(
            self.half_width * cfg.trigger_scale,
            self.half_height * cfg.trigger_scale,
            cfg.trigger_depth,
        )
    }

    /// True if `p` lies inside the proximity trigger volume.
    pub fn in_trigger(&self, p: Vec3, cfg: &SimulationConfig) -> bool {
        let he = self.trigger_half_extents(cfg);
        let rel = p - self.trigger_center(cfg);
        rel.dot(self.pose.right()).abs() <= he.x
            && rel.dot(self.pose.up()).abs() <= he.y
            && rel.dot(self.pose.normal()).abs() <= he.z
    }

    /// True if `p` lies inside the larger wake-and-pre-touch sweep volume.
    pub fn in_pretouch(&self, p: Vec3, cfg: &SimulationConfig) -> bool {
        let he = self.pretouch_half_extents(cfg);
        let rel = p - self.trigger_center(cfg);
        rel.dot(self.pose.right()).abs() <= he.x
            && rel.dot(self.pose.up()).abs() <= he.y
            && rel.dot(self.pose.normal()).abs() <= he.z
    }

    /// Half-extents of the larger wake-and-pre-touch sweep volume.
    pub fn pretouch_half_extents(&self, cfg: &SimulationConfig) -> Vec3 {
        self.trigger_half_extents(cfg) * cfg.pretouch_scale
    }

    /// True if a body moving `from` -> `to` crossed the plane through the
    /// physical opening. Either crossing direction counts; brushing the
    /// plane outside the opening rectangle does not.
    pub fn crossed(&self, from: Vec3, to: Vec3) -> bool {
        let plane = self.pose.plane();
        if !plane.separates(from, to) {
            return false;
        }
        let da = plane.signed_distance(from);
        let db = plane.signed_distance(to);
        // Intersection of the segment with the plane.
        let t = da / (da - db);
        let hit = from.lerp(to, t.clamp(0.0, 1.0));
        self.pose
            .contains_projection(hit, self.half_width, self.half_height)
    }

    pub fn rotation(&self) -> Quat {
        self.pose.rotation
    }

    /// Active and linked with a live transform pair; teleports through it
    /// may proceed.
    #[inline]
    pub fn is_ready_to_teleport(&self) -> bool {
        self.active && self.linked.is_some()
    }

    #[inline]
    pub fn linked_gateway(&self) -> Option<GatewayId> {
        self.linked
    }

    /// World-space transform carrying bodies through to the partner.
    /// Identity while unlinked.
    #[inline]
    pub fn world_to_linked_transform(&self) -> Affine3A {
        self.transform.this_to_linked
    }
}

/// All placed gateways and their pairings.
#[derive(Debug, Default)]
pub struct GatewaySet {
    gateways: HashMap<GatewayId, Gateway>,
}

impl GatewaySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, gateway: Gateway) {
        if self.gateways.insert(gateway.id, gateway).is_some() {
            log::warn!("gateway re-inserted, previous record replaced");
        }
    }

    pub fn remove(&mut self, id: GatewayId) -> Option<Gateway> {
        // Sever the pairing first so the partner never holds a stale link.
        if let Some(partner) = self.gateways.get(&id).and_then(|g| g.linked) {
            if let Some(p) = self.gateways.get_mut(&partner) {
                p.linked = None;
                p.transform = TransformPair::default();
            }
        }
        self.gateways.remove(&id)
    }

    pub fn get(&self, id: GatewayId) -> Option<&Gateway> {
        self.gateways.get(&id)
    }

    pub fn get_mut(&mut self, id: GatewayId) -> Option<&mut Gateway> {
        self.gateways.get_mut(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = GatewayId> + '_ {
        self.gateways.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gateway> {
        self.gateways.values()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    pub fn linked_pair_count(&self) -> usize {
        self.gateways.values().filter(|g| g.linked.is_some()).count() / 2
    }

    /// Link two gateways, severing any previous pairing on either side.
    /// Both transforms are rebuilt as exact inverses.
    pub fn link(&mut self, a: GatewayId, b: GatewayId, cfg: &SimulationConfig) -> Result<()> {
        if a == b {
            return Err(Error::consistency("gateway cannot link to itself"));
        }
        if !self.gateways.contains_key(&a) {
            return Err(Error::UnknownId {
                kind: "gateway",
                id: a.0,
            });
        }
        if !self.gateways.contains_key(&b) {
            return Err(Error::UnknownId {
                kind: "gateway",
                id: b.0,
            });
        }
        self.unlink(a);
        self.unlink(b);
        if self.linked_pair_count() >= cfg.max_linked_gateways {
            return Err(Error::ResourceExhausted {
                what: "linked gateway pairs",
                limit: cfg.max_linked_gateways,
            });
        }
        self.rebuild_pair(a, b);
        log::info!("gateway {} linked to gateway {}", a.0, b.0);
        Ok(())
    }

    /// Pair up a linkage group: the lowest-id active unlinked primary links
    /// to the lowest-id active unlinked secondary. Returns the pair that got
    /// linked, or `None` when either polarity has no candidate.
    pub fn auto_pair(
        &mut self,
        group: u32,
        cfg: &SimulationConfig,
    ) -> Result<Option<(GatewayId, GatewayId)>> {
        let pick = |want_secondary: bool| {
            self.gateways
                .values()
                .filter(|g| {
                    g.group == group
                        && g.secondary == want_secondary
                        && g.active
                        && g.linked.is_none()
                })
                .map(|g| g.id)
                .min()
        };
        let (Some(primary), Some(secondary)) = (pick(false), pick(true)) else {
            return Ok(None);
        };
        self.link(primary, secondary, cfg)?;
        Ok(Some((primary, secondary)))
    }

    /// Drop `id`'s pairing, if any. Returns the former partner.
    pub fn unlink(&mut self, id: GatewayId) -> Option<GatewayId> {
        let partner = self.gateways.get(&id).and_then(|g| g.linked)?;
        for gid in [id, partner] {
            if let Some(g) = self.gateways.get_mut(&gid) {
                g.linked = None;
                g.transform = TransformPair::default();
            }
        }
        Some(partner)
    }

    /// Re-place a gateway. If it is linked, both sides' transforms refresh.
    pub fn move_gateway(&mut self, id: GatewayId, pose: GatewayPose) -> Result<()> {
        let partner = match self.gateways.get_mut(&id) {
            Some(g) => {
                g.pose = pose;
                g.linked
            }
            None => {
                return Err(Error::UnknownId {
                    kind: "gateway",
                    id: id.0,
                })
            }
        };
        if let Some(p) = partner {
            self.rebuild_pair(id, p);
        }
        Ok(())
    }

    fn rebuild_pair(&mut self, a: GatewayId, b: GatewayId) {
        let (pose_a, pose_b) = match (self.gateways.get(&a), self.gateways.get(&b)) {
            (Some(ga), Some(gb)) => (ga.pose, gb.pose),
            _ => return,
        };
        if let Some(ga) = self.gateways.get_mut(&a) {
            ga.linked = Some(b);
            ga.transform = TransformPair::between(&pose_a, &pose_b);
        }
        if let Some(gb) = self.gateways.get_mut(&b) {
            gb.linked = Some(a);
            gb.transform = TransformPair::between(&pose_b, &pose_a);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn facing_pair() -> (Gateway, Gateway) {
        // A at origin facing +X, B far away facing -X.
        let a = Gateway::new(
            GatewayId(0),
            GatewayPose::new(Vec3::ZERO, Quat::from_rotation_y(-FRAC_PI_2)),
            0.5,
            1.0,
            BodyId(1000),
            BodyId(1001),
        );
        let b = Gateway::new(
            GatewayId(1),
            GatewayPose::new(Vec3::new(1000.0, 0.0, 0.0), Quat::from_rotation_y(FRAC_PI_2)),
            0.5,
            1.0,
            BodyId(1002),
            BodyId(1003),
        );
        (a, b)
    }

    #[test]
    fn test_link_is_symmetric_and_inverse() {
        let (a, b) = facing_pair();
        let mut set = GatewaySet::new();
        set.insert(a);
        set.insert(b);
        let cfg = SimulationConfig::default();
        set.link(GatewayId(0), GatewayId(1), &cfg).unwrap();

        let ga = set.get(GatewayId(0)).unwrap();
        let gb = set.get(GatewayId(1)).unwrap();
        assert_eq!(ga.linked, Some(GatewayId(1)));
        assert_eq!(gb.linked, Some(GatewayId(0)));
        let p = Vec3::new(-0.2, 0.3, 0.1);
        let round = gb.transform.point(ga.transform.point(p));
        assert!(round.distance(p) < 1e-3);
    }

    #[test]
    fn test_relink_severs_old_pairing() {
        let (a, b) = facing_pair();
        let c = Gateway::new(
            GatewayId(2),
            GatewayPose::new(Vec3::new(0.0, 50.0, 0.0), Quat::IDENTITY),
            0.5,
            1.0,
            BodyId(1004),
            BodyId(1005),
        );
        let mut set = GatewaySet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        let cfg = SimulationConfig::default();
        set.link(GatewayId(0), GatewayId(1), &cfg).unwrap();
        set.link(GatewayId(0), GatewayId(2), &cfg).unwrap();
        assert_eq!(set.get(GatewayId(1)).unwrap().linked, None);
        assert_eq!(set.get(GatewayId(0)).unwrap().linked, Some(GatewayId(2)));
    }

    #[test]
    fn test_link_capacity() {
        let mut set = GatewaySet::new();
        for i in 0..4 {
            set.insert(Gateway::new(
                GatewayId(i),
                GatewayPose::new(Vec3::new(i as f32 * 10.0, 0.0, 0.0), Quat::IDENTITY),
                0.5,
                1.0,
                BodyId(2000 + i * 2),
                BodyId(2001 + i * 2),
            ));
        }
        let mut cfg = SimulationConfig::default();
        cfg.max_linked_gateways = 1;
        set.link(GatewayId(0), GatewayId(1), &cfg).unwrap();
        let err = set.link(GatewayId(2), GatewayId(3), &cfg).unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_crossing_requires_opening() {
        let (a, _) = facing_pair();
        // Straight through the middle.
        assert!(a.crossed(Vec3::new(0.3, 0.0, 0.0), Vec3::new(-0.3, 0.0, 0.0)));
        // Either direction counts.
        assert!(a.crossed(Vec3::new(-0.3, 0.0, 0.0), Vec3::new(0.3, 0.0, 0.0)));
        // Crosses the infinite plane but outside the opening rectangle.
        assert!(!a.crossed(Vec3::new(0.3, 5.0, 0.0), Vec3::new(-0.3, 5.0, 0.0)));
        // Near the plane without crossing.
        assert!(!a.crossed(Vec3::new(0.3, 0.0, 0.0), Vec3::new(0.1, 0.0, 0.0)));
    }

    #[test]
    fn test_floor_detection() {
        let wall = facing_pair().0;
        assert!(!wall.is_floor());
        let floor = Gateway::new(
            GatewayId(5),
            GatewayPose::new(Vec3::ZERO, Quat::from_rotation_x(FRAC_PI_2)),
            0.5,
            1.0,
            BodyId(1),
            BodyId(2),
        );
        assert!(floor.pose.normal().dot(Vec3::Y) > 0.9);
        assert!(floor.is_floor());
    }

    #[test]
    fn test_auto_pair_matches_group_polarity() {
        let mut set = GatewaySet::new();
        let (a, b) = facing_pair();
        set.insert(a.with_group(3, false));
        set.insert(b.with_group(3, true));
        // A lone primary in another group never pairs.
        set.insert(
            Gateway::new(
                GatewayId(2),
                GatewayPose::new(Vec3::new(0.0, 20.0, 0.0), Quat::IDENTITY),
                0.5,
                1.0,
                BodyId(1004),
                BodyId(1005),
            )
            .with_group(4, false),
        );
        let cfg = SimulationConfig::default();
        assert_eq!(set.auto_pair(4, &cfg).unwrap(), None);
        assert_eq!(
            set.auto_pair(3, &cfg).unwrap(),
            Some((GatewayId(0), GatewayId(1)))
        );
        assert_eq!(set.get(GatewayId(0)).unwrap().linked, Some(GatewayId(1)));
        // Already paired: nothing left to link.
        assert_eq!(set.auto_pair(3, &cfg).unwrap(), None);
    }

    #[test]
    fn test_inactive_gateway_is_not_ready() {
        let (mut a, _) = facing_pair();
        a.linked = Some(GatewayId(1));
        assert!(a.is_ready_to_teleport());
        a.active = false;
        assert!(!a.is_ready_to_teleport());
    }

    #[test]
    fn test_remove_clears_partner_link() {
        let (a, b) = facing_pair();
        let mut set = GatewaySet::new();
        set.insert(a);
        set.insert(b);
        let cfg = SimulationConfig::default();
        set.link(GatewayId(0), GatewayId(1), &cfg).unwrap();
        set.remove(GatewayId(0));
        assert_eq!(set.get(GatewayId(1)).unwrap().linked, None);
    }
}
