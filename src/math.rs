// src/math.rs
//! Gateway transform math.
//!
//! A gateway is a plane-bounded opening. The pose of the opening gives a
//! plane equation, four corner points, and, once linked, a pair of mutually
//! inverse 4x3 transforms ([`glam::Affine3A`]) that map one gateway's frame
//! into the other's. The pair maps one gateway's outward normal onto its
//! partner's, so a body crossing the plane keeps a continuous trajectory on
//! the far side regardless of which side it approached from.
//!
//! Orientation is remapped in world space by composing quaternions, never by
//! converting through per-axis Euler angles; steep or inverted gateway pairs
//! would otherwise hit gimbal artifacts.

use glam::{Affine3A, Quat, Vec3};
use nalgebra as na;
use rapier3d::math::{Isometry, Real, Rotation, Translation, Vector};

/// Plane in normal/distance form: `dot(n, p) == d` for points on the plane.
/// The normal is the gateway's outward facing direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
}

impl Plane {
    /// Plane through `origin` with outward `normal`.
    #[inline]
    pub fn from_pose(origin: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self {
            normal,
            dist: normal.dot(origin),
        }
    }

    /// Positive in front of the gateway, negative behind it.
    #[inline]
    pub fn signed_distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) - self.dist
    }

    /// True if `a` and `b` are on opposite sides of the plane.
    #[inline]
    pub fn separates(&self, a: Vec3, b: Vec3) -> bool {
        let da = self.signed_distance(a);
        let db = self.signed_distance(b);
        (da > 0.0) != (db > 0.0)
    }
}

/// Pose of a gateway opening: origin plus orientation. The local frame is
/// -Z facing out of the opening (normal), +Y up, +X right, matching the
/// convention used by the collision builders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayPose {
    pub origin: Vec3,
    pub rotation: Quat,
}

impl GatewayPose {
    pub fn new(origin: Vec3, rotation: Quat) -> Self {
        Self { origin, rotation }
    }

    /// Outward normal of the opening.
    #[inline]
    pub fn normal(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    #[inline]
    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    #[inline]
    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    #[inline]
    pub fn plane(&self) -> Plane {
        Plane::from_pose(self.origin, self.normal())
    }

    #[inline]
    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_rotation_translation(self.rotation, self.origin)
    }

    /// The four corner points of the physical opening, counter-clockwise
    /// when viewed from the front.
    pub fn corners(&self, half_width: f32, half_height: f32) -> [Vec3; 4] {
        let r = self.right() * half_width;
        let u = self.up() * half_height;
        [
            self.origin - r - u,
            self.origin + r - u,
            self.origin + r + u,
            self.origin - r + u,
        ]
    }

    /// True if `p` projects inside the opening rectangle. Near-plane points
    /// outside this rectangle must not trigger ownership changes.
    pub fn contains_projection(&self, p: Vec3, half_width: f32, half_height: f32) -> bool {
        let rel = p - self.origin;
        rel.dot(self.right()).abs() <= half_width && rel.dot(self.up()).abs() <= half_height
    }
}

/// Mutually inverse transform pair between two linked gateways.
///
/// Invariant: `linked_to_this * this_to_linked == identity` within floating
/// point tolerance. When a gateway is unlinked both members are identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformPair {
    pub this_to_linked: Affine3A,
    pub linked_to_this: Affine3A,
}

impl Default for TransformPair {
    fn default() -> Self {
        Self {
            this_to_linked: Affine3A::IDENTITY,
            linked_to_this: Affine3A::IDENTITY,
        }
    }
}

impl TransformPair {
    /// Build the pair for a linked gateway couple. Maps this gateway's local
    /// frame onto the partner's, normal onto normal.
    pub fn between(this: &GatewayPose, linked: &GatewayPose) -> Self {
        let this_to_linked = linked.to_affine() * this.to_affine().inverse();
        let linked_to_this = this.to_affine() * linked.to_affine().inverse();
        Self {
            this_to_linked,
            linked_to_this,
        }
    }

    /// Transform a world-space point through the gateway.
    #[inline]
    pub fn point(&self, p: Vec3) -> Vec3 {
        self.this_to_linked.transform_point3(p)
    }

    /// Transform a world-space direction (velocity) through the gateway.
    #[inline]
    pub fn direction(&self, v: Vec3) -> Vec3 {
        self.this_to_linked.transform_vector3(v)
    }

    /// Remap a world-space orientation through the gateway. This composes
    /// the transform's rotation with the body's rotation in world space.
    #[inline]
    pub fn orientation(&self, q: Quat) -> Quat {
        let (_, rot, _) = self.this_to_linked.to_scale_rotation_translation();
        (rot * q).normalize()
    }
}

// ============================================================================
// glam <-> rapier conversions
// ============================================================================

#[inline]
pub(crate) fn to_na(v: Vec3) -> Vector<Real> {
    Vector::new(v.x, v.y, v.z)
}

#[inline]
pub(crate) fn from_na(v: &Vector<Real>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

#[inline]
pub(crate) fn quat_to_na(q: Quat) -> Rotation<Real> {
    Rotation::from_quaternion(na::Quaternion::new(q.w, q.x, q.y, q.z))
}

#[inline]
pub(crate) fn quat_from_na(q: &Rotation<Real>) -> Quat {
    Quat::from_xyzw(q.i, q.j, q.k, q.w)
}

#[inline]
pub(crate) fn to_iso(pos: Vec3, rot: Quat) -> Isometry<Real> {
    Isometry::from_parts(Translation::from(to_na(pos)), quat_to_na(rot))
}

#[inline]
pub(crate) fn from_iso(iso: &Isometry<Real>) -> (Vec3, Quat) {
    (
        Vec3::new(iso.translation.x, iso.translation.y, iso.translation.z),
        quat_from_na(&iso.rotation),
    )
}
