// src/environment.rs
//! Simulation environments: one rapier world per gateway, plus the main one.
//!
//! Every environment is a complete, independent physics space with its own
//! pipeline, body/collider sets, and event channels. Bodies are addressed by
//! [`BodyId`] everywhere; rapier handles never leave this module except as
//! opaque contact keys.
//!
//! Gateway environments walk a staged build-up ladder ([`EnvStage`]) from
//! inert to fully linked. Every transition is idempotent and tearing down a
//! stage cascades through everything above it.

use std::collections::HashMap;

use crossbeam::channel::{unbounded, Receiver};
use glam::{Quat, Vec3};
use rapier3d::prelude as rap;
use rapier3d::prelude::{
    ActiveEvents, ActiveHooks, ChannelEventCollector, ColliderHandle, ContactForceEvent,
    PhysicsHooks, QueryFilter, RigidBodyHandle,
};

use crate::body::{BodyDesc, BodyId, EnvId, ShapeDesc};
use crate::config::SimulationConfig;
use crate::external::StaticShape;
use crate::math::{from_iso, from_na, to_iso, to_na, GatewayPose, TransformPair};

/// Build-up stage of a gateway environment. Ordered; a stage implies all the
/// stages below it are in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvStage {
    /// Nothing allocated beyond the empty world.
    Inert,
    /// Pose and opening extents are known.
    LocalDataReady,
    /// Hole-frame walls and the tube behind the plane exist.
    LocalCollision,
    /// Dynamic bodies may be stepped here.
    LocalPhysics,
    /// A partner gateway is attached.
    Linked,
    /// The partner's static surroundings are cloned in.
    LinkedCollision,
    /// Cross-gateway mirrors are live.
    LinkedPhysics,
}

/// Contact key for one collider-level pairing, stable for the pairing's
/// lifetime within an environment.
pub type ContactKey = (u64, u64);

#[inline]
fn collider_key(h: ColliderHandle) -> u64 {
    let (index, generation) = h.into_raw_parts();
    ((index as u64) << 32) | generation as u64
}

/// Collision event surfaced to the router, already mapped to body ids.
#[derive(Debug, Clone, Copy)]
pub struct ContactEvent {
    pub a: BodyId,
    pub b: BodyId,
    pub contact: ContactKey,
    pub started: bool,
}

/// Sustained overlap observed in the narrow phase this step.
#[derive(Debug, Clone, Copy)]
pub struct DeepContact {
    pub a: BodyId,
    pub b: BodyId,
    pub depth: f32,
    pub normal: Vec3,
}

fn shared_shape(desc: &ShapeDesc) -> rap::SharedShape {
    match *desc {
        ShapeDesc::Cuboid { half_extents } => {
            rap::SharedShape::cuboid(half_extents[0], half_extents[1], half_extents[2])
        }
        ShapeDesc::Ball { radius } => rap::SharedShape::ball(radius),
        ShapeDesc::Capsule {
            half_height,
            radius,
        } => rap::SharedShape::capsule_y(half_height, radius),
    }
}

/// One self-contained physics space.
pub struct SimulationEnvironment {
    pub env_id: EnvId,
    gravity: rap::Vector<rap::Real>,
    pipeline: rap::PhysicsPipeline,
    integration_params: rap::IntegrationParameters,
    islands: rap::IslandManager,
    broad_phase: rap::BroadPhase,
    narrow_phase: rap::NarrowPhase,
    bodies: rap::RigidBodySet,
    colliders: rap::ColliderSet,
    impulse_joints: rap::ImpulseJointSet,
    multibody_joints: rap::MultibodyJointSet,
    ccd_solver: rap::CCDSolver,
    query_pipeline: rap::QueryPipeline,
    collision_recv: Receiver<rap::CollisionEvent>,
    contact_force_recv: Receiver<ContactForceEvent>,
    event_handler: ChannelEventCollector,

    handles: HashMap<BodyId, RigidBodyHandle>,
    stage: EnvStage,
    local_collision: Vec<ColliderHandle>,
    linked_collision: Vec<ColliderHandle>,

    /// When false the environment keeps its collision data but the dynamics
    /// pipeline is skipped entirely (player-only mode).
    pub simulation_enabled: bool,
}

impl SimulationEnvironment {
    pub fn new(env_id: EnvId, gravity: Vec3) -> Self {
        let (collision_send, collision_recv) = unbounded();
        let (force_send, contact_force_recv) = unbounded();
        let event_handler = ChannelEventCollector::new(collision_send, force_send);

        Self {
            env_id,
            gravity: to_na(gravity),
            pipeline: rap::PhysicsPipeline::new(),
            integration_params: rap::IntegrationParameters::default(),
            islands: rap::IslandManager::new(),
            broad_phase: rap::BroadPhase::new(),
            narrow_phase: rap::NarrowPhase::new(),
            bodies: rap::RigidBodySet::new(),
            colliders: rap::ColliderSet::new(),
            impulse_joints: rap::ImpulseJointSet::new(),
            multibody_joints: rap::MultibodyJointSet::new(),
            ccd_solver: rap::CCDSolver::new(),
            query_pipeline: rap::QueryPipeline::new(),
            collision_recv,
            contact_force_recv,
            event_handler,
            handles: HashMap::new(),
            stage: EnvStage::Inert,
            local_collision: Vec::new(),
            linked_collision: Vec::new(),
            simulation_enabled: true,
        }
    }

    #[inline]
    pub fn stage(&self) -> EnvStage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: EnvStage) {
        if stage != self.stage {
            log::debug!("{}: stage {:?} -> {:?}", self.env_id, self.stage, stage);
            self.stage = stage;
        }
    }

    /// Drop back to `target`, cascading teardown of every stage above it.
    pub fn regress(&mut self, target: EnvStage) {
        if self.stage <= target {
            return;
        }
        if target < EnvStage::LinkedCollision {
            self.clear_linked_collision();
        }
        if target < EnvStage::LocalCollision {
            self.clear_local_collision();
        }
        self.set_stage(target);
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    pub fn step(&mut self, dt: f32, hooks: &dyn PhysicsHooks) {
        if !self.simulation_enabled {
            // Queries must still reflect current collider poses.
            self.query_pipeline.update(&self.bodies, &self.colliders);
            return;
        }
        self.integration_params.dt = dt;
        self.pipeline.step(
            &self.gravity,
            &self.integration_params,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            hooks,
            &self.event_handler,
        );
    }

    /// Drain collision start/stop events into body-id space. Events whose
    /// colliders are already gone are dropped; their end-touch was synthesized
    /// at removal time.
    pub fn drain_contact_events(&mut self) -> Vec<ContactEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.collision_recv.try_recv() {
            let (h1, h2, started) = match event {
                rap::CollisionEvent::Started(h1, h2, _) => (h1, h2, true),
                rap::CollisionEvent::Stopped(h1, h2, _) => (h1, h2, false),
            };
            let contact = (collider_key(h1), collider_key(h2));
            let (Some(c1), Some(c2)) = (self.colliders.get(h1), self.colliders.get(h2)) else {
                continue;
            };
            out.push(ContactEvent {
                a: BodyId::from_user_data(c1.user_data),
                b: BodyId::from_user_data(c2.user_data),
                contact,
                started,
            });
        }
        out
    }

    /// Drain contact force magnitudes (feeds friction events).
    pub fn drain_contact_forces(&mut self) -> Vec<(BodyId, BodyId, f32)> {
        let mut out = Vec::new();
        while let Ok(event) = self.contact_force_recv.try_recv() {
            let (Some(c1), Some(c2)) = (
                self.colliders.get(event.collider1),
                self.colliders.get(event.collider2),
            ) else {
                continue;
            };
            out.push((
                BodyId::from_user_data(c1.user_data),
                BodyId::from_user_data(c2.user_data),
                event.total_force_magnitude,
            ));
        }
        out
    }

    /// Contact pairs currently overlapping deeper than `slop` meters.
    pub fn deep_contacts(&self, slop: f32) -> Vec<DeepContact> {
        let mut out = Vec::new();
        for pair in self.narrow_phase.contact_pairs() {
            if !pair.has_any_active_contact {
                continue;
            }
            let (Some(c1), Some(c2)) = (
                self.colliders.get(pair.collider1),
                self.colliders.get(pair.collider2),
            ) else {
                continue;
            };
            let a = BodyId::from_user_data(c1.user_data);
            let b = BodyId::from_user_data(c2.user_data);
            for manifold in &pair.manifolds {
                let mut deepest = 0.0f32;
                for point in &manifold.points {
                    deepest = deepest.min(point.dist);
                }
                if -deepest > slop {
                    out.push(DeepContact {
                        a,
                        b,
                        depth: -deepest,
                        normal: from_na(&manifold.data.normal),
                    });
                    break;
                }
            }
        }
        out
    }

    /// Live contact-point count between two groups of bodies. Used by the
    /// touch recount before firing end-touch.
    pub fn contact_count(&self, group_a: &[BodyId], group_b: &[BodyId]) -> usize {
        let mut count = 0;
        for &id in group_a {
            let Some(&handle) = self.handles.get(&id) else {
                continue;
            };
            let Some(body) = self.bodies.get(handle) else {
                continue;
            };
            for &collider in body.colliders() {
                for pair in self.narrow_phase.contacts_with(collider) {
                    if !pair.has_any_active_contact {
                        continue;
                    }
                    let other = if pair.collider1 == collider {
                        pair.collider2
                    } else {
                        pair.collider1
                    };
                    let Some(c) = self.colliders.get(other) else {
                        continue;
                    };
                    if group_b.contains(&BodyId::from_user_data(c.user_data)) {
                        count += pair
                            .manifolds
                            .iter()
                            .map(|m| m.points.len())
                            .sum::<usize>()
                            .max(1);
                    }
                }
            }
        }
        count
    }

    // ------------------------------------------------------------------
    // Body management
    // ------------------------------------------------------------------

    /// Insert a dynamic body described by the registry record.
    pub fn insert_body(
        &mut self,
        id: BodyId,
        desc: &BodyDesc,
        position: Vec3,
        rotation: Quat,
        linvel: Vec3,
        angvel: Vec3,
    ) -> RigidBodyHandle {
        let body = rap::RigidBodyBuilder::dynamic()
            .position(to_iso(position, rotation))
            .linvel(to_na(linvel))
            .angvel(to_na(angvel))
            .user_data(id.to_user_data())
            .build();
        let collider = rap::ColliderBuilder::new(shared_shape(&desc.shape))
            .density(desc.density)
            .friction(desc.friction)
            .restitution(desc.restitution)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
            .user_data(id.to_user_data())
            .build();
        let handle = self.bodies.insert(body);
        self.colliders
            .insert_with_parent(collider, handle, &mut self.bodies);
        self.handles.insert(id, handle);
        handle
    }

    /// Insert a kinematic, position-driven body (mirror shadow clone). It
    /// pushes dynamic bodies but is never pushed back.
    pub fn insert_kinematic(
        &mut self,
        id: BodyId,
        desc: &BodyDesc,
        position: Vec3,
        rotation: Quat,
    ) -> RigidBodyHandle {
        let body = rap::RigidBodyBuilder::kinematic_position_based()
            .position(to_iso(position, rotation))
            .user_data(id.to_user_data())
            .build();
        let collider = rap::ColliderBuilder::new(shared_shape(&desc.shape))
            .friction(desc.friction)
            .restitution(desc.restitution)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
            .user_data(id.to_user_data())
            .build();
        let handle = self.bodies.insert(body);
        self.colliders
            .insert_with_parent(collider, handle, &mut self.bodies);
        self.handles.insert(id, handle);
        handle
    }

    /// Remove a body and its colliders. Returns false if it was not here.
    pub fn remove_body(&mut self, id: BodyId) -> bool {
        let Some(handle) = self.handles.remove(&id) else {
            return false;
        };
        self.bodies.remove(
            handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
        true
    }

    #[inline]
    pub fn contains_body(&self, id: BodyId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn body_ids(&self) -> impl Iterator<Item = BodyId> + '_ {
        self.handles.keys().copied()
    }

    pub fn body_count(&self) -> usize {
        self.handles.len()
    }

    pub fn read_pose(&self, id: BodyId) -> Option<(Vec3, Quat)> {
        let handle = self.handles.get(&id)?;
        self.bodies.get(*handle).map(|b| from_iso(b.position()))
    }

    pub fn read_velocity(&self, id: BodyId) -> Option<(Vec3, Vec3)> {
        let handle = self.handles.get(&id)?;
        self.bodies
            .get(*handle)
            .map(|b| (from_na(b.linvel()), from_na(b.angvel())))
    }

    pub fn set_pose(&mut self, id: BodyId, position: Vec3, rotation: Quat) {
        if let Some(body) = self.body_mut(id) {
            body.set_position(to_iso(position, rotation), true);
        }
    }

    /// Target pose for a kinematic body; rapier derives its velocity.
    pub fn set_next_kinematic_pose(&mut self, id: BodyId, position: Vec3, rotation: Quat) {
        if let Some(body) = self.body_mut(id) {
            body.set_next_kinematic_position(to_iso(position, rotation));
        }
    }

    pub fn set_velocity(&mut self, id: BodyId, linvel: Vec3, angvel: Vec3) {
        if let Some(body) = self.body_mut(id) {
            body.set_linvel(to_na(linvel), true);
            body.set_angvel(to_na(angvel), true);
        }
    }

    pub fn apply_impulse(&mut self, id: BodyId, impulse: Vec3) {
        if let Some(body) = self.body_mut(id) {
            body.apply_impulse(to_na(impulse), true);
        }
    }

    pub fn sleep(&mut self, id: BodyId) {
        if let Some(body) = self.body_mut(id) {
            body.sleep();
        }
    }

    pub fn wake(&mut self, id: BodyId) {
        if let Some(body) = self.body_mut(id) {
            body.wake_up(true);
        }
    }

    pub fn is_sleeping(&self, id: BodyId) -> Option<bool> {
        let handle = self.handles.get(&id)?;
        self.bodies.get(*handle).map(|b| b.is_sleeping())
    }

    fn body_mut(&mut self, id: BodyId) -> Option<&mut rap::RigidBody> {
        let handle = self.handles.get(&id)?;
        self.bodies.get_mut(*handle)
    }

    // ------------------------------------------------------------------
    // Gateway collision geometry
    // ------------------------------------------------------------------

    /// Build the hole-frame walls and the containment tube behind the
    /// gateway plane. Idempotent: a second call with collision already built
    /// is a no-op.
    pub fn build_local_collision(
        &mut self,
        pose: &GatewayPose,
        half_width: f32,
        half_height: f32,
        frame_body: BodyId,
        cfg: &SimulationConfig,
    ) {
        if !self.local_collision.is_empty() {
            return;
        }
        let t = cfg.wall_thickness;
        let depth = cfg.tube_depth;
        let margin = 4.0 * half_width.max(half_height);
        // Behind the plane is -normal; the tube center sits half a depth in.
        let back = -pose.normal() * (depth * 0.5);

        // Four frame walls around the opening, flush with the plane, wide
        // enough that nothing slips around the hole edge.
        let frame = [
            // left / right
            (
                pose.origin + pose.right() * (half_width + margin * 0.5) + back,
                [margin * 0.5, half_height + margin, depth * 0.5],
            ),
            (
                pose.origin - pose.right() * (half_width + margin * 0.5) + back,
                [margin * 0.5, half_height + margin, depth * 0.5],
            ),
            // top / bottom
            (
                pose.origin + pose.up() * (half_height + margin * 0.5) + back,
                [half_width, margin * 0.5, depth * 0.5],
            ),
            (
                pose.origin - pose.up() * (half_height + margin * 0.5) + back,
                [half_width, margin * 0.5, depth * 0.5],
            ),
        ];
        for (center, he) in frame {
            self.insert_static_cuboid(center, pose.rotation, he, frame_body);
        }

        // Tube: four thin walls extending behind the plane so a body halfway
        // through cannot fall out sideways, plus a back cap.
        let tube = [
            (
                pose.origin + pose.right() * (half_width + t * 0.5) + back,
                [t * 0.5, half_height, depth * 0.5],
            ),
            (
                pose.origin - pose.right() * (half_width + t * 0.5) + back,
                [t * 0.5, half_height, depth * 0.5],
            ),
            (
                pose.origin + pose.up() * (half_height + t * 0.5) + back,
                [half_width, t * 0.5, depth * 0.5],
            ),
            (
                pose.origin - pose.up() * (half_height + t * 0.5) + back,
                [half_width, t * 0.5, depth * 0.5],
            ),
            (
                pose.origin - pose.normal() * (depth + t * 0.5),
                [half_width, half_height, t * 0.5],
            ),
        ];
        for (center, he) in tube {
            self.insert_static_cuboid(center, pose.rotation, he, frame_body);
        }
    }

    /// Clone the linked gateway's static surroundings into this environment,
    /// re-expressed through `linked_to_this`.
    pub fn build_linked_collision(
        &mut self,
        shapes: &[StaticShape],
        transform: &TransformPair,
        frame_body: BodyId,
    ) {
        self.clear_linked_collision();
        for shape in shapes {
            let position = transform.linked_to_this.transform_point3(shape.position);
            let (_, rot, _) = transform.linked_to_this.to_scale_rotation_translation();
            let rotation = (rot * shape.rotation).normalize();
            let collider = rap::ColliderBuilder::new(shared_shape(&shape.shape))
                .position(to_iso(position, rotation))
                .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
                .user_data(frame_body.to_user_data())
                .build();
            self.linked_collision.push(self.colliders.insert(collider));
        }
    }

    pub fn clear_local_collision(&mut self) {
        for handle in std::mem::take(&mut self.local_collision) {
            self.colliders
                .remove(handle, &mut self.islands, &mut self.bodies, false);
        }
    }

    pub fn clear_linked_collision(&mut self) {
        for handle in std::mem::take(&mut self.linked_collision) {
            self.colliders
                .remove(handle, &mut self.islands, &mut self.bodies, false);
        }
    }

    pub fn local_collision_count(&self) -> usize {
        self.local_collision.len()
    }

    /// The generated hole-frame and tube cuboids as (center, rotation,
    /// half-extents), for host-side visualization.
    pub fn local_collision_boxes(&self) -> Vec<(Vec3, Quat, Vec3)> {
        let mut out = Vec::with_capacity(self.local_collision.len());
        for handle in &self.local_collision {
            let Some(collider) = self.colliders.get(*handle) else {
                continue;
            };
            let Some(cuboid) = collider.shape().as_cuboid() else {
                continue;
            };
            let (pos, rot) = from_iso(collider.position());
            out.push((pos, rot, from_na(&cuboid.half_extents)));
        }
        out
    }

    pub fn linked_collision_count(&self) -> usize {
        self.linked_collision.len()
    }

    fn insert_static_cuboid(
        &mut self,
        center: Vec3,
        rotation: Quat,
        half_extents: [f32; 3],
        owner: BodyId,
    ) {
        let collider =
            rap::ColliderBuilder::cuboid(half_extents[0], half_extents[1], half_extents[2])
                .position(to_iso(center, rotation))
                .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
                .user_data(owner.to_user_data())
                .build();
        self.local_collision.push(self.colliders.insert(collider));
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Bodies whose colliders intersect a box at `position`/`rotation`.
    pub fn bodies_in_box(&self, position: Vec3, rotation: Quat, half_extents: Vec3) -> Vec<BodyId> {
        let shape = rap::Cuboid::new(to_na(half_extents));
        let pos = to_iso(position, rotation);
        let mut out = Vec::new();
        self.query_pipeline.intersections_with_shape(
            &self.bodies,
            &self.colliders,
            &pos,
            &shape,
            QueryFilter::default(),
            |handle| {
                if let Some(collider) = self.colliders.get(handle) {
                    let id = BodyId::from_user_data(collider.user_data);
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
                true
            },
        );
        out
    }

    /// Nearest hit along a ray, in body-id space.
    pub fn cast_ray(&self, origin: Vec3, dir: Vec3, max_dist: f32) -> Option<(BodyId, f32)> {
        let ray = rap::Ray::new(to_na(origin).into(), to_na(dir.normalize_or_zero()));
        self.query_pipeline
            .cast_ray(
                &self.bodies,
                &self.colliders,
                &ray,
                max_dist,
                true,
                QueryFilter::default(),
            )
            .and_then(|(handle, toi)| {
                self.colliders
                    .get(handle)
                    .map(|c| (BodyId::from_user_data(c.user_data), toi))
            })
    }
}

impl std::fmt::Debug for SimulationEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationEnvironment")
            .field("env_id", &self.env_id)
            .field("stage", &self.stage)
            .field("bodies", &self.handles.len())
            .field("local_collision", &self.local_collision.len())
            .field("linked_collision", &self.linked_collision.len())
            .finish()
    }
}
