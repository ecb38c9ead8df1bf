// src/coordinator.rs
//! Top-level coordinator: owns every environment, drives the fixed tick, and
//! runs the teleport protocol.
//!
//! The whole subsystem is single-threaded by contract. One `step` call runs
//! the full pipeline in a fixed order: gateway stage maintenance, mirror
//! refresh, trigger sweep and ownership arbitration, physics stepping for
//! every environment, state sync, crossing detection and teleports, then
//! collision event routing and the bounded deferred-queue drain. No phase
//! ever re-enters an earlier one.

use std::collections::HashMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::body::{body_flags as bf, BodyDesc, BodyId, BodyRegistry, BodyState, EnvId, ShapeDesc};
use crate::config::SimulationConfig;
use crate::error::Error;
use crate::environment::{EnvStage, SimulationEnvironment};
use crate::external::{EffectDispatch, WorldCollisionQuery};
use crate::gateway::{Gateway, GatewayId, GatewaySet};
use crate::math::GatewayPose;
use crate::mirror::{MirrorSet, MirrorTag};
use crate::router::{CollisionRouter, DamageEvent, DeferredOp, RouterHooks};
use crate::trigger::{arbitrate, OwnershipTable, TriggerTracker};
use crate::Result;

/// Body-id range reserved for gateway trigger/frame pseudo-bodies.
const INTERNAL_BODY_BASE: u32 = 0x8000_0000;

/// A completed teleport, reported to the host after the step that ran it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TeleportNotice {
    pub body: BodyId,
    pub from: GatewayId,
    pub to: GatewayId,
    pub position: Vec3,
    pub rotation: glam::Quat,
    pub velocity: Vec3,
    pub tick: u64,
}

/// Per-step counters, taken after `step` returns.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StepMetrics {
    pub tick: u64,
    pub bodies: usize,
    pub mirrors: usize,
    pub claimed: usize,
    pub teleports_total: u64,
    pub touch_events: usize,
    pub deferred_executed: usize,
    pub queue_overflows: u64,
}

/// The portal simulation subsystem.
pub struct PortalSim {
    config: SimulationConfig,
    registry: BodyRegistry,
    gateways: GatewaySet,
    main_env: SimulationEnvironment,
    gateway_envs: HashMap<GatewayId, SimulationEnvironment>,
    owners: OwnershipTable,
    triggers: TriggerTracker,
    pretouch: TriggerTracker,
    mirrors: MirrorSet,
    router: CollisionRouter,
    teleports: Vec<TeleportNotice>,
    damage_out: Vec<DamageEvent>,
    pending_effects: Vec<(&'static str, Vec3, glam::Quat)>,
    tick: u64,
    next_gateway: u32,
    next_internal: u32,
    teleports_total: u64,
    queue_overflows: u64,
    last_metrics: StepMetrics,
}

impl PortalSim {
    pub fn new(config: SimulationConfig) -> Self {
        let gravity = config.gravity_vec();
        let mirrors = MirrorSet::new(config.mirror_budget);
        Self {
            config,
            registry: BodyRegistry::new(),
            gateways: GatewaySet::new(),
            main_env: SimulationEnvironment::new(EnvId::Main, gravity),
            gateway_envs: HashMap::new(),
            owners: OwnershipTable::new(),
            triggers: TriggerTracker::new(),
            pretouch: TriggerTracker::new(),
            mirrors,
            router: CollisionRouter::new(),
            teleports: Vec::new(),
            damage_out: Vec::new(),
            pending_effects: Vec::new(),
            tick: 0,
            next_gateway: 0,
            next_internal: INTERNAL_BODY_BASE,
            teleports_total: 0,
            queue_overflows: 0,
            last_metrics: StepMetrics::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[inline]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn metrics(&self) -> StepMetrics {
        self.last_metrics
    }

    // ------------------------------------------------------------------
    // Bodies
    // ------------------------------------------------------------------

    /// Register a host body and drop it into the main environment.
    pub fn add_body(
        &mut self,
        id: BodyId,
        desc: BodyDesc,
        position: Vec3,
        rotation: glam::Quat,
    ) {
        self.registry.register(id, desc.clone(), position, rotation);
        if !bf::has(desc.flags, bf::WORLD_GEOMETRY) {
            self.main_env.insert_body(
                id,
                &desc,
                position,
                rotation,
                Vec3::ZERO,
                Vec3::ZERO,
            );
        }
    }

    /// Remove a body and everything hanging off it: mirrors the same tick,
    /// touches, ownership, trigger occupancy.
    pub fn remove_body(&mut self, id: BodyId) {
        for mirror in self.mirrors.take_for_source(id) {
            self.registry.unregister(mirror.body);
            if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, mirror.env) {
                env.remove_body(mirror.body);
            }
        }
        let owner = self.owners.owner_of(id);
        if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, owner) {
            env.remove_body(id);
        }
        self.owners.release(id);
        self.triggers.forget(id);
        self.pretouch.forget(id);
        self.router.drop_touches_of(&self.registry, id);
        self.registry.unregister(id);
    }

    pub fn set_body_velocity(&mut self, id: BodyId, linvel: Vec3, angvel: Vec3) {
        let owner = self.owners.owner_of(id);
        if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, owner) {
            env.set_velocity(id, linvel, angvel);
        }
        if let Some(state) = self.registry.state_mut(id) {
            state.linvel = linvel;
            state.angvel = angvel;
        }
    }

    pub fn set_legacy_velocity(&mut self, id: BodyId, vel: Vec3) {
        self.registry.set_legacy_velocity(id, vel);
    }

    pub fn body_state(&self, id: BodyId) -> Option<&BodyState> {
        self.registry.state(id)
    }

    pub fn owner_of(&self, id: BodyId) -> EnvId {
        self.owners.owner_of(id)
    }

    #[inline]
    pub fn owns_body(&self, env: EnvId, id: BodyId) -> bool {
        self.owners.owner_of(id) == env
    }

    /// Host-driven ownership claim. Succeeds only when the gateway exists and
    /// is linked; an ineligible request is a silent refusal, not an error.
    pub fn request_ownership(&mut self, body: BodyId, gateway: GatewayId) -> bool {
        if !self.registry.contains(body) {
            return false;
        }
        let linked = self
            .gateways
            .get(gateway)
            .map(|g| g.is_ready_to_teleport())
            .unwrap_or(false);
        if !linked {
            return false;
        }
        self.claim(body, gateway);
        self.owners.owner_of(body) == EnvId::Gateway(gateway)
    }

    pub fn registry(&self) -> &BodyRegistry {
        &self.registry
    }

    pub fn mirror_count(&self) -> usize {
        self.mirrors.len()
    }

    /// Queue damage against a body; shadow clones redirect to their source.
    /// Applied at end-of-step, surfaced through [`Self::take_damage_events`].
    pub fn apply_damage(
        &mut self,
        target: BodyId,
        inflictor: Option<BodyId>,
        amount: f32,
        position: Vec3,
    ) {
        self.router.queue_damage(DamageEvent {
            target,
            inflictor,
            amount,
            position,
        });
    }

    // ------------------------------------------------------------------
    // Gateways
    // ------------------------------------------------------------------

    /// Place a gateway and spin up its environment. The environment walks
    /// its build-up stages during subsequent steps.
    pub fn add_gateway(
        &mut self,
        pose: GatewayPose,
        half_width: f32,
        half_height: f32,
    ) -> GatewayId {
        let id = GatewayId(self.next_gateway);
        self.place_gateway(id, pose, half_width, half_height, id.0, false, true);
        id
    }

    /// Place an inactive gateway belonging to a linkage group. It pairs with
    /// the group's opposite polarity once both ends are activated.
    pub fn add_gateway_in_group(
        &mut self,
        pose: GatewayPose,
        half_width: f32,
        half_height: f32,
        group: u32,
        secondary: bool,
    ) -> GatewayId {
        let id = GatewayId(self.next_gateway);
        self.place_gateway(id, pose, half_width, half_height, group, secondary, false);
        id
    }

    /// Flip a gateway's activation state. Activation pairs its linkage group
    /// if the opposite end is ready; deactivation severs any pairing.
    pub fn set_gateway_active(&mut self, id: GatewayId, active: bool) -> Result<()> {
        let group = match self.gateways.get_mut(id) {
            Some(g) => {
                g.active = active;
                g.group
            }
            None => {
                return Err(Error::UnknownId {
                    kind: "gateway",
                    id: id.0,
                })
            }
        };
        if active {
            self.gateways.auto_pair(group, &self.config)?;
        } else {
            self.unlink_gateway(id);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn place_gateway(
        &mut self,
        id: GatewayId,
        pose: GatewayPose,
        half_width: f32,
        half_height: f32,
        group: u32,
        secondary: bool,
        active: bool,
    ) {
        self.next_gateway = self.next_gateway.max(id.0 + 1);

        let trigger_body = self.alloc_internal_body();
        let frame_body = self.alloc_internal_body();
        self.registry.register(
            trigger_body,
            BodyDesc::new(ShapeDesc::cuboid(Vec3::ONE), bf::TRIGGER),
            pose.origin,
            pose.rotation,
        );
        self.registry.register(
            frame_body,
            BodyDesc::new(
                ShapeDesc::cuboid(Vec3::ONE),
                bf::SOLID | bf::WORLD_GEOMETRY,
            ),
            pose.origin,
            pose.rotation,
        );

        let mut gateway = Gateway::new(id, pose, half_width, half_height, trigger_body, frame_body)
            .with_group(group, secondary);
        gateway.active = active;
        self.gateways.insert(gateway);

        let mut env = SimulationEnvironment::new(EnvId::Gateway(id), self.config.gravity_vec());
        env.set_stage(EnvStage::LocalDataReady);
        self.gateway_envs.insert(id, env);
        log::info!("gateway {} placed at {:?}", id.0, pose.origin);
    }

    /// Tear a gateway down: evict owned bodies back to main, drop mirrors,
    /// destroy the environment.
    pub fn remove_gateway(&mut self, id: GatewayId) {
        self.unlink_gateway(id);
        self.evict_env(EnvId::Gateway(id));
        for mirror in self.mirrors.take_for_env(EnvId::Gateway(id)) {
            self.registry.unregister(mirror.body);
            // Its env is being destroyed with it.
        }
        self.gateway_envs.remove(&id);
        if let Some(g) = self.gateways.remove(id) {
            self.router.drop_touches_of(&self.registry, g.trigger_body);
            self.registry.unregister(g.trigger_body);
            self.registry.unregister(g.frame_body);
        }
    }

    pub fn link_gateways(&mut self, a: GatewayId, b: GatewayId) -> Result<()> {
        self.gateways.link(a, b, &self.config)
    }

    /// Sever a pairing. Bodies owned by either side return to the main
    /// environment immediately; both openings fizzle on the next step.
    pub fn unlink_gateway(&mut self, id: GatewayId) {
        if let Some(partner) = self.gateways.unlink(id) {
            self.evict_env(EnvId::Gateway(id));
            self.evict_env(EnvId::Gateway(partner));
            for gid in [id, partner] {
                if let Some(g) = self.gateways.get(gid) {
                    self.pending_effects
                        .push(("gateway_fizzle", g.pose.origin, g.pose.rotation));
                }
            }
        }
    }

    pub fn move_gateway(&mut self, id: GatewayId, pose: GatewayPose) -> Result<()> {
        self.gateways.move_gateway(id, pose)?;
        if let Some(env) = self.gateway_envs.get_mut(&id) {
            env.regress(EnvStage::LocalDataReady);
        }
        // The partner's cloned statics image this side's surroundings, so
        // they are stale too.
        if let Some(partner) = self.gateways.get(id).and_then(|g| g.linked) {
            if let Some(env) = self.gateway_envs.get_mut(&partner) {
                env.regress(EnvStage::LocalPhysics);
            }
        }
        Ok(())
    }

    pub fn gateway(&self, id: GatewayId) -> Option<&Gateway> {
        self.gateways.get(id)
    }

    pub fn env_stage(&self, id: GatewayId) -> Option<EnvStage> {
        self.gateway_envs.get(&id).map(|e| e.stage())
    }

    /// Player-only mode: gateway environments keep their collision data but
    /// skip dynamics entirely.
    pub fn set_player_only_mode(&mut self, enabled: bool) {
        for env in self.gateway_envs.values_mut() {
            env.simulation_enabled = !enabled;
        }
    }

    fn alloc_internal_body(&mut self) -> BodyId {
        let id = BodyId(self.next_internal);
        self.next_internal += 1;
        id
    }

    // ------------------------------------------------------------------
    // Step
    // ------------------------------------------------------------------

    /// Advance the whole subsystem by one fixed timestep.
    pub fn step(
        &mut self,
        world: &dyn WorldCollisionQuery,
        effects: &mut dyn EffectDispatch,
    ) -> StepMetrics {
        let _span = tracing::trace_span!("portal_step", tick = self.tick).entered();
        self.tick += 1;
        self.router.begin_tick(self.tick);
        for (name, pos, rot) in self.pending_effects.drain(..) {
            effects.play(name, pos, rot);
        }

        self.maintain_gateway_stages(world);
        self.refresh_mirrors();
        self.run_trigger_sweep(effects);
        self.step_environments();
        self.sync_states();
        self.detect_crossings(world, effects);
        self.pump_collision_events();
        self.router
            .tick_penetrations(&self.registry, &self.config, self.config.fixed_dt);
        let executed = self.flush_deferred();

        let metrics = StepMetrics {
            tick: self.tick,
            bodies: self.registry.len(),
            mirrors: self.mirrors.len(),
            claimed: self.owners.claimed_count(),
            teleports_total: self.teleports_total,
            touch_events: self.router.pending_touch_events(),
            deferred_executed: executed,
            queue_overflows: self.queue_overflows,
        };
        self.last_metrics = metrics;
        metrics
    }

    pub fn take_teleports(&mut self) -> Vec<TeleportNotice> {
        std::mem::take(&mut self.teleports)
    }

    pub fn take_touch_events(&mut self) -> Vec<crate::router::TouchEvent> {
        self.router.take_touch_events()
    }

    pub fn take_penetration_events(&mut self) -> Vec<crate::router::PenetrationEvent> {
        self.router.take_penetration_events()
    }

    pub fn take_friction_events(&mut self) -> Vec<crate::router::FrictionEvent> {
        self.router.take_friction_events()
    }

    pub fn take_damage_events(&mut self) -> Vec<DamageEvent> {
        std::mem::take(&mut self.damage_out)
    }

    // ------------------------------------------------------------------
    // Step phases
    // ------------------------------------------------------------------

    /// Walk every gateway environment up (or down) its stage ladder.
    fn maintain_gateway_stages(&mut self, world: &dyn WorldCollisionQuery) {
        let ids: Vec<GatewayId> = self.gateways.ids().collect();
        for id in ids {
            let Some(gateway) = self.gateways.get(id).cloned() else {
                continue;
            };
            let Some(env) = self.gateway_envs.get_mut(&id) else {
                continue;
            };

            if env.stage() < EnvStage::LocalCollision {
                env.build_local_collision(
                    &gateway.pose,
                    gateway.half_width,
                    gateway.half_height,
                    gateway.frame_body,
                    &self.config,
                );
                env.set_stage(EnvStage::LocalCollision);
            }
            if env.stage() < EnvStage::LocalPhysics {
                env.set_stage(EnvStage::LocalPhysics);
            }

            match gateway.linked {
                Some(partner_id) => {
                    if env.stage() < EnvStage::Linked {
                        env.set_stage(EnvStage::Linked);
                    }
                    if env.stage() < EnvStage::LinkedCollision {
                        let partner_origin = self
                            .gateways
                            .get(partner_id)
                            .map(|p| p.pose.origin)
                            .unwrap_or(gateway.pose.origin);
                        let shapes =
                            world.shapes_near(partner_origin, self.config.linked_collision_radius);
                        env.build_linked_collision(
                            &shapes,
                            &gateway.transform,
                            gateway.frame_body,
                        );
                        env.set_stage(EnvStage::LinkedCollision);
                    }
                    if env.stage() < EnvStage::LinkedPhysics {
                        env.set_stage(EnvStage::LinkedPhysics);
                    }
                }
                None => {
                    if env.stage() > EnvStage::LocalPhysics {
                        env.regress(EnvStage::LocalPhysics);
                    }
                }
            }
        }
    }

    /// Retarget gateway-tagged mirror transforms, then push every shadow to
    /// its source's transformed pose.
    fn refresh_mirrors(&mut self) {
        for gateway in self.gateways.iter() {
            if gateway.linked.is_some() {
                self.mirrors
                    .retarget_gateway(gateway.id, gateway.transform.this_to_linked);
            }
        }
        self.mirrors.refresh_into(&self.registry, &mut self.main_env);
        for env in self.gateway_envs.values_mut() {
            self.mirrors.refresh_into(&self.registry, env);
        }
    }

    /// Trigger occupancy, wake sweep, ownership claims and releases.
    fn run_trigger_sweep(&mut self, effects: &mut dyn EffectDispatch) {
        let linked: Vec<Gateway> = self
            .gateways
            .iter()
            .filter(|g| g.is_ready_to_teleport())
            .cloned()
            .collect();

        let mut occupancy: HashMap<BodyId, SmallVec<[GatewayId; 2]>> = HashMap::new();
        let mut pre_occupancy: HashMap<BodyId, SmallVec<[GatewayId; 2]>> = HashMap::new();
        let mut to_wake: Vec<BodyId> = Vec::new();

        let ids: Vec<BodyId> = self.registry.ids().collect();
        for id in ids {
            let flags = self.registry.flags(id);
            if flags & (bf::MIRROR | bf::WORLD_GEOMETRY | bf::TRIGGER) != 0 {
                continue;
            }
            let Some(state) = self.registry.state(id) else {
                continue;
            };
            let pos = state.position;
            for gateway in &linked {
                if gateway.in_pretouch(pos, &self.config) {
                    pre_occupancy.entry(id).or_default().push(gateway.id);
                    to_wake.push(id);
                }
                if gateway.in_trigger(pos, &self.config) {
                    occupancy.entry(id).or_default().push(gateway.id);
                }
            }
        }

        for id in to_wake {
            let owner = self.owners.owner_of(id);
            if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, owner) {
                env.wake(id);
            }
        }

        // The sweep volume drives the forced touch lifecycle: a body is
        // "touching" a gateway before it reaches the trigger volume proper,
        // and stays touching until it leaves the sweep.
        let pre_transitions = self.pretouch.update(pre_occupancy);
        for t in &pre_transitions {
            let Some(gateway) = self.gateways.get(t.gateway).cloned() else {
                continue;
            };
            if t.entered {
                self.router
                    .force_touch(&self.registry, t.body, gateway.trigger_body);
            } else {
                self.router
                    .force_untouch(&self.registry, t.body, gateway.trigger_body);
            }
        }

        let transitions = self.triggers.update(occupancy);

        // Claims: a body inside at least one trigger volume belongs to the
        // nearest gateway's environment. Releases: a body inside none goes
        // home to main.
        let bodies: Vec<BodyId> = transitions.iter().map(|t| t.body).collect();
        for body in bodies {
            if !self.registry.contains(body) {
                continue;
            }
            let candidates: Vec<(GatewayId, Vec3)> = self
                .triggers
                .gateways_containing(body)
                .iter()
                .filter_map(|g| self.gateways.get(*g).map(|gw| (*g, gw.pose.origin)))
                .collect();
            let pos = match self.registry.state(body) {
                Some(s) => s.position,
                None => continue,
            };
            match arbitrate(pos, candidates) {
                Some(winner) => self.claim(body, winner),
                None => self.release(body, effects),
            }
        }
    }

    /// Hand a body to a gateway environment and raise its far-side shadow.
    fn claim(&mut self, body: BodyId, gateway_id: GatewayId) {
        let target = EnvId::Gateway(gateway_id);
        if self.owners.owner_of(body) == target {
            return;
        }
        self.move_body(body, target);
        let Some(gateway) = self.gateways.get(gateway_id).cloned() else {
            return;
        };
        if let Some(partner) = gateway.linked {
            if self.mirrors.mirrors_of(body).is_empty() {
                if let Some(partner_env) = self.gateway_envs.get_mut(&partner) {
                    self.mirrors.create(
                        &mut self.registry,
                        partner_env,
                        body,
                        MirrorTag::Gateway(gateway_id),
                        gateway.transform.this_to_linked,
                    );
                }
            }
        }
    }

    /// Return a body to the main environment and drop its shadows.
    fn release(&mut self, body: BodyId, effects: &mut dyn EffectDispatch) {
        if self.owners.owner_of(body) == EnvId::Main {
            return;
        }
        self.teardown_mirrors_of(body);
        self.move_body(body, EnvId::Main);
        if let Some(state) = self.registry.state(body) {
            effects.play("gateway_fizzle", state.position, state.rotation);
        }
    }

    fn teardown_mirrors_of(&mut self, body: BodyId) {
        for mirror in self.mirrors.take_for_source(body) {
            self.registry.unregister(mirror.body);
            if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, mirror.env) {
                env.remove_body(mirror.body);
            }
        }
    }

    /// Move a body between environments, preserving its full state.
    fn move_body(&mut self, body: BodyId, to: EnvId) {
        let from = self.owners.owner_of(body);
        if from == to {
            return;
        }
        let (Some(state), Some(desc)) = (
            self.registry.state(body).copied(),
            self.registry.desc(body).cloned(),
        ) else {
            return;
        };
        if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, from) {
            env.remove_body(body);
        }
        if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, to) {
            env.insert_body(
                body,
                &desc,
                state.position,
                state.rotation,
                state.linvel,
                state.angvel,
            );
        }
        self.owners.set_owner(body, to);
    }

    /// Evict every body an environment owns back to main.
    fn evict_env(&mut self, env: EnvId) {
        for body in self.owners.owned_by(env) {
            self.teardown_mirrors_of(body);
            self.move_body(body, EnvId::Main);
        }
    }

    fn step_environments(&mut self) {
        let dt = self.config.fixed_dt;
        let hooks = RouterHooks {
            registry: &self.registry,
            exclusions: &self.router.exclusions,
            tick: self.tick,
            guard: &self.router.guard,
        };
        self.main_env.step(dt, &hooks);
        for env in self.gateway_envs.values_mut() {
            env.step(dt, &hooks);
        }
    }

    /// Pull authoritative poses out of each body's owning environment.
    fn sync_states(&mut self) {
        let ids: Vec<BodyId> = self.registry.ids().collect();
        for id in ids {
            let flags = self.registry.flags(id);
            if flags & (bf::MIRROR | bf::WORLD_GEOMETRY | bf::TRIGGER) != 0 {
                continue;
            }
            let owner = self.owners.owner_of(id);
            let env = match owner {
                EnvId::Main => &self.main_env,
                EnvId::Gateway(g) => match self.gateway_envs.get(&g) {
                    Some(e) => e,
                    None => continue,
                },
            };
            let Some((pos, rot)) = env.read_pose(id) else {
                continue;
            };
            let (linvel, angvel) = env.read_velocity(id).unwrap_or((Vec3::ZERO, Vec3::ZERO));
            if let Some(state) = self.registry.state_mut(id) {
                state.last_position = state.position;
                state.position = pos;
                state.rotation = rot;
                state.linvel = linvel;
                state.angvel = angvel;
            }
        }
    }

    /// Find bodies that crossed a linked gateway plane this step and run the
    /// teleport protocol for each.
    fn detect_crossings(
        &mut self,
        world: &dyn WorldCollisionQuery,
        effects: &mut dyn EffectDispatch,
    ) {
        let linked: Vec<Gateway> = self
            .gateways
            .iter()
            .filter(|g| g.is_ready_to_teleport())
            .cloned()
            .collect();
        if linked.is_empty() {
            return;
        }

        let ids: Vec<BodyId> = self.registry.ids().collect();
        for id in ids {
            let flags = self.registry.flags(id);
            if flags & (bf::MIRROR | bf::WORLD_GEOMETRY | bf::TRIGGER) != 0 {
                continue;
            }
            let Some(state) = self.registry.state(id).copied() else {
                continue;
            };
            let owner = self.owners.owner_of(id);
            for gateway in &linked {
                // Only the gateway that currently owns the body may teleport
                // it; anything else is re-evaluated next tick, by which time
                // the trigger sweep has claimed it.
                if owner != EnvId::Gateway(gateway.id) {
                    continue;
                }
                // A fresh arrival sits on the destination plane; its landing
                // must not read as a new crossing.
                if self
                    .router
                    .exclusions
                    .is_excluded(id, gateway.frame_body, self.tick)
                {
                    continue;
                }
                if gateway.crossed(state.last_position, state.position) {
                    if let Some(partner) = gateway.linked {
                        self.teleport(id, gateway.id, partner, world, effects);
                    }
                    break;
                }
            }
        }
    }

    /// The teleport protocol. Runs start to finish within one step; no
    /// intermediate state is ever observable from outside.
    fn teleport(
        &mut self,
        body: BodyId,
        from_id: GatewayId,
        to_id: GatewayId,
        world: &dyn WorldCollisionQuery,
        effects: &mut dyn EffectDispatch,
    ) {
        let (Some(from), Some(to)) = (
            self.gateways.get(from_id).cloned(),
            self.gateways.get(to_id).cloned(),
        ) else {
            return;
        };
        let Some(state) = self.registry.state(body).copied() else {
            return;
        };
        let flags = self.registry.flags(body);

        // 1. Departure state, with the velocity fallback chain.
        let velocity = departure_velocity(&state, self.config.fixed_dt);

        // 2. Remap through the gateway pair. The arrival point is pulled back
        //    in front of any static surface crowding the exit so the body is
        //    never dropped inside the world.
        let mut new_pos = from.transform.point(state.position);
        let new_rot = from.transform.orientation(state.rotation);
        let mut new_vel = from.transform.direction(velocity);
        let new_angvel = from.transform.direction(state.angvel);
        let offset = new_pos - to.pose.origin;
        let dist = offset.length();
        if dist > 1e-4 {
            let dir = offset / dist;
            if let Some(hit) = world.cast_ray(to.pose.origin, dir, dist) {
                new_pos = to.pose.origin + dir * (hit.distance - 0.01).max(0.0);
            }
        }

        // 3. Exit speed floors and cap.
        let min_speed = if bf::has(flags, bf::PLAYER) && from.is_floor() {
            self.config.min_speed_player
        } else if from.is_floor() && to.is_floor() {
            self.config.min_speed_floor_to_floor
        } else if from.is_floor() {
            self.config.min_speed_floor_to_other
        } else {
            0.0
        };
        let speed = new_vel.length();
        let dir = if speed > 1e-4 {
            new_vel / speed
        } else {
            to.pose.normal()
        };
        new_vel = dir * speed.max(min_speed).min(self.config.max_teleport_speed);

        // 4. Move the body into the destination environment.
        let old_owner = self.owners.owner_of(body);
        if let Some(env) = env_mut(&mut self.main_env, &mut self.gateway_envs, old_owner) {
            env.remove_body(body);
        }
        if let Some(state) = self.registry.state_mut(body) {
            state.position = new_pos;
            state.last_position = new_pos;
            state.rotation = new_rot;
            state.linvel = new_vel;
            state.angvel = new_angvel;
        }
        if let Some(desc) = self.registry.desc(body).cloned() {
            if let Some(env) = self.gateway_envs.get_mut(&to_id) {
                env.insert_body(body, &desc, new_pos, new_rot, new_vel, new_angvel);
            }
        }
        self.owners.set_owner(body, EnvId::Gateway(to_id));

        // 5. Keep the departure side from instantly re-contacting the body,
        //    and the arrival side from bouncing it straight back.
        self.router
            .exclusions
            .exclude(body, from.frame_body, self.tick);
        self.router
            .exclusions
            .exclude(body, to.frame_body, self.tick);

        // 6. Atomic touch hand-off between the two trigger volumes.
        self.router
            .retarget_touch(&self.registry, body, from.trigger_body, to.trigger_body);
        self.triggers.retarget(body, from_id, to_id);
        self.pretouch.retarget(body, from_id, to_id);

        // 7. Shadow hand-off: old mirrors die, the arrival side raises one
        //    looking back through the destination gateway.
        self.teardown_mirrors_of(body);
        if let Some(from_env) = self.gateway_envs.get_mut(&from_id) {
            self.mirrors.create(
                &mut self.registry,
                from_env,
                body,
                MirrorTag::Gateway(to_id),
                to.transform.this_to_linked,
            );
        }

        // 8. Notify.
        self.teleports_total += 1;
        self.teleports.push(TeleportNotice {
            body,
            from: from_id,
            to: to_id,
            position: new_pos,
            rotation: new_rot,
            velocity: new_vel,
            tick: self.tick,
        });
        effects.play("gateway_transit", from.pose.origin, from.pose.rotation);
        effects.play("gateway_transit", to.pose.origin, to.pose.rotation);
        log::debug!(
            "body {} teleported gateway {} -> {} at speed {:.2}",
            body.0,
            from_id.0,
            to_id.0,
            new_vel.length()
        );
    }

    /// Drain collision channels from every environment into the router.
    fn pump_collision_events(&mut self) {
        let mut contacts = Vec::new();
        let mut forces = Vec::new();
        let mut deeps = Vec::new();
        let slop = self.config.penetration_slop;

        contacts.extend(self.main_env.drain_contact_events());
        forces.extend(self.main_env.drain_contact_forces());
        deeps.extend(self.main_env.deep_contacts(slop));
        for env in self.gateway_envs.values_mut() {
            contacts.extend(env.drain_contact_events());
            forces.extend(env.drain_contact_forces());
            deeps.extend(env.deep_contacts(slop));
        }

        for event in contacts {
            // Shadow contacts are reported against their source body.
            let a = self.mirrors.resolve_source(event.a);
            let b = self.mirrors.resolve_source(event.b);
            if a == b {
                continue;
            }
            if event.started {
                self.router
                    .note_contact_started(&self.registry, a, b, event.contact);
            } else {
                let registry = &self.registry;
                let main_env = &self.main_env;
                let gateway_envs = &self.gateway_envs;
                self.router
                    .note_contact_stopped(registry, a, b, event.contact, |x, y| {
                        let ga = registry.hierarchy_members(x);
                        let gb = registry.hierarchy_members(y);
                        let mut n = main_env.contact_count(&ga, &gb);
                        for env in gateway_envs.values() {
                            n += env.contact_count(&ga, &gb);
                        }
                        n
                    });
            }
        }
        for (a, b, magnitude) in forces {
            let a = self.mirrors.resolve_source(a);
            let b = self.mirrors.resolve_source(b);
            self.router
                .note_friction(a, b, magnitude * self.config.fixed_dt);
        }
        for deep in deeps {
            let a = self.mirrors.resolve_source(deep.a);
            let b = self.mirrors.resolve_source(deep.b);
            if a != b {
                self.router.observe_penetration(a, b, deep.depth, deep.normal);
            }
        }
    }

    /// Execute the deferred side-effect queue. A bounded-out drain is logged
    /// and counted, never propagated.
    fn flush_deferred(&mut self) -> usize {
        let registry = &mut self.registry;
        let main_env = &mut self.main_env;
        let gateway_envs = &mut self.gateway_envs;
        let owners = &self.owners;
        let mirrors = &self.mirrors;
        let damage_out = &mut self.damage_out;
        let mut removed: Vec<BodyId> = Vec::new();

        let result = self
            .router
            .drain_deferred(self.config.drain_bound, |op, _requeue| match op {
                DeferredOp::Damage(mut event) => {
                    event.target = mirrors.resolve_source(event.target);
                    if let Some(i) = event.inflictor {
                        event.inflictor = Some(mirrors.resolve_source(i));
                    }
                    damage_out.push(event);
                }
                DeferredOp::Remove(body) => removed.push(body),
                DeferredOp::SetVelocity {
                    body,
                    linvel,
                    angvel,
                } => {
                    let body = mirrors.resolve_source(body);
                    if let Some(env) = env_mut(main_env, gateway_envs, owners.owner_of(body)) {
                        env.set_velocity(body, linvel, angvel);
                    }
                    if let Some(state) = registry.state_mut(body) {
                        state.linvel = linvel;
                        state.angvel = angvel;
                    }
                }
                DeferredOp::Sleep(body) => {
                    let body = mirrors.resolve_source(body);
                    if let Some(env) = env_mut(main_env, gateway_envs, owners.owner_of(body)) {
                        env.sleep(body);
                    }
                }
                DeferredOp::Wake(body) => {
                    let body = mirrors.resolve_source(body);
                    if let Some(env) = env_mut(main_env, gateway_envs, owners.owner_of(body)) {
                        env.wake(body);
                    }
                }
                DeferredOp::Nudge { body, impulse } => {
                    let body = mirrors.resolve_source(body);
                    if let Some(env) = env_mut(main_env, gateway_envs, owners.owner_of(body)) {
                        env.apply_impulse(body, impulse);
                    }
                }
            });

        let executed = match result {
            Ok(n) => n,
            Err(err) => {
                log::error!("deferred drain: {}", err);
                self.queue_overflows += 1;
                0
            }
        };
        for body in removed {
            self.remove_body(body);
        }
        executed
    }
}

impl PortalSim {
    /// Capture durable state: host bodies, gateway placements, pairings.
    pub fn snapshot(&self) -> crate::save::Snapshot {
        let mut bodies = Vec::new();
        for id in self.registry.ids() {
            if id.0 >= INTERNAL_BODY_BASE {
                continue;
            }
            let flags = self.registry.flags(id);
            if bf::has(flags, bf::MIRROR) {
                continue;
            }
            let (Some(desc), Some(state)) = (self.registry.desc(id), self.registry.state(id))
            else {
                continue;
            };
            bodies.push(crate::save::BodySnapshot {
                id,
                desc: desc.clone(),
                position: state.position,
                rotation: state.rotation,
                linvel: state.linvel,
                angvel: state.angvel,
            });
        }
        bodies.sort_by_key(|b| b.id);

        let mut gateways = Vec::new();
        let mut links = Vec::new();
        for g in self.gateways.iter() {
            gateways.push(crate::save::GatewaySnapshot {
                id: g.id,
                origin: g.pose.origin,
                rotation: g.pose.rotation,
                half_width: g.half_width,
                half_height: g.half_height,
                group: g.group,
                secondary: g.secondary,
                active: g.active,
            });
            if let Some(partner) = g.linked {
                if g.id < partner {
                    links.push((g.id, partner));
                }
            }
        }
        gateways.sort_by_key(|g| g.id);
        links.sort();

        crate::save::Snapshot {
            tick: self.tick,
            config: self.config.clone(),
            bodies,
            gateways,
            links,
        }
    }

    /// Rebuild a sim from a snapshot. Derived state (ownership, mirrors,
    /// touch bookkeeping) re-forms over the first steps.
    pub fn restore(snapshot: &crate::save::Snapshot) -> Result<Self> {
        let mut sim = PortalSim::new(snapshot.config.clone());
        sim.tick = snapshot.tick;
        for g in &snapshot.gateways {
            sim.place_gateway(
                g.id,
                GatewayPose::new(g.origin, g.rotation),
                g.half_width,
                g.half_height,
                g.group,
                g.secondary,
                g.active,
            );
        }
        for (a, b) in &snapshot.links {
            sim.link_gateways(*a, *b)?;
        }
        for b in &snapshot.bodies {
            sim.add_body(b.id, b.desc.clone(), b.position, b.rotation);
            sim.set_body_velocity(b.id, b.linvel, b.angvel);
        }
        Ok(sim)
    }
}

/// Split-borrow environment lookup usable from closures that already hold
/// the two environment fields mutably.
fn env_mut<'a>(
    main: &'a mut SimulationEnvironment,
    gateways: &'a mut HashMap<GatewayId, SimulationEnvironment>,
    env: EnvId,
) -> Option<&'a mut SimulationEnvironment> {
    match env {
        EnvId::Main => Some(main),
        EnvId::Gateway(g) => gateways.get_mut(&g),
    }
}

/// Velocity a body leaves with: live rigid velocity first, then the host's
/// legacy entity velocity, then the implicit position delta.
fn departure_velocity(state: &BodyState, dt: f32) -> Vec3 {
    if state.linvel.length_squared() > 1e-6 {
        state.linvel
    } else if state.legacy_velocity.length_squared() > 1e-6 {
        state.legacy_velocity
    } else if dt > 0.0 {
        (state.position - state.last_position) / dt
    } else {
        Vec3::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ShapeDesc;
    use crate::external::{EmptyWorld, LoggingEffects, StaticShape, SurfaceHit};
    use glam::Quat;
    use std::f32::consts::FRAC_PI_2;

    /// One static box near a fixed point, nothing anywhere else.
    struct BoxAt(Vec3);

    impl WorldCollisionQuery for BoxAt {
        fn shapes_near(&self, center: Vec3, radius: f32) -> Vec<StaticShape> {
            if center.distance(self.0) <= radius {
                vec![StaticShape {
                    shape: ShapeDesc::cuboid(Vec3::ONE),
                    position: self.0,
                    rotation: Quat::IDENTITY,
                }]
            } else {
                Vec::new()
            }
        }

        fn cast_ray(&self, _origin: Vec3, _dir: Vec3, _max_dist: f32) -> Option<SurfaceHit> {
            None
        }
    }

    /// Every ray hits a surface 0.1 m out, as if a wall crowded the exit.
    struct WallWorld;

    impl WorldCollisionQuery for WallWorld {
        fn shapes_near(&self, _center: Vec3, _radius: f32) -> Vec<StaticShape> {
            Vec::new()
        }

        fn cast_ray(&self, origin: Vec3, dir: Vec3, _max_dist: f32) -> Option<SurfaceHit> {
            Some(SurfaceHit {
                point: origin + dir * 0.1,
                normal: -dir,
                distance: 0.1,
            })
        }
    }

    fn zero_gravity_config() -> SimulationConfig {
        let mut cfg = SimulationConfig::default();
        cfg.gravity = [0.0, 0.0, 0.0];
        cfg
    }

    /// A at the origin facing +X, B far away facing -X, linked.
    fn facing_sim(cfg: SimulationConfig) -> (PortalSim, GatewayId, GatewayId) {
        let mut sim = PortalSim::new(cfg);
        let a = sim.add_gateway(
            GatewayPose::new(Vec3::ZERO, Quat::from_rotation_y(-FRAC_PI_2)),
            0.5,
            1.0,
        );
        let b = sim.add_gateway(
            GatewayPose::new(Vec3::new(1000.0, 0.0, 0.0), Quat::from_rotation_y(FRAC_PI_2)),
            0.5,
            1.0,
        );
        sim.link_gateways(a, b).unwrap();
        (sim, a, b)
    }

    #[test]
    fn test_gateway_env_reaches_linked_physics() {
        let (mut sim, a, b) = facing_sim(zero_gravity_config());
        sim.step(&EmptyWorld, &mut LoggingEffects);
        assert_eq!(sim.env_stage(a), Some(EnvStage::LinkedPhysics));
        assert_eq!(sim.env_stage(b), Some(EnvStage::LinkedPhysics));

        sim.unlink_gateway(a);
        sim.step(&EmptyWorld, &mut LoggingEffects);
        assert_eq!(sim.env_stage(a), Some(EnvStage::LocalPhysics));
        assert_eq!(sim.env_stage(b), Some(EnvStage::LocalPhysics));
    }

    #[test]
    fn test_flying_body_teleports_once_and_keeps_speed() {
        let (mut sim, a, b) = facing_sim(zero_gravity_config());
        let body = BodyId(1);
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-2.0, 0.0, 0.0),
            Quat::IDENTITY,
        );
        sim.set_body_velocity(body, Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO);

        let mut notices = Vec::new();
        for _ in 0..90 {
            sim.step(&EmptyWorld, &mut LoggingEffects);
            notices.extend(sim.take_teleports());
        }

        assert_eq!(notices.len(), 1, "expected exactly one teleport");
        let n = notices[0];
        assert_eq!(n.body, body);
        assert_eq!(n.from, a);
        assert_eq!(n.to, b);
        // Exits near B's plane moving away from it at the same speed.
        assert!((n.position.x - 1000.0).abs() < 1.0);
        assert!((n.velocity.x + 5.0).abs() < 0.5, "velocity {:?}", n.velocity);

        let state = sim.body_state(body).unwrap();
        assert!(state.position.x < 1000.0);
        assert!(state.linvel.x < -4.0);
    }

    #[test]
    fn test_ownership_claims_then_releases_after_transit() {
        let (mut sim, _a, b) = facing_sim(zero_gravity_config());
        let body = BodyId(1);
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-2.0, 0.0, 0.0),
            Quat::IDENTITY,
        );
        sim.set_body_velocity(body, Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO);

        let mut saw_claim = false;
        let mut saw_dest = false;
        for _ in 0..240 {
            sim.step(&EmptyWorld, &mut LoggingEffects);
            match sim.owner_of(body) {
                EnvId::Gateway(g) if g == b => saw_dest = true,
                EnvId::Gateway(_) => saw_claim = true,
                EnvId::Main => {}
            }
        }
        assert!(saw_claim, "body was never claimed by the source gateway");
        assert!(saw_dest, "body never owned by the destination gateway");
        assert_eq!(
            sim.owner_of(body),
            EnvId::Main,
            "body should return to main after leaving the trigger"
        );
        assert_eq!(sim.mirror_count(), 0);
    }

    #[test]
    fn test_mirror_raised_on_claim_and_torn_down_on_remove() {
        let (mut sim, _a, _b) = facing_sim(zero_gravity_config());
        let body = BodyId(1);
        // Parked inside A's trigger volume, not moving.
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-0.4, 0.0, 0.0),
            Quat::IDENTITY,
        );
        sim.step(&EmptyWorld, &mut LoggingEffects);
        assert!(matches!(sim.owner_of(body), EnvId::Gateway(_)));
        assert_eq!(sim.mirror_count(), 1);

        sim.remove_body(body);
        assert_eq!(sim.mirror_count(), 0);
        assert!(!sim.registry().contains(body));
        // The sim keeps stepping fine afterwards.
        sim.step(&EmptyWorld, &mut LoggingEffects);
    }

    #[test]
    fn test_trigger_touch_events_fire_and_clear() {
        let (mut sim, a, _b) = facing_sim(zero_gravity_config());
        let trigger_body = sim.gateway(a).unwrap().trigger_body;
        let body = BodyId(1);
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-0.4, 0.0, 0.0),
            Quat::IDENTITY,
        );
        sim.step(&EmptyWorld, &mut LoggingEffects);
        let events = sim.take_touch_events();
        assert!(events
            .iter()
            .any(|e| e.started && e.trigger && (e.a == trigger_body || e.b == trigger_body)));

        // Back the body out of the trigger volume; the sweep releases and
        // untouches before it can reach the tube's rear cap.
        sim.set_body_velocity(body, Vec3::new(-50.0, 0.0, 0.0), Vec3::ZERO);
        for _ in 0..30 {
            sim.step(&EmptyWorld, &mut LoggingEffects);
        }
        let events = sim.take_touch_events();
        assert!(events
            .iter()
            .any(|e| !e.started && (e.a == trigger_body || e.b == trigger_body)));
        assert_eq!(sim.owner_of(body), EnvId::Main);
    }

    #[test]
    fn test_remove_gateway_evicts_bodies() {
        let (mut sim, a, _b) = facing_sim(zero_gravity_config());
        let body = BodyId(1);
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-0.4, 0.0, 0.0),
            Quat::IDENTITY,
        );
        sim.step(&EmptyWorld, &mut LoggingEffects);
        assert!(matches!(sim.owner_of(body), EnvId::Gateway(_)));

        sim.remove_gateway(a);
        assert_eq!(sim.owner_of(body), EnvId::Main);
        assert_eq!(sim.mirror_count(), 0);
        sim.step(&EmptyWorld, &mut LoggingEffects);
        assert!(sim.body_state(body).is_some());
    }

    #[test]
    fn test_damage_redirects_from_shadow_to_source() {
        let (mut sim, _a, _b) = facing_sim(zero_gravity_config());
        let body = BodyId(1);
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-0.4, 0.0, 0.0),
            Quat::IDENTITY,
        );
        sim.step(&EmptyWorld, &mut LoggingEffects);
        assert_eq!(sim.mirror_count(), 1);
        let shadow = sim
            .registry()
            .ids()
            .find(|id| bf::has(sim.registry().flags(*id), bf::MIRROR))
            .unwrap();

        sim.apply_damage(shadow, None, 25.0, Vec3::ZERO);
        sim.step(&EmptyWorld, &mut LoggingEffects);
        let damage = sim.take_damage_events();
        assert_eq!(damage.len(), 1);
        assert_eq!(damage[0].target, body);
    }

    #[test]
    fn test_request_ownership_requires_linked_gateway() {
        let (mut sim, a, _b) = facing_sim(zero_gravity_config());
        let body = BodyId(1);
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-3.0, 0.0, 0.0),
            Quat::IDENTITY,
        );
        assert!(sim.request_ownership(body, a));
        assert!(sim.owns_body(EnvId::Gateway(a), body));

        sim.unlink_gateway(a);
        assert!(sim.owns_body(EnvId::Main, body));
        assert!(!sim.request_ownership(body, a));
        assert!(!sim.request_ownership(BodyId(99), a));
    }

    #[test]
    fn test_move_gateway_refreshes_partner_linked_collision() {
        let (mut sim, a, b) = facing_sim(zero_gravity_config());
        // A static box next to A: B's environment clones it.
        let world = BoxAt(Vec3::new(2.0, 0.0, 0.0));
        sim.step(&world, &mut LoggingEffects);
        assert_eq!(
            sim.gateway_envs.get(&b).unwrap().linked_collision_count(),
            1
        );

        // A moves far from the box; B's clone set must follow.
        sim.move_gateway(
            a,
            GatewayPose::new(Vec3::new(0.0, 200.0, 0.0), Quat::from_rotation_y(-FRAC_PI_2)),
        )
        .unwrap();
        sim.step(&world, &mut LoggingEffects);
        assert_eq!(
            sim.gateway_envs.get(&b).unwrap().linked_collision_count(),
            0
        );
    }

    #[test]
    fn test_pretouch_registers_touch_before_trigger_entry() {
        let (mut sim, a, _b) = facing_sim(zero_gravity_config());
        let trigger_body = sim.gateway(a).unwrap().trigger_body;
        let body = BodyId(1);
        // Inside the wake-and-pre-touch sweep but short of the trigger volume.
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-1.2, 0.0, 0.0),
            Quat::IDENTITY,
        );
        sim.step(&EmptyWorld, &mut LoggingEffects);
        let events = sim.take_touch_events();
        assert!(events
            .iter()
            .any(|e| e.started && e.trigger && (e.a == trigger_body || e.b == trigger_body)));
        // No ownership change until the trigger volume proper is entered.
        assert_eq!(sim.owner_of(body), EnvId::Main);
    }

    #[test]
    fn test_linkage_group_activation_auto_pairs() {
        let mut sim = PortalSim::new(zero_gravity_config());
        let a = sim.add_gateway_in_group(
            GatewayPose::new(Vec3::ZERO, Quat::from_rotation_y(-FRAC_PI_2)),
            0.5,
            1.0,
            7,
            false,
        );
        let b = sim.add_gateway_in_group(
            GatewayPose::new(Vec3::new(1000.0, 0.0, 0.0), Quat::from_rotation_y(FRAC_PI_2)),
            0.5,
            1.0,
            7,
            true,
        );

        sim.set_gateway_active(a, true).unwrap();
        assert_eq!(sim.gateway(a).unwrap().linked, None);

        sim.set_gateway_active(b, true).unwrap();
        assert_eq!(sim.gateway(a).unwrap().linked, Some(b));
        assert!(sim.gateway(b).unwrap().is_ready_to_teleport());

        sim.set_gateway_active(a, false).unwrap();
        assert_eq!(sim.gateway(b).unwrap().linked, None);
        assert!(!sim.gateway(b).unwrap().is_ready_to_teleport());
        assert!(sim
            .set_gateway_active(GatewayId(99), true)
            .is_err());
    }

    #[test]
    fn test_arrival_pulled_back_from_blocking_surface() {
        let (mut sim, _a, b) = facing_sim(zero_gravity_config());
        let body = BodyId(1);
        sim.add_body(
            body,
            BodyDesc::new(ShapeDesc::ball(0.2), bf::SOLID),
            Vec3::new(-2.0, 0.5, 0.0),
            Quat::IDENTITY,
        );
        sim.set_body_velocity(body, Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO);

        let mut notices = Vec::new();
        for _ in 0..90 {
            sim.step(&WallWorld, &mut LoggingEffects);
            notices.extend(sim.take_teleports());
        }
        assert_eq!(notices.len(), 1);
        // The exit is crowded at 0.1 m; the body lands just inside that.
        let dest = sim.gateway(b).unwrap().pose.origin;
        assert!(notices[0].position.distance(dest) < 0.15);
    }

    #[test]
    fn test_departure_velocity_fallback_chain() {
        let dt = 1.0 / 60.0;
        let mut state = BodyState {
            position: Vec3::new(1.0, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            linvel: Vec3::new(3.0, 0.0, 0.0),
            angvel: Vec3::ZERO,
            last_position: Vec3::ZERO,
            legacy_velocity: Vec3::new(7.0, 0.0, 0.0),
        };
        assert_eq!(departure_velocity(&state, dt), Vec3::new(3.0, 0.0, 0.0));
        state.linvel = Vec3::ZERO;
        assert_eq!(departure_velocity(&state, dt), Vec3::new(7.0, 0.0, 0.0));
        state.legacy_velocity = Vec3::ZERO;
        let implicit = departure_velocity(&state, dt);
        assert!((implicit.x - 60.0).abs() < 1e-3);
    }
}
