// src/router.rs
//! Collision Event Router: the single sink for low-level physics callbacks.
//!
//! - `should_collide` is a pure, symmetric function of the two bodies'
//!   capability flags, their hierarchy relation, and the pairwise exclusion
//!   hash. A debug assertion verifies symmetry on every query.
//! - Touch lifecycle is a 2-state machine per unordered body pair. End-touch
//!   recounts every sub-body contact before firing; composites can lose one
//!   contact while still touching through another sub-body.
//! - Penetration is a 5-state machine per pair: sustained overlap escalates
//!   to a solver and finally to force-sleeping both bodies; it is never
//!   silently dropped.
//! - Side effects are never applied inside a physics callback. Everything is
//!   queued and drained once at end-of-step through a bounded loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use glam::Vec3;
use rapier3d::prelude::{PairFilterContext, PhysicsHooks, SolverFlags};
use xxhash_rust::xxh3::xxh3_64;

use crate::body::{body_flags as bf, BodyId, BodyRegistry};
use crate::config::SimulationConfig;
use crate::error::{Error, Result};

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchEvent {
    pub a: BodyId,
    pub b: BodyId,
    pub started: bool,
    /// Either participant is a trigger volume.
    pub trigger: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageEvent {
    pub target: BodyId,
    pub inflictor: Option<BodyId>,
    pub amount: f32,
    pub position: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrictionEvent {
    pub a: BodyId,
    pub b: BodyId,
    pub energy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenetrationPhase {
    Enabled,
    TryNpcSolver,
    TryEntitySolver,
    TryDisable,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenetrationEvent {
    pub a: BodyId,
    pub b: BodyId,
    pub depth: f32,
    pub phase: PenetrationPhase,
}

/// Deferred side effect raised during a step, executed at end-of-step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeferredOp {
    Damage(DamageEvent),
    Remove(BodyId),
    SetVelocity {
        body: BodyId,
        linvel: Vec3,
        angvel: Vec3,
    },
    Sleep(BodyId),
    Wake(BodyId),
    /// Solver nudge: push a body along `impulse` to separate a stuck pair.
    Nudge {
        body: BodyId,
        impulse: Vec3,
    },
}

// ============================================================================
// Re-entrancy guard
// ============================================================================

/// Scoped "inside a physics callback" flag. Queue flushing asserts against
/// it; rapier must never be re-entered from its own callbacks. Atomic with
/// relaxed ordering to satisfy the `PhysicsHooks: Send + Sync` bound; the
/// step itself is single-threaded by contract.
#[derive(Debug, Default)]
pub struct CallbackGuard(AtomicBool);

impl CallbackGuard {
    #[inline]
    pub fn enter(&self) -> CallbackScope<'_> {
        debug_assert!(
            !self.0.load(Ordering::Relaxed),
            "re-entrant physics callback"
        );
        self.0.store(true, Ordering::Relaxed);
        CallbackScope(self)
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct CallbackScope<'a>(&'a CallbackGuard);

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        (self.0).0.store(false, Ordering::Relaxed);
    }
}

// ============================================================================
// Pairwise exclusion hash
// ============================================================================

#[inline]
fn pair_key(a: BodyId, b: BodyId) -> (BodyId, BodyId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[inline]
fn pair_hash(a: BodyId, b: BodyId) -> u64 {
    let (lo, hi) = pair_key(a, b);
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&lo.0.to_le_bytes());
    buf[4..].copy_from_slice(&hi.0.to_le_bytes());
    xxh3_64(&buf)
}

/// Pairs whose collision is suppressed until an expiry tick. Used to keep a
/// freshly teleported body from instantly re-contacting what it just left.
#[derive(Debug, Default)]
pub struct ExclusionSet {
    entries: HashMap<u64, u64>,
}

impl ExclusionSet {
    /// Suppress the pair for the remainder of this tick and the next one.
    pub fn exclude(&mut self, a: BodyId, b: BodyId, now_tick: u64) {
        self.entries.insert(pair_hash(a, b), now_tick + 1);
    }

    #[inline]
    pub fn is_excluded(&self, a: BodyId, b: BodyId, now_tick: u64) -> bool {
        self.entries
            .get(&pair_hash(a, b))
            .map(|expiry| *expiry >= now_tick)
            .unwrap_or(false)
    }

    pub fn purge_expired(&mut self, now_tick: u64) {
        self.entries.retain(|_, expiry| *expiry >= now_tick);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// should-collide policy
// ============================================================================

fn should_collide_directed(
    registry: &BodyRegistry,
    exclusions: &ExclusionSet,
    tick: u64,
    a: BodyId,
    b: BodyId,
) -> bool {
    if a == b {
        return false;
    }
    if exclusions.is_excluded(a, b, tick) {
        return false;
    }

    let fa = registry.flags(a);
    let fb = registry.flags(b);

    // Non-solid, non-trigger bodies never generate contacts.
    if fa & (bf::SOLID | bf::TRIGGER) == 0 || fb & (bf::SOLID | bf::TRIGGER) == 0 {
        return false;
    }
    // Two triggers have nothing to report to each other.
    if bf::has(fa, bf::TRIGGER) && bf::has(fb, bf::TRIGGER) {
        return false;
    }

    // Shared hierarchical parent: never collide, unless both sides are
    // composite sub-bodies that explicitly allow self contact.
    if registry.shares_parent(a, b) {
        let self_ok = bf::has(fa, bf::COMPOSITE)
            && bf::has(fb, bf::COMPOSITE)
            && !bf::has(fa, bf::NO_SELF_COLLIDE)
            && !bf::has(fb, bf::NO_SELF_COLLIDE);
        if !self_ok {
            return false;
        }
    }

    // Two world-constrained bodies cannot push each other anywhere useful.
    if bf::has(fa, bf::CONSTRAINED_TO_WORLD) && bf::has(fb, bf::CONSTRAINED_TO_WORLD) {
        return false;
    }

    // Vehicle wheels interact with the static world (and triggers) only;
    // their gameplay contact is handled by the suspension raycast.
    let wheel_blocked = |wheel: u32, other: u32| {
        bf::has(wheel, bf::VEHICLE_WHEEL)
            && other & (bf::WORLD_GEOMETRY | bf::TRIGGER) == 0
    };
    if wheel_blocked(fa, fb) || wheel_blocked(fb, fa) {
        return false;
    }

    true
}

/// Pure collision arbitration. Symmetric by construction; debug builds check.
pub fn should_collide(
    registry: &BodyRegistry,
    exclusions: &ExclusionSet,
    tick: u64,
    a: BodyId,
    b: BodyId,
) -> bool {
    let forward = should_collide_directed(registry, exclusions, tick, a, b);
    debug_assert_eq!(
        forward,
        should_collide_directed(registry, exclusions, tick, b, a),
        "should_collide asymmetry for {:?} / {:?}",
        a,
        b
    );
    forward
}

// ============================================================================
// Router
// ============================================================================

#[derive(Debug)]
struct TouchState {
    /// Live collider-level contacts between the pair's rigid-body sets.
    contacts: HashSet<(u64, u64)>,
    /// Registered by the pre-touch sweep before any real contact existed.
    forced: bool,
}

#[derive(Debug)]
struct PenetrationState {
    phase: PenetrationPhase,
    /// Seconds of continuous penetration in the current phase.
    sustained: f32,
    /// Seconds since penetration was last observed.
    clear: f32,
    depth: f32,
    normal: Vec3,
    observed_this_tick: bool,
}

/// Process-wide sink for physics-engine callbacks. Owns nothing but event
/// queues and the per-pair state machines.
pub struct CollisionRouter {
    pub exclusions: ExclusionSet,
    pub guard: CallbackGuard,
    touches: HashMap<(BodyId, BodyId), TouchState>,
    penetrations: HashMap<(BodyId, BodyId), PenetrationState>,
    deferred: VecDeque<DeferredOp>,
    touch_events: Vec<TouchEvent>,
    penetration_events: Vec<PenetrationEvent>,
    friction_events: Vec<FrictionEvent>,
    tick: u64,
}

impl CollisionRouter {
    pub fn new() -> Self {
        Self {
            exclusions: ExclusionSet::default(),
            guard: CallbackGuard::default(),
            touches: HashMap::new(),
            penetrations: HashMap::new(),
            deferred: VecDeque::new(),
            touch_events: Vec::with_capacity(64),
            penetration_events: Vec::with_capacity(16),
            friction_events: Vec::with_capacity(16),
            tick: 0,
        }
    }

    #[inline]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Advance the router's tick counter; expired exclusions are dropped.
    pub fn begin_tick(&mut self, tick: u64) {
        self.tick = tick;
        self.exclusions.purge_expired(tick);
        for pen in self.penetrations.values_mut() {
            pen.observed_this_tick = false;
        }
    }

    pub fn should_collide(&self, registry: &BodyRegistry, a: BodyId, b: BodyId) -> bool {
        should_collide(registry, &self.exclusions, self.tick, a, b)
    }

    // ------------------------------------------------------------------
    // Touch lifecycle
    // ------------------------------------------------------------------

    /// A collider-level contact between bodies `a` and `b` appeared.
    pub fn note_contact_started(
        &mut self,
        registry: &BodyRegistry,
        a: BodyId,
        b: BodyId,
        contact: (u64, u64),
    ) {
        debug_assert!(!self.guard.active(), "touch dispatch inside callback");
        let key = pair_key(a, b);
        let state = self.touches.entry(key).or_insert_with(|| TouchState {
            contacts: HashSet::new(),
            forced: false,
        });
        let was_empty = state.contacts.is_empty() && !state.forced;
        state.contacts.insert(contact);
        if was_empty {
            self.fire_touch(registry, key.0, key.1, true);
        }
    }

    /// A collider-level contact disappeared. `recount` must return the number
    /// of live contact points remaining across *every* sub-body pair of the
    /// two hierarchies; a composite can drop one contact while still touching
    /// through another, and firing end-touch early is a correctness bug.
    pub fn note_contact_stopped(
        &mut self,
        registry: &BodyRegistry,
        a: BodyId,
        b: BodyId,
        contact: (u64, u64),
        recount: impl Fn(BodyId, BodyId) -> usize,
    ) {
        debug_assert!(!self.guard.active(), "touch dispatch inside callback");
        let key = pair_key(a, b);
        let Some(state) = self.touches.get_mut(&key) else {
            return;
        };
        state.contacts.remove(&contact);
        if state.contacts.is_empty() && !state.forced {
            if recount(key.0, key.1) == 0 {
                self.touches.remove(&key);
                self.fire_touch(registry, key.0, key.1, false);
            }
        }
    }

    /// Register a touch relationship before any physical contact exists
    /// (the wake-and-pre-touch sweep).
    pub fn force_touch(&mut self, registry: &BodyRegistry, a: BodyId, b: BodyId) {
        let key = pair_key(a, b);
        match self.touches.get_mut(&key) {
            Some(state) => state.forced = true,
            None => {
                self.touches.insert(
                    key,
                    TouchState {
                        contacts: HashSet::new(),
                        forced: true,
                    },
                );
                self.fire_touch(registry, key.0, key.1, true);
            }
        }
    }

    /// Drop a touch relationship outright, firing end-touch if it existed.
    pub fn force_untouch(&mut self, registry: &BodyRegistry, a: BodyId, b: BodyId) {
        let key = pair_key(a, b);
        if self.touches.remove(&key).is_some() {
            self.fire_touch(registry, key.0, key.1, false);
        }
    }

    /// Atomically move `body`'s touch from `old` to `new` within one step.
    /// After this call the body touches exactly `new`; both the end and the
    /// start event are flushed in the same frame, so no observer sees the
    /// body touching neither or both.
    pub fn retarget_touch(
        &mut self,
        registry: &BodyRegistry,
        body: BodyId,
        old: BodyId,
        new: BodyId,
    ) {
        let removed = self.touches.remove(&pair_key(body, old)).is_some();
        let key = pair_key(body, new);
        let inserted = !self.touches.contains_key(&key);
        self.touches.entry(key).or_insert_with(|| TouchState {
            contacts: HashSet::new(),
            forced: true,
        });
        if removed {
            self.fire_touch(registry, body, old, false);
        }
        if inserted {
            self.fire_touch(registry, body, new, true);
        }
    }

    pub fn touching(&self, a: BodyId, b: BodyId) -> bool {
        self.touches.contains_key(&pair_key(a, b))
    }

    pub fn touches_of(&self, body: BodyId) -> Vec<BodyId> {
        self.touches
            .keys()
            .filter_map(|(a, b)| {
                if *a == body {
                    Some(*b)
                } else if *b == body {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Tear down every touch involving `body` (body destroyed/teleported).
    pub fn drop_touches_of(&mut self, registry: &BodyRegistry, body: BodyId) {
        let keys: Vec<_> = self
            .touches
            .keys()
            .filter(|(a, b)| *a == body || *b == body)
            .copied()
            .collect();
        for key in keys {
            self.touches.remove(&key);
            self.fire_touch(registry, key.0, key.1, false);
        }
    }

    fn fire_touch(&mut self, registry: &BodyRegistry, a: BodyId, b: BodyId, started: bool) {
        let trigger = bf::has(registry.flags(a), bf::TRIGGER)
            || bf::has(registry.flags(b), bf::TRIGGER);
        self.touch_events.push(TouchEvent {
            a,
            b,
            started,
            trigger,
        });
    }

    // ------------------------------------------------------------------
    // Penetration machine
    // ------------------------------------------------------------------

    /// Report an overlap of `depth` meters (positive) along `normal` for the
    /// pair, observed during this step's contact pass.
    pub fn observe_penetration(&mut self, a: BodyId, b: BodyId, depth: f32, normal: Vec3) {
        let key = pair_key(a, b);
        let state = self
            .penetrations
            .entry(key)
            .or_insert_with(|| PenetrationState {
                phase: PenetrationPhase::Enabled,
                sustained: 0.0,
                clear: 0.0,
                depth: 0.0,
                normal: Vec3::Y,
                observed_this_tick: false,
            });
        state.observed_this_tick = true;
        state.depth = depth;
        if normal.length_squared() > 1e-8 {
            state.normal = normal;
        }
    }

    /// Advance every per-pair penetration machine by `dt`. Call once per
    /// step, after contacts were observed, before the deferred drain.
    pub fn tick_penetrations(&mut self, registry: &BodyRegistry, cfg: &SimulationConfig, dt: f32) {
        let mut finished: Vec<(BodyId, BodyId)> = Vec::new();
        let mut events: Vec<PenetrationEvent> = Vec::new();
        let mut ops: Vec<DeferredOp> = Vec::new();

        for (key, state) in self.penetrations.iter_mut() {
            let (a, b) = *key;
            if state.observed_this_tick {
                state.clear = 0.0;
                state.sustained += dt;
            } else {
                state.clear += dt;
                state.sustained = 0.0;
                if state.clear >= cfg.penetration_clear_secs {
                    // Resolved: either it never escalated, or the disabled
                    // pair has been apart long enough to re-enable.
                    finished.push(*key);
                    continue;
                }
            }

            match state.phase {
                PenetrationPhase::Enabled => {
                    if state.sustained >= cfg.penetration_escalate_secs {
                        let fa = registry.flags(a);
                        let fb = registry.flags(b);
                        state.phase = if (fa | fb) & (bf::COMPOSITE | bf::PLAYER) != 0 {
                            PenetrationPhase::TryNpcSolver
                        } else if bf::has(fa | fb, bf::DEBRIS) {
                            PenetrationPhase::TryEntitySolver
                        } else {
                            PenetrationPhase::TryDisable
                        };
                        state.sustained = 0.0;
                        events.push(PenetrationEvent {
                            a,
                            b,
                            depth: state.depth,
                            phase: state.phase,
                        });
                    }
                }
                PenetrationPhase::TryNpcSolver | PenetrationPhase::TryEntitySolver => {
                    if state.observed_this_tick {
                        // Nudge the pair apart over subsequent frames.
                        let push = state.normal * (state.depth.max(0.01) * 4.0);
                        ops.push(DeferredOp::Nudge { body: a, impulse: push });
                        ops.push(DeferredOp::Nudge {
                            body: b,
                            impulse: -push,
                        });
                    }
                    if state.sustained >= cfg.penetration_solver_secs {
                        state.phase = PenetrationPhase::TryDisable;
                        state.sustained = 0.0;
                        events.push(PenetrationEvent {
                            a,
                            b,
                            depth: state.depth,
                            phase: state.phase,
                        });
                    }
                }
                PenetrationPhase::TryDisable => {
                    // Last resort: force both bodies asleep. Never silently
                    // drop a long-running penetration.
                    ops.push(DeferredOp::Sleep(a));
                    ops.push(DeferredOp::Sleep(b));
                    state.phase = PenetrationPhase::Disabled;
                    events.push(PenetrationEvent {
                        a,
                        b,
                        depth: state.depth,
                        phase: state.phase,
                    });
                    log::warn!(
                        "penetration {}/{} unresolved, bodies forced asleep",
                        a.0,
                        b.0
                    );
                }
                PenetrationPhase::Disabled => {}
            }
        }

        for key in finished {
            self.penetrations.remove(&key);
        }
        self.penetration_events.extend(events);
        self.deferred.extend(ops);
    }

    pub fn penetration_phase(&self, a: BodyId, b: BodyId) -> Option<PenetrationPhase> {
        self.penetrations.get(&pair_key(a, b)).map(|s| s.phase)
    }

    // ------------------------------------------------------------------
    // Friction
    // ------------------------------------------------------------------

    pub fn note_friction(&mut self, a: BodyId, b: BodyId, energy: f32) {
        if energy > 0.05 {
            self.friction_events.push(FrictionEvent { a, b, energy });
        }
    }

    // ------------------------------------------------------------------
    // Deferred queue
    // ------------------------------------------------------------------

    pub fn queue_op(&mut self, op: DeferredOp) {
        self.deferred.push_back(op);
    }

    pub fn queue_damage(&mut self, event: DamageEvent) {
        self.deferred.push_back(DeferredOp::Damage(event));
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Drain the deferred queue in FIFO order. Executing an op may queue
    /// follow-up ops; the loop repeats until the queue is empty or the bound
    /// is hit, which is a logged, non-fatal error condition.
    pub fn drain_deferred(
        &mut self,
        bound: usize,
        mut exec: impl FnMut(DeferredOp, &mut VecDeque<DeferredOp>),
    ) -> Result<usize> {
        debug_assert!(!self.guard.active(), "queue drain inside callback");
        let mut iterations = 0;
        let mut executed = 0;
        while !self.deferred.is_empty() {
            if iterations >= bound {
                let remaining = self.deferred.len();
                self.deferred.clear();
                log::warn!(
                    "deferred drain hit bound {} with {} ops left, dropping",
                    bound,
                    remaining
                );
                return Err(Error::QueueOverflow { bound, remaining });
            }
            iterations += 1;
            let batch: VecDeque<DeferredOp> = std::mem::take(&mut self.deferred);
            let mut requeued = VecDeque::new();
            for op in batch {
                exec(op, &mut requeued);
                executed += 1;
            }
            self.deferred = requeued;
        }
        Ok(executed)
    }

    // ------------------------------------------------------------------
    // Event output
    // ------------------------------------------------------------------

    pub fn pending_touch_events(&self) -> usize {
        self.touch_events.len()
    }

    pub fn take_touch_events(&mut self) -> Vec<TouchEvent> {
        std::mem::take(&mut self.touch_events)
    }

    pub fn take_penetration_events(&mut self) -> Vec<PenetrationEvent> {
        std::mem::take(&mut self.penetration_events)
    }

    pub fn take_friction_events(&mut self) -> Vec<FrictionEvent> {
        std::mem::take(&mut self.friction_events)
    }
}

impl Default for CollisionRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Rapier hook adapter
// ============================================================================

/// Borrowed view handed to rapier for one step. All callbacks run under the
/// router's re-entrancy guard and only *read* policy state.
pub struct RouterHooks<'a> {
    pub registry: &'a BodyRegistry,
    pub exclusions: &'a ExclusionSet,
    pub tick: u64,
    pub guard: &'a CallbackGuard,
}

impl PhysicsHooks for RouterHooks<'_> {
    fn filter_contact_pair(&self, ctx: &PairFilterContext) -> Option<SolverFlags> {
        let _scope = self.guard.enter();
        let a = BodyId::from_user_data(ctx.colliders[ctx.collider1].user_data);
        let b = BodyId::from_user_data(ctx.colliders[ctx.collider2].user_data);
        if should_collide(self.registry, self.exclusions, self.tick, a, b) {
            Some(SolverFlags::COMPUTE_IMPULSES)
        } else {
            None
        }
    }

    fn filter_intersection_pair(&self, ctx: &PairFilterContext) -> bool {
        let _scope = self.guard.enter();
        let a = BodyId::from_user_data(ctx.colliders[ctx.collider1].user_data);
        let b = BodyId::from_user_data(ctx.colliders[ctx.collider2].user_data);
        should_collide(self.registry, self.exclusions, self.tick, a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodyDesc, ShapeDesc};
    use glam::Quat;

    fn registry_with_flags(flags: &[(u32, u32)]) -> BodyRegistry {
        let mut reg = BodyRegistry::new();
        for (id, f) in flags {
            reg.register(
                BodyId(*id),
                BodyDesc::new(ShapeDesc::ball(0.5), *f),
                Vec3::ZERO,
                Quat::IDENTITY,
            );
        }
        reg
    }

    #[test]
    fn test_hooks_view_is_shareable() {
        // The rapier hook trait requires Send + Sync of its implementors.
        fn assert_shareable<T: Send + Sync>() {}
        assert_shareable::<CallbackGuard>();
        assert_shareable::<RouterHooks<'static>>();
    }

    #[test]
    fn test_should_collide_symmetry_over_flag_grid() {
        let interesting = [
            bf::SOLID,
            bf::TRIGGER,
            bf::SOLID | bf::CONSTRAINED_TO_WORLD,
            bf::SOLID | bf::VEHICLE_WHEEL,
            bf::SOLID | bf::WORLD_GEOMETRY,
            bf::SOLID | bf::COMPOSITE,
            bf::SOLID | bf::COMPOSITE | bf::NO_SELF_COLLIDE,
            bf::SOLID | bf::DEBRIS,
            0,
        ];
        let exclusions = ExclusionSet::default();
        for fa in interesting {
            for fb in interesting {
                let reg = registry_with_flags(&[(1, fa), (2, fb)]);
                let ab = should_collide_directed(&reg, &exclusions, 0, BodyId(1), BodyId(2));
                let ba = should_collide_directed(&reg, &exclusions, 0, BodyId(2), BodyId(1));
                assert_eq!(ab, ba, "asymmetry for flags {:#b} / {:#b}", fa, fb);
            }
        }
    }

    #[test]
    fn test_shared_parent_never_collides() {
        let mut reg = registry_with_flags(&[(1, bf::SOLID), (2, bf::SOLID), (3, bf::SOLID)]);
        reg.set_parent(BodyId(2), Some(BodyId(1)));
        reg.set_parent(BodyId(3), Some(BodyId(1)));
        let ex = ExclusionSet::default();
        assert!(!should_collide(&reg, &ex, 0, BodyId(2), BodyId(3)));
        assert!(!should_collide(&reg, &ex, 0, BodyId(1), BodyId(2)));
    }

    #[test]
    fn test_vehicle_wheel_only_hits_world() {
        let reg = registry_with_flags(&[
            (1, bf::SOLID | bf::VEHICLE_WHEEL),
            (2, bf::SOLID | bf::WORLD_GEOMETRY),
            (3, bf::SOLID | bf::DEBRIS),
        ]);
        let ex = ExclusionSet::default();
        assert!(should_collide(&reg, &ex, 0, BodyId(1), BodyId(2)));
        assert!(!should_collide(&reg, &ex, 0, BodyId(1), BodyId(3)));
    }

    #[test]
    fn test_exclusion_suppresses_then_expires() {
        let reg = registry_with_flags(&[(1, bf::SOLID), (2, bf::SOLID)]);
        let mut ex = ExclusionSet::default();
        ex.exclude(BodyId(1), BodyId(2), 10);
        assert!(!should_collide(&reg, &ex, 10, BodyId(1), BodyId(2)));
        assert!(!should_collide(&reg, &ex, 11, BodyId(1), BodyId(2)));
        ex.purge_expired(12);
        assert!(should_collide(&reg, &ex, 12, BodyId(1), BodyId(2)));
    }

    #[test]
    fn test_touch_end_waits_for_recount() {
        let reg = registry_with_flags(&[(1, bf::SOLID | bf::COMPOSITE), (2, bf::SOLID)]);
        let mut router = CollisionRouter::new();
        router.note_contact_started(&reg, BodyId(1), BodyId(2), (10, 20));
        router.note_contact_started(&reg, BodyId(1), BodyId(2), (11, 20));
        let events = router.take_touch_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].started);

        // One collider contact gone, but the recount still sees another.
        router.note_contact_stopped(&reg, BodyId(1), BodyId(2), (10, 20), |_, _| 1);
        assert!(router.take_touch_events().is_empty());
        assert!(router.touching(BodyId(1), BodyId(2)));

        router.note_contact_stopped(&reg, BodyId(1), BodyId(2), (11, 20), |_, _| 0);
        let events = router.take_touch_events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].started);
        assert!(!router.touching(BodyId(1), BodyId(2)));
    }

    #[test]
    fn test_retarget_touch_is_atomic() {
        let reg = registry_with_flags(&[
            (1, bf::SOLID),
            (100, bf::TRIGGER),
            (101, bf::TRIGGER),
        ]);
        let mut router = CollisionRouter::new();
        router.force_touch(&reg, BodyId(1), BodyId(100));
        router.take_touch_events();

        router.retarget_touch(&reg, BodyId(1), BodyId(100), BodyId(101));
        assert!(!router.touching(BodyId(1), BodyId(100)));
        assert!(router.touching(BodyId(1), BodyId(101)));
        let events = router.take_touch_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| !e.started && e.b == BodyId(100) || !e.started && e.a == BodyId(100)));
        assert!(events.iter().any(|e| e.started));
    }

    #[test]
    fn test_penetration_escalates_to_disable_and_sleeps() {
        // Plain solid pair, no composite/debris involvement: 3s of overlap
        // escalates straight to TRY_DISABLE, then both bodies sleep.
        let reg = registry_with_flags(&[(1, bf::SOLID), (2, bf::SOLID)]);
        let cfg = SimulationConfig::default();
        let mut router = CollisionRouter::new();
        let dt = 1.0 / 60.0;
        let mut slept: Vec<BodyId> = Vec::new();
        for tick in 0..(4.0 / dt) as u64 {
            router.begin_tick(tick);
            router.observe_penetration(BodyId(1), BodyId(2), 0.05, Vec3::Y);
            router.tick_penetrations(&reg, &cfg, dt);
            router
                .drain_deferred(cfg.drain_bound, |op, _| {
                    if let DeferredOp::Sleep(id) = op {
                        slept.push(id);
                    }
                })
                .unwrap();
        }
        assert_eq!(
            router.penetration_phase(BodyId(1), BodyId(2)),
            Some(PenetrationPhase::Disabled)
        );
        assert!(slept.contains(&BodyId(1)) && slept.contains(&BodyId(2)));
        let phases: Vec<_> = router
            .take_penetration_events()
            .iter()
            .map(|e| e.phase)
            .collect();
        assert!(phases.contains(&PenetrationPhase::TryDisable));
        assert!(phases.contains(&PenetrationPhase::Disabled));
    }

    #[test]
    fn test_penetration_clears_after_quiet_second() {
        let reg = registry_with_flags(&[(1, bf::SOLID), (2, bf::SOLID)]);
        let cfg = SimulationConfig::default();
        let mut router = CollisionRouter::new();
        let dt = 1.0 / 60.0;
        router.begin_tick(0);
        router.observe_penetration(BodyId(1), BodyId(2), 0.02, Vec3::Y);
        router.tick_penetrations(&reg, &cfg, dt);
        assert!(router.penetration_phase(BodyId(1), BodyId(2)).is_some());
        // No further observations: state clears after a quiet second.
        for tick in 1..=70 {
            router.begin_tick(tick);
            router.tick_penetrations(&reg, &cfg, dt);
        }
        assert!(router.penetration_phase(BodyId(1), BodyId(2)).is_none());
    }

    #[test]
    fn test_drain_bound_terminates_runaway_queue() {
        let mut router = CollisionRouter::new();
        router.queue_op(DeferredOp::Wake(BodyId(1)));
        let result = router.drain_deferred(20, |op, requeue| {
            // Pathological executor: every op queues another one.
            requeue.push_back(op);
        });
        assert!(matches!(result, Err(Error::QueueOverflow { bound: 20, .. })));
        assert_eq!(router.deferred_len(), 0);
    }

    #[test]
    fn test_drain_preserves_fifo_order() {
        let mut router = CollisionRouter::new();
        router.queue_op(DeferredOp::Remove(BodyId(7)));
        router.queue_damage(DamageEvent {
            target: BodyId(7),
            inflictor: None,
            amount: 5.0,
            position: Vec3::ZERO,
        });
        let mut order = Vec::new();
        router
            .drain_deferred(20, |op, _| order.push(op))
            .unwrap();
        assert!(matches!(order[0], DeferredOp::Remove(BodyId(7))));
        assert!(matches!(order[1], DeferredOp::Damage(_)));
    }
}
