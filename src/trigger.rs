// src/trigger.rs
//! Proximity triggers and ownership arbitration.
//!
//! Every gateway projects a trigger volume in front of its opening and a
//! larger wake-and-pre-touch sweep volume around it. The tracker diffs the
//! per-tick occupancy of those volumes into enter/leave transitions; the
//! ownership table records, exclusively, which environment simulates each
//! body right now.

use std::collections::HashMap;

use glam::Vec3;
use smallvec::SmallVec;

use crate::body::{BodyId, EnvId};
use crate::gateway::GatewayId;

/// Distance difference below which two candidate gateways count as equally
/// close and the tie-break kicks in.
const ARBITRATION_EPSILON: f32 = 1e-6;

/// A body entered or left a gateway's trigger volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerTransition {
    pub body: BodyId,
    pub gateway: GatewayId,
    pub entered: bool,
}

/// Per-body occupancy of gateway trigger volumes, diffed tick over tick.
#[derive(Debug, Default)]
pub struct TriggerTracker {
    inside: HashMap<BodyId, SmallVec<[GatewayId; 2]>>,
}

impl TriggerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the occupancy snapshot with this tick's and return every
    /// transition. `now` maps each body to the gateways whose trigger volume
    /// currently contains it; bodies absent from the map are inside none.
    pub fn update(
        &mut self,
        now: HashMap<BodyId, SmallVec<[GatewayId; 2]>>,
    ) -> Vec<TriggerTransition> {
        let mut transitions = Vec::new();

        for (body, gateways) in &now {
            let before = self.inside.get(body);
            for g in gateways {
                let was_inside = before.map(|b| b.contains(g)).unwrap_or(false);
                if !was_inside {
                    transitions.push(TriggerTransition {
                        body: *body,
                        gateway: *g,
                        entered: true,
                    });
                }
            }
        }
        for (body, gateways) in &self.inside {
            let after = now.get(body);
            for g in gateways {
                let still_inside = after.map(|a| a.contains(g)).unwrap_or(false);
                if !still_inside {
                    transitions.push(TriggerTransition {
                        body: *body,
                        gateway: *g,
                        entered: false,
                    });
                }
            }
        }

        self.inside = now;
        transitions
    }

    pub fn gateways_containing(&self, body: BodyId) -> &[GatewayId] {
        self.inside
            .get(&body)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_inside(&self, body: BodyId, gateway: GatewayId) -> bool {
        self.gateways_containing(body).contains(&gateway)
    }

    /// Forget a body entirely (destroyed or teleported away). No leave
    /// transitions are synthesized; the caller already handled them.
    pub fn forget(&mut self, body: BodyId) {
        self.inside.remove(&body);
    }

    /// Move a body's occupancy from one gateway to another in one step, the
    /// trigger-side half of the atomic teleport hand-off.
    pub fn retarget(&mut self, body: BodyId, from: GatewayId, to: GatewayId) {
        let entry = self.inside.entry(body).or_default();
        entry.retain(|g| *g != from);
        if !entry.contains(&to) {
            entry.push(to);
        }
    }
}

/// Pick the gateway that should own a body standing at `pos` when several
/// trigger volumes overlap: nearest opening origin wins, equal distances go
/// to the lower gateway id so the answer is deterministic.
pub fn arbitrate(
    pos: Vec3,
    candidates: impl IntoIterator<Item = (GatewayId, Vec3)>,
) -> Option<GatewayId> {
    let mut best: Option<(GatewayId, f32)> = None;
    for (id, origin) in candidates {
        let dist = pos.distance(origin);
        best = match best {
            None => Some((id, dist)),
            Some((best_id, best_dist)) => {
                if dist + ARBITRATION_EPSILON < best_dist
                    || ((dist - best_dist).abs() <= ARBITRATION_EPSILON && id < best_id)
                {
                    Some((id, dist))
                } else {
                    Some((best_id, best_dist))
                }
            }
        };
    }
    best.map(|(id, _)| id)
}

/// An ownership hand-off that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipChange {
    pub body: BodyId,
    pub from: EnvId,
    pub to: EnvId,
}

/// Which environment simulates each body. One owner per body at all times;
/// bodies with no entry belong to the main environment.
#[derive(Debug, Default)]
pub struct OwnershipTable {
    owners: HashMap<BodyId, EnvId>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn owner_of(&self, body: BodyId) -> EnvId {
        self.owners.get(&body).copied().unwrap_or(EnvId::Main)
    }

    /// Hand the body to `env`. Returns the change, or `None` when `env`
    /// already owns it.
    pub fn set_owner(&mut self, body: BodyId, env: EnvId) -> Option<OwnershipChange> {
        let from = self.owner_of(body);
        if from == env {
            return None;
        }
        if env == EnvId::Main {
            self.owners.remove(&body);
        } else {
            self.owners.insert(body, env);
        }
        log::debug!("body {} ownership: {} -> {}", body.0, from, env);
        Some(OwnershipChange {
            body,
            from,
            to: env,
        })
    }

    /// Return the body to the main environment.
    pub fn release(&mut self, body: BodyId) -> Option<OwnershipChange> {
        self.set_owner(body, EnvId::Main)
    }

    pub fn owned_by(&self, env: EnvId) -> Vec<BodyId> {
        self.owners
            .iter()
            .filter(|(_, e)| **e == env)
            .map(|(b, _)| *b)
            .collect()
    }

    pub fn claimed_count(&self) -> usize {
        self.owners.len()
    }
}
