//! # Simulation Collaborator
//!
//! The physics side of the bargain: the tree tells a simulation which
//! entities appeared, changed or are about to go away; the simulation steps
//! them and reports the ones it declares dead (expired lifetime), which the
//! tree then force-deletes inside its own `update()`.
//!
//! [`SimpleEntitySimulation`] is the non-physical reference implementation a
//! server runs: no integration, just lifetime expiry, stale-ownership expiry
//! and stopping ownerless runaways.

use crate::entity::{dirty, Entity};
use crate::registry::EntityStore;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use weald_common::{EntityId, USECS_PER_SECOND};

// ============================================================================
// Trait
// ============================================================================

/// What the tree requires of a physics collaborator.
pub trait EntitySimulation: Send {
    /// A new entity entered the tree.
    fn add_entity(&mut self, entity: &Entity);

    /// An existing entity took an edit the simulation may care about.
    fn change_entity(&mut self, entity: &Entity);

    /// Forget everything.
    fn clear_entities(&mut self);

    /// The tree is about to delete this entity; drop simulation state.
    fn prepare_entity_for_delete(&mut self, entity: &mut Entity);

    /// Step simulation-side bookkeeping. Runs under the tree write lock.
    fn update_entities(&mut self, now: u64, store: &mut EntityStore);

    /// Entities declared dead since the last call; the tree force-deletes
    /// them.
    fn take_dead_entities(&mut self) -> Vec<EntityId>;
}

// ============================================================================
// SimpleEntitySimulation
// ============================================================================

/// Moving-but-unowned entities get stopped after this long without an owner.
const MAX_OWNERLESS_PERIOD: u64 = 2 * USECS_PER_SECOND;

/// Server-side reference simulation: no integration, only lifecycle and
/// ownership housekeeping.
#[derive(Debug, Default)]
pub struct SimpleEntitySimulation {
    /// Entities with a finite lifetime, with a cached soonest expiry so the
    /// common update is O(1).
    mortal: HashSet<EntityId>,
    next_expiry: u64,

    /// Entities currently carrying a simulation owner.
    owned: HashSet<EntityId>,

    /// Moving dynamic entities with no owner, and when they became so.
    ownerless_since: HashMap<EntityId, u64>,

    dead: Vec<EntityId>,
}

impl SimpleEntitySimulation {
    pub fn new() -> Self {
        Self {
            next_expiry: u64::MAX,
            ..Self::default()
        }
    }

    fn classify(&mut self, entity: &Entity, now: u64) {
        let id = entity.id;
        if entity.is_immortal() {
            self.mortal.remove(&id);
        } else {
            self.mortal.insert(id);
            self.next_expiry = self.next_expiry.min(entity.expiry_usec());
        }

        if entity.simulation_owner.is_null() {
            self.owned.remove(&id);
            if entity.dynamic && entity.is_moving() {
                self.ownerless_since.entry(id).or_insert(now);
            } else {
                self.ownerless_since.remove(&id);
            }
        } else {
            self.owned.insert(id);
            self.ownerless_since.remove(&id);
        }
    }

    fn forget(&mut self, id: EntityId) {
        self.mortal.remove(&id);
        self.owned.remove(&id);
        self.ownerless_since.remove(&id);
    }

    fn expire_mortals(&mut self, now: u64, store: &mut EntityStore) {
        if now < self.next_expiry {
            return;
        }
        let mut next = u64::MAX;
        let mut expired = Vec::new();
        for id in &self.mortal {
            match store.get_raw(*id) {
                Some(entity) if entity.is_expired(now) => expired.push(*id),
                Some(entity) => next = next.min(entity.expiry_usec()),
                None => {}
            }
        }
        for id in expired {
            debug!("Entity {} lifetime expired; marking dead", id);
            self.mortal.remove(&id);
            self.dead.push(id);
        }
        self.next_expiry = next;
    }

    fn expire_stale_ownerships(&mut self, now: u64, store: &mut EntityStore) {
        let stale: Vec<EntityId> = self
            .owned
            .iter()
            .filter(|id| {
                store
                    .get_raw(**id)
                    .map(|e| e.simulation_owner.has_expired(now))
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        for id in stale {
            if let Some(entity) = store.get_raw_mut(id) {
                debug!("Clearing stale simulation ownership of {}", id);
                entity.clear_simulation_owner();
                let snapshot = entity.clone();
                self.classify(&snapshot, now);
            }
        }
    }

    fn stop_ownerless(&mut self, now: u64, store: &mut EntityStore) {
        let overdue: Vec<EntityId> = self
            .ownerless_since
            .iter()
            .filter(|(_, since)| now.saturating_sub(**since) >= MAX_OWNERLESS_PERIOD)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            self.ownerless_since.remove(&id);
            if let Some(entity) = store.get_raw_mut(id) {
                if entity.simulation_owner.is_null() && entity.is_moving() {
                    debug!("Stopping ownerless entity {}", id);
                    entity.velocity = glam::Vec3::ZERO;
                    entity.angular_velocity = glam::Vec3::ZERO;
                    entity.acceleration = glam::Vec3::ZERO;
                    entity.dirty_flags |= dirty::VELOCITIES;
                }
            }
        }
    }
}

impl EntitySimulation for SimpleEntitySimulation {
    fn add_entity(&mut self, entity: &Entity) {
        self.classify(entity, entity.created);
    }

    fn change_entity(&mut self, entity: &Entity) {
        self.classify(entity, entity.last_edited);
    }

    fn clear_entities(&mut self) {
        self.mortal.clear();
        self.owned.clear();
        self.ownerless_since.clear();
        self.dead.clear();
        self.next_expiry = u64::MAX;
    }

    fn prepare_entity_for_delete(&mut self, entity: &mut Entity) {
        self.forget(entity.id);
        entity.clear_simulation_owner();
    }

    fn update_entities(&mut self, now: u64, store: &mut EntityStore) {
        self.expire_mortals(now, store);
        self.expire_stale_ownerships(now, store);
        self.stop_ownerless(now, store);
    }

    fn take_dead_entities(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.dead)
    }
}
