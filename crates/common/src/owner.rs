//! # Simulation Ownership
//!
//! The record deciding which node is authoritative for an entity's physics.
//! Nodes bid with a priority byte; the tree arbitrates (see the entities
//! crate) and stamps an expiry that the owner must keep refreshing with
//! further edits, or the ownership becomes contestable.
//!
//! The numeric tiers are implementation constants; only their ordering is
//! contractual: `ZERO < VOLUNTEER < RECRUIT < POKE < GRAB <= TOP`.

use crate::ids::SessionId;
use serde::{Deserialize, Serialize};

/// No claim at all; also the priority of a cleared owner.
pub const ZERO_SIMULATION_PRIORITY: u8 = 0x00;
/// Weakest real bid: "I'll take it if no one else wants it". Accepted
/// volunteer claims are promoted to recruit to stop simultaneous volunteers
/// from trading ownership back and forth.
pub const VOLUNTEER_SIMULATION_PRIORITY: u8 = 0x01;
/// Priority granted to a promoted volunteer.
pub const RECRUIT_SIMULATION_PRIORITY: u8 = VOLUNTEER_SIMULATION_PRIORITY + 1;
/// A script poked the entity (set velocity etc.).
pub const POKE_SIMULATION_PRIORITY: u8 = 0x7f;
/// A user is actively grabbing the entity.
pub const GRAB_SIMULATION_PRIORITY: u8 = 0x80;
/// Cannot be outbid.
pub const TOP_SIMULATION_PRIORITY: u8 = u8::MAX;

/// `(owner, priority, expiry)` — who drives an entity's physics right now.
///
/// A null owner id means "unowned". The expiry is epoch-usec; refreshed by
/// each accepted update from the owner, and compared against `now` during
/// arbitration of competing claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationOwner {
    pub id: SessionId,
    pub priority: u8,
    /// Epoch usec after which the ownership is stale. Not serialized over
    /// the wire by senders; the authoritative tree stamps it locally.
    #[serde(default)]
    pub expiry: u64,
}

impl Default for SimulationOwner {
    fn default() -> Self {
        Self {
            id: SessionId::null(),
            priority: ZERO_SIMULATION_PRIORITY,
            expiry: 0,
        }
    }
}

impl SimulationOwner {
    pub fn new(id: SessionId, priority: u8) -> Self {
        Self {
            id,
            priority,
            expiry: 0,
        }
    }

    /// An explicit "nobody owns this" record.
    pub fn unowned() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }

    pub fn matches_id(&self, id: SessionId) -> bool {
        !self.id.is_null() && self.id == id
    }

    pub fn has_expired(&self, now: u64) -> bool {
        now >= self.expiry
    }

    /// Stamp a fresh expiry, `grace_usec` from now.
    pub fn refresh(&mut self, now: u64, grace_usec: u64) {
        self.expiry = now + grace_usec;
    }

    /// Volunteer bids never stay volunteer: promotion to recruit happens at
    /// the moment a claim is accepted.
    pub fn promote_volunteer(&mut self) {
        if self.priority == VOLUNTEER_SIMULATION_PRIORITY {
            self.priority = RECRUIT_SIMULATION_PRIORITY;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(ZERO_SIMULATION_PRIORITY < VOLUNTEER_SIMULATION_PRIORITY);
        assert!(VOLUNTEER_SIMULATION_PRIORITY < RECRUIT_SIMULATION_PRIORITY);
        assert!(RECRUIT_SIMULATION_PRIORITY < POKE_SIMULATION_PRIORITY);
        assert!(POKE_SIMULATION_PRIORITY < GRAB_SIMULATION_PRIORITY);
        assert!(GRAB_SIMULATION_PRIORITY <= TOP_SIMULATION_PRIORITY);
    }

    #[test]
    fn test_volunteer_promotion() {
        let mut owner = SimulationOwner::new(SessionId::random(), VOLUNTEER_SIMULATION_PRIORITY);
        owner.promote_volunteer();
        assert_eq!(owner.priority, RECRUIT_SIMULATION_PRIORITY);

        // non-volunteer priorities are untouched
        let mut grabber = SimulationOwner::new(SessionId::random(), GRAB_SIMULATION_PRIORITY);
        grabber.promote_volunteer();
        assert_eq!(grabber.priority, GRAB_SIMULATION_PRIORITY);
    }

    #[test]
    fn test_expiry_refresh() {
        let mut owner = SimulationOwner::new(SessionId::random(), RECRUIT_SIMULATION_PRIORITY);
        assert!(owner.has_expired(1));
        owner.refresh(1_000, 2_000_000);
        assert!(!owner.has_expired(2_000_999));
        assert!(owner.has_expired(2_001_000));
    }

    #[test]
    fn test_unowned_matches_nothing() {
        let unowned = SimulationOwner::unowned();
        assert!(unowned.is_null());
        assert!(!unowned.matches_id(SessionId::null()));
        assert!(!unowned.matches_id(SessionId::random()));
    }
}
