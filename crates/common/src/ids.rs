//! # Identifiers
//!
//! Stable UUIDs for entities and network sessions. Both keep the legacy
//! convention that the nil UUID means "no id": a cleared parent, an unowned
//! simulation, an anonymous sender.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// EntityId
// ============================================================================

/// Stable identifier of an entity, unique within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// A fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil id, meaning "no entity".
    pub const fn null() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    /// Big-endian RFC 4122 byte form, as used on the wire.
    pub fn to_rfc4122(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_rfc4122(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ============================================================================
// SessionId
// ============================================================================

/// Identifier of a connected node (client or server session).
///
/// Avatars are addressed by their session id; simulation ownership records
/// the owning node's session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn null() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    pub fn to_rfc4122(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_rfc4122(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ids() {
        assert!(EntityId::null().is_null());
        assert!(EntityId::default().is_null());
        assert!(!EntityId::random().is_null());
        assert!(SessionId::null().is_null());
    }

    #[test]
    fn test_rfc4122_round_trip() {
        let id = EntityId::random();
        assert_eq!(EntityId::from_rfc4122(id.to_rfc4122()), id);
    }
}
