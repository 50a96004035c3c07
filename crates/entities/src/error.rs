//! # Entity Errors
//!
//! Error taxonomy for the entity tree. The public tree API stays soft-fail
//! (boolean / `Option` returns, logging) for per-entity operations; these
//! typed errors surface where a caller can meaningfully react — codecs,
//! persistence, the challenge protocol.

use thiserror::Error;
use weald_common::EntityId;

/// Entity tree error types.
#[derive(Error, Debug)]
pub enum EntityError {
    // ========================================================================
    // Protocol Errors
    // ========================================================================

    #[error("Truncated packet: needed {needed} bytes, had {remaining}")]
    TruncatedPacket { needed: usize, remaining: usize },

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Packet decode failed: {0}")]
    DecodeFailed(String),

    // ========================================================================
    // Consistency Errors
    // ========================================================================

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Entity {0} already exists in the tree")]
    EntityExists(EntityId),

    #[error("Entity {0} has no containing element")]
    NoContainingElement(EntityId),

    // ========================================================================
    // Authorization Errors
    // ========================================================================

    #[error("Entity {0} is locked")]
    EntityLocked(EntityId),

    #[error("Ownership claim rejected for entity {0}")]
    OwnershipRejected(EntityId),

    #[error("Sender may not create entities of this host type")]
    HostTypeRefused,

    // ========================================================================
    // Integrity Errors
    // ========================================================================

    #[error("Certificate verification failed for \"{0}\"")]
    CertificateVerifyFailed(String),

    #[error("Ownership challenge timed out for \"{0}\"")]
    ChallengeTimeout(String),

    #[error("Proof-of-purchase endpoint error: {0}")]
    PurchaseEndpointError(String),

    // ========================================================================
    // Persistence Errors
    // ========================================================================

    #[error("Unsupported document version {0}")]
    UnsupportedVersion(u32),

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EntityError {
    pub fn decode(msg: impl Into<String>) -> Self {
        EntityError::DecodeFailed(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        EntityError::MalformedDocument(msg.into())
    }

    /// Errors the edit pipeline answers by dropping the packet, as opposed
    /// to deleting an entity or refusing a single field.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            EntityError::TruncatedPacket { .. }
                | EntityError::UnknownPacketType(_)
                | EntityError::DecodeFailed(_)
        )
    }
}

impl From<bincode::Error> for EntityError {
    fn from(err: bincode::Error) -> Self {
        EntityError::DecodeFailed(err.to_string())
    }
}

/// Result type for entity tree operations.
pub type EntityResult<T> = Result<T, EntityError>;
