//! # Tree Configuration
//!
//! Plain-data knobs for the entity tree and its protocols. Construct once at
//! startup and hand to [`EntityTree::new`](crate::tree::EntityTree::new).

use serde::{Deserialize, Serialize};
use weald_common::USECS_PER_SECOND;

// ============================================================================
// Main Config
// ============================================================================

/// Top-level configuration for an entity tree instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Whether this tree is the authoritative server copy. Servers run
    /// ownership arbitration, certificate checks and deletion broadcasting;
    /// clients track local deletions instead.
    pub is_server: bool,

    /// Edge length of the root element's cube, in meters. The whole indexed
    /// world must fit inside it.
    pub domain_scale: f32,

    /// Ownership bidding window (see [`OwnershipConfig`]).
    pub ownership: OwnershipConfig,

    /// Certificate challenge protocol (see [`ChallengeConfig`]).
    pub challenge: ChallengeConfig,

    /// Script URLs must start with one of these prefixes to survive edit
    /// filtering. Empty means "allow all".
    pub script_whitelist: Vec<String>,

    /// Lifetime ceiling (seconds) applied to entities created by senders
    /// without persistent-rez rights.
    pub max_tmp_entity_lifetime_secs: f32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            is_server: false,
            domain_scale: 32_768.0,
            ownership: OwnershipConfig::default(),
            challenge: ChallengeConfig::default(),
            script_whitelist: Vec::new(),
            max_tmp_entity_lifetime_secs: 3_600.0,
        }
    }
}

impl TreeConfig {
    /// Server-side defaults: arbitration and certificates on.
    pub fn server() -> Self {
        Self {
            is_server: true,
            ..Self::default()
        }
    }

    pub fn with_domain_scale(mut self, scale: f32) -> Self {
        self.domain_scale = scale;
        self
    }

    pub fn with_script_whitelist(mut self, prefixes: Vec<String>) -> Self {
        self.script_whitelist = prefixes;
        self
    }
}

// ============================================================================
// Ownership
// ============================================================================

/// Simulation-ownership bidding parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OwnershipConfig {
    /// How long an accepted claim stays uncontestable without a refresh
    /// (microseconds).
    pub grace_usec: u64,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            grace_usec: 2 * USECS_PER_SECOND,
        }
    }
}

// ============================================================================
// Challenge
// ============================================================================

/// Certificate ownership-challenge parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// How long the owning node has to answer a nonce challenge before the
    /// entity is force-deleted (microseconds).
    pub timeout_usec: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            timeout_usec: 5 * USECS_PER_SECOND,
        }
    }
}
