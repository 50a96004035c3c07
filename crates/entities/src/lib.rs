//! # Weald Entities
//!
//! The octree-indexed entity tree at the heart of a Weald world: a
//! concurrently mutable spatial index over every networked object, plus the
//! server-side protocols that keep many simulating peers honest.
//!
//! ## Features
//!
//! - **Octree spatial index** with oversized, movement-stable query cubes
//! - **Ownership arbitration** — priority + expiry bidding over who
//!   simulates an entity
//! - **Certificate challenges** — nonce/signature proof-of-purchase for
//!   marketplace entities
//! - **Deferred parent fixup** for out-of-order network delivery
//! - **Sorted ray/parabola picking** and region queries
//! - **Edit-packet codec** with per-sender rights filtering
//! - **Persisted documents** with in-place schema migrations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EntityTree                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Core (one write lock)                                      │
//! │  ├── Octree: arena elements, split on demand, pruned up     │
//! │  └── EntityStore: id → entity, parent/child index           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Protocols (independent locks)                              │
//! │  ├── Ownership arbitration (priority + expiry window)       │
//! │  ├── ChallengeTracker (certificate → holder, nonces)        │
//! │  ├── Parent-fixup queue and avatar child tables             │
//! │  └── Recently-deleted records for catch-up peers            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Edges                                                      │
//! │  ├── wire: packet codec + sender-rights pipeline            │
//! │  ├── persist: JSON document, migrations                     │
//! │  └── simulation: pluggable per-tick entity housekeeping     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod challenge;
pub mod config;
pub mod element;
pub mod entity;
pub mod error;
pub mod operators;
pub mod persist;
pub mod properties;
pub mod queries;
pub mod registry;
pub mod simulation;
pub mod tree;
pub mod wire;

// Re-exports
pub use challenge::{
    ChallengeOutcome, ChallengeTracker, ChallengeTransport, PopVerdict, PurchaseValidator,
    SignatureVerifier,
};
pub use config::{ChallengeConfig, OwnershipConfig, TreeConfig};
pub use entity::{dirty, ComponentMode, Entity, EntityKind, ShapeType};
pub use error::{EntityError, EntityResult};
pub use persist::{TreeDocument, ViewpointPath, CURRENT_DATA_VERSION};
pub use properties::{CloneSpec, EntityHostType, EntityProperties, GrabProperties};
pub use queries::{EntityScan, ParabolaHit, PickFilter, RayHit};
pub use simulation::{EntitySimulation, SimpleEntitySimulation};
pub use tree::{EditStats, EntityTree, LockMode, QueryOutcome};
pub use wire::{EditMessage, PacketType, Sender};

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::config::TreeConfig;
    pub use crate::entity::{Entity, EntityKind};
    pub use crate::error::{EntityError, EntityResult};
    pub use crate::properties::{EntityHostType, EntityProperties};
    pub use crate::queries::{PickFilter, RayHit};
    pub use crate::tree::{EntityTree, LockMode};
    pub use weald_common::prelude::*;
}
