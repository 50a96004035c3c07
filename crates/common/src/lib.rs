//! # Weald Common
//!
//! Shared foundation types for the Weald runtime: stable entity/session
//! identifiers, the microsecond wall clock every timestamp in the system is
//! expressed in, the axis-aligned cube/box math the octree is built on, and
//! the simulation-ownership record used for distributed physics arbitration.
//!
//! Everything here is plain data — no locks, no I/O — so it can be shared
//! freely between the entity tree, the wire codecs and the character
//! controller without dragging their dependencies along.

pub mod clock;
pub mod ids;
pub mod math;
pub mod owner;

// Re-exports
pub use clock::{now_usec, secs_to_usec, usec_to_secs, USECS_PER_MSEC, USECS_PER_SECOND};
pub use ids::{EntityId, SessionId};
pub use math::{AACube, AABox, BoxFace, Frustum, Parabola, Plane, Ray};
pub use owner::{
    SimulationOwner, GRAB_SIMULATION_PRIORITY, POKE_SIMULATION_PRIORITY,
    RECRUIT_SIMULATION_PRIORITY, TOP_SIMULATION_PRIORITY, VOLUNTEER_SIMULATION_PRIORITY,
    ZERO_SIMULATION_PRIORITY,
};

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use super::clock::{now_usec, USECS_PER_MSEC, USECS_PER_SECOND};
    pub use super::ids::{EntityId, SessionId};
    pub use super::math::{AACube, AABox, BoxFace, Frustum, Parabola, Plane, Ray};
    pub use super::owner::SimulationOwner;
}
