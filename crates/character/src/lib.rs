//! # Weald Character
//!
//! Avatar movement for Weald worlds: a kinematic-feeling capsule controller
//! layered over an impulse physics engine.
//!
//! The pieces:
//!
//! - [`CharacterMotor`]: a desired velocity with horizontal and vertical
//!   blend timescales; several can compete and are mixed by weight.
//! - Ground support: contact manifolds are scanned every substep for floor
//!   contacts, climbable steps and wedged (stuck) configurations.
//! - [`FollowHelper`]: pulls the body toward an externally driven transform
//!   over a time window (HMD re-centering, seat transitions).
//! - [`CharacterController`]: ties the above to the Ground / Takeoff /
//!   InAir / Hover state machine and the per-frame protocol
//!   (`pre_simulation`, `update` per substep, `post_simulation`).
//!
//! The physics engine stays behind the [`CollisionWorld`] trait so the
//! controller can be driven directly in tests and replays.

pub mod config;
pub mod controller;
pub mod follow;
pub mod motor;
pub mod support;

pub use config::CharacterConfig;
pub use controller::{
    pending, CharacterController, CharacterState, CollisionWorld, RigidBodyState,
};
pub use follow::FollowHelper;
pub use motor::{CharacterMotor, MAX_CHARACTER_MOTOR_TIMESCALE, MIN_CHARACTER_MOTOR_TIMESCALE};
pub use support::{ContactManifold, ContactPoint, StepCandidate};

/// Common imports for crates driving a character.
pub mod prelude {
    pub use crate::config::CharacterConfig;
    pub use crate::controller::{
        pending, CharacterController, CharacterState, CollisionWorld, RigidBodyState,
    };
    pub use crate::motor::CharacterMotor;
    pub use crate::support::{ContactManifold, ContactPoint};
}
