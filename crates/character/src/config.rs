//! # Character Configuration
//!
//! Tuning knobs for the avatar character controller. The defaults reproduce
//! the stock avatar feel; hosts override them per deployment, not per tick.
//! Quantities that scale with avatar size (jump height, hover floor, fall
//! scan) are stored unscaled here and multiplied by the controller's scale
//! factor at evaluation time.

use serde::{Deserialize, Serialize};
use weald_common::USECS_PER_MSEC;

/// Tuning for one character controller instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CharacterConfig {
    /// Reference gravity along the negative up axis (m/s^2, negative).
    /// Jump-speed math always uses this value, so zone gravity overrides
    /// applied at runtime do not change jump feel.
    pub gravity: f32,

    /// Jump apex height for an unscaled avatar (meters).
    pub jump_height: f32,

    /// Shrinking the avatar never shrinks the jump below this (meters).
    pub min_jump_height: f32,

    /// How far below the capsule to scan for a floor before declaring free
    /// fall (meters).
    pub fall_height: f32,

    /// Hover cannot be sustained closer to the floor than this (meters).
    pub min_hover_height: f32,

    /// Horizontal speed separating walking from flying (m/s).
    pub max_walking_speed: f32,

    /// Crouch period between the jump press and actually leaving the ground
    /// (microseconds).
    pub takeoff_duration_usec: u64,

    /// Holding the jump input this long while airborne promotes to hover
    /// (microseconds; scaled down with avatars smaller than 1.0).
    pub jump_hold_to_hover_usec: u64,

    /// A floor ray hit stays credible this long after the last actual hit,
    /// so grazing a ledge edge does not flap the state machine
    /// (microseconds).
    pub ray_hit_memory_usec: u64,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            gravity: -9.8,
            jump_height: 0.6,
            min_jump_height: 0.25,
            fall_height: 20.0,
            min_hover_height: 2.5,
            max_walking_speed: 2.65,
            takeoff_duration_usec: 250 * USECS_PER_MSEC,
            jump_hold_to_hover_usec: 1_100 * USECS_PER_MSEC,
            ray_hit_memory_usec: 500 * USECS_PER_MSEC,
        }
    }
}

impl CharacterConfig {
    pub fn with_gravity(mut self, gravity: f32) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_jump_height(mut self, height: f32) -> Self {
        self.jump_height = height;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CharacterConfig::default();
        assert!(config.gravity < 0.0);
        assert_eq!(config.takeoff_duration_usec, 250_000);
        assert_eq!(config.jump_hold_to_hover_usec, 1_100_000);
        assert_eq!(config.ray_hit_memory_usec, 500_000);

        let tuned = CharacterConfig::default().with_gravity(-3.7).with_jump_height(1.2);
        assert_eq!(tuned.gravity, -3.7);
        assert_eq!(tuned.jump_height, 1.2);
    }
}
