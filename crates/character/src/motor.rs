//! # Character Motors
//!
//! A motor is a velocity target carrying its own rotation frame and a pair
//! of blend timescales. Each physics substep every motor pulls the current
//! velocity toward its target by `tau = dt / timescale`, and the controller
//! averages the per-motor results weighted by tau. Walking wants a snappy
//! horizontal response while gravity owns the vertical, so the two axes
//! blend at separate rates; hovering blends the whole vector at one rate.

use glam::{Quat, Vec3};

/// Motors with timescales at or beyond this are effectively off.
pub const MAX_CHARACTER_MOTOR_TIMESCALE: f32 = 60.0;
/// Fastest permitted response; shorter requests are clamped up to this.
pub const MIN_CHARACTER_MOTOR_TIMESCALE: f32 = 0.05;

/// A velocity target in its own rotation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacterMotor {
    /// Target velocity, motor-frame.
    pub velocity: Vec3,
    /// Rotation from motor-frame to world-frame.
    pub rotation: Quat,
    /// Blend timescale for the horizontal components (seconds).
    pub horiz_timescale: f32,
    /// Blend timescale for the vertical component (seconds).
    pub vert_timescale: f32,
}

impl CharacterMotor {
    /// `vert_timescale: None` reuses the horizontal timescale, which makes
    /// the motor blend the whole vector at a single rate.
    pub fn new(
        velocity: Vec3,
        rotation: Quat,
        horiz_timescale: f32,
        vert_timescale: Option<f32>,
    ) -> Self {
        let horiz = horiz_timescale.max(MIN_CHARACTER_MOTOR_TIMESCALE);
        let vert = match vert_timescale {
            Some(v) => v.max(MIN_CHARACTER_MOTOR_TIMESCALE),
            None => horiz,
        };
        Self {
            velocity,
            rotation,
            horiz_timescale: horiz,
            vert_timescale: vert,
        }
    }

    /// Target velocity rotated into the world frame.
    pub fn world_velocity(&self) -> Vec3 {
        self.rotation * self.velocity
    }

    /// True when both timescales are too long to move anything.
    pub fn is_inert(&self) -> bool {
        self.horiz_timescale >= MAX_CHARACTER_MOTOR_TIMESCALE
            && self.vert_timescale >= MAX_CHARACTER_MOTOR_TIMESCALE
    }

    /// Pull `world_velocity` toward this motor's target over `dt`.
    ///
    /// Returns the adjusted world-frame velocity and the blend weight, or
    /// `None` when the motor is inert. `whole_vector` selects single-rate
    /// blending (hover, collisionless); otherwise the horizontal and
    /// vertical components, split against `up`, blend at their own rates
    /// and the weight is the larger tau.
    pub(crate) fn apply(
        &self,
        dt: f32,
        world_velocity: Vec3,
        up: Vec3,
        whole_vector: bool,
    ) -> Option<(Vec3, f32)> {
        if self.is_inert() {
            return None;
        }

        let into_motor = self.rotation.inverse();
        let velocity = into_motor * world_velocity;

        if whole_vector || self.horiz_timescale == self.vert_timescale {
            let tau = (dt / self.horiz_timescale).min(1.0);
            let blended = velocity + tau * (self.velocity - velocity);
            Some((self.rotation * blended, tau))
        } else {
            let motor_up = into_motor * up;
            let vert = velocity.dot(motor_up) * motor_up;
            let horiz = velocity - vert;
            let target_vert = self.velocity.dot(motor_up) * motor_up;
            let target_horiz = self.velocity - target_vert;

            let mut max_tau = 0.0_f32;
            let mut new_horiz = horiz;
            if self.horiz_timescale < MAX_CHARACTER_MOTOR_TIMESCALE {
                let tau = (dt / self.horiz_timescale).min(1.0);
                max_tau = tau;
                new_horiz += (target_horiz - horiz) * tau;
            }
            let mut new_vert = vert;
            if self.vert_timescale < MAX_CHARACTER_MOTOR_TIMESCALE {
                let tau = (dt / self.vert_timescale).min(1.0);
                max_tau = max_tau.max(tau);
                new_vert += (target_vert - vert) * tau;
            }
            Some((self.rotation * (new_horiz + new_vert), max_tau))
        }
    }
}
