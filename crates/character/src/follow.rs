//! # Follow Helper
//!
//! When the avatar's view drags its body around (HMD re-centering, seat
//! transitions), the controller pulls the rigid body toward a desired
//! transform over a short time window instead of teleporting it. The helper
//! accumulates how much displacement the follow contributed each substep so
//! the avatar layer can subtract that motion back out of its own sensors.

use glam::{Quat, Vec3};

/// Remaining windows shorter than this stop pulling.
const MIN_TIME_REMAINING: f32 = 0.005;

/// Rotations closer than about half a degree count as already there.
const MIN_DOT_ADJACENT: f32 = 0.99999;

#[derive(Debug, Clone)]
pub struct FollowHelper {
    desired_position: Vec3,
    desired_rotation: Quat,
    time_remaining: f32,
    linear_displacement: Vec3,
    angular_displacement: Quat,
    time: f32,
}

impl Default for FollowHelper {
    fn default() -> Self {
        Self {
            desired_position: Vec3::ZERO,
            desired_rotation: Quat::IDENTITY,
            time_remaining: 0.0,
            linear_displacement: Vec3::ZERO,
            angular_displacement: Quat::IDENTITY,
            time: 0.0,
        }
    }
}

impl FollowHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aim the follow at a body-frame transform, to be reached over the next
    /// `time_remaining` seconds. Called by the avatar layer every frame with
    /// a shrinking window.
    pub fn set_target(&mut self, position: Vec3, rotation: Quat, time_remaining: f32) {
        self.desired_position = position;
        self.desired_rotation = rotation;
        self.time_remaining = time_remaining;
    }

    /// Forget the displacement accumulated so far; the window keeps running.
    pub fn reset_accumulators(&mut self) {
        self.linear_displacement = Vec3::ZERO;
        self.angular_displacement = Quat::IDENTITY;
        self.time = 0.0;
    }

    /// Advance the follow by one substep. Returns the body transform to slam
    /// when the window is still open, `None` once it has run out. The
    /// per-substep position step is clamped to `max_displacement` to prevent
    /// tunneling.
    pub fn advance(
        &mut self,
        dt: f32,
        body_position: Vec3,
        body_rotation: Quat,
        shape_local_offset: Vec3,
        max_displacement: f32,
    ) -> Option<(Vec3, Quat)> {
        self.time += dt;
        self.time_remaining -= dt;
        if self.time_remaining < MIN_TIME_REMAINING {
            return None;
        }

        let delta = self.desired_position - body_position;
        let step = (delta * (dt / self.time_remaining)).clamp_length_max(max_displacement);
        self.linear_displacement += step;
        let end_position = body_position + step;

        let mut end_rotation = body_rotation;
        if self.desired_rotation.dot(body_rotation).abs() < MIN_DOT_ADJACENT {
            let fraction = (dt / self.time_remaining).min(1.0);
            end_rotation = body_rotation.slerp(self.desired_rotation, fraction).normalize();
            let delta_rotation = (end_rotation * body_rotation.inverse()).normalize();
            self.angular_displacement = (delta_rotation * self.angular_displacement).normalize();

            // swinging the body about its center moves the avatar origin,
            // which sits at -offset from it; count that as linear motion too
            self.linear_displacement +=
                end_rotation * -shape_local_offset - body_rotation * -shape_local_offset;
        }
        Some((end_position, end_rotation))
    }

    pub fn linear_displacement(&self) -> Vec3 {
        self.linear_displacement
    }

    pub fn angular_displacement(&self) -> Quat {
        self.angular_displacement
    }

    /// Average velocity the follow imparted since the accumulators were last
    /// reset.
    pub fn velocity(&self) -> Vec3 {
        if self.time > 0.0 {
            self.linear_displacement / self.time
        } else {
            Vec3::ZERO
        }
    }

    /// Seconds of simulation the accumulators cover.
    pub fn time(&self) -> f32 {
        self.time
    }
}
