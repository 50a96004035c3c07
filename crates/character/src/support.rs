//! # Ground Support
//!
//! Classifies the contact manifolds the physics engine reports for the
//! character capsule: is the avatar standing on something, is one of the
//! contacts a climbable step, and is the capsule wedged somewhere it cannot
//! leave. The scan only reads contacts; everything it learns goes back to
//! the controller, which decides what to do about it.

use glam::{Quat, Vec3};

// ============================================================================
// Contact data
// ============================================================================

/// One solver contact between the character capsule and another body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactPoint {
    /// Contact position in the capsule's local frame, origin at the capsule
    /// center.
    pub local_point: Vec3,
    /// World-frame contact normal, pointing toward the character.
    pub normal: Vec3,
    /// Signed separation distance; negative when penetrating.
    pub distance: f32,
    /// Impulse the solver applied to keep the bodies apart.
    pub impulse: f32,
    /// Consecutive solver steps this contact has persisted.
    pub lifetime: u32,
}

/// All contacts between the character and one other body.
#[derive(Debug, Clone, Default)]
pub struct ContactManifold {
    pub points: Vec<ContactPoint>,
}

// ============================================================================
// Support scan
// ============================================================================

/// Capsule geometry and movement intent the scan needs from the controller.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SupportScan {
    /// Ideal velocity from the last motor pass; nonzero means "pushing".
    pub target_velocity: Vec3,
    /// Body rotation, to lift local contact points into the world frame.
    pub rotation: Quat,
    pub up: Vec3,
    pub radius: f32,
    pub half_height: f32,
    pub min_step_height: f32,
    pub max_step_height: f32,
    pub step_up_enabled: bool,
}

/// A contact worth climbing: the highest sub-maximum obstacle the character
/// is pushing into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCandidate {
    /// Contact height above the capsule's lowest point (meters).
    pub height: f32,
    /// World-frame contact normal, pointing toward the character.
    pub normal: Vec3,
    /// World-frame contact point relative to the capsule center.
    pub point: Vec3,
}

/// What one pass over the manifolds learned.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SupportReport {
    pub has_floor: bool,
    pub stuck: bool,
    pub step: Option<StepCandidate>,
}

/// Persistent penetration past this depth, with a large impulse behind it,
/// marks the capsule as stuck.
const STUCK_PENETRATION: f32 = -0.05;
const STUCK_IMPULSE: f32 = 500.0;
const STUCK_LIFETIME: u32 = 3;

/// Slopes steeper than sixty degrees are walls, not floor.
const MIN_FLOOR_NORMAL_DOT_UP: f32 = 0.5;

/// Classify the capsule's contacts: floor, climbable step, stuck.
pub(crate) fn check_for_support(
    manifolds: &[ContactManifold],
    scan: &SupportScan,
) -> SupportReport {
    let pushing = scan.target_velocity.length_squared() > f32::EPSILON;
    let mut report = SupportReport::default();
    let mut best_step_height = scan.min_step_height;

    for manifold in manifolds {
        let mut step_contact: Option<&ContactPoint> = None;
        let mut highest_step = scan.min_step_height;

        for contact in &manifold.points {
            let hit_height = scan.half_height + scan.radius + contact.local_point.dot(scan.up);

            if contact.distance < STUCK_PENETRATION
                && contact.impulse > STUCK_IMPULSE
                && contact.lifetime > STUCK_LIFETIME
            {
                report.stuck = true;
            }
            if hit_height < scan.max_step_height
                && contact.normal.dot(scan.up) > MIN_FLOOR_NORMAL_DOT_UP
            {
                report.has_floor = true;
            }
            if pushing && scan.target_velocity.dot(contact.normal) < 0.0 {
                if !scan.step_up_enabled || hit_height > scan.max_step_height {
                    // a blocking contact above step height makes this body a
                    // wall; the whole manifold stops being a step
                    step_contact = None;
                    break;
                } else if hit_height > highest_step {
                    highest_step = hit_height;
                    step_contact = Some(contact);
                    report.has_floor = true;
                }
            }
        }

        if let Some(contact) = step_contact {
            if highest_step > best_step_height {
                best_step_height = highest_step;
                report.step = Some(StepCandidate {
                    height: highest_step,
                    normal: contact.normal,
                    point: scan.rotation * contact.local_point,
                });
            }
        }
    }
    report
}
