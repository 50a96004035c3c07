//! # Character Controller
//!
//! The per-avatar physics action. Each frame the avatar layer slams its
//! desired transform and motors in, the physics engine runs one or more
//! substeps, and the avatar reads the resulting velocity and movement state
//! back out:
//!
//! 1. [`CharacterController::pre_simulation`]: slam the body to the avatar
//!    transform, note the incoming velocity, evaluate the movement state
//!    machine.
//! 2. [`CharacterController::update`], once per physics substep: support
//!    scan, motor blending, follow displacement, step-up assist, final
//!    velocity.
//! 3. [`CharacterController::post_simulation`]: measure how much the solver
//!    changed the velocity.
//!
//! The controller owns its rigid body state exclusively. The engine behind
//! [`CollisionWorld`] only answers ray probes and reports contacts; between
//! substeps the host reads the body via
//! [`rigid_body`](CharacterController::rigid_body), integrates it, and
//! writes the result back with
//! [`set_rigid_body`](CharacterController::set_rigid_body). Without a rigid
//! body installed every hook is a no-op.
//!
//! State timers run on the controller's own simulation clock, advanced by
//! each substep's `dt`, so replays and tests are deterministic.

use crate::config::CharacterConfig;
use crate::follow::FollowHelper;
use crate::motor::{CharacterMotor, MAX_CHARACTER_MOTOR_TIMESCALE};
use crate::support::{check_for_support, ContactManifold, SupportScan};
use glam::{Quat, Vec3};
use tracing::debug;
use weald_common::secs_to_usec;

// ============================================================================
// Pending flags
// ============================================================================

/// Bits the controller sets to tell the host engine what must be refreshed
/// before the next step; the host clears them as it catches up.
pub mod pending {
    /// The capsule dimensions changed; rebuild the collision shape.
    pub const UPDATE_SHAPE: u32 = 1 << 0;
    /// Collisionless was toggled; swap the body's collision mask.
    pub const UPDATE_COLLISION_MASK: u32 = 1 << 1;
    /// The jump input is held this frame.
    pub const JUMP: u32 = 1 << 2;
    /// Re-derive the movement state from scratch (zone change, teleport).
    pub const RECOMPUTE_FLYING: u32 = 1 << 3;
}

// ============================================================================
// Collision world
// ============================================================================

/// The slice of the physics engine the controller reads.
pub trait CollisionWorld {
    /// Closest-hit fraction along the segment `start..end`, ignoring the
    /// character's own body. `None` when nothing is hit.
    fn ray_hit_fraction(&self, start: Vec3, end: Vec3) -> Option<f32>;

    /// Contact manifolds involving the character capsule this substep.
    fn character_manifolds(&self) -> Vec<ContactManifold>;
}

// ============================================================================
// Rigid body + movement state
// ============================================================================

/// The capsule body the controller steers. Position is the capsule center,
/// offset from the avatar origin by the shape-local offset.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RigidBodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
}

impl RigidBodyState {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            linear_velocity: Vec3::ZERO,
        }
    }
}

/// Movement mode, re-evaluated once per frame in `pre_simulation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterState {
    Ground,
    Takeoff,
    InAir,
    Hover,
}

// ============================================================================
// Controller
// ============================================================================

const LOCAL_UP_AXIS: Vec3 = Vec3::Y;

/// Speeds below this are snapped to zero before and after motor blending.
const MIN_TARGET_SPEED: f32 = 0.001;
const MIN_TARGET_SPEED_SQUARED: f32 = MIN_TARGET_SPEED * MIN_TARGET_SPEED;

/// Step heights as fractions of the capsule height (half height + radius).
const MIN_STEP_HEIGHT_FACTOR: f32 = 0.005;
const MAX_STEP_HEIGHT_FACTOR: f32 = 0.65;

/// Degenerate bounding boxes still get a minimally tall capsule.
const MIN_HALF_HEIGHT: f32 = 0.1;

/// Motor response while flying: one fast rate on both axes.
const FLYING_MOTOR_TIMESCALE: f32 = 0.05;
/// Walking response for the horizontal axis; the vertical axis is left to
/// gravity by handing it an inert timescale.
const WALKING_MOTOR_TIMESCALE: f32 = 0.2;

/// The avatar's physics personality: capsule steering, ground support,
/// step-up assist and the Ground/Takeoff/InAir/Hover state machine.
#[derive(Debug)]
pub struct CharacterController {
    config: CharacterConfig,
    state: CharacterState,
    body: Option<RigidBodyState>,

    // capsule shape
    radius: f32,
    half_height: f32,
    shape_local_offset: Vec3,
    scale_factor: f32,

    // desired transform, slammed in by the avatar layer each frame
    position: Vec3,
    rotation: Quat,
    current_up: Vec3,

    gravity: f32,
    current_gravity: f32,

    motors: Vec<CharacterMotor>,
    target_velocity: Vec3,
    parent_velocity: Vec3,
    linear_acceleration: Vec3,

    follow: FollowHelper,

    // support and step memory, refreshed every substep
    floor_distance: f32,
    has_support: bool,
    stuck: bool,
    stepping_up: bool,
    step_up_enabled: bool,
    min_step_height: f32,
    max_step_height: f32,
    step_height: f32,
    step_normal: Vec3,
    step_point: Vec3,

    // jump and state bookkeeping
    pending_flags: u32,
    previous_flags: u32,
    jump_button_down_start: u64,
    jump_button_down_count: u32,
    takeoff_jump_button_id: u32,
    takeoff_started: u64,
    last_ray_hit: Option<u64>,
    now_usec: u64,

    pre_simulation_velocity: Vec3,
    velocity_change: Vec3,

    collisionless: bool,
    collisionless_allowed: bool,
    zone_flying_allowed: bool,
    comfort_flying_allowed: bool,
    seated: bool,
}

impl Default for CharacterController {
    fn default() -> Self {
        Self::new(CharacterConfig::default())
    }
}

impl CharacterController {
    pub fn new(config: CharacterConfig) -> Self {
        let mut controller = Self {
            state: CharacterState::Hover,
            body: None,
            radius: 0.0,
            half_height: 0.0,
            shape_local_offset: Vec3::ZERO,
            scale_factor: 1.0,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            current_up: LOCAL_UP_AXIS,
            gravity: config.gravity,
            current_gravity: 0.0,
            motors: Vec::new(),
            target_velocity: Vec3::ZERO,
            parent_velocity: Vec3::ZERO,
            linear_acceleration: Vec3::ZERO,
            follow: FollowHelper::new(),
            floor_distance: config.fall_height,
            has_support: false,
            stuck: false,
            stepping_up: false,
            step_up_enabled: true,
            min_step_height: 0.0,
            max_step_height: 0.0,
            step_height: 0.0,
            step_normal: Vec3::ZERO,
            step_point: Vec3::ZERO,
            pending_flags: pending::UPDATE_SHAPE,
            previous_flags: 0,
            jump_button_down_start: 0,
            jump_button_down_count: 0,
            takeoff_jump_button_id: 0,
            takeoff_started: 0,
            last_ray_hit: None,
            now_usec: 0,
            pre_simulation_velocity: Vec3::ZERO,
            velocity_change: Vec3::ZERO,
            collisionless: false,
            collisionless_allowed: true,
            zone_flying_allowed: true,
            comfort_flying_allowed: true,
            seated: false,
            config,
        };
        controller.update_current_gravity();
        controller
    }

    pub fn config(&self) -> &CharacterConfig {
        &self.config
    }
}

// ============================================================================
// Shape and rigid body
// ============================================================================

impl CharacterController {
    /// Derive the capsule from the avatar's local bounding box. A changed
    /// radius or half height raises `pending::UPDATE_SHAPE` for the host;
    /// the offset between avatar origin and capsule center updates either
    /// way.
    pub fn set_local_bounding_box(&mut self, min_corner: Vec3, scale: Vec3) {
        let radius = 0.5 * (0.5 * (scale.x * scale.x + scale.z * scale.z)).sqrt();
        let half_height = (0.5 * scale.y - radius).max(MIN_HALF_HEIGHT);

        if (radius - self.radius).abs() > f32::EPSILON
            || (half_height - self.half_height).abs() > f32::EPSILON
        {
            debug!(
                "Character capsule resized: radius {:.3} half height {:.3}",
                radius, half_height
            );
            self.radius = radius;
            self.half_height = half_height;
            self.min_step_height = MIN_STEP_HEIGHT_FACTOR * (half_height + radius);
            self.max_step_height = MAX_STEP_HEIGHT_FACTOR * (half_height + radius);
            self.pending_flags |= pending::UPDATE_SHAPE;
        }

        self.shape_local_offset = min_corner + 0.5 * scale;
    }

    /// Install or write back the rigid body. The host calls this after
    /// building a shape for a pending update and after every solver step it
    /// integrates.
    pub fn set_rigid_body(&mut self, body: RigidBodyState) {
        self.body = Some(body);
    }

    pub fn clear_rigid_body(&mut self) {
        self.body = None;
    }

    pub fn rigid_body(&self) -> Option<RigidBodyState> {
        self.body
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn half_height(&self) -> f32 {
        self.half_height
    }

    pub fn shape_local_offset(&self) -> Vec3 {
        self.shape_local_offset
    }

    pub fn pending_flags(&self) -> u32 {
        self.pending_flags
    }

    pub fn clear_pending_flags(&mut self, mask: u32) {
        self.pending_flags &= !mask;
    }
}

// ============================================================================
// Movement input
// ============================================================================

impl CharacterController {
    /// Aim the body at the avatar's transform; applied at the next
    /// `pre_simulation`. Also re-derives the up axis from the orientation.
    pub fn set_position_and_orientation(&mut self, position: Vec3, orientation: Quat) {
        self.current_up = orientation * LOCAL_UP_AXIS;
        self.rotation = orientation;
        self.position = position + orientation * self.shape_local_offset;
    }

    /// Avatar-frame transform recovered from the body, once one exists.
    pub fn position_and_orientation(&self) -> Option<(Vec3, Quat)> {
        self.body.map(|body| {
            (
                body.position - body.rotation * self.shape_local_offset,
                body.rotation,
            )
        })
    }

    pub fn clear_motors(&mut self) {
        self.motors.clear();
    }

    pub fn add_motor(&mut self, motor: CharacterMotor) {
        self.motors.push(motor);
    }

    pub fn motors(&self) -> &[CharacterMotor] {
        &self.motors
    }

    /// `(horizontal, vertical)` timescales suited to the current mode, for
    /// callers building their per-frame motors: one fast rate on both axes
    /// when hovering or collisionless, else a size-scaled walking rate
    /// horizontally with an inert vertical channel so gravity keeps the
    /// vertical axis.
    pub fn motor_timescales(&self) -> (f32, f32) {
        if self.state == CharacterState::Hover || self.is_collisionless() {
            (FLYING_MOTOR_TIMESCALE, FLYING_MOTOR_TIMESCALE)
        } else {
            (
                WALKING_MOTOR_TIMESCALE * self.scale_factor,
                MAX_CHARACTER_MOTOR_TIMESCALE,
            )
        }
    }

    /// Velocity of whatever the avatar is standing on or attached to; added
    /// back on top of the motor-blended velocity every substep.
    pub fn set_parent_velocity(&mut self, velocity: Vec3) {
        self.parent_velocity = velocity;
    }

    /// Thrust, applied after motor blending to both the real and the ideal
    /// velocity.
    pub fn set_linear_acceleration(&mut self, acceleration: Vec3) {
        self.linear_acceleration = acceleration;
    }

    /// Call every frame while the jump input is held.
    pub fn jump(&mut self) {
        self.pending_flags |= pending::JUMP;
    }

    /// Pull the body toward an avatar-frame transform over the next
    /// `time_remaining` seconds (HMD re-centering, seat transitions).
    pub fn set_follow_parameters(&mut self, position: Vec3, rotation: Quat, time_remaining: f32) {
        self.follow.set_target(
            position + rotation * self.shape_local_offset,
            rotation,
            time_remaining,
        );
    }

    pub fn follow_linear_displacement(&self) -> Vec3 {
        self.follow.linear_displacement()
    }

    pub fn follow_angular_displacement(&self) -> Quat {
        self.follow.angular_displacement()
    }

    pub fn follow_velocity(&self) -> Vec3 {
        self.follow.velocity()
    }

    pub fn follow_time(&self) -> f32 {
        self.follow.time()
    }
}

// ============================================================================
// Mode toggles
// ============================================================================

impl CharacterController {
    /// Zone gravity override. Jump-speed math keeps using the configured
    /// reference gravity.
    pub fn set_gravity(&mut self, gravity: f32) {
        self.gravity = gravity;
        self.update_current_gravity();
    }

    pub fn gravity(&self) -> f32 {
        self.gravity
    }

    /// Gravity currently applied to the body: zero while hovering or
    /// collisionless, the configured value otherwise.
    pub fn current_gravity(&self) -> f32 {
        self.current_gravity
    }

    /// Avatar size multiplier; scales jump height, hover floor and the
    /// fall-scan distance.
    pub fn set_scale_factor(&mut self, scale: f32) {
        self.scale_factor = scale;
    }

    pub fn set_collisionless(&mut self, collisionless: bool) {
        if collisionless != self.collisionless {
            self.collisionless = collisionless;
            self.pending_flags |= pending::UPDATE_COLLISION_MASK;
            self.update_current_gravity();
        }
    }

    /// Zones may forbid collisionless avatars outright.
    pub fn set_collisionless_allowed(&mut self, allowed: bool) {
        if allowed != self.collisionless_allowed {
            self.collisionless_allowed = allowed;
            self.pending_flags |= pending::UPDATE_COLLISION_MASK;
            self.update_current_gravity();
        }
    }

    pub fn is_collisionless(&self) -> bool {
        self.collisionless && self.collisionless_allowed
    }

    pub fn set_zone_flying_allowed(&mut self, allowed: bool) {
        self.zone_flying_allowed = allowed;
    }

    pub fn set_comfort_flying_allowed(&mut self, allowed: bool) {
        self.comfort_flying_allowed = allowed;
    }

    pub fn set_step_up_enabled(&mut self, enabled: bool) {
        self.step_up_enabled = enabled;
    }

    /// Seated avatars park the state machine; the host sets and clears this
    /// around sit interactions.
    pub fn set_seated(&mut self, seated: bool) {
        self.seated = seated;
    }

    pub fn is_seated(&self) -> bool {
        self.seated
    }

    /// Ask the next `pre_simulation` to re-derive the movement state from
    /// scratch (used after teleports and zone changes).
    pub fn recompute_flying(&mut self) {
        self.pending_flags |= pending::RECOMPUTE_FLYING;
    }
}

// ============================================================================
// Frame hooks
// ============================================================================

impl CharacterController {
    /// Once per frame, before the physics substeps: slam the body to the
    /// avatar transform, remember the incoming velocity, and run the state
    /// machine.
    pub fn pre_simulation(&mut self, world: &dyn CollisionWorld) {
        if let Some(mut body) = self.body {
            body.position = self.position;
            body.rotation = self.rotation;
            self.body = Some(body);
            self.pre_simulation_velocity = body.linear_velocity;
            self.update_state(world);
        }
        self.previous_flags = self.pending_flags;
        self.pending_flags &= !pending::JUMP;
        self.follow.reset_accumulators();
    }

    /// One physics substep: support scan, motor blending, follow
    /// displacement, step-up assist, final velocity.
    pub fn update(&mut self, world: &dyn CollisionWorld, dt: f32) {
        if self.body.is_none() {
            return;
        }
        self.now_usec = self.now_usec.saturating_add(secs_to_usec(dt));
        self.pre_step(world);
        self.player_step(world, dt);
    }

    /// Once per frame, after the solver: measure how much it changed the
    /// velocity.
    pub fn post_simulation(&mut self) {
        if let Some(body) = self.body {
            self.velocity_change = body.linear_velocity - self.pre_simulation_velocity;
        }
    }

    /// Short proximity probe below the bottom sphere, keeping the cached
    /// floor distance fresh between full state evaluations.
    fn pre_step(&mut self, world: &dyn CollisionWorld) {
        let Some(body) = self.body else { return };
        let ray_start = body.position - self.half_height * self.current_up;
        let ray_length = self.radius + self.floor_proximity_threshold();
        let ray_end = ray_start - ray_length * self.current_up;
        if let Some(fraction) = world.ray_hit_fraction(ray_start, ray_end) {
            self.floor_distance = ray_length * fraction - self.radius;
        }
    }

    fn player_step(&mut self, world: &dyn CollisionWorld, dt: f32) {
        let Some(mut body) = self.body else { return };

        // forget the last step obstacle, then rescan the contacts
        self.step_height = self.min_step_height;
        let report = check_for_support(
            &world.character_manifolds(),
            &SupportScan {
                target_velocity: self.target_velocity,
                rotation: body.rotation,
                up: self.current_up,
                radius: self.radius,
                half_height: self.half_height,
                min_step_height: self.min_step_height,
                max_step_height: self.max_step_height,
                step_up_enabled: self.step_up_enabled,
            },
        );
        self.has_support = report.has_floor;
        if report.stuck && !self.stuck {
            debug!("Character capsule is wedged; reporting stuck");
        }
        self.stuck = report.stuck;
        if let Some(step) = report.step {
            self.step_height = step.height;
            self.step_normal = step.normal;
            self.step_point = step.point;
        }

        let mut velocity = body.linear_velocity - self.parent_velocity;
        self.compute_new_velocity(dt, &mut velocity);

        if let Some((position, rotation)) = self.follow.advance(
            dt,
            body.position,
            body.rotation,
            self.shape_local_offset,
            0.5 * self.radius,
        ) {
            body.position = position;
            body.rotation = rotation;
        }

        if self.stepping_up {
            let up = self.current_up;
            let horizontal_target = self.target_velocity - self.target_velocity.dot(up) * up;
            let horizontal_target_speed = horizontal_target.length();
            if horizontal_target_speed > f32::EPSILON {
                // vertical speed that crests the step in the time it takes
                // to reach it at the target pace
                let horizontal_distance = (self.step_point - self.step_point.dot(up) * up).length();
                let time_to_step = horizontal_distance / horizontal_target_speed;
                let mut step_up_speed = self.step_height / time_to_step;

                // cap the boost so the climb does not look like a launch
                let max_step_up_speed = 0.65 * horizontal_target_speed;
                if step_up_speed > max_step_up_speed {
                    step_up_speed = max_step_up_speed;
                }

                // compensate the average displacement gravity will steal
                // over the step (gravity is a negative scalar)
                step_up_speed -= 0.5 * self.current_gravity * time_to_step;

                let up_speed = velocity.dot(up);
                if up_speed < step_up_speed {
                    // not enough real velocity to crest in time; hoist the
                    // body directly so it cannot pop once the step is done
                    body.position += (dt * step_up_speed) * up;
                }
                if up_speed < 0.0 {
                    // falling would defeat the climb
                    velocity -= up_speed * up;
                }
            }
        }

        body.linear_velocity = velocity + self.parent_velocity;
        self.body = Some(body);
    }

    /// Blend `velocity` through every motor, weight the results, then apply
    /// thrust. Also refreshes the ideal target velocity and decides whether
    /// any motor is pushing into the remembered step obstacle.
    fn compute_new_velocity(&mut self, dt: f32, velocity: &mut Vec3) {
        if velocity.length_squared() < MIN_TARGET_SPEED_SQUARED {
            *velocity = Vec3::ZERO;
        }

        let whole_vector = self.is_collisionless() || self.state == CharacterState::Hover;
        self.target_velocity = Vec3::ZERO;
        self.stepping_up = false;

        let mut velocities = Vec::with_capacity(self.motors.len());
        let mut weights = Vec::with_capacity(self.motors.len());
        for motor in &self.motors {
            let split = !motor.is_inert()
                && !whole_vector
                && motor.horiz_timescale != motor.vert_timescale;
            if split
                && self.step_height > self.min_step_height
                && !self.stepping_up
                && motor.world_velocity().dot(self.step_normal) < 0.0
            {
                // this motor pushes into the step obstacle
                self.stepping_up = true;
            }
            if let Some((adjusted, weight)) =
                motor.apply(dt, *velocity, self.current_up, whole_vector)
            {
                self.target_velocity += weight * motor.world_velocity();
                velocities.push(adjusted);
                weights.push(weight);
            }
        }

        let total_weight: f32 = weights.iter().sum();
        if total_weight > 0.0 {
            *velocity = Vec3::ZERO;
            for (blended, weight) in velocities.iter().zip(&weights) {
                *velocity += (weight / total_weight) * *blended;
            }
            self.target_velocity /= total_weight;
        }
        if velocity.length_squared() < MIN_TARGET_SPEED_SQUARED {
            *velocity = Vec3::ZERO;
        }

        // thrust lands last, on both the real and the ideal velocity
        self.target_velocity += dt * self.linear_acceleration;
        *velocity += dt * self.linear_acceleration;
    }
}

// ============================================================================
// State machine
// ============================================================================

impl CharacterController {
    fn update_state(&mut self, world: &dyn CollisionWorld) {
        if self.seated {
            return;
        }
        if self.pending_flags & pending::RECOMPUTE_FLYING != 0 {
            self.set_state(CharacterState::Hover, "recompute flying");
            self.has_support = false;
            self.step_height = self.min_step_height;
            self.pending_flags &= !pending::RECOMPUTE_FLYING;
        }

        let fly_to_ground_threshold = 0.1 * self.radius;
        let ground_to_fly_threshold = 0.8 * self.radius + self.half_height;
        let min_hover_height = self.scale_factor * self.config.min_hover_height;
        let jump_hold_to_hover_usec = if self.scale_factor < 1.0 {
            (self.scale_factor * self.config.jump_hold_to_hover_usec as f32) as u64
        } else {
            self.config.jump_hold_to_hover_usec
        };

        // scan straight down from the capsule center for a distant floor
        let collisionless = self.is_collisionless();
        let ray_length = self.radius
            + if collisionless {
                min_hover_height
            } else {
                self.scale_factor * self.config.fall_height
            };
        let ray_start = self.position;
        let ray_end = ray_start - ray_length * self.current_up;
        let now = self.now_usec;
        let mut ray_has_hit = false;
        if let Some(fraction) = world.ray_hit_fraction(ray_start, ray_end) {
            ray_has_hit = true;
            self.last_ray_hit = Some(now);
            self.floor_distance = ray_length * fraction - (self.radius + self.half_height);
        } else if self
            .last_ray_hit
            .map_or(false, |at| now.saturating_sub(at) < self.config.ray_hit_memory_usec)
        {
            // a recently seen floor stays credible briefly, so grazing a
            // ledge edge does not flap the state machine
            ray_has_hit = true;
        } else {
            self.floor_distance = f32::MAX;
        }

        // note the edge when the jump input goes down
        let jump_button_held = self.pending_flags & pending::JUMP != 0;
        if (self.previous_flags ^ self.pending_flags) & pending::JUMP != 0 && jump_button_held {
            self.jump_button_down_start = now;
            self.jump_button_down_count = self.jump_button_down_count.wrapping_add(1);
        }

        let velocity = self.pre_simulation_velocity;
        if collisionless {
            // without collisions only Ground and Hover exist; no transition
            // logging here, these flip whenever the avatar speeds up
            self.state = if ray_has_hit {
                if velocity.length() > self.config.max_walking_speed {
                    CharacterState::Hover
                } else {
                    CharacterState::Ground
                }
            } else {
                CharacterState::Hover
            };
        } else {
            match self.state {
                CharacterState::Ground => {
                    if !ray_has_hit && !self.has_support {
                        self.set_state(CharacterState::Hover, "no ground detected");
                    } else if jump_button_held
                        && self.jump_button_down_count != self.takeoff_jump_button_id
                    {
                        self.takeoff_jump_button_id = self.jump_button_down_count;
                        self.takeoff_started = now;
                        self.set_state(CharacterState::Takeoff, "jump pressed");
                    } else if ray_has_hit
                        && !self.has_support
                        && self.floor_distance > ground_to_fly_threshold
                    {
                        self.set_state(CharacterState::InAir, "falling");
                    }
                }
                CharacterState::Takeoff => {
                    if !ray_has_hit && !self.has_support {
                        self.set_state(CharacterState::Hover, "no ground");
                    } else if now.saturating_sub(self.takeoff_started)
                        > self.config.takeoff_duration_usec
                    {
                        self.set_state(CharacterState::InAir, "takeoff done");
                        let launched = velocity + self.jump_speed() * self.current_up;
                        if let Some(body) = self.body.as_mut() {
                            body.linear_velocity = launched;
                        }
                    }
                }
                CharacterState::InAir => {
                    let jump_speed = self.jump_speed();
                    if velocity.dot(self.current_up) <= 0.5 * jump_speed
                        && (self.floor_distance < fly_to_ground_threshold || self.has_support)
                    {
                        self.set_state(CharacterState::Ground, "hit ground");
                    } else if self.zone_flying_allowed {
                        let mut desired = self.target_velocity;
                        if desired.length_squared() < MIN_TARGET_SPEED_SQUARED {
                            desired = Vec3::ZERO;
                        }
                        let wants_up = jump_button_held
                            || desired.dot(self.current_up) > MIN_TARGET_SPEED;
                        if self.comfort_flying_allowed
                            && wants_up
                            && self.takeoff_jump_button_id != self.jump_button_down_count
                        {
                            self.set_state(CharacterState::Hover, "double jump");
                        } else if self.comfort_flying_allowed
                            && wants_up
                            && now.saturating_sub(self.jump_button_down_start)
                                > jump_hold_to_hover_usec
                        {
                            self.set_state(CharacterState::Hover, "jump held");
                        } else if (!ray_has_hit && !self.has_support)
                            || self.floor_distance > self.scale_factor * self.config.fall_height
                        {
                            self.set_state(CharacterState::Hover, "above fall threshold");
                        }
                    }
                }
                CharacterState::Hover => {
                    let horizontal_speed =
                        (velocity - velocity.dot(self.current_up) * self.current_up).length();
                    let flying_fast = horizontal_speed > 0.75 * self.config.max_walking_speed;
                    if !self.zone_flying_allowed {
                        self.set_state(CharacterState::InAir, "zone forbids flying");
                    } else if !self.comfort_flying_allowed
                        && (ray_has_hit
                            || self.has_support
                            || self.floor_distance < fly_to_ground_threshold)
                    {
                        self.set_state(CharacterState::InAir, "comfort flying off");
                    } else if (self.floor_distance < fly_to_ground_threshold || self.has_support)
                        && !flying_fast
                    {
                        self.set_state(CharacterState::Ground, "touching ground");
                    } else if self.floor_distance < min_hover_height
                        && !jump_button_held
                        && !flying_fast
                    {
                        self.set_state(CharacterState::InAir, "near ground");
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: CharacterState, reason: &str) {
        if state != self.state {
            debug!("Character state {:?} -> {:?} ({})", self.state, state, reason);
            self.state = state;
            self.update_current_gravity();
        }
    }

    fn update_current_gravity(&mut self) {
        if self.state == CharacterState::Hover || self.is_collisionless() {
            self.current_gravity = 0.0;
        } else {
            self.current_gravity = self.gravity;
        }
    }

    /// Launch speed clearing the configured jump height at reference
    /// gravity, scaled with avatar size but never below the minimum.
    fn jump_speed(&self) -> f32 {
        let height = (self.scale_factor * self.config.jump_height).max(self.config.min_jump_height);
        (2.0 * -self.config.gravity * height).max(0.0).sqrt()
    }

    fn floor_proximity_threshold(&self) -> f32 {
        0.3 * self.radius
    }
}

// ============================================================================
// Readbacks
// ============================================================================

impl CharacterController {
    pub fn state(&self) -> CharacterState {
        self.state
    }

    /// Standing on something: a close floor probe or a support contact.
    pub fn on_ground(&self) -> bool {
        self.floor_distance < self.floor_proximity_threshold() || self.has_support
    }

    pub fn has_support(&self) -> bool {
        self.has_support
    }

    /// The capsule is wedged in geometry it cannot leave. Reported only;
    /// recovery is the avatar layer's call.
    pub fn is_stuck(&self) -> bool {
        self.stuck
    }

    /// Distance from the capsule's lowest point to the floor below, as of
    /// the last probe; `f32::MAX` when no floor is known.
    pub fn floor_distance(&self) -> f32 {
        self.floor_distance
    }

    /// Ideal velocity according to input, as opposed to the blended real
    /// velocity on the body.
    pub fn target_velocity(&self) -> Vec3 {
        self.target_velocity
    }

    pub fn linear_velocity(&self) -> Vec3 {
        self.body.map_or(Vec3::ZERO, |body| body.linear_velocity)
    }

    /// How much the solver changed the velocity across the last frame.
    pub fn velocity_change(&self) -> Vec3 {
        self.velocity_change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::ContactPoint;
    use std::f32::consts::FRAC_PI_2;

    struct MockWorld {
        floor_height: Option<f32>,
        manifolds: Vec<ContactManifold>,
    }

    impl MockWorld {
        fn with_floor(height: f32) -> Self {
            Self {
                floor_height: Some(height),
                manifolds: Vec::new(),
            }
        }

        fn empty() -> Self {
            Self {
                floor_height: None,
                manifolds: Vec::new(),
            }
        }
    }

    impl CollisionWorld for MockWorld {
        fn ray_hit_fraction(&self, start: Vec3, end: Vec3) -> Option<f32> {
            let floor = self.floor_height?;
            if start.y < floor || end.y > floor {
                return None;
            }
            Some((start.y - floor) / (start.y - end.y))
        }

        fn character_manifolds(&self) -> Vec<ContactManifold> {
            self.manifolds.clone()
        }
    }

    // 0.3 radius, 0.6 half height, capsule center 0.9 above the avatar feet
    fn avatar() -> CharacterController {
        let mut controller = CharacterController::new(CharacterConfig::default());
        controller.set_local_bounding_box(Vec3::new(-0.3, 0.0, -0.3), Vec3::new(0.6, 1.8, 0.6));
        controller.set_position_and_orientation(Vec3::ZERO, Quat::IDENTITY);
        controller.set_rigid_body(RigidBodyState::new(Vec3::new(0.0, 0.9, 0.0), Quat::IDENTITY));
        controller
    }

    fn grounded() -> (CharacterController, MockWorld) {
        let mut controller = avatar();
        let world = MockWorld::with_floor(0.0);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Ground);
        (controller, world)
    }

    fn floor_contact() -> ContactManifold {
        ContactManifold {
            points: vec![ContactPoint {
                local_point: Vec3::new(0.0, -0.9, 0.0),
                normal: Vec3::Y,
                distance: -0.001,
                impulse: 10.0,
                lifetime: 1,
            }],
        }
    }

    #[test]
    fn test_no_rigid_body_is_noop() {
        let mut controller = CharacterController::new(CharacterConfig::default());
        controller.set_local_bounding_box(Vec3::new(-0.3, 0.0, -0.3), Vec3::new(0.6, 1.8, 0.6));
        let world = MockWorld::with_floor(0.0);
        controller.pre_simulation(&world);
        controller.update(&world, 0.1);
        controller.post_simulation();
        assert_eq!(controller.state(), CharacterState::Hover);
        assert_eq!(controller.linear_velocity(), Vec3::ZERO);
        assert_eq!(controller.velocity_change(), Vec3::ZERO);
    }

    #[test]
    fn test_hover_over_floor_grounds_in_one_tick() {
        let mut controller = avatar();
        let world = MockWorld::with_floor(0.0);
        assert_eq!(controller.state(), CharacterState::Hover);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Ground);
        assert!(controller.on_ground());
        assert!((controller.floor_distance()).abs() < 1e-4);
        assert_eq!(controller.current_gravity(), -9.8);
    }

    #[test]
    fn test_ground_to_hover_when_floor_vanishes() {
        let (mut controller, _world) = grounded();
        let empty = MockWorld::empty();

        // the recent ray hit is still trusted, so nothing changes yet
        controller.pre_simulation(&empty);
        assert_eq!(controller.state(), CharacterState::Ground);

        // let the ray memory lapse
        for _ in 0..6 {
            controller.update(&empty, 0.1);
        }
        controller.pre_simulation(&empty);
        assert_eq!(controller.state(), CharacterState::Hover);
        assert_eq!(controller.current_gravity(), 0.0);
        assert_eq!(controller.floor_distance(), f32::MAX);
    }

    #[test]
    fn test_jump_cycle_ground_takeoff_in_air_ground() {
        let (mut controller, world) = grounded();
        controller.jump();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Takeoff);

        // ride out the takeoff crouch
        for _ in 0..3 {
            controller.update(&world, 0.1);
        }
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::InAir);
        let jump_speed = (2.0_f32 * 9.8 * 0.6).sqrt();
        assert!((controller.linear_velocity().y - jump_speed).abs() < 1e-3);

        // upward speed decayed and the floor is close: land
        let mut body = controller.rigid_body().expect("body");
        body.linear_velocity = Vec3::ZERO;
        controller.set_rigid_body(body);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Ground);
    }

    #[test]
    fn test_double_jump_promotes_hover() {
        let (mut controller, world) = grounded();
        controller.jump();
        controller.pre_simulation(&world);
        for _ in 0..3 {
            controller.update(&world, 0.1);
        }
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::InAir);

        // release for a frame, then press again: a fresh press while airborne
        controller.pre_simulation(&world);
        controller.jump();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Hover);
        assert_eq!(controller.current_gravity(), 0.0);
    }

    #[test]
    fn test_held_jump_promotes_hover() {
        let (mut controller, world) = grounded();
        controller.jump();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Takeoff);

        for _ in 0..4 {
            controller.update(&world, 0.1);
        }
        controller.jump();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::InAir);

        // keep holding well past the promotion period
        for _ in 0..8 {
            controller.update(&world, 0.1);
        }
        controller.jump();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Hover);
    }

    #[test]
    fn test_zone_flying_forbidden_drops_hover() {
        let mut controller = avatar();
        let world = MockWorld::empty();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Hover);

        controller.set_zone_flying_allowed(false);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::InAir);
        assert_eq!(controller.current_gravity(), -9.8);
    }

    #[test]
    fn test_collisionless_bypasses_normal_transitions() {
        let (mut controller, world) = grounded();
        controller.set_collisionless(true);
        assert_ne!(controller.pending_flags() & pending::UPDATE_COLLISION_MASK, 0);
        assert_eq!(controller.current_gravity(), 0.0);

        // slow over a floor: Ground
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Ground);

        // fast: Hover, even though the floor is right there
        let mut body = controller.rigid_body().expect("body");
        body.linear_velocity = Vec3::new(5.0, 0.0, 0.0);
        controller.set_rigid_body(body);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Hover);
        assert_eq!(controller.current_gravity(), 0.0);

        // collisions back on: the normal machine grounds and gravity returns
        controller.set_collisionless(false);
        let mut body = controller.rigid_body().expect("body");
        body.linear_velocity = Vec3::ZERO;
        controller.set_rigid_body(body);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Ground);
        assert_eq!(controller.current_gravity(), -9.8);
    }

    #[test]
    fn test_motor_drives_velocity() {
        let (mut controller, world) = grounded();
        controller.add_motor(CharacterMotor::new(
            Vec3::new(2.0, 0.0, 0.0),
            Quat::IDENTITY,
            0.5,
            None,
        ));
        controller.update(&world, 0.25);
        assert!((controller.linear_velocity() - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-5);
        assert!((controller.target_velocity() - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_motor_timescales_follow_mode() {
        let (mut controller, world) = grounded();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Ground);
        let (h, v) = controller.motor_timescales();
        assert!((h - 0.2).abs() < 1e-6);
        assert!(v >= MAX_CHARACTER_MOTOR_TIMESCALE); // vertical left to gravity

        // halved avatar walks with a halved response time
        controller.set_scale_factor(0.5);
        let (h, _) = controller.motor_timescales();
        assert!((h - 0.1).abs() < 1e-6);

        // hovering flies on both axes
        let empty = MockWorld::empty();
        for _ in 0..6 {
            controller.update(&empty, 0.1);
        }
        controller.pre_simulation(&empty);
        assert_eq!(controller.state(), CharacterState::Hover);
        assert_eq!(controller.motor_timescales(), (0.05, 0.05));
    }

    #[test]
    fn test_parent_velocity_passes_through() {
        let (mut controller, world) = grounded();
        let mut body = controller.rigid_body().expect("body");
        body.linear_velocity = Vec3::new(0.0, 0.0, 3.0); // riding a platform
        controller.set_rigid_body(body);
        controller.set_parent_velocity(Vec3::new(0.0, 0.0, 3.0));
        // a full-strength stop motor kills motion relative to the parent
        controller.add_motor(CharacterMotor::new(Vec3::ZERO, Quat::IDENTITY, 0.05, None));
        controller.update(&world, 0.1);
        assert!((controller.linear_velocity() - Vec3::new(0.0, 0.0, 3.0)).length() < 1e-5);
    }

    #[test]
    fn test_thrust_applies_after_blending() {
        let (mut controller, world) = grounded();
        controller.set_linear_acceleration(Vec3::new(0.0, 4.0, 0.0));
        controller.update(&world, 0.5);
        assert!((controller.linear_velocity() - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-5);
        assert!((controller.target_velocity() - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_step_up_assist_hoists_the_body() {
        let (mut controller, mut world) = grounded();
        controller.add_motor(CharacterMotor::new(
            Vec3::new(2.0, 0.0, 0.0),
            Quat::IDENTITY,
            0.5,
            Some(6.0),
        ));
        // first substep establishes the pushing target velocity
        controller.update(&world, 0.1);

        // a knee-high obstacle right in the path
        world.manifolds.push(ContactManifold {
            points: vec![ContactPoint {
                local_point: Vec3::new(0.25, -0.6, 0.0),
                normal: Vec3::new(-1.0, 0.0, 0.0),
                distance: -0.001,
                impulse: 10.0,
                lifetime: 1,
            }],
        });
        let before = controller.rigid_body().expect("body").position;
        controller.update(&world, 0.1);
        let after = controller.rigid_body().expect("body");
        assert!(after.position.y > before.y);
        assert!(after.linear_velocity.y >= 0.0);
    }

    #[test]
    fn test_follow_pulls_the_body() {
        let (mut controller, world) = grounded();
        controller.set_follow_parameters(Vec3::new(1.0, 0.0, 0.0), Quat::IDENTITY, 1.0);
        controller.update(&world, 0.1);
        let body = controller.rigid_body().expect("body");
        assert!(body.position.x > 0.0);
        assert!((controller.follow_linear_displacement().x - body.position.x).abs() < 1e-5);
        assert!(controller.follow_velocity().x > 0.0);
        assert!((controller.follow_time() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_stuck_is_reported_not_resolved() {
        let (mut controller, mut world) = grounded();
        world.manifolds.push(ContactManifold {
            points: vec![ContactPoint {
                local_point: Vec3::new(0.25, -0.2, 0.0),
                normal: Vec3::new(-1.0, 0.0, 0.0),
                distance: -0.06,
                impulse: 600.0,
                lifetime: 5,
            }],
        });
        let before = controller.rigid_body().expect("body").position;
        controller.update(&world, 0.1);
        assert!(controller.is_stuck());
        assert_eq!(controller.rigid_body().expect("body").position, before);
    }

    #[test]
    fn test_support_contact_counts_as_ground() {
        let mut controller = avatar();
        let mut world = MockWorld::empty();
        world.manifolds.push(floor_contact());
        assert!(!controller.on_ground());
        controller.update(&world, 0.1);
        assert!(controller.has_support());
        assert!(controller.on_ground());
    }

    #[test]
    fn test_capsule_derivation_and_shape_flags() {
        let mut controller = CharacterController::new(CharacterConfig::default());
        // fresh controllers owe the host a shape
        assert_ne!(controller.pending_flags() & pending::UPDATE_SHAPE, 0);

        controller.set_local_bounding_box(Vec3::new(-0.3, 0.0, -0.3), Vec3::new(0.6, 1.8, 0.6));
        assert!((controller.radius() - 0.3).abs() < 1e-6);
        assert!((controller.half_height() - 0.6).abs() < 1e-6);
        assert_eq!(controller.shape_local_offset(), Vec3::new(0.0, 0.9, 0.0));

        controller.clear_pending_flags(pending::UPDATE_SHAPE);
        // same box again: no new shape work
        controller.set_local_bounding_box(Vec3::new(-0.3, 0.0, -0.3), Vec3::new(0.6, 1.8, 0.6));
        assert_eq!(controller.pending_flags() & pending::UPDATE_SHAPE, 0);
        // a taller avatar needs one
        controller.set_local_bounding_box(Vec3::new(-0.3, 0.0, -0.3), Vec3::new(0.6, 2.2, 0.6));
        assert_ne!(controller.pending_flags() & pending::UPDATE_SHAPE, 0);

        // tiny avatars still get a minimally tall capsule
        controller.set_local_bounding_box(Vec3::ZERO, Vec3::new(0.2, 0.3, 0.2));
        assert_eq!(controller.half_height(), MIN_HALF_HEIGHT);
    }

    #[test]
    fn test_recompute_flying_rises_to_hover() {
        let mut controller = avatar();
        controller.set_position_and_orientation(Vec3::new(0.0, 3.0, 0.0), Quat::IDENTITY);
        controller.set_rigid_body(RigidBodyState::new(Vec3::new(0.0, 3.9, 0.0), Quat::IDENTITY));
        let world = MockWorld::with_floor(0.0);

        controller.set_comfort_flying_allowed(false);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::InAir);

        // re-allowing comfort flight does not lift the avatar by itself
        controller.set_comfort_flying_allowed(true);
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::InAir);

        controller.recompute_flying();
        controller.pre_simulation(&world);
        assert_eq!(controller.state(), CharacterState::Hover);
    }

    #[test]
    fn test_seated_parks_the_state_machine() {
        let (mut controller, _world) = grounded();
        controller.set_seated(true);
        assert!(controller.is_seated());

        let empty = MockWorld::empty();
        for _ in 0..6 {
            controller.update(&empty, 0.1);
        }
        controller.pre_simulation(&empty);
        assert_eq!(controller.state(), CharacterState::Ground);

        controller.set_seated(false);
        controller.pre_simulation(&empty);
        assert_eq!(controller.state(), CharacterState::Hover);
    }

    #[test]
    fn test_avatar_transform_round_trip() {
        let mut controller = avatar();
        let (position, rotation) = controller.position_and_orientation().expect("body");
        assert!(position.length() < 1e-6);
        assert_eq!(rotation, Quat::IDENTITY);

        let yaw = Quat::from_rotation_y(FRAC_PI_2);
        controller.set_position_and_orientation(Vec3::new(1.0, 2.0, 3.0), yaw);
        let world = MockWorld::empty();
        controller.pre_simulation(&world); // slams the body to the new transform
        let (position, rotation) = controller.position_and_orientation().expect("body");
        assert!((position - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-5);
        assert!(rotation.angle_between(yaw) < 1e-5);
    }

    #[test]
    fn test_post_simulation_measures_solver_change() {
        let (mut controller, world) = grounded();
        controller.pre_simulation(&world);
        let mut body = controller.rigid_body().expect("body");
        body.linear_velocity = Vec3::new(0.0, -2.0, 0.0); // solver pulled us down
        controller.set_rigid_body(body);
        controller.post_simulation();
        assert!((controller.velocity_change() - Vec3::new(0.0, -2.0, 0.0)).length() < 1e-6);
    }
}
