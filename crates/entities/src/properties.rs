//! # Entity Properties
//!
//! The edit payload: a property set where every field is optional and `Some`
//! means "this edit explicitly sets the field". Network edits, script edits
//! and persisted documents all funnel through this one shape, so filtering
//! (lock rules, ownership rejection, script whitelists) is uniformly "take
//! fields out of the set before applying it".

use crate::entity::EntityKind;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use weald_common::{AACube, EntityId, SimulationOwner};

// ============================================================================
// Host Type
// ============================================================================

/// Where an entity lives and who may see it.
///
/// `Domain` entities are the shared world; `AvatarLocal` entities ride along
/// with one avatar (and die with it); `Local` entities exist only in this
/// process. The wire only ever carries `Domain` entities; the legacy
/// `clientOnly` boolean maps to `AvatarLocal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityHostType {
    #[default]
    Domain,
    AvatarLocal,
    Local,
}

impl EntityHostType {
    pub fn from_string(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "avatar" | "avatarlocal" | "avatar_local" => EntityHostType::AvatarLocal,
            "local" => EntityHostType::Local,
            _ => EntityHostType::Domain,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityHostType::Domain => "domain",
            EntityHostType::AvatarLocal => "avatar",
            EntityHostType::Local => "local",
        }
    }
}

// ============================================================================
// Property Groups
// ============================================================================

/// How users may grab the entity. Historically these lived as JSON inside
/// `userData`; the persisted-document migration hoists them here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrabProperties {
    pub grabbable: bool,
    /// Grabs move the entity kinematically instead of dynamically.
    pub grab_kinematic: bool,
    pub grab_follows_controller: bool,
    pub triggerable: bool,
    pub equippable: bool,
    /// Grabbing a child grabs the topmost grab-delegating ancestor instead.
    pub grab_delegate_to_parent: bool,
}

impl Default for GrabProperties {
    fn default() -> Self {
        Self {
            grabbable: true,
            grab_kinematic: true,
            grab_follows_controller: true,
            triggerable: false,
            equippable: false,
            grab_delegate_to_parent: true,
        }
    }
}

/// Clone permissions carried by a clonable source entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub cloneable: bool,
    /// Lifetime stamped onto spawned clones, seconds.
    pub clone_lifetime: f32,
    /// Maximum live clones of this source; 0 = unlimited.
    pub clone_limit: u32,
    pub clone_dynamic: bool,
    /// Clones become avatar entities of the cloning session.
    pub clone_avatar_entity: bool,
}

impl Default for CloneSpec {
    fn default() -> Self {
        Self {
            cloneable: false,
            clone_lifetime: 300.0,
            clone_limit: 0,
            clone_dynamic: false,
            clone_avatar_entity: false,
        }
    }
}

// ============================================================================
// EntityProperties
// ============================================================================

/// One edit's worth of entity state. `None` = "leave that field alone".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityProperties {
    // ---- identity ----
    #[serde(default)]
    pub name: Option<String>,
    /// Per-kind payload; replaced atomically by an edit.
    #[serde(default)]
    pub kind: Option<EntityKind>,

    // ---- spatial ----
    #[serde(default)]
    pub position: Option<Vec3>,
    #[serde(default)]
    pub rotation: Option<Quat>,
    #[serde(default)]
    pub dimensions: Option<Vec3>,
    /// Pivot inside the dimensions box, each axis in [0,1].
    #[serde(default)]
    pub registration_point: Option<Vec3>,
    #[serde(default)]
    pub velocity: Option<Vec3>,
    #[serde(default)]
    pub angular_velocity: Option<Vec3>,
    #[serde(default)]
    pub acceleration: Option<Vec3>,
    #[serde(default)]
    pub gravity: Option<Vec3>,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    #[serde(default)]
    pub parent_joint_index: Option<u16>,
    /// Sender-declared octree key; recomputed locally when absent or stale.
    #[serde(default)]
    pub query_aacube: Option<AACube>,

    // ---- lifecycle ----
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub last_edited: Option<u64>,
    /// Seconds until self-destruction; <= 0 means immortal.
    #[serde(default)]
    pub lifetime: Option<f32>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default)]
    pub host_type: Option<EntityHostType>,
    #[serde(default)]
    pub simulation_owner: Option<SimulationOwner>,

    // ---- behavior ----
    #[serde(default)]
    pub visible: Option<bool>,
    #[serde(default)]
    pub collisionless: Option<bool>,
    #[serde(default)]
    pub dynamic: Option<bool>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub material_data: Option<String>,
    #[serde(default)]
    pub grab: Option<GrabProperties>,

    // ---- marketplace ----
    #[serde(default)]
    pub certificate_id: Option<String>,
    #[serde(default)]
    pub static_certificate_version: Option<u32>,

    // ---- cloning ----
    #[serde(default)]
    pub clone: Option<CloneSpec>,
    #[serde(default)]
    pub clone_origin_id: Option<EntityId>,
}

impl EntityProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the set carries nothing at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The fields a rejected ownership bid is not allowed to touch.
    ///
    /// Everything else in the edit still applies.
    pub fn strip_physics_details(&mut self) {
        self.position = None;
        self.rotation = None;
        self.velocity = None;
        self.angular_velocity = None;
        self.acceleration = None;
        self.parent_id = None;
        self.parent_joint_index = None;
    }

    pub fn clear_simulation_owner(&mut self) {
        self.simulation_owner = None;
    }

    /// Does the edit touch anything the physics engine cares about?
    pub fn has_physics_changes(&self) -> bool {
        self.has_transform_changes()
            || self.velocity.is_some()
            || self.angular_velocity.is_some()
            || self.acceleration.is_some()
            || self.gravity.is_some()
            || self.dynamic.is_some()
            || self.collisionless.is_some()
    }

    pub fn has_transform_changes(&self) -> bool {
        self.position.is_some()
            || self.rotation.is_some()
            || self.dimensions.is_some()
            || self.registration_point.is_some()
            || self.parent_id.is_some()
            || self.parent_joint_index.is_some()
    }

    /// A lock-release edit: exactly `locked = false`, plus timestamps.
    pub fn is_lock_release_only(&self) -> bool {
        if self.locked != Some(false) {
            return false;
        }
        let mut rest = self.clone();
        rest.locked = None;
        rest.last_edited = None;
        rest.is_empty()
    }

    /// Strip any script whose URL matches none of `prefixes` (empty list
    /// allows everything). Returns true when a script was removed.
    pub fn filter_script_whitelist(&mut self, prefixes: &[String]) -> bool {
        if prefixes.is_empty() {
            return false;
        }
        match &self.script {
            Some(url) if !url.is_empty() => {
                let allowed = prefixes.iter().any(|prefix| url.starts_with(prefix.as_str()));
                if !allowed {
                    self.script = None;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Cap the lifetime for senders without persistent-rez rights. Returns
    /// true when a cap was imposed.
    pub fn cap_tmp_lifetime(&mut self, max_secs: f32) -> bool {
        match self.lifetime {
            Some(lifetime) if lifetime > 0.0 && lifetime <= max_secs => false,
            _ => {
                self.lifetime = Some(max_secs);
                true
            }
        }
    }

    // ---- builders (test/script convenience) ----

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_dimensions(mut self, dimensions: Vec3) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn with_parent(mut self, parent_id: EntityId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_lifetime(mut self, lifetime: f32) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = Some(locked);
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = Some(dynamic);
        self
    }

    pub fn with_simulation_owner(mut self, owner: SimulationOwner) -> Self {
        self.simulation_owner = Some(owner);
        self
    }

    pub fn with_certificate_id(mut self, certificate_id: impl Into<String>) -> Self {
        self.certificate_id = Some(certificate_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    #[test]
    fn test_empty_detection() {
        assert!(EntityProperties::new().is_empty());
        assert!(!EntityProperties::new().with_position(Vec3::ONE).is_empty());
    }

    #[test]
    fn test_strip_physics_details() {
        let mut props = EntityProperties::new()
            .with_position(Vec3::ONE)
            .with_rotation(Quat::IDENTITY)
            .with_velocity(Vec3::X)
            .with_parent(EntityId::random())
            .with_name("kept");
        props.angular_velocity = Some(Vec3::Y);
        props.acceleration = Some(Vec3::Z);
        props.parent_joint_index = Some(3);

        props.strip_physics_details();
        assert!(props.position.is_none());
        assert!(props.rotation.is_none());
        assert!(props.velocity.is_none());
        assert!(props.angular_velocity.is_none());
        assert!(props.acceleration.is_none());
        assert!(props.parent_id.is_none());
        assert!(props.parent_joint_index.is_none());
        assert_eq!(props.name.as_deref(), Some("kept"));
    }

    #[test]
    fn test_lock_release_detection() {
        let mut release = EntityProperties::new().with_locked(false);
        release.last_edited = Some(42);
        assert!(release.is_lock_release_only());

        let lock = EntityProperties::new().with_locked(true);
        assert!(!lock.is_lock_release_only());

        let sneaky = EntityProperties::new()
            .with_locked(false)
            .with_position(Vec3::ONE);
        assert!(!sneaky.is_lock_release_only());
    }

    #[test]
    fn test_script_whitelist() {
        let prefixes = vec!["https://trusted.example/".to_string()];

        let mut ok = EntityProperties::new();
        ok.script = Some("https://trusted.example/spin.js".into());
        assert!(!ok.filter_script_whitelist(&prefixes));
        assert!(ok.script.is_some());

        let mut bad = EntityProperties::new();
        bad.script = Some("https://sketchy.example/steal.js".into());
        assert!(bad.filter_script_whitelist(&prefixes));
        assert!(bad.script.is_none());

        // empty whitelist allows everything
        let mut any = EntityProperties::new();
        any.script = Some("https://anything.example/x.js".into());
        assert!(!any.filter_script_whitelist(&[]));
    }

    #[test]
    fn test_tmp_lifetime_cap() {
        let mut unlimited = EntityProperties::new();
        assert!(unlimited.cap_tmp_lifetime(3_600.0));
        assert_eq!(unlimited.lifetime, Some(3_600.0));

        let mut over = EntityProperties::new().with_lifetime(90_000.0);
        assert!(over.cap_tmp_lifetime(3_600.0));
        assert_eq!(over.lifetime, Some(3_600.0));

        let mut under = EntityProperties::new().with_lifetime(60.0);
        assert!(!under.cap_tmp_lifetime(3_600.0));
        assert_eq!(under.lifetime, Some(60.0));
    }

    #[test]
    fn test_host_type_strings() {
        assert_eq!(EntityHostType::from_string("avatar"), EntityHostType::AvatarLocal);
        assert_eq!(EntityHostType::from_string("LOCAL"), EntityHostType::Local);
        assert_eq!(EntityHostType::from_string("domain"), EntityHostType::Domain);
        assert_eq!(EntityHostType::from_string("junk"), EntityHostType::Domain);
        assert_eq!(EntityHostType::AvatarLocal.as_str(), "avatar");
    }

    #[test]
    fn test_serde_round_trips_partial_sets() {
        let props = EntityProperties::new()
            .with_name("ball")
            .with_kind(EntityKind::default_shape())
            .with_position(Vec3::new(1.0, 2.0, 3.0));

        // binary: positional encoding must preserve unset fields as unset
        let wire = bincode::serialize(&props).unwrap();
        let back: EntityProperties = bincode::deserialize(&wire).unwrap();
        assert_eq!(back, props);
        assert_eq!(back.locked, None);

        // json: documents missing whole fields still decode
        let thin: EntityProperties = serde_json::from_str(r#"{"name":"wall"}"#).unwrap();
        assert_eq!(thin.name.as_deref(), Some("wall"));
        assert_eq!(thin.position, None);
    }
}
