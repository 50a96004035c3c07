//! # Entity Record
//!
//! The in-tree representation of one entity: shared fields hoisted into
//! [`Entity`], per-kind payload behind the [`EntityKind`] tag. No class
//! hierarchy — behavior that varies by kind matches on the tag.

use crate::element::ElementKey;
use crate::properties::{CloneSpec, EntityHostType, EntityProperties, GrabProperties};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use weald_common::{AACube, AABox, EntityId, SessionId, SimulationOwner};

/// Fresh entities get a 10 cm cube until an edit says otherwise.
pub const DEFAULT_ENTITY_DIMENSIONS: Vec3 = Vec3::splat(0.1);

/// Sentinel for "not attached to any particular joint of the parent".
pub const NO_PARENT_JOINT: u16 = u16::MAX;

// ============================================================================
// Dirty Flags
// ============================================================================

/// Bits the tree sets on an entity to tell the physics simulation what must
/// be re-registered. Cleared by the simulation once it has caught up.
pub mod dirty {
    pub const TRANSFORM: u32 = 1 << 0;
    pub const VELOCITIES: u32 = 1 << 1;
    pub const SHAPE: u32 = 1 << 2;
    pub const LIFETIME: u32 = 1 << 3;
    pub const MOTION_TYPE: u32 = 1 << 4;
    pub const COLLISION_GROUP: u32 = 1 << 5;
    pub const SIMULATION_OWNER: u32 = 1 << 6;
    pub const PARENT: u32 = 1 << 7;

    /// Everything the physics engine cares about.
    pub const PHYSICS: u32 =
        TRANSFORM | VELOCITIES | SHAPE | MOTION_TYPE | COLLISION_GROUP | PARENT;
}

// ============================================================================
// Kind payloads
// ============================================================================

/// Inherit/override switch for zone-supplied environment components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComponentMode {
    #[default]
    Inherit,
    Disabled,
    Enabled,
}

impl ComponentMode {
    pub fn from_string(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disabled" => ComponentMode::Disabled,
            "enabled" => ComponentMode::Enabled,
            _ => ComponentMode::Inherit,
        }
    }
}

/// Primitive shapes for [`EntityKind::Shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShapeType {
    #[default]
    Cube,
    Sphere,
    Cylinder,
    Wedge,
}

impl ShapeType {
    pub fn from_string(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sphere" | "ball" => ShapeType::Sphere,
            "cylinder" => ShapeType::Cylinder,
            "wedge" => ShapeType::Wedge,
            _ => ShapeType::Cube,
        }
    }
}

/// The per-kind payload. An edit replaces the payload wholesale; shared
/// fields live on [`Entity`] / [`EntityProperties`] instead. Externally
/// tagged so the same derive serves both the JSON document and the bincode
/// wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    Shape {
        shape: ShapeType,
        color: [u8; 3],
    },
    Model {
        model_url: String,
    },
    Light {
        color: [u8; 3],
        intensity: f32,
        is_spotlight: bool,
    },
    Text {
        text: String,
        line_height: f32,
        text_color: [u8; 3],
    },
    Zone {
        flying_allowed: bool,
        ghosting_allowed: bool,
        key_light_mode: ComponentMode,
        ambient_light_mode: ComponentMode,
        skybox_mode: ComponentMode,
    },
    ParticleEffect {
        emit_rate: f32,
        emit_speed: f32,
        emit_dimensions: Vec3,
        emit_acceleration: Vec3,
        acceleration_spread: Vec3,
        particle_radius: f32,
    },
    Web {
        source_url: String,
        dpi: u16,
    },
    Image {
        image_url: String,
        emissive: bool,
    },
    Material {
        material_url: String,
        priority: u16,
        parent_material_name: String,
    },
}

impl EntityKind {
    /// Name used in logs, stats and the persisted document.
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityKind::Shape { .. } => "Shape",
            EntityKind::Model { .. } => "Model",
            EntityKind::Light { .. } => "Light",
            EntityKind::Text { .. } => "Text",
            EntityKind::Zone { .. } => "Zone",
            EntityKind::ParticleEffect { .. } => "ParticleEffect",
            EntityKind::Web { .. } => "Web",
            EntityKind::Image { .. } => "Image",
            EntityKind::Material { .. } => "Material",
        }
    }

    pub fn is_zone(&self) -> bool {
        matches!(self, EntityKind::Zone { .. })
    }

    /// A plain grey cube; the test suite's workhorse.
    pub fn default_shape() -> Self {
        EntityKind::Shape {
            shape: ShapeType::Cube,
            color: [200, 200, 200],
        }
    }
}

// ============================================================================
// Entity
// ============================================================================

/// One live entity. Owned by the tree's registry; the octree and all
/// parent/clone relations refer to it by id only.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: Option<String>,

    // ---- spatial ----
    pub position: Vec3,
    pub rotation: Quat,
    pub dimensions: Vec3,
    pub registration_point: Vec3,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub acceleration: Vec3,
    pub gravity: Vec3,
    /// Null id = no parent.
    pub parent_id: EntityId,
    pub parent_joint_index: u16,
    /// Octree key. Oversized and only re-derived when the entity escapes it,
    /// so small movements don't churn the index.
    pub query_aacube: AACube,

    // ---- lifecycle ----
    pub created: u64,
    pub last_edited: u64,
    /// Seconds from `created` until garbage collection; <= 0 = immortal.
    pub lifetime: f32,
    pub locked: bool,
    pub host_type: EntityHostType,
    pub simulation_owner: SimulationOwner,

    // ---- behavior ----
    pub visible: bool,
    pub collisionless: bool,
    pub dynamic: bool,
    pub script: Option<String>,
    pub user_data: Option<String>,
    pub material_data: Option<String>,
    pub grab: GrabProperties,

    // ---- marketplace ----
    pub certificate_id: Option<String>,
    pub static_certificate_version: u32,

    // ---- cloning ----
    pub clone: CloneSpec,
    /// Source entity this one was cloned from; null if original.
    pub clone_origin_id: EntityId,
    /// Non-owning back-references to live clones of this entity.
    pub clone_ids: Vec<EntityId>,

    // ---- tree bookkeeping ----
    /// Containing octree element. `None` means the entity is not reachable
    /// from the octree, and lookups must treat it as "does not exist".
    pub(crate) element: Option<ElementKey>,
    pub dirty_flags: u32,
}

impl Entity {
    pub fn new(id: EntityId, kind: EntityKind, now: u64) -> Self {
        let mut entity = Self {
            id,
            kind,
            name: None,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            dimensions: DEFAULT_ENTITY_DIMENSIONS,
            registration_point: Vec3::splat(0.5),
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            gravity: Vec3::ZERO,
            parent_id: EntityId::null(),
            parent_joint_index: NO_PARENT_JOINT,
            query_aacube: AACube::default(),
            created: now,
            last_edited: now,
            lifetime: 0.0,
            locked: false,
            host_type: EntityHostType::Domain,
            simulation_owner: SimulationOwner::default(),
            visible: true,
            collisionless: false,
            dynamic: false,
            script: None,
            user_data: None,
            material_data: None,
            grab: GrabProperties::default(),
            certificate_id: None,
            static_certificate_version: 0,
            clone: CloneSpec::default(),
            clone_origin_id: EntityId::null(),
            clone_ids: Vec::new(),
            element: None,
            dirty_flags: 0,
        };
        entity.query_aacube = entity.maximum_aacube();
        entity
    }

    /// Build from an add-edit. Requires a kind; a creation timestamp in the
    /// properties is kept (timestamped import), otherwise `now` is stamped.
    pub fn from_properties(id: EntityId, properties: &EntityProperties, now: u64) -> Option<Self> {
        let kind = properties.kind.clone()?;
        let created = properties.created.unwrap_or(now);
        let mut entity = Self::new(id, kind, created);
        entity.apply_properties(properties, now);
        entity.created = created;
        Some(entity)
    }

    /// Apply an already-filtered property set. Returns true when anything
    /// actually changed. Sets dirty flags for the simulation as a side
    /// effect; does not touch octree placement — that is the tree's job.
    pub fn apply_properties(&mut self, properties: &EntityProperties, now: u64) -> bool {
        let mut changed = false;

        macro_rules! apply {
            ($field:ident, $flag:expr) => {
                if let Some(value) = &properties.$field {
                    if self.$field != *value {
                        self.$field = value.clone();
                        self.dirty_flags |= $flag;
                        changed = true;
                    }
                }
            };
        }

        apply!(kind, dirty::SHAPE);
        apply!(position, dirty::TRANSFORM);
        apply!(rotation, dirty::TRANSFORM);
        apply!(dimensions, dirty::SHAPE | dirty::TRANSFORM);
        apply!(registration_point, dirty::TRANSFORM);
        apply!(velocity, dirty::VELOCITIES);
        apply!(angular_velocity, dirty::VELOCITIES);
        apply!(acceleration, dirty::VELOCITIES);
        apply!(gravity, dirty::VELOCITIES);
        apply!(parent_id, dirty::PARENT);
        apply!(parent_joint_index, dirty::PARENT);
        apply!(lifetime, dirty::LIFETIME);
        apply!(dynamic, dirty::MOTION_TYPE);
        apply!(collisionless, dirty::COLLISION_GROUP);

        if let Some(name) = &properties.name {
            if self.name.as_deref() != Some(name.as_str()) {
                self.name = Some(name.clone());
                changed = true;
            }
        }
        if let Some(owner) = &properties.simulation_owner {
            if self.simulation_owner != *owner {
                self.simulation_owner = *owner;
                self.dirty_flags |= dirty::SIMULATION_OWNER;
                changed = true;
            }
        }
        if let Some(locked) = properties.locked {
            if self.locked != locked {
                self.locked = locked;
                changed = true;
            }
        }
        if let Some(host_type) = properties.host_type {
            if self.host_type != host_type {
                self.host_type = host_type;
                changed = true;
            }
        }
        if let Some(visible) = properties.visible {
            if self.visible != visible {
                self.visible = visible;
                changed = true;
            }
        }
        if let Some(script) = &properties.script {
            if self.script.as_deref() != Some(script.as_str()) {
                self.script = Some(script.clone());
                changed = true;
            }
        }
        if let Some(user_data) = &properties.user_data {
            if self.user_data.as_deref() != Some(user_data.as_str()) {
                self.user_data = Some(user_data.clone());
                changed = true;
            }
        }
        if let Some(material_data) = &properties.material_data {
            if self.material_data.as_deref() != Some(material_data.as_str()) {
                self.material_data = Some(material_data.clone());
                changed = true;
            }
        }
        if let Some(grab) = &properties.grab {
            if self.grab != *grab {
                self.grab = *grab;
                changed = true;
            }
        }
        if let Some(certificate_id) = &properties.certificate_id {
            if self.certificate_id.as_deref() != Some(certificate_id.as_str()) {
                self.certificate_id = Some(certificate_id.clone());
                changed = true;
            }
        }
        if let Some(version) = properties.static_certificate_version {
            if self.static_certificate_version != version {
                self.static_certificate_version = version;
                changed = true;
            }
        }
        if let Some(clone) = &properties.clone {
            if self.clone != *clone {
                self.clone = *clone;
                changed = true;
            }
        }
        if let Some(origin) = properties.clone_origin_id {
            if self.clone_origin_id != origin {
                self.clone_origin_id = origin;
                changed = true;
            }
        }

        if let Some(cube) = properties.query_aacube {
            if self.query_aacube != cube {
                self.query_aacube = cube;
                changed = true;
            }
        } else if changed && !self.query_aacube.contains_cube(&self.maximum_aacube()) {
            // the entity escaped its declared cube; re-derive
            self.query_aacube = self.maximum_aacube();
        }

        if changed {
            self.last_edited = properties.last_edited.unwrap_or(now);
        }
        changed
    }

    /// Full snapshot as a property set (persistence, cloning).
    pub fn to_properties(&self) -> EntityProperties {
        EntityProperties {
            name: self.name.clone(),
            kind: Some(self.kind.clone()),
            position: Some(self.position),
            rotation: Some(self.rotation),
            dimensions: Some(self.dimensions),
            registration_point: Some(self.registration_point),
            velocity: Some(self.velocity),
            angular_velocity: Some(self.angular_velocity),
            acceleration: Some(self.acceleration),
            gravity: Some(self.gravity),
            parent_id: (!self.parent_id.is_null()).then_some(self.parent_id),
            parent_joint_index: (self.parent_joint_index != NO_PARENT_JOINT)
                .then_some(self.parent_joint_index),
            query_aacube: Some(self.query_aacube),
            created: Some(self.created),
            last_edited: Some(self.last_edited),
            lifetime: Some(self.lifetime),
            locked: Some(self.locked),
            host_type: Some(self.host_type),
            simulation_owner: (!self.simulation_owner.is_null()).then_some(self.simulation_owner),
            visible: Some(self.visible),
            collisionless: Some(self.collisionless),
            dynamic: Some(self.dynamic),
            script: self.script.clone(),
            user_data: self.user_data.clone(),
            material_data: self.material_data.clone(),
            grab: Some(self.grab),
            certificate_id: self.certificate_id.clone(),
            static_certificate_version: (self.static_certificate_version != 0)
                .then_some(self.static_certificate_version),
            clone: Some(self.clone),
            clone_origin_id: (!self.clone_origin_id.is_null()).then_some(self.clone_origin_id),
        }
    }

    /// Properties for a clone of this entity: certificate stripped, clone
    /// lifetime/dynamics applied, back-reference recorded.
    pub fn clone_properties(&self, cloned_by: SessionId) -> EntityProperties {
        let mut properties = self.to_properties();
        properties.certificate_id = None;
        properties.static_certificate_version = None;
        properties.created = None;
        properties.last_edited = None;
        properties.lifetime = Some(self.clone.clone_lifetime);
        properties.dynamic = Some(self.clone.clone_dynamic);
        properties.clone = Some(CloneSpec {
            cloneable: false,
            ..self.clone
        });
        properties.clone_origin_id = Some(self.id);
        if self.clone.clone_avatar_entity {
            properties.host_type = Some(EntityHostType::AvatarLocal);
            properties.parent_id = Some(EntityId(cloned_by.0));
        }
        properties
    }

    // ---- derived geometry ----

    /// Half-diagonal sphere radius: covers the dimensions box under any
    /// rotation.
    pub fn bounding_radius(&self) -> f32 {
        0.5 * self.dimensions.length()
    }

    /// World-space center of the dimensions box, honoring the registration
    /// point and rotation.
    pub fn world_center(&self) -> Vec3 {
        let offset = (Vec3::splat(0.5) - self.registration_point) * self.dimensions;
        self.position + self.rotation * offset
    }

    /// The largest cube this entity can occupy under any rotation; the
    /// query cube must always contain it.
    pub fn maximum_aacube(&self) -> AACube {
        AACube::from_center(self.world_center(), 2.0 * self.bounding_radius())
    }

    /// Tight world bounds; falls back to the rotation-safe cube's box when
    /// the entity is rotated.
    pub fn world_aabox(&self) -> AABox {
        if self.rotation.abs_diff_eq(Quat::IDENTITY, 1e-5) {
            AABox::from_center(self.world_center(), self.dimensions)
        } else {
            let cube = self.maximum_aacube();
            AABox::new(cube.corner, Vec3::splat(cube.scale))
        }
    }

    /// True when the declared query cube no longer covers the entity.
    pub fn needs_new_query_cube(&self) -> bool {
        !self.query_aacube.contains_cube(&self.maximum_aacube())
    }

    /// Re-derive the query cube from current extents.
    pub fn refresh_query_aacube(&mut self) {
        self.query_aacube = self.maximum_aacube();
    }

    // ---- lifecycle ----

    pub fn is_immortal(&self) -> bool {
        self.lifetime <= 0.0
    }

    /// Epoch usec at which the lifetime runs out; `u64::MAX` if immortal.
    pub fn expiry_usec(&self) -> u64 {
        if self.is_immortal() {
            u64::MAX
        } else {
            self.created + weald_common::secs_to_usec(self.lifetime)
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        !self.is_immortal() && now >= self.expiry_usec()
    }

    pub fn has_parent(&self) -> bool {
        !self.parent_id.is_null()
    }

    pub fn is_moving(&self) -> bool {
        self.velocity.length_squared() > 0.0 || self.angular_velocity.length_squared() > 0.0
    }

    /// Simulated = the physics engine owns a body for it.
    pub fn is_simulated(&self) -> bool {
        self.dynamic || self.is_moving()
    }

    pub fn in_tree(&self) -> bool {
        self.element.is_some()
    }

    pub fn clear_simulation_owner(&mut self) {
        if !self.simulation_owner.is_null() {
            self.simulation_owner.clear();
            self.dirty_flags |= dirty::SIMULATION_OWNER;
        }
    }

    pub fn clear_dirty_flags(&mut self) {
        self.dirty_flags = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape_at(position: Vec3, dimensions: Vec3) -> Entity {
        let mut entity = Entity::new(EntityId::random(), EntityKind::default_shape(), 1_000);
        entity.position = position;
        entity.dimensions = dimensions;
        entity.refresh_query_aacube();
        entity
    }

    #[test]
    fn test_new_entity_defaults() {
        let entity = Entity::new(EntityId::random(), EntityKind::default_shape(), 5_000);
        assert_eq!(entity.created, 5_000);
        assert_eq!(entity.dimensions, DEFAULT_ENTITY_DIMENSIONS);
        assert!(entity.is_immortal());
        assert!(!entity.has_parent());
        assert!(!entity.in_tree());
        assert!(entity.query_aacube.contains_cube(&entity.maximum_aacube()));
    }

    #[test]
    fn test_from_properties_requires_kind() {
        let props = EntityProperties::new().with_position(Vec3::ONE);
        assert!(Entity::from_properties(EntityId::random(), &props, 0).is_none());

        let props = props.with_kind(EntityKind::default_shape());
        let entity = Entity::from_properties(EntityId::random(), &props, 7).unwrap();
        assert_eq!(entity.position, Vec3::ONE);
        assert_eq!(entity.created, 7);
    }

    #[test]
    fn test_created_preserved_on_import() {
        let props = EntityProperties {
            created: Some(123),
            ..EntityProperties::new().with_kind(EntityKind::default_shape())
        };
        let entity = Entity::from_properties(EntityId::random(), &props, 999).unwrap();
        assert_eq!(entity.created, 123);
    }

    #[test]
    fn test_apply_properties_reports_change_and_dirt() {
        let mut entity = shape_at(Vec3::ZERO, Vec3::ONE);
        entity.clear_dirty_flags();

        let unchanged = EntityProperties::new().with_position(Vec3::ZERO);
        assert!(!entity.apply_properties(&unchanged, 2_000));
        assert_eq!(entity.dirty_flags, 0);

        let moved = EntityProperties::new().with_position(Vec3::new(5.0, 0.0, 0.0));
        assert!(entity.apply_properties(&moved, 2_000));
        assert_ne!(entity.dirty_flags & dirty::TRANSFORM, 0);
        assert_eq!(entity.last_edited, 2_000);
    }

    #[test]
    fn test_query_cube_stability() {
        let mut entity = shape_at(Vec3::ZERO, Vec3::ONE);
        let cube_before = entity.query_aacube;

        // a nudge inside the oversized cube does not re-derive it
        let nudge = EntityProperties::new().with_position(Vec3::new(0.05, 0.0, 0.0));
        entity.apply_properties(&nudge, 10);
        assert_eq!(entity.query_aacube, cube_before);

        // a jump outside does
        let jump = EntityProperties::new().with_position(Vec3::new(50.0, 0.0, 0.0));
        entity.apply_properties(&jump, 20);
        assert_ne!(entity.query_aacube, cube_before);
        assert!(entity.query_aacube.contains_cube(&entity.maximum_aacube()));
    }

    #[test]
    fn test_lifetime_expiry() {
        let mut entity = shape_at(Vec3::ZERO, Vec3::ONE);
        entity.created = 1_000_000;
        entity.lifetime = 2.0;
        assert!(!entity.is_expired(2_000_000));
        assert!(entity.is_expired(3_000_000));
        assert_eq!(entity.expiry_usec(), 3_000_000);
    }

    #[test]
    fn test_round_trip_through_properties() {
        let mut entity = shape_at(Vec3::new(1.0, 2.0, 3.0), Vec3::new(2.0, 1.0, 0.5));
        entity.name = Some("crate".into());
        entity.locked = true;
        entity.lifetime = 60.0;
        let copy = Entity::from_properties(entity.id, &entity.to_properties(), 0).unwrap();
        assert_eq!(copy.name.as_deref(), Some("crate"));
        assert_eq!(copy.position, entity.position);
        assert_eq!(copy.dimensions, entity.dimensions);
        assert!(copy.locked);
        assert_eq!(copy.lifetime, 60.0);
        assert_eq!(copy.created, entity.created);
    }

    #[test]
    fn test_clone_properties_strip_certificate() {
        let mut source = shape_at(Vec3::ZERO, Vec3::ONE);
        source.certificate_id = Some("cert-123".into());
        source.clone.cloneable = true;
        source.clone.clone_lifetime = 30.0;
        source.clone.clone_dynamic = true;

        let session = SessionId::random();
        let clone_props = source.clone_properties(session);
        assert!(clone_props.certificate_id.is_none());
        assert_eq!(clone_props.lifetime, Some(30.0));
        assert_eq!(clone_props.dynamic, Some(true));
        assert_eq!(clone_props.clone_origin_id, Some(source.id));
        assert_eq!(clone_props.clone.unwrap().cloneable, false);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EntityKind::default_shape().type_name(), "Shape");
        assert!(EntityKind::Zone {
            flying_allowed: true,
            ghosting_allowed: true,
            key_light_mode: ComponentMode::Inherit,
            ambient_light_mode: ComponentMode::Inherit,
            skybox_mode: ComponentMode::Inherit,
        }
        .is_zone());
    }
}
