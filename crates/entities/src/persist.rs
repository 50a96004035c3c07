//! # Persisted Documents
//!
//! The tree's on-disk form: a JSON document holding the data version, a
//! document id, the full entity list and the named-viewpoint table. Loading
//! migrates older versions in place before typed decoding, so the decoder
//! only ever sees the current schema.
//!
//! Version history:
//! - v1: host rules carried as a `clientOnly` boolean; grab, material and
//!   clone settings embedded as JSON inside `user_data`
//! - v2 (current): `host_type` enum; `grab`, `material_data` and `clone`
//!   are first-class property groups
//!
//! Clone back-references (`clone_ids`) are derived state and never
//! persisted; repopulation rebuilds them by adding originals before their
//! clones.

use crate::error::{EntityError, EntityResult};
use crate::properties::{CloneSpec, EntityProperties, GrabProperties};
use crate::tree::EntityTree;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;
use weald_common::EntityId;

pub const CURRENT_DATA_VERSION: u32 = 2;

// ============================================================================
// Document types
// ============================================================================

/// A named viewpoint ("path") users can jump to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewpointPath {
    pub position: Vec3,
    pub rotation: Quat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub properties: EntityProperties,
}

/// The persisted tree: everything needed to reconstruct the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDocument {
    pub data_version: u32,
    /// Stable identity of this document across saves.
    pub id: Uuid,
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub paths: BTreeMap<String, ViewpointPath>,
}

impl TreeDocument {
    /// Snapshot every live entity. Records are sorted by id so that saves of
    /// the same world diff cleanly.
    pub fn capture(tree: &EntityTree) -> Self {
        let mut entities = Vec::with_capacity(tree.entity_count());
        tree.for_each_entity(|entity| {
            entities.push(EntityRecord {
                id: entity.id,
                properties: entity.to_properties(),
            });
        });
        entities.sort_by_key(|record| record.id.0);
        Self {
            data_version: CURRENT_DATA_VERSION,
            id: Uuid::new_v4(),
            entities,
            paths: BTreeMap::new(),
        }
    }

    pub fn save(&self, path: &Path) -> EntityResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(
            "Saved {} entities to {}",
            self.entities.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> EntityResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
    }

    /// Decode a document, migrating older data versions first.
    pub fn from_json(bytes: &[u8]) -> EntityResult<Self> {
        let raw: Value = serde_json::from_slice(bytes)?;
        let migrated = migrate_document(raw)?;
        let document: TreeDocument = serde_json::from_value(migrated)?;
        Ok(document)
    }

    /// Add every record to `tree`. Originals go in before their clones so
    /// the add path rebuilds clone back-references; clones whose origin
    /// never appears (deleted in an earlier session) are added as-is.
    /// Returns how many entities made it in.
    pub fn populate(&self, tree: &EntityTree) -> usize {
        let mut added = 0;
        let mut pending: Vec<&EntityRecord> = Vec::new();
        for record in &self.entities {
            if record.properties.clone_origin_id.is_some() {
                pending.push(record);
            } else if add_record(tree, record) {
                added += 1;
            }
        }

        let mut made_progress = true;
        while made_progress && !pending.is_empty() {
            made_progress = false;
            let candidates = std::mem::take(&mut pending);
            for record in candidates {
                let origin_present = record
                    .properties
                    .clone_origin_id
                    .is_none_or(|origin| tree.find_entity(origin).is_some());
                if origin_present {
                    if add_record(tree, record) {
                        added += 1;
                    }
                    made_progress = true;
                } else {
                    pending.push(record);
                }
            }
        }
        for record in pending {
            if add_record(tree, record) {
                added += 1;
            }
        }

        info!("Loaded {} of {} entities", added, self.entities.len());
        added
    }
}

fn add_record(tree: &EntityTree, record: &EntityRecord) -> bool {
    match tree.add_entity(record.id, &record.properties) {
        Ok(_) => true,
        Err(error) => {
            warn!("Skipping entity {} from document: {}", record.id, error);
            false
        }
    }
}

// ============================================================================
// Migrations
// ============================================================================

fn migrate_document(mut document: Value) -> EntityResult<Value> {
    let Some(root) = document.as_object_mut() else {
        return Err(EntityError::malformed("document root is not an object"));
    };
    let version = root
        .get("data_version")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    if version > CURRENT_DATA_VERSION {
        return Err(EntityError::UnsupportedVersion(version));
    }
    if version < 2 {
        info!("Migrating document from data version {}", version);
        if let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) {
            for record in entities.iter_mut() {
                if let Some(properties) =
                    record.get_mut("properties").and_then(Value::as_object_mut)
                {
                    migrate_v1_properties(properties);
                }
            }
        }
        root.insert("data_version".to_string(), json!(CURRENT_DATA_VERSION));
    }
    Ok(document)
}

/// v1 → v2 on one entity's raw property map.
fn migrate_v1_properties(properties: &mut Map<String, Value>) {
    // clientOnly boolean becomes the host-type enum
    if let Some(flag) = properties.remove("clientOnly") {
        if let Some(client_only) = flag.as_bool() {
            let host_type = if client_only { "AvatarLocal" } else { "Domain" };
            properties.insert("host_type".to_string(), json!(host_type));
        }
    }

    // grab/material/clone settings ride inside the user_data JSON string
    let Some(user_data) = properties.get("user_data").and_then(Value::as_str) else {
        return;
    };
    let Ok(Value::Object(mut embedded)) = serde_json::from_str::<Value>(user_data) else {
        return;
    };

    if let Some(grab_value) = embedded.remove("grabbableKey") {
        if let Ok(Value::Object(mut grab)) = serde_json::to_value(GrabProperties::default()) {
            if let Some(b) = grab_value.get("grabbable").and_then(Value::as_bool) {
                grab.insert("grabbable".to_string(), json!(b));
            }
            if let Some(b) = grab_value.get("kinematic").and_then(Value::as_bool) {
                grab.insert("grab_kinematic".to_string(), json!(b));
            }
            if let Some(b) = grab_value.get("triggerable").and_then(Value::as_bool) {
                grab.insert("triggerable".to_string(), json!(b));
            }
            if let Some(b) = grab_value.get("equippable").and_then(Value::as_bool) {
                grab.insert("equippable".to_string(), json!(b));
            }
            properties.insert("grab".to_string(), Value::Object(grab));
        }
    }

    if let Some(material) = embedded.remove("materialData") {
        let text = match material {
            Value::String(s) => s,
            other => other.to_string(),
        };
        properties.insert("material_data".to_string(), json!(text));
    }

    if embedded.contains_key("cloneable") {
        if let Ok(Value::Object(mut clone)) = serde_json::to_value(CloneSpec::default()) {
            if let Some(b) = embedded.remove("cloneable").and_then(|v| v.as_bool()) {
                clone.insert("cloneable".to_string(), json!(b));
            }
            if let Some(n) = embedded.remove("cloneLifetime").and_then(|v| v.as_f64()) {
                clone.insert("clone_lifetime".to_string(), json!(n));
            }
            if let Some(n) = embedded.remove("cloneLimit").and_then(|v| v.as_u64()) {
                clone.insert("clone_limit".to_string(), json!(n));
            }
            if let Some(b) = embedded.remove("cloneDynamic").and_then(|v| v.as_bool()) {
                clone.insert("clone_dynamic".to_string(), json!(b));
            }
            if let Some(b) = embedded.remove("cloneAvatarEntity").and_then(|v| v.as_bool()) {
                clone.insert("clone_avatar_entity".to_string(), json!(b));
            }
            properties.insert("clone".to_string(), Value::Object(clone));
        }
    }

    // whatever the user actually put in user_data stays there
    if embedded.is_empty() {
        properties.insert("user_data".to_string(), Value::Null);
    } else {
        properties.insert(
            "user_data".to_string(),
            json!(Value::Object(embedded).to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::entity::{EntityKind, ShapeType};
    use crate::properties::EntityHostType;

    fn server_tree() -> EntityTree {
        EntityTree::new(TreeConfig::server().with_domain_scale(1_024.0))
    }

    fn shape_props(position: Vec3) -> EntityProperties {
        EntityProperties::new()
            .with_kind(EntityKind::default_shape())
            .with_position(position)
            .with_dimensions(Vec3::ONE)
    }

    #[test]
    fn test_document_round_trip() {
        let tree = server_tree();
        let parent = EntityId::random();
        let child = EntityId::random();
        let lamp = EntityId::random();
        tree.add_entity(
            parent,
            &shape_props(Vec3::new(2.0, 0.0, 0.0))
                .with_name("table")
                .with_locked(true)
                .with_certificate_id("cert-table"),
        )
        .unwrap();
        tree.add_entity(
            child,
            &shape_props(Vec3::new(2.0, 1.0, 0.0)).with_parent(parent),
        )
        .unwrap();
        tree.add_entity(
            lamp,
            &EntityProperties::new()
                .with_kind(EntityKind::Light {
                    color: [255, 240, 220],
                    intensity: 1.5,
                    is_spotlight: false,
                })
                .with_position(Vec3::new(0.0, 3.0, 0.0)),
        )
        .unwrap();

        let mut document = TreeDocument::capture(&tree);
        document.paths.insert(
            "spawn".to_string(),
            ViewpointPath {
                position: Vec3::new(0.0, 1.0, 5.0),
                rotation: Quat::IDENTITY,
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.json");
        document.save(&path).unwrap();

        let loaded = TreeDocument::load(&path).unwrap();
        assert_eq!(loaded.data_version, CURRENT_DATA_VERSION);
        assert_eq!(loaded.id, document.id);
        assert_eq!(loaded.entities.len(), 3);
        assert_eq!(loaded.paths["spawn"].position, Vec3::new(0.0, 1.0, 5.0));

        let restored = server_tree();
        assert_eq!(loaded.populate(&restored), 3);
        let table = restored.find_entity(parent).unwrap();
        assert_eq!(table.name.as_deref(), Some("table"));
        assert!(table.locked);
        assert_eq!(table.certificate_id.as_deref(), Some("cert-table"));
        assert_eq!(restored.find_entity(child).unwrap().parent_id, parent);
        assert!(matches!(
            restored.find_entity(lamp).unwrap().kind,
            EntityKind::Light { is_spotlight: false, .. }
        ));
    }

    #[test]
    fn test_populate_rebuilds_clone_references() {
        let tree = server_tree();
        let source = EntityId::random();
        let clone = EntityId::random();
        let mut props = shape_props(Vec3::ZERO);
        props.clone = Some(CloneSpec {
            cloneable: true,
            ..CloneSpec::default()
        });
        tree.add_entity(source, &props).unwrap();
        let clone_props = tree.find_entity(source).unwrap().clone_properties(
            weald_common::SessionId::random(),
        );
        tree.add_entity(clone, &clone_props).unwrap();

        let mut document = TreeDocument::capture(&tree);
        // stress the ordering pass: clone record first
        document.entities.reverse();
        if document.entities[0].properties.clone_origin_id.is_none() {
            document.entities.reverse();
        }

        let restored = server_tree();
        assert_eq!(document.populate(&restored), 2);
        assert_eq!(restored.find_entity(source).unwrap().clone_ids, vec![clone]);
        assert_eq!(restored.find_entity(clone).unwrap().clone_origin_id, source);
    }

    #[test]
    fn test_v1_migration() {
        let entity_id = EntityId::random();
        let doc_id = Uuid::new_v4();
        let user_data = r#"{"grabbableKey":{"grabbable":false,"kinematic":false},"cloneable":true,"cloneLimit":4,"note":"keep me"}"#;
        let v1 = json!({
            "data_version": 1,
            "id": doc_id,
            "entities": [{
                "id": entity_id,
                "properties": {
                    "kind": { "Shape": { "shape": "Cube", "color": [10, 20, 30] } },
                    "clientOnly": true,
                    "user_data": user_data,
                }
            }],
        });

        let document = TreeDocument::from_json(v1.to_string().as_bytes()).unwrap();
        assert_eq!(document.data_version, CURRENT_DATA_VERSION);
        let properties = &document.entities[0].properties;
        assert_eq!(properties.host_type, Some(EntityHostType::AvatarLocal));

        let grab = properties.grab.unwrap();
        assert!(!grab.grabbable);
        assert!(!grab.grab_kinematic);
        assert!(grab.grab_follows_controller); // untouched default

        let clone = properties.clone.unwrap();
        assert!(clone.cloneable);
        assert_eq!(clone.clone_limit, 4);
        assert_eq!(clone.clone_lifetime, CloneSpec::default().clone_lifetime);

        // only the hoisted keys leave user_data
        assert_eq!(properties.user_data.as_deref(), Some(r#"{"note":"keep me"}"#));
        assert!(matches!(
            properties.kind,
            Some(EntityKind::Shape { shape: ShapeType::Cube, .. })
        ));
    }

    #[test]
    fn test_v1_material_hoist_and_empty_user_data() {
        let v1 = json!({
            "data_version": 1,
            "id": Uuid::new_v4(),
            "entities": [{
                "id": EntityId::random(),
                "properties": {
                    "kind": { "Shape": { "shape": "Sphere", "color": [0, 0, 0] } },
                    "clientOnly": false,
                    "user_data": r#"{"materialData":{"albedo":[1.0,0.5,0.5]}}"#,
                }
            }],
        });

        let document = TreeDocument::from_json(v1.to_string().as_bytes()).unwrap();
        let properties = &document.entities[0].properties;
        assert_eq!(properties.host_type, Some(EntityHostType::Domain));
        assert_eq!(
            properties.material_data.as_deref(),
            Some(r#"{"albedo":[1.0,0.5,0.5]}"#)
        );
        // everything was hoisted, so user_data empties out
        assert_eq!(properties.user_data, None);
    }

    #[test]
    fn test_version_and_shape_errors() {
        let future = json!({ "data_version": 99, "id": Uuid::new_v4(), "entities": [] });
        assert!(matches!(
            TreeDocument::from_json(future.to_string().as_bytes()),
            Err(EntityError::UnsupportedVersion(99))
        ));

        assert!(matches!(
            TreeDocument::from_json(b"[1,2,3]"),
            Err(EntityError::MalformedDocument(_))
        ));

        assert!(matches!(
            TreeDocument::from_json(b"not json at all"),
            Err(EntityError::Json(_))
        ));
    }

    #[test]
    fn test_populate_skips_duplicate_ids() {
        let id = EntityId::random();
        let record = EntityRecord {
            id,
            properties: shape_props(Vec3::ZERO),
        };
        let document = TreeDocument {
            data_version: CURRENT_DATA_VERSION,
            id: Uuid::new_v4(),
            entities: vec![record.clone(), record],
            paths: BTreeMap::new(),
        };
        let tree = server_tree();
        assert_eq!(document.populate(&tree), 1);
        assert_eq!(tree.entity_count(), 1);
    }
}
