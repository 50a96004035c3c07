//! # Tree Operators
//!
//! The structural mutations of the octree, each an operator over
//! `(octree, registry)`: place a new entity, re-home a moved one, tear a
//! batch of them out. Operators keep the two structures consistent — the
//! entity's element back-handle always names the element listing it — and
//! prune emptied branches behind themselves.

use crate::element::Octree;
use crate::entity::Entity;
use crate::registry::EntityStore;
use tracing::warn;
use weald_common::{AACube, EntityId};

// ============================================================================
// Add
// ============================================================================

/// Places one just-registered entity into the octree at the best-fit element
/// for its query cube.
pub struct AddEntityOperator {
    id: EntityId,
    cube: AACube,
}

impl AddEntityOperator {
    pub fn new(id: EntityId, cube: AACube) -> Self {
        Self { id, cube }
    }

    pub fn apply(self, octree: &mut Octree, store: &mut EntityStore) -> bool {
        let Some(entity) = store.get_raw_mut(self.id) else {
            warn!("Add operator: entity {} is not registered", self.id);
            return false;
        };
        let element = octree.ensure_best_fit(&self.cube);
        octree.add_entity(element, self.id);
        entity.element = Some(element);
        true
    }
}

// ============================================================================
// Update (move)
// ============================================================================

/// Re-homes an entity whose query cube changed. Knows both cubes so it can
/// skip all octree work when the best-fit element stays the same.
pub struct UpdateEntityOperator {
    id: EntityId,
    new_cube: AACube,
}

impl UpdateEntityOperator {
    pub fn new(id: EntityId, new_cube: AACube) -> Self {
        Self { id, new_cube }
    }

    pub fn apply(self, octree: &mut Octree, store: &mut EntityStore) -> bool {
        let Some(entity) = store.get_raw(self.id) else {
            warn!("Update operator: entity {} is not registered", self.id);
            return false;
        };
        let Some(old_element) = entity.element else {
            // not in the octree; nothing to move
            return false;
        };
        let new_element = octree.ensure_best_fit(&self.new_cube);
        if new_element == old_element {
            return true;
        }
        if !octree.remove_entity(old_element, self.id) {
            warn!(
                "Update operator: entity {} missing from its recorded element",
                self.id
            );
        }
        octree.add_entity(new_element, self.id);
        if let Some(entity) = store.get_raw_mut(self.id) {
            entity.element = Some(new_element);
        }
        octree.prune_upward(old_element);
        true
    }
}

// ============================================================================
// Delete
// ============================================================================

/// Removes a batch of entities from octree and registry in one sweep,
/// returning the removed records for post-processing (simulation teardown,
/// deletion bookkeeping). Ids that resolve to nothing are skipped silently —
/// deletion is idempotent.
pub struct DeleteEntitiesOperator {
    ids: Vec<EntityId>,
}

impl DeleteEntitiesOperator {
    pub fn new(ids: Vec<EntityId>) -> Self {
        Self { ids }
    }

    pub fn apply(self, octree: &mut Octree, store: &mut EntityStore) -> Vec<Entity> {
        let mut removed = Vec::with_capacity(self.ids.len());
        for id in self.ids {
            let Some(mut entity) = store.remove(id) else {
                continue;
            };
            if let Some(element) = entity.element.take() {
                octree.remove_entity(element, id);
                octree.prune_upward(element);
            }
            removed.push(entity);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use glam::Vec3;

    fn make_world() -> (Octree, EntityStore) {
        (Octree::new(1_024.0), EntityStore::new())
    }

    fn spawn(store: &mut EntityStore, position: Vec3) -> EntityId {
        let id = EntityId::random();
        let mut entity = Entity::new(id, EntityKind::default_shape(), 0);
        entity.position = position;
        entity.dimensions = Vec3::ONE;
        entity.refresh_query_aacube();
        store.insert(entity);
        id
    }

    #[test]
    fn test_add_then_lookup() {
        let (mut octree, mut store) = make_world();
        let id = spawn(&mut store, Vec3::new(100.0, 0.0, -50.0));
        let cube = store.get_raw(id).unwrap().query_aacube;

        assert!(AddEntityOperator::new(id, cube).apply(&mut octree, &mut store));
        let entity = store.find(id).expect("placed entity is findable");
        let element = entity.element.unwrap();
        assert!(octree.get(element).unwrap().entities.contains(&id));
    }

    #[test]
    fn test_add_unregistered_fails() {
        let (mut octree, mut store) = make_world();
        let op = AddEntityOperator::new(EntityId::random(), AACube::default());
        assert!(!op.apply(&mut octree, &mut store));
    }

    #[test]
    fn test_update_moves_between_elements() {
        let (mut octree, mut store) = make_world();
        let id = spawn(&mut store, Vec3::new(100.0, 100.0, 100.0));
        let cube = store.get_raw(id).unwrap().query_aacube;
        AddEntityOperator::new(id, cube).apply(&mut octree, &mut store);
        let old_element = store.get_raw(id).unwrap().element.unwrap();

        // move across the domain
        {
            let entity = store.get_raw_mut(id).unwrap();
            entity.position = Vec3::new(-200.0, -200.0, -200.0);
            entity.refresh_query_aacube();
        }
        let new_cube = store.get_raw(id).unwrap().query_aacube;
        assert!(UpdateEntityOperator::new(id, new_cube).apply(&mut octree, &mut store));

        let new_element = store.get_raw(id).unwrap().element.unwrap();
        assert_ne!(new_element, old_element);
        assert!(octree.get(new_element).unwrap().entities.contains(&id));
        // the vacated branch was pruned
        assert!(octree.get(old_element).is_none());
    }

    #[test]
    fn test_update_same_element_is_cheap() {
        let (mut octree, mut store) = make_world();
        let id = spawn(&mut store, Vec3::new(100.0, 100.0, 100.0));
        let cube = store.get_raw(id).unwrap().query_aacube;
        AddEntityOperator::new(id, cube).apply(&mut octree, &mut store);
        let element = store.get_raw(id).unwrap().element.unwrap();
        let count = octree.element_count();

        assert!(UpdateEntityOperator::new(id, cube).apply(&mut octree, &mut store));
        assert_eq!(store.get_raw(id).unwrap().element.unwrap(), element);
        assert_eq!(octree.element_count(), count);
    }

    #[test]
    fn test_delete_batch_idempotent() {
        let (mut octree, mut store) = make_world();
        let a = spawn(&mut store, Vec3::new(10.0, 10.0, 10.0));
        let b = spawn(&mut store, Vec3::new(-10.0, 4.0, 3.0));
        for id in [a, b] {
            let cube = store.get_raw(id).unwrap().query_aacube;
            AddEntityOperator::new(id, cube).apply(&mut octree, &mut store);
        }

        let removed = DeleteEntitiesOperator::new(vec![a, b, EntityId::random()])
            .apply(&mut octree, &mut store);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 0);
        assert_eq!(octree.element_count(), 1);

        // deleting again finds nothing and does not disturb the tree
        let removed = DeleteEntitiesOperator::new(vec![a]).apply(&mut octree, &mut store);
        assert!(removed.is_empty());
    }
}
