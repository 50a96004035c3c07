//! # Entity Registry
//!
//! The id→entity map beside the octree: O(1) lookup while the octree serves
//! spatial queries. Also maintains the parent→children reverse index used by
//! delete cascades and re-cube cascades.
//!
//! The registry and the octree always mutate together under the tree's write
//! lock; this type has no lock of its own.

use crate::entity::Entity;
use std::collections::HashMap;
use tracing::warn;
use weald_common::EntityId;

#[derive(Debug, Default)]
pub struct EntityStore {
    entities: HashMap<EntityId, Entity>,
    /// parent id → ids of children currently declaring it.
    children: HashMap<EntityId, Vec<EntityId>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entity. Double-insertion of an id is the one
    /// programming error here: fatal in debug builds, refused with a log in
    /// release.
    pub fn insert(&mut self, entity: Entity) -> bool {
        let id = entity.id;
        if self.entities.contains_key(&id) {
            debug_assert!(false, "registry already contains entity {id}");
            warn!("Refusing to re-insert entity {} into the registry", id);
            return false;
        }
        if entity.has_parent() {
            self.link_parent(id, entity.parent_id);
        }
        self.entities.insert(id, entity);
        true
    }

    /// Raw access, ignoring the null-element rule. Internal machinery only.
    pub fn get_raw(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_raw_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Public-lookup semantics: an entity with no containing element is
    /// treated as "does not exist".
    pub fn find(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id).filter(|e| e.in_tree())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        if entity.has_parent() {
            self.unlink_parent(id, entity.parent_id);
        }
        self.children.remove(&id);
        Some(entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    // ---- parent/child index ----

    pub fn link_parent(&mut self, child: EntityId, parent: EntityId) {
        if parent.is_null() {
            return;
        }
        let children = self.children.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn unlink_parent(&mut self, child: EntityId, parent: EntityId) {
        if parent.is_null() {
            return;
        }
        if let Some(children) = self.children.get_mut(&parent) {
            children.retain(|c| *c != child);
            if children.is_empty() {
                self.children.remove(&parent);
            }
        }
    }

    pub fn children_of(&self, id: EntityId) -> &[EntityId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Breadth-first descendants, nearest first. The starting id itself is
    /// not included.
    pub fn descendants_of(&self, id: EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            for child in self.children_of(current) {
                if !out.contains(child) {
                    out.push(*child);
                    queue.push_back(*child);
                }
            }
        }
        out
    }

    /// Walk the ancestor chain; `None` when some link is missing from the
    /// registry (the parent-fixup case), `Some(depth)` when it closes.
    pub fn resolve_ancestry(&self, id: EntityId) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.entities.get(&id)?.parent_id;
        while !current.is_null() {
            depth += 1;
            if depth > self.entities.len() {
                // parent cycle; treat as unresolved
                return None;
            }
            match self.entities.get(&current) {
                Some(parent) if parent.in_tree() => current = parent.parent_id,
                _ => return None,
            }
        }
        Some(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    fn entity(id: EntityId) -> Entity {
        Entity::new(id, EntityKind::default_shape(), 0)
    }

    #[test]
    fn test_insert() {
        let mut store = EntityStore::new();
        let id = EntityId::random();
        assert!(store.insert(entity(id)));
        assert!(store.contains(id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "registry already contains")]
    fn test_duplicate_insert_asserts_in_debug() {
        let mut store = EntityStore::new();
        let id = EntityId::random();
        store.insert(entity(id));
        store.insert(entity(id));
    }

    #[test]
    fn test_null_element_rule() {
        let mut store = EntityStore::new();
        let id = EntityId::random();
        store.insert(entity(id));
        // fresh entities have no element yet: raw sees them, find does not
        assert!(store.get_raw(id).is_some());
        assert!(store.find(id).is_none());
    }

    #[test]
    fn test_children_index() {
        let mut store = EntityStore::new();
        let parent = EntityId::random();
        let child_a = EntityId::random();
        let child_b = EntityId::random();
        let grandchild = EntityId::random();

        store.insert(entity(parent));
        let mut a = entity(child_a);
        a.parent_id = parent;
        store.insert(a);
        let mut b = entity(child_b);
        b.parent_id = parent;
        store.insert(b);
        let mut g = entity(grandchild);
        g.parent_id = child_a;
        store.insert(g);

        assert_eq!(store.children_of(parent).len(), 2);
        let descendants = store.descendants_of(parent);
        assert_eq!(descendants.len(), 3);
        assert!(descendants.contains(&grandchild));
        // nearest first
        assert!(descendants.iter().position(|d| *d == grandchild).unwrap() > 1);

        store.remove(child_a);
        assert_eq!(store.children_of(parent).len(), 1);
    }

    #[test]
    fn test_resolve_ancestry() {
        let mut store = EntityStore::new();
        let root = EntityId::random();
        let mid = EntityId::random();
        let leaf = EntityId::random();

        store.insert(entity(root));
        let mut m = entity(mid);
        m.parent_id = root;
        store.insert(m);
        let mut l = entity(leaf);
        l.parent_id = mid;
        store.insert(l);

        // parents exist but are not yet in the octree: unresolved
        assert!(store.resolve_ancestry(leaf).is_none());

        // pretend the tree placed them (element keys are opaque; reuse a real one)
        let mut octree = crate::element::Octree::new(64.0);
        let key = octree.ensure_best_fit(&weald_common::AACube::from_center(
            glam::Vec3::new(10.0, 10.0, 10.0),
            1.0,
        ));
        store.get_raw_mut(root).unwrap().element = Some(key);
        store.get_raw_mut(mid).unwrap().element = Some(key);
        assert_eq!(store.resolve_ancestry(leaf), Some(2));

        // no parent at all resolves at depth 0
        assert_eq!(store.resolve_ancestry(root), Some(0));
    }
}
