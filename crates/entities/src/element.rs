//! # Octree Elements
//!
//! The spatial half of the tree: arena-allocated octree cells addressed by
//! generation-checked handles. An element owns the *ids* of the entities
//! whose query cube fits its cell; entity records themselves live in the
//! registry. Elements split on demand when an entity descends into them and
//! are pruned as soon as they hold neither entities nor children.

use glam::Vec3;
use weald_common::{AACube, EntityId};

/// Cells never subdivide below this edge length; entities smaller than a
/// leaf simply share it.
pub const MIN_ELEMENT_SCALE: f32 = 0.5;

// ============================================================================
// Handles
// ============================================================================

/// Generation-checked handle to an element slot. Stale handles (outliving a
/// prune) simply resolve to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementKey {
    index: u32,
    generation: u32,
}

// ============================================================================
// Element
// ============================================================================

/// One octree cell.
#[derive(Debug, Clone)]
pub struct Element {
    pub cube: AACube,
    pub parent: Option<ElementKey>,
    /// Child octants, indexed by [`AACube::octant_of`] bits.
    pub children: [Option<ElementKey>; 8],
    /// Entities whose query cube best-fits this cell.
    pub entities: Vec<EntityId>,
}

impl Element {
    fn new(cube: AACube, parent: Option<ElementKey>) -> Self {
        Self {
            cube,
            parent,
            children: [None; 8],
            entities: Vec::new(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(|c| c.is_none())
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.is_leaf()
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    element: Option<Element>,
}

/// Flat slot storage for elements; freed slots are recycled with a bumped
/// generation so outstanding handles can't alias a new element.
#[derive(Debug, Default)]
pub struct ElementArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ElementArena {
    fn insert(&mut self, element: Element) -> ElementKey {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.element = Some(element);
            ElementKey {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                element: Some(element),
            });
            ElementKey {
                index,
                generation: 0,
            }
        }
    }

    fn remove(&mut self, key: ElementKey) -> Option<Element> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation || slot.element.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        slot.element.take()
    }

    pub fn get(&self, key: ElementKey) -> Option<&Element> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.element.as_ref()
    }

    pub fn get_mut(&mut self, key: ElementKey) -> Option<&mut Element> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.element.as_mut()
    }

    /// Live element count.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Octree
// ============================================================================

/// The octree proper: an arena plus a root covering the whole domain.
#[derive(Debug)]
pub struct Octree {
    arena: ElementArena,
    root: ElementKey,
}

impl Octree {
    /// Root cube is centered on the origin with edge `domain_scale`.
    pub fn new(domain_scale: f32) -> Self {
        let mut arena = ElementArena::default();
        let root_cube = AACube::from_center(Vec3::ZERO, domain_scale);
        let root = arena.insert(Element::new(root_cube, None));
        Self { arena, root }
    }

    pub fn root(&self) -> ElementKey {
        self.root
    }

    pub fn get(&self, key: ElementKey) -> Option<&Element> {
        self.arena.get(key)
    }

    pub fn get_mut(&mut self, key: ElementKey) -> Option<&mut Element> {
        self.arena.get_mut(key)
    }

    pub fn element_count(&self) -> usize {
        self.arena.len()
    }

    pub fn cube_of(&self, key: ElementKey) -> Option<AACube> {
        self.arena.get(key).map(|e| e.cube)
    }

    /// Deepest element whose cell fully contains `cube`, splitting cells on
    /// the way down as needed. Falls back to the root for cubes that don't
    /// fit the domain at all (oversized or out of bounds).
    pub fn ensure_best_fit(&mut self, cube: &AACube) -> ElementKey {
        let mut current = self.root;
        loop {
            let element = match self.arena.get(current) {
                Some(e) => e,
                None => return self.root,
            };
            let cell = element.cube;
            if !cell.contains_cube(cube) {
                // only possible at the root; everything lands there
                return current;
            }
            let half = cell.scale * 0.5;
            if half < MIN_ELEMENT_SCALE {
                return current;
            }
            let octant = cell.octant_of(cube.center());
            let child_cube = cell.child_cube(octant);
            if !child_cube.contains_cube(cube) {
                // straddles the center planes; this cell is the best fit
                return current;
            }
            let next = match element.children[octant] {
                Some(child) => child,
                None => {
                    let child = self.arena.insert(Element::new(child_cube, Some(current)));
                    if let Some(parent) = self.arena.get_mut(current) {
                        parent.children[octant] = Some(child);
                    }
                    child
                }
            };
            current = next;
        }
    }

    /// Like [`Octree::ensure_best_fit`] but read-only: the deepest *existing*
    /// element whose cell contains `cube`.
    pub fn best_fit(&self, cube: &AACube) -> ElementKey {
        let mut current = self.root;
        loop {
            let element = match self.arena.get(current) {
                Some(e) => e,
                None => return self.root,
            };
            let cell = element.cube;
            if !cell.contains_cube(cube) {
                return current;
            }
            let octant = cell.octant_of(cube.center());
            if !cell.child_cube(octant).contains_cube(cube) {
                return current;
            }
            match element.children[octant] {
                Some(child) => current = child,
                None => return current,
            }
        }
    }

    pub fn add_entity(&mut self, key: ElementKey, id: EntityId) {
        if let Some(element) = self.arena.get_mut(key) {
            if !element.entities.contains(&id) {
                element.entities.push(id);
            }
        }
    }

    /// Returns true when the id was actually present.
    pub fn remove_entity(&mut self, key: ElementKey, id: EntityId) -> bool {
        match self.arena.get_mut(key) {
            Some(element) => {
                let before = element.entities.len();
                element.entities.retain(|e| *e != id);
                element.entities.len() != before
            }
            None => false,
        }
    }

    /// Free `key` and its now-empty ancestors. The root is never pruned.
    pub fn prune_upward(&mut self, key: ElementKey) {
        let mut current = key;
        while current != self.root {
            let (empty, parent) = match self.arena.get(current) {
                Some(element) => (element.is_empty(), element.parent),
                None => return,
            };
            if !empty {
                return;
            }
            let parent = match parent {
                Some(p) => p,
                None => return,
            };
            if let Some(parent_element) = self.arena.get_mut(parent) {
                for child in parent_element.children.iter_mut() {
                    if *child == Some(current) {
                        *child = None;
                    }
                }
            }
            self.arena.remove(current);
            current = parent;
        }
    }

    /// All entity ids in the tree, in traversal order. Test/debug helper.
    pub fn all_entities(&self) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(key) = stack.pop() {
            if let Some(element) = self.arena.get(key) {
                out.extend(element.entities.iter().copied());
                stack.extend(element.children.iter().flatten().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cube(center: Vec3) -> AACube {
        AACube::from_center(center, 1.0)
    }

    #[test]
    fn test_ensure_best_fit_splits_on_demand() {
        let mut octree = Octree::new(1_024.0);
        assert_eq!(octree.element_count(), 1);

        let key = octree.ensure_best_fit(&small_cube(Vec3::new(100.0, 100.0, 100.0)));
        assert!(octree.element_count() > 1);
        let cell = octree.get(key).unwrap().cube;
        assert!(cell.contains_cube(&small_cube(Vec3::new(100.0, 100.0, 100.0))));
        assert!(cell.scale < 1_024.0);
    }

    #[test]
    fn test_straddling_cube_stays_high() {
        let mut octree = Octree::new(1_024.0);
        // centered on the origin: straddles the root's center planes
        let key = octree.ensure_best_fit(&small_cube(Vec3::ZERO));
        assert_eq!(key, octree.root());
    }

    #[test]
    fn test_oversized_cube_lands_at_root() {
        let mut octree = Octree::new(64.0);
        let huge = AACube::from_center(Vec3::ZERO, 1_000.0);
        assert_eq!(octree.ensure_best_fit(&huge), octree.root());
    }

    #[test]
    fn test_min_scale_floors_descent() {
        let mut octree = Octree::new(64.0);
        let tiny = AACube::from_center(Vec3::new(10.0, 10.0, 10.0), 1e-4);
        let key = octree.ensure_best_fit(&tiny);
        let cell = octree.get(key).unwrap().cube;
        assert!(cell.scale >= MIN_ELEMENT_SCALE);
    }

    #[test]
    fn test_entity_membership() {
        let mut octree = Octree::new(64.0);
        let id = EntityId::random();
        let key = octree.ensure_best_fit(&small_cube(Vec3::new(10.0, 10.0, 10.0)));
        octree.add_entity(key, id);
        octree.add_entity(key, id); // duplicate add is a no-op
        assert_eq!(octree.get(key).unwrap().entities.len(), 1);
        assert!(octree.remove_entity(key, id));
        assert!(!octree.remove_entity(key, id));
    }

    #[test]
    fn test_prune_collapses_empty_branch() {
        let mut octree = Octree::new(1_024.0);
        let id = EntityId::random();
        let key = octree.ensure_best_fit(&small_cube(Vec3::new(300.0, 300.0, 300.0)));
        octree.add_entity(key, id);
        let populated = octree.element_count();
        assert!(populated > 1);

        octree.remove_entity(key, id);
        octree.prune_upward(key);
        assert_eq!(octree.element_count(), 1);
        // the pruned handle is stale now
        assert!(octree.get(key).is_none());
    }

    #[test]
    fn test_prune_stops_at_occupied_ancestor() {
        let mut octree = Octree::new(1_024.0);
        let deep = octree.ensure_best_fit(&small_cube(Vec3::new(300.0, 300.0, 300.0)));
        let resident = EntityId::random();
        // the parent of the deep leaf keeps an entity
        let parent = octree.get(deep).unwrap().parent.unwrap();
        octree.add_entity(parent, resident);

        octree.prune_upward(deep);
        assert!(octree.get(deep).is_none());
        assert!(octree.get(parent).is_some());
        assert_eq!(octree.get(parent).unwrap().entities, vec![resident]);
    }

    #[test]
    fn test_stale_key_after_recycle() {
        let mut octree = Octree::new(1_024.0);
        let key = octree.ensure_best_fit(&small_cube(Vec3::new(300.0, 300.0, 300.0)));
        octree.prune_upward(key);
        // re-create an element that may reuse the slot
        let fresh = octree.ensure_best_fit(&small_cube(Vec3::new(300.0, 300.0, 300.0)));
        assert!(octree.get(key).is_none());
        assert!(octree.get(fresh).is_some());
    }

    #[test]
    fn test_best_fit_read_only() {
        let mut octree = Octree::new(1_024.0);
        let cube = small_cube(Vec3::new(-200.0, 150.0, 90.0));
        let ensured = octree.ensure_best_fit(&cube);
        assert_eq!(octree.best_fit(&cube), ensured);
        // read-only lookup of an unexplored region stops at the root
        let elsewhere = small_cube(Vec3::new(200.0, -150.0, -90.0));
        assert_eq!(octree.best_fit(&elsewhere), octree.root());
    }
}
