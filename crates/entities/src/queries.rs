//! # Spatial Queries
//!
//! Read-side traversals over the octree: sorted ray and parabola picks,
//! volume selections (sphere, cube, box, frustum) and nearest-entity lookup.
//!
//! Picks are branch-and-bound: each element is assigned a conservative lower
//! bound on any hit inside it (zero if the pick origin is inside the cell,
//! otherwise the cell's own entry distance), children are visited in
//! ascending bound order, and a subtree is skipped as soon as its bound can
//! no longer beat the best hit found. Entities are tested against their
//! tight world boxes, so a hit through an oversized query cube still lands
//! on the right entity.
//!
//! Everything here takes `&Octree`/`&EntityStore` borrows; the tree's public
//! wrappers hold the lock and add the accurate/try-lock distinction.

use crate::element::{ElementKey, Octree};
use crate::entity::Entity;
use crate::registry::EntityStore;
use glam::Vec3;
use weald_common::{AABox, AACube, BoxFace, EntityId, Frustum, Parabola, Ray};

// ============================================================================
// Filters & results
// ============================================================================

/// Which entities a pick may land on.
#[derive(Debug, Clone)]
pub struct PickFilter {
    /// Consider invisible entities.
    pub include_invisible: bool,
    /// Consider collisionless entities.
    pub include_collisionless: bool,
    /// When non-empty, only these ids are considered.
    pub include: Vec<EntityId>,
    /// These ids are never considered.
    pub ignore: Vec<EntityId>,
}

impl Default for PickFilter {
    fn default() -> Self {
        Self {
            include_invisible: false,
            include_collisionless: true,
            include: Vec::new(),
            ignore: Vec::new(),
        }
    }
}

impl PickFilter {
    pub fn passes(&self, entity: &Entity) -> bool {
        if !self.include_invisible && !entity.visible {
            return false;
        }
        if !self.include_collisionless && entity.collisionless {
            return false;
        }
        if !self.include.is_empty() && !self.include.contains(&entity.id) {
            return false;
        }
        !self.ignore.contains(&entity.id)
    }
}

/// A ray pick hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub entity_id: EntityId,
    /// Distance along the ray, world units.
    pub distance: f32,
    pub face: BoxFace,
    pub surface_normal: Vec3,
    pub intersection: Vec3,
}

/// A parabola pick hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParabolaHit {
    pub entity_id: EntityId,
    /// Parabolic parameter of the hit, seconds. Hits compare on this, not on
    /// euclidean distance.
    pub parabolic_distance: f32,
    pub face: BoxFace,
    pub surface_normal: Vec3,
    pub intersection: Vec3,
}

// ============================================================================
// Ray pick
// ============================================================================

pub(crate) fn ray_intersection(
    octree: &Octree,
    store: &EntityStore,
    ray: &Ray,
    filter: &PickFilter,
) -> Option<RayHit> {
    let inv_direction = ray.inv_direction();
    let mut best: Option<RayHit> = None;
    descend_ray(
        octree,
        store,
        octree.root(),
        ray,
        inv_direction,
        filter,
        &mut best,
    );
    best
}

/// Lower bound on any hit within `cube`, or +inf when the cell cannot beat
/// the current best.
fn ray_bound(cube: &AACube, ray: &Ray, inv_direction: Vec3, best: f32) -> f32 {
    if cube.contains_point(ray.origin) {
        return 0.0;
    }
    match cube.find_ray_intersection(ray.origin, ray.direction, inv_direction) {
        Some((distance, _)) if distance < best => distance,
        _ => f32::INFINITY,
    }
}

fn descend_ray(
    octree: &Octree,
    store: &EntityStore,
    key: ElementKey,
    ray: &Ray,
    inv_direction: Vec3,
    filter: &PickFilter,
    best: &mut Option<RayHit>,
) {
    let Some(element) = octree.get(key) else {
        return;
    };

    for id in &element.entities {
        let Some(entity) = store.find(*id) else {
            continue;
        };
        if !filter.passes(entity) {
            continue;
        }
        let aabox = entity.world_aabox();
        if let Some((distance, face)) =
            aabox.find_ray_intersection(ray.origin, ray.direction, inv_direction)
        {
            if best.map(|b| distance < b.distance).unwrap_or(true) {
                *best = Some(RayHit {
                    entity_id: *id,
                    distance,
                    face,
                    surface_normal: face.normal(),
                    intersection: ray.point_at(distance),
                });
            }
        }
    }

    let current = best.map(|b| b.distance).unwrap_or(f32::INFINITY);
    let mut order: Vec<(f32, ElementKey)> = Vec::new();
    for child in element.children.iter().flatten() {
        if let Some(cube) = octree.cube_of(*child) {
            let bound = ray_bound(&cube, ray, inv_direction, current);
            if bound.is_finite() {
                order.push((bound, *child));
            }
        }
    }
    order.sort_by(|a, b| a.0.total_cmp(&b.0));
    for (bound, child) in order {
        let current = best.map(|b| b.distance).unwrap_or(f32::INFINITY);
        if bound >= current {
            // sorted ascending, so every later child is out too
            break;
        }
        descend_ray(octree, store, child, ray, inv_direction, filter, best);
    }
}

// ============================================================================
// Parabola pick
// ============================================================================

pub(crate) fn parabola_intersection(
    octree: &Octree,
    store: &EntityStore,
    parabola: &Parabola,
    filter: &PickFilter,
) -> Option<ParabolaHit> {
    let mut best: Option<ParabolaHit> = None;
    descend_parabola(octree, store, octree.root(), parabola, filter, &mut best);
    best
}

fn parabola_bound(cube: &AACube, parabola: &Parabola, best: f32) -> f32 {
    if cube.contains_point(parabola.origin) {
        return 0.0;
    }
    match cube.find_parabola_intersection(parabola) {
        Some(t) if t < best => t,
        _ => f32::INFINITY,
    }
}

fn descend_parabola(
    octree: &Octree,
    store: &EntityStore,
    key: ElementKey,
    parabola: &Parabola,
    filter: &PickFilter,
    best: &mut Option<ParabolaHit>,
) {
    let Some(element) = octree.get(key) else {
        return;
    };

    for id in &element.entities {
        let Some(entity) = store.find(*id) else {
            continue;
        };
        if !filter.passes(entity) {
            continue;
        }
        let aabox = entity.world_aabox();
        if let Some(t) = aabox.find_parabola_intersection(parabola) {
            if best.map(|b| t < b.parabolic_distance).unwrap_or(true) {
                let intersection = parabola.point_at(t);
                let face = nearest_face(&aabox, intersection);
                *best = Some(ParabolaHit {
                    entity_id: *id,
                    parabolic_distance: t,
                    face,
                    surface_normal: face.normal(),
                    intersection,
                });
            }
        }
    }

    let current = best.map(|b| b.parabolic_distance).unwrap_or(f32::INFINITY);
    let mut order: Vec<(f32, ElementKey)> = Vec::new();
    for child in element.children.iter().flatten() {
        if let Some(cube) = octree.cube_of(*child) {
            let bound = parabola_bound(&cube, parabola, current);
            if bound.is_finite() {
                order.push((bound, *child));
            }
        }
    }
    order.sort_by(|a, b| a.0.total_cmp(&b.0));
    for (bound, child) in order {
        let current = best.map(|b| b.parabolic_distance).unwrap_or(f32::INFINITY);
        if bound >= current {
            break;
        }
        descend_parabola(octree, store, child, parabola, filter, best);
    }
}

/// Which face of `aabox` the point sits on (nearest face plane). The pick
/// already guarantees the point lies on the surface or inside.
fn nearest_face(aabox: &AABox, point: Vec3) -> BoxFace {
    let min = aabox.corner;
    let max = aabox.max_corner();
    let candidates = [
        (BoxFace::MinX, (point.x - min.x).abs()),
        (BoxFace::MaxX, (point.x - max.x).abs()),
        (BoxFace::MinY, (point.y - min.y).abs()),
        (BoxFace::MaxY, (point.y - max.y).abs()),
        (BoxFace::MinZ, (point.z - min.z).abs()),
        (BoxFace::MaxZ, (point.z - max.z).abs()),
    ];
    candidates
        .into_iter()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(face, _)| face)
        .unwrap_or(BoxFace::Unknown)
}

// ============================================================================
// Volume selections
// ============================================================================

fn gather_matching(
    octree: &Octree,
    store: &EntityStore,
    key: ElementKey,
    cell_test: &impl Fn(&AACube) -> bool,
    entity_test: &impl Fn(&Entity) -> bool,
    out: &mut Vec<EntityId>,
) {
    let Some(element) = octree.get(key) else {
        return;
    };
    if !cell_test(&element.cube) {
        return;
    }
    for id in &element.entities {
        if let Some(entity) = store.find(*id) {
            if entity_test(entity) {
                out.push(*id);
            }
        }
    }
    for child in element.children.iter().flatten() {
        gather_matching(octree, store, *child, cell_test, entity_test, out);
    }
}

fn box_touches_sphere(aabox: &AABox, center: Vec3, radius: f32) -> bool {
    let clamped = center.clamp(aabox.corner, aabox.max_corner());
    clamped.distance_squared(center) <= radius * radius
}

pub(crate) fn entities_in_sphere(
    octree: &Octree,
    store: &EntityStore,
    center: Vec3,
    radius: f32,
) -> Vec<EntityId> {
    let mut out = Vec::new();
    gather_matching(
        octree,
        store,
        octree.root(),
        &|cube| cube.touches_sphere(center, radius),
        &|entity| box_touches_sphere(&entity.world_aabox(), center, radius),
        &mut out,
    );
    out
}

pub(crate) fn entities_in_cube(
    octree: &Octree,
    store: &EntityStore,
    cube: &AACube,
) -> Vec<EntityId> {
    let mut out = Vec::new();
    gather_matching(
        octree,
        store,
        octree.root(),
        &|cell| cell.touches_cube(cube),
        &|entity| cube.touches_box(&entity.world_aabox()),
        &mut out,
    );
    out
}

pub(crate) fn entities_in_box(
    octree: &Octree,
    store: &EntityStore,
    aabox: &AABox,
) -> Vec<EntityId> {
    let mut out = Vec::new();
    gather_matching(
        octree,
        store,
        octree.root(),
        &|cell| cell.touches_box(aabox),
        &|entity| aabox.touches_box(&entity.world_aabox()),
        &mut out,
    );
    out
}

pub(crate) fn entities_in_frustum(
    octree: &Octree,
    store: &EntityStore,
    frustum: &Frustum,
) -> Vec<EntityId> {
    let mut out = Vec::new();
    gather_matching(
        octree,
        store,
        octree.root(),
        &|cell| frustum.intersects_cube(cell),
        &|entity| frustum.intersects_box(&entity.world_aabox()),
        &mut out,
    );
    out
}

/// A caller-defined selection: a conservative cell test that can prune whole
/// subtrees, plus a per-entity test. The fixed region queries above are the
/// common cases of this.
pub trait EntityScan {
    /// May a matching entity live inside this cell? `false` skips the whole
    /// subtree, so implementations must err on the side of `true`.
    fn test_cell(&self, cell: &AACube) -> bool;

    fn test_entity(&self, entity: &Entity) -> bool;
}

pub(crate) fn evaluate_entities(
    octree: &Octree,
    store: &EntityStore,
    scan: &dyn EntityScan,
) -> Vec<EntityId> {
    let mut out = Vec::new();
    gather_matching(
        octree,
        store,
        octree.root(),
        &|cell| scan.test_cell(cell),
        &|entity| scan.test_entity(entity),
        &mut out,
    );
    out
}

/// Nearest entity (by world center) within `max_radius` of `center`.
pub(crate) fn closest_entity(
    octree: &Octree,
    store: &EntityStore,
    center: Vec3,
    max_radius: f32,
) -> Option<(EntityId, f32)> {
    entities_in_sphere(octree, store, center, max_radius)
        .into_iter()
        .filter_map(|id| {
            store
                .find(id)
                .map(|e| (id, e.world_center().distance(center)))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use crate::operators::AddEntityOperator;

    fn world() -> (Octree, EntityStore) {
        (Octree::new(64.0), EntityStore::new())
    }

    fn add_shape(
        octree: &mut Octree,
        store: &mut EntityStore,
        position: Vec3,
        dimensions: Vec3,
    ) -> EntityId {
        let id = EntityId::random();
        let mut entity = Entity::new(id, EntityKind::default_shape(), 0);
        entity.position = position;
        entity.dimensions = dimensions;
        entity.refresh_query_aacube();
        let cube = entity.query_aacube;
        store.insert(entity);
        assert!(AddEntityOperator::new(id, cube).apply(octree, store));
        id
    }

    #[test]
    fn test_ray_hits_nearest_of_two() {
        let (mut octree, mut store) = world();
        let near = add_shape(&mut octree, &mut store, Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);
        let _far = add_shape(&mut octree, &mut store, Vec3::new(15.0, 0.0, 0.0), Vec3::ONE);

        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        let hit = ray_intersection(&octree, &store, &ray, &PickFilter::default()).unwrap();
        assert_eq!(hit.entity_id, near);
        assert!((hit.distance - 4.5).abs() < 1e-4);
        assert_eq!(hit.face, BoxFace::MinX);
        assert_eq!(hit.surface_normal, Vec3::NEG_X);
    }

    #[test]
    fn test_ray_filter_skips_invisible() {
        let (mut octree, mut store) = world();
        let near = add_shape(&mut octree, &mut store, Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);
        let far = add_shape(&mut octree, &mut store, Vec3::new(15.0, 0.0, 0.0), Vec3::ONE);
        store.get_raw_mut(near).unwrap().visible = false;

        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        let hit = ray_intersection(&octree, &store, &ray, &PickFilter::default()).unwrap();
        assert_eq!(hit.entity_id, far);

        let all = PickFilter {
            include_invisible: true,
            ..PickFilter::default()
        };
        let hit = ray_intersection(&octree, &store, &ray, &all).unwrap();
        assert_eq!(hit.entity_id, near);
    }

    #[test]
    fn test_ray_ignore_list() {
        let (mut octree, mut store) = world();
        let near = add_shape(&mut octree, &mut store, Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);
        let far = add_shape(&mut octree, &mut store, Vec3::new(15.0, 0.0, 0.0), Vec3::ONE);

        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        let filter = PickFilter {
            ignore: vec![near],
            ..PickFilter::default()
        };
        let hit = ray_intersection(&octree, &store, &ray, &filter).unwrap();
        assert_eq!(hit.entity_id, far);
    }

    #[test]
    fn test_ray_miss() {
        let (mut octree, mut store) = world();
        add_shape(&mut octree, &mut store, Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);
        let ray = Ray::new(Vec3::ZERO, Vec3::Y);
        assert!(ray_intersection(&octree, &store, &ray, &PickFilter::default()).is_none());
    }

    #[test]
    fn test_parabola_arcs_over_near_entity() {
        let (mut octree, mut store) = world();
        // wall right in front, plate on the ground further away
        let _wall = add_shape(
            &mut octree,
            &mut store,
            Vec3::new(2.0, 0.5, 0.0),
            Vec3::new(0.2, 1.0, 1.0),
        );
        let plate = add_shape(
            &mut octree,
            &mut store,
            Vec3::new(6.0, -2.0, 0.0),
            Vec3::new(2.0, 0.2, 2.0),
        );

        // launched upward: clears the wall, falls onto the plate
        let parabola = Parabola::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(4.0, 6.0, 0.0),
            Vec3::new(0.0, -9.8, 0.0),
        );
        let hit = parabola_intersection(&octree, &store, &parabola, &PickFilter::default())
            .expect("arc should land on the plate");
        assert_eq!(hit.entity_id, plate);
        assert!(hit.parabolic_distance > 0.0);
    }

    #[test]
    fn test_sphere_and_cube_selection() {
        let (mut octree, mut store) = world();
        let a = add_shape(&mut octree, &mut store, Vec3::new(2.0, 0.0, 0.0), Vec3::ONE);
        let b = add_shape(&mut octree, &mut store, Vec3::new(9.0, 0.0, 0.0), Vec3::ONE);

        let near = entities_in_sphere(&octree, &store, Vec3::ZERO, 3.0);
        assert_eq!(near, vec![a]);

        let both = entities_in_sphere(&octree, &store, Vec3::ZERO, 20.0);
        assert_eq!(both.len(), 2);

        let cube = AACube::from_center(Vec3::new(9.0, 0.0, 0.0), 4.0);
        assert_eq!(entities_in_cube(&octree, &store, &cube), vec![b]);
    }

    #[test]
    fn test_box_selection_is_tight() {
        let (mut octree, mut store) = world();
        let a = add_shape(&mut octree, &mut store, Vec3::new(0.0, 0.0, 0.0), Vec3::ONE);
        add_shape(&mut octree, &mut store, Vec3::new(0.0, 5.0, 0.0), Vec3::ONE);

        let thin = AABox::from_center(Vec3::ZERO, Vec3::new(10.0, 1.0, 10.0));
        assert_eq!(entities_in_box(&octree, &store, &thin), vec![a]);
    }

    #[test]
    fn test_evaluate_entities_scan() {
        struct UpperHalf {
            region: AACube,
        }

        impl EntityScan for UpperHalf {
            fn test_cell(&self, cell: &AACube) -> bool {
                cell.touches_cube(&self.region)
            }

            fn test_entity(&self, entity: &Entity) -> bool {
                self.region.touches_box(&entity.world_aabox()) && entity.world_center().y > 0.0
            }
        }

        let (mut octree, mut store) = world();
        let high = add_shape(&mut octree, &mut store, Vec3::new(2.0, 3.0, 0.0), Vec3::ONE);
        let _low = add_shape(&mut octree, &mut store, Vec3::new(2.0, -3.0, 0.0), Vec3::ONE);
        let _far = add_shape(&mut octree, &mut store, Vec3::new(30.0, 3.0, 0.0), Vec3::ONE);

        let scan = UpperHalf {
            region: AACube::from_center(Vec3::ZERO, 12.0),
        };
        assert_eq!(evaluate_entities(&octree, &store, &scan), vec![high]);
    }

    #[test]
    fn test_closest_entity() {
        let (mut octree, mut store) = world();
        let a = add_shape(&mut octree, &mut store, Vec3::new(2.0, 0.0, 0.0), Vec3::ONE);
        add_shape(&mut octree, &mut store, Vec3::new(-6.0, 0.0, 0.0), Vec3::ONE);

        let (id, distance) = closest_entity(&octree, &store, Vec3::ZERO, 10.0).unwrap();
        assert_eq!(id, a);
        assert!((distance - 2.0).abs() < 1e-4);
        assert!(closest_entity(&octree, &store, Vec3::ZERO, 1.0).is_none());
    }
}
