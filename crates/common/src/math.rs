//! # Spatial Math
//!
//! Axis-aligned cube/box primitives and the intersection routines the octree
//! and its queries are built on: slab-test ray intersection, per-face
//! quadratic parabola intersection, sphere/box overlap and frustum culling.
//!
//! Conventions:
//! - An [`AACube`] is `corner + uniform scale` — the octree's cell shape.
//! - An [`AABox`] is `corner + per-axis dimensions` — tight entity bounds.
//! - Intersection distances are along the query primitive (ray parameter `t`
//!   in world units, parabolic `t` in seconds) and are never negative; a
//!   primitive starting inside a volume intersects at distance zero.

use glam::Vec3;
use serde::{Deserialize, Serialize};

// ============================================================================
// Faces
// ============================================================================

/// The face of an axis-aligned volume through which an intersection entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxFace {
    MinX,
    MaxX,
    MinY,
    MaxY,
    MinZ,
    MaxZ,
    /// Used when the query started inside the volume.
    Unknown,
}

impl BoxFace {
    /// Outward unit normal of this face.
    pub fn normal(&self) -> Vec3 {
        match self {
            BoxFace::MinX => Vec3::NEG_X,
            BoxFace::MaxX => Vec3::X,
            BoxFace::MinY => Vec3::NEG_Y,
            BoxFace::MaxY => Vec3::Y,
            BoxFace::MinZ => Vec3::NEG_Z,
            BoxFace::MaxZ => Vec3::Z,
            BoxFace::Unknown => Vec3::ZERO,
        }
    }

    fn entry_face(axis: usize, direction_component: f32) -> BoxFace {
        match (axis, direction_component > 0.0) {
            (0, true) => BoxFace::MinX,
            (0, false) => BoxFace::MaxX,
            (1, true) => BoxFace::MinY,
            (1, false) => BoxFace::MaxY,
            (2, true) => BoxFace::MinZ,
            _ => BoxFace::MaxZ,
        }
    }
}

// ============================================================================
// Ray & Parabola
// ============================================================================

/// A pick ray: origin plus (normalized) direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    /// Componentwise reciprocal of the direction, for slab tests.
    /// Zero components map to ±infinity, which the slab test handles.
    pub fn inv_direction(&self) -> Vec3 {
        Vec3::new(
            1.0 / self.direction.x,
            1.0 / self.direction.y,
            1.0 / self.direction.z,
        )
    }

    pub fn point_at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// A pick parabola: `p(t) = origin + velocity * t + 0.5 * acceleration * t²`.
///
/// Used for thrown/arced picks (teleport arcs, lasso grabs). `t` is in
/// seconds; the "parabolic distance" of a hit is its `t` value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Parabola {
    pub origin: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
}

impl Parabola {
    pub fn new(origin: Vec3, velocity: Vec3, acceleration: Vec3) -> Self {
        Self {
            origin,
            velocity,
            acceleration,
        }
    }

    pub fn point_at(&self, t: f32) -> Vec3 {
        self.origin + self.velocity * t + 0.5 * self.acceleration * t * t
    }
}

/// Smallest non-negative root of `0.5*a*t² + b*t + c = 0`, if any.
///
/// Degenerates to the linear solution when `a` vanishes. Used per-face by the
/// parabola intersection tests.
pub fn solve_half_quadratic(a: f32, b: f32, c: f32) -> Option<f32> {
    const EPSILON: f32 = 1e-8;
    if a.abs() < EPSILON {
        // linear: b*t + c = 0
        if b.abs() < EPSILON {
            return if c.abs() < EPSILON { Some(0.0) } else { None };
        }
        let t = -c / b;
        return (t >= 0.0).then_some(t);
    }
    // 0.5*a*t^2 + b*t + c = 0  =>  t = (-b ± sqrt(b² - 2ac)) / a
    let discriminant = b * b - 2.0 * a * c;
    if discriminant < 0.0 {
        return None;
    }
    let sqrt_d = discriminant.sqrt();
    let t0 = (-b - sqrt_d) / a;
    let t1 = (-b + sqrt_d) / a;
    let (lo, hi) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
    if lo >= 0.0 {
        Some(lo)
    } else if hi >= 0.0 {
        Some(hi)
    } else {
        None
    }
}

// ============================================================================
// AACube
// ============================================================================

/// An axis-aligned cube: minimum corner plus uniform edge length.
///
/// This is the octree's cell shape and the shape of every entity's "query
/// cube" key. Containment here is inclusive of the minimum faces and
/// exclusive of nothing — boundary points count as inside, matching how the
/// octree assigns entities sitting exactly on a cell boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AACube {
    pub corner: Vec3,
    pub scale: f32,
}

impl Default for AACube {
    fn default() -> Self {
        Self {
            corner: Vec3::ZERO,
            scale: 1.0,
        }
    }
}

impl AACube {
    pub fn new(corner: Vec3, scale: f32) -> Self {
        Self { corner, scale }
    }

    /// Cube centered on `center` with edge length `scale`.
    pub fn from_center(center: Vec3, scale: f32) -> Self {
        Self {
            corner: center - Vec3::splat(scale * 0.5),
            scale,
        }
    }

    pub fn center(&self) -> Vec3 {
        self.corner + Vec3::splat(self.scale * 0.5)
    }

    pub fn max_corner(&self) -> Vec3 {
        self.corner + Vec3::splat(self.scale)
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        let max = self.max_corner();
        point.x >= self.corner.x
            && point.x <= max.x
            && point.y >= self.corner.y
            && point.y <= max.y
            && point.z >= self.corner.z
            && point.z <= max.z
    }

    /// True when `other` lies entirely inside this cube (boundaries count).
    pub fn contains_cube(&self, other: &AACube) -> bool {
        self.contains_point(other.corner) && self.contains_point(other.max_corner())
    }

    pub fn contains_box(&self, other: &AABox) -> bool {
        self.contains_point(other.corner) && self.contains_point(other.max_corner())
    }

    /// True when the two cubes overlap at all (shared faces count).
    pub fn touches_cube(&self, other: &AACube) -> bool {
        let a_max = self.max_corner();
        let b_max = other.max_corner();
        self.corner.x <= b_max.x
            && a_max.x >= other.corner.x
            && self.corner.y <= b_max.y
            && a_max.y >= other.corner.y
            && self.corner.z <= b_max.z
            && a_max.z >= other.corner.z
    }

    pub fn touches_box(&self, other: &AABox) -> bool {
        let a_max = self.max_corner();
        let b_max = other.max_corner();
        self.corner.x <= b_max.x
            && a_max.x >= other.corner.x
            && self.corner.y <= b_max.y
            && a_max.y >= other.corner.y
            && self.corner.z <= b_max.z
            && a_max.z >= other.corner.z
    }

    /// True when any part of the cube lies within `radius` of `center`.
    pub fn touches_sphere(&self, center: Vec3, radius: f32) -> bool {
        let clamped = center.clamp(self.corner, self.max_corner());
        clamped.distance_squared(center) <= radius * radius
    }

    /// Slab-test ray intersection.
    ///
    /// Returns the entry distance and entry face; a ray starting inside the
    /// cube intersects at distance zero with [`BoxFace::Unknown`].
    pub fn find_ray_intersection(
        &self,
        origin: Vec3,
        _direction: Vec3,
        inv_direction: Vec3,
    ) -> Option<(f32, BoxFace)> {
        slab_ray_intersection(self.corner, self.max_corner(), origin, inv_direction)
    }

    /// Parabola intersection: smallest non-negative parabolic `t` at which
    /// the arc crosses into the cube, via per-face quadratics.
    ///
    /// A parabola starting inside the cube intersects at `t = 0`.
    pub fn find_parabola_intersection(&self, parabola: &Parabola) -> Option<f32> {
        volume_parabola_intersection(self.corner, self.max_corner(), parabola)
    }

    /// Index (0..8) of the child octant containing `point`, by comparing each
    /// component against the cube center: bit 0 = +x, bit 1 = +y, bit 2 = +z.
    pub fn octant_of(&self, point: Vec3) -> usize {
        let center = self.center();
        let mut octant = 0;
        if point.x >= center.x {
            octant |= 1;
        }
        if point.y >= center.y {
            octant |= 2;
        }
        if point.z >= center.z {
            octant |= 4;
        }
        octant
    }

    /// The half-scale child cube at `octant` (same bit layout as
    /// [`AACube::octant_of`]).
    pub fn child_cube(&self, octant: usize) -> AACube {
        let half = self.scale * 0.5;
        let offset = Vec3::new(
            if octant & 1 != 0 { half } else { 0.0 },
            if octant & 2 != 0 { half } else { 0.0 },
            if octant & 4 != 0 { half } else { 0.0 },
        );
        AACube {
            corner: self.corner + offset,
            scale: half,
        }
    }
}

fn volume_contains(min: Vec3, max: Vec3, point: Vec3) -> bool {
    point.x >= min.x
        && point.x <= max.x
        && point.y >= min.y
        && point.y <= max.y
        && point.z >= min.z
        && point.z <= max.z
}

/// Slab test shared by [`AACube`] and [`AABox`]. An origin inside the volume
/// intersects at distance zero with [`BoxFace::Unknown`].
fn slab_ray_intersection(
    min: Vec3,
    max: Vec3,
    origin: Vec3,
    inv_direction: Vec3,
) -> Option<(f32, BoxFace)> {
    if volume_contains(min, max, origin) {
        return Some((0.0, BoxFace::Unknown));
    }
    let mut t_min = f32::NEG_INFINITY;
    let mut t_max = f32::INFINITY;
    let mut entry_axis = 0usize;
    for axis in 0..3 {
        let t1 = (min[axis] - origin[axis]) * inv_direction[axis];
        let t2 = (max[axis] - origin[axis]) * inv_direction[axis];
        let (near, far) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
        if near > t_min {
            t_min = near;
            entry_axis = axis;
        }
        t_max = t_max.min(far);
        if t_min > t_max {
            return None;
        }
    }
    if t_max < 0.0 {
        return None;
    }
    let distance = t_min.max(0.0);
    let direction_component = 1.0 / inv_direction[entry_axis];
    Some((distance, BoxFace::entry_face(entry_axis, direction_component)))
}

/// Per-face quadratic parabola entry shared by [`AACube`] and [`AABox`].
fn volume_parabola_intersection(min: Vec3, max: Vec3, parabola: &Parabola) -> Option<f32> {
    if volume_contains(min, max, parabola.origin) {
        return Some(0.0);
    }
    let mut best: Option<f32> = None;
    for axis in 0..3 {
        for plane in [min[axis], max[axis]] {
            let a = parabola.acceleration[axis];
            let b = parabola.velocity[axis];
            let c = parabola.origin[axis] - plane;
            // Both crossings of this face plane can be candidate entries.
            for t in face_plane_roots(a, b, c) {
                if t < 0.0 {
                    continue;
                }
                if let Some(current) = best {
                    if t >= current {
                        continue;
                    }
                }
                let point = parabola.point_at(t);
                if point_on_face(point, min, max, axis) {
                    best = Some(t);
                }
            }
        }
    }
    best
}

/// Roots of `0.5*a*t² + b*t + c = 0`, both of them, unsorted.
fn face_plane_roots(a: f32, b: f32, c: f32) -> impl Iterator<Item = f32> {
    const EPSILON: f32 = 1e-8;
    let mut roots = [f32::NAN, f32::NAN];
    if a.abs() < EPSILON {
        if b.abs() >= EPSILON {
            roots[0] = -c / b;
        }
    } else {
        let discriminant = b * b - 2.0 * a * c;
        if discriminant >= 0.0 {
            let sqrt_d = discriminant.sqrt();
            roots[0] = (-b - sqrt_d) / a;
            roots[1] = (-b + sqrt_d) / a;
        }
    }
    roots.into_iter().filter(|t| !t.is_nan())
}

/// Whether `point` lies within the face rectangle of `axis` (the other two
/// axes bounded by the volume), with a small tolerance on the face plane.
fn point_on_face(point: Vec3, min: Vec3, max: Vec3, axis: usize) -> bool {
    const FACE_TOLERANCE: f32 = 1e-4;
    for other in 0..3 {
        if other == axis {
            continue;
        }
        if point[other] < min[other] - FACE_TOLERANCE || point[other] > max[other] + FACE_TOLERANCE {
            return false;
        }
    }
    true
}

// ============================================================================
// AABox
// ============================================================================

/// An axis-aligned box: minimum corner plus per-axis dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AABox {
    pub corner: Vec3,
    pub dimensions: Vec3,
}

impl Default for AABox {
    fn default() -> Self {
        Self {
            corner: Vec3::ZERO,
            dimensions: Vec3::ONE,
        }
    }
}

impl AABox {
    pub fn new(corner: Vec3, dimensions: Vec3) -> Self {
        Self { corner, dimensions }
    }

    pub fn from_center(center: Vec3, dimensions: Vec3) -> Self {
        Self {
            corner: center - dimensions * 0.5,
            dimensions,
        }
    }

    pub fn center(&self) -> Vec3 {
        self.corner + self.dimensions * 0.5
    }

    pub fn max_corner(&self) -> Vec3 {
        self.corner + self.dimensions
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        let max = self.max_corner();
        point.x >= self.corner.x
            && point.x <= max.x
            && point.y >= self.corner.y
            && point.y <= max.y
            && point.z >= self.corner.z
            && point.z <= max.z
    }

    pub fn touches_box(&self, other: &AABox) -> bool {
        let a_max = self.max_corner();
        let b_max = other.max_corner();
        self.corner.x <= b_max.x
            && a_max.x >= other.corner.x
            && self.corner.y <= b_max.y
            && a_max.y >= other.corner.y
            && self.corner.z <= b_max.z
            && a_max.z >= other.corner.z
    }

    /// Slab-test ray intersection; same contract as
    /// [`AACube::find_ray_intersection`].
    pub fn find_ray_intersection(
        &self,
        origin: Vec3,
        _direction: Vec3,
        inv_direction: Vec3,
    ) -> Option<(f32, BoxFace)> {
        slab_ray_intersection(self.corner, self.max_corner(), origin, inv_direction)
    }

    /// Parabola intersection; same contract as
    /// [`AACube::find_parabola_intersection`].
    pub fn find_parabola_intersection(&self, parabola: &Parabola) -> Option<f32> {
        volume_parabola_intersection(self.corner, self.max_corner(), parabola)
    }

    /// Smallest cube that contains this box.
    pub fn bounding_cube(&self) -> AACube {
        let scale = self.dimensions.max_element();
        AACube::from_center(self.center(), scale)
    }

    /// Grow in place to contain `other`.
    pub fn embiggen_to_contain(&mut self, other: &AABox) {
        let min = self.corner.min(other.corner);
        let max = self.max_corner().max(other.max_corner());
        self.corner = min;
        self.dimensions = max - min;
    }
}

// ============================================================================
// Plane & Frustum
// ============================================================================

/// A plane in normal/offset form: `dot(normal, p) + d = 0`, normal pointing
/// toward the inside half-space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    pub fn new(normal: Vec3, d: f32) -> Self {
        Self { normal, d }
    }

    /// Plane through `point` with the given inward normal.
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let n = normal.normalize_or_zero();
        Self {
            normal: n,
            d: -n.dot(point),
        }
    }

    /// Signed distance; positive on the inside half-space.
    pub fn distance_to(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// A view frustum as six inward-facing planes.
///
/// The cube test is the usual conservative p-vertex test: a cell is rejected
/// only when fully outside some plane, so a cell that merely straddles a
/// corner may still be visited — queries re-test per entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn new(planes: [Plane; 6]) -> Self {
        Self { planes }
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.distance_to(point) >= 0.0)
    }

    /// False only when the cube is entirely outside one plane.
    pub fn intersects_cube(&self, cube: &AACube) -> bool {
        let min = cube.corner;
        let max = cube.max_corner();
        for plane in &self.planes {
            // p-vertex: the corner farthest along the plane normal
            let p = Vec3::new(
                if plane.normal.x >= 0.0 { max.x } else { min.x },
                if plane.normal.y >= 0.0 { max.y } else { min.y },
                if plane.normal.z >= 0.0 { max.z } else { min.z },
            );
            if plane.distance_to(p) < 0.0 {
                return false;
            }
        }
        true
    }

    pub fn intersects_box(&self, aabox: &AABox) -> bool {
        let min = aabox.corner;
        let max = aabox.max_corner();
        for plane in &self.planes {
            let p = Vec3::new(
                if plane.normal.x >= 0.0 { max.x } else { min.x },
                if plane.normal.y >= 0.0 { max.y } else { min.y },
                if plane.normal.z >= 0.0 { max.z } else { min.z },
            );
            if plane.distance_to(p) < 0.0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_contains_and_touches() {
        let cube = AACube::new(Vec3::ZERO, 10.0);
        assert!(cube.contains_point(Vec3::new(5.0, 5.0, 5.0)));
        assert!(cube.contains_point(Vec3::ZERO));
        assert!(cube.contains_point(Vec3::splat(10.0)));
        assert!(!cube.contains_point(Vec3::new(10.1, 5.0, 5.0)));

        let inner = AACube::new(Vec3::splat(2.0), 3.0);
        assert!(cube.contains_cube(&inner));
        let overlapping = AACube::new(Vec3::splat(8.0), 4.0);
        assert!(!cube.contains_cube(&overlapping));
        assert!(cube.touches_cube(&overlapping));
        let far = AACube::new(Vec3::splat(20.0), 1.0);
        assert!(!cube.touches_cube(&far));
    }

    #[test]
    fn test_cube_sphere_overlap() {
        let cube = AACube::new(Vec3::ZERO, 2.0);
        assert!(cube.touches_sphere(Vec3::new(1.0, 1.0, 1.0), 0.1));
        assert!(cube.touches_sphere(Vec3::new(3.0, 1.0, 1.0), 1.0));
        assert!(!cube.touches_sphere(Vec3::new(3.0, 1.0, 1.0), 0.9));
    }

    #[test]
    fn test_ray_slab_hit_and_miss() {
        let cube = AACube::new(Vec3::new(0.0, 0.0, 5.0), 2.0);
        let ray = Ray::new(Vec3::new(1.0, 1.0, 0.0), Vec3::Z);
        let (distance, face) = cube
            .find_ray_intersection(ray.origin, ray.direction, ray.inv_direction())
            .unwrap();
        assert!((distance - 5.0).abs() < 1e-5);
        assert_eq!(face, BoxFace::MinZ);

        let miss = Ray::new(Vec3::new(10.0, 10.0, 0.0), Vec3::Z);
        assert!(cube
            .find_ray_intersection(miss.origin, miss.direction, miss.inv_direction())
            .is_none());

        // behind the origin
        let behind = Ray::new(Vec3::new(1.0, 1.0, 10.0), Vec3::Z);
        assert!(cube
            .find_ray_intersection(behind.origin, behind.direction, behind.inv_direction())
            .is_none());
    }

    #[test]
    fn test_ray_from_inside_is_zero() {
        let cube = AACube::new(Vec3::ZERO, 4.0);
        let ray = Ray::new(Vec3::splat(2.0), Vec3::X);
        let (distance, face) = cube
            .find_ray_intersection(ray.origin, ray.direction, ray.inv_direction())
            .unwrap();
        assert_eq!(distance, 0.0);
        assert_eq!(face, BoxFace::Unknown);
    }

    #[test]
    fn test_ray_axis_aligned_zero_component() {
        // direction with zero components exercises the ±inf inv_direction path
        let cube = AACube::new(Vec3::new(-1.0, 3.0, -1.0), 2.0);
        let ray = Ray::new(Vec3::ZERO, Vec3::Y);
        let (distance, _) = cube
            .find_ray_intersection(ray.origin, ray.direction, ray.inv_direction())
            .unwrap();
        assert!((distance - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_parabola_drop_onto_cube() {
        // launched horizontally, gravity pulls the arc down into the cube
        let cube = AACube::new(Vec3::new(4.0, -2.0, -1.0), 2.0);
        let parabola = Parabola::new(
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(5.0, 0.0, 0.0),
            Vec3::new(0.0, -9.8, 0.0),
        );
        let t = cube.find_parabola_intersection(&parabola).unwrap();
        let hit = parabola.point_at(t);
        assert!(hit.x >= 4.0 - 1e-3 && hit.x <= 6.0 + 1e-3);
        assert!(hit.y <= 0.0 + 1e-3);

        // no acceleration and aimed away: no hit
        let straight = Parabola::new(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 1.0, 0.0), Vec3::ZERO);
        assert!(cube.find_parabola_intersection(&straight).is_none());
    }

    #[test]
    fn test_parabola_inside_is_zero() {
        let cube = AACube::new(Vec3::ZERO, 4.0);
        let parabola = Parabola::new(Vec3::splat(1.0), Vec3::X, Vec3::ZERO);
        assert_eq!(cube.find_parabola_intersection(&parabola), Some(0.0));
    }

    #[test]
    fn test_solve_half_quadratic() {
        // 0.5*2*t^2 - 3t + 1 = 0 => t^2 - 3t + 1 = 0 => t ≈ 0.382, 2.618
        let t = solve_half_quadratic(2.0, -3.0, 1.0).unwrap();
        assert!((t - 0.3819660).abs() < 1e-4);
        // linear fallback: 2t - 4 = 0
        assert_eq!(solve_half_quadratic(0.0, 2.0, -4.0), Some(2.0));
        // no real roots
        assert!(solve_half_quadratic(2.0, 0.0, 1.0).is_none());
    }

    #[test]
    fn test_octants_partition_cube() {
        let cube = AACube::new(Vec3::ZERO, 8.0);
        let point = Vec3::new(6.0, 1.0, 5.0); // +x, -y, +z => 1 | 0 | 4
        let octant = cube.octant_of(point);
        assert_eq!(octant, 5);
        assert!(cube.child_cube(octant).contains_point(point));
        // all 8 children tile the parent
        for i in 0..8 {
            assert!(cube.contains_cube(&cube.child_cube(i)));
            assert_eq!(cube.child_cube(i).scale, 4.0);
        }
    }

    #[test]
    fn test_box_embiggen_and_bounding_cube() {
        let mut a = AABox::new(Vec3::ZERO, Vec3::ONE);
        let b = AABox::new(Vec3::new(2.0, 0.0, 0.0), Vec3::ONE);
        a.embiggen_to_contain(&b);
        assert_eq!(a.corner, Vec3::ZERO);
        assert_eq!(a.max_corner(), Vec3::new(3.0, 1.0, 1.0));

        let cube = a.bounding_cube();
        assert_eq!(cube.scale, 3.0);
        assert!(cube.contains_box(&a));
    }

    #[test]
    fn test_box_ray_intersection() {
        let aabox = AABox::new(Vec3::new(2.0, 0.0, 0.0), Vec3::new(1.0, 4.0, 1.0));
        let ray = Ray::new(Vec3::new(0.0, 1.0, 0.5), Vec3::X);
        let (distance, face) = aabox
            .find_ray_intersection(ray.origin, ray.direction, ray.inv_direction())
            .unwrap();
        assert!((distance - 2.0).abs() < 1e-5);
        assert_eq!(face, BoxFace::MinX);

        let miss = Ray::new(Vec3::new(0.0, 5.0, 0.5), Vec3::X);
        assert!(aabox
            .find_ray_intersection(miss.origin, miss.direction, miss.inv_direction())
            .is_none());
    }

    #[test]
    fn test_frustum_culling() {
        // axis-aligned "box frustum" around the origin
        let planes = [
            Plane::from_point_normal(Vec3::new(-5.0, 0.0, 0.0), Vec3::X),
            Plane::from_point_normal(Vec3::new(5.0, 0.0, 0.0), Vec3::NEG_X),
            Plane::from_point_normal(Vec3::new(0.0, -5.0, 0.0), Vec3::Y),
            Plane::from_point_normal(Vec3::new(0.0, 5.0, 0.0), Vec3::NEG_Y),
            Plane::from_point_normal(Vec3::new(0.0, 0.0, -5.0), Vec3::Z),
            Plane::from_point_normal(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z),
        ];
        let frustum = Frustum::new(planes);
        assert!(frustum.contains_point(Vec3::ZERO));
        assert!(!frustum.contains_point(Vec3::new(6.0, 0.0, 0.0)));
        assert!(frustum.intersects_cube(&AACube::new(Vec3::new(4.0, -1.0, -1.0), 2.0)));
        assert!(!frustum.intersects_cube(&AACube::new(Vec3::new(7.0, 0.0, 0.0), 1.0)));
    }
}
