//! Shape geometry, filtering, and the per-shape bookkeeping record.

use crate::physics::distance::DistanceProxy;
use crate::physics::{
    DEFAULT_CATEGORY_BITS, DEFAULT_MASK_BITS, MAX_POLYGON_VERTICES, NULL_INDEX,
};
use crate::utilities::bounding_box::Aabb;
use crate::utilities::math::Transform;
use glam::Vec2;

/// Collision filtering bits. Two shapes collide when each one's mask
/// selects the other's category, unless a shared non-zero group overrides
/// the decision (positive group: always collide, negative: never).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Filter {
    pub category_bits: u64,
    pub mask_bits: u64,
    pub group_index: i32,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            category_bits: DEFAULT_CATEGORY_BITS,
            mask_bits: DEFAULT_MASK_BITS,
            group_index: 0,
        }
    }
}

pub fn should_shapes_collide(a: Filter, b: Filter) -> bool {
    if a.group_index == b.group_index && a.group_index != 0 {
        return a.group_index > 0;
    }
    (a.mask_bits & b.category_bits) != 0 && (a.category_bits & b.mask_bits) != 0
}

#[derive(Clone, Copy, Debug)]
pub struct Circle {
    pub center: Vec2,
    pub radius: f32,
}

/// Convex polygon with precomputed edge normals and centroid. Vertices are
/// counterclockwise. An optional radius rounds the corners.
#[derive(Clone, Copy, Debug)]
pub struct Polygon {
    pub vertices: [Vec2; MAX_POLYGON_VERTICES],
    pub normals: [Vec2; MAX_POLYGON_VERTICES],
    pub centroid: Vec2,
    pub radius: f32,
    pub count: i32,
}

impl Polygon {
    /// Builds a polygon from counterclockwise convex points.
    pub fn new(points: &[Vec2], radius: f32) -> Self {
        debug_assert!(points.len() >= 2 && points.len() <= MAX_POLYGON_VERTICES);
        let mut vertices = [Vec2::ZERO; MAX_POLYGON_VERTICES];
        let mut normals = [Vec2::ZERO; MAX_POLYGON_VERTICES];
        vertices[..points.len()].copy_from_slice(points);
        let count = points.len();
        for i in 0..count {
            let i2 = if i + 1 < count { i + 1 } else { 0 };
            let edge = vertices[i2] - vertices[i];
            debug_assert!(edge.length_squared() > f32::EPSILON * f32::EPSILON);
            normals[i] = crate::utilities::math::right_perp(edge).normalize();
        }
        let centroid = compute_polygon_centroid(&vertices[..count]);
        Self {
            vertices,
            normals,
            centroid,
            radius,
            count: count as i32,
        }
    }

    pub fn make_box(half_width: f32, half_height: f32) -> Self {
        Self::make_offset_box(half_width, half_height, Vec2::ZERO, 0.0)
    }

    pub fn make_square(half_extent: f32) -> Self {
        Self::make_box(half_extent, half_extent)
    }

    pub fn make_offset_box(half_width: f32, half_height: f32, center: Vec2, angle: f32) -> Self {
        let xf = Transform {
            p: center,
            q: crate::utilities::math::Rot::from_angle(angle),
        };
        let points = [
            xf.point(Vec2::new(-half_width, -half_height)),
            xf.point(Vec2::new(half_width, -half_height)),
            xf.point(Vec2::new(half_width, half_height)),
            xf.point(Vec2::new(-half_width, half_height)),
        ];
        Self::new(&points, 0.0)
    }
}

fn compute_polygon_centroid(vertices: &[Vec2]) -> Vec2 {
    if vertices.len() == 2 {
        return 0.5 * (vertices[0] + vertices[1]);
    }
    let origin = vertices[0];
    let mut center = Vec2::ZERO;
    let mut area = 0.0;
    for i in 1..vertices.len() - 1 {
        let e1 = vertices[i] - origin;
        let e2 = vertices[i + 1] - origin;
        let a = 0.5 * crate::utilities::math::cross(e1, e2);
        center += a * (e1 + e2) / 3.0;
        area += a;
    }
    debug_assert!(area > f32::EPSILON);
    origin + center / area
}

/// A line segment. Also the geometry of a chain segment, which carries the
/// one-sided chain semantics in its shape kind.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub point1: Vec2,
    pub point2: Vec2,
}

#[derive(Clone, Copy, Debug)]
pub enum ShapeGeometry {
    Circle(Circle),
    Polygon(Polygon),
    Segment(Segment),
    ChainSegment(Segment),
}

/// Mass properties of a shape about its own centroid.
#[derive(Clone, Copy, Debug, Default)]
pub struct MassData {
    pub mass: f32,
    pub center: Vec2,
    /// Rotational inertia about `center`.
    pub rotational_inertia: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct ShapeExtent {
    pub min_extent: f32,
    pub max_extent: f32,
}

/// Definition used to attach a shape to a body.
#[derive(Clone, Copy, Debug)]
pub struct ShapeDef {
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
    pub filter: Filter,
    pub is_sensor: bool,
    pub enable_sensor_events: bool,
    pub enable_contact_events: bool,
    pub enable_hit_events: bool,
    pub enable_pre_solve_events: bool,
    pub enable_custom_filtering: bool,
}

impl Default for ShapeDef {
    fn default() -> Self {
        Self {
            density: 1.0,
            friction: 0.6,
            restitution: 0.0,
            filter: Filter::default(),
            is_sensor: false,
            enable_sensor_events: true,
            enable_contact_events: true,
            enable_hit_events: false,
            enable_pre_solve_events: false,
            enable_custom_filtering: false,
        }
    }
}

/// Per-shape record. Shapes live in a dense world array addressed by id;
/// a body's shapes form an intrusive list through `next_shape_id`.
pub struct Shape {
    pub id: i32,
    pub body_id: i32,
    pub next_shape_id: i32,
    pub geometry: ShapeGeometry,
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
    pub filter: Filter,
    /// Tight bounds at the current transform, inflated by the speculative
    /// distance.
    pub aabb: Aabb,
    /// Broad-phase bounds with margin; proxies only move when the tight
    /// bounds escape these.
    pub fat_aabb: Aabb,
    pub local_centroid: Vec2,
    pub proxy_key: i32,
    /// Index into the world sensor array, or null for solid shapes.
    pub sensor_index: i32,
    pub generation: u32,
    pub enlarged_aabb: bool,
    pub enable_sensor_events: bool,
    pub enable_contact_events: bool,
    pub enable_hit_events: bool,
    pub enable_pre_solve_events: bool,
    pub enable_custom_filtering: bool,
}

impl Shape {
    #[inline(always)]
    pub fn is_sensor(&self) -> bool {
        self.sensor_index != NULL_INDEX
    }

    pub fn compute_aabb(&self, xf: Transform) -> Aabb {
        match &self.geometry {
            ShapeGeometry::Circle(circle) => {
                let p = xf.point(circle.center);
                let r = Vec2::splat(circle.radius);
                Aabb::new(p - r, p + r)
            }
            ShapeGeometry::Polygon(poly) => {
                let mut lower = xf.point(poly.vertices[0]);
                let mut upper = lower;
                for i in 1..poly.count as usize {
                    let v = xf.point(poly.vertices[i]);
                    lower = lower.min(v);
                    upper = upper.max(v);
                }
                let r = Vec2::splat(poly.radius);
                Aabb::new(lower - r, upper + r)
            }
            ShapeGeometry::Segment(segment) | ShapeGeometry::ChainSegment(segment) => {
                let p1 = xf.point(segment.point1);
                let p2 = xf.point(segment.point2);
                Aabb::new(p1.min(p2), p1.max(p2))
            }
        }
    }

    pub fn centroid(&self) -> Vec2 {
        match &self.geometry {
            ShapeGeometry::Circle(circle) => circle.center,
            ShapeGeometry::Polygon(poly) => poly.centroid,
            ShapeGeometry::Segment(segment) | ShapeGeometry::ChainSegment(segment) => {
                0.5 * (segment.point1 + segment.point2)
            }
        }
    }

    pub fn mass_data(&self) -> MassData {
        match &self.geometry {
            ShapeGeometry::Circle(circle) => {
                let mass = self.density * std::f32::consts::PI * circle.radius * circle.radius;
                MassData {
                    mass,
                    center: circle.center,
                    rotational_inertia: 0.5 * mass * circle.radius * circle.radius,
                }
            }
            ShapeGeometry::Polygon(poly) => polygon_mass(poly, self.density),
            ShapeGeometry::Segment(_) | ShapeGeometry::ChainSegment(_) => MassData::default(),
        }
    }

    /// Minimum and maximum extents relative to `local_center`, used by
    /// continuous collision (core radius) and sleep (lever arm).
    pub fn extents(&self, local_center: Vec2) -> ShapeExtent {
        match &self.geometry {
            ShapeGeometry::Circle(circle) => ShapeExtent {
                min_extent: circle.radius,
                max_extent: (circle.center - local_center).length() + circle.radius,
            },
            ShapeGeometry::Polygon(poly) => {
                let mut min_extent = f32::MAX;
                let mut max_extent: f32 = 0.0;
                for i in 0..poly.count as usize {
                    let v = poly.vertices[i];
                    let plane_offset = poly.normals[i].dot(v - local_center);
                    min_extent = min_extent.min(plane_offset);
                    max_extent = max_extent.max((v - local_center).length());
                }
                ShapeExtent {
                    min_extent: min_extent + poly.radius,
                    max_extent: max_extent + poly.radius,
                }
            }
            ShapeGeometry::Segment(segment) | ShapeGeometry::ChainSegment(segment) => ShapeExtent {
                min_extent: 0.0,
                max_extent: (segment.point1 - local_center)
                    .length()
                    .max((segment.point2 - local_center).length()),
            },
        }
    }

    pub fn distance_proxy(&self) -> DistanceProxy {
        match &self.geometry {
            ShapeGeometry::Circle(circle) => DistanceProxy::new(&[circle.center], circle.radius),
            ShapeGeometry::Polygon(poly) => {
                DistanceProxy::new(&poly.vertices[..poly.count as usize], poly.radius)
            }
            ShapeGeometry::Segment(segment) | ShapeGeometry::ChainSegment(segment) => {
                DistanceProxy::new(&[segment.point1, segment.point2], 0.0)
            }
        }
    }
}

fn polygon_mass(poly: &Polygon, density: f32) -> MassData {
    debug_assert!(poly.count >= 3, "degenerate polygon has no area");

    let origin = poly.vertices[0];
    let mut area = 0.0;
    let mut center = Vec2::ZERO;
    let mut rot_inertia = 0.0;

    for i in 1..poly.count as usize - 1 {
        let e1 = poly.vertices[i] - origin;
        let e2 = poly.vertices[i + 1] - origin;
        let d = crate::utilities::math::cross(e1, e2);
        let triangle_area = 0.5 * d;
        area += triangle_area;
        center += triangle_area * (e1 + e2) / 3.0;

        let int_x2 = e1.x * e1.x + e2.x * e1.x + e2.x * e2.x;
        let int_y2 = e1.y * e1.y + e2.y * e1.y + e2.y * e2.y;
        rot_inertia += (0.25 / 3.0) * d * (int_x2 + int_y2);
    }

    let mass = density * area;
    center /= area;
    // Inertia relative to the origin vertex, shifted to the centroid.
    let inertia_about_origin = density * rot_inertia;
    let rotational_inertia = inertia_about_origin - mass * center.length_squared();

    MassData {
        mass,
        center: origin + center,
        rotational_inertia,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn filter_groups_override_masks() {
        let mut a = Filter::default();
        let mut b = Filter::default();
        assert!(should_shapes_collide(a, b));

        a.group_index = -3;
        b.group_index = -3;
        assert!(!should_shapes_collide(a, b));

        a.group_index = 3;
        b.group_index = 3;
        a.mask_bits = 0;
        assert!(should_shapes_collide(a, b));
    }

    #[test]
    fn box_mass_matches_closed_form() {
        let shape_density = 2.0;
        let poly = Polygon::make_box(0.5, 1.0);
        let md = polygon_mass(&poly, shape_density);
        // m = rho * w * h; I = m (w^2 + h^2) / 12
        assert_relative_eq!(md.mass, 2.0 * 1.0 * 2.0, epsilon = 1.0e-4);
        assert_relative_eq!(md.center.x, 0.0, epsilon = 1.0e-6);
        assert_relative_eq!(
            md.rotational_inertia,
            md.mass * (1.0 + 4.0) / 12.0,
            epsilon = 1.0e-3
        );
    }

    #[test]
    fn polygon_normals_point_outward() {
        let poly = Polygon::make_box(1.0, 1.0);
        for i in 0..poly.count as usize {
            let v = poly.vertices[i];
            assert!(poly.normals[i].dot(v - poly.centroid) > 0.0);
        }
    }
}
