//! Contact manifold generation between convex shape pairs.
//!
//! Manifolds are speculative: points are produced while the surfaces are
//! within the speculative distance, with positive separation. The solver
//! turns speculative points into constraints that only push once the gap
//! actually closes.

use crate::physics::shape::{Circle, Polygon, Segment};
use crate::physics::{LINEAR_SLOP, SPECULATIVE_DISTANCE};
use crate::utilities::math::{get_length_and_normalize, right_perp, Transform};
use glam::Vec2;

pub const MAX_MANIFOLD_POINTS: usize = 2;

#[derive(Clone, Copy, Debug, Default)]
pub struct ManifoldPoint {
    /// World contact point, midway between the surfaces.
    pub point: Vec2,
    /// Signed gap along the manifold normal. Negative means overlap.
    pub separation: f32,
    pub normal_impulse: f32,
    pub tangent_impulse: f32,
    /// Largest normal impulse applied across the substeps of the last
    /// solve. Speculative points that never collided keep zero.
    pub total_normal_impulse: f32,
    /// Normal relative velocity after the last solve. Used by hit events.
    pub normal_velocity: f32,
    /// Feature id for warm-start matching across steps.
    pub id: u16,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Manifold {
    pub points: [ManifoldPoint; MAX_MANIFOLD_POINTS],
    /// World unit normal, from shape A toward shape B.
    pub normal: Vec2,
    pub point_count: i32,
}

#[inline(always)]
fn make_point_id(a: u8, b: u8) -> u16 {
    ((a as u16) << 8) | b as u16
}

pub fn collide_circles(
    circle_a: &Circle,
    xf_a: Transform,
    circle_b: &Circle,
    xf_b: Transform,
) -> Manifold {
    let mut manifold = Manifold::default();

    // Work in the frame of shape A.
    let xf = xf_a.inv_mul(xf_b);

    let p_a = circle_a.center;
    let p_b = xf.point(circle_b.center);

    let (normal, distance) = get_length_and_normalize(p_b - p_a);
    let separation = distance - circle_a.radius - circle_b.radius;
    if separation > SPECULATIVE_DISTANCE {
        return manifold;
    }

    let c_a = p_a + circle_a.radius * normal;
    let c_b = p_b - circle_b.radius * normal;

    manifold.normal = xf_a.q.rotate(normal);
    let mp = &mut manifold.points[0];
    mp.point = xf_a.point(0.5 * (c_a + c_b));
    mp.separation = separation;
    mp.id = 0;
    manifold.point_count = 1;
    manifold
}

pub fn collide_polygon_and_circle(
    polygon_a: &Polygon,
    xf_a: Transform,
    circle_b: &Circle,
    xf_b: Transform,
) -> Manifold {
    let mut manifold = Manifold::default();
    let speculative_distance = SPECULATIVE_DISTANCE;

    let xf = xf_a.inv_mul(xf_b);
    let c = xf.point(circle_b.center);
    let radius = polygon_a.radius + circle_b.radius;

    // Deepest-penetration edge
    let mut normal_index = 0;
    let mut separation = -f32::MAX;
    let count = polygon_a.count as usize;
    for i in 0..count {
        let s = polygon_a.normals[i].dot(c - polygon_a.vertices[i]);
        if s > separation {
            separation = s;
            normal_index = i;
        }
    }

    if separation > radius + speculative_distance {
        return manifold;
    }

    let v1 = polygon_a.vertices[normal_index];
    let v2 = polygon_a.vertices[(normal_index + 1) % count];

    let (local_normal, local_point) = if separation < f32::EPSILON {
        // Center is inside the polygon
        let normal = polygon_a.normals[normal_index];
        (normal, 0.5 * (v1 + v2))
    } else {
        let u1 = (c - v1).dot(v2 - v1);
        let u2 = (c - v2).dot(v1 - v2);
        if u1 < 0.0 {
            let (normal, _) = get_length_and_normalize(c - v1);
            (normal, v1)
        } else if u2 < 0.0 {
            let (normal, _) = get_length_and_normalize(c - v2);
            (normal, v2)
        } else {
            let normal = polygon_a.normals[normal_index];
            (normal, c - (c - v1).dot(normal) * normal)
        }
    };

    let sep = (c - local_point).dot(local_normal) - radius;
    if sep > speculative_distance {
        return manifold;
    }

    let c_a = local_point + polygon_a.radius * local_normal;
    let c_b = c - circle_b.radius * local_normal;

    manifold.normal = xf_a.q.rotate(local_normal);
    let mp = &mut manifold.points[0];
    mp.point = xf_a.point(0.5 * (c_a + c_b));
    mp.separation = sep;
    mp.id = 0;
    manifold.point_count = 1;
    manifold
}

pub fn collide_segment_and_circle(
    segment_a: &Segment,
    xf_a: Transform,
    circle_b: &Circle,
    xf_b: Transform,
) -> Manifold {
    let mut manifold = Manifold::default();

    let xf = xf_a.inv_mul(xf_b);
    let c = xf.point(circle_b.center);

    let p1 = segment_a.point1;
    let p2 = segment_a.point2;
    let e = p2 - p1;
    let denom = e.length_squared();
    if denom < f32::EPSILON {
        return manifold;
    }
    let t = ((c - p1).dot(e) / denom).clamp(0.0, 1.0);
    let closest = p1 + t * e;

    let (mut normal, distance) = get_length_and_normalize(c - closest);
    if distance < f32::EPSILON {
        // Center on the segment; push out along the segment normal.
        normal = right_perp(e).normalize();
    }

    let separation = distance - circle_b.radius;
    if separation > SPECULATIVE_DISTANCE {
        return manifold;
    }

    let c_a = closest;
    let c_b = c - circle_b.radius * normal;

    manifold.normal = xf_a.q.rotate(normal);
    let mp = &mut manifold.points[0];
    mp.point = xf_a.point(0.5 * (c_a + c_b));
    mp.separation = separation;
    mp.id = 0;
    manifold.point_count = 1;
    manifold
}

pub fn collide_segment_and_polygon(
    segment_a: &Segment,
    xf_a: Transform,
    polygon_b: &Polygon,
    xf_b: Transform,
) -> Manifold {
    // A segment behaves as a two-vertex polygon with opposing normals.
    let two_gon = polygon_from_segment(segment_a);
    collide_polygons(&two_gon, xf_a, polygon_b, xf_b)
}

fn polygon_from_segment(segment: &Segment) -> Polygon {
    let mut poly = Polygon {
        vertices: [Vec2::ZERO; crate::physics::MAX_POLYGON_VERTICES],
        normals: [Vec2::ZERO; crate::physics::MAX_POLYGON_VERTICES],
        centroid: 0.5 * (segment.point1 + segment.point2),
        radius: 0.0,
        count: 2,
    };
    poly.vertices[0] = segment.point1;
    poly.vertices[1] = segment.point2;
    let n = right_perp(segment.point2 - segment.point1).normalize();
    poly.normals[0] = n;
    poly.normals[1] = -n;
    poly
}

/// Max separation of `poly2`'s vertices from `poly1`'s edges, both in the
/// same frame. Returns (separation, edge index on poly1).
fn find_max_separation(poly1: &Polygon, poly2: &Polygon) -> (f32, usize) {
    let count1 = poly1.count as usize;
    let count2 = poly2.count as usize;
    let mut best_separation = -f32::MAX;
    let mut best_edge = 0;

    for i in 0..count1 {
        let n = poly1.normals[i];
        let v = poly1.vertices[i];
        let mut si = f32::MAX;
        for j in 0..count2 {
            let sij = n.dot(poly2.vertices[j] - v);
            si = si.min(sij);
        }
        if si > best_separation {
            best_separation = si;
            best_edge = i;
        }
    }
    (best_separation, best_edge)
}

/// SAT + reference/incident edge clipping. Both polygons may be rounded.
pub fn collide_polygons(
    polygon_a: &Polygon,
    xf_a: Transform,
    polygon_b: &Polygon,
    xf_b: Transform,
) -> Manifold {
    let mut manifold = Manifold::default();

    // Transform B into A's frame.
    let xf = xf_a.inv_mul(xf_b);
    let mut local_b = *polygon_b;
    for i in 0..local_b.count as usize {
        local_b.vertices[i] = xf.point(polygon_b.vertices[i]);
        local_b.normals[i] = xf.q.rotate(polygon_b.normals[i]);
    }
    local_b.centroid = xf.point(polygon_b.centroid);

    let radius = polygon_a.radius + polygon_b.radius;

    let (separation_a, edge_a) = find_max_separation(polygon_a, &local_b);
    if separation_a > SPECULATIVE_DISTANCE + radius {
        return manifold;
    }

    let (separation_b, edge_b) = find_max_separation(&local_b, polygon_a);
    if separation_b > SPECULATIVE_DISTANCE + radius {
        return manifold;
    }

    // Prefer A as the reference polygon unless B is clearly deeper.
    let flip = separation_b > separation_a + 0.1 * LINEAR_SLOP;
    let (reference_poly, incident_poly, reference_edge) = if flip {
        (&local_b, polygon_a, edge_b)
    } else {
        (polygon_a, &local_b, edge_a)
    };

    let ref_count = reference_poly.count as usize;
    let inc_count = incident_poly.count as usize;

    let ref_normal = reference_poly.normals[reference_edge];

    // Most anti-parallel edge on the incident polygon.
    let mut incident_edge = 0;
    let mut min_dot = f32::MAX;
    for i in 0..inc_count {
        let d = ref_normal.dot(incident_poly.normals[i]);
        if d < min_dot {
            min_dot = d;
            incident_edge = i;
        }
    }

    let i11 = reference_edge;
    let i12 = (reference_edge + 1) % ref_count;
    let i21 = incident_edge;
    let i22 = (incident_edge + 1) % inc_count;

    let v11 = reference_poly.vertices[i11];
    let v12 = reference_poly.vertices[i12];
    let mut w1 = incident_poly.vertices[i21];
    let mut w2 = incident_poly.vertices[i22];

    let (tangent, edge_length) = get_length_and_normalize(v12 - v11);
    if edge_length < f32::EPSILON {
        return manifold;
    }

    // Clip the incident edge to the reference edge's extent.
    let mut s1 = (w1 - v11).dot(tangent);
    let mut s2 = (w2 - v11).dot(tangent);
    let ds = s2 - s1;
    if ds.abs() > f32::EPSILON {
        if s1 < 0.0 {
            w1 += (0.0 - s1) / ds * (w2 - w1);
            s1 = 0.0;
        } else if s1 > edge_length {
            w1 += (edge_length - s1) / ds * (w2 - w1);
            s1 = edge_length;
        }
        if s2 < 0.0 {
            w2 += (0.0 - s2) / (s1 - s2) * (w1 - w2);
        } else if s2 > edge_length {
            w2 += (edge_length - s2) / (s1 - s2) * (w1 - w2);
        }
    }

    let r_incident = incident_poly.radius;

    let mut point_count = 0;
    for (clip_index, w) in [w1, w2].into_iter().enumerate() {
        let separation = (w - v11).dot(ref_normal) - radius;
        if separation > SPECULATIVE_DISTANCE {
            continue;
        }
        let mp = &mut manifold.points[point_count];
        // Midway between the two surfaces along the normal.
        mp.point = w - (0.5 * separation + r_incident) * ref_normal;
        mp.separation = separation;
        mp.id = if clip_index == 0 {
            make_point_id(i11 as u8, i21 as u8)
        } else {
            make_point_id(i12 as u8, i22 as u8)
        };
        point_count += 1;
    }
    manifold.point_count = point_count as i32;

    let mut local_normal = ref_normal;
    if flip {
        local_normal = -local_normal;
        // Keep ids stable regardless of which polygon won the reference
        // role by byte-swapping.
        for i in 0..point_count {
            let id = manifold.points[i].id;
            manifold.points[i].id = id.rotate_left(8);
        }
    }

    manifold.normal = xf_a.q.rotate(local_normal);
    for i in 0..point_count {
        manifold.points[i].point = xf_a.point(manifold.points[i].point);
    }
    manifold
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn touching_circles_produce_one_point() {
        let a = Circle {
            center: Vec2::ZERO,
            radius: 0.5,
        };
        let b = Circle {
            center: Vec2::ZERO,
            radius: 0.5,
        };
        let xf_b = Transform {
            p: Vec2::new(0.99, 0.0),
            q: crate::utilities::math::Rot::IDENTITY,
        };
        let m = collide_circles(&a, Transform::IDENTITY, &b, xf_b);
        assert_eq!(m.point_count, 1);
        assert_relative_eq!(m.normal.x, 1.0, epsilon = 1.0e-6);
        assert_relative_eq!(m.points[0].separation, -0.01, epsilon = 1.0e-5);
    }

    #[test]
    fn distant_circles_produce_nothing() {
        let a = Circle {
            center: Vec2::ZERO,
            radius: 0.5,
        };
        let b = Circle {
            center: Vec2::ZERO,
            radius: 0.5,
        };
        let xf_b = Transform {
            p: Vec2::new(2.0, 0.0),
            q: crate::utilities::math::Rot::IDENTITY,
        };
        let m = collide_circles(&a, Transform::IDENTITY, &b, xf_b);
        assert_eq!(m.point_count, 0);
    }

    #[test]
    fn box_resting_on_box_produces_two_points() {
        let a = Polygon::make_box(4.0, 0.5);
        let b = Polygon::make_box(0.5, 0.5);
        let xf_b = Transform {
            p: Vec2::new(0.0, 0.999),
            q: crate::utilities::math::Rot::IDENTITY,
        };
        let m = collide_polygons(&a, Transform::IDENTITY, &b, xf_b);
        assert_eq!(m.point_count, 2);
        // Normal from A (the slab) toward B (the box above).
        assert_relative_eq!(m.normal.y, 1.0, epsilon = 1.0e-5);
        for i in 0..2 {
            assert_relative_eq!(m.points[i].separation, -0.001, epsilon = 1.0e-4);
        }
        // Points straddle the box center.
        assert!(m.points[0].point.x != m.points[1].point.x);
    }

    #[test]
    fn speculative_gap_keeps_points_with_positive_separation() {
        let a = Polygon::make_box(4.0, 0.5);
        let b = Polygon::make_box(0.5, 0.5);
        let gap = 0.5 * SPECULATIVE_DISTANCE;
        let xf_b = Transform {
            p: Vec2::new(0.0, 1.0 + gap),
            q: crate::utilities::math::Rot::IDENTITY,
        };
        let m = collide_polygons(&a, Transform::IDENTITY, &b, xf_b);
        assert_eq!(m.point_count, 2);
        for i in 0..2 {
            assert!(m.points[i].separation > 0.0);
            assert_relative_eq!(m.points[i].separation, gap, epsilon = 1.0e-4);
        }
    }

    #[test]
    fn segment_supports_polygon_contact() {
        let seg = Segment {
            point1: Vec2::new(-5.0, 0.0),
            point2: Vec2::new(5.0, 0.0),
        };
        let b = Polygon::make_box(0.5, 0.5);
        let xf_b = Transform {
            p: Vec2::new(0.0, 0.49),
            q: crate::utilities::math::Rot::IDENTITY,
        };
        let m = collide_segment_and_polygon(&seg, Transform::IDENTITY, &b, xf_b);
        assert_eq!(m.point_count, 2);
        assert_relative_eq!(m.normal.y, 1.0, epsilon = 1.0e-5);
    }
}
