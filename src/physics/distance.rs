//! GJK closest-point query between convex proxies.

use crate::physics::MAX_POLYGON_VERTICES;
use crate::utilities::math::Transform;
use glam::Vec2;

/// A convex point cloud with a rounding radius, extracted from a shape for
/// distance and time-of-impact queries.
#[derive(Clone, Copy, Debug)]
pub struct DistanceProxy {
    pub points: [Vec2; MAX_POLYGON_VERTICES],
    pub count: i32,
    pub radius: f32,
}

impl DistanceProxy {
    pub fn new(points: &[Vec2], radius: f32) -> Self {
        debug_assert!(!points.is_empty() && points.len() <= MAX_POLYGON_VERTICES);
        let mut storage = [Vec2::ZERO; MAX_POLYGON_VERTICES];
        storage[..points.len()].copy_from_slice(points);
        Self {
            points: storage,
            count: points.len() as i32,
            radius,
        }
    }

    /// Index of the support point in direction `d`.
    #[inline]
    fn support(&self, d: Vec2) -> i32 {
        let mut best_index = 0;
        let mut best_value = self.points[0].dot(d);
        for i in 1..self.count as usize {
            let value = self.points[i].dot(d);
            if value > best_value {
                best_index = i;
                best_value = value;
            }
        }
        best_index as i32
    }

    /// Largest distance of any point from the origin of the proxy frame.
    /// Used by conservative advancement as a rotation bound.
    pub fn max_radius(&self) -> f32 {
        let mut r: f32 = 0.0;
        for i in 0..self.count as usize {
            r = r.max(self.points[i].length());
        }
        r + self.radius
    }
}

/// Warm-start cache carrying the simplex vertices of a previous query.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimplexCache {
    pub count: u16,
    pub index_a: [u8; 3],
    pub index_b: [u8; 3],
}

pub struct DistanceInput {
    pub proxy_a: DistanceProxy,
    pub proxy_b: DistanceProxy,
    pub transform_a: Transform,
    pub transform_b: Transform,
    pub use_radii: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct DistanceOutput {
    pub point_a: Vec2,
    pub point_b: Vec2,
    /// Unit vector from A's witness point toward B's. Zero when the
    /// proxies overlap.
    pub normal: Vec2,
    pub distance: f32,
    pub iterations: i32,
}

#[derive(Clone, Copy, Default)]
struct SimplexVertex {
    w_a: Vec2,
    w_b: Vec2,
    /// w_b - w_a
    w: Vec2,
    /// Barycentric weight
    a: f32,
    index_a: i32,
    index_b: i32,
}

#[derive(Clone, Copy, Default)]
struct Simplex {
    v: [SimplexVertex; 3],
    count: i32,
}

impl Simplex {
    fn read_cache(cache: &SimplexCache, input: &DistanceInput) -> Self {
        let mut simplex = Simplex::default();
        simplex.count = cache.count as i32;
        for i in 0..simplex.count as usize {
            let v = &mut simplex.v[i];
            v.index_a = cache.index_a[i] as i32;
            v.index_b = cache.index_b[i] as i32;
            let local_a = input.proxy_a.points[v.index_a as usize];
            let local_b = input.proxy_b.points[v.index_b as usize];
            v.w_a = input.transform_a.point(local_a);
            v.w_b = input.transform_b.point(local_b);
            v.w = v.w_b - v.w_a;
            v.a = 0.0;
        }
        if simplex.count == 0 {
            let local_a = input.proxy_a.points[0];
            let local_b = input.proxy_b.points[0];
            let v = &mut simplex.v[0];
            v.index_a = 0;
            v.index_b = 0;
            v.w_a = input.transform_a.point(local_a);
            v.w_b = input.transform_b.point(local_b);
            v.w = v.w_b - v.w_a;
            v.a = 1.0;
            simplex.count = 1;
        }
        simplex
    }

    fn write_cache(&self, cache: &mut SimplexCache) {
        cache.count = self.count as u16;
        for i in 0..self.count as usize {
            cache.index_a[i] = self.v[i].index_a as u8;
            cache.index_b[i] = self.v[i].index_b as u8;
        }
    }

    fn search_direction(&self) -> Vec2 {
        match self.count {
            1 => -self.v[0].w,
            2 => {
                let e12 = self.v[1].w - self.v[0].w;
                let sgn = crate::utilities::math::cross(e12, -self.v[0].w);
                if sgn > 0.0 {
                    crate::utilities::math::left_perp(e12)
                } else {
                    crate::utilities::math::right_perp(e12)
                }
            }
            _ => Vec2::ZERO,
        }
    }

    fn closest_point(&self) -> Vec2 {
        match self.count {
            1 => self.v[0].w,
            2 => self.v[0].a * self.v[0].w + self.v[1].a * self.v[1].w,
            _ => Vec2::ZERO,
        }
    }

    fn witness_points(&self) -> (Vec2, Vec2) {
        match self.count {
            1 => (self.v[0].w_a, self.v[0].w_b),
            2 => (
                self.v[0].a * self.v[0].w_a + self.v[1].a * self.v[1].w_a,
                self.v[0].a * self.v[0].w_b + self.v[1].a * self.v[1].w_b,
            ),
            _ => {
                let p = self.v[0].a * self.v[0].w_a
                    + self.v[1].a * self.v[1].w_a
                    + self.v[2].a * self.v[2].w_a;
                (p, p)
            }
        }
    }

    /// Line segment closest-point reduction.
    fn solve2(&mut self) {
        let w1 = self.v[0].w;
        let w2 = self.v[1].w;
        let e12 = w2 - w1;

        let d12_2 = -w1.dot(e12);
        if d12_2 <= 0.0 {
            self.v[0].a = 1.0;
            self.count = 1;
            return;
        }

        let d12_1 = w2.dot(e12);
        if d12_1 <= 0.0 {
            self.v[0] = self.v[1];
            self.v[0].a = 1.0;
            self.count = 1;
            return;
        }

        let inv_d12 = 1.0 / (d12_1 + d12_2);
        self.v[0].a = d12_1 * inv_d12;
        self.v[1].a = d12_2 * inv_d12;
        self.count = 2;
    }

    /// Triangle closest-point reduction using barycentric regions.
    fn solve3(&mut self) {
        let w1 = self.v[0].w;
        let w2 = self.v[1].w;
        let w3 = self.v[2].w;

        let e12 = w2 - w1;
        let w1e12 = w1.dot(e12);
        let w2e12 = w2.dot(e12);
        let d12_1 = w2e12;
        let d12_2 = -w1e12;

        let e13 = w3 - w1;
        let w1e13 = w1.dot(e13);
        let w3e13 = w3.dot(e13);
        let d13_1 = w3e13;
        let d13_2 = -w1e13;

        let e23 = w3 - w2;
        let w2e23 = w2.dot(e23);
        let w3e23 = w3.dot(e23);
        let d23_1 = w3e23;
        let d23_2 = -w2e23;

        let n123 = crate::utilities::math::cross(e12, e13);
        let d123_1 = n123 * crate::utilities::math::cross(w2, w3);
        let d123_2 = n123 * crate::utilities::math::cross(w3, w1);
        let d123_3 = n123 * crate::utilities::math::cross(w1, w2);

        // Vertex 1 region
        if d12_2 <= 0.0 && d13_2 <= 0.0 {
            self.v[0].a = 1.0;
            self.count = 1;
            return;
        }

        // Edge 12 region
        if d12_1 > 0.0 && d12_2 > 0.0 && d123_3 <= 0.0 {
            let inv_d12 = 1.0 / (d12_1 + d12_2);
            self.v[0].a = d12_1 * inv_d12;
            self.v[1].a = d12_2 * inv_d12;
            self.count = 2;
            return;
        }

        // Edge 13 region
        if d13_1 > 0.0 && d13_2 > 0.0 && d123_2 <= 0.0 {
            let inv_d13 = 1.0 / (d13_1 + d13_2);
            self.v[0].a = d13_1 * inv_d13;
            self.v[1] = self.v[2];
            self.v[1].a = d13_2 * inv_d13;
            self.count = 2;
            return;
        }

        // Vertex 2 region
        if d12_1 <= 0.0 && d23_2 <= 0.0 {
            self.v[0] = self.v[1];
            self.v[0].a = 1.0;
            self.count = 1;
            return;
        }

        // Vertex 3 region
        if d13_1 <= 0.0 && d23_1 <= 0.0 {
            self.v[0] = self.v[2];
            self.v[0].a = 1.0;
            self.count = 1;
            return;
        }

        // Edge 23 region
        if d23_1 > 0.0 && d23_2 > 0.0 && d123_1 <= 0.0 {
            let inv_d23 = 1.0 / (d23_1 + d23_2);
            self.v[1].a = d23_1 * inv_d23;
            self.v[0] = self.v[2];
            self.v[0].a = d23_2 * inv_d23;
            self.count = 2;
            return;
        }

        // Interior: the origin is contained.
        let inv_d123 = 1.0 / (d123_1 + d123_2 + d123_3);
        self.v[0].a = d123_1 * inv_d123;
        self.v[1].a = d123_2 * inv_d123;
        self.v[2].a = d123_3 * inv_d123;
        self.count = 3;
    }
}

/// Closest distance between two convex proxies. The cache warm-starts the
/// simplex across repeated queries of the same pair.
pub fn shape_distance(input: &DistanceInput, cache: &mut SimplexCache) -> DistanceOutput {
    let mut simplex = Simplex::read_cache(cache, input);

    const MAX_ITERATIONS: i32 = 20;
    let mut iteration = 0;

    // Vertices considered this iteration, for termination detection.
    let mut save_a = [0i32; 3];
    let mut save_b = [0i32; 3];

    while iteration < MAX_ITERATIONS {
        let save_count = simplex.count as usize;
        for i in 0..save_count {
            save_a[i] = simplex.v[i].index_a;
            save_b[i] = simplex.v[i].index_b;
        }

        match simplex.count {
            1 => {}
            2 => simplex.solve2(),
            3 => simplex.solve3(),
            _ => unreachable!(),
        }

        // A full triangle contains the origin.
        if simplex.count == 3 {
            break;
        }

        let d = simplex.search_direction();
        if d.length_squared() < f32::EPSILON * f32::EPSILON {
            // The origin sits on an edge or vertex of the simplex. Treat as
            // touching; the witness points below are still valid.
            break;
        }

        let index_a = input.proxy_a.support(input.transform_a.q.inv_rotate(-d));
        let index_b = input.proxy_b.support(input.transform_b.q.inv_rotate(d));

        iteration += 1;

        // Check for duplicate support points: converged.
        let mut duplicate = false;
        for i in 0..save_count {
            if index_a == save_a[i] && index_b == save_b[i] {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            break;
        }

        let count = simplex.count as usize;
        let v = &mut simplex.v[count];
        v.index_a = index_a;
        v.index_b = index_b;
        v.w_a = input.transform_a.point(input.proxy_a.points[index_a as usize]);
        v.w_b = input.transform_b.point(input.proxy_b.points[index_b as usize]);
        v.w = v.w_b - v.w_a;
        v.a = 0.0;
        simplex.count += 1;
    }

    let (point_a, point_b) = simplex.witness_points();
    let mut distance = (point_b - point_a).length();
    let mut normal = if distance > f32::EPSILON {
        (point_b - point_a) / distance
    } else {
        Vec2::ZERO
    };

    let mut out_a = point_a;
    let mut out_b = point_b;

    if simplex.count == 3 {
        distance = 0.0;
        normal = Vec2::ZERO;
    }

    if input.use_radii && distance > f32::EPSILON {
        let r_a = input.proxy_a.radius;
        let r_b = input.proxy_b.radius;
        distance = (distance - r_a - r_b).max(0.0);
        out_a = point_a + r_a * normal;
        out_b = point_b - r_b * normal;
        if distance == 0.0 {
            let mid = 0.5 * (out_a + out_b);
            out_a = mid;
            out_b = mid;
        }
    }

    simplex.write_cache(cache);

    DistanceOutput {
        point_a: out_a,
        point_b: out_b,
        normal,
        distance,
        iterations: iteration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_box() -> DistanceProxy {
        DistanceProxy::new(
            &[
                Vec2::new(-0.5, -0.5),
                Vec2::new(0.5, -0.5),
                Vec2::new(0.5, 0.5),
                Vec2::new(-0.5, 0.5),
            ],
            0.0,
        )
    }

    #[test]
    fn separated_boxes() {
        let input = DistanceInput {
            proxy_a: unit_box(),
            proxy_b: unit_box(),
            transform_a: Transform::IDENTITY,
            transform_b: Transform {
                p: Vec2::new(3.0, 0.0),
                q: crate::utilities::math::Rot::IDENTITY,
            },
            use_radii: false,
        };
        let mut cache = SimplexCache::default();
        let out = shape_distance(&input, &mut cache);
        assert_relative_eq!(out.distance, 2.0, epsilon = 1.0e-5);
        assert_relative_eq!(out.normal.x, 1.0, epsilon = 1.0e-5);
    }

    #[test]
    fn overlapping_boxes_report_zero() {
        let input = DistanceInput {
            proxy_a: unit_box(),
            proxy_b: unit_box(),
            transform_a: Transform::IDENTITY,
            transform_b: Transform {
                p: Vec2::new(0.25, 0.1),
                q: crate::utilities::math::Rot::IDENTITY,
            },
            use_radii: false,
        };
        let mut cache = SimplexCache::default();
        let out = shape_distance(&input, &mut cache);
        assert_relative_eq!(out.distance, 0.0, epsilon = 1.0e-6);
    }

    #[test]
    fn circles_with_radii() {
        let input = DistanceInput {
            proxy_a: DistanceProxy::new(&[Vec2::ZERO], 0.5),
            proxy_b: DistanceProxy::new(&[Vec2::ZERO], 0.25),
            transform_a: Transform::IDENTITY,
            transform_b: Transform {
                p: Vec2::new(2.0, 0.0),
                q: crate::utilities::math::Rot::IDENTITY,
            },
            use_radii: true,
        };
        let mut cache = SimplexCache::default();
        let out = shape_distance(&input, &mut cache);
        assert_relative_eq!(out.distance, 1.25, epsilon = 1.0e-5);
        assert_relative_eq!(out.point_a.x, 0.5, epsilon = 1.0e-5);
        assert_relative_eq!(out.point_b.x, 1.75, epsilon = 1.0e-5);
    }
}
