//! 2D rotation, transform, and sweep math shared by the whole pipeline.

use glam::Vec2;

/// A 2D rotation stored as the cosine/sine pair of the rotation angle.
/// Cheaper to compose and rotate with than an angle, and trivially
/// normalizable after incremental integration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rot {
    pub c: f32,
    pub s: f32,
}

impl Rot {
    pub const IDENTITY: Rot = Rot { c: 1.0, s: 0.0 };

    #[inline(always)]
    pub fn from_angle(angle: f32) -> Self {
        Self {
            c: angle.cos(),
            s: angle.sin(),
        }
    }

    #[inline(always)]
    pub fn angle(&self) -> f32 {
        self.s.atan2(self.c)
    }

    /// q * r
    #[inline(always)]
    pub fn mul(&self, r: Rot) -> Rot {
        Rot {
            c: self.c * r.c - self.s * r.s,
            s: self.s * r.c + self.c * r.s,
        }
    }

    /// inv(q) * r
    #[inline(always)]
    pub fn inv_mul(&self, r: Rot) -> Rot {
        Rot {
            c: self.c * r.c + self.s * r.s,
            s: self.c * r.s - self.s * r.c,
        }
    }

    #[inline(always)]
    pub fn rotate(&self, v: Vec2) -> Vec2 {
        Vec2::new(self.c * v.x - self.s * v.y, self.s * v.x + self.c * v.y)
    }

    #[inline(always)]
    pub fn inv_rotate(&self, v: Vec2) -> Vec2 {
        Vec2::new(self.c * v.x + self.s * v.y, -self.s * v.x + self.c * v.y)
    }

    #[inline(always)]
    pub fn normalize(&self) -> Rot {
        let mag = (self.s * self.s + self.c * self.c).sqrt();
        let inv_mag = if mag > 0.0 { 1.0 / mag } else { 0.0 };
        Rot {
            c: self.c * inv_mag,
            s: self.s * inv_mag,
        }
    }

    /// Integrates the rotation by `delta_angle` using the exponential map
    /// approximation followed by normalization. Valid for the small angular
    /// steps produced by a substep.
    #[inline(always)]
    pub fn integrate(&self, delta_angle: f32) -> Rot {
        let q2 = Rot {
            c: self.c - delta_angle * self.s,
            s: self.s + delta_angle * self.c,
        };
        q2.normalize()
    }

    /// Normalized linear interpolation. Produces the shortest arc for the
    /// small relative rotations a sweep covers.
    #[inline(always)]
    pub fn nlerp(q1: Rot, q2: Rot, t: f32) -> Rot {
        let omt = 1.0 - t;
        let q = Rot {
            c: omt * q1.c + t * q2.c,
            s: omt * q1.s + t * q2.s,
        };
        q.normalize()
    }

    /// Relative angle from `q1` to `q2` in radians.
    #[inline(always)]
    pub fn relative_angle(q1: Rot, q2: Rot) -> f32 {
        let s = q1.c * q2.s - q1.s * q2.c;
        let c = q1.c * q2.c + q1.s * q2.s;
        s.atan2(c)
    }
}

/// A rigid transform: rotation followed by translation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub p: Vec2,
    pub q: Rot,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        p: Vec2::ZERO,
        q: Rot::IDENTITY,
    };

    #[inline(always)]
    pub fn point(&self, v: Vec2) -> Vec2 {
        self.q.rotate(v) + self.p
    }

    #[inline(always)]
    pub fn inv_point(&self, v: Vec2) -> Vec2 {
        self.q.inv_rotate(v - self.p)
    }

    /// a * b
    #[inline(always)]
    pub fn mul(&self, b: Transform) -> Transform {
        Transform {
            p: self.q.rotate(b.p) + self.p,
            q: self.q.mul(b.q),
        }
    }

    /// inv(a) * b
    #[inline(always)]
    pub fn inv_mul(&self, b: Transform) -> Transform {
        Transform {
            p: self.q.inv_rotate(b.p - self.p),
            q: self.q.inv_mul(b.q),
        }
    }
}

/// Motion of a body's center of mass across a step, used by the continuous
/// collision pipeline. Rotations interpolate with nlerp.
#[derive(Clone, Copy, Debug)]
pub struct Sweep {
    pub local_center: Vec2,
    pub c1: Vec2,
    pub c2: Vec2,
    pub q1: Rot,
    pub q2: Rot,
}

impl Sweep {
    /// Body origin transform at sweep fraction `t`.
    pub fn transform_at(&self, t: f32) -> Transform {
        let q = Rot::nlerp(self.q1, self.q2, t);
        let c = self.c1.lerp(self.c2, t);
        Transform {
            p: c - q.rotate(self.local_center),
            q,
        }
    }
}

/// 2D cross product (z component of the 3D cross).
#[inline(always)]
pub fn cross(a: Vec2, b: Vec2) -> f32 {
    a.x * b.y - a.y * b.x
}

/// Cross of a scalar (angular velocity) with a vector.
#[inline(always)]
pub fn cross_sv(s: f32, v: Vec2) -> Vec2 {
    Vec2::new(-s * v.y, s * v.x)
}

/// Counterclockwise perpendicular.
#[inline(always)]
pub fn left_perp(v: Vec2) -> Vec2 {
    Vec2::new(-v.y, v.x)
}

/// Clockwise perpendicular.
#[inline(always)]
pub fn right_perp(v: Vec2) -> Vec2 {
    Vec2::new(v.y, -v.x)
}

/// Normalizes `v`, returning the length as well. Zero-length input yields
/// a zero vector and zero length.
#[inline(always)]
pub fn get_length_and_normalize(v: Vec2) -> (Vec2, f32) {
    let length = v.length();
    if length < f32::EPSILON {
        return (Vec2::ZERO, 0.0);
    }
    (v / length, length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rotation_round_trip() {
        let q = Rot::from_angle(0.7);
        let v = Vec2::new(3.0, -2.0);
        let r = q.inv_rotate(q.rotate(v));
        assert_relative_eq!(r.x, v.x, epsilon = 1.0e-6);
        assert_relative_eq!(r.y, v.y, epsilon = 1.0e-6);
    }

    #[test]
    fn integrate_matches_from_angle_for_small_steps() {
        let mut q = Rot::IDENTITY;
        let h = 0.25 * std::f32::consts::PI / 64.0;
        for _ in 0..64 {
            q = q.integrate(h);
        }
        assert_relative_eq!(q.angle(), 0.25 * std::f32::consts::PI, epsilon = 1.0e-3);
    }

    #[test]
    fn transform_inverse_composition() {
        let a = Transform {
            p: Vec2::new(1.0, 2.0),
            q: Rot::from_angle(0.3),
        };
        let b = Transform {
            p: Vec2::new(-4.0, 0.5),
            q: Rot::from_angle(-1.1),
        };
        let ab = a.mul(b);
        let b2 = a.inv_mul(ab);
        assert_relative_eq!(b2.p.x, b.p.x, epsilon = 1.0e-5);
        assert_relative_eq!(b2.p.y, b.p.y, epsilon = 1.0e-5);
        assert_relative_eq!(b2.q.angle(), b.q.angle(), epsilon = 1.0e-5);
    }
}
