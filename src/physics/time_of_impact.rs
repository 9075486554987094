//! Time of impact between two swept convex proxies.
//!
//! Conservative advancement: at each iteration the current separation and
//! witness normal bound how far the sweep can advance before the shapes
//! could possibly touch. The loop either lands within tolerance of the
//! target separation (a hit) or proves separation over the whole interval.

use crate::physics::distance::{shape_distance, DistanceInput, DistanceProxy, SimplexCache};
use crate::physics::LINEAR_SLOP;
use crate::utilities::math::{Rot, Sweep};
use glam::Vec2;

pub struct ToiInput {
    pub proxy_a: DistanceProxy,
    pub proxy_b: DistanceProxy,
    pub sweep_a: Sweep,
    pub sweep_b: Sweep,
    /// Fractions beyond this are not reported; the caller passes its best
    /// hit so far.
    pub max_fraction: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToiState {
    Unknown,
    /// The proxies overlap at the start of the sweep.
    Overlapped,
    /// First touch found at `fraction`.
    Hit,
    /// Separated across the whole interval.
    Separated,
}

#[derive(Clone, Copy, Debug)]
pub struct ToiOutput {
    pub state: ToiState,
    pub fraction: f32,
    /// Witness point at the hit, midway between the surfaces.
    pub point: Vec2,
    /// Unit normal from A toward B at the hit.
    pub normal: Vec2,
}

pub fn time_of_impact(input: &ToiInput) -> ToiOutput {
    let mut output = ToiOutput {
        state: ToiState::Unknown,
        fraction: input.max_fraction,
        point: Vec2::ZERO,
        normal: Vec2::ZERO,
    };

    let total_radius = input.proxy_a.radius + input.proxy_b.radius;
    let target = (total_radius - 3.0 * LINEAR_SLOP).max(LINEAR_SLOP);
    let tolerance = 0.25 * LINEAR_SLOP;

    // Bounds for the rotational contribution to approach speed.
    let max_radius_a = input.proxy_a.max_radius() - input.proxy_a.radius;
    let max_radius_b = input.proxy_b.max_radius() - input.proxy_b.radius;
    let omega_a = Rot::relative_angle(input.sweep_a.q1, input.sweep_a.q2).abs();
    let omega_b = Rot::relative_angle(input.sweep_b.q1, input.sweep_b.q2).abs();
    let rotation_bound = omega_a * max_radius_a + omega_b * max_radius_b;

    let mut t = 0.0f32;
    let mut cache = SimplexCache::default();

    const MAX_ITERATIONS: i32 = 20;
    for _ in 0..MAX_ITERATIONS {
        let xf_a = input.sweep_a.transform_at(t);
        let xf_b = input.sweep_b.transform_at(t);

        let distance_input = DistanceInput {
            proxy_a: input.proxy_a,
            proxy_b: input.proxy_b,
            transform_a: xf_a,
            transform_b: xf_b,
            use_radii: false,
        };
        let distance = shape_distance(&distance_input, &mut cache);
        let separation = distance.distance;

        if separation <= 0.0 {
            // Deep overlap; only meaningful at the start of the sweep.
            if t == 0.0 {
                output.state = ToiState::Overlapped;
                output.fraction = 0.0;
            } else {
                output.state = ToiState::Hit;
                output.fraction = t;
                output.normal = distance.normal;
                output.point = 0.5 * (distance.point_a + distance.point_b);
            }
            return output;
        }

        if separation < target + tolerance {
            if t == 0.0 && separation < target - tolerance {
                // Started closer than the target: initial overlap of the
                // rounded shapes.
                output.state = ToiState::Overlapped;
                output.fraction = 0.0;
                return output;
            }
            output.state = ToiState::Hit;
            output.fraction = t;
            output.normal = distance.normal;
            output.point = 0.5 * ((distance.point_a + input.proxy_a.radius * distance.normal)
                + (distance.point_b - input.proxy_b.radius * distance.normal));
            return output;
        }

        // Approach speed bound over the remaining sweep interval, per unit
        // of sweep fraction. The normal points from A to B, so motion of B
        // against the normal closes the gap.
        let rel_velocity = (input.sweep_b.c2 - input.sweep_b.c1)
            - (input.sweep_a.c2 - input.sweep_a.c1);
        let bound = (-rel_velocity.dot(distance.normal)).max(0.0) + rotation_bound;
        if bound < f32::EPSILON {
            output.state = ToiState::Separated;
            output.fraction = input.max_fraction;
            return output;
        }

        let advance = (separation - target) / bound;
        t += advance;
        if t >= input.max_fraction {
            output.state = ToiState::Separated;
            output.fraction = input.max_fraction;
            return output;
        }
    }

    // Iteration budget exhausted; report the deepest fraction examined as
    // a hit so the caller errs on the safe side.
    let xf_a = input.sweep_a.transform_at(t);
    let xf_b = input.sweep_b.transform_at(t);
    let distance_input = DistanceInput {
        proxy_a: input.proxy_a,
        proxy_b: input.proxy_b,
        transform_a: xf_a,
        transform_b: xf_b,
        use_radii: false,
    };
    let distance = shape_distance(&distance_input, &mut cache);
    output.state = ToiState::Hit;
    output.fraction = t;
    output.normal = distance.normal;
    output.point = 0.5 * (distance.point_a + distance.point_b);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::math::Rot;
    use approx::assert_relative_eq;

    fn static_sweep(c: Vec2) -> Sweep {
        Sweep {
            local_center: Vec2::ZERO,
            c1: c,
            c2: c,
            q1: Rot::IDENTITY,
            q2: Rot::IDENTITY,
        }
    }

    #[test]
    fn fast_circle_hits_wall_segment() {
        // Circle radius 0.1 sweeping from x=0 to x=8; wall segment at x=1.
        let input = ToiInput {
            proxy_a: DistanceProxy::new(&[Vec2::new(0.0, -2.0), Vec2::new(0.0, 2.0)], 0.0),
            proxy_b: DistanceProxy::new(&[Vec2::ZERO], 0.1),
            sweep_a: static_sweep(Vec2::new(1.0, 0.0)),
            sweep_b: Sweep {
                local_center: Vec2::ZERO,
                c1: Vec2::new(0.0, 0.0),
                c2: Vec2::new(8.0, 0.0),
                q1: Rot::IDENTITY,
                q2: Rot::IDENTITY,
            },
            max_fraction: 1.0,
        };
        let out = time_of_impact(&input);
        assert_eq!(out.state, ToiState::Hit);
        // Surface touch near x = 0.9, i.e. fraction ~0.9/8.
        assert_relative_eq!(out.fraction, 0.9 / 8.0, epsilon = 5.0e-3);
    }

    #[test]
    fn miss_reports_separated() {
        let input = ToiInput {
            proxy_a: DistanceProxy::new(&[Vec2::new(0.0, -2.0), Vec2::new(0.0, 2.0)], 0.0),
            proxy_b: DistanceProxy::new(&[Vec2::ZERO], 0.1),
            sweep_a: static_sweep(Vec2::new(1.0, 0.0)),
            sweep_b: Sweep {
                local_center: Vec2::ZERO,
                c1: Vec2::new(0.0, 5.0),
                c2: Vec2::new(8.0, 5.0),
                q1: Rot::IDENTITY,
                q2: Rot::IDENTITY,
            },
            max_fraction: 1.0,
        };
        let out = time_of_impact(&input);
        assert_eq!(out.state, ToiState::Separated);
    }

    #[test]
    fn initial_overlap_reports_fraction_zero() {
        let input = ToiInput {
            proxy_a: DistanceProxy::new(&[Vec2::ZERO], 0.5),
            proxy_b: DistanceProxy::new(&[Vec2::ZERO], 0.5),
            sweep_a: static_sweep(Vec2::ZERO),
            sweep_b: Sweep {
                local_center: Vec2::ZERO,
                c1: Vec2::new(0.25, 0.0),
                c2: Vec2::new(4.0, 0.0),
                q1: Rot::IDENTITY,
                q2: Rot::IDENTITY,
            },
            max_fraction: 1.0,
        };
        let out = time_of_impact(&input);
        assert_eq!(out.state, ToiState::Overlapped);
        assert_eq!(out.fraction, 0.0);
    }

    #[test]
    fn committed_fraction_monotonicity_with_max_fraction() {
        // A second query bounded by an earlier hit fraction cannot return a
        // later hit.
        let wall = DistanceProxy::new(&[Vec2::new(0.0, -2.0), Vec2::new(0.0, 2.0)], 0.0);
        let bullet = DistanceProxy::new(&[Vec2::ZERO], 0.1);
        let sweep_b = Sweep {
            local_center: Vec2::ZERO,
            c1: Vec2::new(0.0, 0.0),
            c2: Vec2::new(8.0, 0.0),
            q1: Rot::IDENTITY,
            q2: Rot::IDENTITY,
        };
        let first = time_of_impact(&ToiInput {
            proxy_a: wall,
            proxy_b: bullet,
            sweep_a: static_sweep(Vec2::new(1.0, 0.0)),
            sweep_b,
            max_fraction: 1.0,
        });
        assert_eq!(first.state, ToiState::Hit);

        let second = time_of_impact(&ToiInput {
            proxy_a: wall,
            proxy_b: bullet,
            sweep_a: static_sweep(Vec2::new(4.0, 0.0)),
            sweep_b,
            max_fraction: first.fraction,
        });
        assert_ne!(second.state, ToiState::Hit);
    }
}
