//! Persistent contacts and the narrow-phase manifold update.
//!
//! Contacts are created by the broad phase when fat AABBs begin to
//! overlap, long before the shapes touch. A touching contact lives in a
//! constraint graph color; a non-touching contact lives in its solver
//! set's plain contact array.

use crate::physics::manifold::{
    collide_circles, collide_polygon_and_circle, collide_polygons, collide_segment_and_circle,
    collide_segment_and_polygon, Manifold,
};
use crate::physics::shape::{Shape, ShapeGeometry};
use crate::utilities::math::Transform;

// Persistent contact flags.
pub const CONTACT_TOUCHING: u32 = 1 << 0;
pub const CONTACT_ENABLE_CONTACT_EVENTS: u32 = 1 << 1;

// Sim flags.
pub const SIM_TOUCHING: u32 = 1 << 0;
pub const SIM_DISJOINT: u32 = 1 << 1;
pub const SIM_STARTED_TOUCHING: u32 = 1 << 2;
pub const SIM_STOPPED_TOUCHING: u32 = 1 << 3;
pub const SIM_ENABLE_HIT_EVENT: u32 = 1 << 4;
pub const SIM_ENABLE_PRE_SOLVE_EVENTS: u32 = 1 << 5;

/// Persistent per-contact record, addressed by contact id.
pub struct Contact {
    pub set_index: i32,
    /// Color holding the sim while touching and awake, else null.
    pub color_index: i32,
    pub local_index: i32,
    pub shape_id_a: i32,
    pub shape_id_b: i32,
    pub body_id_a: i32,
    pub body_id_b: i32,
    pub island_id: i32,
    pub island_prev: i32,
    pub island_next: i32,
    pub flags: u32,
    pub generation: u32,
}

/// Per-contact simulation record.
#[derive(Clone, Copy, Debug)]
pub struct ContactSim {
    pub contact_id: i32,
    pub shape_id_a: i32,
    pub shape_id_b: i32,
    /// Awake-set sim index of each body, or null if not awake. Refreshed
    /// by the narrow phase every step to keep the prepare stage cache
    /// friendly.
    pub body_sim_index_a: i32,
    pub body_sim_index_b: i32,
    pub inv_mass_a: f32,
    pub inv_i_a: f32,
    pub inv_mass_b: f32,
    pub inv_i_b: f32,
    pub friction: f32,
    pub restitution: f32,
    pub manifold: Manifold,
    pub sim_flags: u32,
}

/// Canonical ordering rank; contacts store the higher-ranked shape as A so
/// the manifold dispatch below covers every pair once.
pub fn shape_kind_rank(shape: &Shape) -> i32 {
    match shape.geometry {
        ShapeGeometry::Circle(_) => 0,
        ShapeGeometry::Polygon(_) => 1,
        ShapeGeometry::Segment(_) => 2,
        ShapeGeometry::ChainSegment(_) => 3,
    }
}

/// Symmetric 64-bit key for a shape pair, used by the contact lookup.
#[inline(always)]
pub fn shape_pair_key(shape_id_a: i32, shape_id_b: i32) -> u64 {
    let lo = shape_id_a.min(shape_id_b) as u64;
    let hi = shape_id_a.max(shape_id_b) as u64;
    (hi << 32) | lo
}

fn compute_manifold(shape_a: &Shape, xf_a: Transform, shape_b: &Shape, xf_b: Transform) -> Manifold {
    match (&shape_a.geometry, &shape_b.geometry) {
        (ShapeGeometry::Circle(a), ShapeGeometry::Circle(b)) => collide_circles(a, xf_a, b, xf_b),
        (ShapeGeometry::Polygon(a), ShapeGeometry::Circle(b)) => {
            collide_polygon_and_circle(a, xf_a, b, xf_b)
        }
        (ShapeGeometry::Polygon(a), ShapeGeometry::Polygon(b)) => {
            collide_polygons(a, xf_a, b, xf_b)
        }
        (
            ShapeGeometry::Segment(a) | ShapeGeometry::ChainSegment(a),
            ShapeGeometry::Circle(b),
        ) => collide_segment_and_circle(a, xf_a, b, xf_b),
        (
            ShapeGeometry::Segment(a) | ShapeGeometry::ChainSegment(a),
            ShapeGeometry::Polygon(b),
        ) => collide_segment_and_polygon(a, xf_a, b, xf_b),
        // Remaining pairs (segment vs segment, or an order the creation
        // rule forbids) produce no contact points.
        _ => {
            debug_assert!(
                shape_kind_rank(shape_a) >= shape_kind_rank(shape_b),
                "contact created with non-canonical shape order"
            );
            Manifold::default()
        }
    }
}

/// Recomputes the manifold for a contact and carries accumulated impulses
/// over matching feature ids for warm starting. Returns true if touching.
pub fn update_contact_manifold(
    sim: &mut ContactSim,
    shape_a: &Shape,
    xf_a: Transform,
    shape_b: &Shape,
    xf_b: Transform,
    enable_warm_starting: bool,
) -> bool {
    let old_manifold = sim.manifold;
    sim.manifold = compute_manifold(shape_a, xf_a, shape_b, xf_b);

    if enable_warm_starting {
        for i in 0..sim.manifold.point_count as usize {
            let mp = &mut sim.manifold.points[i];
            mp.normal_impulse = 0.0;
            mp.tangent_impulse = 0.0;
            for j in 0..old_manifold.point_count as usize {
                let old = &old_manifold.points[j];
                if old.id == mp.id {
                    mp.normal_impulse = old.normal_impulse;
                    mp.tangent_impulse = old.tangent_impulse;
                    break;
                }
            }
        }
    }

    let touching = sim.manifold.point_count > 0;
    if touching {
        sim.sim_flags |= SIM_TOUCHING;
    } else {
        sim.sim_flags &= !SIM_TOUCHING;
    }
    touching
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_symmetric() {
        assert_eq!(shape_pair_key(3, 11), shape_pair_key(11, 3));
        assert_ne!(shape_pair_key(3, 11), shape_pair_key(3, 12));
    }
}
