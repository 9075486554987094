//! Scalar contact constraint math: prepare, warm start, solve, relax,
//! restitution, store.
//!
//! The scheme is soft-constraint TGS: position error feeds a softened
//! bias during the solve stage, relax iterations run without bias to
//! remove bias-injected energy, and restitution runs last against the
//! approach velocities captured at prepare time. The same routines serve
//! both the per-color graph blocks and the serial overflow color.

use crate::physics::body::BodyState;
use crate::physics::contact::ContactSim;
use crate::physics::solver::StepContext;
use crate::physics::{NULL_INDEX, OVERFLOW_INDEX};
use crate::utilities::math::{cross, cross_sv, right_perp};
use glam::Vec2;

/// Soft-constraint coefficients derived from (hertz, damping, h).
#[derive(Clone, Copy, Debug, Default)]
pub struct Softness {
    pub bias_rate: f32,
    pub mass_scale: f32,
    pub impulse_scale: f32,
}

pub fn make_soft(hertz: f32, zeta: f32, h: f32) -> Softness {
    if hertz == 0.0 {
        return Softness {
            bias_rate: 0.0,
            mass_scale: 1.0,
            impulse_scale: 0.0,
        };
    }
    let omega = 2.0 * std::f32::consts::PI * hertz;
    let a1 = 2.0 * zeta + h * omega;
    let a2 = h * omega * a1;
    let a3 = 1.0 / (1.0 + a2);
    Softness {
        bias_rate: omega / a1,
        mass_scale: a2 * a3,
        impulse_scale: a3,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ContactConstraintPoint {
    /// Anchor relative to body A's center of mass at prepare time.
    pub anchor_a: Vec2,
    pub anchor_b: Vec2,
    /// Separation with the anchor offset folded out, so the current
    /// separation is recovered from the substep deltas alone.
    pub base_separation: f32,
    /// Normal approach velocity at prepare time, for restitution.
    pub relative_velocity: f32,
    pub normal_mass: f32,
    pub tangent_mass: f32,
    pub normal_impulse: f32,
    pub tangent_impulse: f32,
    /// Peak applied normal impulse across the substeps.
    pub total_normal_impulse: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct ContactConstraint {
    pub index_a: i32,
    pub index_b: i32,
    pub normal: Vec2,
    pub friction: f32,
    pub restitution: f32,
    pub inv_mass_a: f32,
    pub inv_i_a: f32,
    pub inv_mass_b: f32,
    pub inv_i_b: f32,
    pub softness: Softness,
    pub point_count: i32,
    pub points: [ContactConstraintPoint; 2],
}

impl Default for ContactConstraint {
    fn default() -> Self {
        Self {
            index_a: NULL_INDEX,
            index_b: NULL_INDEX,
            normal: Vec2::ZERO,
            friction: 0.0,
            restitution: 0.0,
            inv_mass_a: 0.0,
            inv_i_a: 0.0,
            inv_mass_b: 0.0,
            inv_i_b: 0.0,
            softness: Softness::default(),
            point_count: 0,
            points: [ContactConstraintPoint::default(); 2],
        }
    }
}

#[inline(always)]
unsafe fn load_state(ctx: &StepContext, index: i32) -> BodyState {
    if index == NULL_INDEX {
        BodyState::IDENTITY
    } else {
        *ctx.states.add(index as usize)
    }
}

#[inline(always)]
unsafe fn store_state(ctx: &StepContext, index: i32, state: BodyState) {
    if index != NULL_INDEX {
        *ctx.states.add(index as usize) = state;
    }
}

unsafe fn prepare_contact_constraint(sim: &ContactSim, ctx: &StepContext) -> ContactConstraint {
    let world = &*ctx.world;

    let index_a = sim.body_sim_index_a;
    let index_b = sim.body_sim_index_b;

    // Non-awake bodies contribute their pose but no motion.
    let center_a = if index_a != NULL_INDEX {
        (*ctx.sims.add(index_a as usize)).center
    } else {
        let shape = &world.shapes[sim.shape_id_a as usize];
        world.get_body_sim(shape.body_id).center
    };
    let center_b = if index_b != NULL_INDEX {
        (*ctx.sims.add(index_b as usize)).center
    } else {
        let shape = &world.shapes[sim.shape_id_b as usize];
        world.get_body_sim(shape.body_id).center
    };

    let state_a = load_state(ctx, index_a);
    let state_b = load_state(ctx, index_b);

    let normal = sim.manifold.normal;
    let tangent = right_perp(normal);

    let m_a = sim.inv_mass_a;
    let m_b = sim.inv_mass_b;
    let i_a = sim.inv_i_a;
    let i_b = sim.inv_i_b;

    let mut constraint = ContactConstraint {
        index_a,
        index_b,
        normal,
        friction: sim.friction,
        restitution: sim.restitution,
        inv_mass_a: m_a,
        inv_i_a: i_a,
        inv_mass_b: m_b,
        inv_i_b: i_b,
        // Contacts against non-awake bodies get the stiffer softness.
        softness: if index_a == NULL_INDEX || index_b == NULL_INDEX {
            ctx.static_softness
        } else {
            ctx.contact_softness
        },
        point_count: sim.manifold.point_count,
        points: [ContactConstraintPoint::default(); 2],
    };

    for i in 0..sim.manifold.point_count as usize {
        let mp = &sim.manifold.points[i];
        let cp = &mut constraint.points[i];

        let r_a = mp.point - center_a;
        let r_b = mp.point - center_b;
        cp.anchor_a = r_a;
        cp.anchor_b = r_b;
        cp.base_separation = mp.separation - (r_b - r_a).dot(normal);

        let rn_a = cross(r_a, normal);
        let rn_b = cross(r_b, normal);
        let kn = m_a + m_b + i_a * rn_a * rn_a + i_b * rn_b * rn_b;
        cp.normal_mass = if kn > 0.0 { 1.0 / kn } else { 0.0 };

        let rt_a = cross(r_a, tangent);
        let rt_b = cross(r_b, tangent);
        let kt = m_a + m_b + i_a * rt_a * rt_a + i_b * rt_b * rt_b;
        cp.tangent_mass = if kt > 0.0 { 1.0 / kt } else { 0.0 };

        let vr = state_b.linear_velocity + cross_sv(state_b.angular_velocity, r_b)
            - state_a.linear_velocity
            - cross_sv(state_a.angular_velocity, r_a);
        cp.relative_velocity = vr.dot(normal);

        if ctx.enable_warm_starting {
            cp.normal_impulse = mp.normal_impulse;
            cp.tangent_impulse = mp.tangent_impulse;
        }
        cp.total_normal_impulse = 0.0;
    }

    constraint
}

unsafe fn warm_start_contact_constraint(constraint: &ContactConstraint, ctx: &StepContext) {
    let mut state_a = load_state(ctx, constraint.index_a);
    let mut state_b = load_state(ctx, constraint.index_b);

    let normal = constraint.normal;
    let tangent = right_perp(normal);

    for i in 0..constraint.point_count as usize {
        let cp = &constraint.points[i];
        let p = cp.normal_impulse * normal + cp.tangent_impulse * tangent;
        state_a.linear_velocity -= constraint.inv_mass_a * p;
        state_a.angular_velocity -= constraint.inv_i_a * cross(cp.anchor_a, p);
        state_b.linear_velocity += constraint.inv_mass_b * p;
        state_b.angular_velocity += constraint.inv_i_b * cross(cp.anchor_b, p);
    }

    store_state(ctx, constraint.index_a, state_a);
    store_state(ctx, constraint.index_b, state_b);
}

unsafe fn solve_contact_constraint(
    constraint: &mut ContactConstraint,
    ctx: &StepContext,
    use_bias: bool,
) {
    let mut state_a = load_state(ctx, constraint.index_a);
    let mut state_b = load_state(ctx, constraint.index_b);

    let normal = constraint.normal;
    let tangent = right_perp(normal);
    let inv_h = ctx.inv_h;
    let push_max = ctx.contact_push_max_speed;
    let softness = constraint.softness;

    for i in 0..constraint.point_count as usize {
        let cp = &mut constraint.points[i];

        // Current separation from the accumulated substep deltas.
        let pr_a = state_a.delta_rotation.rotate(cp.anchor_a);
        let pr_b = state_b.delta_rotation.rotate(cp.anchor_b);
        let d = (state_b.delta_position - state_a.delta_position) + (pr_b - pr_a);
        let s = d.dot(normal) + cp.base_separation;

        let (bias, mass_scale, impulse_scale) = if s > 0.0 {
            // Speculative: close exactly the remaining gap this substep.
            (s * inv_h, 1.0, 0.0)
        } else if use_bias {
            (
                (softness.bias_rate * s).max(-push_max),
                softness.mass_scale,
                softness.impulse_scale,
            )
        } else {
            (0.0, 1.0, 0.0)
        };

        let vr = state_b.linear_velocity + cross_sv(state_b.angular_velocity, cp.anchor_b)
            - state_a.linear_velocity
            - cross_sv(state_a.angular_velocity, cp.anchor_a);
        let vn = vr.dot(normal);

        let mut impulse =
            -cp.normal_mass * mass_scale * (vn + bias) - impulse_scale * cp.normal_impulse;

        let new_impulse = (cp.normal_impulse + impulse).max(0.0);
        impulse = new_impulse - cp.normal_impulse;
        cp.normal_impulse = new_impulse;
        cp.total_normal_impulse = cp.total_normal_impulse.max(new_impulse);

        let p = impulse * normal;
        state_a.linear_velocity -= constraint.inv_mass_a * p;
        state_a.angular_velocity -= constraint.inv_i_a * cross(cp.anchor_a, p);
        state_b.linear_velocity += constraint.inv_mass_b * p;
        state_b.angular_velocity += constraint.inv_i_b * cross(cp.anchor_b, p);
    }

    // Friction, bounded by the accumulated normal impulses.
    for i in 0..constraint.point_count as usize {
        let cp = &mut constraint.points[i];

        let vr = state_b.linear_velocity + cross_sv(state_b.angular_velocity, cp.anchor_b)
            - state_a.linear_velocity
            - cross_sv(state_a.angular_velocity, cp.anchor_a);
        let vt = vr.dot(tangent);

        let mut impulse = -cp.tangent_mass * vt;
        let max_friction = constraint.friction * cp.normal_impulse;
        let new_impulse = (cp.tangent_impulse + impulse).clamp(-max_friction, max_friction);
        impulse = new_impulse - cp.tangent_impulse;
        cp.tangent_impulse = new_impulse;

        let p = impulse * tangent;
        state_a.linear_velocity -= constraint.inv_mass_a * p;
        state_a.angular_velocity -= constraint.inv_i_a * cross(cp.anchor_a, p);
        state_b.linear_velocity += constraint.inv_mass_b * p;
        state_b.angular_velocity += constraint.inv_i_b * cross(cp.anchor_b, p);
    }

    store_state(ctx, constraint.index_a, state_a);
    store_state(ctx, constraint.index_b, state_b);
}

unsafe fn apply_restitution_constraint(constraint: &mut ContactConstraint, ctx: &StepContext) {
    let threshold = ctx.restitution_threshold;
    if constraint.restitution == 0.0 {
        return;
    }

    let mut state_a = load_state(ctx, constraint.index_a);
    let mut state_b = load_state(ctx, constraint.index_b);

    let normal = constraint.normal;

    for i in 0..constraint.point_count as usize {
        let cp = &mut constraint.points[i];

        // Slow approaches and points that never collided don't bounce.
        if cp.relative_velocity > -threshold || cp.total_normal_impulse == 0.0 {
            continue;
        }

        let vr = state_b.linear_velocity + cross_sv(state_b.angular_velocity, cp.anchor_b)
            - state_a.linear_velocity
            - cross_sv(state_a.angular_velocity, cp.anchor_a);
        let vn = vr.dot(normal);

        let mut impulse = -cp.normal_mass * (vn + constraint.restitution * cp.relative_velocity);
        let new_impulse = (cp.normal_impulse + impulse).max(0.0);
        impulse = new_impulse - cp.normal_impulse;
        cp.normal_impulse = new_impulse;
        cp.total_normal_impulse = cp.total_normal_impulse.max(new_impulse);

        let p = impulse * normal;
        state_a.linear_velocity -= constraint.inv_mass_a * p;
        state_a.angular_velocity -= constraint.inv_i_a * cross(cp.anchor_a, p);
        state_b.linear_velocity += constraint.inv_mass_b * p;
        state_b.angular_velocity += constraint.inv_i_b * cross(cp.anchor_b, p);
    }

    store_state(ctx, constraint.index_a, state_a);
    store_state(ctx, constraint.index_b, state_b);
}

fn store_impulses_for(sim: &mut ContactSim, constraint: &ContactConstraint) {
    for i in 0..constraint.point_count as usize {
        let mp = &mut sim.manifold.points[i];
        let cp = &constraint.points[i];
        mp.normal_impulse = cp.normal_impulse;
        mp.tangent_impulse = cp.tangent_impulse;
        mp.total_normal_impulse = cp.total_normal_impulse;
        mp.normal_velocity = cp.relative_velocity;
    }
}

// --- Parallel block tasks over the flat contact array / color slices ---

/// # Safety
/// Solver-stage contract: `ctx` valid, indices in range, exclusive block
/// ownership via the work-block CAS.
pub unsafe fn prepare_contacts_task(start: i32, end: i32, ctx: &StepContext) {
    for i in start..end {
        let sim = &**ctx.contacts.add(i as usize);
        *ctx.contact_constraints.add(i as usize) = prepare_contact_constraint(sim, ctx);
    }
}

/// # Safety
/// See [`prepare_contacts_task`].
pub unsafe fn warm_start_contacts_task(start: i32, end: i32, ctx: &StepContext, color_index: i32) {
    let graph = &*ctx.graph;
    let base = graph.colors[color_index as usize].constraint_base;
    for i in start..end {
        let constraint = &*ctx.contact_constraints.add(base + i as usize);
        warm_start_contact_constraint(constraint, ctx);
    }
}

/// # Safety
/// See [`prepare_contacts_task`].
pub unsafe fn solve_contacts_task(
    start: i32,
    end: i32,
    ctx: &StepContext,
    color_index: i32,
    use_bias: bool,
) {
    let graph = &*ctx.graph;
    let base = graph.colors[color_index as usize].constraint_base;
    for i in start..end {
        let constraint = &mut *ctx.contact_constraints.add(base + i as usize);
        solve_contact_constraint(constraint, ctx, use_bias);
    }
}

/// # Safety
/// See [`prepare_contacts_task`].
pub unsafe fn apply_restitution_task(start: i32, end: i32, ctx: &StepContext, color_index: i32) {
    let graph = &*ctx.graph;
    let base = graph.colors[color_index as usize].constraint_base;
    for i in start..end {
        let constraint = &mut *ctx.contact_constraints.add(base + i as usize);
        apply_restitution_constraint(constraint, ctx);
    }
}

/// # Safety
/// See [`prepare_contacts_task`].
pub unsafe fn store_impulses_task(start: i32, end: i32, ctx: &StepContext) {
    for i in start..end {
        let sim = &mut **ctx.contacts.add(i as usize);
        let constraint = &*ctx.contact_constraints.add(i as usize);
        store_impulses_for(sim, constraint);
    }
}

// --- Serial overflow color, driven by the main worker ---

/// # Safety
/// Main worker only, between parallel stages.
pub unsafe fn prepare_overflow_contacts(ctx: &StepContext) {
    let graph = &mut *ctx.graph;
    let color = &mut graph.colors[OVERFLOW_INDEX];
    for (i, sim) in color.contact_sims.iter().enumerate() {
        *ctx.overflow_constraints.add(i) = prepare_contact_constraint(sim, ctx);
    }
}

/// # Safety
/// Main worker only, between parallel stages.
pub unsafe fn warm_start_overflow_contacts(ctx: &StepContext) {
    let graph = &*ctx.graph;
    let count = graph.colors[OVERFLOW_INDEX].contact_sims.len();
    for i in 0..count {
        warm_start_contact_constraint(&*ctx.overflow_constraints.add(i), ctx);
    }
}

/// # Safety
/// Main worker only, between parallel stages.
pub unsafe fn solve_overflow_contacts(ctx: &StepContext, use_bias: bool) {
    let graph = &*ctx.graph;
    let count = graph.colors[OVERFLOW_INDEX].contact_sims.len();
    for i in 0..count {
        solve_contact_constraint(&mut *ctx.overflow_constraints.add(i), ctx, use_bias);
    }
}

/// # Safety
/// Main worker only, between parallel stages.
pub unsafe fn apply_overflow_restitution(ctx: &StepContext) {
    let graph = &*ctx.graph;
    let count = graph.colors[OVERFLOW_INDEX].contact_sims.len();
    for i in 0..count {
        apply_restitution_constraint(&mut *ctx.overflow_constraints.add(i), ctx);
    }
}

/// # Safety
/// Main worker only, after the parallel stages have completed.
pub unsafe fn store_overflow_impulses(ctx: &StepContext) {
    let graph = &mut *ctx.graph;
    let color = &mut graph.colors[OVERFLOW_INDEX];
    for (i, sim) in color.contact_sims.iter_mut().enumerate() {
        store_impulses_for(sim, &*ctx.overflow_constraints.add(i));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn soft_parameters_match_the_derivation() {
        let h = 1.0 / 240.0;
        let soft = make_soft(30.0, 10.0, h);
        let omega = 2.0 * std::f32::consts::PI * 30.0;
        let a1 = 2.0 * 10.0 + h * omega;
        let a2 = h * omega * a1;
        let a3 = 1.0 / (1.0 + a2);
        assert_relative_eq!(soft.bias_rate, omega / a1, epsilon = 1.0e-6);
        assert_relative_eq!(soft.mass_scale, a2 * a3, epsilon = 1.0e-6);
        assert_relative_eq!(soft.impulse_scale, a3, epsilon = 1.0e-6);
    }

    #[test]
    fn zero_hertz_is_rigid() {
        let soft = make_soft(0.0, 1.0, 1.0 / 60.0);
        assert_eq!(soft.bias_rate, 0.0);
        assert_eq!(soft.mass_scale, 1.0);
        assert_eq!(soft.impulse_scale, 0.0);
    }
}
