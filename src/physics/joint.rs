//! Joint definitions and per-joint constraint math.
//!
//! Each joint implements the quartet the solver drives: prepare, warm
//! start, solve (biased or relaxing), and a reaction query used for
//! threshold events. Solving runs against body states addressed through
//! the step context, with a zero dummy state standing in for non-awake
//! bodies.

use crate::physics::body::BodyState;
use crate::physics::events::BodyId;
use crate::physics::solver::StepContext;
use crate::physics::{AWAKE_SET, NULL_INDEX};
use crate::utilities::math::{cross, cross_sv, get_length_and_normalize};
use glam::Vec2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JointType {
    Distance,
    Revolute,
}

/// Fields shared by every joint definition.
#[derive(Clone, Copy, Debug)]
pub struct JointDef {
    pub body_a: BodyId,
    pub body_b: BodyId,
    /// Anchor relative to body A's origin.
    pub local_anchor_a: Vec2,
    /// Anchor relative to body B's origin.
    pub local_anchor_b: Vec2,
    pub collide_connected: bool,
    /// Reaction force that triggers a joint event. Zero reports every
    /// awake joint; infinity reports none.
    pub force_threshold: f32,
    pub torque_threshold: f32,
}

impl Default for JointDef {
    fn default() -> Self {
        Self {
            body_a: BodyId::default(),
            body_b: BodyId::default(),
            local_anchor_a: Vec2::ZERO,
            local_anchor_b: Vec2::ZERO,
            collide_connected: false,
            force_threshold: f32::MAX,
            torque_threshold: f32::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DistanceJointDef {
    pub base: JointDef,
    pub length: f32,
    pub enable_limit: bool,
    pub min_length: f32,
    pub max_length: f32,
}

impl Default for DistanceJointDef {
    fn default() -> Self {
        Self {
            base: JointDef::default(),
            length: 1.0,
            enable_limit: false,
            min_length: 0.0,
            max_length: f32::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RevoluteJointDef {
    pub base: JointDef,
}

/// Persistent per-joint record, addressed by joint id.
pub struct Joint {
    pub joint_type: JointType,
    pub set_index: i32,
    /// Color holding the sim while awake, else null.
    pub color_index: i32,
    pub local_index: i32,
    pub body_id_a: i32,
    pub body_id_b: i32,
    pub island_id: i32,
    pub island_prev: i32,
    pub island_next: i32,
    pub collide_connected: bool,
    pub generation: u32,
}

/// Distance joint solver state.
#[derive(Clone, Copy, Debug, Default)]
pub struct DistanceJoint {
    pub length: f32,
    pub min_length: f32,
    pub max_length: f32,
    pub enable_limit: bool,
    pub impulse: f32,
    pub lower_impulse: f32,
    pub upper_impulse: f32,
    // Prepared state
    pub axial_mass: f32,
}

/// Revolute joint solver state (point-to-point constraint).
#[derive(Clone, Copy, Debug, Default)]
pub struct RevoluteJoint {
    pub linear_impulse: Vec2,
}

#[derive(Clone, Copy, Debug)]
pub enum JointSolver {
    Distance(DistanceJoint),
    Revolute(RevoluteJoint),
}

/// Per-joint simulation record. Lives in a graph color while awake, in a
/// sleeping set otherwise.
#[derive(Clone, Copy, Debug)]
pub struct JointSim {
    pub joint_id: i32,
    pub body_id_a: i32,
    pub body_id_b: i32,
    pub local_anchor_a: Vec2,
    pub local_anchor_b: Vec2,
    pub force_threshold: f32,
    pub torque_threshold: f32,
    pub solver: JointSolver,

    // Prepared each step.
    pub index_a: i32,
    pub index_b: i32,
    pub inv_mass_a: f32,
    pub inv_mass_b: f32,
    pub inv_i_a: f32,
    pub inv_i_b: f32,
    /// Anchors relative to the centers of mass at prepare time.
    pub anchor_a: Vec2,
    pub anchor_b: Vec2,
    /// Center separation at prepare time.
    pub delta_center: Vec2,
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

/// Gathers body data and computes effective masses. Runs once per step
/// before warm starting.
///
/// # Safety
/// Must only run inside the solver's prepare stage with a valid context.
pub unsafe fn prepare_joint(joint: &mut JointSim, ctx: &StepContext) {
    let world = &*ctx.world;

    let body_a = &world.bodies[joint.body_id_a as usize];
    let body_b = &world.bodies[joint.body_id_b as usize];

    joint.index_a = if body_a.set_index == AWAKE_SET {
        body_a.local_index
    } else {
        NULL_INDEX
    };
    joint.index_b = if body_b.set_index == AWAKE_SET {
        body_b.local_index
    } else {
        NULL_INDEX
    };

    let sim_a = world.get_body_sim(joint.body_id_a);
    let sim_b = world.get_body_sim(joint.body_id_b);

    joint.inv_mass_a = sim_a.inv_mass;
    joint.inv_mass_b = sim_b.inv_mass;
    joint.inv_i_a = sim_a.inv_inertia;
    joint.inv_i_b = sim_b.inv_inertia;

    joint.anchor_a = sim_a
        .transform
        .q
        .rotate(joint.local_anchor_a - sim_a.local_center);
    joint.anchor_b = sim_b
        .transform
        .q
        .rotate(joint.local_anchor_b - sim_b.local_center);
    joint.delta_center = sim_b.center - sim_a.center;

    match &mut joint.solver {
        JointSolver::Distance(distance) => {
            let d = joint.delta_center + joint.anchor_b - joint.anchor_a;
            let (axis, _) = get_length_and_normalize(d);
            let cr_a = cross(joint.anchor_a, axis);
            let cr_b = cross(joint.anchor_b, axis);
            let k = joint.inv_mass_a
                + joint.inv_mass_b
                + joint.inv_i_a * cr_a * cr_a
                + joint.inv_i_b * cr_b * cr_b;
            distance.axial_mass = if k > 0.0 { 1.0 / k } else { 0.0 };
            if !ctx.enable_warm_starting {
                distance.impulse = 0.0;
                distance.lower_impulse = 0.0;
                distance.upper_impulse = 0.0;
            }
        }
        JointSolver::Revolute(revolute) => {
            if !ctx.enable_warm_starting {
                revolute.linear_impulse = Vec2::ZERO;
            }
        }
    }
}

/// Applies the impulses accumulated last step.
///
/// # Safety
/// Must only run inside the solver's warm-start stage.
pub unsafe fn warm_start_joint(joint: &mut JointSim, ctx: &StepContext) {
    let mut state_a = load_state(ctx, joint.index_a);
    let mut state_b = load_state(ctx, joint.index_b);

    let impulse = match &joint.solver {
        JointSolver::Distance(distance) => {
            let d = joint.delta_center + joint.anchor_b - joint.anchor_a;
            let (axis, _) = get_length_and_normalize(d);
            (distance.impulse + distance.lower_impulse - distance.upper_impulse) * axis
        }
        JointSolver::Revolute(revolute) => revolute.linear_impulse,
    };

    state_a.linear_velocity -= joint.inv_mass_a * impulse;
    state_a.angular_velocity -= joint.inv_i_a * cross(joint.anchor_a, impulse);
    state_b.linear_velocity += joint.inv_mass_b * impulse;
    state_b.angular_velocity += joint.inv_i_b * cross(joint.anchor_b, impulse);

    store_state(ctx, joint.index_a, state_a);
    store_state(ctx, joint.index_b, state_b);
}

/// One velocity iteration. `use_bias` enables the soft position bias
/// during the solve stage and is false during relax.
///
/// # Safety
/// Must only run inside the solver's solve/relax stages.
pub unsafe fn solve_joint(joint: &mut JointSim, ctx: &StepContext, use_bias: bool) {
    let mut state_a = load_state(ctx, joint.index_a);
    let mut state_b = load_state(ctx, joint.index_b);

    // Anchors tracking the substep rotation deltas.
    let r_a = state_a.delta_rotation.rotate(joint.anchor_a);
    let r_b = state_b.delta_rotation.rotate(joint.anchor_b);

    // Current separation of the anchor points.
    let d = joint.delta_center + (state_b.delta_position - state_a.delta_position) + (r_b - r_a);

    let softness = ctx.joint_softness;

    match &mut joint.solver {
        JointSolver::Distance(distance) => {
            let (axis, length) = get_length_and_normalize(d);

            let vr = state_b.linear_velocity + cross_sv(state_b.angular_velocity, r_b)
                - state_a.linear_velocity
                - cross_sv(state_a.angular_velocity, r_a);
            let cdot = vr.dot(axis);

            let applied = if distance.enable_limit {
                // A rope between the limits: the lower limit pushes
                // outward, the upper pulls inward, both one-sided.
                let lower_c = length - distance.min_length;
                let lower_bias = if use_bias {
                    softness.bias_rate * lower_c.min(0.0)
                } else {
                    0.0
                };
                let lower = -distance.axial_mass * (cdot + lower_bias);
                let new_lower = (distance.lower_impulse + lower).max(0.0);
                let lower_applied = new_lower - distance.lower_impulse;
                distance.lower_impulse = new_lower;

                let upper_c = distance.max_length - length;
                let upper_bias = if use_bias {
                    softness.bias_rate * upper_c.min(0.0)
                } else {
                    0.0
                };
                let upper = -distance.axial_mass * (-cdot + upper_bias);
                let new_upper = (distance.upper_impulse + upper).max(0.0);
                let upper_applied = new_upper - distance.upper_impulse;
                distance.upper_impulse = new_upper;

                lower_applied - upper_applied
            } else {
                // Rigid bar
                let c = length - distance.length;
                let (bias, mass_scale, impulse_scale) = if use_bias {
                    (
                        softness.bias_rate * c,
                        softness.mass_scale,
                        softness.impulse_scale,
                    )
                } else {
                    (0.0, 1.0, 0.0)
                };

                let impulse = -distance.axial_mass * mass_scale * (cdot + bias)
                    - impulse_scale * distance.impulse;
                distance.impulse += impulse;
                impulse
            };

            let p = applied * axis;
            state_a.linear_velocity -= joint.inv_mass_a * p;
            state_a.angular_velocity -= joint.inv_i_a * cross(r_a, p);
            state_b.linear_velocity += joint.inv_mass_b * p;
            state_b.angular_velocity += joint.inv_i_b * cross(r_b, p);
        }
        JointSolver::Revolute(revolute) => {
            // Point-to-point: drive the anchor separation to zero.
            let c = d;
            let (bias, mass_scale, impulse_scale) = if use_bias {
                (
                    softness.bias_rate * c,
                    softness.mass_scale,
                    softness.impulse_scale,
                )
            } else {
                (Vec2::ZERO, 1.0, 0.0)
            };

            let m_a = joint.inv_mass_a;
            let m_b = joint.inv_mass_b;
            let i_a = joint.inv_i_a;
            let i_b = joint.inv_i_b;

            let k11 = m_a + m_b + i_a * r_a.y * r_a.y + i_b * r_b.y * r_b.y;
            let k12 = -i_a * r_a.x * r_a.y - i_b * r_b.x * r_b.y;
            let k22 = m_a + m_b + i_a * r_a.x * r_a.x + i_b * r_b.x * r_b.x;
            let det = k11 * k22 - k12 * k12;
            let inv_det = if det != 0.0 { 1.0 / det } else { 0.0 };

            let cdot = state_b.linear_velocity + cross_sv(state_b.angular_velocity, r_b)
                - state_a.linear_velocity
                - cross_sv(state_a.angular_velocity, r_a);

            let rhs = cdot + bias;
            let raw = Vec2::new(
                -(k22 * rhs.x - k12 * rhs.y) * inv_det,
                -(k11 * rhs.y - k12 * rhs.x) * inv_det,
            );
            let impulse = mass_scale * raw - impulse_scale * revolute.linear_impulse;
            revolute.linear_impulse += impulse;

            state_a.linear_velocity -= m_a * impulse;
            state_a.angular_velocity -= i_a * cross(r_a, impulse);
            state_b.linear_velocity += m_b * impulse;
            state_b.angular_velocity += i_b * cross(r_b, impulse);
        }
    }

    store_state(ctx, joint.index_a, state_a);
    store_state(ctx, joint.index_b, state_b);
}

/// Reaction force and torque magnitudes for threshold events.
pub fn get_joint_reaction(joint: &JointSim, inv_h: f32) -> (f32, f32) {
    match &joint.solver {
        JointSolver::Distance(distance) => {
            let axial =
                (distance.impulse + distance.lower_impulse - distance.upper_impulse).abs();
            (axial * inv_h, 0.0)
        }
        JointSolver::Revolute(revolute) => (revolute.linear_impulse.length() * inv_h, 0.0),
    }
}
