//! The staged parallel constraint solver and continuous collision
//! pipeline.
//!
//! A step builds fixed-size work blocks for bodies, joints, contacts,
//! and each graph color, then dispatches one solver task per worker. The
//! main worker (index 0) drives stage progression by publishing a packed
//! `(sync_index << 16) | stage_index` word; the other workers spin on it,
//! claim blocks with a compare-exchange on each block's sync index, and
//! steal from neighbors by scanning forward then backward from their
//! start block. A block executes exactly once per stage visit because the
//! claim CAS moves its sync index from the previous epoch to the current
//! one.
//!
//! Overflow constraints (the last graph color) are solved serially by the
//! main worker around each parallel color pass.

use crate::physics::body::{
    BodySim, BodyState, BodyType, ALLOW_FAST_ROTATION, ENLARGE_BOUNDS, HAD_TIME_OF_IMPACT,
    IS_BULLET, IS_FAST, IS_SPEED_CAPPED, LOCK_ANGULAR_Z, LOCK_LINEAR_X, LOCK_LINEAR_Y,
};
use crate::physics::constraint_graph::ConstraintGraph;
use crate::physics::contact::{ContactSim, SIM_ENABLE_HIT_EVENT};
use crate::physics::contact_solver::{
    apply_overflow_restitution, apply_restitution_task, prepare_contacts_task,
    prepare_overflow_contacts, solve_contacts_task, solve_overflow_contacts,
    store_impulses_task, store_overflow_impulses, warm_start_contacts_task,
    warm_start_overflow_contacts, ContactConstraint, Softness,
};
use crate::physics::events::{BodyId, ContactHitEvent, JointEvent, JointId, ShapeId};
use crate::physics::joint::{
    get_joint_reaction, prepare_joint, solve_joint, warm_start_joint, JointSim,
};
use crate::physics::local_spin_wait::LocalSpinWait;
use crate::physics::sensor::SensorHit;
use crate::physics::shape::{Shape, ShapeGeometry};
use crate::physics::time_of_impact::{time_of_impact, ToiInput};
use crate::physics::world::World;
use crate::physics::{
    AABB_MARGIN, AWAKE_SET, CORE_FRACTION, GRAPH_COLOR_COUNT, ITERATIONS, LINEAR_SLOP,
    MAX_CONTINUOUS_SENSOR_HITS, MAX_ROTATION, MAX_WORKERS, NULL_INDEX, OVERFLOW_INDEX,
    RELAX_ITERATIONS, SPECULATIVE_DISTANCE, TIME_TO_SLEEP,
};
use crate::utilities::bit_set::BitSet;
use crate::utilities::bounding_box::Aabb;
use crate::utilities::math::{Rot, Sweep, Transform};
use crossbeam_utils::CachePadded;
use glam::Vec2;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Per-worker scratch, merged serially after the parallel phases.
pub struct TaskContext {
    pub contact_state_bit_set: BitSet,
    pub enlarged_sim_bit_set: BitSet,
    pub awake_island_bit_set: BitSet,
    pub joint_state_bit_set: BitSet,
    pub sensor_hits: Vec<SensorHit>,
    pub split_island_id: i32,
    pub split_sleep_time: f32,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            contact_state_bit_set: BitSet::new(),
            enlarged_sim_bit_set: BitSet::new(),
            awake_island_bit_set: BitSet::new(),
            joint_state_bit_set: BitSet::new(),
            sensor_hits: Vec::new(),
            split_island_id: NULL_INDEX,
            split_sleep_time: 0.0,
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverStageType {
    PrepareJoints,
    PrepareContacts,
    IntegrateVelocities,
    WarmStart,
    Solve,
    IntegratePositions,
    Relax,
    Restitution,
    StoreImpulses,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverBlockType {
    Body,
    Joint,
    Contact,
    GraphJoint,
    GraphContact,
}

/// A chunk of work claimed by CAS on `sync_index`.
pub struct SolverBlock {
    pub start_index: i32,
    pub count: i16,
    pub block_type: SolverBlockType,
    /// Epoch of the last stage visit that executed this block. Strictly
    /// increasing across visits, which lets stages share block arrays.
    pub sync_index: AtomicU32,
}

pub struct SolverStage {
    pub stage_type: SolverStageType,
    pub blocks: *mut SolverBlock,
    pub block_count: i32,
    /// Graph color for per-color stages, -1 otherwise.
    pub color_index: i32,
    pub completion_count: AtomicI32,
}

/// Shared per-step state. Worker tasks address it through a raw pointer;
/// every mutable field is either atomic, worker-disjoint, or only touched
/// by the main worker between stages.
pub struct StepContext {
    pub world: *mut World,
    pub dt: f32,
    pub inv_dt: f32,
    /// Substep time step.
    pub h: f32,
    pub inv_h: f32,
    pub sub_step_count: i32,
    pub gravity: Vec2,
    pub max_linear_velocity: f32,
    pub contact_softness: Softness,
    pub static_softness: Softness,
    pub joint_softness: Softness,
    pub restitution_threshold: f32,
    pub contact_push_max_speed: f32,
    pub enable_warm_starting: bool,

    pub sims: *mut BodySim,
    pub states: *mut BodyState,
    pub graph: *mut ConstraintGraph,
    /// Flat pointer array over every colored joint sim.
    pub joints: *mut *mut JointSim,
    /// Flat pointer array over every colored contact sim.
    pub contacts: *mut *mut ContactSim,
    /// Constraint memory parallel to `contacts`.
    pub contact_constraints: *mut ContactConstraint,
    pub overflow_constraints: *mut ContactConstraint,

    pub active_color_count: i32,
    pub worker_count: i32,
    pub stage_count: i32,
    pub stages: *mut SolverStage,
    /// `(sync_index << 16) | stage_index`, the stage machine's only shared
    /// word. `u32::MAX` is the termination sentinel.
    pub atomic_sync_bits: CachePadded<AtomicU32>,

    pub bullet_bodies: *mut i32,
    pub bullet_body_count: CachePadded<AtomicI32>,
}

impl StepContext {
    pub fn new(world: *mut World) -> Self {
        Self {
            world,
            dt: 0.0,
            inv_dt: 0.0,
            h: 0.0,
            inv_h: 0.0,
            sub_step_count: 1,
            gravity: Vec2::ZERO,
            max_linear_velocity: 0.0,
            contact_softness: Softness::default(),
            static_softness: Softness::default(),
            joint_softness: Softness::default(),
            restitution_threshold: 1.0,
            contact_push_max_speed: 3.0,
            enable_warm_starting: true,
            sims: std::ptr::null_mut(),
            states: std::ptr::null_mut(),
            graph: std::ptr::null_mut(),
            joints: std::ptr::null_mut(),
            contacts: std::ptr::null_mut(),
            contact_constraints: std::ptr::null_mut(),
            overflow_constraints: std::ptr::null_mut(),
            active_color_count: 0,
            worker_count: 1,
            stage_count: 0,
            stages: std::ptr::null_mut(),
            atomic_sync_bits: CachePadded::new(AtomicU32::new(0)),
            bullet_bodies: std::ptr::null_mut(),
            bullet_body_count: CachePadded::new(AtomicI32::new(0)),
        }
    }
}

struct WorkerContext {
    context: *mut StepContext,
    worker_index: i32,
}

// --- Per-substep kernels -------------------------------------------------

/// # Safety
/// Solver-stage contract: exclusive ownership of `[start, end)` via the
/// work-block CAS.
unsafe fn integrate_velocities_task(start: i32, end: i32, ctx: &StepContext) {
    let gravity = ctx.gravity;
    let h = ctx.h;
    let max_linear_speed = ctx.max_linear_velocity;
    let max_angular_speed = MAX_ROTATION * ctx.inv_dt;
    let max_linear_speed_squared = max_linear_speed * max_linear_speed;
    let max_angular_speed_squared = max_angular_speed * max_angular_speed;

    for i in start..end {
        let sim = &mut *ctx.sims.add(i as usize);
        let state = &mut *ctx.states.add(i as usize);

        let mut v = state.linear_velocity;
        let mut w = state.angular_velocity;

        // Pade approximation of exponential damping:
        // v2 = v1 / (1 + c * h)
        let linear_damping = 1.0 / (1.0 + h * sim.linear_damping);
        let angular_damping = 1.0 / (1.0 + h * sim.angular_damping);

        // Gravity scale is ignored for kinematic bodies.
        let gravity_scale = if sim.inv_mass > 0.0 {
            sim.gravity_scale
        } else {
            0.0
        };

        let linear_velocity_delta = h * sim.inv_mass * sim.force + h * gravity_scale * gravity;
        let angular_velocity_delta = h * sim.inv_inertia * sim.torque;

        v = linear_velocity_delta + linear_damping * v;
        w = angular_velocity_delta + angular_damping * w;

        if v.length_squared() > max_linear_speed_squared {
            let ratio = max_linear_speed / v.length();
            v *= ratio;
            sim.flags |= IS_SPEED_CAPPED;
        }

        if w * w > max_angular_speed_squared && sim.flags & ALLOW_FAST_ROTATION == 0 {
            let ratio = max_angular_speed / w.abs();
            w *= ratio;
            sim.flags |= IS_SPEED_CAPPED;
        }

        if state.flags & LOCK_LINEAR_X != 0 {
            v.x = 0.0;
        }
        if state.flags & LOCK_LINEAR_Y != 0 {
            v.y = 0.0;
        }
        if state.flags & LOCK_ANGULAR_Z != 0 {
            w = 0.0;
        }

        state.linear_velocity = v;
        state.angular_velocity = w;
    }
}

unsafe fn integrate_positions_task(start: i32, end: i32, ctx: &StepContext) {
    let h = ctx.h;
    debug_assert!(start <= end);

    for i in start..end {
        let state = &mut *ctx.states.add(i as usize);

        if state.flags & LOCK_LINEAR_X != 0 {
            state.linear_velocity.x = 0.0;
        }
        if state.flags & LOCK_LINEAR_Y != 0 {
            state.linear_velocity.y = 0.0;
        }
        if state.flags & LOCK_ANGULAR_Z != 0 {
            state.angular_velocity = 0.0;
        }

        state.delta_position += h * state.linear_velocity;
        state.delta_rotation = state.delta_rotation.integrate(h * state.angular_velocity);
    }
}

unsafe fn prepare_joints_task(start: i32, end: i32, ctx: &StepContext) {
    for i in start..end {
        let joint = &mut **ctx.joints.add(i as usize);
        prepare_joint(joint, ctx);
    }
}

unsafe fn warm_start_joints_task(start: i32, end: i32, ctx: &StepContext, color_index: i32) {
    let graph = &mut *ctx.graph;
    let color = &mut graph.colors[color_index as usize];
    debug_assert!(0 <= start && start <= end && end as usize <= color.joint_sims.len());

    for i in start..end {
        let joint = &mut color.joint_sims[i as usize];
        warm_start_joint(joint, ctx);
    }
}

unsafe fn solve_joints_task(
    start: i32,
    end: i32,
    ctx: &StepContext,
    color_index: i32,
    use_bias: bool,
    worker_index: i32,
) {
    let graph = &mut *ctx.graph;
    let color = &mut graph.colors[color_index as usize];
    debug_assert!(0 <= start && start <= end && end as usize <= color.joint_sims.len());

    let world = &mut *ctx.world;
    let joint_state_bit_set = &mut world.task_contexts[worker_index as usize].joint_state_bit_set;

    for i in start..end {
        let joint = &mut color.joint_sims[i as usize];
        solve_joint(joint, ctx, use_bias);

        if use_bias
            && (joint.force_threshold < f32::MAX || joint.torque_threshold < f32::MAX)
            && !joint_state_bit_set.get(joint.joint_id as usize)
        {
            let (force, torque) = get_joint_reaction(joint, ctx.inv_h);

            // A zero threshold reports every awake joint. First hit wins.
            if force >= joint.force_threshold || torque >= joint.torque_threshold {
                joint_state_bit_set.set(joint.joint_id as usize);
            }
        }
    }
}

// --- Overflow joints, serial on the main worker --------------------------

unsafe fn prepare_overflow_joints(ctx: &StepContext) {
    let graph = &mut *ctx.graph;
    let color = &mut graph.colors[OVERFLOW_INDEX];
    for joint in color.joint_sims.iter_mut() {
        prepare_joint(joint, ctx);
    }
}

unsafe fn warm_start_overflow_joints(ctx: &StepContext) {
    let graph = &mut *ctx.graph;
    let color = &mut graph.colors[OVERFLOW_INDEX];
    for joint in color.joint_sims.iter_mut() {
        warm_start_joint(joint, ctx);
    }
}

unsafe fn solve_overflow_joints(ctx: &StepContext, use_bias: bool) {
    let graph = &mut *ctx.graph;
    let color = &mut graph.colors[OVERFLOW_INDEX];
    let world = &mut *ctx.world;
    let joint_state_bit_set = &mut world.task_contexts[0].joint_state_bit_set;

    for joint in color.joint_sims.iter_mut() {
        solve_joint(joint, ctx, use_bias);

        if use_bias
            && (joint.force_threshold < f32::MAX || joint.torque_threshold < f32::MAX)
            && !joint_state_bit_set.get(joint.joint_id as usize)
        {
            let (force, torque) = get_joint_reaction(joint, ctx.inv_h);
            if force >= joint.force_threshold || torque >= joint.torque_threshold {
                joint_state_bit_set.set(joint.joint_id as usize);
            }
        }
    }
}

// --- Continuous collision ------------------------------------------------

struct ContinuousContext {
    world: *mut World,
    fast_body_sim: *mut BodySim,
    fast_shape: *mut Shape,
    centroid1: Vec2,
    centroid2: Vec2,
    sweep: Sweep,
    fraction: f32,
    sensor_hits: [SensorHit; MAX_CONTINUOUS_SENSOR_HITS],
    sensor_fractions: [f32; MAX_CONTINUOUS_SENSOR_HITS],
    sensor_count: i32,
}

/// Broad-phase candidate filter and TOI for one shape. Returns true to
/// continue the query.
unsafe fn continuous_query_callback(
    continuous_context: &mut ContinuousContext,
    shape_id: i32,
) -> bool {
    let world = &mut *continuous_context.world;
    let fast_shape = &*continuous_context.fast_shape;
    let fast_body_sim = &mut *continuous_context.fast_body_sim;

    debug_assert!(fast_shape.sensor_index == NULL_INDEX);

    // Skip same shape
    if shape_id == fast_shape.id {
        return true;
    }

    let shape = &world.shapes[shape_id as usize];

    // Skip same body
    if shape.body_id == fast_shape.body_id {
        return true;
    }

    let is_sensor = shape.sensor_index != NULL_INDEX;

    // Skip sensors unless the shapes want sensor events
    if is_sensor && (!shape.enable_sensor_events || !fast_shape.enable_sensor_events) {
        return true;
    }

    // Skip filtered shapes
    if !crate::physics::shape::should_shapes_collide(fast_shape.filter, shape.filter) {
        return true;
    }

    let body = &world.bodies[shape.body_id as usize];
    let body_sim = *world.get_body_sim(shape.body_id);
    debug_assert!(body.body_type == BodyType::Static || fast_body_sim.flags & IS_BULLET != 0);

    // Skip bullets: they never sweep against each other
    if body_sim.flags & IS_BULLET != 0 {
        return true;
    }

    // Custom user filtering
    if shape.enable_custom_filtering || fast_shape.enable_custom_filtering {
        if let Some(filter_fcn) = &world.custom_filter_fcn {
            let id_a = world.make_shape_id(shape.id);
            let id_b = world.make_shape_id(fast_shape.id);
            if !filter_fcn(id_a, id_b) {
                return true;
            }
        }
    }

    // Early out on fast parallel movement over a chain shape: the swept
    // centroid never crosses into the segment's core band.
    if let ShapeGeometry::ChainSegment(segment) = &shape.geometry {
        let transform = body_sim.transform;
        let p1 = transform.point(segment.point1);
        let p2 = transform.point(segment.point2);
        let (e, length) = crate::utilities::math::get_length_and_normalize(p2 - p1);
        if length > LINEAR_SLOP {
            let c1 = continuous_context.centroid1;
            let separation1 = crate::utilities::math::cross(c1 - p1, e);
            let c2 = continuous_context.centroid2;
            let separation2 = crate::utilities::math::cross(c2 - p1, e);

            let core_distance = CORE_FRACTION * fast_body_sim.min_extent;
            if separation1 < 0.0
                || (separation1 - separation2 < core_distance && separation2 > core_distance)
            {
                return true;
            }
        }
    }

    let mut input = ToiInput {
        proxy_a: shape.distance_proxy(),
        proxy_b: fast_shape.distance_proxy(),
        sweep_a: body_sim.make_sweep(),
        sweep_b: continuous_context.sweep,
        max_fraction: continuous_context.fraction,
    };

    let mut output = time_of_impact(&input);
    if is_sensor {
        // Only accept a sensor hit that is sooner than the current solid
        // hit.
        if output.fraction <= continuous_context.fraction
            && (continuous_context.sensor_count as usize) < MAX_CONTINUOUS_SENSOR_HITS
        {
            let index = continuous_context.sensor_count as usize;
            continuous_context.sensor_hits[index] = SensorHit {
                sensor_id: shape.id,
                visitor_id: fast_shape.id,
            };
            continuous_context.sensor_fractions[index] = output.fraction;
            continuous_context.sensor_count += 1;
        }
    } else {
        let mut hit_fraction = continuous_context.fraction;
        let mut did_hit = false;

        if 0.0 < output.fraction && output.fraction < continuous_context.fraction {
            hit_fraction = output.fraction;
            did_hit = true;
        } else if 0.0 == output.fraction {
            // Initial-overlap false positive: retry against a small circle
            // at the fast shape centroid.
            let centroid = fast_shape.centroid();
            let extent = fast_shape.extents(centroid);
            let radius = CORE_FRACTION * extent.min_extent;
            input.proxy_b = crate::physics::distance::DistanceProxy::new(&[centroid], radius);
            output = time_of_impact(&input);
            if 0.0 < output.fraction && output.fraction < continuous_context.fraction {
                hit_fraction = output.fraction;
                did_hit = true;
            }
        }

        if did_hit && (shape.enable_pre_solve_events || fast_shape.enable_pre_solve_events) {
            if let Some(pre_solve_fcn) = &world.pre_solve_fcn {
                let id_a = world.make_shape_id(shape.id);
                let id_b = world.make_shape_id(fast_shape.id);
                did_hit = pre_solve_fcn(id_a, id_b, output.point, output.normal);
            }
        }

        if did_hit {
            fast_body_sim.flags |= HAD_TIME_OF_IMPACT;
            continuous_context.fraction = hit_fraction;
        }
    }

    true
}

/// TOI-sweeps one fast body against the broad phase and advances it to
/// the earliest hit.
unsafe fn solve_continuous(world_ptr: *mut World, body_sim_index: i32, task_context_index: usize) {
    let world = &mut *world_ptr;
    let awake_set = &mut world.solver_sets[AWAKE_SET as usize];
    let fast_body_sim: *mut BodySim = &mut awake_set.body_sims[body_sim_index as usize];
    debug_assert!((*fast_body_sim).flags & IS_FAST != 0);

    let sweep = (*fast_body_sim).make_sweep();

    let xf1 = Transform {
        p: sweep.c1 - sweep.q1.rotate(sweep.local_center),
        q: sweep.q1,
    };
    let xf2 = Transform {
        p: sweep.c2 - sweep.q2.rotate(sweep.local_center),
        q: sweep.q2,
    };

    let is_bullet = (*fast_body_sim).flags & IS_BULLET != 0;
    let fast_body_id = (*fast_body_sim).body_id;

    let mut context = ContinuousContext {
        world: world_ptr,
        fast_body_sim,
        fast_shape: std::ptr::null_mut(),
        centroid1: Vec2::ZERO,
        centroid2: Vec2::ZERO,
        sweep,
        fraction: 1.0,
        sensor_hits: [SensorHit {
            sensor_id: 0,
            visitor_id: 0,
        }; MAX_CONTINUOUS_SENSOR_HITS],
        sensor_fractions: [0.0; MAX_CONTINUOUS_SENSOR_HITS],
        sensor_count: 0,
    };

    let mut shape_id = world.bodies[fast_body_id as usize].head_shape_id;
    while shape_id != NULL_INDEX {
        let fast_shape: *mut Shape = &mut world.shapes[shape_id as usize];
        shape_id = (*fast_shape).next_shape_id;

        context.fast_shape = fast_shape;
        context.centroid1 = xf1.point((*fast_shape).local_centroid);
        context.centroid2 = xf2.point((*fast_shape).local_centroid);

        let box1 = (*fast_shape).aabb;
        let box2 = (*fast_shape).compute_aabb(xf2);

        // Avoid double computation when there is no impact event.
        (*fast_shape).aabb = box2;

        // No continuous collision for sensors, but the bounds refresh
        // above still applies.
        if (*fast_shape).sensor_index != NULL_INDEX {
            continue;
        }

        let swept_box = Aabb::union(box1, box2);

        let mask = (*fast_shape).filter.mask_bits;
        let static_tree = &(*world_ptr).broad_phase.trees[BodyType::Static.tree_index()];
        static_tree.query(swept_box, mask, &mut |_, user_data| unsafe {
            continuous_query_callback(&mut context, user_data as i32)
        });

        if is_bullet {
            let kinematic_tree =
                &(*world_ptr).broad_phase.trees[BodyType::Kinematic.tree_index()];
            kinematic_tree.query(swept_box, mask, &mut |_, user_data| unsafe {
                continuous_query_callback(&mut context, user_data as i32)
            });
            let dynamic_tree = &(*world_ptr).broad_phase.trees[BodyType::Dynamic.tree_index()];
            dynamic_tree.query(swept_box, mask, &mut |_, user_data| unsafe {
                continuous_query_callback(&mut context, user_data as i32)
            });
        }
    }

    let speculative_distance = SPECULATIVE_DISTANCE;
    let aabb_margin = AABB_MARGIN;

    if context.fraction < 1.0 {
        // Advance the body to the time of impact.
        let q = Rot::nlerp(sweep.q1, sweep.q2, context.fraction);
        let c = sweep.c1.lerp(sweep.c2, context.fraction);
        let origin = c - q.rotate(sweep.local_center);

        let transform = Transform { p: origin, q };
        (*fast_body_sim).transform = transform;
        (*fast_body_sim).center = c;
        (*fast_body_sim).rotation0 = q;
        (*fast_body_sim).center0 = c;

        world.body_move_events[body_sim_index as usize].transform = transform;

        // Refresh AABBs at the interpolated transform. A fast body may not
        // have moved far, so enlargement is not a given.
        let mut shape_id = world.bodies[fast_body_id as usize].head_shape_id;
        while shape_id != NULL_INDEX {
            let shape = &mut world.shapes[shape_id as usize];

            let aabb = shape.compute_aabb(transform).expand(speculative_distance);
            shape.aabb = aabb;

            if !shape.fat_aabb.contains(aabb) {
                shape.fat_aabb = aabb.expand(aabb_margin);
                shape.enlarged_aabb = true;
                (*fast_body_sim).flags |= ENLARGE_BOUNDS;
            }

            shape_id = shape.next_shape_id;
        }
    } else {
        // No time of impact event; advance the sweep origin.
        (*fast_body_sim).rotation0 = (*fast_body_sim).transform.q;
        (*fast_body_sim).center0 = (*fast_body_sim).center;

        let mut shape_id = world.bodies[fast_body_id as usize].head_shape_id;
        while shape_id != NULL_INDEX {
            let shape = &mut world.shapes[shape_id as usize];

            // shape.aabb is already current from the sweep loop above.
            if !shape.fat_aabb.contains(shape.aabb) {
                shape.fat_aabb = shape.aabb.expand(aabb_margin);
                shape.enlarged_aabb = true;
                (*fast_body_sim).flags |= ENLARGE_BOUNDS;
            }

            shape_id = shape.next_shape_id;
        }
    }

    // Queue sensor hits for serial processing, dropping any recorded
    // after the committed solid hit.
    let task_context = &mut world.task_contexts[task_context_index];
    for i in 0..context.sensor_count as usize {
        if context.sensor_fractions[i] < context.fraction {
            task_context.sensor_hits.push(context.sensor_hits[i]);
        }
    }
}

// --- Body finalization ---------------------------------------------------

unsafe fn finalize_bodies_task(
    start_index: i32,
    end_index: i32,
    thread_index: u32,
    context: *mut u8,
) {
    let step_context = &mut *(context as *mut StepContext);
    let world = &mut *step_context.world;
    let enable_sleep = world.enable_sleep;
    let enable_continuous = world.enable_continuous;
    let time_step = step_context.dt;
    let inv_time_step = step_context.inv_dt;

    let states = step_context.states;
    let sims = step_context.sims;

    debug_assert!(end_index as usize <= world.body_move_events.len());

    let speculative_distance = SPECULATIVE_DISTANCE;
    let aabb_margin = AABB_MARGIN;

    debug_assert!(start_index <= end_index);

    for sim_index in start_index..end_index {
        let state = &mut *states.add(sim_index as usize);
        let sim = &mut *sims.add(sim_index as usize);

        if state.flags & LOCK_LINEAR_X != 0 {
            state.linear_velocity.x = 0.0;
        }
        if state.flags & LOCK_LINEAR_Y != 0 {
            state.linear_velocity.y = 0.0;
        }
        if state.flags & LOCK_ANGULAR_Z != 0 {
            state.angular_velocity = 0.0;
        }

        let v = state.linear_velocity;
        let w = state.angular_velocity;

        debug_assert!(v.is_finite() && w.is_finite());

        sim.center += state.delta_position;
        sim.transform.q = state.delta_rotation.mul(sim.transform.q).normalize();

        // Velocity of the farthest point on the body accounts for
        // rotation.
        let max_velocity = v.length() + w.abs() * sim.max_extent;

        // Sleep observes position correction as well as true velocity, at
        // a reduced weight.
        let max_delta_position =
            state.delta_position.length() + state.delta_rotation.s.abs() * sim.max_extent;
        let position_sleep_factor = 0.5;

        let sleep_velocity =
            max_velocity.max(position_sleep_factor * inv_time_step * max_delta_position);

        state.delta_position = Vec2::ZERO;
        state.delta_rotation = Rot::IDENTITY;

        sim.transform.p = sim.center - sim.transform.q.rotate(sim.local_center);

        let body_id = sim.body_id;
        {
            let body = &mut world.bodies[body_id as usize];
            body.body_move_index = sim_index;
            let move_event = &mut world.body_move_events[sim_index as usize];
            move_event.transform = sim.transform;
            move_event.body_id = BodyId {
                index1: body_id + 1,
                world0: world.world_id,
                generation: body.generation,
            };
            move_event.fell_asleep = false;

            sim.force = Vec2::ZERO;
            sim.torque = 0.0;

            body.flags &= !(IS_FAST | IS_SPEED_CAPPED | HAD_TIME_OF_IMPACT);
            body.flags |= sim.flags & (IS_SPEED_CAPPED | HAD_TIME_OF_IMPACT);
            sim.flags &= !(IS_FAST | IS_SPEED_CAPPED | HAD_TIME_OF_IMPACT);
        }

        let body_type = world.bodies[body_id as usize].body_type;
        let body_enable_sleep = world.bodies[body_id as usize].enable_sleep;
        let sleep_threshold = world.bodies[body_id as usize].sleep_threshold;

        if !enable_sleep || !body_enable_sleep || sleep_velocity > sleep_threshold {
            // Body is not sleepy.
            world.bodies[body_id as usize].sleep_time = 0.0;

            if body_type == BodyType::Dynamic
                && enable_continuous
                && max_velocity * time_step > 0.5 * sim.min_extent
            {
                sim.flags |= IS_FAST;

                if sim.flags & IS_BULLET != 0 {
                    // Bullets run in a dedicated task after the solve.
                    let bullet_index = step_context
                        .bullet_body_count
                        .fetch_add(1, Ordering::AcqRel);
                    *step_context.bullet_bodies.add(bullet_index as usize) = sim_index;
                } else {
                    solve_continuous(step_context.world, sim_index, thread_index as usize);
                }
            } else {
                // Body is safe to advance.
                sim.center0 = sim.center;
                sim.rotation0 = sim.transform.q;
            }
        } else {
            // Body is safe to advance and is falling asleep.
            sim.center0 = sim.center;
            sim.rotation0 = sim.transform.q;
            world.bodies[body_id as usize].sleep_time += time_step;
        }

        // Any single body can keep its island awake.
        {
            let body = &world.bodies[body_id as usize];
            let island_id = body.island_id;
            let sleep_time = body.sleep_time;
            if island_id != NULL_INDEX {
                let island = &world.islands[island_id as usize];
                let island_local_index = island.local_index;
                let remove_count = island.constraint_remove_count;
                let task_context = &mut world.task_contexts[thread_index as usize];
                if sleep_time < TIME_TO_SLEEP {
                    debug_assert!(island_local_index != NULL_INDEX);
                    task_context
                        .awake_island_bit_set
                        .set(island_local_index as usize);
                } else if remove_count > 0 && sleep_time > task_context.split_sleep_time {
                    // Sleepy body on a possibly disconnected island:
                    // propose the sleepiest candidate for the next split.
                    task_context.split_island_id = island_id;
                    task_context.split_sleep_time = sleep_time;
                }
            }
        }

        // Refresh shape AABBs.
        let sim = &mut *sims.add(sim_index as usize);
        let transform = sim.transform;
        let is_fast = sim.flags & IS_FAST != 0;
        let mut shape_id = world.bodies[body_id as usize].head_shape_id;
        while shape_id != NULL_INDEX {
            let shape = &mut world.shapes[shape_id as usize];

            if is_fast {
                // Fast non-bullets had their AABB updated by the inline
                // continuous pass; bullets get theirs later. Set the bit
                // regardless to keep the move array sorted.
                world.task_contexts[thread_index as usize]
                    .enlarged_sim_bit_set
                    .set(sim_index as usize);
                shape_id = shape.next_shape_id;
            } else {
                let aabb = shape.compute_aabb(transform).expand(speculative_distance);
                shape.aabb = aabb;

                debug_assert!(!shape.enlarged_aabb);

                let next = shape.next_shape_id;
                if !shape.fat_aabb.contains(aabb) {
                    shape.fat_aabb = aabb.expand(aabb_margin);
                    shape.enlarged_aabb = true;
                    world.task_contexts[thread_index as usize]
                        .enlarged_sim_bit_set
                        .set(sim_index as usize);
                }
                shape_id = next;
            }
        }
    }
}

unsafe fn bullet_body_task(start_index: i32, end_index: i32, thread_index: u32, context: *mut u8) {
    let step_context = &mut *(context as *mut StepContext);

    debug_assert!(start_index <= end_index);

    for i in start_index..end_index {
        let sim_index = *step_context.bullet_bodies.add(i as usize);
        solve_continuous(step_context.world, sim_index, thread_index as usize);
    }
}

// --- Work-block scheduler and stage machine ------------------------------

unsafe fn execute_block(
    stage: &SolverStage,
    context: &StepContext,
    block: &SolverBlock,
    worker_index: i32,
) {
    let stage_type = stage.stage_type;
    let block_type = block.block_type;
    let start_index = block.start_index;
    let end_index = start_index + block.count as i32;

    match stage_type {
        SolverStageType::PrepareJoints => prepare_joints_task(start_index, end_index, context),
        SolverStageType::PrepareContacts => prepare_contacts_task(start_index, end_index, context),
        SolverStageType::IntegrateVelocities => {
            integrate_velocities_task(start_index, end_index, context)
        }
        SolverStageType::WarmStart => {
            if block_type == SolverBlockType::GraphContact {
                warm_start_contacts_task(start_index, end_index, context, stage.color_index);
            } else if block_type == SolverBlockType::GraphJoint {
                warm_start_joints_task(start_index, end_index, context, stage.color_index);
            }
        }
        SolverStageType::Solve => {
            if block_type == SolverBlockType::GraphContact {
                solve_contacts_task(start_index, end_index, context, stage.color_index, true);
            } else if block_type == SolverBlockType::GraphJoint {
                solve_joints_task(
                    start_index,
                    end_index,
                    context,
                    stage.color_index,
                    true,
                    worker_index,
                );
            }
        }
        SolverStageType::IntegratePositions => {
            integrate_positions_task(start_index, end_index, context)
        }
        SolverStageType::Relax => {
            if block_type == SolverBlockType::GraphContact {
                solve_contacts_task(start_index, end_index, context, stage.color_index, false);
            } else if block_type == SolverBlockType::GraphJoint {
                solve_joints_task(
                    start_index,
                    end_index,
                    context,
                    stage.color_index,
                    false,
                    worker_index,
                );
            }
        }
        SolverStageType::Restitution => {
            // Joint blocks pass through; restitution is contact-only, but
            // the claim still advances their sync index.
            if block_type == SolverBlockType::GraphContact {
                apply_restitution_task(start_index, end_index, context, stage.color_index);
            }
        }
        SolverStageType::StoreImpulses => store_impulses_task(start_index, end_index, context),
    }
}

/// Balanced round-robin start block for a worker; null when there are
/// fewer blocks than workers and this worker has none.
#[inline]
fn get_worker_start_index(worker_index: i32, block_count: i32, worker_count: i32) -> i32 {
    if block_count <= worker_count {
        return if worker_index < block_count {
            worker_index
        } else {
            NULL_INDEX
        };
    }

    let blocks_per_worker = block_count / worker_count;
    let remainder = block_count - blocks_per_worker * worker_count;
    blocks_per_worker * worker_index + remainder.min(worker_index)
}

unsafe fn execute_stage(
    stage: &SolverStage,
    context: &StepContext,
    previous_sync_index: u32,
    sync_index: u32,
    worker_index: i32,
) {
    let mut completed_count = 0;
    let blocks = stage.blocks;
    let block_count = stage.block_count;

    let start_index = get_worker_start_index(worker_index, block_count, context.worker_count);
    if start_index == NULL_INDEX {
        return;
    }

    debug_assert!(0 <= start_index && start_index < block_count);

    let mut block_index = start_index;

    // Claim forward from the start block.
    while (*blocks.add(block_index as usize))
        .sync_index
        .compare_exchange(
            previous_sync_index,
            sync_index,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    {
        debug_assert!(completed_count < block_count);

        execute_block(
            stage,
            context,
            &*blocks.add(block_index as usize),
            worker_index,
        );

        completed_count += 1;
        block_index += 1;
        if block_index >= block_count {
            // Keep looking for work
            block_index = 0;
        }
    }

    // Steal backward from a busy neighbor.
    block_index = start_index - 1;
    loop {
        if block_index < 0 {
            block_index = block_count - 1;
        }

        if (*blocks.add(block_index as usize))
            .sync_index
            .compare_exchange(
                previous_sync_index,
                sync_index,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            break;
        }

        execute_block(
            stage,
            context,
            &*blocks.add(block_index as usize),
            worker_index,
        );
        completed_count += 1;
        block_index -= 1;
    }

    stage
        .completion_count
        .fetch_add(completed_count, Ordering::AcqRel);
}

unsafe fn execute_main_stage(stage: &SolverStage, context: &StepContext, sync_bits: u32) {
    let block_count = stage.block_count;
    if block_count == 0 {
        return;
    }

    let worker_index = 0;

    if block_count == 1 {
        // A single block needs no worker hand-off.
        execute_block(stage, context, &*stage.blocks, worker_index);
    } else {
        context.atomic_sync_bits.store(sync_bits, Ordering::Release);

        let sync_index = (sync_bits >> 16) & 0xFFFF;
        debug_assert!(sync_index > 0);
        let previous_sync_index = sync_index - 1;

        execute_stage(stage, context, previous_sync_index, sync_index, worker_index);

        // The main worker never yields here: forward progress must be
        // possible even when the other workers are not scheduled.
        while stage.completion_count.load(Ordering::Acquire) != block_count {
            std::hint::spin_loop();
        }

        stage.completion_count.store(0, Ordering::Release);
    }
}

/// One solver task per worker. Worker 0 drives the stage sequence; the
/// rest spin on the sync word and execute whatever stage it names.
///
/// The worker index comes from the task context, not the thread index:
/// the underlying scheduler may run several tasks on one thread.
unsafe fn solver_task(_start: i32, _end: i32, _thread_index_ignore: u32, task_context: *mut u8) {
    let worker_context = &*(task_context as *mut WorkerContext);
    let worker_index = worker_context.worker_index;
    let context = &*worker_context.context;
    let active_color_count = context.active_color_count as usize;
    let stages = context.stages;

    if worker_index == 0 {
        // Stage index and sync index combine into the sync bits. Stages
        // are re-used across substeps, so sync indices grow monotonically
        // per block family to keep the claim CAS correct.
        let mut body_sync_index: u32 = 1;
        let mut stage_index: usize = 0;

        // All awake joints
        let joint_sync_index: u32 = 1;
        let mut sync_bits = (joint_sync_index << 16) | stage_index as u32;
        debug_assert!((*stages.add(stage_index)).stage_type == SolverStageType::PrepareJoints);
        execute_main_stage(&*stages.add(stage_index), context, sync_bits);
        stage_index += 1;

        // All colored contact constraints
        let mut contact_sync_index: u32 = 1;
        sync_bits = (contact_sync_index << 16) | stage_index as u32;
        debug_assert!((*stages.add(stage_index)).stage_type == SolverStageType::PrepareContacts);
        execute_main_stage(&*stages.add(stage_index), context, sync_bits);
        stage_index += 1;
        contact_sync_index += 1;

        let mut graph_sync_index: u32 = 1;

        // Overflow constraints do not fit in the graph coloring and get
        // solved single-threaded here.
        prepare_overflow_joints(context);
        prepare_overflow_contacts(context);

        let sub_step_count = context.sub_step_count;
        for _ in 0..sub_step_count {
            // The stage index restarts each substep; the sync bits still
            // increase monotonically through the upper half-word.
            let mut iter_stage_index = stage_index;

            sync_bits = (body_sync_index << 16) | iter_stage_index as u32;
            debug_assert!(
                (*stages.add(iter_stage_index)).stage_type == SolverStageType::IntegrateVelocities
            );
            execute_main_stage(&*stages.add(iter_stage_index), context, sync_bits);
            iter_stage_index += 1;
            body_sync_index += 1;

            warm_start_overflow_joints(context);
            warm_start_overflow_contacts(context);

            for _ in 0..active_color_count {
                sync_bits = (graph_sync_index << 16) | iter_stage_index as u32;
                debug_assert!(
                    (*stages.add(iter_stage_index)).stage_type == SolverStageType::WarmStart
                );
                execute_main_stage(&*stages.add(iter_stage_index), context, sync_bits);
                iter_stage_index += 1;
            }
            graph_sync_index += 1;

            let mut use_bias = true;
            for _ in 0..ITERATIONS {
                // Overflow constraints have lower priority.
                solve_overflow_joints(context, use_bias);
                solve_overflow_contacts(context, use_bias);

                for _ in 0..active_color_count {
                    sync_bits = (graph_sync_index << 16) | iter_stage_index as u32;
                    debug_assert!(
                        (*stages.add(iter_stage_index)).stage_type == SolverStageType::Solve
                    );
                    execute_main_stage(&*stages.add(iter_stage_index), context, sync_bits);
                    iter_stage_index += 1;
                }
                graph_sync_index += 1;
            }

            debug_assert!(
                (*stages.add(iter_stage_index)).stage_type == SolverStageType::IntegratePositions
            );
            sync_bits = (body_sync_index << 16) | iter_stage_index as u32;
            execute_main_stage(&*stages.add(iter_stage_index), context, sync_bits);
            iter_stage_index += 1;
            body_sync_index += 1;

            use_bias = false;
            for _ in 0..RELAX_ITERATIONS {
                solve_overflow_joints(context, use_bias);
                solve_overflow_contacts(context, use_bias);

                for _ in 0..active_color_count {
                    sync_bits = (graph_sync_index << 16) | iter_stage_index as u32;
                    debug_assert!(
                        (*stages.add(iter_stage_index)).stage_type == SolverStageType::Relax
                    );
                    execute_main_stage(&*stages.add(iter_stage_index), context, sync_bits);
                    iter_stage_index += 1;
                }
                graph_sync_index += 1;
            }
        }

        // Advance past the stages the substep loop covered.
        stage_index += 1
            + active_color_count
            + ITERATIONS * active_color_count
            + 1
            + RELAX_ITERATIONS * active_color_count;

        // Restitution
        {
            apply_overflow_restitution(context);

            let mut iter_stage_index = stage_index;
            for _ in 0..active_color_count {
                sync_bits = (graph_sync_index << 16) | iter_stage_index as u32;
                debug_assert!(
                    (*stages.add(iter_stage_index)).stage_type == SolverStageType::Restitution
                );
                execute_main_stage(&*stages.add(iter_stage_index), context, sync_bits);
                iter_stage_index += 1;
            }
            stage_index += active_color_count;
        }

        store_overflow_impulses(context);

        sync_bits = (contact_sync_index << 16) | stage_index as u32;
        debug_assert!((*stages.add(stage_index)).stage_type == SolverStageType::StoreImpulses);
        execute_main_stage(&*stages.add(stage_index), context, sync_bits);

        // Signal workers to finish
        context.atomic_sync_bits.store(u32::MAX, Ordering::Release);

        debug_assert!(stage_index + 1 == context.stage_count as usize);
        return;
    }

    // Worker: spin until the main worker publishes new sync bits, then
    // execute that stage. The spinning can waste real time, but it is
    // what makes parallel simulation with graph coloring possible.
    let mut last_sync_bits = 0;
    loop {
        let mut spin_wait = LocalSpinWait::new();
        let mut sync_bits;
        loop {
            sync_bits = context.atomic_sync_bits.load(Ordering::Acquire);
            if sync_bits != last_sync_bits {
                break;
            }
            spin_wait.spin_once();
        }

        if sync_bits == u32::MAX {
            // sentinel hit
            break;
        }

        let stage_index = (sync_bits & 0xFFFF) as i32;
        debug_assert!(stage_index < context.stage_count);

        let sync_index = (sync_bits >> 16) & 0xFFFF;
        debug_assert!(sync_index > 0);

        let previous_sync_index = sync_index - 1;

        let stage = &*context.stages.add(stage_index as usize);
        execute_stage(stage, context, previous_sync_index, sync_index, worker_index);

        last_sync_bits = sync_bits;
    }
}

// --- Step solve orchestration --------------------------------------------

/// Solves the awake set with graph coloring, finalizes bodies (running
/// continuous collision inline for fast non-bullets and in a follow-up
/// task for bullets), then runs the serial consolidation: joint events,
/// hit events, broad-phase refit, sensor-hit transfer, island sleep.
pub(crate) fn solve(world: &mut World, step_context: &mut StepContext) {
    world.step_index += 1;

    let awake_body_count = world.solver_sets[AWAKE_SET as usize].body_sims.len() as i32;
    tracing::debug!(awake_body_count, "solve");
    if awake_body_count == 0 {
        return;
    }

    unsafe {
        // Bullet buffer
        step_context.bullet_body_count.store(0, Ordering::Relaxed);
        step_context.bullet_bodies = world
            .arena
            .alloc::<i32>(awake_body_count as usize, "bullet bodies");

        let awake_set = &mut world.solver_sets[AWAKE_SET as usize];
        step_context.sims = awake_set.body_sims.as_mut_ptr();
        step_context.states = awake_set.body_states.as_mut_ptr();
        step_context.graph = &mut world.constraint_graph;

        // Count joints, contacts, and active colors.
        let mut awake_joint_count = 0usize;
        let mut awake_contact_count = 0usize;
        for i in 0..GRAPH_COLOR_COUNT - 1 {
            let color = &world.constraint_graph.colors[i];
            awake_joint_count += color.joint_sims.len();
            awake_contact_count += color.contact_sims.len();
        }

        // Move events are indexed by sim index; size before dispatch.
        world.body_move_events.resize(
            awake_body_count as usize,
            crate::physics::events::BodyMoveEvent {
                transform: Transform::IDENTITY,
                body_id: BodyId::default(),
                fell_asleep: false,
            },
        );

        // Each worker receives at most a few blocks per family. Small
        // block counts keep overhead down; block sizes grow instead when
        // the work does, so stealing stays possible.
        let worker_count = world.worker_count;
        let blocks_per_worker = 4;
        let max_block_count = blocks_per_worker * worker_count;

        // Body blocks
        let mut body_block_size = 1 << 5;
        let body_block_count;
        if awake_body_count > body_block_size * max_block_count {
            body_block_size = awake_body_count / max_block_count;
            body_block_count = max_block_count;
        } else {
            body_block_count = ((awake_body_count - 1) >> 5) + 1;
        }

        // Per-color block layout.
        let mut active_color_indices = [0usize; GRAPH_COLOR_COUNT];
        let mut color_contact_counts = [0i32; GRAPH_COLOR_COUNT];
        let mut color_contact_block_sizes = [0i32; GRAPH_COLOR_COUNT];
        let mut color_contact_block_counts = [0i32; GRAPH_COLOR_COUNT];
        let mut color_joint_counts = [0i32; GRAPH_COLOR_COUNT];
        let mut color_joint_block_sizes = [0i32; GRAPH_COLOR_COUNT];
        let mut color_joint_block_counts = [0i32; GRAPH_COLOR_COUNT];

        let mut graph_block_count = 0;
        let active_color_count;

        {
            let mut c = 0usize;
            for i in 0..GRAPH_COLOR_COUNT - 1 {
                let color_contact_count =
                    world.constraint_graph.colors[i].contact_sims.len() as i32;
                let color_joint_count = world.constraint_graph.colors[i].joint_sims.len() as i32;

                if color_contact_count + color_joint_count > 0 {
                    active_color_indices[c] = i;

                    color_contact_counts[c] = color_contact_count;
                    if color_contact_count > blocks_per_worker * max_block_count {
                        color_contact_block_sizes[c] = color_contact_count / max_block_count;
                        color_contact_block_counts[c] = max_block_count;
                    } else if color_contact_count > 0 {
                        color_contact_block_sizes[c] = blocks_per_worker;
                        color_contact_block_counts[c] = ((color_contact_count - 1) >> 2) + 1;
                    } else {
                        color_contact_block_sizes[c] = 0;
                        color_contact_block_counts[c] = 0;
                    }

                    color_joint_counts[c] = color_joint_count;
                    if color_joint_count > blocks_per_worker * max_block_count {
                        color_joint_block_sizes[c] = color_joint_count / max_block_count;
                        color_joint_block_counts[c] = max_block_count;
                    } else if color_joint_count > 0 {
                        color_joint_block_sizes[c] = blocks_per_worker;
                        color_joint_block_counts[c] = ((color_joint_count - 1) >> 2) + 1;
                    } else {
                        color_joint_block_sizes[c] = 0;
                        color_joint_block_counts[c] = 0;
                    }

                    graph_block_count +=
                        color_contact_block_counts[c] + color_joint_block_counts[c];
                    c += 1;
                }
            }
            active_color_count = c;
        }

        // Flat pointer arrays in color order, so per-color constraint
        // offsets line up with the flat prepare/store passes.
        let contacts = world
            .arena
            .alloc::<*mut ContactSim>(awake_contact_count.max(1), "contact pointers");
        let joints = world
            .arena
            .alloc::<*mut JointSim>(awake_joint_count.max(1), "joint pointers");
        let contact_constraints = world
            .arena
            .alloc::<ContactConstraint>(awake_contact_count.max(1), "contact constraint");

        let overflow_contact_count =
            world.constraint_graph.colors[OVERFLOW_INDEX].contact_sims.len();
        let overflow_constraints = world
            .arena
            .alloc::<ContactConstraint>(overflow_contact_count.max(1), "overflow constraint");

        {
            let mut contact_base = 0usize;
            let mut joint_base = 0usize;
            for i in 0..active_color_count {
                let j = active_color_indices[i];
                let color = &mut world.constraint_graph.colors[j];
                color.constraint_base = contact_base;

                for k in 0..color.contact_sims.len() {
                    *contacts.add(contact_base + k) = &mut color.contact_sims[k];
                }
                contact_base += color.contact_sims.len();

                for k in 0..color.joint_sims.len() {
                    *joints.add(joint_base + k) = &mut color.joint_sims[k];
                }
                joint_base += color.joint_sims.len();
            }
            debug_assert!(contact_base == awake_contact_count);
            debug_assert!(joint_base == awake_joint_count);
        }

        // Contact blocks (prepare/store over the flat array)
        let awake_contact_count = awake_contact_count as i32;
        let mut contact_block_size = blocks_per_worker;
        let mut contact_block_count = if awake_contact_count > 0 {
            ((awake_contact_count - 1) >> 2) + 1
        } else {
            0
        };
        if awake_contact_count > contact_block_size * max_block_count {
            contact_block_size = awake_contact_count / max_block_count;
            contact_block_count = max_block_count;
        }

        // Joint blocks (prepare over the flat array)
        let awake_joint_count = awake_joint_count as i32;
        let mut joint_block_size = blocks_per_worker;
        let mut joint_block_count = if awake_joint_count > 0 {
            ((awake_joint_count - 1) >> 2) + 1
        } else {
            0
        };
        if awake_joint_count > joint_block_size * max_block_count {
            joint_block_size = awake_joint_count / max_block_count;
            joint_block_count = max_block_count;
        }

        let stage_count = 2
            + 1
            + active_color_count
            + ITERATIONS * active_color_count
            + 1
            + RELAX_ITERATIONS * active_color_count
            + active_color_count
            + 1;

        let stages = world.arena.alloc::<SolverStage>(stage_count, "stages");
        let body_blocks = world
            .arena
            .alloc::<SolverBlock>(body_block_count as usize, "body blocks");
        let contact_blocks = world
            .arena
            .alloc::<SolverBlock>(contact_block_count.max(1) as usize, "contact blocks");
        let joint_blocks = world
            .arena
            .alloc::<SolverBlock>(joint_block_count.max(1) as usize, "joint blocks");
        let graph_blocks = world
            .arena
            .alloc::<SolverBlock>(graph_block_count.max(1) as usize, "graph blocks");

        // Split the island flagged last step. This may be expensive and
        // must not run in parallel with body finalization, so it goes
        // here.
        if world.split_island_id != NULL_INDEX {
            let split_island_id = world.split_island_id;
            world.split_island(split_island_id);
            world.split_island_id = NULL_INDEX;
        }

        let write_block =
            |block: *mut SolverBlock, start_index: i32, count: i32, block_type: SolverBlockType| unsafe {
                (*block).start_index = start_index;
                (*block).count = count as i16;
                (*block).block_type = block_type;
                (*block).sync_index = AtomicU32::new(0);
            };

        // Body blocks
        for i in 0..body_block_count {
            let count = if i == body_block_count - 1 {
                awake_body_count - i * body_block_size
            } else {
                body_block_size
            };
            write_block(
                body_blocks.add(i as usize),
                i * body_block_size,
                count,
                SolverBlockType::Body,
            );
        }

        // Joint blocks
        for i in 0..joint_block_count {
            let count = if i == joint_block_count - 1 {
                awake_joint_count - i * joint_block_size
            } else {
                joint_block_size
            };
            write_block(
                joint_blocks.add(i as usize),
                i * joint_block_size,
                count,
                SolverBlockType::Joint,
            );
        }

        // Contact blocks
        for i in 0..contact_block_count {
            let count = if i == contact_block_count - 1 {
                awake_contact_count - i * contact_block_size
            } else {
                contact_block_size
            };
            write_block(
                contact_blocks.add(i as usize),
                i * contact_block_size,
                count,
                SolverBlockType::Contact,
            );
        }

        // Graph blocks: per color, joints first then contacts for cache
        // friendly adjacency.
        let mut graph_color_blocks = [std::ptr::null_mut::<SolverBlock>(); GRAPH_COLOR_COUNT];
        let mut base_graph_block = graph_blocks;

        for i in 0..active_color_count {
            graph_color_blocks[i] = base_graph_block;

            let joint_count = color_joint_block_counts[i];
            let joint_size = color_joint_block_sizes[i];
            for j in 0..joint_count {
                let count = if j == joint_count - 1 {
                    color_joint_counts[i] - j * joint_size
                } else {
                    joint_size
                };
                write_block(
                    base_graph_block.add(j as usize),
                    j * joint_size,
                    count,
                    SolverBlockType::GraphJoint,
                );
            }
            base_graph_block = base_graph_block.add(joint_count as usize);

            let contact_count = color_contact_block_counts[i];
            let contact_size = color_contact_block_sizes[i];
            for j in 0..contact_count {
                let count = if j == contact_count - 1 {
                    color_contact_counts[i] - j * contact_size
                } else {
                    contact_size
                };
                write_block(
                    base_graph_block.add(j as usize),
                    j * contact_size,
                    count,
                    SolverBlockType::GraphContact,
                );
            }
            base_graph_block = base_graph_block.add(contact_count as usize);
        }
        debug_assert!(base_graph_block.offset_from(graph_blocks) == graph_block_count as isize);

        // Stage list
        let write_stage = |stage: *mut SolverStage,
                           stage_type: SolverStageType,
                           blocks: *mut SolverBlock,
                           block_count: i32,
                           color_index: i32| unsafe {
            (*stage).stage_type = stage_type;
            (*stage).blocks = blocks;
            (*stage).block_count = block_count;
            (*stage).color_index = color_index;
            (*stage).completion_count = AtomicI32::new(0);
        };

        let mut stage = stages;

        write_stage(
            stage,
            SolverStageType::PrepareJoints,
            joint_blocks,
            joint_block_count,
            -1,
        );
        stage = stage.add(1);

        write_stage(
            stage,
            SolverStageType::PrepareContacts,
            contact_blocks,
            contact_block_count,
            -1,
        );
        stage = stage.add(1);

        write_stage(
            stage,
            SolverStageType::IntegrateVelocities,
            body_blocks,
            body_block_count,
            -1,
        );
        stage = stage.add(1);

        for i in 0..active_color_count {
            write_stage(
                stage,
                SolverStageType::WarmStart,
                graph_color_blocks[i],
                color_joint_block_counts[i] + color_contact_block_counts[i],
                active_color_indices[i] as i32,
            );
            stage = stage.add(1);
        }

        for _ in 0..ITERATIONS {
            for i in 0..active_color_count {
                write_stage(
                    stage,
                    SolverStageType::Solve,
                    graph_color_blocks[i],
                    color_joint_block_counts[i] + color_contact_block_counts[i],
                    active_color_indices[i] as i32,
                );
                stage = stage.add(1);
            }
        }

        write_stage(
            stage,
            SolverStageType::IntegratePositions,
            body_blocks,
            body_block_count,
            -1,
        );
        stage = stage.add(1);

        for _ in 0..RELAX_ITERATIONS {
            for i in 0..active_color_count {
                write_stage(
                    stage,
                    SolverStageType::Relax,
                    graph_color_blocks[i],
                    color_joint_block_counts[i] + color_contact_block_counts[i],
                    active_color_indices[i] as i32,
                );
                stage = stage.add(1);
            }
        }

        // Joint blocks are mixed into the restitution stages; the kernel
        // is contact-only but the claims still advance their sync index.
        for i in 0..active_color_count {
            write_stage(
                stage,
                SolverStageType::Restitution,
                graph_color_blocks[i],
                color_joint_block_counts[i] + color_contact_block_counts[i],
                active_color_indices[i] as i32,
            );
            stage = stage.add(1);
        }

        write_stage(
            stage,
            SolverStageType::StoreImpulses,
            contact_blocks,
            contact_block_count,
            -1,
        );
        stage = stage.add(1);

        debug_assert!(stage.offset_from(stages) == stage_count as isize);

        debug_assert!(worker_count as usize <= MAX_WORKERS);

        step_context.joints = joints;
        step_context.contacts = contacts;
        step_context.contact_constraints = contact_constraints;
        step_context.overflow_constraints = overflow_constraints;
        step_context.active_color_count = active_color_count as i32;
        step_context.worker_count = worker_count;
        step_context.stage_count = stage_count as i32;
        step_context.stages = stages;
        step_context.atomic_sync_bits.store(0, Ordering::Release);

        // Reset per-worker scratch.
        let awake_island_count = world.solver_sets[AWAKE_SET as usize].island_sims.len();
        let joint_id_capacity = world.joint_id_pool.capacity() as usize;
        for task_context in world.task_contexts.iter_mut() {
            task_context.sensor_hits.clear();
            task_context
                .enlarged_sim_bit_set
                .set_bit_count_and_clear(awake_body_count as usize);
            task_context
                .awake_island_bit_set
                .set_bit_count_and_clear(awake_island_count);
            task_context
                .joint_state_bit_set
                .set_bit_count_and_clear(joint_id_capacity);
            task_context.split_island_id = NULL_INDEX;
            task_context.split_sleep_time = 0.0;
        }

        // Dispatch one solver task per worker. The worker index must come
        // from the task's own context because the underlying scheduler
        // may assign multiple tasks to thread 0.
        let step_context_ptr: *mut StepContext = step_context;
        let mut worker_contexts: [WorkerContext; MAX_WORKERS] =
            std::array::from_fn(|_| WorkerContext {
                context: step_context_ptr,
                worker_index: 0,
            });
        let mut handles = Vec::with_capacity(worker_count as usize);
        for i in 0..worker_count {
            worker_contexts[i as usize].worker_index = i;
            let handle = world.enqueue_task(
                solver_task,
                1,
                1,
                &mut worker_contexts[i as usize] as *mut WorkerContext as *mut u8,
            );
            handles.push(handle);
        }
        for handle in handles {
            world.finish_task(handle);
        }

        // Finalize bodies; inlines continuous collision for fast
        // non-bullet bodies. Must follow the solve and island splitting.
        let finalize_handle = world.enqueue_task(
            finalize_bodies_task,
            awake_body_count,
            64,
            step_context_ptr as *mut u8,
        );
        world.finish_task(finalize_handle);

        world.arena.free(graph_blocks);
        world.arena.free(joint_blocks);
        world.arena.free(contact_blocks);
        world.arena.free(body_blocks);
        world.arena.free(stages);
        world.arena.free(overflow_constraints);
        world.arena.free(contact_constraints);
        world.arena.free(joints);
        world.arena.free(contacts);
        step_context.contacts = std::ptr::null_mut();
        step_context.joints = std::ptr::null_mut();
        step_context.contact_constraints = std::ptr::null_mut();
        step_context.overflow_constraints = std::ptr::null_mut();
        step_context.stages = std::ptr::null_mut();
    }

    // ---- Serial consolidation ----

    // Joint events, in joint id order.
    {
        let worker_count = world.worker_count as usize;
        let (first, rest) = world.task_contexts.split_at_mut(1);
        let joint_state_bit_set = &mut first[0].joint_state_bit_set;
        for task_context in rest[..worker_count - 1].iter() {
            joint_state_bit_set.in_place_union(&task_context.joint_state_bit_set);
        }

        let joint_ids: Vec<usize> = joint_state_bit_set.iter().collect();
        for joint_id in joint_ids {
            let joint = &world.joints[joint_id];
            debug_assert!(joint.set_index == AWAKE_SET);
            let event = JointEvent {
                joint_id: JointId {
                    index1: joint_id as i32 + 1,
                    world0: world.world_id,
                    generation: joint.generation,
                },
            };
            world.joint_events.push(event);
        }
    }

    // Hit events, in color/local order.
    {
        debug_assert!(world.contact_hit_events.is_empty());

        let threshold = world.hit_event_threshold;
        for color_index in 0..GRAPH_COLOR_COUNT {
            let contact_count = world.constraint_graph.colors[color_index].contact_sims.len();
            for j in 0..contact_count {
                let contact_sim = &world.constraint_graph.colors[color_index].contact_sims[j];
                if contact_sim.sim_flags & SIM_ENABLE_HIT_EVENT == 0 {
                    continue;
                }

                let mut event = ContactHitEvent {
                    shape_id_a: ShapeId::default(),
                    shape_id_b: ShapeId::default(),
                    point: Vec2::ZERO,
                    normal: Vec2::ZERO,
                    approach_speed: threshold,
                };
                let mut hit = false;

                for k in 0..contact_sim.manifold.point_count as usize {
                    let mp = &contact_sim.manifold.points[k];
                    let approach_speed = -mp.normal_velocity;

                    // Speculative points that never collided don't count.
                    if approach_speed > event.approach_speed && mp.total_normal_impulse > 0.0 {
                        event.approach_speed = approach_speed;
                        event.point = mp.point;
                        hit = true;
                    }
                }

                if hit {
                    event.normal = contact_sim.manifold.normal;
                    let shape_id_a = contact_sim.shape_id_a;
                    let shape_id_b = contact_sim.shape_id_b;
                    event.shape_id_a = world.make_shape_id(shape_id_a);
                    event.shape_id_b = world.make_shape_id(shape_id_b);
                    world.contact_hit_events.push(event);
                }
            }
        }
    }

    // Broad-phase refit: union enlarged bits and grow proxies in sim
    // index order so the move buffer stays deterministic. This must
    // happen before bullets are processed.
    {
        let worker_count = world.worker_count as usize;
        let (first, rest) = world.task_contexts.split_at_mut(1);
        let enlarged_bit_set = &mut first[0].enlarged_sim_bit_set;
        for task_context in rest[..worker_count - 1].iter() {
            enlarged_bit_set.in_place_union(&task_context.enlarged_sim_bit_set);
        }

        let enlarged_sims: Vec<usize> = enlarged_bit_set.iter().collect();
        for sim_index in enlarged_sims {
            let body_id = world.solver_sets[AWAKE_SET as usize].body_sims[sim_index].body_id;
            let sim_flags = world.solver_sets[AWAKE_SET as usize].body_sims[sim_index].flags;
            let mut shape_id = world.bodies[body_id as usize].head_shape_id;

            if sim_flags & (IS_BULLET | IS_FAST) == (IS_BULLET | IS_FAST) {
                // Fast bullets get their final AABB after the bullet task;
                // buffer their moves now for determinism.
                while shape_id != NULL_INDEX {
                    let proxy_key = world.shapes[shape_id as usize].proxy_key;
                    world.broad_phase.buffer_move(proxy_key);
                    shape_id = world.shapes[shape_id as usize].next_shape_id;
                }
            } else {
                while shape_id != NULL_INDEX {
                    // The AABB may not have been enlarged despite the body
                    // being flagged; a multi-shape body enlarges shapes
                    // individually.
                    let enlarged = world.shapes[shape_id as usize].enlarged_aabb;
                    if enlarged {
                        world.shapes[shape_id as usize].enlarged_aabb = false;
                        let proxy_key = world.shapes[shape_id as usize].proxy_key;
                        let fat_aabb = world.shapes[shape_id as usize].fat_aabb;
                        world.broad_phase.enlarge_proxy(proxy_key, fat_aabb);
                    }
                    shape_id = world.shapes[shape_id as usize].next_shape_id;
                }
            }
        }
    }

    // Bullets.
    let bullet_body_count = step_context.bullet_body_count.load(Ordering::Acquire);
    if bullet_body_count > 0 {
        unsafe {
            // The fetch-add fill order depends on scheduling; sort by sim
            // index so the bullet pass is deterministic outright.
            let bullets = std::slice::from_raw_parts_mut(
                step_context.bullet_bodies,
                bullet_body_count as usize,
            );
            bullets.sort_unstable();

            let step_context_ptr: *mut StepContext = step_context;
            let handle = world.enqueue_task(
                bullet_body_task,
                bullet_body_count,
                8,
                step_context_ptr as *mut u8,
            );
            world.finish_task(handle);
        }

        // Serially enlarge broad-phase proxies for bullet shapes.
        for i in 0..bullet_body_count {
            let sim_index = unsafe { *step_context.bullet_bodies.add(i as usize) };
            let sim = &mut world.solver_sets[AWAKE_SET as usize].body_sims[sim_index as usize];
            if sim.flags & ENLARGE_BOUNDS == 0 {
                continue;
            }
            sim.flags &= !ENLARGE_BOUNDS;
            let body_id = sim.body_id;

            let mut shape_id = world.bodies[body_id as usize].head_shape_id;
            while shape_id != NULL_INDEX {
                let next = world.shapes[shape_id as usize].next_shape_id;
                if world.shapes[shape_id as usize].enlarged_aabb {
                    world.shapes[shape_id as usize].enlarged_aabb = false;
                    let proxy_key = world.shapes[shape_id as usize].proxy_key;
                    let fat_aabb = world.shapes[shape_id as usize].fat_aabb;
                    world.broad_phase.enlarge_proxy(proxy_key, fat_aabb);
                }
                shape_id = next;
            }
        }
    }

    unsafe {
        world.arena.free(step_context.bullet_bodies);
        step_context.bullet_bodies = std::ptr::null_mut();
        step_context.bullet_body_count.store(0, Ordering::Relaxed);
    }

    // Transfer continuous sensor hits to their sensors, in worker order.
    {
        let worker_count = world.worker_count as usize;
        for i in 0..worker_count {
            let hits = std::mem::take(&mut world.task_contexts[i].sensor_hits);
            for hit in hits.iter() {
                let sensor_index = world.shapes[hit.sensor_id as usize].sensor_index;
                let generation = world.shapes[hit.visitor_id as usize].generation;
                let sensor = &mut world.sensors[sensor_index as usize];
                sensor.hits.push(crate::physics::sensor::Visitor {
                    shape_id: hit.visitor_id,
                    generation,
                });
            }
            world.task_contexts[i].sensor_hits = hits;
        }
    }

    // Island sleeping. This must be done last because putting islands to
    // sleep invalidates the enlarged body bits.
    if world.enable_sleep {
        // Collect the split candidate for the next step.
        debug_assert!(world.split_island_id == NULL_INDEX);
        let mut split_sleep_timer = 0.0;
        let worker_count = world.worker_count as usize;
        for i in 0..worker_count {
            let task_context = &world.task_contexts[i];
            if task_context.split_island_id != NULL_INDEX
                && task_context.split_sleep_time >= split_sleep_timer
            {
                debug_assert!(task_context.split_sleep_time > 0.0);

                // Tie break for determinism: the smaller island id wins.
                // Needed because of work stealing.
                if task_context.split_sleep_time == split_sleep_timer
                    && world.split_island_id != NULL_INDEX
                    && task_context.split_island_id >= world.split_island_id
                {
                    continue;
                }

                world.split_island_id = task_context.split_island_id;
                split_sleep_timer = task_context.split_sleep_time;
            }
        }

        let (first, rest) = world.task_contexts.split_at_mut(1);
        let awake_island_bit_set = &mut first[0].awake_island_bit_set;
        for task_context in rest[..worker_count - 1].iter() {
            awake_island_bit_set.in_place_union(&task_context.awake_island_bit_set);
        }

        // Process in reverse because sleeping swap-removes island sims.
        let count = world.solver_sets[AWAKE_SET as usize].island_sims.len();
        for island_index in (0..count).rev() {
            if world.task_contexts[0].awake_island_bit_set.get(island_index) {
                // this island is still awake
                continue;
            }

            let island_id =
                world.solver_sets[AWAKE_SET as usize].island_sims[island_index].island_id;
            world.try_sleep_island(island_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_start_index_is_balanced() {
        // 10 blocks over 4 workers: 3,3,2,2 starting at 0,3,6,8.
        assert_eq!(get_worker_start_index(0, 10, 4), 0);
        assert_eq!(get_worker_start_index(1, 10, 4), 3);
        assert_eq!(get_worker_start_index(2, 10, 4), 6);
        assert_eq!(get_worker_start_index(3, 10, 4), 8);
    }

    #[test]
    fn worker_start_index_with_fewer_blocks_than_workers() {
        assert_eq!(get_worker_start_index(0, 2, 4), 0);
        assert_eq!(get_worker_start_index(1, 2, 4), 1);
        assert_eq!(get_worker_start_index(2, 2, 4), NULL_INDEX);
        assert_eq!(get_worker_start_index(3, 2, 4), NULL_INDEX);
    }

    #[test]
    fn block_claims_execute_exactly_once_per_stage_visit() {
        // Simulate two stage visits over one shared block array with the
        // claim CAS and count executions.
        let blocks: Vec<SolverBlock> = (0..8)
            .map(|i| SolverBlock {
                start_index: i * 4,
                count: 4,
                block_type: SolverBlockType::Body,
                sync_index: AtomicU32::new(0),
            })
            .collect();

        for sync_index in 1u32..=2 {
            let mut executed = 0;
            // Two simulated workers race over the same visit.
            for worker in 0..2 {
                let mut index = if worker == 0 { 0 } else { 4 };
                loop {
                    let block = &blocks[index % 8];
                    if block
                        .sync_index
                        .compare_exchange(
                            sync_index - 1,
                            sync_index,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        break;
                    }
                    executed += 1;
                    index += 1;
                }
            }
            assert_eq!(executed, 8, "every block runs exactly once per visit");
        }
    }
}
