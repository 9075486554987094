//! The world: entity storage, step orchestration, and events.
//!
//! A step runs pair update → narrow phase → solve → sensors, then flips
//! the double-buffered end-event arrays. All entity mutation outside the
//! solver phases is serial.

use crate::physics::body::{
    body_sim_from_def, body_state_from_def, new_body, Body, BodyDef, BodySim, BodyType,
};
use crate::physics::broad_phase::BroadPhase;
use crate::physics::constraint_graph::ConstraintGraph;
use crate::physics::contact::{
    shape_kind_rank, shape_pair_key, update_contact_manifold, Contact, ContactSim,
    CONTACT_ENABLE_CONTACT_EVENTS, CONTACT_TOUCHING, SIM_DISJOINT, SIM_ENABLE_HIT_EVENT,
    SIM_ENABLE_PRE_SOLVE_EVENTS, SIM_STARTED_TOUCHING, SIM_STOPPED_TOUCHING, SIM_TOUCHING,
};
use crate::physics::contact_solver::make_soft;
use crate::physics::events::{
    BodyId, BodyMoveEvent, ContactBeginTouchEvent, ContactEndTouchEvent, ContactHitEvent,
    ContactId, JointEvent, SensorBeginTouchEvent, SensorEndTouchEvent, ShapeId,
};
use crate::physics::island::Island;
use crate::physics::joint::{
    DistanceJoint, DistanceJointDef, Joint, JointDef, JointSim, JointSolver, JointType,
    RevoluteJoint, RevoluteJointDef,
};
use crate::physics::sensor::{overlap_sensors, Sensor, SensorTaskContext, Visitor};
use crate::physics::shape::{Shape, ShapeDef, ShapeGeometry};
use crate::physics::solver::{solve, StepContext, TaskContext};
use crate::physics::task::{TaskDispatcher, TaskFn, TaskHandle};
use crate::physics::{
    AABB_MARGIN, AWAKE_SET, DISABLED_SET, FIRST_SLEEPING_SET, MAX_WORKERS, NULL_INDEX,
    SPECULATIVE_DISTANCE, STATIC_SET,
};

use crate::utilities::arena::StepArena;
use crate::utilities::id_pool::IdPool;
use crate::utilities::math::Transform;
use glam::Vec2;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("worker count must be in 1..={max}, got {got}")]
    InvalidWorkerCount { got: i32, max: i32 },
    #[error("gravity must be finite")]
    NonFiniteGravity,
    #[error("invalid world definition: {0}")]
    InvalidParameter(&'static str),
}

pub type PreSolveFcn = Box<dyn Fn(ShapeId, ShapeId, Vec2, Vec2) -> bool + Send + Sync>;
pub type CustomFilterFcn = Box<dyn Fn(ShapeId, ShapeId) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct WorldDef {
    pub gravity: Vec2,
    pub restitution_threshold: f32,
    pub hit_event_threshold: f32,
    pub contact_hertz: f32,
    pub contact_damping_ratio: f32,
    pub contact_push_max_speed: f32,
    pub joint_hertz: f32,
    pub joint_damping_ratio: f32,
    pub maximum_linear_speed: f32,
    pub enable_sleep: bool,
    pub enable_continuous: bool,
    /// Upper bound on workers; the effective count is also limited by the
    /// dispatcher. Without a dispatcher the world runs single threaded.
    pub worker_count: i32,
    pub dispatcher: Option<Arc<dyn TaskDispatcher>>,
}

impl Default for WorldDef {
    fn default() -> Self {
        Self {
            gravity: Vec2::new(0.0, -10.0),
            restitution_threshold: 1.0,
            hit_event_threshold: 1.0,
            contact_hertz: 30.0,
            contact_damping_ratio: 10.0,
            contact_push_max_speed: 3.0,
            joint_hertz: 60.0,
            joint_damping_ratio: 2.0,
            maximum_linear_speed: 400.0,
            enable_sleep: true,
            enable_continuous: true,
            worker_count: 1,
            dispatcher: None,
        }
    }
}

static NEXT_WORLD_ID: AtomicU16 = AtomicU16::new(1);

pub struct World {
    pub(crate) world_id: u16,

    pub(crate) bodies: Vec<Body>,
    pub(crate) body_id_pool: IdPool,
    pub(crate) shapes: Vec<Shape>,
    pub(crate) shape_id_pool: IdPool,
    pub(crate) contacts: Vec<Contact>,
    pub(crate) contact_id_pool: IdPool,
    pub(crate) joints: Vec<Joint>,
    pub(crate) joint_id_pool: IdPool,
    pub(crate) islands: Vec<Island>,
    pub(crate) island_id_pool: IdPool,

    pub(crate) solver_sets: Vec<crate::physics::solver_set::SolverSet>,
    pub(crate) solver_set_id_pool: IdPool,

    pub(crate) constraint_graph: ConstraintGraph,
    pub(crate) broad_phase: BroadPhase,
    /// Shape pair key to contact id, for pair dedup.
    pub(crate) contact_lookup: HashMap<u64, i32>,

    pub(crate) sensors: Vec<Sensor>,
    pub(crate) sensor_task_contexts: Vec<SensorTaskContext>,
    pub(crate) task_contexts: Vec<TaskContext>,

    pub(crate) arena: StepArena,

    // Events
    pub(crate) body_move_events: Vec<BodyMoveEvent>,
    pub(crate) sensor_begin_events: Vec<SensorBeginTouchEvent>,
    pub(crate) sensor_end_events: [Vec<SensorEndTouchEvent>; 2],
    pub(crate) contact_begin_events: Vec<ContactBeginTouchEvent>,
    pub(crate) contact_end_events: [Vec<ContactEndTouchEvent>; 2],
    pub(crate) contact_hit_events: Vec<ContactHitEvent>,
    pub(crate) joint_events: Vec<JointEvent>,
    /// End events are double buffered so events emitted by destruction
    /// survive into the next step's query window.
    pub(crate) end_event_array_index: usize,

    // Config
    pub(crate) gravity: Vec2,
    pub(crate) restitution_threshold: f32,
    pub(crate) hit_event_threshold: f32,
    pub(crate) contact_hertz: f32,
    pub(crate) contact_damping_ratio: f32,
    pub(crate) contact_push_max_speed: f32,
    pub(crate) joint_hertz: f32,
    pub(crate) joint_damping_ratio: f32,
    pub(crate) max_linear_speed: f32,
    pub(crate) enable_sleep: bool,
    pub(crate) enable_continuous: bool,
    pub(crate) enable_warm_starting: bool,
    pub(crate) worker_count: i32,
    pub(crate) dispatcher: Option<Arc<dyn TaskDispatcher>>,
    pub(crate) pre_solve_fcn: Option<PreSolveFcn>,
    pub(crate) custom_filter_fcn: Option<CustomFilterFcn>,

    pub(crate) split_island_id: i32,
    pub(crate) step_index: u64,
    pub(crate) locked: bool,
}

impl World {
    pub fn new(def: &WorldDef) -> Result<World, WorldError> {
        if !def.gravity.is_finite() {
            return Err(WorldError::NonFiniteGravity);
        }
        if def.worker_count < 1 || def.worker_count > MAX_WORKERS as i32 {
            return Err(WorldError::InvalidWorkerCount {
                got: def.worker_count,
                max: MAX_WORKERS as i32,
            });
        }
        if !(def.contact_hertz >= 0.0)
            || !(def.contact_damping_ratio >= 0.0)
            || !(def.maximum_linear_speed > 0.0)
        {
            return Err(WorldError::InvalidParameter(
                "hertz, damping, and speed limits must be non-negative",
            ));
        }

        // Parallel solving requires truly concurrent workers; without a
        // dispatcher everything runs inline on one worker.
        let worker_count = match &def.dispatcher {
            Some(dispatcher) => def.worker_count.min(dispatcher.worker_count()),
            None => 1,
        };

        let mut solver_set_id_pool = IdPool::new();
        let static_set = solver_set_id_pool.alloc_id();
        let disabled_set = solver_set_id_pool.alloc_id();
        let awake_set = solver_set_id_pool.alloc_id();
        debug_assert!(static_set == STATIC_SET);
        debug_assert!(disabled_set == DISABLED_SET);
        debug_assert!(awake_set == AWAKE_SET);

        let solver_sets = vec![
            crate::physics::solver_set::SolverSet::new(STATIC_SET),
            crate::physics::solver_set::SolverSet::new(DISABLED_SET),
            crate::physics::solver_set::SolverSet::new(AWAKE_SET),
        ];

        Ok(World {
            world_id: NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed),
            bodies: Vec::new(),
            body_id_pool: IdPool::new(),
            shapes: Vec::new(),
            shape_id_pool: IdPool::new(),
            contacts: Vec::new(),
            contact_id_pool: IdPool::new(),
            joints: Vec::new(),
            joint_id_pool: IdPool::new(),
            islands: Vec::new(),
            island_id_pool: IdPool::new(),
            solver_sets,
            solver_set_id_pool,
            constraint_graph: ConstraintGraph::new(16),
            broad_phase: BroadPhase::new(),
            contact_lookup: HashMap::new(),
            sensors: Vec::new(),
            sensor_task_contexts: (0..worker_count).map(|_| SensorTaskContext::new()).collect(),
            task_contexts: (0..worker_count).map(|_| TaskContext::new()).collect(),
            arena: StepArena::new(16 * 1024),
            body_move_events: Vec::new(),
            sensor_begin_events: Vec::new(),
            sensor_end_events: [Vec::new(), Vec::new()],
            contact_begin_events: Vec::new(),
            contact_end_events: [Vec::new(), Vec::new()],
            contact_hit_events: Vec::new(),
            joint_events: Vec::new(),
            end_event_array_index: 0,
            gravity: def.gravity,
            restitution_threshold: def.restitution_threshold,
            hit_event_threshold: def.hit_event_threshold,
            contact_hertz: def.contact_hertz,
            contact_damping_ratio: def.contact_damping_ratio,
            contact_push_max_speed: def.contact_push_max_speed,
            joint_hertz: def.joint_hertz,
            joint_damping_ratio: def.joint_damping_ratio,
            max_linear_speed: def.maximum_linear_speed,
            enable_sleep: def.enable_sleep,
            enable_continuous: def.enable_continuous,
            enable_warm_starting: true,
            worker_count,
            dispatcher: def.dispatcher.clone(),
            pre_solve_fcn: None,
            custom_filter_fcn: None,
            split_island_id: NULL_INDEX,
            step_index: 0,
            locked: false,
        })
    }

    /// Optional veto of continuous-collision hits. Called from worker
    /// threads.
    pub fn set_pre_solve_callback(&mut self, callback: Option<PreSolveFcn>) {
        self.pre_solve_fcn = callback;
    }

    /// Optional veto of candidate pairs and sensor overlaps. Called from
    /// worker threads.
    pub fn set_custom_filter_callback(&mut self, callback: Option<CustomFilterFcn>) {
        self.custom_filter_fcn = callback;
    }

    // --- Handles ---------------------------------------------------------

    pub(crate) fn make_shape_id(&self, shape_id: i32) -> ShapeId {
        ShapeId {
            index1: shape_id + 1,
            world0: self.world_id,
            generation: self.shapes[shape_id as usize].generation,
        }
    }

    pub(crate) fn make_visitor_id(&self, visitor: &Visitor) -> ShapeId {
        ShapeId {
            index1: visitor.shape_id + 1,
            world0: self.world_id,
            generation: visitor.generation,
        }
    }

    pub(crate) fn make_body_id(&self, body_id: i32) -> BodyId {
        BodyId {
            index1: body_id + 1,
            world0: self.world_id,
            generation: self.bodies[body_id as usize].generation,
        }
    }

    fn check_body_id(&self, id: BodyId) -> i32 {
        let body_id = id.index1 - 1;
        debug_assert!(id.world0 == self.world_id);
        debug_assert!(self.bodies[body_id as usize].generation == id.generation);
        body_id
    }

    fn check_shape_id(&self, id: ShapeId) -> i32 {
        let shape_id = id.index1 - 1;
        debug_assert!(id.world0 == self.world_id);
        debug_assert!(self.shapes[shape_id as usize].generation == id.generation);
        shape_id
    }

    // --- Lookup helpers --------------------------------------------------

    pub(crate) fn get_body_sim(&self, body_id: i32) -> &BodySim {
        let body = &self.bodies[body_id as usize];
        &self.solver_sets[body.set_index as usize].body_sims[body.local_index as usize]
    }

    pub(crate) fn get_body_sim_mut(&mut self, body_id: i32) -> &mut BodySim {
        let body = &self.bodies[body_id as usize];
        &mut self.solver_sets[body.set_index as usize].body_sims[body.local_index as usize]
    }

    pub(crate) fn get_body_transform(&self, body_id: i32) -> Transform {
        self.get_body_sim(body_id).transform
    }

    // --- Tasks -----------------------------------------------------------

    pub(crate) unsafe fn enqueue_task(
        &self,
        task: TaskFn,
        item_count: i32,
        min_range: i32,
        ctx: *mut u8,
    ) -> Option<TaskHandle> {
        if item_count == 0 {
            return None;
        }
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.enqueue(task, item_count, min_range, ctx),
            None => {
                task(0, item_count, 0, ctx);
                None
            }
        }
    }

    pub(crate) fn finish_task(&self, handle: Option<TaskHandle>) {
        if let Some(handle) = handle {
            self.dispatcher
                .as_ref()
                .expect("task handle without dispatcher")
                .finish(handle);
        }
    }

    // --- Bodies ----------------------------------------------------------

    pub fn create_body(&mut self, def: &BodyDef) -> BodyId {
        debug_assert!(!self.locked);

        let body_id = self.body_id_pool.alloc_id();
        while self.bodies.len() <= body_id as usize {
            self.bodies.push(new_body(&BodyDef::default(), 0));
        }
        let generation = self.bodies[body_id as usize].generation;
        self.bodies[body_id as usize] = new_body(def, generation);

        let set_index = if def.body_type == BodyType::Static {
            STATIC_SET
        } else {
            AWAKE_SET
        };

        let sim = body_sim_from_def(def, body_id);
        let set = &mut self.solver_sets[set_index as usize];
        set.body_sims.push(sim);
        if set_index == AWAKE_SET {
            set.body_states.push(body_state_from_def(def));
        }
        let local_index = set.body_sims.len() as i32 - 1;

        let body = &mut self.bodies[body_id as usize];
        body.set_index = set_index;
        body.local_index = local_index;

        if def.body_type == BodyType::Dynamic {
            let island_id = self.create_island();
            self.add_body_to_island(island_id, body_id);
        }

        self.make_body_id(body_id)
    }

    pub fn destroy_body(&mut self, id: BodyId) {
        debug_assert!(!self.locked);
        let body_id = self.check_body_id(id);

        // Joints first; destroying a joint may touch contacts.
        let joint_ids = self.bodies[body_id as usize].joints.clone();
        for joint_id in joint_ids {
            self.destroy_joint_internal(joint_id);
        }

        let contact_ids = self.bodies[body_id as usize].contacts.clone();
        for contact_id in contact_ids {
            self.destroy_contact(contact_id);
        }

        let mut shape_id = self.bodies[body_id as usize].head_shape_id;
        while shape_id != NULL_INDEX {
            let next = self.shapes[shape_id as usize].next_shape_id;
            self.destroy_shape_internal(shape_id, false);
            shape_id = next;
        }
        self.bodies[body_id as usize].head_shape_id = NULL_INDEX;
        self.bodies[body_id as usize].shape_count = 0;

        self.remove_body_from_island(body_id);

        let (set_index, local_index) = {
            let body = &self.bodies[body_id as usize];
            (body.set_index, body.local_index)
        };
        self.remove_body_sim_from_set(set_index, local_index);

        let body = &mut self.bodies[body_id as usize];
        body.set_index = NULL_INDEX;
        body.local_index = NULL_INDEX;
        body.generation += 1;
        self.body_id_pool.free_id(body_id);
    }

    /// Wakes the body's solver set if it is sleeping.
    pub fn wake_body(&mut self, id: BodyId) {
        let body_id = self.check_body_id(id);
        let set_index = self.bodies[body_id as usize].set_index;
        if set_index >= FIRST_SLEEPING_SET {
            self.wake_solver_set(set_index);
        }
    }

    pub fn body_transform(&self, id: BodyId) -> Transform {
        let body_id = self.check_body_id(id);
        self.get_body_transform(body_id)
    }

    pub fn body_position(&self, id: BodyId) -> Vec2 {
        self.body_transform(id).p
    }

    pub fn body_linear_velocity(&self, id: BodyId) -> Vec2 {
        let body_id = self.check_body_id(id);
        let body = &self.bodies[body_id as usize];
        if body.set_index == AWAKE_SET {
            self.solver_sets[AWAKE_SET as usize].body_states[body.local_index as usize]
                .linear_velocity
        } else {
            Vec2::ZERO
        }
    }

    pub fn body_angular_velocity(&self, id: BodyId) -> f32 {
        let body_id = self.check_body_id(id);
        let body = &self.bodies[body_id as usize];
        if body.set_index == AWAKE_SET {
            self.solver_sets[AWAKE_SET as usize].body_states[body.local_index as usize]
                .angular_velocity
        } else {
            0.0
        }
    }

    pub fn body_is_awake(&self, id: BodyId) -> bool {
        let body_id = self.check_body_id(id);
        self.bodies[body_id as usize].set_index == AWAKE_SET
    }

    /// True if the body was advanced to a time of impact by the latest
    /// continuous collision pass.
    pub fn body_had_time_of_impact(&self, id: BodyId) -> bool {
        let body_id = self.check_body_id(id);
        let flag = crate::physics::body::HAD_TIME_OF_IMPACT;
        if self.bodies[body_id as usize].flags & flag != 0 {
            return true;
        }
        self.get_body_sim(body_id).flags & flag != 0
    }

    pub fn body_sleep_time(&self, id: BodyId) -> f32 {
        let body_id = self.check_body_id(id);
        self.bodies[body_id as usize].sleep_time
    }

    /// Recomputes mass, center of mass, and extents from the attached
    /// shapes.
    pub(crate) fn update_body_mass_data(&mut self, body_id: i32) {
        let body_type = self.bodies[body_id as usize].body_type;

        let mut mass = 0.0;
        let mut rotational_inertia = 0.0;
        let mut local_center = Vec2::ZERO;

        if body_type == BodyType::Dynamic {
            // First pass: aggregate mass about the body origin. Sensors
            // contribute mass too; a zero density opts out.
            let mut shape_id = self.bodies[body_id as usize].head_shape_id;
            let mut mass_datas = Vec::new();
            while shape_id != NULL_INDEX {
                let shape = &self.shapes[shape_id as usize];
                mass_datas.push(shape.mass_data());
                shape_id = shape.next_shape_id;
            }
            for md in &mass_datas {
                mass += md.mass;
                local_center += md.mass * md.center;
            }
            if mass > 0.0 {
                local_center /= mass;
            }
            for md in &mass_datas {
                let offset = md.center - local_center;
                rotational_inertia += md.rotational_inertia + md.mass * offset.length_squared();
            }
        }

        let mut min_extent = f32::MAX;
        let mut max_extent: f32 = 0.0;
        {
            let mut shape_id = self.bodies[body_id as usize].head_shape_id;
            while shape_id != NULL_INDEX {
                let shape = &self.shapes[shape_id as usize];
                let extent = shape.extents(local_center);
                min_extent = min_extent.min(extent.min_extent);
                max_extent = max_extent.max(extent.max_extent);
                shape_id = shape.next_shape_id;
            }
        }

        let sim = self.get_body_sim_mut(body_id);
        sim.local_center = local_center;
        sim.center = sim.transform.point(local_center);
        sim.center0 = sim.center;
        sim.rotation0 = sim.transform.q;
        sim.min_extent = if min_extent == f32::MAX { 0.0 } else { min_extent };
        sim.max_extent = max_extent;
        sim.inv_mass = if mass > 0.0 { 1.0 / mass } else { 0.0 };
        sim.inv_inertia = if rotational_inertia > 0.0 {
            1.0 / rotational_inertia
        } else {
            0.0
        };
    }

    // --- Shapes ----------------------------------------------------------

    pub fn create_shape(&mut self, body: BodyId, def: &ShapeDef, geometry: ShapeGeometry) -> ShapeId {
        debug_assert!(!self.locked);
        let body_id = self.check_body_id(body);

        let shape_id = self.shape_id_pool.alloc_id();
        while self.shapes.len() <= shape_id as usize {
            self.shapes.push(Shape {
                id: self.shapes.len() as i32,
                body_id: NULL_INDEX,
                next_shape_id: NULL_INDEX,
                geometry: ShapeGeometry::Circle(crate::physics::shape::Circle {
                    center: Vec2::ZERO,
                    radius: 0.0,
                }),
                density: 0.0,
                friction: 0.0,
                restitution: 0.0,
                filter: crate::physics::shape::Filter::default(),
                aabb: crate::utilities::bounding_box::Aabb::new(Vec2::ZERO, Vec2::ZERO),
                fat_aabb: crate::utilities::bounding_box::Aabb::new(Vec2::ZERO, Vec2::ZERO),
                local_centroid: Vec2::ZERO,
                proxy_key: NULL_INDEX,
                sensor_index: NULL_INDEX,
                generation: 0,
                enlarged_aabb: false,
                enable_sensor_events: false,
                enable_contact_events: false,
                enable_hit_events: false,
                enable_pre_solve_events: false,
                enable_custom_filtering: false,
            });
        }

        let transform = self.get_body_transform(body_id);
        let body_type = self.bodies[body_id as usize].body_type;
        let generation = self.shapes[shape_id as usize].generation;
        let head_shape_id = self.bodies[body_id as usize].head_shape_id;

        let mut shape = Shape {
            id: shape_id,
            body_id,
            next_shape_id: head_shape_id,
            geometry,
            density: def.density,
            friction: def.friction,
            restitution: def.restitution,
            filter: def.filter,
            aabb: crate::utilities::bounding_box::Aabb::new(Vec2::ZERO, Vec2::ZERO),
            fat_aabb: crate::utilities::bounding_box::Aabb::new(Vec2::ZERO, Vec2::ZERO),
            local_centroid: Vec2::ZERO,
            proxy_key: NULL_INDEX,
            sensor_index: NULL_INDEX,
            generation,
            enlarged_aabb: false,
            enable_sensor_events: def.enable_sensor_events,
            enable_contact_events: def.enable_contact_events,
            enable_hit_events: def.enable_hit_events,
            enable_pre_solve_events: def.enable_pre_solve_events,
            enable_custom_filtering: def.enable_custom_filtering,
        };
        shape.local_centroid = shape.centroid();
        shape.aabb = shape.compute_aabb(transform).expand(SPECULATIVE_DISTANCE);
        shape.fat_aabb = shape.aabb.expand(AABB_MARGIN);

        if def.is_sensor {
            shape.sensor_index = self.sensors.len() as i32;
            self.sensors.push(Sensor {
                shape_id,
                overlaps1: Vec::new(),
                overlaps2: Vec::new(),
                hits: Vec::new(),
            });
        }

        shape.proxy_key = self.broad_phase.create_proxy(
            body_type,
            shape.fat_aabb,
            def.filter.category_bits,
            shape_id,
            // New solid shapes must find their pairs even on a static
            // body.
            shape.sensor_index == NULL_INDEX,
        );

        self.shapes[shape_id as usize] = shape;

        let body = &mut self.bodies[body_id as usize];
        body.head_shape_id = shape_id;
        body.shape_count += 1;

        self.update_body_mass_data(body_id);

        self.make_shape_id(shape_id)
    }

    pub fn destroy_shape(&mut self, id: ShapeId) {
        debug_assert!(!self.locked);
        let shape_id = self.check_shape_id(id);
        self.destroy_shape_internal(shape_id, true);
    }

    fn destroy_shape_internal(&mut self, shape_id: i32, update_body: bool) {
        let body_id = self.shapes[shape_id as usize].body_id;

        // Contacts referencing this shape die with it.
        let contact_ids = self.bodies[body_id as usize].contacts.clone();
        for contact_id in contact_ids {
            let contact = &self.contacts[contact_id as usize];
            if contact.shape_id_a == shape_id || contact.shape_id_b == shape_id {
                self.destroy_contact(contact_id);
            }
        }

        if self.shapes[shape_id as usize].sensor_index != NULL_INDEX {
            self.destroy_sensor(shape_id);
        }

        let proxy_key = self.shapes[shape_id as usize].proxy_key;
        if proxy_key != NULL_INDEX {
            self.broad_phase.destroy_proxy(proxy_key);
            self.shapes[shape_id as usize].proxy_key = NULL_INDEX;
        }

        if update_body {
            // Unlink from the body's shape list.
            let head = self.bodies[body_id as usize].head_shape_id;
            if head == shape_id {
                self.bodies[body_id as usize].head_shape_id =
                    self.shapes[shape_id as usize].next_shape_id;
            } else {
                let mut prev = head;
                while prev != NULL_INDEX {
                    let next = self.shapes[prev as usize].next_shape_id;
                    if next == shape_id {
                        self.shapes[prev as usize].next_shape_id =
                            self.shapes[shape_id as usize].next_shape_id;
                        break;
                    }
                    prev = next;
                }
            }
            self.bodies[body_id as usize].shape_count -= 1;
            self.update_body_mass_data(body_id);
        }

        self.shapes[shape_id as usize].generation += 1;
        self.shapes[shape_id as usize].body_id = NULL_INDEX;
        self.shape_id_pool.free_id(shape_id);
    }

    // --- Contacts --------------------------------------------------------

    /// Joints with collide_connected disabled suppress contacts between
    /// their bodies.
    pub(crate) fn should_bodies_collide(&self, shape_id_a: i32, shape_id_b: i32) -> bool {
        let body_id_a = self.shapes[shape_id_a as usize].body_id;
        let body_id_b = self.shapes[shape_id_b as usize].body_id;
        let body_a = &self.bodies[body_id_a as usize];
        for &joint_id in &body_a.joints {
            let joint = &self.joints[joint_id as usize];
            let other = if joint.body_id_a == body_id_a {
                joint.body_id_b
            } else {
                joint.body_id_a
            };
            if other == body_id_b && !joint.collide_connected {
                return false;
            }
        }
        true
    }

    pub(crate) fn create_contact(&mut self, shape_id_a: i32, shape_id_b: i32) {
        // Order so A has the higher kind rank; the manifold dispatch
        // relies on it.
        let (shape_id_a, shape_id_b) = {
            let a = &self.shapes[shape_id_a as usize];
            let b = &self.shapes[shape_id_b as usize];
            if shape_kind_rank(a) >= shape_kind_rank(b) {
                (shape_id_a, shape_id_b)
            } else {
                (shape_id_b, shape_id_a)
            }
        };

        let body_id_a = self.shapes[shape_id_a as usize].body_id;
        let body_id_b = self.shapes[shape_id_b as usize].body_id;

        // Wake sleeping participants; the contact must live in the awake
        // set.
        for body_id in [body_id_a, body_id_b] {
            let set_index = self.bodies[body_id as usize].set_index;
            if set_index >= FIRST_SLEEPING_SET {
                self.wake_solver_set(set_index);
            }
        }

        let contact_id = self.contact_id_pool.alloc_id();
        while self.contacts.len() <= contact_id as usize {
            self.contacts.push(Contact {
                set_index: NULL_INDEX,
                color_index: NULL_INDEX,
                local_index: NULL_INDEX,
                shape_id_a: NULL_INDEX,
                shape_id_b: NULL_INDEX,
                body_id_a: NULL_INDEX,
                body_id_b: NULL_INDEX,
                island_id: NULL_INDEX,
                island_prev: NULL_INDEX,
                island_next: NULL_INDEX,
                flags: 0,
                generation: 0,
            });
        }

        let shape_a = &self.shapes[shape_id_a as usize];
        let shape_b = &self.shapes[shape_id_b as usize];

        let mut flags = 0;
        if shape_a.enable_contact_events && shape_b.enable_contact_events {
            flags |= CONTACT_ENABLE_CONTACT_EVENTS;
        }

        let mut sim_flags = 0;
        if shape_a.enable_hit_events || shape_b.enable_hit_events {
            sim_flags |= SIM_ENABLE_HIT_EVENT;
        }
        if shape_a.enable_pre_solve_events || shape_b.enable_pre_solve_events {
            sim_flags |= SIM_ENABLE_PRE_SOLVE_EVENTS;
        }

        // Friction mixes geometrically, restitution takes the maximum.
        let friction = (shape_a.friction * shape_b.friction).sqrt();
        let restitution = shape_a.restitution.max(shape_b.restitution);

        let generation = self.contacts[contact_id as usize].generation;
        self.contacts[contact_id as usize] = Contact {
            set_index: AWAKE_SET,
            color_index: NULL_INDEX,
            local_index: NULL_INDEX,
            shape_id_a,
            shape_id_b,
            body_id_a,
            body_id_b,
            island_id: NULL_INDEX,
            island_prev: NULL_INDEX,
            island_next: NULL_INDEX,
            flags,
            generation,
        };

        let sim = ContactSim {
            contact_id,
            shape_id_a,
            shape_id_b,
            body_sim_index_a: NULL_INDEX,
            body_sim_index_b: NULL_INDEX,
            inv_mass_a: 0.0,
            inv_i_a: 0.0,
            inv_mass_b: 0.0,
            inv_i_b: 0.0,
            friction,
            restitution,
            manifold: Default::default(),
            sim_flags,
        };

        let awake = &mut self.solver_sets[AWAKE_SET as usize];
        awake.contact_sims.push(sim);
        self.contacts[contact_id as usize].local_index = awake.contact_sims.len() as i32 - 1;

        self.contact_lookup
            .insert(shape_pair_key(shape_id_a, shape_id_b), contact_id);
        self.bodies[body_id_a as usize].contacts.push(contact_id);
        self.bodies[body_id_b as usize].contacts.push(contact_id);
    }

    pub(crate) fn destroy_contact(&mut self, contact_id: i32) {
        let (touching, flags, shape_id_a, shape_id_b, body_id_a, body_id_b) = {
            let contact = &self.contacts[contact_id as usize];
            (
                contact.flags & CONTACT_TOUCHING != 0,
                contact.flags,
                contact.shape_id_a,
                contact.shape_id_b,
                contact.body_id_a,
                contact.body_id_b,
            )
        };

        if touching {
            if flags & CONTACT_ENABLE_CONTACT_EVENTS != 0 {
                let event = ContactEndTouchEvent {
                    shape_id_a: self.make_shape_id(shape_id_a),
                    shape_id_b: self.make_shape_id(shape_id_b),
                    contact_id: self.make_contact_id(contact_id),
                };
                self.contact_end_events[self.end_event_array_index].push(event);
            }
            self.unlink_contact(contact_id);
        }

        // Pull the sim out of the graph or its set.
        let (set_index, color_index, local_index) = {
            let contact = &self.contacts[contact_id as usize];
            (contact.set_index, contact.color_index, contact.local_index)
        };
        if color_index != NULL_INDEX {
            debug_assert!(set_index == AWAKE_SET);
            self.remove_contact_from_graph(body_id_a, body_id_b, color_index, local_index);
        } else {
            self.remove_contact_sim_from_set(set_index, local_index);
        }

        self.contact_lookup
            .remove(&shape_pair_key(shape_id_a, shape_id_b));
        let body_a_contacts = &mut self.bodies[body_id_a as usize].contacts;
        if let Some(pos) = body_a_contacts.iter().position(|&c| c == contact_id) {
            body_a_contacts.swap_remove(pos);
        }
        let body_b_contacts = &mut self.bodies[body_id_b as usize].contacts;
        if let Some(pos) = body_b_contacts.iter().position(|&c| c == contact_id) {
            body_b_contacts.swap_remove(pos);
        }

        let contact = &mut self.contacts[contact_id as usize];
        contact.set_index = NULL_INDEX;
        contact.color_index = NULL_INDEX;
        contact.local_index = NULL_INDEX;
        contact.flags = 0;
        contact.generation += 1;
        self.contact_id_pool.free_id(contact_id);
    }

    fn make_contact_id(&self, contact_id: i32) -> ContactId {
        ContactId {
            index1: contact_id + 1,
            world0: self.world_id,
            generation: self.contacts[contact_id as usize].generation,
        }
    }

    // --- Joints ----------------------------------------------------------

    fn create_joint_internal(&mut self, base: &JointDef, joint_type: JointType, solver: JointSolver) -> i32 {
        debug_assert!(!self.locked);
        let body_id_a = self.check_body_id(base.body_a);
        let body_id_b = self.check_body_id(base.body_b);

        for body_id in [body_id_a, body_id_b] {
            let set_index = self.bodies[body_id as usize].set_index;
            if set_index >= FIRST_SLEEPING_SET {
                self.wake_solver_set(set_index);
            }
        }

        let joint_id = self.joint_id_pool.alloc_id();
        while self.joints.len() <= joint_id as usize {
            self.joints.push(Joint {
                joint_type: JointType::Distance,
                set_index: NULL_INDEX,
                color_index: NULL_INDEX,
                local_index: NULL_INDEX,
                body_id_a: NULL_INDEX,
                body_id_b: NULL_INDEX,
                island_id: NULL_INDEX,
                island_prev: NULL_INDEX,
                island_next: NULL_INDEX,
                collide_connected: true,
                generation: 0,
            });
        }

        let generation = self.joints[joint_id as usize].generation;
        self.joints[joint_id as usize] = Joint {
            joint_type,
            set_index: AWAKE_SET,
            color_index: NULL_INDEX,
            local_index: NULL_INDEX,
            body_id_a,
            body_id_b,
            island_id: NULL_INDEX,
            island_prev: NULL_INDEX,
            island_next: NULL_INDEX,
            collide_connected: base.collide_connected,
            generation,
        };

        let sim = JointSim {
            joint_id,
            body_id_a,
            body_id_b,
            local_anchor_a: base.local_anchor_a,
            local_anchor_b: base.local_anchor_b,
            force_threshold: base.force_threshold,
            torque_threshold: base.torque_threshold,
            solver,
            index_a: NULL_INDEX,
            index_b: NULL_INDEX,
            inv_mass_a: 0.0,
            inv_mass_b: 0.0,
            inv_i_a: 0.0,
            inv_i_b: 0.0,
            anchor_a: Vec2::ZERO,
            anchor_b: Vec2::ZERO,
            delta_center: Vec2::ZERO,
        };

        self.add_joint_to_graph(sim);
        self.link_joint(joint_id);
        self.bodies[body_id_a as usize].joints.push(joint_id);
        self.bodies[body_id_b as usize].joints.push(joint_id);

        if !base.collide_connected {
            // Any existing contact between the bodies is now filtered.
            let contact_ids = self.bodies[body_id_a as usize].contacts.clone();
            for contact_id in contact_ids {
                let contact = &self.contacts[contact_id as usize];
                let other = if contact.body_id_a == body_id_a {
                    contact.body_id_b
                } else {
                    contact.body_id_a
                };
                if other == body_id_b {
                    self.destroy_contact(contact_id);
                }
            }
        }

        joint_id
    }

    pub fn create_distance_joint(&mut self, def: &DistanceJointDef) -> crate::physics::events::JointId {
        let solver = JointSolver::Distance(DistanceJoint {
            length: def.length.max(crate::physics::LINEAR_SLOP),
            min_length: def.min_length,
            max_length: def.max_length,
            enable_limit: def.enable_limit,
            ..Default::default()
        });
        let joint_id = self.create_joint_internal(&def.base, JointType::Distance, solver);
        crate::physics::events::JointId {
            index1: joint_id + 1,
            world0: self.world_id,
            generation: self.joints[joint_id as usize].generation,
        }
    }

    pub fn create_revolute_joint(&mut self, def: &RevoluteJointDef) -> crate::physics::events::JointId {
        let solver = JointSolver::Revolute(RevoluteJoint::default());
        let joint_id = self.create_joint_internal(&def.base, JointType::Revolute, solver);
        crate::physics::events::JointId {
            index1: joint_id + 1,
            world0: self.world_id,
            generation: self.joints[joint_id as usize].generation,
        }
    }

    pub fn destroy_joint(&mut self, id: crate::physics::events::JointId) {
        debug_assert!(!self.locked);
        let joint_id = id.index1 - 1;
        debug_assert!(self.joints[joint_id as usize].generation == id.generation);
        self.destroy_joint_internal(joint_id);
    }

    fn destroy_joint_internal(&mut self, joint_id: i32) {
        let (set_index, color_index, local_index, body_id_a, body_id_b, island_id) = {
            let joint = &self.joints[joint_id as usize];
            (
                joint.set_index,
                joint.color_index,
                joint.local_index,
                joint.body_id_a,
                joint.body_id_b,
                joint.island_id,
            )
        };

        if island_id != NULL_INDEX {
            self.unlink_joint(joint_id);
        }

        if color_index != NULL_INDEX {
            debug_assert!(set_index == AWAKE_SET);
            self.remove_joint_from_graph(body_id_a, body_id_b, color_index, local_index);
        } else {
            // Sleeping set
            let set = &mut self.solver_sets[set_index as usize];
            let _removed = set.joint_sims.swap_remove(local_index as usize);
            if (local_index as usize) < set.joint_sims.len() {
                let moved_id = set.joint_sims[local_index as usize].joint_id;
                self.joints[moved_id as usize].local_index = local_index;
            }
        }

        for body_id in [body_id_a, body_id_b] {
            let joints = &mut self.bodies[body_id as usize].joints;
            if let Some(pos) = joints.iter().position(|&j| j == joint_id) {
                joints.swap_remove(pos);
            }
        }

        let joint = &mut self.joints[joint_id as usize];
        joint.set_index = NULL_INDEX;
        joint.color_index = NULL_INDEX;
        joint.local_index = NULL_INDEX;
        joint.generation += 1;
        self.joint_id_pool.free_id(joint_id);
    }

    // --- Narrow phase ----------------------------------------------------

    fn collide(&mut self, context: &mut StepContext) {
        debug_assert!(self.worker_count > 0);

        // Gather contact pointers: the graph colors plus the awake
        // non-touching array.
        let mut contact_count = 0;
        for color in self.constraint_graph.colors.iter() {
            contact_count += color.contact_sims.len();
        }
        let non_touching_count = self.solver_sets[AWAKE_SET as usize].contact_sims.len();
        contact_count += non_touching_count;

        if contact_count == 0 {
            return;
        }

        tracing::trace!(contact_count, "collide");

        unsafe {
            let contact_sims = self
                .arena
                .alloc::<*mut ContactSim>(contact_count, "contacts");

            let mut index = 0;
            for color in self.constraint_graph.colors.iter_mut() {
                for sim in color.contact_sims.iter_mut() {
                    *contact_sims.add(index) = sim;
                    index += 1;
                }
            }
            for sim in self.solver_sets[AWAKE_SET as usize].contact_sims.iter_mut() {
                *contact_sims.add(index) = sim;
                index += 1;
            }
            debug_assert!(index == contact_count);

            context.contacts = contact_sims;

            // Contact bits are on ids because sim pointers move between
            // the touching and non-touching arrays.
            let contact_id_capacity = self.contact_id_pool.capacity() as usize;
            for task_context in self.task_contexts.iter_mut() {
                task_context
                    .contact_state_bit_set
                    .set_bit_count_and_clear(contact_id_capacity);
            }

            let context_ptr: *mut StepContext = context;
            let handle = self.enqueue_task(
                collide_task,
                contact_count as i32,
                64,
                context_ptr as *mut u8,
            );
            self.finish_task(handle);

            self.arena.free(contact_sims);
            context.contacts = std::ptr::null_mut();
        }

        // Serially process the contact state changes, in id order.
        let worker_count = self.worker_count as usize;
        {
            let (first, rest) = self.task_contexts.split_at_mut(1);
            let bit_set = &mut first[0].contact_state_bit_set;
            for task_context in rest[..worker_count - 1].iter() {
                bit_set.in_place_union(&task_context.contact_state_bit_set);
            }
        }

        let changed: Vec<usize> = self.task_contexts[0].contact_state_bit_set.iter().collect();
        let end_event_index = self.end_event_array_index;
        for contact_id in changed {
            let contact_id = contact_id as i32;
            let (set_index, color_index, local_index, flags, shape_id_a, shape_id_b) = {
                let contact = &self.contacts[contact_id as usize];
                (
                    contact.set_index,
                    contact.color_index,
                    contact.local_index,
                    contact.flags,
                    contact.shape_id_a,
                    contact.shape_id_b,
                )
            };
            debug_assert!(set_index == AWAKE_SET);

            let sim_flags = if color_index != NULL_INDEX {
                self.constraint_graph.colors[color_index as usize].contact_sims
                    [local_index as usize]
                    .sim_flags
            } else {
                self.solver_sets[AWAKE_SET as usize].contact_sims[local_index as usize].sim_flags
            };

            if sim_flags & SIM_DISJOINT != 0 {
                // Bounding boxes no longer overlap.
                self.destroy_contact(contact_id);
            } else if sim_flags & SIM_STARTED_TOUCHING != 0 {
                debug_assert!(color_index == NULL_INDEX);
                debug_assert!(self.contacts[contact_id as usize].island_id == NULL_INDEX);

                if flags & CONTACT_ENABLE_CONTACT_EVENTS != 0 {
                    let event = ContactBeginTouchEvent {
                        shape_id_a: self.make_shape_id(shape_id_a),
                        shape_id_b: self.make_shape_id(shape_id_b),
                        contact_id: self.make_contact_id(contact_id),
                    };
                    self.contact_begin_events.push(event);
                }

                self.contacts[contact_id as usize].flags |= CONTACT_TOUCHING;
                self.link_contact(contact_id);

                let mut sim =
                    self.solver_sets[AWAKE_SET as usize].contact_sims[local_index as usize];
                sim.sim_flags &= !SIM_STARTED_TOUCHING;
                self.remove_contact_sim_from_set(AWAKE_SET, local_index);
                self.add_contact_to_graph(sim);
            } else if sim_flags & SIM_STOPPED_TOUCHING != 0 {
                debug_assert!(color_index != NULL_INDEX);

                self.contacts[contact_id as usize].flags &= !CONTACT_TOUCHING;

                if flags & CONTACT_ENABLE_CONTACT_EVENTS != 0 {
                    let event = ContactEndTouchEvent {
                        shape_id_a: self.make_shape_id(shape_id_a),
                        shape_id_b: self.make_shape_id(shape_id_b),
                        contact_id: self.make_contact_id(contact_id),
                    };
                    self.contact_end_events[end_event_index].push(event);
                }

                self.unlink_contact(contact_id);
                let (body_id_a, body_id_b) = {
                    let contact = &self.contacts[contact_id as usize];
                    (contact.body_id_a, contact.body_id_b)
                };
                let mut sim =
                    self.remove_contact_from_graph(body_id_a, body_id_b, color_index, local_index);
                sim.sim_flags &= !SIM_STOPPED_TOUCHING;

                let awake = &mut self.solver_sets[AWAKE_SET as usize];
                awake.contact_sims.push(sim);
                let contact = &mut self.contacts[contact_id as usize];
                contact.color_index = NULL_INDEX;
                contact.local_index =
                    self.solver_sets[AWAKE_SET as usize].contact_sims.len() as i32 - 1;
            }
        }
    }

    // --- Step ------------------------------------------------------------

    pub fn step(&mut self, dt: f32, sub_step_count: i32) {
        debug_assert!(dt.is_finite());
        debug_assert!(sub_step_count > 0);
        debug_assert!(!self.locked);
        if self.locked {
            return;
        }

        let _span = tracing::trace_span!("step", dt, sub_step_count).entered();

        // Prepare event capture; stale data must not survive an early
        // return.
        self.body_move_events.clear();
        self.sensor_begin_events.clear();
        self.contact_begin_events.clear();
        self.contact_hit_events.clear();
        self.joint_events.clear();

        if dt == 0.0 {
            // Swap end event buffers so destruction events from the
            // "step" are still reported once.
            self.end_event_array_index = 1 - self.end_event_array_index;
            self.sensor_end_events[self.end_event_array_index].clear();
            self.contact_end_events[self.end_event_array_index].clear();
            return;
        }

        self.locked = true;

        // Update collision pairs and create contacts.
        self.update_broad_phase_pairs();

        let world_ptr: *mut World = self;
        let mut context = StepContext::new(world_ptr);
        context.dt = dt;
        context.sub_step_count = sub_step_count.max(1);
        context.inv_dt = 1.0 / dt;
        context.h = dt / context.sub_step_count as f32;
        context.inv_h = context.sub_step_count as f32 * context.inv_dt;
        context.gravity = self.gravity;
        context.max_linear_velocity = self.max_linear_speed;
        context.restitution_threshold = self.restitution_threshold;
        context.contact_push_max_speed = self.contact_push_max_speed;
        context.enable_warm_starting = self.enable_warm_starting;

        // Hertz values get reduced for large time steps.
        let contact_hertz = self.contact_hertz.min(0.125 * context.inv_h);
        context.contact_softness = make_soft(contact_hertz, self.contact_damping_ratio, context.h);
        context.static_softness =
            make_soft(2.0 * contact_hertz, self.contact_damping_ratio, context.h);
        let joint_hertz = self.joint_hertz.min(0.125 * context.inv_h);
        context.joint_softness = make_soft(joint_hertz, self.joint_damping_ratio, context.h);

        // Narrow phase.
        self.collide(&mut context);

        // Integrate velocities, solve constraints, integrate positions.
        self.solve_step(&mut context);

        // Sensor overlaps.
        overlap_sensors(self);

        debug_assert!(self.arena.allocation() == 0);
        self.arena.grow();

        // Swap end event buffers.
        self.end_event_array_index = 1 - self.end_event_array_index;
        self.sensor_end_events[self.end_event_array_index].clear();
        self.contact_end_events[self.end_event_array_index].clear();

        self.locked = false;
    }

    fn solve_step(&mut self, context: &mut StepContext) {
        solve(self, context);
    }

    // --- Event access ----------------------------------------------------

    pub fn body_move_events(&self) -> &[BodyMoveEvent] {
        &self.body_move_events
    }

    pub fn sensor_begin_events(&self) -> &[SensorBeginTouchEvent] {
        &self.sensor_begin_events
    }

    pub fn sensor_end_events(&self) -> &[SensorEndTouchEvent] {
        &self.sensor_end_events[1 - self.end_event_array_index]
    }

    pub fn contact_begin_events(&self) -> &[ContactBeginTouchEvent] {
        &self.contact_begin_events
    }

    pub fn contact_end_events(&self) -> &[ContactEndTouchEvent] {
        &self.contact_end_events[1 - self.end_event_array_index]
    }

    pub fn contact_hit_events(&self) -> &[ContactHitEvent] {
        &self.contact_hit_events
    }

    pub fn joint_events(&self) -> &[JointEvent] {
        &self.joint_events
    }

    pub fn awake_body_count(&self) -> usize {
        self.solver_sets[AWAKE_SET as usize].body_sims.len()
    }
}

/// Narrow-phase task: refresh manifolds for a range of contacts and mark
/// state transitions in the worker's contact bitset.
unsafe fn collide_task(start_index: i32, end_index: i32, thread_index: u32, context: *mut u8) {
    let step_context = &mut *(context as *mut StepContext);
    let world = &mut *step_context.world;
    debug_assert!((thread_index as i32) < world.worker_count);

    debug_assert!(start_index < end_index);

    for contact_index in start_index..end_index {
        let contact_sim = &mut **step_context.contacts.add(contact_index as usize);

        let contact_id = contact_sim.contact_id;

        let shape_a: *const Shape = &world.shapes[contact_sim.shape_id_a as usize];
        let shape_b: *const Shape = &world.shapes[contact_sim.shape_id_b as usize];

        // Do the proxies still overlap?
        let overlap = crate::utilities::bounding_box::Aabb::overlaps(
            (*shape_a).fat_aabb,
            (*shape_b).fat_aabb,
        );
        if !overlap {
            contact_sim.sim_flags |= SIM_DISJOINT;
            contact_sim.sim_flags &= !SIM_TOUCHING;
            world.task_contexts[thread_index as usize]
                .contact_state_bit_set
                .set(contact_id as usize);
        } else {
            let was_touching = contact_sim.sim_flags & SIM_TOUCHING != 0;

            let body_a = &world.bodies[(*shape_a).body_id as usize];
            let body_b = &world.bodies[(*shape_b).body_id as usize];

            // Cache body data the prepare stage needs.
            contact_sim.body_sim_index_a = if body_a.set_index == AWAKE_SET {
                body_a.local_index
            } else {
                NULL_INDEX
            };
            contact_sim.body_sim_index_b = if body_b.set_index == AWAKE_SET {
                body_b.local_index
            } else {
                NULL_INDEX
            };

            let sim_a = world.get_body_sim((*shape_a).body_id);
            let sim_b = world.get_body_sim((*shape_b).body_id);
            contact_sim.inv_mass_a = sim_a.inv_mass;
            contact_sim.inv_i_a = sim_a.inv_inertia;
            contact_sim.inv_mass_b = sim_b.inv_mass;
            contact_sim.inv_i_b = sim_b.inv_inertia;

            let transform_a = sim_a.transform;
            let transform_b = sim_b.transform;

            let touching = update_contact_manifold(
                contact_sim,
                &*shape_a,
                transform_a,
                &*shape_b,
                transform_b,
                world.enable_warm_starting,
            );

            if touching && !was_touching {
                contact_sim.sim_flags |= SIM_STARTED_TOUCHING;
                world.task_contexts[thread_index as usize]
                    .contact_state_bit_set
                    .set(contact_id as usize);
            } else if !touching && was_touching {
                contact_sim.sim_flags |= SIM_STOPPED_TOUCHING;
                world.task_contexts[thread_index as usize]
                    .contact_state_bit_set
                    .set(contact_id as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::joint::DistanceJointDef;
    use crate::physics::shape::{Circle, Polygon, ShapeGeometry};
    use crate::physics::task::ThreadDispatcher;
    use crate::physics::TIME_TO_SLEEP;

    fn step_dt() -> f32 {
        1.0 / 60.0
    }

    fn make_world(worker_count: i32, enable_sleep: bool) -> World {
        let def = WorldDef {
            worker_count,
            dispatcher: if worker_count > 1 {
                Some(Arc::new(ThreadDispatcher::new(worker_count)))
            } else {
                None
            },
            enable_sleep,
            ..WorldDef::default()
        };
        World::new(&def).unwrap()
    }

    fn add_static_box(world: &mut World, center: Vec2, hw: f32, hh: f32) -> (BodyId, ShapeId) {
        let body = world.create_body(&BodyDef {
            body_type: BodyType::Static,
            position: center,
            ..BodyDef::default()
        });
        let shape = world.create_shape(
            body,
            &ShapeDef::default(),
            ShapeGeometry::Polygon(Polygon::make_box(hw, hh)),
        );
        (body, shape)
    }

    fn add_dynamic_box(world: &mut World, center: Vec2, half: f32) -> (BodyId, ShapeId) {
        let body = world.create_body(&BodyDef {
            body_type: BodyType::Dynamic,
            position: center,
            ..BodyDef::default()
        });
        let shape = world.create_shape(
            body,
            &ShapeDef::default(),
            ShapeGeometry::Polygon(Polygon::make_square(half)),
        );
        (body, shape)
    }

    // Two dynamic boxes resting on a static slab settle, fall asleep, and
    // then produce no further move events.
    #[test]
    fn resting_boxes_settle_and_sleep() {
        let mut world = make_world(1, true);
        add_static_box(&mut world, Vec2::new(0.0, 0.0), 10.0, 0.5);
        let (box_a, _) = add_dynamic_box(&mut world, Vec2::new(-1.0, 1.0), 0.5);
        let (box_b, _) = add_dynamic_box(&mut world, Vec2::new(1.5, 1.0), 0.5);

        for _ in 0..60 {
            world.step(step_dt(), 4);
        }

        assert!(world.body_linear_velocity(box_a).length() < 0.01);
        assert!(world.body_linear_velocity(box_b).length() < 0.01);
        assert!(!world.body_is_awake(box_a), "island should be sleeping");
        assert!(!world.body_is_awake(box_b), "island should be sleeping");
        assert!(world.body_sleep_time(box_a) >= TIME_TO_SLEEP);
        assert_eq!(world.awake_body_count(), 0);

        world.step(step_dt(), 4);
        assert_eq!(world.body_move_events().len(), 0);
    }

    // A bullet circle fired at a wall stops at the surface instead of
    // tunneling, emits exactly one move event per step, and records the
    // time of impact.
    #[test]
    fn bullet_does_not_tunnel() {
        let def = WorldDef {
            gravity: Vec2::ZERO,
            enable_sleep: false,
            ..WorldDef::default()
        };
        let mut world = World::new(&def).unwrap();

        // Wall with its left face at x = 1.
        add_static_box(&mut world, Vec2::new(1.5, 0.0), 0.5, 2.0);

        let bullet = world.create_body(&BodyDef {
            body_type: BodyType::Dynamic,
            position: Vec2::ZERO,
            linear_velocity: Vec2::new(500.0, 0.0),
            is_bullet: true,
            ..BodyDef::default()
        });
        world.create_shape(
            bullet,
            &ShapeDef::default(),
            ShapeGeometry::Circle(Circle {
                center: Vec2::ZERO,
                radius: 0.1,
            }),
        );

        let mut saw_impact = false;
        for _ in 0..10 {
            world.step(step_dt(), 4);
            assert_eq!(world.body_move_events().len(), 1);
            saw_impact |= world.body_had_time_of_impact(bullet);

            let p = world.body_position(bullet);
            assert!(
                p.x <= 1.0 + SPECULATIVE_DISTANCE + 0.01,
                "bullet tunneled to x = {}",
                p.x
            );
        }
        assert!(saw_impact);

        // Center comes to rest near the surface minus the radius.
        let p = world.body_position(bullet);
        assert!(p.x > 0.7 && p.x < 1.0 + SPECULATIVE_DISTANCE);
    }

    // Three circles crossing a sensor region produce one begin each on
    // entry and one end each on exit, and the stored overlaps stay sorted
    // and unique.
    #[test]
    fn sensor_begin_end_events() {
        let def = WorldDef {
            gravity: Vec2::ZERO,
            enable_sleep: false,
            ..WorldDef::default()
        };
        let mut world = World::new(&def).unwrap();

        let sensor_body = world.create_body(&BodyDef {
            body_type: BodyType::Static,
            position: Vec2::new(1.0, 1.0),
            ..BodyDef::default()
        });
        let sensor_shape = world.create_shape(
            sensor_body,
            &ShapeDef {
                is_sensor: true,
                ..ShapeDef::default()
            },
            ShapeGeometry::Polygon(Polygon::make_square(1.0)),
        );

        let mut visitors = Vec::new();
        for (i, y) in [0.5f32, 1.0, 1.5].iter().enumerate() {
            let body = world.create_body(&BodyDef {
                body_type: BodyType::Dynamic,
                position: Vec2::new(-0.6 - 1.2 * i as f32, *y),
                linear_velocity: Vec2::new(2.0, 0.0),
                ..BodyDef::default()
            });
            let shape = world.create_shape(
                body,
                &ShapeDef::default(),
                ShapeGeometry::Circle(Circle {
                    center: Vec2::ZERO,
                    radius: 0.2,
                }),
            );
            visitors.push(shape);
        }

        let mut begins = Vec::new();
        let mut ends = Vec::new();
        for _ in 0..300 {
            world.step(step_dt(), 4);
            begins.extend_from_slice(world.sensor_begin_events());
            ends.extend_from_slice(world.sensor_end_events());

            // Invariant: overlaps are sorted ascending with unique ids.
            for sensor in world.sensors.iter() {
                for pair in sensor.overlaps1.windows(2) {
                    assert!(pair[0].shape_id < pair[1].shape_id);
                }
            }
        }

        assert_eq!(begins.len(), 3);
        assert_eq!(ends.len(), 3);
        for visitor in &visitors {
            let begin_count = begins
                .iter()
                .filter(|e| e.visitor_shape_id == *visitor)
                .count();
            let end_count = ends.iter().filter(|e| e.visitor_shape_id == *visitor).count();
            assert_eq!(begin_count, 1);
            assert_eq!(end_count, 1);
        }
        for e in &begins {
            assert_eq!(e.sensor_shape_id, sensor_shape);
        }
    }

    // Destroying a visitor mid-overlap yields one end event carrying the
    // pre-destruction generation; the surviving visitor is untouched.
    #[test]
    fn destroyed_visitor_emits_end_event() {
        let def = WorldDef {
            gravity: Vec2::ZERO,
            enable_sleep: false,
            ..WorldDef::default()
        };
        let mut world = World::new(&def).unwrap();

        let sensor_body = world.create_body(&BodyDef {
            body_type: BodyType::Static,
            position: Vec2::ZERO,
            ..BodyDef::default()
        });
        world.create_shape(
            sensor_body,
            &ShapeDef {
                is_sensor: true,
                ..ShapeDef::default()
            },
            ShapeGeometry::Polygon(Polygon::make_square(2.0)),
        );

        let mut visitor_shapes = Vec::new();
        for x in [-0.5f32, 0.5] {
            let body = world.create_body(&BodyDef {
                body_type: BodyType::Dynamic,
                position: Vec2::new(x, 0.0),
                ..BodyDef::default()
            });
            let shape = world.create_shape(
                body,
                &ShapeDef::default(),
                ShapeGeometry::Circle(Circle {
                    center: Vec2::ZERO,
                    radius: 0.3,
                }),
            );
            visitor_shapes.push(shape);
        }

        world.step(step_dt(), 4);
        assert_eq!(world.sensor_begin_events().len(), 2);

        let doomed = visitor_shapes[1];
        world.destroy_shape(doomed);

        world.step(step_dt(), 4);
        let ends = world.sensor_end_events();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].visitor_shape_id, doomed);
        assert_eq!(world.sensor_begin_events().len(), 0);

        world.step(step_dt(), 4);
        assert_eq!(world.sensor_end_events().len(), 0);
    }

    // Two joints hanging a chain under gravity both exceed their force
    // threshold and report exactly one event per joint per step.
    #[test]
    fn joint_threshold_events() {
        let mut world = make_world(1, false);

        let anchor = world.create_body(&BodyDef {
            body_type: BodyType::Static,
            position: Vec2::ZERO,
            ..BodyDef::default()
        });
        let mut prev = anchor;
        let mut joint_ids = Vec::new();
        for i in 1..=2 {
            let body = world.create_body(&BodyDef {
                body_type: BodyType::Dynamic,
                position: Vec2::new(0.0, -(i as f32)),
                ..BodyDef::default()
            });
            world.create_shape(
                body,
                &ShapeDef {
                    // Keep the chain links from colliding with each other.
                    filter: crate::physics::shape::Filter {
                        group_index: -1,
                        ..Default::default()
                    },
                    ..ShapeDef::default()
                },
                ShapeGeometry::Circle(Circle {
                    center: Vec2::ZERO,
                    radius: 0.4,
                }),
            );
            let joint = world.create_distance_joint(&DistanceJointDef {
                base: crate::physics::joint::JointDef {
                    body_a: prev,
                    body_b: body,
                    local_anchor_a: Vec2::ZERO,
                    local_anchor_b: Vec2::ZERO,
                    collide_connected: false,
                    force_threshold: 1.0,
                    torque_threshold: f32::MAX,
                },
                length: 1.0,
                ..DistanceJointDef::default()
            });
            joint_ids.push(joint);
            prev = body;
        }

        // Let the chain take up tension first.
        for _ in 0..5 {
            world.step(step_dt(), 4);
        }

        for _ in 0..10 {
            world.step(step_dt(), 4);
            let events = world.joint_events();
            assert_eq!(events.len(), 2, "one event per joint per step");
            for joint in &joint_ids {
                assert_eq!(
                    events.iter().filter(|e| e.joint_id == *joint).count(),
                    1
                );
            }
        }
    }

    // The graph coloring keeps every non-overflow color body-disjoint.
    #[test]
    fn graph_coloring_is_body_disjoint() {
        let mut world = make_world(1, false);
        add_static_box(&mut world, Vec2::new(0.0, 0.0), 20.0, 0.5);

        // A pyramid gives plenty of shared bodies.
        for row in 0..6 {
            for col in 0..(6 - row) {
                let x = (col as f32 - (5 - row) as f32 * 0.5) * 1.05;
                let y = 1.0 + row as f32 * 1.05;
                add_dynamic_box(&mut world, Vec2::new(x, y), 0.5);
            }
        }

        for _ in 0..10 {
            world.step(step_dt(), 4);
            world.validate_graph_coloring();
        }
    }

    // A zero time step reports no motion.
    #[test]
    fn zero_dt_step_is_idempotent() {
        let mut world = make_world(1, true);
        add_static_box(&mut world, Vec2::new(0.0, 0.0), 10.0, 0.5);
        add_dynamic_box(&mut world, Vec2::new(0.0, 1.0), 0.5);

        for _ in 0..30 {
            world.step(step_dt(), 4);
        }
        world.step(0.0, 4);
        assert_eq!(world.body_move_events().len(), 0);
    }

    #[derive(PartialEq, Debug)]
    struct StepRecord {
        moves: Vec<BodyMoveEvent>,
        sensor_begins: Vec<SensorBeginTouchEvent>,
        sensor_ends: Vec<SensorEndTouchEvent>,
        contact_begins: Vec<ContactBeginTouchEvent>,
        contact_ends: Vec<ContactEndTouchEvent>,
        hits: Vec<ContactHitEvent>,
        joints: Vec<JointEvent>,
    }

    fn run_combined_scenario(worker_count: i32, steps: usize) -> Vec<StepRecord> {
        let mut world = make_world(worker_count, true);

        // Settling boxes on a slab.
        add_static_box(&mut world, Vec2::new(0.0, 0.0), 10.0, 0.5);
        add_dynamic_box(&mut world, Vec2::new(-1.0, 1.0), 0.5);
        add_dynamic_box(&mut world, Vec2::new(1.5, 1.2), 0.5);

        // Bullet against a wall.
        add_static_box(&mut world, Vec2::new(15.0, 0.0), 0.5, 3.0);
        let bullet = world.create_body(&BodyDef {
            body_type: BodyType::Dynamic,
            position: Vec2::new(5.0, 0.0),
            linear_velocity: Vec2::new(300.0, 80.0),
            is_bullet: true,
            gravity_scale: 0.0,
            ..BodyDef::default()
        });
        world.create_shape(
            bullet,
            &ShapeDef::default(),
            ShapeGeometry::Circle(Circle {
                center: Vec2::ZERO,
                radius: 0.1,
            }),
        );

        let mut records = Vec::with_capacity(steps);
        for _ in 0..steps {
            world.step(step_dt(), 4);
            records.push(StepRecord {
                moves: world.body_move_events().to_vec(),
                sensor_begins: world.sensor_begin_events().to_vec(),
                sensor_ends: world.sensor_end_events().to_vec(),
                contact_begins: world.contact_begin_events().to_vec(),
                contact_ends: world.contact_end_events().to_vec(),
                hits: world.contact_hit_events().to_vec(),
                joints: world.joint_events().to_vec(),
            });
        }
        records
    }

    // The event streams are identical for any worker count.
    #[test]
    fn determinism_across_worker_counts() {
        let baseline = run_combined_scenario(1, 120);
        for worker_count in [2, 4, 8] {
            let parallel = run_combined_scenario(worker_count, 120);
            assert_eq!(
                baseline, parallel,
                "event streams diverged at worker count {worker_count}"
            );
        }
    }

    // Repeat runs with the same worker count are bit-identical too.
    #[test]
    fn determinism_is_repeatable() {
        let a = run_combined_scenario(4, 60);
        let b = run_combined_scenario(4, 60);
        assert_eq!(a, b);
    }
}
