//! Body records: the persistent `Body`, the per-step `BodySim`, and the
//! per-substep `BodyState`.
//!
//! Awake dynamic and kinematic bodies keep a `BodySim` and a `BodyState`
//! at the same local index of the awake solver set. Sleeping bodies keep
//! only the sim in their sleeping set; states are rebuilt on wake.

use crate::physics::NULL_INDEX;
use crate::utilities::math::{Rot, Sweep, Transform};
use glam::Vec2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyType {
    Static,
    Kinematic,
    Dynamic,
}

impl BodyType {
    /// Broad-phase tree index for this body type.
    #[inline(always)]
    pub fn tree_index(self) -> usize {
        match self {
            BodyType::Static => 0,
            BodyType::Kinematic => 1,
            BodyType::Dynamic => 2,
        }
    }
}

// BodySim status flags.
pub const IS_FAST: u32 = 1 << 0;
pub const IS_BULLET: u32 = 1 << 1;
pub const IS_SPEED_CAPPED: u32 = 1 << 2;
pub const HAD_TIME_OF_IMPACT: u32 = 1 << 3;
pub const ENLARGE_BOUNDS: u32 = 1 << 4;
pub const ALLOW_FAST_ROTATION: u32 = 1 << 5;

// BodyState lock flags.
pub const LOCK_LINEAR_X: u32 = 1 << 0;
pub const LOCK_LINEAR_Y: u32 = 1 << 1;
pub const LOCK_ANGULAR_Z: u32 = 1 << 2;

/// Definition used to create a body.
#[derive(Clone, Copy, Debug)]
pub struct BodyDef {
    pub body_type: BodyType,
    pub position: Vec2,
    pub rotation: Rot,
    pub linear_velocity: Vec2,
    pub angular_velocity: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub gravity_scale: f32,
    pub sleep_threshold: f32,
    pub enable_sleep: bool,
    pub is_bullet: bool,
    pub allow_fast_rotation: bool,
    pub lock_linear_x: bool,
    pub lock_linear_y: bool,
    pub lock_angular_z: bool,
}

impl Default for BodyDef {
    fn default() -> Self {
        Self {
            body_type: BodyType::Static,
            position: Vec2::ZERO,
            rotation: Rot::IDENTITY,
            linear_velocity: Vec2::ZERO,
            angular_velocity: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            gravity_scale: 1.0,
            sleep_threshold: 0.05,
            enable_sleep: true,
            is_bullet: false,
            allow_fast_rotation: false,
            lock_linear_x: false,
            lock_linear_y: false,
            lock_angular_z: false,
        }
    }
}

/// Persistent per-body record, addressed by body id.
pub struct Body {
    pub body_type: BodyType,
    /// Solver set owning this body's sim.
    pub set_index: i32,
    /// Index of the sim within its owning set.
    pub local_index: i32,
    pub head_shape_id: i32,
    pub shape_count: i32,
    /// Ids of contacts attached to this body.
    pub contacts: Vec<i32>,
    /// Ids of joints attached to this body.
    pub joints: Vec<i32>,
    pub island_id: i32,
    pub island_prev: i32,
    pub island_next: i32,
    pub sleep_time: f32,
    pub sleep_threshold: f32,
    pub enable_sleep: bool,
    pub body_move_index: i32,
    pub generation: u32,
    /// Status flags copied out of the sim at the end of each step.
    pub flags: u32,
    /// Motion lock flags, persistent so states can be rebuilt on wake.
    pub lock_flags: u32,
}

/// Per-awake-body integration record.
#[derive(Clone, Copy, Debug)]
pub struct BodySim {
    pub transform: Transform,
    /// World center of mass.
    pub center: Vec2,
    /// Rotation at the start of the step, for sweeps.
    pub rotation0: Rot,
    /// Center at the start of the step, for sweeps.
    pub center0: Vec2,
    pub local_center: Vec2,
    pub force: Vec2,
    pub torque: f32,
    pub inv_mass: f32,
    pub inv_inertia: f32,
    pub min_extent: f32,
    pub max_extent: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub gravity_scale: f32,
    pub body_id: i32,
    pub flags: u32,
}

impl BodySim {
    pub fn make_sweep(&self) -> Sweep {
        Sweep {
            local_center: self.local_center,
            c1: self.center0,
            c2: self.center,
            q1: self.rotation0,
            q2: self.transform.q,
        }
    }
}

/// Per-substep mutable record, parallel-indexed with `BodySim` in the
/// awake set.
#[derive(Clone, Copy, Debug)]
pub struct BodyState {
    pub linear_velocity: Vec2,
    pub angular_velocity: f32,
    /// Lock flags, constant over a step.
    pub flags: u32,
    /// Position accumulated over substeps, applied in finalize.
    pub delta_position: Vec2,
    /// Rotation accumulated over substeps, applied in finalize.
    pub delta_rotation: Rot,
}

impl BodyState {
    pub const IDENTITY: BodyState = BodyState {
        linear_velocity: Vec2::ZERO,
        angular_velocity: 0.0,
        flags: 0,
        delta_position: Vec2::ZERO,
        delta_rotation: Rot::IDENTITY,
    };
}

pub fn body_sim_from_def(def: &BodyDef, body_id: i32) -> BodySim {
    let transform = Transform {
        p: def.position,
        q: def.rotation,
    };
    let mut flags = 0;
    if def.is_bullet {
        flags |= IS_BULLET;
    }
    if def.allow_fast_rotation {
        flags |= ALLOW_FAST_ROTATION;
    }
    BodySim {
        transform,
        center: def.position,
        rotation0: def.rotation,
        center0: def.position,
        local_center: Vec2::ZERO,
        force: Vec2::ZERO,
        torque: 0.0,
        inv_mass: 0.0,
        inv_inertia: 0.0,
        min_extent: f32::MAX,
        max_extent: 0.0,
        linear_damping: def.linear_damping,
        angular_damping: def.angular_damping,
        gravity_scale: def.gravity_scale,
        body_id,
        flags,
    }
}

pub fn body_state_from_def(def: &BodyDef) -> BodyState {
    let mut flags = 0;
    if def.lock_linear_x {
        flags |= LOCK_LINEAR_X;
    }
    if def.lock_linear_y {
        flags |= LOCK_LINEAR_Y;
    }
    if def.lock_angular_z {
        flags |= LOCK_ANGULAR_Z;
    }
    BodyState {
        linear_velocity: def.linear_velocity,
        angular_velocity: def.angular_velocity,
        flags,
        delta_position: Vec2::ZERO,
        delta_rotation: Rot::IDENTITY,
    }
}

pub fn new_body(def: &BodyDef, generation: u32) -> Body {
    let mut lock_flags = 0;
    if def.lock_linear_x {
        lock_flags |= LOCK_LINEAR_X;
    }
    if def.lock_linear_y {
        lock_flags |= LOCK_LINEAR_Y;
    }
    if def.lock_angular_z {
        lock_flags |= LOCK_ANGULAR_Z;
    }
    Body {
        body_type: def.body_type,
        set_index: NULL_INDEX,
        local_index: NULL_INDEX,
        head_shape_id: NULL_INDEX,
        shape_count: 0,
        contacts: Vec::new(),
        joints: Vec::new(),
        island_id: NULL_INDEX,
        island_prev: NULL_INDEX,
        island_next: NULL_INDEX,
        sleep_time: 0.0,
        sleep_threshold: def.sleep_threshold,
        enable_sleep: def.enable_sleep,
        body_move_index: NULL_INDEX,
        generation,
        flags: 0,
        lock_flags,
    }
}
