//! Public handles and per-step event records.
//!
//! Handles are `{index1, world0, generation}` triples: `index1` is the raw
//! dense index plus one (zero stays reserved for "null"), `world0`
//! identifies the owning world, and `generation` is the slot reuse counter
//! used to detect stale references.

use crate::utilities::math::Transform;
use glam::Vec2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BodyId {
    pub index1: i32,
    pub world0: u16,
    pub generation: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShapeId {
    pub index1: i32,
    pub world0: u16,
    pub generation: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JointId {
    pub index1: i32,
    pub world0: u16,
    pub generation: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContactId {
    pub index1: i32,
    pub world0: u16,
    pub generation: u32,
}

/// Emitted once per awake body per step, indexed by sim index. The
/// transform reflects any continuous-collision correction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyMoveEvent {
    pub transform: Transform,
    pub body_id: BodyId,
    pub fell_asleep: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorBeginTouchEvent {
    pub sensor_shape_id: ShapeId,
    pub visitor_shape_id: ShapeId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorEndTouchEvent {
    pub sensor_shape_id: ShapeId,
    pub visitor_shape_id: ShapeId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContactBeginTouchEvent {
    pub shape_id_a: ShapeId,
    pub shape_id_b: ShapeId,
    pub contact_id: ContactId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContactEndTouchEvent {
    pub shape_id_a: ShapeId,
    pub shape_id_b: ShapeId,
    pub contact_id: ContactId,
}

/// High-speed impact above the world's hit event threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContactHitEvent {
    pub shape_id_a: ShapeId,
    pub shape_id_b: ShapeId,
    pub point: Vec2,
    pub normal: Vec2,
    pub approach_speed: f32,
}

/// A joint whose reaction crossed its force or torque threshold this step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JointEvent {
    pub joint_id: JointId,
}
