pub mod physics;
pub mod utilities;

pub use physics::body::{BodyDef, BodyType};
pub use physics::events::{
    BodyId, BodyMoveEvent, ContactBeginTouchEvent, ContactEndTouchEvent, ContactHitEvent,
    ContactId, JointEvent, JointId, SensorBeginTouchEvent, SensorEndTouchEvent, ShapeId,
};
pub use physics::joint::{DistanceJointDef, JointDef, RevoluteJointDef};
pub use physics::shape::{Circle, Filter, Polygon, Segment, ShapeDef, ShapeGeometry};
pub use physics::task::{TaskDispatcher, TaskHandle, ThreadDispatcher};
pub use physics::world::{World, WorldDef, WorldError};
pub use utilities::math::{Rot, Sweep, Transform};
