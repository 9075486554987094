pub mod body;
pub mod broad_phase;
pub mod constraint_graph;
pub mod contact;
pub mod contact_solver;
pub mod distance;
pub mod dynamic_tree;
pub mod events;
pub mod island;
pub mod joint;
pub mod local_spin_wait;
pub mod manifold;
pub mod sensor;
pub mod shape;
pub mod solver;
pub mod solver_set;
pub mod task;
pub mod time_of_impact;
pub mod world;

/// Sentinel for "no index" across every dense array in the engine.
pub const NULL_INDEX: i32 = -1;

/// Collision resolution tolerance. Most other length tolerances derive
/// from this.
pub const LINEAR_SLOP: f32 = 0.005;

/// AABB inflation used to catch near-misses one step early so speculative
/// contact points exist before first touch.
pub const SPECULATIVE_DISTANCE: f32 = 4.0 * LINEAR_SLOP;

/// Extra margin on broad-phase proxies to reduce proxy churn.
pub const AABB_MARGIN: f32 = 0.1;

/// Seconds a body must stay below its sleep threshold before its island
/// may sleep.
pub const TIME_TO_SLEEP: f32 = 0.5;

/// Maximum rotation per substep. The angular speed clamp derives from it.
pub const MAX_ROTATION: f32 = 0.25 * std::f32::consts::PI;

/// Graph color palette size. The last color is the overflow color and is
/// solved serially by the main worker.
pub const GRAPH_COLOR_COUNT: usize = 12;
pub const OVERFLOW_INDEX: usize = GRAPH_COLOR_COUNT - 1;

pub const MAX_WORKERS: usize = 64;

/// Fraction of a fast body's minimum extent treated as its solid core
/// during continuous collision.
pub const CORE_FRACTION: f32 = 0.25;

/// Sensor hits recorded per fast body during continuous collision. Extra
/// hits past this budget are dropped.
pub const MAX_CONTINUOUS_SENSOR_HITS: usize = 8;

/// Velocity-iteration counts inside a substep.
pub const ITERATIONS: usize = 1;
pub const RELAX_ITERATIONS: usize = 1;

pub const MAX_POLYGON_VERTICES: usize = 8;

/// Solver set indices. Sleeping sets start after the built-in three.
pub const STATIC_SET: i32 = 0;
pub const DISABLED_SET: i32 = 1;
pub const AWAKE_SET: i32 = 2;
pub const FIRST_SLEEPING_SET: i32 = 3;

pub const DEFAULT_CATEGORY_BITS: u64 = 1;
pub const DEFAULT_MASK_BITS: u64 = u64::MAX;
