pub mod arena;
pub mod bit_set;
pub mod bounding_box;
pub mod id_pool;
pub mod math;
