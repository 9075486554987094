//! Sensor overlap engine.
//!
//! Each sensor keeps a double-buffered overlap list: `overlaps1` holds
//! the previous step's sorted unique overlaps, `overlaps2` is rebuilt
//! every step by a parallel broad-phase query (seeded with any continuous
//! sensor hits), then sorted and deduplicated. A sorted-merge diff of the
//! two buffers yields begin/end events in deterministic order.

use crate::physics::distance::{shape_distance, DistanceInput, SimplexCache};
use crate::physics::events::{SensorBeginTouchEvent, SensorEndTouchEvent};
use crate::physics::shape::should_shapes_collide;
use crate::physics::world::World;
use crate::physics::{DISABLED_SET, NULL_INDEX};
use crate::utilities::bit_set::BitSet;

/// A shape reference recorded by a sensor. The generation pins the slot's
/// reuse epoch so destroyed-and-reused ids diff correctly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Visitor {
    pub shape_id: i32,
    pub generation: u32,
}

/// A sensor overlap discovered by the continuous collision pipeline.
#[derive(Clone, Copy, Debug)]
pub struct SensorHit {
    pub sensor_id: i32,
    pub visitor_id: i32,
}

pub struct Sensor {
    pub shape_id: i32,
    /// Previous step's sorted unique overlaps.
    pub overlaps1: Vec<Visitor>,
    /// Scratch rebuilt during the step.
    pub overlaps2: Vec<Visitor>,
    /// Mid-step hits from continuous collision, absorbed into `overlaps2`
    /// at the start of the sensor pass.
    pub hits: Vec<Visitor>,
}

/// Per-worker sensor scratch.
pub struct SensorTaskContext {
    pub event_bits: BitSet,
}

impl SensorTaskContext {
    pub fn new() -> Self {
        Self {
            event_bits: BitSet::new(),
        }
    }
}

impl Default for SensorTaskContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Queries one range of sensors and records which ones changed.
unsafe fn sensor_task(start_index: i32, end_index: i32, thread_index: u32, context: *mut u8) {
    let world = &mut *(context as *mut World);
    debug_assert!((thread_index as i32) < world.worker_count);
    debug_assert!(start_index < end_index);

    for sensor_index in start_index..end_index {
        let world = &mut *(context as *mut World);
        let sensor: *mut Sensor = &mut world.sensors[sensor_index as usize];
        let sensor_shape_id = (*sensor).shape_id;

        // Swap overlap buffers and seed with continuous hits.
        std::mem::swap(&mut (*sensor).overlaps1, &mut (*sensor).overlaps2);
        (*sensor).overlaps2.clear();
        let hits = std::mem::take(&mut (*sensor).hits);
        (*sensor).overlaps2.extend_from_slice(&hits);

        let sensor_shape = &world.shapes[sensor_shape_id as usize];
        let body = &world.bodies[sensor_shape.body_id as usize];

        if body.set_index == DISABLED_SET || !sensor_shape.enable_sensor_events {
            if !(*sensor).overlaps1.is_empty() {
                // This sensor is dropping all overlaps because it has been
                // disabled.
                world.sensor_task_contexts[thread_index as usize]
                    .event_bits
                    .set(sensor_index as usize);
            }
            continue;
        }

        let transform = world.get_body_transform(sensor_shape.body_id);
        let sensor_proxy = sensor_shape.distance_proxy();
        let sensor_filter = sensor_shape.filter;
        let sensor_body_id = sensor_shape.body_id;
        let query_bounds = sensor_shape.aabb;
        let sensor_custom = sensor_shape.enable_custom_filtering;

        let world_ptr = context as *mut World;
        let mut visit = |shape_id: i32| -> bool {
            let world = unsafe { &*world_ptr };

            if shape_id == sensor_shape_id {
                return true;
            }

            let other_shape = &world.shapes[shape_id as usize];

            // Are sensor events enabled on the other shape?
            if !other_shape.enable_sensor_events {
                return true;
            }

            // Skip shapes on the same body
            if other_shape.body_id == sensor_body_id {
                return true;
            }

            if !should_shapes_collide(sensor_filter, other_shape.filter) {
                return true;
            }

            // Custom user filter
            if sensor_custom || other_shape.enable_custom_filtering {
                if let Some(filter_fcn) = &world.custom_filter_fcn {
                    let id_a = world.make_shape_id(sensor_shape_id);
                    let id_b = world.make_shape_id(shape_id);
                    if !filter_fcn(id_a, id_b) {
                        return true;
                    }
                }
            }

            let other_transform = world.get_body_transform(other_shape.body_id);

            let input = DistanceInput {
                proxy_a: sensor_proxy,
                proxy_b: other_shape.distance_proxy(),
                transform_a: transform,
                transform_b: other_transform,
                use_radii: true,
            };
            let mut cache = SimplexCache::default();
            let output = shape_distance(&input, &mut cache);

            if output.distance >= 10.0 * f32::EPSILON {
                return true;
            }

            // Record the overlap
            let generation = other_shape.generation;
            unsafe {
                (&mut (*world_ptr).sensors)[sensor_index as usize]
                    .overlaps2
                    .push(Visitor {
                        shape_id,
                        generation,
                    });
            }

            true
        };

        // Query all trees
        for tree in (*world_ptr).broad_phase.trees.iter() {
            tree.query(query_bounds, sensor_filter.mask_bits, &mut |_, user_data| {
                visit(user_data as i32)
            });
        }

        let world = &mut *(context as *mut World);
        let sensor = &mut world.sensors[sensor_index as usize];

        // Sort to enable the begin/end diff. Sorting by generation after
        // id keeps the dedup deterministic when a slot was reused
        // mid-step.
        sensor
            .overlaps2
            .sort_unstable_by_key(|v| (v.shape_id, v.generation));

        // Continuous hits may duplicate query hits.
        sensor.overlaps2.dedup_by_key(|v| v.shape_id);

        let count1 = sensor.overlaps1.len();
        let count2 = sensor.overlaps2.len();
        if count1 != count2 {
            // something changed
            world.sensor_task_contexts[thread_index as usize]
                .event_bits
                .set(sensor_index as usize);
        } else {
            for i in 0..count1 {
                if sensor.overlaps1[i] != sensor.overlaps2[i] {
                    // something changed
                    world.sensor_task_contexts[thread_index as usize]
                        .event_bits
                        .set(sensor_index as usize);
                    break;
                }
            }
        }
    }
}

/// Runs the parallel sensor queries and then emits begin/end events for
/// every changed sensor via a sorted merge of its two overlap buffers.
pub(crate) fn overlap_sensors(world: &mut World) {
    let sensor_count = world.sensors.len();
    if sensor_count == 0 {
        return;
    }

    debug_assert!(world.worker_count > 0);

    for task_context in world.sensor_task_contexts.iter_mut() {
        task_context.event_bits.set_bit_count_and_clear(sensor_count);
    }

    // Parallel-for over the sensors.
    let min_range = 16;
    let world_ptr: *mut World = world;
    unsafe {
        let handle = world.enqueue_task(
            sensor_task,
            sensor_count as i32,
            min_range,
            world_ptr as *mut u8,
        );
        world.finish_task(handle);
    }

    let worker_count = world.worker_count as usize;
    let (first, rest) = world.sensor_task_contexts.split_at_mut(1);
    let bit_set = &mut first[0].event_bits;
    for task_context in rest[..worker_count - 1].iter() {
        bit_set.in_place_union(&task_context.event_bits);
    }

    // Emit events for the changed sensors, in sensor index order.
    let changed: Vec<usize> = world.sensor_task_contexts[0].event_bits.iter().collect();
    let end_index = world.end_event_array_index;
    for sensor_index in changed {
        let sensor = &world.sensors[sensor_index];
        let sensor_id = world.make_shape_id(sensor.shape_id);

        let refs1 = &sensor.overlaps1;
        let refs2 = &sensor.overlaps2;
        let count1 = refs1.len();
        let count2 = refs2.len();

        let mut begin_events = Vec::new();
        let mut end_events = Vec::new();

        // overlaps1 can have overlaps that end, overlaps2 overlaps that
        // begin.
        let mut index1 = 0;
        let mut index2 = 0;
        while index1 < count1 && index2 < count2 {
            let r1 = &refs1[index1];
            let r2 = &refs2[index2];
            if r1.shape_id == r2.shape_id {
                if r1.generation < r2.generation {
                    // The shape was destroyed and the slot reused: end the
                    // old overlap.
                    end_events.push(SensorEndTouchEvent {
                        sensor_shape_id: sensor_id,
                        visitor_shape_id: world.make_visitor_id(r1),
                    });
                    index1 += 1;
                } else if r1.generation > r2.generation {
                    begin_events.push(SensorBeginTouchEvent {
                        sensor_shape_id: sensor_id,
                        visitor_shape_id: world.make_visitor_id(r2),
                    });
                    index2 += 1;
                } else {
                    // persisted
                    index1 += 1;
                    index2 += 1;
                }
            } else if r1.shape_id < r2.shape_id {
                end_events.push(SensorEndTouchEvent {
                    sensor_shape_id: sensor_id,
                    visitor_shape_id: world.make_visitor_id(r1),
                });
                index1 += 1;
            } else {
                begin_events.push(SensorBeginTouchEvent {
                    sensor_shape_id: sensor_id,
                    visitor_shape_id: world.make_visitor_id(r2),
                });
                index2 += 1;
            }
        }
        while index1 < count1 {
            end_events.push(SensorEndTouchEvent {
                sensor_shape_id: sensor_id,
                visitor_shape_id: world.make_visitor_id(&refs1[index1]),
            });
            index1 += 1;
        }
        while index2 < count2 {
            begin_events.push(SensorBeginTouchEvent {
                sensor_shape_id: sensor_id,
                visitor_shape_id: world.make_visitor_id(&refs2[index2]),
            });
            index2 += 1;
        }

        world.sensor_begin_events.extend_from_slice(&begin_events);
        world.sensor_end_events[end_index].extend_from_slice(&end_events);
    }
}

impl World {
    /// Emits end events for everything the sensor currently overlaps and
    /// removes it from the sensor list, fixing up the sensor moved into
    /// the vacated slot.
    pub(crate) fn destroy_sensor(&mut self, sensor_shape_id: i32) {
        let sensor_index = self.shapes[sensor_shape_id as usize].sensor_index;
        debug_assert!(sensor_index != NULL_INDEX);

        let sensor_id = self.make_shape_id(sensor_shape_id);
        let end_index = self.end_event_array_index;

        let overlaps2 = std::mem::take(&mut self.sensors[sensor_index as usize].overlaps2);
        for visitor in overlaps2.iter() {
            let event = SensorEndTouchEvent {
                sensor_shape_id: sensor_id,
                visitor_shape_id: self.make_visitor_id(visitor),
            };
            self.sensor_end_events[end_index].push(event);
        }

        self.sensors.swap_remove(sensor_index as usize);
        if (sensor_index as usize) < self.sensors.len() {
            // Fix up the moved sensor.
            let moved_shape_id = self.sensors[sensor_index as usize].shape_id;
            self.shapes[moved_shape_id as usize].sensor_index = sensor_index;
        }
        self.shapes[sensor_shape_id as usize].sensor_index = NULL_INDEX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_ordering_matches_diff_requirements() {
        let mut overlaps = vec![
            Visitor {
                shape_id: 9,
                generation: 1,
            },
            Visitor {
                shape_id: 3,
                generation: 2,
            },
            Visitor {
                shape_id: 9,
                generation: 0,
            },
            Visitor {
                shape_id: 3,
                generation: 2,
            },
        ];
        overlaps.sort_unstable_by_key(|v| (v.shape_id, v.generation));
        overlaps.dedup_by_key(|v| v.shape_id);
        assert_eq!(
            overlaps,
            vec![
                Visitor {
                    shape_id: 3,
                    generation: 2
                },
                Visitor {
                    shape_id: 9,
                    generation: 0
                },
            ]
        );
    }
}
