//! Graph-coloring decomposition of the awake constraints.
//!
//! Within a non-overflow color no two constraints share a dynamic body,
//! so all constraints of one color solve in parallel without locks. The
//! last color is the overflow color: constraints that could not claim a
//! color land there and are solved serially by the main worker.

use crate::physics::body::BodyType;
use crate::physics::contact::ContactSim;
use crate::physics::joint::JointSim;
use crate::physics::world::World;
use crate::physics::{GRAPH_COLOR_COUNT, OVERFLOW_INDEX};
use crate::utilities::bit_set::BitSet;

pub struct GraphColor {
    /// Dynamic bodies claimed by constraints of this color.
    pub body_set: BitSet,
    pub contact_sims: Vec<ContactSim>,
    pub joint_sims: Vec<JointSim>,
    /// Offset of this color's contact constraints in the step's flat
    /// constraint array. Valid only during a solve.
    pub constraint_base: usize,
}

pub struct ConstraintGraph {
    pub colors: [GraphColor; GRAPH_COLOR_COUNT],
}

impl ConstraintGraph {
    pub fn new(body_capacity: usize) -> Self {
        Self {
            colors: std::array::from_fn(|_| {
                let mut body_set = BitSet::new();
                body_set.set_bit_count_and_clear(body_capacity.max(64));
                GraphColor {
                    body_set,
                    contact_sims: Vec::new(),
                    joint_sims: Vec::new(),
                    constraint_base: 0,
                }
            }),
        }
    }
}

impl World {
    /// Picks the first color where neither dynamic body is claimed.
    /// Static and kinematic bodies impose no constraint on the choice.
    fn assign_color(&mut self, body_id_a: i32, body_id_b: i32) -> usize {
        let dynamic_a = self.bodies[body_id_a as usize].body_type == BodyType::Dynamic;
        let dynamic_b = self.bodies[body_id_b as usize].body_type == BodyType::Dynamic;
        debug_assert!(dynamic_a || dynamic_b);

        let capacity = self.body_id_pool.capacity() as usize;
        for color in self.constraint_graph.colors.iter_mut() {
            color.body_set.ensure_bit_count(capacity);
        }

        let mut color_index = OVERFLOW_INDEX;
        for i in 0..OVERFLOW_INDEX {
            let color = &self.constraint_graph.colors[i];
            if dynamic_a && color.body_set.get(body_id_a as usize) {
                continue;
            }
            if dynamic_b && color.body_set.get(body_id_b as usize) {
                continue;
            }
            color_index = i;
            break;
        }

        if color_index != OVERFLOW_INDEX {
            let color = &mut self.constraint_graph.colors[color_index];
            if dynamic_a {
                color.body_set.set(body_id_a as usize);
            }
            if dynamic_b {
                color.body_set.set(body_id_b as usize);
            }
        }
        color_index
    }

    fn release_color(&mut self, color_index: usize, body_id_a: i32, body_id_b: i32) {
        if color_index == OVERFLOW_INDEX {
            return;
        }
        let dynamic_a = self.bodies[body_id_a as usize].body_type == BodyType::Dynamic;
        let dynamic_b = self.bodies[body_id_b as usize].body_type == BodyType::Dynamic;
        let color = &mut self.constraint_graph.colors[color_index];
        if dynamic_a {
            color.body_set.clear_bit(body_id_a as usize);
        }
        if dynamic_b {
            color.body_set.clear_bit(body_id_b as usize);
        }
    }

    /// Moves a touching contact sim into the constraint graph.
    pub(crate) fn add_contact_to_graph(&mut self, sim: ContactSim) {
        let contact_id = sim.contact_id;
        let (body_id_a, body_id_b) = {
            let contact = &self.contacts[contact_id as usize];
            (contact.body_id_a, contact.body_id_b)
        };

        let color_index = self.assign_color(body_id_a, body_id_b);
        let color = &mut self.constraint_graph.colors[color_index];
        color.contact_sims.push(sim);
        let local_index = color.contact_sims.len() as i32 - 1;

        let contact = &mut self.contacts[contact_id as usize];
        contact.color_index = color_index as i32;
        contact.local_index = local_index;
    }

    /// Removes a contact sim from its color, fixing up the contact moved
    /// into the vacated slot.
    pub(crate) fn remove_contact_from_graph(
        &mut self,
        body_id_a: i32,
        body_id_b: i32,
        color_index: i32,
        local_index: i32,
    ) -> ContactSim {
        self.release_color(color_index as usize, body_id_a, body_id_b);

        let color = &mut self.constraint_graph.colors[color_index as usize];
        let sim = color.contact_sims.swap_remove(local_index as usize);
        if (local_index as usize) < color.contact_sims.len() {
            let moved_id = color.contact_sims[local_index as usize].contact_id;
            let moved = &mut self.contacts[moved_id as usize];
            debug_assert!(moved.color_index == color_index);
            moved.local_index = local_index;
        }
        sim
    }

    pub(crate) fn add_joint_to_graph(&mut self, sim: JointSim) {
        let joint_id = sim.joint_id;
        let (body_id_a, body_id_b) = (sim.body_id_a, sim.body_id_b);

        let color_index = self.assign_color(body_id_a, body_id_b);
        let color = &mut self.constraint_graph.colors[color_index];
        color.joint_sims.push(sim);
        let local_index = color.joint_sims.len() as i32 - 1;

        let joint = &mut self.joints[joint_id as usize];
        joint.color_index = color_index as i32;
        joint.local_index = local_index;
    }

    pub(crate) fn remove_joint_from_graph(
        &mut self,
        body_id_a: i32,
        body_id_b: i32,
        color_index: i32,
        local_index: i32,
    ) -> JointSim {
        self.release_color(color_index as usize, body_id_a, body_id_b);

        let color = &mut self.constraint_graph.colors[color_index as usize];
        let sim = color.joint_sims.swap_remove(local_index as usize);
        if (local_index as usize) < color.joint_sims.len() {
            let moved_id = color.joint_sims[local_index as usize].joint_id;
            let moved = &mut self.joints[moved_id as usize];
            debug_assert!(moved.color_index == color_index);
            moved.local_index = local_index;
        }
        sim
    }

    /// Debug validation: no dynamic body appears twice within any
    /// non-overflow color.
    #[cfg(test)]
    pub(crate) fn validate_graph_coloring(&self) {
        for (color_index, color) in self.constraint_graph.colors.iter().enumerate() {
            if color_index == OVERFLOW_INDEX {
                continue;
            }
            let mut seen = std::collections::HashSet::new();
            let mut check = |body_id: i32| {
                if self.bodies[body_id as usize].body_type == BodyType::Dynamic {
                    assert!(
                        seen.insert(body_id),
                        "dynamic body {body_id} appears twice in color {color_index}"
                    );
                }
            };
            for sim in &color.contact_sims {
                let contact = &self.contacts[sim.contact_id as usize];
                check(contact.body_id_a);
                check(contact.body_id_b);
            }
            for sim in &color.joint_sims {
                check(sim.body_id_a);
                check(sim.body_id_b);
            }
        }
    }
}
