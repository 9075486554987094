//! Solver sets: where body/contact/joint sims live.
//!
//! Set 0 holds static bodies, set 1 disabled items, set 2 the awake
//! items, and sets 3+ one sleeping island group each. Everything is
//! addressed by `{set_index, local_index}`; removals swap from the back
//! and fix up the moved record's owner.

use crate::physics::body::{BodySim, BodyState};
use crate::physics::contact::ContactSim;
use crate::physics::joint::JointSim;
use crate::physics::world::World;
use crate::physics::{AWAKE_SET, DISABLED_SET, NULL_INDEX};

#[derive(Clone, Copy, Debug)]
pub struct IslandSim {
    pub island_id: i32,
}

pub struct SolverSet {
    pub body_sims: Vec<BodySim>,
    /// Parallel to `body_sims`; only populated for the awake set.
    pub body_states: Vec<BodyState>,
    /// Awake set: contacts that are not touching. Sleeping sets: every
    /// contact of the set's island.
    pub contact_sims: Vec<ContactSim>,
    /// Sleeping sets only; awake joints live in the constraint graph.
    pub joint_sims: Vec<JointSim>,
    pub island_sims: Vec<IslandSim>,
    pub set_id: i32,
}

impl SolverSet {
    pub fn new(set_id: i32) -> Self {
        Self {
            body_sims: Vec::new(),
            body_states: Vec::new(),
            contact_sims: Vec::new(),
            joint_sims: Vec::new(),
            island_sims: Vec::new(),
            set_id,
        }
    }
}

impl World {
    /// Removes a body sim (and its state in the awake set), fixing the
    /// body moved into the vacated slot.
    pub(crate) fn remove_body_sim_from_set(&mut self, set_index: i32, local_index: i32) -> BodySim {
        let set = &mut self.solver_sets[set_index as usize];
        let sim = set.body_sims.swap_remove(local_index as usize);
        if set_index == AWAKE_SET {
            set.body_states.swap_remove(local_index as usize);
        }
        if (local_index as usize) < set.body_sims.len() {
            let moved_body_id = set.body_sims[local_index as usize].body_id;
            self.bodies[moved_body_id as usize].local_index = local_index;
        }
        sim
    }

    pub(crate) fn remove_contact_sim_from_set(
        &mut self,
        set_index: i32,
        local_index: i32,
    ) -> ContactSim {
        let set = &mut self.solver_sets[set_index as usize];
        let sim = set.contact_sims.swap_remove(local_index as usize);
        if (local_index as usize) < set.contact_sims.len() {
            let moved_id = set.contact_sims[local_index as usize].contact_id;
            let moved = &mut self.contacts[moved_id as usize];
            debug_assert!(moved.set_index == set_index && moved.color_index == NULL_INDEX);
            moved.local_index = local_index;
        }
        sim
    }

    pub(crate) fn remove_island_sim_from_set(&mut self, set_index: i32, local_index: i32) -> IslandSim {
        let set = &mut self.solver_sets[set_index as usize];
        let sim = set.island_sims.swap_remove(local_index as usize);
        if (local_index as usize) < set.island_sims.len() {
            let moved_id = set.island_sims[local_index as usize].island_id;
            self.islands[moved_id as usize].local_index = local_index;
        }
        sim
    }

    /// Moves a quiescent awake island into a fresh sleeping set. Bails if
    /// the island still has pending constraint removals (it must split
    /// first).
    pub(crate) fn try_sleep_island(&mut self, island_id: i32) {
        debug_assert!(self.islands[island_id as usize].set_index == AWAKE_SET);

        if self.islands[island_id as usize].constraint_remove_count > 0 {
            // A split may divide this island into pieces that sleep at
            // different times; put it off until the split runs.
            return;
        }

        let sleep_set_index = self.alloc_solver_set();

        // Bodies, plus their non-touching contacts to the disabled set.
        let mut body_id = self.islands[island_id as usize].head_body;
        while body_id != NULL_INDEX {
            let next = self.bodies[body_id as usize].island_next;

            let move_index = self.bodies[body_id as usize].body_move_index;
            if move_index != NULL_INDEX {
                self.body_move_events[move_index as usize].fell_asleep = true;
            }

            let contact_ids = self.bodies[body_id as usize].contacts.clone();
            for contact_id in contact_ids {
                let contact = &self.contacts[contact_id as usize];
                if contact.set_index == AWAKE_SET && contact.color_index == NULL_INDEX {
                    let local = contact.local_index;
                    let sim = self.remove_contact_sim_from_set(AWAKE_SET, local);
                    let set = &mut self.solver_sets[DISABLED_SET as usize];
                    set.contact_sims.push(sim);
                    let contact = &mut self.contacts[contact_id as usize];
                    contact.set_index = DISABLED_SET;
                    contact.local_index =
                        self.solver_sets[DISABLED_SET as usize].contact_sims.len() as i32 - 1;
                }
            }

            let local = self.bodies[body_id as usize].local_index;
            let sim = self.remove_body_sim_from_set(AWAKE_SET, local);
            let set = &mut self.solver_sets[sleep_set_index as usize];
            set.body_sims.push(sim);
            let body = &mut self.bodies[body_id as usize];
            body.set_index = sleep_set_index;
            body.local_index =
                self.solver_sets[sleep_set_index as usize].body_sims.len() as i32 - 1;

            body_id = next;
        }

        // Touching contacts leave the graph.
        let mut contact_id = self.islands[island_id as usize].head_contact;
        while contact_id != NULL_INDEX {
            let (next, body_id_a, body_id_b, color_index, local_index) = {
                let contact = &self.contacts[contact_id as usize];
                (
                    contact.island_next,
                    contact.body_id_a,
                    contact.body_id_b,
                    contact.color_index,
                    contact.local_index,
                )
            };
            debug_assert!(color_index != NULL_INDEX);
            let sim = self.remove_contact_from_graph(body_id_a, body_id_b, color_index, local_index);
            let set = &mut self.solver_sets[sleep_set_index as usize];
            set.contact_sims.push(sim);
            let contact = &mut self.contacts[contact_id as usize];
            contact.set_index = sleep_set_index;
            contact.color_index = NULL_INDEX;
            contact.local_index =
                self.solver_sets[sleep_set_index as usize].contact_sims.len() as i32 - 1;

            contact_id = next;
        }

        // Joints leave the graph.
        let mut joint_id = self.islands[island_id as usize].head_joint;
        while joint_id != NULL_INDEX {
            let (next, body_id_a, body_id_b, color_index, local_index) = {
                let joint = &self.joints[joint_id as usize];
                (
                    joint.island_next,
                    joint.body_id_a,
                    joint.body_id_b,
                    joint.color_index,
                    joint.local_index,
                )
            };
            debug_assert!(color_index != NULL_INDEX);
            let sim = self.remove_joint_from_graph(body_id_a, body_id_b, color_index, local_index);
            let set = &mut self.solver_sets[sleep_set_index as usize];
            set.joint_sims.push(sim);
            let joint = &mut self.joints[joint_id as usize];
            joint.set_index = sleep_set_index;
            joint.color_index = NULL_INDEX;
            joint.local_index =
                self.solver_sets[sleep_set_index as usize].joint_sims.len() as i32 - 1;

            joint_id = next;
        }

        // The island record itself.
        let local = self.islands[island_id as usize].local_index;
        let island_sim = self.remove_island_sim_from_set(AWAKE_SET, local);
        debug_assert!(island_sim.island_id == island_id);
        let set = &mut self.solver_sets[sleep_set_index as usize];
        set.island_sims.push(island_sim);
        let island = &mut self.islands[island_id as usize];
        island.set_index = sleep_set_index;
        island.local_index = 0;
    }

    /// Moves a sleeping set's contents back into the awake set and frees
    /// the set slot.
    pub(crate) fn wake_solver_set(&mut self, set_index: i32) {
        debug_assert!(set_index >= crate::physics::FIRST_SLEEPING_SET);

        let set_id = self.solver_sets[set_index as usize].set_id;
        debug_assert!(set_id == set_index);
        let mut set = std::mem::replace(
            &mut self.solver_sets[set_index as usize],
            SolverSet::new(NULL_INDEX),
        );
        self.solver_set_id_pool.free_id(set_id);

        for sim in set.body_sims.drain(..) {
            let body_id = sim.body_id;

            let lock_flags = self.bodies[body_id as usize].lock_flags;
            let awake = &mut self.solver_sets[AWAKE_SET as usize];
            awake.body_sims.push(sim);
            awake.body_states.push(BodyState {
                flags: lock_flags,
                ..BodyState::IDENTITY
            });
            let local_index = awake.body_sims.len() as i32 - 1;

            let body = &mut self.bodies[body_id as usize];
            body.set_index = AWAKE_SET;
            body.local_index = local_index;
            body.sleep_time = 0.0;

            // Restore this body's parked non-touching contacts.
            let contact_ids = self.bodies[body_id as usize].contacts.clone();
            for contact_id in contact_ids {
                let contact = &self.contacts[contact_id as usize];
                if contact.set_index == DISABLED_SET {
                    let local = contact.local_index;
                    let sim = self.remove_contact_sim_from_set(DISABLED_SET, local);
                    let awake = &mut self.solver_sets[AWAKE_SET as usize];
                    awake.contact_sims.push(sim);
                    let contact = &mut self.contacts[contact_id as usize];
                    contact.set_index = AWAKE_SET;
                    contact.local_index =
                        self.solver_sets[AWAKE_SET as usize].contact_sims.len() as i32 - 1;
                }
            }
        }

        for sim in set.contact_sims.drain(..) {
            let contact_id = sim.contact_id;
            let contact = &mut self.contacts[contact_id as usize];
            contact.set_index = AWAKE_SET;
            debug_assert!(contact.flags & crate::physics::contact::CONTACT_TOUCHING != 0);
            self.add_contact_to_graph(sim);
        }

        for sim in set.joint_sims.drain(..) {
            let joint_id = sim.joint_id;
            let joint = &mut self.joints[joint_id as usize];
            joint.set_index = AWAKE_SET;
            self.add_joint_to_graph(sim);
        }

        for island_sim in set.island_sims.drain(..) {
            let island_id = island_sim.island_id;
            let awake = &mut self.solver_sets[AWAKE_SET as usize];
            awake.island_sims.push(island_sim);
            let island = &mut self.islands[island_id as usize];
            island.set_index = AWAKE_SET;
            island.local_index = self.solver_sets[AWAKE_SET as usize].island_sims.len() as i32 - 1;
        }
    }

    /// Allocates (or recycles) a sleeping solver-set slot.
    pub(crate) fn alloc_solver_set(&mut self) -> i32 {
        let set_index = self.solver_set_id_pool.alloc_id();
        while self.solver_sets.len() <= set_index as usize {
            let filler = SolverSet::new(NULL_INDEX);
            self.solver_sets.push(filler);
        }
        debug_assert!(self.solver_sets[set_index as usize].set_id == NULL_INDEX);
        self.solver_sets[set_index as usize] = SolverSet::new(set_index);
        set_index
    }
}
