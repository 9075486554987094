//! Persistent islands: connected components of dynamic bodies joined by
//! touching contacts and joints.
//!
//! Linking a constraint merges islands immediately; unlinking only counts
//! the removal. A deferred split pass rebuilds the sleepiest candidate
//! island before the next solve, so sleeping never has to reason about
//! stale connectivity.

use crate::physics::body::BodyType;
use crate::physics::contact::CONTACT_TOUCHING;
use crate::physics::solver_set::IslandSim;
use crate::physics::world::World;
use crate::physics::{AWAKE_SET, NULL_INDEX};

pub struct Island {
    pub set_index: i32,
    pub local_index: i32,
    pub head_body: i32,
    pub tail_body: i32,
    pub body_count: i32,
    pub head_contact: i32,
    pub tail_contact: i32,
    pub contact_count: i32,
    pub head_joint: i32,
    pub tail_joint: i32,
    pub joint_count: i32,
    /// Constraints removed since the last split. Non-zero blocks sleep
    /// until the island is rebuilt.
    pub constraint_remove_count: i32,
}

impl Island {
    fn new() -> Self {
        Self {
            set_index: NULL_INDEX,
            local_index: NULL_INDEX,
            head_body: NULL_INDEX,
            tail_body: NULL_INDEX,
            body_count: 0,
            head_contact: NULL_INDEX,
            tail_contact: NULL_INDEX,
            contact_count: 0,
            head_joint: NULL_INDEX,
            tail_joint: NULL_INDEX,
            joint_count: 0,
            constraint_remove_count: 0,
        }
    }
}

impl World {
    /// Creates an empty awake island and registers its sim.
    pub(crate) fn create_island(&mut self) -> i32 {
        let island_id = self.island_id_pool.alloc_id();
        while self.islands.len() <= island_id as usize {
            self.islands.push(Island::new());
        }
        self.islands[island_id as usize] = Island::new();

        let awake = &mut self.solver_sets[AWAKE_SET as usize];
        awake.island_sims.push(IslandSim { island_id });
        let island = &mut self.islands[island_id as usize];
        island.set_index = AWAKE_SET;
        island.local_index = self.solver_sets[AWAKE_SET as usize].island_sims.len() as i32 - 1;
        island_id
    }

    pub(crate) fn destroy_island(&mut self, island_id: i32) {
        let island = &self.islands[island_id as usize];
        debug_assert!(island.body_count == 0);
        let (set_index, local_index) = (island.set_index, island.local_index);
        let sim = self.remove_island_sim_from_set(set_index, local_index);
        debug_assert!(sim.island_id == island_id);
        self.islands[island_id as usize].set_index = NULL_INDEX;
        self.island_id_pool.free_id(island_id);
    }

    pub(crate) fn add_body_to_island(&mut self, island_id: i32, body_id: i32) {
        debug_assert!(self.bodies[body_id as usize].island_id == NULL_INDEX);
        let tail = self.islands[island_id as usize].tail_body;

        let body = &mut self.bodies[body_id as usize];
        body.island_id = island_id;
        body.island_prev = tail;
        body.island_next = NULL_INDEX;

        if tail != NULL_INDEX {
            self.bodies[tail as usize].island_next = body_id;
        }
        let island = &mut self.islands[island_id as usize];
        if island.head_body == NULL_INDEX {
            island.head_body = body_id;
        }
        island.tail_body = body_id;
        island.body_count += 1;
    }

    pub(crate) fn remove_body_from_island(&mut self, body_id: i32) {
        let (island_id, prev, next) = {
            let body = &self.bodies[body_id as usize];
            (body.island_id, body.island_prev, body.island_next)
        };
        if island_id == NULL_INDEX {
            return;
        }
        if prev != NULL_INDEX {
            self.bodies[prev as usize].island_next = next;
        }
        if next != NULL_INDEX {
            self.bodies[next as usize].island_prev = prev;
        }
        {
            let island = &mut self.islands[island_id as usize];
            if island.head_body == body_id {
                island.head_body = next;
            }
            if island.tail_body == body_id {
                island.tail_body = prev;
            }
            island.body_count -= 1;
        }
        {
            let body = &mut self.bodies[body_id as usize];
            body.island_id = NULL_INDEX;
            body.island_prev = NULL_INDEX;
            body.island_next = NULL_INDEX;
        }
        if self.islands[island_id as usize].body_count == 0 {
            self.destroy_island(island_id);
        }
    }

    fn add_contact_to_island(&mut self, island_id: i32, contact_id: i32) {
        let tail = self.islands[island_id as usize].tail_contact;
        let contact = &mut self.contacts[contact_id as usize];
        debug_assert!(contact.island_id == NULL_INDEX);
        contact.island_id = island_id;
        contact.island_prev = tail;
        contact.island_next = NULL_INDEX;
        if tail != NULL_INDEX {
            self.contacts[tail as usize].island_next = contact_id;
        }
        let island = &mut self.islands[island_id as usize];
        if island.head_contact == NULL_INDEX {
            island.head_contact = contact_id;
        }
        island.tail_contact = contact_id;
        island.contact_count += 1;
    }

    fn add_joint_to_island(&mut self, island_id: i32, joint_id: i32) {
        let tail = self.islands[island_id as usize].tail_joint;
        let joint = &mut self.joints[joint_id as usize];
        debug_assert!(joint.island_id == NULL_INDEX);
        joint.island_id = island_id;
        joint.island_prev = tail;
        joint.island_next = NULL_INDEX;
        if tail != NULL_INDEX {
            self.joints[tail as usize].island_next = joint_id;
        }
        let island = &mut self.islands[island_id as usize];
        if island.head_joint == NULL_INDEX {
            island.head_joint = joint_id;
        }
        island.tail_joint = joint_id;
        island.joint_count += 1;
    }

    /// Island owning a constraint between these bodies, merging the two
    /// dynamic islands when the constraint bridges them.
    fn constraint_island(&mut self, body_id_a: i32, body_id_b: i32) -> i32 {
        let island_a = if self.bodies[body_id_a as usize].body_type == BodyType::Dynamic {
            self.bodies[body_id_a as usize].island_id
        } else {
            NULL_INDEX
        };
        let island_b = if self.bodies[body_id_b as usize].body_type == BodyType::Dynamic {
            self.bodies[body_id_b as usize].island_id
        } else {
            NULL_INDEX
        };
        debug_assert!(island_a != NULL_INDEX || island_b != NULL_INDEX);

        if island_a == NULL_INDEX {
            island_b
        } else if island_b == NULL_INDEX || island_a == island_b {
            island_a
        } else {
            self.merge_islands(island_a, island_b)
        }
    }

    /// Concatenates island `b` into island `a`. Returns `a`.
    fn merge_islands(&mut self, island_id_a: i32, island_id_b: i32) -> i32 {
        debug_assert!(island_id_a != island_id_b);

        // Retag everything in b.
        let mut body_id = self.islands[island_id_b as usize].head_body;
        while body_id != NULL_INDEX {
            let body = &mut self.bodies[body_id as usize];
            body.island_id = island_id_a;
            body_id = body.island_next;
        }
        let mut contact_id = self.islands[island_id_b as usize].head_contact;
        while contact_id != NULL_INDEX {
            let contact = &mut self.contacts[contact_id as usize];
            contact.island_id = island_id_a;
            contact_id = contact.island_next;
        }
        let mut joint_id = self.islands[island_id_b as usize].head_joint;
        while joint_id != NULL_INDEX {
            let joint = &mut self.joints[joint_id as usize];
            joint.island_id = island_id_a;
            joint_id = joint.island_next;
        }

        // Concatenate the three lists.
        let (b_head_body, b_tail_body, b_body_count) = {
            let b = &self.islands[island_id_b as usize];
            (b.head_body, b.tail_body, b.body_count)
        };
        let (b_head_contact, b_tail_contact, b_contact_count) = {
            let b = &self.islands[island_id_b as usize];
            (b.head_contact, b.tail_contact, b.contact_count)
        };
        let (b_head_joint, b_tail_joint, b_joint_count) = {
            let b = &self.islands[island_id_b as usize];
            (b.head_joint, b.tail_joint, b.joint_count)
        };
        let b_remove_count = self.islands[island_id_b as usize].constraint_remove_count;

        let a_tail_body = self.islands[island_id_a as usize].tail_body;
        if b_head_body != NULL_INDEX {
            if a_tail_body != NULL_INDEX {
                self.bodies[a_tail_body as usize].island_next = b_head_body;
                self.bodies[b_head_body as usize].island_prev = a_tail_body;
            }
            let a = &mut self.islands[island_id_a as usize];
            if a.head_body == NULL_INDEX {
                a.head_body = b_head_body;
            }
            a.tail_body = b_tail_body;
            a.body_count += b_body_count;
        }

        let a_tail_contact = self.islands[island_id_a as usize].tail_contact;
        if b_head_contact != NULL_INDEX {
            if a_tail_contact != NULL_INDEX {
                self.contacts[a_tail_contact as usize].island_next = b_head_contact;
                self.contacts[b_head_contact as usize].island_prev = a_tail_contact;
            }
            let a = &mut self.islands[island_id_a as usize];
            if a.head_contact == NULL_INDEX {
                a.head_contact = b_head_contact;
            }
            a.tail_contact = b_tail_contact;
            a.contact_count += b_contact_count;
        }

        let a_tail_joint = self.islands[island_id_a as usize].tail_joint;
        if b_head_joint != NULL_INDEX {
            if a_tail_joint != NULL_INDEX {
                self.joints[a_tail_joint as usize].island_next = b_head_joint;
                self.joints[b_head_joint as usize].island_prev = a_tail_joint;
            }
            let a = &mut self.islands[island_id_a as usize];
            if a.head_joint == NULL_INDEX {
                a.head_joint = b_head_joint;
            }
            a.tail_joint = b_tail_joint;
            a.joint_count += b_joint_count;
        }

        self.islands[island_id_a as usize].constraint_remove_count += b_remove_count;

        // Retire the husk.
        {
            let b = &mut self.islands[island_id_b as usize];
            b.head_body = NULL_INDEX;
            b.tail_body = NULL_INDEX;
            b.body_count = 0;
            b.head_contact = NULL_INDEX;
            b.tail_contact = NULL_INDEX;
            b.contact_count = 0;
            b.head_joint = NULL_INDEX;
            b.tail_joint = NULL_INDEX;
            b.joint_count = 0;
        }
        self.destroy_island(island_id_b);

        island_id_a
    }

    /// Links a contact that began touching into the island graph.
    pub(crate) fn link_contact(&mut self, contact_id: i32) {
        let (body_id_a, body_id_b) = {
            let contact = &self.contacts[contact_id as usize];
            (contact.body_id_a, contact.body_id_b)
        };
        let island_id = self.constraint_island(body_id_a, body_id_b);
        self.add_contact_to_island(island_id, contact_id);
    }

    /// Unlinks a contact that stopped touching. The island keeps a count
    /// of removals so the split pass knows it may be disconnected.
    pub(crate) fn unlink_contact(&mut self, contact_id: i32) {
        let (island_id, prev, next) = {
            let contact = &self.contacts[contact_id as usize];
            (contact.island_id, contact.island_prev, contact.island_next)
        };
        debug_assert!(island_id != NULL_INDEX);
        if prev != NULL_INDEX {
            self.contacts[prev as usize].island_next = next;
        }
        if next != NULL_INDEX {
            self.contacts[next as usize].island_prev = prev;
        }
        {
            let island = &mut self.islands[island_id as usize];
            if island.head_contact == contact_id {
                island.head_contact = next;
            }
            if island.tail_contact == contact_id {
                island.tail_contact = prev;
            }
            island.contact_count -= 1;
            island.constraint_remove_count += 1;
        }
        let contact = &mut self.contacts[contact_id as usize];
        contact.island_id = NULL_INDEX;
        contact.island_prev = NULL_INDEX;
        contact.island_next = NULL_INDEX;
    }

    pub(crate) fn link_joint(&mut self, joint_id: i32) {
        let (body_id_a, body_id_b) = {
            let joint = &self.joints[joint_id as usize];
            (joint.body_id_a, joint.body_id_b)
        };
        let island_id = self.constraint_island(body_id_a, body_id_b);
        self.add_joint_to_island(island_id, joint_id);
    }

    pub(crate) fn unlink_joint(&mut self, joint_id: i32) {
        let (island_id, prev, next) = {
            let joint = &self.joints[joint_id as usize];
            (joint.island_id, joint.island_prev, joint.island_next)
        };
        debug_assert!(island_id != NULL_INDEX);
        if prev != NULL_INDEX {
            self.joints[prev as usize].island_next = next;
        }
        if next != NULL_INDEX {
            self.joints[next as usize].island_prev = prev;
        }
        {
            let island = &mut self.islands[island_id as usize];
            if island.head_joint == joint_id {
                island.head_joint = next;
            }
            if island.tail_joint == joint_id {
                island.tail_joint = prev;
            }
            island.joint_count -= 1;
            island.constraint_remove_count += 1;
        }
        let joint = &mut self.joints[joint_id as usize];
        joint.island_id = NULL_INDEX;
        joint.island_prev = NULL_INDEX;
        joint.island_next = NULL_INDEX;
    }

    /// Rebuilds the connected components of an awake island whose
    /// constraint graph may have been cut. Runs serially before the
    /// solver dispatch.
    pub(crate) fn split_island(&mut self, island_id: i32) {
        debug_assert!(self.islands[island_id as usize].set_index == AWAKE_SET);

        // Collect members and clear their tags.
        let mut body_ids = Vec::with_capacity(self.islands[island_id as usize].body_count as usize);
        let mut body_id = self.islands[island_id as usize].head_body;
        while body_id != NULL_INDEX {
            body_ids.push(body_id);
            let body = &mut self.bodies[body_id as usize];
            let next = body.island_next;
            body.island_id = NULL_INDEX;
            body.island_prev = NULL_INDEX;
            body.island_next = NULL_INDEX;
            body_id = next;
        }
        let mut contact_id = self.islands[island_id as usize].head_contact;
        while contact_id != NULL_INDEX {
            let contact = &mut self.contacts[contact_id as usize];
            let next = contact.island_next;
            contact.island_id = NULL_INDEX;
            contact.island_prev = NULL_INDEX;
            contact.island_next = NULL_INDEX;
            contact_id = next;
        }
        let mut joint_id = self.islands[island_id as usize].head_joint;
        while joint_id != NULL_INDEX {
            let joint = &mut self.joints[joint_id as usize];
            let next = joint.island_next;
            joint.island_id = NULL_INDEX;
            joint.island_prev = NULL_INDEX;
            joint.island_next = NULL_INDEX;
            joint_id = next;
        }

        {
            let island = &mut self.islands[island_id as usize];
            island.head_body = NULL_INDEX;
            island.tail_body = NULL_INDEX;
            island.body_count = 0;
            island.head_contact = NULL_INDEX;
            island.tail_contact = NULL_INDEX;
            island.contact_count = 0;
            island.head_joint = NULL_INDEX;
            island.tail_joint = NULL_INDEX;
            island.joint_count = 0;
        }
        self.destroy_island(island_id);

        // Flood fill each component in seed order for determinism.
        let mut stack = Vec::new();
        for &seed in &body_ids {
            if self.bodies[seed as usize].island_id != NULL_INDEX {
                continue;
            }
            let new_island_id = self.create_island();
            self.add_body_to_island(new_island_id, seed);
            stack.push(seed);

            while let Some(current) = stack.pop() {
                let contact_ids = self.bodies[current as usize].contacts.clone();
                for contact_id in contact_ids {
                    let (touching, island_tag, other_body_id) = {
                        let contact = &self.contacts[contact_id as usize];
                        let other = if contact.body_id_a == current {
                            contact.body_id_b
                        } else {
                            contact.body_id_a
                        };
                        (
                            contact.flags & CONTACT_TOUCHING != 0,
                            contact.island_id,
                            other,
                        )
                    };
                    if !touching {
                        continue;
                    }
                    if island_tag == NULL_INDEX {
                        self.add_contact_to_island(new_island_id, contact_id);
                    }
                    let other = &self.bodies[other_body_id as usize];
                    if other.body_type == BodyType::Dynamic && other.island_id == NULL_INDEX {
                        self.add_body_to_island(new_island_id, other_body_id);
                        stack.push(other_body_id);
                    }
                }

                let joint_ids = self.bodies[current as usize].joints.clone();
                for joint_id in joint_ids {
                    let (island_tag, other_body_id) = {
                        let joint = &self.joints[joint_id as usize];
                        let other = if joint.body_id_a == current {
                            joint.body_id_b
                        } else {
                            joint.body_id_a
                        };
                        (joint.island_id, other)
                    };
                    if island_tag == NULL_INDEX {
                        self.add_joint_to_island(new_island_id, joint_id);
                    }
                    let other = &self.bodies[other_body_id as usize];
                    if other.body_type == BodyType::Dynamic && other.island_id == NULL_INDEX {
                        self.add_body_to_island(new_island_id, other_body_id);
                        stack.push(other_body_id);
                    }
                }
            }
        }
    }
}
