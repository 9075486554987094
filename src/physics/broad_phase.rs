//! Broad phase: three dynamic trees (static / kinematic / dynamic) plus
//! the buffered move set that drives pair creation.
//!
//! All broad-phase mutation is serial: proxies are created and moved from
//! user calls and the post-solve refit, and `update_pairs` runs at the
//! start of a step before the narrow phase.

use crate::physics::body::BodyType;
use crate::physics::contact::shape_pair_key;
use crate::physics::dynamic_tree::DynamicTree;
use crate::physics::world::World;
use crate::physics::NULL_INDEX;
use crate::utilities::bounding_box::Aabb;
use hashbrown::HashSet;

/// Proxy keys pack the tree index into the low bits of the node id.
#[inline(always)]
pub fn make_proxy_key(proxy_id: i32, tree_index: usize) -> i32 {
    (proxy_id << 2) | tree_index as i32
}

#[inline(always)]
pub fn proxy_id(proxy_key: i32) -> i32 {
    proxy_key >> 2
}

#[inline(always)]
pub fn proxy_tree(proxy_key: i32) -> usize {
    (proxy_key & 3) as usize
}

pub struct BroadPhase {
    pub trees: [DynamicTree; 3],
    /// Proxies moved since the last pair update. The set dedups, the
    /// array preserves insertion order for determinism.
    pub move_set: HashSet<u64>,
    pub move_array: Vec<i32>,
}

impl BroadPhase {
    pub fn new() -> Self {
        Self {
            trees: [DynamicTree::new(), DynamicTree::new(), DynamicTree::new()],
            move_set: HashSet::new(),
            move_array: Vec::new(),
        }
    }

    pub fn create_proxy(
        &mut self,
        body_type: BodyType,
        aabb: Aabb,
        category_bits: u64,
        shape_id: i32,
        force_pair_creation: bool,
    ) -> i32 {
        let tree_index = body_type.tree_index();
        let id = self.trees[tree_index].create_proxy(aabb, category_bits, shape_id as u64);
        let proxy_key = make_proxy_key(id, tree_index);
        if body_type != BodyType::Static || force_pair_creation {
            self.buffer_move(proxy_key);
        }
        proxy_key
    }

    pub fn destroy_proxy(&mut self, proxy_key: i32) {
        self.unbuffer_move(proxy_key);
        self.trees[proxy_tree(proxy_key)].destroy_proxy(proxy_id(proxy_key));
    }

    pub fn move_proxy(&mut self, proxy_key: i32, aabb: Aabb) {
        self.trees[proxy_tree(proxy_key)].move_proxy(proxy_id(proxy_key), aabb);
        self.buffer_move(proxy_key);
    }

    /// Grows a proxy in place. Cheaper than a move; used by the refit.
    pub fn enlarge_proxy(&mut self, proxy_key: i32, aabb: Aabb) {
        self.trees[proxy_tree(proxy_key)].enlarge_proxy(proxy_id(proxy_key), aabb);
        self.buffer_move(proxy_key);
    }

    pub fn buffer_move(&mut self, proxy_key: i32) {
        // Adding one keeps zero usable as the empty sentinel inside the
        // hash set.
        if self.move_set.insert(proxy_key as u64 + 1) {
            self.move_array.push(proxy_key);
        }
    }

    fn unbuffer_move(&mut self, proxy_key: i32) {
        // The array entry is skipped lazily during the pair update.
        self.move_set.remove(&(proxy_key as u64 + 1));
    }

    pub fn get_fat_aabb(&self, proxy_key: i32) -> Aabb {
        self.trees[proxy_tree(proxy_key)].get_aabb(proxy_id(proxy_key))
    }
}

impl Default for BroadPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Queries every moved proxy against the trees and creates contacts
    /// for new candidate pairs. Serial; runs before the narrow phase.
    pub(crate) fn update_broad_phase_pairs(&mut self) {
        if self.broad_phase.move_array.is_empty() {
            return;
        }

        let move_array = std::mem::take(&mut self.broad_phase.move_array);
        tracing::trace!(moved = move_array.len(), "update pairs");

        // Pairs seen this pass; both proxies of a pair may have moved.
        let mut pair_set: HashSet<u64> = HashSet::with_capacity(2 * move_array.len());

        for proxy_key in move_array.iter().copied() {
            if !self.broad_phase.move_set.contains(&(proxy_key as u64 + 1)) {
                // Destroyed after buffering.
                continue;
            }

            let tree_index = proxy_tree(proxy_key);
            let shape_id = self.broad_phase.trees[tree_index]
                .get_user_data(proxy_id(proxy_key)) as i32;
            let fat_aabb = self.broad_phase.get_fat_aabb(proxy_key);

            let moved_shape = &self.shapes[shape_id as usize];
            if moved_shape.sensor_index != NULL_INDEX {
                // Sensors never own contacts.
                continue;
            }
            let moved_filter = moved_shape.filter;
            let moved_body_id = moved_shape.body_id;
            let moved_is_dynamic =
                self.bodies[moved_body_id as usize].body_type == BodyType::Dynamic;

            let mut candidates: Vec<i32> = Vec::new();
            {
                let world_shapes = &self.shapes;
                let world_bodies = &self.bodies;
                for (other_tree_index, tree) in self.broad_phase.trees.iter().enumerate() {
                    // No contacts between two non-dynamic bodies.
                    if !moved_is_dynamic && other_tree_index != BodyType::Dynamic.tree_index() {
                        continue;
                    }
                    tree.query(fat_aabb, moved_filter.mask_bits, &mut |_, user_data| {
                        let other_shape_id = user_data as i32;
                        if other_shape_id == shape_id {
                            return true;
                        }
                        let other_shape = &world_shapes[other_shape_id as usize];
                        if other_shape.sensor_index != NULL_INDEX {
                            return true;
                        }
                        if other_shape.body_id == moved_body_id {
                            return true;
                        }
                        if !moved_is_dynamic
                            && world_bodies[other_shape.body_id as usize].body_type
                                != BodyType::Dynamic
                        {
                            return true;
                        }
                        if !crate::physics::shape::should_shapes_collide(
                            moved_filter,
                            other_shape.filter,
                        ) {
                            return true;
                        }
                        candidates.push(other_shape_id);
                        true
                    });
                }
            }

            for other_shape_id in candidates {
                let key = shape_pair_key(shape_id, other_shape_id);
                if self.contact_lookup.contains_key(&key) {
                    continue;
                }
                if !pair_set.insert(key) {
                    continue;
                }
                if !self.should_bodies_collide(shape_id, other_shape_id) {
                    continue;
                }
                self.create_contact(shape_id, other_shape_id);
            }
        }

        self.broad_phase.move_array = move_array;
        self.broad_phase.move_array.clear();
        self.broad_phase.move_set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_key_round_trip() {
        let key = make_proxy_key(37, 2);
        assert_eq!(proxy_id(key), 37);
        assert_eq!(proxy_tree(key), 2);
    }

    #[test]
    fn buffer_move_dedups() {
        let mut bp = BroadPhase::new();
        let key = bp.create_proxy(
            BodyType::Dynamic,
            Aabb::new(glam::Vec2::ZERO, glam::Vec2::ONE),
            1,
            0,
            false,
        );
        bp.buffer_move(key);
        bp.buffer_move(key);
        // create_proxy already buffered once.
        assert_eq!(bp.move_array.len(), 1);
    }
}
