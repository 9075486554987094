//! Balanced dynamic AABB tree used by the broad phase.
//!
//! Leaves hold fat proxy bounds plus a user word (the shape id). Inserts
//! descend by perimeter cost; an AVL-style rotation pass keeps the tree
//! height logarithmic. `enlarge_proxy` grows ancestor bounds in place
//! without rebalancing, which is the cheap path the post-solve refit uses.

use crate::physics::NULL_INDEX;
use crate::utilities::bounding_box::Aabb;
use glam::Vec2;

#[derive(Clone, Copy)]
struct TreeNode {
    aabb: Aabb,
    user_data: u64,
    category_bits: u64,
    /// Parent index for live nodes, next free index for pooled nodes.
    parent: i32,
    child1: i32,
    child2: i32,
    /// Leaf = 0, free = -1.
    height: i32,
}

impl TreeNode {
    #[inline(always)]
    fn is_leaf(&self) -> bool {
        self.child1 == NULL_INDEX
    }
}

const EMPTY_NODE: TreeNode = TreeNode {
    aabb: Aabb {
        lower: Vec2::ZERO,
        upper: Vec2::ZERO,
    },
    user_data: 0,
    category_bits: 0,
    parent: NULL_INDEX,
    child1: NULL_INDEX,
    child2: NULL_INDEX,
    height: -1,
};

pub struct DynamicTree {
    nodes: Vec<TreeNode>,
    root: i32,
    free_list: i32,
    proxy_count: i32,
}

impl Default for DynamicTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: NULL_INDEX,
            free_list: NULL_INDEX,
            proxy_count: 0,
        }
    }

    #[inline(always)]
    pub fn proxy_count(&self) -> i32 {
        self.proxy_count
    }

    pub fn get_aabb(&self, proxy_id: i32) -> Aabb {
        self.nodes[proxy_id as usize].aabb
    }

    pub fn get_user_data(&self, proxy_id: i32) -> u64 {
        self.nodes[proxy_id as usize].user_data
    }

    fn allocate_node(&mut self) -> i32 {
        if self.free_list == NULL_INDEX {
            let index = self.nodes.len() as i32;
            self.nodes.push(EMPTY_NODE);
            return index;
        }
        let index = self.free_list;
        self.free_list = self.nodes[index as usize].parent;
        self.nodes[index as usize] = EMPTY_NODE;
        index
    }

    fn free_node(&mut self, index: i32) {
        let node = &mut self.nodes[index as usize];
        node.parent = self.free_list;
        node.height = -1;
        self.free_list = index;
    }

    pub fn create_proxy(&mut self, aabb: Aabb, category_bits: u64, user_data: u64) -> i32 {
        let proxy_id = self.allocate_node();
        {
            let node = &mut self.nodes[proxy_id as usize];
            node.aabb = aabb;
            node.user_data = user_data;
            node.category_bits = category_bits;
            node.height = 0;
        }
        self.insert_leaf(proxy_id);
        self.proxy_count += 1;
        proxy_id
    }

    pub fn destroy_proxy(&mut self, proxy_id: i32) {
        debug_assert!(self.nodes[proxy_id as usize].is_leaf());
        self.remove_leaf(proxy_id);
        self.free_node(proxy_id);
        self.proxy_count -= 1;
    }

    /// Replaces the proxy bounds and reinserts the leaf.
    pub fn move_proxy(&mut self, proxy_id: i32, aabb: Aabb) {
        self.remove_leaf(proxy_id);
        self.nodes[proxy_id as usize].aabb = aabb;
        self.insert_leaf(proxy_id);
    }

    /// Grows the proxy bounds and any ancestor bounds that no longer
    /// contain them. No rebalancing; the structure is untouched.
    pub fn enlarge_proxy(&mut self, proxy_id: i32, aabb: Aabb) {
        debug_assert!(self.nodes[proxy_id as usize].is_leaf());
        debug_assert!(!self.nodes[proxy_id as usize].aabb.contains(aabb));

        self.nodes[proxy_id as usize].aabb = aabb;
        let mut index = self.nodes[proxy_id as usize].parent;
        while index != NULL_INDEX {
            if self.nodes[index as usize].aabb.contains(aabb) {
                break;
            }
            self.nodes[index as usize].aabb =
                Aabb::union(self.nodes[index as usize].aabb, aabb);
            index = self.nodes[index as usize].parent;
        }
    }

    fn insert_leaf(&mut self, leaf: i32) {
        if self.root == NULL_INDEX {
            self.root = leaf;
            self.nodes[leaf as usize].parent = NULL_INDEX;
            return;
        }

        // Find the best sibling by descending along the cheaper child.
        let leaf_aabb = self.nodes[leaf as usize].aabb;
        let mut index = self.root;
        while !self.nodes[index as usize].is_leaf() {
            let child1 = self.nodes[index as usize].child1;
            let child2 = self.nodes[index as usize].child2;

            let area = self.nodes[index as usize].aabb.perimeter();
            let combined_area = Aabb::union(self.nodes[index as usize].aabb, leaf_aabb).perimeter();

            // Cost of creating a new parent for this node and the leaf.
            let cost = 2.0 * combined_area;
            // Minimum cost of pushing the leaf further down the tree.
            let inheritance_cost = 2.0 * (combined_area - area);

            let child_cost = |tree: &Self, child: i32| -> f32 {
                let child_aabb = tree.nodes[child as usize].aabb;
                let enlarged = Aabb::union(child_aabb, leaf_aabb).perimeter();
                if tree.nodes[child as usize].is_leaf() {
                    enlarged + inheritance_cost
                } else {
                    enlarged - child_aabb.perimeter() + inheritance_cost
                }
            };

            let cost1 = child_cost(self, child1);
            let cost2 = child_cost(self, child2);

            if cost < cost1 && cost < cost2 {
                break;
            }
            index = if cost1 < cost2 { child1 } else { child2 };
        }

        let sibling = index;

        // New parent spliced above the sibling.
        let old_parent = self.nodes[sibling as usize].parent;
        let new_parent = self.allocate_node();
        {
            let sibling_aabb = self.nodes[sibling as usize].aabb;
            let sibling_height = self.nodes[sibling as usize].height;
            let node = &mut self.nodes[new_parent as usize];
            node.parent = old_parent;
            node.aabb = Aabb::union(leaf_aabb, sibling_aabb);
            node.height = sibling_height + 1;
            node.child1 = sibling;
            node.child2 = leaf;
        }
        self.nodes[sibling as usize].parent = new_parent;
        self.nodes[leaf as usize].parent = new_parent;

        if old_parent != NULL_INDEX {
            if self.nodes[old_parent as usize].child1 == sibling {
                self.nodes[old_parent as usize].child1 = new_parent;
            } else {
                self.nodes[old_parent as usize].child2 = new_parent;
            }
        } else {
            self.root = new_parent;
        }

        // Refit and rebalance ancestors.
        let mut index = new_parent;
        while index != NULL_INDEX {
            index = self.balance(index);

            let child1 = self.nodes[index as usize].child1;
            let child2 = self.nodes[index as usize].child2;
            self.nodes[index as usize].height = 1 + self.nodes[child1 as usize]
                .height
                .max(self.nodes[child2 as usize].height);
            self.nodes[index as usize].aabb = Aabb::union(
                self.nodes[child1 as usize].aabb,
                self.nodes[child2 as usize].aabb,
            );

            index = self.nodes[index as usize].parent;
        }
    }

    fn remove_leaf(&mut self, leaf: i32) {
        if leaf == self.root {
            self.root = NULL_INDEX;
            return;
        }

        let parent = self.nodes[leaf as usize].parent;
        let grand_parent = self.nodes[parent as usize].parent;
        let sibling = if self.nodes[parent as usize].child1 == leaf {
            self.nodes[parent as usize].child2
        } else {
            self.nodes[parent as usize].child1
        };

        if grand_parent != NULL_INDEX {
            if self.nodes[grand_parent as usize].child1 == parent {
                self.nodes[grand_parent as usize].child1 = sibling;
            } else {
                self.nodes[grand_parent as usize].child2 = sibling;
            }
            self.nodes[sibling as usize].parent = grand_parent;
            self.free_node(parent);

            let mut index = grand_parent;
            while index != NULL_INDEX {
                index = self.balance(index);

                let child1 = self.nodes[index as usize].child1;
                let child2 = self.nodes[index as usize].child2;
                self.nodes[index as usize].aabb = Aabb::union(
                    self.nodes[child1 as usize].aabb,
                    self.nodes[child2 as usize].aabb,
                );
                self.nodes[index as usize].height = 1 + self.nodes[child1 as usize]
                    .height
                    .max(self.nodes[child2 as usize].height);

                index = self.nodes[index as usize].parent;
            }
        } else {
            self.root = sibling;
            self.nodes[sibling as usize].parent = NULL_INDEX;
            self.free_node(parent);
        }
    }

    /// Rotates the subtree at `i_a` if its children are imbalanced.
    /// Returns the new subtree root.
    fn balance(&mut self, i_a: i32) -> i32 {
        let a = i_a as usize;
        if self.nodes[a].is_leaf() || self.nodes[a].height < 2 {
            return i_a;
        }

        let i_b = self.nodes[a].child1;
        let i_c = self.nodes[a].child2;
        let b = i_b as usize;
        let c = i_c as usize;

        let balance = self.nodes[c].height - self.nodes[b].height;

        if balance > 1 {
            // Rotate C up.
            let i_f = self.nodes[c].child1;
            let i_g = self.nodes[c].child2;
            let f = i_f as usize;
            let g = i_g as usize;

            self.nodes[c].child1 = i_a;
            self.nodes[c].parent = self.nodes[a].parent;
            self.nodes[a].parent = i_c;

            let c_parent = self.nodes[c].parent;
            if c_parent != NULL_INDEX {
                if self.nodes[c_parent as usize].child1 == i_a {
                    self.nodes[c_parent as usize].child1 = i_c;
                } else {
                    self.nodes[c_parent as usize].child2 = i_c;
                }
            } else {
                self.root = i_c;
            }

            if self.nodes[f].height > self.nodes[g].height {
                self.nodes[c].child2 = i_f;
                self.nodes[a].child2 = i_g;
                self.nodes[g].parent = i_a;
                self.nodes[a].aabb = Aabb::union(self.nodes[b].aabb, self.nodes[g].aabb);
                self.nodes[c].aabb = Aabb::union(self.nodes[a].aabb, self.nodes[f].aabb);
                self.nodes[a].height = 1 + self.nodes[b].height.max(self.nodes[g].height);
                self.nodes[c].height = 1 + self.nodes[a].height.max(self.nodes[f].height);
            } else {
                self.nodes[c].child2 = i_g;
                self.nodes[a].child2 = i_f;
                self.nodes[f].parent = i_a;
                self.nodes[a].aabb = Aabb::union(self.nodes[b].aabb, self.nodes[f].aabb);
                self.nodes[c].aabb = Aabb::union(self.nodes[a].aabb, self.nodes[g].aabb);
                self.nodes[a].height = 1 + self.nodes[b].height.max(self.nodes[f].height);
                self.nodes[c].height = 1 + self.nodes[a].height.max(self.nodes[g].height);
            }
            return i_c;
        }

        if balance < -1 {
            // Rotate B up.
            let i_d = self.nodes[b].child1;
            let i_e = self.nodes[b].child2;
            let d = i_d as usize;
            let e = i_e as usize;

            self.nodes[b].child1 = i_a;
            self.nodes[b].parent = self.nodes[a].parent;
            self.nodes[a].parent = i_b;

            let b_parent = self.nodes[b].parent;
            if b_parent != NULL_INDEX {
                if self.nodes[b_parent as usize].child1 == i_a {
                    self.nodes[b_parent as usize].child1 = i_b;
                } else {
                    self.nodes[b_parent as usize].child2 = i_b;
                }
            } else {
                self.root = i_b;
            }

            if self.nodes[d].height > self.nodes[e].height {
                self.nodes[b].child2 = i_d;
                self.nodes[a].child1 = i_e;
                self.nodes[e].parent = i_a;
                self.nodes[a].aabb = Aabb::union(self.nodes[c].aabb, self.nodes[e].aabb);
                self.nodes[b].aabb = Aabb::union(self.nodes[a].aabb, self.nodes[d].aabb);
                self.nodes[a].height = 1 + self.nodes[c].height.max(self.nodes[e].height);
                self.nodes[b].height = 1 + self.nodes[a].height.max(self.nodes[d].height);
            } else {
                self.nodes[b].child2 = i_e;
                self.nodes[a].child1 = i_d;
                self.nodes[d].parent = i_a;
                self.nodes[a].aabb = Aabb::union(self.nodes[c].aabb, self.nodes[d].aabb);
                self.nodes[b].aabb = Aabb::union(self.nodes[a].aabb, self.nodes[e].aabb);
                self.nodes[a].height = 1 + self.nodes[c].height.max(self.nodes[d].height);
                self.nodes[b].height = 1 + self.nodes[a].height.max(self.nodes[e].height);
            }
            return i_b;
        }

        i_a
    }

    /// Visits every proxy whose bounds overlap `aabb` and whose category
    /// passes `mask_bits`. The callback returns false to stop the query.
    pub fn query(&self, aabb: Aabb, mask_bits: u64, callback: &mut dyn FnMut(i32, u64) -> bool) {
        if self.root == NULL_INDEX {
            return;
        }
        let mut stack: Vec<i32> = Vec::with_capacity(64);
        stack.push(self.root);

        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];
            if !Aabb::overlaps(node.aabb, aabb) {
                continue;
            }
            if node.is_leaf() {
                if (node.category_bits & mask_bits) != 0 {
                    if !callback(index, node.user_data) {
                        return;
                    }
                }
            } else {
                stack.push(node.child1);
                stack.push(node.child2);
            }
        }
    }

    /// Validation helper for tests: recomputes heights/bounds and checks
    /// parent links.
    #[cfg(test)]
    fn validate_subtree(&self, index: i32) -> (i32, Aabb) {
        let node = &self.nodes[index as usize];
        if node.is_leaf() {
            assert_eq!(node.height, 0);
            return (0, node.aabb);
        }
        assert_eq!(self.nodes[node.child1 as usize].parent, index);
        assert_eq!(self.nodes[node.child2 as usize].parent, index);
        let (h1, b1) = self.validate_subtree(node.child1);
        let (h2, b2) = self.validate_subtree(node.child2);
        let height = 1 + h1.max(h2);
        assert_eq!(node.height, height);
        let bounds = Aabb::union(b1, b2);
        assert_eq!(node.aabb, bounds);
        (height, bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_box(x: f32, y: f32) -> Aabb {
        Aabb::new(Vec2::new(x, y), Vec2::new(x + 1.0, y + 1.0))
    }

    #[test]
    fn insert_query_remove() {
        let mut tree = DynamicTree::new();
        let mut ids = Vec::new();
        for i in 0..64 {
            let x = (i % 8) as f32 * 3.0;
            let y = (i / 8) as f32 * 3.0;
            ids.push(tree.create_proxy(leaf_box(x, y), 1, i as u64));
        }
        if tree.root != NULL_INDEX {
            tree.validate_subtree(tree.root);
        }

        // Query a window covering the 2x2 block at origin.
        let mut found = Vec::new();
        tree.query(
            Aabb::new(Vec2::new(-0.5, -0.5), Vec2::new(3.5, 3.5)),
            u64::MAX,
            &mut |_, user_data| {
                found.push(user_data);
                true
            },
        );
        found.sort_unstable();
        assert_eq!(found, vec![0, 1, 8, 9]);

        for id in ids {
            tree.destroy_proxy(id);
        }
        assert_eq!(tree.proxy_count(), 0);
        assert_eq!(tree.root, NULL_INDEX);
    }

    #[test]
    fn mask_bits_filter_hits() {
        let mut tree = DynamicTree::new();
        tree.create_proxy(leaf_box(0.0, 0.0), 0b01, 7);
        tree.create_proxy(leaf_box(0.2, 0.2), 0b10, 8);
        let mut found = Vec::new();
        tree.query(
            Aabb::new(Vec2::new(-1.0, -1.0), Vec2::new(2.0, 2.0)),
            0b10,
            &mut |_, user_data| {
                found.push(user_data);
                true
            },
        );
        assert_eq!(found, vec![8]);
    }

    #[test]
    fn enlarge_grows_ancestors() {
        let mut tree = DynamicTree::new();
        let a = tree.create_proxy(leaf_box(0.0, 0.0), 1, 1);
        let _b = tree.create_proxy(leaf_box(5.0, 0.0), 1, 2);
        let _c = tree.create_proxy(leaf_box(10.0, 0.0), 1, 3);

        let grown = Aabb::new(Vec2::new(-4.0, -4.0), Vec2::new(1.0, 1.0));
        tree.enlarge_proxy(a, grown);

        let mut found = Vec::new();
        tree.query(
            Aabb::new(Vec2::new(-3.5, -3.5), Vec2::new(-3.0, -3.0)),
            u64::MAX,
            &mut |_, user_data| {
                found.push(user_data);
                true
            },
        );
        assert_eq!(found, vec![1]);
    }
}
