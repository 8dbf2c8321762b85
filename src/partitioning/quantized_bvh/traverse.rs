use super::{QuantizedBvh, TraversalMode, TraversalStats};
use crate::bounding_volume::Aabb;
use crate::math::{Real, Vector};
use crate::query::Ray;
use crate::shape::TriangleId;

/// A ray (or box) cast prepared for tree traversal.
///
/// `quantized_aabb_min/max` is the cast's enclosing box, used as a cheap quantized prune
/// before the exact slab test on a node's unquantized bounds.
struct PreparedCast {
    ray: Ray,
    half_extents: Vector<Real>,
    quantized_aabb_min: [u16; 3],
    quantized_aabb_max: [u16; 3],
}

impl QuantizedBvh {
    /// Invokes `visitor` with the id of every leaf triangle whose AABB intersects `aabb`.
    ///
    /// The query box is quantized with the tree's own mapping (out-of-domain queries clamp,
    /// so a box fully outside the domain degenerates to a boundary slab). An inverted
    /// (empty) box matches nothing.
    pub fn intersect_aabb(
        &self,
        aabb: &Aabb,
        mut visitor: impl FnMut(TriangleId),
    ) -> TraversalStats {
        let mut stats = TraversalStats::default();

        if self.nodes.is_empty() {
            return stats;
        }

        let quantized_query_min = self.quantization.quantize_with_clamp(&aabb.mins);
        let quantized_query_max = self.quantization.quantize_with_clamp(&aabb.maxs);

        match self.traversal_mode {
            TraversalMode::Stackless => self.walk_stackless_tree(
                quantized_query_min,
                quantized_query_max,
                0,
                self.nodes.len(),
                &mut visitor,
                &mut stats,
            ),
            TraversalMode::Recursive => self.walk_recursive_tree(
                0,
                quantized_query_min,
                quantized_query_max,
                &mut visitor,
                &mut stats,
            ),
        }

        stats
    }

    /// Invokes `visitor` with the id of every leaf whose AABB is touched by the segment going
    /// from `ray.origin` to `ray.origin + ray.dir`.
    ///
    /// Leaves are tested with an exact slab test against their unquantized (conservative)
    /// bounds, after a cheap quantized test against the segment's enclosing box.
    pub fn cast_ray(&self, ray: &Ray, visitor: impl FnMut(TriangleId)) -> TraversalStats {
        self.cast_box(ray, &Vector::zeros(), visitor)
    }

    /// Invokes `visitor` with the id of every leaf whose AABB is touched by a box of the given
    /// half-extents swept from `ray.origin` to `ray.origin + ray.dir`.
    ///
    /// The moving box is treated as an enlarged ray: every node AABB is expanded by
    /// `half_extents` before the slab test.
    pub fn cast_box(
        &self,
        ray: &Ray,
        half_extents: &Vector<Real>,
        mut visitor: impl FnMut(TriangleId),
    ) -> TraversalStats {
        let mut stats = TraversalStats::default();

        if self.nodes.is_empty() {
            return stats;
        }

        // Quick pruning by quantized box: the whole cast fits in the segment's AABB grown by
        // the cast extents.
        let target = ray.origin + ray.dir;
        let mut cast_aabb = Aabb::new(ray.origin.inf(&target), ray.origin.sup(&target));
        cast_aabb.mins -= *half_extents;
        cast_aabb.maxs += *half_extents;

        let cast = PreparedCast {
            ray: *ray,
            half_extents: *half_extents,
            quantized_aabb_min: self.quantization.quantize_with_clamp(&cast_aabb.mins),
            quantized_aabb_max: self.quantization.quantize_with_clamp(&cast_aabb.maxs),
        };

        match self.traversal_mode {
            TraversalMode::Stackless => self.walk_stackless_tree_against_ray(
                &cast,
                0,
                self.nodes.len(),
                &mut visitor,
                &mut stats,
            ),
            TraversalMode::Recursive => {
                self.walk_recursive_tree_against_ray(0, &cast, &mut visitor, &mut stats)
            }
        }

        stats
    }

    /// Escape-index-driven walk of the node range `[start_node_index, end_node_index)`.
    ///
    /// Advances one slot past any overlapping or leaf node, and jumps over a whole subtree
    /// otherwise; no auxiliary memory is needed.
    fn walk_stackless_tree(
        &self,
        quantized_query_min: [u16; 3],
        quantized_query_max: [u16; 3],
        start_node_index: usize,
        end_node_index: usize,
        visitor: &mut impl FnMut(TriangleId),
        stats: &mut TraversalStats,
    ) {
        let subtree_size = end_node_index - start_node_index;
        let mut cur_index = start_node_index;
        let mut walk_iterations = 0;

        while cur_index < end_node_index {
            // Catch bugs in tree data.
            debug_assert!(walk_iterations < subtree_size);
            walk_iterations += 1;

            let node = &self.nodes[cur_index];
            let aabb_overlap =
                node.intersects_quantized_aabb(quantized_query_min, quantized_query_max);
            let is_leaf_node = node.is_leaf();

            if is_leaf_node && aabb_overlap {
                stats.leaves_visited += 1;
                visitor(node.triangle_id());
            }

            if aabb_overlap || is_leaf_node {
                cur_index += 1;
            } else {
                cur_index += node.escape_index() as usize;
            }
        }

        stats.nodes_visited += walk_iterations as u32;
    }

    /// Preorder recursive walk; reference implementation of [`Self::walk_stackless_tree`].
    fn walk_recursive_tree(
        &self,
        cur_node_index: usize,
        quantized_query_min: [u16; 3],
        quantized_query_max: [u16; 3],
        visitor: &mut impl FnMut(TriangleId),
        stats: &mut TraversalStats,
    ) {
        let node = &self.nodes[cur_node_index];
        stats.nodes_visited += 1;

        if !node.intersects_quantized_aabb(quantized_query_min, quantized_query_max) {
            return;
        }

        if node.is_leaf() {
            stats.leaves_visited += 1;
            visitor(node.triangle_id());
        } else {
            let left_child_index = cur_node_index + 1;
            self.walk_recursive_tree(
                left_child_index,
                quantized_query_min,
                quantized_query_max,
                visitor,
                stats,
            );

            let right_child_index = left_child_index + self.subtree_size(left_child_index);
            self.walk_recursive_tree(
                right_child_index,
                quantized_query_min,
                quantized_query_max,
                visitor,
                stats,
            );
        }
    }

    /// The cast test applied to every node: quantized box-box prune, then the exact slab test
    /// on the node's unquantized bounds expanded by the cast extents.
    fn cast_overlaps_node(&self, node_index: usize, cast: &PreparedCast) -> bool {
        let node = &self.nodes[node_index];

        if !node.intersects_quantized_aabb(cast.quantized_aabb_min, cast.quantized_aabb_max) {
            return false;
        }

        let bounds = Aabb::new(
            self.quantization.unquantize(&node.quantized_aabb_min) - cast.half_extents,
            self.quantization.unquantize(&node.quantized_aabb_max) + cast.half_extents,
        );

        bounds.intersects_local_ray(&cast.ray, 1.0)
    }

    /// Escape-index-driven walk visiting every leaf touched by the cast.
    fn walk_stackless_tree_against_ray(
        &self,
        cast: &PreparedCast,
        start_node_index: usize,
        end_node_index: usize,
        visitor: &mut impl FnMut(TriangleId),
        stats: &mut TraversalStats,
    ) {
        let subtree_size = end_node_index - start_node_index;
        let mut cur_index = start_node_index;
        let mut walk_iterations = 0;

        while cur_index < end_node_index {
            // Catch bugs in tree data.
            debug_assert!(walk_iterations < subtree_size);
            walk_iterations += 1;

            let node = &self.nodes[cur_index];
            let ray_box_overlap = self.cast_overlaps_node(cur_index, cast);
            let is_leaf_node = node.is_leaf();

            if is_leaf_node && ray_box_overlap {
                stats.leaves_visited += 1;
                visitor(node.triangle_id());
            }

            if ray_box_overlap || is_leaf_node {
                cur_index += 1;
            } else {
                cur_index += node.escape_index() as usize;
            }
        }

        stats.nodes_visited += walk_iterations as u32;
    }

    /// Preorder recursive walk; visits the same leaves as
    /// [`Self::walk_stackless_tree_against_ray`].
    fn walk_recursive_tree_against_ray(
        &self,
        cur_node_index: usize,
        cast: &PreparedCast,
        visitor: &mut impl FnMut(TriangleId),
        stats: &mut TraversalStats,
    ) {
        stats.nodes_visited += 1;

        if !self.cast_overlaps_node(cur_node_index, cast) {
            return;
        }

        let node = &self.nodes[cur_node_index];

        if node.is_leaf() {
            stats.leaves_visited += 1;
            visitor(node.triangle_id());
        } else {
            let left_child_index = cur_node_index + 1;
            self.walk_recursive_tree_against_ray(left_child_index, cast, visitor, stats);

            let right_child_index = left_child_index + self.subtree_size(left_child_index);
            self.walk_recursive_tree_against_ray(right_child_index, cast, visitor, stats);
        }
    }
}
