use super::{
    BvhSubtreeInfo, Quantization, QuantizedBvh, QuantizedBvhNode, TraversalMode,
    DEFAULT_QUANTIZATION_MARGIN, MAX_PART_COUNT, MAX_SUBTREE_SIZE_IN_BYTES,
    MAX_TRIANGLES_PER_PART,
};
use crate::bounding_volume::Aabb;
use crate::math::{Point, Real, Vector, DIM};
use crate::shape::{TriangleMesh, TriangleMeshPart};

/// Error indicating that a mesh cannot be indexed by a [`QuantizedBvh`].
#[derive(thiserror::Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum QuantizedBvhBuildError {
    /// The mesh has more non-empty parts than a leaf node can reference.
    #[error("the mesh has {part_count} parts, but a leaf node can only reference {max} parts.")]
    TooManyParts {
        /// The number of parts of the rejected mesh.
        part_count: u32,
        /// The maximum number of parts a leaf node can reference.
        max: u32,
    },
    /// One mesh part has more triangles than a leaf node can reference.
    #[error("part {part_id} has {triangle_count} triangles, but a leaf node can only reference {max} triangles per part.")]
    TooManyTriangles {
        /// The part exceeding the limit.
        part_id: u32,
        /// The number of triangles of that part.
        triangle_count: u32,
        /// The maximum number of triangles per part a leaf node can reference.
        max: u32,
    },
}

// Leaf AABBs flatter than this on any axis are thickened before quantization, so no leaf
// collapses to a zero-extent box.
const MIN_AABB_EXTENT: Real = 0.002;
const MIN_AABB_HALF_EXTENT: Real = 0.001;

fn expand_degenerate_aabb(mut aabb: Aabb) -> Aabb {
    for i in 0..DIM {
        if aabb.maxs[i] - aabb.mins[i] < MIN_AABB_EXTENT {
            aabb.mins[i] -= MIN_AABB_HALF_EXTENT;
            aabb.maxs[i] += MIN_AABB_HALF_EXTENT;
        }
    }

    aabb
}

impl QuantizedBvh {
    /// Builds the tree indexing every triangle of `mesh`.
    ///
    /// `domain` is the quantization domain: all indexed geometry should lie inside it
    /// (anything outside is clamped onto its boundary). It is enlarged by
    /// [`DEFAULT_QUANTIZATION_MARGIN`] on every side.
    pub fn build(
        mesh: &impl TriangleMesh,
        domain: &Aabb,
    ) -> Result<Self, QuantizedBvhBuildError> {
        Self::build_with_margin(mesh, domain, DEFAULT_QUANTIZATION_MARGIN)
    }

    /// Builds the tree indexing every triangle of `mesh`, with an explicit domain margin.
    pub fn build_with_margin(
        mesh: &impl TriangleMesh,
        domain: &Aabb,
        margin: Real,
    ) -> Result<Self, QuantizedBvhBuildError> {
        for part_id in 0..mesh.part_count() {
            let triangle_count = mesh.part(part_id).triangle_count();

            if triangle_count == 0 {
                continue;
            }

            if part_id >= MAX_PART_COUNT {
                return Err(QuantizedBvhBuildError::TooManyParts {
                    part_count: mesh.part_count(),
                    max: MAX_PART_COUNT,
                });
            }

            if triangle_count > MAX_TRIANGLES_PER_PART {
                return Err(QuantizedBvhBuildError::TooManyTriangles {
                    part_id,
                    triangle_count,
                    max: MAX_TRIANGLES_PER_PART,
                });
            }
        }

        let quantization = Quantization::with_margin(domain, margin);

        let mut leaf_nodes = Vec::with_capacity(mesh.triangle_count() as usize);
        mesh.for_each_triangle(|triangle_id, triangle| {
            let aabb = expand_degenerate_aabb(triangle.local_aabb());
            leaf_nodes.push(QuantizedBvhNode::new_leaf(
                quantization.quantize_with_clamp(&aabb.mins),
                quantization.quantize_with_clamp(&aabb.maxs),
                triangle_id,
            ));
        });

        let num_leaf_nodes = leaf_nodes.len();
        let num_nodes = num_leaf_nodes.saturating_mul(2).saturating_sub(1);

        let mut builder = BvhTreeBuilder {
            quantization,
            leaf_nodes,
            nodes: vec![QuantizedBvhNode::invalid(); num_nodes],
            subtree_headers: Vec::new(),
            cur_node_index: 0,
        };

        if num_leaf_nodes > 0 {
            builder.build_tree(0, num_leaf_nodes);
            debug_assert_eq!(builder.cur_node_index, builder.nodes.len());

            // If the entire tree fits in a single chunk, record one header for the root.
            if builder.subtree_headers.is_empty() {
                let subtree_size = builder.subtree_size(0);
                builder.subtree_headers.push(BvhSubtreeInfo::from_node(
                    &builder.nodes[0],
                    0,
                    subtree_size as u32,
                ));
            }
        }

        log::debug!(
            "built quantized BVH: {} leaves, {} nodes, {} subtree headers",
            num_leaf_nodes,
            builder.nodes.len(),
            builder.subtree_headers.len()
        );

        Ok(QuantizedBvh {
            quantization,
            nodes: builder.nodes,
            subtree_headers: builder.subtree_headers,
            traversal_mode: TraversalMode::default(),
        })
    }
}

/// Transient state of one tree construction.
///
/// `leaf_nodes` is the scratch array of not-yet-placed leaves, reordered in place by the
/// partitioning step; `nodes` is the final preorder store, filled left to right as recursion
/// proceeds.
struct BvhTreeBuilder {
    quantization: Quantization,
    leaf_nodes: Vec<QuantizedBvhNode>,
    nodes: Vec<QuantizedBvhNode>,
    subtree_headers: Vec<BvhSubtreeInfo>,
    cur_node_index: usize,
}

impl BvhTreeBuilder {
    /// Recursively builds the subtree indexing the leaves in `[start_index, end_index)`.
    ///
    /// The split axis is the axis of maximum variance of the leaf AABB centers; leaves whose
    /// center exceeds the mean on that axis are partitioned to the front. Partitions falling
    /// in the outer third of the range are discarded for a midpoint split, which keeps the
    /// recursion depth in `O(log n)` even when every center coincides.
    fn build_tree(&mut self, start_index: usize, end_index: usize) {
        let num_indices = end_index - start_index;
        let cur_index = self.cur_node_index;

        assert!(num_indices > 0);

        if num_indices == 1 {
            self.nodes[self.cur_node_index] = self.leaf_nodes[start_index];
            self.cur_node_index += 1;
            return;
        }

        let split_axis = self.calc_splitting_axis(start_index, end_index);
        let split_index = self.sort_and_calc_splitting_index(start_index, end_index, split_axis);

        let internal_node_index = self.cur_node_index;

        {
            let node = &mut self.nodes[internal_node_index];
            node.quantized_aabb_min = [u16::MAX; 3];
            node.quantized_aabb_max = [0; 3];
        }

        for i in start_index..end_index {
            self.merge_internal_node_aabb(internal_node_index, i);
        }

        self.cur_node_index += 1;

        let left_child_index = self.cur_node_index;
        self.build_tree(start_index, split_index);

        let right_child_index = self.cur_node_index;
        self.build_tree(split_index, end_index);

        let escape_index = self.cur_node_index - cur_index;

        let subtree_size_in_bytes = escape_index * size_of::<QuantizedBvhNode>();
        if subtree_size_in_bytes > MAX_SUBTREE_SIZE_IN_BYTES {
            self.update_subtree_headers(left_child_index, right_child_index);
        }

        self.nodes[internal_node_index].set_escape_index(escape_index);
    }

    /// The axis with the greatest variance of leaf AABB centers over the range.
    ///
    /// Ties resolve to the first axis reaching the maximum.
    fn calc_splitting_axis(&self, start_index: usize, end_index: usize) -> usize {
        let num_indices = (end_index - start_index) as Real;

        let mut means = Vector::zeros();
        for i in start_index..end_index {
            means += self.leaf_center(i).coords;
        }
        means /= num_indices;

        let mut variance = Vector::zeros();
        for i in start_index..end_index {
            let diff = self.leaf_center(i).coords - means;
            variance += diff.component_mul(&diff);
        }
        variance /= num_indices - 1.0;

        variance.imax()
    }

    /// Partitions the leaves of the range in place and returns the split position.
    fn sort_and_calc_splitting_index(
        &mut self,
        start_index: usize,
        end_index: usize,
        split_axis: usize,
    ) -> usize {
        let num_indices = end_index - start_index;
        let mut split_index = start_index;

        let mut means = Vector::zeros();
        for i in start_index..end_index {
            means += self.leaf_center(i).coords;
        }
        means /= num_indices as Real;

        let split_value = means[split_axis];

        // Sort the range so all leaves whose center exceeds `split_value` come first.
        for i in start_index..end_index {
            if self.leaf_center(i)[split_axis] > split_value {
                self.leaf_nodes.swap(i, split_index);
                split_index += 1;
            }
        }

        // If the split falls in the outer third of the range on either side, use the midpoint
        // instead; unbalanced partitions can otherwise make the recursion depth linear.
        let range_balanced_indices = num_indices / 3;
        let unbalanced = split_index <= start_index + range_balanced_indices
            || split_index >= end_index - 1 - range_balanced_indices;

        if unbalanced {
            split_index = start_index + (num_indices >> 1);
        }

        assert!(
            split_index != start_index && split_index != end_index,
            "internal error: the splitting index must strictly partition the leaf range."
        );

        split_index
    }

    /// The world-space center of the `leaf_index`-th leaf AABB.
    fn leaf_center(&self, leaf_index: usize) -> Point<Real> {
        let node = &self.leaf_nodes[leaf_index];
        na::center(
            &self.quantization.unquantize(&node.quantized_aabb_min),
            &self.quantization.unquantize(&node.quantized_aabb_max),
        )
    }

    /// Grows the AABB of the internal node being emitted with one leaf's AABB.
    fn merge_internal_node_aabb(&mut self, node_index: usize, leaf_index: usize) {
        let leaf = self.leaf_nodes[leaf_index];
        let node = &mut self.nodes[node_index];

        for i in 0..3 {
            node.quantized_aabb_min[i] = node.quantized_aabb_min[i].min(leaf.quantized_aabb_min[i]);
            node.quantized_aabb_max[i] = node.quantized_aabb_max[i].max(leaf.quantized_aabb_max[i]);
        }
    }

    /// The number of slots occupied by the already-emitted subtree rooted at `node_index`.
    fn subtree_size(&self, node_index: usize) -> usize {
        let node = &self.nodes[node_index];

        if node.is_leaf() {
            1
        } else {
            node.escape_index() as usize
        }
    }

    /// Records a chunk header for each child whose own subtree fits in the byte budget.
    ///
    /// Called on every internal node whose subtree exceeds the budget, right after both its
    /// children are fully emitted; over-budget children already recorded headers for their own
    /// children deeper in the recursion.
    fn update_subtree_headers(&mut self, left_child_index: usize, right_child_index: usize) {
        for child_index in [left_child_index, right_child_index] {
            let subtree_size = self.subtree_size(child_index);
            let subtree_size_in_bytes = subtree_size * size_of::<QuantizedBvhNode>();

            if subtree_size_in_bytes <= MAX_SUBTREE_SIZE_IN_BYTES {
                self.subtree_headers.push(BvhSubtreeInfo::from_node(
                    &self.nodes[child_index],
                    child_index as u32,
                    subtree_size as u32,
                ));
            }
        }
    }
}
