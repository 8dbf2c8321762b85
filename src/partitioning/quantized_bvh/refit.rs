use super::{Quantization, QuantizedBvh};
use crate::shape::{TriangleMesh, TriangleMeshPart};

impl QuantizedBvh {
    /// Re-derives every node AABB from the mesh's current vertices, without changing the tree
    /// topology.
    ///
    /// Use this after moving vertices of a mesh whose connectivity is unchanged; a scale
    /// change beyond a small epsilon warrants a full rebuild instead. The quantization domain
    /// is re-derived from the mesh's current AABB (with the same margin as the build), and
    /// all subtree headers are refreshed.
    ///
    /// The resulting root AABB bounds the mesh (up to one quantization step of rounding);
    /// repeated refits never shrink the stored bounds below the true geometry.
    pub fn refit(&mut self, mesh: &impl TriangleMesh) {
        if self.nodes.is_empty() {
            return;
        }

        let margin = self.quantization.margin();
        self.quantization = Quantization::with_margin(&mesh.local_aabb(), margin);

        self.update_nodes(mesh, 0, self.nodes.len());

        for header in &mut self.subtree_headers {
            header.set_aabb_from_node(&self.nodes[header.root_node_index() as usize]);
        }

        log::debug!(
            "refit quantized BVH: {} nodes, {} subtree headers",
            self.nodes.len(),
            self.subtree_headers.len()
        );
    }

    /// Recomputes the AABBs of the node range `[first_node_index, end_node_index)` bottom-up.
    ///
    /// The pass is strictly descending in index: children always have higher indices than
    /// their parent, so an internal node unions two already-updated children. Leaves are
    /// re-quantized from the mesh's current triangle vertices; the part accessor is
    /// re-fetched only when the leaf's part id changes.
    fn update_nodes<M: TriangleMesh>(
        &mut self,
        mesh: &M,
        first_node_index: usize,
        end_node_index: usize,
    ) {
        let mut cached_part: Option<(u32, M::Part<'_>)> = None;

        for i in (first_node_index..end_node_index).rev() {
            if self.nodes[i].is_leaf() {
                let triangle_id = self.nodes[i].triangle_id();

                let cached = cached_part
                    .get_or_insert_with(|| (triangle_id.part_id, mesh.part(triangle_id.part_id)));
                if cached.0 != triangle_id.part_id {
                    *cached = (triangle_id.part_id, mesh.part(triangle_id.part_id));
                }

                let aabb = cached.1.triangle(triangle_id.triangle_index).local_aabb();

                let node = &mut self.nodes[i];
                node.quantized_aabb_min = self.quantization.quantize_with_clamp(&aabb.mins);
                node.quantized_aabb_max = self.quantization.quantize_with_clamp(&aabb.maxs);
            } else {
                // Combine the AABBs of both children.
                let left_child_index = i + 1;
                let right_child_index = left_child_index + self.subtree_size(left_child_index);

                let left = self.nodes[left_child_index];
                let right = self.nodes[right_child_index];

                let node = &mut self.nodes[i];
                for k in 0..3 {
                    node.quantized_aabb_min[k] =
                        left.quantized_aabb_min[k].min(right.quantized_aabb_min[k]);
                    node.quantized_aabb_max[k] =
                        left.quantized_aabb_max[k].max(right.quantized_aabb_max[k]);
                }
            }
        }
    }
}
