use crate::bounding_volume::Aabb;
use crate::math::{Point, Real, Vector, DIM};
use crate::shape::TriangleId;

/// The margin added on every side of the quantization domain.
///
/// The domain is always strictly larger than the AABB it was created from, so the per-axis
/// scale factor `65535 / extent` never divides by zero.
pub const DEFAULT_QUANTIZATION_MARGIN: Real = 1.0;

/// The serialized-size budget of one subtree chunk, in bytes.
///
/// Subtrees larger than this get [`BvhSubtreeInfo`] headers recorded for their children.
/// At 16 bytes per node this is 128 nodes.
pub const MAX_SUBTREE_SIZE_IN_BYTES: usize = 2048;

// 10 bits give the potential for 1024 parts, with at most 2^21 triangles each
// (the sign bit of the packed field is reserved for the internal-node discriminant).
const PART_ID_BITS: u32 = 10;
const TRIANGLE_INDEX_BITS: u32 = 31 - PART_ID_BITS;

/// The maximum number of mesh parts a leaf node can reference.
pub const MAX_PART_COUNT: u32 = 1 << PART_ID_BITS;

/// The maximum number of triangles per mesh part a leaf node can reference.
pub const MAX_TRIANGLES_PER_PART: u32 = 1 << TRIANGLE_INDEX_BITS;

/// Mapping between world-space points of a fixed domain and 16-bit quantized coordinates.
///
/// Every quantized coordinate lies in `[0, 65535]`; points outside the domain are clamped onto
/// its boundary before quantization.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Quantization {
    aabb_min: Point<Real>,
    aabb_max: Point<Real>,
    quantization: Vector<Real>,
    margin: Real,
}

impl Quantization {
    /// Creates the quantization mapping for `domain`, enlarged by
    /// [`DEFAULT_QUANTIZATION_MARGIN`] on every side.
    pub fn new(domain: &Aabb) -> Self {
        Self::with_margin(domain, DEFAULT_QUANTIZATION_MARGIN)
    }

    /// Creates the quantization mapping for `domain` enlarged by `margin` on every side.
    pub fn with_margin(domain: &Aabb, margin: Real) -> Self {
        let clamp_value = Vector::repeat(margin);
        let aabb_min = domain.mins - clamp_value;
        let aabb_max = domain.maxs + clamp_value;
        let aabb_size = aabb_max - aabb_min;
        let quantization = Vector::repeat(65_535.0).component_div(&aabb_size);

        Self {
            aabb_min,
            aabb_max,
            quantization,
            margin,
        }
    }

    /// The domain covered by this mapping (margin included).
    #[inline]
    pub fn domain(&self) -> Aabb {
        Aabb::new(self.aabb_min, self.aabb_max)
    }

    /// The margin this mapping was created with.
    #[inline]
    pub fn margin(&self) -> Real {
        self.margin
    }

    /// The world-space size of one quantization step along each axis.
    #[inline]
    pub fn step(&self) -> Vector<Real> {
        Vector::repeat(1.0).component_div(&self.quantization)
    }

    /// Quantizes a point, clamping it onto the domain first.
    #[inline]
    pub fn quantize_with_clamp(&self, point: &Point<Real>) -> [u16; 3] {
        let mut out = [0; 3];

        for i in 0..DIM {
            let clamped = point[i].clamp(self.aabb_min[i], self.aabb_max[i]);
            let v = (clamped - self.aabb_min[i]) * self.quantization[i];
            out[i] = (v + 0.5) as u16;
        }

        out
    }

    /// Maps quantized coordinates back to world space.
    ///
    /// This is the exact inverse of the affine map applied by
    /// [`Self::quantize_with_clamp`]; the only loss is the initial rounding, so the result
    /// lies within one quantization step of the original in-domain point.
    #[inline]
    pub fn unquantize(&self, quantized: &[u16; 3]) -> Point<Real> {
        let mut out = self.aabb_min;

        for i in 0..DIM {
            out[i] += quantized[i] as Real / self.quantization[i];
        }

        out
    }
}

/// One 16-byte node of a [`QuantizedBvh`].
///
/// A node is either a *leaf* referencing a single mesh triangle, or an *internal* node
/// describing a whole subtree. Both variants share the same quantized AABB fields; the
/// remaining 32-bit field discriminates them by sign and is only accessible through typed
/// accessors:
///
/// - leaf: the field is non-negative and packs a [`TriangleId`];
/// - internal: the field is negative and its magnitude is the *escape index*, the number of
///   array slots (itself included) occupied by the node's subtree, so that
///   `index + escape_index` addresses the first node outside the subtree.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct QuantizedBvhNode {
    pub(super) quantized_aabb_min: [u16; 3],
    pub(super) quantized_aabb_max: [u16; 3],
    pub(super) escape_index_or_triangle_index: i32,
}

static_assertions::assert_eq_size!(QuantizedBvhNode, [u8; 16]);

impl QuantizedBvhNode {
    /// A placeholder node, overwritten during tree construction.
    #[inline]
    pub(super) fn invalid() -> Self {
        Self {
            quantized_aabb_min: [0; 3],
            quantized_aabb_max: [0; 3],
            escape_index_or_triangle_index: 0,
        }
    }

    /// Creates a leaf node from a quantized AABB and the triangle it references.
    #[inline]
    pub(super) fn new_leaf(
        quantized_aabb_min: [u16; 3],
        quantized_aabb_max: [u16; 3],
        triangle_id: TriangleId,
    ) -> Self {
        debug_assert!(triangle_id.part_id < MAX_PART_COUNT);
        debug_assert!(triangle_id.triangle_index < MAX_TRIANGLES_PER_PART);

        let packed = (triangle_id.part_id << TRIANGLE_INDEX_BITS) | triangle_id.triangle_index;

        Self {
            quantized_aabb_min,
            quantized_aabb_max,
            escape_index_or_triangle_index: packed as i32,
        }
    }

    /// Is this node a leaf?
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.escape_index_or_triangle_index >= 0
    }

    /// The triangle referenced by this leaf.
    ///
    /// Must only be called on a leaf node.
    #[inline]
    pub fn triangle_id(&self) -> TriangleId {
        debug_assert!(self.is_leaf());
        let packed = self.escape_index_or_triangle_index as u32;

        TriangleId::new(
            packed >> TRIANGLE_INDEX_BITS,
            packed & (MAX_TRIANGLES_PER_PART - 1),
        )
    }

    /// The number of array slots occupied by this node's subtree, itself included.
    ///
    /// Must only be called on an internal node.
    #[inline]
    pub fn escape_index(&self) -> u32 {
        debug_assert!(!self.is_leaf());
        self.escape_index_or_triangle_index.unsigned_abs()
    }

    #[inline]
    pub(super) fn set_escape_index(&mut self, escape_index: usize) {
        debug_assert!(escape_index > 1);
        debug_assert!(escape_index <= i32::MAX as usize);
        self.escape_index_or_triangle_index = -(escape_index as i32);
    }

    /// The quantized min corner of this node's AABB.
    #[inline]
    pub fn quantized_aabb_min(&self) -> [u16; 3] {
        self.quantized_aabb_min
    }

    /// The quantized max corner of this node's AABB.
    #[inline]
    pub fn quantized_aabb_max(&self) -> [u16; 3] {
        self.quantized_aabb_max
    }

    /// This node's AABB, unquantized back to world space.
    #[inline]
    pub fn aabb(&self, quantization: &Quantization) -> Aabb {
        Aabb::new(
            quantization.unquantize(&self.quantized_aabb_min),
            quantization.unquantize(&self.quantized_aabb_max),
        )
    }

    /// Checks if this node's quantized AABB intersects the given quantized AABB.
    #[inline]
    pub fn intersects_quantized_aabb(&self, aabb_min: [u16; 3], aabb_max: [u16; 3]) -> bool {
        let mut overlap =
            self.quantized_aabb_min[0] <= aabb_max[0] && self.quantized_aabb_max[0] >= aabb_min[0];
        overlap = self.quantized_aabb_min[2] <= aabb_max[2]
            && self.quantized_aabb_max[2] >= aabb_min[2]
            && overlap;
        overlap = self.quantized_aabb_min[1] <= aabb_max[1]
            && self.quantized_aabb_max[1] >= aabb_min[1]
            && overlap;
        overlap
    }
}

/// A snapshot describing one bounded-size subtree chunk of a [`QuantizedBvh`].
///
/// Headers cover every leaf of the tree exactly once, each chunk fitting in
/// [`MAX_SUBTREE_SIZE_IN_BYTES`] once serialized. They enable coarse-grained culling and
/// chunk-by-chunk processing by external consumers. A header is a copy, not a live reference;
/// [`QuantizedBvh::refit`] refreshes all headers after updating the nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BvhSubtreeInfo {
    quantized_aabb_min: [u16; 3],
    quantized_aabb_max: [u16; 3],
    root_node_index: u32,
    subtree_size: u32,
}

impl BvhSubtreeInfo {
    #[inline]
    pub(super) fn from_node(
        node: &QuantizedBvhNode,
        root_node_index: u32,
        subtree_size: u32,
    ) -> Self {
        Self {
            quantized_aabb_min: node.quantized_aabb_min,
            quantized_aabb_max: node.quantized_aabb_max,
            root_node_index,
            subtree_size,
        }
    }

    #[inline]
    pub(super) fn set_aabb_from_node(&mut self, node: &QuantizedBvhNode) {
        self.quantized_aabb_min = node.quantized_aabb_min;
        self.quantized_aabb_max = node.quantized_aabb_max;
    }

    /// The index of the chunk's root node in the node array.
    #[inline]
    pub fn root_node_index(&self) -> u32 {
        self.root_node_index
    }

    /// The number of nodes in the chunk, its root included.
    #[inline]
    pub fn subtree_size(&self) -> u32 {
        self.subtree_size
    }

    /// The quantized min corner of the chunk root's AABB.
    #[inline]
    pub fn quantized_aabb_min(&self) -> [u16; 3] {
        self.quantized_aabb_min
    }

    /// The quantized max corner of the chunk root's AABB.
    #[inline]
    pub fn quantized_aabb_max(&self) -> [u16; 3] {
        self.quantized_aabb_max
    }
}

/// The algorithm used to walk a [`QuantizedBvh`] during a query.
///
/// This is purely a performance/debugging switch: both strategies visit the exact same set of
/// leaves for any query.
#[derive(Default, Clone, Debug, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum TraversalMode {
    /// Escape-index-driven linear walk. Needs no auxiliary memory.
    #[default]
    Stackless,
    /// Preorder recursive descent with early rejection. Reference implementation.
    Recursive,
}

/// Counters reported by one tree traversal.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraversalStats {
    /// The number of nodes whose AABB was tested against the query.
    pub nodes_visited: u32,
    /// The number of leaves passed to the query's visitor.
    pub leaves_visited: u32,
}

/// A quantized bounding-volume-hierarchy over the triangles of a static mesh.
///
/// The tree is strictly binary and stored as a flat, preorder array of 16-byte nodes: a node's
/// left child is always the next slot, and internal nodes carry the size of their subtree so a
/// traversal can skip it with a single index jump (see [`QuantizedBvhNode`]).
///
/// # Example
///
/// ```rust
/// # #[cfg(feature = "f32")] {
/// use mesh_bvh::partitioning::QuantizedBvh;
/// use mesh_bvh::shape::{IndexedMesh, TriangleMesh};
/// use nalgebra::Point3;
///
/// let mesh = IndexedMesh::with_single_part(
///     vec![
///         Point3::new(0.0, 0.0, 0.0),
///         Point3::new(1.0, 0.0, 0.0),
///         Point3::new(0.0, 1.0, 0.0),
///     ],
///     vec![[0, 1, 2]],
/// );
///
/// let bvh = QuantizedBvh::build(&mesh, &mesh.local_aabb()).unwrap();
/// let mut hits = vec![];
/// let _ = bvh.intersect_aabb(&mesh.local_aabb(), |id| hits.push(id));
/// assert_eq!(hits.len(), 1);
/// # }
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct QuantizedBvh {
    pub(super) quantization: Quantization,
    pub(super) nodes: Vec<QuantizedBvhNode>,
    pub(super) subtree_headers: Vec<BvhSubtreeInfo>,
    pub(super) traversal_mode: TraversalMode,
}

impl QuantizedBvh {
    /// Does this tree contain no leaf at all?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The total number of nodes (leaves and internal nodes) of this tree.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The number of leaves of this tree.
    #[inline]
    pub fn leaf_count(&self) -> usize {
        // The tree is strictly binary.
        self.nodes.len().div_ceil(2)
    }

    /// The raw nodes of this tree, in preorder; the first element is the root.
    ///
    /// The higher-level traversal methods should be preferred over walking this directly.
    #[inline]
    pub fn raw_nodes(&self) -> &[QuantizedBvhNode] {
        &self.nodes
    }

    /// The subtree chunk headers recorded while building this tree.
    #[inline]
    pub fn subtree_headers(&self) -> &[BvhSubtreeInfo] {
        &self.subtree_headers
    }

    /// The quantization mapping of this tree.
    #[inline]
    pub fn quantization(&self) -> &Quantization {
        &self.quantization
    }

    /// The traversal strategy used by queries.
    #[inline]
    pub fn traversal_mode(&self) -> TraversalMode {
        self.traversal_mode
    }

    /// Selects the traversal strategy used by queries.
    ///
    /// Both strategies produce identical query results.
    #[inline]
    pub fn set_traversal_mode(&mut self, mode: TraversalMode) {
        self.traversal_mode = mode;
    }

    /// The AABB bounding everything contained by this tree.
    ///
    /// The corners are exact up to one quantization step (stored coordinates round to the
    /// nearest step); clamped geometry never escapes the quantization domain.
    pub fn root_aabb(&self) -> Aabb {
        if let Some(root) = self.nodes.first() {
            root.aabb(&self.quantization)
        } else {
            Aabb::new_invalid()
        }
    }

    /// The number of slots occupied by the subtree rooted at `node_index`.
    #[inline]
    pub(super) fn subtree_size(&self, node_index: usize) -> usize {
        let node = &self.nodes[node_index];

        if node.is_leaf() {
            1
        } else {
            node.escape_index() as usize
        }
    }
}
