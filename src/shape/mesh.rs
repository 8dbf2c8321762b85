//! Triangle-mesh data sources consumed by the BVH builder, refitter, and queries.

use crate::bounding_volume::{Aabb, BoundingVolume};
use crate::math::{Point, Real};
use crate::shape::Triangle;

/// The address of one triangle inside a multi-part triangle mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TriangleId {
    /// The index of the mesh part containing the triangle.
    pub part_id: u32,
    /// The index of the triangle inside its part.
    pub triangle_index: u32,
}

impl TriangleId {
    /// Creates a new triangle address.
    #[inline]
    pub fn new(part_id: u32, triangle_index: u32) -> Self {
        Self {
            part_id,
            triangle_index,
        }
    }
}

/// A read-only source of triangle data, organized in one or more parts.
///
/// This is the interface the BVH consumes when building or refitting. Vertices returned through
/// it must already be in the mesh's local space, with any mesh scaling applied.
pub trait TriangleMesh {
    /// Read-only accessor for the triangles of one part.
    ///
    /// Fetching a part may be costly (the accessor typically locks or resolves the part's
    /// vertex and index buffers); batch consecutive lookups of the same part through a single
    /// accessor whenever possible.
    type Part<'a>: TriangleMeshPart
    where
        Self: 'a;

    /// The number of parts in this mesh.
    fn part_count(&self) -> u32;

    /// The accessor for the `part_id`-th part.
    ///
    /// Panics if `part_id` is out of bounds.
    fn part(&self, part_id: u32) -> Self::Part<'_>;

    /// The total number of triangles across all parts.
    fn triangle_count(&self) -> u32 {
        (0..self.part_count())
            .map(|part_id| self.part(part_id).triangle_count())
            .sum()
    }

    /// Enumerates every triangle of every part exactly once, in a deterministic order.
    fn for_each_triangle(&self, mut f: impl FnMut(TriangleId, &Triangle)) {
        for part_id in 0..self.part_count() {
            let part = self.part(part_id);

            for triangle_index in 0..part.triangle_count() {
                let triangle = part.triangle(triangle_index);
                f(TriangleId::new(part_id, triangle_index), &triangle);
            }
        }
    }

    /// The AABB of this mesh, computed by brute force over every triangle.
    fn local_aabb(&self) -> Aabb {
        let mut aabb = Aabb::new_invalid();
        self.for_each_triangle(|_, triangle| aabb.merge(&triangle.local_aabb()));
        aabb
    }
}

/// Read-only triangle accessor for a single part of a [`TriangleMesh`].
pub trait TriangleMeshPart {
    /// The number of triangles in this part.
    fn triangle_count(&self) -> u32;

    /// The `triangle_index`-th triangle of this part.
    ///
    /// Panics if `triangle_index` is out of bounds.
    fn triangle(&self, triangle_index: u32) -> Triangle;
}

/// One part of an [`IndexedMesh`]: a vertex buffer and a `[u32; 3]` index buffer.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct IndexedMeshPart {
    /// The vertex buffer of this part.
    pub vertices: Vec<Point<Real>>,
    /// The index buffer of this part, one entry per triangle.
    pub indices: Vec<[u32; 3]>,
}

impl IndexedMeshPart {
    /// Creates a part from a vertex buffer and an index buffer.
    pub fn new(vertices: Vec<Point<Real>>, indices: Vec<[u32; 3]>) -> Self {
        Self { vertices, indices }
    }
}

impl TriangleMeshPart for &IndexedMeshPart {
    #[inline]
    fn triangle_count(&self) -> u32 {
        self.indices.len() as u32
    }

    #[inline]
    fn triangle(&self, triangle_index: u32) -> Triangle {
        let idx = self.indices[triangle_index as usize];
        Triangle::new(
            self.vertices[idx[0] as usize],
            self.vertices[idx[1] as usize],
            self.vertices[idx[2] as usize],
        )
    }
}

/// A triangle mesh backed by in-memory vertex and index buffers.
///
/// This is the simplest [`TriangleMesh`] implementation. Meshes with a single part can be built
/// with [`IndexedMesh::with_single_part`].
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct IndexedMesh {
    parts: Vec<IndexedMeshPart>,
}

impl IndexedMesh {
    /// Creates a mesh from its parts.
    pub fn new(parts: Vec<IndexedMeshPart>) -> Self {
        Self { parts }
    }

    /// Creates a single-part mesh from a vertex buffer and an index buffer.
    pub fn with_single_part(vertices: Vec<Point<Real>>, indices: Vec<[u32; 3]>) -> Self {
        Self {
            parts: vec![IndexedMeshPart::new(vertices, indices)],
        }
    }

    /// The parts of this mesh.
    pub fn parts(&self) -> &[IndexedMeshPart] {
        &self.parts
    }

    /// Mutable access to the parts of this mesh.
    ///
    /// Vertex mutations invalidate any BVH built from this mesh until it is refit.
    pub fn parts_mut(&mut self) -> &mut [IndexedMeshPart] {
        &mut self.parts
    }
}

impl TriangleMesh for IndexedMesh {
    type Part<'a> = &'a IndexedMeshPart;

    #[inline]
    fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    #[inline]
    fn part(&self, part_id: u32) -> &IndexedMeshPart {
        &self.parts[part_id as usize]
    }
}
