use super::{QuantizedBvh, QuantizedBvhBuildError, TraversalMode, MAX_PART_COUNT};
use crate::bounding_volume::{Aabb, BoundingVolume};
use crate::math::{Point, Real, Vector};
use crate::query::Ray;
use crate::shape::{IndexedMesh, IndexedMeshPart, TriangleId, TriangleMesh};
use std::collections::BTreeSet;

fn rand_real(rng: &mut oorandom::Rand32) -> Real {
    rng.rand_float() as Real
}

fn rand_point_in_cube(rng: &mut oorandom::Rand32, side: Real) -> Point<Real> {
    Point::new(
        rand_real(rng) * side,
        rand_real(rng) * side,
        rand_real(rng) * side,
    )
}

/// A mesh of `len` small random triangles inside a 10×10×10 cube, spread over `part_count`
/// parts.
fn random_mesh(seed: u64, len: u32, part_count: u32) -> IndexedMesh {
    let mut rng = oorandom::Rand32::new(seed);
    let mut parts = vec![IndexedMeshPart::default(); part_count as usize];

    for i in 0..len {
        let center = rand_point_in_cube(&mut rng, 10.0);
        let part = &mut parts[(i % part_count) as usize];
        let base = part.vertices.len() as u32;

        // Offsets in [0.05, 0.3] on every axis, so no triangle AABB is ever degenerate.
        let mut rand_offset = |scale: Real| {
            Vector::new(
                rand_real(&mut rng) * 0.25 + 0.05,
                rand_real(&mut rng) * 0.25 + 0.05,
                rand_real(&mut rng) * 0.25 + 0.05,
            ) * scale
        };

        part.vertices.push(center - rand_offset(1.0));
        part.vertices.push(center + rand_offset(1.0));
        part.vertices.push(center + rand_offset(0.5));
        part.indices.push([base, base + 1, base + 2]);
    }

    IndexedMesh::new(parts)
}

fn build(mesh: &IndexedMesh) -> QuantizedBvh {
    QuantizedBvh::build(mesh, &mesh.local_aabb()).unwrap()
}

fn collect_aabb(bvh: &QuantizedBvh, mode: TraversalMode, aabb: &Aabb) -> BTreeSet<TriangleId> {
    let mut bvh = bvh.clone();
    bvh.set_traversal_mode(mode);

    let mut hits = BTreeSet::new();
    let _ = bvh.intersect_aabb(aabb, |id| {
        let _ = hits.insert(id);
    });
    hits
}

fn collect_cast(
    bvh: &QuantizedBvh,
    mode: TraversalMode,
    ray: &Ray,
    half_extents: &Vector<Real>,
) -> BTreeSet<TriangleId> {
    let mut bvh = bvh.clone();
    bvh.set_traversal_mode(mode);

    let mut hits = BTreeSet::new();
    let _ = bvh.cast_box(ray, half_extents, |id| {
        let _ = hits.insert(id);
    });
    hits
}

/// Brute-force reference: a linear scan over every leaf of the node array.
fn scan_aabb(bvh: &QuantizedBvh, aabb: &Aabb) -> BTreeSet<TriangleId> {
    let quantized_min = bvh.quantization().quantize_with_clamp(&aabb.mins);
    let quantized_max = bvh.quantization().quantize_with_clamp(&aabb.maxs);

    bvh.raw_nodes()
        .iter()
        .filter(|node| node.is_leaf())
        .filter(|node| node.intersects_quantized_aabb(quantized_min, quantized_max))
        .map(|node| node.triangle_id())
        .collect()
}

fn scan_cast(bvh: &QuantizedBvh, ray: &Ray, half_extents: &Vector<Real>) -> BTreeSet<TriangleId> {
    let target = ray.origin + ray.dir;
    let mut cast_aabb = Aabb::new(ray.origin.inf(&target), ray.origin.sup(&target));
    cast_aabb.mins -= *half_extents;
    cast_aabb.maxs += *half_extents;

    let quantized_min = bvh.quantization().quantize_with_clamp(&cast_aabb.mins);
    let quantized_max = bvh.quantization().quantize_with_clamp(&cast_aabb.maxs);

    bvh.raw_nodes()
        .iter()
        .filter(|node| node.is_leaf())
        .filter(|node| {
            if !node.intersects_quantized_aabb(quantized_min, quantized_max) {
                return false;
            }

            let bounds = Aabb::new(
                bvh.quantization().unquantize(&node.quantized_aabb_min()) - *half_extents,
                bvh.quantization().unquantize(&node.quantized_aabb_max()) + *half_extents,
            );
            bounds.intersects_local_ray(ray, 1.0)
        })
        .map(|node| node.triangle_id())
        .collect()
}

/// Checks the escape-index and containment invariants of the subtree rooted at `node_index`,
/// and returns the number of slots it occupies.
fn check_subtree(bvh: &QuantizedBvh, node_index: usize) -> usize {
    let nodes = bvh.raw_nodes();
    let node = &nodes[node_index];

    if node.is_leaf() {
        return 1;
    }

    let left_child_index = node_index + 1;
    let left_size = check_subtree(bvh, left_child_index);
    let right_child_index = left_child_index + left_size;
    let right_size = check_subtree(bvh, right_child_index);

    // The escape index must address the first node outside the subtree.
    assert_eq!(node.escape_index() as usize, 1 + left_size + right_size);

    // An internal node's AABB must contain both children's AABBs.
    for &child_index in &[left_child_index, right_child_index] {
        let child = &nodes[child_index];
        for k in 0..3 {
            assert!(node.quantized_aabb_min()[k] <= child.quantized_aabb_min()[k]);
            assert!(node.quantized_aabb_max()[k] >= child.quantized_aabb_max()[k]);
        }
    }

    1 + left_size + right_size
}

#[test]
fn tree_structure_invariants() {
    for len in [1, 2, 3, 7, 50, 300] {
        for part_count in [1, 3] {
            let mesh = random_mesh(len as u64 * 10 + part_count as u64, len, part_count);
            let bvh = build(&mesh);

            assert_eq!(bvh.node_count(), 2 * len as usize - 1);
            assert_eq!(bvh.leaf_count(), len as usize);
            assert_eq!(check_subtree(&bvh, 0), bvh.node_count());

            // Every triangle appears in exactly one leaf.
            let mut leaf_ids = BTreeSet::new();
            for node in bvh.raw_nodes().iter().filter(|node| node.is_leaf()) {
                assert!(leaf_ids.insert(node.triangle_id()));
            }

            let mut expected = BTreeSet::new();
            mesh.for_each_triangle(|id, _| {
                let _ = expected.insert(id);
            });
            assert_eq!(leaf_ids, expected);
        }
    }
}

#[test]
fn subtree_headers_partition_the_leaves() {
    for len in [1, 60, 128, 129, 1000] {
        let mesh = random_mesh(len as u64, len, 1);
        let bvh = build(&mesh);
        let headers = bvh.subtree_headers();

        assert!(!headers.is_empty());

        // A tree fitting entirely in the byte budget gets exactly one header, for the root.
        if bvh.node_count() * 16 <= super::MAX_SUBTREE_SIZE_IN_BYTES {
            assert_eq!(headers.len(), 1);
            assert_eq!(headers[0].root_node_index(), 0);
            assert_eq!(headers[0].subtree_size() as usize, bvh.node_count());
        }

        let mut covered = vec![0u32; bvh.node_count()];

        for header in headers {
            let root = header.root_node_index() as usize;
            let size = header.subtree_size() as usize;

            assert!(size * 16 <= super::MAX_SUBTREE_SIZE_IN_BYTES);
            assert!(root + size <= bvh.node_count());

            // Headers snapshot their root's AABB.
            let node = &bvh.raw_nodes()[root];
            assert_eq!(header.quantized_aabb_min(), node.quantized_aabb_min());
            assert_eq!(header.quantized_aabb_max(), node.quantized_aabb_max());

            for slot in covered[root..root + size].iter_mut() {
                *slot += 1;
            }
        }

        // Chunks never overlap, and every leaf belongs to exactly one chunk. (Internal nodes
        // whose own subtree exceeds the budget belong to no chunk.)
        for (i, node) in bvh.raw_nodes().iter().enumerate() {
            assert!(covered[i] <= 1);
            if node.is_leaf() {
                assert_eq!(covered[i], 1, "leaf {} not covered by any subtree header", i);
            }
        }
    }
}

#[test]
fn aabb_query_equivalence() {
    let mesh = random_mesh(42, 300, 3);
    let bvh = build(&mesh);
    let mut rng = oorandom::Rand32::new(1337);

    for _ in 0..100 {
        // Centers picked slightly outside the cube too, so some queries clamp.
        let center = rand_point_in_cube(&mut rng, 14.0) - Vector::repeat(2.0);
        let half_extents = Vector::repeat(rand_real(&mut rng) * 2.0 + 0.01);
        let query = Aabb::from_half_extents(center, half_extents);

        let stackless = collect_aabb(&bvh, TraversalMode::Stackless, &query);
        let recursive = collect_aabb(&bvh, TraversalMode::Recursive, &query);
        let scanned = scan_aabb(&bvh, &query);

        assert_eq!(stackless, recursive);
        assert_eq!(stackless, scanned);
    }
}

#[test]
fn cast_query_equivalence() {
    let mesh = random_mesh(43, 300, 3);
    let bvh = build(&mesh);
    let mut rng = oorandom::Rand32::new(4242);

    for i in 0..100 {
        let origin = rand_point_in_cube(&mut rng, 14.0) - Vector::repeat(2.0);
        let target = rand_point_in_cube(&mut rng, 14.0) - Vector::repeat(2.0);
        let ray = Ray::between(origin, target);

        // Alternate between pure ray-casts and box-casts.
        let half_extents = if i % 2 == 0 {
            Vector::zeros()
        } else {
            Vector::new(
                rand_real(&mut rng) * 0.5,
                rand_real(&mut rng) * 0.5,
                rand_real(&mut rng) * 0.5,
            )
        };

        let stackless = collect_cast(&bvh, TraversalMode::Stackless, &ray, &half_extents);
        let recursive = collect_cast(&bvh, TraversalMode::Recursive, &ray, &half_extents);
        let scanned = scan_cast(&bvh, &ray, &half_extents);

        assert_eq!(stackless, recursive);
        assert_eq!(stackless, scanned);
    }
}

#[test]
fn empty_mesh_builds_an_empty_tree() {
    let mesh = IndexedMesh::with_single_part(vec![], vec![]);
    let bvh = build(&mesh);

    assert!(bvh.is_empty());
    assert_eq!(bvh.node_count(), 0);
    assert!(bvh.subtree_headers().is_empty());

    let everything = Aabb::from_half_extents(Point::origin(), Vector::repeat(1000.0));
    let stats = bvh.intersect_aabb(&everything, |_| panic!("no leaf should be visited"));
    assert_eq!(stats.nodes_visited, 0);

    let ray = Ray::new(Point::origin(), Vector::repeat(1.0));
    let _ = bvh.cast_ray(&ray, |_| panic!("no leaf should be visited"));
}

#[test]
fn degenerate_query_matches_nothing() {
    let mesh = random_mesh(7, 50, 1);
    let bvh = build(&mesh);

    // Inverted box.
    let query = Aabb::new(Point::new(8.0, 8.0, 8.0), Point::new(2.0, 2.0, 2.0));
    for mode in [TraversalMode::Stackless, TraversalMode::Recursive] {
        assert!(collect_aabb(&bvh, mode, &query).is_empty());
    }
}

#[test]
fn degenerate_triangles_are_thickened() {
    // A triangle completely flat along y.
    let mesh = IndexedMesh::with_single_part(
        vec![
            Point::new(1.0, 2.0, 1.0),
            Point::new(3.0, 2.0, 1.0),
            Point::new(2.0, 2.0, 3.0),
        ],
        vec![[0, 1, 2]],
    );
    let bvh = build(&mesh);

    assert_eq!(bvh.node_count(), 1);
    let leaf = bvh.root_aabb();
    assert!(leaf.extents().y > 0.0015);

    // The thickened leaf is still found where the triangle lies.
    let query = Aabb::from_half_extents(Point::new(2.0, 2.0, 2.0), Vector::repeat(0.1));
    assert_eq!(collect_aabb(&bvh, TraversalMode::Stackless, &query).len(), 1);
}

#[test]
fn build_rejects_too_many_parts() {
    let part = IndexedMeshPart::new(
        vec![
            Point::new(0.0, 0.0, 0.0),
            Point::new(1.0, 0.0, 0.0),
            Point::new(0.0, 1.0, 0.0),
        ],
        vec![[0, 1, 2]],
    );
    let mesh = IndexedMesh::new(vec![part; MAX_PART_COUNT as usize + 1]);

    assert_eq!(
        QuantizedBvh::build(&mesh, &mesh.local_aabb()),
        Err(QuantizedBvhBuildError::TooManyParts {
            part_count: MAX_PART_COUNT + 1,
            max: MAX_PART_COUNT,
        })
    );

    // Empty parts don't count against the limit.
    let mut parts = vec![IndexedMeshPart::default(); MAX_PART_COUNT as usize + 1];
    parts[0] = IndexedMeshPart::new(
        vec![
            Point::new(0.0, 0.0, 0.0),
            Point::new(1.0, 0.0, 0.0),
            Point::new(0.0, 1.0, 0.0),
        ],
        vec![[0, 1, 2]],
    );
    let mesh = IndexedMesh::new(parts);
    assert!(QuantizedBvh::build(&mesh, &mesh.local_aabb()).is_ok());
}

/// A 5×5 grid of separated triangles in the `y = 0` plane, one per cell, 2.0 apart, each with
/// a bit of thickness along y.
fn grid_mesh() -> IndexedMesh {
    let mut vertices = vec![];
    let mut indices = vec![];

    for i in 0..5u32 {
        for j in 0..5u32 {
            let x = i as Real * 2.0;
            let z = j as Real * 2.0;
            let base = vertices.len() as u32;

            vertices.push(Point::new(x, 0.0, z));
            vertices.push(Point::new(x + 0.5, 0.01, z));
            vertices.push(Point::new(x, 0.01, z + 0.5));
            indices.push([base, base + 1, base + 2]);
        }
    }

    IndexedMesh::with_single_part(vertices, indices)
}

fn cell_query(i: u32, j: u32, y: Real) -> Aabb {
    Aabb::from_half_extents(
        Point::new(i as Real * 2.0 + 0.25, y, j as Real * 2.0 + 0.25),
        Vector::repeat(0.5),
    )
}

#[test]
fn refit_follows_moved_vertices() {
    let mut mesh = grid_mesh();
    let mut bvh = build(&mesh);

    let moved: u32 = 2 * 5 + 2;
    assert_eq!(
        collect_aabb(&bvh, TraversalMode::Stackless, &cell_query(2, 2, 0.0)),
        BTreeSet::from([TriangleId::new(0, moved)])
    );

    // Translate the triangle of cell (2, 2) by (0, 5, 0).
    let part = &mut mesh.parts_mut()[0];
    for k in 0..3 {
        part.vertices[(moved * 3 + k) as usize].y += 5.0;
    }

    bvh.refit(&mesh);

    // The triangle is found at its new location, and its old cell is now empty.
    for mode in [TraversalMode::Stackless, TraversalMode::Recursive] {
        assert_eq!(
            collect_aabb(&bvh, mode, &cell_query(2, 2, 5.0)),
            BTreeSet::from([TriangleId::new(0, moved)])
        );
        assert!(collect_aabb(&bvh, mode, &cell_query(2, 2, 0.0)).is_empty());
    }

    // Every leaf matches a from-scratch quantization of its triangle.
    let quantization = *bvh.quantization();
    for node in bvh.raw_nodes().iter().filter(|node| node.is_leaf()) {
        let id = node.triangle_id();
        let aabb = mesh.parts()[id.part_id as usize]
            .indices
            .get(id.triangle_index as usize)
            .map(|idx| {
                let vtx = &mesh.parts()[id.part_id as usize].vertices;
                crate::shape::Triangle::new(
                    vtx[idx[0] as usize],
                    vtx[idx[1] as usize],
                    vtx[idx[2] as usize],
                )
                .local_aabb()
            })
            .unwrap();

        assert_eq!(
            node.quantized_aabb_min(),
            quantization.quantize_with_clamp(&aabb.mins)
        );
        assert_eq!(
            node.quantized_aabb_max(),
            quantization.quantize_with_clamp(&aabb.maxs)
        );
    }

    // All structural invariants survive a refit, and the tree stays queryable.
    assert_eq!(check_subtree(&bvh, 0), bvh.node_count());
}

#[test]
fn refit_root_contains_rebuilt_root() {
    let mut mesh = random_mesh(99, 200, 1);
    let mut bvh = build(&mesh);

    // Shift a few triangles around.
    let part = &mut mesh.parts_mut()[0];
    for i in 0..20 {
        part.vertices[i * 9].x += 3.0;
        part.vertices[i * 9 + 1].y -= 1.5;
    }

    bvh.refit(&mesh);

    let rebuilt = build(&mesh);

    // Same domain on both sides, so quantized root corners compare exactly.
    assert_eq!(bvh.quantization(), rebuilt.quantization());

    let refit_root = &bvh.raw_nodes()[0];
    let rebuilt_root = &rebuilt.raw_nodes()[0];
    for k in 0..3 {
        assert!(refit_root.quantized_aabb_min()[k] <= rebuilt_root.quantized_aabb_min()[k]);
        assert!(refit_root.quantized_aabb_max()[k] >= rebuilt_root.quantized_aabb_max()[k]);
    }

    // The refit root still bounds the actual geometry (up to one quantization step).
    let step = bvh.quantization().step();
    let loose_root = bvh.root_aabb().loosened(step.amax());
    assert!(loose_root.contains(&mesh.local_aabb()));
}
