//! Spatial partitioning tools.

pub use self::quantized_bvh::{
    BvhSubtreeInfo, Quantization, QuantizedBvh, QuantizedBvhBuildError, QuantizedBvhNode,
    TraversalMode, TraversalStats, DEFAULT_QUANTIZATION_MARGIN, MAX_PART_COUNT,
    MAX_SUBTREE_SIZE_IN_BYTES, MAX_TRIANGLES_PER_PART,
};

mod quantized_bvh;
