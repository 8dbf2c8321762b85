pub use self::build::QuantizedBvhBuildError;
pub use self::quantized_bvh::{
    BvhSubtreeInfo, Quantization, QuantizedBvh, QuantizedBvhNode, TraversalMode, TraversalStats,
    DEFAULT_QUANTIZATION_MARGIN, MAX_PART_COUNT, MAX_SUBTREE_SIZE_IN_BYTES,
    MAX_TRIANGLES_PER_PART,
};

mod build;
mod quantized_bvh;
mod refit;
mod traverse;

#[cfg(test)]
mod quantized_bvh_tests;
