//! Options of the individual stages and of the post-stage lowering.
//!
//! Every options type is a plain value: build it with `Default` and the
//! `with_*` setters, then hand it to a stage. Stages never modify it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Loop construct emitted for the tile loops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// One `scf.for` per tiled loop.
    #[default]
    Loops,
    /// A single `scf.parallel` over the tiled parallel loops, with `scf.for`
    /// nested inside for tiled reduction loops.
    ParallelLoops,
}

/// Options of a [`Tile`](crate::Tile) stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingOptions {
    /// Tile size per loop of the operation. Zero leaves the loop untiled;
    /// missing trailing entries count as zero and extra entries are ignored.
    pub tile_sizes: Vec<i64>,
    /// Order of the generated tile loops, outermost first, as a permutation
    /// of the operation's loops. Empty keeps the natural order.
    pub interchange: Vec<usize>,
    pub loop_type: LoopType,
}

impl TilingOptions {
    pub fn with_tile_sizes(mut self, sizes: impl IntoIterator<Item = i64>) -> Self {
        self.tile_sizes = sizes.into_iter().collect();
        self
    }

    pub fn with_interchange(mut self, order: impl IntoIterator<Item = usize>) -> Self {
        self.interchange = order.into_iter().collect();
        self
    }

    pub fn with_loop_type(mut self, loop_type: LoopType) -> Self {
        self.loop_type = loop_type;
        self
    }

    /// Tile sizes for an operation with `num_loops` loops.
    pub fn tile_sizes_for(&self, num_loops: usize) -> Vec<i64> {
        let mut sizes: Vec<i64> = self.tile_sizes.iter().copied().take(num_loops).collect();
        sizes.resize(num_loops, 0);
        sizes
    }
}

/// Options of a [`Promote`](crate::Promote) stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionOptions {
    /// Operand positions to promote; `None` promotes every shaped operand.
    pub operands_to_promote: Option<BTreeSet<usize>>,
    /// Per operand position: run the operation on the whole local buffer
    /// (zero padded) instead of a view of the tile's exact extent.
    pub use_full_tile_buffers: Option<Vec<bool>>,
    /// Used for operands not covered by `use_full_tile_buffers`.
    pub use_full_tile_buffers_by_default: bool,
    pub alignment: Option<u64>,
    /// Allocate on the stack (`memref.alloca`) instead of the heap.
    pub use_alloca: bool,
    pub memory_space: u32,
}

impl PromotionOptions {
    pub fn with_operands_to_promote(mut self, operands: impl IntoIterator<Item = usize>) -> Self {
        self.operands_to_promote = Some(operands.into_iter().collect());
        self
    }

    pub fn with_use_full_tile_buffers(mut self, flags: impl IntoIterator<Item = bool>) -> Self {
        self.use_full_tile_buffers = Some(flags.into_iter().collect());
        self
    }

    pub fn with_use_full_tile_buffers_by_default(mut self, enable: bool) -> Self {
        self.use_full_tile_buffers_by_default = enable;
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn with_use_alloca(mut self, enable: bool) -> Self {
        self.use_alloca = enable;
        self
    }

    pub fn with_memory_space(mut self, space: u32) -> Self {
        self.memory_space = space;
        self
    }

    pub fn promotes(&self, operand: usize) -> bool {
        self.operands_to_promote
            .as_ref()
            .is_none_or(|set| set.contains(&operand))
    }

    pub fn full_tile_buffer(&self, operand: usize) -> bool {
        self.use_full_tile_buffers
            .as_ref()
            .and_then(|flags| flags.get(operand).copied())
            .unwrap_or(self.use_full_tile_buffers_by_default)
    }
}

/// Options of a [`Vectorize`](crate::Vectorize) stage. There is nothing to
/// configure yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorizationOptions {}

/// How `vector.contract` is lowered after the last stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorContractLowering {
    /// One `vector.outerproduct` per reduction step.
    #[default]
    OuterProduct,
    /// Elementwise multiply and `vector.reduction` per result element.
    Dot,
    /// A flattened `vector.matrix_multiply`.
    Matmul,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorTransformsOptions {
    pub contract_lowering: VectorContractLowering,
}

impl VectorTransformsOptions {
    pub fn with_contract_lowering(mut self, lowering: VectorContractLowering) -> Self {
        self.contract_lowering = lowering;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorTransferToLoopsOptions {
    /// Emit one scalar access per element instead of loops.
    pub unroll: bool,
}

impl VectorTransferToLoopsOptions {
    pub fn with_unroll(mut self, unroll: bool) -> Self {
        self.unroll = unroll;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_sizes_are_padded_and_truncated() {
        let opts = TilingOptions::default().with_tile_sizes([8, 4]);
        assert_eq!(opts.tile_sizes_for(3), vec![8, 4, 0]);
        assert_eq!(opts.tile_sizes_for(1), vec![8]);
    }

    #[test]
    fn promotion_defaults_cover_every_operand() {
        let opts = PromotionOptions::default();
        assert!(opts.promotes(0) && opts.promotes(7));
        assert!(!opts.full_tile_buffer(0));

        let opts = PromotionOptions::default()
            .with_operands_to_promote([0, 2])
            .with_use_full_tile_buffers([true, false])
            .with_use_full_tile_buffers_by_default(true);
        assert!(opts.promotes(2) && !opts.promotes(1));
        assert!(opts.full_tile_buffer(0));
        assert!(!opts.full_tile_buffer(1));
        assert!(opts.full_tile_buffer(2));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: TilingOptions =
            serde_json::from_str(r#"{"tile_sizes": [4, 4], "loop_type": "parallel_loops"}"#)
                .unwrap();
        assert_eq!(opts.tile_sizes, vec![4, 4]);
        assert!(opts.interchange.is_empty());
        assert_eq!(opts.loop_type, LoopType::ParallelLoops);

        let lowering: VectorTransformsOptions =
            serde_json::from_str(r#"{"contract_lowering": "dot"}"#).unwrap();
        assert_eq!(lowering.contract_lowering, VectorContractLowering::Dot);
    }
}
