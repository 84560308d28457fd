//! Post-stage lowering of vector operations.

mod contract;
mod transfer;

pub use contract::ContractionLowering;
pub use transfer::{TransferReadLowering, TransferWriteLowering};

use tessera_ir::rewrite::{ApplyError, ApplyResult, GreedyRewriteConfig, RewritePatternSet, apply_patterns_greedily};
use tessera_ir::{IrContext, OpRef};

use crate::options::{VectorTransferToLoopsOptions, VectorTransformsOptions};

pub fn contract_lowering_patterns(options: &VectorTransformsOptions) -> RewritePatternSet {
    let mut patterns = RewritePatternSet::new();
    patterns.add(ContractionLowering::new(options.contract_lowering));
    patterns
}

pub fn transfer_lowering_patterns(options: &VectorTransferToLoopsOptions) -> RewritePatternSet {
    let mut patterns = RewritePatternSet::new();
    patterns
        .add(TransferReadLowering::new(options.unroll))
        .add(TransferWriteLowering::new(options.unroll));
    patterns
}

/// Lower every `vector.contract` nested in `root`.
pub fn lower_contractions(
    ctx: &mut IrContext,
    root: OpRef,
    options: &VectorTransformsOptions,
    config: GreedyRewriteConfig,
) -> Result<ApplyResult, ApplyError> {
    apply_patterns_greedily(ctx, root, &contract_lowering_patterns(options), config)
}

/// Lower every vector transfer nested in `root` to loops.
pub fn lower_transfers(
    ctx: &mut IrContext,
    root: OpRef,
    options: &VectorTransferToLoopsOptions,
    config: GreedyRewriteConfig,
) -> Result<ApplyResult, ApplyError> {
    apply_patterns_greedily(ctx, root, &transfer_lowering_patterns(options), config)
}
