//! Greedy pattern rewriting.
//!
//! In-place mutation + RAUW-based rewriting: patterns record their changes in
//! a [`PatternRewriter`] and the [`PatternApplicator`] applies them, visiting
//! every operation until no pattern matches.

pub mod applicator;
pub mod pattern;
pub mod rewriter;

pub use applicator::{ApplyError, ApplyResult, GreedyRewriteConfig, PatternApplicator};
pub use pattern::{RewritePattern, RewritePatternSet};
pub use rewriter::PatternRewriter;

use crate::context::IrContext;
use crate::refs::OpRef;

/// Apply `patterns` greedily to everything nested in `root`.
pub fn apply_patterns_greedily(
    ctx: &mut IrContext,
    root: OpRef,
    patterns: &RewritePatternSet,
    config: GreedyRewriteConfig,
) -> Result<ApplyResult, ApplyError> {
    PatternApplicator::new(patterns)
        .with_config(config)
        .apply(ctx, root)
}
