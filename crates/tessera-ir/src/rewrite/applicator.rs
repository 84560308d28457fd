//! PatternApplicator: greedy fixpoint driver.
//!
//! Visitor-based fixpoint iteration that applies rewrite patterns to all
//! operations nested in a root operation. Uses snapshots of block operations
//! and checks `parent_block` validity to skip erased ops.

use derive_more::{Display, Error};
use tracing::trace;

use super::pattern::RewritePatternSet;
use super::rewriter::{self, PatternRewriter};
use crate::context::IrContext;
use crate::ops::OpName;
use crate::refs::{BlockRef, OpRef, RegionRef};

/// Configuration of a greedy rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GreedyRewriteConfig {
    /// Maximum fixpoint iterations before reporting non-convergence.
    pub max_iterations: usize,
}

impl Default for GreedyRewriteConfig {
    fn default() -> Self {
        Self { max_iterations: 10 }
    }
}

impl GreedyRewriteConfig {
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }
}

/// Result of applying rewrite patterns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// Number of fixpoint iterations performed.
    pub iterations: usize,
    /// Total number of pattern matches (mutations applied).
    pub total_changes: usize,
    /// Whether the fixpoint was reached (no changes in last iteration).
    pub reached_fixpoint: bool,
}

/// Failure of a greedy rewrite.
#[derive(Clone, Copy, Debug, Display, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[display("rewrite did not converge after {iterations} iterations ({changes} changes)")]
    DidNotConverge { iterations: usize, changes: usize },
}

/// Applies rewrite patterns using visitor-based fixpoint iteration.
pub struct PatternApplicator<'a> {
    patterns: &'a RewritePatternSet,
    config: GreedyRewriteConfig,
}

impl<'a> PatternApplicator<'a> {
    pub fn new(patterns: &'a RewritePatternSet) -> Self {
        Self {
            patterns,
            config: GreedyRewriteConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GreedyRewriteConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply patterns to everything nested in `root` until no pattern
    /// matches, failing if the iteration budget runs out first.
    pub fn apply(&self, ctx: &mut IrContext, root: OpRef) -> Result<ApplyResult, ApplyError> {
        let result = self.apply_partial(ctx, root);
        if result.reached_fixpoint {
            Ok(result)
        } else {
            Err(ApplyError::DidNotConverge {
                iterations: result.iterations,
                changes: result.total_changes,
            })
        }
    }

    /// Apply patterns without checking convergence.
    pub fn apply_partial(&self, ctx: &mut IrContext, root: OpRef) -> ApplyResult {
        let mut total_changes = 0;
        let mut iterations = 0;

        for _ in 0..self.config.max_iterations {
            iterations += 1;
            let mut changes = 0;
            let regions: Vec<RegionRef> = ctx.op(root).regions.to_vec();
            for region in regions {
                changes += self.visit_region(ctx, region);
            }
            total_changes += changes;
            if changes == 0 {
                return ApplyResult {
                    iterations,
                    total_changes,
                    reached_fixpoint: true,
                };
            }
        }

        ApplyResult {
            iterations,
            total_changes,
            reached_fixpoint: false,
        }
    }

    fn visit_region(&self, ctx: &mut IrContext, region: RegionRef) -> usize {
        let mut changes = 0;
        let blocks: Vec<BlockRef> = ctx.region(region).blocks.to_vec();
        for block in blocks {
            changes += self.visit_block(ctx, block);
        }
        changes
    }

    fn visit_block(&self, ctx: &mut IrContext, block: BlockRef) -> usize {
        let mut changes = 0;

        // Snapshot the ops in this block
        let ops: Vec<OpRef> = ctx.block(block).ops.to_vec();

        for op in ops {
            // Skip ops that have been removed from their block
            if ctx.op(op).parent_block != Some(block) {
                continue;
            }

            // First, recurse into nested regions
            let regions: Vec<RegionRef> = ctx.op(op).regions.to_vec();
            for region in regions {
                changes += self.visit_region(ctx, region);
            }

            // Skip ops that were removed during nested processing
            if ctx.op(op).parent_block != Some(block) {
                continue;
            }

            let name = OpName::of(ctx, op);
            for pattern in self.patterns.iter() {
                if pattern.root().is_some_and(|root| root != name) {
                    continue;
                }
                let mut rw = PatternRewriter::new();
                let matched = pattern.match_and_rewrite(ctx, op, &mut rw);
                if matched && rw.has_mutations() {
                    trace!(pattern = pattern.name(), %name, "applied rewrite");
                    rewriter::apply_mutations(ctx, op, rw.take_mutations());
                    changes += 1;
                    break; // Only apply one pattern per op per iteration
                }
            }
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OperationDataBuilder;
    use crate::dialect::{arith, func};
    use crate::rewrite::RewritePattern;
    use crate::symbol::Symbol;
    use crate::types::{Location, Span};

    fn test_func(ctx: &mut IrContext) -> (func::Func, Location) {
        let path = ctx.paths.intern("rewrite.mlir".to_owned());
        let loc = Location::new(path, Span::new(0, 0));
        let f = func::func(ctx, loc, Symbol::new("f"), &[]);
        (f, loc)
    }

    /// Pattern: rename test.source → test.target
    struct RenamePattern;

    impl RewritePattern for RenamePattern {
        fn match_and_rewrite(
            &self,
            ctx: &mut IrContext,
            op: OpRef,
            rewriter: &mut PatternRewriter,
        ) -> bool {
            let data = ctx.op(op);
            if data.dialect != "test" || data.name != "source" {
                return false;
            }
            let loc = data.location;
            let result_types = ctx.op_result_types(op).to_vec();
            let new_data =
                OperationDataBuilder::new(loc, Symbol::new("test"), Symbol::new("target"))
                    .results(result_types)
                    .build(ctx);
            let new_op = ctx.create_op(new_data);
            rewriter.replace_op(new_op);
            true
        }
    }

    /// Pattern that rewrites every `test.target` into itself forever.
    struct Oscillate;

    impl RewritePattern for Oscillate {
        fn match_and_rewrite(
            &self,
            ctx: &mut IrContext,
            op: OpRef,
            rewriter: &mut PatternRewriter,
        ) -> bool {
            if ctx.op(op).name != "target" {
                return false;
            }
            let clone = ctx.clone_op_with_operands(op, []);
            rewriter.replace_op(clone);
            true
        }

        fn root(&self) -> Option<OpName> {
            OpName::parse("test.target")
        }
    }

    fn source_op(ctx: &mut IrContext, loc: Location) -> OpRef {
        let i32_ty = ctx.types.i32();
        let data = OperationDataBuilder::new(loc, Symbol::new("test"), Symbol::new("source"))
            .result(i32_ty)
            .build(ctx);
        ctx.create_op(data)
    }

    #[test]
    fn applicator_preserves_uses_via_rauw() {
        let mut ctx = IrContext::new();
        let (f, loc) = test_func(&mut ctx);
        let entry = f.entry_block(&ctx);
        let src = source_op(&mut ctx, loc);
        let v = ctx.op_result(src, 0);
        let user = arith::addi(&mut ctx, loc, v, v);
        ctx.push_op(entry, src);
        ctx.push_op(entry, user.op_ref());

        let mut patterns = RewritePatternSet::new();
        patterns.add(RenamePattern);
        let result = PatternApplicator::new(&patterns)
            .apply(&mut ctx, f.op_ref())
            .unwrap();
        assert_eq!(result.total_changes, 1);
        assert_eq!(result.iterations, 2);

        let ops = ctx.block(entry).ops.to_vec();
        assert_eq!(ops.len(), 2);
        assert_eq!(ctx.op(ops[0]).name, "target");
        assert_eq!(user.lhs(&ctx), ctx.op_result(ops[0], 0));
    }

    #[test]
    fn non_convergence_is_an_error() {
        let mut ctx = IrContext::new();
        let (f, loc) = test_func(&mut ctx);
        let entry = f.entry_block(&ctx);
        let src = source_op(&mut ctx, loc);
        ctx.push_op(entry, src);

        let mut patterns = RewritePatternSet::new();
        patterns.add(RenamePattern).add(Oscillate);
        let err = PatternApplicator::new(&patterns)
            .with_config(GreedyRewriteConfig::default().with_max_iterations(3))
            .apply(&mut ctx, f.op_ref())
            .unwrap_err();
        assert_eq!(
            err,
            ApplyError::DidNotConverge {
                iterations: 3,
                changes: 3
            }
        );
        assert_eq!(
            err.to_string(),
            "rewrite did not converge after 3 iterations (3 changes)"
        );
    }
}
