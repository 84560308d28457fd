//! Dead Code Elimination (DCE).
//!
//! Removes operations whose results are never used and which have no side
//! effects other than allocating. Loops whose bodies are free of effects are
//! removed as a whole. Use-chains make dead-op detection O(1).

use crate::context::IrContext;
use crate::effects::is_trivially_dead;
use crate::refs::{BlockRef, OpRef, RegionRef};

/// Configuration for dead code elimination.
#[derive(Debug, Clone)]
pub struct DceConfig {
    /// Maximum fixpoint iterations before giving up. Default: 100.
    pub max_iterations: usize,
    /// Whether to recursively process nested regions. Default: true.
    pub recursive: bool,
}

impl Default for DceConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            recursive: true,
        }
    }
}

/// Result of running dead code elimination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DceResult {
    /// Total number of operations removed.
    pub removed_count: usize,
    /// Number of fixpoint iterations performed.
    pub iterations: usize,
    /// Whether fixpoint was reached (no more changes possible).
    pub reached_fixpoint: bool,
}

/// Eliminate dead code nested in `root` using default configuration.
pub fn eliminate_dead_code(ctx: &mut IrContext, root: OpRef) -> DceResult {
    eliminate_dead_code_with_config(ctx, root, DceConfig::default())
}

/// Eliminate dead code with custom configuration.
pub fn eliminate_dead_code_with_config(
    ctx: &mut IrContext,
    root: OpRef,
    config: DceConfig,
) -> DceResult {
    let max_iterations = if config.max_iterations == 0 {
        100
    } else {
        config.max_iterations
    };

    let mut total_removed = 0;

    for iteration in 0..max_iterations {
        let regions: Vec<RegionRef> = ctx.op(root).regions.to_vec();
        let removed: usize = regions
            .into_iter()
            .map(|region| sweep_region(ctx, region, &config))
            .sum();

        if removed == 0 {
            return DceResult {
                removed_count: total_removed,
                iterations: iteration + 1,
                reached_fixpoint: true,
            };
        }

        total_removed += removed;
    }

    DceResult {
        removed_count: total_removed,
        iterations: max_iterations,
        reached_fixpoint: false,
    }
}

/// Sweep all blocks in a region. Returns the number of ops removed.
fn sweep_region(ctx: &mut IrContext, region: RegionRef, config: &DceConfig) -> usize {
    let blocks: Vec<BlockRef> = ctx.region(region).blocks.to_vec();
    let mut removed = 0;
    for block in blocks {
        removed += sweep_block(ctx, block, config);
    }
    removed
}

/// Sweep a single block in reverse order, removing dead ops.
///
/// Iterating in reverse maximizes cascade removal: if op C uses op B's
/// result and op B uses op A's result, removing C first frees B, then A.
fn sweep_block(ctx: &mut IrContext, block: BlockRef, config: &DceConfig) -> usize {
    let mut removed = 0;

    // First, recursively process nested regions of all ops
    if config.recursive {
        let ops: Vec<OpRef> = ctx.block(block).ops.to_vec();
        for op in ops {
            let regions: Vec<RegionRef> = ctx.op(op).regions.to_vec();
            for region in regions {
                removed += sweep_region(ctx, region, config);
            }
        }
    }

    // Now sweep this block's ops in reverse
    let ops: Vec<OpRef> = ctx.block(block).ops.to_vec();
    for &op in ops.iter().rev() {
        if is_trivially_dead(ctx, op) {
            ctx.erase_op(op);
            removed += 1;
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{arith, func, memref, scf};
    use crate::symbol::Symbol;
    use crate::types::{Location, Span};

    fn setup(ctx: &mut IrContext) -> (func::Func, Location) {
        let path = ctx.paths.intern("dce.mlir".to_owned());
        let loc = Location::new(path, Span::new(0, 0));
        let f32_ty = ctx.types.f32();
        let mem = ctx.types.memref(f32_ty, &[4], 0);
        let f = func::func(ctx, loc, Symbol::new("f"), &[mem]);
        (f, loc)
    }

    #[test]
    fn removes_unused_chains_but_keeps_stores() {
        let mut ctx = IrContext::new();
        let (f, loc) = setup(&mut ctx);
        let entry = f.entry_block(&ctx);
        let arg = f.args(&ctx)[0];

        let a = arith::const_index(&mut ctx, loc, 1);
        let av = a.result(&ctx);
        let b = arith::addi(&mut ctx, loc, av, av);
        let idx = arith::const_index(&mut ctx, loc, 0);
        let iv = idx.result(&ctx);
        let x = arith::const_f32(&mut ctx, loc, 1.0);
        let xv = x.result(&ctx);
        let st = memref::store(&mut ctx, loc, xv, arg, [iv]);
        let ret = func::r#return(&mut ctx, loc, []);
        for op in [a.op_ref(), b.op_ref(), idx.op_ref(), x.op_ref(), st.op_ref(), ret.op_ref()] {
            ctx.push_op(entry, op);
        }

        let result = eliminate_dead_code(&mut ctx, f.op_ref());
        assert!(result.reached_fixpoint);
        assert_eq!(result.removed_count, 2);
        assert_eq!(
            ctx.block(entry).ops.as_slice(),
            &[idx.op_ref(), x.op_ref(), st.op_ref(), ret.op_ref()]
        );
    }

    #[test]
    fn removes_effect_free_loops() {
        let mut ctx = IrContext::new();
        let (f, loc) = setup(&mut ctx);
        let entry = f.entry_block(&ctx);
        let c = arith::const_index(&mut ctx, loc, 0);
        let cv = c.result(&ctx);
        ctx.push_op(entry, c.op_ref());
        let lp = scf::for_loop(&mut ctx, loc, cv, cv, cv);
        ctx.push_op(entry, lp.op_ref());
        let iv = lp.induction_var(&ctx);
        let add = arith::addi(&mut ctx, loc, iv, iv);
        let body = lp.body_block(&ctx);
        scf::insert_in_body(&mut ctx, body, add.op_ref());

        eliminate_dead_code(&mut ctx, f.op_ref());
        assert!(ctx.block(entry).ops.is_empty());
    }
}
