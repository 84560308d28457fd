//! Recursive operation traversal.

use std::ops::ControlFlow;

use crate::context::IrContext;
use crate::ops::OpKind;
use crate::refs::{BlockRef, OpRef, RegionRef};

/// Controls whether to descend into children during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Continue walking and descend into nested regions.
    Advance,
    /// Skip the nested regions of the current operation.
    Skip,
}

/// Walk all operations in a region recursively, parents before children.
pub fn walk_region<B>(
    ctx: &IrContext,
    region: RegionRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    for &block in &ctx.region(region).blocks {
        walk_block(ctx, block, f)?;
    }
    ControlFlow::Continue(())
}

/// Walk all operations in a block recursively.
pub fn walk_block<B>(
    ctx: &IrContext,
    block: BlockRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    for &op in &ctx.block(block).ops {
        walk_op(ctx, op, f)?;
    }
    ControlFlow::Continue(())
}

/// Walk an operation and its nested regions recursively.
pub fn walk_op<B>(
    ctx: &IrContext,
    op: OpRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    match f(op) {
        ControlFlow::Break(b) => return ControlFlow::Break(b),
        ControlFlow::Continue(WalkAction::Skip) => return ControlFlow::Continue(()),
        ControlFlow::Continue(WalkAction::Advance) => {}
    }
    for &region in &ctx.op(op).regions {
        walk_region(ctx, region, f)?;
    }
    ControlFlow::Continue(())
}

/// Collect every operation nested in `op` (excluding `op` itself) that
/// matches `K`, in pre-order.
pub fn collect_nested<K: OpKind>(ctx: &IrContext, op: OpRef) -> Vec<OpRef> {
    let mut found = Vec::new();
    for &region in &ctx.op(op).regions {
        let _ = walk_region::<()>(ctx, region, &mut |nested| {
            if K::matches(ctx, nested) {
                found.push(nested);
            }
            ControlFlow::Continue(WalkAction::Advance)
        });
    }
    found
}

/// Collect every operation nested in `op` (excluding `op` itself) in
/// post-order: children before their parents.
pub fn post_order(ctx: &IrContext, op: OpRef) -> Vec<OpRef> {
    fn visit(ctx: &IrContext, op: OpRef, out: &mut Vec<OpRef>) {
        for &region in &ctx.op(op).regions {
            for &block in &ctx.region(region).blocks {
                for &nested in &ctx.block(block).ops {
                    visit(ctx, nested, out);
                    out.push(nested);
                }
            }
        }
    }
    let mut out = Vec::new();
    visit(ctx, op, &mut out);
    out
}
