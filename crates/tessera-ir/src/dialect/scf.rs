//! `scf` dialect: structured control flow.
//!
//! Every body block ends with an `scf.yield` terminator. Loops carry no
//! iteration arguments; values flow through memory.

use smallvec::SmallVec;

use super::{create, op_builder};
use crate::context::{IrContext, empty_block, single_block_region};
use crate::ops::DialectOp;
use crate::refs::{BlockRef, OpRef, ValueRef};
use crate::types::Location;

crate::define_op! {
    /// `for %iv = %lb to %ub step %step`.
    pub struct For => "scf", "for";
    /// Multi-dimensional loop whose iterations may run in any order.
    pub struct Parallel => "scf", "parallel";
    /// Conditional with a `then` and an `else` region.
    pub struct If => "scf", "if";
    pub struct Yield => "scf", "yield";
}

pub fn r#yield(ctx: &mut IrContext, loc: Location) -> Yield {
    create(ctx, op_builder::<Yield>(loc))
}

/// Block with `arg_count` index arguments terminated by `scf.yield`.
fn body_block(ctx: &mut IrContext, loc: Location, arg_count: usize) -> BlockRef {
    let index = ctx.types.index();
    let args: SmallVec<[_; 4]> = std::iter::repeat_n(index, arg_count).collect();
    let block = empty_block(ctx, loc, &args);
    let term = r#yield(ctx, loc);
    ctx.push_op(block, term.op_ref());
    block
}

pub fn for_loop(
    ctx: &mut IrContext,
    loc: Location,
    lb: ValueRef,
    ub: ValueRef,
    step: ValueRef,
) -> For {
    let block = body_block(ctx, loc, 1);
    let region = single_block_region(ctx, loc, block);
    create(
        ctx,
        op_builder::<For>(loc)
            .operand(lb)
            .operand(ub)
            .operand(step)
            .region(region),
    )
}

/// Create an `scf.parallel` over `lbs.len()` dimensions.
///
/// # Panics
///
/// Panics if the bound lists differ in length or are empty.
pub fn parallel(
    ctx: &mut IrContext,
    loc: Location,
    lbs: &[ValueRef],
    ubs: &[ValueRef],
    steps: &[ValueRef],
) -> Parallel {
    assert!(
        !lbs.is_empty() && lbs.len() == ubs.len() && lbs.len() == steps.len(),
        "parallel: bound lists must be non-empty and of equal length",
    );
    let block = body_block(ctx, loc, lbs.len());
    let region = single_block_region(ctx, loc, block);
    create(
        ctx,
        op_builder::<Parallel>(loc)
            .operands(lbs.iter().chain(ubs).chain(steps).copied())
            .region(region),
    )
}

pub fn if_op(ctx: &mut IrContext, loc: Location, cond: ValueRef) -> If {
    let then_block = body_block(ctx, loc, 0);
    let then_region = single_block_region(ctx, loc, then_block);
    let else_block = body_block(ctx, loc, 0);
    let else_region = single_block_region(ctx, loc, else_block);
    create(
        ctx,
        op_builder::<If>(loc)
            .operand(cond)
            .region(then_region)
            .region(else_region),
    )
}

/// Insert `op` into a structured body right before its terminator.
pub fn insert_in_body(ctx: &mut IrContext, block: BlockRef, op: OpRef) {
    match ctx.block_terminator(block) {
        Some(term) if Yield::matches(ctx, term) => ctx.insert_op_before(block, term, op),
        _ => ctx.push_op(block, op),
    }
}

fn region_block(ctx: &IrContext, op: OpRef, index: usize) -> BlockRef {
    let region = ctx.op(op).regions[index];
    ctx.region(region).blocks[0]
}

impl For {
    pub fn lower_bound(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn upper_bound(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn step(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[2]
    }

    pub fn body_block(&self, ctx: &IrContext) -> BlockRef {
        region_block(ctx, self.0, 0)
    }

    pub fn induction_var(&self, ctx: &IrContext) -> ValueRef {
        ctx.block_arg(self.body_block(ctx), 0)
    }
}

impl Parallel {
    pub fn rank(&self, ctx: &IrContext) -> usize {
        ctx.op_operands(self.0).len() / 3
    }

    pub fn lower_bounds<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        let rank = self.rank(ctx);
        &ctx.op_operands(self.0)[..rank]
    }

    pub fn upper_bounds<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        let rank = self.rank(ctx);
        &ctx.op_operands(self.0)[rank..2 * rank]
    }

    pub fn steps<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        let rank = self.rank(ctx);
        &ctx.op_operands(self.0)[2 * rank..]
    }

    pub fn body_block(&self, ctx: &IrContext) -> BlockRef {
        region_block(ctx, self.0, 0)
    }

    pub fn induction_vars<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        ctx.block_args(self.body_block(ctx))
    }
}

impl If {
    pub fn condition(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn then_block(&self, ctx: &IrContext) -> BlockRef {
        region_block(ctx, self.0, 0)
    }

    pub fn else_block(&self, ctx: &IrContext) -> BlockRef {
        region_block(ctx, self.0, 1)
    }
}

/// A loop of either kind, viewed uniformly as per-dimension bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnyLoop {
    For(For),
    Parallel(Parallel),
}

impl AnyLoop {
    pub fn from_op(ctx: &IrContext, op: OpRef) -> Option<Self> {
        if let Ok(f) = For::from_op(ctx, op) {
            Some(AnyLoop::For(f))
        } else {
            Parallel::from_op(ctx, op).ok().map(AnyLoop::Parallel)
        }
    }

    pub fn op_ref(&self) -> OpRef {
        match self {
            AnyLoop::For(f) => f.op_ref(),
            AnyLoop::Parallel(p) => p.op_ref(),
        }
    }

    pub fn body_block(&self, ctx: &IrContext) -> BlockRef {
        match self {
            AnyLoop::For(f) => f.body_block(ctx),
            AnyLoop::Parallel(p) => p.body_block(ctx),
        }
    }

    /// `(lower, upper, step, induction variable)` per dimension.
    pub fn dims(&self, ctx: &IrContext) -> Vec<(ValueRef, ValueRef, ValueRef, ValueRef)> {
        match self {
            AnyLoop::For(f) => vec![(
                f.lower_bound(ctx),
                f.upper_bound(ctx),
                f.step(ctx),
                f.induction_var(ctx),
            )],
            AnyLoop::Parallel(p) => (0..p.rank(ctx))
                .map(|d| {
                    (
                        p.lower_bounds(ctx)[d],
                        p.upper_bounds(ctx)[d],
                        p.steps(ctx)[d],
                        p.induction_vars(ctx)[d],
                    )
                })
                .collect(),
        }
    }
}
