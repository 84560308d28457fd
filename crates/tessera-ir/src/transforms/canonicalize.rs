//! Canonicalization: local folding patterns bracketed by dead code
//! elimination.
//!
//! The pattern set is deliberately small. It folds what the strategy's
//! rewrites leave behind (constant bounds arithmetic, `memref.dim` of known
//! extents, self copies, single-trip tile loops) so the next stage sees the
//! simplest form of the function.

use tracing::debug;

use super::dce::eliminate_dead_code;
use crate::context::IrContext;
use crate::dialect::arith::{self, BinaryOp};
use crate::dialect::{memref, scf};
use crate::ops::{DialectOp, OpName};
use crate::refs::{OpRef, ValueRef};
use crate::rewrite::{
    ApplyError, ApplyResult, GreedyRewriteConfig, PatternRewriter, RewritePattern,
    RewritePatternSet, apply_patterns_greedily,
};
use crate::types::{Attribute, MemRefType};

/// Outcome of [`canonicalize`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanonicalizeResult {
    /// Folding patterns applied to a fixed point.
    pub rewrite: ApplyResult,
    /// Operations removed by the surrounding dead code elimination.
    pub removed: usize,
}

/// The folding patterns run by [`canonicalize`].
pub fn canonicalization_patterns() -> RewritePatternSet {
    let mut patterns = RewritePatternSet::new();
    patterns
        .add(FoldConstantBinary)
        .add(FoldIdentityBinary)
        .add(FoldDim)
        .add(EraseSelfCopy)
        .add(EraseDeallocOfUnusedAlloc)
        .add(SimplifyTrivialLoop);
    patterns
}

/// Canonicalize everything nested in `root`.
pub fn canonicalize(
    ctx: &mut IrContext,
    root: OpRef,
    config: GreedyRewriteConfig,
) -> Result<CanonicalizeResult, ApplyError> {
    let mut removed = eliminate_dead_code(ctx, root).removed_count;
    let rewrite = apply_patterns_greedily(ctx, root, &canonicalization_patterns(), config)?;
    removed += eliminate_dead_code(ctx, root).removed_count;
    debug!(
        changes = rewrite.total_changes,
        removed, "canonicalized"
    );
    Ok(CanonicalizeResult { rewrite, removed })
}

/// `arith` binary operation on two constants becomes a constant.
struct FoldConstantBinary;

impl RewritePattern for FoldConstantBinary {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Some(kind) = BinaryOp::of(ctx, op) else {
            return false;
        };
        let (lhs, rhs) = (ctx.op_operands(op)[0], ctx.op_operands(op)[1]);
        let ty = ctx.op_result_types(op)[0];
        let folded = if kind.is_float() {
            if !ctx.types.is_f32(ty) {
                return false;
            }
            let (Some(a), Some(b)) = (arith::constant_float(ctx, lhs), arith::constant_float(ctx, rhs))
            else {
                return false;
            };
            kind.fold_float(a as f32, b as f32).map(Attribute::float)
        } else {
            let (Some(a), Some(b)) = (arith::constant_int(ctx, lhs), arith::constant_int(ctx, rhs))
            else {
                return false;
            };
            kind.fold_int(a, b).map(Attribute::from)
        };
        let Some(value) = folded else {
            return false;
        };

        let loc = ctx.op(op).location;
        let constant = arith::constant(ctx, loc, ty, value);
        rewriter.insert_op(constant.op_ref());
        rewriter.erase_op(vec![constant.result(ctx)]);
        true
    }

    fn name(&self) -> &'static str {
        "FoldConstantBinary"
    }
}

/// `x + 0`, `x - 0`, `x * 1` and `min(x, x)` fold to `x`.
struct FoldIdentityBinary;

impl FoldIdentityBinary {
    fn simplified(ctx: &IrContext, kind: BinaryOp, lhs: ValueRef, rhs: ValueRef) -> Option<ValueRef> {
        let is = |v: ValueRef, c: i64| arith::constant_int(ctx, v) == Some(c);
        match kind {
            BinaryOp::AddI if is(rhs, 0) => Some(lhs),
            BinaryOp::AddI if is(lhs, 0) => Some(rhs),
            BinaryOp::SubI if is(rhs, 0) => Some(lhs),
            BinaryOp::MulI if is(rhs, 1) => Some(lhs),
            BinaryOp::MulI if is(lhs, 1) => Some(rhs),
            BinaryOp::MinSI if lhs == rhs => Some(lhs),
            _ => None,
        }
    }
}

impl RewritePattern for FoldIdentityBinary {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Some(kind) = BinaryOp::of(ctx, op) else {
            return false;
        };
        let (lhs, rhs) = (ctx.op_operands(op)[0], ctx.op_operands(op)[1]);
        match Self::simplified(ctx, kind, lhs, rhs) {
            Some(value) => {
                rewriter.erase_op(vec![value]);
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "FoldIdentityBinary"
    }
}

/// `memref.dim` of a static extent becomes a constant; `memref.dim` of a
/// subview's dynamic size becomes the size operand itself.
struct FoldDim;

impl RewritePattern for FoldDim {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(dim) = memref::Dim::from_op(ctx, op) else {
            return false;
        };
        let source = dim.source(ctx);
        let index = dim.index(ctx);

        let static_extent = MemRefType::from_type(&ctx.types, ctx.value_ty(source))
            .filter(|ty| index < ty.rank() && !ty.is_dynamic_dim(index))
            .map(|ty| ty.shape[index]);
        if let Some(extent) = static_extent {
            let loc = ctx.op(op).location;
            let constant = arith::const_index(ctx, loc, extent);
            rewriter.insert_op(constant.op_ref());
            rewriter.erase_op(vec![constant.result(ctx)]);
            return true;
        }

        let dynamic_size = ctx
            .defining_op(source)
            .and_then(|def| memref::SubView::from_op(ctx, def).ok())
            .and_then(|view| match view.sizes(ctx).get(index) {
                Some(memref::IndexValue::Dynamic(v)) => Some(*v),
                _ => None,
            });
        match dynamic_size {
            Some(size) => {
                rewriter.erase_op(vec![size]);
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "FoldDim"
    }

    fn root(&self) -> Option<OpName> {
        Some(memref::Dim::op_name())
    }
}

/// `memref.copy %a, %a` does nothing.
struct EraseSelfCopy;

impl RewritePattern for EraseSelfCopy {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(copy) = memref::Copy::from_op(ctx, op) else {
            return false;
        };
        if copy.source(ctx) != copy.target(ctx) {
            return false;
        }
        rewriter.erase_op(vec![]);
        true
    }

    fn name(&self) -> &'static str {
        "EraseSelfCopy"
    }

    fn root(&self) -> Option<OpName> {
        Some(memref::Copy::op_name())
    }
}

/// A buffer that is allocated and freed but never accessed. Erasing the
/// `dealloc` leaves the allocation for dead code elimination.
struct EraseDeallocOfUnusedAlloc;

impl RewritePattern for EraseDeallocOfUnusedAlloc {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(dealloc) = memref::Dealloc::from_op(ctx, op) else {
            return false;
        };
        let buffer = dealloc.buffer(ctx);
        let allocated = ctx
            .defining_op(buffer)
            .is_some_and(|def| memref::Alloc::matches(ctx, def));
        let only_freed = ctx
            .users(buffer)
            .iter()
            .all(|&user| memref::Dealloc::matches(ctx, user));
        if !allocated || !only_freed {
            return false;
        }
        rewriter.erase_op(vec![]);
        true
    }

    fn name(&self) -> &'static str {
        "EraseDeallocOfUnusedAlloc"
    }

    fn root(&self) -> Option<OpName> {
        Some(memref::Dealloc::op_name())
    }
}

/// Loops with constant bounds that run zero times are erased; loops that run
/// exactly once are replaced by their body with the induction variables
/// bound to the lower bounds.
struct SimplifyTrivialLoop;

/// Trip count of a constant `lb..ub step s` dimension.
fn constant_trip_count(ctx: &IrContext, lb: ValueRef, ub: ValueRef, step: ValueRef) -> Option<i64> {
    let lb = arith::constant_int(ctx, lb)?;
    let ub = arith::constant_int(ctx, ub)?;
    let step = arith::constant_int(ctx, step)?;
    if step <= 0 {
        return None;
    }
    Some(if ub <= lb { 0 } else { (ub - lb + step - 1) / step })
}

impl RewritePattern for SimplifyTrivialLoop {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Some(lp) = scf::AnyLoop::from_op(ctx, op) else {
            return false;
        };
        let dims = lp.dims(ctx);
        let trips: Option<Vec<i64>> = dims
            .iter()
            .map(|&(lb, ub, step, _)| constant_trip_count(ctx, lb, ub, step))
            .collect();
        let Some(trips) = trips else {
            return false;
        };

        if trips.contains(&0) {
            rewriter.erase_op(vec![]);
            return true;
        }
        if trips.iter().any(|&t| t != 1) {
            return false;
        }

        let body = lp.body_block(ctx);
        for &(lb, _, _, iv) in &dims {
            ctx.replace_all_uses(iv, lb);
        }
        let ops: Vec<OpRef> = ctx.block(body).ops.to_vec();
        for inner in ops {
            if scf::Yield::matches(ctx, inner) {
                continue;
            }
            ctx.remove_op_from_block(body, inner);
            rewriter.insert_op(inner);
        }
        rewriter.erase_op(vec![]);
        true
    }

    fn name(&self) -> &'static str {
        "SimplifyTrivialLoop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::func;
    use crate::symbol::Symbol;
    use crate::types::{Location, Span};

    struct Fixture {
        ctx: IrContext,
        loc: Location,
        func: func::Func,
    }

    impl Fixture {
        /// `func @f(%buf: memref<4xindex>, %x: index)`
        fn new() -> Self {
            let mut ctx = IrContext::new();
            let path = ctx.paths.intern("canonicalize.mlir".to_owned());
            let loc = Location::new(path, Span::default());
            let index = ctx.types.index();
            let buf = ctx.types.memref(index, &[4], 0);
            let func = func::func(&mut ctx, loc, Symbol::new("f"), &[buf, index]);
            Self { ctx, loc, func }
        }

        fn entry(&self) -> crate::BlockRef {
            self.func.entry_block(&self.ctx)
        }

        fn arg(&self, i: usize) -> ValueRef {
            self.func.args(&self.ctx)[i]
        }

        fn push(&mut self, op: OpRef) {
            let entry = self.entry();
            self.ctx.push_op(entry, op);
        }

        fn index(&mut self, v: i64) -> ValueRef {
            let c = arith::const_index(&mut self.ctx, self.loc, v);
            self.push(c.op_ref());
            c.result(&self.ctx)
        }

        fn store(&mut self, value: ValueRef, index: ValueRef) -> memref::Store {
            let buf = self.arg(0);
            let st = memref::store(&mut self.ctx, self.loc, value, buf, [index]);
            self.push(st.op_ref());
            st
        }

        fn run(&mut self) -> CanonicalizeResult {
            let ret = func::r#return(&mut self.ctx, self.loc, []);
            self.push(ret.op_ref());
            canonicalize(&mut self.ctx, self.func.op_ref(), GreedyRewriteConfig::default()).unwrap()
        }
    }

    #[test]
    fn folds_constant_chains() {
        let mut fx = Fixture::new();
        let c0 = fx.index(0);
        let c2 = fx.index(2);
        let c3 = fx.index(3);
        let add = arith::addi(&mut fx.ctx, fx.loc, c2, c3);
        fx.push(add.op_ref());
        let sum = add.result(&fx.ctx);
        let mul = arith::muli(&mut fx.ctx, fx.loc, sum, c2);
        fx.push(mul.op_ref());
        let st = fx.store(mul.result(&fx.ctx), c0);

        let result = fx.run();
        assert!(result.rewrite.reached_fixpoint);
        assert_eq!(arith::constant_int(&fx.ctx, st.value(&fx.ctx)), Some(10));
        // c0, the folded 10, the store and the return remain
        assert_eq!(fx.ctx.block(fx.entry()).ops.len(), 4);
    }

    #[test]
    fn folds_identities_to_the_operand() {
        let mut fx = Fixture::new();
        let x = fx.arg(1);
        let c0 = fx.index(0);
        let c1 = fx.index(1);
        let add = arith::addi(&mut fx.ctx, fx.loc, x, c0);
        fx.push(add.op_ref());
        let sum = add.result(&fx.ctx);
        let mul = arith::muli(&mut fx.ctx, fx.loc, c1, sum);
        fx.push(mul.op_ref());
        let product = mul.result(&fx.ctx);
        let min = arith::minsi(&mut fx.ctx, fx.loc, product, product);
        fx.push(min.op_ref());
        let st = fx.store(min.result(&fx.ctx), c0);

        fx.run();
        assert_eq!(st.value(&fx.ctx), x);
    }

    #[test]
    fn inlines_single_trip_loops_and_drops_empty_ones() {
        let mut fx = Fixture::new();
        let c0 = fx.index(0);
        let c4 = fx.index(4);
        let once = scf::for_loop(&mut fx.ctx, fx.loc, c0, c4, c4);
        fx.push(once.op_ref());
        let iv = once.induction_var(&fx.ctx);
        let buf = fx.arg(0);
        let inner = memref::store(&mut fx.ctx, fx.loc, iv, buf, [iv]);
        let once_body = once.body_block(&fx.ctx);
        scf::insert_in_body(&mut fx.ctx, once_body, inner.op_ref());

        let never = scf::for_loop(&mut fx.ctx, fx.loc, c4, c0, c4);
        fx.push(never.op_ref());
        let dropped = memref::store(&mut fx.ctx, fx.loc, c0, buf, [c0]);
        let never_body = never.body_block(&fx.ctx);
        scf::insert_in_body(&mut fx.ctx, never_body, dropped.op_ref());

        fx.run();
        let ops = fx.ctx.block(fx.entry()).ops.to_vec();
        assert!(ops.iter().all(|&op| scf::AnyLoop::from_op(&fx.ctx, op).is_none()));
        assert_eq!(fx.ctx.parent_op(inner.op_ref()), Some(fx.func.op_ref()));
        assert_eq!(inner.value(&fx.ctx), c0);
        assert_eq!(inner.indices(&fx.ctx), &[c0]);
        assert_eq!(fx.ctx.op(dropped.op_ref()).parent_block, None);
    }

    #[test]
    fn folds_dims_and_unused_buffers() {
        let mut fx = Fixture::new();
        let c0 = fx.index(0);
        let buf = fx.arg(0);
        let dim = memref::dim(&mut fx.ctx, fx.loc, buf, 0);
        fx.push(dim.op_ref());
        let st = fx.store(dim.result(&fx.ctx), c0);

        let f32_ty = fx.ctx.types.f32();
        let local_ty = fx.ctx.types.memref(f32_ty, &[8], 0);
        let local = memref::alloc(&mut fx.ctx, fx.loc, local_ty, None);
        fx.push(local.op_ref());
        let localv = local.result(&fx.ctx);
        let free = memref::dealloc(&mut fx.ctx, fx.loc, localv);
        fx.push(free.op_ref());
        let selfcopy = memref::copy(&mut fx.ctx, fx.loc, buf, buf);
        fx.push(selfcopy.op_ref());

        fx.run();
        assert_eq!(arith::constant_int(&fx.ctx, st.value(&fx.ctx)), Some(4));
        for gone in [local.op_ref(), free.op_ref(), selfcopy.op_ref(), dim.op_ref()] {
            assert_eq!(fx.ctx.op(gone).parent_block, None);
        }
    }
}
