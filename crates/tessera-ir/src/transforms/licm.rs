//! Loop-invariant code motion.
//!
//! Loops are visited innermost first, so an operation hoisted out of an inner
//! loop is considered again for every enclosing loop.

use tracing::trace;

use crate::context::IrContext;
use crate::dialect::{memref, scf};
use crate::effects;
use crate::ops::DialectOp;
use crate::refs::{BlockRef, OpRef};
use crate::types::MemRefType;
use crate::walk::post_order;

/// Move pure, region-free operations whose operands are all defined outside
/// their loop in front of that loop. Returns the number of moves.
pub fn hoist_loop_invariant_code(ctx: &mut IrContext, root: OpRef) -> usize {
    let mut hoisted = 0;
    for op in post_order(ctx, root) {
        let Some(lp) = scf::AnyLoop::from_op(ctx, op) else {
            continue;
        };
        let body = lp.body_block(ctx);
        let candidates: Vec<OpRef> = ctx.block(body).ops.to_vec();
        for candidate in candidates {
            if is_loop_invariant(ctx, candidate, op) {
                trace!(%candidate, "hoisting invariant op");
                ctx.move_op_before(candidate, op);
                hoisted += 1;
            }
        }
    }
    hoisted
}

fn is_loop_invariant(ctx: &IrContext, op: OpRef, loop_op: OpRef) -> bool {
    ctx.op(op).regions.is_empty()
        && effects::is_pure(ctx, op)
        && ctx
            .op_operands(op)
            .iter()
            .all(|&v| !ctx.is_defined_inside(v, loop_op))
}

/// Move statically shaped local buffers out of the `scf.for` loops
/// allocating them.
///
/// A heap buffer is only moved when its `memref.dealloc` (if any) sits in the
/// same loop body; the deallocation then moves right after the loop. Buffers
/// of `scf.parallel` iterations stay private to each iteration. Returns the
/// number of buffers moved, counting once per loop level.
pub fn hoist_allocations(ctx: &mut IrContext, root: OpRef) -> usize {
    let mut hoisted = 0;
    for op in post_order(ctx, root) {
        let Ok(lp) = scf::For::from_op(ctx, op) else {
            continue;
        };
        let body = lp.body_block(ctx);
        let candidates: Vec<OpRef> = ctx.block(body).ops.to_vec();
        for candidate in candidates {
            if hoist_allocation(ctx, candidate, body, op) {
                hoisted += 1;
            }
        }
    }
    hoisted
}

fn hoist_allocation(ctx: &mut IrContext, op: OpRef, body: BlockRef, loop_op: OpRef) -> bool {
    let buffer = if let Ok(alloc) = memref::Alloc::from_op(ctx, op) {
        alloc.result(ctx)
    } else if let Ok(alloca) = memref::Alloca::from_op(ctx, op) {
        alloca.result(ctx)
    } else {
        return false;
    };
    let is_static = MemRefType::from_type(&ctx.types, ctx.value_ty(buffer))
        .is_some_and(|ty| ty.has_static_shape());
    if !is_static || !ctx.op_operands(op).is_empty() {
        return false;
    }

    let deallocs: Vec<OpRef> = ctx
        .users(buffer)
        .into_iter()
        .filter(|&user| memref::Dealloc::matches(ctx, user))
        .collect();
    if deallocs
        .iter()
        .any(|&d| ctx.op(d).parent_block != Some(body))
    {
        return false;
    }

    trace!(%op, "hoisting allocation out of loop");
    ctx.move_op_before(op, loop_op);
    for dealloc in deallocs {
        ctx.move_op_after(dealloc, loop_op);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{arith, func};
    use crate::refs::ValueRef;
    use crate::symbol::Symbol;
    use crate::types::{Location, Span};

    fn setup(ctx: &mut IrContext) -> (func::Func, Location, ValueRef) {
        let path = ctx.paths.intern("licm.mlir".to_owned());
        let loc = Location::new(path, Span::default());
        let index = ctx.types.index();
        let ty = ctx.types.memref(index, &[16], 0);
        let f = func::func(ctx, loc, Symbol::new("f"), &[ty]);
        let buf = f.args(ctx)[0];
        (f, loc, buf)
    }

    fn for_in(ctx: &mut IrContext, loc: Location, block: BlockRef, n: i64) -> scf::For {
        let lb = arith::const_index(ctx, loc, 0);
        let ub = arith::const_index(ctx, loc, n);
        let step = arith::const_index(ctx, loc, 1);
        let (lbv, ubv, stepv) = (lb.result(ctx), ub.result(ctx), step.result(ctx));
        let lp = scf::for_loop(ctx, loc, lbv, ubv, stepv);
        for op in [lb.op_ref(), ub.op_ref(), step.op_ref(), lp.op_ref()] {
            scf::insert_in_body(ctx, block, op);
        }
        lp
    }

    #[test]
    fn hoists_invariant_arithmetic_through_nested_loops() {
        let mut ctx = IrContext::new();
        let (f, loc, buf) = setup(&mut ctx);
        let entry = f.entry_block(&ctx);
        let outer = for_in(&mut ctx, loc, entry, 4);
        let outer_body = outer.body_block(&ctx);
        let inner = for_in(&mut ctx, loc, outer_body, 4);
        let body = inner.body_block(&ctx);

        let c = arith::const_index(&mut ctx, loc, 3);
        let cv = c.result(&ctx);
        let twice = arith::addi(&mut ctx, loc, cv, cv);
        let iv = inner.induction_var(&ctx);
        let twicev = twice.result(&ctx);
        let varying = arith::addi(&mut ctx, loc, iv, twicev);
        let varyingv = varying.result(&ctx);
        let st = memref::store(&mut ctx, loc, cv, buf, [varyingv]);
        for op in [c.op_ref(), twice.op_ref(), varying.op_ref(), st.op_ref()] {
            scf::insert_in_body(&mut ctx, body, op);
        }

        let moved = hoist_loop_invariant_code(&mut ctx, f.op_ref());
        assert!(moved >= 2);
        assert_eq!(ctx.op(c.op_ref()).parent_block, Some(entry));
        assert_eq!(ctx.op(twice.op_ref()).parent_block, Some(entry));
        assert_eq!(ctx.op(varying.op_ref()).parent_block, Some(body));
        assert_eq!(ctx.op(st.op_ref()).parent_block, Some(body));
    }

    #[test]
    fn hoists_buffers_with_their_deallocation() {
        let mut ctx = IrContext::new();
        let (f, loc, _) = setup(&mut ctx);
        let entry = f.entry_block(&ctx);
        let lp = for_in(&mut ctx, loc, entry, 4);
        let body = lp.body_block(&ctx);

        let f32_ty = ctx.types.f32();
        let ty = ctx.types.memref(f32_ty, &[4, 4], 3);
        let alloc = memref::alloc(&mut ctx, loc, ty, Some(16));
        let buffer = alloc.result(&ctx);
        let zero = arith::const_f32(&mut ctx, loc, 0.0);
        let zerov = zero.result(&ctx);
        let fill = crate::dialect::linalg::fill(&mut ctx, loc, zerov, buffer);
        let free = memref::dealloc(&mut ctx, loc, buffer);
        for op in [alloc.op_ref(), zero.op_ref(), fill.op_ref(), free.op_ref()] {
            scf::insert_in_body(&mut ctx, body, op);
        }

        assert_eq!(hoist_allocations(&mut ctx, f.op_ref()), 1);
        let ops = ctx.block(entry).ops.to_vec();
        let at = |op: OpRef| ops.iter().position(|&o| o == op).unwrap();
        assert!(at(alloc.op_ref()) < at(lp.op_ref()));
        assert_eq!(at(free.op_ref()), at(lp.op_ref()) + 1);
        assert_eq!(ctx.op(fill.op_ref()).parent_block, Some(body));
    }

    #[test]
    fn parallel_iterations_keep_their_buffers() {
        let mut ctx = IrContext::new();
        let (f, loc, _) = setup(&mut ctx);
        let entry = f.entry_block(&ctx);
        let c0 = arith::const_index(&mut ctx, loc, 0);
        let c4 = arith::const_index(&mut ctx, loc, 4);
        let (c0v, c4v) = (c0.result(&ctx), c4.result(&ctx));
        let par = scf::parallel(&mut ctx, loc, &[c0v], &[c4v], &[c4v]);
        for op in [c0.op_ref(), c4.op_ref(), par.op_ref()] {
            scf::insert_in_body(&mut ctx, entry, op);
        }
        let par_body = par.body_block(&ctx);
        let inner = for_in(&mut ctx, loc, par_body, 4);
        let body = inner.body_block(&ctx);

        let f32_ty = ctx.types.f32();
        let ty = ctx.types.memref(f32_ty, &[4], 0);
        let alloc = memref::alloc(&mut ctx, loc, ty, None);
        let buffer = alloc.result(&ctx);
        let free = memref::dealloc(&mut ctx, loc, buffer);
        for op in [alloc.op_ref(), free.op_ref()] {
            scf::insert_in_body(&mut ctx, body, op);
        }

        // Out of the sequential loop, but not out of the parallel one.
        assert_eq!(hoist_allocations(&mut ctx, f.op_ref()), 1);
        assert_eq!(ctx.op(alloc.op_ref()).parent_block, Some(par_body));
        assert_eq!(ctx.op(free.op_ref()).parent_block, Some(par_body));
    }
}
