//! Memory effects of operations.
//!
//! Effects are derived from the operation name. Operations with regions
//! report the union of the effects of everything nested inside them.

use std::ops::ControlFlow;

use smallvec::SmallVec;

use crate::context::IrContext;
use crate::dialect::{func, linalg, memref, scf, vector};
use crate::ops::DialectOp;
use crate::refs::{OpRef, ValueRef};
use crate::walk::{WalkAction, walk_op};

/// Coarse effect summary of an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Effects {
    pub read: bool,
    pub write: bool,
    pub allocate: bool,
    pub free: bool,
}

impl Effects {
    pub const NONE: Effects = Effects {
        read: false,
        write: false,
        allocate: false,
        free: false,
    };

    pub fn is_pure(&self) -> bool {
        *self == Effects::NONE
    }

    fn union(self, other: Effects) -> Effects {
        Effects {
            read: self.read || other.read,
            write: self.write || other.write,
            allocate: self.allocate || other.allocate,
            free: self.free || other.free,
        }
    }
}

/// Effects of `op` alone, ignoring nested regions.
fn own_effects(ctx: &IrContext, op: OpRef) -> Effects {
    let read = Effects {
        read: true,
        ..Effects::NONE
    };
    let write = Effects {
        write: true,
        ..Effects::NONE
    };
    if memref::Alloc::matches(ctx, op) || memref::Alloca::matches(ctx, op) {
        Effects {
            allocate: true,
            ..Effects::NONE
        }
    } else if memref::Dealloc::matches(ctx, op) {
        Effects {
            free: true,
            ..Effects::NONE
        }
    } else if memref::Load::matches(ctx, op)
        || vector::Load::matches(ctx, op)
        || vector::TransferRead::matches(ctx, op)
    {
        read
    } else if memref::Store::matches(ctx, op)
        || vector::Store::matches(ctx, op)
        || vector::TransferWrite::matches(ctx, op)
    {
        write
    } else if memref::Copy::matches(ctx, op)
        || linalg::Matmul::matches(ctx, op)
        || linalg::Matvec::matches(ctx, op)
    {
        read.union(write)
    } else if linalg::Fill::matches(ctx, op) {
        write
    } else if ctx.op(op).dialect == "func" && !func::Return::matches(ctx, op) {
        // Function definitions and calls are never considered removable.
        read.union(write)
    } else {
        Effects::NONE
    }
}

/// Effects of `op` including everything nested in its regions.
pub fn effects(ctx: &IrContext, op: OpRef) -> Effects {
    let mut total = Effects::NONE;
    let _ = walk_op::<()>(ctx, op, &mut |nested| {
        total = total.union(own_effects(ctx, nested));
        ControlFlow::Continue(WalkAction::Advance)
    });
    total
}

/// Whether `op` ends a block and must be kept.
pub fn is_terminator(ctx: &IrContext, op: OpRef) -> bool {
    func::Return::matches(ctx, op) || scf::Yield::matches(ctx, op)
}

/// Whether `op` and everything nested in it has no memory effects.
pub fn is_pure(ctx: &IrContext, op: OpRef) -> bool {
    !is_terminator(ctx, op) && effects(ctx, op).is_pure()
}

/// Whether `op` can be erased without changing behavior: it is pure (or only
/// allocates) and none of its results are used.
pub fn is_trivially_dead(ctx: &IrContext, op: OpRef) -> bool {
    if is_terminator(ctx, op) {
        return false;
    }
    let fx = effects(ctx, op);
    let removable = fx.is_pure()
        || (fx
            == Effects {
                allocate: true,
                ..Effects::NONE
            });
    removable && ctx.op_results(op).iter().all(|&r| !ctx.has_uses(r))
}

/// Buffers (operand values) written by `op` itself.
pub fn written_buffers(ctx: &IrContext, op: OpRef) -> SmallVec<[ValueRef; 2]> {
    let operands = ctx.op_operands(op);
    let mut out = SmallVec::new();
    if let Ok(store) = memref::Store::from_op(ctx, op) {
        out.push(store.memref(ctx));
    } else if let Ok(store) = vector::Store::from_op(ctx, op) {
        out.push(store.memref(ctx));
    } else if let Ok(write) = vector::TransferWrite::from_op(ctx, op) {
        out.push(write.dest(ctx));
    } else if let Ok(copy) = memref::Copy::from_op(ctx, op) {
        out.push(copy.target(ctx));
    } else if let Some(info) = linalg::structured_info(ctx, op) {
        out.extend(
            info.operands
                .iter()
                .filter(|m| m.is_output)
                .map(|m| operands[m.operand]),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::arith;
    use crate::types::{Location, Span};

    #[test]
    fn classify_common_ops() {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("fx.mlir".to_owned());
        let loc = Location::new(path, Span::default());
        let f32_ty = ctx.types.f32();
        let ty = ctx.types.memref(f32_ty, &[4], 0);

        let c = arith::const_index(&mut ctx, loc, 0);
        let buf = memref::alloc(&mut ctx, loc, ty, None);
        let bv = buf.result(&ctx);
        let cv = c.result(&ctx);
        let load = memref::load(&mut ctx, loc, bv, [cv]);
        let lv = load.result(&ctx);
        let store = memref::store(&mut ctx, loc, lv, bv, [cv]);

        assert!(is_pure(&ctx, c.op_ref()));
        assert!(!is_trivially_dead(&ctx, buf.op_ref()));
        assert!(effects(&ctx, load.op_ref()).read);
        assert_eq!(written_buffers(&ctx, store.op_ref()).as_slice(), &[bv]);

        let unused = memref::alloc(&mut ctx, loc, ty, None);
        assert!(is_trivially_dead(&ctx, unused.op_ref()));
    }

    #[test]
    fn loops_take_the_union_of_their_bodies() {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("fx.mlir".to_owned());
        let loc = Location::new(path, Span::default());
        let c = arith::const_index(&mut ctx, loc, 0).result(&ctx);
        let lp = scf::for_loop(&mut ctx, loc, c, c, c);
        assert!(is_pure(&ctx, lp.op_ref()));

        let f32_ty = ctx.types.f32();
        let ty = ctx.types.memref(f32_ty, &[4], 0);
        let buf = memref::alloc(&mut ctx, loc, ty, None).result(&ctx);
        let zero = arith::const_f32(&mut ctx, loc, 0.0).result(&ctx);
        let fill = linalg::fill(&mut ctx, loc, zero, buf);
        let body = lp.body_block(&ctx);
        scf::insert_in_body(&mut ctx, body, fill.op_ref());
        assert!(effects(&ctx, lp.op_ref()).write);
        assert!(!is_trivially_dead(&ctx, lp.op_ref()));
    }
}
