//! `linalg` dialect: structured operations on buffers.
//!
//! A structured operation is described by its loop iterators and, for each
//! shaped operand, the list of loops indexing that operand's dimensions
//! ([`StructuredInfo`]). Tiling, promotion and vectorization are written
//! against that description rather than against individual operations.

use super::{IteratorType, create, op_builder};
use crate::context::IrContext;
use crate::ops::OpKind;
use crate::refs::{OpRef, ValueRef};
use crate::types::{Location, MemRefType};

crate::define_op! {
    /// `C += A * B` over `MxK`, `KxN` and `MxN` buffers.
    pub struct Matmul => "linalg", "matmul";
    /// `y += A * x` over `MxN`, `N` and `M` buffers.
    pub struct Matvec => "linalg", "matvec";
    /// Set every element of the output buffer to a scalar.
    pub struct Fill => "linalg", "fill";
}

pub fn matmul(ctx: &mut IrContext, loc: Location, a: ValueRef, b: ValueRef, c: ValueRef) -> Matmul {
    create(ctx, op_builder::<Matmul>(loc).operands([a, b, c]))
}

pub fn matvec(ctx: &mut IrContext, loc: Location, a: ValueRef, x: ValueRef, y: ValueRef) -> Matvec {
    create(ctx, op_builder::<Matvec>(loc).operands([a, x, y]))
}

pub fn fill(ctx: &mut IrContext, loc: Location, value: ValueRef, output: ValueRef) -> Fill {
    create(ctx, op_builder::<Fill>(loc).operands([value, output]))
}

impl Fill {
    pub fn value(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn output(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }
}

/// How one shaped operand is indexed by the loops of a structured op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperandMap {
    /// Position in the operation's operand list.
    pub operand: usize,
    /// Loop index for each dimension of the operand.
    pub dims: Vec<usize>,
    pub is_output: bool,
}

/// Loop structure of a structured operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructuredInfo {
    pub iterator_types: Vec<IteratorType>,
    pub operands: Vec<OperandMap>,
}

impl StructuredInfo {
    pub fn num_loops(&self) -> usize {
        self.iterator_types.len()
    }

    /// The first operand dimension `(operand, dim)` indexed by `loop_idx`.
    pub fn operand_dim_for_loop(&self, loop_idx: usize) -> Option<(usize, usize)> {
        self.operands.iter().find_map(|map| {
            map.dims
                .iter()
                .position(|&l| l == loop_idx)
                .map(|d| (map.operand, d))
        })
    }

    pub fn operand(&self, operand: usize) -> Option<&OperandMap> {
        self.operands.iter().find(|m| m.operand == operand)
    }
}

fn shaped(operand: usize, dims: &[usize], is_output: bool) -> OperandMap {
    OperandMap {
        operand,
        dims: dims.to_vec(),
        is_output,
    }
}

/// The loop structure of `op`, or `None` if it is not a structured op.
pub fn structured_info(ctx: &IrContext, op: OpRef) -> Option<StructuredInfo> {
    use IteratorType::{Parallel, Reduction};

    if Matmul::matches(ctx, op) {
        Some(StructuredInfo {
            iterator_types: vec![Parallel, Parallel, Reduction],
            operands: vec![
                shaped(0, &[0, 2], false),
                shaped(1, &[2, 1], false),
                shaped(2, &[0, 1], true),
            ],
        })
    } else if Matvec::matches(ctx, op) {
        Some(StructuredInfo {
            iterator_types: vec![Parallel, Reduction],
            operands: vec![shaped(0, &[0, 1], false), shaped(1, &[1], false), shaped(2, &[0], true)],
        })
    } else if Fill::matches(ctx, op) {
        let output = ctx.op_operands(op)[1];
        let rank = MemRefType::from_type(&ctx.types, ctx.value_ty(output))?.rank();
        let dims: Vec<usize> = (0..rank).collect();
        Some(StructuredInfo {
            iterator_types: vec![Parallel; rank],
            operands: vec![shaped(1, &dims, true)],
        })
    } else {
        None
    }
}

/// Interface view over every structured operation.
///
/// `LinalgOp` does not denote a single operation kind, so its
/// [`OpKind::OPERATION_NAME`] is `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinalgOp(OpRef);

impl LinalgOp {
    pub fn from_op(ctx: &IrContext, op: OpRef) -> Option<Self> {
        <Self as OpKind>::matches(ctx, op).then_some(Self(op))
    }

    pub fn op_ref(&self) -> OpRef {
        self.0
    }

    /// Loop structure; empty if the operation was rewritten into a
    /// different kind since this view was taken.
    pub fn info(&self, ctx: &IrContext) -> StructuredInfo {
        structured_info(ctx, self.0).unwrap_or(StructuredInfo {
            iterator_types: Vec::new(),
            operands: Vec::new(),
        })
    }
}

impl OpKind for LinalgOp {
    const OPERATION_NAME: Option<&'static str> = None;

    fn matches(ctx: &IrContext, op: OpRef) -> bool {
        structured_info(ctx, op).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::arith;
    use crate::types::Span;

    #[test]
    fn matmul_and_fill_are_structured() {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("linalg.mlir".to_owned());
        let loc = Location::new(path, Span::default());
        let f32_ty = ctx.types.f32();
        let ty = ctx.types.memref(f32_ty, &[4, 4], 0);
        let buf = crate::dialect::memref::alloc(&mut ctx, loc, ty, None).result(&ctx);
        let mm = matmul(&mut ctx, loc, buf, buf, buf);
        let zero = arith::const_f32(&mut ctx, loc, 0.0).result(&ctx);
        let fl = fill(&mut ctx, loc, zero, buf);

        let info = LinalgOp::from_op(&ctx, mm.op_ref()).unwrap().info(&ctx);
        assert_eq!(info.num_loops(), 3);
        assert_eq!(info.operand_dim_for_loop(2), Some((0, 1)));
        assert_eq!(info.operand_dim_for_loop(1), Some((1, 1)));

        let fill_info = structured_info(&ctx, fl.op_ref()).unwrap();
        assert_eq!(fill_info.iterator_types, vec![IteratorType::Parallel; 2]);
        assert!(fill_info.operand(1).unwrap().is_output);

        assert!(LinalgOp::from_op(&ctx, zero_op(&ctx, zero)).is_none());
    }

    fn zero_op(ctx: &IrContext, v: ValueRef) -> OpRef {
        ctx.defining_op(v).unwrap()
    }
}
