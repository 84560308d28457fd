//! Vectorization of statically shaped structured operations.

use tracing::{debug, trace};

use tessera_ir::dialect::linalg::{self, OperandMap, structured_info};
use tessera_ir::dialect::{arith, vector};
use tessera_ir::ops::DialectOp;
use tessera_ir::rewrite::{PatternRewriter, RewritePattern};
use tessera_ir::{IrContext, Location, MemRefType, OpName, OpRef, TypeRef, ValueRef};

use crate::filter::TransformationFilter;
use crate::options::VectorizationOptions;
use crate::strategy::OpTarget;

/// Rewrites a structured operation on statically shaped `f32` buffers into
/// whole-buffer vector transfers around a `vector.contract`, or a
/// `vector.broadcast` for `linalg.fill`.
pub struct LinalgVectorizationPattern {
    target: OpTarget,
    options: VectorizationOptions,
    filter: TransformationFilter,
}

impl LinalgVectorizationPattern {
    pub fn new(target: OpTarget, options: VectorizationOptions, filter: TransformationFilter) -> Self {
        Self {
            target,
            options,
            filter,
        }
    }

    pub fn options(&self) -> &VectorizationOptions {
        &self.options
    }
}

/// Static `f32` shape of every shaped operand, in operand map order.
fn static_shapes(ctx: &IrContext, operands: &[ValueRef], maps: &[OperandMap]) -> Option<Vec<MemRefType>> {
    maps.iter()
        .map(|map| {
            let ty = MemRefType::from_type(&ctx.types, ctx.value_ty(operands[map.operand]))?;
            (ty.has_static_shape() && ctx.types.is_f32(ty.elem)).then_some(ty)
        })
        .collect()
}

fn vector_type(ctx: &mut IrContext, ty: &MemRefType) -> TypeRef {
    ctx.types.vector(ty.elem, &ty.shape)
}

fn origin(ctx: &mut IrContext, rewriter: &mut PatternRewriter, loc: Location, rank: usize) -> Vec<ValueRef> {
    let zero = arith::const_index(ctx, loc, 0);
    rewriter.insert_op(zero.op_ref());
    vec![zero.result(ctx); rank]
}

impl RewritePattern for LinalgVectorizationPattern {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        if !self.target.matches(ctx, op) || !self.filter.check(ctx, op) {
            return false;
        }
        let Some(info) = structured_info(ctx, op) else {
            return false;
        };
        let operands: Vec<ValueRef> = ctx.op_operands(op).to_vec();
        let Some(shapes) = static_shapes(ctx, &operands, &info.operands) else {
            debug!(%op, "operands are not statically shaped f32 buffers");
            return false;
        };
        let loc = ctx.op(op).location;

        if let Ok(fill) = linalg::Fill::from_op(ctx, op) {
            let ty = vector_type(ctx, &shapes[0]);
            let splat = vector::broadcast(ctx, loc, ty, fill.value(ctx));
            rewriter.insert_op(splat.op_ref());
            let indices = origin(ctx, rewriter, loc, shapes[0].rank());
            let write = vector::transfer_write(ctx, loc, splat.result(ctx), fill.output(ctx), &indices, true);
            rewriter.insert_op(write.op_ref());
            self.filter.mark(write.op_ref());
            trace!(%op, "vectorized fill");
            rewriter.erase_op(Vec::new());
            return true;
        }

        // Contraction form: two inputs and one accumulator.
        let [lhs, rhs, acc] = info.operands.as_slice() else {
            return false;
        };
        if lhs.is_output || rhs.is_output || !acc.is_output {
            return false;
        }

        let pad = arith::zero(ctx, loc, shapes[0].elem);
        rewriter.insert_op(pad.op_ref());
        let mut reads = Vec::with_capacity(3);
        for (map, shape) in info.operands.iter().zip(&shapes) {
            let ty = vector_type(ctx, shape);
            let indices = origin(ctx, rewriter, loc, shape.rank());
            let read = vector::transfer_read(
                ctx,
                loc,
                ty,
                operands[map.operand],
                &indices,
                pad.result(ctx),
                true,
            );
            rewriter.insert_op(read.op_ref());
            reads.push(read.result(ctx));
        }
        let contract = vector::contract(
            ctx,
            loc,
            reads[0],
            reads[1],
            reads[2],
            [lhs.dims.as_slice(), rhs.dims.as_slice(), acc.dims.as_slice()],
            &info.iterator_types,
        );
        rewriter.insert_op(contract.op_ref());
        let indices = origin(ctx, rewriter, loc, shapes[2].rank());
        let write = vector::transfer_write(
            ctx,
            loc,
            contract.result(ctx),
            operands[acc.operand],
            &indices,
            true,
        );
        rewriter.insert_op(write.op_ref());
        self.filter.mark(contract.op_ref());
        trace!(%op, contract = %contract.op_ref(), "vectorized contraction");
        rewriter.erase_op(Vec::new());
        true
    }

    fn name(&self) -> &'static str {
        "LinalgVectorizationPattern"
    }

    fn root(&self) -> Option<OpName> {
        Some(self.target.name())
    }
}
