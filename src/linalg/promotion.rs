//! Promotion of tiles into local buffers.

use tracing::{debug, trace};

use tessera_ir::dialect::linalg::structured_info;
use tessera_ir::dialect::memref::{self, IndexValue};
use tessera_ir::dialect::{arith, linalg};
use tessera_ir::ops::DialectOp;
use tessera_ir::rewrite::{PatternRewriter, RewritePattern};
use tessera_ir::{IrContext, MemRefType, OpName, OpRef, TypeRef, ValueRef};

use crate::filter::TransformationFilter;
use crate::options::PromotionOptions;
use crate::strategy::OpTarget;

/// Copies the `memref.subview` operands of a structured operation into
/// local buffers and runs the operation on those buffers instead.
///
/// Each buffer is sized by a static bound of its tile. When the tile is
/// smaller than that bound, the operation runs either on a view of the
/// buffer matching the tile, or, with full tile buffers, on the whole buffer
/// zero-filled before the copy. Outputs are copied back after the operation.
pub struct LinalgPromotionPattern {
    target: OpTarget,
    options: PromotionOptions,
    filter: TransformationFilter,
}

impl LinalgPromotionPattern {
    pub fn new(target: OpTarget, options: PromotionOptions, filter: TransformationFilter) -> Self {
        Self {
            target,
            options,
            filter,
        }
    }
}

struct Candidate {
    position: usize,
    view: ValueRef,
    elem: TypeRef,
    sizes: Vec<IndexValue>,
    bounds: Vec<i64>,
    exact: bool,
    is_output: bool,
}

/// A static upper bound of a tile extent and whether it is exact.
///
/// Boundary tiles produced by tiling have extent `min(step, ub - iv)`, which
/// is bounded by the constant step.
fn static_bound(ctx: &IrContext, size: IndexValue) -> Option<(i64, bool)> {
    if let Some(value) = size.constant(ctx) {
        return Some((value, true));
    }
    let IndexValue::Dynamic(value) = size else {
        return None;
    };
    let min = arith::MinSI::from_op(ctx, ctx.defining_op(value)?).ok()?;
    let lhs = arith::constant_int(ctx, min.lhs(ctx));
    let rhs = arith::constant_int(ctx, min.rhs(ctx));
    let bound = match (lhs, rhs) {
        (Some(a), Some(b)) => a.min(b),
        (Some(c), None) | (None, Some(c)) => c,
        (None, None) => return None,
    };
    Some((bound, false))
}

impl LinalgPromotionPattern {
    fn candidates(&self, ctx: &IrContext, op: OpRef) -> Option<Vec<Candidate>> {
        let info = structured_info(ctx, op)?;
        let operands = ctx.op_operands(op);
        let mut found = Vec::new();
        for map in &info.operands {
            if !self.options.promotes(map.operand) {
                continue;
            }
            let value = operands[map.operand];
            let Some(view) = ctx
                .defining_op(value)
                .and_then(|def| memref::SubView::from_op(ctx, def).ok())
            else {
                continue;
            };
            let ty = MemRefType::from_type(&ctx.types, ctx.value_ty(value))?;
            let sizes: Vec<IndexValue> = view.sizes(ctx).into_iter().collect();
            let Some(bounds) = sizes
                .iter()
                .map(|&s| static_bound(ctx, s))
                .collect::<Option<Vec<_>>>()
            else {
                debug!(%op, operand = map.operand, "tile has no static bounding box");
                return None;
            };
            found.push(Candidate {
                position: map.operand,
                view: value,
                elem: ty.elem,
                sizes,
                exact: bounds.iter().all(|&(_, exact)| exact),
                bounds: bounds.into_iter().map(|(b, _)| b).collect(),
                is_output: map.is_output,
            });
        }
        (!found.is_empty()).then_some(found)
    }
}

impl RewritePattern for LinalgPromotionPattern {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        if !self.target.matches(ctx, op) || !self.filter.check(ctx, op) {
            return false;
        }
        let Some(candidates) = self.candidates(ctx, op) else {
            return false;
        };

        let loc = ctx.op(op).location;
        let mut operands: Vec<ValueRef> = ctx.op_operands(op).to_vec();
        let mut epilogue = Vec::new();
        let mut frees = Vec::new();
        for c in &candidates {
            let buffer_ty = ctx.types.memref(c.elem, &c.bounds, self.options.memory_space);
            let (alloc_op, buffer) = if self.options.use_alloca {
                let a = memref::alloca(ctx, loc, buffer_ty, self.options.alignment);
                (a.op_ref(), a.result(ctx))
            } else {
                let a = memref::alloc(ctx, loc, buffer_ty, self.options.alignment);
                (a.op_ref(), a.result(ctx))
            };
            rewriter.insert_op(alloc_op);

            let partial = if c.exact {
                buffer
            } else {
                let zeros = vec![IndexValue::Static(0); c.sizes.len()];
                let view = memref::subview(ctx, loc, buffer, &zeros, &c.sizes);
                rewriter.insert_op(view.op_ref());
                view.result(ctx)
            };
            let full_tile = self.options.full_tile_buffer(c.position);
            if full_tile && !c.exact {
                let zero = arith::zero(ctx, loc, c.elem);
                rewriter.insert_op(zero.op_ref());
                let fill = linalg::fill(ctx, loc, zero.result(ctx), buffer);
                rewriter.insert_op(fill.op_ref());
            }
            let copy_in = memref::copy(ctx, loc, c.view, partial);
            rewriter.insert_op(copy_in.op_ref());

            operands[c.position] = if full_tile { buffer } else { partial };
            if c.is_output {
                epilogue.push(memref::copy(ctx, loc, partial, c.view).op_ref());
            }
            if !self.options.use_alloca {
                frees.push(memref::dealloc(ctx, loc, buffer).op_ref());
            }
            trace!(%op, operand = c.position, bounds = ?c.bounds, full_tile, "promoted operand");
        }

        let promoted = ctx.clone_op_with_operands(op, operands);
        self.filter.mark(promoted);
        rewriter.replace_op(promoted);
        for after in epilogue.into_iter().chain(frees) {
            rewriter.append_op(after);
        }
        true
    }

    fn name(&self) -> &'static str {
        "LinalgPromotionPattern"
    }

    fn root(&self) -> Option<OpName> {
        Some(self.target.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MarkerTable, StageMarker};
    use crate::linalg::testing::Fixture;
    use crate::linalg::tiling::LinalgTilingPattern;
    use crate::options::TilingOptions;
    use tessera_ir::rewrite::{GreedyRewriteConfig, RewritePatternSet, apply_patterns_greedily};
    use tessera_ir::walk::collect_nested;

    fn tile_then_promote(fx: &mut Fixture, tile_sizes: [i64; 3], options: PromotionOptions) -> MarkerTable {
        let markers = MarkerTable::new();
        let target = OpTarget::of::<linalg::Matmul>();
        let root = fx.func.op_ref();

        let mut tiling = RewritePatternSet::new();
        tiling.add(LinalgTilingPattern::new(
            target,
            TilingOptions::default().with_tile_sizes(tile_sizes),
            TransformationFilter::for_stage(0, None, markers.clone()),
        ));
        apply_patterns_greedily(&mut fx.ctx, root, &tiling, GreedyRewriteConfig::default()).unwrap();

        let mut promotion = RewritePatternSet::new();
        promotion.add(LinalgPromotionPattern::new(
            target,
            options,
            TransformationFilter::for_stage(1, None, markers.clone()),
        ));
        let result =
            apply_patterns_greedily(&mut fx.ctx, root, &promotion, GreedyRewriteConfig::default()).unwrap();
        assert_eq!(result.total_changes, 1);
        markers
    }

    #[test]
    fn promotes_exact_tiles_into_static_buffers() {
        let mut fx = Fixture::matmul(8, 8, 8);
        let markers = tile_then_promote(&mut fx, [4, 4, 4], PromotionOptions::default().with_alignment(16));
        let root = fx.func.op_ref();

        let allocs = collect_nested::<memref::Alloc>(&fx.ctx, root);
        assert_eq!(allocs.len(), 3);
        for alloc in &allocs {
            let alloc = memref::Alloc::from_op(&fx.ctx, *alloc).unwrap();
            assert_eq!(alloc.alignment(&fx.ctx), Some(16));
            let ty = MemRefType::from_type(&fx.ctx.types, fx.ctx.value_ty(alloc.result(&fx.ctx))).unwrap();
            assert_eq!(ty.shape.as_slice(), &[4, 4]);
        }
        // Three copies in, one copy out of the accumulator.
        assert_eq!(collect_nested::<memref::Copy>(&fx.ctx, root).len(), 4);
        assert_eq!(collect_nested::<memref::Dealloc>(&fx.ctx, root).len(), 3);
        assert!(collect_nested::<linalg::Fill>(&fx.ctx, root).is_empty());

        let matmul = collect_nested::<linalg::Matmul>(&fx.ctx, root)[0];
        assert_eq!(markers.get(matmul), Some(StageMarker(2)));
        assert_eq!(fx.run_matmul(), fx.expected_matmul());
    }

    fn operand_is_static(fx: &Fixture, matmul: OpRef, position: usize) -> bool {
        let value = fx.ctx.op_operands(matmul)[position];
        MemRefType::from_type(&fx.ctx.types, fx.ctx.value_ty(value))
            .is_some_and(|ty| ty.has_static_shape())
    }

    #[test]
    fn partial_tiles_run_on_views_of_local_buffers() {
        let mut fx = Fixture::matmul(6, 6, 6);
        let options = PromotionOptions::default()
            .with_use_alloca(true)
            .with_memory_space(3);
        tile_then_promote(&mut fx, [4, 4, 4], options);
        let root = fx.func.op_ref();

        let buffers = collect_nested::<memref::Alloca>(&fx.ctx, root);
        assert_eq!(buffers.len(), 3);
        for buffer in &buffers {
            let buffer = memref::Alloca::from_op(&fx.ctx, *buffer).unwrap();
            let ty = MemRefType::from_type(&fx.ctx.types, fx.ctx.value_ty(buffer.result(&fx.ctx))).unwrap();
            assert_eq!(ty.shape.as_slice(), &[4, 4]);
            assert_eq!(ty.memory_space, 3);
        }
        assert!(collect_nested::<memref::Dealloc>(&fx.ctx, root).is_empty());
        assert!(collect_nested::<linalg::Fill>(&fx.ctx, root).is_empty());

        let matmul = collect_nested::<linalg::Matmul>(&fx.ctx, root)[0];
        assert!((0..3).all(|p| !operand_is_static(&fx, matmul, p)));
        assert_eq!(fx.run_matmul(), fx.expected_matmul());
    }

    #[test]
    fn full_tile_buffers_are_zero_padded() {
        let mut fx = Fixture::matmul(6, 6, 6);
        let options = PromotionOptions::default().with_use_full_tile_buffers_by_default(true);
        tile_then_promote(&mut fx, [4, 4, 4], options);
        let root = fx.func.op_ref();

        assert_eq!(collect_nested::<linalg::Fill>(&fx.ctx, root).len(), 3);
        let matmul = collect_nested::<linalg::Matmul>(&fx.ctx, root)[0];
        assert!((0..3).all(|p| operand_is_static(&fx, matmul, p)));
        assert_eq!(fx.run_matmul(), fx.expected_matmul());
    }

    #[test]
    fn only_requested_subview_operands_are_promoted() {
        let mut fx = Fixture::matmul(8, 8, 8);
        tile_then_promote(&mut fx, [4, 4, 4], PromotionOptions::default().with_operands_to_promote([1]));
        assert_eq!(collect_nested::<memref::Alloc>(&fx.ctx, fx.func.op_ref()).len(), 1);
        assert_eq!(collect_nested::<memref::Copy>(&fx.ctx, fx.func.op_ref()).len(), 1);

        let mut untiled = Fixture::matmul(4, 4, 4);
        let mut promotion = RewritePatternSet::new();
        promotion.add(LinalgPromotionPattern::new(
            OpTarget::of::<linalg::Matmul>(),
            PromotionOptions::default(),
            TransformationFilter::for_stage(0, None, MarkerTable::new()),
        ));
        let result = apply_patterns_greedily(
            &mut untiled.ctx,
            untiled.func.op_ref(),
            &promotion,
            GreedyRewriteConfig::default(),
        )
        .unwrap();
        assert_eq!(result.total_changes, 0, "function arguments are not tiles");
    }
}
