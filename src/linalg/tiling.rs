//! Tiling of structured operations into loop nests.

use tracing::{debug, trace};

use tessera_ir::dialect::linalg::{StructuredInfo, structured_info};
use tessera_ir::dialect::memref::{self, IndexValue};
use tessera_ir::dialect::{IteratorType, arith, scf};
use tessera_ir::rewrite::{PatternRewriter, RewritePattern};
use tessera_ir::{BlockRef, DYNAMIC, IrContext, Location, MemRefType, OpName, OpRef, ValueRef};

use crate::filter::TransformationFilter;
use crate::options::{LoopType, TilingOptions};
use crate::strategy::OpTarget;

/// Tiles a structured operation according to [`TilingOptions`].
///
/// The operation is replaced by a loop nest over its tiled loops whose
/// innermost body applies a clone of the operation to `memref.subview`s of
/// its operands. Boundary tiles are clamped with `arith.minsi` unless the
/// extent is statically divisible by the tile size.
pub struct LinalgTilingPattern {
    target: OpTarget,
    options: TilingOptions,
    filter: TransformationFilter,
}

impl LinalgTilingPattern {
    pub fn new(target: OpTarget, options: TilingOptions, filter: TransformationFilter) -> Self {
        Self {
            target,
            options,
            filter,
        }
    }
}

/// Where a loop's extent comes from.
#[derive(Clone, Copy)]
struct LoopExtent {
    operand: usize,
    dim: usize,
    size: Option<i64>,
}

fn loop_extents(ctx: &IrContext, info: &StructuredInfo, operands: &[ValueRef]) -> Option<Vec<LoopExtent>> {
    (0..info.num_loops())
        .map(|l| {
            let (operand, dim) = info.operand_dim_for_loop(l)?;
            let ty = MemRefType::from_type(&ctx.types, ctx.value_ty(operands[operand]))?;
            let extent = ty.shape[dim];
            Some(LoopExtent {
                operand,
                dim,
                size: (extent != DYNAMIC).then_some(extent),
            })
        })
        .collect()
}

/// Loop order after interchange, or `None` if `interchange` is not a
/// permutation of `0..num_loops`.
fn loop_order(interchange: &[usize], num_loops: usize) -> Option<Vec<usize>> {
    if interchange.is_empty() {
        return Some((0..num_loops).collect());
    }
    let mut seen = vec![false; num_loops];
    for &l in interchange {
        if l >= num_loops || std::mem::replace(&mut seen[l], true) {
            return None;
        }
    }
    seen.iter().all(|&s| s).then(|| interchange.to_vec())
}

/// Place a new operation either before the matched op or inside `body`.
fn emit(ctx: &mut IrContext, rewriter: &mut PatternRewriter, body: Option<BlockRef>, op: OpRef) {
    match body {
        Some(block) => scf::insert_in_body(ctx, block, op),
        None => rewriter.insert_op(op),
    }
}

fn index_const(ctx: &mut IrContext, rewriter: &mut PatternRewriter, loc: Location, value: i64) -> ValueRef {
    let c = arith::const_index(ctx, loc, value);
    rewriter.insert_op(c.op_ref());
    c.result(ctx)
}

impl RewritePattern for LinalgTilingPattern {
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
        let num_loops = info.num_loops();
        let tile_sizes = self.options.tile_sizes_for(num_loops);
        if tile_sizes.iter().all(|&s| s == 0) || tile_sizes.iter().any(|&s| s < 0) {
            debug!(%op, ?tile_sizes, "nothing to tile");
            return false;
        }
        let Some(order) = loop_order(&self.options.interchange, num_loops) else {
            debug!(%op, interchange = ?self.options.interchange, "interchange is not a permutation");
            return false;
        };
        let operands: Vec<ValueRef> = ctx.op_operands(op).to_vec();
        let Some(extents) = loop_extents(ctx, &info, &operands) else {
            debug!(%op, "operand shapes do not cover every loop");
            return false;
        };

        let loc = ctx.op(op).location;
        let zero = index_const(ctx, rewriter, loc, 0);
        let upper: Vec<ValueRef> = extents
            .iter()
            .map(|e| match e.size {
                Some(size) => index_const(ctx, rewriter, loc, size),
                None => {
                    let dim = memref::dim(ctx, loc, operands[e.operand], e.dim);
                    rewriter.insert_op(dim.op_ref());
                    dim.result(ctx)
                }
            })
            .collect();
        let steps: Vec<Option<ValueRef>> = tile_sizes
            .iter()
            .map(|&s| (s != 0).then(|| index_const(ctx, rewriter, loc, s)))
            .collect();

        // Build the loop nest, outermost first.
        let tiled: Vec<usize> = order.into_iter().filter(|&l| tile_sizes[l] != 0).collect();
        let mut ivs: Vec<Option<ValueRef>> = vec![None; num_loops];
        let mut body: Option<BlockRef> = None;
        let (parallel, sequential): (Vec<usize>, Vec<usize>) = match self.options.loop_type {
            LoopType::Loops => (Vec::new(), tiled),
            LoopType::ParallelLoops => tiled
                .into_iter()
                .partition(|&l| info.iterator_types[l] == IteratorType::Parallel),
        };
        if !parallel.is_empty() {
            let lbs = vec![zero; parallel.len()];
            let ubs: Vec<ValueRef> = parallel.iter().map(|&l| upper[l]).collect();
            let steps: Vec<ValueRef> = parallel.iter().filter_map(|&l| steps[l]).collect();
            let nest = scf::parallel(ctx, loc, &lbs, &ubs, &steps);
            emit(ctx, rewriter, body, nest.op_ref());
            for (k, &l) in parallel.iter().enumerate() {
                ivs[l] = Some(nest.induction_vars(ctx)[k]);
            }
            body = Some(nest.body_block(ctx));
        }
        for &l in &sequential {
            let Some(step) = steps[l] else { continue };
            let lp = scf::for_loop(ctx, loc, zero, upper[l], step);
            emit(ctx, rewriter, body, lp.op_ref());
            ivs[l] = Some(lp.induction_var(ctx));
            body = Some(lp.body_block(ctx));
        }
        let Some(body) = body else {
            return false;
        };

        // Offsets and sizes of the tile along every loop.
        let mut offsets = Vec::with_capacity(num_loops);
        let mut sizes = Vec::with_capacity(num_loops);
        for l in 0..num_loops {
            let (offset, size) = match (ivs[l], steps[l]) {
                (Some(iv), Some(step)) => {
                    let size = match extents[l].size {
                        Some(extent) if extent % tile_sizes[l] == 0 => IndexValue::Static(tile_sizes[l]),
                        _ => {
                            let remaining = arith::subi(ctx, loc, upper[l], iv);
                            scf::insert_in_body(ctx, body, remaining.op_ref());
                            let clamped = arith::minsi(ctx, loc, step, remaining.result(ctx));
                            scf::insert_in_body(ctx, body, clamped.op_ref());
                            IndexValue::Dynamic(clamped.result(ctx))
                        }
                    };
                    (IndexValue::Dynamic(iv), size)
                }
                _ => {
                    let size = match extents[l].size {
                        Some(extent) => IndexValue::Static(extent),
                        None => IndexValue::Dynamic(upper[l]),
                    };
                    (IndexValue::Static(0), size)
                }
            };
            offsets.push(offset);
            sizes.push(size);
        }

        let mut tiled_operands = operands.clone();
        for map in &info.operands {
            if map.dims.iter().all(|&l| ivs[l].is_none()) {
                continue;
            }
            let view_offsets: Vec<IndexValue> = map.dims.iter().map(|&l| offsets[l]).collect();
            let view_sizes: Vec<IndexValue> = map.dims.iter().map(|&l| sizes[l]).collect();
            let view = memref::subview(ctx, loc, operands[map.operand], &view_offsets, &view_sizes);
            scf::insert_in_body(ctx, body, view.op_ref());
            tiled_operands[map.operand] = view.result(ctx);
        }

        let tiled_op = ctx.clone_op_with_operands(op, tiled_operands);
        scf::insert_in_body(ctx, body, tiled_op);
        self.filter.mark(tiled_op);
        trace!(%op, %tiled_op, ?tile_sizes, "tiled");
        rewriter.erase_op(Vec::new());
        true
    }

    fn name(&self) -> &'static str {
        "LinalgTilingPattern"
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
    use tessera_ir::dialect::linalg;
    use tessera_ir::ops::DialectOp;
    use tessera_ir::rewrite::{GreedyRewriteConfig, RewritePatternSet, apply_patterns_greedily};
    use tessera_ir::walk::collect_nested;

    fn tile(fx: &mut Fixture, options: TilingOptions, markers: &MarkerTable) -> usize {
        let filter = TransformationFilter::for_stage(0, None, markers.clone());
        let mut patterns = RewritePatternSet::new();
        patterns.add(LinalgTilingPattern::new(
            OpTarget::of::<linalg::Matmul>(),
            options,
            filter,
        ));
        apply_patterns_greedily(&mut fx.ctx, fx.func.op_ref(), &patterns, GreedyRewriteConfig::default())
            .unwrap()
            .total_changes
    }

    #[test]
    fn tiles_every_loop_into_a_nest() {
        let mut fx = Fixture::matmul(8, 8, 8);
        let markers = MarkerTable::new();
        let changes = tile(&mut fx, TilingOptions::default().with_tile_sizes([4, 4, 4]), &markers);
        assert_eq!(changes, 1);

        let root = fx.func.op_ref();
        assert_eq!(collect_nested::<scf::For>(&fx.ctx, root).len(), 3);
        let matmuls = collect_nested::<linalg::Matmul>(&fx.ctx, root);
        assert_eq!(matmuls.len(), 1);
        assert_eq!(markers.get(matmuls[0]), Some(StageMarker(1)));

        let views = collect_nested::<memref::SubView>(&fx.ctx, root);
        assert_eq!(views.len(), 3);
        for view in views {
            let view = memref::SubView::from_op(&fx.ctx, view).unwrap();
            let ty = MemRefType::from_type(&fx.ctx.types, fx.ctx.value_ty(view.result(&fx.ctx))).unwrap();
            assert_eq!(ty.shape.as_slice(), &[4, 4]);
        }
        assert_eq!(fx.run_matmul(), fx.expected_matmul());
    }

    #[test]
    fn clamps_boundary_tiles_and_skips_zero_sizes() {
        let mut fx = Fixture::matmul(6, 5, 3);
        let markers = MarkerTable::new();
        tile(&mut fx, TilingOptions::default().with_tile_sizes([4, 0, 2]), &markers);

        let root = fx.func.op_ref();
        assert_eq!(collect_nested::<scf::For>(&fx.ctx, root).len(), 2);
        assert_eq!(collect_nested::<arith::MinSI>(&fx.ctx, root).len(), 2);
        assert_eq!(fx.run_matmul(), fx.expected_matmul());
    }

    #[test]
    fn parallel_loops_group_parallel_dimensions() {
        let mut fx = Fixture::matmul(8, 8, 8);
        let options = TilingOptions::default()
            .with_tile_sizes([2, 4, 8])
            .with_interchange([1, 0, 2])
            .with_loop_type(LoopType::ParallelLoops);
        tile(&mut fx, options, &MarkerTable::new());

        let root = fx.func.op_ref();
        let nests = collect_nested::<scf::Parallel>(&fx.ctx, root);
        assert_eq!(nests.len(), 1);
        let nest = scf::Parallel::from_op(&fx.ctx, nests[0]).unwrap();
        assert_eq!(nest.rank(&fx.ctx), 2);
        let step = arith::constant_int(&fx.ctx, nest.steps(&fx.ctx)[0]);
        assert_eq!(step, Some(4), "interchange puts loop 1 outermost");
        assert_eq!(collect_nested::<scf::For>(&fx.ctx, root).len(), 1);
        assert_eq!(fx.run_matmul(), fx.expected_matmul());
    }

    #[test]
    fn rejects_invalid_configurations() {
        let mut fx = Fixture::matmul(4, 4, 4);
        let markers = MarkerTable::new();
        assert_eq!(tile(&mut fx, TilingOptions::default(), &markers), 0);
        let bad = TilingOptions::default()
            .with_tile_sizes([2, 2, 2])
            .with_interchange([0, 0, 1]);
        assert_eq!(tile(&mut fx, bad, &markers), 0);
        assert!(markers.is_empty());
    }

    #[test]
    fn loop_order_requires_a_permutation() {
        assert_eq!(loop_order(&[], 3), Some(vec![0, 1, 2]));
        assert_eq!(loop_order(&[2, 0, 1], 3), Some(vec![2, 0, 1]));
        assert_eq!(loop_order(&[0, 1], 3), None);
        assert_eq!(loop_order(&[0, 3, 1], 3), None);
    }
}
