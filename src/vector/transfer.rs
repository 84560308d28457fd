//! Lowering of vector transfers to scalar loops over a local buffer.
//!
//! A transfer moves the vector through a stack buffer of the vector's shape:
//! element-wise `memref.load`/`memref.store` between the buffer and the
//! transferred memref, and a single `vector.load`/`vector.store` between the
//! buffer and the vector. Vector dimension `j` of a rank-`v` transfer on a
//! rank-`r` memref runs along memref dimension `r - v + j`. Transfers that
//! are not known to be in bounds guard every element access, and reads fill
//! the buffer with the padding value first.

use std::collections::HashMap;

use tracing::trace;

use tessera_ir::dialect::arith::{self, CmpPredicate};
use tessera_ir::dialect::{linalg, memref, scf, vector};
use tessera_ir::ops::DialectOp;
use tessera_ir::rewrite::{PatternRewriter, RewritePattern};
use tessera_ir::{BlockRef, DYNAMIC, IrContext, Location, MemRefType, OpName, OpRef, TypeRef, ValueRef, VectorType};

/// Every position of `shape`, in row-major order.
fn positions(shape: &[i64]) -> Vec<Vec<i64>> {
    shape.iter().fold(vec![Vec::new()], |acc, &extent| {
        acc.into_iter()
            .flat_map(|prefix| {
                (0..extent).map(move |i| {
                    let mut position = prefix.clone();
                    position.push(i);
                    position
                })
            })
            .collect()
    })
}

/// Shapes of a transfer between `memref` and `vector`, when it can be
/// lowered: static vector shape, matching element types, vector rank at most
/// the memref rank, and one index per memref dimension.
fn transfer_shapes(
    ctx: &IrContext,
    memref: ValueRef,
    vector: ValueRef,
    num_indices: usize,
) -> Option<(MemRefType, VectorType)> {
    let memref_ty = MemRefType::from_type(&ctx.types, ctx.value_ty(memref))?;
    let vector_ty = VectorType::from_type(&ctx.types, ctx.value_ty(vector))?;
    let ok = memref_ty.elem == vector_ty.elem
        && vector_ty.rank() <= memref_ty.rank()
        && num_indices == memref_ty.rank()
        && vector_ty.shape.iter().all(|&d| d > 0);
    ok.then_some((memref_ty, vector_ty))
}

struct Lowering<'a> {
    ctx: &'a mut IrContext,
    rewriter: &'a mut PatternRewriter,
    loc: Location,
    unroll: bool,
    constants: HashMap<i64, ValueRef>,
}

impl<'a> Lowering<'a> {
    fn new(ctx: &'a mut IrContext, rewriter: &'a mut PatternRewriter, loc: Location, unroll: bool) -> Self {
        Self {
            ctx,
            rewriter,
            loc,
            unroll,
            constants: HashMap::new(),
        }
    }

    fn emit(&mut self, body: Option<BlockRef>, op: OpRef) {
        match body {
            Some(block) => scf::insert_in_body(self.ctx, block, op),
            None => self.rewriter.insert_op(op),
        }
    }

    /// An index constant, created once before the transfer.
    fn index(&mut self, value: i64) -> ValueRef {
        if let Some(&known) = self.constants.get(&value) {
            return known;
        }
        let constant = arith::const_index(self.ctx, self.loc, value);
        self.rewriter.insert_op(constant.op_ref());
        let result = constant.result(self.ctx);
        self.constants.insert(value, result);
        result
    }

    /// A stack buffer shaped like the transferred vector.
    fn buffer(&mut self, vector: &VectorType) -> ValueRef {
        let ty = self.ctx.types.memref(vector.elem, &vector.shape, 0);
        let alloca = memref::alloca(self.ctx, self.loc, ty, None);
        self.rewriter.insert_op(alloca.op_ref());
        alloca.result(self.ctx)
    }

    /// Extents of the trailing `count` dimensions of `source`.
    fn bounds(&mut self, source: ValueRef, shape: &MemRefType, count: usize) -> Vec<ValueRef> {
        let first = shape.rank() - count;
        (first..shape.rank())
            .map(|d| {
                if shape.shape[d] != DYNAMIC {
                    return self.index(shape.shape[d]);
                }
                let dim = memref::dim(self.ctx, self.loc, source, d);
                self.rewriter.insert_op(dim.op_ref());
                dim.result(self.ctx)
            })
            .collect()
    }

    /// Run `f` once per element of `shape`: inside a loop nest, or with
    /// constant indices when unrolling.
    fn for_each_element(&mut self, shape: &[i64], mut f: impl FnMut(&mut Self, Option<BlockRef>, &[ValueRef])) {
        if self.unroll {
            for position in positions(shape) {
                let ivs: Vec<ValueRef> = position.iter().map(|&p| self.index(p)).collect();
                f(self, None, &ivs);
            }
            return;
        }
        // Bounds go before the outermost loop, which is placed as soon as it
        // is built.
        let zero = self.index(0);
        let one = self.index(1);
        let uppers: Vec<ValueRef> = shape.iter().map(|&extent| self.index(extent)).collect();
        let mut body = None;
        let mut ivs = Vec::with_capacity(shape.len());
        for upper in uppers {
            let nest = scf::for_loop(self.ctx, self.loc, zero, upper, one);
            self.emit(body, nest.op_ref());
            ivs.push(nest.induction_var(self.ctx));
            body = Some(nest.body_block(self.ctx));
        }
        f(self, body, &ivs);
    }

    /// Memref indices of the vector element at `ivs`.
    fn element_indices(&mut self, body: Option<BlockRef>, base: &[ValueRef], ivs: &[ValueRef]) -> Vec<ValueRef> {
        let leading = base.len() - ivs.len();
        let mut indices = base[..leading].to_vec();
        for (&start, &iv) in base[leading..].iter().zip(ivs) {
            if arith::constant_int(self.ctx, start) == Some(0) {
                indices.push(iv);
                continue;
            }
            let sum = arith::addi(self.ctx, self.loc, start, iv);
            self.emit(body, sum.op_ref());
            indices.push(sum.result(self.ctx));
        }
        indices
    }

    /// Nest `scf.if` guards checking the trailing `indices` against `bounds`
    /// and return the innermost `then` block.
    fn guard(&mut self, mut body: Option<BlockRef>, indices: &[ValueRef], bounds: &[ValueRef]) -> Option<BlockRef> {
        let trailing = &indices[indices.len() - bounds.len()..];
        for (&index, &bound) in trailing.iter().zip(bounds) {
            let cond = arith::cmpi(self.ctx, self.loc, CmpPredicate::Slt, index, bound);
            self.emit(body, cond.op_ref());
            let branch = scf::if_op(self.ctx, self.loc, cond.result(self.ctx));
            self.emit(body, branch.op_ref());
            body = Some(branch.then_block(self.ctx));
        }
        body
    }
}

/// `vector.transfer_read` to element loads into a stack buffer followed by
/// a `vector.load`.
pub struct TransferReadLowering {
    unroll: bool,
}

impl TransferReadLowering {
    pub fn new(unroll: bool) -> Self {
        Self { unroll }
    }
}

impl RewritePattern for TransferReadLowering {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(read) = vector::TransferRead::from_op(ctx, op) else {
            return false;
        };
        let source = read.source(ctx);
        let base: Vec<ValueRef> = read.indices(ctx).to_vec();
        let Some((source_ty, vector_ty)) = transfer_shapes(ctx, source, read.result(ctx), base.len()) else {
            return false;
        };
        let (padding, in_bounds) = (read.padding(ctx), read.in_bounds(ctx));
        let result_ty: TypeRef = ctx.op_result_types(op)[0];

        let loc = ctx.op(op).location;
        let mut lowering = Lowering::new(ctx, rewriter, loc, self.unroll);
        let buffer = lowering.buffer(&vector_ty);
        let bounds = if in_bounds {
            Vec::new()
        } else {
            let fill = linalg::fill(lowering.ctx, loc, padding, buffer);
            lowering.rewriter.insert_op(fill.op_ref());
            lowering.bounds(source, &source_ty, vector_ty.rank())
        };
        lowering.for_each_element(&vector_ty.shape, |l, body, ivs| {
            let indices = l.element_indices(body, &base, ivs);
            let body = l.guard(body, &indices, &bounds);
            let load = memref::load(l.ctx, l.loc, source, indices);
            l.emit(body, load.op_ref());
            let value = load.result(l.ctx);
            let store = memref::store(l.ctx, l.loc, value, buffer, ivs.iter().copied());
            l.emit(body, store.op_ref());
        });
        let zeros = vec![lowering.index(0); vector_ty.rank()];
        let loaded = vector::load(lowering.ctx, loc, result_ty, buffer, &zeros);
        lowering.rewriter.insert_op(loaded.op_ref());
        let loaded = loaded.result(lowering.ctx);
        lowering.rewriter.erase_op(vec![loaded]);
        trace!(%op, in_bounds, unroll = self.unroll, "lowered transfer_read");
        true
    }

    fn name(&self) -> &'static str {
        "TransferReadLowering"
    }

    fn root(&self) -> Option<OpName> {
        Some(vector::TransferRead::op_name())
    }
}

/// `vector.transfer_write` to a `vector.store` into a stack buffer followed
/// by element stores.
pub struct TransferWriteLowering {
    unroll: bool,
}

impl TransferWriteLowering {
    pub fn new(unroll: bool) -> Self {
        Self { unroll }
    }
}

impl RewritePattern for TransferWriteLowering {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(write) = vector::TransferWrite::from_op(ctx, op) else {
            return false;
        };
        let (value, dest) = (write.vector(ctx), write.dest(ctx));
        let base: Vec<ValueRef> = write.indices(ctx).to_vec();
        let Some((dest_ty, vector_ty)) = transfer_shapes(ctx, dest, value, base.len()) else {
            return false;
        };
        let in_bounds = write.in_bounds(ctx);

        let loc = ctx.op(op).location;
        let mut lowering = Lowering::new(ctx, rewriter, loc, self.unroll);
        let buffer = lowering.buffer(&vector_ty);
        let zeros = vec![lowering.index(0); vector_ty.rank()];
        let stored = vector::store(lowering.ctx, loc, value, buffer, &zeros);
        lowering.rewriter.insert_op(stored.op_ref());
        let bounds = if in_bounds {
            Vec::new()
        } else {
            lowering.bounds(dest, &dest_ty, vector_ty.rank())
        };
        lowering.for_each_element(&vector_ty.shape, |l, body, ivs| {
            let load = memref::load(l.ctx, l.loc, buffer, ivs.iter().copied());
            l.emit(body, load.op_ref());
            let element = load.result(l.ctx);
            let indices = l.element_indices(body, &base, ivs);
            let body = l.guard(body, &indices, &bounds);
            let store = memref::store(l.ctx, l.loc, element, dest, indices);
            l.emit(body, store.op_ref());
        });
        lowering.rewriter.erase_op(Vec::new());
        trace!(%op, in_bounds, unroll = self.unroll, "lowered transfer_write");
        true
    }

    fn name(&self) -> &'static str {
        "TransferWriteLowering"
    }

    fn root(&self) -> Option<OpName> {
        Some(vector::TransferWrite::op_name())
    }
}
