//! Lowering of `vector.contract` to outer products, dot products or a
//! flattened matrix multiply.

use smallvec::SmallVec;
use tracing::{debug, trace};

use tessera_ir::dialect::{IteratorType, arith, vector};
use tessera_ir::ops::DialectOp;
use tessera_ir::rewrite::{PatternRewriter, RewritePattern};
use tessera_ir::{IrContext, Location, OpName, OpRef, TypeRef, ValueRef, VectorType};

use crate::options::VectorContractLowering;

/// Contractions with a single reduction loop `k`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Contraction {
    /// `acc[i, j] += lhs[i, k] * rhs[k, j]`, with either input possibly
    /// stored with `k` as its leading dimension.
    Matmul { lhs_k_major: bool, rhs_k_major: bool },
    /// `acc[i] += lhs[i, k] * rhs[k]`.
    Matvec { lhs_k_major: bool },
}

/// The other loop of a two-loop operand, and whether `k` comes first.
fn split_reduction(dims: &[usize], k: usize) -> Option<(usize, bool)> {
    match *dims {
        [a, b] if a == k && b != k => Some((b, true)),
        [a, b] if b == k && a != k => Some((a, false)),
        _ => None,
    }
}

fn classify(maps: &[Vec<usize>], iterators: &[IteratorType]) -> Option<Contraction> {
    let [lhs, rhs, acc] = maps else {
        return None;
    };
    let mut reductions = iterators
        .iter()
        .enumerate()
        .filter(|(_, it)| **it == IteratorType::Reduction)
        .map(|(loop_idx, _)| loop_idx);
    let k = reductions.next()?;
    if reductions.next().is_some() {
        return None;
    }
    let (i, lhs_k_major) = split_reduction(lhs, k)?;
    if rhs.as_slice() == [k] {
        return (acc.as_slice() == [i]).then_some(Contraction::Matvec { lhs_k_major });
    }
    let (j, rhs_k_major) = split_reduction(rhs, k)?;
    (j != i && acc.as_slice() == [i, j]).then_some(Contraction::Matmul {
        lhs_k_major,
        rhs_k_major,
    })
}

/// Inserts the lowered operations before the contraction.
struct Emitter<'a> {
    ctx: &'a mut IrContext,
    rewriter: &'a mut PatternRewriter,
    loc: Location,
}

impl Emitter<'_> {
    fn shape(&self, value: ValueRef) -> SmallVec<[i64; 4]> {
        VectorType::from_type(&self.ctx.types, self.ctx.value_ty(value))
            .map(|ty| ty.shape)
            .unwrap_or_default()
    }

    fn extent(&self, value: ValueRef, dim: usize) -> usize {
        self.shape(value).get(dim).map_or(0, |&d| d as usize)
    }

    fn emit(&mut self, op: OpRef) -> ValueRef {
        self.rewriter.insert_op(op);
        self.ctx.op_result(op, 0)
    }

    /// `value` with `k` leading if `want_k_major`, transposing as needed.
    fn oriented(&mut self, value: ValueRef, k_major: bool, want_k_major: bool) -> ValueRef {
        if k_major == want_k_major {
            return value;
        }
        let op = vector::transpose(self.ctx, self.loc, value, &[1, 0]).op_ref();
        self.emit(op)
    }

    fn extract(&mut self, value: ValueRef, position: &[usize]) -> ValueRef {
        let op = vector::extract(self.ctx, self.loc, value, position).op_ref();
        self.emit(op)
    }

    fn insert(&mut self, value: ValueRef, dest: ValueRef, position: &[usize]) -> ValueRef {
        let op = vector::insert(self.ctx, self.loc, value, dest, position).op_ref();
        self.emit(op)
    }

    fn outer_product(&mut self, lhs: ValueRef, rhs: ValueRef, acc: ValueRef) -> ValueRef {
        let op = vector::outer_product(self.ctx, self.loc, lhs, rhs, Some(acc)).op_ref();
        self.emit(op)
    }

    fn dot(&mut self, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        let product = arith::mulf(self.ctx, self.loc, lhs, rhs).op_ref();
        let product = self.emit(product);
        let op = vector::reduction_add(self.ctx, self.loc, product).op_ref();
        self.emit(op)
    }

    fn addf(&mut self, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        let op = arith::addf(self.ctx, self.loc, lhs, rhs).op_ref();
        self.emit(op)
    }

    fn shape_cast(&mut self, ty: TypeRef, value: ValueRef) -> ValueRef {
        let op = vector::shape_cast(self.ctx, self.loc, ty, value).op_ref();
        self.emit(op)
    }

    fn flattened(&mut self, value: ValueRef) -> ValueRef {
        let Some(view) = VectorType::from_type(&self.ctx.types, self.ctx.value_ty(value)) else {
            return value;
        };
        let ty = self.ctx.types.vector(view.elem, &[view.num_elements()]);
        self.shape_cast(ty, value)
    }

    /// One rank-1 update per step of `k`.
    fn outer_products(&mut self, form: Contraction, lhs: ValueRef, rhs: ValueRef, acc: ValueRef) -> ValueRef {
        let (lhs, rhs) = match form {
            Contraction::Matmul {
                lhs_k_major,
                rhs_k_major,
            } => (self.oriented(lhs, lhs_k_major, true), self.oriented(rhs, rhs_k_major, true)),
            Contraction::Matvec { lhs_k_major } => (self.oriented(lhs, lhs_k_major, true), rhs),
        };
        let mut acc = acc;
        for k in 0..self.extent(lhs, 0) {
            let column = self.extract(lhs, &[k]);
            let row = self.extract(rhs, &[k]);
            acc = self.outer_product(column, row, acc);
        }
        acc
    }

    /// One reduction per element of the result.
    fn dot_products(&mut self, form: Contraction, lhs: ValueRef, rhs: ValueRef, acc: ValueRef) -> ValueRef {
        let mut result = acc;
        match form {
            Contraction::Matmul {
                lhs_k_major,
                rhs_k_major,
            } => {
                let lhs = self.oriented(lhs, lhs_k_major, false);
                let rhs = self.oriented(rhs, rhs_k_major, false);
                for i in 0..self.extent(lhs, 0) {
                    let row = self.extract(lhs, &[i]);
                    for j in 0..self.extent(rhs, 0) {
                        let column = self.extract(rhs, &[j]);
                        let sum = self.dot(row, column);
                        let prior = self.extract(acc, &[i, j]);
                        let sum = self.addf(sum, prior);
                        result = self.insert(sum, result, &[i, j]);
                    }
                }
            }
            Contraction::Matvec { lhs_k_major } => {
                let lhs = self.oriented(lhs, lhs_k_major, false);
                for i in 0..self.extent(lhs, 0) {
                    let row = self.extract(lhs, &[i]);
                    let sum = self.dot(row, rhs);
                    let prior = self.extract(acc, &[i]);
                    let sum = self.addf(sum, prior);
                    result = self.insert(sum, result, &[i]);
                }
            }
        }
        result
    }

    /// A single flattened multiply, for matrix-matrix contractions only.
    fn matrix_multiply(&mut self, form: Contraction, lhs: ValueRef, rhs: ValueRef, acc: ValueRef) -> ValueRef {
        let Contraction::Matmul {
            lhs_k_major,
            rhs_k_major,
        } = form
        else {
            return self.outer_products(form, lhs, rhs, acc);
        };
        let lhs = self.oriented(lhs, lhs_k_major, false);
        let rhs = self.oriented(rhs, rhs_k_major, true);
        let (rows, inner, columns) = (self.extent(lhs, 0), self.extent(lhs, 1), self.extent(rhs, 1));
        let flat_lhs = self.flattened(lhs);
        let flat_rhs = self.flattened(rhs);
        let op = vector::matrix_multiply(self.ctx, self.loc, flat_lhs, flat_rhs, rows, inner, columns).op_ref();
        let product = self.emit(op);
        let acc_ty = self.ctx.value_ty(acc);
        let product = self.shape_cast(acc_ty, product);
        self.addf(product, acc)
    }
}

/// Rewrites `vector.contract` according to a [`VectorContractLowering`].
pub struct ContractionLowering {
    lowering: VectorContractLowering,
}

impl ContractionLowering {
    pub fn new(lowering: VectorContractLowering) -> Self {
        Self { lowering }
    }
}

impl RewritePattern for ContractionLowering {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(contract) = vector::Contract::from_op(ctx, op) else {
            return false;
        };
        let Some(form) = classify(&contract.indexing_maps(ctx), &contract.iterator_types(ctx)) else {
            debug!(%op, "contraction is not a matmul or matvec");
            return false;
        };
        let (lhs, rhs, acc) = (contract.lhs(ctx), contract.rhs(ctx), contract.acc(ctx));
        let is_f32_vector = |v: ValueRef| {
            VectorType::from_type(&ctx.types, ctx.value_ty(v)).is_some_and(|ty| ctx.types.is_f32(ty.elem))
        };
        if !(is_f32_vector(lhs) && is_f32_vector(acc)) {
            return false;
        }

        let loc = ctx.op(op).location;
        let mut emitter = Emitter { ctx, rewriter, loc };
        let result = match self.lowering {
            VectorContractLowering::OuterProduct => emitter.outer_products(form, lhs, rhs, acc),
            VectorContractLowering::Dot => emitter.dot_products(form, lhs, rhs, acc),
            VectorContractLowering::Matmul => emitter.matrix_multiply(form, lhs, rhs, acc),
        };
        emitter.rewriter.erase_op(vec![result]);
        trace!(%op, ?form, lowering = ?self.lowering, "lowered contraction");
        true
    }

    fn name(&self) -> &'static str {
        "ContractionLowering"
    }

    fn root(&self) -> Option<OpName> {
        Some(vector::Contract::op_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IteratorType::{Parallel, Reduction};

    #[test]
    fn classifies_matmul_layouts() {
        let iterators = [Parallel, Parallel, Reduction];
        assert_eq!(
            classify(&[vec![0, 2], vec![2, 1], vec![0, 1]], &iterators),
            Some(Contraction::Matmul {
                lhs_k_major: false,
                rhs_k_major: true
            })
        );
        assert_eq!(
            classify(&[vec![2, 0], vec![1, 2], vec![0, 1]], &iterators),
            Some(Contraction::Matmul {
                lhs_k_major: true,
                rhs_k_major: false
            })
        );
        assert_eq!(classify(&[vec![0, 2], vec![2, 1], vec![1, 0]], &iterators), None);
    }

    #[test]
    fn classifies_matvec_and_rejects_the_rest() {
        assert_eq!(
            classify(&[vec![0, 1], vec![1], vec![0]], &[Parallel, Reduction]),
            Some(Contraction::Matvec { lhs_k_major: false })
        );
        assert_eq!(classify(&[vec![0, 1], vec![1], vec![0]], &[Parallel, Parallel]), None);
        assert_eq!(
            classify(&[vec![0, 1, 2], vec![1, 2], vec![0]], &[Parallel, Reduction, Reduction]),
            None
        );
    }
}
