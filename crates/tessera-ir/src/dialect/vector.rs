//! `vector` dialect: fixed-shape register values.
//!
//! Transfers access the trailing dimensions of a buffer starting at the
//! given indices (minor identity permutation). An in-bounds transfer promises
//! that every accessed element exists; otherwise out-of-bounds lanes read the
//! padding value and writes to them are dropped.

use smallvec::SmallVec;

use super::{IteratorType, create, op_builder};
use crate::context::IrContext;
use crate::refs::{TypeRef, ValueRef};
use crate::types::{Attribute, Location, VectorType};

crate::symbols! {
    ATTR_IN_BOUNDS => "in_bounds",
    ATTR_INDEXING_MAPS => "indexing_maps",
    ATTR_ITERATOR_TYPES => "iterator_types",
    ATTR_PERMUTATION => "permutation",
    ATTR_POSITION => "position",
    ATTR_KIND => "kind",
    ATTR_LHS_ROWS => "lhs_rows",
    ATTR_LHS_COLUMNS => "lhs_columns",
    ATTR_RHS_COLUMNS => "rhs_columns",
}

crate::define_op! {
    pub struct TransferRead => "vector", "transfer_read";
    pub struct TransferWrite => "vector", "transfer_write";
    /// Generalized contraction described by per-operand loop maps.
    pub struct Contract => "vector", "contract";
    pub struct Broadcast => "vector", "broadcast";
    pub struct Transpose => "vector", "transpose";
    pub struct Extract => "vector", "extract";
    pub struct Insert => "vector", "insert";
    /// Outer product `lhs x rhs + acc`; with a scalar `rhs` it is an AXPY.
    pub struct OuterProduct => "vector", "outerproduct";
    pub struct Reduction => "vector", "reduction";
    pub struct ShapeCast => "vector", "shape_cast";
    /// Row-major flattened matrix multiply.
    pub struct MatrixMultiply => "vector", "matrix_multiply";
    pub struct Load => "vector", "load";
    pub struct Store => "vector", "store";
}

pub fn transfer_read(
    ctx: &mut IrContext,
    loc: Location,
    ty: TypeRef,
    source: ValueRef,
    indices: &[ValueRef],
    padding: ValueRef,
    in_bounds: bool,
) -> TransferRead {
    create(
        ctx,
        op_builder::<TransferRead>(loc)
            .operand(source)
            .operands(indices.iter().copied())
            .operand(padding)
            .attr(ATTR_IN_BOUNDS(), Attribute::Bool(in_bounds))
            .result(ty),
    )
}

pub fn transfer_write(
    ctx: &mut IrContext,
    loc: Location,
    vector: ValueRef,
    dest: ValueRef,
    indices: &[ValueRef],
    in_bounds: bool,
) -> TransferWrite {
    create(
        ctx,
        op_builder::<TransferWrite>(loc)
            .operand(vector)
            .operand(dest)
            .operands(indices.iter().copied())
            .attr(ATTR_IN_BOUNDS(), Attribute::Bool(in_bounds)),
    )
}

fn in_bounds_of(ctx: &IrContext, op: crate::OpRef) -> bool {
    ctx.op_attr(op, ATTR_IN_BOUNDS())
        .and_then(Attribute::as_bool)
        .unwrap_or(false)
}

impl TransferRead {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn indices<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        let operands = ctx.op_operands(self.0);
        &operands[1..operands.len() - 1]
    }

    pub fn padding(&self, ctx: &IrContext) -> ValueRef {
        let operands = ctx.op_operands(self.0);
        operands[operands.len() - 1]
    }

    pub fn in_bounds(&self, ctx: &IrContext) -> bool {
        in_bounds_of(ctx, self.0)
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

impl TransferWrite {
    pub fn vector(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn dest(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn indices<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        &ctx.op_operands(self.0)[2..]
    }

    pub fn in_bounds(&self, ctx: &IrContext) -> bool {
        in_bounds_of(ctx, self.0)
    }
}

/// Create a contraction; the result has the type of `acc`.
///
/// `indexing_maps` lists, for `lhs`, `rhs` and `acc` in that order, the loop
/// index of each vector dimension.
pub fn contract(
    ctx: &mut IrContext,
    loc: Location,
    lhs: ValueRef,
    rhs: ValueRef,
    acc: ValueRef,
    indexing_maps: [&[usize]; 3],
    iterator_types: &[IteratorType],
) -> Contract {
    let ty = ctx.value_ty(acc);
    let maps = indexing_maps
        .iter()
        .map(|m| Attribute::List(m.iter().map(|&d| Attribute::from(d as u64)).collect()))
        .collect();
    let iterators = iterator_types
        .iter()
        .map(|it| Attribute::from(it.as_str()))
        .collect();
    create(
        ctx,
        op_builder::<Contract>(loc)
            .operands([lhs, rhs, acc])
            .attr(ATTR_INDEXING_MAPS(), Attribute::List(maps))
            .attr(ATTR_ITERATOR_TYPES(), Attribute::List(iterators))
            .result(ty),
    )
}

impl Contract {
    pub fn lhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn rhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn acc(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[2]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }

    pub fn indexing_maps(&self, ctx: &IrContext) -> Vec<Vec<usize>> {
        ctx.op_attr(self.0, ATTR_INDEXING_MAPS())
            .and_then(Attribute::as_list)
            .map(|maps| {
                maps.iter()
                    .filter_map(Attribute::as_int_list)
                    .map(|m| m.iter().map(|&d| d as usize).collect())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iterator_types(&self, ctx: &IrContext) -> Vec<IteratorType> {
        ctx.op_attr(self.0, ATTR_ITERATOR_TYPES())
            .and_then(Attribute::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|a| match a {
                        Attribute::String(s) => IteratorType::parse(s),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn broadcast(ctx: &mut IrContext, loc: Location, ty: TypeRef, source: ValueRef) -> Broadcast {
    create(ctx, op_builder::<Broadcast>(loc).operand(source).result(ty))
}

impl Broadcast {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

/// Permute the dimensions of `source`: result dim `i` is source dim
/// `permutation[i]`.
///
/// # Panics
///
/// Panics if `source` is not a vector.
pub fn transpose(
    ctx: &mut IrContext,
    loc: Location,
    source: ValueRef,
    permutation: &[usize],
) -> Transpose {
    let source_ty = ctx.value_ty(source);
    let Some(view) = VectorType::from_type(&ctx.types, source_ty) else {
        panic!("transpose: {source} is not a vector");
    };
    let shape: SmallVec<[i64; 4]> = permutation.iter().map(|&p| view.shape[p]).collect();
    let ty = ctx.types.vector(view.elem, &shape);
    create(
        ctx,
        op_builder::<Transpose>(loc)
            .operand(source)
            .attr(
                ATTR_PERMUTATION(),
                Attribute::List(permutation.iter().map(|&p| Attribute::from(p as u64)).collect()),
            )
            .result(ty),
    )
}

impl Transpose {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }

    pub fn permutation(&self, ctx: &IrContext) -> Vec<usize> {
        position_attr(ctx, self.0, ATTR_PERMUTATION())
    }
}

fn position_attr(ctx: &IrContext, op: crate::OpRef, key: crate::Symbol) -> Vec<usize> {
    ctx.op_attr(op, key)
        .and_then(Attribute::as_int_list)
        .map(|l| l.iter().map(|&d| d as usize).collect())
        .unwrap_or_default()
}

fn position_list(position: &[usize]) -> Attribute {
    Attribute::List(position.iter().map(|&p| Attribute::from(p as u64)).collect())
}

/// The type of `source` after dropping `depth` leading dimensions.
fn trailing_type(ctx: &mut IrContext, source: ValueRef, depth: usize) -> TypeRef {
    let source_ty = ctx.value_ty(source);
    let Some(view) = VectorType::from_type(&ctx.types, source_ty) else {
        panic!("vector position: {source} is not a vector");
    };
    if depth >= view.rank() {
        view.elem
    } else {
        ctx.types.vector(view.elem, &view.shape[depth..])
    }
}

/// Extract the sub-vector (or scalar) of `source` at `position`.
pub fn extract(ctx: &mut IrContext, loc: Location, source: ValueRef, position: &[usize]) -> Extract {
    let ty = trailing_type(ctx, source, position.len());
    create(
        ctx,
        op_builder::<Extract>(loc)
            .operand(source)
            .attr(ATTR_POSITION(), position_list(position))
            .result(ty),
    )
}

impl Extract {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn position(&self, ctx: &IrContext) -> Vec<usize> {
        position_attr(ctx, self.0, ATTR_POSITION())
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

/// Insert `source` into `dest` at `position`, producing a new vector.
pub fn insert(
    ctx: &mut IrContext,
    loc: Location,
    source: ValueRef,
    dest: ValueRef,
    position: &[usize],
) -> Insert {
    let ty = ctx.value_ty(dest);
    create(
        ctx,
        op_builder::<Insert>(loc)
            .operands([source, dest])
            .attr(ATTR_POSITION(), position_list(position))
            .result(ty),
    )
}

impl Insert {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn dest(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn position(&self, ctx: &IrContext) -> Vec<usize> {
        position_attr(ctx, self.0, ATTR_POSITION())
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

/// `lhs` is a 1-D vector; `rhs` is either a 1-D vector (result
/// `lhs.len x rhs.len`) or a scalar (result shaped like `lhs`).
pub fn outer_product(
    ctx: &mut IrContext,
    loc: Location,
    lhs: ValueRef,
    rhs: ValueRef,
    acc: Option<ValueRef>,
) -> OuterProduct {
    let lhs_ty = ctx.value_ty(lhs);
    let rhs_ty = ctx.value_ty(rhs);
    let ty = match (
        VectorType::from_type(&ctx.types, lhs_ty),
        VectorType::from_type(&ctx.types, rhs_ty),
    ) {
        (Some(l), Some(r)) => ctx.types.vector(l.elem, &[l.shape[0], r.shape[0]]),
        _ => lhs_ty,
    };
    create(
        ctx,
        op_builder::<OuterProduct>(loc)
            .operands([lhs, rhs])
            .operands(acc)
            .result(ty),
    )
}

impl OuterProduct {
    pub fn lhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn rhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn acc(&self, ctx: &IrContext) -> Option<ValueRef> {
        ctx.op_operands(self.0).get(2).copied()
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

/// Additive reduction of a 1-D vector to its element type.
pub fn reduction_add(ctx: &mut IrContext, loc: Location, source: ValueRef) -> Reduction {
    let ty = trailing_type(ctx, source, usize::MAX);
    create(
        ctx,
        op_builder::<Reduction>(loc)
            .operand(source)
            .attr(ATTR_KIND(), Attribute::from("add"))
            .result(ty),
    )
}

impl Reduction {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

pub fn shape_cast(ctx: &mut IrContext, loc: Location, ty: TypeRef, source: ValueRef) -> ShapeCast {
    create(ctx, op_builder::<ShapeCast>(loc).operand(source).result(ty))
}

impl ShapeCast {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

/// Multiply a flattened `rows x inner` matrix by a flattened
/// `inner x columns` matrix.
pub fn matrix_multiply(
    ctx: &mut IrContext,
    loc: Location,
    lhs: ValueRef,
    rhs: ValueRef,
    rows: usize,
    inner: usize,
    columns: usize,
) -> MatrixMultiply {
    let lhs_ty = ctx.value_ty(lhs);
    let Some(view) = VectorType::from_type(&ctx.types, lhs_ty) else {
        panic!("matrix_multiply: {lhs} is not a vector");
    };
    let ty = ctx.types.vector(view.elem, &[(rows * columns) as i64]);
    create(
        ctx,
        op_builder::<MatrixMultiply>(loc)
            .operands([lhs, rhs])
            .attr(ATTR_LHS_ROWS(), Attribute::from(rows as u64))
            .attr(ATTR_LHS_COLUMNS(), Attribute::from(inner as u64))
            .attr(ATTR_RHS_COLUMNS(), Attribute::from(columns as u64))
            .result(ty),
    )
}

impl MatrixMultiply {
    pub fn lhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn rhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    /// `(lhs_rows, lhs_columns, rhs_columns)`.
    pub fn dims(&self, ctx: &IrContext) -> (usize, usize, usize) {
        let get = |key| {
            ctx.op_attr(self.0, key)
                .and_then(Attribute::as_int)
                .unwrap_or(0) as usize
        };
        (get(ATTR_LHS_ROWS()), get(ATTR_LHS_COLUMNS()), get(ATTR_RHS_COLUMNS()))
    }
}

/// Contiguous vector load from the trailing dimensions of `memref`.
pub fn load(
    ctx: &mut IrContext,
    loc: Location,
    ty: TypeRef,
    memref: ValueRef,
    indices: &[ValueRef],
) -> Load {
    create(
        ctx,
        op_builder::<Load>(loc)
            .operand(memref)
            .operands(indices.iter().copied())
            .result(ty),
    )
}

impl Load {
    pub fn memref(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn indices<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        &ctx.op_operands(self.0)[1..]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

pub fn store(
    ctx: &mut IrContext,
    loc: Location,
    vector: ValueRef,
    memref: ValueRef,
    indices: &[ValueRef],
) -> Store {
    create(
        ctx,
        op_builder::<Store>(loc)
            .operands([vector, memref])
            .operands(indices.iter().copied()),
    )
}

impl Store {
    pub fn vector(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn memref(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn indices<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        &ctx.op_operands(self.0)[2..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{arith, memref};
    use crate::types::Span;

    fn setup() -> (IrContext, Location) {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("vector.mlir".to_owned());
        (ctx, Location::new(path, Span::default()))
    }

    #[test]
    fn transfer_read_splits_operands() {
        let (mut ctx, loc) = setup();
        let f32_ty = ctx.types.f32();
        let mem_ty = ctx.types.memref(f32_ty, &[8, 8], 0);
        let vec_ty = ctx.types.vector(f32_ty, &[4, 4]);
        let buf = memref::alloc(&mut ctx, loc, mem_ty, None).result(&ctx);
        let i = arith::const_index(&mut ctx, loc, 0).result(&ctx);
        let pad = arith::const_f32(&mut ctx, loc, 0.0).result(&ctx);

        let read = transfer_read(&mut ctx, loc, vec_ty, buf, &[i, i], pad, true);
        assert_eq!(read.source(&ctx), buf);
        assert_eq!(read.indices(&ctx), &[i, i]);
        assert_eq!(read.padding(&ctx), pad);
        assert!(read.in_bounds(&ctx));

        let readv = read.result(&ctx);
        let write = transfer_write(&mut ctx, loc, readv, buf, &[i, i], false);
        assert_eq!(write.indices(&ctx), &[i, i]);
        assert!(!write.in_bounds(&ctx));
    }

    #[test]
    fn derived_result_types() {
        let (mut ctx, loc) = setup();
        let f32_ty = ctx.types.f32();
        let v2x3 = ctx.types.vector(f32_ty, &[2, 3]);
        let zero = arith::const_f32(&mut ctx, loc, 0.0).result(&ctx);
        let splat = broadcast(&mut ctx, loc, v2x3, zero).result(&ctx);

        let t = transpose(&mut ctx, loc, splat, &[1, 0]);
        let t_view = VectorType::from_type(&ctx.types, ctx.value_ty(t.result(&ctx))).unwrap();
        assert_eq!(t_view.shape.as_slice(), &[3, 2]);

        let row = extract(&mut ctx, loc, splat, &[1]);
        let row_view = VectorType::from_type(&ctx.types, ctx.value_ty(row.result(&ctx))).unwrap();
        assert_eq!(row_view.shape.as_slice(), &[3]);

        let elem = extract(&mut ctx, loc, splat, &[1, 2]);
        assert_eq!(ctx.value_ty(elem.result(&ctx)), f32_ty);

        let rowv = row.result(&ctx);
        let sum = reduction_add(&mut ctx, loc, rowv);
        assert_eq!(ctx.value_ty(sum.result(&ctx)), f32_ty);

        let outer = outer_product(&mut ctx, loc, rowv, rowv, None);
        let outer_view =
            VectorType::from_type(&ctx.types, ctx.value_ty(outer.result(&ctx))).unwrap();
        assert_eq!(outer_view.shape.as_slice(), &[3, 3]);
        assert_eq!(outer.acc(&ctx), None);
    }

    #[test]
    fn contract_attributes_round_trip() {
        let (mut ctx, loc) = setup();
        let f32_ty = ctx.types.f32();
        let v = ctx.types.vector(f32_ty, &[4, 4]);
        let zero = arith::const_f32(&mut ctx, loc, 0.0).result(&ctx);
        let b = broadcast(&mut ctx, loc, v, zero).result(&ctx);
        use IteratorType::{Parallel, Reduction};
        let c = contract(
            &mut ctx,
            loc,
            b,
            b,
            b,
            [&[0, 2], &[2, 1], &[0, 1]],
            &[Parallel, Parallel, Reduction],
        );
        assert_eq!(c.indexing_maps(&ctx), vec![vec![0, 2], vec![2, 1], vec![0, 1]]);
        assert_eq!(c.iterator_types(&ctx), vec![Parallel, Parallel, Reduction]);
        assert_eq!(ctx.value_ty(c.result(&ctx)), v);
    }
}
