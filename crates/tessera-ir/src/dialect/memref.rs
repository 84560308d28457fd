//! `memref` dialect: buffers, views and scalar memory access.

use smallvec::SmallVec;

use super::{create, op_builder};
use crate::context::IrContext;
use crate::dialect::arith;
use crate::refs::{TypeRef, ValueRef};
use crate::types::{Attribute, DYNAMIC, Location, MemRefType};

crate::symbols! {
    ATTR_ALIGNMENT => "alignment",
    ATTR_INDEX => "index",
    ATTR_STATIC_OFFSETS => "static_offsets",
    ATTR_STATIC_SIZES => "static_sizes",
}

crate::define_op! {
    /// Heap allocation of a statically shaped buffer.
    pub struct Alloc => "memref", "alloc";
    /// Stack allocation released when the enclosing function returns.
    pub struct Alloca => "memref", "alloca";
    pub struct Dealloc => "memref", "dealloc";
    /// Extent of one dimension of a buffer.
    pub struct Dim => "memref", "dim";
    /// Rectangular window into a buffer with unit strides.
    pub struct SubView => "memref", "subview";
    pub struct Load => "memref", "load";
    pub struct Store => "memref", "store";
    /// Element-wise copy between two buffers of identical extents.
    pub struct Copy => "memref", "copy";
}

/// Static or dynamic index/extent of a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexValue {
    Static(i64),
    Dynamic(ValueRef),
}

impl IndexValue {
    /// The static value, also seeing through `arith.constant`.
    pub fn constant(&self, ctx: &IrContext) -> Option<i64> {
        match *self {
            IndexValue::Static(v) => Some(v),
            IndexValue::Dynamic(v) => arith::constant_int(ctx, v),
        }
    }
}

pub fn alloc(ctx: &mut IrContext, loc: Location, ty: TypeRef, alignment: Option<u64>) -> Alloc {
    let mut builder = op_builder::<Alloc>(loc).result(ty);
    if let Some(align) = alignment {
        builder = builder.attr(ATTR_ALIGNMENT(), Attribute::from(align));
    }
    create(ctx, builder)
}

pub fn alloca(ctx: &mut IrContext, loc: Location, ty: TypeRef, alignment: Option<u64>) -> Alloca {
    let mut builder = op_builder::<Alloca>(loc).result(ty);
    if let Some(align) = alignment {
        builder = builder.attr(ATTR_ALIGNMENT(), Attribute::from(align));
    }
    create(ctx, builder)
}

pub fn dealloc(ctx: &mut IrContext, loc: Location, buffer: ValueRef) -> Dealloc {
    create(ctx, op_builder::<Dealloc>(loc).operand(buffer))
}

pub fn dim(ctx: &mut IrContext, loc: Location, source: ValueRef, index: usize) -> Dim {
    let ty = ctx.types.index();
    create(
        ctx,
        op_builder::<Dim>(loc)
            .operand(source)
            .attr(ATTR_INDEX(), Attribute::from(index as u64))
            .result(ty),
    )
}

/// Create a unit-stride view of `source` at `offsets` with extents `sizes`.
///
/// The result type keeps the source element type and memory space; dynamic
/// sizes become dynamic dimensions.
///
/// # Panics
///
/// Panics if `source` is not a memref or if the rank does not match.
pub fn subview(
    ctx: &mut IrContext,
    loc: Location,
    source: ValueRef,
    offsets: &[IndexValue],
    sizes: &[IndexValue],
) -> SubView {
    let source_ty = ctx.value_ty(source);
    let Some(source_view) = MemRefType::from_type(&ctx.types, source_ty) else {
        panic!("subview: source {source} is not a memref");
    };
    assert!(
        offsets.len() == source_view.rank() && sizes.len() == source_view.rank(),
        "subview: expected {} offsets and sizes",
        source_view.rank(),
    );

    let split = |values: &[IndexValue]| {
        let mut statics: SmallVec<[i64; 4]> = SmallVec::new();
        let mut dynamics: SmallVec<[ValueRef; 4]> = SmallVec::new();
        for v in values {
            match *v {
                IndexValue::Static(s) => statics.push(s),
                IndexValue::Dynamic(d) => {
                    statics.push(DYNAMIC);
                    dynamics.push(d);
                }
            }
        }
        (statics, dynamics)
    };
    let (static_offsets, dyn_offsets) = split(offsets);
    let (static_sizes, dyn_sizes) = split(sizes);

    let result_ty = ctx
        .types
        .memref(source_view.elem, &static_sizes, source_view.memory_space);
    create(
        ctx,
        op_builder::<SubView>(loc)
            .operand(source)
            .operands(dyn_offsets)
            .operands(dyn_sizes)
            .attr(ATTR_STATIC_OFFSETS(), Attribute::int_list(&static_offsets))
            .attr(ATTR_STATIC_SIZES(), Attribute::int_list(&static_sizes))
            .result(result_ty),
    )
}

pub fn load(
    ctx: &mut IrContext,
    loc: Location,
    memref: ValueRef,
    indices: impl IntoIterator<Item = ValueRef>,
) -> Load {
    let memref_ty = ctx.value_ty(memref);
    let Some(view) = MemRefType::from_type(&ctx.types, memref_ty) else {
        panic!("load: {memref} is not a memref");
    };
    create(
        ctx,
        op_builder::<Load>(loc)
            .operand(memref)
            .operands(indices)
            .result(view.elem),
    )
}

pub fn store(
    ctx: &mut IrContext,
    loc: Location,
    value: ValueRef,
    memref: ValueRef,
    indices: impl IntoIterator<Item = ValueRef>,
) -> Store {
    create(
        ctx,
        op_builder::<Store>(loc)
            .operand(value)
            .operand(memref)
            .operands(indices),
    )
}

pub fn copy(ctx: &mut IrContext, loc: Location, source: ValueRef, target: ValueRef) -> Copy {
    create(ctx, op_builder::<Copy>(loc).operand(source).operand(target))
}

impl Alloc {
    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }

    pub fn alignment(&self, ctx: &IrContext) -> Option<u64> {
        alignment_of(ctx, self.0)
    }
}

impl Alloca {
    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }

    pub fn alignment(&self, ctx: &IrContext) -> Option<u64> {
        alignment_of(ctx, self.0)
    }
}

fn alignment_of(ctx: &IrContext, op: crate::OpRef) -> Option<u64> {
    match ctx.op_attr(op, ATTR_ALIGNMENT()) {
        Some(Attribute::IntBits(bits)) => Some(*bits),
        _ => None,
    }
}

impl Dealloc {
    pub fn buffer(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }
}

impl Dim {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn index(&self, ctx: &IrContext) -> usize {
        ctx.op_attr(self.0, ATTR_INDEX())
            .and_then(Attribute::as_int)
            .unwrap_or(0) as usize
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

impl SubView {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }

    fn statics(&self, ctx: &IrContext, key: crate::Symbol) -> SmallVec<[i64; 4]> {
        ctx.op_attr(self.0, key)
            .and_then(Attribute::as_int_list)
            .unwrap_or_default()
    }

    fn dynamic_offset_count(&self, ctx: &IrContext) -> usize {
        self.statics(ctx, ATTR_STATIC_OFFSETS())
            .iter()
            .filter(|&&o| o == DYNAMIC)
            .count()
    }

    fn merge(statics: &[i64], dynamics: &[ValueRef]) -> SmallVec<[IndexValue; 4]> {
        let mut next = dynamics.iter().copied();
        statics
            .iter()
            .map(|&s| match (s == DYNAMIC).then(|| next.next()).flatten() {
                Some(v) => IndexValue::Dynamic(v),
                None => IndexValue::Static(s),
            })
            .collect()
    }

    pub fn offsets(&self, ctx: &IrContext) -> SmallVec<[IndexValue; 4]> {
        let statics = self.statics(ctx, ATTR_STATIC_OFFSETS());
        let dynamic = self.dynamic_offset_count(ctx);
        Self::merge(&statics, &ctx.op_operands(self.0)[1..1 + dynamic])
    }

    pub fn sizes(&self, ctx: &IrContext) -> SmallVec<[IndexValue; 4]> {
        let statics = self.statics(ctx, ATTR_STATIC_SIZES());
        let dynamic = self.dynamic_offset_count(ctx);
        Self::merge(&statics, &ctx.op_operands(self.0)[1 + dynamic..])
    }
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

impl Store {
    pub fn value(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn memref(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn indices<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        &ctx.op_operands(self.0)[2..]
    }
}

impl Copy {
    pub fn source(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn target(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Span;

    #[test]
    fn subview_keeps_space_and_mixes_sizes() {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("memref.mlir".to_owned());
        let loc = Location::new(path, Span::default());
        let f32_ty = ctx.types.f32();
        let ty = ctx.types.memref(f32_ty, &[8, 8], 2);
        let buf = alloc(&mut ctx, loc, ty, Some(16));
        assert_eq!(buf.alignment(&ctx), Some(16));

        let off = arith::const_index(&mut ctx, loc, 4).result(&ctx);
        let size = arith::const_index(&mut ctx, loc, 3).result(&ctx);
        let bufv = buf.result(&ctx);
        let view = subview(
            &mut ctx,
            loc,
            bufv,
            &[IndexValue::Dynamic(off), IndexValue::Static(0)],
            &[IndexValue::Static(4), IndexValue::Dynamic(size)],
        );

        let view_ty = MemRefType::from_type(&ctx.types, ctx.value_ty(view.result(&ctx))).unwrap();
        assert_eq!(view_ty.shape.as_slice(), &[4, DYNAMIC]);
        assert_eq!(view_ty.memory_space, 2);
        assert_eq!(
            view.offsets(&ctx).as_slice(),
            &[IndexValue::Dynamic(off), IndexValue::Static(0)]
        );
        assert_eq!(
            view.sizes(&ctx).as_slice(),
            &[IndexValue::Static(4), IndexValue::Dynamic(size)]
        );
        assert_eq!(view.sizes(&ctx)[1].constant(&ctx), Some(3));
    }
}
