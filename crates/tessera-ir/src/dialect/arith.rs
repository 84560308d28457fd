//! `arith` dialect: scalar and element-wise arithmetic.
//!
//! Integer operations work on `index`/`i32` scalars. `addf`/`mulf` also
//! accept vectors and operate element-wise.

use super::{create, op_builder};
use crate::context::IrContext;
use crate::ops::DialectOp;
use crate::refs::{TypeRef, ValueRef};
use crate::symbol::Symbol;
use crate::types::{Attribute, Location};

crate::symbols! {
    ATTR_VALUE => "value",
    ATTR_PREDICATE => "predicate",
}

crate::define_op! {
    pub struct Constant => "arith", "constant";
    pub struct AddI => "arith", "addi";
    pub struct SubI => "arith", "subi";
    pub struct MulI => "arith", "muli";
    pub struct MinSI => "arith", "minsi";
    pub struct AddF => "arith", "addf";
    pub struct MulF => "arith", "mulf";
    /// Signed integer comparison producing an `i1`.
    pub struct CmpI => "arith", "cmpi";
}

pub fn constant(ctx: &mut IrContext, loc: Location, ty: TypeRef, value: Attribute) -> Constant {
    create(
        ctx,
        op_builder::<Constant>(loc)
            .attr(ATTR_VALUE(), value)
            .result(ty),
    )
}

/// An `index` constant.
pub fn const_index(ctx: &mut IrContext, loc: Location, value: i64) -> Constant {
    let ty = ctx.types.index();
    constant(ctx, loc, ty, Attribute::from(value))
}

/// An `f32` constant.
pub fn const_f32(ctx: &mut IrContext, loc: Location, value: f32) -> Constant {
    let ty = ctx.types.f32();
    constant(ctx, loc, ty, Attribute::float(value))
}

/// The zero value of a scalar type.
pub fn zero(ctx: &mut IrContext, loc: Location, ty: TypeRef) -> Constant {
    let value = if ctx.types.is_f32(ty) {
        Attribute::float(0.0)
    } else {
        Attribute::from(0i64)
    };
    constant(ctx, loc, ty, value)
}

impl Constant {
    pub fn value(&self, ctx: &IrContext) -> Attribute {
        ctx.op_attr(self.0, ATTR_VALUE())
            .cloned()
            .unwrap_or(Attribute::Unit)
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}

/// The integer value of `v` if it is produced by an integer constant.
pub fn constant_int(ctx: &IrContext, v: ValueRef) -> Option<i64> {
    let op = ctx.defining_op(v)?;
    Constant::from_op(ctx, op).ok()?.value(ctx).as_int()
}

/// The float value of `v` if it is produced by a float constant.
pub fn constant_float(ctx: &IrContext, v: ValueRef) -> Option<f64> {
    let op = ctx.defining_op(v)?;
    Constant::from_op(ctx, op).ok()?.value(ctx).as_float()
}

/// Binary arithmetic operations sharing the `(lhs, rhs) -> result` shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    AddI,
    SubI,
    MulI,
    MinSI,
    AddF,
    MulF,
}

impl BinaryOp {
    pub fn of(ctx: &IrContext, op: crate::OpRef) -> Option<Self> {
        let kind = if AddI::matches(ctx, op) {
            BinaryOp::AddI
        } else if SubI::matches(ctx, op) {
            BinaryOp::SubI
        } else if MulI::matches(ctx, op) {
            BinaryOp::MulI
        } else if MinSI::matches(ctx, op) {
            BinaryOp::MinSI
        } else if AddF::matches(ctx, op) {
            BinaryOp::AddF
        } else if MulF::matches(ctx, op) {
            BinaryOp::MulF
        } else {
            return None;
        };
        Some(kind)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BinaryOp::AddF | BinaryOp::MulF)
    }

    pub fn fold_int(self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            BinaryOp::AddI => lhs.checked_add(rhs),
            BinaryOp::SubI => lhs.checked_sub(rhs),
            BinaryOp::MulI => lhs.checked_mul(rhs),
            BinaryOp::MinSI => Some(lhs.min(rhs)),
            BinaryOp::AddF | BinaryOp::MulF => None,
        }
    }

    pub fn fold_float(self, lhs: f32, rhs: f32) -> Option<f32> {
        match self {
            BinaryOp::AddF => Some(lhs + rhs),
            BinaryOp::MulF => Some(lhs * rhs),
            _ => None,
        }
    }

    fn names(self) -> (Symbol, Symbol) {
        let name = match self {
            BinaryOp::AddI => AddI::OP_NAME,
            BinaryOp::SubI => SubI::OP_NAME,
            BinaryOp::MulI => MulI::OP_NAME,
            BinaryOp::MinSI => MinSI::OP_NAME,
            BinaryOp::AddF => AddF::OP_NAME,
            BinaryOp::MulF => MulF::OP_NAME,
        };
        (Symbol::new("arith"), Symbol::new(name))
    }

    /// Create the operation; the result has the type of `lhs`.
    pub fn build(
        self,
        ctx: &mut IrContext,
        loc: Location,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> crate::OpRef {
        let (dialect, name) = self.names();
        let ty = ctx.value_ty(lhs);
        let data = crate::OperationDataBuilder::new(loc, dialect, name)
            .operand(lhs)
            .operand(rhs)
            .result(ty)
            .build(ctx);
        ctx.create_op(data)
    }
}

macro_rules! binary_builder {
    ($($fn_name:ident => $ty:ident;)*) => {
        $(
            pub fn $fn_name(ctx: &mut IrContext, loc: Location, lhs: ValueRef, rhs: ValueRef) -> $ty {
                let ty = ctx.value_ty(lhs);
                create(ctx, op_builder::<$ty>(loc).operand(lhs).operand(rhs).result(ty))
            }

            impl $ty {
                pub fn lhs(&self, ctx: &IrContext) -> ValueRef {
                    ctx.op_operands(self.0)[0]
                }

                pub fn rhs(&self, ctx: &IrContext) -> ValueRef {
                    ctx.op_operands(self.0)[1]
                }

                pub fn result(&self, ctx: &IrContext) -> ValueRef {
                    ctx.op_result(self.0, 0)
                }
            }
        )*
    };
}

binary_builder! {
    addi => AddI;
    subi => SubI;
    muli => MulI;
    minsi => MinSI;
    addf => AddF;
    mulf => MulF;
}

/// Comparison predicates supported by `arith.cmpi`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl CmpPredicate {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpPredicate::Eq => "eq",
            CmpPredicate::Ne => "ne",
            CmpPredicate::Slt => "slt",
            CmpPredicate::Sle => "sle",
            CmpPredicate::Sgt => "sgt",
            CmpPredicate::Sge => "sge",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "eq" => CmpPredicate::Eq,
            "ne" => CmpPredicate::Ne,
            "slt" => CmpPredicate::Slt,
            "sle" => CmpPredicate::Sle,
            "sgt" => CmpPredicate::Sgt,
            "sge" => CmpPredicate::Sge,
            _ => return None,
        })
    }

    pub fn evaluate(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpPredicate::Eq => lhs == rhs,
            CmpPredicate::Ne => lhs != rhs,
            CmpPredicate::Slt => lhs < rhs,
            CmpPredicate::Sle => lhs <= rhs,
            CmpPredicate::Sgt => lhs > rhs,
            CmpPredicate::Sge => lhs >= rhs,
        }
    }
}

pub fn cmpi(
    ctx: &mut IrContext,
    loc: Location,
    predicate: CmpPredicate,
    lhs: ValueRef,
    rhs: ValueRef,
) -> CmpI {
    let i1 = ctx.types.i1();
    create(
        ctx,
        op_builder::<CmpI>(loc)
            .operand(lhs)
            .operand(rhs)
            .attr(ATTR_PREDICATE(), Attribute::String(predicate.as_str().to_owned()))
            .result(i1),
    )
}

impl CmpI {
    pub fn predicate(&self, ctx: &IrContext) -> Option<CmpPredicate> {
        match ctx.op_attr(self.0, ATTR_PREDICATE()) {
            Some(Attribute::String(s)) => CmpPredicate::parse(s),
            _ => None,
        }
    }

    pub fn lhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[0]
    }

    pub fn rhs(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_operands(self.0)[1]
    }

    pub fn result(&self, ctx: &IrContext) -> ValueRef {
        ctx.op_result(self.0, 0)
    }
}
