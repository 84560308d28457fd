//! `func` dialect.

use super::{create, op_builder};
use crate::context::{IrContext, empty_block, single_block_region};
use crate::refs::{BlockRef, RegionRef, TypeRef, ValueRef};
use crate::symbol::Symbol;
use crate::types::{Attribute, Location};

crate::symbols! {
    ATTR_SYM_NAME => "sym_name",
}

crate::define_op! {
    /// A function whose signature is given by its entry block arguments.
    pub struct Func => "func", "func";
    pub struct Return => "func", "return";
}

/// Create a function with an empty entry block taking `arg_types`.
///
/// The caller is responsible for appending a `func.return`.
pub fn func(ctx: &mut IrContext, loc: Location, name: Symbol, arg_types: &[TypeRef]) -> Func {
    let block = empty_block(ctx, loc, arg_types);
    let region = single_block_region(ctx, loc, block);
    create(
        ctx,
        op_builder::<Func>(loc)
            .attr(ATTR_SYM_NAME(), Attribute::Symbol(name))
            .region(region),
    )
}

pub fn r#return(
    ctx: &mut IrContext,
    loc: Location,
    values: impl IntoIterator<Item = ValueRef>,
) -> Return {
    create(ctx, op_builder::<Return>(loc).operands(values))
}

impl Func {
    pub fn sym_name(&self, ctx: &IrContext) -> Symbol {
        match ctx.op_attr(self.0, ATTR_SYM_NAME()) {
            Some(Attribute::Symbol(name)) => *name,
            _ => Symbol::new(""),
        }
    }

    pub fn body(&self, ctx: &IrContext) -> RegionRef {
        ctx.op(self.0).regions[0]
    }

    pub fn entry_block(&self, ctx: &IrContext) -> BlockRef {
        ctx.region(self.body(ctx)).blocks[0]
    }

    pub fn args<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        ctx.block_args(self.entry_block(ctx))
    }
}

impl Return {
    pub fn values<'a>(&self, ctx: &'a IrContext) -> &'a [ValueRef] {
        ctx.op_operands(self.0)
    }
}
