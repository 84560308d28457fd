//! `core` dialect: the module container.

use super::{create, op_builder};
use crate::context::{IrContext, empty_block, single_block_region};
use crate::dialect::func::Func;
use crate::ops::DialectOp;
use crate::refs::{BlockRef, OpRef, RegionRef};
use crate::symbol::Symbol;
use crate::types::{Attribute, Location};

crate::symbols! {
    ATTR_SYM_NAME => "sym_name",
}

crate::define_op! {
    /// Top-level container holding functions in a single block.
    pub struct Module => "core", "module";
}

/// Create an empty module.
pub fn module(ctx: &mut IrContext, loc: Location, name: Symbol) -> Module {
    let block = empty_block(ctx, loc, &[]);
    let region = single_block_region(ctx, loc, block);
    create(
        ctx,
        op_builder::<Module>(loc)
            .attr(ATTR_SYM_NAME(), Attribute::Symbol(name))
            .region(region),
    )
}

impl Module {
    pub fn name(&self, ctx: &IrContext) -> Option<Symbol> {
        ctx.op_attr(self.0, ATTR_SYM_NAME())
            .and_then(Attribute::as_symbol)
    }

    pub fn body(&self, ctx: &IrContext) -> RegionRef {
        ctx.op(self.0).regions[0]
    }

    pub fn body_block(&self, ctx: &IrContext) -> BlockRef {
        ctx.region(self.body(ctx)).blocks[0]
    }

    /// Append a top-level operation.
    pub fn push(&self, ctx: &mut IrContext, op: OpRef) {
        let block = self.body_block(ctx);
        ctx.push_op(block, op);
    }

    /// All `func.func` operations in the module, in order.
    pub fn functions(&self, ctx: &IrContext) -> Vec<Func> {
        ctx.block(self.body_block(ctx))
            .ops
            .iter()
            .filter_map(|&op| Func::from_op(ctx, op).ok())
            .collect()
    }
}
