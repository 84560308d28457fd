//! Dialect definitions.
//!
//! Each module declares its operation wrappers with [`define_op!`](crate::define_op),
//! plus builder functions that create detached operations and typed
//! accessors for operands, results and attributes.

pub mod arith;
pub mod core;
pub mod func;
pub mod linalg;
pub mod memref;
pub mod scf;
pub mod vector;

use crate::context::{IrContext, OperationDataBuilder};
use crate::ops::DialectOp;
use crate::symbol::Symbol;
use crate::types::Location;

/// Loop iterator kind of a structured operation or vector contraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IteratorType {
    Parallel,
    Reduction,
}

impl IteratorType {
    pub fn as_str(self) -> &'static str {
        match self {
            IteratorType::Parallel => "parallel",
            IteratorType::Reduction => "reduction",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "parallel" => Some(IteratorType::Parallel),
            "reduction" => Some(IteratorType::Reduction),
            _ => None,
        }
    }
}

/// Start building an operation of kind `T`.
pub(crate) fn op_builder<T: DialectOp>(loc: Location) -> OperationDataBuilder {
    OperationDataBuilder::new(loc, Symbol::new(T::DIALECT_NAME), Symbol::new(T::OP_NAME))
}

/// Create the operation described by `builder` and wrap it as `T`.
pub(crate) fn create<T: DialectOp>(ctx: &mut IrContext, builder: OperationDataBuilder) -> T {
    let data = builder.build(ctx);
    T::from_op_unchecked(ctx.create_op(data))
}

#[cfg(test)]
mod tests {
    use super::IteratorType;

    #[test]
    fn iterator_type_names() {
        for it in [IteratorType::Parallel, IteratorType::Reduction] {
            assert_eq!(IteratorType::parse(it.as_str()), Some(it));
        }
        assert_eq!(IteratorType::parse("window"), None);
    }
}
