//! Arena-based IR for structured loop code generation.
//!
//! Operations, values, blocks and regions live in [`IrContext`]; dialect
//! wrappers in [`dialect`] give them typed accessors. [`rewrite`] drives
//! pattern rewrites to a fixed point, [`transforms`] provides the cleanups
//! run between rewrite stages, and [`interp`] executes a function for
//! testing.

pub mod context;
pub mod dialect;
pub mod effects;
pub mod interp;
pub mod ops;
pub mod printer;
pub mod refs;
pub mod rewrite;
pub mod symbol;
pub mod transforms;
pub mod types;
pub mod walk;

pub use context::{
    BlockArgData, BlockData, IrContext, OperationData, OperationDataBuilder, RegionData, Use,
    ValueData,
};
pub use ops::{ConversionError, DialectOp, OpKind, OpName};
pub use refs::{BlockRef, OpRef, PathRef, RegionRef, TypeRef, ValueDef, ValueRef};
pub use symbol::Symbol;
pub use types::{
    Attribute, DYNAMIC, Location, MemRefType, Span, TypeData, TypeDataBuilder, TypeInterner,
    VectorType,
};
pub use walk::WalkAction;
