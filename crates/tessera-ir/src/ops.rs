//! Operation names, typed operation wrappers and the `define_op!` macro.
//!
//! Two traits describe what a piece of code can match against:
//!
//! - [`DialectOp`] is a wrapper around exactly one `dialect.op` kind and
//!   therefore knows its own name.
//! - [`OpKind`] is anything an operation can be tested against. Every
//!   `DialectOp` is an `OpKind` whose [`OpKind::OPERATION_NAME`] is `Some`;
//!   interfaces that cover a family of operations report `None` and callers
//!   must name the concrete operation themselves.

use std::fmt;

use derive_more::Display;

use crate::context::IrContext;
use crate::refs::OpRef;
use crate::symbol::Symbol;

/// Error when viewing an operation as a dialect-specific wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ConversionError {
    /// Operation name doesn't match expected dialect.operation.
    #[display("expected `{expected}`, found `{actual}`")]
    WrongOperation {
        expected: &'static str,
        actual: String,
    },
    /// Missing required attribute.
    #[display("missing attribute `{_0}`")]
    MissingAttribute(&'static str),
    /// Wrong number of operands.
    #[display("wrong operand count: expected {expected}, found {actual}")]
    WrongOperandCount { expected: usize, actual: usize },
}

impl std::error::Error for ConversionError {}

/// A `dialect.op` pair identifying an operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpName {
    pub dialect: Symbol,
    pub name: Symbol,
}

impl OpName {
    pub fn new(dialect: Symbol, name: Symbol) -> Self {
        Self { dialect, name }
    }

    /// Parse `dialect.op`. Both halves must be non-empty.
    pub fn parse(text: &str) -> Option<Self> {
        let (dialect, name) = text.split_once('.')?;
        if dialect.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            dialect: Symbol::from_dynamic(dialect),
            name: Symbol::from_dynamic(name),
        })
    }

    /// The name of an existing operation.
    pub fn of(ctx: &IrContext, op: OpRef) -> Self {
        let data = ctx.op(op);
        Self {
            dialect: data.dialect,
            name: data.name,
        }
    }

    pub fn matches(&self, ctx: &IrContext, op: OpRef) -> bool {
        ctx.op_is(op, self.dialect, self.name)
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dialect, self.name)
    }
}

/// Trait for typed wrappers around a single operation kind.
pub trait DialectOp: Sized + Copy {
    const DIALECT_NAME: &'static str;
    const OP_NAME: &'static str;
    /// Full `dialect.op` name.
    const NAME: &'static str;

    fn from_op(ctx: &IrContext, op: OpRef) -> Result<Self, ConversionError>;
    fn op_ref(&self) -> OpRef;

    /// Wrap an operation that is already known to be of this kind.
    #[doc(hidden)]
    fn from_op_unchecked(op: OpRef) -> Self;

    fn matches(ctx: &IrContext, op: OpRef) -> bool {
        ctx.op_is(
            op,
            Symbol::new(Self::DIALECT_NAME),
            Symbol::new(Self::OP_NAME),
        )
    }

    fn op_name() -> OpName {
        OpName::new(Symbol::new(Self::DIALECT_NAME), Symbol::new(Self::OP_NAME))
    }
}

/// Anything an operation can be matched against.
pub trait OpKind {
    /// The canonical `dialect.op` name, when the kind denotes exactly one
    /// operation.
    const OPERATION_NAME: Option<&'static str>;

    fn matches(ctx: &IrContext, op: OpRef) -> bool;
}

impl<T: DialectOp> OpKind for T {
    const OPERATION_NAME: Option<&'static str> = Some(T::NAME);

    fn matches(ctx: &IrContext, op: OpRef) -> bool {
        <T as DialectOp>::matches(ctx, op)
    }
}

/// Define one or more typed operation wrappers.
///
/// ```
/// tessera_ir::define_op! {
///     /// A test operation.
///     pub struct Probe => "test", "probe";
/// }
///
/// use tessera_ir::ops::DialectOp;
/// assert_eq!(Probe::NAME, "test.probe");
/// ```
#[macro_export]
macro_rules! define_op {
    ($($(#[$meta:meta])* $vis:vis struct $ty:ident => $dialect:literal, $op:literal;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq)]
            $vis struct $ty($crate::OpRef);

            impl $crate::ops::DialectOp for $ty {
                const DIALECT_NAME: &'static str = $dialect;
                const OP_NAME: &'static str = $op;
                const NAME: &'static str = concat!($dialect, ".", $op);

                fn from_op(
                    ctx: &$crate::IrContext,
                    op: $crate::OpRef,
                ) -> Result<Self, $crate::ops::ConversionError> {
                    if !<Self as $crate::ops::DialectOp>::matches(ctx, op) {
                        return Err($crate::ops::ConversionError::WrongOperation {
                            expected: <Self as $crate::ops::DialectOp>::NAME,
                            actual: $crate::ops::OpName::of(ctx, op).to_string(),
                        });
                    }
                    Ok(Self(op))
                }

                fn op_ref(&self) -> $crate::OpRef {
                    self.0
                }

                fn from_op_unchecked(op: $crate::OpRef) -> Self {
                    Self(op)
                }
            }

            impl $ty {
                /// Get the underlying OpRef.
                pub fn op_ref(&self) -> $crate::OpRef {
                    self.0
                }
            }
        )*
    };
}
