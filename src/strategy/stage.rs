//! Strategy stages and the operation kinds they target.

use std::fmt;
use std::sync::Arc;

use tessera_ir::ops::{DialectOp, OpKind, OpName};
use tessera_ir::rewrite::RewritePatternSet;
use tessera_ir::{IrContext, OpRef};

use crate::error::StageKind;
use crate::filter::{FilterFunction, TransformationFilter};
use crate::linalg::{
    CopyTransferReadForwarding, LinalgPromotionPattern, LinalgTilingPattern,
    LinalgVectorizationPattern, TransferWriteCopyForwarding,
};
use crate::options::{PromotionOptions, TilingOptions, VectorizationOptions};

/// The operation kind a stage rewrites: its `dialect.op` name, used by the
/// rewrite driver to dispatch, and the kind's own matcher.
#[derive(Clone, Copy)]
pub struct OpTarget {
    name: OpName,
    matcher: fn(&IrContext, OpRef) -> bool,
}

impl OpTarget {
    /// Target a kind that names exactly one operation.
    pub fn of<K: DialectOp>() -> Self {
        Self {
            name: K::op_name(),
            matcher: <K as DialectOp>::matches,
        }
    }

    /// Target `name`, viewed through the kind `K`.
    ///
    /// # Panics
    ///
    /// If `K` names exactly one operation, `name` must be empty or equal to
    /// that name. Otherwise `name` must be a non-empty `dialect.op`.
    pub fn named<K: OpKind>(name: &str) -> Self {
        let resolved = match K::OPERATION_NAME {
            Some(own) => {
                assert!(
                    name.is_empty() || name == own,
                    "operation name `{name}` does not match the kind's own name `{own}`"
                );
                own
            }
            None => {
                assert!(
                    !name.is_empty(),
                    "an operation name is required for a kind without its own name"
                );
                name
            }
        };
        let Some(name) = OpName::parse(resolved) else {
            panic!("invalid operation name `{resolved}`, expected `dialect.op`");
        };
        Self {
            name,
            matcher: <K as OpKind>::matches,
        }
    }

    pub fn name(&self) -> OpName {
        self.name
    }

    /// Whether `op` has the target name and is accepted by the kind.
    pub fn matches(&self, ctx: &IrContext, op: OpRef) -> bool {
        self.name.matches(ctx, op) && (self.matcher)(ctx, op)
    }
}

impl fmt::Debug for OpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpTarget({})", self.name)
    }
}

impl PartialEq for OpTarget {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

fn wrap_filter(filter: impl Fn(&IrContext, OpRef) -> bool + Send + Sync + 'static) -> FilterFunction {
    Arc::new(filter)
}

/// Tile the target operation into a loop nest.
#[derive(Clone)]
pub struct Tile {
    target: OpTarget,
    options: TilingOptions,
    filter: Option<FilterFunction>,
}

impl Tile {
    pub fn new<K: DialectOp>(options: TilingOptions) -> Self {
        Self::with_target(OpTarget::of::<K>(), options)
    }

    pub fn named<K: OpKind>(name: &str, options: TilingOptions) -> Self {
        Self::with_target(OpTarget::named::<K>(name), options)
    }

    fn with_target(target: OpTarget, options: TilingOptions) -> Self {
        Self {
            target,
            options,
            filter: None,
        }
    }

    /// Only rewrite operations accepted by `filter`.
    pub fn with_filter(mut self, filter: impl Fn(&IrContext, OpRef) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(wrap_filter(filter));
        self
    }

    pub fn options(&self) -> &TilingOptions {
        &self.options
    }
}

/// Promote the tiled operands of the target operation into local buffers.
#[derive(Clone)]
pub struct Promote {
    target: OpTarget,
    options: PromotionOptions,
    filter: Option<FilterFunction>,
}

impl Promote {
    pub fn new<K: DialectOp>(options: PromotionOptions) -> Self {
        Self::with_target(OpTarget::of::<K>(), options)
    }

    pub fn named<K: OpKind>(name: &str, options: PromotionOptions) -> Self {
        Self::with_target(OpTarget::named::<K>(name), options)
    }

    fn with_target(target: OpTarget, options: PromotionOptions) -> Self {
        Self {
            target,
            options,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&IrContext, OpRef) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(wrap_filter(filter));
        self
    }

    pub fn options(&self) -> &PromotionOptions {
        &self.options
    }
}

/// Vectorize the target operation.
#[derive(Clone)]
pub struct Vectorize {
    target: OpTarget,
    options: VectorizationOptions,
    filter: Option<FilterFunction>,
}

impl Vectorize {
    pub fn new<K: DialectOp>() -> Self {
        Self::with_target(OpTarget::of::<K>())
    }

    pub fn named<K: OpKind>(name: &str) -> Self {
        Self::with_target(OpTarget::named::<K>(name))
    }

    fn with_target(target: OpTarget) -> Self {
        Self {
            target,
            options: VectorizationOptions::default(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&IrContext, OpRef) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(wrap_filter(filter));
        self
    }
}

/// One step of a [`CodegenStrategy`](super::CodegenStrategy).
#[derive(Clone)]
pub enum Stage {
    Tile(Tile),
    Promote(Promote),
    Vectorize(Vectorize),
}

impl From<Tile> for Stage {
    fn from(stage: Tile) -> Self {
        Stage::Tile(stage)
    }
}

impl From<Promote> for Stage {
    fn from(stage: Promote) -> Self {
        Stage::Promote(stage)
    }
}

impl From<Vectorize> for Stage {
    fn from(stage: Vectorize) -> Self {
        Stage::Vectorize(stage)
    }
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Tile(_) => StageKind::Tile,
            Stage::Promote(_) => StageKind::Promote,
            Stage::Vectorize(_) => StageKind::Vectorize,
        }
    }

    pub fn target(&self) -> OpTarget {
        match self {
            Stage::Tile(s) => s.target,
            Stage::Promote(s) => s.target,
            Stage::Vectorize(s) => s.target,
        }
    }

    pub fn filter_function(&self) -> Option<&FilterFunction> {
        match self {
            Stage::Tile(s) => s.filter.as_ref(),
            Stage::Promote(s) => s.filter.as_ref(),
            Stage::Vectorize(s) => s.filter.as_ref(),
        }
    }

    /// The rewrite rules of this stage, guarded by `filter`.
    ///
    /// Vectorization also brings the copy/transfer forwarding rules, at a
    /// higher benefit than the vectorization rule itself.
    pub fn patterns(&self, filter: TransformationFilter) -> RewritePatternSet {
        let mut patterns = RewritePatternSet::new();
        match self {
            Stage::Tile(s) => {
                patterns.add(LinalgTilingPattern::new(s.target, s.options.clone(), filter));
            }
            Stage::Promote(s) => {
                patterns.add(LinalgPromotionPattern::new(s.target, s.options.clone(), filter));
            }
            Stage::Vectorize(s) => {
                patterns
                    .add(LinalgVectorizationPattern::new(s.target, s.options.clone(), filter))
                    .add(CopyTransferReadForwarding)
                    .add(TransferWriteCopyForwarding);
            }
        }
        patterns
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Stage");
        s.field("kind", &self.kind()).field("target", &self.target());
        match self {
            Stage::Tile(t) => s.field("options", &t.options),
            Stage::Promote(p) => s.field("options", &p.options),
            Stage::Vectorize(v) => s.field("options", &v.options),
        };
        s.field("has_filter", &self.filter_function().is_some()).finish()
    }
}
