//! The codegen strategy: an ordered list of stages plus a fixed post phase.
//!
//! ```text
//! stage 0 ─► canonicalize ─► stage 1 ─► canonicalize ─► ... ─►
//!     lower vector.contract ─► lower vector transfers ─► hoist (optional)
//! ```
//!
//! Stages are applied one at a time, each to a fixed point. Operations
//! produced by stage `i` carry its marker and are the only candidates of
//! stage `i + 1`.

mod stage;

pub use stage::{OpTarget, Promote, Stage, Tile, Vectorize};

use tracing::{Level, debug, trace, warn};

use tessera_ir::dialect::{core, func};
use tessera_ir::ops::{DialectOp, OpKind};
use tessera_ir::printer::print_op;
use tessera_ir::rewrite::{ApplyResult, GreedyRewriteConfig, apply_patterns_greedily};
use tessera_ir::transforms::{CanonicalizeResult, canonicalize, hoist_allocations, hoist_loop_invariant_code};
use tessera_ir::{IrContext, OpRef};

use crate::error::{StageKind, TransformError};
use crate::filter::{MarkerTable, TransformationFilter};
use crate::options::{PromotionOptions, TilingOptions, VectorTransferToLoopsOptions, VectorTransformsOptions};
use crate::vector;

/// Ordered tile / promote / vectorize stages for structured operations.
///
/// Stages run in insertion order. Building a strategy never touches IR;
/// everything happens in [`transform`](Self::transform).
#[derive(Clone, Debug)]
pub struct CodegenStrategy {
    stages: Vec<Stage>,
    vector_transforms: VectorTransformsOptions,
    transfer_lowering: VectorTransferToLoopsOptions,
    enable_licm: bool,
    rewrite_config: GreedyRewriteConfig,
}

impl Default for CodegenStrategy {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            vector_transforms: VectorTransformsOptions::default(),
            transfer_lowering: VectorTransferToLoopsOptions::default(),
            enable_licm: true,
            rewrite_config: GreedyRewriteConfig::default(),
        }
    }
}

/// What one stage did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageReport {
    pub kind: StageKind,
    pub rewrite: ApplyResult,
    pub canonicalize: CanonicalizeResult,
}

/// What a [`CodegenStrategy::transform`] run did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformReport {
    pub stages: Vec<StageReport>,
    pub contractions: ApplyResult,
    pub transfers: ApplyResult,
    /// Operations hoisted out of loops, if hoisting is enabled.
    pub hoisted: Option<usize>,
}

impl CodegenStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn append(&mut self, stage: impl Into<Stage>) -> &mut Self {
        self.stages.push(stage.into());
        self
    }

    pub fn append_if(&mut self, cond: bool, stage: impl Into<Stage>) -> &mut Self {
        if cond { self.append(stage) } else { self }
    }

    pub fn tile<K: DialectOp>(&mut self, options: TilingOptions) -> &mut Self {
        self.append(Tile::new::<K>(options))
    }

    /// # Panics
    ///
    /// See [`OpTarget::named`].
    pub fn tile_named<K: OpKind>(&mut self, name: &str, options: TilingOptions) -> &mut Self {
        self.append(Tile::named::<K>(name, options))
    }

    pub fn tile_if<K: DialectOp>(&mut self, cond: bool, options: TilingOptions) -> &mut Self {
        if cond { self.tile::<K>(options) } else { self }
    }

    pub fn tile_named_if<K: OpKind>(&mut self, cond: bool, name: &str, options: TilingOptions) -> &mut Self {
        if cond { self.tile_named::<K>(name, options) } else { self }
    }

    pub fn promote<K: DialectOp>(&mut self, options: PromotionOptions) -> &mut Self {
        self.append(Promote::new::<K>(options))
    }

    pub fn promote_named<K: OpKind>(&mut self, name: &str, options: PromotionOptions) -> &mut Self {
        self.append(Promote::named::<K>(name, options))
    }

    pub fn promote_if<K: DialectOp>(&mut self, cond: bool, options: PromotionOptions) -> &mut Self {
        if cond { self.promote::<K>(options) } else { self }
    }

    pub fn promote_named_if<K: OpKind>(&mut self, cond: bool, name: &str, options: PromotionOptions) -> &mut Self {
        if cond { self.promote_named::<K>(name, options) } else { self }
    }

    pub fn vectorize<K: DialectOp>(&mut self) -> &mut Self {
        self.append(Vectorize::new::<K>())
    }

    pub fn vectorize_named<K: OpKind>(&mut self, name: &str) -> &mut Self {
        self.append(Vectorize::named::<K>(name))
    }

    pub fn vectorize_if<K: DialectOp>(&mut self, cond: bool) -> &mut Self {
        if cond { self.vectorize::<K>() } else { self }
    }

    pub fn vectorize_named_if<K: OpKind>(&mut self, cond: bool, name: &str) -> &mut Self {
        if cond { self.vectorize_named::<K>(name) } else { self }
    }

    /// Like [`tile`](Self::tile), restricted to operations accepted by
    /// `filter`.
    pub fn tile_with_filter<K: DialectOp>(
        &mut self,
        options: TilingOptions,
        filter: impl Fn(&IrContext, OpRef) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.append(Tile::new::<K>(options).with_filter(filter))
    }

    pub fn promote_with_filter<K: DialectOp>(
        &mut self,
        options: PromotionOptions,
        filter: impl Fn(&IrContext, OpRef) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.append(Promote::new::<K>(options).with_filter(filter))
    }

    pub fn vectorize_with_filter<K: DialectOp>(
        &mut self,
        filter: impl Fn(&IrContext, OpRef) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.append(Vectorize::new::<K>().with_filter(filter))
    }

    pub fn set_vector_transforms_options(&mut self, options: VectorTransformsOptions) -> &mut Self {
        self.vector_transforms = options;
        self
    }

    pub fn set_vector_transfer_lowering_options(&mut self, options: VectorTransferToLoopsOptions) -> &mut Self {
        self.transfer_lowering = options;
        self
    }

    pub fn set_hoist_invariant_code(&mut self, enable: bool) -> &mut Self {
        self.enable_licm = enable;
        self
    }

    /// Bound every fixed-point application of the run.
    pub fn set_rewrite_config(&mut self, config: GreedyRewriteConfig) -> &mut Self {
        self.rewrite_config = config;
        self
    }

    /// Apply every stage to `func`, then lower vector operations and hoist
    /// loop-invariant code.
    ///
    /// Stops at the first step that fails to converge. Rewrites already done
    /// are kept.
    pub fn transform(&self, ctx: &mut IrContext, func: func::Func) -> Result<TransformReport, TransformError> {
        let root = func.op_ref();
        let markers = MarkerTable::new();
        let mut stages = Vec::with_capacity(self.stages.len());
        trace_ir(ctx, root, "before strategy");

        for (index, stage) in self.stages.iter().enumerate() {
            let kind = stage.kind();
            let filter = TransformationFilter::for_stage(index, stage.filter_function().cloned(), markers.clone());
            let patterns = stage.patterns(filter);
            let rewrite = apply_patterns_greedily(ctx, root, &patterns, self.rewrite_config).map_err(|source| {
                warn!(index, %kind, %source, "stage failed");
                TransformError::Stage { index, kind, source }
            })?;
            debug!(
                index,
                %kind,
                target = %stage.target().name(),
                changes = rewrite.total_changes,
                iterations = rewrite.iterations,
                "applied stage"
            );

            let canonicalize = canonicalize(ctx, root, self.rewrite_config).map_err(|source| {
                warn!(index, %source, "canonicalization failed");
                TransformError::Canonicalization { index, source }
            })?;
            trace_ir(ctx, root, "after stage");
            stages.push(StageReport {
                kind,
                rewrite,
                canonicalize,
            });
        }

        let contractions = vector::lower_contractions(ctx, root, &self.vector_transforms, self.rewrite_config)
            .map_err(|source| {
                warn!(%source, "vector contraction lowering failed");
                TransformError::VectorTransforms { source }
            })?;
        debug!(changes = contractions.total_changes, lowering = ?self.vector_transforms.contract_lowering, "lowered contractions");

        let transfers = vector::lower_transfers(ctx, root, &self.transfer_lowering, self.rewrite_config)
            .map_err(|source| {
                warn!(%source, "vector transfer lowering failed");
                TransformError::TransferLowering { source }
            })?;
        debug!(changes = transfers.total_changes, unroll = self.transfer_lowering.unroll, "lowered transfers");

        let hoisted = self.enable_licm.then(|| {
            let hoisted = hoist_loop_invariant_code(ctx, root) + hoist_allocations(ctx, root);
            debug!(hoisted, "hoisted loop-invariant code");
            hoisted
        });
        trace_ir(ctx, root, "after strategy");

        Ok(TransformReport {
            stages,
            contractions,
            transfers,
            hoisted,
        })
    }

    /// [`transform`](Self::transform) every function of `module`, stopping at
    /// the first failure.
    pub fn transform_module(
        &self,
        ctx: &mut IrContext,
        module: core::Module,
    ) -> Result<Vec<TransformReport>, TransformError> {
        module
            .functions(ctx)
            .into_iter()
            .map(|func| self.transform(ctx, func))
            .collect()
    }
}

fn trace_ir(ctx: &IrContext, root: OpRef, message: &str) {
    if tracing::enabled!(Level::TRACE) {
        trace!(ir = %print_op(ctx, root), "{message}");
    }
}
