//! Serializable description of a two-level tiling strategy.

use serde::{Deserialize, Serialize};
use tessera_ir::ops::DialectOp;
use tessera_ir::rewrite::GreedyRewriteConfig;

use crate::options::{PromotionOptions, TilingOptions, VectorTransferToLoopsOptions, VectorTransformsOptions};
use crate::strategy::CodegenStrategy;

/// Cache-level tiling and promotion, register-level tiling and promotion,
/// then vectorization, for a single operation kind. Absent levels are
/// skipped.
///
/// ```
/// use tessera::StrategyConfig;
/// use tessera_ir::dialect::linalg::Matmul;
///
/// let config: StrategyConfig = serde_json::from_str(
///     r#"{ "tile": { "tile_sizes": [32, 32, 32] }, "vectorize": true }"#,
/// )
/// .unwrap();
/// assert_eq!(config.build::<Matmul>().len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub tile: Option<TilingOptions>,
    pub promote: Option<PromotionOptions>,
    pub register_tile: Option<TilingOptions>,
    pub register_promote: Option<PromotionOptions>,
    pub vectorize: bool,
    pub vector_transforms: VectorTransformsOptions,
    pub transfer_lowering: VectorTransferToLoopsOptions,
    pub hoist_invariant_code: bool,
    /// Iteration bound of every fixed-point application; the rewrite
    /// driver's default when absent.
    pub max_iterations: Option<usize>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            tile: None,
            promote: None,
            register_tile: None,
            register_promote: None,
            vectorize: false,
            vector_transforms: VectorTransformsOptions::default(),
            transfer_lowering: VectorTransferToLoopsOptions::default(),
            hoist_invariant_code: true,
            max_iterations: None,
        }
    }
}

impl StrategyConfig {
    pub fn rewrite_config(&self) -> GreedyRewriteConfig {
        let config = GreedyRewriteConfig::default();
        match self.max_iterations {
            Some(n) => config.with_max_iterations(n),
            None => config,
        }
    }

    /// The strategy described by this configuration, targeting `K`.
    pub fn build<K: DialectOp>(&self) -> CodegenStrategy {
        let mut strategy = CodegenStrategy::new();
        strategy
            .tile_if::<K>(self.tile.is_some(), self.tile.clone().unwrap_or_default())
            .promote_if::<K>(self.promote.is_some(), self.promote.clone().unwrap_or_default())
            .tile_if::<K>(self.register_tile.is_some(), self.register_tile.clone().unwrap_or_default())
            .promote_if::<K>(
                self.register_promote.is_some(),
                self.register_promote.clone().unwrap_or_default(),
            )
            .vectorize_if::<K>(self.vectorize)
            .set_vector_transforms_options(self.vector_transforms.clone())
            .set_vector_transfer_lowering_options(self.transfer_lowering.clone())
            .set_hoist_invariant_code(self.hoist_invariant_code)
            .set_rewrite_config(self.rewrite_config());
        strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::VectorContractLowering;
    use tessera_ir::dialect::linalg::Matmul;

    #[test]
    fn empty_config_builds_an_empty_strategy() {
        let config: StrategyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StrategyConfig::default());
        assert!(config.hoist_invariant_code);
        assert!(config.build::<Matmul>().is_empty());
    }

    #[test]
    fn every_level_becomes_a_stage() {
        let config: StrategyConfig = serde_json::from_str(
            r#"{
                "tile": { "tile_sizes": [64, 64, 64] },
                "promote": {},
                "register_tile": { "tile_sizes": [4, 4, 4], "interchange": [1, 0, 2] },
                "register_promote": { "use_full_tile_buffers_by_default": true },
                "vectorize": true,
                "vector_transforms": { "contract_lowering": "dot" },
                "max_iterations": 3
            }"#,
        )
        .unwrap();
        assert_eq!(config.vector_transforms.contract_lowering, VectorContractLowering::Dot);
        assert_eq!(config.rewrite_config().max_iterations, 3);
        assert_eq!(config.build::<Matmul>().len(), 5);
    }

    #[test]
    fn round_trips_through_json() {
        let config = StrategyConfig {
            register_tile: Some(TilingOptions::default().with_tile_sizes([2, 2])),
            vectorize: true,
            hoist_invariant_code: false,
            ..StrategyConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<StrategyConfig>(&text).unwrap(), config);
    }
}
