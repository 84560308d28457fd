//! Programmable code generation strategy for structured linear algebra.
//!
//! A [`CodegenStrategy`] is an ordered list of stages, each wrapping the
//! rewrite rules for one operation kind:
//!
//! - [`Tile`] splits the operation into a loop nest over tiles,
//! - [`Promote`] copies tiles into local buffers,
//! - [`Vectorize`] rewrites the operation into vector register operations.
//!
//! [`CodegenStrategy::transform`] applies the stages in order, each to a
//! fixed point followed by canonicalization, and then lowers vector
//! contractions and transfers and hoists loop-invariant code.
//!
//! ```
//! use tessera::{CodegenStrategy, PromotionOptions, TilingOptions};
//! use tessera_ir::dialect::linalg::Matmul;
//!
//! let mut strategy = CodegenStrategy::new();
//! strategy
//!     .tile::<Matmul>(TilingOptions::default().with_tile_sizes([4, 4, 4]))
//!     .promote::<Matmul>(PromotionOptions::default())
//!     .vectorize::<Matmul>();
//! assert_eq!(strategy.len(), 3);
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod linalg;
pub mod options;
pub mod strategy;
pub mod vector;

pub use config::StrategyConfig;
pub use error::{StageKind, TransformError};
pub use filter::{FilterFunction, MarkerTable, StageMarker, TransformationFilter};
pub use options::{
    LoopType, PromotionOptions, TilingOptions, VectorContractLowering,
    VectorTransferToLoopsOptions, VectorTransformsOptions, VectorizationOptions,
};
pub use strategy::{CodegenStrategy, OpTarget, Promote, Stage, StageReport, Tile, TransformReport, Vectorize};
