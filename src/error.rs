//! Errors reported by [`CodegenStrategy::transform`](crate::CodegenStrategy::transform).

use derive_more::{Display, Error};
use tessera_ir::rewrite::ApplyError;

/// Kind of a strategy stage.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum StageKind {
    #[display("tile")]
    Tile,
    #[display("promote")]
    Promote,
    #[display("vectorize")]
    Vectorize,
}

/// The step of a strategy run that failed to converge.
#[derive(Clone, Copy, Debug, Display, Error, PartialEq, Eq)]
pub enum TransformError {
    #[display("{kind} stage #{index} failed: {source}")]
    Stage {
        index: usize,
        kind: StageKind,
        source: ApplyError,
    },
    #[display("canonicalization after stage #{index} failed: {source}")]
    Canonicalization { index: usize, source: ApplyError },
    #[display("vector contraction lowering failed: {source}")]
    VectorTransforms { source: ApplyError },
    #[display("vector transfer lowering failed: {source}")]
    TransferLowering { source: ApplyError },
}

impl TransformError {
    /// The underlying rewrite failure.
    pub fn apply_error(&self) -> ApplyError {
        match *self {
            TransformError::Stage { source, .. }
            | TransformError::Canonicalization { source, .. }
            | TransformError::VectorTransforms { source }
            | TransformError::TransferLowering { source } => source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_step() {
        let source = ApplyError::DidNotConverge {
            iterations: 2,
            changes: 5,
        };
        let err = TransformError::Stage {
            index: 1,
            kind: StageKind::Promote,
            source,
        };
        assert_eq!(
            err.to_string(),
            "promote stage #1 failed: rewrite did not converge after 2 iterations (5 changes)"
        );
        assert_eq!(err.apply_error(), source);
        assert!(std::error::Error::source(&err).is_some());
    }
}
