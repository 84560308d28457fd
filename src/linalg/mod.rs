//! Rewrite patterns over `linalg` operations: tiling, promotion and
//! vectorization, plus the forwarding rules that clean up after them.

mod forwarding;
mod promotion;
mod tiling;
mod vectorization;

#[cfg(test)]
pub(crate) mod testing;

pub use forwarding::{CopyTransferReadForwarding, TransferWriteCopyForwarding};
pub use promotion::LinalgPromotionPattern;
pub use tiling::LinalgTilingPattern;
pub use vectorization::LinalgVectorizationPattern;
