//! IR cleanup passes run between and after rewrite stages.

pub mod canonicalize;
pub mod dce;
pub mod licm;

pub use canonicalize::{CanonicalizeResult, canonicalization_patterns, canonicalize};
pub use dce::{DceConfig, DceResult, eliminate_dead_code, eliminate_dead_code_with_config};
pub use licm::{hoist_allocations, hoist_loop_invariant_code};
