//! Rewrite pattern trait and ordered pattern sets.

use super::rewriter::PatternRewriter;
use crate::context::IrContext;
use crate::ops::OpName;
use crate::refs::OpRef;

/// A pattern that can match and transform operations.
///
/// # Return Value
///
/// Return `true` if the pattern matched and recorded mutations via the
/// rewriter. Return `false` if the pattern does not apply; a pattern that
/// returns `false` must leave the IR untouched.
pub trait RewritePattern {
    /// Attempt to match and rewrite an operation.
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool;

    /// Human-readable name for debugging.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Priority among patterns that could apply to the same operation.
    /// Higher benefits are tried first.
    fn benefit(&self) -> u16 {
        1
    }

    /// The only operation kind this pattern can match, if it is restricted
    /// to one. The applicator skips the pattern for every other operation.
    fn root(&self) -> Option<OpName> {
        None
    }
}

/// Patterns ordered by descending benefit; ties keep insertion order.
#[derive(Default)]
pub struct RewritePatternSet {
    patterns: Vec<Box<dyn RewritePattern>>,
}

impl RewritePatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: impl RewritePattern + 'static) -> &mut Self {
        self.add_boxed(Box::new(pattern))
    }

    pub fn add_boxed(&mut self, pattern: Box<dyn RewritePattern>) -> &mut Self {
        let benefit = pattern.benefit();
        let pos = self
            .patterns
            .iter()
            .position(|p| p.benefit() < benefit)
            .unwrap_or(self.patterns.len());
        self.patterns.insert(pos, pattern);
        self
    }

    pub fn extend(&mut self, other: RewritePatternSet) -> &mut Self {
        for pattern in other.patterns {
            self.add_boxed(pattern);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn RewritePattern> {
        self.patterns.iter().map(|p| p.as_ref())
    }

    /// `(name, benefit)` of every pattern in application order.
    pub fn summary(&self) -> Vec<(&'static str, u16)> {
        self.iter().map(|p| (p.name(), p.benefit())).collect()
    }
}

impl std::fmt::Debug for RewritePatternSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.summary()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, u16);

    impl RewritePattern for Named {
        fn match_and_rewrite(&self, _: &mut IrContext, _: OpRef, _: &mut PatternRewriter) -> bool {
            false
        }

        fn name(&self) -> &'static str {
            self.0
        }

        fn benefit(&self) -> u16 {
            self.1
        }
    }

    #[test]
    fn set_orders_by_benefit_then_insertion() {
        let mut set = RewritePatternSet::new();
        set.add(Named("a", 1)).add(Named("b", 2)).add(Named("c", 1)).add(Named("d", 2));
        assert_eq!(
            set.summary(),
            vec![("b", 2), ("d", 2), ("a", 1), ("c", 1)]
        );
        assert_eq!(set.len(), 4);
    }
}
