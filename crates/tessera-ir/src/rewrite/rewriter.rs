//! PatternRewriter: accumulates mutations from a pattern rewrite.
//!
//! Patterns may create detached operations freely; everything that touches
//! the position of the matched operation in its block is recorded here and
//! applied by the `PatternApplicator` after the pattern returns.

use crate::context::IrContext;
use crate::refs::{OpRef, ValueRef};

/// Accumulated mutations from a pattern rewrite.
#[derive(Default)]
pub(crate) struct Mutations {
    /// Operations to insert before the current op's position.
    pub(crate) prefix_ops: Vec<OpRef>,
    /// Operations to insert after the current op (or its replacement).
    pub(crate) suffix_ops: Vec<OpRef>,
    /// The replacement operation (if any).
    pub(crate) replacement: Option<OpRef>,
    /// If set, the operation is erased and its results mapped to these values.
    pub(crate) erase_values: Option<Vec<ValueRef>>,
    /// Other attached operations to erase.
    pub(crate) erased_others: Vec<OpRef>,
    pub(crate) in_place: bool,
}

/// Rewriter interface for patterns.
#[derive(Default)]
pub struct PatternRewriter {
    mutations: Mutations,
}

impl PatternRewriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // === Mutations ===

    /// Insert a detached operation before the current operation.
    ///
    /// Multiple calls accumulate operations in order.
    pub fn insert_op(&mut self, op: OpRef) {
        self.mutations.prefix_ops.push(op);
    }

    /// Insert a detached operation after the current operation, or after its
    /// replacement. Multiple calls accumulate operations in order.
    pub fn append_op(&mut self, op: OpRef) {
        self.mutations.suffix_ops.push(op);
    }

    /// Replace the current operation with a new one.
    ///
    /// The applicator will RAUW old results → new results (1:1 by index),
    /// then remove the old op from its block and insert the new one.
    pub fn replace_op(&mut self, new_op: OpRef) {
        debug_assert!(
            self.mutations.replacement.is_none() && self.mutations.erase_values.is_none(),
            "replace_op called after replace_op or erase_op"
        );
        self.mutations.replacement = Some(new_op);
    }

    /// Erase the current operation, mapping its results to the given values.
    pub fn erase_op(&mut self, replacement_values: Vec<ValueRef>) {
        debug_assert!(
            self.mutations.replacement.is_none() && self.mutations.erase_values.is_none(),
            "erase_op called after replace_op or erase_op"
        );
        self.mutations.erase_values = Some(replacement_values);
    }

    /// Erase another operation whose results are unused once this rewrite
    /// is applied.
    pub fn erase_other(&mut self, op: OpRef) {
        self.mutations.erased_others.push(op);
    }

    /// Record that the pattern changed the current operation directly
    /// (operands or attributes) without replacing it.
    pub fn modified_in_place(&mut self) {
        self.mutations.in_place = true;
    }

    // === Query ===

    /// Check if any mutation was recorded.
    pub(crate) fn has_mutations(&self) -> bool {
        let m = &self.mutations;
        !m.prefix_ops.is_empty()
            || !m.suffix_ops.is_empty()
            || m.replacement.is_some()
            || m.erase_values.is_some()
            || !m.erased_others.is_empty()
            || m.in_place
    }

    /// Consume the rewriter and return accumulated mutations.
    pub(crate) fn take_mutations(self) -> Mutations {
        self.mutations
    }
}

/// Apply mutations to the IR context.
///
/// Called by the applicator after a pattern returns `true`.
pub(crate) fn apply_mutations(ctx: &mut IrContext, original_op: OpRef, mutations: Mutations) {
    let parent_block = ctx.op(original_op).parent_block;

    // 1. Insert prefix ops before the original op
    if let Some(block) = parent_block {
        for &prefix_op in &mutations.prefix_ops {
            ctx.insert_op_before(block, original_op, prefix_op);
        }
    }

    // 2. Place the replacement right after the original so suffix ops follow it
    let mut anchor = original_op;
    if let Some(new_op) = mutations.replacement {
        if let Some(block) = parent_block {
            ctx.insert_op_after(block, original_op, new_op);
        }
        let old_results: Vec<ValueRef> = ctx.op_results(original_op).to_vec();
        let new_results: Vec<ValueRef> = ctx.op_results(new_op).to_vec();
        debug_assert_eq!(
            old_results.len(),
            new_results.len(),
            "replace_op: result count mismatch ({} vs {})",
            old_results.len(),
            new_results.len()
        );
        for (&old_v, &new_v) in old_results.iter().zip(new_results.iter()) {
            ctx.replace_all_uses(old_v, new_v);
        }
        anchor = new_op;
    }

    // 3. Insert suffix ops after the anchor, keeping their order
    if let Some(block) = parent_block {
        let mut after = anchor;
        for &suffix_op in &mutations.suffix_ops {
            ctx.insert_op_after(block, after, suffix_op);
            after = suffix_op;
        }
    }

    // 4. Remove the original op if it was replaced or erased
    if mutations.replacement.is_some() {
        ctx.erase_op(original_op);
    } else if let Some(erase_values) = mutations.erase_values {
        let old_results: Vec<ValueRef> = ctx.op_results(original_op).to_vec();
        debug_assert_eq!(
            old_results.len(),
            erase_values.len(),
            "erase_op: replacement value count mismatch ({} vs {})",
            old_results.len(),
            erase_values.len()
        );
        for (&old_v, &new_v) in old_results.iter().zip(erase_values.iter()) {
            ctx.replace_all_uses(old_v, new_v);
        }
        ctx.erase_op(original_op);
    }

    // 5. Erase other ops last, once their results may have been rerouted
    for other in mutations.erased_others {
        if ctx.op(other).parent_block.is_some() {
            ctx.erase_op(other);
        }
    }
}
