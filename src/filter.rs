//! Stage eligibility and the "already transformed" markers.
//!
//! Every operation a stage produces is recorded in a [`MarkerTable`] with
//! that stage's [`StageMarker`]. The first stage only matches unmarked
//! operations, and stage `i` only matches operations marked by stage `i - 1`,
//! so no stage ever rewrites its own output and the fixed-point application
//! terminates.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use derive_more::Display;
use tessera_ir::{IrContext, OpRef};

/// Caller-supplied eligibility predicate of a stage.
pub type FilterFunction = Arc<dyn Fn(&IrContext, OpRef) -> bool + Send + Sync>;

/// Marker of the stage that produced an operation, counted from 1.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("stage{_0}")]
pub struct StageMarker(pub u32);

/// Latest marker of every operation touched by one strategy run.
///
/// Operation refs are never reused, so entries stay valid after the IR
/// changes. Clones share the same table.
#[derive(Clone, Default)]
pub struct MarkerTable {
    markers: Rc<RefCell<HashMap<OpRef, StageMarker>>>,
}

impl MarkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, op: OpRef) -> Option<StageMarker> {
        self.markers.borrow().get(&op).copied()
    }

    pub fn set(&self, op: OpRef, marker: StageMarker) {
        self.markers.borrow_mut().insert(op, marker);
    }

    /// Number of operations currently carrying `marker`.
    pub fn count(&self, marker: StageMarker) -> usize {
        self.markers
            .borrow()
            .values()
            .filter(|&&m| m == marker)
            .count()
    }

    pub fn len(&self) -> usize {
        self.markers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.borrow().is_empty()
    }
}

impl fmt::Debug for MarkerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let markers = self.markers.borrow();
        let mut entries: Vec<_> = markers.iter().collect();
        entries.sort();
        f.debug_map().entries(entries).finish()
    }
}

/// Predicate and tag pair guarding the rewrite rules of one stage.
#[derive(Clone)]
pub struct TransformationFilter {
    predicate: Option<FilterFunction>,
    matches: Option<StageMarker>,
    replacement: StageMarker,
    markers: MarkerTable,
}

impl TransformationFilter {
    /// A filter accepting operations whose marker equals `matches` (`None`
    /// for unmarked operations) and that satisfy `predicate`, if any.
    pub fn new(
        predicate: Option<FilterFunction>,
        matches: Option<StageMarker>,
        replacement: StageMarker,
        markers: MarkerTable,
    ) -> Self {
        Self {
            predicate,
            matches,
            replacement,
            markers,
        }
    }

    /// Filter of the stage at position `index` (from 0) of a strategy.
    pub fn for_stage(index: usize, predicate: Option<FilterFunction>, markers: MarkerTable) -> Self {
        let index = index as u32;
        let matches = (index > 0).then_some(StageMarker(index));
        Self::new(predicate, matches, StageMarker(index + 1), markers)
    }

    /// Whether the stage may rewrite `op`.
    pub fn check(&self, ctx: &IrContext, op: OpRef) -> bool {
        self.markers.get(op) == self.matches
            && self.predicate.as_ref().is_none_or(|pred| pred(ctx, op))
    }

    /// Tag an operation produced by the stage.
    pub fn mark(&self, op: OpRef) {
        self.markers.set(op, self.replacement);
    }

    pub fn replacement(&self) -> StageMarker {
        self.replacement
    }

    pub fn markers(&self) -> &MarkerTable {
        &self.markers
    }
}

impl fmt::Debug for TransformationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformationFilter")
            .field("has_predicate", &self.predicate.is_some())
            .field("matches", &self.matches)
            .field("replacement", &self.replacement)
            .finish()
    }
}
