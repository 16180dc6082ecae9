//! Ordering edges preventing cache thrashing
//!
//! When an operation reuses capacity reclaimed from earlier accesses, those
//! accessors must finish first. The policy decides which of these
//! dependencies are materialized as control edges.

use bundle_cache::ThrashingPreventionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DependencyPolicy {
    mode: ThrashingPreventionMode,
}

impl DependencyPolicy {
    pub fn new(mode: ThrashingPreventionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ThrashingPreventionMode {
        self.mode
    }

    /// Returns true if an edge from the accessor running on `from` to the
    /// new owner running on `to` should be added.
    ///
    /// Operations queued on the same engine already execute in order, so
    /// [`ThrashingPreventionMode::SkipSameEngine`] leaves those out.
    pub fn requires_edge<E: PartialEq>(&self, from: &E, to: &E) -> bool {
        match self.mode {
            ThrashingPreventionMode::AddAll => true,
            ThrashingPreventionMode::SkipSameEngine => from != to,
            ThrashingPreventionMode::Disabled => false,
        }
    }
}
