//! Invariant checking hooks.
//!
//! A full mesh audit walks every adjacency row and element, so it is far too
//! expensive for release hot paths; operators instead call
//! [`DebugInvariants::debug_assert_invariants`] after each pass, which runs
//! the audit in debug builds (or release builds with the `strict-invariants`
//! feature) and vanishes otherwise. Broken adjacency is then caught at the
//! mutation site rather than surfacing as a crash several operators later.

use crate::mesh_error::AdaptError;

/// Validation hooks for structures with global consistency invariants.
pub trait DebugInvariants {
    /// Validate invariants, returning the aggregated failure on error.
    fn validate_invariants(&self) -> Result<(), AdaptError>;

    /// Panic on broken invariants in debug builds and `strict-invariants`
    /// release builds; a no-op otherwise.
    fn debug_assert_invariants(&self) {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = self.validate_invariants() {
            panic!("invariants violated: {e}");
        }
    }
}
