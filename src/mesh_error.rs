//! AdaptError: unified error type for the mesh-adapt public APIs.
//!
//! Candidate rejections inside the operators (a collapse that would invert
//! an element, a swap whose neighborhood went stale) are ordinary control
//! flow and never surface here; this type covers input errors and broken
//! invariants only.

use thiserror::Error;

/// Unified error type for mesh-adapt operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdaptError {
    /// The geometry kernel saw a non-positive signed area.
    #[error("element {element} has non-positive area in the current orientation")]
    NonPositiveArea {
        /// Element id, or `usize::MAX` for a proposed (not yet stored) element.
        element: usize,
    },
    /// Metric interpolation produced a NaN component (bad input field).
    #[error("metric interpolation produced NaN at vertex {vertex}")]
    MetricNan {
        /// Vertex whose metric is unusable.
        vertex: usize,
    },
    /// A vertex metric is not symmetric positive-definite.
    #[error("metric at vertex {vertex} is not positive-definite")]
    MetricNotSpd {
        /// Vertex whose metric is degenerate.
        vertex: usize,
    },
    /// The imported mesh was malformed (mismatched array lengths, bad ids).
    #[error("invalid mesh import: {0}")]
    InvalidImport(String),
    /// `verify()` found broken mesh invariants. Always a programmer error.
    #[error("mesh invariants violated ({} failures, first: {})", .0.len(), first_violation(.0))]
    Invariant(Vec<InvariantViolation>),
}

fn first_violation(v: &[InvariantViolation]) -> String {
    v.first()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// A single failure of the mesh invariants I1-I4.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A live element references a dead or out-of-range vertex.
    #[error("element {element} references dead vertex {vertex}")]
    DeadVertexInElement { element: usize, vertex: usize },
    /// A live element repeats a vertex.
    #[error("element {element} has duplicate vertex {vertex}")]
    DuplicateVertexInElement { element: usize, vertex: usize },
    /// A live element has non-positive signed area.
    #[error("element {element} has non-positive area")]
    InvertedElement { element: usize },
    /// An edge is shared by an unexpected number of elements.
    #[error("edge ({u},{v}) is shared by {count} elements")]
    BadEdgeElementCount { u: usize, v: usize, count: usize },
    /// `u` lists `v` as a neighbor but not vice versa.
    #[error("adjacency asymmetry: {u} lists {v} but {v} does not list {u}")]
    AsymmetricAdjacency { u: usize, v: usize },
    /// A vertex's element list contains an element that does not use it.
    #[error("vertex {vertex} lists element {element} which does not reference it")]
    StaleIncidence { vertex: usize, element: usize },
    /// An element does not appear in the element list of one of its vertices.
    #[error("element {element} missing from the element list of vertex {vertex}")]
    MissingIncidence { vertex: usize, element: usize },
    /// A tagged boundary edge is shared by more than one element.
    #[error("boundary edge ({u},{v}) is shared by {count} elements")]
    SharedBoundaryEdge { u: usize, v: usize, count: usize },
    /// A live vertex carries a non-finite or non-SPD metric.
    #[error("vertex {vertex} has a degenerate metric")]
    DegenerateMetric { vertex: usize },
}
