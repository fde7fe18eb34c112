//! # mesh-adapt
//!
//! mesh-adapt is a parallel anisotropic adaptation engine for 2D triangular
//! meshes. A per-vertex symmetric positive-definite metric tensor defines a
//! local inner product; the engine transforms a conforming triangulation so
//! that edge lengths measured in that metric fall within a prescribed band
//! and the worst Lipnikov element quality improves.
//!
//! ## Components
//! - [`mesh::Mesh2`]: flat-storage mesh with mutable vertex-vertex and
//!   vertex-element adjacency, tombstoning and defragmentation
//! - [`adapt::Refine`], [`adapt::Coarsen`], [`adapt::Swap`]: the three
//!   topological operators, safe to run with many workers via independent
//!   sets, deferred adjacency edits and atomic slot claims
//! - [`surface::Boundary2`]: boundary topology oracle (corners,
//!   collapsibility, facet merging)
//! - [`partition`]: greedy coloring, a fast thread-block partitioner and
//!   worker pools with explicit worker identity
//! - [`geometry`]: the metric tensor type and the orientation-baked
//!   area/length/quality kernel
//!
//! ## Usage
//! ```
//! use mesh_adapt::adapt::{adapt, AdaptParams};
//! use mesh_adapt::mesh_generation::structured_square;
//!
//! // A 4x4 grid whose metric asks for edges twice as coarse.
//! let mut mesh = structured_square(4, 1.0, 0.5).unwrap();
//! let report = adapt(&mut mesh, &AdaptParams::default()).unwrap();
//! assert!(report.collapses > 0);
//! assert!(mesh.verify().is_ok());
//! ```
//!
//! Single-process only: the operators freeze halo vertices through the
//! [`mesh::halo::HaloOracle`] seam, so a distributed driver owns all
//! cross-process exchange.

pub mod adapt;
pub mod debug_invariants;
pub mod geometry;
pub mod mesh;
pub mod mesh_error;
pub mod mesh_generation;
pub mod partition;
pub mod surface;

/// A convenient prelude to import the most-used types.
pub mod prelude {
    pub use crate::adapt::{adapt, AdaptParams, AdaptReport, Coarsen, CoarsenOptions, Refine, Swap};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::geometry::{ElementGeometry, MetricTensor};
    pub use crate::mesh::halo::{HaloOracle, SerialHalo};
    pub use crate::mesh::Mesh2;
    pub use crate::mesh_error::{AdaptError, InvariantViolation};
    pub use crate::surface::Boundary2;
}
