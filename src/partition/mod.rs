//! Coloring and partitioning of the vertex-vertex graph.
//!
//! Two disciplines are provided: a deterministic greedy coloring whose color
//! classes give strict independent sets, and a fast best-effort partitioner
//! that blocks the mesh per worker for the coarsening phase.

pub mod color;
pub mod fast;
pub mod parallel;

pub use color::{greedy, largest_active_class};
pub use fast::{dynamic_edge_cut, partition_fast};
pub use parallel::{
    build_worker_pool, default_pool, install_with_worker_pool, worker_index,
    worker_index_or_serial,
};
