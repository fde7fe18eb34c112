//! Process-local halo predicates.
//!
//! The core runs in a single address space; a distributed driver that
//! partitions the mesh across processes feeds ownership and halo membership
//! through this seam so the operators freeze the right vertices.
//!
//! Single-process drivers can hand [`SerialHalo`] to anything expecting an
//! oracle; a freshly imported mesh answers identically on every vertex:
//!
//! ```
//! use mesh_adapt::mesh::halo::{HaloOracle, SerialHalo};
//! use mesh_adapt::mesh_generation::structured_square;
//!
//! let mesh = structured_square(2, 1.0, 0.5).unwrap();
//! let serial = SerialHalo;
//! for v in 0..mesh.n_nodes() {
//!     assert_eq!(mesh.is_owned(v), serial.is_owned(v));
//!     assert_eq!(mesh.is_halo(v), serial.is_halo(v));
//!     assert_eq!(mesh.recv_halo_contains(v), serial.recv_halo_contains(v));
//! }
//! ```

/// Ownership and halo membership queries consumed by the operators.
pub trait HaloOracle {
    /// True when this process owns vertex `v`.
    fn is_owned(&self, v: usize) -> bool;
    /// True when `v` is shared with another process (send or receive side).
    fn is_halo(&self, v: usize) -> bool;
    /// True when `v` is received from a peer (never coarsened across).
    fn recv_halo_contains(&self, v: usize) -> bool;
}

/// Single-process oracle: everything is owned, nothing is halo.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialHalo;

impl HaloOracle for SerialHalo {
    fn is_owned(&self, _v: usize) -> bool {
        true
    }
    fn is_halo(&self, _v: usize) -> bool {
        false
    }
    fn recv_halo_contains(&self, _v: usize) -> bool {
        false
    }
}
