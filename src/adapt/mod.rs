//! Adaptation operators and the outer driver loop.
//!
//! The driver is deliberately thin: refine to a fixed point, coarsen, swap,
//! defragment, repeat until a full cycle makes no change. All of the value
//! is in the operators and the adjacency machinery they share.

pub mod coarsen;
pub mod refine;
pub mod swap;

pub use coarsen::{Coarsen, CoarsenOptions};
pub use refine::Refine;
pub use swap::Swap;

use crate::debug_invariants::DebugInvariants;
use crate::mesh::Mesh2;
use crate::mesh_error::AdaptError;

/// Parameters of the outer adaptation loop.
#[derive(Clone, Copy, Debug)]
pub struct AdaptParams {
    /// Collapse edges shorter than this (metric space).
    pub l_low: f64,
    /// Split edges longer than this (metric space).
    pub l_max: f64,
    /// Quality floor handed to the swap operator.
    pub q_min: f64,
    /// Upper bound on outer refine/coarsen/swap cycles.
    pub max_outer_iterations: usize,
    /// Upper bound on refinement sweeps per cycle.
    pub max_refine_sweeps: usize,
    /// Worker count; `None` uses the process-default pool.
    pub n_workers: Option<usize>,
    /// Seed for the coarsening thread partitioner.
    pub seed: u64,
    /// Collapse rejection threshold, see [`CoarsenOptions::min_area_ratio`].
    pub min_area_ratio: f64,
}

impl Default for AdaptParams {
    fn default() -> Self {
        let sqrt2 = std::f64::consts::SQRT_2;
        Self {
            l_low: 1.0 / sqrt2,
            l_max: sqrt2,
            q_min: 0.4,
            max_outer_iterations: 10,
            max_refine_sweeps: 8,
            n_workers: None,
            seed: 0x5EED_C0A3,
            min_area_ratio: 1.0e-3,
        }
    }
}

/// Outcome of one [`adapt`] run.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdaptReport {
    /// Outer cycles executed.
    pub outer_iterations: usize,
    /// Edges split by refinement.
    pub splits: usize,
    /// Vertices removed by coarsening.
    pub collapses: usize,
    /// Diagonals flipped by swapping.
    pub flips: usize,
    /// Live vertices after the final defragmentation.
    pub live_vertices: usize,
    /// Live elements after the final defragmentation.
    pub live_elements: usize,
    /// RMS deviation of edge metric lengths from 1.
    pub lrms: f64,
    /// RMS deviation of element qualities from 1.
    pub qrms: f64,
}

/// Drive the mesh to the target sizing: refine, coarsen, swap, defragment,
/// until a full cycle is a no-op or the iteration cap is reached.
///
/// Defragmentation renumbers vertices and elements between cycles, so any
/// external ids held across this call are invalidated.
pub fn adapt(mesh: &mut Mesh2, params: &AdaptParams) -> Result<AdaptReport, AdaptError> {
    let mut report = AdaptReport::default();
    let mut vertex_map = Vec::new();

    for _ in 0..params.max_outer_iterations {
        report.outer_iterations += 1;
        let mut changed = 0usize;

        for _ in 0..params.max_refine_sweeps {
            let splits = Refine::with_workers(mesh, params.n_workers).refine(params.l_max)?;
            report.splits += splits;
            changed += splits;
            if splits == 0 {
                break;
            }
        }

        let collapses = Coarsen::with_options(
            mesh,
            CoarsenOptions {
                min_area_ratio: params.min_area_ratio,
                n_workers: params.n_workers,
                seed: params.seed,
            },
        )
        .coarsen(params.l_low, params.l_max)?;
        report.collapses += collapses;
        changed += collapses;

        let flips = Swap::with_workers(mesh, params.n_workers).swap(params.q_min)?;
        report.flips += flips;
        changed += flips;

        mesh.defragment(&mut vertex_map);
        mesh.debug_assert_invariants();

        if changed == 0 {
            break;
        }
    }

    report.live_vertices = mesh.live_vertex_count();
    report.live_elements = mesh.live_element_count();
    report.lrms = mesh.get_lrms();
    report.qrms = mesh.get_qrms();
    Ok(report)
}
