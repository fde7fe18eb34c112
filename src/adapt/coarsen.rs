//! Edge-collapse coarsening.
//!
//! Every vertex with an incident edge shorter than `l_low` in metric space
//! is a removal candidate; it collapses onto the neighbor at the end of its
//! shortest collapsible edge, provided no surviving element degenerates and
//! no surviving edge stretches past `l_max`. Phase 1 runs all workers over a
//! thread partition of the vertex graph, restricted to vertices whose whole
//! neighborhood lies inside the worker's block; phase 2 mops up the
//! partition-blocked remainder single-threaded.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use hashbrown::HashSet;
use rayon::prelude::*;

use crate::geometry::{ElementGeometry, MetricTensor};
use crate::mesh::slots::SharedSlice;
use crate::mesh::{Mesh2, NLOC};
use crate::mesh_error::AdaptError;
use crate::partition::fast::partition_fast;
use crate::surface::{Boundary2, VertexBoundary};

/// Vertex states in the collapse schedule.
const INACTIVE: i32 = -1;
const RETRY: i32 = -2;

/// Tunables for the coarsening operator.
#[derive(Clone, Copy, Debug)]
pub struct CoarsenOptions {
    /// Reject a collapse when a surviving element's area would drop below
    /// this fraction of its original area. The default mirrors the
    /// historical threshold; it is deliberately exposed because the value is
    /// a blunt instrument.
    pub min_area_ratio: f64,
    /// Worker count; `None` uses the process-default pool.
    pub n_workers: Option<usize>,
    /// Seed for the thread partitioner.
    pub seed: u64,
}

impl Default for CoarsenOptions {
    fn default() -> Self {
        Self {
            min_area_ratio: 1.0e-3,
            n_workers: None,
            seed: 0x5EED_C0A3,
        }
    }
}

/// The coarsening operator.
pub struct Coarsen<'m> {
    mesh: &'m mut Mesh2,
    options: CoarsenOptions,
}

impl<'m> Coarsen<'m> {
    pub fn new(mesh: &'m mut Mesh2) -> Self {
        Self {
            mesh,
            options: CoarsenOptions::default(),
        }
    }

    pub fn with_options(mesh: &'m mut Mesh2, options: CoarsenOptions) -> Self {
        Self { mesh, options }
    }

    /// Collapse short edges until no accepted candidate remains.
    ///
    /// Returns the number of vertices removed.
    pub fn coarsen(&mut self, l_low: f64, l_max: f64) -> Result<usize, AdaptError> {
        debug_assert!(l_low <= l_max);
        let mesh = &mut *self.mesh;
        let options = self.options;
        crate::partition::parallel::install_with_worker_pool(options.n_workers, move || {
            coarsen_pass(mesh, l_low, l_max, options)
        })
    }
}

fn coarsen_pass(
    mesh: &mut Mesh2,
    l_low: f64,
    l_max: f64,
    options: CoarsenOptions,
) -> Result<usize, AdaptError> {
    let n_nodes = mesh.n_nodes();
    let nthreads = rayon::current_num_threads().max(1);
    let mut surface = Boundary2::from_mesh(mesh);

    // dynamic_vertex[i] >= 0 :: collapse target for vertex i
    // dynamic_vertex[i] == -1 :: inactive (deleted or locked)
    // dynamic_vertex[i] == -2 :: recalculate the collapse
    let dynamic_vertex: Vec<AtomicI32> = (0..n_nodes)
        .map(|v| {
            AtomicI32::new(if mesh.nn_list(v).is_empty() {
                INACTIVE
            } else {
                RETRY
            })
        })
        .collect();

    let collapsed = AtomicUsize::new(0);
    {
        let Mesh2 {
            coords,
            metric,
            enlist,
            boundary,
            nnlist,
            nelist,
            node_owner,
            lnn2gnn,
            recv_halo,
            send_halo,
            rank,
            geom,
            ..
        } = &mut *mesh;
        let view = CollapseView {
            enlist: SharedSlice::new(enlist),
            boundary: SharedSlice::new(boundary),
            nnlist: SharedSlice::new(nnlist),
            nelist: SharedSlice::new(nelist),
            surface_rows: SharedSlice::new(surface.rows_mut()),
            coords,
            metric,
            geom: *geom,
            lnn2gnn,
            node_owner,
            rank: *rank,
            send_halo,
            recv_halo,
            dynamic_vertex: &dynamic_vertex,
            l_low,
            l_max,
            min_area_ratio: options.min_area_ratio,
        };

        // Initial identification sweep: read-only on the mesh, writes only
        // the per-vertex atomics.
        (0..n_nodes).into_par_iter().for_each(|i| {
            if dynamic_vertex[i].load(Ordering::Relaxed) == RETRY {
                // SAFETY: no mesh mutation happens during this sweep.
                let target = unsafe { view.identify_kernel(i) };
                dynamic_vertex[i].store(target, Ordering::Relaxed);
            }
        });

        if nthreads > 1 {
            // Phase 1: partition the vertex graph into thread blocks, each
            // worker collapsing its block-interior dynamic vertices.
            let dynamic_flags: Vec<bool> = dynamic_vertex
                .iter()
                .map(|d| d.load(Ordering::Relaxed) >= 0)
                .collect();
            let partition = partition_fast(view.nn_rows(), &dynamic_flags, nthreads, options.seed);

            let worker_lists: Vec<Vec<usize>> = (0..nthreads as i32)
                .into_par_iter()
                .map(|tid| {
                    (0..n_nodes)
                        .filter(|&i| {
                            partition[i] == tid
                                && dynamic_vertex[i].load(Ordering::Relaxed) >= 0
                                && !view.is_halo(i)
                                && view.nn_rows()[i]
                                    .iter()
                                    .all(|&n| partition[n as usize] == tid)
                        })
                        .collect()
                })
                .collect();

            let partition = &partition;
            let view_ref = &view;
            let collapsed_ref = &collapsed;
            (0..nthreads as i32).into_par_iter().for_each(|tid| {
                let recheck = Recheck::Partitioned {
                    partition,
                    worker: tid,
                };
                loop {
                    let mut cnt = 0usize;
                    for &i in &worker_lists[tid as usize] {
                        let target = dynamic_vertex[i].load(Ordering::Relaxed);
                        if target < 0 {
                            continue;
                        }
                        // SAFETY: `i` and its entire neighborhood are inside
                        // this worker's partition block, so every row touched
                        // by the kernel (adjacency, elements, boundary facets
                        // of `i`, its target and their shared elements) is
                        // written by this worker alone. Cross-partition state
                        // is only reached through the atomic schedule.
                        unsafe {
                            view_ref.collapse_kernel(i, target as usize, recheck);
                        }
                        cnt += 1;
                    }
                    if cnt == 0 {
                        break;
                    }
                    collapsed_ref.fetch_add(cnt, Ordering::Relaxed);
                }
            });
        }

        // Phase 2: single-threaded mop-up of vertices blocked by the thread
        // partition (and of anything marked for re-identification).
        loop {
            let mut progress = false;
            for i in 0..n_nodes {
                if dynamic_vertex[i].load(Ordering::Relaxed) == RETRY {
                    // SAFETY: single-threaded region.
                    let target = unsafe { view.identify_kernel(i) };
                    dynamic_vertex[i].store(target, Ordering::Relaxed);
                }
                let target = dynamic_vertex[i].load(Ordering::Relaxed);
                if target >= 0 && !view.is_halo(i) {
                    // SAFETY: single-threaded region.
                    unsafe {
                        view.collapse_kernel(i, target as usize, Recheck::Serial);
                    }
                    collapsed.fetch_add(1, Ordering::Relaxed);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
    }

    Ok(collapsed.into_inner())
}

/// How the kernel re-evaluates the neighborhood after a collapse.
#[derive(Clone, Copy)]
enum Recheck<'a> {
    /// Re-identify immediately; used by the single-threaded phase.
    Serial,
    /// Re-identify only vertices interior to the worker's block, mark the
    /// rest for the serial phase.
    Partitioned { partition: &'a [i32], worker: i32 },
}

/// Field-level shared view of the mesh used by the collapse kernels.
///
/// All unsafe row access is justified by the callers' independent-set
/// discipline; see the phase-1 SAFETY comment.
struct CollapseView<'a> {
    enlist: SharedSlice<'a, i32>,
    boundary: SharedSlice<'a, i32>,
    nnlist: SharedSlice<'a, Vec<i32>>,
    nelist: SharedSlice<'a, Vec<i32>>,
    surface_rows: SharedSlice<'a, VertexBoundary>,
    coords: &'a [f64],
    metric: &'a [MetricTensor],
    geom: ElementGeometry,
    lnn2gnn: &'a [i64],
    node_owner: &'a [i32],
    rank: i32,
    send_halo: &'a HashSet<i32>,
    recv_halo: &'a HashSet<i32>,
    dynamic_vertex: &'a [AtomicI32],
    l_low: f64,
    l_max: f64,
    min_area_ratio: f64,
}

impl<'a> CollapseView<'a> {
    fn nn_rows(&self) -> &'a [Vec<i32>] {
        // SAFETY: handing out the full slice is only done for read-only
        // phases (partitioning) while no kernel is running.
        unsafe { std::slice::from_raw_parts(self.nnlist.get(0) as *const Vec<i32>, self.nnlist.len()) }
    }

    fn is_owned(&self, v: usize) -> bool {
        self.node_owner[v] == self.rank
    }

    fn is_halo(&self, v: usize) -> bool {
        let v = v as i32;
        self.send_halo.contains(&v) || self.recv_halo.contains(&v)
    }

    fn coords_of(&self, v: usize) -> [f64; 2] {
        [self.coords[2 * v], self.coords[2 * v + 1]]
    }

    fn edge_length(&self, u: usize, v: usize) -> f64 {
        ElementGeometry::edge_length_mean(
            self.coords_of(u),
            self.coords_of(v),
            &self.metric[u],
            &self.metric[v],
        )
    }

    unsafe fn element_vertices(&self, e: usize) -> [i32; 3] {
        [
            *self.enlist.get(NLOC * e),
            *self.enlist.get(NLOC * e + 1),
            *self.enlist.get(NLOC * e + 2),
        ]
    }

    unsafe fn element_area_with(&self, n: [i32; 3]) -> f64 {
        self.geom.area(
            self.coords_of(n[0] as usize),
            self.coords_of(n[1] as usize),
            self.coords_of(n[2] as usize),
        )
    }

    /// Which vertex `rm` should collapse onto, if any.
    ///
    /// # Safety
    /// The caller guarantees no concurrent writer touches `rm`'s
    /// neighborhood (its rows, its neighbors' rows, their shared elements).
    unsafe fn identify_kernel(&self, rm: usize) -> i32 {
        // Cannot delete what is already gone.
        if self.nnlist.get(rm).is_empty() {
            return INACTIVE;
        }
        if self.surface_rows.get(rm).corner {
            return INACTIVE;
        }
        if !self.is_owned(rm) {
            return INACTIVE;
        }

        // Candidates sorted shortest-first; the global id breaks ties so the
        // schedule is reproducible.
        let mut short_edges: Vec<(f64, i32)> = Vec::new();
        for &nn in self.nnlist.get(rm) {
            // Never coarsen across an external partition boundary.
            if self.recv_halo.contains(&nn) {
                continue;
            }
            if !Boundary2::is_collapsible_in(&self.surface_rows, rm, nn as usize) {
                continue;
            }
            let length = self.edge_length(rm, nn as usize);
            if length < self.l_low {
                short_edges.push((length, nn));
            }
        }
        short_edges.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.lnn2gnn[a.1 as usize].cmp(&self.lnn2gnn[b.1 as usize]))
        });

        let mut reject_collapse = false;
        let mut target_vertex = INACTIVE;
        for (_, candidate) in short_edges {
            target_vertex = candidate;
            reject_collapse = false;
            let target = candidate as usize;

            // Elements swallowed by this collapse.
            let deleted =
                crate::mesh::sorted_intersection(self.nelist.get(rm), self.nelist.get(target));

            // Every surviving element must keep a healthy area.
            for &e in self.nelist.get(rm).iter() {
                if deleted.contains(&e) {
                    continue;
                }
                let e = e as usize;
                let orig_n = self.element_vertices(e);
                let mut n = orig_n;
                for slot in &mut n {
                    if *slot == rm as i32 {
                        *slot = candidate;
                    }
                }
                let orig_area = self.element_area_with(orig_n);
                let area = self.element_area_with(n);
                if area / orig_area <= self.min_area_ratio {
                    reject_collapse = true;
                    break;
                }
            }

            // No surviving edge may stretch past the upper bound.
            if !reject_collapse {
                for &nn in self.nnlist.get(rm) {
                    if nn == candidate {
                        continue;
                    }
                    if self.edge_length(target, nn as usize) > self.l_max {
                        reject_collapse = true;
                        break;
                    }
                }
            }

            if !reject_collapse {
                return candidate;
            }
        }

        if reject_collapse {
            RETRY
        } else {
            target_vertex
        }
    }

    /// Collapse `rm` onto `target`.
    ///
    /// # Safety
    /// As for [`CollapseView::identify_kernel`], plus exclusive write access
    /// to the same neighborhood.
    unsafe fn collapse_kernel(&self, rm: usize, target: usize, recheck: Recheck<'_>) {
        let deleted =
            crate::mesh::sorted_intersection(self.nelist.get(rm), self.nelist.get(target));

        // Surviving edges of deleted elements inherit the boundary tags of
        // the edges that vanish with them.
        for &e in &deleted {
            self.propagate_boundary_on_delete(e as usize, rm, target);
        }

        // Merge boundary facets if the collapse slides along the surface.
        if !self.surface_rows.get(rm).facets.is_empty()
            && !self.surface_rows.get(target).facets.is_empty()
        {
            Boundary2::collapse_in(&self.surface_rows, rm, target);
        }

        // Remove the swallowed elements.
        for &e in &deleted {
            let e = e as usize;
            let n = self.element_vertices(e);
            for &v in &n {
                crate::mesh::remove_sorted(self.nelist.get_mut(v as usize), e as i32);
            }
            *self.enlist.get_mut(NLOC * e) = -1;
        }

        // Re-point the remaining elements of `rm` at `target`.
        let rm_elements: Vec<i32> = self.nelist.get(rm).clone();
        for &e in &rm_elements {
            let e = e as usize;
            for i in 0..NLOC {
                if *self.enlist.get(NLOC * e + i) == rm as i32 {
                    *self.enlist.get_mut(NLOC * e + i) = target as i32;
                    break;
                }
            }
            crate::mesh::insert_sorted(self.nelist.get_mut(target), e as i32);
        }

        // Rewire the neighborhood. The patch starts as `target`'s own ring
        // (pre-collapse): a neighbor of `rm` already in it keeps its existing
        // `target` adjacency and just drops `rm`; the rest re-point their
        // `rm` entry at `target`.
        let mut new_patch: Vec<i32> = self.nnlist.get(target).clone();
        let rm_neighbors: Vec<i32> = self.nnlist.get(rm).clone();
        for &nn in &rm_neighbors {
            if nn == target as i32 {
                continue;
            }
            let row = self.nnlist.get_mut(nn as usize);
            if crate::mesh::contains_sorted(&new_patch, nn) {
                crate::mesh::remove_sorted(row, rm as i32);
            } else {
                crate::mesh::remove_sorted(row, rm as i32);
                crate::mesh::insert_sorted(row, target as i32);
                crate::mesh::insert_sorted(&mut new_patch, nn);
            }
        }
        crate::mesh::remove_sorted(&mut new_patch, rm as i32);
        *self.nnlist.get_mut(target) = new_patch;

        // Retire `rm`.
        self.nnlist.get_mut(rm).clear();
        self.nelist.get_mut(rm).clear();
        self.dynamic_vertex[rm].store(INACTIVE, Ordering::Relaxed);

        // Re-evaluate the local collapses.
        self.recheck_vertex(target, recheck);
        let target_neighbors: Vec<i32> = self.nnlist.get(target).clone();
        for &nn in &target_neighbors {
            self.recheck_vertex(nn as usize, recheck);
        }
    }

    /// Refresh the schedule entry of `v` after a nearby collapse.
    ///
    /// # Safety
    /// As for [`CollapseView::identify_kernel`] when `v` is re-identified;
    /// marking is always safe.
    unsafe fn recheck_vertex(&self, v: usize, recheck: Recheck<'_>) {
        if !self.is_owned(v) {
            return;
        }
        match recheck {
            Recheck::Serial => {
                let t = self.identify_kernel(v);
                self.dynamic_vertex[v].store(t, Ordering::Relaxed);
            }
            Recheck::Partitioned { partition, worker } => {
                let interior = partition[v] == worker
                    && self
                        .nnlist
                        .get(v)
                        .iter()
                        .all(|&n| partition[n as usize] == worker);
                if interior {
                    let t = self.identify_kernel(v);
                    self.dynamic_vertex[v].store(t, Ordering::Relaxed);
                } else {
                    // Outside this worker's block: leave it for phase 2.
                    self.dynamic_vertex[v].store(RETRY, Ordering::Relaxed);
                }
            }
        }
    }

    /// When deleting element `e = (rm, target, w)`, the two edges through
    /// `w` merge; if one of them was a tagged boundary edge, the survivor's
    /// element inherits the tag.
    unsafe fn propagate_boundary_on_delete(&self, e: usize, rm: usize, target: usize) {
        let n = self.element_vertices(e);
        let tags = [
            *self.boundary.get(NLOC * e),
            *self.boundary.get(NLOC * e + 1),
            *self.boundary.get(NLOC * e + 2),
        ];
        let Some(w_slot) = (0..NLOC).find(|&i| n[i] != rm as i32 && n[i] != target as i32) else {
            return;
        };
        let w = n[w_slot] as usize;
        let rm_slot = (0..NLOC).find(|&i| n[i] == rm as i32).unwrap();
        let target_slot = (0..NLOC).find(|&i| n[i] == target as i32).unwrap();
        // Tag of edge (target, w) is opposite rm; tag of (rm, w) is opposite
        // target.
        let tag_target_w = tags[rm_slot];
        let tag_rm_w = tags[target_slot];

        let other_of = |a: usize, b: usize| -> Option<usize> {
            // SAFETY: both rows are inside the collapse neighborhood covered
            // by the caller's exclusivity guarantee.
            let shared =
                unsafe { crate::mesh::sorted_intersection(self.nelist.get(a), self.nelist.get(b)) };
            shared.into_iter().map(|x| x as usize).find(|&x| x != e)
        };

        if tag_rm_w > 0 {
            // (rm, w) was boundary; the merged edge (target, w) must carry
            // its tag on the element that survives across it.
            if let Some(g) = other_of(target, w) {
                self.set_tag_for_edge(g, target, w, tag_rm_w);
            }
        }
        if tag_target_w > 0 {
            // (target, w) was boundary on the deleted element itself; its
            // neighbor across (rm, w) survives and takes the tag once `rm`
            // is re-pointed at `target`.
            if let Some(f) = other_of(rm, w) {
                self.set_tag_for_edge(f, rm, w, tag_target_w);
            }
        }
    }

    unsafe fn set_tag_for_edge(&self, e: usize, a: usize, b: usize, tag: i32) {
        let n = self.element_vertices(e);
        for i in 0..NLOC {
            if n[i] != a as i32 && n[i] != b as i32 {
                *self.boundary.get_mut(NLOC * e + i) = tag;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::refine::Refine;
    use crate::debug_invariants::DebugInvariants;
    use crate::mesh_generation::structured_square;

    #[test]
    fn uniform_coarse_metric_removes_vertices() {
        // Metric wants edges of length 1.0; the 8x8 grid supplies 0.125.
        let mut mesh = structured_square(8, 1.0, 1.0).unwrap();
        let before = mesh.live_vertex_count();
        let removed = Coarsen::new(&mut mesh).coarsen(0.4, 1.6).unwrap();
        assert!(removed > 0);
        assert_eq!(mesh.live_vertex_count(), before - removed);
        mesh.debug_assert_invariants();
    }

    #[test]
    fn corners_are_never_collapsed() {
        let mut mesh = structured_square(4, 1.0, 1.0).unwrap();
        let corner_ids = [0usize, 4, 20, 24];
        Coarsen::new(&mut mesh).coarsen(0.9, 2.5).unwrap();
        for &c in &corner_ids {
            assert!(mesh.vertex_live(c), "corner {c} was deleted");
        }
        mesh.debug_assert_invariants();
    }

    #[test]
    fn well_sized_mesh_is_left_alone() {
        let mut mesh = structured_square(4, 1.0, 0.25).unwrap();
        let removed = Coarsen::new(&mut mesh).coarsen(0.5, 2.0).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(mesh.live_vertex_count(), 25);
    }

    #[test]
    fn short_edge_count_is_non_increasing() {
        let mut mesh = structured_square(6, 1.0, 0.6).unwrap();
        let l_low = 0.5;
        let count = |mesh: &crate::mesh::Mesh2| {
            let mut n = 0;
            for u in 0..mesh.n_nodes() {
                for &v in mesh.nn_list(u) {
                    if (u as i32) < v && mesh.calc_edge_length(u, v as usize) < l_low {
                        n += 1;
                    }
                }
            }
            n
        };
        let before = count(&mesh);
        Coarsen::new(&mut mesh).coarsen(l_low, 2.0).unwrap();
        let after = count(&mesh);
        assert!(after <= before);
        mesh.debug_assert_invariants();
    }

    #[test]
    fn round_trip_with_refine_preserves_invariants() {
        let mut mesh = structured_square(4, 1.0, 0.15).unwrap();
        while Refine::new(&mut mesh).refine(2f64.sqrt()).unwrap() > 0 {}
        mesh.debug_assert_invariants();
        Coarsen::new(&mut mesh).coarsen(0.5 * 2f64.sqrt(), 2f64.sqrt()).unwrap();
        mesh.debug_assert_invariants();
        let mut map = Vec::new();
        mesh.defragment(&mut map);
        mesh.debug_assert_invariants();
    }
}
