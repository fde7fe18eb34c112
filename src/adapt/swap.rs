//! Diagonal edge swapping.
//!
//! For each interior edge shared by two triangles, the flip replacing the
//! diagonal is accepted when it strictly raises the worse of the two
//! Lipnikov qualities. Concurrency uses a marked-edge bitmap and
//! over-allocated adjacency rows: all shared state is written through
//! atomic slot claims, so a worker that loses a race simply observes a
//! stale neighborhood and defers the edge to the next pass.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::mesh::slots::{as_atomic_i32, as_atomic_u8};
use crate::mesh::{Mesh2, NLOC};
use crate::mesh_error::AdaptError;

/// The edge-swapping operator.
pub struct Swap<'m> {
    mesh: &'m mut Mesh2,
    n_workers: Option<usize>,
}

impl<'m> Swap<'m> {
    pub fn new(mesh: &'m mut Mesh2) -> Self {
        Self {
            mesh,
            n_workers: None,
        }
    }

    /// Use an explicit worker count instead of the default pool size.
    pub fn with_workers(mesh: &'m mut Mesh2, n_workers: Option<usize>) -> Self {
        Self { mesh, n_workers }
    }

    /// Flip diagonals until no marked edge remains.
    ///
    /// Every edge is considered regardless of `q_min`; the floor is kept for
    /// drivers that pre-filter seeds, while acceptance is always the strict
    /// `Q_new > Q_old` test, so progress is monotone either way. Returns the
    /// number of accepted flips.
    pub fn swap(&mut self, q_min: f64) -> Result<usize, AdaptError> {
        let _ = q_min;
        let mesh = &mut *self.mesh;
        let n_workers = self.n_workers;
        crate::partition::parallel::install_with_worker_pool(n_workers, move || swap_pass(mesh))
    }
}

fn load_f64(a: &AtomicU64) -> f64 {
    f64::from_bits(a.load(Ordering::Relaxed))
}

fn store_f64(a: &AtomicU64, v: f64) {
    a.store(v.to_bits(), Ordering::Relaxed);
}

fn swap_pass(mesh: &mut Mesh2) -> Result<usize, AdaptError> {
    let n_nodes = mesh.n_nodes();
    let n_elements = mesh.n_elements();

    // Cache the element qualities.
    let quality: Vec<AtomicU64> = {
        let mesh: &Mesh2 = mesh;
        (0..n_elements)
            .into_par_iter()
            .map(|e| {
                let q = if mesh.element_live(e) {
                    mesh.element_quality(e).unwrap_or(0.0)
                } else {
                    0.0
                };
                AtomicU64::new(q.to_bits())
            })
            .collect()
    };

    // Over-allocate the adjacency working state: NNList rows grow to 3x
    // their degree and the NEList working copy to 2x, so slot claims during
    // a pass never reallocate.
    let mut orig_degree = vec![0usize; n_nodes];
    let mut marked: Vec<Vec<u8>> = vec![Vec::new(); n_nodes];
    let mut ne_work: Vec<Vec<i32>> = vec![Vec::new(); n_nodes];
    let mut n_marked = 0usize;
    for i in 0..n_nodes {
        let size = mesh.nnlist[i].len();
        if size == 0 {
            continue;
        }
        orig_degree[i] = size;
        marked[i] = vec![0u8; size];
        for (it, &opp) in mesh.nnlist[i].iter().enumerate() {
            if (i as i32) < opp {
                marked[i][it] = 1;
                n_marked += 1;
            }
        }
        mesh.nnlist[i].resize(3 * size, -1);
        ne_work[i] = mesh.nelist[i].clone();
        ne_work[i].resize(2 * mesh.nelist[i].len(), -1);
    }
    if n_marked == 0 {
        for (i, row) in mesh.nnlist.iter_mut().enumerate() {
            row.truncate(orig_degree[i]);
        }
        return Ok(0);
    }

    let swapped_total = AtomicUsize::new(0);
    while n_marked > 0 {
        {
            let state = SwapState {
                nn: mesh.nnlist.iter_mut().map(|r| as_atomic_i32(r)).collect(),
                ne: ne_work.iter_mut().map(|r| as_atomic_i32(r)).collect(),
                marked: marked.iter_mut().map(|r| as_atomic_u8(r)).collect(),
                enlist: as_atomic_i32(&mut mesh.enlist),
                boundary: as_atomic_i32(&mut mesh.boundary),
                orig_degree: &orig_degree,
                quality: &quality,
                coords: &mesh.coords,
                metric: &mesh.metric,
                geom: mesh.geom,
                send_halo: &mesh.send_halo,
                recv_halo: &mesh.recv_halo,
                swapped: &swapped_total,
            };
            (0..n_nodes)
                .into_par_iter()
                .for_each(|i| state.process_vertex(i));
        }

        n_marked = marked
            .par_iter()
            .map(|row| row.iter().filter(|&&m| m == 1).count())
            .sum();

        // Compact the rows; keep the slack only while work remains.
        let nn_extend = if n_marked > 0 { 3 } else { 1 };
        let ne_extend = if n_marked > 0 { 2 } else { 1 };
        mesh.nnlist
            .par_iter_mut()
            .zip(marked.par_iter_mut())
            .zip(orig_degree.par_iter_mut())
            .for_each(|((row, marks), degree)| {
                if row.is_empty() {
                    return;
                }
                let mut packed = Vec::with_capacity(row.len());
                let mut packed_marks = Vec::with_capacity(marks.len());
                for (idx, &entry) in row.iter().enumerate() {
                    if entry >= 0 {
                        packed.push(entry);
                        packed_marks.push(if idx < *degree { marks[idx] } else { 0 });
                    }
                }
                *degree = packed.len();
                packed.resize(nn_extend * packed.len().max(1), -1);
                packed.truncate(nn_extend * *degree);
                *row = packed;
                *marks = packed_marks;
            });
        ne_work.par_iter_mut().for_each(|row| {
            row.retain(|&e| e >= 0);
            let len = row.len();
            row.resize(ne_extend * len, -1);
        });
    }

    // Publish the compacted adjacency back to the mesh in sorted order.
    mesh.nnlist.par_iter_mut().for_each(|row| row.sort_unstable());
    mesh.nelist
        .par_iter_mut()
        .zip(ne_work.par_iter_mut())
        .for_each(|(dst, src)| {
            src.sort_unstable();
            std::mem::swap(dst, src);
        });

    Ok(swapped_total.into_inner())
}

/// Atomic views over the swap working state for one pass.
struct SwapState<'a> {
    nn: Vec<&'a [AtomicI32]>,
    ne: Vec<&'a [AtomicI32]>,
    marked: Vec<&'a [AtomicU8]>,
    enlist: &'a [AtomicI32],
    boundary: &'a [AtomicI32],
    orig_degree: &'a [usize],
    quality: &'a [AtomicU64],
    coords: &'a [f64],
    metric: &'a [crate::geometry::MetricTensor],
    geom: crate::geometry::ElementGeometry,
    send_halo: &'a hashbrown::HashSet<i32>,
    recv_halo: &'a hashbrown::HashSet<i32>,
    swapped: &'a AtomicUsize,
}

const NOT_FOUND: usize = usize::MAX;

impl SwapState<'_> {
    fn is_halo(&self, v: usize) -> bool {
        let v = v as i32;
        self.send_halo.contains(&v) || self.recv_halo.contains(&v)
    }

    fn nn_load(&self, v: usize, idx: usize) -> i32 {
        self.nn[v][idx].load(Ordering::Relaxed)
    }

    fn element(&self, e: usize) -> [i32; 3] {
        [
            self.enlist[NLOC * e].load(Ordering::Relaxed),
            self.enlist[NLOC * e + 1].load(Ordering::Relaxed),
            self.enlist[NLOC * e + 2].load(Ordering::Relaxed),
        ]
    }

    fn boundary_tags(&self, e: usize) -> [i32; 3] {
        [
            self.boundary[NLOC * e].load(Ordering::Relaxed),
            self.boundary[NLOC * e + 1].load(Ordering::Relaxed),
            self.boundary[NLOC * e + 2].load(Ordering::Relaxed),
        ]
    }

    fn lipnikov(&self, n: [i32; 3]) -> Result<f64, AdaptError> {
        let (a, b, c) = (n[0] as usize, n[1] as usize, n[2] as usize);
        self.geom.lipnikov(
            [self.coords[2 * a], self.coords[2 * a + 1]],
            [self.coords[2 * b], self.coords[2 * b + 1]],
            [self.coords[2 * c], self.coords[2 * c + 1]],
            &self.metric[a],
            &self.metric[b],
            &self.metric[c],
        )
    }

    /// Index of `target` within the original-degree prefix of `source`'s
    /// row, or `NOT_FOUND`.
    fn original_neighbor_index(&self, source: usize, target: i32) -> usize {
        for pos in 0..self.orig_degree[source] {
            if self.nn_load(source, pos) == target {
                return pos;
            }
        }
        NOT_FOUND
    }

    /// Claim a `-1` extension slot of `vertex`'s row, anchored at the slot
    /// mirroring `idx`; the second extension block is the fallback.
    fn claim_nn_slot(&self, vertex: usize, idx: usize, value: i32) {
        let degree = self.orig_degree[vertex];
        let row = self.nn[vertex];
        for pos in [degree + idx, 2 * degree + idx] {
            if row[pos]
                .compare_exchange(-1, value, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
        debug_assert!(false, "no free adjacency slot at vertex {vertex}");
    }

    /// Move `old` out of `vertex`'s element list and put `new` into the
    /// mirrored extension slot.
    fn ne_replace_mirrored(&self, vertex: usize, old: i32, new: i32) {
        let row = self.ne[vertex];
        let half = row.len() / 2;
        for pos in 0..half {
            if row[pos].load(Ordering::Relaxed) == old {
                let claimed = row[pos + half]
                    .compare_exchange(-1, new, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok();
                debug_assert!(claimed, "mirrored element slot taken at vertex {vertex}");
                return;
            }
        }
        debug_assert!(false, "element {old} missing from vertex {vertex}");
    }

    /// Drop `old` from `vertex`'s element list.
    fn ne_remove(&self, vertex: usize, old: i32) {
        let row = self.ne[vertex];
        let half = row.len() / 2;
        for pos in 0..half {
            if row[pos]
                .compare_exchange(old, -1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
        debug_assert!(false, "element {old} missing from vertex {vertex}");
    }

    /// Elements shared by `i` and `opposite` in the working copies.
    fn shared_elements(&self, i: usize, opposite: usize) -> Vec<i32> {
        let mut out = Vec::with_capacity(2);
        let row_i = self.ne[i];
        let row_o = self.ne[opposite];
        let half_i = row_i.len() / 2;
        let half_o = row_o.len() / 2;
        for k in 0..half_i {
            let e = row_i[k].load(Ordering::Relaxed);
            if e < 0 {
                continue;
            }
            for l in 0..half_o {
                if row_o[l].load(Ordering::Relaxed) == e {
                    out.push(e);
                    break;
                }
            }
        }
        out
    }

    fn process_vertex(&self, i: usize) {
        if self.is_halo(i) {
            for m in self.marked[i] {
                m.store(0, Ordering::Relaxed);
            }
            return;
        }

        for it in 0..self.orig_degree[i] {
            if self.marked[i][it].load(Ordering::Relaxed) != 1 {
                continue;
            }
            self.process_edge(i, it);
        }
    }

    fn process_edge(&self, i: usize, it: usize) {
        let opposite = self.nn_load(i, it);
        if opposite < 0 {
            self.marked[i][it].store(0, Ordering::Relaxed);
            return;
        }
        let opposite_u = opposite as usize;
        if self.is_halo(opposite_u) {
            self.marked[i][it].store(0, Ordering::Relaxed);
            return;
        }

        let neigh_elements = self.shared_elements(i, opposite_u);
        if neigh_elements.len() != 2 {
            self.marked[i][it].store(0, Ordering::Relaxed);
            return;
        }
        let eid0 = neigh_elements[0] as usize;
        let eid1 = neigh_elements[1] as usize;

        let n = self.element(eid0);
        let m = self.element(eid1);
        let n_off = (0..3).find(|&k| n[k] != i as i32 && n[k] != opposite);
        let m_off = (0..3).find(|&k| m[k] != i as i32 && m[k] != opposite);

        // A failed orientation match means this thread had a stale view of
        // the adjacency: another worker swapped a lateral edge under us, so
        // the edge is left marked and retried next pass.
        let (Some(n_off), Some(m_off)) = (n_off, m_off) else {
            return;
        };
        if n[0] < 0
            || m[0] < 0
            || n[(n_off + 2) % 3] != m[(m_off + 1) % 3]
            || n[(n_off + 1) % 3] != m[(m_off + 2) % 3]
        {
            return;
        }

        let lateral_n = n[n_off];
        let lateral_m = m[m_off];

        // i's index in the laterals' rows, and vice versa.
        let mut idx_in_n = NOT_FOUND;
        let mut idx_in_m = NOT_FOUND;
        let mut idx_of_n = NOT_FOUND;
        let mut idx_of_m = NOT_FOUND;
        // Marked-slot coordinates of the (opposite, lateral) edges.
        let mut opp_n = (NOT_FOUND, NOT_FOUND);
        let mut opp_m = (NOT_FOUND, NOT_FOUND);

        // Are the lateral edges marked for processing? The `i > lateral`
        // asymmetry gives a total order, so two workers can never defer to
        // each other forever. These probes also verify that the four
        // participating vertices are still original neighbors.
        if (i as i32) > lateral_n {
            idx_in_n = self.original_neighbor_index(lateral_n as usize, i as i32);
            if idx_in_n == NOT_FOUND {
                return;
            }
            if self.marked[lateral_n as usize][idx_in_n].load(Ordering::Relaxed) == 1 {
                return;
            }
            let (min_v, max_v) = ordered(opposite, lateral_n);
            let idx = self.original_neighbor_index(min_v as usize, max_v);
            if idx == NOT_FOUND {
                return;
            }
            if self.marked[min_v as usize][idx].load(Ordering::Relaxed) == 1 {
                return;
            }
            opp_n = (min_v as usize, idx);
        }

        if (i as i32) > lateral_m {
            idx_in_m = self.original_neighbor_index(lateral_m as usize, i as i32);
            if idx_in_m == NOT_FOUND {
                return;
            }
            if self.marked[lateral_m as usize][idx_in_m].load(Ordering::Relaxed) == 1 {
                return;
            }
            let (min_v, max_v) = ordered(opposite, lateral_m);
            let idx = self.original_neighbor_index(min_v as usize, max_v);
            if idx == NOT_FOUND {
                return;
            }
            if self.marked[min_v as usize][idx].load(Ordering::Relaxed) == 1 {
                return;
            }
            opp_m = (min_v as usize, idx);
        }

        // Finish verifying that the laterals are original neighbors.
        if idx_in_n == NOT_FOUND {
            idx_of_n = self.original_neighbor_index(i, lateral_n);
            if idx_of_n == NOT_FOUND {
                return;
            }
        }
        if idx_in_m == NOT_FOUND {
            idx_of_m = self.original_neighbor_index(i, lateral_m);
            if idx_of_m == NOT_FOUND {
                return;
            }
        }
        if opp_n.0 == NOT_FOUND {
            let (min_v, max_v) = ordered(opposite, lateral_n);
            let idx = self.original_neighbor_index(min_v as usize, max_v);
            if idx == NOT_FOUND {
                return;
            }
            opp_n = (min_v as usize, idx);
        }
        if opp_m.0 == NOT_FOUND {
            let (min_v, max_v) = ordered(opposite, lateral_m);
            let idx = self.original_neighbor_index(min_v as usize, max_v);
            if idx == NOT_FOUND {
                return;
            }
            opp_m = (min_v as usize, idx);
        }

        // The edge is processable: propose the flip.
        let n_swap = [n[n_off], m[m_off], n[(n_off + 2) % 3]];
        let m_swap = [n[n_off], n[(n_off + 1) % 3], m[m_off]];

        let worst_q = load_f64(&self.quality[eid0]).min(load_f64(&self.quality[eid1]));
        let (Ok(q0), Ok(q1)) = (self.lipnikov(n_swap), self.lipnikov(m_swap)) else {
            // A flip that inverts an element is rejected outright.
            self.marked[i][it].store(0, Ordering::Relaxed);
            return;
        };
        let new_worst_q = q0.min(q1);

        if new_worst_q > worst_q {
            store_f64(&self.quality[eid0], q0);
            store_f64(&self.quality[eid1], q1);

            // NNList: drop the old diagonal, connect the laterals.
            self.nn[i][it].store(-1, Ordering::Relaxed);
            let idx = self.original_neighbor_index(opposite_u, i as i32);
            debug_assert_ne!(idx, NOT_FOUND);
            self.nn[opposite_u][idx].store(-1, Ordering::Relaxed);

            let anchor_n = if idx_in_n != NOT_FOUND {
                idx_in_n
            } else {
                self.original_neighbor_index(lateral_n as usize, i as i32)
            };
            self.claim_nn_slot(lateral_n as usize, anchor_n, lateral_m);
            let anchor_m = if idx_in_m != NOT_FOUND {
                idx_in_m
            } else {
                self.original_neighbor_index(lateral_m as usize, i as i32)
            };
            self.claim_nn_slot(lateral_m as usize, anchor_m, lateral_n);

            // NEList: the laterals gain one element each, the old diagonal
            // endpoints lose one each.
            self.ne_replace_mirrored(n_swap[0] as usize, eid0 as i32, eid1 as i32);
            self.ne_replace_mirrored(n_swap[1] as usize, eid1 as i32, eid0 as i32);
            self.ne_remove(n_swap[2] as usize, eid1 as i32);
            self.ne_remove(m_swap[1] as usize, eid0 as i32);

            // Element-node list and boundary tags for the two new triangles.
            // The shared edge is interior (a tagged edge has one element),
            // so its two slots drop out and the lateral tags rotate with
            // their edges.
            let bn = self.boundary_tags(eid0);
            let bm = self.boundary_tags(eid1);
            let new_b0 = [bm[(m_off + 2) % 3], bn[(n_off + 1) % 3], 0];
            let new_b1 = [bm[(m_off + 1) % 3], 0, bn[(n_off + 2) % 3]];
            for k in 0..NLOC {
                self.enlist[NLOC * eid0 + k].store(n_swap[k], Ordering::Relaxed);
                self.enlist[NLOC * eid1 + k].store(m_swap[k], Ordering::Relaxed);
                self.boundary[NLOC * eid0 + k].store(new_b0[k], Ordering::Relaxed);
                self.boundary[NLOC * eid1 + k].store(new_b1[k], Ordering::Relaxed);
            }

            // Re-examine the four lateral edges.
            if (i as i32) < lateral_n {
                self.marked[i][idx_of_n].store(1, Ordering::Relaxed);
            } else {
                self.marked[lateral_n as usize][anchor_n].store(1, Ordering::Relaxed);
            }
            if (i as i32) < lateral_m {
                self.marked[i][idx_of_m].store(1, Ordering::Relaxed);
            } else {
                self.marked[lateral_m as usize][anchor_m].store(1, Ordering::Relaxed);
            }
            self.marked[opp_n.0][opp_n.1].store(1, Ordering::Relaxed);
            self.marked[opp_m.0][opp_m.1].store(1, Ordering::Relaxed);

            self.swapped.fetch_add(1, Ordering::Relaxed);
        }

        // The processed edge is retired either way.
        self.marked[i][it].store(0, Ordering::Relaxed);
    }
}

fn ordered(a: i32, b: i32) -> (i32, i32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_invariants::DebugInvariants;
    use crate::geometry::MetricTensor;

    /// The classic bad-diagonal pair: two slivers whose shared edge (1,2)
    /// should flip to (0,3).
    fn sliver_pair() -> Mesh2 {
        let coords = [[0.0, 0.0], [1.0, 0.01], [0.0, 1.0], [1.0, 1.01]];
        let metrics = [MetricTensor::identity(); 4];
        let elements = [[0, 1, 2], [1, 3, 2]];
        let boundary = [[0, 4, 1], [3, 0, 2]];
        Mesh2::from_arrays(&coords, &metrics, &elements, &boundary).unwrap()
    }

    #[test]
    fn bad_diagonal_is_flipped() {
        let mut mesh = sliver_pair();
        let q_before: f64 = (0..2)
            .map(|e| mesh.element_quality(e).unwrap())
            .fold(f64::INFINITY, f64::min);
        let flips = Swap::new(&mut mesh).swap(0.9).unwrap();
        assert_eq!(flips, 1);

        let q_after: f64 = (0..2)
            .map(|e| mesh.element_quality(e).unwrap())
            .fold(f64::INFINITY, f64::min);
        assert!(q_after > q_before);

        // The diagonal now runs between 0 and 3.
        assert!(mesh.nn_list(0).contains(&3));
        assert!(!mesh.nn_list(1).contains(&2));
        mesh.debug_assert_invariants();
    }

    #[test]
    fn swap_preserves_counts_and_boundary() {
        let mut mesh = sliver_pair();
        let nodes = mesh.live_vertex_count();
        let elements = mesh.live_element_count();
        let tags_before = tag_multiset(&mesh);
        Swap::new(&mut mesh).swap(0.9).unwrap();
        assert_eq!(mesh.live_vertex_count(), nodes);
        assert_eq!(mesh.live_element_count(), elements);
        assert_eq!(tag_multiset(&mesh), tags_before);
        mesh.debug_assert_invariants();
    }

    #[test]
    fn good_mesh_is_left_alone() {
        // The sliver pair with the good diagonal already in place; flipping
        // back would strictly lower the worst quality.
        let coords = [[0.0, 0.0], [1.0, 0.01], [0.0, 1.0], [1.0, 1.01]];
        let metrics = [MetricTensor::identity(); 4];
        let elements = [[0, 3, 2], [0, 1, 3]];
        let boundary = [[3, 4, 0], [2, 0, 1]];
        let mut mesh = Mesh2::from_arrays(&coords, &metrics, &elements, &boundary).unwrap();
        let flips = Swap::new(&mut mesh).swap(0.9).unwrap();
        assert_eq!(flips, 0);
        mesh.debug_assert_invariants();
    }

    fn tag_multiset(mesh: &Mesh2) -> Vec<i32> {
        let mut tags = Vec::new();
        for e in 0..mesh.n_elements() {
            if mesh.element_live(e) {
                for &t in &mesh.boundary_tags(e) {
                    if t > 0 {
                        tags.push(t);
                    }
                }
            }
        }
        tags.sort_unstable();
        tags
    }
}
