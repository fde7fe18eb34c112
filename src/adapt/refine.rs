//! Edge-bisection refinement.
//!
//! Every edge whose metric length exceeds `l_max` receives a midpoint vertex
//! biased toward the finer endpoint metric, and the one or two incident
//! triangles are retemplated by the number of their split edges. One call is
//! a single sweep; the driver loops it to a fixed point, after which no live
//! edge exceeds the bound.

use std::sync::atomic::{AtomicI32, Ordering};

use rayon::prelude::*;

use crate::geometry::{ElementGeometry, MetricTensor};
use crate::mesh::slots::{as_atomic_i32, SharedSlice};
use crate::mesh::{Mesh2, NLOC};
use crate::mesh_error::AdaptError;
use crate::partition::parallel::worker_index_or_serial;

/// A split edge: endpoints ordered by global id, plus the midpoint vertex.
#[derive(Clone, Copy, Debug)]
struct DirectedEdge {
    first: i32,
    second: i32,
    id: i32,
}

/// Per-worker buffer of splits found during the sweep.
#[derive(Default)]
struct SplitBuffer {
    edges: Vec<(i32, i32)>,
    coords: Vec<[f64; 2]>,
    metric: Vec<MetricTensor>,
}

/// The refinement operator.
pub struct Refine<'m> {
    mesh: &'m mut Mesh2,
    n_workers: Option<usize>,
}

impl<'m> Refine<'m> {
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

    /// Split every edge longer than `l_max` in metric space once.
    ///
    /// Returns the number of edges split; zero means the mesh is at the
    /// refinement fixed point for this bound.
    pub fn refine(&mut self, l_max: f64) -> Result<usize, AdaptError> {
        let mesh = &mut *self.mesh;
        let n_workers = self.n_workers;
        crate::partition::parallel::install_with_worker_pool(n_workers, move || {
            refine_pass(mesh, l_max)
        })
    }
}

fn refine_pass(mesh: &mut Mesh2, l_max: f64) -> Result<usize, AdaptError> {
    let orig_nnodes = mesh.n_nodes();
    let orig_nelements = mesh.n_elements();
    let nthreads = rayon::current_num_threads().max(1);
    mesh.deferred.reset(nthreads);

    // Sweep all edges once, each from its lesser-gnn endpoint, collecting
    // per-worker split buffers.
    let chunk = orig_nnodes.div_ceil(nthreads);
    let buffers: Vec<SplitBuffer> = {
        let mesh: &Mesh2 = mesh;
        (0..nthreads)
            .into_par_iter()
            .map(|w| -> Result<SplitBuffer, AdaptError> {
                let mut buf = SplitBuffer::default();
                let lo = (w * chunk).min(orig_nnodes);
                let hi = ((w + 1) * chunk).min(orig_nnodes);
                for i in lo..hi {
                    for &j in mesh.nn_list(i) {
                        let j = j as usize;
                        // Each edge is measured once, from the endpoint with
                        // the lesser global id; the ordering also makes the
                        // midpoint identical on every process that sees it.
                        if mesh.gnn(i) < mesh.gnn(j) && mesh.calc_edge_length(i, j) > l_max {
                            refine_edge(mesh, i, j, &mut buf)?;
                        }
                    }
                }
                Ok(buf)
            })
            .collect::<Result<_, _>>()?
    };

    // Barrier: allocate contiguous id ranges per worker, grow storage, and
    // copy the new vertices into their slots.
    let mut starts = Vec::with_capacity(nthreads);
    for buf in &buffers {
        starts.push(mesh.bump_nodes(buf.edges.len()));
    }
    let new_nnodes = mesh.n_nodes();
    let split_count = new_nnodes - orig_nnodes;
    if split_count == 0 {
        return Ok(0);
    }
    mesh.reserve_nodes(new_nnodes);

    let mut all_new = Vec::with_capacity(split_count);
    for (w, buf) in buffers.iter().enumerate() {
        for k in 0..buf.edges.len() {
            let vid = starts[w] + k;
            mesh.set_vertex(vid, buf.coords[k], buf.metric[k]);
            // Pre-size the new vertex's neighbor row so the parallel wiring
            // below only overwrites slots.
            mesh.nnlist[vid] = vec![-1, -1];
            all_new.push(DirectedEdge {
                first: buf.edges[k].0,
                second: buf.edges[k].1,
                id: vid as i32,
            });
        }
    }

    // Mark each element with its new vertices and rewire NNList across every
    // split edge. Writes go to slots owned by exactly one edge: the (u->v)
    // entry belongs to the unique split edge (u,v), and each new row belongs
    // to its own midpoint.
    let new_vertex_per_element: Vec<AtomicI32> = (0..NLOC * orig_nelements)
        .map(|_| AtomicI32::new(-1))
        .collect();
    {
        let nn_atomic: Vec<&[AtomicI32]> = mesh
            .nnlist
            .iter_mut()
            .map(|row| as_atomic_i32(row))
            .collect();
        let nelist = &mesh.nelist;
        let enlist = &mesh.enlist;
        all_new.par_iter().for_each(|edge| {
            let u = edge.first;
            let v = edge.second;
            for e in crate::mesh::sorted_intersection(
                &nelist[u as usize],
                &nelist[v as usize],
            ) {
                let slot = edge_number(enlist, e as usize, u, v);
                new_vertex_per_element[NLOC * e as usize + slot].store(edge.id, Ordering::Relaxed);
            }

            let row = nn_atomic[edge.id as usize];
            row[0].store(u, Ordering::Relaxed);
            row[1].store(v, Ordering::Relaxed);
            replace_entry(nn_atomic[u as usize], v, edge.id);
            replace_entry(nn_atomic[v as usize], u, edge.id);
        });
    }
    // The in-place rewiring breaks row ordering; restore it before any
    // sorted insert runs.
    mesh.nnlist.par_iter_mut().for_each(|row| row.sort_unstable());

    // Barrier: reserve element storage for the worst case before the
    // templates allocate ids with fetch-and-add.
    let extra: usize = {
        let mesh: &Mesh2 = mesh;
        (0..orig_nelements)
            .into_par_iter()
            .map(|e| {
                if mesh.element_raw(e)[0] < 0 {
                    return 0;
                }
                (0..NLOC)
                    .filter(|&j| new_vertex_per_element[NLOC * e + j].load(Ordering::Relaxed) >= 0)
                    .count()
            })
            .sum()
    };
    mesh.reserve_elements(orig_nelements + extra);

    // Retemplate each element with at least one split edge. Element rows are
    // only written by the task that owns the original element (new ids are
    // claimed with fetch-and-add), and adjacency edits go through the
    // deferred buffer.
    {
        let Mesh2 {
            coords,
            metric,
            enlist,
            boundary,
            deferred,
            n_elements,
            ..
        } = &mut *mesh;
        let ctx = TemplateContext {
            enlist: SharedSlice::new(enlist),
            boundary: SharedSlice::new(boundary),
            coords,
            metric,
            new_vertex_per_element: &new_vertex_per_element,
            deferred,
            n_elements,
        };
        (0..orig_nelements).into_par_iter().for_each(|e| {
            // SAFETY comments inside; see TemplateContext.
            refine_element(&ctx, e);
        });
    }

    // Commit deferred operations bucket-parallel, then check orientations.
    mesh.commit_deferred_all();

    #[cfg(any(debug_assertions, feature = "strict-invariants"))]
    {
        let mesh: &Mesh2 = mesh;
        let n_elements = mesh.n_elements();
        (0..n_elements).into_par_iter().for_each(|e| {
            if mesh.element_raw(e)[0] >= 0 {
                assert!(
                    mesh.element_area(e) > 0.0,
                    "inverted element {e} in refinement"
                );
            }
        });
    }

    Ok(split_count)
}

/// Compute the split point of `(n0, n1)` and queue the new vertex.
fn refine_edge(
    mesh: &Mesh2,
    n0: usize,
    n1: usize,
    buf: &mut SplitBuffer,
) -> Result<(), AdaptError> {
    let x0 = mesh.coords_of(n0);
    let x1 = mesh.coords_of(n1);
    let m0 = mesh.metric_of(n0);
    let m1 = mesh.metric_of(n1);

    // Bias the split toward the finer endpoint metric.
    let l0 = ElementGeometry::edge_length(x0, x1, &m0);
    let l1 = ElementGeometry::edge_length(x0, x1, &m1);
    let weight = 1.0 / (1.0 + (l0 / l1).sqrt());

    let x = [x0[0] + weight * (x1[0] - x0[0]), x0[1] + weight * (x1[1] - x0[1])];
    let m = m0.interpolate(&m1, weight);
    if m.has_nan() || !weight.is_finite() {
        return Err(AdaptError::MetricNan { vertex: n0 });
    }

    buf.edges.push((n0 as i32, n1 as i32));
    buf.coords.push(x);
    buf.metric.push(m);
    Ok(())
}

/// Overwrite the unique `target` entry of an adjacency row with `id`.
fn replace_entry(row: &[AtomicI32], target: i32, id: i32) {
    for slot in row {
        if slot.load(Ordering::Relaxed) == target {
            slot.store(id, Ordering::Relaxed);
            return;
        }
    }
    debug_assert!(false, "adjacency entry {target} missing during refinement");
}

/// Index of the edge `(v1, v2)` within element `eid`; edge `i` is opposite
/// vertex `i`.
fn edge_number(enlist: &[i32], eid: usize, v1: i32, v2: i32) -> usize {
    let n = &enlist[NLOC * eid..NLOC * eid + NLOC];
    if n[1] == v1 || n[1] == v2 {
        if n[2] == v1 || n[2] == v2 {
            0
        } else {
            2
        }
    } else {
        1
    }
}

struct TemplateContext<'a> {
    enlist: SharedSlice<'a, i32>,
    boundary: SharedSlice<'a, i32>,
    coords: &'a [f64],
    metric: &'a [MetricTensor],
    new_vertex_per_element: &'a [AtomicI32],
    deferred: &'a crate::mesh::deferred::DeferredOperations,
    n_elements: &'a std::sync::atomic::AtomicUsize,
}

impl TemplateContext<'_> {
    fn edge_length(&self, u: i32, v: i32) -> f64 {
        let (u, v) = (u as usize, v as usize);
        ElementGeometry::edge_length_mean(
            [self.coords[2 * u], self.coords[2 * u + 1]],
            [self.coords[2 * v], self.coords[2 * v + 1]],
            &self.metric[u],
            &self.metric[v],
        )
    }

    /// Write an element's vertex triple and boundary tags.
    ///
    /// Exclusive by construction: `eid` is either the task's own original
    /// element or an id freshly claimed from the element counter.
    fn set_element(&self, eid: usize, n: [i32; 3], b: [i32; 3]) {
        for i in 0..NLOC {
            // SAFETY: see above; no other task writes these slots.
            unsafe {
                *self.enlist.get_mut(NLOC * eid + i) = n[i];
                *self.boundary.get_mut(NLOC * eid + i) = b[i];
            }
        }
    }
}

/// Apply the 1/2/3-split template to element `eid`.
fn refine_element(ctx: &TemplateContext<'_>, eid: usize) {
    // SAFETY: the original element row is read/written only by this task.
    let n = unsafe {
        [
            *ctx.enlist.get(NLOC * eid),
            *ctx.enlist.get(NLOC * eid + 1),
            *ctx.enlist.get(NLOC * eid + 2),
        ]
    };
    if n[0] < 0 {
        return;
    }
    let b = unsafe {
        [
            *ctx.boundary.get(NLOC * eid),
            *ctx.boundary.get(NLOC * eid + 1),
            *ctx.boundary.get(NLOC * eid + 2),
        ]
    };

    // Edge i (opposite vertex i) may carry a new midpoint vertex.
    let new_vertex: [i32; 3] = [
        ctx.new_vertex_per_element[NLOC * eid].load(Ordering::Relaxed),
        ctx.new_vertex_per_element[NLOC * eid + 1].load(Ordering::Relaxed),
        ctx.new_vertex_per_element[NLOC * eid + 2].load(Ordering::Relaxed),
    ];
    let refine_cnt = new_vertex.iter().filter(|&&v| v >= 0).count();
    let tid = worker_index_or_serial();

    match refine_cnt {
        0 => {}
        1 => {
            // Single split: two sub-triangles sharing the midpoint.
            let j = (0..3).find(|&j| new_vertex[j] >= 0).unwrap();
            let vertex_id = new_vertex[j];
            let rot = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
            let rot_b = [b[j], b[(j + 1) % 3], b[(j + 2) % 3]];

            let ele0 = [rot[0], rot[1], vertex_id];
            let ele1 = [rot[0], vertex_id, rot[2]];
            // The halves of the split edge keep its tag; the internal edge
            // is interior.
            let ele0_b = [rot_b[0], 0, rot_b[2]];
            let ele1_b = [rot_b[0], rot_b[1], 0];

            let ele1_id = ctx.n_elements.fetch_add(1, Ordering::Relaxed) as i32;

            ctx.deferred.add_nn(vertex_id, rot[0], tid);
            ctx.deferred.add_nn(rot[0], vertex_id, tid);

            ctx.deferred.add_ne(rot[0], ele1_id, tid);
            ctx.deferred.add_ne(vertex_id, eid as i32, tid);
            ctx.deferred.add_ne(vertex_id, ele1_id, tid);
            ctx.deferred.rem_ne(rot[2], eid as i32, tid);
            ctx.deferred.add_ne(rot[2], ele1_id, tid);

            ctx.set_element(eid, ele0, ele0_b);
            ctx.set_element(ele1_id as usize, ele1, ele1_b);
        }
        2 => {
            // Two splits: three sub-triangles; the shorter diagonal wins.
            let j = (0..3).find(|&j| new_vertex[j] < 0).unwrap();
            let vertex_id = [new_vertex[(j + 1) % 3], new_vertex[(j + 2) % 3]];
            let rot = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
            let rot_b = [b[j], b[(j + 1) % 3], b[(j + 2) % 3]];

            let ldiag0 = ctx.edge_length(rot[1], vertex_id[0]);
            let ldiag1 = ctx.edge_length(rot[2], vertex_id[1]);
            let offset = if ldiag0 < ldiag1 { 0usize } else { 1usize };

            let ele0 = [rot[0], vertex_id[1], vertex_id[0]];
            let ele1 = [vertex_id[offset], rot[1], rot[2]];
            let ele2 = [vertex_id[0], vertex_id[1], rot[offset + 1]];

            let ele0_b = [0, rot_b[1], rot_b[2]];
            let ele1_b = [
                rot_b[0],
                if offset == 0 { rot_b[1] } else { 0 },
                if offset == 0 { 0 } else { rot_b[2] },
            ];
            let ele2_b = [
                if offset == 0 { rot_b[2] } else { 0 },
                if offset == 0 { 0 } else { rot_b[1] },
                0,
            ];

            let ele0_id = ctx.n_elements.fetch_add(2, Ordering::Relaxed) as i32;
            let ele2_id = ele0_id + 1;

            ctx.deferred.add_nn(vertex_id[0], vertex_id[1], tid);
            ctx.deferred.add_nn(vertex_id[1], vertex_id[0], tid);
            // The chosen diagonal connects vertex_id[offset] with the old
            // vertex rot[offset + 1].
            ctx.deferred.add_nn(vertex_id[offset], rot[offset + 1], tid);
            ctx.deferred.add_nn(rot[offset + 1], vertex_id[offset], tid);

            ctx.deferred.add_ne(rot[offset + 1], ele2_id, tid);
            ctx.deferred.rem_ne(rot[0], eid as i32, tid);
            ctx.deferred.add_ne(rot[0], ele0_id, tid);
            ctx.deferred.add_ne(vertex_id[offset], eid as i32, tid);
            ctx.deferred.add_ne(vertex_id[offset], ele0_id, tid);
            ctx.deferred.add_ne(vertex_id[offset], ele2_id, tid);
            ctx.deferred.add_ne(vertex_id[(offset + 1) % 2], ele0_id, tid);
            ctx.deferred.add_ne(vertex_id[(offset + 1) % 2], ele2_id, tid);

            ctx.set_element(eid, ele1, ele1_b);
            ctx.set_element(ele0_id as usize, ele0, ele0_b);
            ctx.set_element(ele2_id as usize, ele2, ele2_b);
        }
        _ => {
            // Three splits: four congruent sub-triangles.
            let ele0 = [n[0], new_vertex[2], new_vertex[1]];
            let ele1 = [n[1], new_vertex[0], new_vertex[2]];
            let ele2 = [n[2], new_vertex[1], new_vertex[0]];
            let ele3 = [new_vertex[0], new_vertex[1], new_vertex[2]];

            let ele0_b = [0, b[1], b[2]];
            let ele1_b = [0, b[2], b[0]];
            let ele2_b = [0, b[0], b[1]];
            let ele3_b = [0, 0, 0];

            let ele1_id = ctx.n_elements.fetch_add(3, Ordering::Relaxed) as i32;
            let ele2_id = ele1_id + 1;
            let ele3_id = ele1_id + 2;

            ctx.deferred.add_nn(new_vertex[0], new_vertex[1], tid);
            ctx.deferred.add_nn(new_vertex[0], new_vertex[2], tid);
            ctx.deferred.add_nn(new_vertex[1], new_vertex[0], tid);
            ctx.deferred.add_nn(new_vertex[1], new_vertex[2], tid);
            ctx.deferred.add_nn(new_vertex[2], new_vertex[0], tid);
            ctx.deferred.add_nn(new_vertex[2], new_vertex[1], tid);

            ctx.deferred.rem_ne(n[1], eid as i32, tid);
            ctx.deferred.add_ne(n[1], ele1_id, tid);
            ctx.deferred.rem_ne(n[2], eid as i32, tid);
            ctx.deferred.add_ne(n[2], ele2_id, tid);

            ctx.deferred.add_ne(new_vertex[0], ele1_id, tid);
            ctx.deferred.add_ne(new_vertex[0], ele2_id, tid);
            ctx.deferred.add_ne(new_vertex[0], ele3_id, tid);

            ctx.deferred.add_ne(new_vertex[1], eid as i32, tid);
            ctx.deferred.add_ne(new_vertex[1], ele2_id, tid);
            ctx.deferred.add_ne(new_vertex[1], ele3_id, tid);

            ctx.deferred.add_ne(new_vertex[2], eid as i32, tid);
            ctx.deferred.add_ne(new_vertex[2], ele1_id, tid);
            ctx.deferred.add_ne(new_vertex[2], ele3_id, tid);

            ctx.set_element(eid, ele0, ele0_b);
            ctx.set_element(ele1_id as usize, ele1, ele1_b);
            ctx.set_element(ele2_id as usize, ele2, ele2_b);
            ctx.set_element(ele3_id as usize, ele3, ele3_b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_invariants::DebugInvariants;
    use crate::mesh_generation::structured_square;

    #[test]
    fn uniform_refinement_splits_every_edge() {
        // Metric demands edges twice as fine as the grid spacing.
        let mut mesh = structured_square(2, 1.0, 0.25).unwrap();
        let before_nodes = mesh.live_vertex_count();
        let splits = Refine::with_workers(&mut mesh, Some(2))
            .refine(2f64.sqrt())
            .unwrap();
        assert!(splits > 0);
        assert!(mesh.live_vertex_count() > before_nodes);
        mesh.debug_assert_invariants();
    }

    #[test]
    fn refinement_reaches_fixed_point() {
        let mut mesh = structured_square(2, 1.0, 0.25).unwrap();
        let l_max = 2f64.sqrt();
        for _ in 0..10 {
            let splits = Refine::new(&mut mesh).refine(l_max).unwrap();
            mesh.debug_assert_invariants();
            if splits == 0 {
                break;
            }
        }
        // At the fixed point no edge exceeds the bound.
        for u in 0..mesh.n_nodes() {
            for &v in mesh.nn_list(u) {
                if (u as i32) < v {
                    assert!(mesh.calc_edge_length(u, v as usize) <= l_max * (1.0 + 1e-12));
                }
            }
        }
        assert_eq!(Refine::new(&mut mesh).refine(l_max).unwrap(), 0);
    }

    #[test]
    fn boundary_tags_survive_subdivision() {
        let mut mesh = structured_square(2, 1.0, 0.2).unwrap();
        let tagged_before: f64 = boundary_length(&mesh);
        while Refine::new(&mut mesh).refine(1.0).unwrap() > 0 {}
        let tagged_after: f64 = boundary_length(&mesh);
        assert!((tagged_before - tagged_after).abs() < 1e-9);
        mesh.debug_assert_invariants();
    }

    /// Total Euclidean length of tagged boundary edges.
    fn boundary_length(mesh: &crate::mesh::Mesh2) -> f64 {
        let mut total = 0.0;
        for e in 0..mesh.n_elements() {
            if let Some(n) = mesh.element(e) {
                let tags = mesh.boundary_tags(e);
                for i in 0..3 {
                    if tags[i] > 0 {
                        let u = n[(i + 1) % 3];
                        let v = n[(i + 2) % 3];
                        let xu = mesh.coords_of(u);
                        let xv = mesh.coords_of(v);
                        total += ((xu[0] - xv[0]).powi(2) + (xu[1] - xv[1]).powi(2)).sqrt();
                    }
                }
            }
        }
        total
    }
}
