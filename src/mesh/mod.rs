//! Flat-storage triangular mesh with metric data and mutable adjacency.
//!
//! The mesh owns all vertex and element storage as flat vectors indexed by
//! id; the adaptation operators hold a reference and mutate through this
//! API. Elements are tombstoned by negating their first vertex slot and
//! vertices by clearing their neighbor list; storage is reclaimed by
//! [`Mesh2::defragment`]. High-water counters are atomic so that workers can
//! allocate id ranges with fetch-and-add while the backing vectors are only
//! resized in single-threaded barrier regions.

pub mod defrag;
pub(crate) mod deferred;
pub mod halo;
pub(crate) mod slots;
pub mod verify;

use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashSet;

use crate::geometry::{ElementGeometry, MetricTensor};
use crate::mesh::deferred::DeferredOperations;
use crate::mesh::halo::HaloOracle;
use crate::mesh_error::AdaptError;

/// Number of vertices per element.
pub(crate) const NLOC: usize = 3;

/// A 2D triangular mesh with per-vertex metric tensors.
#[derive(Debug)]
pub struct Mesh2 {
    /// Vertex coordinates, 2 per vertex.
    pub(crate) coords: Vec<f64>,
    /// Per-vertex metric tensors.
    pub(crate) metric: Vec<MetricTensor>,
    /// Element-node list, 3 per element; `enlist[3e] < 0` tombstones `e`.
    pub(crate) enlist: Vec<i32>,
    /// Boundary tags, 3 per element; slot `i` tags the edge opposite vertex `i`.
    pub(crate) boundary: Vec<i32>,
    /// Vertex -> adjacent vertices, sorted ascending. Empty = dead vertex.
    pub(crate) nnlist: Vec<Vec<i32>>,
    /// Vertex -> incident elements, sorted ascending.
    pub(crate) nelist: Vec<Vec<i32>>,
    /// Owning rank per vertex (all equal to `rank` in single-process mode).
    pub(crate) node_owner: Vec<i32>,
    /// Local-to-global vertex numbering.
    pub(crate) lnn2gnn: Vec<i64>,
    /// Vertices this process sends to peers.
    pub(crate) send_halo: HashSet<i32>,
    /// Vertices this process receives from peers.
    pub(crate) recv_halo: HashSet<i32>,
    pub(crate) rank: i32,
    pub(crate) n_nodes: AtomicUsize,
    pub(crate) n_elements: AtomicUsize,
    pub(crate) geom: ElementGeometry,
    pub(crate) deferred: DeferredOperations,
}

impl Mesh2 {
    /// Build a mesh from raw arrays.
    ///
    /// `boundary[e][i]` tags the edge of `e` opposite its `i`-th vertex
    /// (0 = interior). The orientation of the first element fixes the sign
    /// convention of the geometry kernel; every element must be consistently
    /// oriented.
    pub fn from_arrays(
        coords: &[[f64; 2]],
        metrics: &[MetricTensor],
        elements: &[[usize; 3]],
        boundary: &[[i32; 3]],
    ) -> Result<Self, AdaptError> {
        if coords.len() != metrics.len() {
            return Err(AdaptError::InvalidImport(format!(
                "{} coordinate pairs but {} metric tensors",
                coords.len(),
                metrics.len()
            )));
        }
        if elements.len() != boundary.len() {
            return Err(AdaptError::InvalidImport(format!(
                "{} elements but {} boundary triples",
                elements.len(),
                boundary.len()
            )));
        }
        let first = elements.first().ok_or_else(|| {
            AdaptError::InvalidImport("a mesh needs at least one element".to_string())
        })?;

        let n_nodes = coords.len();
        for (e, tri) in elements.iter().enumerate() {
            for &v in tri {
                if v >= n_nodes {
                    return Err(AdaptError::InvalidImport(format!(
                        "element {e} references vertex {v} out of range"
                    )));
                }
            }
            if tri[0] == tri[1] || tri[1] == tri[2] || tri[0] == tri[2] {
                return Err(AdaptError::InvalidImport(format!(
                    "element {e} repeats a vertex"
                )));
            }
        }
        for (v, m) in metrics.iter().enumerate() {
            if !m.is_finite() {
                return Err(AdaptError::MetricNan { vertex: v });
            }
            if !m.is_spd() {
                return Err(AdaptError::MetricNotSpd { vertex: v });
            }
        }

        let geom = ElementGeometry::from_reference(
            coords[first[0]],
            coords[first[1]],
            coords[first[2]],
        );
        for (e, tri) in elements.iter().enumerate() {
            let a = geom.area(coords[tri[0]], coords[tri[1]], coords[tri[2]]);
            if a <= 0.0 {
                return Err(AdaptError::InvalidImport(format!(
                    "element {e} is inverted or degenerate (area {a})"
                )));
            }
        }

        let mut flat_coords = Vec::with_capacity(2 * n_nodes);
        for x in coords {
            flat_coords.extend_from_slice(x);
        }
        let mut enlist = Vec::with_capacity(NLOC * elements.len());
        for tri in elements {
            enlist.extend(tri.iter().map(|&v| v as i32));
        }
        let mut tags = Vec::with_capacity(NLOC * boundary.len());
        for b in boundary {
            tags.extend_from_slice(b);
        }

        let mut mesh = Self {
            coords: flat_coords,
            metric: metrics.to_vec(),
            enlist,
            boundary: tags,
            nnlist: vec![Vec::new(); n_nodes],
            nelist: vec![Vec::new(); n_nodes],
            node_owner: vec![0; n_nodes],
            lnn2gnn: (0..n_nodes as i64).collect(),
            send_halo: HashSet::default(),
            recv_halo: HashSet::default(),
            rank: 0,
            n_nodes: AtomicUsize::new(n_nodes),
            n_elements: AtomicUsize::new(elements.len()),
            geom,
            deferred: DeferredOperations::new(1),
        };
        mesh.create_adjacency();
        Ok(mesh)
    }

    /// High-water vertex count, including tombstones.
    pub fn n_nodes(&self) -> usize {
        self.n_nodes.load(Ordering::Relaxed)
    }

    /// High-water element count, including tombstones.
    pub fn n_elements(&self) -> usize {
        self.n_elements.load(Ordering::Relaxed)
    }

    /// Number of live (non-tombstoned) vertices.
    pub fn live_vertex_count(&self) -> usize {
        self.nnlist.iter().filter(|nn| !nn.is_empty()).count()
    }

    /// Number of live (non-tombstoned) elements.
    pub fn live_element_count(&self) -> usize {
        (0..self.n_elements()).filter(|&e| self.element_live(e)).count()
    }

    /// Coordinates of vertex `v`.
    pub fn coords_of(&self, v: usize) -> [f64; 2] {
        [self.coords[2 * v], self.coords[2 * v + 1]]
    }

    /// Metric tensor at vertex `v`.
    pub fn metric_of(&self, v: usize) -> MetricTensor {
        self.metric[v]
    }

    /// Global id of vertex `v`.
    pub fn gnn(&self, v: usize) -> i64 {
        self.lnn2gnn[v]
    }

    /// True when element `e` has not been tombstoned.
    pub fn element_live(&self, e: usize) -> bool {
        self.enlist[NLOC * e] >= 0
    }

    /// True when vertex `v` has not been tombstoned.
    pub fn vertex_live(&self, v: usize) -> bool {
        !self.nnlist[v].is_empty()
    }

    /// Vertex triple of a live element; `None` for tombstones.
    pub fn element(&self, e: usize) -> Option<[usize; 3]> {
        if self.element_live(e) {
            let n = &self.enlist[NLOC * e..NLOC * e + NLOC];
            Some([n[0] as usize, n[1] as usize, n[2] as usize])
        } else {
            None
        }
    }

    /// Raw vertex triple of element `e` (first entry negative for tombstones).
    pub(crate) fn element_raw(&self, e: usize) -> [i32; 3] {
        let n = &self.enlist[NLOC * e..NLOC * e + NLOC];
        [n[0], n[1], n[2]]
    }

    /// Boundary tags of element `e`, slot `i` opposite vertex `i`.
    pub fn boundary_tags(&self, e: usize) -> [i32; 3] {
        let b = &self.boundary[NLOC * e..NLOC * e + NLOC];
        [b[0], b[1], b[2]]
    }

    /// Vertices adjacent to `v` (sorted, read view).
    pub fn nn_list(&self, v: usize) -> &[i32] {
        &self.nnlist[v]
    }

    /// Elements incident to `v` (sorted, read view).
    pub fn ne_list(&self, v: usize) -> &[i32] {
        &self.nelist[v]
    }

    /// The orientation-baked geometry kernel.
    pub fn geometry(&self) -> &ElementGeometry {
        &self.geom
    }

    /// Metric length of the edge `(u, v)` under the mean endpoint metric.
    pub fn calc_edge_length(&self, u: usize, v: usize) -> f64 {
        ElementGeometry::edge_length_mean(
            self.coords_of(u),
            self.coords_of(v),
            &self.metric[u],
            &self.metric[v],
        )
    }

    /// Signed area of element `e` under the mesh orientation.
    pub fn element_area(&self, e: usize) -> f64 {
        let n = self.element_raw(e);
        self.geom.area(
            self.coords_of(n[0] as usize),
            self.coords_of(n[1] as usize),
            self.coords_of(n[2] as usize),
        )
    }

    /// Lipnikov quality of element `e`.
    pub fn element_quality(&self, e: usize) -> Result<f64, AdaptError> {
        let n = self.element_raw(e);
        let (i, j, k) = (n[0] as usize, n[1] as usize, n[2] as usize);
        self.geom
            .lipnikov(
                self.coords_of(i),
                self.coords_of(j),
                self.coords_of(k),
                &self.metric[i],
                &self.metric[j],
                &self.metric[k],
            )
            .map_err(|_| AdaptError::NonPositiveArea { element: e })
    }

    /// Elements shared by vertices `u` and `v` (1 for a boundary edge, 2 for
    /// an interior edge on a consistent mesh).
    pub fn common_elements(&self, u: usize, v: usize) -> Vec<i32> {
        sorted_intersection(&self.nelist[u], &self.nelist[v])
    }

    /// Union of the vertices of all elements incident to `v`, excluding `v`.
    pub fn get_node_patch(&self, v: usize) -> Vec<i32> {
        let mut patch = Vec::with_capacity(self.nnlist[v].len() + 2);
        for &e in &self.nelist[v] {
            for &n in &self.enlist[NLOC * e as usize..NLOC * e as usize + NLOC] {
                if n != v as i32 {
                    insert_sorted(&mut patch, n);
                }
            }
        }
        patch
    }

    /// Tombstone element `e` and remove it from its vertices' element lists.
    pub fn erase_element(&mut self, e: usize) {
        let n = self.element_raw(e);
        for &v in &n {
            if v >= 0 {
                remove_sorted(&mut self.nelist[v as usize], e as i32);
            }
        }
        self.enlist[NLOC * e] = -1;
    }

    /// Tombstone vertex `v`: clears its adjacency records.
    pub fn erase_vertex(&mut self, v: usize) {
        self.nnlist[v].clear();
        self.nelist[v].clear();
    }

    /// Append a live vertex and return its id.
    ///
    /// The parallel operators split this into an atomic range grab
    /// ([`Self::bump_nodes`]) plus slot writes after a barriered resize; this
    /// method is the single-threaded convenience for drivers importing halo
    /// data.
    pub fn append_vertex(&mut self, x: [f64; 2], m: MetricTensor) -> usize {
        let v = self.bump_nodes(1);
        let n = self.n_nodes();
        self.reserve_nodes(n);
        self.set_vertex(v, x, m);
        v
    }

    /// Append a live element and return its id.
    ///
    /// Adjacency upkeep is the caller's responsibility, matching the
    /// operators' deferred-edit discipline.
    pub fn append_element(&mut self, n: [usize; 3], b: [i32; 3]) -> usize {
        let e = self.bump_elements(1);
        let count = self.n_elements();
        self.reserve_elements(count);
        for i in 0..NLOC {
            self.enlist[NLOC * e + i] = n[i] as i32;
            self.boundary[NLOC * e + i] = b[i];
        }
        e
    }

    /// Allocate `count` vertex ids; returns the first id of the range.
    pub(crate) fn bump_nodes(&self, count: usize) -> usize {
        self.n_nodes.fetch_add(count, Ordering::Relaxed)
    }

    /// Allocate `count` element ids; returns the first id of the range.
    pub(crate) fn bump_elements(&self, count: usize) -> usize {
        self.n_elements.fetch_add(count, Ordering::Relaxed)
    }

    pub(crate) fn set_node_count(&mut self, n: usize) {
        self.n_nodes.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_element_count(&mut self, n: usize) {
        self.n_elements.store(n, Ordering::Relaxed);
    }

    /// Grow vertex storage to `n` slots (single-threaded barrier region).
    pub(crate) fn reserve_nodes(&mut self, n: usize) {
        if self.coords.len() < 2 * n {
            self.coords.resize(2 * n, 0.0);
            self.metric.resize(n, MetricTensor::identity());
            self.nnlist.resize(n, Vec::new());
            self.nelist.resize(n, Vec::new());
            self.node_owner.resize(n, self.rank);
            self.lnn2gnn.resize(n, -1);
        }
    }

    /// Grow element storage to `n` slots (single-threaded barrier region).
    pub(crate) fn reserve_elements(&mut self, n: usize) {
        if self.enlist.len() < NLOC * n {
            self.enlist.resize(NLOC * n, -1);
            self.boundary.resize(NLOC * n, 0);
        }
    }

    /// Write a vertex into a pre-reserved slot.
    pub(crate) fn set_vertex(&mut self, v: usize, x: [f64; 2], m: MetricTensor) {
        self.coords[2 * v] = x[0];
        self.coords[2 * v + 1] = x[1];
        self.metric[v] = m;
        self.node_owner[v] = self.rank;
        self.lnn2gnn[v] = v as i64;
    }

    /// Rebuild NNList/NEList from the element-node list.
    pub fn create_adjacency(&mut self) {
        let n_nodes = self.n_nodes();
        let n_elements = self.n_elements();
        for row in &mut self.nnlist {
            row.clear();
        }
        for row in &mut self.nelist {
            row.clear();
        }
        self.nnlist.resize(n_nodes, Vec::new());
        self.nelist.resize(n_nodes, Vec::new());
        for e in 0..n_elements {
            if !self.element_live(e) {
                continue;
            }
            let n = self.element_raw(e);
            for i in 0..NLOC {
                let vi = n[i] as usize;
                insert_sorted(&mut self.nelist[vi], e as i32);
                for j in 0..NLOC {
                    if i != j {
                        insert_sorted(&mut self.nnlist[vi], n[j]);
                    }
                }
            }
        }
    }

    /// RMS deviation of live-edge metric lengths from the unit target.
    pub fn get_lrms(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for u in 0..self.n_nodes() {
            for &v in &self.nnlist[u] {
                if (u as i32) < v {
                    let d = self.calc_edge_length(u, v as usize) - 1.0;
                    sum += d * d;
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            (sum / count as f64).sqrt()
        }
    }

    /// RMS deviation of live-element quality from the ideal 1.
    pub fn get_qrms(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for e in 0..self.n_elements() {
            if !self.element_live(e) {
                continue;
            }
            let q = self.element_quality(e).unwrap_or(0.0);
            let d = q - 1.0;
            sum += d * d;
            count += 1;
        }
        if count == 0 {
            0.0
        } else {
            (sum / count as f64).sqrt()
        }
    }
}

impl HaloOracle for Mesh2 {
    fn is_owned(&self, v: usize) -> bool {
        self.node_owner[v] == self.rank
    }

    fn is_halo(&self, v: usize) -> bool {
        let v = v as i32;
        self.send_halo.contains(&v) || self.recv_halo.contains(&v)
    }

    fn recv_halo_contains(&self, v: usize) -> bool {
        self.recv_halo.contains(&(v as i32))
    }
}

/// Insert into a sorted id row, preserving set semantics.
pub(crate) fn insert_sorted(row: &mut Vec<i32>, x: i32) {
    if let Err(pos) = row.binary_search(&x) {
        row.insert(pos, x);
    }
}

/// Remove from a sorted id row; absent entries are ignored.
pub(crate) fn remove_sorted(row: &mut Vec<i32>, x: i32) {
    if let Ok(pos) = row.binary_search(&x) {
        row.remove(pos);
    }
}

/// Membership test on a sorted id row.
pub(crate) fn contains_sorted(row: &[i32], x: i32) -> bool {
    row.binary_search(&x).is_ok()
}

/// Intersection of two sorted id rows.
pub(crate) fn sorted_intersection(a: &[i32], b: &[i32]) -> Vec<i32> {
    let mut out = Vec::with_capacity(2);
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit square split along the main diagonal, all sides tagged.
    pub(crate) fn two_triangle_square() -> Mesh2 {
        let coords = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let metrics = [MetricTensor::identity(); 4];
        // Diagonal (0, 2) shared; boundary tags: bottom 1, right 2, top 3, left 4.
        let elements = [[0, 1, 2], [0, 2, 3]];
        let boundary = [[2, 0, 1], [3, 4, 0]];
        Mesh2::from_arrays(&coords, &metrics, &elements, &boundary).unwrap()
    }

    #[test]
    fn adjacency_built_sorted() {
        let mesh = two_triangle_square();
        assert_eq!(mesh.nn_list(0), &[1, 2, 3]);
        assert_eq!(mesh.nn_list(1), &[0, 2]);
        assert_eq!(mesh.ne_list(0), &[0, 1]);
        assert_eq!(mesh.ne_list(1), &[0]);
        assert_eq!(mesh.common_elements(0, 2), vec![0, 1]);
        assert_eq!(mesh.common_elements(1, 2), vec![0]);
    }

    #[test]
    fn edge_lengths_with_identity_metric() {
        let mesh = two_triangle_square();
        assert!((mesh.calc_edge_length(0, 1) - 1.0).abs() < 1e-12);
        assert!((mesh.calc_edge_length(0, 2) - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn erase_element_updates_incidence() {
        let mut mesh = two_triangle_square();
        mesh.erase_element(0);
        assert!(!mesh.element_live(0));
        assert_eq!(mesh.ne_list(1), &[] as &[i32]);
        assert_eq!(mesh.ne_list(0), &[1]);
        assert_eq!(mesh.live_element_count(), 1);
    }

    #[test]
    fn node_patch_excludes_center() {
        let mesh = two_triangle_square();
        assert_eq!(mesh.get_node_patch(0), vec![1, 2, 3]);
        assert_eq!(mesh.get_node_patch(1), vec![0, 2]);
    }

    #[test]
    fn inconsistent_orientation_rejected() {
        let coords = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let metrics = [MetricTensor::identity(); 4];
        let elements = [[0, 1, 2], [0, 3, 2]]; // second is clockwise
        let boundary = [[2, 0, 1], [0, 0, 0]];
        assert!(Mesh2::from_arrays(&coords, &metrics, &elements, &boundary).is_err());
    }

    #[test]
    fn append_entities_extend_storage() {
        let mut mesh = two_triangle_square();
        let v = mesh.append_vertex([2.0, 0.0], MetricTensor::identity());
        assert_eq!(v, 4);
        assert_eq!(mesh.coords_of(4), [2.0, 0.0]);

        let e = mesh.append_element([1, 4, 2], [2, 0, 1]);
        assert_eq!(e, 2);
        assert_eq!(mesh.element(2), Some([1, 4, 2]));
        assert_eq!(mesh.boundary_tags(2), [2, 0, 1]);
    }

    #[test]
    fn id_allocation_is_monotone() {
        let mesh = two_triangle_square();
        let a = mesh.bump_nodes(3);
        let b = mesh.bump_nodes(2);
        assert_eq!(a, 4);
        assert_eq!(b, 7);
        assert_eq!(mesh.n_nodes(), 9);
    }
}
