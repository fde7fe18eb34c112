//! Boundary topology oracle.
//!
//! Derives the boundary facet structure from the element boundary tags and
//! answers the questions coarsening needs: which vertices sit on the
//! boundary, which are corners that pin the geometry, and which edges may
//! collapse without distorting a boundary patch. The oracle is rebuilt from
//! the mesh at the start of a coarsening pass and maintained incrementally
//! while collapses are applied.
//!
//! Data is stored per vertex so that the coarsening workers' partition
//! discipline (all writes inside a worker's partition interior) carries over
//! to the oracle unchanged.

use crate::mesh::slots::SharedSlice;
use crate::mesh::{Mesh2, NLOC};

/// Relative tolerance for the collinearity test at boundary vertices.
const COLLINEAR_TOL: f64 = 1e-9;

/// One boundary facet seen from a vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundaryFacet {
    /// The facet's other endpoint.
    pub neighbor: i32,
    /// Boundary patch tag (always positive).
    pub tag: i32,
}

/// Boundary record of a single vertex.
#[derive(Clone, Debug, Default)]
pub struct VertexBoundary {
    pub(crate) facets: Vec<BoundaryFacet>,
    pub(crate) corner: bool,
}

/// Boundary oracle for a 2D triangulation.
#[derive(Clone, Debug)]
pub struct Boundary2 {
    rows: Vec<VertexBoundary>,
}

impl Boundary2 {
    /// Build the facet table from the element boundary tags.
    pub fn from_mesh(mesh: &Mesh2) -> Self {
        let n_nodes = mesh.n_nodes();
        let mut rows: Vec<VertexBoundary> = vec![VertexBoundary::default(); n_nodes];
        for e in 0..mesh.n_elements() {
            if !mesh.element_live(e) {
                continue;
            }
            let n = mesh.element_raw(e);
            let tags = mesh.boundary_tags(e);
            for i in 0..NLOC {
                if tags[i] <= 0 {
                    continue;
                }
                let u = n[(i + 1) % NLOC];
                let v = n[(i + 2) % NLOC];
                rows[u as usize].facets.push(BoundaryFacet {
                    neighbor: v,
                    tag: tags[i],
                });
                rows[v as usize].facets.push(BoundaryFacet {
                    neighbor: u,
                    tag: tags[i],
                });
            }
        }
        for (v, row) in rows.iter_mut().enumerate() {
            row.corner = classify_corner(mesh, v, row);
        }
        Self { rows }
    }

    /// True when `v` lies on the boundary.
    pub fn contains_node(&self, v: usize) -> bool {
        !self.rows[v].facets.is_empty()
    }

    /// True when `v` is a corner: a boundary vertex where two patches with
    /// distinct tags or non-collinear directions meet.
    pub fn is_corner_vertex(&self, v: usize) -> bool {
        self.rows[v].corner
    }

    /// Boundary facets incident to `v`.
    pub fn facets(&self, v: usize) -> &[BoundaryFacet] {
        &self.rows[v].facets
    }

    /// May vertex `v` collapse onto its neighbor `t` without changing the
    /// boundary shape?
    ///
    /// Interior vertices always may. A boundary vertex may only slide along
    /// its own (straight, single-tag) patch: it must not be a corner and
    /// `(v, t)` must itself be a boundary facet.
    pub fn is_collapsible(&self, v: usize, t: usize) -> bool {
        let vrow = &self.rows[v];
        if vrow.facets.is_empty() {
            return true;
        }
        if vrow.corner {
            return false;
        }
        if self.rows[t].facets.is_empty() {
            return false;
        }
        vrow.facets.iter().any(|f| f.neighbor == t as i32)
    }

    /// Merge the boundary facets of `v` into `t` after collapsing the edge
    /// `(v, t)`.
    pub fn collapse(&mut self, v: usize, t: usize) {
        let rows = SharedSlice::new(&mut self.rows[..]);
        // SAFETY: &mut self gives exclusive access to every row.
        unsafe { Self::collapse_in(&rows, v, t) }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [VertexBoundary] {
        &mut self.rows
    }

    /// Shared-view variant of [`Boundary2::is_collapsible`].
    ///
    /// # Safety
    /// No concurrent writer may touch rows `v` or `t`.
    pub(crate) unsafe fn is_collapsible_in(
        rows: &SharedSlice<'_, VertexBoundary>,
        v: usize,
        t: usize,
    ) -> bool {
        let vrow = rows.get(v);
        if vrow.facets.is_empty() {
            return true;
        }
        if vrow.corner {
            return false;
        }
        if rows.get(t).facets.is_empty() {
            return false;
        }
        vrow.facets.iter().any(|f| f.neighbor == t as i32)
    }

    /// Shared-view variant of [`Boundary2::collapse`].
    ///
    /// # Safety
    /// No concurrent reader or writer may touch rows `v`, `t`, or the rows
    /// of `v`'s facet neighbors.
    pub(crate) unsafe fn collapse_in(rows: &SharedSlice<'_, VertexBoundary>, v: usize, t: usize) {
        let vrow = std::mem::take(rows.get_mut(v));
        let trow = rows.get_mut(t);
        trow.facets.retain(|f| f.neighbor != v as i32);
        for f in &vrow.facets {
            if f.neighbor == t as i32 {
                continue;
            }
            trow.facets.push(BoundaryFacet {
                neighbor: f.neighbor,
                tag: f.tag,
            });
            let nrow = rows.get_mut(f.neighbor as usize);
            for nf in &mut nrow.facets {
                if nf.neighbor == v as i32 {
                    nf.neighbor = t as i32;
                }
            }
        }
    }
}

fn classify_corner(mesh: &Mesh2, v: usize, row: &VertexBoundary) -> bool {
    match row.facets.len() {
        0 => false,
        2 => {
            let [a, b] = [row.facets[0], row.facets[1]];
            if a.tag != b.tag {
                return true;
            }
            let x = mesh.coords_of(v);
            let xa = mesh.coords_of(a.neighbor as usize);
            let xb = mesh.coords_of(b.neighbor as usize);
            let da = [xa[0] - x[0], xa[1] - x[1]];
            let db = [xb[0] - x[0], xb[1] - x[1]];
            let cross = da[0] * db[1] - da[1] * db[0];
            let dot = da[0] * db[0] + da[1] * db[1];
            let scale = (da[0] * da[0] + da[1] * da[1]).sqrt()
                * (db[0] * db[0] + db[1] * db[1]).sqrt();
            // The two facets must run in opposite directions along a line.
            cross.abs() > COLLINEAR_TOL * scale || dot >= 0.0
        }
        // Patch endpoints and non-manifold junctions never move.
        _ => true,
    }
}

/// Boundary facets of one element, as `(u, v, tag)` triples.
pub fn element_facets(mesh: &Mesh2, e: usize) -> Vec<(usize, usize, i32)> {
    let mut out = Vec::new();
    if !mesh.element_live(e) {
        return out;
    }
    let n = mesh.element_raw(e);
    let tags = mesh.boundary_tags(e);
    for i in 0..NLOC {
        if tags[i] > 0 {
            out.push((
                n[(i + 1) % NLOC] as usize,
                n[(i + 2) % NLOC] as usize,
                tags[i],
            ));
        }
    }
    out
}
