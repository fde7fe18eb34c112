//! Mesh invariant verification.
//!
//! Checks the global invariants the operators must restore after every
//! pass: element liveness/orientation (I1), edge-element incidence counts
//! (I2), adjacency symmetry and consistency (I3) and boundary-edge
//! uniqueness (I4), plus metric health. A failure here is a programmer
//! error in the operators, never a runtime input error.

use crate::debug_invariants::DebugInvariants;
use crate::mesh::{contains_sorted, Mesh2, NLOC};
use crate::mesh_error::{AdaptError, InvariantViolation};

impl Mesh2 {
    /// Check invariants I1-I4, aggregating every failure found.
    pub fn verify(&self) -> Result<(), Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        let n_nodes = self.n_nodes();
        let n_elements = self.n_elements();

        // I1: live elements reference three distinct live vertices and have
        // positive area.
        for e in 0..n_elements {
            if !self.element_live(e) {
                continue;
            }
            let n = self.element_raw(e);
            let mut degenerate = false;
            for i in 0..NLOC {
                let v = n[i];
                if v < 0 || v as usize >= n_nodes || !self.vertex_live(v as usize) {
                    violations.push(InvariantViolation::DeadVertexInElement {
                        element: e,
                        vertex: v.max(0) as usize,
                    });
                    degenerate = true;
                }
                if n[i] == n[(i + 1) % NLOC] {
                    violations.push(InvariantViolation::DuplicateVertexInElement {
                        element: e,
                        vertex: v.max(0) as usize,
                    });
                    degenerate = true;
                }
            }
            if !degenerate && self.element_area(e) <= 0.0 {
                violations.push(InvariantViolation::InvertedElement { element: e });
            }
        }

        // I3: NNList symmetry, NEList consistency in both directions.
        for u in 0..n_nodes {
            for &v in self.nn_list(u) {
                if v < 0 || v as usize >= n_nodes || !contains_sorted(self.nn_list(v as usize), u as i32)
                {
                    violations.push(InvariantViolation::AsymmetricAdjacency {
                        u,
                        v: v.max(0) as usize,
                    });
                }
            }
            for &e in self.ne_list(u) {
                let e = e as usize;
                if e >= n_elements
                    || !self.element_live(e)
                    || !self.element_raw(e).contains(&(u as i32))
                {
                    violations.push(InvariantViolation::StaleIncidence { vertex: u, element: e });
                }
            }
        }
        for e in 0..n_elements {
            if !self.element_live(e) {
                continue;
            }
            for &v in &self.element_raw(e) {
                if v >= 0
                    && (v as usize) < n_nodes
                    && !contains_sorted(self.ne_list(v as usize), e as i32)
                {
                    violations.push(InvariantViolation::MissingIncidence {
                        vertex: v as usize,
                        element: e,
                    });
                }
            }
        }

        // I2: every live edge is shared by one (boundary) or two (interior)
        // elements.
        for u in 0..n_nodes {
            for &v in self.nn_list(u) {
                if v < 0 || (u as i32) >= v {
                    continue;
                }
                let count = self.common_elements(u, v as usize).len();
                if count != 1 && count != 2 {
                    violations.push(InvariantViolation::BadEdgeElementCount {
                        u,
                        v: v as usize,
                        count,
                    });
                }
            }
        }

        // I4: a tagged boundary edge belongs to exactly one element.
        for e in 0..n_elements {
            if !self.element_live(e) {
                continue;
            }
            let n = self.element_raw(e);
            let tags = self.boundary_tags(e);
            for i in 0..NLOC {
                if tags[i] <= 0 {
                    continue;
                }
                let u = n[(i + 1) % NLOC];
                let v = n[(i + 2) % NLOC];
                if u < 0 || v < 0 {
                    continue;
                }
                let count = self.common_elements(u as usize, v as usize).len();
                if count != 1 {
                    violations.push(InvariantViolation::SharedBoundaryEdge {
                        u: u.min(v) as usize,
                        v: u.max(v) as usize,
                        count,
                    });
                }
            }
        }

        // Metric health on live vertices.
        for v in 0..n_nodes {
            if self.vertex_live(v) {
                let m = self.metric_of(v);
                if !m.is_finite() || !m.is_spd() {
                    violations.push(InvariantViolation::DegenerateMetric { vertex: v });
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

impl DebugInvariants for Mesh2 {
    fn validate_invariants(&self) -> Result<(), AdaptError> {
        self.verify().map_err(AdaptError::Invariant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::tests::two_triangle_square;

    #[test]
    fn clean_mesh_verifies() {
        let mesh = two_triangle_square();
        assert!(mesh.verify().is_ok());
        mesh.debug_assert_invariants();
    }

    #[test]
    fn broken_symmetry_detected() {
        let mut mesh = two_triangle_square();
        mesh.nnlist[0].retain(|&v| v != 3);
        let violations = mesh.verify().unwrap_err();
        assert!(violations
            .iter()
            .any(|v| matches!(v, InvariantViolation::AsymmetricAdjacency { u: 3, v: 0 })));
    }

    #[test]
    fn stale_incidence_detected() {
        let mut mesh = two_triangle_square();
        mesh.enlist[0] = -1; // tombstone without fixing NEList
        let violations = mesh.verify().unwrap_err();
        assert!(violations
            .iter()
            .any(|v| matches!(v, InvariantViolation::StaleIncidence { .. })));
    }
}
