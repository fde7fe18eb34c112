//! Greedy vertex coloring and independent-set selection.
//!
//! A proper coloring of the vertex-vertex graph yields color classes whose
//! members share no edge; the largest class restricted to the still-active
//! vertices is the maximal independent set a driver can process in one
//! conflict-free sweep.

use crate::mesh::Mesh2;

/// Greedy coloring of the live vertices.
///
/// Vertices are visited in global-id order (the deterministic tie-break used
/// throughout the operators) and each receives the smallest color unused by
/// its neighbors. Dead vertices get `-1`. At most `max-degree + 1` colors
/// are produced.
pub fn greedy(mesh: &Mesh2) -> Vec<i32> {
    let n_nodes = mesh.n_nodes();
    let mut order: Vec<usize> = (0..n_nodes).filter(|&v| mesh.vertex_live(v)).collect();
    order.sort_by_key(|&v| (mesh.gnn(v), v));

    let mut colors = vec![-1i32; n_nodes];
    let mut used = Vec::new();
    for &v in &order {
        used.clear();
        for &n in mesh.nn_list(v) {
            let c = colors[n as usize];
            if c >= 0 {
                used.push(c);
            }
        }
        used.sort_unstable();
        let mut color = 0i32;
        for &c in &used {
            if c == color {
                color += 1;
            } else if c > color {
                break;
            }
        }
        colors[v] = color;
    }
    colors
}

/// Select the largest color class among the active vertices.
///
/// Returns a bitmap of the chosen independent set; every selected vertex is
/// active and no two selected vertices are adjacent.
pub fn largest_active_class(colors: &[i32], active: &[bool]) -> Vec<bool> {
    debug_assert_eq!(colors.len(), active.len());
    let max_color = colors.iter().copied().max().unwrap_or(-1);
    if max_color < 0 {
        return vec![false; colors.len()];
    }
    let mut counts = vec![0usize; (max_color + 1) as usize];
    for (v, &c) in colors.iter().enumerate() {
        if c >= 0 && active[v] {
            counts[c as usize] += 1;
        }
    }
    let best = counts
        .iter()
        .enumerate()
        .max_by_key(|&(c, &n)| (n, std::cmp::Reverse(c)))
        .map(|(c, _)| c as i32)
        .unwrap_or(0);
    colors
        .iter()
        .enumerate()
        .map(|(v, &c)| c == best && active[v])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh_generation::structured_square;

    #[test]
    fn coloring_is_proper() {
        let mesh = structured_square(6, 1.0, 0.25).unwrap();
        let colors = greedy(&mesh);
        for v in 0..mesh.n_nodes() {
            assert!(colors[v] >= 0);
            for &n in mesh.nn_list(v) {
                assert_ne!(colors[v], colors[n as usize], "edge ({v},{n}) shares a color");
            }
        }
    }

    #[test]
    fn independent_set_is_independent_and_active() {
        let mesh = structured_square(5, 1.0, 0.25).unwrap();
        let colors = greedy(&mesh);
        // Freeze an arbitrary stripe of vertices.
        let active: Vec<bool> = (0..mesh.n_nodes()).map(|v| v % 3 != 0).collect();
        let set = largest_active_class(&colors, &active);
        assert!(set.iter().any(|&s| s));
        for v in 0..mesh.n_nodes() {
            if !set[v] {
                continue;
            }
            assert!(active[v]);
            for &n in mesh.nn_list(v) {
                assert!(!set[n as usize]);
            }
        }
    }
}
