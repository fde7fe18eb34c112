//! Property tests: adjacency symmetry, incidence consistency, positive
//! areas and boundary preservation across randomized operator runs.

use proptest::prelude::*;

use mesh_adapt::prelude::*;
use mesh_adapt::mesh_generation::structured_square_with_metric;

/// Euclidean boundary length per tag.
fn boundary_lengths(mesh: &Mesh2) -> Vec<(i32, f64)> {
    let mut acc: std::collections::BTreeMap<i32, f64> = std::collections::BTreeMap::new();
    for e in 0..mesh.n_elements() {
        if let Some(n) = mesh.element(e) {
            let tags = mesh.boundary_tags(e);
            for i in 0..3 {
                if tags[i] > 0 {
                    let xu = mesh.coords_of(n[(i + 1) % 3]);
                    let xv = mesh.coords_of(n[(i + 2) % 3]);
                    let len = ((xu[0] - xv[0]).powi(2) + (xu[1] - xv[1]).powi(2)).sqrt();
                    *acc.entry(tags[i]).or_insert(0.0) += len;
                }
            }
        }
    }
    acc.into_iter().collect()
}

fn rotated_metric(h1: f64, h2: f64, theta: f64) -> MetricTensor {
    let (l1, l2) = (1.0 / (h1 * h1), 1.0 / (h2 * h2));
    let (c, s) = (theta.cos(), theta.sin());
    MetricTensor::new(
        l1 * c * c + l2 * s * s,
        (l1 - l2) * c * s,
        l1 * s * s + l2 * c * c,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn adaptation_preserves_mesh_invariants(
        n in 2usize..6,
        h1 in 0.08f64..0.5,
        h2 in 0.08f64..0.5,
        theta in 0.0f64..std::f64::consts::PI,
        workers in 1usize..4,
    ) {
        let metric = |_x: [f64; 2]| rotated_metric(h1, h2, theta);
        let mut mesh = structured_square_with_metric(n, 1.0, metric).unwrap();
        let tags_before = boundary_lengths(&mesh);
        let nodes_before = mesh.live_vertex_count();

        let params = AdaptParams {
            n_workers: Some(workers),
            ..AdaptParams::default()
        };
        let report = adapt(&mut mesh, &params).unwrap();

        // I1-I4 hold after the full cycle.
        prop_assert!(mesh.verify().is_ok());

        // Vertex-count monotonicity per operator, reflected in the totals.
        let nodes_after = mesh.live_vertex_count();
        prop_assert_eq!(
            nodes_after,
            nodes_before + report.splits - report.collapses
        );

        // Straight boundary patches keep their total length per tag.
        let tags_after = boundary_lengths(&mesh);
        prop_assert_eq!(tags_before.len(), tags_after.len());
        for ((tag_a, len_a), (tag_b, len_b)) in tags_before.iter().zip(&tags_after) {
            prop_assert_eq!(tag_a, tag_b);
            prop_assert!((len_a - len_b).abs() < 1e-9);
        }
    }

    #[test]
    fn refinement_alone_is_monotone_and_bounded(
        n in 2usize..5,
        h in 0.07f64..0.3,
    ) {
        let metric = move |_x: [f64; 2]| MetricTensor::uniform(h);
        let mut mesh = structured_square_with_metric(n, 1.0, metric).unwrap();
        let l_max = 2f64.sqrt();
        let mut last = mesh.live_vertex_count();
        for _ in 0..12 {
            let splits = Refine::new(&mut mesh).refine(l_max).unwrap();
            prop_assert!(mesh.live_vertex_count() >= last);
            last = mesh.live_vertex_count();
            if splits == 0 {
                break;
            }
        }
        for u in 0..mesh.n_nodes() {
            for &v in mesh.nn_list(u) {
                if (u as i32) < v {
                    prop_assert!(mesh.calc_edge_length(u, v as usize) <= l_max * (1.0 + 1e-9));
                }
            }
        }
        prop_assert!(mesh.verify().is_ok());
    }
}
