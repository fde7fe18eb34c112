use mesh_adapt::prelude::*;
use mesh_adapt::mesh_generation::{structured_square, structured_square_with_metric};

/// A smoothly varying metric close to the mesh's current sizing, so the
/// refine/coarsen band is almost satisfied from the start.
fn gentle_metric(x: [f64; 2]) -> MetricTensor {
    let h = 0.12 * (1.0 + 0.125 * (std::f64::consts::TAU * x[0]).sin());
    MetricTensor::uniform(h)
}

#[test]
fn round_trip_keeps_vertex_count_in_band() {
    let mut mesh = structured_square_with_metric(10, 1.0, gentle_metric).unwrap();
    let nodes_before = mesh.live_vertex_count() as f64;
    let qrms_before = mesh.get_qrms();

    let l_max = 2f64.sqrt();
    while Refine::new(&mut mesh).refine(l_max).unwrap() > 0 {}
    Coarsen::new(&mut mesh).coarsen(0.5 * l_max, l_max).unwrap();

    let nodes_after = mesh.live_vertex_count() as f64;
    assert!(
        (nodes_after - nodes_before).abs() <= 0.1 * nodes_before,
        "vertex count drifted: {nodes_before} -> {nodes_after}"
    );
    assert!(mesh.get_qrms() <= qrms_before + 1e-9);
    mesh.debug_assert_invariants();
}

#[test]
fn full_cycle_reaches_the_band_and_verifies() {
    // Strong sizing gradient: fine along a band in the middle.
    let metric = |x: [f64; 2]| {
        let d = (x[1] - 0.5).abs();
        let h = 0.03 + 0.3 * d;
        MetricTensor::uniform(h)
    };
    let mut mesh = structured_square_with_metric(8, 1.0, metric).unwrap();
    let params = AdaptParams {
        n_workers: Some(4),
        ..AdaptParams::default()
    };
    let report = adapt(&mut mesh, &params).unwrap();

    assert!(report.splits > 0);
    assert!(report.live_vertices > 81);
    assert_eq!(report.live_vertices, mesh.live_vertex_count());
    assert_eq!(report.live_elements, mesh.live_element_count());
    assert!(mesh.verify().is_ok());

    // Storage was compacted by the driver's defragmentation.
    assert_eq!(mesh.n_nodes(), mesh.live_vertex_count());
}

#[test]
fn adapt_is_stable_on_a_matched_mesh() {
    let mut mesh = structured_square(6, 1.0, 0.18).unwrap();
    let report = adapt(&mut mesh, &AdaptParams::default()).unwrap();
    assert_eq!(report.splits, 0);
    assert_eq!(report.collapses, 0);
    assert_eq!(mesh.live_vertex_count(), 49);
    mesh.debug_assert_invariants();
}

#[test]
fn defragment_maps_follow_the_survivors() {
    let mut mesh = structured_square(5, 1.0, 0.9).unwrap();
    Coarsen::new(&mut mesh).coarsen(0.8, 2.5).unwrap();

    let live: Vec<usize> = (0..mesh.n_nodes()).filter(|&v| mesh.vertex_live(v)).collect();
    let coords_before: Vec<[f64; 2]> = live.iter().map(|&v| mesh.coords_of(v)).collect();

    let mut map = Vec::new();
    mesh.defragment(&mut map);
    for (k, &old) in live.iter().enumerate() {
        let new = map[old];
        assert!(new >= 0);
        assert_eq!(mesh.coords_of(new as usize), coords_before[k]);
    }
    mesh.debug_assert_invariants();
}
