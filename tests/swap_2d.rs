use mesh_adapt::prelude::*;
use mesh_adapt::mesh_generation::structured_square_with_metric;

/// Two near-degenerate triangles whose shared diagonal is the wrong one.
fn worst_quality_pair() -> Mesh2 {
    let coords = [[0.0, 0.0], [1.0, 0.01], [0.0, 1.0], [1.0, 1.01]];
    let metrics = [MetricTensor::identity(); 4];
    let elements = [[0, 1, 2], [1, 3, 2]];
    let boundary = [[0, 4, 1], [3, 0, 2]];
    Mesh2::from_arrays(&coords, &metrics, &elements, &boundary).unwrap()
}

fn min_quality(mesh: &Mesh2) -> f64 {
    (0..mesh.n_elements())
        .filter(|&e| mesh.element_live(e))
        .map(|e| mesh.element_quality(e).unwrap_or(0.0))
        .fold(f64::INFINITY, f64::min)
}

#[test]
fn swap_flips_the_bad_diagonal() {
    let mut mesh = worst_quality_pair();
    let before = min_quality(&mesh);

    let flips = Swap::new(&mut mesh).swap(0.9).unwrap();
    assert_eq!(flips, 1);

    // The diagonal (1,2) became (0,3) and the worst quality went up.
    assert!(mesh.nn_list(0).contains(&3));
    assert!(!mesh.nn_list(1).contains(&2));
    assert!(min_quality(&mesh) > before);
    mesh.debug_assert_invariants();
}

#[test]
fn swap_preserves_vertex_and_element_counts() {
    let mut mesh = worst_quality_pair();
    let nodes = mesh.live_vertex_count();
    let elements = mesh.live_element_count();
    Swap::new(&mut mesh).swap(0.9).unwrap();
    assert_eq!(mesh.live_vertex_count(), nodes);
    assert_eq!(mesh.live_element_count(), elements);
}

#[test]
fn accepted_swaps_never_lower_the_global_floor() {
    // A metric with principal axes at 45 degrees makes the generator's
    // lower-left/upper-right diagonals the long, wrong choice everywhere.
    let metric = |_x: [f64; 2]| MetricTensor::new(52.0, 48.0, 52.0);
    let mut mesh = structured_square_with_metric(8, 1.0, metric).unwrap();
    let before = min_quality(&mesh);

    let flips = Swap::with_workers(&mut mesh, Some(4)).swap(0.4).unwrap();
    assert!(flips > 0);
    assert!(min_quality(&mesh) >= before - 1e-12);
    mesh.debug_assert_invariants();
}

#[test]
fn swap_terminates_on_an_already_optimal_mesh() {
    let metric = |_x: [f64; 2]| MetricTensor::uniform(0.125);
    let mut mesh = structured_square_with_metric(8, 1.0, metric).unwrap();
    let first = Swap::new(&mut mesh).swap(0.4).unwrap();
    // Whatever the first pass improved, a second pass finds nothing left.
    let second = Swap::new(&mut mesh).swap(0.4).unwrap();
    let _ = first;
    assert_eq!(second, 0);
    mesh.debug_assert_invariants();
}
