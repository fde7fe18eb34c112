use mesh_adapt::prelude::*;
use mesh_adapt::mesh_generation::{structured_square, structured_square_with_metric};

/// The side-2 square split along its main diagonal.
fn square_side_two() -> Mesh2 {
    let coords = [[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]];
    let metrics = [MetricTensor::identity(); 4];
    let elements = [[0, 1, 2], [0, 2, 3]];
    let boundary = [[2, 0, 1], [3, 4, 0]];
    Mesh2::from_arrays(&coords, &metrics, &elements, &boundary).unwrap()
}

fn max_edge_length(mesh: &Mesh2) -> f64 {
    let mut max = 0.0f64;
    for u in 0..mesh.n_nodes() {
        for &v in mesh.nn_list(u) {
            if (u as i32) < v {
                max = max.max(mesh.calc_edge_length(u, v as usize));
            }
        }
    }
    max
}

fn refine_to_fixed_point(mesh: &mut Mesh2, l_max: f64) -> usize {
    let mut total = 0;
    loop {
        let splits = Refine::new(mesh).refine(l_max).unwrap();
        total += splits;
        if splits == 0 {
            return total;
        }
    }
}

#[test]
fn long_diagonal_is_bisected() {
    let mut mesh = square_side_two();
    let splits = Refine::new(&mut mesh).refine(2.0).unwrap();
    assert_eq!(splits, 1);
    assert_eq!(mesh.live_vertex_count(), 5);
    assert_eq!(mesh.live_element_count(), 4);
    assert!(max_edge_length(&mesh) <= 2.0 + 1e-12);
    mesh.debug_assert_invariants();

    // One more sweep confirms the fixed point.
    assert_eq!(Refine::new(&mut mesh).refine(2.0).unwrap(), 0);
}

#[test]
fn refine_is_idempotent_on_a_satisfied_mesh() {
    // All edges already within the bound: zero changes.
    let mut mesh = structured_square(4, 1.0, 0.25).unwrap();
    let nodes = mesh.live_vertex_count();
    let elements = mesh.live_element_count();
    assert_eq!(Refine::new(&mut mesh).refine(2f64.sqrt()).unwrap(), 0);
    assert_eq!(mesh.live_vertex_count(), nodes);
    assert_eq!(mesh.live_element_count(), elements);
}

#[test]
fn vertex_count_never_decreases() {
    let mut mesh = structured_square(3, 1.0, 0.11).unwrap();
    let mut last = mesh.live_vertex_count();
    for _ in 0..6 {
        let splits = Refine::new(&mut mesh).refine(2f64.sqrt()).unwrap();
        let now = mesh.live_vertex_count();
        assert!(now >= last);
        last = now;
        if splits == 0 {
            break;
        }
    }
    mesh.debug_assert_invariants();
}

/// The sinusoidal front function driving the anisotropic scenario.
fn psi_metric(x: [f64; 2]) -> MetricTensor {
    let (xs, ys) = (2.0 * x[0] - 1.0, 2.0 * x[1] - 1.0);
    let u = 2.0 * xs - (5.0 * ys).sin();
    let denom = 0.01 + u * u;

    // Analytic Hessian of
    //   psi = 0.1 sin(50 xs) + atan2(-0.1, 2 xs - sin(5 ys)).
    let pxx = -250.0 * (50.0 * xs).sin() - 0.8 * u / (denom * denom);
    let pxy = 2.0 * u * (5.0 * ys).cos() / (denom * denom);
    let pyy = 2.5 * (5.0 * ys).sin() / denom
        - 5.0 * u * (5.0 * ys).cos().powi(2) / (denom * denom);
    // Chain rule for the [0,1] -> [-1,1] stretch.
    let (hxx, hxy, hyy) = (4.0 * pxx, 4.0 * pxy, 4.0 * pyy);

    // Absolute-eigenvalue rescaling, clamped so the target sizing stays
    // reachable within a handful of sweeps.
    let eta = 2.0e-3;
    let tr = 0.5 * (hxx + hyy);
    let det = hxx * hyy - hxy * hxy;
    let disc = (tr * tr - det).max(0.0).sqrt();
    let (l1, l2) = (tr + disc, tr - disc);
    let clamp = |l: f64| (l.abs() / eta).clamp(1.0, 4.0e4);
    let (a1, a2) = (clamp(l1), clamp(l2));

    // Eigenvectors of the symmetric Hessian.
    let (c, s) = if hxy.abs() > 1e-30 {
        let theta = 0.5 * (2.0 * hxy).atan2(hxx - hyy);
        (theta.cos(), theta.sin())
    } else {
        (1.0, 0.0)
    };
    MetricTensor::new(
        a1 * c * c + a2 * s * s,
        (a1 - a2) * c * s,
        a1 * s * s + a2 * c * c,
    )
}

#[test]
fn anisotropic_front_is_resolved() {
    let mut mesh = structured_square_with_metric(10, 1.0, psi_metric).unwrap();
    let nodes_before = mesh.live_vertex_count();
    let lrms_before = mesh.get_lrms();

    let l_max = 2f64.sqrt();
    for _ in 0..5 {
        if Refine::new(&mut mesh).refine(l_max).unwrap() == 0 {
            break;
        }
    }
    refine_to_fixed_point(&mut mesh, l_max);

    assert!(mesh.live_vertex_count() > nodes_before);
    assert!(max_edge_length(&mesh) <= l_max * (1.0 + 1e-9));
    assert!(mesh.get_lrms() < lrms_before);
    assert!(mesh.verify().is_ok());
}
