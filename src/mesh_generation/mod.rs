//! Structured mesh generators with boundary labeling.
//!
//! Small deterministic triangulations used by tests, benches and examples.
//! Sides of the square carry the tags bottom = 1, right = 2, top = 3,
//! left = 4, so corner detection and boundary preservation are exercised
//! out of the box.

use crate::geometry::MetricTensor;
use crate::mesh::Mesh2;
use crate::mesh_error::AdaptError;

/// Boundary tag of the `y = 0` side.
pub const TAG_BOTTOM: i32 = 1;
/// Boundary tag of the `x = side` side.
pub const TAG_RIGHT: i32 = 2;
/// Boundary tag of the `y = side` side.
pub const TAG_TOP: i32 = 3;
/// Boundary tag of the `x = 0` side.
pub const TAG_LEFT: i32 = 4;

/// Structured triangulation of `[0, side]^2` with `n x n` cells, each split
/// along its lower-left to upper-right diagonal, and a uniform metric with
/// target edge length `h`.
pub fn structured_square(n: usize, side: f64, h: f64) -> Result<Mesh2, AdaptError> {
    structured_square_with_metric(n, side, |_| MetricTensor::uniform(h))
}

/// Structured triangulation of `[0, side]^2` with a metric field evaluated
/// at each vertex.
pub fn structured_square_with_metric<F>(
    n: usize,
    side: f64,
    metric_at: F,
) -> Result<Mesh2, AdaptError>
where
    F: Fn([f64; 2]) -> MetricTensor,
{
    if n == 0 {
        return Err(AdaptError::InvalidImport(
            "structured square needs at least one cell per side".to_string(),
        ));
    }
    let np = n + 1;
    let dx = side / n as f64;

    let mut coords = Vec::with_capacity(np * np);
    for j in 0..np {
        for i in 0..np {
            coords.push([i as f64 * dx, j as f64 * dx]);
        }
    }
    let metrics: Vec<MetricTensor> = coords.iter().map(|&x| metric_at(x)).collect();

    let vid = |i: usize, j: usize| j * np + i;
    let mut elements = Vec::with_capacity(2 * n * n);
    let mut boundary = Vec::with_capacity(2 * n * n);
    for j in 0..n {
        for i in 0..n {
            let a = vid(i, j);
            let b = vid(i + 1, j);
            let c = vid(i + 1, j + 1);
            let d = vid(i, j + 1);

            // Lower triangle (a, b, c): bottom edge opposite c, right edge
            // opposite a.
            elements.push([a, b, c]);
            boundary.push([
                if i + 1 == n { TAG_RIGHT } else { 0 },
                0,
                if j == 0 { TAG_BOTTOM } else { 0 },
            ]);

            // Upper triangle (a, c, d): top edge opposite a, left edge
            // opposite c.
            elements.push([a, c, d]);
            boundary.push([
                if j + 1 == n { TAG_TOP } else { 0 },
                if i == 0 { TAG_LEFT } else { 0 },
                0,
            ]);
        }
    }

    Mesh2::from_arrays(&coords, &metrics, &elements, &boundary)
}
