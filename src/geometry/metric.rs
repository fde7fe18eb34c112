//! Per-vertex symmetric positive-definite 2x2 metric tensors.
//!
//! A metric defines the local inner product in which edge lengths and
//! element qualities are measured. Only the upper triangle is stored.

/// Symmetric 2x2 tensor `[[m00, m01], [m01, m11]]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricTensor {
    pub m00: f64,
    pub m01: f64,
    pub m11: f64,
}

impl MetricTensor {
    /// Construct from the upper triangle.
    pub fn new(m00: f64, m01: f64, m11: f64) -> Self {
        Self { m00, m01, m11 }
    }

    /// The identity metric: lengths reduce to Euclidean lengths.
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 1.0)
    }

    /// Isotropic metric with target edge length `h` (unit metric length for
    /// Euclidean length `h`).
    pub fn uniform(h: f64) -> Self {
        let m = 1.0 / (h * h);
        Self::new(m, 0.0, m)
    }

    /// Metric with principal target lengths `hx`/`hy` along the axes.
    pub fn axis_aligned(hx: f64, hy: f64) -> Self {
        Self::new(1.0 / (hx * hx), 0.0, 1.0 / (hy * hy))
    }

    /// Determinant of the tensor.
    pub fn det(&self) -> f64 {
        self.m00 * self.m11 - self.m01 * self.m01
    }

    /// True when the tensor is positive-definite (Sylvester's criterion).
    pub fn is_spd(&self) -> bool {
        self.m00 > 0.0 && self.det() > 0.0
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.m00.is_finite() && self.m01.is_finite() && self.m11.is_finite()
    }

    /// True when any component is NaN.
    pub fn has_nan(&self) -> bool {
        self.m00.is_nan() || self.m01.is_nan() || self.m11.is_nan()
    }

    /// Componentwise mean of two tensors.
    pub fn mean(&self, other: &MetricTensor) -> MetricTensor {
        MetricTensor::new(
            0.5 * (self.m00 + other.m00),
            0.5 * (self.m01 + other.m01),
            0.5 * (self.m11 + other.m11),
        )
    }

    /// Componentwise linear interpolation `self + w * (other - self)`.
    pub fn interpolate(&self, other: &MetricTensor, w: f64) -> MetricTensor {
        MetricTensor::new(
            self.m00 + w * (other.m00 - self.m00),
            self.m01 + w * (other.m01 - self.m01),
            self.m11 + w * (other.m11 - self.m11),
        )
    }

    /// Quadratic form `d^T M d` for the displacement `d`.
    pub fn quadratic_form(&self, d: [f64; 2]) -> f64 {
        (d[1] * self.m11 + d[0] * self.m01) * d[1] + (d[1] * self.m01 + d[0] * self.m00) * d[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_spd() {
        assert!(MetricTensor::identity().is_spd());
        assert!(MetricTensor::uniform(0.25).is_spd());
    }

    #[test]
    fn indefinite_tensor_rejected() {
        let m = MetricTensor::new(1.0, 2.0, 1.0);
        assert!(!m.is_spd());
    }

    #[test]
    fn interpolation_endpoints() {
        let a = MetricTensor::uniform(1.0);
        let b = MetricTensor::axis_aligned(0.5, 2.0);
        assert_eq!(a.interpolate(&b, 0.0), a);
        assert_eq!(a.interpolate(&b, 1.0), b);
        let mid = a.interpolate(&b, 0.5);
        assert_eq!(mid, a.mean(&b));
    }

    #[test]
    fn quadratic_form_matches_euclidean_for_identity() {
        let m = MetricTensor::identity();
        let d = [3.0, 4.0];
        assert!((m.quadratic_form(d) - 25.0).abs() < 1e-12);
    }
}
