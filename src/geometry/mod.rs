//! Geometry kernel: metric tensors, signed areas and the Lipnikov quality
//! functional used by the adaptation operators.

pub mod metric;
pub mod quality;

pub use metric::MetricTensor;
pub use quality::ElementGeometry;
