pub mod command;
pub mod gpu;

pub use gpu::{GpuMetrics, GpuSpec};
