//! Source statistics

pub mod metrics;

pub use metrics::{SourceMetrics, SourceStats};
