pub mod logging;
pub mod metrics;

pub use logging::{redact_connection_string, StructuredLogger};
pub use metrics::{global_metrics, EngineMetrics, MetricsSnapshot};
