//! Prometheus metrics and structured logging for the Bitvavo client.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::{Metrics, MetricsPublisher};
