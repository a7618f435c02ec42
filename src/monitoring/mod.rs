pub mod metrics;

pub use metrics::{HealthcheckMetrics, RunTimer};
