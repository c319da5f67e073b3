//! Prometheus metrics for the queue worker.
//!
//! # Example
//!
//! ```ignore
//! use job_forge::metrics::{init_metrics, export_metrics, JobOutcome, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("default", JobOutcome::Processed, elapsed);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, REGISTRY, WORKER_MEMORY_BYTES,
    WORKER_UPTIME,
};
