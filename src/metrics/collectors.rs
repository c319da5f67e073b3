//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`super::init_metrics`] has run, so library
//! users that never export metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, WORKER_MEMORY_BYTES, WORKER_UPTIME,
};

/// Outcome label for a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Processed,
    Released,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Processed => "processed",
            JobOutcome::Released => "released",
            JobOutcome::Failed => "failed",
        }
    }
}

/// Metrics collector for recording job-forge operational metrics.
///
/// ```ignore
/// use job_forge::metrics::{init_metrics, JobOutcome, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job("emails", JobOutcome::Processed, Duration::from_millis(120));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished job and its run time.
    pub fn record_job(&self, queue: &str, outcome: JobOutcome, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            queue = queue,
            status = outcome.as_str(),
            duration_secs = duration.as_secs_f64(),
            "Recorded job metric"
        );
    }

    pub fn set_jobs_in_progress(&self, count: usize) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.set(count as f64);
        }
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.with_label_values(&[queue]).set(depth as f64);
        }
    }

    /// Record the worker's health snapshot.
    pub fn record_worker_health(&self, memory_bytes: u64, uptime: Duration) {
        if let Some(gauge) = WORKER_MEMORY_BYTES.get() {
            gauge.set(memory_bytes as f64);
        }

        if let Some(gauge) = WORKER_UPTIME.get() {
            gauge.set(uptime.as_secs_f64());
        }
    }
}
