//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by job-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{Encoder, Gauge, GaugeVec, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all job-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished jobs, labeled by queue and outcome
/// (`processed`, `released`, `failed`).
pub static JOBS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Job run time in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of ready jobs, labeled by queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently running in worker processes.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Resident memory of the worker daemon in bytes.
pub static WORKER_MEMORY_BYTES: OnceLock<Gauge> = OnceLock::new();

/// Seconds since the worker daemon started.
pub static WORKER_UPTIME: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = IntCounterVec::new(
        Opts::new("job_forge_jobs_total", "Total number of finished jobs"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "job_forge_job_duration_seconds",
            "Job run time in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["queue"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("job_forge_queue_depth", "Number of ready jobs in queue"),
        &["queue"],
    )?;

    let jobs_in_progress = Gauge::new(
        "job_forge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Worker metrics
    let worker_memory = Gauge::new(
        "job_forge_worker_memory_bytes",
        "Resident memory of the worker daemon",
    )?;

    let worker_uptime = Gauge::new(
        "job_forge_worker_uptime_seconds",
        "Seconds since the worker daemon started",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(worker_memory.clone()))?;
    registry.register(Box::new(worker_uptime.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = WORKER_MEMORY_BYTES.set(worker_memory);
    let _ = WORKER_UPTIME.set(worker_uptime);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
