//! Worker self-monitoring: memory pressure, runtime ceiling and periodic
//! health reports.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::info;

use super::config::WorkerConfig;
use crate::metrics::MetricsCollector;

/// Reports the worker's current memory use.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory in bytes.
    fn used_bytes(&self) -> u64;
}

/// Resident memory of the current process, via `sysinfo`.
pub struct SysinfoProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );
        Self {
            pid,
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn used_bytes(&self) -> u64 {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// The limit that made the worker stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthLimit {
    Memory { used: u64, limit: u64 },
    Runtime { elapsed: Duration, limit: Duration },
}

impl fmt::Display for HealthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthLimit::Memory { used, limit } => {
                write!(f, "memory {} of {} bytes", used, limit)
            }
            HealthLimit::Runtime { elapsed, limit } => {
                write!(f, "runtime {:?} over {:?}", elapsed, limit)
            }
        }
    }
}

/// Snapshot logged on every health report.
#[derive(Debug, Clone, Copy)]
pub struct HealthReport {
    pub memory_bytes: u64,
    pub memory_ratio: f64,
    pub uptime: Duration,
    pub processed: u64,
    pub failed: u64,
}

/// Tracks the worker's resource use against its configured ceilings.
pub struct HealthMonitor {
    started: Instant,
    last_report: Instant,
    report_interval: Duration,
    memory_limit: u64,
    memory_threshold: f64,
    maintenance_threshold: f64,
    max_runtime: Duration,
    probe: Box<dyn MemoryProbe>,
    metrics: MetricsCollector,
}

impl HealthMonitor {
    pub fn new(config: &WorkerConfig) -> Self {
        Self::with_probe(config, Box::new(SysinfoProbe::new()))
    }

    pub fn with_probe(config: &WorkerConfig, probe: Box<dyn MemoryProbe>) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_report: now,
            report_interval: config.report_interval,
            memory_limit: config.memory_limit_bytes(),
            memory_threshold: config.memory_threshold,
            maintenance_threshold: config.maintenance_threshold,
            max_runtime: config.max_runtime,
            probe,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn memory_used(&self) -> u64 {
        self.probe.used_bytes()
    }

    /// Used memory as a fraction of the ceiling.
    pub fn memory_ratio(&self) -> f64 {
        if self.memory_limit == 0 {
            return 0.0;
        }
        self.memory_used() as f64 / self.memory_limit as f64
    }

    /// The limit the worker has crossed, if any.
    pub fn should_quit_due_to_health(&self) -> Option<HealthLimit> {
        let used = self.memory_used();
        if self.memory_limit > 0 && used as f64 > self.memory_threshold * self.memory_limit as f64
        {
            return Some(HealthLimit::Memory {
                used,
                limit: self.memory_limit,
            });
        }

        let elapsed = self.uptime();
        if elapsed > self.max_runtime {
            return Some(HealthLimit::Runtime {
                elapsed,
                limit: self.max_runtime,
            });
        }

        None
    }

    /// Whether memory pressure warrants dropping caches.
    pub fn needs_maintenance(&self) -> bool {
        self.memory_ratio() > self.maintenance_threshold
    }

    /// Logs and records a health report once per interval.
    pub fn maybe_report(&mut self, processed: u64, failed: u64) -> Option<HealthReport> {
        if self.last_report.elapsed() < self.report_interval {
            return None;
        }
        self.last_report = Instant::now();
        Some(self.report(processed, failed))
    }

    /// Logs and records a health report now.
    pub fn report(&self, processed: u64, failed: u64) -> HealthReport {
        let memory_bytes = self.memory_used();
        let report = HealthReport {
            memory_bytes,
            memory_ratio: if self.memory_limit == 0 {
                0.0
            } else {
                memory_bytes as f64 / self.memory_limit as f64
            },
            uptime: self.uptime(),
            processed,
            failed,
        };

        self.metrics
            .record_worker_health(report.memory_bytes, report.uptime);
        info!(
            memory_bytes = report.memory_bytes,
            memory_ratio = report.memory_ratio,
            uptime_secs = report.uptime.as_secs(),
            processed = report.processed,
            failed = report.failed,
            "Worker health"
        );

        report
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("uptime", &self.uptime())
            .field("memory_limit", &self.memory_limit)
            .field("max_runtime", &self.max_runtime)
            .finish()
    }
}
