//! Error types for job-forge operations.
//!
//! Defines the error types for each subsystem:
//! - Process pool (spawning, timeouts, wire envelopes, capacity)
//! - Queue drivers and the connection manager
//! - Configuration loading and validation
//! - The queue worker daemon
//!
//! Per-task failures are not errors at this level: they travel as
//! [`crate::pool::TaskError`] values inside result envelopes and are
//! routed to the pool's failure callback.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the process pool to its caller.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The worker process could not be created.
    #[error("Failed to spawn worker process '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// A process did not finish before its deadline and was killed.
    #[error("Process {pid} timed out after {timeout:?}")]
    Timeout { pid: u32, timeout: Duration },

    /// An envelope could not be encoded or the child's output was malformed.
    #[error("Malformed task envelope: {0}")]
    Serialization(String),

    /// A process was requested while the pool was already at capacity.
    #[error("Pool overflow: concurrency limit of {limit} reached")]
    Overflow { limit: usize },

    /// Channel I/O with a child process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Serialization(err.to_string())
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the backing store.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to (de)serialize a job record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No connection with this name is configured.
    #[error("Queue connection '{0}' is not configured")]
    UnknownConnection(String),

    /// No factory is registered for the connection's driver kind.
    #[error("No driver factory registered for '{0}'")]
    UnsupportedDriver(String),

    /// A queue name that cannot be mapped to storage.
    #[error("Invalid queue name '{0}'")]
    InvalidQueueName(String),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or option has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for the expected schema.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that stop the queue worker daemon.
///
/// Individual job failures never surface here; they are turned into
/// release-or-fail decisions inside the loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The queue connection could not be resolved.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The pool failed outside of per-task execution.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Worker processes could not be spawned repeatedly; the entrypoint is
    /// most likely misconfigured.
    #[error("Giving up after {attempts} consecutive spawn failures: {last}")]
    Spawn { attempts: u32, last: String },

    /// Worker processes do not serve every job type the worker was given.
    #[error("Worker processes have no handler for job types: {}", missing.join(", "))]
    MissingHandlers { missing: Vec<String> },

    /// A worker process could not report the job types it serves.
    #[error("Worker handler check failed: {0}")]
    HandlerCheck(String),
}
