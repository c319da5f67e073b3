//! job-forge: process-isolated task pool and durable job queue worker.
//!
//! This library provides a pool that runs tasks in separate worker
//! processes, file and redis backed job queues, and a worker daemon that
//! drains those queues through the pool.

// Core modules
pub mod cli;
pub mod entrypoint;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod queue;

// Re-export commonly used error types
pub use error::{ConfigError, PoolError, QueueError, WorkerError};
