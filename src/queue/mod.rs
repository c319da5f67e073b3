//! Durable job queues and the worker daemon that drains them.
//!
//! # Architecture
//!
//! ```text
//! QueueWorker ──► QueueManager ──► QueueDriver (file | redis)
//!     │                                 │ pop
//!     │◄──────────── Job ───────────────┘
//!     ▼
//!   Pool ──► worker process ──► HandlerResolver ──► JobHandler
//!     │
//!     └─ outcome ──► delete | release (backoff) | fail
//! ```
//!
//! A failed job is retried until it runs out of attempts, so a handler may
//! see the same job more than once. Both drivers remove a job from storage
//! when it is popped; a daemon killed before settling a batch loses it.

pub mod clock;
pub mod config;
pub mod driver;
pub mod events;
pub mod file;
pub mod handler;
pub mod health;
pub mod job;
mod lock;
pub mod manager;
pub mod redis;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConnectionConfig, DriverKind, QueueConfig, WorkerConfig, DEFAULT_QUEUE};
pub use driver::QueueDriver;
pub use events::{EventDispatcher, EventLog, FanOut, JobEvent, TracingEvents};
pub use file::FileDriver;
pub use handler::{
    register_job_task, run_job, HandlerRegistry, HandlerResolver, JobHandler, JobTaskArgs,
    JOB_TASK,
};
pub use health::{HealthLimit, HealthMonitor, HealthReport, MemoryProbe, SysinfoProbe};
pub use job::{FailedJob, Job, JobRecord};
pub use manager::{DriverFactory, FileDriverFactory, QueueManager, RedisDriverFactory};
pub use self::redis::RedisDriver;
pub use worker::{JobDisposition, QueueWorker, StopReason, WorkerState};
