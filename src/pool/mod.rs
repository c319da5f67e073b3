//! Process-isolated task pool.
//!
//! Every [`Task`] runs in its own operating-system process created by a
//! [`Runtime`]. The controlling process only writes the task envelope, waits
//! for the child to exit and parses the result envelope:
//!
//! ```text
//!   Pool::add ──► pending (FIFO)
//!                    │  Pool::run (while running < concurrency)
//!                    ▼
//!   Runtime::spawn ──► Process ──stdin──►  job-forge exec
//!                        ▲                      │
//!                        └──────stdout──────────┘ {"success":..,"result":..}
//!                    │  Pool::wait (completion order)
//!                    ▼
//!          when_task_succeeded / when_task_failed
//! ```
//!
//! The pool is independent of the queue: it can be used standalone with any
//! worker program that speaks the envelope protocol.

pub mod envelope;
pub mod executor;
pub mod process;
pub mod runtime;
pub mod status;
pub mod task;

pub use envelope::{ResultEnvelope, TaskEnvelope, TaskError};
pub use executor::Pool;
pub use process::Process;
pub use runtime::{PipeRuntime, ReexecRuntime, Runtime, RuntimeKind, SpawnedProcess, EXEC_ARG};
pub use status::PoolStatus;
pub use task::{Task, TaskFailure, TaskSuccess};
