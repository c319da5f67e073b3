//! Worker-process side of the pool protocol.
//!
//! A worker reads one line-terminated [`TaskEnvelope`] from its input, runs
//! the named task from a [`TaskRegistry`], writes exactly one
//! [`ResultEnvelope`] and exits with `0` or `1`. The `job-forge exec`
//! subcommand is such a worker; applications that register their own tasks
//! call [`run_stdio`] from their own binary instead.

pub mod builtins;
pub mod registry;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error};

pub use registry::{TaskRegistry, PANIC_CODE, UNKNOWN_TASK_CODE};

use crate::pool::envelope::RECORD_SEPARATOR;
use crate::pool::{ResultEnvelope, TaskEnvelope, TaskError};
use crate::queue::{register_job_task, HandlerRegistry};

/// Error code reported when the input envelope cannot be read or parsed.
pub const MALFORMED_ENVELOPE_CODE: i32 = 400;

/// Serves one task: reads an envelope from `input`, writes the result to
/// `output` and returns the process exit code.
pub async fn serve<R, W>(registry: &TaskRegistry, input: R, mut output: W) -> i32
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = match read_envelope(input).await {
        Ok(envelope) => {
            debug!(task = %envelope.task, "Executing task");
            registry.call(&envelope.task, envelope.args).await
        }
        Err(error) => Err(error),
    };

    let envelope = match result {
        Ok(value) => ResultEnvelope::ok(value),
        Err(error) => ResultEnvelope::err(error),
    };

    let bytes = match envelope.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to encode result envelope");
            return 1;
        }
    };

    if let Err(e) = write_all(&mut output, &bytes).await {
        error!(error = %e, "Failed to write result envelope");
        return 1;
    }

    envelope.exit_code()
}

/// Serves one task over the process's own stdin/stdout.
pub async fn run_stdio(registry: &TaskRegistry) -> i32 {
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Built-in job handlers.
pub fn default_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    builtins::register_handlers(&mut handlers);
    handlers
}

/// A registry with the built-in tasks, plus `queue.job` running jobs
/// through `handlers`.
pub fn registry_with_handlers(handlers: HandlerRegistry) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    builtins::register(&mut registry);
    register_job_task(&mut registry, Arc::new(handlers));
    registry
}

/// A registry with the built-in tasks and job handlers.
pub fn default_registry() -> TaskRegistry {
    registry_with_handlers(default_handlers())
}

async fn read_envelope<R: AsyncRead + Unpin>(input: R) -> Result<TaskEnvelope, TaskError> {
    let mut reader = BufReader::new(input);
    let mut line = Vec::new();
    reader
        .read_until(RECORD_SEPARATOR, &mut line)
        .await
        .map_err(|e| {
            TaskError::new(format!("failed to read task envelope: {}", e))
                .with_code(MALFORMED_ENVELOPE_CODE)
        })?;

    TaskEnvelope::decode(&line).map_err(|e| {
        TaskError::new(format!("invalid task envelope: {}", e)).with_code(MALFORMED_ENVELOPE_CODE)
    })
}

async fn write_all<W: AsyncWrite + Unpin>(output: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    output.write_all(bytes).await?;
    output.flush().await
}
