//! A custom handler given to the worker runs in a child process.
//!
//! This test binary is its own worker program: the default re-exec runtime
//! launches it again with `exec`, and `main` then serves tasks with the same
//! handlers the daemon was given. It therefore runs without the libtest
//! harness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use job_forge::entrypoint::{default_handlers, registry_with_handlers, run_stdio};
use job_forge::pool::EXEC_ARG;
use job_forge::queue::{
    ConnectionConfig, HandlerRegistry, QueueConfig, QueueManager, QueueWorker, StopReason,
    WorkerConfig,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Handlers shared by the daemon and its worker processes.
fn handlers() -> HandlerRegistry {
    let mut handlers = default_handlers();
    handlers.register_fn("record_pid", |job| async move {
        let path = job
            .data()
            .get("path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("record_pid needs a path"))?;
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(json!({ "pid": std::process::id() }))
    });
    handlers
}

async fn test_custom_handler_runs_in_worker_process() {
    let dir = TempDir::new().expect("tempdir");
    let manager = Arc::new(QueueManager::new(QueueConfig::single(
        "local",
        ConnectionConfig::file(dir.path().join("queue")),
    )));
    let marker = dir.path().join("pid");
    manager
        .push("record_pid", json!({ "path": marker }), None)
        .await
        .expect("push");

    let config = WorkerConfig::default()
        .with_backoff(Duration::ZERO)
        .with_timeout(Duration::from_secs(30))
        .with_max_tries(1)
        .with_stop_when_empty(true);
    let mut worker =
        QueueWorker::new(Arc::clone(&manager), config, Arc::new(handlers())).expect("worker");

    assert_eq!(worker.run().await.expect("run"), StopReason::Empty);
    assert_eq!(worker.processed(), 1);
    assert_eq!(worker.failed(), 0);

    let recorded: u32 = std::fs::read_to_string(&marker)
        .expect("handler wrote its pid")
        .parse()
        .expect("pid");
    assert_ne!(recorded, std::process::id());
}

fn main() {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    if std::env::args().nth(1).as_deref() == Some(EXEC_ARG) {
        let code = runtime.block_on(run_stdio(&registry_with_handlers(handlers())));
        std::process::exit(code);
    }

    runtime.block_on(test_custom_handler_runs_in_worker_process());
    println!("test test_custom_handler_runs_in_worker_process ... ok");
}
