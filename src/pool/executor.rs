//! Bounded executor running tasks as worker processes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::envelope::TaskError;
use super::process::Process;
use super::runtime::Runtime;
use super::status::PoolStatus;
use super::task::{Task, TaskFailure, TaskSuccess};
use crate::error::PoolError;

/// Default time a single task may run before it is killed.
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

type SuccessCallback = Box<dyn FnMut(&TaskSuccess) + Send>;
type FailureCallback = Box<dyn FnMut(&TaskFailure) + Send>;
type Finished = BoxFuture<'static, (Process, Result<i32, PoolError>)>;

/// Runs [`Task`]s in separate OS processes with a concurrency ceiling.
///
/// Tasks are dispatched in submission order; callbacks fire in completion
/// order. A failing task is routed to the failure callbacks and never
/// aborts its siblings.
///
/// ```rust,ignore
/// let mut pool = Pool::new(Arc::new(PipeRuntime::entrypoint("job-forge")))
///     .with_concurrency(4);
/// pool.when_task_succeeded(|s| println!("{} -> {}", s.task, s.result));
/// pool.add(Task::new("echo", json!({"hello": "world"})));
/// pool.run().await?;
/// pool.wait().await?;
/// assert!(pool.status().is_successful());
/// ```
pub struct Pool {
    runtime: Arc<dyn Runtime>,
    concurrency: usize,
    timeout: Duration,
    pending: VecDeque<Task>,
    /// Started processes not yet handed to `wait`.
    started: Vec<Process>,
    /// Live processes, including those currently awaited.
    active: usize,
    succeeded: Vec<TaskSuccess>,
    failed: Vec<TaskFailure>,
    succeeded_count: usize,
    failed_count: usize,
    on_success: Vec<SuccessCallback>,
    on_failure: Vec<FailureCallback>,
}

impl Pool {
    /// Creates a pool sized to the machine's available parallelism.
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            runtime,
            concurrency,
            timeout: DEFAULT_TASK_TIMEOUT,
            pending: VecDeque::new(),
            started: Vec::new(),
            active: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
            succeeded_count: 0,
            failed_count: 0,
            on_success: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    /// Sets the maximum number of simultaneously running processes.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.set_concurrency(concurrency);
        self
    }

    /// Sets the per-task deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a callback fired for every successful task.
    pub fn when_task_succeeded(&mut self, callback: impl FnMut(&TaskSuccess) + Send + 'static) {
        self.on_success.push(Box::new(callback));
    }

    /// Registers a callback fired for every failed task.
    pub fn when_task_failed(&mut self, callback: impl FnMut(&TaskFailure) + Send + 'static) {
        self.on_failure.push(Box::new(callback));
    }

    /// Queues a task for dispatch.
    pub fn add(&mut self, task: Task) -> &mut Self {
        self.pending.push_back(task);
        self
    }

    /// Dispatches pending tasks until the concurrency ceiling is reached.
    pub async fn run(&mut self) -> Result<(), PoolError> {
        while self.active < self.concurrency {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(task).await?;
        }
        Ok(())
    }

    /// Starts a task immediately, bypassing the pending queue.
    ///
    /// Fails with [`PoolError::Overflow`] when the pool is already full.
    /// A task whose process cannot be spawned is recorded as failed before
    /// the spawn error is returned.
    pub async fn dispatch(&mut self, task: Task) -> Result<(), PoolError> {
        if self.active >= self.concurrency {
            return Err(PoolError::Overflow {
                limit: self.concurrency,
            });
        }

        let (task_id, envelope, hook) = task.into_parts();
        if let Some(hook) = hook {
            hook();
        }

        let task_name = envelope.task.clone();
        let mut process = Process::new(task_id, envelope);
        if let Err(e) = process.start(self.runtime.as_ref()).await {
            self.record_failure(TaskFailure {
                task_id,
                task: task_name,
                pid: None,
                exit_code: None,
                error: TaskError::new(e.to_string()),
                error_output: String::new(),
                duration: Duration::ZERO,
            });
            return Err(e);
        }

        self.active += 1;
        self.started.push(process);
        Ok(())
    }

    /// Waits until every task has finished, refilling free slots from the
    /// pending queue as processes complete.
    ///
    /// Returns the first timeout or spawn error after all live processes
    /// have been collected. A timeout does not stop dispatching; after a
    /// spawn error the remaining tasks stay pending.
    pub async fn wait(&mut self) -> Result<(), PoolError> {
        let mut in_flight: FuturesUnordered<Finished> = FuturesUnordered::new();
        let mut first_error: Option<PoolError> = None;
        let mut dispatching = true;

        loop {
            if dispatching {
                if let Err(e) = self.run().await {
                    warn!(error = %e, "Stopped dispatching pending tasks");
                    dispatching = false;
                    first_error.get_or_insert(e);
                }
            }

            let timeout = self.timeout;
            for mut process in self.started.drain(..) {
                in_flight.push(
                    async move {
                        let exit = process.wait(timeout).await;
                        (process, exit)
                    }
                    .boxed(),
                );
            }

            let Some((process, exit)) = in_flight.next().await else {
                break;
            };
            self.active -= 1;
            if let Some(e) = self.finalize(process, exit).await {
                first_error.get_or_insert(e);
            }
        }

        debug!(status = %self.status(), "Pool drained");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current counters.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pending: self.pending.len(),
            running: self.active,
            succeeded: self.succeeded_count,
            failed: self.failed_count,
        }
    }

    pub fn succeeded(&self) -> &[TaskSuccess] {
        &self.succeeded
    }

    pub fn failed(&self) -> &[TaskFailure] {
        &self.failed
    }

    /// Removes and returns the tasks that were never dispatched.
    pub fn clear_pending(&mut self) -> Vec<Task> {
        self.pending.drain(..).collect()
    }

    /// Drops buffered finished-task records. Counters are kept.
    pub fn clear_finished(&mut self) -> usize {
        let dropped = self.succeeded.len() + self.failed.len();
        self.succeeded = Vec::new();
        self.failed = Vec::new();
        dropped
    }

    async fn finalize(
        &mut self,
        mut process: Process,
        exit: Result<i32, PoolError>,
    ) -> Option<PoolError> {
        let mut wait_error = None;
        let outcome = match exit {
            Ok(code) => match process.result().await {
                Ok(envelope) => match envelope.into_result() {
                    Ok(value) if code == 0 => Ok(value),
                    Ok(_) => Err(TaskError::new(format!(
                        "worker exited with code {} after reporting success",
                        code
                    ))
                    .with_code(code)),
                    Err(e) => Err(e),
                },
                Err(e) => Err(TaskError::new(format!(
                    "unreadable worker output (exit code {}): {}",
                    code, e
                ))
                .with_code(code)),
            },
            Err(e) => {
                let error = TaskError::new(e.to_string());
                wait_error = Some(e);
                Err(error)
            }
        };

        let duration = process.elapsed();
        match outcome {
            Ok(result) => {
                debug!(
                    task = process.task_name(),
                    pid = ?process.pid(),
                    duration_ms = duration.as_millis() as u64,
                    "Task succeeded"
                );
                self.record_success(TaskSuccess {
                    task_id: process.task_id(),
                    task: process.task_name().to_string(),
                    pid: process.pid(),
                    result,
                    duration,
                });
            }
            Err(error) => {
                let error_output = process.error_output().await;
                info!(
                    task = process.task_name(),
                    pid = ?process.pid(),
                    exit_code = ?process.exit_code(),
                    error = %error,
                    "Task failed"
                );
                self.record_failure(TaskFailure {
                    task_id: process.task_id(),
                    task: process.task_name().to_string(),
                    pid: process.pid(),
                    exit_code: process.exit_code(),
                    error,
                    error_output,
                    duration,
                });
            }
        }

        process.stop().await;
        wait_error
    }

    fn record_success(&mut self, success: TaskSuccess) {
        self.succeeded_count += 1;
        for callback in &mut self.on_success {
            callback(&success);
        }
        self.succeeded.push(success);
    }

    fn record_failure(&mut self, failure: TaskFailure) {
        self.failed_count += 1;
        for callback in &mut self.on_failure {
            callback(&failure);
        }
        self.failed.push(failure);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("runtime", &self.runtime.name())
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("status", &self.status())
            .finish()
    }
}
