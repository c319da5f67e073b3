//! Queue worker daemon.
//!
//! Each cycle reserves up to `concurrency` jobs, runs them as `queue.job`
//! tasks in worker processes, and settles every job from its outcome:
//!
//! - success: the job is deleted
//! - failure with attempts left: the job is released after the backoff
//! - failure with attempts exhausted: the job is moved to the failed store
//!
//! Between cycles the worker runs maintenance under memory pressure, emits
//! periodic health reports and stops once a health limit is crossed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::WorkerConfig;
use super::driver::QueueDriver;
use super::events::{EventDispatcher, JobEvent, TracingEvents};
use super::handler::{
    missing_job_types, run_job, HandlerResolver, JobTaskArgs, JOB_TASK, JOB_TYPES_TASK,
};
use super::health::{HealthLimit, HealthMonitor};
use super::job::Job;
use super::manager::QueueManager;
use crate::error::{PoolError, WorkerError};
use crate::metrics::{JobOutcome, MetricsCollector};
use crate::pool::{Pool, Process, Runtime, Task, TaskEnvelope, TaskError};

/// Where the worker loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Dispatching,
    Waiting,
    ShuttingDown,
}

/// Why the worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    /// A shutdown signal was received.
    Signal,
    /// The queue was empty and `stop_when_empty` is set.
    Empty,
    /// `max_jobs` jobs were finished.
    MaxJobs,
    /// A memory or runtime ceiling was crossed.
    Health(HealthLimit),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal => write!(f, "shutdown signal"),
            StopReason::Empty => write!(f, "queue empty"),
            StopReason::MaxJobs => write!(f, "job limit reached"),
            StopReason::Health(limit) => write!(f, "health limit: {}", limit),
        }
    }
}

/// How a finished job was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Processed,
    Released,
    Failed,
}

enum TaskOutcome {
    Succeeded { duration: Duration },
    Failed { error: TaskError, spawned: bool },
}

/// Why the worker processes' handlers could not be confirmed.
enum HandlerCheck {
    /// No worker process could be spawned; retried with the next batch.
    Spawn(PoolError),
    Fatal(WorkerError),
}

/// Pulls jobs from a queue connection and runs them in worker processes.
pub struct QueueWorker {
    manager: Arc<QueueManager>,
    config: WorkerConfig,
    resolver: Arc<dyn HandlerResolver>,
    events: Arc<dyn EventDispatcher>,
    runtime: Arc<dyn Runtime>,
    pool: Pool,
    handlers_verified: bool,
    outcomes: mpsc::UnboundedReceiver<(Uuid, TaskOutcome)>,
    health: HealthMonitor,
    metrics: MetricsCollector,
    state: WorkerState,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    processed: u64,
    failed: u64,
}

impl QueueWorker {
    /// Creates a worker.
    ///
    /// `resolver` runs jobs handled in this process via
    /// [`process_job`](Self::process_job). Jobs run by the daemon loop are
    /// resolved by the worker processes, so they must serve the same
    /// handlers: with the default reexec runtime the embedding binary routes
    /// `exec` through [`run_with_handlers`](crate::cli::run_with_handlers) or
    /// [`registry_with_handlers`](crate::entrypoint::registry_with_handlers)
    /// with this handler set. [`run`](Self::run) checks this before its
    /// first batch and fails with [`WorkerError::MissingHandlers`].
    pub fn new(
        manager: Arc<QueueManager>,
        config: WorkerConfig,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Result<Self, WorkerError> {
        let runtime = config.runtime.build(config.worker_program.clone())?;
        let mut pool = Pool::new(Arc::clone(&runtime))
            .with_concurrency(config.concurrency)
            .with_timeout(config.timeout);

        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let success_tx = outcome_tx.clone();
        pool.when_task_succeeded(move |success| {
            let _ = success_tx.send((
                success.task_id,
                TaskOutcome::Succeeded {
                    duration: success.duration,
                },
            ));
        });
        pool.when_task_failed(move |failure| {
            if !failure.error_output.is_empty() {
                debug!(
                    task_id = %failure.task_id,
                    stderr = %failure.error_output.trim_end(),
                    "Worker process stderr"
                );
            }
            let _ = outcome_tx.send((
                failure.task_id,
                TaskOutcome::Failed {
                    error: failure.error.clone(),
                    spawned: failure.pid.is_some(),
                },
            ));
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let health = HealthMonitor::new(&config);

        Ok(Self {
            manager,
            config,
            resolver,
            events: Arc::new(TracingEvents),
            runtime,
            pool,
            handlers_verified: false,
            outcomes,
            health,
            metrics: MetricsCollector::new(),
            state: WorkerState::Idle,
            shutdown_tx,
            shutdown_rx,
            processed: 0,
            failed: 0,
        })
    }

    pub fn with_events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_health_monitor(mut self, health: HealthMonitor) -> Self {
        self.health = health;
        self
    }

    /// Sender that stops the loop at its next check.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Jobs whose handler succeeded.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Job runs that failed, retried or not.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Runs the daemon loop until a stop condition is met.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Queue` if the connection cannot be resolved,
    /// `WorkerError::MissingHandlers` if the worker processes cannot run a
    /// job type the resolver knows, and `WorkerError::Spawn` once worker
    /// processes have failed to spawn more than `max_spawn_failures`
    /// batches in a row.
    pub async fn run(&mut self) -> Result<StopReason, WorkerError> {
        let connection_name = self.config.connection.clone();
        let initial = self.manager.connection(connection_name.as_deref()).await?;
        let queue = self
            .config
            .queue
            .clone()
            .unwrap_or_else(|| initial.default_queue().to_string());
        drop(initial);

        info!(
            connection = connection_name.as_deref().unwrap_or(self.manager.default_connection()),
            queue = %queue,
            concurrency = self.config.concurrency,
            max_tries = self.config.max_tries,
            "Queue worker started"
        );

        let mut spawn_failures = 0u32;
        let reason = loop {
            if self.shutdown_requested() {
                break StopReason::Signal;
            }

            let driver = self.manager.connection(connection_name.as_deref()).await?;

            self.set_state(WorkerState::Fetching);
            let jobs = self.fetch(driver.as_ref(), &queue).await;

            if jobs.is_empty() {
                if self.config.stop_when_empty {
                    break StopReason::Empty;
                }
                self.set_state(WorkerState::Idle);
                if self.sleep_or_shutdown().await {
                    break StopReason::Signal;
                }
            } else {
                let batch = match self.verify_handlers().await {
                    Ok(()) => self.run_batch(&driver, jobs).await,
                    Err(check) => {
                        self.release_unrun(driver.as_ref(), jobs).await;
                        match check {
                            HandlerCheck::Spawn(e) => Err(e),
                            HandlerCheck::Fatal(e) => {
                                self.set_state(WorkerState::ShuttingDown);
                                return Err(e);
                            }
                        }
                    }
                };
                match batch {
                    Ok(()) => spawn_failures = 0,
                    Err(PoolError::Spawn { program, reason }) => {
                        spawn_failures += 1;
                        error!(
                            program = %program,
                            reason = %reason,
                            consecutive = spawn_failures,
                            "Failed to spawn worker process"
                        );
                        if spawn_failures > self.config.max_spawn_failures {
                            self.set_state(WorkerState::ShuttingDown);
                            return Err(WorkerError::Spawn {
                                attempts: spawn_failures,
                                last: reason,
                            });
                        }
                    }
                    Err(e) => {
                        spawn_failures = 0;
                        warn!(error = %e, "Batch finished with errors");
                    }
                }
            }

            self.maintenance().await;

            if self.health.maybe_report(self.processed, self.failed).is_some() {
                if let Ok(depth) = driver.size(Some(&queue)).await {
                    self.metrics.set_queue_depth(&queue, depth);
                }
            }

            if let Some(reason) = self.quit_reason() {
                break reason;
            }
        };

        self.set_state(WorkerState::ShuttingDown);
        info!(
            reason = %reason,
            processed = self.processed,
            failed = self.failed,
            "Queue worker stopping"
        );
        Ok(reason)
    }

    /// Runs one job in the current process and settles it.
    pub async fn process_job(
        &mut self,
        job: Job,
        max_tries: u32,
    ) -> Result<JobDisposition, WorkerError> {
        let driver = self.manager.connection(Some(job.connection())).await?;
        self.events
            .dispatch(&JobEvent::Processing { job: job.clone() });

        let started = Instant::now();
        let outcome = run_job(self.resolver.as_ref(), &job)
            .await
            .map(|_| started.elapsed());

        Ok(self.finalize(driver.as_ref(), job, outcome, max_tries).await)
    }

    /// Reserves up to `concurrency` jobs without blocking.
    async fn fetch(&self, driver: &dyn QueueDriver, queue: &str) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(self.config.concurrency);
        while jobs.len() < self.config.concurrency {
            match driver.pop(Some(queue)).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => break,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to pop job");
                    break;
                }
            }
        }
        jobs
    }

    async fn run_batch(
        &mut self,
        driver: &Arc<dyn QueueDriver>,
        jobs: Vec<Job>,
    ) -> Result<(), PoolError> {
        let mut in_flight: HashMap<Uuid, Job> = HashMap::with_capacity(jobs.len());

        for job in jobs {
            let args = match JobTaskArgs::to_value(&job) {
                Ok(args) => args,
                Err(e) => {
                    let error = TaskError::new(format!("could not encode job: {}", e));
                    let max_tries = self.config.max_tries;
                    self.finalize(driver.as_ref(), job, Err(error), max_tries)
                        .await;
                    continue;
                }
            };

            let events = Arc::clone(&self.events);
            let processing = job.clone();
            let task = Task::new(JOB_TASK, args).before_dispatch(move || {
                events.dispatch(&JobEvent::Processing { job: processing });
            });
            in_flight.insert(task.id(), job);
            self.pool.add(task);
        }

        self.metrics.set_jobs_in_progress(in_flight.len());
        let mut batch_error = None;

        self.set_state(WorkerState::Dispatching);
        if let Err(e) = self.pool.run().await {
            let skipped = self.pool.clear_pending();
            debug!(skipped = skipped.len(), "Dispatch stopped early");
            batch_error = Some(e);
        }

        self.set_state(WorkerState::Waiting);
        if let Err(e) = self.pool.wait().await {
            batch_error.get_or_insert(e);
        }
        self.pool.clear_pending();

        let max_tries = self.config.max_tries;
        let mut unspawned = Vec::new();
        while let Ok((task_id, outcome)) = self.outcomes.try_recv() {
            let Some(job) = in_flight.remove(&task_id) else {
                continue;
            };
            match outcome {
                TaskOutcome::Succeeded { duration } => {
                    self.finalize(driver.as_ref(), job, Ok(duration), max_tries)
                        .await;
                }
                TaskOutcome::Failed { error, spawned: true } => {
                    self.finalize(driver.as_ref(), job, Err(error), max_tries)
                        .await;
                }
                TaskOutcome::Failed {
                    error,
                    spawned: false,
                } => unspawned.push((job, error)),
            }
        }

        // `Processing` was emitted for these before their spawn failed.
        for (job, error) in unspawned {
            self.release_unrun(driver.as_ref(), [job.clone()]).await;
            self.events.dispatch(&JobEvent::Failed {
                job,
                error: error.message,
                released: true,
            });
        }
        self.release_unrun(driver.as_ref(), in_flight.into_values())
            .await;

        self.metrics.set_jobs_in_progress(0);
        match batch_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Settles a finished job. Driver errors are logged, never returned.
    async fn finalize(
        &mut self,
        driver: &dyn QueueDriver,
        job: Job,
        outcome: Result<Duration, TaskError>,
        max_tries: u32,
    ) -> JobDisposition {
        match outcome {
            Ok(duration) => {
                if let Err(e) = driver.delete(&job).await {
                    error!(job_id = %job.id(), error = %e, "Failed to delete processed job");
                }
                self.processed += 1;
                self.metrics
                    .record_job(job.queue(), JobOutcome::Processed, duration);
                self.events
                    .dispatch(&JobEvent::Processed { job, duration });
                JobDisposition::Processed
            }
            Err(error) => {
                self.failed += 1;
                let released = job.attempts() < max_tries;

                let disposition = if released {
                    if let Err(e) = driver.release(&job, self.config.backoff).await {
                        error!(job_id = %job.id(), error = %e, "Failed to release job");
                    }
                    self.metrics
                        .record_job(job.queue(), JobOutcome::Released, Duration::ZERO);
                    JobDisposition::Released
                } else {
                    warn!(
                        job_id = %job.id(),
                        attempts = job.attempts(),
                        max_tries,
                        "Job attempts exhausted, moving to failed store"
                    );
                    if let Err(e) = driver.fail(&job, &error.message).await {
                        error!(job_id = %job.id(), error = %e, "Failed to store failed job");
                    }
                    self.metrics
                        .record_job(job.queue(), JobOutcome::Failed, Duration::ZERO);
                    JobDisposition::Failed
                };

                self.events.dispatch(&JobEvent::Failed {
                    job,
                    error: error.message,
                    released,
                });
                disposition
            }
        }
    }

    /// Puts reserved jobs that never ran back without backoff.
    async fn release_unrun(&self, driver: &dyn QueueDriver, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            if let Err(e) = driver.release(&job, Duration::ZERO).await {
                error!(job_id = %job.id(), error = %e, "Failed to release unrun job");
            } else {
                debug!(job_id = %job.id(), "Released unrun job");
            }
        }
    }

    /// Asks a worker process once which job types it serves and compares
    /// them with the resolver's.
    async fn verify_handlers(&mut self) -> Result<(), HandlerCheck> {
        if self.handlers_verified {
            return Ok(());
        }
        if self.resolver.known_job_types().is_none() {
            self.handlers_verified = true;
            return Ok(());
        }

        let mut process = Process::new(
            Uuid::new_v4(),
            TaskEnvelope::new(JOB_TYPES_TASK, Value::Null),
        );
        match process.start(self.runtime.as_ref()).await {
            Ok(()) => {}
            Err(e @ PoolError::Spawn { .. }) => return Err(HandlerCheck::Spawn(e)),
            Err(e) => return Err(HandlerCheck::Fatal(e.into())),
        }

        let reply = match process.wait(self.config.timeout).await {
            Ok(_) => match process.result().await {
                Ok(envelope) => envelope.into_result().map_err(|e| e.message),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };
        process.stop().await;

        let served: Option<Vec<String>> = reply
            .and_then(|value| serde_json::from_value(value).map_err(|e| e.to_string()))
            .map_err(|message| HandlerCheck::Fatal(WorkerError::HandlerCheck(message)))?;

        let missing = missing_job_types(self.resolver.as_ref(), served.as_deref());
        if !missing.is_empty() {
            error!(missing = ?missing, "Worker processes cannot run every job type");
            return Err(HandlerCheck::Fatal(WorkerError::MissingHandlers { missing }));
        }

        debug!(runtime = self.runtime.name(), "Worker process handlers verified");
        self.handlers_verified = true;
        Ok(())
    }

    /// Drops buffered records and cached connections under memory pressure.
    async fn maintenance(&mut self) {
        if !self.health.needs_maintenance() {
            return;
        }
        let dropped = self.pool.clear_finished();
        let purged = self
            .manager
            .purge(self.config.connection.as_deref())
            .await;
        debug!(dropped, purged, "Worker maintenance");
    }

    fn quit_reason(&self) -> Option<StopReason> {
        if let Some(max_jobs) = self.config.max_jobs {
            if self.processed + self.failed >= max_jobs {
                return Some(StopReason::MaxJobs);
            }
        }

        if let Some(limit) = self.health.should_quit_due_to_health() {
            info!(limit = %limit, "Worker health limit reached");
            return Some(StopReason::Health(limit));
        }

        None
    }

    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                info!("Worker received shutdown signal");
                true
            }
            Err(broadcast::error::TryRecvError::Empty)
            | Err(broadcast::error::TryRecvError::Closed) => false,
        }
    }

    /// Sleeps the idle interval. Returns true when interrupted by shutdown.
    async fn sleep_or_shutdown(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.sleep) => false,
            signal = self.shutdown_rx.recv() => match signal {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    info!("Worker received shutdown signal");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => false,
            },
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Worker state");
            self.state = state;
        }
    }
}

impl fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWorker")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("processed", &self.processed)
            .field("failed", &self.failed)
            .finish()
    }
}
