//! Job handlers and their resolution by job type.
//!
//! Handlers run inside worker processes: the daemon sends each reserved
//! [`Job`] to a child as the `queue.job` task, and the child resolves the
//! handler for the job's type through a [`HandlerResolver`]. Handler
//! factories capture whatever the handler depends on, so a fresh handler is
//! built per job.
//!
//! Handlers cannot cross the process boundary, so the worker processes must
//! serve the same handlers as the daemon. The `queue.job_types` task lets
//! the daemon check this before its first batch.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::Job;
use crate::entrypoint::{TaskRegistry, MALFORMED_ENVELOPE_CODE, PANIC_CODE, UNKNOWN_TASK_CODE};
use crate::pool::TaskError;

/// Task name the worker uses to run a job in a child process.
pub const JOB_TASK: &str = "queue.job";

/// Task name reporting the job types a worker process can run.
pub const JOB_TYPES_TASK: &str = "queue.job_types";

/// Business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value>;
}

/// Instantiates handlers by job type.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>>;

    /// Every job type this resolver can handle, or `None` when it cannot
    /// enumerate them.
    fn known_job_types(&self) -> Option<Vec<String>> {
        None
    }
}

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

/// A [`HandlerResolver`] backed by registered factories.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory building the handler for `job_type`.
    pub fn register<F, H>(&mut self, job_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: JobHandler + 'static,
    {
        self.factories.insert(
            job_type.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn JobHandler>),
        );
        self
    }

    /// Registers an async function as the handler for `job_type`.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Arc<dyn JobHandler> = Arc::new(FnHandler {
            handler: Arc::new(move |job| handler(job).boxed()),
        });
        self.factories
            .insert(job_type.into(), Arc::new(move || Arc::clone(&handler)));
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.factories.get(job_type).map(|factory| factory())
    }

    fn known_job_types(&self) -> Option<Vec<String>> {
        Some(self.job_types().into_iter().map(str::to_string).collect())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

type BoxedHandlerFn = Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

struct FnHandler {
    handler: BoxedHandlerFn,
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        (self.handler)(job.clone()).await
    }
}

/// Arguments of the `queue.job` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTaskArgs {
    pub job: Job,
}

impl JobTaskArgs {
    pub fn to_value(job: &Job) -> Result<Value, serde_json::Error> {
        serde_json::to_value(JobTaskArgs { job: job.clone() })
    }
}

/// Resolves and runs the handler for `job` in the current process.
///
/// Unknown job types, handler errors and panics all become [`TaskError`]s.
pub async fn run_job(resolver: &dyn HandlerResolver, job: &Job) -> Result<Value, TaskError> {
    let handler = resolver.resolve(job.job_type()).ok_or_else(|| {
        TaskError::new(format!("no handler registered for job type '{}'", job.job_type()))
            .with_code(UNKNOWN_TASK_CODE)
    })?;

    match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::from_anyhow(&e)),
        Err(_) => Err(
            TaskError::new(format!("handler for '{}' panicked", job.job_type()))
                .with_code(PANIC_CODE),
        ),
    }
}

/// Registers the `queue.job` and `queue.job_types` tasks, resolving
/// handlers through `resolver`.
pub fn register_job_task(registry: &mut TaskRegistry, resolver: Arc<dyn HandlerResolver>) {
    let types = Arc::clone(&resolver);
    registry
        .register(JOB_TASK, move |args: Value| {
            let resolver = Arc::clone(&resolver);
            async move {
                let args: JobTaskArgs = serde_json::from_value(args).map_err(|e| {
                    TaskError::new(format!("invalid job task arguments: {}", e))
                        .with_code(MALFORMED_ENVELOPE_CODE)
                })?;
                run_job(resolver.as_ref(), &args.job).await
            }
        })
        .register(JOB_TYPES_TASK, move |_args: Value| {
            let known = types.known_job_types();
            async move { Ok(known.map_or(Value::Null, Value::from)) }
        });
}

/// Job types the resolver knows that `served` does not.
///
/// `served` is what a worker process reported; `None` means it cannot
/// enumerate its handlers, which is never a mismatch.
pub fn missing_job_types(
    resolver: &dyn HandlerResolver,
    served: Option<&[String]>,
) -> Vec<String> {
    match (resolver.known_job_types(), served) {
        (Some(expected), Some(served)) => expected
            .into_iter()
            .filter(|job_type| !served.contains(job_type))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobRecord;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(job_type: &str, data: Value) -> Job {
        Job::from_record("file", "default", JobRecord::new(job_type, data, 0)).expect("job")
    }

    struct Greeter {
        greeting: String,
    }

    #[async_trait]
    impl JobHandler for Greeter {
        async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
            let name = job.data()["name"].as_str().unwrap_or("nobody");
            Ok(json!(format!("{}, {}", self.greeting, name)))
        }
    }

    #[tokio::test]
    async fn test_factory_captures_dependencies() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut registry = HandlerRegistry::new();
        registry.register("greet", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Greeter {
                greeting: "hello".to_string(),
            }
        });

        let result = run_job(&registry, &job("greet", json!({"name": "ada"}))).await;
        assert_eq!(result, Ok(json!("hello, ada")));
        run_job(&registry, &job("greet", json!({}))).await.expect("runs");
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_error_and_unknown_type() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("boom", |_job| async { anyhow::bail!("out of paper") });

        let err = run_job(&registry, &job("boom", Value::Null)).await.unwrap_err();
        assert!(err.message.contains("out of paper"));

        let err = run_job(&registry, &job("missing", Value::Null)).await.unwrap_err();
        assert_eq!(err.code, UNKNOWN_TASK_CODE);
    }

    #[tokio::test]
    async fn test_handler_panic_is_reported() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("explode", |_job| async {
            if true {
                panic!("bad state");
            }
            Ok(Value::Null)
        });

        let err = run_job(&registry, &job("explode", Value::Null)).await.unwrap_err();
        assert_eq!(err.code, PANIC_CODE);
    }

    #[tokio::test]
    async fn test_job_task_over_registry() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("double", |job: Job| async move {
            let n = job.data().as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });
        let mut tasks = TaskRegistry::new();
        register_job_task(&mut tasks, Arc::new(handlers));

        let args = JobTaskArgs::to_value(&job("double", json!(21))).expect("args");
        assert_eq!(tasks.call(JOB_TASK, args).await, Ok(json!(42)));

        let err = tasks.call(JOB_TASK, json!({"nope": 1})).await.unwrap_err();
        assert_eq!(err.code, MALFORMED_ENVELOPE_CODE);

        assert_eq!(
            tasks.call(JOB_TYPES_TASK, Value::Null).await,
            Ok(json!(["double"]))
        );
    }

    #[test]
    fn test_missing_job_types() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("send_email", |_| async { Ok(Value::Null) })
            .register_fn("resize", |_| async { Ok(Value::Null) });

        let served = vec!["echo".to_string(), "resize".to_string()];
        assert_eq!(
            missing_job_types(&registry, Some(&served)),
            vec!["send_email".to_string()]
        );
        assert!(missing_job_types(&registry, None).is_empty());

        struct Opaque;
        impl HandlerResolver for Opaque {
            fn resolve(&self, _job_type: &str) -> Option<Arc<dyn JobHandler>> {
                None
            }
        }
        assert!(missing_job_types(&Opaque, Some(&served)).is_empty());
    }

    #[test]
    fn test_job_types_sorted() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("b", |_| async { Ok(Value::Null) })
            .register_fn("a", |_| async { Ok(Value::Null) });
        assert_eq!(registry.job_types(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(registry.resolve("c").is_none());
    }
}
