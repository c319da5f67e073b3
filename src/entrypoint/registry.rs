//! Named task functions callable across the process boundary.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::pool::TaskError;

/// Error code reported when the requested task is not registered.
pub const UNKNOWN_TASK_CODE: i32 = 404;

/// Error code reported when a task panicked.
pub const PANIC_CODE: i32 = 500;

type TaskFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync>;

/// Maps task names to async functions of their plain-data arguments.
///
/// The parent only ever sends a name and arguments, so both sides must be
/// built with the same registrations.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` under `name`, replacing any previous registration.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, task: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.tasks
            .insert(name.into(), Arc::new(move |args| task(args).boxed()));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs a task. Unknown names and panics become [`TaskError`]s.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value, TaskError> {
        let Some(task) = self.tasks.get(name) else {
            return Err(
                TaskError::new(format!("unknown task '{}'", name)).with_code(UNKNOWN_TASK_CODE)
            );
        };

        match AssertUnwindSafe(task(args)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                Err(TaskError::new(format!("task '{}' panicked: {}", name, message))
                    .with_code(PANIC_CODE))
            }
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_call() {
        let mut registry = TaskRegistry::new();
        registry.register("double", |args: Value| async move {
            let n = args.as_i64().ok_or_else(|| TaskError::new("expected a number"))?;
            Ok(json!(n * 2))
        });

        assert!(registry.contains("double"));
        assert_eq!(registry.call("double", json!(21)).await, Ok(json!(42)));

        let err = registry.call("double", json!("x")).await.unwrap_err();
        assert_eq!(err.message, "expected a number");
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let registry = TaskRegistry::new();
        let err = registry.call("missing", Value::Null).await.unwrap_err();
        assert_eq!(err.code, UNKNOWN_TASK_CODE);
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let mut registry = TaskRegistry::new();
        registry.register("explode", |_| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });

        let err = registry.call("explode", Value::Null).await.unwrap_err();
        assert_eq!(err.code, PANIC_CODE);
        assert!(err.message.contains("kaboom"));
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = TaskRegistry::new();
        registry
            .register("b", |_| async { Ok(Value::Null) })
            .register("a", |_| async { Ok(Value::Null) });
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
