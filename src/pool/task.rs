//! Tasks submitted to the pool and the outcomes they produce.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::envelope::{TaskEnvelope, TaskError};

/// Hook invoked right before a task's process is spawned.
pub type BeforeDispatch = Box<dyn FnOnce() + Send>;

/// A deferred unit of work for out-of-process execution.
///
/// The task names a function registered in the worker's
/// [`crate::entrypoint::TaskRegistry`] and carries plain-data arguments.
pub struct Task {
    id: Uuid,
    envelope: TaskEnvelope,
    before_dispatch: Option<BeforeDispatch>,
}

impl Task {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            envelope: TaskEnvelope::new(name, args),
            before_dispatch: None,
        }
    }

    /// Registers a hook that runs once, just before the process is spawned.
    pub fn before_dispatch(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.before_dispatch = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.envelope.task
    }

    pub fn args(&self) -> &Value {
        &self.envelope.args
    }

    pub(crate) fn into_parts(self) -> (Uuid, TaskEnvelope, Option<BeforeDispatch>) {
        (self.id, self.envelope, self.before_dispatch)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.envelope.task)
            .field("has_hook", &self.before_dispatch.is_some())
            .finish()
    }
}

/// A task that finished successfully.
#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub task_id: Uuid,
    pub task: String,
    pub pid: Option<u32>,
    /// Value returned by the task.
    pub result: Value,
    pub duration: Duration,
}

/// A task that failed, timed out, or could not be started.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub task: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub error: TaskError,
    /// Whatever the process wrote to stderr.
    pub error_output: String,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_task_parts() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let task = Task::new("echo", json!([1, 2])).before_dispatch(move || {
            flag.store(true, Ordering::SeqCst);
        });
        let id = task.id();
        assert_eq!(task.name(), "echo");
        assert_eq!(task.args(), &json!([1, 2]));

        let (task_id, envelope, hook) = task.into_parts();
        assert_eq!(task_id, id);
        assert_eq!(envelope.task, "echo");
        hook.expect("hook set")();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_task_ids_unique() {
        let a = Task::new("echo", Value::Null);
        let b = Task::new("echo", Value::Null);
        assert_ne!(a.id(), b.id());
    }
}
