//! Tasks and job handlers available in every `job-forge` worker process.
//!
//! Tasks:
//! - `echo`: returns its arguments unchanged
//! - `sleep`: sleeps `ms` milliseconds and reports when it ran
//! - `fail`: fails with `message` and `code`
//!
//! Job types:
//! - `echo`: returns the job data
//! - `log`: logs the job data
//! - `sleep`: sleeps `ms` milliseconds
//! - `fail`: fails with `message`

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use super::TaskRegistry;
use crate::pool::TaskError;
use crate::queue::{HandlerRegistry, Job};

pub fn register(registry: &mut TaskRegistry) {
    registry
        .register("echo", |args| async move { Ok(args) })
        .register("sleep", |args: Value| async move {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            let started_ms = Utc::now().timestamp_millis();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({
                "pid": std::process::id(),
                "started_ms": started_ms,
                "finished_ms": Utc::now().timestamp_millis(),
            }))
        })
        .register("fail", |args: Value| async move {
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("task failed")
                .to_string();
            let code = args.get("code").and_then(Value::as_i64).unwrap_or(1) as i32;
            Err(TaskError::new(message).with_code(code))
        });
}

pub fn register_handlers(handlers: &mut HandlerRegistry) {
    handlers
        .register_fn("echo", |job: Job| async move { Ok(job.data().clone()) })
        .register_fn("log", |job: Job| async move {
            tracing::info!(job_id = %job.id(), data = %job.data(), "Job log");
            Ok(Value::Null)
        })
        .register_fn("sleep", |job: Job| async move {
            let ms = job.data().get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"slept_ms": ms}))
        })
        .register_fn("fail", |job: Job| async move {
            let message = job
                .data()
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("job failed")
                .to_string();
            Err(anyhow::anyhow!(message))
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        register(&mut registry);
        registry
    }

    #[tokio::test]
    async fn test_echo() {
        let args = json!({"nested": {"list": [1, "two", null]}});
        assert_eq!(registry().call("echo", args.clone()).await, Ok(args));
    }

    #[tokio::test]
    async fn test_sleep_reports_window() {
        let result = registry()
            .call("sleep", json!({"ms": 20}))
            .await
            .expect("sleep succeeds");
        let started = result["started_ms"].as_i64().expect("started");
        let finished = result["finished_ms"].as_i64().expect("finished");
        assert!(finished - started >= 19);
        assert_eq!(result["pid"], json!(std::process::id()));
    }

    #[tokio::test]
    async fn test_job_handlers() {
        use crate::queue::{run_job, JobRecord};

        let mut handlers = HandlerRegistry::new();
        register_handlers(&mut handlers);
        assert_eq!(handlers.job_types(), vec!["echo", "fail", "log", "sleep"]);

        let job = |job_type: &str, data: Value| {
            Job::from_record("file", "default", JobRecord::new(job_type, data, 0)).expect("job")
        };
        assert_eq!(
            run_job(&handlers, &job("echo", json!([1, 2]))).await,
            Ok(json!([1, 2]))
        );
        let err = run_job(&handlers, &job("fail", json!({"message": "no"})))
            .await
            .unwrap_err();
        assert_eq!(err.message, "no");
    }

    #[tokio::test]
    async fn test_fail() {
        let err = registry()
            .call("fail", json!({"message": "nope", "code": 9}))
            .await
            .unwrap_err();
        assert_eq!(err.message, "nope");
        assert_eq!(err.code, 9);
    }
}
