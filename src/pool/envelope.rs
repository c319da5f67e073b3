//! Wire format between the pool and its worker processes.
//!
//! The parent writes one [`TaskEnvelope`] as a single JSON line to the
//! child's stdin. The child answers with exactly one [`ResultEnvelope`] on
//! stdout and exits with `0` on success or `1` on failure.

use std::panic::Location;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::PoolError;

/// Record separator terminating an envelope on the wire.
pub const RECORD_SEPARATOR: u8 = b'\n';

/// A deferred call: the registered task name plus its plain-data arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Name of the task in the child's registry.
    pub task: String,
    /// Captured arguments.
    #[serde(default)]
    pub args: Value,
}

impl TaskEnvelope {
    pub fn new(task: impl Into<String>, args: Value) -> Self {
        Self {
            task: task.into(),
            args,
        }
    }

    /// Encodes the envelope as one JSON line.
    pub fn encode(&self) -> Result<Vec<u8>, PoolError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(RECORD_SEPARATOR);
        Ok(bytes)
    }

    /// Decodes an envelope from a single line (the separator is optional).
    pub fn decode(line: &[u8]) -> Result<Self, PoolError> {
        Ok(serde_json::from_slice(line.trim_ascii())?)
    }
}

/// Error reported by a task, serialized across the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct TaskError {
    /// Human-readable failure message.
    pub message: String,
    /// Application-defined error code.
    #[serde(default)]
    pub code: i32,
    /// Source file where the error was raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Source line where the error was raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Optional cause chain or backtrace text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl TaskError {
    /// Creates an error tagged with the caller's source location.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            message: message.into(),
            code: 0,
            file: Some(location.file().to_string()),
            line: Some(location.line()),
            trace: None,
        }
    }

    /// Sets the error code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// Sets the trace text.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Converts an `anyhow` error, keeping its cause chain as the trace.
    #[track_caller]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let error = Self::new(err.to_string());
        if chain.is_empty() {
            error
        } else {
            error.with_trace(chain.join("\n"))
        }
    }
}

/// The single result a worker process writes to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl ResultEnvelope {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: TaskError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }

    /// Exit code the worker process should terminate with.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PoolError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(RECORD_SEPARATOR);
        Ok(bytes)
    }

    /// Parses the envelope from captured stdout.
    ///
    /// Only the last non-empty line is considered, so stray prints from a
    /// task do not corrupt the result.
    pub fn decode(output: &[u8]) -> Result<Self, PoolError> {
        let line = output
            .split(|b| *b == RECORD_SEPARATOR)
            .map(<[u8]>::trim_ascii)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| PoolError::Serialization("worker produced no output".to_string()))?;
        Ok(serde_json::from_slice(line)?)
    }

    pub fn into_result(self) -> Result<Value, TaskError> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| TaskError::new("task failed without error details")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_envelope_is_one_line() {
        let envelope = TaskEnvelope::new("echo", json!({"text": "a\nb"}));
        let bytes = envelope.encode().expect("encode");

        assert_eq!(bytes.last(), Some(&RECORD_SEPARATOR));
        assert_eq!(bytes.iter().filter(|b| **b == RECORD_SEPARATOR).count(), 1);
        assert_eq!(TaskEnvelope::decode(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn test_task_envelope_missing_args_defaults_to_null() {
        let envelope = TaskEnvelope::decode(br#"{"task":"echo"}"#).expect("decode");
        assert_eq!(envelope.args, Value::Null);
    }

    #[test]
    fn test_task_error_records_location() {
        let err = TaskError::new("boom").with_code(7);
        assert_eq!(err.code, 7);
        assert_eq!(err.file.as_deref(), Some(file!()));
        assert!(err.line.is_some());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_task_error_from_anyhow_keeps_chain() {
        let err = anyhow::anyhow!("disk full").context("writing report");
        let task_error = TaskError::from_anyhow(&err);
        assert_eq!(task_error.message, "writing report");
        assert_eq!(task_error.trace.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_result_decode_uses_last_line() {
        let output = b"debug noise\n{\"success\":true,\"result\":3}\n\n";
        let envelope = ResultEnvelope::decode(output).expect("decode");
        assert!(envelope.success);
        assert_eq!(envelope.into_result(), Ok(json!(3)));
    }

    #[test]
    fn test_result_decode_empty_output() {
        let err = ResultEnvelope::decode(b"  \n").unwrap_err();
        assert!(matches!(err, PoolError::Serialization(_)));
    }

    #[test]
    fn test_failure_envelope_wire_shape() {
        let envelope = ResultEnvelope::err(TaskError::new("nope").with_code(2));
        let value: Value = serde_json::from_slice(&envelope.encode().expect("encode"))
            .expect("valid json");

        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["message"], json!("nope"));
        assert_eq!(value["error"]["code"], json!(2));
        assert!(value.get("result").is_none());
        assert_eq!(envelope.exit_code(), 1);
    }

    #[test]
    fn test_failure_without_details() {
        let envelope: ResultEnvelope =
            serde_json::from_str(r#"{"success":false}"#).expect("parse");
        let err = envelope.into_result().unwrap_err();
        assert!(err.message.contains("without error details"));
    }
}
