//! Persisted job records.
//!
//! - `JobRecord`: what a driver stores (`id`, `job`, `data`, `attempts`,
//!   `created_at`, optional `available_at`)
//! - `Job`: a record popped from a queue, with the queue and connection it
//!   came from and its raw stored payload
//! - `FailedJob`: a record moved to the failed store, with its error

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The stored form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier, assigned on push.
    pub id: String,
    /// Handler type used to resolve the job handler.
    pub job: String,
    /// Payload handed to the handler.
    #[serde(default)]
    pub data: Value,
    /// Number of times the job has been reserved.
    #[serde(default)]
    pub attempts: u32,
    /// Epoch seconds when the job was first pushed.
    pub created_at: i64,
    /// Epoch seconds before which the job must not be popped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_at: Option<i64>,
}

impl JobRecord {
    pub fn new(job_type: impl Into<String>, data: Value, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job: job_type.into(),
            data,
            attempts: 0,
            created_at: now,
            available_at: None,
        }
    }

    /// Marks the record as unavailable until `available_at`.
    pub fn available_at(mut self, available_at: i64) -> Self {
        self.available_at = Some(available_at);
        self
    }

    pub fn is_available(&self, now: i64) -> bool {
        self.available_at.map_or(true, |at| at <= now)
    }
}

/// A record in a queue's failed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    #[serde(flatten)]
    pub record: JobRecord,
    pub error: String,
    /// Epoch seconds when the job was failed.
    pub failed_at: i64,
}

impl FailedJob {
    pub fn new(job: &Job, error: impl Into<String>, failed_at: i64) -> Self {
        Self {
            record: job.record().clone(),
            error: error.into(),
            failed_at,
        }
    }
}

/// A job reserved from a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    connection: String,
    queue: String,
    record: JobRecord,
    /// The payload exactly as it was stored.
    #[serde(skip)]
    raw: String,
}

impl Job {
    /// Parses a stored payload.
    pub fn from_raw(
        connection: impl Into<String>,
        queue: impl Into<String>,
        raw: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let raw = raw.into();
        let record = serde_json::from_str(&raw)?;
        Ok(Self {
            connection: connection.into(),
            queue: queue.into(),
            record,
            raw,
        })
    }

    pub fn from_record(
        connection: impl Into<String>,
        queue: impl Into<String>,
        record: JobRecord,
    ) -> Result<Self, serde_json::Error> {
        let raw = serde_json::to_string(&record)?;
        Ok(Self {
            connection: connection.into(),
            queue: queue.into(),
            record,
            raw,
        })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The handler type.
    pub fn job_type(&self) -> &str {
        &self.record.job
    }

    pub fn data(&self) -> &Value {
        &self.record.data
    }

    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }

    pub fn created_at(&self) -> i64 {
        self.record.created_at
    }

    pub fn available_at(&self) -> Option<i64> {
        self.record.available_at
    }

    pub fn raw_payload(&self) -> &str {
        &self.raw
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Counts one more reservation. Attempts never decrease.
    pub(crate) fn increment_attempts(&mut self) {
        self.record.attempts += 1;
    }

    /// Seconds since the job was first pushed.
    pub fn age(&self, now: i64) -> i64 {
        now - self.record.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_new() {
        let record = JobRecord::new("send_email", json!({"to": "a@b.c"}), 1_000);
        assert!(!record.id.is_empty());
        assert_eq!(record.job, "send_email");
        assert_eq!(record.attempts, 0);
        assert_eq!(record.created_at, 1_000);
        assert!(record.available_at.is_none());
        assert!(record.is_available(0));
    }

    #[test]
    fn test_record_ids_unique() {
        let a = JobRecord::new("x", Value::Null, 0);
        let b = JobRecord::new("x", Value::Null, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_record_availability() {
        let record = JobRecord::new("x", Value::Null, 100).available_at(105);
        assert!(!record.is_available(104));
        assert!(record.is_available(105));
    }

    #[test]
    fn test_record_wire_format() {
        let record = JobRecord::new("x", json!([1]), 5);
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["job"], json!("x"));
        assert_eq!(value["data"], json!([1]));
        assert_eq!(value["attempts"], json!(0));
        assert_eq!(value["created_at"], json!(5));
        assert!(value.get("available_at").is_none());

        let delayed = serde_json::to_value(record.available_at(9)).expect("serialize");
        assert_eq!(delayed["available_at"], json!(9));
    }

    #[test]
    fn test_job_from_raw_keeps_payload() {
        let raw = r#"{"id":"1","job":"report","data":{"k":"v"},"attempts":2,"created_at":10}"#;
        let mut job = Job::from_raw("file", "default", raw).expect("parse");

        assert_eq!(job.id(), "1");
        assert_eq!(job.job_type(), "report");
        assert_eq!(job.data(), &json!({"k": "v"}));
        assert_eq!(job.connection(), "file");
        assert_eq!(job.queue(), "default");
        assert_eq!(job.raw_payload(), raw);
        assert_eq!(job.age(25), 15);

        job.increment_attempts();
        assert_eq!(job.attempts(), 3);
        assert_eq!(job.raw_payload(), raw);
    }

    #[test]
    fn test_job_from_raw_rejects_garbage() {
        assert!(Job::from_raw("file", "default", "not json").is_err());
    }

    #[test]
    fn test_failed_job_is_flat() {
        let job = Job::from_record("file", "q", JobRecord::new("x", json!(1), 3)).expect("record");
        let failed = serde_json::to_value(FailedJob::new(&job, "boom", 9)).expect("serialize");
        assert_eq!(failed["id"], json!(job.id()));
        assert_eq!(failed["job"], json!("x"));
        assert_eq!(failed["error"], json!("boom"));
        assert_eq!(failed["failed_at"], json!(9));
    }

    #[test]
    fn test_job_crosses_process_boundary() {
        let record = JobRecord::new("report", json!({"n": 1}), 0);
        let job = Job::from_record("redis", "high", record).expect("record");
        let wire = serde_json::to_value(&job).expect("serialize");
        let parsed: Job = serde_json::from_value(wire).expect("deserialize");

        assert_eq!(parsed.id(), job.id());
        assert_eq!(parsed.queue(), "high");
        assert_eq!(parsed.data(), job.data());
        assert!(parsed.raw_payload().is_empty());
    }
}
