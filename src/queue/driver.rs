//! Storage backend abstraction for job queues.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::job::Job;
use crate::error::QueueError;

/// A durable job queue backend.
///
/// Delivery is at-least-once: `pop` reserves a job and counts the attempt,
/// and the caller settles it with exactly one of [`delete`](Self::delete),
/// [`release`](Self::release) or [`fail`](Self::fail). Passing `None` as the
/// queue selects the connection's default queue.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Name of the connection this driver was created for.
    fn connection_name(&self) -> &str;

    /// Queue used when callers pass `None`.
    fn default_queue(&self) -> &str;

    /// Stores a job and returns its id.
    async fn push(
        &self,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError>;

    /// Stores a job that becomes visible to `pop` after `delay`.
    async fn later(
        &self,
        delay: Duration,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError>;

    /// Reserves the next ready job, incrementing its attempts.
    ///
    /// Never blocks waiting for work: an empty queue yields `Ok(None)`.
    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError>;

    /// Number of ready jobs. Delayed jobs are not counted until due.
    async fn size(&self, queue: Option<&str>) -> Result<usize, QueueError>;

    /// Removes every ready and delayed job, returning how many were removed.
    async fn clear(&self, queue: Option<&str>) -> Result<usize, QueueError>;

    /// Acknowledges a reserved job that completed.
    async fn delete(&self, job: &Job) -> Result<(), QueueError>;

    /// Puts a reserved job back, visible again after `delay`.
    async fn release(&self, job: &Job, delay: Duration) -> Result<(), QueueError>;

    /// Moves a reserved job to the failed store with `error`.
    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError>;

    /// Number of jobs in the failed store.
    async fn failed_size(&self, queue: Option<&str>) -> Result<usize, QueueError>;
}

/// Seconds to add to "now" for a delay, rounding partial seconds up.
pub(crate) fn delay_secs(delay: Duration) -> i64 {
    let secs = delay.as_secs() as i64;
    if delay.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_secs_rounds_up() {
        assert_eq!(delay_secs(Duration::ZERO), 0);
        assert_eq!(delay_secs(Duration::from_secs(5)), 5);
        assert_eq!(delay_secs(Duration::from_millis(1_500)), 2);
    }
}
