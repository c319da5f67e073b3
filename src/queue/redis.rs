//! Redis queue driver.
//!
//! # Keys
//!
//! - `{prefix}{queue}`: list of ready jobs (RPUSH to enqueue, LPOP to reserve)
//! - `{prefix}{queue}:delayed`: sorted set of delayed jobs scored by the
//!   epoch second they become available
//! - `{prefix}{queue}:failed`: list of failed job records
//!
//! Due delayed jobs are migrated to the ready list by a Lua script before
//! every `pop` and `size`, so the move is atomic across workers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::{debug, warn};

use super::clock::Clock;
use super::driver::{delay_secs, QueueDriver};
use super::job::{FailedJob, Job, JobRecord};
use crate::error::QueueError;

/// Moves due members of KEYS[1] onto the tail of KEYS[2].
const MIGRATE_DUE_JOBS: &str = r#"
local due = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1])
if #due > 0 then
    redis.call('zremrangebyscore', KEYS[1], '-inf', ARGV[1])
    for i = 1, #due, 100 do
        redis.call('rpush', KEYS[2], unpack(due, i, math.min(i + 99, #due)))
    end
end
return #due
"#;

/// Queue driver backed by Redis lists and sorted sets.
#[derive(Clone)]
pub struct RedisDriver {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    connection: String,
    prefix: String,
    default_queue: String,
    clock: Arc<dyn Clock>,
    migrate: Arc<Script>,
}

impl RedisDriver {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        connection: impl Into<String>,
        url: &str,
        prefix: impl Into<String>,
        default_queue: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(url).map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(
            redis,
            connection,
            prefix,
            default_queue,
            clock,
        ))
    }

    /// Creates a driver from an existing ConnectionManager.
    pub fn from_connection(
        redis: ConnectionManager,
        connection: impl Into<String>,
        prefix: impl Into<String>,
        default_queue: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            redis,
            connection: connection.into(),
            prefix: prefix.into(),
            default_queue: default_queue.into(),
            clock,
            migrate: Arc::new(Script::new(MIGRATE_DUE_JOBS)),
        }
    }

    fn ready_key(&self, queue: Option<&str>) -> String {
        format!(
            "{}{}",
            self.prefix,
            queue.unwrap_or(&self.default_queue)
        )
    }

    fn delayed_key(&self, queue: Option<&str>) -> String {
        format!("{}:delayed", self.ready_key(queue))
    }

    fn failed_key(&self, queue: Option<&str>) -> String {
        format!("{}:failed", self.ready_key(queue))
    }

    /// Moves due delayed jobs onto the ready list.
    async fn migrate_due(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let moved: usize = self
            .migrate
            .key(self.delayed_key(queue))
            .key(self.ready_key(queue))
            .arg(self.clock.now())
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            debug!(
                queue = queue.unwrap_or(&self.default_queue),
                moved,
                "Migrated due delayed jobs"
            );
        }
        Ok(moved)
    }

    async fn store(&self, record: &JobRecord, queue: Option<&str>) -> Result<(), QueueError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        match record.available_at {
            Some(available_at) => {
                conn.zadd::<_, _, _, ()>(self.delayed_key(queue), payload, available_at)
                    .await?
            }
            None => conn.rpush::<_, _, ()>(self.ready_key(queue), payload).await?,
        }
        Ok(())
    }
}

impl fmt::Debug for RedisDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisDriver")
            .field("connection", &self.connection)
            .field("prefix", &self.prefix)
            .field("default_queue", &self.default_queue)
            .finish()
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    async fn push(
        &self,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        let record = JobRecord::new(job_type, data, self.clock.now());
        self.store(&record, queue).await?;
        debug!(job_id = %record.id, queue = %self.ready_key(queue), job = %job_type, "Job pushed");
        Ok(record.id)
    }

    async fn later(
        &self,
        delay: Duration,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        let now = self.clock.now();
        let record = JobRecord::new(job_type, data, now).available_at(now + delay_secs(delay));
        self.store(&record, queue).await?;
        debug!(
            job_id = %record.id,
            queue = %self.ready_key(queue),
            available_at = ?record.available_at,
            "Delayed job pushed"
        );
        Ok(record.id)
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        self.migrate_due(queue).await?;

        let mut conn = self.redis.clone();
        let queue_name = queue.unwrap_or(&self.default_queue);

        loop {
            let payload: Option<String> = conn.lpop(self.ready_key(queue), None).await?;
            let Some(payload) = payload else {
                return Ok(None);
            };

            match Job::from_raw(&self.connection, queue_name, payload.clone()) {
                Ok(mut job) => {
                    job.increment_attempts();
                    debug!(job_id = %job.id(), queue = %queue_name, attempts = job.attempts(), "Job reserved");
                    return Ok(Some(job));
                }
                Err(e) => {
                    // Already removed from the list: park the raw payload.
                    warn!(queue = %queue_name, error = %e, "Malformed job payload moved to failed list");
                    conn.rpush::<_, _, ()>(self.failed_key(queue), payload)
                        .await?;
                }
            }
        }
    }

    async fn size(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        self.migrate_due(queue).await?;
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.ready_key(queue)).await?;
        Ok(len)
    }

    async fn clear(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let ready = self.ready_key(queue);
        let delayed = self.delayed_key(queue);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .llen(&ready)
            .zcard(&delayed)
            .del(&ready)
            .ignore()
            .del(&delayed)
            .ignore();
        let (ready_len, delayed_len): (usize, usize) = pipe.query_async(&mut conn).await?;

        Ok(ready_len + delayed_len)
    }

    async fn delete(&self, _job: &Job) -> Result<(), QueueError> {
        // LPOP already removed the reserved payload.
        Ok(())
    }

    async fn release(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        let mut record = job.record().clone();
        record.available_at = if delay.is_zero() {
            None
        } else {
            Some(self.clock.now() + delay_secs(delay))
        };
        self.store(&record, Some(job.queue())).await?;
        debug!(
            job_id = %record.id,
            queue = %job.queue(),
            attempts = record.attempts,
            delay_secs = delay.as_secs(),
            "Job released"
        );
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let failed = FailedJob::new(job, error, self.clock.now());
        let payload = serde_json::to_string(&failed)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(self.failed_key(Some(job.queue())), payload)
            .await?;
        Ok(())
    }

    async fn failed_size(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.failed_key(queue)).await?;
        Ok(len)
    }
}
