//! Job lifecycle events.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use super::job::Job;

#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job is about to run.
    Processing { job: Job },
    /// The job's handler succeeded and the job was deleted.
    Processed { job: Job, duration: Duration },
    /// The job's handler failed. `released` tells whether it will be
    /// retried or was moved to the failed store.
    Failed {
        job: Job,
        error: String,
        released: bool,
    },
}

impl JobEvent {
    pub fn job(&self) -> &Job {
        match self {
            JobEvent::Processing { job }
            | JobEvent::Processed { job, .. }
            | JobEvent::Failed { job, .. } => job,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Processing { .. } => "processing",
            JobEvent::Processed { .. } => "processed",
            JobEvent::Failed { .. } => "failed",
        }
    }
}

/// Receives job lifecycle events from the worker.
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: &JobEvent);
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventDispatcher for TracingEvents {
    fn dispatch(&self, event: &JobEvent) {
        let job = event.job();
        match event {
            JobEvent::Processing { .. } => info!(
                job_id = %job.id(),
                job = %job.job_type(),
                queue = %job.queue(),
                attempts = job.attempts(),
                "Processing job"
            ),
            JobEvent::Processed { duration, .. } => info!(
                job_id = %job.id(),
                job = %job.job_type(),
                duration_ms = duration.as_millis() as u64,
                "Job processed"
            ),
            JobEvent::Failed {
                error, released, ..
            } => warn!(
                job_id = %job.id(),
                job = %job.job_type(),
                attempts = job.attempts(),
                released,
                error = %error,
                "Job failed"
            ),
        }
    }
}

/// Keeps every dispatched event in memory.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<JobEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Event names in dispatch order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(JobEvent::name).collect()
    }
}

impl EventDispatcher for EventLog {
    fn dispatch(&self, event: &JobEvent) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event.clone());
    }
}

/// Sends each event to several dispatchers.
#[derive(Default)]
pub struct FanOut {
    dispatchers: Vec<std::sync::Arc<dyn EventDispatcher>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dispatcher: std::sync::Arc<dyn EventDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }
}

impl EventDispatcher for FanOut {
    fn dispatch(&self, event: &JobEvent) {
        for dispatcher in &self.dispatchers {
            dispatcher.dispatch(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobRecord;
    use serde_json::Value;
    use std::sync::Arc;

    #[test]
    fn test_event_log_fan_out() {
        let job = Job::from_record("file", "q", JobRecord::new("x", Value::Null, 0)).expect("job");
        let log = Arc::new(EventLog::new());
        let events = FanOut::new().with(Arc::new(TracingEvents)).with(log.clone());

        events.dispatch(&JobEvent::Processing { job: job.clone() });
        events.dispatch(&JobEvent::Failed {
            job,
            error: "boom".to_string(),
            released: true,
        });

        assert_eq!(log.names(), vec!["processing", "failed"]);
        assert_eq!(log.events()[1].job().job_type(), "x");
    }
}
