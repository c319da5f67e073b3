//! Handle to one worker process and its channels.

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::envelope::{ResultEnvelope, TaskEnvelope};
use super::runtime::{Runtime, SpawnedProcess};
use crate::error::PoolError;

type Drain = JoinHandle<io::Result<Vec<u8>>>;

/// A spawned worker process executing one task.
///
/// stdout and stderr are drained in the background from the moment the
/// process starts, so the child never blocks on a full pipe. The captured
/// bytes are handed out lazily by [`Process::output`] and
/// [`Process::error_output`].
pub struct Process {
    task_id: Uuid,
    envelope: TaskEnvelope,
    child: Option<Child>,
    pid: Option<u32>,
    stdout: Option<Drain>,
    stderr: Option<Drain>,
    output: Option<Vec<u8>>,
    error_output: Option<Vec<u8>>,
    exit_code: Option<i32>,
    started_at: Option<Instant>,
    stopped: bool,
}

impl Process {
    pub fn new(task_id: Uuid, envelope: TaskEnvelope) -> Self {
        Self {
            task_id,
            envelope,
            child: None,
            pid: None,
            stdout: None,
            stderr: None,
            output: None,
            error_output: None,
            exit_code: None,
            started_at: None,
            stopped: false,
        }
    }

    /// Spawns the process and hands it the task envelope.
    ///
    /// The envelope is written as one line and stdin is closed afterwards.
    /// A child that exits before reading its input is not an error here:
    /// it surfaces later as a malformed result.
    pub async fn start(&mut self, runtime: &dyn Runtime) -> Result<(), PoolError> {
        let payload = self.envelope.encode()?;
        let SpawnedProcess {
            child,
            mut stdin,
            stdout,
            stderr,
        } = runtime.spawn()?;

        self.pid = child.id();
        self.started_at = Some(Instant::now());
        self.stdout = Some(tokio::spawn(drain(stdout)));
        self.stderr = Some(tokio::spawn(drain(stderr)));
        self.child = Some(child);

        if let Err(e) = stdin.write_all(&payload).await {
            debug!(pid = ?self.pid, error = %e, "Worker closed stdin before reading its task");
        }
        if let Err(e) = stdin.shutdown().await {
            trace!(pid = ?self.pid, error = %e, "Closing worker stdin failed");
        }
        drop(stdin);

        debug!(
            pid = ?self.pid,
            task = %self.envelope.task,
            task_id = %self.task_id,
            runtime = runtime.name(),
            "Started task process"
        );
        Ok(())
    }

    /// Waits for the process to exit, killing it once `timeout` has elapsed
    /// since [`start`](Self::start).
    ///
    /// Returns the exit code.
    pub async fn wait(&mut self, timeout: Duration) -> Result<i32, PoolError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let Some(child) = self.child.as_mut() else {
            return Err(PoolError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "process was never started",
            )));
        };

        let remaining = self
            .started_at
            .map_or(timeout, |at| timeout.saturating_sub(at.elapsed()));

        match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                self.latch_exit_code(code);
                Ok(code)
            }
            Ok(Err(e)) => Err(PoolError::Io(e)),
            Err(_) => {
                let pid = self.pid.unwrap_or_default();
                warn!(pid, task_id = %self.task_id, ?timeout, "Task process timed out");
                self.stop().await;
                Err(PoolError::Timeout { pid, timeout })
            }
        }
    }

    /// Polls the OS for the process state without blocking.
    ///
    /// The exit code is latched on the first observation of the exit.
    pub fn is_running(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.latch_exit_code(status.code().unwrap_or(-1));
                false
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to poll worker process");
                false
            }
        }
    }

    /// Closes the channels, kills the process and reaps it. Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for drain in [self.stdout.as_ref(), self.stderr.as_ref()]
            .into_iter()
            .flatten()
        {
            if !drain.is_finished() {
                drain.abort();
            }
        }

        if let Some(child) = self.child.as_mut() {
            if self.exit_code.is_none() {
                if let Err(e) = child.start_kill() {
                    trace!(pid = ?self.pid, error = %e, "Kill request failed");
                }
                match child.wait().await {
                    Ok(status) => self.latch_exit_code(status.code().unwrap_or(-1)),
                    Err(e) => warn!(pid = ?self.pid, error = %e, "Failed to reap worker process"),
                }
            }
        }
    }

    /// Everything the process wrote to stdout.
    pub async fn output(&mut self) -> &[u8] {
        collect(&mut self.stdout, &mut self.output).await
    }

    /// Everything the process wrote to stderr, lossily decoded.
    pub async fn error_output(&mut self) -> String {
        String::from_utf8_lossy(collect(&mut self.stderr, &mut self.error_output).await)
            .into_owned()
    }

    /// Parses the result envelope from stdout.
    pub async fn result(&mut self) -> Result<ResultEnvelope, PoolError> {
        ResultEnvelope::decode(self.output().await)
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.envelope.task
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Time since the process was started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn latch_exit_code(&mut self, code: i32) {
        if self.exit_code.is_none() {
            trace!(pid = ?self.pid, exit_code = code, "Worker process exited");
            self.exit_code = Some(code);
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("task_id", &self.task_id)
            .field("task", &self.envelope.task)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .field("stopped", &self.stopped)
            .finish()
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect<'a>(drain: &mut Option<Drain>, cache: &'a mut Option<Vec<u8>>) -> &'a [u8] {
    if cache.is_none() {
        let bytes = match drain.take() {
            Some(handle) => match handle.await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to read worker channel");
                    Vec::new()
                }
                // Aborted by stop().
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        };
        *cache = Some(bytes);
    }
    cache.as_deref().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::runtime::PipeRuntime;
    use serde_json::json;

    fn sh(script: &str) -> PipeRuntime {
        PipeRuntime::new("/bin/sh").with_args(["-c", script])
    }

    fn envelope() -> TaskEnvelope {
        TaskEnvelope::new("echo", json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_start_writes_envelope_line() {
        // `head -n1` echoes the envelope line back, proving the separator.
        let runtime = sh("head -n1");
        let mut process = Process::new(Uuid::new_v4(), envelope());
        process.start(&runtime).await.expect("start");

        let code = process.wait(Duration::from_secs(10)).await.expect("wait");
        assert_eq!(code, 0);

        let echoed = TaskEnvelope::decode(process.output().await).expect("decode");
        assert_eq!(echoed, envelope());
        assert!(process.pid().is_some());
    }

    #[tokio::test]
    async fn test_deadline_counts_from_start() {
        let runtime = sh("cat >/dev/null; sleep 10");
        let mut process = Process::new(Uuid::new_v4(), envelope());
        process.start(&runtime).await.expect("start");

        tokio::time::sleep(Duration::from_millis(400)).await;
        let waited = Instant::now();
        let err = process
            .wait(Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Timeout { .. }));
        assert!(waited.elapsed() < Duration::from_millis(400));
        assert!(process.is_stopped());
    }

    #[tokio::test]
    async fn test_exit_code_latched_once() {
        let runtime = sh("cat >/dev/null; echo oops >&2; exit 3");
        let mut process = Process::new(Uuid::new_v4(), envelope());
        process.start(&runtime).await.expect("start");

        assert_eq!(process.wait(Duration::from_secs(10)).await.expect("wait"), 3);
        assert!(!process.is_running());
        assert_eq!(process.exit_code(), Some(3));
        assert_eq!(process.error_output().await.trim(), "oops");
        assert!(matches!(
            process.result().await,
            Err(PoolError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_timeout_stops_process() {
        let runtime = sh("sleep 30");
        let mut process = Process::new(Uuid::new_v4(), envelope());
        process.start(&runtime).await.expect("start");
        assert!(process.is_running());

        let err = process
            .wait(Duration::from_millis(100))
            .await
            .expect_err("should time out");
        assert!(matches!(err, PoolError::Timeout { .. }));
        assert!(process.is_stopped());
        assert!(!process.is_running());

        // Idempotent.
        process.stop().await;
        assert!(process.is_stopped());
    }

    #[tokio::test]
    async fn test_wait_before_start() {
        let mut process = Process::new(Uuid::new_v4(), envelope());
        assert!(process.wait(Duration::from_secs(1)).await.is_err());
        assert!(!process.is_running());
    }
}
