//! Spawn strategies for worker processes.
//!
//! Every strategy hands back the same [`SpawnedProcess`] triple (child plus
//! stdin/stdout/stderr), so [`super::Process`] does not care how the child
//! was created.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::PoolError;

/// Argument that switches the `job-forge` binary into worker mode.
pub const EXEC_ARG: &str = "exec";

/// A freshly spawned child with its three channels detached.
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl SpawnedProcess {
    /// OS process id, if the child has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Policy used to create worker processes.
pub trait Runtime: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Spawns one worker process with piped stdin/stdout/stderr.
    fn spawn(&self) -> Result<SpawnedProcess, PoolError>;
}

/// Spawns a configured worker program with three pipes.
#[derive(Debug, Clone)]
pub struct PipeRuntime {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl PipeRuntime {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Convenience for a `job-forge` compatible binary: `<program> exec`.
    pub fn entrypoint(program: impl Into<PathBuf>) -> Self {
        Self::new(program).with_args([EXEC_ARG])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn spawn_error(&self, reason: impl Into<String>) -> PoolError {
        PoolError::Spawn {
            program: self.program.display().to_string(),
            reason: reason.into(),
        }
    }
}

impl Runtime for PipeRuntime {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn spawn(&self) -> Result<SpawnedProcess, PoolError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e.to_string()))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(self.spawn_error("child channels were not piped"));
        };

        debug!(
            program = %self.program.display(),
            pid = ?child.id(),
            "Spawned worker process"
        );

        Ok(SpawnedProcess {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Launches the current executable image in worker mode.
///
/// The running binary already carries the task registry, so no separate
/// worker program has to be deployed. When the current executable cannot be
/// resolved the inner [`PipeRuntime`] is used instead.
#[derive(Debug, Clone, Default)]
pub struct ReexecRuntime {
    fallback: Option<PipeRuntime>,
}

impl ReexecRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: PipeRuntime) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl Runtime for ReexecRuntime {
    fn name(&self) -> &'static str {
        "reexec"
    }

    fn spawn(&self) -> Result<SpawnedProcess, PoolError> {
        match std::env::current_exe() {
            Ok(exe) => PipeRuntime::entrypoint(exe).spawn(),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(error = %e, "Current executable unavailable, using pipe runtime");
                    fallback.spawn()
                }
                None => Err(PoolError::Spawn {
                    program: "<current executable>".to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// Spawn strategy selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Spawn an explicitly configured worker program.
    Pipe,
    /// Re-launch the current executable, falling back to `Pipe`.
    #[default]
    Reexec,
}

impl RuntimeKind {
    /// Builds the runtime. `program` is the worker program for `Pipe` and
    /// the fallback for `Reexec`.
    pub fn build(self, program: Option<PathBuf>) -> Result<Arc<dyn Runtime>, PoolError> {
        match self {
            RuntimeKind::Pipe => {
                let program = program.ok_or_else(|| PoolError::Spawn {
                    program: "<unset>".to_string(),
                    reason: "the pipe runtime needs a worker program".to_string(),
                })?;
                Ok(Arc::new(PipeRuntime::entrypoint(program)))
            }
            RuntimeKind::Reexec => {
                let mut runtime = ReexecRuntime::new();
                if let Some(program) = program {
                    runtime = runtime.with_fallback(PipeRuntime::entrypoint(program));
                }
                Ok(Arc::new(runtime))
            }
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pipe" => Ok(RuntimeKind::Pipe),
            "reexec" | "fork" => Ok(RuntimeKind::Reexec),
            other => Err(format!("unknown runtime '{}', expected pipe or reexec", other)),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Pipe => write!(f, "pipe"),
            RuntimeKind::Reexec => write!(f, "reexec"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_runtime_builder() {
        let runtime = PipeRuntime::entrypoint("/usr/local/bin/job-forge").with_env("A", "1");
        assert_eq!(runtime.args(), &[EXEC_ARG.to_string()]);
        assert_eq!(runtime.name(), "pipe");
        assert_eq!(runtime.envs, vec![("A".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_pipe_runtime_missing_program() {
        let runtime = PipeRuntime::new("/definitely/not/a/real/program");
        let err = runtime.spawn().err().expect("spawn should fail");
        match err {
            PoolError::Spawn { program, .. } => {
                assert_eq!(program, "/definitely/not/a/real/program")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("pipe".parse::<RuntimeKind>(), Ok(RuntimeKind::Pipe));
        assert_eq!("Fork".parse::<RuntimeKind>(), Ok(RuntimeKind::Reexec));
        assert!("threads".parse::<RuntimeKind>().is_err());
        assert_eq!(RuntimeKind::default().to_string(), "reexec");
    }

    #[test]
    fn test_pipe_kind_requires_program() {
        assert!(RuntimeKind::Pipe.build(None).is_err());
        let runtime = RuntimeKind::Reexec.build(None).expect("reexec needs no program");
        assert_eq!(runtime.name(), "reexec");
    }
}
