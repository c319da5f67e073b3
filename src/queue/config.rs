//! Queue connection and worker configuration.
//!
//! Connections are described in YAML:
//!
//! ```yaml
//! default: file
//! connections:
//!   file:
//!     driver: file
//!     path: ./storage/queue
//!   redis:
//!     driver: redis
//!     url: redis://127.0.0.1:6379
//!     prefix: "queues:"
//!     queue: default
//! ```
//!
//! Worker settings come from [`WorkerConfig::from_env`] and CLI overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pool::RuntimeKind;

/// Name of the queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Storage backend kinds a driver factory can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    File,
    Redis,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::File => write!(f, "file"),
            DriverKind::Redis => write!(f, "redis"),
        }
    }
}

/// Settings for one named connection, tagged by `driver`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum ConnectionConfig {
    File {
        #[serde(default = "default_file_path")]
        path: PathBuf,
        #[serde(default = "default_queue_name")]
        queue: String,
    },
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_queue_name")]
        queue: String,
    },
}

fn default_file_path() -> PathBuf {
    PathBuf::from("./storage/queue")
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE.to_string()
}

impl ConnectionConfig {
    /// A file connection rooted at `path` using the default queue.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ConnectionConfig::File {
            path: path.into(),
            queue: default_queue_name(),
        }
    }

    /// A redis connection with no key prefix using the default queue.
    pub fn redis(url: impl Into<String>) -> Self {
        ConnectionConfig::Redis {
            url: url.into(),
            prefix: String::new(),
            queue: default_queue_name(),
        }
    }

    pub fn kind(&self) -> DriverKind {
        match self {
            ConnectionConfig::File { .. } => DriverKind::File,
            ConnectionConfig::Redis { .. } => DriverKind::Redis,
        }
    }

    pub fn default_queue(&self) -> &str {
        match self {
            ConnectionConfig::File { queue, .. } | ConnectionConfig::Redis { queue, .. } => queue,
        }
    }
}

/// Named queue connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Connection used when callers do not name one.
    pub default: String,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert("file".to_string(), ConnectionConfig::file(default_file_path()));
        Self {
            default: "file".to_string(),
            connections,
        }
    }
}

impl QueueConfig {
    /// A configuration with a single connection, which is the default.
    pub fn single(name: impl Into<String>, connection: ConnectionConfig) -> Self {
        let name = name.into();
        let mut connections = BTreeMap::new();
        connections.insert(name.clone(), connection);
        Self {
            default: name,
            connections,
        }
    }

    /// Loads and validates a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Adds or replaces a connection.
    pub fn with_connection(mut self, name: impl Into<String>, connection: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), connection);
        self
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = name.into();
        self
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.get(name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.connections.contains_key(&self.default) {
            return Err(ConfigError::ValidationFailed(format!(
                "default connection '{}' is not configured",
                self.default
            )));
        }

        for (name, connection) in &self.connections {
            if connection.default_queue().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "connection '{}' has an empty queue name",
                    name
                )));
            }
            if let ConnectionConfig::Redis { url, .. } = connection {
                if url.is_empty() {
                    return Err(ConfigError::ValidationFailed(format!(
                        "connection '{}' has an empty redis url",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Settings for the queue worker daemon.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Source
    /// Connection to pull from; `None` uses the configured default.
    pub connection: Option<String>,
    /// Queue to pull from; `None` uses the connection's default.
    pub queue: Option<String>,

    // Execution
    /// Jobs run in parallel per batch.
    pub concurrency: usize,
    /// Attempts before a job is moved to the failed store.
    pub max_tries: u32,
    /// Sleep when no job was available.
    pub sleep: Duration,
    /// Timeout for one job process.
    pub timeout: Duration,
    /// Delay before a failed job becomes available again.
    pub backoff: Duration,
    /// How worker processes are spawned.
    pub runtime: RuntimeKind,
    /// Worker program for the pipe runtime, and the fallback for re-exec.
    pub worker_program: Option<PathBuf>,
    /// Consecutive spawn failures tolerated before the worker gives up.
    pub max_spawn_failures: u32,

    // Health
    /// Memory ceiling in megabytes.
    pub memory_limit_mb: u64,
    /// Fraction of the memory ceiling at which the worker stops.
    pub memory_threshold: f64,
    /// Fraction of the memory ceiling at which maintenance runs.
    pub maintenance_threshold: f64,
    /// Longest time the worker keeps running.
    pub max_runtime: Duration,
    /// Interval between health reports.
    pub report_interval: Duration,

    // Stopping
    /// Exit once the queue is empty.
    pub stop_when_empty: bool,
    /// Exit after this many jobs were finished.
    pub max_jobs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connection: None,
            queue: None,

            concurrency: 4,
            max_tries: 3,
            sleep: Duration::from_secs(3),
            timeout: Duration::from_secs(60),
            backoff: Duration::from_secs(5),
            runtime: RuntimeKind::default(),
            worker_program: None,
            max_spawn_failures: 3,

            memory_limit_mb: 128,
            memory_threshold: 0.9,
            maintenance_threshold: 0.7,
            max_runtime: Duration::from_secs(3600),
            report_interval: Duration::from_secs(60),

            stop_when_empty: false,
            max_jobs: None,
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUEUE_CONNECTION`: Connection name (default: configured default)
    /// - `QUEUE_NAME`: Queue name (default: connection default)
    /// - `QUEUE_CONCURRENCY`: Jobs per batch (default: 4)
    /// - `QUEUE_MAX_TRIES`: Attempts before failing a job (default: 3)
    /// - `QUEUE_SLEEP_SECS`: Idle sleep in seconds (default: 3)
    /// - `QUEUE_TIMEOUT_SECS`: Job timeout in seconds (default: 60)
    /// - `QUEUE_BACKOFF_SECS`: Retry delay in seconds (default: 5)
    /// - `QUEUE_MEMORY_MB`: Memory ceiling in MB (default: 128)
    /// - `QUEUE_MAX_RUNTIME_SECS`: Maximum runtime in seconds (default: 3600)
    /// - `QUEUE_RUNTIME`: `pipe` or `reexec` (default: reexec)
    /// - `QUEUE_WORKER_PROGRAM`: Worker program path
    /// - `QUEUE_STOP_WHEN_EMPTY`: Exit when the queue is empty (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Source
        if let Some(val) = lookup("QUEUE_CONNECTION") {
            config.connection = Some(val);
        }

        if let Some(val) = lookup("QUEUE_NAME") {
            config.queue = Some(val);
        }

        // Execution
        if let Some(val) = lookup("QUEUE_CONCURRENCY") {
            config.concurrency = parse_env_value(&val, "QUEUE_CONCURRENCY")?;
        }

        if let Some(val) = lookup("QUEUE_MAX_TRIES") {
            config.max_tries = parse_env_value(&val, "QUEUE_MAX_TRIES")?;
        }

        if let Some(val) = lookup("QUEUE_SLEEP_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_SLEEP_SECS")?;
            config.sleep = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_TIMEOUT_SECS")?;
            config.timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_BACKOFF_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_BACKOFF_SECS")?;
            config.backoff = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_RUNTIME") {
            config.runtime = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "QUEUE_RUNTIME".to_string(),
                message,
            })?;
        }

        if let Some(val) = lookup("QUEUE_WORKER_PROGRAM") {
            config.worker_program = Some(PathBuf::from(val));
        }

        // Health
        if let Some(val) = lookup("QUEUE_MEMORY_MB") {
            config.memory_limit_mb = parse_env_value(&val, "QUEUE_MEMORY_MB")?;
        }

        if let Some(val) = lookup("QUEUE_MAX_RUNTIME_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_MAX_RUNTIME_SECS")?;
            config.max_runtime = Duration::from_secs(secs);
        }

        // Stopping
        if let Some(val) = lookup("QUEUE_STOP_WHEN_EMPTY") {
            config.stop_when_empty = parse_env_bool(&val, "QUEUE_STOP_WHEN_EMPTY")?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.max_tries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tries must be greater than 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "timeout must be greater than 0".to_string(),
            ));
        }

        if self.memory_limit_mb == 0 {
            return Err(ConfigError::ValidationFailed(
                "memory_limit_mb must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.memory_threshold) || self.memory_threshold == 0.0 {
            return Err(ConfigError::ValidationFailed(
                "memory_threshold must be in (0, 1]".to_string(),
            ));
        }

        if self.maintenance_threshold <= 0.0 || self.maintenance_threshold > self.memory_threshold
        {
            return Err(ConfigError::ValidationFailed(
                "maintenance_threshold must be in (0, memory_threshold]".to_string(),
            ));
        }

        if self.max_runtime.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "max_runtime must be greater than 0".to_string(),
            ));
        }

        if self.runtime == RuntimeKind::Pipe && self.worker_program.is_none() {
            return Err(ConfigError::ValidationFailed(
                "the pipe runtime requires worker_program".to_string(),
            ));
        }

        Ok(())
    }

    /// Memory ceiling in bytes.
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    // Builder methods

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_max_spawn_failures(mut self, failures: u32) -> Self {
        self.max_spawn_failures = failures;
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_stop_when_empty(mut self, stop: bool) -> Self {
        self.stop_when_empty = stop;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_queue_config() {
        let config = QueueConfig::default();
        assert_eq!(config.default, "file");
        assert_eq!(
            config.connection("file"),
            Some(&ConnectionConfig::file("./storage/queue"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_config_from_yaml() {
        let yaml = r#"
default: redis
connections:
  local:
    driver: file
    path: /var/spool/jobs
  redis:
    driver: redis
    url: redis://cache:6379/2
    prefix: "queues:"
    queue: high
"#;
        let config = QueueConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.default, "redis");

        let local = config.connection("local").expect("local");
        assert_eq!(local.kind(), DriverKind::File);
        assert_eq!(local.default_queue(), DEFAULT_QUEUE);

        match config.connection("redis").expect("redis") {
            ConnectionConfig::Redis { url, prefix, queue } => {
                assert_eq!(url, "redis://cache:6379/2");
                assert_eq!(prefix, "queues:");
                assert_eq!(queue, "high");
            }
            other => panic!("unexpected connection: {other:?}"),
        }
    }

    #[test]
    fn test_queue_config_unknown_driver() {
        let yaml = "default: x\nconnections:\n  x:\n    driver: sqs\n";
        assert!(matches!(
            QueueConfig::from_yaml_str(yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_queue_config_missing_default() {
        let config = QueueConfig::single("file", ConnectionConfig::file("/tmp/q")).with_default("nope");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_queue_config_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.yaml");
        std::fs::write(&path, "default: f\nconnections:\n  f:\n    driver: file\n").expect("write");

        let config = QueueConfig::from_file(&path).expect("load");
        assert_eq!(
            config.connection("f"),
            Some(&ConnectionConfig::file("./storage/queue"))
        );
        assert!(matches!(
            QueueConfig::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_default_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_tries, 3);
        assert_eq!(config.sleep, Duration::from_secs(3));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.memory_limit_mb, 128);
        assert_eq!(config.memory_limit_bytes(), 128 * 1024 * 1024);
        assert_eq!(config.max_runtime, Duration::from_secs(3600));
        assert_eq!(config.runtime, RuntimeKind::Reexec);
        assert!(!config.stop_when_empty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new()
            .with_connection("redis")
            .with_queue("emails")
            .with_concurrency(8)
            .with_max_tries(5)
            .with_backoff(Duration::ZERO)
            .with_runtime(RuntimeKind::Pipe)
            .with_worker_program("/usr/bin/job-forge")
            .with_stop_when_empty(true)
            .with_max_jobs(10);

        assert_eq!(config.connection.as_deref(), Some("redis"));
        assert_eq!(config.queue.as_deref(), Some("emails"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_tries, 5);
        assert_eq!(config.backoff, Duration::ZERO);
        assert_eq!(config.max_jobs, Some(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_config_from_lookup() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("QUEUE_CONCURRENCY", "2"),
            ("QUEUE_MAX_TRIES", "7"),
            ("QUEUE_SLEEP_SECS", "1"),
            ("QUEUE_MEMORY_MB", "512"),
            ("QUEUE_RUNTIME", "pipe"),
            ("QUEUE_WORKER_PROGRAM", "/opt/worker"),
            ("QUEUE_STOP_WHEN_EMPTY", "yes"),
        ]))
        .expect("valid env");

        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_tries, 7);
        assert_eq!(config.sleep, Duration::from_secs(1));
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.runtime, RuntimeKind::Pipe);
        assert_eq!(config.worker_program, Some(PathBuf::from("/opt/worker")));
        assert!(config.stop_when_empty);
    }

    #[test]
    fn test_worker_config_invalid_env_value() {
        let err = WorkerConfig::from_lookup(lookup(&[("QUEUE_CONCURRENCY", "many")])).unwrap_err();
        assert!(err.to_string().contains("QUEUE_CONCURRENCY"));

        let err = WorkerConfig::from_lookup(lookup(&[("QUEUE_RUNTIME", "thread")])).unwrap_err();
        assert!(err.to_string().contains("QUEUE_RUNTIME"));
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let result = WorkerConfig::default().with_concurrency(0).validate();
        assert!(result.unwrap_err().to_string().contains("concurrency"));
    }

    #[test]
    fn test_validation_zero_tries() {
        let result = WorkerConfig::default().with_max_tries(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_tries"));
    }

    #[test]
    fn test_validation_pipe_needs_program() {
        let result = WorkerConfig::default()
            .with_runtime(RuntimeKind::Pipe)
            .validate();
        assert!(result.unwrap_err().to_string().contains("worker_program"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("ON", "K").expect("bool"));
        assert!(!parse_env_bool("0", "K").expect("bool"));
        assert!(parse_env_bool("maybe", "K").is_err());
    }
}
