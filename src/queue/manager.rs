//! Named queue connections.
//!
//! The manager resolves connection names from [`QueueConfig`] to live
//! drivers. Drivers are built by the [`DriverFactory`] registered for the
//! connection's [`DriverKind`] and cached until purged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::config::{ConnectionConfig, DriverKind, QueueConfig};
use super::driver::QueueDriver;
use super::file::FileDriver;
use super::job::Job;
use super::redis::RedisDriver;
use crate::error::QueueError;

/// Builds drivers for one kind of connection.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn QueueDriver>, QueueError>;
}

/// Builds [`FileDriver`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDriverFactory;

#[async_trait]
impl DriverFactory for FileDriverFactory {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn QueueDriver>, QueueError> {
        match config {
            ConnectionConfig::File { path, queue } => {
                Ok(Arc::new(FileDriver::new(name, path.clone(), queue.clone(), clock)))
            }
            other => Err(QueueError::UnsupportedDriver(other.kind().to_string())),
        }
    }
}

/// Builds [`RedisDriver`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisDriverFactory;

#[async_trait]
impl DriverFactory for RedisDriverFactory {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn QueueDriver>, QueueError> {
        match config {
            ConnectionConfig::Redis { url, prefix, queue } => {
                let driver =
                    RedisDriver::connect(name, url, prefix.clone(), queue.clone(), clock).await?;
                Ok(Arc::new(driver))
            }
            other => Err(QueueError::UnsupportedDriver(other.kind().to_string())),
        }
    }
}

/// Registry of named queue connections.
pub struct QueueManager {
    config: QueueConfig,
    factories: HashMap<DriverKind, Arc<dyn DriverFactory>>,
    connections: Mutex<HashMap<String, Arc<dyn QueueDriver>>>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    /// Creates a manager with the file and redis factories registered.
    pub fn new(config: QueueConfig) -> Self {
        let mut factories: HashMap<DriverKind, Arc<dyn DriverFactory>> = HashMap::new();
        factories.insert(DriverKind::File, Arc::new(FileDriverFactory));
        factories.insert(DriverKind::Redis, Arc::new(RedisDriverFactory));

        Self {
            config,
            factories,
            connections: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock handed to drivers created from now on.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the factory used for `kind`.
    pub fn extend(&mut self, kind: DriverKind, factory: Arc<dyn DriverFactory>) -> &mut Self {
        self.factories.insert(kind, factory);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn default_connection(&self) -> &str {
        &self.config.default
    }

    /// Returns the driver for `name` (or the default), connecting on first
    /// use.
    pub async fn connection(&self, name: Option<&str>) -> Result<Arc<dyn QueueDriver>, QueueError> {
        let name = name.unwrap_or(&self.config.default);
        let mut connections = self.connections.lock().await;

        if let Some(driver) = connections.get(name) {
            return Ok(Arc::clone(driver));
        }

        let config = self
            .config
            .connection(name)
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))?;
        let factory = self
            .factories
            .get(&config.kind())
            .ok_or_else(|| QueueError::UnsupportedDriver(config.kind().to_string()))?;

        let driver = factory.connect(name, config, Arc::clone(&self.clock)).await?;
        info!(connection = %name, driver = %config.kind(), "Queue connection established");

        connections.insert(name.to_string(), Arc::clone(&driver));
        Ok(driver)
    }

    /// Drops the cached driver for `name` (or the default); the next
    /// lookup reconnects.
    pub async fn purge(&self, name: Option<&str>) -> bool {
        let name = name.unwrap_or(&self.config.default);
        let removed = self.connections.lock().await.remove(name).is_some();
        if removed {
            debug!(connection = %name, "Queue connection purged");
        }
        removed
    }

    /// Number of cached connections.
    pub async fn connected(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn push(
        &self,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        self.connection(None).await?.push(job_type, data, queue).await
    }

    pub async fn later(
        &self,
        delay: Duration,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        self.connection(None)
            .await?
            .later(delay, job_type, data, queue)
            .await
    }

    pub async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        self.connection(None).await?.pop(queue).await
    }

    pub async fn size(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        self.connection(None).await?.size(queue).await
    }

    pub async fn clear(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        self.connection(None).await?.clear(queue).await
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.config)
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
