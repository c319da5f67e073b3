//! File-system queue driver.
//!
//! # Layout
//!
//! ```text
//! <base>/<queue>/<id>.job        ready or delayed job record (JSON)
//! <base>/<queue>/delayed/<id>    epoch seconds the job becomes available
//! <base>/<queue>/failed/<id>.job failed job record with its error
//! ```
//!
//! A job file whose id has a `delayed/` sentinel is invisible until the
//! sentinel expires; sentinels are promoted lazily by `pop` and `size`.
//! Several workers may share a directory: `pop` takes a non-blocking
//! exclusive lock on a candidate, and whoever loses the race skips to
//! the next file. Records are written to a dot-prefixed temporary file and
//! renamed into place, so readers never see a partial record.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::driver::{delay_secs, QueueDriver};
use super::job::{FailedJob, Job, JobRecord};
use super::lock::FileLock;
use crate::error::QueueError;

const JOB_EXTENSION: &str = ".job";
const DELAYED_DIR: &str = "delayed";
const FAILED_DIR: &str = "failed";

/// Queue driver storing one file per job.
#[derive(Debug, Clone)]
pub struct FileDriver {
    store: Arc<FileStore>,
}

#[derive(Debug)]
struct FileStore {
    connection: String,
    base: PathBuf,
    default_queue: String,
    clock: Arc<dyn Clock>,
}

struct Candidate {
    modified: SystemTime,
    name: String,
    path: PathBuf,
}

impl FileDriver {
    pub fn new(
        connection: impl Into<String>,
        base: impl Into<PathBuf>,
        default_queue: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: Arc::new(FileStore {
                connection: connection.into(),
                base: base.into(),
                default_queue: default_queue.into(),
                clock,
            }),
        }
    }

    /// Root directory holding one sub-directory per queue.
    pub fn base(&self) -> &Path {
        &self.store.base
    }

    fn queue_name(&self, queue: Option<&str>) -> Result<String, QueueError> {
        let name = queue.unwrap_or(&self.store.default_queue);
        validate_queue_name(name)?;
        Ok(name.to_string())
    }

    /// Runs file-system work off the async executor.
    async fn blocking<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&FileStore) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| QueueError::Io(io::Error::other(e)))?
    }
}

#[async_trait]
impl QueueDriver for FileDriver {
    fn connection_name(&self) -> &str {
        &self.store.connection
    }

    fn default_queue(&self) -> &str {
        &self.store.default_queue
    }

    async fn push(
        &self,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        let queue = self.queue_name(queue)?;
        let job_type = job_type.to_string();
        self.blocking(move |store| {
            let record = JobRecord::new(job_type, data, store.clock.now());
            store.write_record(&queue, &record)?;
            debug!(job_id = %record.id, queue = %queue, job = %record.job, "Job pushed");
            Ok(record.id)
        })
        .await
    }

    async fn later(
        &self,
        delay: Duration,
        job_type: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        let queue = self.queue_name(queue)?;
        let job_type = job_type.to_string();
        self.blocking(move |store| {
            let now = store.clock.now();
            let record = JobRecord::new(job_type, data, now).available_at(now + delay_secs(delay));
            store.write_record(&queue, &record)?;
            debug!(
                job_id = %record.id,
                queue = %queue,
                available_at = ?record.available_at,
                "Delayed job pushed"
            );
            Ok(record.id)
        })
        .await
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        let queue = self.queue_name(queue)?;
        self.blocking(move |store| store.pop(&queue)).await
    }

    async fn size(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let queue = self.queue_name(queue)?;
        self.blocking(move |store| {
            let dir = store.queue_dir(&queue);
            let delayed = store.promote(&dir)?;
            Ok(ready_jobs(&dir, &delayed)?.len())
        })
        .await
    }

    async fn clear(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let queue = self.queue_name(queue)?;
        self.blocking(move |store| {
            let dir = store.queue_dir(&queue);
            let mut removed = 0;
            for entry in read_dir_or_empty(&dir)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if job_id_of(&name).is_some() && remove_if_exists(&entry.path())? {
                    removed += 1;
                }
            }
            for entry in read_dir_or_empty(&dir.join(DELAYED_DIR))? {
                remove_if_exists(&entry.path())?;
            }
            debug!(queue = %queue, removed, "Queue cleared");
            Ok(removed)
        })
        .await
    }

    async fn delete(&self, job: &Job) -> Result<(), QueueError> {
        validate_queue_name(job.queue())?;
        let job = job.clone();
        self.blocking(move |store| {
            let dir = store.queue_dir(job.queue());
            remove_if_exists(&job_path(&dir, job.id()))?;
            remove_if_exists(&dir.join(DELAYED_DIR).join(job.id()))?;
            Ok(())
        })
        .await
    }

    async fn release(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        validate_queue_name(job.queue())?;
        let job = job.clone();
        self.blocking(move |store| {
            let dir = store.queue_dir(job.queue());
            let mut record = job.record().clone();
            if delay.is_zero() {
                record.available_at = None;
                remove_if_exists(&dir.join(DELAYED_DIR).join(job.id()))?;
            } else {
                record.available_at = Some(store.clock.now() + delay_secs(delay));
            }
            store.write_record(job.queue(), &record)?;
            debug!(
                job_id = %record.id,
                queue = %job.queue(),
                attempts = record.attempts,
                delay_secs = delay.as_secs(),
                "Job released"
            );
            Ok(())
        })
        .await
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        validate_queue_name(job.queue())?;
        let job = job.clone();
        let error = error.to_string();
        self.blocking(move |store| {
            let dir = store.queue_dir(job.queue()).join(FAILED_DIR);
            fs::create_dir_all(&dir)?;
            let failed = FailedJob::new(&job, error, store.clock.now());
            write_atomic(&dir, &job_file_name(job.id()), &serde_json::to_vec(&failed)?)?;
            Ok(())
        })
        .await
    }

    async fn failed_size(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let queue = self.queue_name(queue)?;
        self.blocking(move |store| {
            let dir = store.queue_dir(&queue).join(FAILED_DIR);
            let count = read_dir_or_empty(&dir)?
                .iter()
                .filter(|entry| job_id_of(&entry.file_name().to_string_lossy()).is_some())
                .count();
            Ok(count)
        })
        .await
    }
}

impl FileStore {
    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.base.join(queue)
    }

    /// Writes a record, its delay sentinel first so the job is never
    /// visible early.
    fn write_record(&self, queue: &str, record: &JobRecord) -> Result<(), QueueError> {
        let dir = self.queue_dir(queue);
        fs::create_dir_all(&dir)?;

        if let Some(available_at) = record.available_at {
            let delayed = dir.join(DELAYED_DIR);
            fs::create_dir_all(&delayed)?;
            write_atomic(&delayed, &record.id, available_at.to_string().as_bytes())?;
        }

        write_atomic(&dir, &job_file_name(&record.id), &serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Removes expired sentinels and returns the ids still delayed.
    fn promote(&self, dir: &Path) -> Result<HashSet<String>, QueueError> {
        let now = self.clock.now();
        let mut delayed = HashSet::new();

        for entry in read_dir_or_empty(&dir.join(DELAYED_DIR))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            let available_at = fs::read_to_string(entry.path())
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok());

            match available_at {
                Some(at) if at > now => {
                    delayed.insert(name);
                }
                _ => {
                    remove_if_exists(&entry.path())?;
                    trace!(job_id = %name, "Delayed job promoted");
                }
            }
        }

        Ok(delayed)
    }

    fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let dir = self.queue_dir(queue);
        let delayed = self.promote(&dir)?;

        for candidate in ready_jobs(&dir, &delayed)? {
            if let Some(job) = self.reserve(queue, &candidate.path)? {
                debug!(job_id = %job.id(), queue = %queue, attempts = job.attempts(), "Job reserved");
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    /// Claims one job file. `None` means another worker got there first or
    /// the file is unusable.
    fn reserve(&self, queue: &str, path: &Path) -> Result<Option<Job>, QueueError> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(lock) = FileLock::try_exclusive(&file)? else {
            trace!(path = %path.display(), "Job file locked by another worker, skipping");
            return Ok(None);
        };

        let mut contents = String::new();
        let mut reader = lock.file();
        reader.read_to_string(&mut contents)?;

        // Truncated by a worker that reserved it before us.
        if contents.trim().is_empty() {
            return Ok(None);
        }

        let mut job = match Job::from_raw(&self.connection, queue, contents) {
            Ok(job) => job,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed job file");
                return Ok(None);
            }
        };
        job.increment_attempts();

        lock.file().set_len(0)?;
        remove_if_exists(path)?;
        drop(lock);

        Ok(Some(job))
    }
}

/// Ready job files, oldest first.
fn ready_jobs(dir: &Path, delayed: &HashSet<String>) -> Result<Vec<Candidate>, QueueError> {
    let mut candidates = Vec::new();

    for entry in read_dir_or_empty(dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(id) = job_id_of(&name) else {
            continue;
        };
        if delayed.contains(id) {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        candidates.push(Candidate {
            modified,
            path: entry.path(),
            name,
        });
    }

    candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(candidates)
}

fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(QueueError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

fn job_file_name(id: &str) -> String {
    format!("{}{}", id, JOB_EXTENSION)
}

fn job_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(job_file_name(id))
}

/// The job id for a visible job file name.
fn job_id_of(name: &str) -> Option<&str> {
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(JOB_EXTENSION).filter(|id| !id.is_empty())
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let tmp = dir.join(format!(".{}.tmp", name));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, dir.join(name))
}

fn read_dir_or_empty(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
