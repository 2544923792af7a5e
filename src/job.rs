//! Cancelable background jobs with durable single-slot status.
//!
//! Batch work runs outside the request/response cycle, on a dedicated OS
//! thread with its own runtime, so a long job can never block request
//! handling. The job's status lives in a file rather than process memory:
//! "only one job at a time" has to survive process restarts, and the file is
//! the sole source of truth for whether a job is active.
//!
//! Cancellation is cooperative. `cancel` records the request in the status
//! file; the job loop notices on its next poll (~1s), aborts the work, and
//! transitions to `Canceled`. In-flight external calls are not forcibly
//! interrupted; they run to their own completion or timeout.

use crate::error::{GraphextError, Result};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info};

/// Default interval between job-loop polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of the single batch-job slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// No job has run since the slot was reset.
    NotStarted,
    /// A job is currently executing.
    Running,
    /// Cancellation was requested; the job loop has not yet acted on it.
    Canceling,
    /// The job was canceled before finishing.
    Canceled,
    /// The job ran to completion.
    Completed,
}

impl JobStatus {
    /// Whether this status means the slot is occupied.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Canceling)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Running => "Running",
            Self::Canceling => "Canceling",
            Self::Canceled => "Canceled",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "Not started" => Ok(Self::NotStarted),
            "Running" => Ok(Self::Running),
            "Canceling" => Ok(Self::Canceling),
            "Canceled" => Ok(Self::Canceled),
            "Completed" => Ok(Self::Completed),
            _ => Err(()),
        }
    }
}

/// The durable status slot backing a job runner.
///
/// Single-writer by construction: only the runner (and an explicit cancel
/// request) ever write it, and a second `start` is rejected while the slot
/// is active.
#[derive(Debug, Clone)]
pub struct JobStatusFile {
    path: PathBuf,
}

impl JobStatusFile {
    /// Use the status file at `path`, creating parent directories as needed.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current status. A missing file reads as `NotStarted` and is
    /// created so later reads are consistent; unparseable contents also read
    /// as `NotStarted` rather than wedging the slot forever.
    pub fn read(&self) -> Result<JobStatus> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.parse().unwrap_or(JobStatus::NotStarted)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.write(JobStatus::NotStarted)?;
                Ok(JobStatus::NotStarted)
            }
            Err(e) => Err(GraphextError::io(&self.path, e)),
        }
    }

    /// Overwrite the slot with `status`.
    pub fn write(&self, status: JobStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| GraphextError::io(parent, e))?;
            }
        }
        std::fs::write(&self.path, status.as_str()).map_err(|e| GraphextError::io(&self.path, e))
    }

    /// Reset the slot to `NotStarted`. Called once at deploy/process setup.
    pub fn reset(&self) -> Result<()> {
        self.write(JobStatus::NotStarted)
    }
}

/// Runs one cancelable unit of batch work at a time on a dedicated thread.
#[derive(Debug, Clone)]
pub struct BackgroundJobRunner {
    status: JobStatusFile,
    poll_interval: Duration,
}

impl BackgroundJobRunner {
    /// Create a runner backed by the status file at `status_path`.
    pub fn new(status_path: impl Into<PathBuf>) -> Self {
        Self {
            status: JobStatusFile::new(status_path),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval (mainly for tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The durable status slot.
    pub fn status_file(&self) -> &JobStatusFile {
        &self.status
    }

    /// Current job status.
    pub fn status(&self) -> Result<JobStatus> {
        self.status.read()
    }

    /// Start `work` as the one background job.
    ///
    /// Rejects with [`GraphextError::AlreadyRunning`] if the durable slot
    /// shows an active job; no new work unit is created in that case.
    /// Otherwise marks the slot `Running`, launches the job thread, and
    /// returns immediately.
    pub fn start<F>(&self, kind: &str, work: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.status.read()?.is_active() {
            return Err(GraphextError::AlreadyRunning);
        }
        self.status.write(JobStatus::Running)?;

        let status = self.status.clone();
        let poll_interval = self.poll_interval;
        let kind = kind.to_string();

        std::thread::Builder::new()
            .name(format!("graphext-job-{kind}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(job = %kind, error = %e, "Failed to build job runtime");
                        let _ = status.write(JobStatus::Completed);
                        return;
                    }
                };

                runtime.block_on(run_job_loop(&kind, work, &status, poll_interval));
            })
            .map_err(GraphextError::JobSpawn)?;

        Ok(())
    }

    /// Record a cancellation request without blocking.
    ///
    /// The transition to `Canceled` happens asynchronously on the job
    /// loop's next poll. A cancel with no active job is a no-op.
    pub fn cancel(&self) -> Result<()> {
        if self.status.read()? == JobStatus::Running {
            info!("Cancel requested for running job");
            self.status.write(JobStatus::Canceling)?;
        }
        Ok(())
    }
}

async fn run_job_loop<F>(kind: &str, work: F, status: &JobStatusFile, poll_interval: Duration)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut work_task = tokio::spawn(work);
    let canceled = loop {
        if work_task.is_finished() {
            info!(job = kind, "Batch job completed");
            break false;
        }
        match status.read() {
            Ok(JobStatus::Canceling) => {
                info!(job = kind, "Cancel requested, stopping batch job");
                work_task.abort();
                break true;
            }
            Ok(_) => {}
            Err(e) => error!(job = kind, error = %e, "Could not read job status"),
        }
        tokio::time::sleep(poll_interval).await;
    };

    // Drain the task so panics are observed rather than dropped silently.
    if let Err(join_error) = (&mut work_task).await {
        if join_error.is_panic() {
            error!(job = kind, "Batch job panicked");
        }
    }

    let final_status = if canceled {
        JobStatus::Canceled
    } else {
        JobStatus::Completed
    };
    if let Err(e) = status.write(final_status) {
        error!(job = kind, error = %e, "Could not persist final job status");
    }
}
