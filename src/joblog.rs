//! Append-only job log and its Server-Sent-Events tail.
//!
//! Each batch job writes progress lines to a plain text file. The tail
//! stream turns new lines into `data:<line>` SSE frames for the HTTP layer
//! to forward; once the job is no longer active and every buffered line has
//! been delivered, a literal `data:done` frame ends the stream.

use crate::error::{GraphextError, Result};
use crate::job::JobStatusFile;
use futures::stream::Stream;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Terminal SSE frame emitted once the job is over and the log is drained.
pub const SSE_DONE_FRAME: &str = "data:done\n\n";

/// Append-only log file for one batch job.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    /// Set up the log at `path`: create parent directories and clear any
    /// contents left over from the previous job.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| GraphextError::io(parent, e))?;
            }
        }
        std::fs::write(&path, b"").map_err(|e| GraphextError::io(&path, e))?;
        Ok(Self { path })
    }

    /// Open an existing log without truncating it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub fn append(&self, message: &str) -> Result<()> {
        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GraphextError::io(&self.path, e))?;
        writeln!(file, "[{timestamp}] {message}").map_err(|e| GraphextError::io(&self.path, e))
    }
}

struct TailState {
    path: PathBuf,
    status: JobStatusFile,
    interval: Duration,
    offset: usize,
    buffered: VecDeque<String>,
    done: bool,
}

/// Stream new log lines as SSE frames until the job ends.
///
/// Frames are `data:<line>\n\n`, one per complete log line appended since
/// the last poll. When the durable status shows no active job and nothing
/// is buffered, the stream yields [`SSE_DONE_FRAME`] and ends.
pub fn tail_sse(
    log_path: impl Into<PathBuf>,
    status: JobStatusFile,
    interval: Duration,
) -> impl Stream<Item = String> {
    let state = TailState {
        path: log_path.into(),
        status,
        interval,
        offset: 0,
        buffered: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            if state.buffered.is_empty() {
                state.read_new_lines().await;
            }
            if let Some(line) = state.buffered.pop_front() {
                return Some((format!("data:{line}\n\n"), state));
            }

            let active = state
                .status
                .read()
                .map(crate::job::JobStatus::is_active)
                .unwrap_or(false);
            if !active {
                // One final read: the job may have logged between our last
                // poll and its status transition.
                state.read_new_lines().await;
                if let Some(line) = state.buffered.pop_front() {
                    return Some((format!("data:{line}\n\n"), state));
                }
                state.done = true;
                return Some((SSE_DONE_FRAME.to_string(), state));
            }

            tokio::time::sleep(state.interval).await;
        }
    })
}

impl TailState {
    /// Pull complete lines appended since the last read into the buffer.
    async fn read_new_lines(&mut self) {
        let Ok(content) = tokio::fs::read(&self.path).await else {
            return;
        };
        if content.len() <= self.offset {
            return;
        }
        let new = &content[self.offset..];
        // Only hand out complete lines; a partial trailing write stays for
        // the next poll.
        let Some(last_newline) = new.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let complete = &new[..=last_newline];
        self.offset += last_newline + 1;
        for line in String::from_utf8_lossy(complete).lines() {
            self.buffered.push_back(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_append_and_tail_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::create(dir.path().join("job.log")).unwrap();
        let status = JobStatusFile::new(dir.path().join("status.txt"));
        status.write(JobStatus::Completed).unwrap();

        log.append("first line").unwrap();
        log.append("second line").unwrap();

        let frames: Vec<String> =
            tail_sse(log.path(), status, Duration::from_millis(10)).collect().await;

        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("data:["));
        assert!(frames[0].contains("first line"));
        assert!(frames[0].ends_with("\n\n"));
        assert!(frames[1].contains("second line"));
        assert_eq!(frames[2], SSE_DONE_FRAME);
    }

    #[tokio::test]
    async fn test_tail_streams_lines_written_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::create(dir.path().join("job.log")).unwrap();
        let status = JobStatusFile::new(dir.path().join("status.txt"));
        status.write(JobStatus::Running).unwrap();

        let writer_log = log.clone();
        let writer_status = status.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                writer_log.append(&format!("progress {i}")).unwrap();
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
            writer_status.write(JobStatus::Completed).unwrap();
        });

        let frames: Vec<String> =
            tail_sse(log.path(), status, Duration::from_millis(5)).collect().await;

        assert_eq!(frames.len(), 6);
        for (i, frame) in frames[..5].iter().enumerate() {
            assert!(frame.contains(&format!("progress {i}")), "frame: {frame}");
        }
        assert_eq!(frames.last().unwrap(), SSE_DONE_FRAME);
    }

    #[tokio::test]
    async fn test_done_immediately_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::create(dir.path().join("job.log")).unwrap();
        let status = JobStatusFile::new(dir.path().join("status.txt"));

        let frames: Vec<String> =
            tail_sse(log.path(), status, Duration::from_millis(10)).collect().await;
        assert_eq!(frames, vec![SSE_DONE_FRAME.to_string()]);
    }

    #[test]
    fn test_create_truncates_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        std::fs::write(&path, "stale contents\n").unwrap();

        let log = JobLog::create(&path).unwrap();
        assert_eq!(std::fs::read_to_string(log.path()).unwrap(), "");
    }
}
