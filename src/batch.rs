//! Batch-mode parsing of many input files.
//!
//! A batch job walks every file at a data source, runs each through the
//! chunked parse pipeline, and writes one output file per successful chunk
//! under a timestamped job directory. Storage is behind a seam so the job
//! logic stays independent of where files actually live; the local-directory
//! implementation is the one shipped here.
//!
//! Per-file failures are swallowed after logging so one unreadable input
//! does not sink the rest of the job. Finding no inputs at all is different:
//! that aborts the job, with the reason written to the job log first.

use crate::client::CompletionBackend;
use crate::error::{GraphextError, Result};
use crate::job::BackgroundJobRunner;
use crate::joblog::JobLog;
use crate::parse::Parser;
use crate::pool::TaskOutcome;
use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Read/write seam used by batch jobs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// List input files at `source`, in a stable order.
    async fn list_inputs(&self, source: &Path) -> Result<Vec<PathBuf>>;

    /// Read one input file as text.
    async fn read(&self, path: &Path) -> Result<String>;

    /// Write one output file.
    async fn write(&self, path: &Path, data: &str) -> Result<()>;

    /// Create a directory (and any missing parents).
    async fn create_dir(&self, path: &Path) -> Result<()>;
}

/// [`Storage`] over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

#[async_trait]
impl Storage for LocalStorage {
    async fn list_inputs(&self, source: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(source)
            .await
            .map_err(|e| GraphextError::io(source, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GraphextError::io(source, e))?
        {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GraphextError::io(path, e))
    }

    async fn write(&self, path: &Path, data: &str) -> Result<()> {
        tokio::fs::write(path, data)
            .await
            .map_err(|e| GraphextError::io(path, e))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| GraphextError::io(path, e))
    }
}

/// Totals for one batch run.
#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    /// Input files processed to completion.
    pub files: usize,
    /// Input files abandoned after an error.
    pub failed_files: usize,
    /// Chunks parsed successfully.
    pub chunks_succeeded: usize,
    /// Chunks skipped (nothing found, or isolated failures under
    /// skip-on-error).
    pub chunks_skipped: usize,
    /// Chunks that failed outright.
    pub chunks_failed: usize,
}

impl BatchSummary {
    /// Print a human-readable summary block.
    pub fn print_summary(&self) {
        println!("\n{}", "═".repeat(60));
        println!("                  BATCH PARSE COMPLETE");
        println!("{}", "═".repeat(60));
        println!("  Files Processed:  {}", self.files);
        println!("  Files Failed:     {}", self.failed_files);
        println!("  Chunks OK:        {}", self.chunks_succeeded);
        println!("  Chunks Skipped:   {}", self.chunks_skipped);
        println!("  Chunks Failed:    {}", self.chunks_failed);
        println!("{}", "═".repeat(60));
    }
}

/// A batch parse job over a data source.
pub struct BatchParseJob<B> {
    parser: Parser<B>,
    storage: Arc<dyn Storage>,
    log: JobLog,
    model: String,
    dry_run: bool,
    show_progress: bool,
}

impl<B: CompletionBackend + 'static> BatchParseJob<B> {
    /// Create a job parsing with `model` through `parser`, using `storage`
    /// for all file access and `log` for progress lines.
    pub fn new(parser: Parser<B>, storage: Arc<dyn Storage>, log: JobLog, model: String) -> Self {
        Self {
            parser,
            storage,
            log,
            model,
            dry_run: false,
            show_progress: false,
        }
    }

    /// Log what would be written instead of writing it.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Show a progress bar while running (interactive use only).
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// The job's log.
    pub fn log(&self) -> &JobLog {
        &self.log
    }

    /// Run the batch: list inputs, parse each file, write per-chunk outputs
    /// under a timestamped directory in `output_root`.
    pub async fn run(&self, data_source: &Path, output_root: &Path) -> Result<BatchSummary> {
        let inputs = self.storage.list_inputs(data_source).await?;
        if inputs.is_empty() {
            let message = format!("No files found at {}", data_source.display());
            self.log.append(&message)?;
            return Err(GraphextError::NoInputs {
                source_dir: data_source.to_path_buf(),
            });
        }
        self.log
            .append(&format!("Found {} files to process", inputs.len()))?;
        info!(files = inputs.len(), "Starting batch parse");

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let job_dir = output_root.join(format!("parse-{timestamp}"));
        if !self.dry_run {
            self.storage.create_dir(&job_dir).await?;
        }

        let progress = if self.show_progress {
            let bar = ProgressBar::new(inputs.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} files | {msg}")
            {
                bar.set_style(style.progress_chars("█▓▒░"));
            }
            Some(bar)
        } else {
            None
        };

        let mut summary = BatchSummary::default();
        for input in &inputs {
            match self.process_file(input, &job_dir).await {
                Ok(file_summary) => {
                    summary.files += 1;
                    summary.chunks_succeeded += file_summary.chunks_succeeded;
                    summary.chunks_skipped += file_summary.chunks_skipped;
                    summary.chunks_failed += file_summary.chunks_failed;
                }
                Err(e) => {
                    // Swallow to proceed with the rest of the job.
                    summary.failed_files += 1;
                    warn!(file = %input.display(), error = %e, "Failed to process input file");
                    self.log.append(&format!(
                        "Error processing {}: {e}. Continuing with remaining files.",
                        input.display()
                    ))?;
                }
            }
            if let Some(bar) = &progress {
                bar.set_message(format!(
                    "chunks: {} ok, {} skipped",
                    summary.chunks_succeeded, summary.chunks_skipped
                ));
                bar.inc(1);
            }
        }

        if let Some(bar) = &progress {
            bar.finish_with_message("done");
        }
        self.log.append(&format!(
            "Batch parse finished: {} files ok, {} failed, {} chunks parsed",
            summary.files, summary.failed_files, summary.chunks_succeeded
        ))?;
        Ok(summary)
    }

    async fn process_file(&self, input: &Path, job_dir: &Path) -> Result<BatchSummary> {
        self.log
            .append(&format!("Processing file {}", input.display()))?;
        let data = self.storage.read(input).await?;
        self.log.append(&format!("Loaded {} bytes", data.len()))?;

        let stem = input
            .file_stem()
            .map_or_else(|| "input".to_string(), |s| s.to_string_lossy().into_owned());
        let file_dir = job_dir.join(stem);
        if !self.dry_run {
            self.storage.create_dir(&file_dir).await?;
        }

        let results = self.parser.parse_multitask(&data, &self.model, None)?;
        futures::pin_mut!(results);

        let mut summary = BatchSummary::default();
        let mut output_num = 0usize;
        while let Some(result) = results.next().await {
            match result.outcome {
                TaskOutcome::Success => {
                    let output_path = file_dir.join(format!("output_{output_num}.json"));
                    if self.dry_run {
                        self.log.append(&format!(
                            "Would have written {} bytes to {}",
                            result.payload.len(),
                            output_path.display()
                        ))?;
                    } else {
                        self.log.append(&format!(
                            "Writing output chunk {output_num} to {}",
                            output_path.display()
                        ))?;
                        self.storage.write(&output_path, &result.payload).await?;
                    }
                    output_num += 1;
                    summary.chunks_succeeded += 1;
                }
                TaskOutcome::Skipped => summary.chunks_skipped += 1,
                TaskOutcome::Failed => {
                    summary.chunks_failed += 1;
                    self.log.append(&format!(
                        "Chunk {} of {} failed after retries",
                        result.chunk.index,
                        input.display()
                    ))?;
                }
            }
        }
        Ok(summary)
    }
}

/// Launch a batch parse as the one background job.
///
/// Admission is checked against the runner's durable status slot; a second
/// job is rejected with [`GraphextError::AlreadyRunning`] while one is
/// active. Job-level failures are written to the job log before the job
/// terminates.
pub fn start_parse_job<B: CompletionBackend + 'static>(
    runner: &BackgroundJobRunner,
    job: BatchParseJob<B>,
    data_source: PathBuf,
    output_root: PathBuf,
) -> Result<()> {
    let log = job.log().clone();
    runner.start("parse", async move {
        match job.run(&data_source, &output_root).await {
            Ok(summary) => {
                info!(
                    files = summary.files,
                    chunks = summary.chunks_succeeded,
                    "Batch parse job complete"
                );
            }
            Err(e) => {
                warn!(error = %e, "Batch parse job failed");
                let _ = log.append(&format!("Batch job failed: {e}"));
            }
        }
    })
}
