//! Custom error types for graphext.
//!
//! Two layers of errors are defined here, mirroring the transport/decoding
//! split in the client: [`CompletionError`] is what a completion backend
//! reports about a single wire call, and [`GraphextError`] is the
//! application-level error surfaced to callers once retry budgets are spent.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single call to the external completion API, before any
/// retry policy has been applied.
#[derive(Error, Debug)]
pub enum CompletionError {
    /// The API refused the call due to throughput limits. Recoverable with
    /// backoff.
    #[error("rate limited by completion API: {0}")]
    RateLimited(String),

    /// The account is out of quota. Waiting will not help.
    #[error("completion API quota exhausted: {0}")]
    QuotaExceeded(String),

    /// The API rejected the request payload itself. Retrying the same
    /// payload cannot succeed.
    #[error("completion API rejected request: {0}")]
    InvalidRequest(String),

    /// No response arrived within the configured deadline.
    #[error("completion request timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else: connection resets, 5xx responses, malformed response
    /// envelopes. Worth one more try.
    #[error("transient completion API error: {0}")]
    Transient(String),
}

impl CompletionError {
    /// Whether this error can ever be resolved by retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::QuotaExceeded(_) | Self::InvalidRequest(_))
    }
}

/// Errors that can occur during parsing, batch processing, or job control.
#[derive(Error, Debug)]
pub enum GraphextError {
    /// File could not be read or written.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path to the file involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse or serialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport failed before the API could classify the call.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tokenizer could not be constructed for the requested model.
    #[error("tokenizer unavailable for model '{model}': {reason}")]
    Tokenizer {
        /// The model whose tokenizer failed to load.
        model: String,
        /// Why it failed.
        reason: String,
    },

    /// Rate-limit backoff budget exhausted.
    #[error("still rate limited after {attempts} backed-off attempts")]
    RateLimitExhausted {
        /// Number of backed-off attempts made.
        attempts: u32,
    },

    /// Quota failure propagated from the API. Never retried.
    #[error("quota exhausted: {0}")]
    QuotaExceeded(String),

    /// Request timed out and the retry budget is spent.
    #[error("request timed out after {attempts} attempts")]
    Timeout {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Transient failure that did not clear on retry.
    #[error("transient error persisted across retries: {0}")]
    Transient(String),

    /// Structured output was requested but the response never decoded.
    #[error("response payload never decoded as JSON after {attempts} attempts")]
    MalformedOutput {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A batch job is already running; a second one cannot be admitted.
    #[error("a batch job is already running")]
    AlreadyRunning,

    /// Batch job setup found nothing to process.
    #[error("no input files found at '{source_dir}'")]
    NoInputs {
        /// The data source that was scanned.
        source_dir: PathBuf,
    },

    /// The OS refused to spawn the dedicated job thread.
    #[error("failed to spawn job thread: {0}")]
    JobSpawn(std::io::Error),
}

/// Result type alias for graphext operations.
pub type Result<T> = std::result::Result<T, GraphextError>;

impl GraphextError {
    /// Convenience constructor for [`GraphextError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
