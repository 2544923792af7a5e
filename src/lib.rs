//! # Graphext
//!
//! Concurrency core for text-to-knowledge-graph extraction.
//!
//! Graphext takes arbitrary text, splits it into chunks sized to a
//! completion model's context budget, and fans the chunks out to the model
//! under that model's published rate limits, with bounded concurrency,
//! jittered-backoff retries, and per-chunk failure isolation. Long responses
//! can be wrapped in a keep-alive heartbeat stream, and whole directories of
//! input can be processed by a cancelable background job with durable
//! status.
//!
//! ## Features
//!
//! - **Token-budget chunking**: paragraph-, sentence-, then token-boundary
//!   splitting with greedy recombination of undersized neighbors
//! - **Rate-limit aware scheduling**: per-model concurrency budgets derived
//!   from published request and token limits
//! - **Retry state machine**: backed-off rate-limit retries, bounded timeout
//!   retries, skip-on-error isolation, immediate quota propagation
//! - **Heartbeat streaming**: keep-alive filler for long HTTP responses
//! - **Background jobs**: one cancelable batch job at a time, enforced
//!   across restarts by a durable status file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use graphext::{HttpBackend, Parser, RateLimitPolicy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = HttpBackend::new(
//!         "https://api.openai.com/v1/chat/completions",
//!         std::env::var("OPENAI_API_KEY").ok(),
//!     )?;
//!     let parser = Parser::new(backend, RateLimitPolicy::default());
//!
//!     let stream = parser.parse_multitask(
//!         "Tom Currier studied at Stanford and won the Thiel fellowship.",
//!         "gpt-4o-mini",
//!         None,
//!     )?;
//!     futures::pin_mut!(stream);
//!     while let Some(result) = stream.next().await {
//!         println!("chunk {}: {:?}", result.chunk.index, result.outcome);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The CLI binary supports configuration via command-line arguments and
//! environment variables (prefixed with `GRAPHEXT_`); the per-model
//! rate-limit table can be replaced with a JSON file at startup. See
//! [`Config`] and [`RateLimitPolicy`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod chunk;
pub mod client;
pub mod config;
pub mod decode;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod joblog;
pub mod limits;
pub mod parse;
pub mod pool;
pub mod tokenizer;
pub mod tracker;

// Re-exports for convenience
pub use batch::{BatchParseJob, BatchSummary, LocalStorage, Storage, start_parse_job};
pub use chunk::{Chunk, normalize_line_endings, split_to_token_size};
pub use client::{
    ChatMessage, CompletionBackend, CompletionRequest, FetchOptions, FetchOutcome, HttpBackend,
    RetryingClient,
};
pub use config::{Args, Config, EndpointConfig, JobConfig, RetryConfig};
pub use error::{CompletionError, GraphextError, Result};
pub use job::{BackgroundJobRunner, JobStatus, JobStatusFile};
pub use joblog::{JobLog, tail_sse};
pub use limits::{ModelLimits, RateLimitPolicy};
pub use parse::Parser;
pub use pool::{TaskOutcome, TaskRequest, TaskResult};
pub use tokenizer::Tokenizer;
pub use tracker::{StatsSnapshot, StatsTracker};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
