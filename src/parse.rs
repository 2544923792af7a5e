//! Parsing text into entity/relationship payloads.
//!
//! This is where the pieces meet: input text is chunked to the model's
//! budget, each chunk is fetched through the retrying client under the
//! model's admission limiter, and the pool keeps the fan-out inside the
//! concurrency budget. Results surface three ways: a direct aggregate, a
//! completion-order stream, or a heartbeat-wrapped byte stream for long
//! HTTP responses.

use crate::chunk::{Chunk, split_to_token_size};
use crate::client::{
    ChatMessage, CompletionBackend, CompletionRequest, FetchOptions, FetchOutcome, RetryingClient,
};
use crate::error::Result;
use crate::heartbeat;
use crate::limits::RateLimitPolicy;
use crate::pool::{self, TaskRequest, TaskResult};
use crate::tokenizer::Tokenizer;
use crate::tracker::{StatsSnapshot, StatsTracker};
use futures::stream::{Stream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Marker the model is told to return when a chunk contains nothing worth
/// extracting. Such responses resolve to skipped results.
pub const NO_ENTITIES_MARKER: &str = "NO_ENTITIES_FOUND";

const PARSE_SYSTEM_PROMPT: &str = "Each user message is input text to process. Extract the named \
entities and the relationships between them. Respond with a JSON object: each key is an extracted \
entity name, each value an object mapping relationship names to their targets, with comma-separated \
targets split into list items. If no entities or relationships can be extracted, respond with \
NO_ENTITIES_FOUND. Respond only with the extracted JSON or that marker.";

/// Parses text through a completion backend, one chunk at a time.
#[derive(Debug)]
pub struct Parser<B> {
    client: RetryingClient<B>,
    stats: Arc<StatsTracker>,
}

impl<B> Clone for Parser<B> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<B: CompletionBackend + 'static> Parser<B> {
    /// Create a parser over `backend`, budgeted by `policy`.
    pub fn new(backend: B, policy: RateLimitPolicy) -> Self {
        Self {
            client: RetryingClient::new(Arc::new(backend), Arc::new(policy)),
            stats: Arc::new(StatsTracker::new()),
        }
    }

    fn policy(&self) -> &Arc<RateLimitPolicy> {
        self.client.policy()
    }

    /// Snapshot of chunk statistics across every parse this instance (and
    /// its clones) have run.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Turn one chunk-level task into the bounded wire request for it.
    fn completion_request(&self, task: &TaskRequest) -> CompletionRequest {
        let limits = self.policy().limits(&task.model);
        let system = task.prompt_override.as_deref().unwrap_or(PARSE_SYSTEM_PROMPT);
        CompletionRequest {
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(task.chunk.text.clone()),
            ],
            model: task.model.clone(),
            max_tokens: Some(limits.max_output_tokens),
            timeout: limits.request_timeout(),
        }
    }

    /// Split `text` and parse every chunk, returning all results at once.
    pub async fn parse(&self, text: &str, model: &str) -> Result<Vec<TaskResult>> {
        let stream = self.parse_multitask(text, model, None)?;
        Ok(stream.collect().await)
    }

    /// Split `text` and parse chunks in parallel, yielding each result as
    /// it completes.
    ///
    /// Results arrive in completion order; correlate through the chunk
    /// carried in each result. A chunk whose retries are exhausted yields a
    /// failed result without disturbing its siblings. With the volume of
    /// chunks a long document produces, losing one is acceptable and keeps
    /// the whole run resilient.
    pub fn parse_multitask(
        &self,
        text: &str,
        model: &str,
        prompt_override: Option<String>,
    ) -> Result<impl Stream<Item = TaskResult> + Send + use<B>> {
        let tokenizer = Tokenizer::for_model(model)?;
        let token_limit = self.policy().limits(model).input_token_budget();
        info!(model, token_limit, "Splitting input text into chunks");
        let chunks = split_to_token_size(text, token_limit, &tokenizer);

        if let Some(prompt) = &prompt_override {
            info!(prompt = %prompt, "Using custom parse prompt override");
        }

        let budget = self.policy().concurrency_budget(model);
        let limiter = Arc::new(self.policy().limiter(model));
        let parser = self.clone();
        let model = model.to_string();
        let opts = FetchOptions {
            skip_on_error: true,
            expect_json: true,
            skip_marker: Some(NO_ENTITIES_MARKER.to_string()),
            log_label: "parse".to_string(),
            ..Default::default()
        };

        let worker = move |chunk: Chunk| {
            let task = TaskRequest {
                chunk,
                model: model.clone(),
                prompt_override: prompt_override.clone(),
            };
            let request = parser.completion_request(&task);
            let client = parser.client.clone();
            let stats = Arc::clone(&parser.stats);
            let limiter = Arc::clone(&limiter);
            let opts = opts.clone();
            async move {
                limiter.until_ready().await;
                let started = Instant::now();
                match client.fetch(&request, &opts).await {
                    Ok(FetchOutcome::Success(payload)) if !payload.is_empty() => {
                        stats.record_success(started.elapsed());
                        TaskResult::success(task.chunk, payload)
                    }
                    Ok(FetchOutcome::Success(_) | FetchOutcome::Skipped) => {
                        stats.record_skipped();
                        TaskResult::skipped(task.chunk)
                    }
                    Err(e) => {
                        warn!(chunk = task.chunk.index, error = %e, "Chunk failed after retries");
                        stats.record_failed();
                        TaskResult::failed(task.chunk)
                    }
                }
            }
        };

        Ok(pool::run(chunks, worker, budget, "parse"))
    }

    /// Parse with periodic keep-alive filler for long HTTP responses.
    ///
    /// The stream yields filler immediately, then every `heartbeat_interval`
    /// while parsing runs, and finally a JSON payload of the form
    /// `{"translation": [...]}` holding every successfully decoded chunk
    /// result. Undecodable payloads are omitted rather than failing the
    /// response.
    pub fn parse_with_heartbeat(
        &self,
        text: &str,
        model: &str,
        prompt_override: Option<String>,
        heartbeat_interval: Duration,
    ) -> Result<impl Stream<Item = String> + use<B>> {
        info!(model, "Parsing text with connection heartbeat");
        let results = self.parse_multitask(text, model, prompt_override)?;

        let task = async move {
            let results: Vec<TaskResult> = results.collect().await;
            info!(results = results.len(), "All parsing complete");
            assemble_translation(&results)
        };

        Ok(heartbeat::wrap(task, heartbeat_interval))
    }
}

/// Collect successfully decoded payloads into the terminal JSON document.
fn assemble_translation(results: &[TaskResult]) -> String {
    let translation: Vec<serde_json::Value> = results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| serde_json::from_str(&r.payload).ok())
        .collect();

    serde_json::to_string_pretty(&serde_json::json!({ "translation": translation }))
        .unwrap_or_else(|_| r#"{"translation": []}"#.to_string())
}
