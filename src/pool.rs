//! Bounded-concurrency scheduling of chunk-level work.
//!
//! Many chunk completions need to run against a rate-limited API without
//! ever exceeding the model's concurrency budget. The pool seeds the budget,
//! then replaces each finished worker with a queued one, emitting results in
//! completion order. A worker's own failure is just another completed
//! result: one bad chunk never aborts its siblings.

use crate::chunk::Chunk;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use tracing::debug;

/// Input to one external completion call.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// The chunk to process.
    pub chunk: Chunk,
    /// Target model.
    pub model: String,
    /// Replacement system prompt, when the caller supplies one.
    pub prompt_override: Option<String>,
}

/// How a chunk's work unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The call produced a usable payload.
    Success,
    /// The call was deliberately skipped (invalid request, nothing found,
    /// or retries exhausted under skip-on-error).
    Skipped,
    /// Retries were exhausted and the failure was isolated to this chunk.
    Failed,
}

/// Result of one chunk's work unit. Every submitted chunk yields exactly
/// one of these, whatever happened inside the worker.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// The chunk this result belongs to. Results arrive in completion
    /// order, so correlation happens through `chunk.index`.
    pub chunk: Chunk,
    /// The payload; empty unless the outcome is [`TaskOutcome::Success`].
    pub payload: String,
    /// What happened.
    pub outcome: TaskOutcome,
}

impl TaskResult {
    /// Build a success result.
    pub fn success(chunk: Chunk, payload: String) -> Self {
        Self {
            chunk,
            payload,
            outcome: TaskOutcome::Success,
        }
    }

    /// Build a skipped result with an empty payload.
    pub fn skipped(chunk: Chunk) -> Self {
        Self {
            chunk,
            payload: String::new(),
            outcome: TaskOutcome::Skipped,
        }
    }

    /// Build a failed result with an empty payload.
    pub fn failed(chunk: Chunk) -> Self {
        Self {
            chunk,
            payload: String::new(),
            outcome: TaskOutcome::Failed,
        }
    }

    /// Whether this result carries a usable payload.
    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Success
    }
}

/// Run `worker` over every input with at most `max_concurrency` in flight,
/// yielding results in completion order.
///
/// `min(max_concurrency, inputs.len())` workers start immediately; each
/// completion emits its result and launches exactly one replacement while
/// queued inputs remain. The stream ends after exactly `inputs.len()`
/// results.
pub fn run<I, T, F, Fut>(
    inputs: Vec<I>,
    worker: F,
    max_concurrency: usize,
    label: &'static str,
) -> impl Stream<Item = T>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = T>,
{
    let total = inputs.len();
    let state = PoolState {
        queue: inputs.into(),
        running: FuturesUnordered::new(),
        worker,
        budget: max_concurrency.max(1),
        total,
        completed: 0,
        label,
    };

    futures::stream::unfold(state, |mut state| async move {
        state.refill();
        let result = state.running.next().await?;
        state.completed += 1;
        debug!(
            label = state.label,
            completed = state.completed,
            total = state.total,
            running = state.running.len(),
            "Task completed"
        );
        Some((result, state))
    })
}

struct PoolState<I, F, Fut> {
    queue: VecDeque<I>,
    running: FuturesUnordered<Fut>,
    worker: F,
    budget: usize,
    total: usize,
    completed: usize,
    label: &'static str,
}

impl<I, F, Fut> PoolState<I, F, Fut>
where
    F: FnMut(I) -> Fut,
    Fut: Future,
{
    /// Top the running set back up to the budget from the queue.
    fn refill(&mut self) {
        while self.running.len() < self.budget {
            let Some(input) = self.queue.pop_front() else {
                break;
            };
            self.running.push((self.worker)(input));
        }
    }
}

/// Run the pool to completion and collect every result.
pub async fn run_collect<I, T, F, Fut>(
    inputs: Vec<I>,
    worker: F,
    max_concurrency: usize,
    label: &'static str,
) -> Vec<T>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = T>,
{
    run(inputs, worker, max_concurrency, label).collect().await
}
