//! Per-model throughput limits and the budgets derived from them.
//!
//! The numbers come from vendor documentation at a point in time and will
//! drift, so the table is configuration: a built-in default is provided and
//! a JSON file can replace it at startup without a rebuild.

use crate::error::{GraphextError, Result};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

/// Model used when a caller names one the table does not know.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Cap on backed-off rate-limit retries for a single call chain.
pub const MAX_RATE_LIMIT_ATTEMPTS: u32 = 5;

/// Published throughput limits for one model, plus the request shaping
/// (output reservation, deadline) used when calling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimits {
    /// Requests per minute the vendor allows.
    pub requests_per_minute: u32,

    /// Tokens per minute the vendor allows.
    pub tokens_per_minute: u32,

    /// Maximum combined input+output tokens for one call.
    pub context_window_tokens: u32,

    /// Tokens reserved for the response when building a request.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_output_tokens() -> u32 {
    1600
}

fn default_timeout_secs() -> u64 {
    60
}

impl ModelLimits {
    /// The per-request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Token budget left for input once the output reservation is taken.
    pub fn input_token_budget(&self) -> usize {
        self.context_window_tokens.saturating_sub(self.max_output_tokens) as usize
    }
}

/// Table of [`ModelLimits`] keyed by model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitPolicy {
    models: HashMap<String, ModelLimits>,
}

/// Most conservative entry, used when a table lacks both the requested
/// model and the default one.
const FALLBACK_LIMITS: ModelLimits = ModelLimits {
    requests_per_minute: 60,
    tokens_per_minute: 60_000,
    context_window_tokens: 4096,
    max_output_tokens: 1600,
    timeout_secs: 60,
};

impl Default for RateLimitPolicy {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "gpt-4o".to_string(),
            ModelLimits {
                requests_per_minute: 500,
                tokens_per_minute: 300_000,
                context_window_tokens: 128_000,
                max_output_tokens: 3000,
                timeout_secs: 75,
            },
        );
        models.insert(
            "gpt-4o-mini".to_string(),
            ModelLimits {
                requests_per_minute: 750,
                tokens_per_minute: 400_000,
                context_window_tokens: 128_000,
                max_output_tokens: 3000,
                timeout_secs: 75,
            },
        );
        models.insert(
            "gpt-4-32k".to_string(),
            ModelLimits {
                requests_per_minute: 200,
                tokens_per_minute: 80_000,
                context_window_tokens: 32_768,
                max_output_tokens: 2000,
                timeout_secs: 75,
            },
        );
        models.insert(
            "gpt-4".to_string(),
            ModelLimits {
                requests_per_minute: 200,
                tokens_per_minute: 40_000,
                context_window_tokens: 8192,
                max_output_tokens: 2000,
                timeout_secs: 75,
            },
        );
        models.insert(
            "gpt-3.5-turbo-16k".to_string(),
            ModelLimits {
                requests_per_minute: 60,
                tokens_per_minute: 120_000,
                context_window_tokens: 16_384,
                max_output_tokens: 3000,
                timeout_secs: 75,
            },
        );
        models.insert(
            "gpt-3.5-turbo".to_string(),
            ModelLimits {
                requests_per_minute: 60,
                tokens_per_minute: 60_000,
                context_window_tokens: 4096,
                max_output_tokens: 1600,
                timeout_secs: 60,
            },
        );
        Self { models }
    }
}

impl RateLimitPolicy {
    /// Load a replacement table from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| GraphextError::io(path, e))?;
        let policy: Self = serde_json::from_str(&content)?;
        if policy.models.is_empty() {
            return Err(GraphextError::InvalidConfig(format!(
                "rate limit table at '{}' defines no models",
                path.display()
            )));
        }
        Ok(policy)
    }

    /// Look up limits for `model`, falling back to the default model for
    /// names not in the table.
    pub fn limits(&self, model: &str) -> &ModelLimits {
        self.models
            .get(model)
            .or_else(|| self.models.get(DEFAULT_MODEL))
            .unwrap_or(&FALLBACK_LIMITS)
    }

    /// Safe number of simultaneous in-flight calls for `model`.
    ///
    /// Conservatively assumes every call consumes a full context window, so
    /// the budget is the stricter of the request and token limits.
    pub fn concurrency_budget(&self, model: &str) -> usize {
        let limits = self.limits(model);
        let by_tokens = limits.tokens_per_minute / limits.context_window_tokens.max(1);
        limits.requests_per_minute.min(by_tokens).max(1) as usize
    }

    /// Jittered exponential backoff delay for the given retry attempt
    /// (0-based). Strictly positive and non-decreasing across attempts.
    pub fn backoff_delay(&self, model: &str, attempt: u32) -> Duration {
        let budget = self.concurrency_budget(model) as f64;
        let seconds_per_request = (60.0 / budget).ceil();
        let jitter = 1.0 + rand::random::<f64>();
        let delay = seconds_per_request * jitter * f64::from(1u32 << attempt.min(16));
        Duration::from_secs_f64(delay)
    }

    /// Request-admission limiter enforcing `model`'s requests-per-minute
    /// quota. One limiter should be shared by all workers of a run.
    pub fn limiter(&self, model: &str) -> governor::DefaultDirectRateLimiter {
        let rpm = NonZeroU32::new(self.limits(model).requests_per_minute)
            .unwrap_or(NonZeroU32::MIN);
        RateLimiter::direct(Quota::per_minute(rpm))
    }

    /// Model names present in the table.
    pub fn known_models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_uses_stricter_limit() {
        let policy = RateLimitPolicy::default();
        // gpt-4: 40k TPM over an 8192-token window is far stricter than
        // 200 RPM.
        assert_eq!(policy.concurrency_budget("gpt-4"), 4);
        // gpt-3.5-turbo: 60k TPM / 4096 = 14, stricter than 60 RPM.
        assert_eq!(policy.concurrency_budget("gpt-3.5-turbo"), 14);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.concurrency_budget("mystery-model"),
            policy.concurrency_budget(DEFAULT_MODEL)
        );
    }

    #[test]
    fn test_backoff_positive_and_nondecreasing() {
        let policy = RateLimitPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..5 {
            let delay = policy.backoff_delay("gpt-4", attempt);
            assert!(delay > Duration::ZERO);
            // Jitter is in [1, 2), doubling per attempt, so the minimum of
            // attempt n+1 equals the supremum of attempt n.
            assert!(delay >= prev, "attempt {attempt}: {delay:?} < {prev:?}");
            prev = delay;
        }
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RateLimitPolicy::default();
        // gpt-4 budget is 4, so the base is ceil(60/4) = 15s.
        let delay = policy.backoff_delay("gpt-4", 0).as_secs_f64();
        assert!((15.0..30.0).contains(&delay), "delay was {delay}");
    }

    #[test]
    fn test_table_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.json");
        std::fs::write(
            &path,
            r#"{"test-model": {"requests_per_minute": 10, "tokens_per_minute": 1000, "context_window_tokens": 100}}"#,
        )
        .unwrap();

        let policy = RateLimitPolicy::from_file(&path).unwrap();
        assert_eq!(policy.concurrency_budget("test-model"), 10);
        // Serde defaults fill the request-shaping fields.
        assert_eq!(policy.limits("test-model").max_output_tokens, 1600);
        assert_eq!(
            policy.limits("test-model").request_timeout(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_empty_table_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(RateLimitPolicy::from_file(&path).is_err());
    }

    #[test]
    fn test_input_token_budget() {
        let policy = RateLimitPolicy::default();
        let limits = policy.limits("gpt-4");
        assert_eq!(limits.input_token_budget(), 8192 - 2000);
    }
}
