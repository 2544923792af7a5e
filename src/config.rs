//! Configuration management for graphext.
//!
//! Supports configuration via CLI arguments, environment variables, and a
//! JSON configuration file with sensible defaults. The per-model rate-limit
//! table lives in its own file (see [`crate::limits::RateLimitPolicy`]) so
//! vendor numbers can change without a rebuild.

use crate::error::{GraphextError, Result};
use crate::limits::RateLimitPolicy;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the graphext batch runner.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "graphext",
    version,
    about = "Batch text-to-knowledge-graph extraction",
    long_about = "Splits every text file at a data source into model-sized chunks, extracts \
                  entities and relationships from each chunk through a rate-limited completion \
                  API, and writes per-chunk JSON results to an output directory.",
    after_help = "EXAMPLES:\n    \
        graphext --data-source ./papers --output ./results\n    \
        graphext -d ./papers -o ./results --model gpt-4o --dry-run\n    \
        graphext -d ./papers -o ./results --limits limits.json"
)]
pub struct Args {
    /// Directory containing the text files to parse
    #[arg(short, long, env = "GRAPHEXT_DATA_SOURCE")]
    pub data_source: PathBuf,

    /// Directory where parse results are written
    #[arg(short, long, env = "GRAPHEXT_OUTPUT")]
    pub output: PathBuf,

    /// Completion model to parse with
    #[arg(short, long, default_value = "gpt-3.5-turbo", env = "GRAPHEXT_MODEL")]
    pub model: String,

    /// Completion API endpoint URL
    #[arg(
        long,
        default_value = "https://api.openai.com/v1/chat/completions",
        env = "GRAPHEXT_ENDPOINT"
    )]
    pub endpoint: String,

    /// API key for the completion endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Path to a JSON rate-limit table overriding the built-in one
    #[arg(short, long, env = "GRAPHEXT_LIMITS")]
    pub limits: Option<PathBuf>,

    /// Retry budget for timeouts and undecodable payloads
    #[arg(short = 'r', long, default_value = "2", env = "GRAPHEXT_MAX_RETRIES")]
    pub max_retries: u32,

    /// Path of the durable job status file
    #[arg(
        long,
        default_value = "/tmp/graphext_batch_job_status.txt",
        env = "GRAPHEXT_STATUS_FILE"
    )]
    pub status_file: PathBuf,

    /// Path of the append-only job log
    #[arg(long, default_value = "logs/batch-job.log", env = "GRAPHEXT_LOG_FILE")]
    pub log_file: PathBuf,

    /// Validate configuration and list inputs without sending requests
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long, env = "GRAPHEXT_VERBOSE")]
    pub verbose: bool,

    /// Output logs as JSON
    #[arg(long, env = "GRAPHEXT_JSON_LOGS")]
    pub json_logs: bool,

    /// Disable progress bar
    #[arg(long, env = "GRAPHEXT_NO_PROGRESS")]
    pub no_progress: bool,
}

impl Args {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Completion endpoint settings.
    pub endpoint: EndpointConfig,

    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Job settings.
    #[serde(default)]
    pub job: JobConfig,
}

/// Settings for the completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// The chat-completions URL.
    pub url: String,

    /// API key for authentication.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model identifier to parse with.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry budget shared by timeouts and undecodable payloads.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

/// Background-job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Durable status slot path.
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,

    /// Append-only job log path.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Job-loop poll interval.
    #[serde(with = "duration_secs", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            status_file: default_status_file(),
            log_file: default_log_file(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_status_file() -> PathBuf {
    PathBuf::from("/tmp/graphext_batch_job_status.txt")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("logs/batch-job.log")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Config {
    /// Create configuration from CLI arguments.
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            endpoint: EndpointConfig {
                url: args.endpoint.clone(),
                api_key: args.api_key.clone(),
                model: args.model.clone(),
            },
            retry: RetryConfig {
                max_retries: args.max_retries,
            },
            job: JobConfig {
                status_file: args.status_file.clone(),
                log_file: args.log_file.clone(),
                poll_interval: default_poll_interval(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| GraphextError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.url.is_empty() {
            return Err(GraphextError::InvalidConfig(
                "endpoint URL cannot be empty".to_string(),
            ));
        }
        if self.endpoint.model.is_empty() {
            return Err(GraphextError::InvalidConfig(
                "model cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load the rate-limit table: the file named by `--limits` when given,
    /// otherwise the built-in default.
    pub fn load_limits(args: &Args) -> Result<RateLimitPolicy> {
        match &args.limits {
            Some(path) => RateLimitPolicy::from_file(path),
            None => Ok(RateLimitPolicy::default()),
        }
    }
}

/// Serde helper storing durations as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
