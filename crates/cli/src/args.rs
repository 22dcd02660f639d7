//! Command-line surface. Every option falls back to an environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use github::{GithubConfig, DEFAULT_API_URL};
use orchestrator::DEFAULT_RETAINED_RUNS;
use pipeline::{
    OrchestratorConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_RETRY_BACKOFF,
};

#[derive(Debug, Parser)]
#[command(
    name = "issue-tally",
    version,
    about = "Count open issues for every repository of a GitHub organization and persist the counts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub orchestrator: OrchestratorArgs,

    #[command(flatten)]
    pub github: GithubArgs,

    /// Path of the redb database holding the counts.
    #[arg(long, env = "ISSUE_TALLY_DB", default_value = "issue-tally.redb")]
    pub db: PathBuf,

    /// Log line format on stderr.
    #[arg(long, env = "ISSUE_TALLY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run once for an organization and print the report as JSON.
    Run {
        /// Organization login, e.g. `rust-lang`.
        #[arg(long)]
        org: String,
    },
    /// Serve the HTTP trigger surface.
    Serve {
        /// Address to bind.
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,
        /// TCP port to listen on.
        #[arg(long, env = "PORT", default_value_t = 3000)]
        port: u16,
        /// Finished runs kept for polling; the oldest are dropped beyond this.
        #[arg(long, env = "ISSUE_TALLY_MAX_FINISHED_RUNS", default_value_t = DEFAULT_RETAINED_RUNS)]
        max_finished_runs: usize,
    },
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, for terminals.
    Pretty,
    /// One JSON object per line, for log collectors.
    Json,
}

#[derive(Debug, Args)]
pub struct OrchestratorArgs {
    /// Maximum number of issue-count fetches in flight.
    #[arg(long, env = "ISSUE_TALLY_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY_LIMIT)]
    pub concurrency: usize,

    /// Records per persistence batch. Defaults to the store's maximum.
    #[arg(long, env = "ISSUE_TALLY_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Deadline for each remote call and each batch write, in seconds.
    #[arg(long, env = "ISSUE_TALLY_CALL_TIMEOUT_SECS", default_value_t = DEFAULT_CALL_TIMEOUT.as_secs())]
    pub call_timeout_secs: u64,

    /// Retries per failed persistence batch, after the first attempt.
    #[arg(long, env = "ISSUE_TALLY_RETRY_ATTEMPTS", default_value_t = DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Base delay before the first batch retry, in milliseconds. Doubles per retry.
    #[arg(long, env = "ISSUE_TALLY_RETRY_BACKOFF_MS", default_value_t = DEFAULT_RETRY_BACKOFF.as_millis() as u64)]
    pub retry_backoff_ms: u64,
}

impl OrchestratorArgs {
    /// Builds the unvalidated config; `Driver::new` rejects bad values.
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency_limit: self.concurrency,
            persist_chunk_size: self.chunk_size,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            retry_attempts: self.retry_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Args)]
pub struct GithubArgs {
    /// Personal access token. Anonymous requests when unset.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// REST API base URL, e.g. for GitHub Enterprise.
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub github_api_url: String,
}

impl GithubArgs {
    /// The per-request timeout matches the orchestrator's call timeout so the
    /// client reports `Timeout` before the dispatcher has to.
    pub fn to_config(&self, request_timeout: Duration) -> GithubConfig {
        GithubConfig {
            api_url: self.github_api_url.clone(),
            token: self.github_token.clone().filter(|t| !t.trim().is_empty()),
            request_timeout,
            ..GithubConfig::default()
        }
    }
}
