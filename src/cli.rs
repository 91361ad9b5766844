//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use bulkhttp_core::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_CAPACITY, DEFAULT_CONCURRENCY, DEFAULT_MAX_QUEUED_TASKS,
};
use bulkhttp_core::retry::DEFAULT_MAX_RETRIES;

/// Send large record sets to an HTTP endpoint in concurrent batches.
///
/// Records are read from a JSON or newline-delimited JSON file (or stdin with
/// `--input -`), grouped into batches and sent with bounded concurrency.
/// Transient failures are retried with exponential backoff.
#[derive(Parser, Debug, Clone)]
#[command(name = "bulkhttp")]
#[command(author, version, about)]
pub struct Args {
    /// Target URL (required here or in the config file)
    #[arg(short = 'u', long)]
    pub url: Option<String>,

    /// Input file (JSON document or NDJSON); `-` reads NDJSON from stdin
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// HTTP method
    #[arg(short = 'm', long, default_value = "POST")]
    pub method: String,

    /// Records per request; 0 sends the whole input as one request
    #[arg(short = 'b', long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Maximum concurrent requests
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u32, value_parser = clap::value_parser!(u32).range(1..))]
    pub concurrency: u32,

    /// Batches queued before ingestion pauses for a drain
    #[arg(long = "max-queued", default_value_t = DEFAULT_MAX_QUEUED_TASKS as u32, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_queued: u32,

    /// Per-request timeout in milliseconds (minimum 1000)
    #[arg(long, default_value_t = 30_000, value_parser = clap::value_parser!(u64).range(1000..))]
    pub timeout_ms: u64,

    /// Retries after the first attempt
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Retry after a fixed delay instead of exponential backoff
    #[arg(long)]
    pub static_delay: bool,

    /// Pause after each successful request, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Number of responses kept in memory
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    pub buffer: usize,

    /// Do not keep responses (summary counters only)
    #[arg(long)]
    pub no_store: bool,

    /// Abort when in-flight payload exceeds this many MiB
    #[arg(long)]
    pub memory_limit_mb: Option<u64>,

    /// Disable keep-alive connection reuse
    #[arg(long)]
    pub no_pool: bool,

    /// Keep session cookies between requests
    #[arg(long)]
    pub cookies: bool,

    /// Print a JSON description of each request instead of sending it
    #[arg(long, conflicts_with = "curl")]
    pub dry_run: bool,

    /// Print an equivalent curl command for each request instead of sending it
    #[arg(long)]
    pub curl: bool,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Extra query parameter, `name=value` (repeatable)
    #[arg(long = "query")]
    pub query: Vec<String>,

    /// Send URL-encoded form bodies
    #[arg(long, conflicts_with = "multipart")]
    pub form: bool,

    /// Send multipart form bodies
    #[arg(long)]
    pub multipart: bool,

    /// Include response headers in stored responses
    #[arg(long)]
    pub include_headers: bool,

    /// Write responses to this file (.json, .ndjson/.jsonl or .csv)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// JSON config file with defaults for these options
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Disable colored log output
    #[arg(long)]
    pub no_color: bool,
}
