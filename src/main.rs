//! CLI entry point for the bulk HTTP request tool.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bulkhttp_core::source::ndjson_stream;
use bulkhttp_core::{BulkEngine, Hooks, RecordSource, RunResult, write_responses};
use tracing::{debug, info};

mod app_config;
mod cli;
mod progress;

use app_config::{FileConfig, apply_file_config, build_run_config, parse_cli_with_sources};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let (args, sources) = parse_cli_with_sources();
    let args = match &args.config {
        Some(path) => {
            let file = FileConfig::load(path)?;
            apply_file_config(args, &sources, &file)
        }
        None => args,
    };

    let no_color = args.no_color || no_color_env_requested();
    init_tracing(default_log_level(args.quiet, args.verbose), no_color);
    debug!(?args, "CLI arguments parsed");

    let config = build_run_config(&args)?;
    let dry_run = config.dry_run().is_enabled();
    let source = match &args.input {
        Some(path) if path.as_os_str() == "-" => RecordSource::Stream(ndjson_stream(
            tokio::io::stdin(),
            PathBuf::from("<stdin>"),
        )),
        Some(path) => RecordSource::Path(path.clone()),
        None => RecordSource::Empty,
    };

    let mut hooks = Hooks::new();
    if dry_run && args.output.is_none() {
        hooks = hooks.on_response(|response, _| println!("{}", response.body.to_text()));
    }
    if let Some(sink) = progress::progress_sink(io::stderr().is_terminal(), args.quiet) {
        hooks = hooks.progress(sink);
    }

    info!(url = %config.url(), "bulkhttp starting");
    let engine = BulkEngine::new(config).with_hooks(hooks);
    let result = engine.run(source).await.context("run aborted")?;

    if let Some(path) = &args.output {
        write_responses(path, None, &result.responses)?;
        info!(path = %path.display(), count = result.responses.len(), "responses written");
    }

    println!("{}", summary_line(&result));
    Ok(if result.errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn summary_line(result: &RunResult) -> String {
    format!(
        "requests={} rows={} errors={} retried={} duration_ms={} rps={:.1}",
        result.req_count,
        result.row_count,
        result.errors,
        result.stats.retried,
        result.duration.as_millis(),
        result.rps
    )
}

fn default_log_level(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

fn no_color_env_requested() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty())
}

// Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
fn init_tracing(default_level: &str, no_color: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulkhttp_core::RunStats;

    use super::*;

    #[test]
    fn test_default_log_level() {
        assert_eq!(default_log_level(true, 2), "error");
        assert_eq!(default_log_level(false, 0), "info");
        assert_eq!(default_log_level(false, 1), "debug");
        assert_eq!(default_log_level(false, 5), "trace");
    }

    #[test]
    fn test_summary_line_format() {
        let result = RunResult {
            responses: Vec::new(),
            duration: Duration::from_millis(1500),
            req_count: 4,
            row_count: 10,
            rps: 2.666,
            errors: 1,
            stats: RunStats {
                retried: 2,
                ..RunStats::default()
            },
        };
        assert_eq!(
            summary_line(&result),
            "requests=4 rows=10 errors=1 retried=2 duration_ms=1500 rps=2.7"
        );
    }
}
