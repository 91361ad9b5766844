//! Config file loading and CLI layering.
//!
//! Precedence: built-in defaults < `--config` JSON file < explicit command
//! line flags. A flag counts as explicit only when clap reports its value
//! source as the command line, so defaults never shadow file values.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches};
use serde::Deserialize;

use bulkhttp_core::{BodyFormat, DryRun, RunConfig};

use crate::cli::Args;

/// JSON-backed file configuration; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) url: Option<String>,
    pub(crate) method: Option<String>,
    pub(crate) batch_size: Option<usize>,
    pub(crate) concurrency: Option<u32>,
    pub(crate) max_queued: Option<u32>,
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) retry_delay_ms: Option<u64>,
    pub(crate) static_delay: Option<bool>,
    pub(crate) delay_ms: Option<u64>,
    pub(crate) buffer: Option<usize>,
    pub(crate) store_responses: Option<bool>,
    pub(crate) memory_limit_mb: Option<u64>,
    pub(crate) pooling: Option<bool>,
    pub(crate) cookies: Option<bool>,
    pub(crate) include_headers: Option<bool>,
    #[serde(default)]
    pub(crate) headers: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) query: BTreeMap<String, String>,
}

impl FileConfig {
    /// Reads and parses a config file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            bail!("Invalid config value for `concurrency`: 0. Expected at least 1");
        }
        if self.max_queued == Some(0) {
            bail!("Invalid config value for `max_queued`: 0. Expected at least 1");
        }
        if let Some(timeout) = self.timeout_ms
            && timeout < 1000
        {
            bail!("Invalid config value for `timeout_ms`: {timeout}. Expected at least 1000");
        }
        Ok(())
    }
}

/// Argument ids whose values came from the command line.
#[derive(Debug, Clone, Default)]
pub(crate) struct CliValueSources {
    explicit: BTreeSet<String>,
}

impl CliValueSources {
    fn from_matches(matches: &ArgMatches) -> Self {
        let explicit = matches
            .ids()
            .filter(|id| matches.value_source(id.as_str()) == Some(ValueSource::CommandLine))
            .map(|id| id.as_str().to_string())
            .collect();
        Self { explicit }
    }

    fn is_explicit(&self, id: &str) -> bool {
        self.explicit.contains(id)
    }
}

pub(crate) fn parse_cli_with_sources() -> (Args, CliValueSources) {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    (args, CliValueSources::from_matches(&matches))
}

/// Fills every option not given on the command line from `file`.
pub(crate) fn apply_file_config(mut args: Args, sources: &CliValueSources, file: &FileConfig) -> Args {
    macro_rules! layer {
        ($id:literal, $field:ident, $value:expr) => {
            if !sources.is_explicit($id)
                && let Some(value) = $value
            {
                args.$field = value;
            }
        };
    }

    if !sources.is_explicit("url")
        && let Some(url) = &file.url
    {
        args.url = Some(url.clone());
    }
    if !sources.is_explicit("memory_limit_mb")
        && let Some(limit) = file.memory_limit_mb
    {
        args.memory_limit_mb = Some(limit);
    }

    layer!("method", method, file.method.clone());
    layer!("batch_size", batch_size, file.batch_size);
    layer!("concurrency", concurrency, file.concurrency);
    layer!("max_queued", max_queued, file.max_queued);
    layer!("timeout_ms", timeout_ms, file.timeout_ms);
    layer!("max_retries", max_retries, file.max_retries);
    layer!("retry_delay_ms", retry_delay_ms, file.retry_delay_ms);
    layer!("static_delay", static_delay, file.static_delay);
    layer!("delay_ms", delay_ms, file.delay_ms);
    layer!("buffer", buffer, file.buffer);
    layer!("no_store", no_store, file.store_responses.map(|store| !store));
    layer!("no_pool", no_pool, file.pooling.map(|pooling| !pooling));
    layer!("cookies", cookies, file.cookies);
    layer!("include_headers", include_headers, file.include_headers);

    // File headers and query parameters come first; command line entries add to them.
    let mut headers: Vec<String> = file
        .headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect();
    headers.append(&mut args.headers);
    args.headers = headers;

    let mut query: Vec<String> = file
        .query
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    query.append(&mut args.query);
    args.query = query;

    args
}

/// Converts the effective arguments into a validated run configuration.
pub(crate) fn build_run_config(args: &Args) -> Result<RunConfig> {
    let Some(url) = &args.url else {
        bail!("No target URL. Pass --url or set `url` in the config file");
    };

    let mut builder = RunConfig::builder(url.clone())
        .method(args.method.clone())
        .batch_size(args.batch_size)
        .concurrency(usize::try_from(args.concurrency)?)
        .max_queued_tasks(usize::try_from(args.max_queued)?)
        .timeout(Duration::from_millis(args.timeout_ms))
        .max_retries(args.max_retries)
        .retry_delay(Duration::from_millis(args.retry_delay_ms))
        .static_retry_delay(args.static_delay)
        .request_delay(Duration::from_millis(args.delay_ms))
        .buffer_capacity(args.buffer)
        .store_responses(!args.no_store)
        .pooling(!args.no_pool)
        .cookies(args.cookies)
        .include_response_headers(args.include_headers)
        .memory_limit(
            args.memory_limit_mb
                .map(|mb| usize::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)),
        );

    if args.form {
        builder = builder.body_format(BodyFormat::Form);
    } else if args.multipart {
        builder = builder.body_format(BodyFormat::Multipart);
    }
    if args.dry_run {
        builder = builder.dry_run(DryRun::Describe);
    } else if args.curl {
        builder = builder.dry_run(DryRun::Curl);
    }

    for header in &args.headers {
        let Some((name, value)) = header.split_once(':') else {
            bail!("Invalid header `{header}`. Expected `Name: value`");
        };
        builder = builder.header(name.trim(), value.trim());
    }
    for pair in &args.query {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("Invalid query parameter `{pair}`. Expected `name=value`");
        };
        builder = builder.query_param(name, value);
    }

    Ok(builder.build()?)
}
