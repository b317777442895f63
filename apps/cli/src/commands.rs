//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::{info, warn};

use batchscout_core::{BatchProcessor, BatchResult, CancellationToken, JobSummary, ProgressTracker, ResourcePool};
use batchscout_crawler::HttpUnitFactory;
use batchscout_shared::{
    AppConfig, BatchConfig, CrawlConfig, JobInput, init_config, load_config, load_config_from,
};

use crate::progress::BatchProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// BatchScout: research many company sites at once.
#[derive(Parser)]
#[command(
    name = "batchscout",
    version,
    about = "Research a batch of company websites with bounded concurrency.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.batchscout/batchscout.toml.
    #[arg(long, global = true, env = "BATCHSCOUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a batch of research jobs.
    Run {
        /// JSON file holding an array of {"name": .., "target": ..} objects.
        inputs: PathBuf,

        /// Maximum number of jobs in flight.
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Maximum number of pooled HTTP sessions.
        #[arg(long)]
        pool_size: Option<usize>,

        /// Per-phase timeout in seconds (0 disables).
        #[arg(long)]
        phase_timeout: Option<u64>,

        /// Write the batch result as JSON to this file.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "batchscout=info",
        1 => "batchscout=debug",
        _ => "batchscout=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            inputs,
            max_concurrent,
            pool_size,
            phase_timeout,
            out,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            let overrides = BatchOverrides {
                max_concurrent,
                pool_size,
                phase_timeout,
            };
            cmd_run(&config, &inputs, &overrides, out.as_deref()).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Command-line values that win over the config file.
#[derive(Debug, Default)]
struct BatchOverrides {
    max_concurrent: Option<usize>,
    pool_size: Option<usize>,
    phase_timeout: Option<u64>,
}

impl BatchOverrides {
    fn apply(&self, mut batch: BatchConfig) -> BatchConfig {
        if let Some(n) = self.max_concurrent {
            batch.max_concurrent = n;
        }
        if let Some(n) = self.pool_size {
            batch.max_pool_size = n;
        }
        if let Some(secs) = self.phase_timeout {
            batch.phase_timeout = (secs > 0).then(|| std::time::Duration::from_secs(secs));
        }
        batch
    }
}

fn read_inputs(path: &Path) -> Result<Vec<JobInput>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read inputs '{}': {e}", path.display()))?;
    let inputs: Vec<JobInput> = serde_json::from_str(&content)
        .map_err(|e| eyre!("invalid inputs '{}': {e}", path.display()))?;
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    inputs_path: &Path,
    overrides: &BatchOverrides,
    out: Option<&Path>,
) -> Result<()> {
    let batch = overrides.apply(BatchConfig::from(config));
    batch.validate()?;

    let inputs = read_inputs(inputs_path)?;
    if inputs.is_empty() {
        warn!(path = %inputs_path.display(), "no inputs to process");
    }

    let factory = HttpUnitFactory::new(CrawlConfig::from(config))?;
    let pool = ResourcePool::new(factory, batch.max_pool_size)?;
    let tracker = Arc::new(ProgressTracker::new());
    let processor = BatchProcessor::new(pool.clone(), tracker.clone())
        .with_phase_timeout(batch.phase_timeout);

    info!(
        jobs = inputs.len(),
        max_concurrent = batch.max_concurrent,
        pool_size = batch.max_pool_size,
        "running batch"
    );

    // Ctrl-C stops admissions; running jobs stop at their next phase.
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling batch");
                cancel.cancel();
            }
        }
    });

    let name_width = inputs.iter().map(|i| i.name.len()).max().unwrap_or(0).min(32);
    let stop_progress = CancellationToken::new();
    let renderer = BatchProgress::new(name_width).follow(&tracker, stop_progress.clone());

    let outcome = processor
        .process_batch_cancellable(inputs, batch.max_concurrent, cancel)
        .await;

    interrupt.abort();
    stop_progress.cancel();
    let mut progress = renderer.await?;
    for snapshot in tracker.snapshot_all() {
        progress.apply(&snapshot);
    }
    pool.close().await;

    let result = outcome?;
    print_summary(&result);

    if let Some(path) = out {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(path, json)
            .map_err(|e| eyre!("cannot write result '{}': {e}", path.display()))?;
        println!("  Result written to {}", path.display());
    }

    match &result.aborted {
        Some(reason) => Err(eyre!("batch aborted: {reason}")),
        None => Ok(()),
    }
}

fn print_summary(result: &BatchResult) {
    println!();
    for summary in result
        .succeeded
        .iter()
        .chain(&result.failed)
        .chain(&result.cancelled)
    {
        println!("  {}", summary_row(summary));
    }
    println!();
    println!(
        "  Jobs: {} total, {} succeeded, {} failed, {} cancelled",
        result.total,
        result.succeeded.len(),
        result.failed.len(),
        result.cancelled.len()
    );
    if !result.usage.is_empty() {
        let usage: Vec<String> = result
            .usage
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        println!("  Usage: {}", usage.join(", "));
    }
    println!("  Time:  {:.1}s", result.elapsed_ms as f64 / 1000.0);
    println!();
}

fn summary_row(summary: &JobSummary) -> String {
    let note = match &summary.error {
        Some(err) => err.to_string(),
        None => String::new(),
    };
    format!(
        "{:<24} {:<10} {:>3}%  {}",
        summary.input.name,
        summary.status.as_str(),
        summary.progress,
        note
    )
    .trim_end()
    .to_string()
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
