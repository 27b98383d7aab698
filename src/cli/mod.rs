pub mod config;

pub use config::FlowPulseConfig;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::engine::types::{LifecycleEvent, WorkflowRecord};
use crate::engine::{Aggregator, AggregatorBuilder, AggregatorService};
use crate::probes::memory::SystemMemoryPressure;
use crate::probes::process::ProcessTable;
use crate::trackers::{ActivityLog, TokenLedger};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_BODY: usize = 1_048_576;

#[derive(Parser)]
#[command(name = "flowpulse", version, about = "Live workflow telemetry aggregator")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a flowpulse.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true, env = "FLOWPULSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the telemetry server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,
    },

    /// Feed a JSON-lines file of lifecycle events through the aggregator
    /// and print the resulting snapshot
    Replay {
        /// Path to the .jsonl event file
        file: PathBuf,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = FlowPulseConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_body,
        } => cmd_serve(config, host, port, max_body).await,
        Commands::Replay { file, format } => cmd_replay(&config, &file, &format),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Builder wired with the companion trackers and the config's policy.
pub fn aggregator_builder(config: &FlowPulseConfig) -> AggregatorBuilder {
    Aggregator::builder()
        .policy(config.eviction_policy())
        .subscriber_buffer(config.hub.subscriber_buffer)
        .probe_timeout(config.probe_timeout())
        .activity_log(Arc::new(ActivityLog::default()))
        .token_ledger(Arc::new(TokenLedger::default()))
}

async fn cmd_serve(
    config: FlowPulseConfig,
    host: Option<String>,
    port: Option<u16>,
    max_body: Option<usize>,
) -> Result<()> {
    // CLI/env wins over the config file, which wins over defaults.
    let host = host
        .or_else(|| config.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = port.or(config.port).unwrap_or(DEFAULT_PORT);
    let max_body = max_body.or(config.max_body).unwrap_or(DEFAULT_MAX_BODY);

    let processes = Arc::new(ProcessTable::new());
    let aggregator = aggregator_builder(&config)
        .process_provider(processes.clone())
        .memory_signal(Arc::new(SystemMemoryPressure::with_limit_mb(
            config.memory.limit_mb,
        )))
        .build();

    let handle = AggregatorService::spawn(aggregator, config.service_settings());
    let result = crate::api::serve(&host, port, max_body, handle.clone(), processes).await;
    handle.shutdown().await;
    result
}

fn cmd_replay(config: &FlowPulseConfig, file: &Path, format: &str) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read event file: {}", file.display()))?;

    let mut aggregator = aggregator_builder(config).build();
    let (applied, ignored) = replay_events(&mut aggregator, &contents)?;
    let records = aggregator.snapshot();
    aggregator.shutdown();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    print_table(&records);
    println!(
        "\nEvents: {} applied, {} for unknown workflows",
        applied, ignored
    );
    Ok(())
}

/// Apply every non-blank line as a [`LifecycleEvent`].
/// Returns `(applied, ignored)`; a malformed line is an error naming its line number.
pub fn replay_events(aggregator: &mut Aggregator, contents: &str) -> Result<(usize, usize)> {
    let mut applied = 0;
    let mut ignored = 0;

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: LifecycleEvent = serde_json::from_str(line)
            .with_context(|| format!("Invalid event on line {}", idx + 1))?;
        let name = event.workflow_name().to_string();
        if aggregator.apply(event) {
            applied += 1;
        } else {
            warn!(workflow = %name, line = idx + 1, "Event for unknown workflow ignored");
            ignored += 1;
        }
    }

    Ok((applied, ignored))
}

fn print_table(records: &[WorkflowRecord]) {
    if records.is_empty() {
        println!("No workflows found.");
        return;
    }

    println!(
        "{:<24} {:<10} {:>7} {:>7} {:>7} {:>8} {:<24}",
        "WORKFLOW", "STATUS", "DONE", "FAILED", "TOTAL", "SUCCESS", "STARTED"
    );
    println!("{}", "-".repeat(94));

    for record in records {
        println!(
            "{:<24} {:<10} {:>7} {:>7} {:>7} {:>7.1}% {:<24}",
            record.workflow_name,
            record.status.to_string(),
            record.completed_steps,
            record.failed_steps,
            record.total_steps,
            record.success_rate,
            record.start_time.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    println!("\nTotal: {} workflow(s)", records.len());
}
