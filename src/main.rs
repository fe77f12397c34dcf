//! qa-kpi - machine QA KPI engine
//!
//! # Usage
//!
//! ```bash
//! # Process a CSV export and print a report
//! qa-kpi run daily_output.csv
//!
//! # Quarterly KPIs as JSON, persisted to sled
//! qa-kpi run daily_output.csv --interval quarter --json --store ./data/qa_kpi.db
//!
//! # Process once and serve the read API
//! qa-kpi serve daily_output.csv --addr 127.0.0.1:8080
//!
//! # Validate a configuration file
//! qa-kpi check-config qa_kpi.toml
//! ```
//!
//! # Environment Variables
//!
//! - `QA_KPI_CONFIG`: Path to the TOML configuration
//! - `QA_KPI_CORS_ORIGINS`: Comma-separated origins allowed by the API
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use qa_kpi::acquisition::{read_rows, InputFormat};
use qa_kpi::api::{create_app, ApiState};
use qa_kpi::config::{self, EngineConfig};
use qa_kpi::kpi::Interval;
use qa_kpi::pipeline::{self, BatchReport};
use qa_kpi::storage::KpiStorage;
use qa_kpi::types::FlagStatus;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "qa-kpi")]
#[command(about = "Machine QA control limits, trend flagging and period KPIs")]
#[command(version)]
struct CliArgs {
    /// Configuration file (falls back to ./qa_kpi.toml, then defaults)
    #[arg(long, global = true, env = config::defaults::CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Process an input file and print the report
    Run {
        /// CSV, JSON or JSON-lines file of QA results
        input: PathBuf,
        /// Input format (default: from the file extension)
        #[arg(long, value_enum)]
        format: Option<InputFormat>,
        /// Override the KPI interval (day, week, month, quarter, year)
        #[arg(long)]
        interval: Option<Interval>,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
        /// Persist limits, flags and summaries to this sled database
        #[arg(long, value_name = "DIR")]
        store: Option<PathBuf>,
    },

    /// Process an input file and serve the read API
    Serve {
        input: PathBuf,
        #[arg(long, value_enum)]
        format: Option<InputFormat>,
        /// Override the server address from the configuration
        #[arg(short, long)]
        addr: Option<String>,
        #[arg(long, value_name = "DIR")]
        store: Option<PathBuf>,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        path: PathBuf,
    },
}

// ============================================================================
// Helpers
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(p) => EngineConfig::load_from_file(p)?,
        None => EngineConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

/// Read and process `input` off the async runtime with the installed config.
async fn process_file(input: PathBuf, format: Option<InputFormat>) -> Result<BatchReport> {
    tokio::task::spawn_blocking(move || {
        let rows = read_rows(&input, format).with_context(|| format!("Failed to read {}", input.display()))?;
        info!(rows = rows.len(), input = %input.display(), "Input loaded");
        Ok(pipeline::run(&rows, config::get())?)
    })
    .await
    .context("Pipeline task panicked")?
}

fn persist(report: &BatchReport, dir: &Path) -> Result<KpiStorage> {
    let storage = KpiStorage::open(dir).with_context(|| format!("Failed to open store at {}", dir.display()))?;
    let stats = storage.persist(report)?;
    for skipped in &stats.skipped {
        eprintln!("  {} not stored: {}", skipped.key, skipped.error);
    }
    Ok(storage)
}

fn print_report(report: &BatchReport) {
    println!();
    println!(
        "  {} rows | {} records | {} rejected | {} groups | interval: {}",
        report.input_rows,
        report.record_count,
        report.rejected.len(),
        report.groups.len(),
        report.interval
    );
    println!();

    for group in &report.groups {
        let counts = group.status_counts();
        let limits = group
            .limits
            .latest()
            .map_or_else(
                || "limits not established".to_string(),
                |l| format!("v{} center {:.3} ± {:.3} {}", l.version, l.center, l.std_dev, group.unit),
            );
        println!("  {} ({} records, {})", group.key, group.record_count, limits);

        let flagged: Vec<String> = FlagStatus::ALL
            .iter()
            .filter(|s| !matches!(s, FlagStatus::InControl | FlagStatus::Unestablished))
            .filter(|s| counts.get(**s) > 0)
            .map(|s| format!("{s}: {}", counts.get(*s)))
            .collect();
        if !flagged.is_empty() {
            println!("    {}", flagged.join(" | "));
        }

        for s in &group.series.summaries {
            let pct = s.pct_in_control.map_or_else(|| "-".to_string(), |p| format!("{p:.1}%"));
            let goal = match s.meets_goal {
                Some(true) => " ✓",
                Some(false) => " ✗",
                None => "",
            };
            println!("    {:<12} n={:<4} in control {pct}{goal}", s.label, s.total);
        }
    }

    for failure in &report.failed_groups {
        println!("  {} FAILED: {}", failure.key, failure.error);
    }
    if report.rejection_summary.total > 0 {
        println!();
        println!("  Rejected rows:");
        for (reason, count) in &report.rejection_summary.by_reason {
            println!("    {reason}: {count}");
        }
    }
    println!();
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    match args.command {
        SubCommand::CheckConfig { path } => {
            let config = EngineConfig::load_from_file(&path)?;
            config.validate()?;
            info!(path = %path.display(), site = %config.site.name, "Configuration is valid");
            println!("{} OK", path.display());
            Ok(())
        }

        SubCommand::Run {
            input,
            format,
            interval,
            json,
            store,
        } => {
            let mut config = load_config(args.config.as_deref())?;
            if let Some(interval) = interval {
                config.kpi.interval = interval;
            }
            config::init(config);

            let report = process_file(input, format).await?;
            if let Some(dir) = &store {
                persist(&report, dir)?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }

        SubCommand::Serve {
            input,
            format,
            addr,
            store,
        } => {
            config::init(load_config(args.config.as_deref())?);
            let config = config::get();
            let server_addr = addr.unwrap_or_else(|| config.server.addr.clone());

            let report = process_file(input, format).await?;
            let storage = store.as_deref().map(|dir| persist(&report, dir)).transpose()?;
            let mut state = ApiState::new(report, config.clone());
            if let Some(storage) = storage {
                state = state.with_storage(storage);
            }

            let listener = tokio::net::TcpListener::bind(&server_addr)
                .await
                .with_context(|| format!("Failed to bind to {server_addr}"))?;
            info!(addr = %server_addr, "HTTP server listening");

            axum::serve(listener, create_app(state))
                .with_graceful_shutdown(async {
                    if tokio::signal::ctrl_c().await.is_err() {
                        warn!("Failed to listen for Ctrl+C");
                    }
                    info!("Received Ctrl+C, shutting down");
                })
                .await
                .context("HTTP server error")?;
            Ok(())
        }
    }
}
