use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vcsr_sync::{
    maybe_build_scheduler, report_recent_markdown, run_from_env, seed_ledger_from_csv, SyncConfig,
};

#[derive(Debug, Parser)]
#[command(name = "vcsr-cli")]
#[command(about = "Voice Conversation Sync Relay command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass for every enabled flow.
    Sync {
        /// Limit the pass to a single flow id.
        #[arg(long)]
        flow: Option<String>,
    },
    /// Bootstrap a flow's ledger from a CSV export's id column.
    Seed {
        #[arg(long)]
        flow: String,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print a markdown digest of recent passes.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync { flow: None }) {
        Commands::Sync { flow } => {
            let config = SyncConfig::from_env();
            if let Some(sched) = maybe_build_scheduler(&config).await? {
                info!("starting in-process scheduler");
                sched.start().await.context("starting scheduler")?;
            }

            let summaries = run_from_env(flow.as_deref()).await?;
            let mut any_aborted = false;
            for summary in &summaries {
                any_aborted |= summary.aborted();
                println!(
                    "pass {}: flow={} status={}{} fetched={} new={} sent={} failed={}",
                    summary.run_id,
                    summary.flow_id,
                    summary.status,
                    summary
                        .abort_reason
                        .as_deref()
                        .map(|reason| format!(" ({reason})"))
                        .unwrap_or_default(),
                    summary.counts.fetched,
                    summary.counts.new,
                    summary.counts.sent,
                    summary.counts.failed,
                );
            }
            if any_aborted {
                std::process::exit(1);
            }
        }
        Commands::Seed { flow, csv } => {
            let config = SyncConfig::from_env();
            let ledger_path = config.state_dir.join(&flow).join("ledger.json");
            let provenance = format!("seeded from {}", csv.display());
            let total = seed_ledger_from_csv(ledger_path, &csv, &provenance).await?;
            println!("ledger for {flow} now tracks {total} ids");
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", report_recent_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
