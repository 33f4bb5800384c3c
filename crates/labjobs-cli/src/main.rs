use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use labjobs_sync::{build_scheduler, render_health_table, DailyPipeline, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "labjobs")]
#[command(about = "Track AI lab job postings and their day-over-day changes")]
struct Cli {
    /// Debug-level logs unless RUST_LOG is set.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every company, diff against the registry and write outputs.
    Run {
        /// Snapshot date (YYYY-MM-DD); today in UTC when omitted.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Scrape without touching the registry and print a health table.
    Validate {
        #[arg(long)]
        company: Option<String>,
    },
    /// Run the daily pipeline on LABJOBS_SCHEDULE_CRON until interrupted.
    Schedule,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli.command.unwrap_or(Commands::Run { date: None })).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "labjobs failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands) -> Result<()> {
    let pipeline = DailyPipeline::new(SyncConfig::from_env())?;

    match command {
        Commands::Run { date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let summary = pipeline.run_once(date).await?;
            println!(
                concat!(
                    "run complete: date={} scraped={} new={} updated={} closed={} ",
                    "carried_forward={} failed={} outputs={}",
                ),
                summary.date,
                summary.total_scraped,
                summary.events.new,
                summary.events.updated,
                summary.events.closed,
                summary.carried_forward,
                summary.failures.len(),
                summary.outputs_dir
            );
        }
        Commands::Validate { company } => {
            let rows = pipeline.validate(company.as_deref()).await?;
            println!("{}", render_health_table(&rows));
        }
        Commands::Schedule => {
            let cron = pipeline.config().schedule_cron.clone();
            let mut sched = build_scheduler(Arc::new(pipeline)).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
