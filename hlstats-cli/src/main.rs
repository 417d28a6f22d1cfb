//! hlstats CLI: cache synchronization commands.
//!
//! Commands:
//! - `sync`: bring every configured cache table up to date
//! - `plan`: show the partitions the next sync would process
//! - `check`: compare raw and cache watermarks
//! - `watermarks`: table watermarks and row counts

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use hlstats_runner::{save_report, Pipeline, PipelineConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "hlstats",
    about = "hlstats: incremental cache sync for Hyperliquid archive data"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, aggregate and append every partition after the cache watermarks.
    Sync {
        /// Path to the TOML config file.
        #[arg(long)]
        config: PathBuf,

        /// Last date to sync (YYYY-MM-DD). Defaults to today (UTC).
        #[arg(long)]
        today: Option<String>,

        /// Restrict the run to these datasets (repeatable).
        #[arg(long = "dataset")]
        datasets: Vec<String>,

        /// Write the run report as JSON into this directory.
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Show what the next sync would process, without fetching anything.
    Plan {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        today: Option<String>,

        #[arg(long = "dataset")]
        datasets: Vec<String>,
    },
    /// Compare raw and cache watermarks of every dataset.
    Check {
        #[arg(long)]
        config: PathBuf,

        #[arg(long = "dataset")]
        datasets: Vec<String>,
    },
    /// Print table watermarks and row counts.
    Watermarks {
        #[arg(long)]
        config: PathBuf,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hlstats=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            config,
            today,
            datasets,
            report_dir,
        } => run_sync(config, today, datasets, report_dir),
        Commands::Plan {
            config,
            today,
            datasets,
        } => run_plan(config, today, datasets),
        Commands::Check { config, datasets } => run_check(config, datasets),
        Commands::Watermarks { config, json } => run_watermarks(config, json),
    }
}

fn load_pipeline(config_path: &PathBuf, datasets: &[String]) -> Result<Pipeline> {
    let config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("invalid configuration: {}", config_path.display()))?;
    Ok(Pipeline::from_config(&config, datasets)?)
}

fn parse_today(today: Option<String>) -> Result<NaiveDate> {
    match today {
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .with_context(|| format!("--today must be YYYY-MM-DD, got '{s}'")),
        None => Ok(chrono::Utc::now().date_naive()),
    }
}

fn run_sync(
    config_path: PathBuf,
    today: Option<String>,
    datasets: Vec<String>,
    report_dir: Option<PathBuf>,
) -> Result<()> {
    let today = parse_today(today)?;
    let pipeline = load_pipeline(&config_path, &datasets)?;
    pipeline
        .verify_object_store()
        .context("object store is not usable; nothing was synced")?;

    let report = pipeline.run(today);

    println!("Sync through {today} (run {})", report.run_id);
    for line in report.summary_lines() {
        println!("  {line}");
    }
    for ds in &report.datasets {
        for failure in &ds.failures {
            println!("  failed: {} [{}] {}", failure.partition, failure.kind, failure.message);
        }
    }
    println!(
        "Committed {} partitions, {} failed, {} cache rows appended",
        report.partitions_committed(),
        report.partition_failures(),
        report.cache_rows_appended()
    );

    if let Some(dir) = report_dir {
        let path = save_report(&report, &dir)?;
        info!(path = %path.display(), "run report written");
        println!("Report saved to: {}", path.display());
    }

    // Partition failures are retried by the next run; they do not fail the process.
    Ok(())
}

fn run_plan(config_path: PathBuf, today: Option<String>, datasets: Vec<String>) -> Result<()> {
    let today = parse_today(today)?;
    let pipeline = load_pipeline(&config_path, &datasets)?;

    for (name, plan) in pipeline.plan(today) {
        match plan {
            Ok(plan) => {
                let watermark = plan
                    .cache_watermark
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into());
                let span = match (plan.partitions.dates().first(), plan.partitions.dates().last()) {
                    (Some(first), Some(last)) => format!("{first} .. {last}"),
                    _ => "up to date".into(),
                };
                println!(
                    "{name:<24} watermark {watermark}  {span}  {} dates, {} partitions",
                    plan.partitions.dates().len(),
                    plan.partitions.len()
                );
                if !plan.retried.is_empty() {
                    let retried: Vec<String> = plan.retried.iter().map(|d| d.to_string()).collect();
                    println!("{:<24} retrying {}", "", retried.join(", "));
                }
            }
            Err(failure) => println!("{name:<24} cannot plan ({}: {})", failure.kind, failure.message),
        }
    }
    Ok(())
}

fn run_check(config_path: PathBuf, datasets: Vec<String>) -> Result<()> {
    let pipeline = load_pipeline(&config_path, &datasets)?;
    for (name, status) in pipeline.check() {
        match status {
            Ok(status) => println!("{name:<24} {status}"),
            Err(e) => println!("{name:<24} error: {e}"),
        }
    }
    Ok(())
}

fn run_watermarks(config_path: PathBuf, json: bool) -> Result<()> {
    let pipeline = load_pipeline(&config_path, &[])?;
    let status = pipeline.table_status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let date = |d: Option<NaiveDate>| d.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
    println!(
        "{:<24} {:<12} {:>10} {:<12} {:>10}",
        "dataset", "raw", "raw rows", "cache", "cache rows"
    );
    for s in status {
        println!(
            "{:<24} {:<12} {:>10} {:<12} {:>10}",
            s.dataset,
            date(s.raw_watermark),
            s.raw_rows.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            date(s.cache_watermark),
            s.cache_rows
        );
    }
    Ok(())
}
