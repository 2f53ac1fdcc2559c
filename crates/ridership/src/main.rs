use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use clap::{Args, Parser, Subcommand};
use ridership_core::config::PipelineConfig;
use ridership_core::pipeline::{self, RunOptions, RunReport, StageStatus};
use ridership_core::schema::Year;
use ridership_core::source::{DirectorySource, HttpSource, RidershipSource};
use ridership_core::{aggregates, db, ExecutionContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "BART ridership warehouse loader", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load one or more years of ridership, then refresh the aggregates
    Load(LoadArgs),
    /// Rebuild and republish the aggregates from the current fact table
    Refresh,
}

#[derive(Args, Debug, Default)]
struct LoadArgs {
    /// First year to load (defaults to the current year)
    #[arg(long)]
    start_year: Option<i32>,
    /// Last year to load, inclusive (defaults to the current year)
    #[arg(long)]
    end_year: Option<i32>,
    /// Read archives from this directory instead of downloading them
    #[arg(long)]
    source_dir: Option<PathBuf>,
    /// Skip the aggregate refresh after loading
    #[arg(long)]
    skip_refresh: bool,
    /// Stop at the first failed year
    #[arg(long)]
    fail_fast: bool,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Load(args) => handle_load(args).await,
        Command::Refresh => handle_refresh().await,
    }
}

async fn connect() -> Result<(PipelineConfig, ExecutionContext)> {
    dotenvy::dotenv().ok();
    let config = PipelineConfig::from_env()?;
    let pool = db::connect(&config)
        .await
        .context("failed to connect to the warehouse")?;
    Ok((config, ExecutionContext::new(pool)))
}

async fn handle_load(args: LoadArgs) -> Result<()> {
    let (start_year, end_year) = requested_range(&args, Utc::now().year());
    let years = Year::range(start_year, end_year)?;

    let (config, ctx) = connect().await?;
    let source: Box<dyn RidershipSource> = match &args.source_dir {
        Some(dir) => Box::new(DirectorySource::new(dir)),
        None => Box::new(HttpSource::new(&config.source_url, config.http_timeout)?),
    };

    let options = RunOptions {
        refresh: !args.skip_refresh,
        fail_fast: args.fail_fast,
    };
    info!(
        start_year,
        end_year,
        refresh = options.refresh,
        "Starting ridership load"
    );
    let report = pipeline::run(&ctx, source.as_ref(), &years, options).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_success() {
        let failed = report.failed_years();
        if report.refresh.status == StageStatus::Failed {
            bail!(
                "ridership load finished with {} failed year(s) and a failed refresh",
                failed.len()
            );
        }
        bail!("ridership load failed for year(s) {}", join_years(&failed));
    }
    Ok(())
}

/// Inclusive year bounds from the flags, with `current` for any omitted one.
fn requested_range(args: &LoadArgs, current: i32) -> (i32, i32) {
    (
        args.start_year.unwrap_or(current),
        args.end_year.unwrap_or(current),
    )
}

async fn handle_refresh() -> Result<()> {
    let (_, ctx) = connect().await?;
    let report = aggregates::refresh_all(&ctx).await?;
    println!("Published {} aggregates:", report.published.len());
    for view in &report.published {
        println!("  {view}");
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for summary in &report.years {
        match (&summary.status, &summary.transform, &summary.error) {
            (StageStatus::Success, Some(transform), _) => {
                let staged = summary.staging.as_ref().map(|s| s.rows).unwrap_or(0);
                println!(
                    "{}: staged {} rows, loaded {} fact rows, excluded {}",
                    summary.year, staged, transform.inserted_rows, transform.excluded_rows
                );
            }
            (_, _, Some(error)) => {
                println!("{}: failed ({:?}): {}", summary.year, error.kind, error.message);
            }
            _ => println!("{}: {:?}", summary.year, summary.status),
        }
    }

    match (&report.refresh.status, &report.refresh.report, &report.refresh.error) {
        (StageStatus::Success, Some(refresh), _) => {
            println!("Refreshed {} aggregates", refresh.published.len());
        }
        (StageStatus::Skipped, _, _) => println!("Aggregate refresh skipped"),
        (_, _, Some(error)) => println!("Aggregate refresh failed: {}", error.message),
        _ => {}
    }
}

fn join_years(years: &[Year]) -> String {
    years
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
