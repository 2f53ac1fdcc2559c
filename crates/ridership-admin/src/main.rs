use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use ridership_core::config::PipelineConfig;
use ridership_core::{admin, db};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "BART ridership warehouse administrative tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drop the aggregates, fact and staging tables (dimensions are kept)
    Teardown(TeardownArgs),
    /// List staging and fact partitions with their row counts
    Status,
}

#[derive(Args, Debug, Default)]
struct TeardownArgs {
    /// Execute the statements instead of only printing them
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Teardown(args) => handle_teardown(args).await,
        Command::Status => handle_status().await,
    }
}

async fn connect_pool() -> Result<db::DbPool> {
    dotenvy::dotenv().ok();
    let config = PipelineConfig::from_env()?;
    db::connect(&config)
        .await
        .context("failed to connect to the warehouse")
}

async fn handle_teardown(args: TeardownArgs) -> Result<()> {
    if !args.yes {
        println!("The following statements would run in one transaction:");
        for statement in admin::teardown_statements()? {
            println!("  {statement};");
        }
        println!("Run again with --yes to execute them.");
        return Ok(());
    }

    let pool = connect_pool().await?;
    let statements = admin::teardown(&pool).await?;
    info!(statements = statements.len(), "Warehouse teardown complete");
    println!("Executed {} teardown statements.", statements.len());
    Ok(())
}

async fn handle_status() -> Result<()> {
    let pool = connect_pool().await?;
    let partitions = admin::partition_status(&pool).await?;

    if partitions.is_empty() {
        println!("No staging or fact partitions found.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Table", "Partition", "Year", "Rows"]);
    for status in &partitions {
        table.add_row(vec![
            status.table.clone(),
            status.partition.clone(),
            status.year.map(|y| y.to_string()).unwrap_or_else(|| "-".into()),
            status.rows.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
        ]);
    }
    println!("{table}");
    Ok(())
}
