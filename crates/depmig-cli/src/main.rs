use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use depmig_sync::{FailurePolicy, MigrationConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "depmig")]
#[command(about = "Migrate depreciation reports into the CRM and Postgres")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Overrides {
    /// Directory holding reports.json, div-40-all.json and div-43-all.json.
    #[arg(long, global = true)]
    extract_dir: Option<PathBuf>,
    /// Directory for the per-report asset artifacts.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// abort or continue when a record fails after validation.
    #[arg(long, global = true)]
    failure_policy: Option<FailurePolicy>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Partition the asset extracts, then migrate every report.
    Run,
    /// Split the asset extracts into per-report artifacts.
    Partition,
    /// Transform every report from existing artifacts without remote calls.
    Validate,
    /// Reconcile every report from existing artifacts.
    Migrate,
    /// Apply the Postgres schema migrations.
    MigrateDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = MigrationConfig::from_env()?;
    if let Some(dir) = cli.overrides.extract_dir {
        config.extract_dir = dir;
    }
    if let Some(dir) = cli.overrides.output_dir {
        config.output_dir = dir;
    }
    if let Some(policy) = cli.overrides.failure_policy {
        config.failure_policy = policy;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            partition(&config).await?;
            migrate(&config).await?;
        }
        Commands::Partition => partition(&config).await?,
        Commands::Validate => {
            let summary = depmig_sync::run_validation(&config).await?;
            for invalid in &summary.invalid {
                warn!(reference = %invalid.reference, "{}", invalid.reason);
            }
            println!(
                "validation complete: reports={} valid={} invalid={} div40_assets={} div43_assets={}",
                summary.total,
                summary.valid,
                summary.invalid.len(),
                summary.division_40_assets,
                summary.division_43_assets
            );
        }
        Commands::Migrate => migrate(&config).await?,
        Commands::MigrateDb => {
            depmig_sync::migrate_database(&config).await?;
            println!("database migrations applied");
        }
    }

    Ok(())
}

async fn partition(config: &MigrationConfig) -> Result<()> {
    let summary = depmig_sync::run_partition(config).await?;
    println!(
        "partition complete: reports={} artifacts={} assets={} dropped={} stale_removed={} output={}",
        summary.reports,
        summary.artifacts,
        summary.assets_written,
        summary.assets_dropped,
        summary.stale_removed,
        config.output_dir.display()
    );
    Ok(())
}

async fn migrate(config: &MigrationConfig) -> Result<()> {
    let summary = depmig_sync::run_migration(config).await?;
    println!(
        "migration complete: run_id={} reports={} migrated={} skipped={} failed={} replaced_deals={} replaced_reports={}",
        summary.run_id,
        summary.total,
        summary.migrated,
        summary.skipped_invalid,
        summary.failed,
        summary.replaced_deals,
        summary.replaced_reports
    );
    Ok(())
}
