use anyhow::{Context, Result};
use ansdb_core::{Period, UnitOutcome};
use ansdb_report::{export_reports, AggregationEngine, ExpenseSource};
use ansdb_sync::{connect_and_migrate, IngestStore, MemoryStore, SyncConfig, SyncPipeline};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ansdb")]
#[command(about = "ANS operator registry and financial statement ingestion")]
struct Cli {
    /// Use an in-process store instead of Postgres; nothing is persisted.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Trailing calendar years of statements to ingest (overrides ANSDB_YEARS).
    #[arg(long, global = true)]
    years: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Create or update the database schema.
    Migrate,
    /// Ingest the operator registry.
    Operators,
    /// Ingest financial statements for the given periods, or the trailing years.
    Statements {
        #[arg(long = "period", value_name = "LABEL")]
        periods: Vec<Period>,
    },
    /// Write top-expense rankings for the latest period and year.
    Report,
    /// Operators, statements, then reports.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ansdb=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(years) = cli.years.filter(|&y| y > 0) {
        config.years = years;
    }
    let command = cli.command.unwrap_or(Commands::Sync);

    if cli.dry_run {
        if matches!(command, Commands::Migrate) {
            println!("dry run: no schema to migrate");
            return Ok(());
        }
        info!("dry run: using in-memory store");
        return execute(command, config, MemoryStore::new()).await;
    }

    let store = connect_and_migrate(&config.database_url).await?;
    if matches!(command, Commands::Migrate) {
        println!("schema up to date");
        return Ok(());
    }
    execute(command, config, store).await
}

async fn execute<S>(command: Commands, config: SyncConfig, store: S) -> Result<()>
where
    S: IngestStore + ExpenseSource,
{
    let reports_dir = config.reports_dir.clone();
    let today = Local::now().date_naive();
    let pipeline = SyncPipeline::new(config, store).context("building sync pipeline")?;

    match command {
        Commands::Migrate => {}
        Commands::Operators => {
            let outcome = pipeline.run_operators().await?;
            print_outcome(&outcome);
        }
        Commands::Statements { periods } => {
            let periods = if periods.is_empty() {
                Period::trailing(today, pipeline.config().years)
            } else {
                periods
            };
            for outcome in pipeline.run_statements(&periods).await? {
                print_outcome(&outcome);
            }
        }
        Commands::Report => {
            write_reports(pipeline.store(), &reports_dir, Uuid::new_v4()).await?;
        }
        Commands::Sync => {
            let summary = pipeline.run_once(today).await?;
            print_outcome(&summary.operators);
            for outcome in &summary.statements {
                print_outcome(outcome);
            }
            write_reports(pipeline.store(), &reports_dir, summary.run_id).await?;
            println!(
                "sync complete: run_id={} operators={} statements={} skipped_periods={}",
                summary.run_id,
                summary.operators.imported(),
                summary.imported_statements(),
                summary.skipped_periods()
            );
        }
    }
    Ok(())
}

async fn write_reports<S: ExpenseSource>(
    store: &S,
    reports_dir: &std::path::Path,
    run_id: Uuid,
) -> Result<()> {
    let reports = AggregationEngine::new(store)
        .latest_reports()
        .await
        .context("computing top expenses")?;
    let artifacts = export_reports(reports_dir, run_id, Utc::now(), &reports).await?;
    println!(
        "reports written: {} (manifest {})",
        artifacts.dir.display(),
        artifacts.manifest.display()
    );
    Ok(())
}

fn print_outcome(outcome: &UnitOutcome) {
    match outcome {
        UnitOutcome::Imported(summary) => println!(
            "{}: imported={} skipped={} failed_batches={}",
            summary.source,
            summary.imported,
            summary.skipped,
            summary.failed_batches.len()
        ),
        UnitOutcome::Skipped { unit, reason } => println!("{unit}: skipped ({reason})"),
    }
}
