use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use recon_engine::{
    report_history_markdown, write_run_reports, BatchReconciler, ReconConfig, ReportGenerator,
    RunOutcome,
};
use recon_ingest::{load_dataset, write_dataset, LegacyDataset};
use recon_storage::{
    CanonicalStore, MemoryCanonicalStore, MemoryRecordSource, PgCanonicalStore, PgRecordSource,
    RecordSource,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Link legacy free-text categories to canonical category records")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover, match and backfill category references.
    Reconcile(ReconcileArgs),
    /// Apply database migrations.
    Migrate,
    /// Print the current category distribution.
    Report(ReportArgs),
}

#[derive(Debug, Default, Args)]
struct ReconcileArgs {
    /// Records per commit batch; overrides RECON_BATCH_SIZE.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Plan discovery and matching without writing anything.
    #[arg(long)]
    dry_run: bool,
    /// Reconcile a legacy JSON export instead of the database.
    #[arg(long)]
    dataset: Option<PathBuf>,
    /// Print the report without writing the per-run report directory.
    #[arg(long)]
    no_reports: bool,
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// Summarize the latest N run directories instead of querying stores.
    #[arg(long)]
    history: Option<usize>,
    /// Report over a legacy JSON export instead of the database.
    #[arg(long)]
    dataset: Option<PathBuf>,
}

struct Stores {
    canonical: Arc<dyn CanonicalStore>,
    records: Arc<dyn RecordSource>,
    offline: Option<OfflineStores>,
}

/// Concrete handles kept for writing the reconciled dataset back out.
struct OfflineStores {
    exported_at: Option<DateTime<Utc>>,
    canonical: Arc<MemoryCanonicalStore>,
    records: Arc<MemoryRecordSource>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ReconConfig::from_env();

    match cli
        .command
        .unwrap_or_else(|| Commands::Reconcile(ReconcileArgs::default()))
    {
        Commands::Reconcile(args) => reconcile(&config, args).await?,
        Commands::Migrate => {
            let pool = recon_storage::connect(&config.database_url).await?;
            recon_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Report(args) => report(&config, args).await?,
    }

    Ok(())
}

async fn reconcile(config: &ReconConfig, args: ReconcileArgs) -> Result<()> {
    let mut settings = config.settings(args.dry_run);
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = batch_size.max(1);
    }

    let stores = open_stores(config, args.dataset.as_deref()).await?;
    let reconciler = BatchReconciler::new(stores.canonical.clone(), stores.records.clone(), settings);

    let outcome = match reconciler.run().await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "reconciliation aborted before any work");
            return Err(err).context("reconciliation setup failed");
        }
    };
    print_summary(&outcome);

    // Report and artifact failures are logged; the backfill itself already completed.
    let report = match ReportGenerator::new(stores.canonical.clone(), stores.records.clone())
        .generate_for(&outcome)
        .await
    {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "distribution report unavailable");
            return Ok(());
        }
    };
    println!("{}", report.markdown());

    if args.no_reports {
        return Ok(());
    }

    match write_run_reports(&config.reports_dir, &outcome, &report).await {
        Ok(run_dir) => {
            println!("reports: {}", run_dir.display());
            if let Some(offline) = &stores.offline {
                let path = run_dir.join("reconciled_dataset.json");
                if let Err(err) = write_offline_dataset(offline, &path).await {
                    error!(error = %err, "writing reconciled dataset failed");
                } else {
                    println!("dataset: {}", path.display());
                }
            }
        }
        Err(err) => error!(error = %err, "writing run reports failed"),
    }

    Ok(())
}

async fn report(config: &ReconConfig, args: ReportArgs) -> Result<()> {
    if let Some(runs) = args.history {
        println!("{}", report_history_markdown(runs, &config.reports_dir)?);
        return Ok(());
    }

    let stores = open_stores(config, args.dataset.as_deref()).await?;
    let report = ReportGenerator::new(stores.canonical, stores.records)
        .generate()
        .await
        .context("generating distribution report")?;
    println!("{}", report.markdown());
    Ok(())
}

async fn open_stores(config: &ReconConfig, dataset: Option<&Path>) -> Result<Stores> {
    if let Some(path) = dataset {
        let LegacyDataset {
            exported_at,
            categories,
            records,
        } = load_dataset(path)?;
        info!(
            path = %path.display(),
            categories = categories.len(),
            records = records.len(),
            "loaded legacy dataset"
        );
        let canonical = Arc::new(MemoryCanonicalStore::with_categories(categories));
        let records = Arc::new(MemoryRecordSource::new(records));
        return Ok(Stores {
            canonical: canonical.clone(),
            records: records.clone(),
            offline: Some(OfflineStores {
                exported_at,
                canonical,
                records,
            }),
        });
    }

    let mapping = config.load_schema_mapping()?;
    let pool = recon_storage::connect(&config.database_url).await?;
    Ok(Stores {
        canonical: Arc::new(PgCanonicalStore::new(pool.clone(), &mapping)?),
        records: Arc::new(PgRecordSource::new(pool, &mapping)?),
        offline: None,
    })
}

async fn write_offline_dataset(offline: &OfflineStores, path: &Path) -> Result<()> {
    let dataset = LegacyDataset {
        exported_at: offline.exported_at,
        categories: offline.canonical.list_all().await?,
        records: offline.records.snapshot().await,
    };
    write_dataset(path, &dataset)
}

fn print_summary(outcome: &RunOutcome) {
    let counts = outcome.counts();
    println!(
        "reconcile {}: run_id={} eligible={} updated={} skipped_unmatched={} failed={}",
        if outcome.dry_run { "planned" } else { "complete" },
        outcome.run_id,
        outcome.eligible,
        counts.updated,
        counts.skipped_unmatched,
        counts.failed
    );
    println!(
        "discovery: distinct={} present={} created={} planned={} errors={}",
        outcome.discovery.distinct_pairs,
        outcome.discovery.already_present,
        outcome.discovery.created.len(),
        outcome.discovery.planned.len(),
        outcome.discovery.errors.len()
    );
    println!(
        "tiers: exact={} case_insensitive={} substring={}",
        outcome.tiers.exact, outcome.tiers.case_insensitive, outcome.tiers.substring
    );
}
