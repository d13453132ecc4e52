use anyhow::{Context, Result};
use billsync_core::{DateRange, EntityKind, SyncMode};
use billsync_storage::PgLedgerStore;
use billsync_sync::{SyncConfig, SyncRuntime, TriggerRequest, WindowSpec};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "billsync")]
#[command(about = "Billing ledger sync and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate, start the tier scheduler if enabled, and serve the control plane.
    Serve,
    Migrate,
    /// Reconcile one window now.
    Sync {
        kind: EntityKind,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long)]
        days_back_start: Option<u32>,
        #[arg(long)]
        days_back_end: Option<u32>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value = "replace_all")]
        mode: SyncMode,
    },
    Validate {
        kind: EntityKind,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        deep: bool,
    },
    Drift {
        kind: EntityKind,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Per-month sync and validation coverage.
    Coverage {
        #[arg(long)]
        kind: Option<EntityKind>,
        #[arg(long, default_value_t = 12)]
        months: u32,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => billsync_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgLedgerStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Sync {
            kind,
            start,
            end,
            days_back_start,
            days_back_end,
            dry_run,
            mode,
        } => {
            let window = WindowSpec::from_parts(start, end, days_back_start, days_back_end)?;
            let runtime = SyncRuntime::from_env().await?;
            let outcome = runtime
                .service
                .trigger(TriggerRequest {
                    kind,
                    window,
                    mode,
                    dry_run,
                })
                .await?;
            print_json(&outcome)?;
        }
        Commands::Validate {
            kind,
            start,
            end,
            deep,
        } => {
            let range = DateRange::new(start, end)?;
            let runtime = SyncRuntime::from_env().await?;
            let report = runtime.service.validate(kind, range, deep).await?;
            print_json(&report)?;
        }
        Commands::Drift { kind, start, end } => {
            let range = DateRange::new(start, end)?;
            let runtime = SyncRuntime::from_env().await?;
            let report = runtime.service.drift(kind, range).await?;
            print_json(&report)?;
        }
        Commands::Coverage { kind, months } => {
            let runtime = SyncRuntime::from_env().await?;
            let coverage = runtime.service.coverage(kind, months).await?;
            print_json(&coverage)?;
        }
    }

    Ok(())
}
