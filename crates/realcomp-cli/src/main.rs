use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use realcomp_core::{MarketLocation, PropertyFilters};
use realcomp_storage::PgPropertyStore;
use realcomp_sync::{build_engine, build_store, maybe_build_scheduler, AppConfig};
use realcomp_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "realcomp-cli")]
#[command(about = "Property search and reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the sync scheduler when enabled).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Pull MLS listings into the local store once.
    Sync {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Apply database migrations.
    Migrate,
    Search {
        #[arg(long)]
        location: Option<String>,
        #[arg(long = "type")]
        property_type: Option<String>,
        #[arg(long)]
        min_price: Option<f64>,
        #[arg(long)]
        max_price: Option<f64>,
        #[arg(long)]
        min_beds: Option<i32>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Bypass cached provider responses.
        #[arg(long)]
        refresh: bool,
    },
    MarketData {
        #[arg(long)]
        city: String,
        #[arg(long)]
        state: String,
        #[arg(long)]
        zip: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let store = build_store(&config).await?;
            let engine = Arc::new(build_engine(&config, store)?);
            let scheduler = maybe_build_scheduler(&config, engine.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "MLS sync scheduler started");
            }
            let state = AppState::new(engine, config.sync_limit);
            realcomp_web::serve(state, port.unwrap_or(config.web_port)).await?;
        }
        Commands::Sync { limit } => {
            let store = build_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let summary = engine
                .synchronize_mls_data(limit.unwrap_or(config.sync_limit))
                .await;
            println!(
                "sync {}: run_id={} count={} successful={} failed={} ({})",
                summary.status,
                summary.run_id,
                summary.count,
                summary.successful,
                summary.failed,
                summary.message
            );
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgPropertyStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Search {
            location,
            property_type,
            min_price,
            max_price,
            min_beds,
            status,
            limit,
            refresh,
        } => {
            let filters = PropertyFilters {
                location,
                property_type,
                min_price,
                max_price,
                min_beds,
                status,
                limit,
                ..Default::default()
            };
            if filters.is_empty() {
                bail!("at least one search filter is required");
            }
            let store = build_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let results = if refresh {
                engine.refresh_search(&filters).await?
            } else {
                engine.search_properties(&filters).await?
            };
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::MarketData { city, state, zip } => {
            let store = build_store(&config).await?;
            let engine = build_engine(&config, store)?;
            let points = engine
                .get_market_data(&MarketLocation::new(city, state, zip))
                .await?;
            println!("{}", serde_json::to_string_pretty(&points)?);
        }
    }

    Ok(())
}
