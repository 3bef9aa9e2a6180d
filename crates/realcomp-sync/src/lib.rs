//! Reconciliation engine, market data cache, MLS synchronization and the
//! process wiring shared by the CLI and the web layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use realcomp_providers::{
    AttomClient, AttomSettings, MarketDataSource, MlsClient, MlsSettings, ProviderClient,
    ProviderId, ProviderRegistry, ResponseCache,
};
use realcomp_storage::{
    HttpClientConfig, HttpFetcher, InMemoryPropertyStore, PgPropertyStore, PropertyStore,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod engine;
pub mod market;
pub mod mls_sync;

pub use engine::{enrichment_draft, merge_results, ReconciliationEngine, SUFFICIENT_LOCAL_RESULTS};
pub use market::{is_fresh, MarketDataCache, MARKET_POINT_CEILING, MARKET_STALENESS_DAYS};
pub use mls_sync::{SyncStatus, SyncSummary};

pub const CRATE_NAME: &str = "realcomp-sync";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub mls: MlsSettings,
    pub attom: AttomSettings,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cache_ttl_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub sync_limit: usize,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mls_defaults = MlsSettings::default();
        let attom_defaults = AttomSettings::default();

        Self {
            database_url: var("DATABASE_URL"),
            mls: MlsSettings {
                api_key: var("MLS_API_KEY"),
                endpoint: var("MLS_API_ENDPOINT").unwrap_or(mls_defaults.endpoint),
                ..mls_defaults
            },
            attom: AttomSettings {
                api_key: var("ATTOM_API_KEY"),
                endpoint: var("ATTOM_API_ENDPOINT").unwrap_or(attom_defaults.endpoint),
                ..attom_defaults
            },
            http_timeout_secs: var("REALCOMP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            user_agent: var("REALCOMP_USER_AGENT").unwrap_or_else(|| "realcomp/0.1".to_string()),
            cache_ttl_secs: var("REALCOMP_CACHE_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            scheduler_enabled: var("REALCOMP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("REALCOMP_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_limit: var("REALCOMP_SYNC_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            web_port: var("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            workspace_root: var("REALCOMP_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise an
/// in-memory store.
pub async fn build_store(config: &AppConfig) -> Result<Arc<dyn PropertyStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgPropertyStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("using postgres property store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory property store");
            Ok(Arc::new(InMemoryPropertyStore::new()))
        }
    }
}

/// Builds the provider chain from `providers.yaml` and the configured keys.
pub fn build_engine(config: &AppConfig, store: Arc<dyn PropertyStore>) -> Result<ReconciliationEngine> {
    let registry = ProviderRegistry::load(&config.workspace_root)?;
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);
    let cache = Arc::new(ResponseCache::new(Duration::from_secs(config.cache_ttl_secs)));

    let mls = Arc::new(MlsClient::new(http.clone(), cache.clone(), config.mls.clone()));
    let attom = Arc::new(AttomClient::new(http, cache.clone(), config.attom.clone()));

    let providers: Vec<Arc<dyn ProviderClient>> = registry
        .listing_order()
        .into_iter()
        .map(|id| -> Arc<dyn ProviderClient> {
            match id {
                ProviderId::Mls => mls.clone(),
                ProviderId::Attom => attom.clone(),
            }
        })
        .collect();
    let market_sources: Vec<Arc<dyn MarketDataSource>> = registry
        .market_data_order()
        .into_iter()
        .map(|id| -> Arc<dyn MarketDataSource> {
            match id {
                ProviderId::Mls => mls.clone(),
                ProviderId::Attom => attom.clone(),
            }
        })
        .collect();

    for provider in &providers {
        if !provider.is_configured() {
            warn!(provider = %provider.provider_id(), "provider has no API key; it will be skipped");
        }
    }

    Ok(ReconciliationEngine::new(store, providers, market_sources, cache))
}

/// Cron-driven MLS sync runs, or `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &AppConfig,
    engine: Arc<ReconciliationEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let limit = config.sync_limit;
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            let summary = engine.synchronize_mls_data(limit).await;
            info!(status = %summary.status, count = summary.count, "scheduled MLS sync finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
