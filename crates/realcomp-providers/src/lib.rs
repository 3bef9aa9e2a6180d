//! Listing-provider contracts plus the MLS and ATTOM client implementations.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use realcomp_core::{IdentityKey, MarketDataPoint, MarketLocation, PropertyFilters};
use realcomp_storage::{FetchError, HttpFetcher, HttpRequestSpec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod attom;
pub mod cache;
pub mod mls;
pub mod normalize;

pub use attom::{AttomClient, AttomRecord, AttomSettings};
pub use cache::{ResponseCache, DEFAULT_RESPONSE_TTL};
pub use mls::{MlsClient, MlsRecord, MlsSettings};
pub use normalize::{normalize, normalize_at, NormalizeError};

pub const CRATE_NAME: &str = "realcomp-providers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Mls,
    Attom,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Mls => "mls",
            ProviderId::Attom => "attom",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} is not configured")]
    NotConfigured { provider: ProviderId },
    #[error("{provider} returned http {status}: {message}")]
    Http {
        provider: ProviderId,
        status: u16,
        message: String,
    },
    #[error("{provider} request failed: {message}")]
    Transport {
        provider: ProviderId,
        message: String,
        timed_out: bool,
    },
    #[error("{provider} returned an unreadable payload: {message}")]
    Decode { provider: ProviderId, message: String },
    #[error("{provider} cannot serve {operation}")]
    Unsupported {
        provider: ProviderId,
        operation: &'static str,
    },
}

impl ProviderError {
    pub fn from_fetch(provider: ProviderId, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus {
                status, message, ..
            } => ProviderError::Http {
                provider,
                status,
                message,
            },
            FetchError::Request(inner) => ProviderError::Transport {
                provider,
                timed_out: inner.is_timeout(),
                message: inner.to_string(),
            },
        }
    }

    pub fn decode(provider: ProviderId, err: impl fmt::Display) -> Self {
        ProviderError::Decode {
            provider,
            message: err.to_string(),
        }
    }

    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderError::NotConfigured { provider }
            | ProviderError::Http { provider, .. }
            | ProviderError::Transport { provider, .. }
            | ProviderError::Decode { provider, .. }
            | ProviderError::Unsupported { provider, .. } => *provider,
        }
    }
}

/// A raw upstream record, tagged by the provider that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", content = "record", rename_all = "lowercase")]
pub enum ProviderProperty {
    Mls(MlsRecord),
    Attom(AttomRecord),
}

impl ProviderProperty {
    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderProperty::Mls(_) => ProviderId::Mls,
            ProviderProperty::Attom(_) => ProviderId::Attom,
        }
    }

    pub fn external_id(&self) -> Option<String> {
        match self {
            ProviderProperty::Mls(record) => record.external_id(),
            ProviderProperty::Attom(record) => record.external_id(),
        }
    }
}

/// Identity shared by listing clients and market-data sources.
pub trait ProviderIdentity: Send + Sync {
    fn provider_id(&self) -> ProviderId;
    fn is_configured(&self) -> bool;
}

#[async_trait]
pub trait ProviderClient: ProviderIdentity {
    async fn search(&self, filters: &PropertyFilters) -> Result<Vec<ProviderProperty>, ProviderError>;

    async fn get_details(&self, external_id: &str) -> Result<Option<ProviderProperty>, ProviderError>;

    async fn find_by_address(&self, key: &IdentityKey) -> Result<Option<ProviderProperty>, ProviderError>;
}

#[async_trait]
pub trait MarketDataSource: ProviderIdentity {
    async fn fetch_market_data(
        &self,
        location: &MarketLocation,
    ) -> Result<Vec<MarketDataPoint>, ProviderError>;
}

/// Sends `spec` unless an unexpired body for `cache_key` is already held,
/// then decodes it with `parse`. Only bodies that decode are cached.
pub(crate) async fn fetch_cached<T>(
    http: &HttpFetcher,
    cache: &ResponseCache,
    provider: ProviderId,
    cache_key: String,
    spec: &HttpRequestSpec,
    parse: impl FnOnce(&str) -> Result<T, ProviderError>,
) -> Result<T, ProviderError> {
    if let Some(body) = cache.get(&cache_key).await {
        debug!(%provider, cache_key, "response cache hit");
        return parse(&body);
    }
    let response = http
        .fetch(provider.as_str(), spec)
        .await
        .map_err(|err| ProviderError::from_fetch(provider, err))?;
    store_parsed(cache, cache_key, response.text(), parse).await
}

async fn store_parsed<T>(
    cache: &ResponseCache,
    cache_key: String,
    body: String,
    parse: impl FnOnce(&str) -> Result<T, ProviderError>,
) -> Result<T, ProviderError> {
    let parsed = parse(&body)?;
    cache.put(cache_key, body).await;
    Ok(parsed)
}

pub(crate) fn ensure_configured(
    provider: ProviderId,
    configured: bool,
) -> Result<(), ProviderError> {
    if configured {
        Ok(())
    } else {
        Err(ProviderError::NotConfigured { provider })
    }
}

/// Quotes a value for a Datafiniti-style query term.
pub(crate) fn quote_term(value: &str) -> String {
    format!("\"{}\"", value.trim().replace('\\', "").replace('"', "\\\""))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider_id: ProviderId,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderEntry>,
    #[serde(default = "default_market_data_order")]
    pub market_data: Vec<ProviderId>,
}

fn default_market_data_order() -> Vec<ProviderId> {
    vec![ProviderId::Attom, ProviderId::Mls]
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderEntry {
                    provider_id: ProviderId::Mls,
                    enabled: true,
                },
                ProviderEntry {
                    provider_id: ProviderId::Attom,
                    enabled: true,
                },
            ],
            market_data: default_market_data_order(),
        }
    }
}

impl ProviderRegistry {
    pub const FILE_NAME: &'static str = "providers.yaml";

    /// Reads `providers.yaml` from the workspace root, falling back to the
    /// default order when the file does not exist.
    pub fn load(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let path = workspace_root.as_ref().join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled listing providers in priority order, first occurrence wins.
    pub fn listing_order(&self) -> Vec<ProviderId> {
        let mut order = Vec::new();
        for entry in self.providers.iter().filter(|e| e.enabled) {
            if !order.contains(&entry.provider_id) {
                order.push(entry.provider_id);
            }
        }
        order
    }

    pub fn is_enabled(&self, provider: ProviderId) -> bool {
        self.providers
            .iter()
            .any(|e| e.provider_id == provider && e.enabled)
    }

    /// Market-data sources in priority order, restricted to enabled providers.
    pub fn market_data_order(&self) -> Vec<ProviderId> {
        let mut order = Vec::new();
        for provider in &self.market_data {
            if self.is_enabled(*provider) && !order.contains(provider) {
                order.push(*provider);
            }
        }
        order
    }
}
