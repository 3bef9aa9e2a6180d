//! Search, detail and market-data orchestration across the local store and
//! the provider chain.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use realcomp_core::{
    decimal_value, IdentityKey, ListingStatus, MarketDataPoint, MarketLocation, Property,
    PropertyDraft, PropertyFilters, PropertyRef, PropertyType,
};
use realcomp_providers::{
    normalize, normalize_at, MarketDataSource, ProviderClient, ProviderProperty, ResponseCache,
};
use realcomp_storage::{PropertyStore, StorageResult};
use tracing::{debug, info, warn};

use crate::market::MarketDataCache;

/// Local hit count at which an unconfigured deployment stops looking further.
pub const SUFFICIENT_LOCAL_RESULTS: usize = 5;

pub struct ReconciliationEngine {
    pub(crate) store: Arc<dyn PropertyStore>,
    pub(crate) providers: Vec<Arc<dyn ProviderClient>>,
    pub(crate) cache: Arc<ResponseCache>,
    market: MarketDataCache,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        providers: Vec<Arc<dyn ProviderClient>>,
        market_sources: Vec<Arc<dyn MarketDataSource>>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let market = MarketDataCache::new(store.clone(), market_sources);
        Self {
            store,
            providers,
            cache,
            market,
        }
    }

    pub fn store(&self) -> &Arc<dyn PropertyStore> {
        &self.store
    }

    pub fn any_provider_configured(&self) -> bool {
        self.providers.iter().any(|p| p.is_configured())
    }

    /// Local results first, then the first provider in priority order that
    /// answers. Provider failures never surface; only a failing local store
    /// does.
    pub async fn search_properties(&self, filters: &PropertyFilters) -> StorageResult<Vec<Property>> {
        let local = self.store.get_properties_by_filters(filters).await?;
        if local.len() >= SUFFICIENT_LOCAL_RESULTS && !self.any_provider_configured() {
            debug!(count = local.len(), "local results sufficient; no provider configured");
            return Ok(local);
        }

        let upstream = self.query_providers(filters).await;
        let mut merged = merge_results(local, upstream, Utc::now());
        if let Some(limit) = filters.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    /// Drops cached provider responses, then searches.
    pub async fn refresh_search(&self, filters: &PropertyFilters) -> StorageResult<Vec<Property>> {
        self.cache.clear().await;
        self.search_properties(filters).await
    }

    async fn query_providers(&self, filters: &PropertyFilters) -> Vec<ProviderProperty> {
        for provider in &self.providers {
            let id = provider.provider_id();
            if !provider.is_configured() {
                debug!(provider = %id, "skipping unconfigured provider");
                continue;
            }
            match provider.search(filters).await {
                Ok(records) => {
                    info!(provider = %id, count = records.len(), "provider answered search");
                    return records;
                }
                Err(err) => warn!(provider = %id, error = %err, "provider search failed; trying next"),
            }
        }
        Vec::new()
    }

    pub async fn get_property_details(
        &self,
        reference: &PropertyRef,
    ) -> StorageResult<Option<Property>> {
        match reference {
            PropertyRef::Local(id) => {
                if let Some(local) = self.store.get_property(*id).await? {
                    return Ok(Some(self.enrich(local).await));
                }
                // ATTOM ids are numeric too.
                self.external_details(&id.to_string()).await
            }
            PropertyRef::External(external_id) => self.external_details(external_id).await,
        }
    }

    async fn external_details(&self, external_id: &str) -> StorageResult<Option<Property>> {
        if let Some(local) = self.store.get_property_by_external_id(external_id).await? {
            return Ok(Some(self.enrich(local).await));
        }
        Ok(self.fetch_external(external_id).await)
    }

    pub async fn get_market_data(
        &self,
        location: &MarketLocation,
    ) -> StorageResult<Vec<MarketDataPoint>> {
        self.market.get_market_data(location).await
    }

    /// Fills an incomplete local row from the first provider that knows it
    /// and persists the result under the same identity key. Any failure
    /// returns the row unchanged.
    async fn enrich(&self, local: Property) -> Property {
        if local.has_complete_data() {
            return local;
        }
        let Some(record) = self.lookup_upstream(&local).await else {
            return local;
        };
        let upstream = match normalize(&record) {
            Ok(draft) => draft,
            Err(err) => {
                warn!(error = %err, "discarding unusable enrichment record");
                return local;
            }
        };

        let draft = enrichment_draft(&local, upstream);
        match self.store.upsert_property(&draft).await {
            Ok(saved) => {
                info!(id = ?saved.id, key = %saved.identity_key(), "property enriched");
                saved
            }
            Err(err) => {
                warn!(key = %local.identity_key(), error = %err, "failed to persist enrichment");
                local
            }
        }
    }

    async fn lookup_upstream(&self, local: &Property) -> Option<ProviderProperty> {
        let key = local.identity_key();
        for provider in self.providers.iter().filter(|p| p.is_configured()) {
            let id = provider.provider_id();
            if let Some(external_id) = local.external_id.as_deref() {
                match provider.get_details(external_id).await {
                    Ok(Some(record)) => return Some(record),
                    Ok(None) => {}
                    Err(err) => warn!(provider = %id, error = %err, "detail lookup failed"),
                }
            }
            match provider.find_by_address(&key).await {
                Ok(Some(record)) => return Some(record),
                Ok(None) => debug!(provider = %id, %key, "address unknown upstream"),
                Err(err) => warn!(provider = %id, error = %err, "address lookup failed"),
            }
        }
        None
    }

    async fn fetch_external(&self, external_id: &str) -> Option<Property> {
        for provider in self.providers.iter().filter(|p| p.is_configured()) {
            let id = provider.provider_id();
            let record = match provider.get_details(external_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(provider = %id, error = %err, "detail lookup failed");
                    continue;
                }
            };
            let draft = match normalize(&record) {
                Ok(draft) => draft,
                Err(err) => {
                    warn!(provider = %id, error = %err, "discarding unusable detail record");
                    continue;
                }
            };
            return match self.store.upsert_property(&draft).await {
                Ok(saved) => Some(saved),
                Err(err) => {
                    warn!(provider = %id, error = %err, "failed to persist fetched property");
                    Some(draft.into_unsaved(Utc::now()))
                }
            };
        }
        None
    }
}

/// Appends normalized provider records to `local`, skipping any whose
/// identity key is already present (local rows win) or whose external id
/// matches one already in the result.
pub fn merge_results(
    local: Vec<Property>,
    upstream: Vec<ProviderProperty>,
    now: DateTime<Utc>,
) -> Vec<Property> {
    let mut seen: HashSet<IdentityKey> = local.iter().map(Property::identity_key).collect();
    let mut external_ids: HashSet<String> =
        local.iter().filter_map(|p| p.external_id.clone()).collect();
    let mut merged = local;

    for record in upstream {
        let draft = match normalize_at(&record, now) {
            Ok(draft) => draft,
            Err(err) => {
                warn!(error = %err, "skipping provider record");
                continue;
            }
        };
        if draft
            .external_id
            .as_ref()
            .is_some_and(|id| external_ids.contains(id))
        {
            continue;
        }
        if !seen.insert(draft.identity_key()) {
            continue;
        }
        if let Some(id) = &draft.external_id {
            external_ids.insert(id.clone());
        }
        merged.push(draft.into_unsaved(now));
    }
    merged
}

fn known(value: String, fallback: &str) -> String {
    if decimal_value(&value) > 0.0 {
        value
    } else {
        fallback.to_string()
    }
}

/// Upstream values win for everything the provider actually knows; the
/// identity tuple and origin stay those of the local row.
pub fn enrichment_draft(local: &Property, upstream: PropertyDraft) -> PropertyDraft {
    PropertyDraft {
        external_id: upstream.external_id.or_else(|| local.external_id.clone()),
        data_source: local.data_source,
        address: local.address.clone(),
        city: local.city.clone(),
        state: local.state.clone(),
        zip_code: local.zip_code.clone(),
        neighborhood: upstream.neighborhood.or_else(|| local.neighborhood.clone()),
        price: known(upstream.price, &local.price),
        bedrooms: if upstream.bedrooms > 0 {
            upstream.bedrooms
        } else {
            local.bedrooms
        },
        bathrooms: known(upstream.bathrooms, &local.bathrooms),
        square_feet: known(upstream.square_feet, &local.square_feet),
        lot_size: known(upstream.lot_size, &local.lot_size),
        year_built: upstream.year_built.or(local.year_built),
        property_type: if upstream.property_type == PropertyType::Unknown {
            local.property_type
        } else {
            upstream.property_type
        },
        status: if upstream.status == ListingStatus::Unknown {
            local.status
        } else {
            upstream.status
        },
        days_on_market: if upstream.days_on_market > 0 {
            upstream.days_on_market
        } else {
            local.days_on_market
        },
        price_per_sqft: known(upstream.price_per_sqft, &local.price_per_sqft),
        description: upstream
            .description
            .filter(|d| !d.trim().is_empty())
            .or_else(|| local.description.clone()),
        images: upstream.images,
        features: upstream.features,
        latitude: upstream.latitude.or_else(|| local.latitude.clone()),
        longitude: upstream.longitude.or_else(|| local.longitude.clone()),
    }
}
