use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use realcomp_core::{
    IdentityKey, MarketDataPoint, MarketLocation, Property, PropertyDraft, PropertyFilters,
    PropertyPatch, PropertyRef,
};
use realcomp_providers::{
    MarketDataSource, MlsRecord, ProviderClient, ProviderError, ProviderId, ProviderIdentity,
    ProviderProperty, ResponseCache,
};
use realcomp_storage::{
    InMemoryPropertyStore, PropertyStore, StorageError, StorageResult,
};
use realcomp_sync::{ReconciliationEngine, SyncStatus};
use serde_json::json;

struct ScriptedProvider {
    id: ProviderId,
    configured: bool,
    fail: bool,
    records: Vec<ProviderProperty>,
    search_calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(id: ProviderId, records: Vec<ProviderProperty>) -> Self {
        Self {
            id,
            configured: true,
            fail: false,
            records,
            search_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
        }
    }

    fn failing(id: ProviderId) -> Self {
        Self {
            fail: true,
            ..Self::new(id, Vec::new())
        }
    }

    fn unconfigured(id: ProviderId) -> Self {
        Self {
            configured: false,
            ..Self::new(id, Vec::new())
        }
    }

    fn outage(&self) -> ProviderError {
        ProviderError::Transport {
            provider: self.id,
            message: "connection refused".into(),
            timed_out: false,
        }
    }
}

impl ProviderIdentity for ScriptedProvider {
    fn provider_id(&self) -> ProviderId {
        self.id
    }

    fn is_configured(&self) -> bool {
        self.configured
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn search(&self, filters: &PropertyFilters) -> Result<Vec<ProviderProperty>, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(self.outage());
        }
        let limit = filters.limit.unwrap_or(usize::MAX);
        Ok(self.records.iter().take(limit).cloned().collect())
    }

    async fn get_details(&self, external_id: &str) -> Result<Option<ProviderProperty>, ProviderError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(self.outage());
        }
        Ok(self
            .records
            .iter()
            .find(|r| r.external_id().as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_by_address(&self, key: &IdentityKey) -> Result<Option<ProviderProperty>, ProviderError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(self.outage());
        }
        Ok(self
            .records
            .iter()
            .find(|r| match r {
                ProviderProperty::Mls(m) => m.address.as_deref() == Some(key.address.as_str()),
                ProviderProperty::Attom(_) => false,
            })
            .cloned())
    }
}

struct ScriptedMarket {
    id: ProviderId,
    points: Vec<MarketDataPoint>,
    calls: AtomicUsize,
}

impl ScriptedMarket {
    fn new(id: ProviderId, points: Vec<MarketDataPoint>) -> Self {
        Self {
            id,
            points,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ProviderIdentity for ScriptedMarket {
    fn provider_id(&self) -> ProviderId {
        self.id
    }

    fn is_configured(&self) -> bool {
        true
    }
}

#[async_trait]
impl MarketDataSource for ScriptedMarket {
    async fn fetch_market_data(
        &self,
        _location: &MarketLocation,
    ) -> Result<Vec<MarketDataPoint>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.points.clone())
    }
}

/// Store whose filtered reads always fail.
struct BrokenReads(InMemoryPropertyStore);

#[async_trait]
impl PropertyStore for BrokenReads {
    async fn get_all_properties(&self) -> StorageResult<Vec<Property>> {
        self.0.get_all_properties().await
    }

    async fn get_property(&self, id: i64) -> StorageResult<Option<Property>> {
        self.0.get_property(id).await
    }

    async fn get_property_by_external_id(&self, external_id: &str) -> StorageResult<Option<Property>> {
        self.0.get_property_by_external_id(external_id).await
    }

    async fn find_by_identity(&self, key: &IdentityKey) -> StorageResult<Option<Property>> {
        self.0.find_by_identity(key).await
    }

    async fn get_properties_by_filters(&self, _filters: &PropertyFilters) -> StorageResult<Vec<Property>> {
        Err(StorageError::Backend("connection reset".into()))
    }

    async fn create_property(&self, draft: &PropertyDraft) -> StorageResult<Property> {
        self.0.create_property(draft).await
    }

    async fn update_property(&self, id: i64, patch: &PropertyPatch) -> StorageResult<Property> {
        self.0.update_property(id, patch).await
    }

    async fn upsert_property(&self, draft: &PropertyDraft) -> StorageResult<Property> {
        self.0.upsert_property(draft).await
    }

    async fn get_market_data_by_location(
        &self,
        location: &MarketLocation,
    ) -> StorageResult<Vec<MarketDataPoint>> {
        self.0.get_market_data_by_location(location).await
    }

    async fn upsert_market_data(&self, point: &MarketDataPoint) -> StorageResult<MarketDataPoint> {
        self.0.upsert_market_data(point).await
    }
}

fn mls(id: &str, address: &str, price: u32) -> ProviderProperty {
    ProviderProperty::Mls(MlsRecord {
        id: json!(id),
        address: Some(address.into()),
        city: Some("Austin".into()),
        province: Some("TX".into()),
        postal_code: json!("78701"),
        most_recent_price_amount: json!(price),
        num_bedroom: json!(3),
        descriptions: json!([{ "value": "Renovated bungalow" }]),
        image_urls: json!(["https://img.example/a.jpg"]),
        ..Default::default()
    })
}

fn local_draft(address: &str, price: &str) -> PropertyDraft {
    PropertyDraft {
        address: address.into(),
        city: "Austin".into(),
        state: "TX".into(),
        zip_code: "78701".into(),
        price: price.into(),
        ..Default::default()
    }
}

fn austin() -> PropertyFilters {
    PropertyFilters {
        location: Some("Austin".into()),
        ..Default::default()
    }
}

fn market_point(month: i32, age_days: i64) -> MarketDataPoint {
    MarketDataPoint {
        id: None,
        city: "Austin".into(),
        state: "TX".into(),
        zip_code: String::new(),
        year: 2025,
        month,
        median_price: "510000".into(),
        days_on_market: 28,
        active_listings: 40,
        average_price_per_sqft: "275".into(),
        sale_to_list_ratio: "0.97".into(),
        inventory_months: "2.5".into(),
        market_type: "Seller's Market".into(),
        updated_at: Utc::now() - Duration::days(age_days),
    }
}

fn engine_with(
    store: Arc<dyn PropertyStore>,
    providers: Vec<Arc<dyn ProviderClient>>,
    market: Vec<Arc<dyn MarketDataSource>>,
) -> ReconciliationEngine {
    ReconciliationEngine::new(store, providers, market, Arc::new(ResponseCache::disabled()))
}

#[tokio::test]
async fn local_row_wins_over_provider_duplicate() {
    let store = Arc::new(InMemoryPropertyStore::new());
    store
        .upsert_property(&local_draft("123 Main St", "450000"))
        .await
        .unwrap();
    let provider = Arc::new(ScriptedProvider::new(
        ProviderId::Mls,
        vec![mls("DF-99", "123 Main St", 999_000), mls("DF-100", "77 Pine Rd", 520_000)],
    ));
    let engine = engine_with(store, vec![provider.clone()], Vec::new());

    let results = engine.search_properties(&austin()).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].address, "123 Main St");
    assert_eq!(results[0].price, "450000");
    assert!(results[0].id.is_some());
    assert_eq!(results[1].external_id.as_deref(), Some("DF-100"));
    assert!(results[1].id.is_none());
    assert_eq!(provider.search_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_primary_falls_through_to_secondary() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let primary = Arc::new(ScriptedProvider::failing(ProviderId::Mls));
    let secondary = Arc::new(ScriptedProvider::new(
        ProviderId::Attom,
        vec![mls("AT-1", "8 Lake Dr", 610_000)],
    ));
    let engine = engine_with(store, vec![primary.clone(), secondary.clone()], Vec::new());

    let results = engine.search_properties(&austin()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].address, "8 Lake Dr");
    assert_eq!(primary.search_calls.load(Ordering::SeqCst), 1);
    assert_eq!(secondary.search_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn first_answering_provider_ends_the_chain() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let primary = Arc::new(ScriptedProvider::new(ProviderId::Mls, Vec::new()));
    let secondary = Arc::new(ScriptedProvider::new(
        ProviderId::Attom,
        vec![mls("AT-1", "8 Lake Dr", 610_000)],
    ));
    let engine = engine_with(store, vec![primary, secondary.clone()], Vec::new());

    let results = engine.search_properties(&austin()).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(secondary.search_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn provider_outages_degrade_to_local_results() {
    let store = Arc::new(InMemoryPropertyStore::new());
    store
        .upsert_property(&local_draft("9 Oak Ave", "300000"))
        .await
        .unwrap();
    let engine = engine_with(
        store,
        vec![
            Arc::new(ScriptedProvider::failing(ProviderId::Mls)),
            Arc::new(ScriptedProvider::failing(ProviderId::Attom)),
        ],
        Vec::new(),
    );

    let results = engine.search_properties(&austin()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].address, "9 Oak Ave");
}

#[tokio::test]
async fn unconfigured_providers_are_never_called() {
    let store = Arc::new(InMemoryPropertyStore::new());
    for n in 0..6 {
        store
            .upsert_property(&local_draft(&format!("{n} Cedar Ln"), "250000"))
            .await
            .unwrap();
    }
    let idle = Arc::new(ScriptedProvider::unconfigured(ProviderId::Mls));
    let engine = engine_with(store, vec![idle.clone()], Vec::new());

    let results = engine.search_properties(&austin()).await.unwrap();
    assert_eq!(results.len(), 6);
    assert_eq!(idle.search_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn limit_truncates_merged_results() {
    let store = Arc::new(InMemoryPropertyStore::new());
    store
        .upsert_property(&local_draft("1 Birch Ct", "200000"))
        .await
        .unwrap();
    let provider = Arc::new(ScriptedProvider::new(
        ProviderId::Mls,
        vec![mls("DF-1", "2 Birch Ct", 1), mls("DF-2", "3 Birch Ct", 2)],
    ));
    let engine = engine_with(store, vec![provider], Vec::new());

    let filters = PropertyFilters {
        limit: Some(2),
        ..austin()
    };
    let results = engine.search_properties(&filters).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].address, "1 Birch Ct");
}

#[tokio::test]
async fn local_store_failure_is_surfaced() {
    let store = Arc::new(BrokenReads(InMemoryPropertyStore::new()));
    let engine = engine_with(
        store,
        vec![Arc::new(ScriptedProvider::new(ProviderId::Mls, Vec::new()))],
        Vec::new(),
    );

    let err = engine.search_properties(&austin()).await.unwrap_err();
    assert!(matches!(err, StorageError::Backend(_)));
}

#[tokio::test]
async fn incomplete_local_row_is_enriched_and_persisted() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let saved = store
        .upsert_property(&local_draft("123 Main St", "450000"))
        .await
        .unwrap();
    let id = saved.id.unwrap();
    let provider = Arc::new(ScriptedProvider::new(
        ProviderId::Mls,
        vec![mls("DF-99", "123 Main St", 455_000)],
    ));
    let engine = engine_with(store.clone(), vec![provider.clone()], Vec::new());

    let detail = engine
        .get_property_details(&PropertyRef::Local(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.id, Some(id));
    assert_eq!(detail.price, "455000");
    assert_eq!(detail.description.as_deref(), Some("Renovated bungalow"));
    assert_eq!(detail.images, vec!["https://img.example/a.jpg".to_string()]);
    assert_eq!(store.property_count(), 1);

    let calls_after_first = provider.detail_calls.load(Ordering::SeqCst);
    let again = engine
        .get_property_details(&PropertyRef::Local(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.external_id.as_deref(), Some("DF-99"));
    assert_eq!(provider.detail_calls.load(Ordering::SeqCst), calls_after_first);
}

#[tokio::test]
async fn enrichment_failure_returns_local_row_unchanged() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let saved = store
        .upsert_property(&local_draft("4 Elm St", "380000"))
        .await
        .unwrap();
    let engine = engine_with(
        store,
        vec![Arc::new(ScriptedProvider::failing(ProviderId::Mls))],
        Vec::new(),
    );

    let detail = engine
        .get_property_details(&PropertyRef::Local(saved.id.unwrap()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail, saved);
}

#[tokio::test]
async fn numeric_provider_id_without_local_row_is_fetched_upstream() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let provider = Arc::new(ScriptedProvider::new(
        ProviderId::Mls,
        vec![mls("184713191", "9 Cedar Ln", 515_000)],
    ));
    let engine = engine_with(store.clone(), vec![provider], Vec::new());

    let reference = PropertyRef::parse("184713191").unwrap();
    assert_eq!(reference, PropertyRef::Local(184713191));
    let fetched = engine
        .get_property_details(&reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.address, "9 Cedar Ln");
    assert_eq!(fetched.external_id.as_deref(), Some("184713191"));

    let again = engine
        .get_property_details(&reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, fetched.id);
    assert_eq!(store.get_all_properties().await.unwrap().len(), 1);
}

#[tokio::test]
async fn external_detail_is_fetched_and_stored() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let provider = Arc::new(ScriptedProvider::new(
        ProviderId::Mls,
        vec![mls("DF-7", "7 Willow Way", 700_000)],
    ));
    let engine = engine_with(store.clone(), vec![provider], Vec::new());

    let detail = engine
        .get_property_details(&PropertyRef::External("DF-7".into()))
        .await
        .unwrap()
        .unwrap();
    assert!(detail.id.is_some());
    assert_eq!(detail.address, "7 Willow Way");

    let stored = store.get_property_by_external_id("DF-7").await.unwrap();
    assert_eq!(stored.map(|p| p.id), Some(detail.id));

    let missing = engine
        .get_property_details(&PropertyRef::External("DF-404".into()))
        .await
        .unwrap();
    assert!(missing.is_none());
    assert!(engine
        .get_property_details(&PropertyRef::Local(9999))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn full_year_of_market_data_skips_upstream() {
    let store = Arc::new(InMemoryPropertyStore::new());
    for month in 1..=12 {
        store.upsert_market_data(&market_point(month, 200)).await.unwrap();
    }
    let source = Arc::new(ScriptedMarket::new(ProviderId::Attom, vec![market_point(1, 0)]));
    let engine = engine_with(store, Vec::new(), vec![source.clone()]);

    let location = MarketLocation::new("Austin", "TX", None);
    let points = engine.get_market_data(&location).await.unwrap();
    assert_eq!(points.len(), 12);
    assert_eq!(points[0].month, 12);
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_market_data_is_refreshed_from_next_non_empty_source() {
    let store = Arc::new(InMemoryPropertyStore::new());
    store.upsert_market_data(&market_point(1, 90)).await.unwrap();

    let empty = Arc::new(ScriptedMarket::new(ProviderId::Attom, Vec::new()));
    let mut fresh = market_point(2, 0);
    fresh.city = "AUSTIN".into();
    fresh.zip_code = "78701".into();
    let filled = Arc::new(ScriptedMarket::new(ProviderId::Mls, vec![fresh]));
    let engine = engine_with(store, Vec::new(), vec![empty.clone(), filled.clone()]);

    let location = MarketLocation::new("Austin", "TX", None);
    let points = engine.get_market_data(&location).await.unwrap();
    assert_eq!(empty.calls.load(Ordering::SeqCst), 1);
    assert_eq!(filled.calls.load(Ordering::SeqCst), 1);
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].month, 2);
    assert_eq!(points[0].city, "Austin");
    assert_eq!(points[0].zip_code, "");
}

#[tokio::test]
async fn mls_sync_counts_partial_failures_and_is_idempotent() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let no_city = ProviderProperty::Mls(MlsRecord {
        id: json!("DF-bad"),
        address: Some("1 Nowhere".into()),
        province: Some("TX".into()),
        ..Default::default()
    });
    let provider = Arc::new(ScriptedProvider::new(
        ProviderId::Mls,
        vec![
            mls("DF-1", "1 Sync St", 400_000),
            no_city,
            mls("DF-2", "2 Sync St", 410_000),
        ],
    ));
    let engine = engine_with(store.clone(), vec![provider], Vec::new());

    let first = engine.synchronize_mls_data(10).await;
    assert_eq!(first.status, SyncStatus::Partial);
    assert_eq!((first.count, first.successful, first.failed), (3, 2, 1));
    assert_eq!(store.property_count(), 2);

    let second = engine.synchronize_mls_data(10).await;
    assert_eq!(second.successful, 2);
    assert_eq!(store.property_count(), 2);
}

#[tokio::test]
async fn mls_sync_without_mls_provider_reports_error() {
    let store = Arc::new(InMemoryPropertyStore::new());
    let engine = engine_with(
        store,
        vec![Arc::new(ScriptedProvider::new(
            ProviderId::Attom,
            vec![mls("AT-1", "1 Sync St", 1)],
        ))],
        Vec::new(),
    );

    let summary = engine.synchronize_mls_data(10).await;
    assert_eq!(summary.status, SyncStatus::Error);
    assert_eq!(summary.count, 0);
}
