//! Canonical property persistence (Postgres + in-memory) and the HTTP fetch
//! utilities shared by provider clients.

use async_trait::async_trait;
use realcomp_core::{
    IdentityKey, MarketDataPoint, MarketLocation, Property, PropertyDraft, PropertyFilters,
    PropertyPatch,
};
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, HttpMethod, HttpRequestSpec, RetryDisposition,
};
pub use memory::InMemoryPropertyStore;
pub use postgres::PgPropertyStore;

pub const CRATE_NAME: &str = "realcomp-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("property {0} not found")]
    NotFound(i64),
    #[error("a property already exists at {0}")]
    Conflict(IdentityKey),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("storage backend unavailable: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage contract consumed by the reconciliation engine. Every write that
/// can originate from a provider goes through [`PropertyStore::upsert_property`]
/// so repeated writes for one address stay idempotent.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get_all_properties(&self) -> StorageResult<Vec<Property>>;

    async fn get_property(&self, id: i64) -> StorageResult<Option<Property>>;

    async fn get_property_by_external_id(&self, external_id: &str)
        -> StorageResult<Option<Property>>;

    async fn find_by_identity(&self, key: &IdentityKey) -> StorageResult<Option<Property>>;

    async fn get_properties_by_filters(
        &self,
        filters: &PropertyFilters,
    ) -> StorageResult<Vec<Property>>;

    /// Plain insert; fails with [`StorageError::Conflict`] when the address
    /// is already stored.
    async fn create_property(&self, draft: &PropertyDraft) -> StorageResult<Property>;

    async fn update_property(&self, id: i64, patch: &PropertyPatch) -> StorageResult<Property>;

    /// Insert-or-update keyed by the identity tuple.
    async fn upsert_property(&self, draft: &PropertyDraft) -> StorageResult<Property>;

    /// Points for the exact location, newest period first.
    async fn get_market_data_by_location(
        &self,
        location: &MarketLocation,
    ) -> StorageResult<Vec<MarketDataPoint>>;

    /// Replaces any point stored under the same period key.
    async fn upsert_market_data(&self, point: &MarketDataPoint) -> StorageResult<MarketDataPoint>;
}

/// Applies an upserted draft over an existing row. Incoming scalar values
/// win; absent optionals and empty collections keep what is stored.
pub fn merge_upsert(existing: &mut Property, draft: &PropertyDraft) {
    if draft.external_id.is_some() {
        existing.external_id = draft.external_id.clone();
    }
    existing.data_source = draft.data_source;
    existing.price = draft.price.clone();
    existing.bedrooms = draft.bedrooms;
    existing.bathrooms = draft.bathrooms.clone();
    existing.square_feet = draft.square_feet.clone();
    existing.lot_size = draft.lot_size.clone();
    if draft.year_built.is_some() {
        existing.year_built = draft.year_built;
    }
    existing.property_type = draft.property_type;
    existing.status = draft.status;
    existing.days_on_market = draft.days_on_market;
    existing.price_per_sqft = draft.price_per_sqft.clone();
    if draft.neighborhood.is_some() {
        existing.neighborhood = draft.neighborhood.clone();
    }
    if draft.description.is_some() {
        existing.description = draft.description.clone();
    }
    if !draft.images.is_empty() {
        existing.images = draft.images.clone();
    }
    if !draft.features.is_empty() {
        existing.features = draft.features.clone();
    }
    if draft.latitude.is_some() {
        existing.latitude = draft.latitude.clone();
    }
    if draft.longitude.is_some() {
        existing.longitude = draft.longitude.clone();
    }
}
