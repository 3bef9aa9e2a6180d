//! In-memory [`PropertyStore`] used by tests and by `serve` when no database
//! is configured. Filtering goes through [`PropertyFilters::matches`], which
//! mirrors the SQL predicate.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use realcomp_core::{
    IdentityKey, MarketDataPoint, MarketLocation, MarketPeriodKey, Property, PropertyDraft,
    PropertyFilters, PropertyPatch,
};

use crate::{merge_upsert, PropertyStore, StorageError, StorageResult};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    properties: BTreeMap<i64, Property>,
    market: BTreeMap<MarketPeriodKey, MarketDataPoint>,
    next_market_id: i64,
}

impl MemoryState {
    fn id_for_identity(&self, key: &IdentityKey) -> Option<i64> {
        self.properties
            .iter()
            .find(|(_, p)| &p.identity_key() == key)
            .map(|(id, _)| *id)
    }

    fn insert(&mut self, draft: &PropertyDraft) -> Property {
        self.next_id += 1;
        let id = self.next_id;
        let mut property = draft.clone().into_unsaved(Utc::now());
        property.id = Some(id);
        self.properties.insert(id, property.clone());
        property
    }
}

pub struct InMemoryPropertyStore {
    state: RwLock<MemoryState>,
}

impl InMemoryPropertyStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn property_count(&self) -> usize {
        self.state
            .read()
            .map(|s| s.properties.len())
            .unwrap_or_default()
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))
    }
}

impl Default for InMemoryPropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PropertyStore for InMemoryPropertyStore {
    async fn get_all_properties(&self) -> StorageResult<Vec<Property>> {
        Ok(self.read()?.properties.values().cloned().collect())
    }

    async fn get_property(&self, id: i64) -> StorageResult<Option<Property>> {
        Ok(self.read()?.properties.get(&id).cloned())
    }

    async fn get_property_by_external_id(
        &self,
        external_id: &str,
    ) -> StorageResult<Option<Property>> {
        Ok(self
            .read()?
            .properties
            .values()
            .find(|p| p.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_by_identity(&self, key: &IdentityKey) -> StorageResult<Option<Property>> {
        let state = self.read()?;
        Ok(state
            .id_for_identity(key)
            .and_then(|id| state.properties.get(&id).cloned()))
    }

    async fn get_properties_by_filters(
        &self,
        filters: &PropertyFilters,
    ) -> StorageResult<Vec<Property>> {
        let state = self.read()?;
        let matched = state
            .properties
            .values()
            .filter(|p| filters.matches(p))
            .cloned();
        Ok(match filters.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        })
    }

    async fn create_property(&self, draft: &PropertyDraft) -> StorageResult<Property> {
        let mut state = self.write()?;
        let key = draft.identity_key();
        if state.id_for_identity(&key).is_some() {
            return Err(StorageError::Conflict(key));
        }
        Ok(state.insert(draft))
    }

    async fn update_property(&self, id: i64, patch: &PropertyPatch) -> StorageResult<Property> {
        let mut state = self.write()?;
        let property = state
            .properties
            .get_mut(&id)
            .ok_or(StorageError::NotFound(id))?;
        patch.apply_to(property);
        property.updated_at = Utc::now();
        Ok(property.clone())
    }

    async fn upsert_property(&self, draft: &PropertyDraft) -> StorageResult<Property> {
        let mut state = self.write()?;
        match state.id_for_identity(&draft.identity_key()) {
            Some(id) => {
                let property = state
                    .properties
                    .get_mut(&id)
                    .ok_or(StorageError::NotFound(id))?;
                merge_upsert(property, draft);
                property.updated_at = Utc::now();
                Ok(property.clone())
            }
            None => Ok(state.insert(draft)),
        }
    }

    async fn get_market_data_by_location(
        &self,
        location: &MarketLocation,
    ) -> StorageResult<Vec<MarketDataPoint>> {
        let state = self.read()?;
        let mut points: Vec<_> = state
            .market
            .values()
            .filter(|p| p.belongs_to(location))
            .cloned()
            .collect();
        points.sort_by(|a, b| (b.year, b.month).cmp(&(a.year, a.month)));
        Ok(points)
    }

    async fn upsert_market_data(&self, point: &MarketDataPoint) -> StorageResult<MarketDataPoint> {
        let mut state = self.write()?;
        let key = point.period_key();
        let existing_id = state.market.get(&key).and_then(|p| p.id);
        let id = match existing_id {
            Some(id) => id,
            None => {
                state.next_market_id += 1;
                state.next_market_id
            }
        };
        let mut stored = point.clone();
        stored.id = Some(id);
        state.market.insert(key, stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use realcomp_core::ListingStatus;

    fn draft(address: &str, price: &str, status: ListingStatus) -> PropertyDraft {
        PropertyDraft {
            address: address.into(),
            city: "Austin".into(),
            state: "TX".into(),
            zip_code: "78701".into(),
            price: price.into(),
            status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upserting_the_same_address_twice_keeps_one_row_with_latest_values() {
        let store = InMemoryPropertyStore::new();
        let first = store
            .upsert_property(&draft("123 Main St", "400000", ListingStatus::Active))
            .await
            .unwrap();
        let second = store
            .upsert_property(&draft("123 Main St", "390000", ListingStatus::Pending))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.property_count(), 1);
        let stored = store.get_property(first.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.price, "390000");
        assert_eq!(stored.status, ListingStatus::Pending);
    }

    #[tokio::test]
    async fn create_rejects_a_known_address() {
        let store = InMemoryPropertyStore::new();
        store
            .create_property(&draft("1 Elm St", "1", ListingStatus::Active))
            .await
            .unwrap();
        let err = store
            .create_property(&draft("1 Elm St", "2", ListingStatus::Active))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn upsert_does_not_erase_stored_images() {
        let store = InMemoryPropertyStore::new();
        let mut with_images = draft("9 Oak Ave", "100", ListingStatus::Active);
        with_images.images = vec!["https://img.example/a.jpg".into()];
        store.upsert_property(&with_images).await.unwrap();

        let bare = draft("9 Oak Ave", "110", ListingStatus::Active);
        let merged = store.upsert_property(&bare).await.unwrap();
        assert_eq!(merged.images, vec!["https://img.example/a.jpg".to_string()]);
        assert_eq!(merged.price, "110");
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let store = InMemoryPropertyStore::new();
        let err = store
            .update_property(77, &PropertyPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(77)));
    }

    #[tokio::test]
    async fn market_points_are_replaced_per_period_and_sorted_newest_first() {
        let store = InMemoryPropertyStore::new();
        let location = MarketLocation::new("Austin", "TX", None);
        let base = MarketDataPoint {
            id: None,
            city: "Austin".into(),
            state: "TX".into(),
            zip_code: String::new(),
            year: 2026,
            month: 1,
            median_price: "500000".into(),
            days_on_market: 30,
            active_listings: 100,
            average_price_per_sqft: "250".into(),
            sale_to_list_ratio: "0.98".into(),
            inventory_months: "3".into(),
            market_type: "Seller's Market".into(),
            updated_at: Utc::now() - Duration::days(40),
        };
        store.upsert_market_data(&base).await.unwrap();
        let mut replacement = base.clone();
        replacement.median_price = "510000".into();
        store.upsert_market_data(&replacement).await.unwrap();
        let mut february = base.clone();
        february.month = 2;
        store.upsert_market_data(&february).await.unwrap();

        let points = store.get_market_data_by_location(&location).await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].month, 2);
        assert_eq!(points[1].median_price, "510000");
    }
}
