//! Per-location monthly market series with a freshness short-circuit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use realcomp_core::{MarketDataPoint, MarketLocation};
use realcomp_providers::MarketDataSource;
use realcomp_storage::{PropertyStore, StorageResult};
use tracing::{debug, info, warn};

pub const MARKET_STALENESS_DAYS: i64 = 30;
/// A full year of monthly points.
pub const MARKET_POINT_CEILING: usize = 12;

/// Local points are fresh when one was updated inside the staleness window
/// or the series already holds a year of months.
pub fn is_fresh(points: &[MarketDataPoint], now: DateTime<Utc>) -> bool {
    points.len() >= MARKET_POINT_CEILING
        || points
            .iter()
            .any(|p| now - p.updated_at < Duration::days(MARKET_STALENESS_DAYS))
}

pub struct MarketDataCache {
    store: Arc<dyn PropertyStore>,
    sources: Vec<Arc<dyn MarketDataSource>>,
}

impl MarketDataCache {
    pub fn new(store: Arc<dyn PropertyStore>, sources: Vec<Arc<dyn MarketDataSource>>) -> Self {
        Self { store, sources }
    }

    pub async fn get_market_data(
        &self,
        location: &MarketLocation,
    ) -> StorageResult<Vec<MarketDataPoint>> {
        let local = self.store.get_market_data_by_location(location).await?;
        if is_fresh(&local, Utc::now()) {
            debug!(city = %location.city, state = %location.state, points = local.len(), "market data is fresh");
            return Ok(local);
        }

        for source in &self.sources {
            if !source.is_configured() {
                continue;
            }
            let provider = source.provider_id();
            let points = match source.fetch_market_data(location).await {
                Ok(points) if !points.is_empty() => points,
                Ok(_) => {
                    debug!(%provider, "market source returned no points");
                    continue;
                }
                Err(err) => {
                    warn!(%provider, error = %err, "market data refresh failed");
                    continue;
                }
            };

            let mut written = 0usize;
            for mut point in points {
                point.id = None;
                point.city = location.city.clone();
                point.state = location.state.clone();
                point.zip_code = location.zip_or_empty().to_string();
                match self.store.upsert_market_data(&point).await {
                    Ok(_) => written += 1,
                    Err(err) => warn!(%provider, year = point.year, month = point.month, error = %err, "failed to store market point"),
                }
            }
            if written > 0 {
                info!(%provider, written, city = %location.city, "market data refreshed");
                return self.store.get_market_data_by_location(location).await;
            }
        }

        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(month: i32, age_days: i64, now: DateTime<Utc>) -> MarketDataPoint {
        MarketDataPoint {
            id: None,
            city: "Austin".into(),
            state: "TX".into(),
            zip_code: String::new(),
            year: 2025,
            month,
            median_price: "500000".into(),
            days_on_market: 30,
            active_listings: 10,
            average_price_per_sqft: "250".into(),
            sale_to_list_ratio: "0.98".into(),
            inventory_months: "3".into(),
            market_type: "Seller's Market".into(),
            updated_at: now - Duration::days(age_days),
        }
    }

    #[test]
    fn freshness_by_age_or_count() {
        let now = Utc::now();
        assert!(!is_fresh(&[], now));
        assert!(is_fresh(&[point(1, 3, now)], now));
        assert!(!is_fresh(&[point(1, 45, now), point(2, 31, now)], now));

        let year: Vec<_> = (1..=12).map(|m| point(m, 400, now)).collect();
        assert!(is_fresh(&year, now));
    }
}
