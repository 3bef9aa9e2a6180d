//! MLS listings through the Datafiniti v4 property search API.
//!
//! Every call is a POST of `{query, format, num_records}` where `query` is a
//! conjunction of `field:value` terms, with `[min TO max]` ranges for numeric
//! fields.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use realcomp_core::{
    format_decimal, IdentityKey, ListingStatus, MarketDataPoint, MarketLocation, PropertyFilters,
    PropertyType,
};
use realcomp_storage::{HttpFetcher, HttpRequestSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::normalize::{normalize_at, text_value};
use crate::{
    ensure_configured, fetch_cached, quote_term, MarketDataSource, ProviderClient, ProviderError,
    ProviderId, ProviderIdentity, ProviderProperty, ResponseCache,
};

pub const DEFAULT_MLS_ENDPOINT: &str = "https://api.datafiniti.co/v4";
const SEARCH_PATH: &str = "/properties/search";
const DEFAULT_PAGE_SIZE: usize = 10;
const MARKET_SAMPLE_SIZE: usize = 100;

/// One Datafiniti property record. Numeric fields stay loosely typed; the
/// normalizer reads them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MlsRecord {
    pub id: JsonValue,
    pub address: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: JsonValue,
    pub neighborhoods: JsonValue,
    pub most_recent_price_amount: JsonValue,
    pub prices: JsonValue,
    pub num_bedroom: JsonValue,
    pub num_bathroom: JsonValue,
    pub floor_size_value: JsonValue,
    pub lot_size_value: JsonValue,
    pub year_built: JsonValue,
    pub property_type: Option<String>,
    pub most_recent_status: Option<String>,
    pub most_recent_status_first_date_seen: Option<String>,
    pub days_on_market: JsonValue,
    pub price_per_square_foot: JsonValue,
    pub descriptions: JsonValue,
    #[serde(rename = "imageURLs")]
    pub image_urls: JsonValue,
    pub features: JsonValue,
    pub latitude: JsonValue,
    pub longitude: JsonValue,
}

impl MlsRecord {
    pub fn external_id(&self) -> Option<String> {
        text_value(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlsSettings {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub page_size: usize,
}

impl Default for MlsSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_MLS_ENDPOINT.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl MlsSettings {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            && !self.endpoint.trim().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    num_found: Option<u64>,
    #[serde(default)]
    records: Vec<JsonValue>,
    #[serde(default)]
    error: Option<JsonValue>,
}

pub struct MlsClient {
    http: Arc<HttpFetcher>,
    cache: Arc<ResponseCache>,
    settings: MlsSettings,
}

impl MlsClient {
    pub fn new(http: Arc<HttpFetcher>, cache: Arc<ResponseCache>, settings: MlsSettings) -> Self {
        Self {
            http,
            cache,
            settings,
        }
    }

    pub fn search_request(&self, query: &str, num_records: usize) -> HttpRequestSpec {
        let url = format!("{}{SEARCH_PATH}", self.settings.endpoint.trim_end_matches('/'));
        let token = self.settings.api_key.as_deref().unwrap_or_default();
        HttpRequestSpec::post_json(
            url,
            json!({
                "query": query,
                "format": "JSON",
                "num_records": num_records,
                "download": false,
            }),
        )
        .header("Authorization", format!("Bearer {token}"))
    }

    async fn run_query(
        &self,
        label: &str,
        query: String,
        num_records: usize,
    ) -> Result<Vec<MlsRecord>, ProviderError> {
        ensure_configured(ProviderId::Mls, self.is_configured())?;
        let spec = self.search_request(&query, num_records);
        let cache_key = ResponseCache::key(
            ProviderId::Mls.as_str(),
            label,
            &format!("{query}|{num_records}"),
        );
        fetch_cached(
            &self.http,
            &self.cache,
            ProviderId::Mls,
            cache_key,
            &spec,
            parse_search_response,
        )
        .await
    }
}

impl ProviderIdentity for MlsClient {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Mls
    }

    fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }
}

#[async_trait]
impl ProviderClient for MlsClient {
    async fn search(&self, filters: &PropertyFilters) -> Result<Vec<ProviderProperty>, ProviderError> {
        let limit = filters.limit.unwrap_or(self.settings.page_size).max(1);
        let records = self
            .run_query("search", build_search_query(filters), limit)
            .await?;
        info!(provider = "mls", count = records.len(), "provider search complete");
        Ok(records.into_iter().map(ProviderProperty::Mls).collect())
    }

    async fn get_details(&self, external_id: &str) -> Result<Option<ProviderProperty>, ProviderError> {
        let query = format!("id:{}", quote_term(external_id));
        let records = self.run_query("details", query, 1).await?;
        Ok(records.into_iter().next().map(ProviderProperty::Mls))
    }

    async fn find_by_address(&self, key: &IdentityKey) -> Result<Option<ProviderProperty>, ProviderError> {
        let records = self.run_query("address", address_query(key), 1).await?;
        Ok(records.into_iter().next().map(ProviderProperty::Mls))
    }
}

#[async_trait]
impl MarketDataSource for MlsClient {
    /// Summarizes the current for-sale inventory into a snapshot for this
    /// month.
    async fn fetch_market_data(
        &self,
        location: &MarketLocation,
    ) -> Result<Vec<MarketDataPoint>, ProviderError> {
        let records = self
            .run_query("market", market_query(location), MARKET_SAMPLE_SIZE)
            .await?;
        Ok(derive_market_snapshot(location, &records, Utc::now())
            .into_iter()
            .collect())
    }
}

/// Parses a Datafiniti search body. `num_found: 0` means no results;
/// individual records that fail to decode are skipped.
pub fn parse_search_response(body: &str) -> Result<Vec<MlsRecord>, ProviderError> {
    let envelope: SearchEnvelope =
        serde_json::from_str(body).map_err(|e| ProviderError::decode(ProviderId::Mls, e))?;
    if let Some(error) = envelope.error {
        let message = error.as_str().map(ToString::to_string).unwrap_or_else(|| error.to_string());
        return Err(ProviderError::decode(ProviderId::Mls, message));
    }
    if envelope.num_found == Some(0) {
        return Ok(Vec::new());
    }
    let mut records = Vec::with_capacity(envelope.records.len());
    for raw in envelope.records {
        match serde_json::from_value::<MlsRecord>(raw) {
            Ok(record) => records.push(record),
            Err(err) => warn!(provider = "mls", error = %err, "skipping undecodable record"),
        }
    }
    Ok(records)
}

fn mls_type_term(kind: PropertyType) -> Option<&'static str> {
    match kind {
        PropertyType::SingleFamily => Some("Single Family Dwelling"),
        PropertyType::Condo => Some("Condo"),
        PropertyType::Townhouse => Some("Townhouse"),
        PropertyType::MultiFamily => Some("Multi-Family Dwelling"),
        PropertyType::Land => Some("Land"),
        PropertyType::Commercial => Some("Commercial"),
        PropertyType::Unknown => None,
    }
}

fn mls_status_term(status: ListingStatus) -> Option<&'static str> {
    match status {
        ListingStatus::Active => Some("For Sale"),
        ListingStatus::Pending => Some("Pending"),
        ListingStatus::Sold => Some("Sold"),
        ListingStatus::Unknown => None,
    }
}

fn range(min: Option<f64>, max: Option<f64>) -> String {
    let bound = |v: Option<f64>| v.map(format_decimal).unwrap_or_else(|| "*".to_string());
    format!("[{} TO {}]", bound(min), bound(max))
}

fn is_zip(text: &str) -> bool {
    let head: String = text.chars().take(5).collect();
    head.len() == 5
        && head.chars().all(|c| c.is_ascii_digit())
        && (text.len() == 5 || text[5..].starts_with('-'))
}

fn location_clause(location: &str) -> String {
    if is_zip(location) {
        return format!("postalCode:{}", &location[..5]);
    }
    if let Some((city, state)) = location.split_once(',') {
        let (city, state) = (city.trim(), state.trim());
        if !city.is_empty() && !state.is_empty() {
            return format!("city:{} AND province:{}", quote_term(city), quote_term(state));
        }
    }
    if location.len() == 2 && location.chars().all(|c| c.is_ascii_alphabetic()) {
        return format!("province:{}", location.to_ascii_uppercase());
    }
    format!("city:{}", quote_term(location))
}

/// Translates generic filters into a Datafiniti query string.
pub fn build_search_query(filters: &PropertyFilters) -> String {
    let mut terms = vec!["country:US".to_string()];

    if let Some(location) = filters.location_term() {
        terms.push(location_clause(location));
    }
    if let Some(kind) = filters.property_type_filter() {
        let term = PropertyType::from_canonical(kind)
            .and_then(mls_type_term)
            .unwrap_or(kind);
        terms.push(format!("propertyType:{}", quote_term(term)));
    }
    if filters.min_price.is_some() || filters.max_price.is_some() {
        terms.push(format!(
            "mostRecentPriceAmount:{}",
            range(filters.min_price, filters.max_price)
        ));
    }
    if let Some(beds) = filters.min_beds {
        terms.push(format!("numBedroom:{}", range(Some(f64::from(beds)), None)));
    }
    if let Some(baths) = filters.min_baths {
        terms.push(format!("numBathroom:{}", range(Some(baths), None)));
    }
    if filters.min_sqft.is_some() || filters.max_sqft.is_some() {
        terms.push(format!(
            "floorSizeValue:{}",
            range(filters.min_sqft, filters.max_sqft)
        ));
    }
    if let Some(status) = filters.status_filter() {
        let term = ListingStatus::from_canonical(status)
            .and_then(mls_status_term)
            .unwrap_or(status);
        terms.push(format!("mostRecentStatus:{}", quote_term(term)));
    }
    if let Some(year) = filters.year_built_min() {
        terms.push(format!("yearBuilt:{}", range(Some(f64::from(year)), None)));
    }

    terms.join(" AND ")
}

fn address_query(key: &IdentityKey) -> String {
    let mut terms = vec![
        format!("address:{}", quote_term(&key.address)),
        format!("city:{}", quote_term(&key.city)),
        format!("province:{}", quote_term(&key.state)),
    ];
    if !key.zip_code.trim().is_empty() {
        terms.push(format!("postalCode:{}", quote_term(&key.zip_code)));
    }
    terms.join(" AND ")
}

fn market_query(location: &MarketLocation) -> String {
    let mut terms = vec![
        "country:US".to_string(),
        format!("city:{}", quote_term(&location.city)),
        format!("province:{}", quote_term(&location.state)),
    ];
    if let Some(zip) = &location.zip_code {
        terms.push(format!("postalCode:{}", quote_term(zip)));
    }
    terms.push(format!("mostRecentStatus:{}", quote_term("For Sale")));
    terms.join(" AND ")
}

fn market_type_from_days(average_days: f64) -> &'static str {
    if average_days <= 0.0 {
        "Unknown"
    } else if average_days < 30.0 {
        "Seller's Market"
    } else if average_days > 90.0 {
        "Buyer's Market"
    } else {
        "Balanced Market"
    }
}

/// Builds a current-month point from active listings. Returns `None` when no
/// listing carries a usable price.
pub fn derive_market_snapshot(
    location: &MarketLocation,
    records: &[MlsRecord],
    now: DateTime<Utc>,
) -> Option<MarketDataPoint> {
    let drafts: Vec<_> = records
        .iter()
        .cloned()
        .filter_map(|r| normalize_at(&ProviderProperty::Mls(r), now).ok())
        .filter(|d| realcomp_core::decimal_value(&d.price) > 0.0)
        .collect();
    if drafts.is_empty() {
        return None;
    }

    let mut prices: Vec<f64> = drafts
        .iter()
        .map(|d| realcomp_core::decimal_value(&d.price))
        .collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    let mid = prices.len() / 2;
    let median = if prices.len() % 2 == 0 {
        (prices[mid - 1] + prices[mid]) / 2.0
    } else {
        prices[mid]
    };

    let per_sqft: Vec<f64> = drafts
        .iter()
        .map(|d| realcomp_core::decimal_value(&d.price_per_sqft))
        .filter(|v| *v > 0.0)
        .collect();
    let average_per_sqft = if per_sqft.is_empty() {
        0.0
    } else {
        per_sqft.iter().sum::<f64>() / per_sqft.len() as f64
    };
    let average_days =
        drafts.iter().map(|d| f64::from(d.days_on_market)).sum::<f64>() / drafts.len() as f64;

    Some(MarketDataPoint {
        id: None,
        city: location.city.clone(),
        state: location.state.clone(),
        zip_code: location.zip_or_empty().to_string(),
        year: now.year(),
        month: now.month() as i32,
        median_price: format_decimal(median),
        days_on_market: average_days.round() as i32,
        active_listings: drafts.len() as i32,
        average_price_per_sqft: format!("{average_per_sqft:.2}"),
        sale_to_list_ratio: "0".to_string(),
        inventory_months: "0".to_string(),
        market_type: market_type_from_days(average_days).to_string(),
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use realcomp_storage::{HttpClientConfig, HttpMethod};

    fn client(api_key: Option<&str>) -> MlsClient {
        MlsClient::new(
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            Arc::new(ResponseCache::default()),
            MlsSettings {
                api_key: api_key.map(ToString::to_string),
                endpoint: "https://mls.example/v4/".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn search_query_is_a_conjunction_with_ranges() {
        let filters = PropertyFilters {
            location: Some("Austin, TX".into()),
            property_type: Some("Single Family".into()),
            min_price: Some(300_000.0),
            min_beds: Some(3),
            max_sqft: Some(2500.0),
            status: Some("Active".into()),
            year_built: Some("2000".into()),
            ..Default::default()
        };
        assert_eq!(
            build_search_query(&filters),
            "country:US AND city:\"Austin\" AND province:\"TX\" \
             AND propertyType:\"Single Family Dwelling\" \
             AND mostRecentPriceAmount:[300000 TO *] AND numBedroom:[3 TO *] \
             AND floorSizeValue:[* TO 2500] AND mostRecentStatus:\"For Sale\" \
             AND yearBuilt:[2000 TO *]"
        );
    }

    #[test]
    fn sentinels_and_zip_locations() {
        let filters = PropertyFilters {
            location: Some("78701".into()),
            property_type: Some("any_type".into()),
            status: Some("any_status".into()),
            year_built: Some("any_year".into()),
            ..Default::default()
        };
        assert_eq!(build_search_query(&filters), "country:US AND postalCode:78701");
        assert_eq!(build_search_query(&PropertyFilters::default()), "country:US");
    }

    #[test]
    fn request_carries_bearer_token_and_json_body() {
        let spec = client(Some("secret")).search_request("country:US", 5);
        assert_eq!(spec.method, HttpMethod::Post);
        assert_eq!(spec.url, "https://mls.example/v4/properties/search");
        assert!(spec
            .headers
            .contains(&("Authorization".to_string(), "Bearer secret".to_string())));
        let body = spec.json_body.unwrap();
        assert_eq!(body["query"], "country:US");
        assert_eq!(body["num_records"], 5);
        assert_eq!(body["format"], "JSON");
    }

    #[tokio::test]
    async fn unconfigured_client_fails_without_network() {
        let err = client(None)
            .search(&PropertyFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotConfigured {
                provider: ProviderId::Mls
            }
        ));
    }

    #[test]
    fn empty_and_partial_bodies() {
        assert!(parse_search_response(r#"{"num_found":0,"records":[]}"#)
            .unwrap()
            .is_empty());
        let records = parse_search_response(
            r#"{"num_found":2,"records":[{"id":"a","address":"1 Elm St"},{"id":"b","address":7}]}"#,
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id().as_deref(), Some("a"));
        assert!(matches!(
            parse_search_response("<html>"),
            Err(ProviderError::Decode { .. })
        ));
        assert!(matches!(
            parse_search_response(r#"{"error":"Invalid query"}"#),
            Err(ProviderError::Decode { ref message, .. }) if message == "Invalid query"
        ));
    }

    #[test]
    fn market_snapshot_summarizes_active_inventory() {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 0, 0, 0).unwrap();
        let record = |id: &str, price: u32, sqft: u32, days: u32| MlsRecord {
            id: json!(id),
            address: Some(format!("{id} Main St")),
            city: Some("Austin".into()),
            province: Some("TX".into()),
            most_recent_price_amount: json!(price),
            floor_size_value: json!(sqft),
            days_on_market: json!(days),
            ..Default::default()
        };
        let records = vec![
            record("1", 400_000, 2000, 10),
            record("2", 500_000, 2000, 20),
            record("3", 600_000, 2000, 30),
            MlsRecord::default(),
        ];
        let location = MarketLocation::new("Austin", "TX", None);

        let point = derive_market_snapshot(&location, &records, now).unwrap();
        assert_eq!((point.year, point.month), (2026, 5));
        assert_eq!(point.median_price, "500000");
        assert_eq!(point.active_listings, 3);
        assert_eq!(point.average_price_per_sqft, "250.00");
        assert_eq!(point.days_on_market, 20);
        assert_eq!(point.market_type, "Seller's Market");
        assert_eq!(point.zip_code, "");
        assert!(derive_market_snapshot(&location, &[], now).is_none());
    }
}
