//! ATTOM property API client: snapshot search, detail lookups and monthly
//! sales trends.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use realcomp_core::{
    format_decimal, IdentityKey, MarketDataPoint, MarketLocation, PropertyFilters, PropertyType,
};
use realcomp_storage::{HttpFetcher, HttpRequestSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::normalize::{number_value, text_value};
use crate::{
    ensure_configured, fetch_cached, MarketDataSource, ProviderClient, ProviderError, ProviderId,
    ProviderIdentity, ProviderProperty, ResponseCache,
};

pub const DEFAULT_ATTOM_ENDPOINT: &str = "https://api.gateway.attomdata.com/propertyapi/v1.0.0";
const SNAPSHOT_PATH: &str = "/property/snapshot";
const DETAIL_PATH: &str = "/property/detail";
const SALES_TREND_PATH: &str = "/salestrend/snapshot";
const DEFAULT_PAGE_SIZE: usize = 10;
const NO_RESULTS: &str = "SuccessWithoutResult";

static NULL: JsonValue = JsonValue::Null;

/// One ATTOM `property` element, kept as a JSON document because most of its
/// sections are optional and deeply nested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttomRecord(pub JsonValue);

impl AttomRecord {
    /// Walks `path`; missing segments read as `null`.
    pub fn field(&self, path: &[&str]) -> &JsonValue {
        let mut cur = &self.0;
        for segment in path {
            match cur.get(*segment) {
                Some(next) => cur = next,
                None => return &NULL,
            }
        }
        cur
    }

    pub fn text(&self, path: &[&str]) -> Option<String> {
        text_value(self.field(path))
    }

    pub fn external_id(&self) -> Option<String> {
        self.text(&["identifier", "attomId"])
            .or_else(|| self.text(&["identifier", "Id"]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttomSettings {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub page_size: usize,
}

impl Default for AttomSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ATTOM_ENDPOINT.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl AttomSettings {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            && !self.endpoint.trim().is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AttomStatus {
    code: i64,
    msg: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PropertyEnvelope {
    status: AttomStatus,
    property: Vec<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SalesTrendEnvelope {
    status: AttomStatus,
    #[serde(alias = "salesTrends", alias = "SalesTrends")]
    salestrends: Vec<JsonValue>,
}

pub struct AttomClient {
    http: Arc<HttpFetcher>,
    cache: Arc<ResponseCache>,
    settings: AttomSettings,
}

impl AttomClient {
    pub fn new(http: Arc<HttpFetcher>, cache: Arc<ResponseCache>, settings: AttomSettings) -> Self {
        Self {
            http,
            cache,
            settings,
        }
    }

    fn request(&self, path: &str) -> HttpRequestSpec {
        let url = format!("{}{path}", self.settings.endpoint.trim_end_matches('/'));
        HttpRequestSpec::get(url)
            .header("apikey", self.settings.api_key.as_deref().unwrap_or_default())
            .header("accept", "application/json")
    }

    /// Snapshot search request. ATTOM needs a geography, so a search without
    /// a location is unsupported.
    pub fn search_request(&self, filters: &PropertyFilters) -> Result<HttpRequestSpec, ProviderError> {
        let location = filters.location_term().ok_or(ProviderError::Unsupported {
            provider: ProviderId::Attom,
            operation: "search without a location",
        })?;

        let mut spec = self.request(SNAPSHOT_PATH);
        spec = match zip_prefix(location) {
            Some(zip) => spec.query("postalcode", zip),
            None => spec.query("address2", location),
        };
        if let Some(kind) = filters
            .property_type_filter()
            .and_then(PropertyType::from_canonical)
            .and_then(attom_type_term)
        {
            spec = spec.query("propertytype", kind);
        }
        if let Some(beds) = filters.min_beds {
            spec = spec.query("minBeds", beds.to_string());
        }
        if let Some(baths) = filters.min_baths {
            spec = spec.query("minBathsTotal", format_decimal(baths));
        }
        if let Some(min) = filters.min_sqft {
            spec = spec.query("minUniversalSize", format_decimal(min));
        }
        if let Some(max) = filters.max_sqft {
            spec = spec.query("maxUniversalSize", format_decimal(max));
        }
        if let Some(year) = filters.year_built_min() {
            spec = spec.query("minyearbuilt", year.to_string());
        }
        if let Some(min) = filters.min_price {
            spec = spec.query("minavmvalue", format_decimal(min));
        }
        if let Some(max) = filters.max_price {
            spec = spec.query("maxavmvalue", format_decimal(max));
        }
        let page_size = filters.limit.unwrap_or(self.settings.page_size).max(1);
        Ok(spec.query("pagesize", page_size.to_string()))
    }

    pub fn address_request(&self, key: &IdentityKey) -> HttpRequestSpec {
        let mut line2 = format!("{}, {}", key.city.trim(), key.state.trim());
        if !key.zip_code.trim().is_empty() {
            line2.push(' ');
            line2.push_str(key.zip_code.trim());
        }
        self.request(DETAIL_PATH)
            .query("address1", key.address.trim())
            .query("address2", line2)
    }

    pub fn sales_trend_request(
        &self,
        location: &MarketLocation,
        end_year: i32,
    ) -> Result<HttpRequestSpec, ProviderError> {
        let zip = location
            .zip_code
            .as_deref()
            .and_then(zip_prefix)
            .ok_or(ProviderError::Unsupported {
                provider: ProviderId::Attom,
                operation: "sales trends without a zip code",
            })?;
        Ok(self
            .request(SALES_TREND_PATH)
            .query("geoid", format!("ZI{zip}"))
            .query("interval", "monthly")
            .query("startyear", (end_year - 1).to_string())
            .query("endyear", end_year.to_string()))
    }

    /// Sends a request and decodes the body; an upstream "no results" reply,
    /// even on a non-2xx status, decodes to `T::default()`.
    async fn send<T: Default>(
        &self,
        label: &str,
        cache_query: String,
        spec: &HttpRequestSpec,
        parse: impl FnOnce(&str) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        ensure_configured(ProviderId::Attom, self.is_configured())?;
        let cache_key = ResponseCache::key(ProviderId::Attom.as_str(), label, &cache_query);
        let fetched = fetch_cached(
            &self.http,
            &self.cache,
            ProviderId::Attom,
            cache_key,
            spec,
            parse,
        )
        .await;
        match fetched {
            Err(ProviderError::Http { message, .. }) if message.contains(NO_RESULTS) => {
                debug!(provider = "attom", label, "upstream reported no results");
                Ok(T::default())
            }
            other => other,
        }
    }

    async fn properties(
        &self,
        label: &str,
        cache_query: String,
        spec: &HttpRequestSpec,
    ) -> Result<Vec<AttomRecord>, ProviderError> {
        self.send(label, cache_query, spec, parse_property_response)
            .await
    }
}

impl ProviderIdentity for AttomClient {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Attom
    }

    fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }
}

#[async_trait]
impl ProviderClient for AttomClient {
    async fn search(&self, filters: &PropertyFilters) -> Result<Vec<ProviderProperty>, ProviderError> {
        ensure_configured(ProviderId::Attom, self.is_configured())?;
        let spec = self.search_request(filters)?;
        let records = self.properties("search", filters.cache_key(), &spec).await?;
        info!(provider = "attom", count = records.len(), "provider search complete");
        Ok(records.into_iter().map(ProviderProperty::Attom).collect())
    }

    async fn get_details(&self, external_id: &str) -> Result<Option<ProviderProperty>, ProviderError> {
        let spec = self.request(DETAIL_PATH).query("attomid", external_id.trim());
        let records = self
            .properties("details", external_id.trim().to_string(), &spec)
            .await?;
        Ok(records.into_iter().next().map(ProviderProperty::Attom))
    }

    async fn find_by_address(&self, key: &IdentityKey) -> Result<Option<ProviderProperty>, ProviderError> {
        let spec = self.address_request(key);
        let records = self.properties("address", key.to_string(), &spec).await?;
        Ok(records.into_iter().next().map(ProviderProperty::Attom))
    }
}

#[async_trait]
impl MarketDataSource for AttomClient {
    async fn fetch_market_data(
        &self,
        location: &MarketLocation,
    ) -> Result<Vec<MarketDataPoint>, ProviderError> {
        ensure_configured(ProviderId::Attom, self.is_configured())?;
        let now = Utc::now();
        let spec = self.sales_trend_request(location, now.year())?;
        let cache_query = format!("{}|{}", location.zip_or_empty(), now.year());
        self.send("salestrend", cache_query, &spec, |body| {
            parse_sales_trend_response(body, location, now)
        })
        .await
    }
}

fn check_status(status: &AttomStatus) -> Result<bool, ProviderError> {
    if status.msg.eq_ignore_ascii_case(NO_RESULTS) {
        return Ok(false);
    }
    if status.code != 0 && !status.msg.starts_with("Success") {
        return Err(ProviderError::decode(
            ProviderId::Attom,
            format!("status {}: {}", status.code, status.msg),
        ));
    }
    Ok(true)
}

/// Parses a property snapshot/detail body.
pub fn parse_property_response(body: &str) -> Result<Vec<AttomRecord>, ProviderError> {
    let envelope: PropertyEnvelope =
        serde_json::from_str(body).map_err(|e| ProviderError::decode(ProviderId::Attom, e))?;
    if !check_status(&envelope.status)? {
        return Ok(Vec::new());
    }
    Ok(envelope
        .property
        .into_iter()
        .filter(JsonValue::is_object)
        .map(AttomRecord)
        .collect())
}

/// Parses a monthly sales-trend body into market points for `location`.
pub fn parse_sales_trend_response(
    body: &str,
    location: &MarketLocation,
    fetched_at: chrono::DateTime<Utc>,
) -> Result<Vec<MarketDataPoint>, ProviderError> {
    let envelope: SalesTrendEnvelope =
        serde_json::from_str(body).map_err(|e| ProviderError::decode(ProviderId::Attom, e))?;
    if !check_status(&envelope.status)? {
        return Ok(Vec::new());
    }

    let mut points = Vec::new();
    for trend in &envelope.salestrends {
        let Some((year, month)) = field_ci(trend, &["daterange", "start"])
            .and_then(JsonValue::as_str)
            .and_then(parse_year_month)
        else {
            continue;
        };
        let stats = field_ci(trend, &["salestrend"]).unwrap_or(&NULL);
        let stat = |name: &str| field_ci(stats, &[name]).and_then(number_value);
        let median = stat("medsaleprice").or_else(|| stat("avgsaleprice")).unwrap_or(0.0);
        points.push(MarketDataPoint {
            id: None,
            city: location.city.clone(),
            state: location.state.clone(),
            zip_code: location.zip_or_empty().to_string(),
            year,
            month,
            median_price: format_decimal(median),
            days_on_market: 0,
            active_listings: stat("homesalecount").unwrap_or(0.0) as i32,
            average_price_per_sqft: "0".to_string(),
            sale_to_list_ratio: "0".to_string(),
            inventory_months: "0".to_string(),
            market_type: realcomp_core::classify_market(0.0).to_string(),
            updated_at: fetched_at,
        });
    }
    Ok(points)
}

/// Case-insensitive object path lookup.
fn field_ci<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur
            .as_object()?
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(segment))
            .map(|(_, v)| v)?;
    }
    Some(cur)
}

/// Accepts `2026/05`, `2026-05` and `2026-05-01`.
fn parse_year_month(raw: &str) -> Option<(i32, i32)> {
    let mut parts = raw.trim().split(['/', '-']);
    let year: i32 = parts.next()?.trim().parse().ok()?;
    let month: i32 = parts.next()?.trim().parse().ok()?;
    if (1..=12).contains(&month) {
        Some((year, month))
    } else {
        None
    }
}

fn zip_prefix(text: &str) -> Option<&str> {
    let head = text.trim().get(..5)?;
    let rest = &text.trim()[5..];
    if head.chars().all(|c| c.is_ascii_digit()) && (rest.is_empty() || rest.starts_with('-')) {
        Some(head)
    } else {
        None
    }
}

fn attom_type_term(kind: PropertyType) -> Option<&'static str> {
    match kind {
        PropertyType::SingleFamily => Some("SFR"),
        PropertyType::Condo => Some("CONDOMINIUM"),
        PropertyType::Townhouse => Some("TOWNHOUSE/ROWHOUSE"),
        PropertyType::MultiFamily => Some("DUPLEX"),
        PropertyType::Land => Some("VACANT LAND"),
        PropertyType::Commercial => Some("COMMERCIAL"),
        PropertyType::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use realcomp_storage::HttpClientConfig;

    fn client(api_key: Option<&str>) -> AttomClient {
        AttomClient::new(
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            Arc::new(ResponseCache::default()),
            AttomSettings {
                api_key: api_key.map(ToString::to_string),
                endpoint: "https://attom.example/propertyapi/v1.0.0".into(),
                ..Default::default()
            },
        )
    }

    fn query_value<'a>(spec: &'a HttpRequestSpec, key: &str) -> Option<&'a str> {
        spec.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn search_request_uses_flat_parameters() {
        let filters = PropertyFilters {
            location: Some("78701".into()),
            property_type: Some("Condo".into()),
            min_beds: Some(2),
            min_baths: Some(1.5),
            min_sqft: Some(900.0),
            max_sqft: Some(1800.0),
            year_built: Some("1990".into()),
            limit: Some(25),
            ..Default::default()
        };
        let spec = client(Some("k")).search_request(&filters).unwrap();
        assert_eq!(spec.url, "https://attom.example/propertyapi/v1.0.0/property/snapshot");
        assert!(spec.headers.contains(&("apikey".to_string(), "k".to_string())));
        assert_eq!(query_value(&spec, "postalcode"), Some("78701"));
        assert_eq!(query_value(&spec, "propertytype"), Some("CONDOMINIUM"));
        assert_eq!(query_value(&spec, "minBeds"), Some("2"));
        assert_eq!(query_value(&spec, "minBathsTotal"), Some("1.5"));
        assert_eq!(query_value(&spec, "minUniversalSize"), Some("900"));
        assert_eq!(query_value(&spec, "maxUniversalSize"), Some("1800"));
        assert_eq!(query_value(&spec, "minyearbuilt"), Some("1990"));
        assert_eq!(query_value(&spec, "pagesize"), Some("25"));
        assert_eq!(query_value(&spec, "address2"), None);
    }

    #[test]
    fn city_locations_go_to_address2_and_missing_location_is_unsupported() {
        let filters = PropertyFilters {
            location: Some("Austin, TX".into()),
            ..Default::default()
        };
        let spec = client(Some("k")).search_request(&filters).unwrap();
        assert_eq!(query_value(&spec, "address2"), Some("Austin, TX"));

        let err = client(Some("k"))
            .search_request(&PropertyFilters::default())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
    }

    #[test]
    fn address_lookup_splits_lines() {
        let key = IdentityKey::new("123 Main St", "Austin", "TX", "78701");
        let spec = client(Some("k")).address_request(&key);
        assert_eq!(query_value(&spec, "address1"), Some("123 Main St"));
        assert_eq!(query_value(&spec, "address2"), Some("Austin, TX 78701"));
    }

    #[tokio::test]
    async fn unconfigured_client_fails_without_network() {
        let err = client(Some("  "))
            .get_details("184713191")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotConfigured {
                provider: ProviderId::Attom
            }
        ));
    }

    #[test]
    fn success_without_result_is_zero_results() {
        let body = r#"{"status":{"version":"1.0.0","code":1,"msg":"SuccessWithoutResult","total":0}}"#;
        assert!(parse_property_response(body).unwrap().is_empty());

        let body = r#"{"status":{"code":0,"msg":"SuccessWithResult","total":1},
            "property":[{"identifier":{"attomId":42},"address":{"line1":"1 Elm St"}}]}"#;
        let records = parse_property_response(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id().as_deref(), Some("42"));
        assert_eq!(records[0].field(&["summary", "proptype"]), &JsonValue::Null);

        let body = r#"{"status":{"code":210,"msg":"Invalid Parameter Combination"}}"#;
        assert!(matches!(
            parse_property_response(body),
            Err(ProviderError::Decode { .. })
        ));
    }

    #[test]
    fn sales_trends_become_monthly_points() {
        let location = MarketLocation::new("Austin", "TX", Some("78701".into()));
        let fetched_at = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let body = r#"{
            "status": {"code": 0, "msg": "SuccessWithResult"},
            "salestrends": [
                {"daterange": {"start": "2026/04", "interval": "monthly"},
                 "SalesTrend": {"homeSaleCount": 41, "avgSalePrice": 655000, "medSalePrice": 590000}},
                {"daterange": {"start": "2026-05-01"},
                 "salesTrend": {"homesalecount": "38", "avgsaleprice": "640000"}},
                {"daterange": {"start": "garbage"}}
            ]
        }"#;

        let points = parse_sales_trend_response(body, &location, fetched_at).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!((points[0].year, points[0].month), (2026, 4));
        assert_eq!(points[0].median_price, "590000");
        assert_eq!(points[0].active_listings, 41);
        assert_eq!(points[1].median_price, "640000");
        assert_eq!(points[1].zip_code, "78701");
        assert_eq!(points[1].updated_at, fetched_at);
    }

    #[test]
    fn sales_trends_require_a_zip() {
        let location = MarketLocation::new("Austin", "TX", None);
        assert!(matches!(
            client(Some("k")).sales_trend_request(&location, 2026),
            Err(ProviderError::Unsupported { .. })
        ));
        let location = MarketLocation::new("Austin", "TX", Some("78701".into()));
        let spec = client(Some("k")).sales_trend_request(&location, 2026).unwrap();
        assert_eq!(query_value(&spec, "geoid"), Some("ZI78701"));
        assert_eq!(query_value(&spec, "startyear"), Some("2025"));
    }
}
