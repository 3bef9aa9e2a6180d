//! Core domain model for listing reconciliation: canonical properties, market
//! snapshots and the generic search filter.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "realcomp-core";

/// Sentinels the UI sends when a select box is left on "any".
const ANY_SENTINELS: &[&str] = &["", "any", "all", "any_year", "any_type", "any_status"];

/// Address tuple used to deduplicate properties across sources. Comparison is
/// case-sensitive and exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKey {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

impl IdentityKey {
    pub fn new(
        address: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        zip_code: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            city: city.into(),
            state: state.into(),
            zip_code: zip_code.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {} {}", self.address, self.city, self.state, self.zip_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PropertyType {
    #[serde(rename = "Single Family")]
    SingleFamily,
    Condo,
    Townhouse,
    #[serde(rename = "Multi-Family")]
    MultiFamily,
    Land,
    Commercial,
    #[default]
    Unknown,
}

impl PropertyType {
    pub const ALL: [PropertyType; 7] = [
        PropertyType::SingleFamily,
        PropertyType::Condo,
        PropertyType::Townhouse,
        PropertyType::MultiFamily,
        PropertyType::Land,
        PropertyType::Commercial,
        PropertyType::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::SingleFamily => "Single Family",
            PropertyType::Condo => "Condo",
            PropertyType::Townhouse => "Townhouse",
            PropertyType::MultiFamily => "Multi-Family",
            PropertyType::Land => "Land",
            PropertyType::Commercial => "Commercial",
            PropertyType::Unknown => "Unknown",
        }
    }

    /// Parses the canonical display name, ignoring case. Provider vocabularies
    /// are mapped elsewhere.
    pub fn from_canonical(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ListingStatus {
    Active,
    Pending,
    Sold,
    #[default]
    Unknown,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingStatus::Active => "Active",
            ListingStatus::Pending => "Pending",
            ListingStatus::Sold => "Sold",
            ListingStatus::Unknown => "Unknown",
        }
    }

    pub fn from_canonical(value: &str) -> Option<Self> {
        [
            ListingStatus::Active,
            ListingStatus::Pending,
            ListingStatus::Sold,
            ListingStatus::Unknown,
        ]
        .into_iter()
        .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a canonical record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    Local,
    Mls,
    Attom,
}

impl DataSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Local => "local",
            DataSource::Mls => "mls",
            DataSource::Attom => "attom",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "mls" => DataSource::Mls,
            "attom" => DataSource::Attom,
            _ => DataSource::Local,
        }
    }
}

/// Normalized handoff contract from providers into the engine and the store.
/// Carries every canonical attribute except store-assigned identity and
/// timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDraft {
    pub external_id: Option<String>,
    pub data_source: DataSource,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub neighborhood: Option<String>,
    pub price: String,
    pub bedrooms: i32,
    pub bathrooms: String,
    pub square_feet: String,
    pub lot_size: String,
    pub year_built: Option<i32>,
    pub property_type: PropertyType,
    pub status: ListingStatus,
    pub days_on_market: i32,
    pub price_per_sqft: String,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub features: Vec<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

impl PropertyDraft {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.address, &self.city, &self.state, &self.zip_code)
    }

    /// Materializes an unpersisted canonical property (no store id).
    pub fn into_unsaved(self, now: DateTime<Utc>) -> Property {
        Property {
            id: None,
            external_id: self.external_id,
            data_source: self.data_source,
            address: self.address,
            city: self.city,
            state: self.state,
            zip_code: self.zip_code,
            neighborhood: self.neighborhood,
            price: self.price,
            bedrooms: self.bedrooms,
            bathrooms: self.bathrooms,
            square_feet: self.square_feet,
            lot_size: self.lot_size,
            year_built: self.year_built,
            property_type: self.property_type,
            status: self.status,
            days_on_market: self.days_on_market,
            price_per_sqft: self.price_per_sqft,
            description: self.description,
            images: self.images,
            features: self.features,
            latitude: self.latitude,
            longitude: self.longitude,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Canonical property as stored locally or returned from a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: Option<i64>,
    pub external_id: Option<String>,
    pub data_source: DataSource,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub neighborhood: Option<String>,
    pub price: String,
    pub bedrooms: i32,
    pub bathrooms: String,
    pub square_feet: String,
    pub lot_size: String,
    pub year_built: Option<i32>,
    pub property_type: PropertyType,
    pub status: ListingStatus,
    pub days_on_market: i32,
    pub price_per_sqft: String,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub features: Vec<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Property {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.address, &self.city, &self.state, &self.zip_code)
    }

    /// A row is complete once it has a description and at least one image.
    pub fn has_complete_data(&self) -> bool {
        let has_description = self
            .description
            .as_deref()
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false);
        has_description && !self.images.is_empty()
    }

    pub fn to_draft(&self) -> PropertyDraft {
        PropertyDraft {
            external_id: self.external_id.clone(),
            data_source: self.data_source,
            address: self.address.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            zip_code: self.zip_code.clone(),
            neighborhood: self.neighborhood.clone(),
            price: self.price.clone(),
            bedrooms: self.bedrooms,
            bathrooms: self.bathrooms.clone(),
            square_feet: self.square_feet.clone(),
            lot_size: self.lot_size.clone(),
            year_built: self.year_built,
            property_type: self.property_type,
            status: self.status,
            days_on_market: self.days_on_market,
            price_per_sqft: self.price_per_sqft.clone(),
            description: self.description.clone(),
            images: self.images.clone(),
            features: self.features.clone(),
            latitude: self.latitude.clone(),
            longitude: self.longitude.clone(),
        }
    }
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PropertyPatch {
    pub external_id: Option<String>,
    pub neighborhood: Option<String>,
    pub price: Option<String>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<String>,
    pub square_feet: Option<String>,
    pub lot_size: Option<String>,
    pub year_built: Option<i32>,
    pub property_type: Option<PropertyType>,
    pub status: Option<ListingStatus>,
    pub days_on_market: Option<i32>,
    pub price_per_sqft: Option<String>,
    pub description: Option<String>,
    pub images: Option<Vec<String>>,
    pub features: Option<Vec<String>>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

impl PropertyPatch {
    pub fn apply_to(&self, property: &mut Property) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set_opt(&mut property.external_id, &self.external_id);
        set_opt(&mut property.neighborhood, &self.neighborhood);
        set(&mut property.price, &self.price);
        set(&mut property.bedrooms, &self.bedrooms);
        set(&mut property.bathrooms, &self.bathrooms);
        set(&mut property.square_feet, &self.square_feet);
        set(&mut property.lot_size, &self.lot_size);
        set_opt(&mut property.year_built, &self.year_built);
        set(&mut property.property_type, &self.property_type);
        set(&mut property.status, &self.status);
        set(&mut property.days_on_market, &self.days_on_market);
        set(&mut property.price_per_sqft, &self.price_per_sqft);
        set_opt(&mut property.description, &self.description);
        set(&mut property.images, &self.images);
        set(&mut property.features, &self.features);
        set_opt(&mut property.latitude, &self.latitude);
        set_opt(&mut property.longitude, &self.longitude);
    }
}

/// How a detail request names its property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyRef {
    Local(i64),
    External(String),
}

impl PropertyRef {
    /// All-digit ids address local rows first; anything else is a provider
    /// id. A numeric id with no local row is retried as a provider id.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.chars().all(|c| c.is_ascii_digit()) {
            return raw.parse().ok().map(PropertyRef::Local);
        }
        Some(PropertyRef::External(raw.to_string()))
    }
}

/// Location a market time series belongs to. An absent zip code is stored as
/// the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketLocation {
    pub city: String,
    pub state: String,
    pub zip_code: Option<String>,
}

impl MarketLocation {
    pub fn new(city: impl Into<String>, state: impl Into<String>, zip_code: Option<String>) -> Self {
        Self {
            city: city.into(),
            state: state.into(),
            zip_code: zip_code.filter(|z| !z.trim().is_empty()),
        }
    }

    pub fn zip_or_empty(&self) -> &str {
        self.zip_code.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarketPeriodKey {
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub year: i32,
    pub month: i32,
}

/// One monthly market snapshot for a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataPoint {
    pub id: Option<i64>,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub year: i32,
    pub month: i32,
    pub median_price: String,
    pub days_on_market: i32,
    pub active_listings: i32,
    pub average_price_per_sqft: String,
    pub sale_to_list_ratio: String,
    pub inventory_months: String,
    pub market_type: String,
    pub updated_at: DateTime<Utc>,
}

impl MarketDataPoint {
    pub fn period_key(&self) -> MarketPeriodKey {
        MarketPeriodKey {
            city: self.city.clone(),
            state: self.state.clone(),
            zip_code: self.zip_code.clone(),
            year: self.year,
            month: self.month,
        }
    }

    pub fn belongs_to(&self, location: &MarketLocation) -> bool {
        self.city == location.city
            && self.state == location.state
            && self.zip_code == location.zip_or_empty()
    }
}

/// Classifies a market by months of inventory.
pub fn classify_market(inventory_months: f64) -> &'static str {
    if inventory_months <= 0.0 {
        "Unknown"
    } else if inventory_months < 4.0 {
        "Seller's Market"
    } else if inventory_months > 6.0 {
        "Buyer's Market"
    } else {
        "Balanced Market"
    }
}

/// Parses a stored decimal string. Stored values are already normalized, so
/// anything unparseable counts as zero.
pub fn decimal_value(value: &str) -> f64 {
    value.trim().parse::<f64>().unwrap_or(0.0)
}

/// Renders a number as a plain decimal string without a trailing `.0`.
pub fn format_decimal(value: f64) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    if value.fract() == 0.0 {
        return format!("{value:.0}");
    }
    let rendered = format!("{value:.6}");
    rendered.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Generic property search filter shared by the store, the providers and the
/// route layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PropertyFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_beds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_baths: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_sqft: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sqft: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_built: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn non_sentinel(value: Option<&str>) -> Option<&str> {
    let value = value?.trim();
    if ANY_SENTINELS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(value))
    {
        None
    } else {
        Some(value)
    }
}

impl PropertyFilters {
    /// Builds filters from raw query parameters. Unparseable numbers are
    /// dropped rather than rejected.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let text = |key: &str| {
            params
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let float = |key: &str| text(key).and_then(|v| v.parse::<f64>().ok());
        let int = |key: &str| {
            text(key).and_then(|v| v.parse::<f64>().ok().map(|f| f.floor() as i32))
        };

        Self {
            location: text("location"),
            property_type: text("propertyType"),
            min_price: float("minPrice"),
            max_price: float("maxPrice"),
            min_beds: int("minBeds"),
            min_baths: float("minBaths"),
            min_sqft: float("minSqft"),
            max_sqft: float("maxSqft"),
            status: text("status"),
            year_built: text("yearBuilt"),
            limit: text("limit").and_then(|v| v.parse().ok()),
        }
    }

    pub fn location_term(&self) -> Option<&str> {
        self.location
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
    }

    pub fn property_type_filter(&self) -> Option<&str> {
        non_sentinel(self.property_type.as_deref())
    }

    pub fn status_filter(&self) -> Option<&str> {
        non_sentinel(self.status.as_deref())
    }

    /// Minimum construction year, or `None` for sentinels such as `any_year`.
    pub fn year_built_min(&self) -> Option<i32> {
        let raw = non_sentinel(self.year_built.as_deref())?;
        let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.len() != 4 {
            return None;
        }
        digits.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.location_term().is_none()
            && self.property_type_filter().is_none()
            && self.min_price.is_none()
            && self.max_price.is_none()
            && self.min_beds.is_none()
            && self.min_baths.is_none()
            && self.min_sqft.is_none()
            && self.max_sqft.is_none()
            && self.status_filter().is_none()
            && self.year_built_min().is_none()
    }

    /// Stable serialized form used for cache keys.
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// In-process evaluation of the same predicate the SQL store applies.
    pub fn matches(&self, property: &Property) -> bool {
        if let Some(term) = self.location_term() {
            let term = term.to_lowercase();
            let hit = [
                Some(property.city.as_str()),
                Some(property.state.as_str()),
                Some(property.zip_code.as_str()),
                property.neighborhood.as_deref(),
            ]
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&term));
            if !hit {
                return false;
            }
        }
        if let Some(kind) = self.property_type_filter() {
            if !property.property_type.as_str().eq_ignore_ascii_case(kind) {
                return false;
            }
        }
        if let Some(status) = self.status_filter() {
            if !property.status.as_str().eq_ignore_ascii_case(status) {
                return false;
            }
        }
        let price = decimal_value(&property.price);
        if self.min_price.is_some_and(|min| price < min) {
            return false;
        }
        if self.max_price.is_some_and(|max| price > max) {
            return false;
        }
        if self.min_beds.is_some_and(|min| property.bedrooms < min) {
            return false;
        }
        if self
            .min_baths
            .is_some_and(|min| decimal_value(&property.bathrooms) < min)
        {
            return false;
        }
        let sqft = decimal_value(&property.square_feet);
        if self.min_sqft.is_some_and(|min| sqft < min) {
            return false;
        }
        if self.max_sqft.is_some_and(|max| sqft > max) {
            return false;
        }
        if let Some(min_year) = self.year_built_min() {
            match property.year_built {
                Some(year) if year >= min_year => {}
                _ => return false,
            }
        }
        true
    }
}
