//! Provider record to canonical draft conversion.
//!
//! Upstream payloads are loosely typed: numbers arrive as strings with units,
//! lists arrive as arrays, stringified JSON or multiply escaped text. Every
//! helper here degrades to a zero or an empty list instead of failing; the
//! only rejected record is one without an address, city or state.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use realcomp_core::{format_decimal, DataSource, ListingStatus, PropertyDraft, PropertyType};
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{AttomRecord, MlsRecord, ProviderId, ProviderProperty};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{provider} record is missing {field}")]
    MissingField {
        provider: ProviderId,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Urls,
    Words,
}

const MLS_PROPERTY_TYPES: &[(&str, PropertyType)] = &[
    ("single family dwelling", PropertyType::SingleFamily),
    ("single family residence", PropertyType::SingleFamily),
    ("single family", PropertyType::SingleFamily),
    ("house", PropertyType::SingleFamily),
    ("residential", PropertyType::SingleFamily),
    ("condo", PropertyType::Condo),
    ("condominium", PropertyType::Condo),
    ("townhouse", PropertyType::Townhouse),
    ("townhome", PropertyType::Townhouse),
    ("town house", PropertyType::Townhouse),
    ("multi-family dwelling", PropertyType::MultiFamily),
    ("multi-family", PropertyType::MultiFamily),
    ("multi family", PropertyType::MultiFamily),
    ("duplex", PropertyType::MultiFamily),
    ("apartment building", PropertyType::MultiFamily),
    ("land", PropertyType::Land),
    ("lot", PropertyType::Land),
    ("vacant land", PropertyType::Land),
    ("farm", PropertyType::Land),
    ("commercial", PropertyType::Commercial),
    ("office", PropertyType::Commercial),
    ("retail", PropertyType::Commercial),
    ("industrial", PropertyType::Commercial),
];

const ATTOM_PROPERTY_TYPES: &[(&str, PropertyType)] = &[
    ("sfr", PropertyType::SingleFamily),
    ("single family residence", PropertyType::SingleFamily),
    ("single family residence / townhouse", PropertyType::SingleFamily),
    ("condominium", PropertyType::Condo),
    ("condo", PropertyType::Condo),
    ("townhouse/rowhouse", PropertyType::Townhouse),
    ("townhouse", PropertyType::Townhouse),
    ("duplex", PropertyType::MultiFamily),
    ("triplex", PropertyType::MultiFamily),
    ("quadruplex", PropertyType::MultiFamily),
    ("apartment", PropertyType::MultiFamily),
    ("multi family dwelling", PropertyType::MultiFamily),
    ("vacant land", PropertyType::Land),
    ("residential acreage", PropertyType::Land),
    ("agricultural", PropertyType::Land),
    ("commercial", PropertyType::Commercial),
    ("office building", PropertyType::Commercial),
    ("retail", PropertyType::Commercial),
];

const MLS_STATUSES: &[(&str, ListingStatus)] = &[
    ("for sale", ListingStatus::Active),
    ("active", ListingStatus::Active),
    ("new listing", ListingStatus::Active),
    ("coming soon", ListingStatus::Active),
    ("price change", ListingStatus::Active),
    ("pending", ListingStatus::Pending),
    ("under contract", ListingStatus::Pending),
    ("contingent", ListingStatus::Pending),
    ("sold", ListingStatus::Sold),
    ("closed", ListingStatus::Sold),
];

pub fn normalize(record: &ProviderProperty) -> Result<PropertyDraft, NormalizeError> {
    normalize_at(record, Utc::now())
}

/// Same as [`normalize`] with an explicit clock for days-on-market.
pub fn normalize_at(
    record: &ProviderProperty,
    now: DateTime<Utc>,
) -> Result<PropertyDraft, NormalizeError> {
    match record {
        ProviderProperty::Mls(record) => from_mls(record, now),
        ProviderProperty::Attom(record) => from_attom(record),
    }
}

fn from_mls(record: &MlsRecord, now: DateTime<Utc>) -> Result<PropertyDraft, NormalizeError> {
    let provider = ProviderId::Mls;
    let address = required(provider, "address", record.address.as_deref())?;
    let city = required(provider, "city", record.city.as_deref())?;
    let state = required(provider, "state", record.province.as_deref())?;

    let price = mls_price(record);
    let square_feet = number_value(&record.floor_size_value).unwrap_or(0.0);

    Ok(PropertyDraft {
        external_id: record.external_id(),
        data_source: DataSource::Mls,
        address,
        city,
        state,
        zip_code: text_value(&record.postal_code).unwrap_or_default(),
        neighborhood: first_text(&record.neighborhoods),
        price: format_decimal(price),
        bedrooms: int_value(&record.num_bedroom),
        bathrooms: decimal_text(&record.num_bathroom),
        square_feet: format_decimal(square_feet),
        lot_size: decimal_text(&record.lot_size_value),
        year_built: year_value(&record.year_built),
        property_type: lookup(
            MLS_PROPERTY_TYPES,
            record.property_type.as_deref(),
            PropertyType::from_canonical,
        ),
        status: lookup(
            MLS_STATUSES,
            record.most_recent_status.as_deref(),
            ListingStatus::from_canonical,
        ),
        days_on_market: mls_days_on_market(record, now),
        price_per_sqft: price_per_sqft(
            number_value(&record.price_per_square_foot),
            price,
            square_feet,
        ),
        description: first_text(&record.descriptions),
        images: normalize_string_list(&record.image_urls, ListKind::Urls),
        features: normalize_string_list(&record.features, ListKind::Words),
        latitude: number_value(&record.latitude).map(format_decimal),
        longitude: number_value(&record.longitude).map(format_decimal),
    })
}

fn mls_price(record: &MlsRecord) -> f64 {
    if let Some(price) = number_value(&record.most_recent_price_amount) {
        return price;
    }
    let Some(prices) = record.prices.as_array() else {
        return 0.0;
    };
    prices
        .iter()
        .find_map(|entry| {
            ["amountMax", "amountMin", "amount"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(number_value))
        })
        .unwrap_or(0.0)
}

fn mls_days_on_market(record: &MlsRecord, now: DateTime<Utc>) -> i32 {
    if let Some(days) = number_value(&record.days_on_market) {
        return days.max(0.0).floor() as i32;
    }
    record
        .most_recent_status_first_date_seen
        .as_deref()
        .and_then(parse_timestamp)
        .map(|seen| (now - seen).num_days().max(0) as i32)
        .unwrap_or(0)
}

fn from_attom(record: &AttomRecord) -> Result<PropertyDraft, NormalizeError> {
    let provider = ProviderId::Attom;
    let address = required(provider, "address", record.text(&["address", "line1"]).as_deref())?;
    let city = required(provider, "city", record.text(&["address", "locality"]).as_deref())?;
    let state = required(
        provider,
        "state",
        record.text(&["address", "countrySubd"]).as_deref(),
    )?;

    let price = number_value(record.field(&["avm", "amount", "value"]))
        .or_else(|| number_value(record.field(&["sale", "amount", "saleamt"])))
        .unwrap_or(0.0);
    let square_feet = number_value(record.field(&["building", "size", "universalsize"]))
        .or_else(|| number_value(record.field(&["building", "size", "livingsize"])))
        .unwrap_or(0.0);
    let property_type = ["proptype", "propsubtype", "propclass"]
        .iter()
        .map(|key| {
            lookup(
                ATTOM_PROPERTY_TYPES,
                record.text(&["summary", *key]).as_deref(),
                PropertyType::from_canonical,
            )
        })
        .find(|kind| *kind != PropertyType::Unknown)
        .unwrap_or_default();

    Ok(PropertyDraft {
        external_id: record.external_id(),
        data_source: DataSource::Attom,
        address,
        city,
        state,
        zip_code: record.text(&["address", "postal1"]).unwrap_or_default(),
        neighborhood: record.text(&["area", "subdname"]),
        price: format_decimal(price),
        bedrooms: int_value(record.field(&["building", "rooms", "beds"])),
        bathrooms: decimal_text(record.field(&["building", "rooms", "bathstotal"])),
        square_feet: format_decimal(square_feet),
        lot_size: decimal_text(record.field(&["lot", "lotsize1"])),
        year_built: year_value(record.field(&["summary", "yearbuilt"])),
        property_type,
        status: ListingStatus::Unknown,
        days_on_market: 0,
        price_per_sqft: price_per_sqft(None, price, square_feet),
        description: None,
        images: Vec::new(),
        features: attom_features(record),
        latitude: number_value(record.field(&["location", "latitude"])).map(format_decimal),
        longitude: number_value(record.field(&["location", "longitude"])).map(format_decimal),
    })
}

fn attom_features(record: &AttomRecord) -> Vec<String> {
    let labelled = [
        ("Heating", &["utilities", "heatingtype"][..]),
        ("Cooling", &["utilities", "coolingtype"][..]),
        ("Garage", &["building", "parking", "garagetype"][..]),
        ("Pool", &["lot", "pooltype"][..]),
    ];
    labelled
        .iter()
        .filter_map(|(label, path)| record.text(path).map(|value| format!("{label}: {value}")))
        .collect()
}

fn required(
    provider: ProviderId,
    field: &'static str,
    value: Option<&str>,
) -> Result<String, NormalizeError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .ok_or(NormalizeError::MissingField { provider, field })
}

/// Looks `raw` up in a provider vocabulary, then as a canonical name.
fn lookup<T: Copy + Default>(
    table: &[(&str, T)],
    raw: Option<&str>,
    canonical: fn(&str) -> Option<T>,
) -> T {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return T::default();
    };
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(raw))
        .map(|(_, value)| *value)
        .or_else(|| canonical(raw))
        .unwrap_or_default()
}

/// Extracts the first number in `raw`, skipping currency symbols and other
/// leading text. Commas are treated as thousands separators.
pub fn leading_number(raw: &str) -> Option<f64> {
    let chars: Vec<char> = raw.chars().collect();
    let start = (0..chars.len()).find(|&i| {
        chars[i].is_ascii_digit()
            || (chars[i] == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit))
    })?;
    let negative = start > 0 && chars[start - 1] == '-';

    let mut digits = String::new();
    let mut seen_dot = false;
    for &ch in &chars[start..] {
        match ch {
            '0'..='9' => digits.push(ch),
            ',' => continue,
            '.' if !seen_dot => {
                seen_dot = true;
                digits.push(ch);
            }
            _ => break,
        }
    }
    let value: f64 = digits.trim_end_matches('.').parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Numeric reading of a loosely typed field. Arrays yield their first
/// readable element.
pub fn number_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => leading_number(s),
        JsonValue::Array(items) => items.iter().find_map(number_value),
        _ => None,
    }
}

fn int_value(value: &JsonValue) -> i32 {
    number_value(value)
        .map(|n| n.max(0.0).floor() as i32)
        .unwrap_or(0)
}

fn decimal_text(value: &JsonValue) -> String {
    format_decimal(number_value(value).unwrap_or(0.0))
}

fn year_value(value: &JsonValue) -> Option<i32> {
    number_value(value)
        .map(|n| n.floor() as i32)
        .filter(|year| (1000..=9999).contains(year))
}

pub(crate) fn text_value(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// First non-empty text in a string, an array of strings, or an array of
/// `{ "value": ... }` objects.
fn first_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Array(items) => items.iter().find_map(first_text),
        JsonValue::Object(map) => map.get("value").and_then(first_text),
        other => text_value(other),
    }
}

/// `price / square_feet` to two decimals unless the provider supplied a
/// value. Zero or missing square footage yields `"0"`.
pub fn price_per_sqft(supplied: Option<f64>, price: f64, square_feet: f64) -> String {
    if let Some(value) = supplied.filter(|v| *v > 0.0) {
        return format!("{value:.2}");
    }
    if square_feet <= 0.0 || !price.is_finite() {
        return "0".to_string();
    }
    format!("{:.2}", price / square_feet)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let date_part = raw.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn url_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'\\,\[\]{}<>]+"#).expect("valid url token regex"))
}

fn quoted_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]+)"(\s*:)?"#).expect("valid quoted token regex"))
}

/// Coerces an images or features field into a clean list of strings.
///
/// Arrays are used as they are. Text goes through token extraction (URLs for
/// images, quoted tokens or comma separated words for features) and, when
/// that finds nothing in bracketed text, a JSON parse after stripping escaped
/// and doubled quotes. Anything else is an empty list.
pub fn normalize_string_list(value: &JsonValue, kind: ListKind) -> Vec<String> {
    let items = match value {
        JsonValue::Array(items) => items.iter().flat_map(|item| list_item(item, kind)).collect(),
        JsonValue::String(text) => list_from_text(text, kind),
        JsonValue::Object(_) => list_item(value, kind),
        _ => Vec::new(),
    };
    dedup_in_order(items)
}

fn list_item(item: &JsonValue, kind: ListKind) -> Vec<String> {
    match item {
        JsonValue::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with('[') || (kind == ListKind::Urls && !is_url(trimmed)) {
                list_from_text(trimmed, kind)
            } else {
                clean_token(trimmed).into_iter().collect()
            }
        }
        JsonValue::Array(items) => items.iter().flat_map(|i| list_item(i, kind)).collect(),
        JsonValue::Object(map) => match kind {
            ListKind::Urls => ["url", "href", "src"]
                .iter()
                .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
                .and_then(clean_token)
                .into_iter()
                .collect(),
            ListKind::Words => {
                let label = map.get("key").and_then(|v| v.as_str()).map(str::trim);
                let values: Vec<String> = map
                    .get("value")
                    .map(|v| list_item(v, kind))
                    .unwrap_or_default();
                match label.filter(|l| !l.is_empty()) {
                    Some(label) if !values.is_empty() => {
                        vec![format!("{label}: {}", values.join(", "))]
                    }
                    Some(label) => vec![label.to_string()],
                    None => values,
                }
            }
        },
        JsonValue::Number(n) if kind == ListKind::Words => vec![n.to_string()],
        _ => Vec::new(),
    }
}

fn list_from_text(text: &str, kind: ListKind) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let tokens = match kind {
        ListKind::Urls => url_tokens(trimmed),
        ListKind::Words => word_tokens(trimmed),
    };
    if !tokens.is_empty() {
        return tokens;
    }

    if trimmed.starts_with('[') {
        if let Some(JsonValue::Array(items)) = cleaned_json(trimmed) {
            return items
                .iter()
                .filter(|item| !matches!(item, JsonValue::String(s) if s.trim() == trimmed))
                .flat_map(|item| list_item(item, kind))
                .collect();
        }
    }
    Vec::new()
}

fn url_tokens(text: &str) -> Vec<String> {
    let unescaped = text.replace("\\/", "/");
    url_token_regex()
        .find_iter(&unescaped)
        .map(|m| m.as_str().trim_end_matches(['.', ')', ';']).to_string())
        .collect()
}

fn word_tokens(text: &str) -> Vec<String> {
    let unescaped = text.replace('\\', "");
    let quoted: Vec<String> = quoted_token_regex()
        .captures_iter(&unescaped)
        .filter(|caps| caps.get(2).is_none())
        .filter_map(|caps| caps.get(1).and_then(|m| clean_token(m.as_str())))
        .collect();
    if !quoted.is_empty() || unescaped.contains('"') || unescaped.starts_with('{') {
        return quoted;
    }
    unescaped
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .filter_map(clean_token)
        .collect()
}

fn cleaned_json(text: &str) -> Option<JsonValue> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let mut cleaned = text.replace("\\\"", "\"");
    while cleaned.contains("\"\"") {
        cleaned = cleaned.replace("\"\"", "\"");
    }
    serde_json::from_str(&cleaned).ok()
}

fn clean_token(raw: &str) -> Option<String> {
    let token = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '\\')
        .trim();
    if token.chars().any(char::is_alphanumeric) {
        Some(token.to_string())
    } else {
        None
    }
}

fn is_url(text: &str) -> bool {
    text.starts_with("http://") || text.starts_with("https://")
}

fn dedup_in_order(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
