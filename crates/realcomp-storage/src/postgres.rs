//! Postgres-backed [`PropertyStore`]. Decimal columns are `NUMERIC`, bound
//! and read back as text so values keep the scale they were written with.
//! Price-per-sqft columns are fixed at two decimal places.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use realcomp_core::{
    DataSource, IdentityKey, ListingStatus, MarketDataPoint, MarketLocation, Property,
    PropertyDraft, PropertyFilters, PropertyPatch, PropertyType,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{PropertyStore, StorageError, StorageResult};

const PROPERTY_COLUMNS: &str = r#"
    id, external_id, data_source, address, city, state, zip_code, neighborhood,
    price::text AS price, bedrooms, bathrooms::text AS bathrooms,
    square_feet::text AS square_feet, lot_size::text AS lot_size, year_built,
    property_type, status, days_on_market, price_per_sqft::text AS price_per_sqft,
    description, images, features, latitude::text AS latitude,
    longitude::text AS longitude, created_at, updated_at
"#;

const MARKET_COLUMNS: &str = r#"
    id, city, state, zip_code, year, month, median_price::text AS median_price,
    days_on_market, active_listings,
    average_price_per_sqft::text AS average_price_per_sqft,
    sale_to_list_ratio::text AS sale_to_list_ratio,
    inventory_months::text AS inventory_months, market_type, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PgPropertyStore {
    pool: PgPool,
}

impl PgPropertyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

/// NUMERIC casts reject empty or malformed text. Well-formed values are
/// bound verbatim so their scale survives; anything else becomes `0`.
fn numeric_text(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => trimmed.to_string(),
        _ => "0".to_string(),
    }
}

/// `LIMIT` takes a signed bigint; oversized limits clamp instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn optional_numeric_text(value: Option<&str>) -> Option<String> {
    value.map(numeric_text)
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn property_from_row(row: &PgRow) -> Result<Property, sqlx::Error> {
    let property_type: String = row.try_get("property_type")?;
    let status: String = row.try_get("status")?;
    let data_source: String = row.try_get("data_source")?;
    let images: Json<Vec<String>> = row.try_get("images")?;
    let features: Json<Vec<String>> = row.try_get("features")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Property {
        id: Some(row.try_get("id")?),
        external_id: row.try_get("external_id")?,
        data_source: DataSource::parse(&data_source),
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        zip_code: row.try_get("zip_code")?,
        neighborhood: row.try_get("neighborhood")?,
        price: row.try_get("price")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        square_feet: row.try_get("square_feet")?,
        lot_size: row.try_get("lot_size")?,
        year_built: row.try_get("year_built")?,
        property_type: PropertyType::from_canonical(&property_type).unwrap_or_default(),
        status: ListingStatus::from_canonical(&status).unwrap_or_default(),
        days_on_market: row.try_get("days_on_market")?,
        price_per_sqft: row.try_get("price_per_sqft")?,
        description: row.try_get("description")?,
        images: images.0,
        features: features.0,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at,
        updated_at,
    })
}

fn market_point_from_row(row: &PgRow) -> Result<MarketDataPoint, sqlx::Error> {
    Ok(MarketDataPoint {
        id: Some(row.try_get("id")?),
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        zip_code: row.try_get("zip_code")?,
        year: row.try_get("year")?,
        month: row.try_get("month")?,
        median_price: row.try_get("median_price")?,
        days_on_market: row.try_get("days_on_market")?,
        active_listings: row.try_get("active_listings")?,
        average_price_per_sqft: row.try_get("average_price_per_sqft")?,
        sale_to_list_ratio: row.try_get("sale_to_list_ratio")?,
        inventory_months: row.try_get("inventory_months")?,
        market_type: row.try_get("market_type")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Appends the filter predicate. Kept in step with [`PropertyFilters::matches`].
fn push_filter_predicates(builder: &mut QueryBuilder<'_, Postgres>, filters: &PropertyFilters) {
    builder.push(" WHERE TRUE");

    if let Some(term) = filters.location_term() {
        let pattern = format!("%{}%", escape_like(term));
        builder.push(" AND (city ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR state ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR zip_code ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR neighborhood ILIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
    if let Some(kind) = filters.property_type_filter() {
        builder.push(" AND LOWER(property_type) = LOWER(");
        builder.push_bind(kind.to_string());
        builder.push(")");
    }
    if let Some(status) = filters.status_filter() {
        builder.push(" AND LOWER(status) = LOWER(");
        builder.push_bind(status.to_string());
        builder.push(")");
    }
    if let Some(min) = filters.min_price {
        builder.push(" AND price >= ");
        builder.push_bind(min);
    }
    if let Some(max) = filters.max_price {
        builder.push(" AND price <= ");
        builder.push_bind(max);
    }
    if let Some(min) = filters.min_beds {
        builder.push(" AND bedrooms >= ");
        builder.push_bind(min);
    }
    if let Some(min) = filters.min_baths {
        builder.push(" AND bathrooms >= ");
        builder.push_bind(min);
    }
    if let Some(min) = filters.min_sqft {
        builder.push(" AND square_feet >= ");
        builder.push_bind(min);
    }
    if let Some(max) = filters.max_sqft {
        builder.push(" AND square_feet <= ");
        builder.push_bind(max);
    }
    if let Some(year) = filters.year_built_min() {
        builder.push(" AND year_built >= ");
        builder.push_bind(year);
    }
}

fn push_draft_values<'a>(builder: &mut QueryBuilder<'a, Postgres>, draft: &'a PropertyDraft) {
    builder.push(
        r#"INSERT INTO properties (
            external_id, data_source, address, city, state, zip_code, neighborhood,
            price, bedrooms, bathrooms, square_feet, lot_size, year_built,
            property_type, status, days_on_market, price_per_sqft, description,
            images, features, latitude, longitude
        ) VALUES ("#,
    );
    let mut values = builder.separated(", ");
    values.push_bind(draft.external_id.as_deref());
    values.push_bind(draft.data_source.as_str());
    values.push_bind(draft.address.as_str());
    values.push_bind(draft.city.as_str());
    values.push_bind(draft.state.as_str());
    values.push_bind(draft.zip_code.as_str());
    values.push_bind(draft.neighborhood.as_deref());
    values.push_bind(numeric_text(&draft.price));
    values.push_unseparated("::numeric");
    values.push_bind(draft.bedrooms);
    values.push_bind(numeric_text(&draft.bathrooms));
    values.push_unseparated("::numeric");
    values.push_bind(numeric_text(&draft.square_feet));
    values.push_unseparated("::numeric");
    values.push_bind(numeric_text(&draft.lot_size));
    values.push_unseparated("::numeric");
    values.push_bind(draft.year_built);
    values.push_bind(draft.property_type.as_str());
    values.push_bind(draft.status.as_str());
    values.push_bind(draft.days_on_market);
    values.push_bind(numeric_text(&draft.price_per_sqft));
    values.push_unseparated("::numeric");
    values.push_bind(draft.description.as_deref());
    values.push_bind(Json(draft.images.clone()));
    values.push_bind(Json(draft.features.clone()));
    values.push_bind(optional_numeric_text(draft.latitude.as_deref()));
    values.push_unseparated("::numeric");
    values.push_bind(optional_numeric_text(draft.longitude.as_deref()));
    values.push_unseparated("::numeric");
    builder.push(")");
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl PropertyStore for PgPropertyStore {
    async fn get_all_properties(&self) -> StorageResult<Vec<Property>> {
        let rows = sqlx::query(&format!("SELECT {PROPERTY_COLUMNS} FROM properties ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(property_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_property(&self, id: i64) -> StorageResult<Option<Property>> {
        let row = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(property_from_row).transpose()?)
    }

    async fn get_property_by_external_id(
        &self,
        external_id: &str,
    ) -> StorageResult<Option<Property>> {
        let row = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE external_id = $1 ORDER BY id LIMIT 1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(property_from_row).transpose()?)
    }

    async fn find_by_identity(&self, key: &IdentityKey) -> StorageResult<Option<Property>> {
        let row = sqlx::query(&format!(
            r#"SELECT {PROPERTY_COLUMNS} FROM properties
                WHERE address = $1 AND city = $2 AND state = $3 AND zip_code = $4"#
        ))
        .bind(&key.address)
        .bind(&key.city)
        .bind(&key.state)
        .bind(&key.zip_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(property_from_row).transpose()?)
    }

    async fn get_properties_by_filters(
        &self,
        filters: &PropertyFilters,
    ) -> StorageResult<Vec<Property>> {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {PROPERTY_COLUMNS} FROM properties"));
        push_filter_predicates(&mut builder, filters);
        builder.push(" ORDER BY id");
        if let Some(limit) = filters.limit {
            builder.push(" LIMIT ");
            builder.push_bind(sql_limit(limit));
        }
        let rows = builder.build().fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "local property query");
        Ok(rows
            .iter()
            .map(property_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn create_property(&self, draft: &PropertyDraft) -> StorageResult<Property> {
        let mut builder = QueryBuilder::<Postgres>::new("");
        push_draft_values(&mut builder, draft);
        builder.push(format!(" RETURNING {PROPERTY_COLUMNS}"));
        match builder.build().fetch_one(&self.pool).await {
            Ok(row) => Ok(property_from_row(&row)?),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::Conflict(draft.identity_key()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_property(&self, id: i64, patch: &PropertyPatch) -> StorageResult<Property> {
        let row = sqlx::query(&format!(
            r#"UPDATE properties SET
                external_id    = COALESCE($2, external_id),
                neighborhood   = COALESCE($3, neighborhood),
                price          = COALESCE($4::numeric, price),
                bedrooms       = COALESCE($5, bedrooms),
                bathrooms      = COALESCE($6::numeric, bathrooms),
                square_feet    = COALESCE($7::numeric, square_feet),
                lot_size       = COALESCE($8::numeric, lot_size),
                year_built     = COALESCE($9, year_built),
                property_type  = COALESCE($10, property_type),
                status         = COALESCE($11, status),
                days_on_market = COALESCE($12, days_on_market),
                price_per_sqft = COALESCE($13::numeric, price_per_sqft),
                description    = COALESCE($14, description),
                images         = COALESCE($15, images),
                features       = COALESCE($16, features),
                latitude       = COALESCE($17::numeric, latitude),
                longitude      = COALESCE($18::numeric, longitude),
                updated_at     = NOW()
              WHERE id = $1
              RETURNING {PROPERTY_COLUMNS}"#
        ))
        .bind(id)
        .bind(patch.external_id.as_deref())
        .bind(patch.neighborhood.as_deref())
        .bind(optional_numeric_text(patch.price.as_deref()))
        .bind(patch.bedrooms)
        .bind(optional_numeric_text(patch.bathrooms.as_deref()))
        .bind(optional_numeric_text(patch.square_feet.as_deref()))
        .bind(optional_numeric_text(patch.lot_size.as_deref()))
        .bind(patch.year_built)
        .bind(patch.property_type.map(|t| t.as_str()))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.days_on_market)
        .bind(optional_numeric_text(patch.price_per_sqft.as_deref()))
        .bind(patch.description.as_deref())
        .bind(patch.images.clone().map(Json))
        .bind(patch.features.clone().map(Json))
        .bind(optional_numeric_text(patch.latitude.as_deref()))
        .bind(optional_numeric_text(patch.longitude.as_deref()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(property_from_row(&row)?),
            None => Err(StorageError::NotFound(id)),
        }
    }

    async fn upsert_property(&self, draft: &PropertyDraft) -> StorageResult<Property> {
        let mut builder = QueryBuilder::<Postgres>::new("");
        push_draft_values(&mut builder, draft);
        builder.push(
            r#" ON CONFLICT (address, city, state, zip_code) DO UPDATE SET
                external_id    = COALESCE(EXCLUDED.external_id, properties.external_id),
                data_source    = EXCLUDED.data_source,
                neighborhood   = COALESCE(EXCLUDED.neighborhood, properties.neighborhood),
                price          = EXCLUDED.price,
                bedrooms       = EXCLUDED.bedrooms,
                bathrooms      = EXCLUDED.bathrooms,
                square_feet    = EXCLUDED.square_feet,
                lot_size       = EXCLUDED.lot_size,
                year_built     = COALESCE(EXCLUDED.year_built, properties.year_built),
                property_type  = EXCLUDED.property_type,
                status         = EXCLUDED.status,
                days_on_market = EXCLUDED.days_on_market,
                price_per_sqft = EXCLUDED.price_per_sqft,
                description    = COALESCE(EXCLUDED.description, properties.description),
                images         = CASE WHEN jsonb_array_length(EXCLUDED.images) > 0
                                      THEN EXCLUDED.images ELSE properties.images END,
                features       = CASE WHEN jsonb_array_length(EXCLUDED.features) > 0
                                      THEN EXCLUDED.features ELSE properties.features END,
                latitude       = COALESCE(EXCLUDED.latitude, properties.latitude),
                longitude      = COALESCE(EXCLUDED.longitude, properties.longitude),
                updated_at     = NOW()"#,
        );
        builder.push(format!(" RETURNING {PROPERTY_COLUMNS}"));
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(property_from_row(&row)?)
    }

    async fn get_market_data_by_location(
        &self,
        location: &MarketLocation,
    ) -> StorageResult<Vec<MarketDataPoint>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {MARKET_COLUMNS} FROM market_data
                WHERE city = $1 AND state = $2 AND zip_code = $3
                ORDER BY year DESC, month DESC"#
        ))
        .bind(&location.city)
        .bind(&location.state)
        .bind(location.zip_or_empty())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(market_point_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn upsert_market_data(&self, point: &MarketDataPoint) -> StorageResult<MarketDataPoint> {
        let row = sqlx::query(&format!(
            r#"INSERT INTO market_data (
                    city, state, zip_code, year, month, median_price, days_on_market,
                    active_listings, average_price_per_sqft, sale_to_list_ratio,
                    inventory_months, market_type, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6::numeric, $7, $8, $9::numeric,
                          $10::numeric, $11::numeric, $12, $13)
                ON CONFLICT (city, state, zip_code, year, month) DO UPDATE SET
                    median_price           = EXCLUDED.median_price,
                    days_on_market         = EXCLUDED.days_on_market,
                    active_listings        = EXCLUDED.active_listings,
                    average_price_per_sqft = EXCLUDED.average_price_per_sqft,
                    sale_to_list_ratio     = EXCLUDED.sale_to_list_ratio,
                    inventory_months       = EXCLUDED.inventory_months,
                    market_type            = EXCLUDED.market_type,
                    updated_at             = EXCLUDED.updated_at
                RETURNING {MARKET_COLUMNS}"#
        ))
        .bind(&point.city)
        .bind(&point.state)
        .bind(&point.zip_code)
        .bind(point.year)
        .bind(point.month)
        .bind(numeric_text(&point.median_price))
        .bind(point.days_on_market)
        .bind(point.active_listings)
        .bind(numeric_text(&point.average_price_per_sqft))
        .bind(numeric_text(&point.sale_to_list_ratio))
        .bind(numeric_text(&point.inventory_months))
        .bind(&point.market_type)
        .bind(point.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(market_point_from_row(&row)?)
    }
}
