use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;

use crate::auth::{require_admin, AuthUser};
use crate::error::{map_db_conflict, map_db_error, AppError, AppResult};
use crate::routes::batteries::{fetch_battery_summaries, BatterySummary};
use crate::state::AppState;
use crate::store::{self, LocationRow, MAX_PAGE_LIMIT};

const MAX_LOCATION_ID_LEN: usize = 50;

pub(crate) const SYSTEM_KINDS: &[&str] = &["ups", "rectifier"];

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct LocationResponse {
    location_id: String,
    name: String,
    region: String,
    latitude: f64,
    longitude: f64,
    temp_offset_c: f64,
    humidity_offset_pct: f64,
    outage_rate_per_year: f64,
}

impl From<LocationRow> for LocationResponse {
    fn from(row: LocationRow) -> Self {
        Self {
            location_id: row.location_id,
            name: row.name,
            region: row.region,
            latitude: row.latitude,
            longitude: row.longitude,
            temp_offset_c: row.temp_offset_c,
            humidity_offset_pct: row.humidity_offset_pct,
            outage_rate_per_year: row.outage_rate_per_year,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct LocationStatsResponse {
    location_id: String,
    name: String,
    region: String,
    latitude: f64,
    longitude: f64,
    total_batteries: i64,
    active_batteries: i64,
    degraded_batteries: i64,
    mean_soh_pct: Option<f64>,
    open_alerts: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub(crate) enum LocationListResponse {
    Plain(Vec<LocationResponse>),
    WithStats(Vec<LocationStatsResponse>),
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct LocationListQuery {
    include_stats: Option<bool>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct LocationCreateRequest {
    location_id: String,
    name: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    #[serde(default)]
    temp_offset_c: f64,
    #[serde(default)]
    humidity_offset_pct: f64,
    #[serde(default)]
    outage_rate_per_year: f64,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct SystemCreateRequest {
    system_id: String,
    location_id: String,
    kind: String,
    #[serde(default)]
    rated_power_kw: f64,
    #[serde(default)]
    installed_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct StringCreateRequest {
    string_id: String,
    system_id: String,
    #[serde(default)]
    position: i32,
    #[serde(default)]
    battery_count: i32,
    #[serde(default)]
    nominal_voltage_v: f64,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct CreatedResponse {
    id: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/locations",
    tag = "locations",
    params(LocationListQuery),
    responses(
        (status = 200, description = "Sites, with aggregates when include_stats=true"),
        (status = 401, description = "Unauthorized")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn list_locations(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Query(query): Query<LocationListQuery>,
) -> AppResult<Json<LocationListResponse>> {
    if query.include_stats.unwrap_or(false) {
        let rows = store::list_locations_with_stats(&state.db)
            .await
            .map_err(map_db_error)?;
        let stats = rows
            .into_iter()
            .map(|row| LocationStatsResponse {
                location_id: row.location_id,
                name: row.name,
                region: row.region,
                latitude: row.latitude,
                longitude: row.longitude,
                total_batteries: row.total_batteries,
                active_batteries: row.active_batteries,
                degraded_batteries: row.degraded_batteries,
                mean_soh_pct: row.mean_soh_pct,
                open_alerts: row.open_alerts,
            })
            .collect();
        return Ok(Json(LocationListResponse::WithStats(stats)));
    }

    let rows = store::list_locations(&state.db).await.map_err(map_db_error)?;
    Ok(Json(LocationListResponse::Plain(
        rows.into_iter().map(LocationResponse::from).collect(),
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/locations/{location_id}",
    tag = "locations",
    params(("location_id" = String, Path, description = "Site id")),
    responses(
        (status = 200, description = "Site", body = LocationResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Location not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn get_location(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Path(location_id): Path<String>,
) -> AppResult<Json<LocationResponse>> {
    let row = store::get_location(&state.db, location_id.trim())
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found(format!("Location {location_id} not found")))?;
    Ok(Json(LocationResponse::from(row)))
}

#[utoipa::path(
    get,
    path = "/api/v1/locations/{location_id}/batteries",
    tag = "locations",
    params(("location_id" = String, Path, description = "Site id")),
    responses(
        (status = 200, description = "Batteries at the site", body = Vec<BatterySummary>),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Location not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn location_batteries(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Path(location_id): Path<String>,
) -> AppResult<Json<Vec<BatterySummary>>> {
    let location_id = location_id.trim().to_string();
    store::get_location(&state.db, &location_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found(format!("Location {location_id} not found")))?;

    let rows = store::list_batteries(&state.db, Some(&location_id), 0, MAX_PAGE_LIMIT)
        .await
        .map_err(map_db_error)?;
    let summaries = fetch_battery_summaries(&state.db, rows)
        .await
        .map_err(map_db_error)?;
    Ok(Json(summaries))
}

fn validate_master_id(label: &str, value: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_LOCATION_ID_LEN {
        return Err(AppError::validation(format!(
            "{label} must be 1..={MAX_LOCATION_ID_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[utoipa::path(
    post,
    path = "/api/v1/locations",
    tag = "locations",
    request_body = LocationCreateRequest,
    responses(
        (status = 201, description = "Created site", body = LocationResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Location already exists")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn create_location(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<LocationCreateRequest>,
) -> AppResult<(StatusCode, Json<LocationResponse>)> {
    require_admin(&user)?;
    let location_id = validate_master_id("location_id", &payload.location_id)?;
    if payload.name.trim().is_empty() {
        return Err(AppError::validation("name is required"));
    }

    let row: LocationRow = sqlx::query_as(
        r#"
        INSERT INTO locations (location_id, name, region, latitude, longitude,
                               temp_offset_c, humidity_offset_pct, outage_rate_per_year)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING location_id, name, region, latitude, longitude,
                  temp_offset_c, humidity_offset_pct, outage_rate_per_year
        "#,
    )
    .bind(&location_id)
    .bind(payload.name.trim())
    .bind(payload.region.trim())
    .bind(payload.latitude)
    .bind(payload.longitude)
    .bind(payload.temp_offset_c)
    .bind(payload.humidity_offset_pct)
    .bind(payload.outage_rate_per_year)
    .fetch_one(&state.db)
    .await
    .map_err(|err| map_db_conflict(err, "Location already exists"))?;

    Ok((StatusCode::CREATED, Json(LocationResponse::from(row))))
}

#[utoipa::path(
    post,
    path = "/api/v1/systems",
    tag = "locations",
    request_body = SystemCreateRequest,
    responses(
        (status = 201, description = "Created system", body = CreatedResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "System already exists")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn create_system(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<SystemCreateRequest>,
) -> AppResult<(StatusCode, Json<CreatedResponse>)> {
    require_admin(&user)?;
    let system_id = validate_master_id("system_id", &payload.system_id)?;
    let kind = payload.kind.trim().to_lowercase();
    if !SYSTEM_KINDS.contains(&kind.as_str()) {
        return Err(AppError::validation(format!(
            "kind must be one of {}",
            SYSTEM_KINDS.join(", ")
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO systems (system_id, location_id, kind, rated_power_kw, installed_on)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&system_id)
    .bind(payload.location_id.trim())
    .bind(&kind)
    .bind(payload.rated_power_kw)
    .bind(payload.installed_on)
    .execute(&state.db)
    .await
    .map_err(|err| map_db_conflict(err, "System already exists"))?;

    Ok((StatusCode::CREATED, Json(CreatedResponse { id: system_id })))
}

#[utoipa::path(
    post,
    path = "/api/v1/strings",
    tag = "locations",
    request_body = StringCreateRequest,
    responses(
        (status = 201, description = "Created string", body = CreatedResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "String already exists")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn create_string(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<StringCreateRequest>,
) -> AppResult<(StatusCode, Json<CreatedResponse>)> {
    require_admin(&user)?;
    let string_id = validate_master_id("string_id", &payload.string_id)?;

    sqlx::query(
        r#"
        INSERT INTO strings (string_id, system_id, position, battery_count, nominal_voltage_v)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&string_id)
    .bind(payload.system_id.trim())
    .bind(payload.position)
    .bind(payload.battery_count)
    .bind(payload.nominal_voltage_v)
    .execute(&state.db)
    .await
    .map_err(|err| map_db_conflict(err, "String already exists"))?;

    Ok((StatusCode::CREATED, Json(CreatedResponse { id: string_id })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/locations", get(list_locations).post(create_location))
        .route("/locations/{location_id}", get(get_location))
        .route("/locations/{location_id}/batteries", get(location_batteries))
        .route("/systems", axum::routing::post(create_system))
        .route("/strings", axum::routing::post(create_string))
}
