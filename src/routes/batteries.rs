use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};

use crate::auth::{require_admin, AuthUser};
use crate::error::{map_db_conflict, map_db_error, AppError, AppResult};
use crate::services::ingest::classify;
use crate::state::AppState;
use crate::store::{self, BatteryRow, SampleRow, MAX_PAGE_LIMIT, MAX_TELEMETRY_ROWS};
use crate::time::{parse_ts, to_iso};

pub(crate) const BATTERY_STATUSES: &[&str] =
    &["active", "warning", "critical", "replaced", "retired"];

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct TelemetryPoint {
    pub(crate) timestamp: String,
    pub(crate) voltage_v: f64,
    pub(crate) current_a: f64,
    pub(crate) temperature_c: f64,
    pub(crate) resistance_mohm: f64,
    pub(crate) soc_pct: f64,
    pub(crate) soh_pct: f64,
}

impl From<&SampleRow> for TelemetryPoint {
    fn from(row: &SampleRow) -> Self {
        Self {
            timestamp: to_iso(row.ts),
            voltage_v: row.voltage_v,
            current_a: row.current_a,
            temperature_c: row.temperature_c,
            resistance_mohm: row.resistance_mohm,
            soc_pct: row.soc_pct,
            soh_pct: row.soh_pct,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct BatterySummary {
    pub(crate) battery_id: String,
    pub(crate) string_id: String,
    pub(crate) location_id: String,
    pub(crate) position: i32,
    pub(crate) vendor: String,
    pub(crate) model: String,
    pub(crate) serial: String,
    pub(crate) nominal_voltage_v: f64,
    pub(crate) nominal_capacity_ah: f64,
    pub(crate) warranty_months: i32,
    pub(crate) status: String,
    pub(crate) latest: Option<TelemetryPoint>,
}

pub(crate) fn battery_summary(row: &BatteryRow, latest: Option<&SampleRow>) -> BatterySummary {
    BatterySummary {
        battery_id: row.battery_id.clone(),
        string_id: row.string_id.clone(),
        location_id: row.location_id.clone(),
        position: row.position,
        vendor: row.vendor.clone(),
        model: row.model.clone(),
        serial: row.serial.clone(),
        nominal_voltage_v: row.nominal_voltage_v,
        nominal_capacity_ah: row.nominal_capacity_ah,
        warranty_months: row.warranty_months,
        status: row.status.clone(),
        latest: latest.map(TelemetryPoint::from),
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct BatteryDetailResponse {
    #[serde(flatten)]
    pub(crate) battery: BatterySummary,
    pub(crate) derived_status: Option<String>,
    pub(crate) active_alert_count: i64,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct BatteryListQuery {
    location_id: Option<String>,
    skip: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct TelemetryRangeQuery {
    start: Option<String>,
    end: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct BatteryCreateRequest {
    battery_id: String,
    string_id: String,
    #[serde(default)]
    position: i32,
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    serial: String,
    nominal_voltage_v: f64,
    nominal_capacity_ah: f64,
    #[serde(default)]
    installed_on: Option<NaiveDate>,
    #[serde(default)]
    warranty_months: i32,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct BatteryStatusRequest {
    status: String,
}

pub(crate) async fn fetch_battery_summaries(
    db: &sqlx::PgPool,
    rows: Vec<BatteryRow>,
) -> Result<Vec<BatterySummary>, sqlx::Error> {
    let ids: Vec<String> = rows.iter().map(|row| row.battery_id.clone()).collect();
    let latest = store::latest_samples_for(db, &ids).await?;
    Ok(rows
        .iter()
        .map(|row| battery_summary(row, latest.get(&row.battery_id)))
        .collect())
}

#[utoipa::path(
    get,
    path = "/api/v1/batteries",
    tag = "batteries",
    params(BatteryListQuery),
    responses(
        (status = 200, description = "Batteries with latest telemetry", body = Vec<BatterySummary>),
        (status = 401, description = "Unauthorized")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn list_batteries(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Query(query): Query<BatteryListQuery>,
) -> AppResult<Json<Vec<BatterySummary>>> {
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_PAGE_LIMIT);
    let rows = store::list_batteries(&state.db, query.location_id.as_deref(), skip, limit)
        .await
        .map_err(map_db_error)?;
    let summaries = fetch_battery_summaries(&state.db, rows)
        .await
        .map_err(map_db_error)?;
    Ok(Json(summaries))
}

#[utoipa::path(
    get,
    path = "/api/v1/batteries/{battery_id}",
    tag = "batteries",
    params(("battery_id" = String, Path, description = "Battery id")),
    responses(
        (status = 200, description = "Battery detail", body = BatteryDetailResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Battery not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn get_battery(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Path(battery_id): Path<String>,
) -> AppResult<Json<BatteryDetailResponse>> {
    let row = store::get_battery(&state.db, battery_id.trim())
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found(format!("Battery {battery_id} not found")))?;

    let latest = store::latest_sample(&state.db, &row.battery_id)
        .await
        .map_err(map_db_error)?;
    let active_alert_count = store::open_alert_count(&state.db, &row.battery_id)
        .await
        .map_err(map_db_error)?;

    let derived_status = match &latest {
        Some(sample) => {
            let open = state.evaluator.open_severity(&row.battery_id).await;
            Some(
                classify(sample.soh_pct, sample.temperature_c, open)
                    .as_str()
                    .to_string(),
            )
        }
        None => None,
    };

    Ok(Json(BatteryDetailResponse {
        battery: battery_summary(&row, latest.as_ref()),
        derived_status,
        active_alert_count,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/batteries/{battery_id}/telemetry",
    tag = "batteries",
    params(
        ("battery_id" = String, Path, description = "Battery id"),
        TelemetryRangeQuery
    ),
    responses(
        (status = 200, description = "Samples oldest-first", body = Vec<TelemetryPoint>),
        (status = 400, description = "Invalid range"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Battery not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn battery_telemetry(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Path(battery_id): Path<String>,
    Query(query): Query<TelemetryRangeQuery>,
) -> AppResult<Json<Vec<TelemetryPoint>>> {
    let battery_id = battery_id.trim().to_string();
    store::get_battery(&state.db, &battery_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found(format!("Battery {battery_id} not found")))?;

    let end = match query.end.as_deref() {
        Some(raw) => parse_ts(raw)?,
        None => Utc::now(),
    };
    let start = match query.start.as_deref() {
        Some(raw) => parse_ts(raw)?,
        None => end - ChronoDuration::hours(24),
    };
    if end < start {
        return Err(AppError::validation("end must be after start"));
    }
    let limit = query.limit.unwrap_or(MAX_TELEMETRY_ROWS).clamp(1, MAX_TELEMETRY_ROWS);

    let rows = store::range_samples(&state.db, &battery_id, start, end, limit)
        .await
        .map_err(map_db_error)?;
    Ok(Json(rows.iter().map(TelemetryPoint::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/v1/batteries",
    tag = "batteries",
    request_body = BatteryCreateRequest,
    responses(
        (status = 201, description = "Created battery", body = BatterySummary),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Battery already exists")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn create_battery(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<BatteryCreateRequest>,
) -> AppResult<(StatusCode, Json<BatterySummary>)> {
    require_admin(&user)?;

    let battery_id = payload.battery_id.trim().to_string();
    if battery_id.is_empty() || battery_id.len() > 50 {
        return Err(AppError::validation("battery_id must be 1..=50 characters"));
    }
    if payload.nominal_voltage_v <= 0.0 || !payload.nominal_voltage_v.is_finite() {
        return Err(AppError::validation("nominal_voltage_v must be > 0"));
    }
    if payload.nominal_capacity_ah <= 0.0 || !payload.nominal_capacity_ah.is_finite() {
        return Err(AppError::validation("nominal_capacity_ah must be > 0"));
    }

    sqlx::query(
        r#"
        INSERT INTO batteries (battery_id, string_id, position, vendor, model, serial,
                               nominal_voltage_v, nominal_capacity_ah, installed_on, warranty_months)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&battery_id)
    .bind(payload.string_id.trim())
    .bind(payload.position)
    .bind(payload.vendor.trim())
    .bind(payload.model.trim())
    .bind(payload.serial.trim())
    .bind(payload.nominal_voltage_v)
    .bind(payload.nominal_capacity_ah)
    .bind(payload.installed_on)
    .bind(payload.warranty_months)
    .execute(&state.db)
    .await
    .map_err(|err| map_db_conflict(err, "Battery already exists"))?;

    let row = store::get_battery(&state.db, &battery_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::internal("Battery vanished after insert"))?;
    Ok((StatusCode::CREATED, Json(battery_summary(&row, None))))
}

#[utoipa::path(
    patch,
    path = "/api/v1/batteries/{battery_id}/status",
    tag = "batteries",
    request_body = BatteryStatusRequest,
    params(("battery_id" = String, Path, description = "Battery id")),
    responses(
        (status = 200, description = "Updated battery", body = BatterySummary),
        (status = 400, description = "Invalid status"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Battery not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn patch_battery_status(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Path(battery_id): Path<String>,
    Json(payload): Json<BatteryStatusRequest>,
) -> AppResult<Json<BatterySummary>> {
    require_admin(&user)?;

    let status = payload.status.trim().to_lowercase();
    if !BATTERY_STATUSES.contains(&status.as_str()) {
        return Err(AppError::validation(format!(
            "status must be one of {}",
            BATTERY_STATUSES.join(", ")
        )));
    }

    let result = sqlx::query(
        "UPDATE batteries SET status = $2, updated_at = NOW() WHERE battery_id = $1",
    )
    .bind(battery_id.trim())
    .bind(&status)
    .execute(&state.db)
    .await
    .map_err(map_db_error)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found(format!("Battery {battery_id} not found")));
    }

    let row = store::get_battery(&state.db, battery_id.trim())
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found(format!("Battery {battery_id} not found")))?;
    let latest = store::latest_sample(&state.db, &row.battery_id)
        .await
        .map_err(map_db_error)?;
    Ok(Json(battery_summary(&row, latest.as_ref())))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/batteries", get(list_batteries).post(create_battery))
        .route("/batteries/{battery_id}", get(get_battery))
        .route("/batteries/{battery_id}/telemetry", get(battery_telemetry))
        .route(
            "/batteries/{battery_id}/status",
            axum::routing::patch(patch_battery_status),
        )
}
