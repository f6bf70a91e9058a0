use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;

use crate::auth::{require_engineer, AuthUser};
use crate::error::{map_db_error, AppError, AppResult};
use crate::services::evaluator::rules::AlertKind;
use crate::state::AppState;
use crate::store::{self, AlertFilter, AlertRow, MAX_PAGE_LIMIT};
use crate::time::{parse_ts, to_iso};

const SEVERITIES: &[&str] = &["info", "warning", "critical"];

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AlertResponse {
    id: i64,
    battery_id: String,
    alert_type: String,
    severity: String,
    message: String,
    threshold: Option<f64>,
    observed: Option<f64>,
    triggered_at: String,
    resolved_at: Option<String>,
    acknowledged: bool,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<String>,
    ack_note: Option<String>,
}

impl From<AlertRow> for AlertResponse {
    fn from(row: AlertRow) -> Self {
        Self {
            id: row.id,
            battery_id: row.battery_id,
            alert_type: row.kind,
            severity: row.severity,
            message: row.message,
            threshold: row.threshold,
            observed: row.observed,
            triggered_at: to_iso(row.triggered_at),
            resolved_at: row.resolved_at.map(to_iso),
            acknowledged: row.acknowledged_at.is_some(),
            acknowledged_by: row.acknowledged_by.map(|id| id.to_string()),
            acknowledged_at: row.acknowledged_at.map(to_iso),
            ack_note: row.ack_note,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct AlertListQuery {
    location_id: Option<String>,
    severity: Option<String>,
    alert_type: Option<String>,
    active_only: Option<bool>,
    acknowledged: Option<bool>,
    start_date: Option<String>,
    end_date: Option<String>,
    skip: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct AlertStatsQuery {
    location_id: Option<String>,
    days: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AlertStatsResponse {
    days: i64,
    total: i64,
    active: i64,
    by_severity: BTreeMap<String, i64>,
    by_kind: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct AcknowledgeRequest {
    note: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/alerts",
    tag = "alerts",
    params(AlertListQuery),
    responses(
        (status = 200, description = "Alerts newest-first", body = Vec<AlertResponse>),
        (status = 400, description = "Invalid filter"),
        (status = 401, description = "Unauthorized")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn list_alerts(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Query(query): Query<AlertListQuery>,
) -> AppResult<Json<Vec<AlertResponse>>> {
    let severity = match query.severity.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            let lowered = raw.to_lowercase();
            if !SEVERITIES.contains(&lowered.as_str()) {
                return Err(AppError::validation(format!(
                    "severity must be one of {}",
                    SEVERITIES.join(", ")
                )));
            }
            Some(lowered)
        }
        _ => None,
    };
    let kind = match query.alert_type.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(
            AlertKind::parse(raw)
                .ok_or_else(|| AppError::validation(format!("Unknown alert_type: {raw}")))?
                .as_str()
                .to_string(),
        ),
        _ => None,
    };
    let start_date = query
        .start_date
        .as_deref()
        .map(parse_ts)
        .transpose()?;
    let end_date = query.end_date.as_deref().map(parse_ts).transpose()?;

    let filter = AlertFilter {
        location_id: query
            .location_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        severity,
        kind,
        active_only: query.active_only.unwrap_or(false),
        acknowledged: query.acknowledged,
        start_date,
        end_date,
        skip: query.skip.unwrap_or(0).max(0),
        limit: query.limit.unwrap_or(100).clamp(1, MAX_PAGE_LIMIT),
    };

    let rows = store::list_alerts(&state.db, &filter)
        .await
        .map_err(map_db_error)?;
    Ok(Json(rows.into_iter().map(AlertResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/alerts/stats",
    tag = "alerts",
    params(AlertStatsQuery),
    responses(
        (status = 200, description = "Aggregated alert counts", body = AlertStatsResponse),
        (status = 400, description = "Invalid range"),
        (status = 401, description = "Unauthorized")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn alert_stats(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Query(query): Query<AlertStatsQuery>,
) -> AppResult<Json<AlertStatsResponse>> {
    let days = query.days.unwrap_or(7);
    if !(1..=365).contains(&days) {
        return Err(AppError::validation("days must be within [1, 365]"));
    }
    let since = Utc::now() - ChronoDuration::days(days);

    let rows = store::alert_stats(&state.db, query.location_id.as_deref(), since)
        .await
        .map_err(map_db_error)?;

    let mut total = 0i64;
    let mut active = 0i64;
    let mut by_severity: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_kind: BTreeMap<String, i64> = BTreeMap::new();
    for row in rows {
        total += row.total;
        active += row.active;
        *by_severity.entry(row.severity).or_default() += row.total;
        *by_kind.entry(row.kind).or_default() += row.total;
    }

    Ok(Json(AlertStatsResponse {
        days,
        total,
        active,
        by_severity,
        by_kind,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/alerts/{alert_id}/acknowledge",
    tag = "alerts",
    request_body = AcknowledgeRequest,
    params(("alert_id" = i64, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Acknowledged alert", body = AlertResponse),
        (status = 400, description = "Already acknowledged"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Alert not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn acknowledge_alert(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Path(alert_id): Path<i64>,
    payload: Option<Json<AcknowledgeRequest>>,
) -> AppResult<Json<AlertResponse>> {
    require_engineer(&user)?;

    let existing = store::get_alert(&state.db, alert_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found("Alert not found"))?;
    if existing.acknowledged_at.is_some() {
        return Err(AppError::validation("Alert has already been acknowledged"));
    }

    let note = payload
        .and_then(|Json(body)| body.note)
        .map(|note| note.trim().to_string())
        .filter(|note| !note.is_empty());

    let row: AlertRow = sqlx::query_as(
        r#"
        UPDATE alerts
        SET acknowledged_by = $2, acknowledged_at = NOW(), ack_note = $3
        WHERE id = $1 AND acknowledged_at IS NULL
        RETURNING id, battery_id, kind, severity, message, threshold, observed,
                  triggered_at, resolved_at, acknowledged_by, acknowledged_at, ack_note
        "#,
    )
    .bind(alert_id)
    .bind(user.id)
    .bind(note)
    .fetch_optional(&state.db)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::validation("Alert has already been acknowledged"))?;

    Ok(Json(AlertResponse::from(row)))
}

#[utoipa::path(
    post,
    path = "/api/v1/alerts/{alert_id}/resolve",
    tag = "alerts",
    params(("alert_id" = i64, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Resolved alert", body = AlertResponse),
        (status = 400, description = "Already resolved"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Alert not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn resolve_alert(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Path(alert_id): Path<i64>,
) -> AppResult<Json<AlertResponse>> {
    require_engineer(&user)?;

    let existing = store::get_alert(&state.db, alert_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found("Alert not found"))?;
    if existing.resolved_at.is_some() {
        return Err(AppError::validation("Alert has already been resolved"));
    }

    let row: AlertRow = sqlx::query_as(
        r#"
        UPDATE alerts
        SET resolved_at = NOW()
        WHERE id = $1 AND resolved_at IS NULL
        RETURNING id, battery_id, kind, severity, message, threshold, observed,
                  triggered_at, resolved_at, acknowledged_by, acknowledged_at, ack_note
        "#,
    )
    .bind(alert_id)
    .fetch_optional(&state.db)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::validation("Alert has already been resolved"))?;

    // The window must forget the open alert or it could never re-open.
    state.evaluator.mark_resolved(&row.battery_id, &row.kind).await;

    let locations =
        store::battery_locations(&state.db, std::slice::from_ref(&row.battery_id))
            .await
            .map_err(map_db_error)?;
    let location_id = locations.get(&row.battery_id).cloned().unwrap_or_default();
    state.hub.publish_alert(
        row.id,
        &row.battery_id,
        &location_id,
        &row.kind,
        &row.severity,
        &row.message,
        true,
        row.resolved_at.unwrap_or_else(Utc::now),
    );

    Ok(Json(AlertResponse::from(row)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/stats", get(alert_stats))
        .route("/alerts/{alert_id}/acknowledge", post(acknowledge_alert))
        .route("/alerts/{alert_id}/resolve", post(resolve_alert))
}
