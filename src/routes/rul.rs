use axum::extract::Path;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};

use crate::auth::AuthUser;
use crate::error::{map_db_error, AppError, AppResult};
use crate::services::rul::{RulHistorySample, RulPrediction};
use crate::state::AppState;
use crate::store;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct RulResponse {
    battery_id: String,
    #[serde(flatten)]
    prediction: RulPrediction,
    degraded: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/batteries/{battery_id}/rul",
    tag = "rul",
    params(("battery_id" = String, Path, description = "Battery id")),
    responses(
        (status = 200, description = "RUL prediction; degraded=true when served from cache", body = RulResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Battery not found"),
        (status = 503, description = "RUL service unavailable and no cached prediction")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn battery_rul(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(_user): AuthUser,
    Path(battery_id): Path<String>,
) -> AppResult<Json<RulResponse>> {
    let battery_id = battery_id.trim().to_string();
    store::get_battery(&state.db, &battery_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::not_found(format!("Battery {battery_id} not found")))?;

    let since = Utc::now() - ChronoDuration::hours(24);
    let history_rows = store::recent_samples(
        &state.db,
        &battery_id,
        since,
        i64::from(state.config.rul_history_samples),
    )
    .await
    .map_err(map_db_error)?;
    let history: Vec<RulHistorySample> = history_rows
        .iter()
        .map(|row| RulHistorySample::new(row.ts, row))
        .collect();

    let outcome = state.rul.predict(&battery_id, &history).await?;

    // Fresh predictions feed the RUL alert kinds; cached ones do not, so a
    // stale value cannot flap alerts while the breaker is open.
    if !outcome.degraded {
        let locations = store::battery_locations(&state.db, std::slice::from_ref(&battery_id))
            .await
            .map_err(map_db_error)?;
        let location_id = locations.get(&battery_id).cloned().unwrap_or_default();
        if let Err(err) = state
            .evaluator
            .observe_rul(&battery_id, &location_id, outcome.prediction.rul_days)
            .await
        {
            tracing::error!(error = %err, battery_id, "RUL alert evaluation failed");
        }
    }

    Ok(Json(RulResponse {
        battery_id,
        prediction: outcome.prediction,
        degraded: outcome.degraded,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/batteries/{battery_id}/rul", get(battery_rul))
}
