use axum::routing::post;
use axum::{Json, Router};

use crate::auth::{require_engineer, AuthUser};
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::NewSample;
use crate::time::parse_ts;

/// One producer reading on the wire. Unknown fields are rejected so schema
/// drift between producers and the service surfaces immediately.
#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct SampleIn {
    battery_id: String,
    timestamp: String,
    voltage_v: f64,
    current_a: f64,
    temperature_c: f64,
    resistance_mohm: f64,
    soc_pct: f64,
    soh_pct: f64,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct IngestRequest {
    samples: Vec<SampleIn>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct IngestResponse {
    accepted: u64,
}

#[utoipa::path(
    post,
    path = "/api/v1/telemetry",
    tag = "telemetry",
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Batch committed", body = IngestResponse),
        (status = 400, description = "A sample failed the range gates"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Unknown battery"),
        (status = 409, description = "Duplicate (battery, timestamp) sample"),
        (status = 429, description = "Producer rate limit exceeded")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn ingest_telemetry(
    axum::extract::State(state): axum::extract::State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<IngestRequest>,
) -> AppResult<Json<IngestResponse>> {
    require_engineer(&user)?;

    let mut samples = Vec::with_capacity(payload.samples.len());
    for sample in payload.samples {
        samples.push(NewSample {
            battery_id: sample.battery_id.trim().to_string(),
            ts: parse_ts(&sample.timestamp)?,
            voltage_v: sample.voltage_v,
            current_a: sample.current_a,
            temperature_c: sample.temperature_c,
            resistance_mohm: sample.resistance_mohm,
            soc_pct: sample.soc_pct,
            soh_pct: sample.soh_pct,
        });
    }

    let accepted = state.ingest.ingest_batch(user.id, samples).await?;
    Ok(Json(IngestResponse { accepted }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/telemetry", post(ingest_telemetry))
}
