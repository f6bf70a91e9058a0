use axum::routing::get;
use axum::{Json, Router};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::state::AppState;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "HTTPBearer",
                SecurityScheme::Http(
                    HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health,
        crate::routes::health::ready,
        crate::routes::auth::login,
        crate::routes::auth::refresh,
        crate::routes::auth::logout,
        crate::routes::auth::me,
        crate::routes::auth::change_password,
        crate::routes::users::list_users,
        crate::routes::users::create_user,
        crate::routes::users::patch_user,
        crate::routes::users::delete_user,
        crate::routes::locations::list_locations,
        crate::routes::locations::get_location,
        crate::routes::locations::location_batteries,
        crate::routes::locations::create_location,
        crate::routes::locations::create_system,
        crate::routes::locations::create_string,
        crate::routes::batteries::list_batteries,
        crate::routes::batteries::get_battery,
        crate::routes::batteries::battery_telemetry,
        crate::routes::batteries::create_battery,
        crate::routes::batteries::patch_battery_status,
        crate::routes::telemetry::ingest_telemetry,
        crate::routes::alerts::list_alerts,
        crate::routes::alerts::alert_stats,
        crate::routes::alerts::acknowledge_alert,
        crate::routes::alerts::resolve_alert,
        crate::routes::rul::battery_rul,
    ),
    components(schemas(
        crate::error::ErrorDetail,
        crate::auth::Role,
        crate::routes::auth::LoginRequest,
        crate::routes::auth::LoginResponse,
        crate::routes::auth::RefreshRequest,
        crate::routes::auth::RefreshResponse,
        crate::routes::auth::MessageResponse,
        crate::routes::auth::ChangePasswordRequest,
        crate::routes::auth::UserResponse,
        crate::routes::users::UserCreateRequest,
        crate::routes::users::UserPatchRequest,
        crate::routes::locations::LocationResponse,
        crate::routes::locations::LocationStatsResponse,
        crate::routes::locations::LocationCreateRequest,
        crate::routes::locations::SystemCreateRequest,
        crate::routes::locations::StringCreateRequest,
        crate::routes::locations::CreatedResponse,
        crate::routes::batteries::TelemetryPoint,
        crate::routes::batteries::BatterySummary,
        crate::routes::batteries::BatteryDetailResponse,
        crate::routes::batteries::BatteryCreateRequest,
        crate::routes::batteries::BatteryStatusRequest,
        crate::routes::telemetry::SampleIn,
        crate::routes::telemetry::IngestRequest,
        crate::routes::telemetry::IngestResponse,
        crate::routes::alerts::AlertResponse,
        crate::routes::alerts::AlertStatsResponse,
        crate::routes::alerts::AcknowledgeRequest,
        crate::routes::rul::RulResponse,
        crate::services::rul::RulPrediction,
        crate::routes::health::HealthResponse,
        crate::routes::health::NotReadyResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Authentication and session tokens"),
        (name = "users", description = "User administration"),
        (name = "locations", description = "Sites and master data"),
        (name = "batteries", description = "Batteries and telemetry reads"),
        (name = "telemetry", description = "Producer ingestion"),
        (name = "alerts", description = "Alert lifecycle"),
        (name = "rul", description = "Remaining-useful-life proxy"),
        (name = "health", description = "Liveness and readiness"),
    )
)]
struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_default()
}

pub(crate) async fn serve_openapi() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(serve_openapi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_contains_core_paths() {
        let doc = openapi_json();
        let paths = doc.get("paths").and_then(|p| p.as_object()).unwrap();
        assert!(paths.contains_key("/api/v1/auth/login"));
        assert!(paths.contains_key("/api/v1/telemetry"));
        assert!(paths.contains_key("/api/v1/alerts/{alert_id}/acknowledge"));
        assert!(paths.contains_key("/api/v1/batteries/{battery_id}/rul"));
    }
}
