pub mod alerts;
pub mod auth;
pub mod batteries;
pub mod health;
pub mod locations;
pub mod rul;
pub mod stream;
pub mod telemetry;
pub mod users;

use axum::Router;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;

/// Write deadline for REST requests; reads finish far earlier. The stream
/// route lives outside the layer because sessions are long-lived.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router(state: AppState) -> Router {
    let rest = Router::new()
        .merge(health::router())
        .merge(auth::router())
        .merge(users::router())
        .merge(locations::router())
        .merge(batteries::router())
        .merge(telemetry::router())
        .merge(alerts::router())
        .merge(rul::router())
        .merge(crate::openapi::router())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .nest("/api/v1", rest.merge(stream::router()))
        .with_state(state)
}

#[cfg(test)]
mod auth_gaps_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::OnceLock;
    use tower::ServiceExt;

    use crate::auth::Role;
    use crate::test_support;

    static STATE: OnceLock<AppState> = OnceLock::new();

    fn state() -> AppState {
        STATE.get_or_init(test_support::test_state).clone()
    }

    fn app() -> Router {
        router(state())
    }

    async fn status_of(request: Request<Body>) -> StatusCode {
        app().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn health_is_open() {
        let status = status_of(
            Request::builder()
                .uri("/api/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn batteries_require_bearer_auth() {
        let status = status_of(
            Request::builder()
                .uri("/api/v1/batteries")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn locations_require_bearer_auth() {
        let status = status_of(
            Request::builder()
                .uri("/api/v1/locations")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn alerts_require_bearer_auth() {
        let status = status_of(
            Request::builder()
                .uri("/api/v1/alerts")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn telemetry_ingest_requires_bearer_auth() {
        let status = status_of(
            Request::builder()
                .method("POST")
                .uri("/api/v1/telemetry")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"samples":[]}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn acknowledge_without_token_is_unauthorized() {
        let status = status_of(
            Request::builder()
                .method("POST")
                .uri("/api/v1/alerts/1/acknowledge")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn acknowledge_with_viewer_token_is_forbidden() {
        let token = test_support::token_for(&state(), Role::Viewer);
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/alerts/1/acknowledge")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["detail"], "Engineer access required");
    }

    #[tokio::test]
    async fn telemetry_ingest_with_viewer_token_is_forbidden() {
        let token = test_support::token_for(&state(), Role::Viewer);
        let status = status_of(
            Request::builder()
                .method("POST")
                .uri("/api/v1/telemetry")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"samples":[]}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn users_with_engineer_token_is_forbidden() {
        let token = test_support::token_for(&state(), Role::Engineer);
        let status = status_of(
            Request::builder()
                .uri("/api/v1/auth/users")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized_not_forbidden() {
        let status = status_of(
            Request::builder()
                .uri("/api/v1/batteries")
                .header("authorization", "Bearer not-a-real-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn error_envelope_is_detail_json() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/batteries")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["detail"], "Missing or invalid token");
    }
}
