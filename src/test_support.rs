use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::tokens::{TokenKind, TokenSigner};
use crate::auth::Role;
use crate::config::FleetConfig;
use crate::db;
use crate::services::evaluator::rules::Thresholds;
use crate::services::evaluator::EvaluatorService;
use crate::services::hub::Hub;
use crate::services::ingest::IngestService;
use crate::services::rate_limit::RateLimiter;
use crate::services::rul::RulClient;
use crate::state::AppState;

pub fn test_config() -> FleetConfig {
    FleetConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        db_max_connections: 2,
        token_secret: "test-secret-test-secret-test-secret!".to_string(),
        access_token_minutes: 30,
        refresh_token_days: 7,
        login_attempts_per_minute: 5,
        producer_samples_per_minute: 100,
        producer_burst: 120,
        retention_days: 730,
        retention_sweep_interval_seconds: 3600,
        rul_url: None,
        rul_timeout_ms: 500,
        rul_failure_threshold: 3,
        rul_cooldown_seconds: 30,
        rul_history_samples: 288,
        subscriber_idle_timeout_seconds: 60,
        bootstrap_admin_password: None,
        thresholds: Thresholds::default(),
    }
}

/// State backed by a lazy pool: nothing connects until a query runs, so
/// auth/role-gate tests never touch a database.
pub fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url, config.db_max_connections)
        .expect("connect_lazy");
    let tokens = Arc::new(TokenSigner::new(
        &config.token_secret,
        config.access_token_minutes,
        config.refresh_token_days,
    ));
    let hub = Arc::new(Hub::new());
    let evaluator = Arc::new(EvaluatorService::new(
        pool.clone(),
        hub.clone(),
        config.thresholds.clone(),
    ));
    let ingest = Arc::new(IngestService::new(
        pool.clone(),
        hub.clone(),
        evaluator.clone(),
        config.producer_samples_per_minute,
        config.producer_burst,
    ));
    let http = reqwest::Client::new();
    let rul = Arc::new(RulClient::new(
        http.clone(),
        config.rul_url.clone(),
        config.rul_timeout_ms,
        config.rul_failure_threshold,
        config.rul_cooldown_seconds,
    ));
    let login_limiter = Arc::new(RateLimiter::new(
        config.login_attempts_per_minute,
        config.login_attempts_per_minute,
    ));

    AppState {
        config,
        db: pool,
        tokens,
        hub,
        evaluator,
        ingest,
        rul,
        login_limiter,
        http,
        shutdown: CancellationToken::new(),
    }
}

pub fn token_for(state: &AppState, role: Role) -> String {
    state
        .tokens
        .issue(Uuid::new_v4(), "test-user", role, TokenKind::Access)
}
