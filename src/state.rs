use crate::auth::tokens::TokenSigner;
use crate::config::FleetConfig;
use crate::services::evaluator::EvaluatorService;
use crate::services::hub::Hub;
use crate::services::ingest::IngestService;
use crate::services::rate_limit::RateLimiter;
use crate::services::rul::RulClient;
use axum::extract::FromRef;
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: FleetConfig,
    pub db: PgPool,
    pub tokens: Arc<TokenSigner>,
    pub hub: Arc<Hub>,
    pub evaluator: Arc<EvaluatorService>,
    pub ingest: Arc<IngestService>,
    pub rul: Arc<RulClient>,
    pub login_limiter: Arc<RateLimiter<String>>,
    pub http: Client,
    pub shutdown: CancellationToken,
}

impl FromRef<AppState> for Arc<TokenSigner> {
    fn from_ref(state: &AppState) -> Arc<TokenSigner> {
        state.tokens.clone()
    }
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
