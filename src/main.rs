use anyhow::{Context, Result};
use clap::Parser;
use fleet_server_rs::auth::tokens::TokenSigner;
use fleet_server_rs::services::evaluator::EvaluatorService;
use fleet_server_rs::services::hub::Hub;
use fleet_server_rs::services::ingest::IngestService;
use fleet_server_rs::services::rate_limit::RateLimiter;
use fleet_server_rs::services::retention::RetentionService;
use fleet_server_rs::services::rul::RulClient;
use fleet_server_rs::{cli, config, db, openapi, routes, state};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::CorsLayer;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind fleet-server-rs listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind fleet-server-rs listener on {addr}"))
        }
    }
}

/// First-boot convenience: creates the initial admin when the users table is
/// empty and the operator explicitly provided a bootstrap password.
async fn seed_admin(pool: &PgPool, password: &str) -> Result<()> {
    let users_exist: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users)")
        .fetch_one(pool)
        .await?;
    if users_exist {
        return Ok(());
    }
    let password_hash = fleet_server_rs::auth::hash_password(password)?;
    sqlx::query(
        r#"
        INSERT INTO users (username, email, password_hash, role)
        VALUES ('admin', 'admin@localhost', $1, 'admin')
        ON CONFLICT (username) DO NOTHING
        "#,
    )
    .bind(password_hash)
    .execute(pool)
    .await?;
    tracing::info!("seeded initial admin user");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::FleetConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url, config.db_max_connections)?;

    if let Err(err) = db::ensure_schema(&pool).await {
        tracing::warn!("schema bootstrap failed (database down?): {err:#}");
    }
    if let Some(password) = config.bootstrap_admin_password.as_deref() {
        if let Err(err) = seed_admin(&pool, password).await {
            tracing::warn!("failed to seed initial admin: {err:#}");
        }
    }

    let cancel = CancellationToken::new();
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
    if let Err(err) = evaluator.restore().await {
        tracing::warn!("failed to restore evaluator windows: {err:#}");
    }
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

    RetentionService::new(
        pool.clone(),
        config.retention_days,
        config.retention_sweep_interval_seconds,
    )
    .start(cancel.clone());

    let state = state::AppState {
        config,
        db: pool,
        tokens,
        hub,
        evaluator,
        ingest,
        rul,
        login_limiter,
        http,
        shutdown: cancel.clone(),
    };

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(60)
            .methods(vec![
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::PATCH,
                axum::http::Method::DELETE,
            ])
            .use_headers()
            .finish()
            .context("failed to build rate limiter config")?,
    );

    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    let app = routes::router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(CorsLayer::permissive());
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "fleet-server-rs listening");

    let drain = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining");
        drain.cancel();
    })
    .await?;
    cancel.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        if err
            .to_string()
            .to_lowercase()
            .contains("operation not permitted")
        {
            // Sandbox environments can block binding attempts; skip assertions in that case.
            return Ok(());
        }
        let message = err.to_string().to_lowercase();

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
