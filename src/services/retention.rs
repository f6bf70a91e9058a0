use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::store;

/// Background sweep removing telemetry rows past the retention window.
/// Runs outside the ingest hot path.
#[derive(Debug, Clone)]
pub struct RetentionService {
    pool: PgPool,
    retention_days: u32,
    sweep_interval: Duration,
}

impl RetentionService {
    pub fn new(pool: PgPool, retention_days: u32, sweep_interval_seconds: u64) -> Self {
        Self {
            pool,
            retention_days: retention_days.max(1),
            sweep_interval: Duration::from_secs(sweep_interval_seconds.max(60)),
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now()
                            - ChronoDuration::days(i64::from(self.retention_days));
                        match store::delete_expired_telemetry(&self.pool, cutoff).await {
                            Ok(0) => {}
                            Ok(deleted) => {
                                tracing::info!(deleted, %cutoff, "retention sweep removed telemetry");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "retention sweep failed");
                            }
                        }
                    }
                }
            }
        });
    }
}
