pub mod rules;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::services::hub::Hub;
use crate::store;
use rules::{AlertKind, BatteryWindow, Severity, Thresholds, Transition, WindowSample};

/// Stateful alert engine. Owns one rolling window per battery; windows are
/// only ever touched here, and samples for a battery arrive in commit order.
pub struct EvaluatorService {
    db: PgPool,
    hub: Arc<Hub>,
    thresholds: Thresholds,
    state: Mutex<HashMap<String, BatteryWindow>>,
}

impl EvaluatorService {
    pub fn new(db: PgPool, hub: Arc<Hub>, thresholds: Thresholds) -> Self {
        Self {
            db,
            hub,
            thresholds,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Rebuilds in-memory windows for every battery with at least one open
    /// alert so multi-sample close conditions survive restarts.
    pub async fn restore(&self) -> Result<()> {
        let open = store::open_alerts(&self.db).await?;
        if open.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let since = Utc::now() - ChronoDuration::hours(rules::WINDOW_MAX_HOURS);
        let mut restored_batteries = 0usize;
        for alert in &open {
            let window = state.entry(alert.battery_id.clone()).or_insert_with(|| {
                restored_batteries += 1;
                BatteryWindow::new()
            });
            let Some(kind) = AlertKind::parse(&alert.kind) else {
                tracing::warn!(alert_id = alert.id, kind = %alert.kind, "unknown alert kind in store");
                continue;
            };
            let severity = match alert.severity.as_str() {
                "critical" => Severity::Critical,
                "info" => Severity::Info,
                _ => Severity::Warning,
            };
            window.mark_open(kind, severity);
        }

        let battery_ids: Vec<String> = state.keys().cloned().collect();
        for battery_id in battery_ids {
            let samples = store::recent_samples(
                &self.db,
                &battery_id,
                since,
                rules::WINDOW_MAX_SAMPLES as i64,
            )
            .await?;
            if let Some(window) = state.get_mut(&battery_id) {
                for row in samples {
                    window.push_history(WindowSample {
                        ts: row.ts,
                        voltage_v: row.voltage_v,
                        temperature_c: row.temperature_c,
                        resistance_mohm: row.resistance_mohm,
                        soc_pct: row.soc_pct,
                        soh_pct: row.soh_pct,
                    });
                }
            }
        }

        tracing::info!(
            open_alerts = open.len(),
            batteries = restored_batteries,
            "restored evaluator windows"
        );
        Ok(())
    }

    /// Feeds one committed sample through the per-battery state machine and
    /// persists/emits whatever transitions it produces.
    pub async fn process_sample(
        &self,
        battery_id: &str,
        location_id: &str,
        sample: WindowSample,
    ) -> Result<()> {
        let transitions = {
            let mut state = self.state.lock().await;
            let window = state
                .entry(battery_id.to_string())
                .or_insert_with(BatteryWindow::new);
            window.evaluate_sample(&self.thresholds, sample)
        };
        self.apply_transitions(battery_id, location_id, sample.ts, &transitions)
            .await
    }

    /// Feeds a fresh RUL prediction (days) for a battery.
    pub async fn observe_rul(
        &self,
        battery_id: &str,
        location_id: &str,
        rul_days: f64,
    ) -> Result<()> {
        let transitions = {
            let mut state = self.state.lock().await;
            let window = state
                .entry(battery_id.to_string())
                .or_insert_with(BatteryWindow::new);
            window.evaluate_rul(&self.thresholds, rul_days, battery_id)
        };
        self.apply_transitions(battery_id, location_id, Utc::now(), &transitions)
            .await
    }

    /// Highest severity among this battery's open alerts, for status
    /// classification.
    pub async fn open_severity(&self, battery_id: &str) -> Option<Severity> {
        let state = self.state.lock().await;
        state.get(battery_id).and_then(|w| w.max_open_severity())
    }

    /// Sync hook: a user resolved an alert through the API, so the window
    /// must forget it or the next matching sample could never re-open it.
    pub async fn mark_resolved(&self, battery_id: &str, kind: &str) {
        if let Some(kind) = AlertKind::parse(kind) {
            let mut state = self.state.lock().await;
            if let Some(window) = state.get_mut(battery_id) {
                window.mark_resolved(kind);
            }
        }
    }

    async fn apply_transitions(
        &self,
        battery_id: &str,
        location_id: &str,
        ts: DateTime<Utc>,
        transitions: &[Transition],
    ) -> Result<()> {
        for transition in transitions {
            match transition {
                Transition::Open {
                    kind,
                    severity,
                    message,
                    threshold,
                    observed,
                } => {
                    let inserted: Result<(i64,), sqlx::Error> = sqlx::query_as(
                        r#"
                        INSERT INTO alerts (battery_id, kind, severity, message, threshold, observed, triggered_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        RETURNING id
                        "#,
                    )
                    .bind(battery_id)
                    .bind(kind.as_str())
                    .bind(severity.as_str())
                    .bind(message)
                    .bind(threshold)
                    .bind(observed)
                    .bind(ts)
                    .fetch_one(&self.db)
                    .await;

                    match inserted {
                        Ok((alert_id,)) => {
                            tracing::info!(
                                battery_id,
                                kind = kind.as_str(),
                                severity = severity.as_str(),
                                alert_id,
                                "alert opened"
                            );
                            self.hub.publish_alert(
                                alert_id,
                                battery_id,
                                location_id,
                                kind.as_str(),
                                severity.as_str(),
                                message,
                                false,
                                ts,
                            );
                        }
                        Err(err) => {
                            if is_unique_violation(&err) {
                                // One open alert per (battery, kind) is an
                                // engine invariant; reaching the index means
                                // window state and store disagree.
                                tracing::error!(
                                    battery_id,
                                    kind = kind.as_str(),
                                    "duplicate open alert refused by store"
                                );
                            } else {
                                return Err(err.into());
                            }
                        }
                    }
                }
                Transition::Close { kind, observed } => {
                    let closed: Option<(i64, String, String)> = sqlx::query_as(
                        r#"
                        UPDATE alerts
                        SET resolved_at = $3, observed = $4
                        WHERE battery_id = $1 AND kind = $2 AND resolved_at IS NULL
                        RETURNING id, severity, message
                        "#,
                    )
                    .bind(battery_id)
                    .bind(kind.as_str())
                    .bind(ts)
                    .bind(observed)
                    .fetch_optional(&self.db)
                    .await?;

                    if let Some((alert_id, severity, message)) = closed {
                        tracing::info!(
                            battery_id,
                            kind = kind.as_str(),
                            alert_id,
                            "alert resolved"
                        );
                        self.hub.publish_alert(
                            alert_id,
                            battery_id,
                            location_id,
                            kind.as_str(),
                            &severity,
                            &message,
                            true,
                            ts,
                        );
                    }
                }
                Transition::Escalate {
                    kind,
                    severity,
                    message,
                    observed,
                } => {
                    let escalated: Option<(i64,)> = sqlx::query_as(
                        r#"
                        UPDATE alerts
                        SET severity = $3, message = $4, observed = $5
                        WHERE battery_id = $1 AND kind = $2 AND resolved_at IS NULL
                        RETURNING id
                        "#,
                    )
                    .bind(battery_id)
                    .bind(kind.as_str())
                    .bind(severity.as_str())
                    .bind(message)
                    .bind(observed)
                    .fetch_optional(&self.db)
                    .await?;

                    if let Some((alert_id,)) = escalated {
                        tracing::warn!(
                            battery_id,
                            kind = kind.as_str(),
                            severity = severity.as_str(),
                            alert_id,
                            "alert escalated"
                        );
                        self.hub.publish_alert(
                            alert_id,
                            battery_id,
                            location_id,
                            kind.as_str(),
                            severity.as_str(),
                            message,
                            false,
                            ts,
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}
