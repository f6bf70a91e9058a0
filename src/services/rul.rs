use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{AppError, AppResult};
use crate::time::to_iso;

/// Response contract of the external inference service. Any other shape is
/// treated as a breaker failure.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RulPrediction {
    pub rul_days: f64,
    pub confidence: f64,
    pub risk_level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulHistorySample {
    pub timestamp: String,
    pub voltage_v: f64,
    pub current_a: f64,
    pub temperature_c: f64,
    pub resistance_mohm: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
}

impl RulHistorySample {
    pub fn new(ts: DateTime<Utc>, row: &crate::store::SampleRow) -> Self {
        Self {
            timestamp: to_iso(ts),
            voltage_v: row.voltage_v,
            current_a: row.current_a,
            temperature_c: row.temperature_c,
            resistance_mohm: row.resistance_mohm,
            soc_pct: row.soc_pct,
            soh_pct: row.soh_pct,
        }
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    battery_id: &'a str,
    history: &'a [RulHistorySample],
}

#[derive(Debug, Clone)]
pub struct RulOutcome {
    pub prediction: RulPrediction,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Circuit breaker: opens after `threshold` consecutive failures, fails fast
/// for `cooldown`, then lets exactly one probe through.
#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    threshold: u32,
    cooldown: Duration,
}

impl Breaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } => {
                if now >= until {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight.
            BreakerState::HalfOpen => false,
        }
    }

    fn on_success(&mut self) {
        self.state = BreakerState::Closed { failures: 0 };
    }

    fn on_failure(&mut self, now: Instant) {
        self.state = match self.state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    BreakerState::Open {
                        until: now + self.cooldown,
                    }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            BreakerState::HalfOpen | BreakerState::Open { .. } => BreakerState::Open {
                until: now + self.cooldown,
            },
        };
    }
}

pub struct RulClient {
    http: reqwest::Client,
    url: Option<String>,
    timeout: Duration,
    breaker: Mutex<Breaker>,
    cache: Mutex<HashMap<String, RulPrediction>>,
}

impl RulClient {
    pub fn new(
        http: reqwest::Client,
        url: Option<String>,
        timeout_ms: u64,
        failure_threshold: u32,
        cooldown_seconds: u64,
    ) -> Self {
        Self {
            http,
            url,
            timeout: Duration::from_millis(timeout_ms),
            breaker: Mutex::new(Breaker::new(
                failure_threshold,
                Duration::from_secs(cooldown_seconds),
            )),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn predict(
        &self,
        battery_id: &str,
        history: &[RulHistorySample],
    ) -> AppResult<RulOutcome> {
        let Some(url) = self.url.as_deref() else {
            return Err(AppError::unavailable("RUL service is not configured"));
        };

        let allowed = {
            let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
            breaker.allow(Instant::now())
        };
        if !allowed {
            return self.cached_or_unavailable(battery_id);
        }

        match self.call(url, battery_id, history).await {
            Ok(prediction) => {
                {
                    let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
                    breaker.on_success();
                }
                self.cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(battery_id.to_string(), prediction.clone());
                Ok(RulOutcome {
                    prediction,
                    degraded: false,
                })
            }
            Err(err) => {
                tracing::warn!(error = %err, battery_id, "RUL prediction call failed");
                {
                    let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
                    breaker.on_failure(Instant::now());
                }
                self.cached_or_unavailable(battery_id)
            }
        }
    }

    fn cached_or_unavailable(&self, battery_id: &str) -> AppResult<RulOutcome> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(battery_id) {
            Some(prediction) => Ok(RulOutcome {
                prediction: prediction.clone(),
                degraded: true,
            }),
            None => Err(AppError::unavailable("RUL service unavailable")),
        }
    }

    async fn call(
        &self,
        url: &str,
        battery_id: &str,
        history: &[RulHistorySample],
    ) -> anyhow::Result<RulPrediction> {
        let endpoint = format!("{}/predict", url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&PredictRequest {
                battery_id,
                history,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("RUL service returned {status}");
        }
        let prediction: RulPrediction = response.json().await?;
        if !prediction.rul_days.is_finite() || prediction.rul_days < 0.0 {
            anyhow::bail!("RUL service returned invalid rul_days");
        }
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_consecutive_failures() {
        let mut breaker = Breaker::new(3, Duration::from_secs(30));
        let now = Instant::now();

        for _ in 0..2 {
            assert!(breaker.allow(now));
            breaker.on_failure(now);
        }
        assert!(breaker.allow(now));
        breaker.on_failure(now);

        assert!(!breaker.allow(now), "third failure opens the breaker");
    }

    #[test]
    fn success_resets_the_failure_count() {
        let mut breaker = Breaker::new(3, Duration::from_secs(30));
        let now = Instant::now();

        breaker.on_failure(now);
        breaker.on_failure(now);
        breaker.on_success();
        breaker.on_failure(now);
        assert!(breaker.allow(now), "count restarted after success");
    }

    #[test]
    fn open_breaker_half_opens_after_cooldown_with_single_probe() {
        let mut breaker = Breaker::new(1, Duration::from_millis(10));
        let now = Instant::now();
        breaker.on_failure(now);
        assert!(!breaker.allow(now));

        let later = now + Duration::from_millis(11);
        assert!(breaker.allow(later), "cooldown expired, probe allowed");
        assert!(!breaker.allow(later), "only one probe in flight");

        breaker.on_success();
        assert!(breaker.allow(later));
    }

    #[test]
    fn failed_probe_reopens() {
        let mut breaker = Breaker::new(1, Duration::from_millis(10));
        let now = Instant::now();
        breaker.on_failure(now);

        let later = now + Duration::from_millis(11);
        assert!(breaker.allow(later));
        breaker.on_failure(later);
        assert!(!breaker.allow(later + Duration::from_millis(5)));
        assert!(breaker.allow(later + Duration::from_millis(11)));
    }
}
