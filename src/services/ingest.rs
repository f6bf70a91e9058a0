use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{map_db_conflict, AppError, AppResult};
use crate::services::evaluator::rules::{Severity, WindowSample};
use crate::services::evaluator::EvaluatorService;
use crate::services::hub::{Hub, StatusData, TelemetryData};
use crate::services::rate_limit::RateLimiter;
use crate::store::{self, NewSample};

/// Physical range gates. Samples outside these bounds are rejected, never
/// clamped; boundary values are accepted.
pub const VOLTAGE_RANGE_V: (f64, f64) = (0.0, 20.0);
pub const TEMPERATURE_RANGE_C: (f64, f64) = (-20.0, 80.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryStatus {
    Healthy,
    Warning,
    Critical,
}

impl BatteryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatteryStatus::Healthy => "healthy",
            BatteryStatus::Warning => "warning",
            BatteryStatus::Critical => "critical",
        }
    }
}

/// Derived status classification over the latest reading and the battery's
/// open alerts.
pub fn classify(soh_pct: f64, temperature_c: f64, open: Option<Severity>) -> BatteryStatus {
    if soh_pct < 80.0 || temperature_c > 45.0 || open == Some(Severity::Critical) {
        return BatteryStatus::Critical;
    }
    if soh_pct < 85.0 || temperature_c > 40.0 || open == Some(Severity::Warning) {
        return BatteryStatus::Warning;
    }
    BatteryStatus::Healthy
}

pub fn validate_sample(sample: &NewSample) -> Result<(), String> {
    let values = [
        ("voltage_v", sample.voltage_v),
        ("current_a", sample.current_a),
        ("temperature_c", sample.temperature_c),
        ("resistance_mohm", sample.resistance_mohm),
        ("soc_pct", sample.soc_pct),
        ("soh_pct", sample.soh_pct),
    ];
    for (field, value) in values {
        if !value.is_finite() {
            return Err(format!("{field} must be a finite number"));
        }
    }
    if !(VOLTAGE_RANGE_V.0..=VOLTAGE_RANGE_V.1).contains(&sample.voltage_v) {
        return Err(format!(
            "voltage_v {:.2} outside [{}, {}]",
            sample.voltage_v, VOLTAGE_RANGE_V.0, VOLTAGE_RANGE_V.1
        ));
    }
    if !(TEMPERATURE_RANGE_C.0..=TEMPERATURE_RANGE_C.1).contains(&sample.temperature_c) {
        return Err(format!(
            "temperature_c {:.1} outside [{}, {}]",
            sample.temperature_c, TEMPERATURE_RANGE_C.0, TEMPERATURE_RANGE_C.1
        ));
    }
    if sample.resistance_mohm < 0.0 {
        return Err(format!(
            "resistance_mohm {:.2} must be >= 0",
            sample.resistance_mohm
        ));
    }
    if !(0.0..=100.0).contains(&sample.soc_pct) {
        return Err(format!("soc_pct {:.1} outside [0, 100]", sample.soc_pct));
    }
    if !(0.0..=100.0).contains(&sample.soh_pct) {
        return Err(format!("soh_pct {:.1} outside [0, 100]", sample.soh_pct));
    }
    Ok(())
}

/// In-batch dedup: the last occurrence of a (battery, timestamp) pair wins,
/// keeping its arrival position.
pub fn dedup_last_wins(samples: Vec<NewSample>) -> Vec<NewSample> {
    let mut seen: HashSet<(String, DateTime<Utc>)> = HashSet::new();
    let mut kept: Vec<NewSample> = Vec::with_capacity(samples.len());
    for sample in samples.into_iter().rev() {
        if seen.insert((sample.battery_id.clone(), sample.ts)) {
            kept.push(sample);
        }
    }
    kept.reverse();
    kept
}

pub struct IngestService {
    db: PgPool,
    hub: Arc<Hub>,
    evaluator: Arc<EvaluatorService>,
    limiter: RateLimiter<Uuid>,
    last_status: Mutex<HashMap<String, BatteryStatus>>,
}

impl IngestService {
    pub fn new(
        db: PgPool,
        hub: Arc<Hub>,
        evaluator: Arc<EvaluatorService>,
        samples_per_minute: u32,
        burst: u32,
    ) -> Self {
        Self {
            db,
            hub,
            evaluator,
            limiter: RateLimiter::new(samples_per_minute, burst),
            last_status: Mutex::new(HashMap::new()),
        }
    }

    /// Full ingestion contract: rate gate, validation, in-batch dedup,
    /// single-transaction commit, evaluation, fan-out.
    pub async fn ingest_batch(&self, producer: Uuid, samples: Vec<NewSample>) -> AppResult<u64> {
        if samples.is_empty() {
            return Err(AppError::validation("Batch contains no samples"));
        }

        if let Err(wait) = self.limiter.try_acquire(&producer, samples.len() as u32) {
            return Err(AppError::rate_limited("Rate limit exceeded", wait));
        }

        for sample in &samples {
            if let Err(detail) = validate_sample(sample) {
                return Err(AppError::validation(format!(
                    "Invalid sample for battery {} at {}: {detail}",
                    sample.battery_id,
                    crate::time::to_iso(sample.ts)
                )));
            }
        }

        let samples = dedup_last_wins(samples);

        let battery_ids: Vec<String> = samples
            .iter()
            .map(|s| s.battery_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let locations = store::battery_locations(&self.db, &battery_ids)
            .await
            .map_err(crate::error::map_db_error)?;
        for battery_id in &battery_ids {
            if !locations.contains_key(battery_id) {
                return Err(AppError::not_found(format!(
                    "Battery {battery_id} not found"
                )));
            }
        }

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(crate::error::map_db_error)?;
        let inserted = store::insert_samples(&mut tx, &samples)
            .await
            .map_err(|err| map_db_conflict(err, "Duplicate telemetry sample"))?;
        tx.commit().await.map_err(crate::error::map_db_error)?;

        // Per-battery, samples flow through evaluation and fan-out in
        // timestamp order; cross-battery order is unspecified.
        let mut by_battery: BTreeMap<String, Vec<&NewSample>> = BTreeMap::new();
        for sample in &samples {
            by_battery
                .entry(sample.battery_id.clone())
                .or_default()
                .push(sample);
        }

        for (battery_id, mut rows) in by_battery {
            rows.sort_by_key(|s| s.ts);
            let location_id = locations
                .get(&battery_id)
                .cloned()
                .unwrap_or_default();
            for sample in rows {
                let window_sample = WindowSample {
                    ts: sample.ts,
                    voltage_v: sample.voltage_v,
                    temperature_c: sample.temperature_c,
                    resistance_mohm: sample.resistance_mohm,
                    soc_pct: sample.soc_pct,
                    soh_pct: sample.soh_pct,
                };
                if let Err(err) = self
                    .evaluator
                    .process_sample(&battery_id, &location_id, window_sample)
                    .await
                {
                    tracing::error!(
                        error = %err,
                        battery_id,
                        "alert evaluation failed for committed sample"
                    );
                }

                self.hub.publish_telemetry(
                    &battery_id,
                    &location_id,
                    sample.ts,
                    TelemetryData {
                        voltage_v: sample.voltage_v,
                        current_a: sample.current_a,
                        temperature_c: sample.temperature_c,
                        resistance_mohm: sample.resistance_mohm,
                        soc_pct: sample.soc_pct,
                        soh_pct: sample.soh_pct,
                    },
                );

                let open = self.evaluator.open_severity(&battery_id).await;
                let status = classify(sample.soh_pct, sample.temperature_c, open);
                let changed = {
                    let mut last = self.last_status.lock().await;
                    let changed = last.get(&battery_id).copied() != Some(status);
                    last.insert(battery_id.clone(), status);
                    changed
                };
                if changed {
                    self.hub.publish_status(
                        &battery_id,
                        &location_id,
                        sample.ts,
                        StatusData {
                            status: status.as_str().to_string(),
                            soh_pct: sample.soh_pct,
                            temperature_c: sample.temperature_c,
                        },
                    );
                }
            }
        }

        self.limiter.prune_full();
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(battery: &str, second: u32) -> NewSample {
        NewSample {
            battery_id: battery.to_string(),
            ts: Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, second).unwrap(),
            voltage_v: 13.2,
            current_a: -1.5,
            temperature_c: 25.0,
            resistance_mohm: 5.0,
            soc_pct: 95.0,
            soh_pct: 98.0,
        }
    }

    #[test]
    fn boundary_values_pass_the_gates() {
        let mut s = sample("BAT-1", 0);
        s.soh_pct = 100.0;
        s.soc_pct = 0.0;
        s.temperature_c = 80.0;
        assert!(validate_sample(&s).is_ok());

        s.temperature_c = -20.0;
        s.voltage_v = 0.0;
        s.resistance_mohm = 0.0;
        assert!(validate_sample(&s).is_ok());
    }

    #[test]
    fn out_of_range_values_are_rejected_not_clamped() {
        let mut s = sample("BAT-1", 0);
        s.temperature_c = 80.1;
        assert!(validate_sample(&s).unwrap_err().contains("temperature_c"));

        let mut s = sample("BAT-1", 0);
        s.voltage_v = 20.5;
        assert!(validate_sample(&s).unwrap_err().contains("voltage_v"));

        let mut s = sample("BAT-1", 0);
        s.soh_pct = 100.5;
        assert!(validate_sample(&s).unwrap_err().contains("soh_pct"));

        let mut s = sample("BAT-1", 0);
        s.resistance_mohm = -0.1;
        assert!(validate_sample(&s).unwrap_err().contains("resistance_mohm"));

        let mut s = sample("BAT-1", 0);
        s.current_a = f64::NAN;
        assert!(validate_sample(&s).unwrap_err().contains("current_a"));
    }

    #[test]
    fn dedup_keeps_the_last_occurrence() {
        let mut first = sample("BAT-1", 0);
        first.voltage_v = 13.0;
        let mut second = sample("BAT-1", 0);
        second.voltage_v = 13.9;
        let other = sample("BAT-2", 0);

        let kept = dedup_last_wins(vec![first, other, second]);
        assert_eq!(kept.len(), 2);
        let bat1 = kept.iter().find(|s| s.battery_id == "BAT-1").unwrap();
        assert_eq!(bat1.voltage_v, 13.9);
    }

    #[test]
    fn classification_matches_the_contract() {
        assert_eq!(classify(90.0, 25.0, None), BatteryStatus::Healthy);
        assert_eq!(classify(85.0, 40.0, None), BatteryStatus::Healthy);
        assert_eq!(classify(84.9, 25.0, None), BatteryStatus::Warning);
        assert_eq!(classify(90.0, 40.1, None), BatteryStatus::Warning);
        assert_eq!(
            classify(90.0, 25.0, Some(Severity::Warning)),
            BatteryStatus::Warning
        );
        assert_eq!(classify(79.9, 25.0, None), BatteryStatus::Critical);
        assert_eq!(classify(90.0, 45.1, None), BatteryStatus::Critical);
        assert_eq!(
            classify(90.0, 25.0, Some(Severity::Critical)),
            BatteryStatus::Critical
        );
    }
}
