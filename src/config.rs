use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::services::evaluator::rules::Thresholds;

const DEFAULT_CONFIG_PATH: &str = "/etc/fleet-server/config.json";

pub(crate) fn config_file_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLEET_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// Optional JSON override file. Environment variables win; the file fills
/// gaps for installs that keep secrets out of the process environment.
#[derive(Debug, Clone, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    token_secret: Option<String>,
    #[serde(default)]
    rul_url: Option<String>,
    #[serde(default)]
    retention_days: Option<u32>,
}

fn load_config_overrides() -> Option<ConfigOverrides> {
    let path = config_file_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config file; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse config file; using env defaults"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub token_secret: String,
    pub access_token_minutes: i64,
    pub refresh_token_days: i64,
    pub login_attempts_per_minute: u32,
    pub producer_samples_per_minute: u32,
    pub producer_burst: u32,
    pub retention_days: u32,
    pub retention_sweep_interval_seconds: u64,
    pub rul_url: Option<String>,
    pub rul_timeout_ms: u64,
    pub rul_failure_threshold: u32,
    pub rul_cooldown_seconds: u64,
    pub rul_history_samples: u32,
    pub subscriber_idle_timeout_seconds: u64,
    pub bootstrap_admin_password: Option<String>,
    pub thresholds: Thresholds,
}

impl FleetConfig {
    pub fn from_env() -> Result<Self> {
        let overrides = load_config_overrides();

        let database_url = std::env::var("FLEET_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("FLEET_DATABASE_URL must be set (or database_url in the config file)")?;

        let token_secret = std::env::var("FLEET_TOKEN_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| ov.token_secret.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("FLEET_TOKEN_SECRET must be set (or token_secret in the config file)")?;
        if token_secret.len() < 32 {
            anyhow::bail!("FLEET_TOKEN_SECRET must be at least 32 characters");
        }

        let retention_days = std::env::var("FLEET_RETENTION_DAYS")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .or_else(|| overrides.as_ref().and_then(|ov| ov.retention_days))
            .unwrap_or(730)
            .max(1);

        let rul_url = env_optional_string("FLEET_RUL_URL").or_else(|| {
            overrides
                .as_ref()
                .and_then(|ov| ov.rul_url.as_deref())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
        });

        Ok(Self {
            database_url,
            db_max_connections: env_u32("FLEET_DB_MAX_CONNECTIONS", 20).clamp(1, 100),
            token_secret,
            access_token_minutes: env_u64("FLEET_ACCESS_TOKEN_MINUTES", 30).clamp(1, 24 * 60)
                as i64,
            refresh_token_days: env_u64("FLEET_REFRESH_TOKEN_DAYS", 7).clamp(1, 90) as i64,
            login_attempts_per_minute: env_u32("FLEET_LOGIN_ATTEMPTS_PER_MINUTE", 5).max(1),
            producer_samples_per_minute: env_u32("FLEET_PRODUCER_SAMPLES_PER_MINUTE", 100).max(1),
            producer_burst: env_u32("FLEET_PRODUCER_BURST", 120).max(1),
            retention_days,
            retention_sweep_interval_seconds: env_u64("FLEET_RETENTION_SWEEP_INTERVAL_SECONDS", 3600)
                .clamp(60, 24 * 3600),
            rul_url,
            rul_timeout_ms: env_u64("FLEET_RUL_TIMEOUT_MS", 2000).clamp(100, 30_000),
            rul_failure_threshold: env_u32("FLEET_RUL_FAILURE_THRESHOLD", 3).max(1),
            rul_cooldown_seconds: env_u64("FLEET_RUL_COOLDOWN_SECONDS", 30).clamp(1, 3600),
            rul_history_samples: env_u32("FLEET_RUL_HISTORY_SAMPLES", 288).clamp(1, 10_000),
            subscriber_idle_timeout_seconds: env_u64("FLEET_SUBSCRIBER_IDLE_TIMEOUT_SECONDS", 60)
                .clamp(5, 3600),
            bootstrap_admin_password: env_optional_string("FLEET_BOOTSTRAP_ADMIN_PASSWORD"),
            thresholds: thresholds_from_env(),
        })
    }
}

fn thresholds_from_env() -> Thresholds {
    let defaults = Thresholds::default();
    Thresholds {
        voltage_high_v: env_f64("FLEET_VOLTAGE_HIGH_V", defaults.voltage_high_v),
        voltage_low_v: env_f64("FLEET_VOLTAGE_LOW_V", defaults.voltage_low_v),
        voltage_hysteresis_v: env_f64("FLEET_VOLTAGE_HYSTERESIS_V", defaults.voltage_hysteresis_v),
        temperature_high_c: env_f64("FLEET_TEMPERATURE_HIGH_C", defaults.temperature_high_c),
        temperature_clear_c: env_f64("FLEET_TEMPERATURE_CLEAR_C", defaults.temperature_clear_c),
        temperature_critical_c: env_f64(
            "FLEET_TEMPERATURE_CRITICAL_C",
            defaults.temperature_critical_c,
        ),
        resistance_drift_ratio: env_f64(
            "FLEET_RESISTANCE_DRIFT_RATIO",
            defaults.resistance_drift_ratio,
        ),
        resistance_clear_ratio: env_f64(
            "FLEET_RESISTANCE_CLEAR_RATIO",
            defaults.resistance_clear_ratio,
        ),
        resistance_window_minutes: env_u64(
            "FLEET_RESISTANCE_WINDOW_MINUTES",
            defaults.resistance_window_minutes,
        ),
        soh_warning_pct: env_f64("FLEET_SOH_WARNING_PCT", defaults.soh_warning_pct),
        soh_clear_pct: env_f64("FLEET_SOH_CLEAR_PCT", defaults.soh_clear_pct),
        soh_critical_pct: env_f64("FLEET_SOH_CRITICAL_PCT", defaults.soh_critical_pct),
        soh_clear_hold_hours: env_u64("FLEET_SOH_CLEAR_HOLD_HOURS", defaults.soh_clear_hold_hours),
        rul_warning_days: env_f64("FLEET_RUL_WARNING_DAYS", defaults.rul_warning_days),
        rul_critical_days: env_f64("FLEET_RUL_CRITICAL_DAYS", defaults.rul_critical_days),
    }
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_helpers_fall_back_on_missing_or_invalid() {
        std::env::remove_var("FLEET_TEST_U32");
        assert_eq!(env_u32("FLEET_TEST_U32", 7), 7);

        std::env::set_var("FLEET_TEST_U32", "not-a-number");
        assert_eq!(env_u32("FLEET_TEST_U32", 7), 7);

        std::env::set_var("FLEET_TEST_U32", " 42 ");
        assert_eq!(env_u32("FLEET_TEST_U32", 7), 42);
        std::env::remove_var("FLEET_TEST_U32");
    }

    #[test]
    fn env_f64_rejects_non_finite() {
        std::env::set_var("FLEET_TEST_F64", "NaN");
        assert_eq!(env_f64("FLEET_TEST_F64", 1.5), 1.5);
        std::env::remove_var("FLEET_TEST_F64");
    }

    #[test]
    fn thresholds_default_when_env_unset() {
        let thresholds = thresholds_from_env();
        assert_eq!(thresholds.temperature_high_c, 45.0);
        assert_eq!(thresholds.soh_warning_pct, 80.0);
    }
}
