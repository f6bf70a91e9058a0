use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

/// Idempotent schema bootstrap executed once at startup. The telemetry table
/// carries a composite primary key on (battery_id, ts) so duplicate samples
/// surface as unique violations; the partial index on alerts enforces the
/// one-open-alert-per-(battery, kind) invariant in storage.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locations (
        location_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        region TEXT NOT NULL DEFAULT '',
        latitude DOUBLE PRECISION NOT NULL DEFAULT 0,
        longitude DOUBLE PRECISION NOT NULL DEFAULT 0,
        temp_offset_c DOUBLE PRECISION NOT NULL DEFAULT 0,
        humidity_offset_pct DOUBLE PRECISION NOT NULL DEFAULT 0,
        outage_rate_per_year DOUBLE PRECISION NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS systems (
        system_id TEXT PRIMARY KEY,
        location_id TEXT NOT NULL REFERENCES locations(location_id),
        kind TEXT NOT NULL,
        rated_power_kw DOUBLE PRECISION NOT NULL DEFAULT 0,
        installed_on DATE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strings (
        string_id TEXT PRIMARY KEY,
        system_id TEXT NOT NULL REFERENCES systems(system_id),
        position INTEGER NOT NULL DEFAULT 0,
        battery_count INTEGER NOT NULL DEFAULT 0,
        nominal_voltage_v DOUBLE PRECISION NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batteries (
        battery_id TEXT PRIMARY KEY,
        string_id TEXT NOT NULL REFERENCES strings(string_id),
        position INTEGER NOT NULL DEFAULT 0,
        vendor TEXT NOT NULL DEFAULT '',
        model TEXT NOT NULL DEFAULT '',
        serial TEXT NOT NULL DEFAULT '',
        nominal_voltage_v DOUBLE PRECISION NOT NULL DEFAULT 12,
        nominal_capacity_ah DOUBLE PRECISION NOT NULL DEFAULT 100,
        installed_on DATE,
        warranty_months INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS telemetry (
        battery_id TEXT NOT NULL REFERENCES batteries(battery_id),
        ts TIMESTAMPTZ NOT NULL,
        voltage_v DOUBLE PRECISION NOT NULL,
        current_a DOUBLE PRECISION NOT NULL,
        temperature_c DOUBLE PRECISION NOT NULL,
        resistance_mohm DOUBLE PRECISION NOT NULL,
        soc_pct DOUBLE PRECISION NOT NULL,
        soh_pct DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (battery_id, ts)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS telemetry_ts_idx ON telemetry (ts)",
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL DEFAULT '',
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'viewer',
        active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_login TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id BIGSERIAL PRIMARY KEY,
        battery_id TEXT NOT NULL REFERENCES batteries(battery_id),
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        threshold DOUBLE PRECISION,
        observed DOUBLE PRECISION,
        triggered_at TIMESTAMPTZ NOT NULL,
        resolved_at TIMESTAMPTZ,
        acknowledged_by UUID REFERENCES users(id),
        acknowledged_at TIMESTAMPTZ,
        ack_note TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS alerts_open_battery_kind_idx
    ON alerts (battery_id, kind)
    WHERE resolved_at IS NULL
    "#,
    "CREATE INDEX IF NOT EXISTS alerts_triggered_at_idx ON alerts (triggered_at)",
];

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| {
                let head: String = statement.split_whitespace().take(6).collect::<Vec<_>>().join(" ");
                format!("schema bootstrap failed at: {head}")
            })?;
    }
    Ok(())
}
