use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

/// Hard caps on read endpoints; requested limits above these are clamped
/// silently.
pub const MAX_TELEMETRY_ROWS: i64 = 10_000;
pub const MAX_PAGE_LIMIT: i64 = 1_000;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SampleRow {
    pub battery_id: String,
    pub ts: DateTime<Utc>,
    pub voltage_v: f64,
    pub current_a: f64,
    pub temperature_c: f64,
    pub resistance_mohm: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LocationRow {
    pub location_id: String,
    pub name: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temp_offset_c: f64,
    pub humidity_offset_pct: f64,
    pub outage_rate_per_year: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LocationStatsRow {
    pub location_id: String,
    pub name: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    pub total_batteries: i64,
    pub active_batteries: i64,
    pub degraded_batteries: i64,
    pub mean_soh_pct: Option<f64>,
    pub open_alerts: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatteryRow {
    pub battery_id: String,
    pub string_id: String,
    pub location_id: String,
    pub position: i32,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub nominal_voltage_v: f64,
    pub nominal_capacity_ah: f64,
    pub warranty_months: i32,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub battery_id: String,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub threshold: Option<f64>,
    pub observed: Option<f64>,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub ack_note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSample {
    pub battery_id: String,
    pub ts: DateTime<Utc>,
    pub voltage_v: f64,
    pub current_a: f64,
    pub temperature_c: f64,
    pub resistance_mohm: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
}

/// Bulk insert inside the caller's transaction. A duplicate (battery, ts)
/// aborts the whole transaction with a unique violation; partial success is
/// not possible.
pub async fn insert_samples(
    tx: &mut Transaction<'_, Postgres>,
    samples: &[NewSample],
) -> Result<u64, sqlx::Error> {
    if samples.is_empty() {
        return Ok(0);
    }
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO telemetry (battery_id, ts, voltage_v, current_a, temperature_c, resistance_mohm, soc_pct, soh_pct) ",
    );
    builder.push_values(samples.iter(), |mut b, sample| {
        b.push_bind(&sample.battery_id)
            .push_bind(sample.ts)
            .push_bind(sample.voltage_v)
            .push_bind(sample.current_a)
            .push_bind(sample.temperature_c)
            .push_bind(sample.resistance_mohm)
            .push_bind(sample.soc_pct)
            .push_bind(sample.soh_pct);
    });
    let result = builder.build().execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

pub async fn latest_sample(
    pool: &PgPool,
    battery_id: &str,
) -> Result<Option<SampleRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT battery_id, ts, voltage_v, current_a, temperature_c, resistance_mohm, soc_pct, soh_pct
        FROM telemetry
        WHERE battery_id = $1
        ORDER BY ts DESC
        LIMIT 1
        "#,
    )
    .bind(battery_id)
    .fetch_optional(pool)
    .await
}

/// Oldest-first range scan, truncated at `max_rows` (clamped to the cap).
pub async fn range_samples(
    pool: &PgPool,
    battery_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_rows: i64,
) -> Result<Vec<SampleRow>, sqlx::Error> {
    let limit = max_rows.clamp(1, MAX_TELEMETRY_ROWS);
    sqlx::query_as(
        r#"
        SELECT battery_id, ts, voltage_v, current_a, temperature_c, resistance_mohm, soc_pct, soh_pct
        FROM telemetry
        WHERE battery_id = $1
          AND ts >= $2
          AND ts <= $3
        ORDER BY ts ASC
        LIMIT $4
        "#,
    )
    .bind(battery_id)
    .bind(start)
    .bind(end)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Newest-first tail used to rebuild evaluator windows at startup.
pub async fn recent_samples(
    pool: &PgPool,
    battery_id: &str,
    since: DateTime<Utc>,
    max_rows: i64,
) -> Result<Vec<SampleRow>, sqlx::Error> {
    let mut rows: Vec<SampleRow> = sqlx::query_as(
        r#"
        SELECT battery_id, ts, voltage_v, current_a, temperature_c, resistance_mohm, soc_pct, soh_pct
        FROM telemetry
        WHERE battery_id = $1
          AND ts >= $2
        ORDER BY ts DESC
        LIMIT $3
        "#,
    )
    .bind(battery_id)
    .bind(since)
    .bind(max_rows.clamp(1, MAX_TELEMETRY_ROWS))
    .fetch_all(pool)
    .await?;
    rows.reverse();
    Ok(rows)
}

/// Latest sample per battery in one round-trip.
pub async fn latest_samples_for(
    pool: &PgPool,
    battery_ids: &[String],
) -> Result<HashMap<String, SampleRow>, sqlx::Error> {
    if battery_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<SampleRow> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (battery_id)
               battery_id, ts, voltage_v, current_a, temperature_c, resistance_mohm, soc_pct, soh_pct
        FROM telemetry
        WHERE battery_id = ANY($1)
        ORDER BY battery_id, ts DESC
        "#,
    )
    .bind(battery_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.battery_id.clone(), row))
        .collect())
}

const BATTERY_SELECT: &str = r#"
    SELECT
        b.battery_id,
        b.string_id,
        sy.location_id,
        b.position,
        b.vendor,
        b.model,
        b.serial,
        b.nominal_voltage_v,
        b.nominal_capacity_ah,
        b.warranty_months,
        b.status
    FROM batteries b
    JOIN strings st ON st.string_id = b.string_id
    JOIN systems sy ON sy.system_id = st.system_id
"#;

pub async fn get_battery(
    pool: &PgPool,
    battery_id: &str,
) -> Result<Option<BatteryRow>, sqlx::Error> {
    sqlx::query_as(&format!("{BATTERY_SELECT} WHERE b.battery_id = $1"))
        .bind(battery_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_batteries(
    pool: &PgPool,
    location_id: Option<&str>,
    skip: i64,
    limit: i64,
) -> Result<Vec<BatteryRow>, sqlx::Error> {
    let limit = limit.clamp(1, MAX_PAGE_LIMIT);
    let skip = skip.max(0);
    match location_id {
        Some(location_id) => {
            sqlx::query_as(&format!(
                "{BATTERY_SELECT} WHERE sy.location_id = $1 ORDER BY b.battery_id ASC OFFSET $2 LIMIT $3"
            ))
            .bind(location_id)
            .bind(skip)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "{BATTERY_SELECT} ORDER BY b.battery_id ASC OFFSET $1 LIMIT $2"
            ))
            .bind(skip)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

/// Maps battery ids to their owning location. Missing ids are simply absent
/// from the result; callers treat that as NotFound.
pub async fn battery_locations(
    pool: &PgPool,
    battery_ids: &[String],
) -> Result<HashMap<String, String>, sqlx::Error> {
    if battery_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT b.battery_id, sy.location_id
        FROM batteries b
        JOIN strings st ON st.string_id = b.string_id
        JOIN systems sy ON sy.system_id = st.system_id
        WHERE b.battery_id = ANY($1)
        "#,
    )
    .bind(battery_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

pub async fn list_locations(pool: &PgPool) -> Result<Vec<LocationRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT location_id, name, region, latitude, longitude,
               temp_offset_c, humidity_offset_pct, outage_rate_per_year
        FROM locations
        ORDER BY location_id ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

pub async fn get_location(
    pool: &PgPool,
    location_id: &str,
) -> Result<Option<LocationRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT location_id, name, region, latitude, longitude,
               temp_offset_c, humidity_offset_pct, outage_rate_per_year
        FROM locations
        WHERE location_id = $1
        "#,
    )
    .bind(location_id)
    .fetch_optional(pool)
    .await
}

/// Per-site aggregates computed on read: battery counts, degraded count
/// (latest SoH below 80), mean SoH over latest samples, open alert count.
pub async fn list_locations_with_stats(
    pool: &PgPool,
) -> Result<Vec<LocationStatsRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT
            l.location_id,
            l.name,
            l.region,
            l.latitude,
            l.longitude,
            COUNT(b.battery_id) AS total_batteries,
            COUNT(b.battery_id) FILTER (WHERE b.status = 'active') AS active_batteries,
            COUNT(b.battery_id) FILTER (WHERE latest.soh_pct < 80) AS degraded_batteries,
            AVG(latest.soh_pct) AS mean_soh_pct,
            COALESCE(oa.open_alerts, 0) AS open_alerts
        FROM locations l
        LEFT JOIN systems sy ON sy.location_id = l.location_id
        LEFT JOIN strings st ON st.system_id = sy.system_id
        LEFT JOIN batteries b ON b.string_id = st.string_id
        LEFT JOIN LATERAL (
            SELECT t.soh_pct
            FROM telemetry t
            WHERE t.battery_id = b.battery_id
            ORDER BY t.ts DESC
            LIMIT 1
        ) latest ON TRUE
        LEFT JOIN LATERAL (
            SELECT COUNT(*) AS open_alerts
            FROM alerts a
            JOIN batteries b2 ON b2.battery_id = a.battery_id
            JOIN strings st2 ON st2.string_id = b2.string_id
            JOIN systems sy2 ON sy2.system_id = st2.system_id
            WHERE sy2.location_id = l.location_id
              AND a.resolved_at IS NULL
        ) oa ON TRUE
        GROUP BY l.location_id, l.name, l.region, l.latitude, l.longitude, oa.open_alerts
        ORDER BY l.location_id ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

const ALERT_SELECT: &str = r#"
    SELECT id, battery_id, kind, severity, message, threshold, observed,
           triggered_at, resolved_at, acknowledged_by, acknowledged_at, ack_note
    FROM alerts
"#;

pub async fn get_alert(pool: &PgPool, alert_id: i64) -> Result<Option<AlertRow>, sqlx::Error> {
    sqlx::query_as(&format!("{ALERT_SELECT} WHERE id = $1"))
        .bind(alert_id)
        .fetch_optional(pool)
        .await
}

pub async fn open_alerts(pool: &PgPool) -> Result<Vec<AlertRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "{ALERT_SELECT} WHERE resolved_at IS NULL ORDER BY battery_id, kind"
    ))
    .fetch_all(pool)
    .await
}

pub async fn open_alert_count(pool: &PgPool, battery_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM alerts WHERE battery_id = $1 AND resolved_at IS NULL",
    )
    .bind(battery_id)
    .fetch_one(pool)
    .await
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub location_id: Option<String>,
    pub severity: Option<String>,
    pub kind: Option<String>,
    pub active_only: bool,
    pub acknowledged: Option<bool>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub skip: i64,
    pub limit: i64,
}

pub async fn list_alerts(
    pool: &PgPool,
    filter: &AlertFilter,
) -> Result<Vec<AlertRow>, sqlx::Error> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT a.id, a.battery_id, a.kind, a.severity, a.message, a.threshold, a.observed,
               a.triggered_at, a.resolved_at, a.acknowledged_by, a.acknowledged_at, a.ack_note
        FROM alerts a
        JOIN batteries b ON b.battery_id = a.battery_id
        JOIN strings st ON st.string_id = b.string_id
        JOIN systems sy ON sy.system_id = st.system_id
        WHERE TRUE
        "#,
    );
    if let Some(location_id) = &filter.location_id {
        builder.push(" AND sy.location_id = ").push_bind(location_id);
    }
    if let Some(severity) = &filter.severity {
        builder.push(" AND a.severity = ").push_bind(severity);
    }
    if let Some(kind) = &filter.kind {
        builder.push(" AND a.kind = ").push_bind(kind);
    }
    if filter.active_only {
        builder.push(" AND a.resolved_at IS NULL");
    }
    if let Some(acknowledged) = filter.acknowledged {
        if acknowledged {
            builder.push(" AND a.acknowledged_at IS NOT NULL");
        } else {
            builder.push(" AND a.acknowledged_at IS NULL");
        }
    }
    if let Some(start) = filter.start_date {
        builder.push(" AND a.triggered_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_date {
        builder.push(" AND a.triggered_at <= ").push_bind(end);
    }
    builder
        .push(" ORDER BY a.triggered_at DESC OFFSET ")
        .push_bind(filter.skip.max(0))
        .push(" LIMIT ")
        .push_bind(filter.limit.clamp(1, MAX_PAGE_LIMIT));
    builder.build_query_as().fetch_all(pool).await
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertStatsRow {
    pub severity: String,
    pub kind: String,
    pub total: i64,
    pub active: i64,
}

pub async fn alert_stats(
    pool: &PgPool,
    location_id: Option<&str>,
    since: DateTime<Utc>,
) -> Result<Vec<AlertStatsRow>, sqlx::Error> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT a.severity, a.kind,
               COUNT(*) AS total,
               COUNT(*) FILTER (WHERE a.resolved_at IS NULL) AS active
        FROM alerts a
        JOIN batteries b ON b.battery_id = a.battery_id
        JOIN strings st ON st.string_id = b.string_id
        JOIN systems sy ON sy.system_id = st.system_id
        WHERE a.triggered_at >=
        "#,
    );
    builder.push_bind(since);
    if let Some(location_id) = location_id {
        builder.push(" AND sy.location_id = ").push_bind(location_id);
    }
    builder.push(" GROUP BY a.severity, a.kind ORDER BY a.severity, a.kind");
    builder.build_query_as().fetch_all(pool).await
}

pub async fn delete_expired_telemetry(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM telemetry WHERE ts < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
