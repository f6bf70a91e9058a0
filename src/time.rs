use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use crate::error::AppError;

/// Parses a request timestamp. RFC 3339 offsets are honored; a naive
/// datetime is interpreted as UTC.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, AppError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(AppError::validation(format!("Invalid timestamp: {trimmed}")))
}

/// ISO-8601 UTC with millisecond precision and an explicit `Z` suffix.
pub(crate) fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_offset_and_converts_to_utc() {
        let ts = parse_ts("2026-03-01T12:00:00+07:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let ts = parse_ts("2026-03-01T12:00:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_ts("yesterday").is_err());
    }

    #[test]
    fn iso_output_has_z_suffix_and_millis() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).unwrap();
        assert_eq!(to_iso(ts), "2026-03-01T05:00:00.000Z");
    }
}
