//! Timestamp helpers.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::{Error, Result};

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`, clamping values
/// outside chrono's range.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Parse an ISO-8601 timestamp. Inputs without an offset are taken as UTC;
/// a bare date means midnight UTC.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        && let Some(naive) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(naive.and_utc());
    }

    Err(Error::validation(format!("invalid timestamp: {input}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_roundtrip_and_clamp() {
        let now = Utc::now();
        assert_eq!(datetime_to_ms(ms_to_datetime(datetime_to_ms(now))), datetime_to_ms(now));
        assert_eq!(ms_to_datetime(i64::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_parse_timestamp_naive_is_utc() {
        let naive = parse_timestamp("2024-03-01T12:30:00").unwrap();
        let explicit = parse_timestamp("2024-03-01T12:30:00Z").unwrap();
        assert_eq!(naive, explicit);

        let offset = parse_timestamp("2024-03-01T14:30:00+02:00").unwrap();
        assert_eq!(offset, explicit);

        let date = parse_timestamp("2024-03-01").unwrap();
        assert_eq!(date.to_rfc3339(), "2024-03-01T00:00:00+00:00");

        assert!(parse_timestamp("yesterday").is_err());
    }
}
