//! Datetime parsing at the ingestion boundary.
//!
//! Parsed values are epoch-milliseconds (for `DateTime` columns) or
//! epoch-days (for `Date` columns), both in 64 bits. The default zone is
//! UTC; naive inputs are interpreted as UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::{Error, Result};

/// Accepted per-column datetime formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_types", derive(serde_derive::Deserialize, serde_derive::Serialize))]
pub enum DatetimeFormat {
    /// RFC 3339 / ISO 8601, with or without an offset.
    Iso,
    /// `YYYY-MM-DD HH:mm[:ss[.fff]]`.
    Sql,
    /// `YYYY-MM-DD`.
    Date,
    /// Seconds since the epoch, as an integer.
    UnixSeconds,
    /// Milliseconds since the epoch, as an integer.
    UnixMillis,
}

const SQL_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const ISO_NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

/// Parses `value` into epoch-milliseconds according to `format`.
pub fn parse_datetime(value: &str, format: DatetimeFormat) -> Result<i64> {
    let value = value.trim();
    match format {
        DatetimeFormat::Iso => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
                return Ok(parsed.timestamp_millis());
            }
            for fmt in ISO_NAIVE_FORMATS {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
                    return Ok(parsed.and_utc().timestamp_millis());
                }
            }
            // a bare date is a valid ISO instant at midnight UTC
            if let Ok(parsed) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                return Ok(parsed
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
                    .timestamp_millis());
            }
            Err(parse_error(value, "iso"))
        }
        DatetimeFormat::Sql => {
            for fmt in SQL_FORMATS {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
                    return Ok(parsed.and_utc().timestamp_millis());
                }
            }
            Err(parse_error(value, "sql"))
        }
        DatetimeFormat::Date => parse_date(value).map(|days| days * 86_400_000),
        DatetimeFormat::UnixSeconds => value
            .parse::<i64>()
            .map(|s| s * 1000)
            .map_err(|_| parse_error(value, "unix-s")),
        DatetimeFormat::UnixMillis => value
            .parse::<i64>()
            .map_err(|_| parse_error(value, "unix-ms")),
    }
}

/// Parses a `YYYY-MM-DD` value into epoch-days.
pub fn parse_date(value: &str) -> Result<i64> {
    let value = value.trim();
    let parsed = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| parse_error(value, "date"))?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    Ok((parsed - epoch).num_days())
}

fn parse_error(value: &str, format: &str) -> Error {
    Error::Parse(format!(
        "\"{}\" is not a valid {} datetime",
        value, format
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso() -> Result<()> {
        assert_eq!(parse_datetime("1970-01-01T00:00:00Z", DatetimeFormat::Iso)?, 0);
        assert_eq!(
            parse_datetime("1970-01-01T00:00:01.500Z", DatetimeFormat::Iso)?,
            1500
        );
        // naive and bare-date inputs are UTC
        assert_eq!(parse_datetime("1970-01-02T00:00:00", DatetimeFormat::Iso)?, 86_400_000);
        assert_eq!(parse_datetime("1970-01-02", DatetimeFormat::Iso)?, 86_400_000);
        assert!(parse_datetime("yesterday", DatetimeFormat::Iso).is_err());
        Ok(())
    }

    #[test]
    fn sql() -> Result<()> {
        assert_eq!(
            parse_datetime("1970-01-01 00:01", DatetimeFormat::Sql)?,
            60_000
        );
        assert_eq!(
            parse_datetime("1970-01-01 00:00:02", DatetimeFormat::Sql)?,
            2000
        );
        assert_eq!(
            parse_datetime("1970-01-01 00:00:00.250", DatetimeFormat::Sql)?,
            250
        );
        Ok(())
    }

    #[test]
    fn unix() -> Result<()> {
        assert_eq!(parse_datetime("12", DatetimeFormat::UnixSeconds)?, 12_000);
        assert_eq!(parse_datetime("12", DatetimeFormat::UnixMillis)?, 12);
        Ok(())
    }

    #[test]
    fn dates() -> Result<()> {
        assert_eq!(parse_date("1970-01-01")?, 0);
        assert_eq!(parse_date("1970-02-01")?, 31);
        assert_eq!(parse_date("1969-12-31")?, -1);
        assert!(parse_date("01/02/1970").is_err());
        Ok(())
    }
}
