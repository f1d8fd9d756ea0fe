use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unrecognized date: {0:?}")]
pub struct DateParseError(pub String);

/// Turns whatever date string a page exposes into a timestamp. The pipeline
/// treats this as a pure function; failures leave the item's `created` unset
/// and the item is dropped downstream.
pub trait DateParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<DateTime<Utc>, DateParseError>;
}

const ABSOLUTE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M",
    "%b %d, %Y %H:%M",
    "%d %b %Y %H:%M",
];

const DATE_ONLY_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%d.%m.%Y",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

/// Chrono-backed parser. The clock is injectable so relative phrases
/// ("2 hours ago") stay reproducible in the extractor CLI and in tests.
pub struct ChronoDateParser {
    now: fn() -> DateTime<Utc>,
}

impl ChronoDateParser {
    pub fn new() -> Self {
        Self { now: Utc::now }
    }

    pub fn with_clock(now: fn() -> DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Default for ChronoDateParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DateParser for ChronoDateParser {
    fn parse(&self, raw: &str) -> Result<DateTime<Utc>, DateParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DateParseError(raw.to_string()));
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(parsed.with_timezone(&Utc));
        }
        if let Ok(parsed) = DateTime::parse_from_rfc2822(trimmed) {
            return Ok(parsed.with_timezone(&Utc));
        }
        for format in ABSOLUTE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(Utc.from_utc_datetime(&naive));
            }
        }
        for format in DATE_ONLY_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| DateParseError(raw.to_string()))?;
                return Ok(Utc.from_utc_datetime(&midnight));
            }
        }
        if let Some(stamp) = parse_unix(trimmed) {
            return Ok(stamp);
        }
        if let Some(stamp) = self.parse_relative(trimmed) {
            return Ok(stamp);
        }

        Err(DateParseError(raw.to_string()))
    }
}

fn parse_unix(raw: &str) -> Option<DateTime<Utc>> {
    let value: i64 = raw.parse().ok()?;
    // Millisecond timestamps are 13 digits for contemporary dates.
    if value >= 1_000_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else if value >= 1_000_000_000 {
        Utc.timestamp_opt(value, 0).single()
    } else {
        None
    }
}

impl ChronoDateParser {
    fn parse_relative(&self, raw: &str) -> Option<DateTime<Utc>> {
        let now = (self.now)();
        let lower = raw.to_lowercase();
        match lower.as_str() {
            "now" | "just now" | "today" => return Some(now),
            "yesterday" => return Some(now - Duration::days(1)),
            _ => {}
        }

        // "<n> <unit>[s] ago", e.g. "5 minutes ago"
        let mut words = lower.split_whitespace();
        let amount: i64 = words.next()?.parse().ok()?;
        let unit = words.next()?;
        if words.next()? != "ago" || words.next().is_some() {
            return None;
        }
        let step = match unit.trim_end_matches('s') {
            "second" | "sec" => Duration::seconds(1),
            "minute" | "min" => Duration::minutes(1),
            "hour" => Duration::hours(1),
            "day" => Duration::days(1),
            "week" => Duration::weeks(1),
            "month" => Duration::days(30),
            "year" => Duration::days(365),
            _ => return None,
        };
        Some(now - step * amount as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap()
    }

    fn parser() -> ChronoDateParser {
        ChronoDateParser::with_clock(fixed_now)
    }

    #[test]
    fn parses_rfc3339() {
        let parsed = parser().parse("2024-01-02T03:04:05Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
    }

    #[test]
    fn parses_rfc2822() {
        let parsed = parser().parse("Tue, 02 Jan 2024 03:04:05 GMT").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
    }

    #[test]
    fn parses_bare_dates_at_midnight() {
        let parsed = parser().parse("March 5, 2024").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn parses_unix_seconds_and_millis() {
        assert_eq!(
            parser().parse("1704164645").unwrap(),
            Utc.timestamp_opt(1_704_164_645, 0).unwrap()
        );
        assert_eq!(
            parser().parse("1704164645000").unwrap(),
            Utc.timestamp_opt(1_704_164_645, 0).unwrap()
        );
    }

    #[test]
    fn parses_relative_phrases_against_the_injected_clock() {
        assert_eq!(parser().parse("2 hours ago").unwrap(), fixed_now() - Duration::hours(2));
        assert_eq!(parser().parse("yesterday").unwrap(), fixed_now() - Duration::days(1));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parser().parse("").is_err());
        assert!(parser().parse("not a date").is_err());
        assert!(parser().parse("12345").is_err());
    }
}
