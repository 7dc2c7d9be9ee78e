//! Query scoping: which city and which time window a question is about.
//!
//! Both extractors are deliberately shallow pattern matches. They never fail;
//! anything they cannot read falls back to the configured default city and a
//! three day window starting now.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

pub const DEFAULT_CITY: &str = "Berlin";

static CITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(in|at|around|near|for)\s+([A-Z][a-z]+(?:\s[A-Z][a-z]+)*)")
        .expect("city pattern compiles")
});

/// First capitalized place name after `in`, `at`, `around`, `near` or `for`.
///
/// ```rust
/// use awful_events::query::extract_city;
///
/// assert_eq!(extract_city("Any jazz in New York tonight?"), Some("New York".to_string()));
/// assert_eq!(extract_city("what's on tonight"), None);
/// ```
pub fn extract_city(query: &str) -> Option<String> {
    CITY_RE
        .captures(query)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// A UTC time range, rendered for provider APIs as `YYYY-MM-DDTHH:MM:SSZ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    pub fn start_iso(&self) -> String {
        iso_seconds(&self.start)
    }

    pub fn end_iso(&self) -> String {
        iso_seconds(&self.end)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.start_iso(), self.end_iso())
    }
}

fn iso_seconds(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Map a phrase in `query` to a window relative to `now`.
///
/// The first rule that matches (case-insensitive substring) wins:
///
/// | phrase        | window                                    |
/// |---------------|-------------------------------------------|
/// | `tomorrow`    | now + 1 day .. now + 2 days               |
/// | `weekend`     | coming Friday 18:00 .. following Monday 00:00 |
/// | `next 7 days` | now .. now + 7 days                       |
/// | `today`       | now .. 23:59:59 today                     |
/// | otherwise     | now .. now + 3 days                       |
///
/// On a Friday the "coming Friday" is the same day, even past 18:00. The
/// weekend window always starts on the hour at 18:00:00; the current minutes
/// and seconds are not carried over.
pub fn parse_date_range(query: &str, now: DateTime<Utc>) -> DateWindow {
    let query = query.to_lowercase();

    let (start, end) = if query.contains("tomorrow") {
        let start = now + Duration::days(1);
        (start, start + Duration::days(1))
    } else if query.contains("weekend") {
        let days_until_friday = (4 - now.weekday().num_days_from_monday() as i64).rem_euclid(7);
        let friday = (now + Duration::days(days_until_friday)).date_naive();
        let start = friday.and_time(NaiveTime::MIN).and_utc() + Duration::hours(18);
        (start, start + Duration::days(2) + Duration::hours(6))
    } else if query.contains("next 7 days") {
        (now, now + Duration::days(7))
    } else if query.contains("today") {
        let end = now.date_naive().and_time(NaiveTime::MIN).and_utc() + Duration::seconds(86_399);
        (now, end)
    } else {
        (now, now + Duration::days(3))
    };

    DateWindow { start, end }
}

/// City and window for one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScope {
    pub city: String,
    pub window: DateWindow,
}

#[derive(Debug, Clone)]
pub struct QueryResolver {
    default_city: String,
}

impl Default for QueryResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CITY)
    }
}

impl QueryResolver {
    pub fn new(default_city: impl Into<String>) -> Self {
        Self {
            default_city: default_city.into(),
        }
    }

    pub fn resolve(&self, query: &str, now: DateTime<Utc>) -> QueryScope {
        QueryScope {
            city: extract_city(query).unwrap_or_else(|| self.default_city.clone()),
            window: parse_date_range(query, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // Wednesday.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 29, 14, 30, 45).unwrap()
    }

    fn window(query: &str, now: DateTime<Utc>) -> (String, String) {
        let w = parse_date_range(query, now);
        (w.start_iso(), w.end_iso())
    }

    #[test]
    fn test_extract_city() {
        assert_eq!(extract_city("Concerts in Berlin this weekend"), Some("Berlin".into()));
        assert_eq!(extract_city("Food markets near San Francisco?"), Some("San Francisco".into()));
        assert_eq!(extract_city("What can I do for Hamburg fans"), Some("Hamburg".into()));
        assert_eq!(extract_city("anything in berlin"), None);
        assert_eq!(extract_city("Within Munich"), None);
    }

    #[test]
    fn test_resolver_falls_back_to_default_city() {
        let resolver = QueryResolver::new("Lisbon");
        assert_eq!(resolver.resolve("gigs tonight", now()).city, "Lisbon");
        assert_eq!(resolver.resolve("gigs at Porto", now()).city, "Porto");
        assert_eq!(QueryResolver::default().resolve("gigs tonight", now()).city, "Berlin");
    }

    #[test]
    fn test_tomorrow_window() {
        assert_eq!(
            window("Anything TOMORROW?", now()),
            ("2024-05-30T14:30:45Z".into(), "2024-05-31T14:30:45Z".into())
        );
    }

    #[test]
    fn test_weekend_window() {
        assert_eq!(
            window("this weekend", now()),
            ("2024-05-31T18:00:00Z".into(), "2024-06-03T00:00:00Z".into())
        );

        // Late-evening minutes and seconds are not carried into the start.
        let wednesday_late = Utc.with_ymd_and_hms(2024, 5, 29, 23, 59, 59).unwrap();
        assert_eq!(window("weekend", wednesday_late).0, "2024-05-31T18:00:00Z");

        // Friday itself, and Saturday rolling over to next Friday.
        let friday = Utc.with_ymd_and_hms(2024, 5, 31, 21, 0, 0).unwrap();
        assert_eq!(window("weekend", friday).0, "2024-05-31T18:00:00Z");
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        assert_eq!(window("weekend", saturday).0, "2024-06-07T18:00:00Z");
    }

    #[test]
    fn test_tomorrow_wins_over_weekend() {
        assert_eq!(window("tomorrow or the weekend", now()).0, "2024-05-30T14:30:45Z");
    }

    #[test]
    fn test_next_seven_days_today_and_default() {
        assert_eq!(window("the next 7 days", now()).1, "2024-06-05T14:30:45Z");
        assert_eq!(
            window("today", now()),
            ("2024-05-29T14:30:45Z".into(), "2024-05-29T23:59:59Z".into())
        );
        assert_eq!(window("jazz", now()).1, "2024-06-01T14:30:45Z");
    }

    #[test]
    fn test_subsecond_precision_is_dropped() {
        let now = now() + Duration::milliseconds(987);
        assert_eq!(parse_date_range("jazz", now).start_iso(), "2024-05-29T14:30:45Z");
    }
}
