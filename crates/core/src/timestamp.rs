//! In-content timestamp recognition and the timestamp fallback hierarchy
//!.

use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

struct TimestampPatterns {
    iso8601: Regex,
    plain_date: Regex,
    slash_date: Regex,
    month_day_year: Regex,
    day_month_year: Regex,
}

fn patterns() -> &'static TimestampPatterns {
    static PATTERNS: OnceLock<TimestampPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| TimestampPatterns {
        iso8601: Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z?").unwrap(),
        plain_date: Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap(),
        slash_date: Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}\b").unwrap(),
        month_day_year: Regex::new(
            r"\b(?:January|February|March|April|May|June|July|August|September|October|November|December) \d{1,2},? \d{4}\b",
        )
        .unwrap(),
        day_month_year: Regex::new(
            r"\b\d{1,2} (?:January|February|March|April|May|June|July|August|September|October|November|December) \d{4}\b",
        )
        .unwrap(),
    })
}

fn parse_iso8601(s: &str) -> Option<i64> {
    let s = s.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp_millis())
}

fn midnight_ms(date: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()).timestamp_millis()
}

fn parse_plain_date(s: &str) -> Option<i64> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(midnight_ms)
}

fn parse_slash_date(s: &str) -> Option<i64> {
    NaiveDate::parse_from_str(s, "%m/%d/%Y").ok().map(midnight_ms)
}

fn parse_month_day_year(s: &str) -> Option<i64> {
    let normalized = s.replace(',', "");
    NaiveDate::parse_from_str(&normalized, "%B %d %Y").ok().map(midnight_ms)
}

fn parse_day_month_year(s: &str) -> Option<i64> {
    NaiveDate::parse_from_str(s, "%d %B %Y").ok().map(midnight_ms)
}

/// Scans `content` for the first (leftmost) timestamp recognized by any of
/// the four accepted formats and returns its epoch-millisecond value.
pub fn extract_in_content_timestamp(content: &str) -> Option<i64> {
    let p = patterns();
    let mut best: Option<(usize, i64)> = None;

    let mut consider = |m: Option<regex::Match>, parse: fn(&str) -> Option<i64>| {
        if let Some(m) = m {
            if let Some(ms) = parse(m.as_str()) {
                if best.map(|(pos, _)| m.start() < pos).unwrap_or(true) {
                    best = Some((m.start(), ms));
                }
            }
        }
    };

    consider(p.iso8601.find(content), parse_iso8601);
    consider(p.plain_date.find(content), parse_plain_date);
    consider(p.slash_date.find(content), parse_slash_date);
    consider(p.month_day_year.find(content), parse_month_day_year);
    consider(p.day_month_year.find(content), parse_day_month_year);

    best.map(|(_, ms)| ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso8601_to_expected_epoch_millis() {
        let ts = extract_in_content_timestamp("recorded at 2024-01-01T00:00:00Z in the log");
        assert_eq!(ts, Some(1_704_067_200_000));
    }

    #[test]
    fn parses_plain_date() {
        let ts = extract_in_content_timestamp("due on 2024-01-01 sharp");
        assert_eq!(ts, Some(1_704_067_200_000));
    }

    #[test]
    fn parses_slash_date() {
        let ts = extract_in_content_timestamp("filed 1/1/2024 at the office");
        assert_eq!(ts, Some(1_704_067_200_000));
    }

    #[test]
    fn parses_month_day_year_with_comma() {
        let ts = extract_in_content_timestamp("signed January 1, 2024 by both parties");
        assert_eq!(ts, Some(1_704_067_200_000));
    }

    #[test]
    fn parses_day_month_year() {
        let ts = extract_in_content_timestamp("dated 1 January 2024 precisely");
        assert_eq!(ts, Some(1_704_067_200_000));
    }

    #[test]
    fn returns_none_when_no_timestamp_present() {
        assert_eq!(extract_in_content_timestamp("just some plain prose here"), None);
    }

    #[test]
    fn picks_the_leftmost_match_when_multiple_are_present() {
        let ts = extract_in_content_timestamp("first 2024-01-01 then 2025-06-15");
        assert_eq!(ts, Some(1_704_067_200_000));
    }
}
