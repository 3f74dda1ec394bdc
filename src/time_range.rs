//! Relative and explicit date range expressions.
//!
//! Recognized (English and Chinese):
//!
//! | Expression | Range |
//! |------------|-------|
//! | `today` / `今天` | today |
//! | `yesterday` / `昨天` | yesterday |
//! | `前天` | the day before yesterday |
//! | `this week` / `本周` / `这周` | Monday of this week to today |
//! | `last week` / `上周` | Monday to Sunday of the previous week |
//! | `last N days` / `past N days` / `最近N天` | the N days ending today |
//! | `this month` / `本月` / `这个月` | first of the month to today |
//! | `last month` / `上个月` | the whole previous month |
//! | `2024-05-01..2024-05-07` | explicit, inclusive |

use chrono::{Datelike, Days, Local, NaiveDate};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static EXPLICIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2})\s*(?:\.\.|~|to)\s*(\d{4}-\d{2}-\d{2})").expect("static regex")
});
static LAST_N_DAYS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:last|past)\s+(\d{1,3})\s+days?\b|最近(\d{1,3})天").expect("static regex")
});

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self::new(date, date)
    }

    /// `YYYY-MM-DD` bounds for matching stored entry dates.
    pub fn date_strings(&self) -> (String, String) {
        (
            self.start.format("%Y-%m-%d").to_string(),
            self.end.format("%Y-%m-%d").to_string(),
        )
    }

    /// Local-time millisecond bounds `[start, end)` for matching mtimes.
    pub fn bounds_ms(&self) -> (i64, i64) {
        let end = self.end.checked_add_days(Days::new(1)).unwrap_or(self.end);
        (local_midnight_ms(self.start), local_midnight_ms(end))
    }
}

fn local_midnight_ms(date: NaiveDate) -> i64 {
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        return 0;
    };
    match midnight.and_local_timezone(Local).earliest() {
        Some(dt) => dt.timestamp_millis(),
        None => midnight.and_utc().timestamp_millis(),
    }
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn days_before(date: NaiveDate, n: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(n)).unwrap_or(date)
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Extract every date range mentioned in `text`, relative to `today`.
/// Duplicates are dropped; order follows the table above.
pub fn parse_time_ranges(text: &str, today: NaiveDate) -> Vec<TimeRange> {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let mut ranges = Vec::new();

    if has(&["today", "今天"]) {
        ranges.push(TimeRange::day(today));
    }
    if has(&["yesterday", "昨天"]) {
        ranges.push(TimeRange::day(days_before(today, 1)));
    }
    if has(&["前天"]) {
        ranges.push(TimeRange::day(days_before(today, 2)));
    }

    let weekday = today.weekday().num_days_from_monday() as u64;
    let this_monday = days_before(today, weekday);
    if has(&["this week", "本周", "这周"]) {
        ranges.push(TimeRange::new(this_monday, today));
    }
    if has(&["last week", "上周"]) {
        ranges.push(TimeRange::new(
            days_before(this_monday, 7),
            days_before(this_monday, 1),
        ));
    }

    for caps in LAST_N_DAYS_RE.captures_iter(text) {
        let n = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0);
        if n > 0 {
            ranges.push(TimeRange::new(days_before(today, n - 1), today));
        }
    }

    let first = month_start(today);
    if has(&["this month", "本月", "这个月"]) {
        ranges.push(TimeRange::new(first, today));
    }
    if has(&["last month", "上个月"]) {
        let last_of_prev = days_before(first, 1);
        ranges.push(TimeRange::new(month_start(last_of_prev), last_of_prev));
    }

    for caps in EXPLICIT_RE.captures_iter(text) {
        let start = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d");
        let end = NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d");
        if let (Ok(start), Ok(end)) = (start, end) {
            ranges.push(TimeRange::new(start, end));
        }
    }

    let mut unique: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if !unique.contains(&range) {
            unique.push(range);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // 2024-05-15 is a Wednesday
    const Y: i32 = 2024;

    #[test]
    fn test_relative_days() {
        let today = date(Y, 5, 15);
        assert_eq!(parse_time_ranges("what did I do today?", today), vec![TimeRange::day(today)]);
        assert_eq!(
            parse_time_ranges("昨天的会议", today),
            vec![TimeRange::day(date(Y, 5, 14))]
        );
        assert_eq!(
            parse_time_ranges("notes from the last 3 days", today),
            vec![TimeRange::new(date(Y, 5, 13), today)]
        );
    }

    #[test]
    fn test_weeks_and_months() {
        let today = date(Y, 5, 15);
        assert_eq!(
            parse_time_ranges("last week", today),
            vec![TimeRange::new(date(Y, 5, 6), date(Y, 5, 12))]
        );
        assert_eq!(
            parse_time_ranges("this month", today),
            vec![TimeRange::new(date(Y, 5, 1), today)]
        );
        assert_eq!(
            parse_time_ranges("上个月", date(Y, 1, 10)),
            vec![TimeRange::new(date(Y - 1, 12, 1), date(Y - 1, 12, 31))]
        );
    }

    #[test]
    fn test_explicit_range_and_dedup() {
        let today = date(Y, 5, 15);
        let ranges = parse_time_ranges("2024-05-07..2024-05-01 and today, today", today);
        assert_eq!(
            ranges,
            vec![
                TimeRange::day(today),
                TimeRange::new(date(Y, 5, 1), date(Y, 5, 7)),
            ]
        );
    }

    #[test]
    fn test_no_ranges() {
        assert!(parse_time_ranges("tell me about tokio", date(Y, 5, 15)).is_empty());
    }

    #[test]
    fn test_bounds_cover_whole_days() {
        let range = TimeRange::day(date(Y, 5, 15));
        let (start, end) = range.bounds_ms();
        assert_eq!(end - start, 86_400_000);
        assert_eq!(range.date_strings(), ("2024-05-15".to_string(), "2024-05-15".to_string()));
    }
}
