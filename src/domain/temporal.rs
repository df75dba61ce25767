//! Date and duration parsing and formatting.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta};
use regex::Regex;
use std::sync::LazyLock;

pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%b-%Y", "%b %d, %Y"];

static GO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(?:(?:\d+(?:\.\d*)?|\.\d+)(?:ns|us|µs|ms|s|m|h))+$").unwrap()
});

static GO_DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").unwrap());

static WORDED_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+|\d+\.\d+)\s(seconds|second|minutes|minute|hours|hour|days|day|weeks|week|years|year|s|m|h|d|w|y)$",
    )
    .unwrap()
});

/// Parse a date or timestamp in any of the accepted layouts.
pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() || !text.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.naive_utc())
}

/// Parse a duration such as `1h30m`, `300ms`, `2.5 hours` or `3 days`.
pub fn parse_duration(text: &str) -> Option<TimeDelta> {
    let text = text.trim();
    if GO_DURATION.is_match(text) {
        let negative = text.starts_with('-');
        let mut nanos = 0f64;
        for part in GO_DURATION_PART.captures_iter(text) {
            let amount: f64 = part[1].parse().ok()?;
            let scale = match &part[2] {
                "ns" => 1.0,
                "us" | "µs" => 1e3,
                "ms" => 1e6,
                "s" => 1e9,
                "m" => 60e9,
                _ => 3600e9,
            };
            nanos += amount * scale;
        }
        let nanos = if negative { -nanos } else { nanos };
        return Some(TimeDelta::nanoseconds(nanos as i64));
    }

    let caps = WORDED_DURATION.captures(text)?;
    let amount: f64 = caps[1].parse().ok()?;
    let seconds = match &caps[2] {
        "s" | "second" | "seconds" => 1.0,
        "m" | "minute" | "minutes" => 60.0,
        "h" | "hour" | "hours" => 3600.0,
        "d" | "day" | "days" => 86_400.0,
        "w" | "week" | "weeks" => 604_800.0,
        _ => 52.0 * 604_800.0,
    };
    Some(TimeDelta::nanoseconds((amount * seconds * 1e9) as i64))
}

pub fn format_date(dt: &NaiveDateTime) -> String {
    dt.format(DATE_FORMAT).to_string()
}

/// Render a duration as hours, minutes and seconds, e.g. `72h3m0.5s`.
pub fn format_duration(d: &TimeDelta) -> String {
    let nanos = d.num_nanoseconds().unwrap_or(i64::MAX);
    if nanos == 0 {
        return "0s".to_string();
    }
    let sign = if nanos < 0 { "-" } else { "" };
    let abs = nanos.unsigned_abs();
    let hours = abs / 3_600_000_000_000;
    let minutes = (abs / 60_000_000_000) % 60;
    let sub_minute = abs % 60_000_000_000;
    let secs = sub_minute / 1_000_000_000;
    let frac = sub_minute % 1_000_000_000;

    let mut seconds = secs.to_string();
    if frac > 0 {
        let digits = format!("{frac:09}");
        seconds.push('.');
        seconds.push_str(digits.trim_end_matches('0'));
    }

    if hours > 0 {
        format!("{sign}{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{sign}{minutes}m{seconds}s")
    } else {
        format!("{sign}{seconds}s")
    }
}

/// Format a float with up to ten significant digits, trailing zeros removed.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }
    let sci = format!("{:.9e}", f);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => return sci,
    };
    if !(-4..10).contains(&exp) {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }
    let decimals = (9 - exp).max(0) as usize;
    trim_fraction(&format!("{:.*}", decimals, f)).to_string()
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
