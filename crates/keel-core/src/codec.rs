//! Canonical text forms for values that travel as text on the wire.
//!
//! Dates are `YYYY-MM-DD`, times `HH:MM:SS[.ffffff]`, timestamps
//! `YYYY-MM-DD HH:MM:SS[.ffffff]`, UUIDs lowercase hyphenated and decimals
//! plain `[-]digits[.digits]`. Every formatter here produces text its parser
//! accepts and maps back to the same value.

use regex::Regex;
use std::sync::LazyLock;

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// First representable date, 0001-01-01.
pub const MIN_DATE_DAYS: i32 = -719_162;
/// Last representable date, 9999-12-31.
pub const MAX_DATE_DAYS: i32 = 2_932_896;

static DECIMAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)$").expect("valid decimal regex"));

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2}):(\d{2}):(\d{2})(?:\.(\d{1,6}))?$").expect("valid time regex")
});

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("valid date regex"));

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(month);
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`].
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: i64, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

pub fn date_in_range(days: i32) -> bool {
    (MIN_DATE_DAYS..=MAX_DATE_DAYS).contains(&days)
}

pub fn time_in_range(micros: i64) -> bool {
    (0..MICROS_PER_DAY).contains(&micros)
}

pub fn datetime_in_range(micros: i64) -> bool {
    let days = micros.div_euclid(MICROS_PER_DAY);
    days >= i64::from(MIN_DATE_DAYS) && days <= i64::from(MAX_DATE_DAYS)
}

pub fn format_date(days: i32) -> String {
    let (y, m, d) = civil_from_days(i64::from(days));
    format!("{:04}-{:02}-{:02}", y, m, d)
}

pub fn parse_date(s: &str) -> Option<i32> {
    let caps = DATE_RE.captures(s)?;
    let year: i64 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;
    if year < 1 || !(1..=12).contains(&month) || day == 0 || day > days_in_month(year, month) {
        return None;
    }
    i32::try_from(days_from_civil(year, month, day)).ok()
}

pub fn format_time(micros: i64) -> String {
    let secs = micros / MICROS_PER_SECOND;
    let frac = micros % MICROS_PER_SECOND;
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if frac == 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}:{:02}.{:06}", h, m, s, frac)
    }
}

pub fn parse_time(s: &str) -> Option<i64> {
    let caps = TIME_RE.captures(s)?;
    let h: i64 = caps[1].parse().ok()?;
    let m: i64 = caps[2].parse().ok()?;
    let sec: i64 = caps[3].parse().ok()?;
    if h > 23 || m > 59 || sec > 59 {
        return None;
    }
    let frac = match caps.get(4) {
        Some(f) => {
            let digits = f.as_str();
            let value: i64 = digits.parse().ok()?;
            value * 10_i64.pow(6 - digits.len() as u32)
        }
        None => 0,
    };
    Some((h * 3600 + m * 60 + sec) * MICROS_PER_SECOND + frac)
}

pub fn format_datetime(micros: i64) -> String {
    let days = micros.div_euclid(MICROS_PER_DAY);
    let time = micros.rem_euclid(MICROS_PER_DAY);
    let (y, m, d) = civil_from_days(days);
    format!("{:04}-{:02}-{:02} {}", y, m, d, format_time(time))
}

/// Accepts a space or `T` separator, an optional trailing `Z`, or a bare date.
pub fn parse_datetime(s: &str) -> Option<i64> {
    let s = s.strip_suffix('Z').unwrap_or(s);
    if s.len() == 10 {
        return parse_date(s).map(|d| i64::from(d) * MICROS_PER_DAY);
    }
    if s.len() < 19 {
        return None;
    }
    let (date, rest) = s.split_at(10);
    let time = rest.strip_prefix(' ').or_else(|| rest.strip_prefix('T'))?;
    let days = parse_date(date)?;
    let micros = parse_time(time)?;
    Some(i64::from(days) * MICROS_PER_DAY + micros)
}

pub fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Accepts hyphenated or bare 32-digit hex, any case.
pub fn parse_uuid(s: &str) -> Option<[u8; 16]> {
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 || (s.len() != 32 && s.len() != 36) {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(out)
}

/// Normalize decimal text: drop a leading `+`, redundant leading zeros and a
/// trailing bare `.`; add a `0` before a bare leading `.`. Trailing fractional
/// zeros carry scale and are kept.
pub fn canonical_decimal(s: &str) -> Option<String> {
    let s = s.trim();
    if !DECIMAL_RE.is_match(s) {
        return None;
    }
    let (negative, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    let int_part = int_part.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let mut out = String::with_capacity(s.len() + 1);
    if negative {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    Some(out)
}
