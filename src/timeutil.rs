use chrono::{
    DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

/// Storage format for every timestamp in the database (UTC, seconds).
pub const DB_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Default correlation window between sensor start and activity-log start.
pub const DEFAULT_TOLERANCE_SECS: i64 = 60;

pub fn default_tolerance() -> Duration {
    Duration::seconds(DEFAULT_TOLERANCE_SECS)
}

/// Parse an IANA zone name without any fallback.
pub fn parse_tz(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// Resolve a zone name, falling back to the host zone (then UTC) with a warning.
pub fn resolve_tz(name: &str) -> Tz {
    if let Some(tz) = parse_tz(name) {
        return tz;
    }
    let host = host_tz();
    tracing::warn!(
        timezone = name,
        fallback = host.name(),
        "unknown timezone, falling back to host local zone"
    );
    host
}

pub fn host_tz() -> Tz {
    iana_time_zone::get_timezone()
        .ok()
        .and_then(|n| parse_tz(&n))
        .unwrap_or(Tz::UTC)
}

/// Epoch seconds (fractional allowed) to UTC at millisecond precision.
pub fn epoch_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// The dedup key: UTC truncated to whole seconds, rendered as stored.
pub fn dedup_key<Z: TimeZone>(dt: &DateTime<Z>) -> String {
    truncate_to_second(&dt.with_timezone(&Utc))
        .format(DB_DATETIME_FMT)
        .to_string()
}

pub fn truncate_to_second(dt: &DateTime<Utc>) -> DateTime<Utc> {
    dt.with_nanosecond(0).unwrap_or(*dt)
}

pub fn parse_db_datetime(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), DB_DATETIME_FMT)
        .ok()
        .map(|n| n.and_utc())
}

const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Parse an activity-log wall-clock date (no zone attached).
pub fn parse_local_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Attach `tz` to a wall-clock time. DST gaps and folds give `None`.
pub fn localize(naive: &NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(..) | LocalResult::None => None,
    }
}

pub fn utc_offset_secs(tz: Tz, at: &DateTime<Utc>) -> i32 {
    tz.offset_from_utc_datetime(&at.naive_utc())
        .fix()
        .local_minus_utc()
}

/// Zones whose UTC offset at `at` equals `current` shifted by `delta`,
/// rounded to the hour.
///
/// `delta` is activity UTC minus sensor UTC, as observed when the log was
/// read in `current`. With `current` = UTC this lists the zones whose offset
/// equals the delta itself.
pub fn suggest_timezones(current: Tz, delta: Duration, at: &DateTime<Utc>) -> Vec<String> {
    let wanted = i64::from(utc_offset_secs(current, at)) + delta.num_seconds();
    #[allow(clippy::cast_possible_truncation)]
    let wanted_hours = (wanted as f64 / 3600.0).round() as i64;

    let mut out: Vec<String> = chrono_tz::TZ_VARIANTS
        .iter()
        .filter(|tz| i64::from(utc_offset_secs(**tz, at)) == wanted_hours * 3600)
        .map(|tz| tz.name().to_string())
        .collect();
    out.sort();
    out
}

/// `+HH:MM` / `-HH:MM` rendering of a signed delta.
pub fn format_offset(delta: Duration) -> String {
    let total = delta.num_seconds();
    let sign = if total < 0 { '-' } else { '+' };
    let total = total.unsigned_abs();
    format!("{sign}{:02}:{:02}", total / 3600, (total % 3600) / 60)
}
