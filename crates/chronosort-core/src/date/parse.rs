use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};

/// Accepted datetime layouts, tried in order. EXIF's colon-separated form
/// comes first since it dominates real tag values.
const DATETIME_FORMATS: &[&str] = &[
    "%Y:%m:%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y:%m:%d %H-%M-%S",
    "%Y-%m-%d %H-%M-%S",
];

/// Date-only layouts; midnight is assumed.
const DATE_FORMATS: &[&str] = &["%Y:%m:%d", "%Y-%m-%d"];

/// Parse a standalone offset tag value like "+09:00", "-0500" or "Z" into
/// seconds east of UTC.
pub fn parse_utc_offset(value: &str) -> Option<i32> {
    let v = value.trim();
    if v.eq_ignore_ascii_case("z") {
        return Some(0);
    }
    let bytes = v.as_bytes();
    let sign = match bytes.first()? {
        b'+' => 1i32,
        b'-' => -1i32,
        _ => return None,
    };
    let digits: String = v[1..].chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

/// Split a trailing "Z", "+HH:MM" or "+HHMM" offset off a datetime value.
/// Returns the remaining body and the offset in seconds east, if any.
fn split_trailing_offset(value: &str) -> (&str, Option<i32>) {
    let v = value.trim_end();
    if v.len() > 1 && (v.ends_with('Z') || v.ends_with('z')) {
        return (v[..v.len() - 1].trim_end(), Some(0));
    }
    for tail_len in [6usize, 5] {
        if v.len() <= tail_len {
            continue;
        }
        let (body, tail) = v.split_at(v.len() - tail_len);
        if tail.starts_with('+') || tail.starts_with('-') {
            if let Some(offset) = parse_utc_offset(tail) {
                return (body.trim_end(), Some(offset));
            }
        }
    }
    (v, None)
}

/// Strip a fractional-seconds suffix like ".123".
fn strip_fraction(value: &str) -> &str {
    if let Some(pos) = value.rfind('.') {
        let tail = &value[pos + 1..];
        if !tail.is_empty() && tail.len() <= 9 && tail.chars().all(|c| c.is_ascii_digit()) {
            return &value[..pos];
        }
    }
    value
}

fn to_utc(naive: NaiveDateTime, offset_seconds: Option<i32>) -> Option<DateTime<Utc>> {
    match offset_seconds {
        Some(seconds) => {
            let offset = FixedOffset::east_opt(seconds)?;
            naive
                .and_local_timezone(offset)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
        }
        None => Some(naive.and_utc()),
    }
}

/// Parse a tag value into UTC. An offset embedded in the value wins over
/// `fallback_offset`; with neither, the naive timestamp is taken as UTC.
pub fn parse_datetime(value: &str, fallback_offset: Option<i32>) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (body, embedded) = split_trailing_offset(trimmed);
    let body = strip_fraction(body);
    let offset = embedded.or(fallback_offset);

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(body, format) {
            return to_utc(naive, offset);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(body, format) {
            return to_utc(date.and_hms_opt(0, 0, 0)?, offset);
        }
    }
    None
}

/// Lift a naive timestamp (from a filename or similar) into UTC, applying a
/// known offset when one exists.
pub fn naive_to_utc(naive: NaiveDateTime, offset_seconds: Option<i32>) -> Option<DateTime<Utc>> {
    to_utc(naive, offset_seconds)
}
