use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

struct DatePattern {
    regex: &'static LazyLock<Regex>,
    format: &'static str,
}

static RE_0: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}(01|02|03|04|05|06|07|08|09|10|11|12)[0-3]\d-\d{6})").unwrap());
static RE_1: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}(01|02|03|04|05|06|07|08|09|10|11|12)[0-3]\d_\d{6})").unwrap());
static RE_2: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}-(01|02|03|04|05|06|07|08|09|10|11|12)-[0-3]\d_\d{2}-\d{2}-\d{2})").unwrap());
static RE_3: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}-(01|02|03|04|05|06|07|08|09|10|11|12)-[0-3]\d-\d{2}-\d{2}-\d{2})").unwrap());
static RE_4: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}-(01|02|03|04|05|06|07|08|09|10|11|12)-[0-3]\d-\d{6})").unwrap());
static RE_5: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}(01|02|03|04|05|06|07|08|09|10|11|12)[0-3]\d{7})").unwrap());
static RE_6: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}_(01|02|03|04|05|06|07|08|09|10|11|12)_[0-3]\d_\d{2}_\d{2}_\d{2})").unwrap());
static RE_7: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?P<date>(20|19|18)\d{2}-(01|02|03|04|05|06|07|08|09|10|11|12)-[0-3]\d)").unwrap());

static PATTERNS: &[DatePattern] = &[
    DatePattern { regex: &RE_0, format: "%Y%m%d-%H%M%S" },
    DatePattern { regex: &RE_1, format: "%Y%m%d_%H%M%S" },
    DatePattern { regex: &RE_2, format: "%Y-%m-%d_%H-%M-%S" },
    DatePattern { regex: &RE_3, format: "%Y-%m-%d-%H-%M-%S" },
    DatePattern { regex: &RE_4, format: "%Y-%m-%d-%H%M%S" },
    DatePattern { regex: &RE_5, format: "%Y%m%d%H%M%S" },
    DatePattern { regex: &RE_6, format: "%Y_%m_%d_%H_%M_%S" },
    // Date-only, tried last so datetime forms take precedence
    DatePattern { regex: &RE_7, format: "%Y-%m-%d" },
];

/// Guess a naive timestamp from digits embedded in a filename. Date-only
/// matches are taken as midnight.
pub fn date_from_filename(filename: &str) -> Option<NaiveDateTime> {
    let basename = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);

    for pat in PATTERNS {
        if let Some(caps) = pat.regex.captures(basename) {
            if let Some(date_str) = caps.name("date") {
                // For the YYYYMMDDhhmmss pattern, only take first 14 chars
                let s = if pat.format == "%Y%m%d%H%M%S" {
                    &date_str.as_str()[..14.min(date_str.as_str().len())]
                } else {
                    date_str.as_str()
                };
                if pat.format == "%Y-%m-%d" {
                    if let Ok(d) = NaiveDate::parse_from_str(s, pat.format) {
                        return d.and_hms_opt(0, 0, 0);
                    }
                    continue;
                }
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, pat.format) {
                    return Some(dt);
                }
            }
        }
    }

    None
}
