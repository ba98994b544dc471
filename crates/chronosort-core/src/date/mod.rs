pub mod filename;
pub mod parse;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::media::FileTimes;
use crate::tags::TagSet;

/// How trustworthy a resolved timestamp is. Ordered best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Exact,
    Derived,
    Fallback,
    Unknown,
}

/// Where a timestamp candidate comes from. The order in
/// `ResolverConfig::order` decides precedence; the confidence tier travels
/// with the source, not with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateSource {
    OriginalCapture,
    CreateDate,
    GpsTimestamp,
    ExtendedDate,
    FilenamePattern,
    FsCreated,
    FsModified,
}

impl DateSource {
    pub const ALL: &'static [DateSource] = &[
        DateSource::OriginalCapture,
        DateSource::CreateDate,
        DateSource::GpsTimestamp,
        DateSource::ExtendedDate,
        DateSource::FilenamePattern,
        DateSource::FsCreated,
        DateSource::FsModified,
    ];

    pub fn confidence(self) -> Confidence {
        match self {
            DateSource::OriginalCapture | DateSource::CreateDate => Confidence::Exact,
            DateSource::GpsTimestamp | DateSource::ExtendedDate | DateSource::FilenamePattern => {
                Confidence::Derived
            }
            DateSource::FsCreated => Confidence::Fallback,
            DateSource::FsModified => Confidence::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DateSource::OriginalCapture => "original-capture",
            DateSource::CreateDate => "create-date",
            DateSource::GpsTimestamp => "gps-timestamp",
            DateSource::ExtendedDate => "extended-date",
            DateSource::FilenamePattern => "filename-pattern",
            DateSource::FsCreated => "fs-created",
            DateSource::FsModified => "fs-modified",
        }
    }
}

impl fmt::Display for DateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DateSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateSource::ALL
            .iter()
            .copied()
            .find(|source| source.name() == s.trim())
            .ok_or_else(|| format!("unknown date source '{}'", s))
    }
}

/// A resolved capture timestamp with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    pub timestamp: DateTime<Utc>,
    pub source: DateSource,
    pub confidence: Confidence,
}

/// Resolver policy: source precedence and the plausibility window.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Sources to consult, highest priority first.
    pub order: Vec<DateSource>,
    /// Candidates before this instant are treated as corrupt.
    pub min_plausible: DateTime<Utc>,
    /// Tolerated clock skew into the future.
    pub clock_skew: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            order: DateSource::ALL.to_vec(),
            min_plausible: Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).unwrap(),
            clock_skew: Duration::days(1),
        }
    }
}

impl ResolverConfig {
    fn plausible(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        ts >= self.min_plausible && ts <= now + self.clock_skew
    }
}

/// Resolve the capture timestamp for one file. Total: when every candidate
/// is missing or implausible, the modification time is reported as-is with
/// Unknown confidence.
pub fn resolve(
    tags: &TagSet,
    times: FileTimes,
    file_name: &str,
    config: &ResolverConfig,
) -> ResolvedDate {
    resolve_at(tags, times, file_name, config, Utc::now())
}

pub(crate) fn resolve_at(
    tags: &TagSet,
    times: FileTimes,
    file_name: &str,
    config: &ResolverConfig,
    now: DateTime<Utc>,
) -> ResolvedDate {
    let offset = tags.utc_offset.as_deref().and_then(parse::parse_utc_offset);

    for source in &config.order {
        let candidate = match source {
            DateSource::OriginalCapture => tags
                .original_capture
                .as_deref()
                .and_then(|v| parse::parse_datetime(v, offset)),
            DateSource::CreateDate => tags
                .create_date
                .as_deref()
                .and_then(|v| parse::parse_datetime(v, offset)),
            // GPS clocks are UTC by definition; the offset tag does not apply
            DateSource::GpsTimestamp => tags
                .gps_timestamp
                .as_deref()
                .and_then(|v| parse::parse_datetime(v, None)),
            DateSource::ExtendedDate => tags
                .extended_date
                .as_deref()
                .and_then(|v| parse::parse_datetime(v, offset)),
            DateSource::FilenamePattern => filename::date_from_filename(file_name)
                .and_then(|naive| parse::naive_to_utc(naive, offset)),
            DateSource::FsCreated => times.created,
            DateSource::FsModified => Some(times.modified),
        };

        if let Some(ts) = candidate {
            if config.plausible(ts, now) {
                return ResolvedDate {
                    timestamp: ts,
                    source: *source,
                    confidence: source.confidence(),
                };
            }
        }
    }

    ResolvedDate {
        timestamp: times.modified,
        source: DateSource::FsModified,
        confidence: Confidence::Unknown,
    }
}
