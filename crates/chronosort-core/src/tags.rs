use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use exif::{In, Reader, Tag};

/// Raw tag dictionary as produced by a metadata extractor.
pub type RawTags = HashMap<String, String>;

/// A metadata extractor could not produce tags for a file. The resolver
/// treats this as "no candidates from this source" and moves on.
#[derive(Debug, Clone)]
pub struct MetadataUnavailable {
    pub reason: String,
}

impl MetadataUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MetadataUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metadata unavailable: {}", self.reason)
    }
}

impl std::error::Error for MetadataUnavailable {}

/// Source of raw tag dictionaries. Swappable so tests can feed deterministic
/// tags without touching a real extractor.
pub trait MetadataSource: Send + Sync {
    fn get_tags(&self, path: &Path) -> Result<RawTags, MetadataUnavailable>;
}

// Alias tables follow exiftool's vocabulary. First present alias wins.
const ORIGINAL_CAPTURE_TAGS: &[&str] = &["DateTimeOriginal"];
const CREATE_DATE_TAGS: &[&str] = &["CreateDate", "DateTimeDigitized", "DateTimeCreated"];
const GPS_DATETIME_TAGS: &[&str] = &["GPSDateTime"];
const GPS_DATE_TAGS: &[&str] = &["GPSDateStamp"];
const GPS_TIME_TAGS: &[&str] = &["GPSTimeStamp"];
const EXTENDED_DATE_TAGS: &[&str] = &[
    "MediaCreateDate",
    "TrackCreateDate",
    "CreationDate",
    "XMP:CreateDate",
];
const UTC_OFFSET_TAGS: &[&str] = &["OffsetTimeOriginal", "OffsetTime", "OffsetTimeDigitized"];
const SUBSEC_TAGS: &[&str] = &["SubSecTimeOriginal", "SubSecTimeDigitized", "SubSecTime"];

/// Closed projection of a raw tag dictionary onto the fields the resolver
/// and planner recognize. Unrecognized tags are dropped at construction.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    pub original_capture: Option<String>,
    pub create_date: Option<String>,
    pub gps_timestamp: Option<String>,
    pub extended_date: Option<String>,
    pub utc_offset: Option<String>,
    pub subsec: Option<String>,
}

impl TagSet {
    pub fn from_raw(raw: &RawTags) -> Self {
        let pick = |aliases: &[&str]| -> Option<String> {
            aliases
                .iter()
                .find_map(|key| raw.get(*key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // A split GPS date/time pair composes into one candidate value
        let gps_timestamp = pick(GPS_DATETIME_TAGS).or_else(|| {
            match (pick(GPS_DATE_TAGS), pick(GPS_TIME_TAGS)) {
                (Some(date), Some(time)) => Some(format!("{} {}", date, time)),
                _ => None,
            }
        });

        Self {
            original_capture: pick(ORIGINAL_CAPTURE_TAGS),
            create_date: pick(CREATE_DATE_TAGS),
            gps_timestamp,
            extended_date: pick(EXTENDED_DATE_TAGS),
            utc_offset: pick(UTC_OFFSET_TAGS),
            subsec: pick(SUBSEC_TAGS),
        }
    }

    /// Subsecond digits for the `{subsecond}` token. Zero-valued or
    /// non-numeric subsec tags carry no information and yield None.
    pub fn subsec_digits(&self) -> Option<String> {
        let raw = self.subsec.as_deref()?;
        let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).take(6).collect();
        if digits.is_empty() || digits.chars().all(|c| c == '0') {
            return None;
        }
        Some(digits)
    }
}

/// Reads EXIF headers via kamadak-exif. Tag names are normalized to the
/// exiftool vocabulary so the TagSet alias tables apply to this adapter and
/// to external tag dumps alike.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifMetadataSource;

const EXIF_TAG_NAMES: &[(Tag, &str)] = &[
    (Tag::DateTimeOriginal, "DateTimeOriginal"),
    (Tag::DateTimeDigitized, "CreateDate"),
    (Tag::DateTime, "ModifyDate"),
    (Tag::GPSDateStamp, "GPSDateStamp"),
    (Tag::GPSTimeStamp, "GPSTimeStamp"),
    (Tag::OffsetTimeOriginal, "OffsetTimeOriginal"),
    (Tag::OffsetTimeDigitized, "OffsetTimeDigitized"),
    (Tag::OffsetTime, "OffsetTime"),
    (Tag::SubSecTimeOriginal, "SubSecTimeOriginal"),
    (Tag::SubSecTimeDigitized, "SubSecTimeDigitized"),
    (Tag::SubSecTime, "SubSecTime"),
];

impl MetadataSource for ExifMetadataSource {
    fn get_tags(&self, path: &Path) -> Result<RawTags, MetadataUnavailable> {
        let file = File::open(path).map_err(|e| MetadataUnavailable::new(e.to_string()))?;
        let mut reader = BufReader::new(file);
        let exif = Reader::new()
            .read_from_container(&mut reader)
            .map_err(|e| MetadataUnavailable::new(e.to_string()))?;

        let mut raw = RawTags::new();
        for (tag, name) in EXIF_TAG_NAMES {
            if let Some(field) = exif.get_field(*tag, In::PRIMARY) {
                raw.insert((*name).to_string(), field.display_value().to_string());
            }
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawTags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_alias_priority() {
        let tags = TagSet::from_raw(&raw(&[
            ("DateTimeDigitized", "2021:05:01 10:00:00"),
            ("CreateDate", "2021:05:02 10:00:00"),
        ]));
        assert_eq!(tags.create_date.as_deref(), Some("2021:05:02 10:00:00"));
    }

    #[test]
    fn test_unrecognized_tags_dropped() {
        let tags = TagSet::from_raw(&raw(&[
            ("Artist", "someone"),
            ("ModifyDate", "2021:05:01 10:00:00"),
        ]));
        assert!(tags.original_capture.is_none());
        assert!(tags.create_date.is_none());
        assert!(tags.extended_date.is_none());
    }

    #[test]
    fn test_blank_values_ignored() {
        let tags = TagSet::from_raw(&raw(&[("DateTimeOriginal", "   ")]));
        assert!(tags.original_capture.is_none());
    }

    #[test]
    fn test_gps_pair_composes() {
        let tags = TagSet::from_raw(&raw(&[
            ("GPSDateStamp", "2023:06:15"),
            ("GPSTimeStamp", "14:30:02"),
        ]));
        assert_eq!(tags.gps_timestamp.as_deref(), Some("2023:06:15 14:30:02"));

        let date_only = TagSet::from_raw(&raw(&[("GPSDateStamp", "2023:06:15")]));
        assert!(date_only.gps_timestamp.is_none());
    }

    #[test]
    fn test_subsec_digits() {
        let some = TagSet::from_raw(&raw(&[("SubSecTimeOriginal", "042")]));
        assert_eq!(some.subsec_digits().as_deref(), Some("042"));

        let zero = TagSet::from_raw(&raw(&[("SubSecTime", "000")]));
        assert!(zero.subsec_digits().is_none());

        let junk = TagSet::from_raw(&raw(&[("SubSecTime", "n/a")]));
        assert!(junk.subsec_digits().is_none());

        let long = TagSet::from_raw(&raw(&[("SubSecTime", "123456789")]));
        assert_eq!(long.subsec_digits().as_deref(), Some("123456"));
    }

    #[test]
    fn test_exif_source_rejects_non_media() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(ExifMetadataSource.get_tags(&path).is_err());
    }
}
