use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::date::ResolvedDate;
use crate::media::MediaFile;

pub const DEFAULT_TEMPLATE: &str =
    "{type}/{year}/{month}/{year}-{month}-{day}_{hour}-{minute}-{second}{subsecond}";

/// How long a planner waits on a directory lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Subsecond,
    Type,
    OriginalName,
}

impl Token {
    fn parse(name: &str) -> Option<Token> {
        match name {
            "year" => Some(Token::Year),
            "month" => Some(Token::Month),
            "day" => Some(Token::Day),
            "hour" => Some(Token::Hour),
            "minute" => Some(Token::Minute),
            "second" => Some(Token::Second),
            "subsecond" => Some(Token::Subsecond),
            "type" => Some(Token::Type),
            "original_name" => Some(Token::OriginalName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Token(Token),
}

/// A destination naming template, parsed once per run. Rendering is pure:
/// the same file and timestamp always produce the same relative stem.
#[derive(Debug, Clone)]
pub struct NameTemplate {
    segments: Vec<Segment>,
}

impl NameTemplate {
    pub fn parse(template: &str) -> anyhow::Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            if c != '{' {
                if c == '}' {
                    bail!("unmatched '}}' in template '{}'", template);
                }
                literal.push(c);
                continue;
            }
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                match c {
                    '}' => {
                        closed = true;
                        break;
                    }
                    '{' => bail!("nested '{{' in template '{}'", template),
                    _ => name.push(c),
                }
            }
            if !closed {
                bail!("unclosed '{{' in template '{}'", template);
            }
            let token = Token::parse(&name)
                .with_context(|| format!("unknown template token '{{{}}}'", name))?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Token(token));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            bail!("empty template");
        }
        Ok(Self { segments })
    }

    /// Render the relative destination stem (no extension, no collision
    /// suffix), using '/' between path segments.
    fn render(&self, media: &MediaFile, timestamp: DateTime<Utc>, subsec: Option<&str>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token(token) => match token {
                    Token::Year => out.push_str(&format!("{:04}", timestamp.year())),
                    Token::Month => out.push_str(&format!("{:02}", timestamp.month())),
                    Token::Day => out.push_str(&format!("{:02}", timestamp.day())),
                    Token::Hour => out.push_str(&format!("{:02}", timestamp.hour())),
                    Token::Minute => out.push_str(&format!("{:02}", timestamp.minute())),
                    Token::Second => out.push_str(&format!("{:02}", timestamp.second())),
                    Token::Subsecond => {
                        if let Some(digits) = subsec {
                            out.push_str("-ss");
                            out.push_str(digits);
                        }
                    }
                    Token::Type => out.push_str(media.media_type.folder_name()),
                    Token::OriginalName => {
                        let stem = media
                            .source_path
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or("unnamed");
                        out.push_str(stem);
                    }
                },
            }
        }
        out
    }
}

/// What occupies a destination slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupant {
    /// Content with a known checksum: claimed this run, or journaled by an
    /// earlier run and still present on disk.
    Known(String),
    /// A pre-existing file the ledger knows nothing about. Never matched
    /// for reuse, never overwritten; the probe steps past it.
    Foreign,
}

/// A directory lock could not be acquired within the timeout.
#[derive(Debug, Clone)]
pub struct LockTimeout {
    pub dir: PathBuf,
}

impl fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out waiting for directory lock on {}", self.dir.display())
    }
}

impl std::error::Error for LockTimeout {}

type DirSlots = HashMap<String, Occupant>;

/// In-memory occupancy of destination paths, locked per directory so
/// planners for unrelated directories never contend.
pub struct OccupancyIndex {
    dirs: Mutex<HashMap<PathBuf, Arc<Mutex<DirSlots>>>>,
    lock_timeout: Duration,
}

impl OccupancyIndex {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            dirs: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    fn dir_slots(&self, dir: &Path) -> Arc<Mutex<DirSlots>> {
        let mut dirs = self.dirs.lock().unwrap();
        dirs.entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    fn lock_dir<'a>(
        &self,
        slots: &'a Mutex<DirSlots>,
        dir: &Path,
    ) -> Result<MutexGuard<'a, DirSlots>, LockTimeout> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut wait = Duration::from_micros(50);
        loop {
            match slots.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }
            if Instant::now() >= deadline {
                return Err(LockTimeout {
                    dir: dir.to_path_buf(),
                });
            }
            std::thread::sleep(wait);
            wait = (wait * 2).min(Duration::from_millis(10));
        }
    }

    /// Record content journaled at `path` with a known checksum.
    /// Overwrites a Foreign marker from the filesystem walk.
    pub fn seed_known(&self, path: &Path, checksum: &str) {
        if let (Some(dir), Some(name)) = (path.parent(), file_name_str(path)) {
            let slots = self.dir_slots(dir);
            let mut slots = slots.lock().unwrap();
            slots.insert(name, Occupant::Known(checksum.to_string()));
        }
    }

    /// Record a pre-existing file with unknown provenance. Keeps any
    /// already-seeded Known entry for the same slot.
    pub fn seed_foreign(&self, path: &Path) {
        if let (Some(dir), Some(name)) = (path.parent(), file_name_str(path)) {
            let slots = self.dir_slots(dir);
            let mut slots = slots.lock().unwrap();
            slots.entry(name).or_insert(Occupant::Foreign);
        }
    }

    #[cfg(test)]
    fn occupant(&self, path: &Path) -> Option<Occupant> {
        let dir = path.parent()?;
        let name = file_name_str(path)?;
        let slots = self.dir_slots(dir);
        let slots = slots.lock().unwrap();
        slots.get(&name).cloned()
    }
}

fn file_name_str(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(|n| n.to_string())
}

/// A planned destination for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDestination {
    pub path: PathBuf,
    /// Collision suffix ordinal; 0 means no suffix.
    pub suffix: u32,
    /// True when the slot already holds identical content and the transfer
    /// should be skipped as a duplicate.
    pub duplicate: bool,
}

fn file_name_for(stem: &str, suffix: u32, extension: Option<&str>) -> String {
    let mut name = String::from(stem);
    if suffix > 0 {
        name.push_str(&format!("_{:03}", suffix));
    }
    if let Some(ext) = extension {
        name.push('.');
        name.push_str(ext);
    }
    name
}

/// Plan the destination for one file and claim the chosen slot, so that
/// concurrent planners can never hand out the same path twice.
pub fn plan(
    media: &MediaFile,
    resolved: &ResolvedDate,
    subsec: Option<&str>,
    template: &NameTemplate,
    dest_root: &Path,
    index: &OccupancyIndex,
) -> anyhow::Result<PlannedDestination> {
    let checksum = media
        .checksum()
        .with_context(|| format!("hashing {}", media.source_path.display()))?
        .to_string();

    let rel = template.render(media, resolved.timestamp, subsec);
    let rel_path = Path::new(&rel);
    let stem = rel_path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("template rendered an empty file name from '{}'", rel))?;
    let dir = match rel_path.parent() {
        Some(parent) if parent != Path::new("") => dest_root.join(parent),
        _ => dest_root.to_path_buf(),
    };
    let extension = media.extension_lower();

    let slots = index.dir_slots(&dir);
    let mut slots = index.lock_dir(&slots, &dir)?;

    let mut suffix = 0u32;
    loop {
        let name = file_name_for(stem, suffix, extension.as_deref());
        match slots.get(&name) {
            None => {
                slots.insert(name.clone(), Occupant::Known(checksum));
                return Ok(PlannedDestination {
                    path: dir.join(name),
                    suffix,
                    duplicate: false,
                });
            }
            Some(Occupant::Known(existing)) if *existing == checksum => {
                return Ok(PlannedDestination {
                    path: dir.join(name),
                    suffix,
                    duplicate: true,
                });
            }
            Some(_) => suffix += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::{Confidence, DateSource};
    use crate::media::MediaFile;
    use chrono::TimeZone;

    fn resolved(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> ResolvedDate {
        ResolvedDate {
            timestamp: Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap(),
            source: DateSource::OriginalCapture,
            confidence: Confidence::Exact,
        }
    }

    fn plan_in_temp(
        media: &MediaFile,
        rd: &ResolvedDate,
        subsec: Option<&str>,
        root: &Path,
        index: &OccupancyIndex,
    ) -> PlannedDestination {
        let template = NameTemplate::parse(DEFAULT_TEMPLATE).unwrap();
        plan(media, rd, subsec, &template, root, index).unwrap()
    }

    // Write a real file so the lazy checksum has bytes to read.
    fn media_on_disk(dir: &Path, name: &str, content: &[u8]) -> MediaFile {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        MediaFile::from_path(&path).unwrap()
    }

    #[test]
    fn test_default_template_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let media = media_on_disk(tmp.path(), "IMG_0001.jpg", b"aaa");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");

        let planned = plan_in_temp(&media, &resolved(2023, 6, 15, 14, 30, 2), None, &out, &index);
        assert_eq!(
            planned.path,
            PathBuf::from("/out/Photos/2023/06/2023-06-15_14-30-02.jpg")
        );
        assert_eq!(planned.suffix, 0);
        assert!(!planned.duplicate);
    }

    #[test]
    fn test_subsecond_token() {
        let tmp = tempfile::tempdir().unwrap();
        let media = media_on_disk(tmp.path(), "IMG_0001.jpg", b"aaa");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");

        let planned = plan_in_temp(
            &media,
            &resolved(2023, 6, 15, 14, 30, 2),
            Some("042"),
            &out,
            &index,
        );
        assert_eq!(
            planned.path,
            PathBuf::from("/out/Photos/2023/06/2023-06-15_14-30-02-ss042.jpg")
        );
    }

    #[test]
    fn test_collision_assigns_suffixes() {
        let tmp = tempfile::tempdir().unwrap();
        let a = media_on_disk(tmp.path(), "a.jpg", b"content a");
        let b = media_on_disk(tmp.path(), "b.jpg", b"content b");
        let c = media_on_disk(tmp.path(), "c.jpg", b"content c");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");
        let rd = resolved(2023, 6, 15, 14, 30, 2);

        let pa = plan_in_temp(&a, &rd, None, &out, &index);
        let pb = plan_in_temp(&b, &rd, None, &out, &index);
        let pc = plan_in_temp(&c, &rd, None, &out, &index);

        assert_eq!(pa.path.file_name().unwrap(), "2023-06-15_14-30-02.jpg");
        assert_eq!(pb.path.file_name().unwrap(), "2023-06-15_14-30-02_001.jpg");
        assert_eq!(pc.path.file_name().unwrap(), "2023-06-15_14-30-02_002.jpg");
        assert_eq!((pa.suffix, pb.suffix, pc.suffix), (0, 1, 2));
    }

    #[test]
    fn test_identical_content_is_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let a = media_on_disk(tmp.path(), "a.jpg", b"same bytes");
        let b = media_on_disk(tmp.path(), "b.jpg", b"same bytes");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");
        let rd = resolved(2023, 6, 15, 14, 30, 2);

        let pa = plan_in_temp(&a, &rd, None, &out, &index);
        let pb = plan_in_temp(&b, &rd, None, &out, &index);

        assert!(!pa.duplicate);
        assert!(pb.duplicate);
        assert_eq!(pa.path, pb.path);
    }

    #[test]
    fn test_replanning_same_file_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let a = media_on_disk(tmp.path(), "a.jpg", b"same bytes");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");
        let rd = resolved(2023, 6, 15, 14, 30, 2);

        let first = plan_in_temp(&a, &rd, None, &out, &index);
        let second = plan_in_temp(&a, &rd, None, &out, &index);
        assert_eq!(first.path, second.path);
        assert!(second.duplicate);
    }

    #[test]
    fn test_foreign_occupant_probed_past() {
        let tmp = tempfile::tempdir().unwrap();
        let a = media_on_disk(tmp.path(), "a.jpg", b"new content");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");
        index.seed_foreign(Path::new("/out/Photos/2023/06/2023-06-15_14-30-02.jpg"));

        let planned = plan_in_temp(&a, &resolved(2023, 6, 15, 14, 30, 2), None, &out, &index);
        assert_eq!(
            planned.path.file_name().unwrap(),
            "2023-06-15_14-30-02_001.jpg"
        );
        assert!(!planned.duplicate);
    }

    #[test]
    fn test_seed_known_enables_cross_run_dedup() {
        let tmp = tempfile::tempdir().unwrap();
        let a = media_on_disk(tmp.path(), "a.jpg", b"same bytes");
        let checksum = a.checksum().unwrap().to_string();
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");
        let dest = Path::new("/out/Photos/2023/06/2023-06-15_14-30-02.jpg");
        index.seed_known(dest, &checksum);

        let planned = plan_in_temp(&a, &resolved(2023, 6, 15, 14, 30, 2), None, &out, &index);
        assert!(planned.duplicate);
        assert_eq!(planned.path, dest);
    }

    #[test]
    fn test_seed_known_overrides_foreign() {
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let path = Path::new("/out/a.jpg");
        index.seed_foreign(path);
        index.seed_known(path, "abc");
        assert_eq!(index.occupant(path), Some(Occupant::Known("abc".into())));

        // And the reverse order keeps the Known entry too
        index.seed_foreign(path);
        assert_eq!(index.occupant(path), Some(Occupant::Known("abc".into())));
    }

    #[test]
    fn test_contended_directory_lock_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let media = media_on_disk(tmp.path(), "a.jpg", b"content");
        let index = OccupancyIndex::new(Duration::from_millis(100));
        let out = PathBuf::from("/out");
        let template = NameTemplate::parse(DEFAULT_TEMPLATE).unwrap();
        let rd = resolved(2023, 6, 15, 14, 30, 2);

        // Hold the slot lock for the directory the planner will need
        let slots = index.dir_slots(Path::new("/out/Photos/2023/06"));
        let _guard = slots.lock().unwrap();

        let result = std::thread::scope(|s| {
            s.spawn(|| plan(&media, &rd, None, &template, &out, &index))
                .join()
                .unwrap()
        });

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<LockTimeout>().is_some());
        assert!(err.to_string().contains("directory lock"));
    }

    #[test]
    fn test_extension_lowercased_and_appended_after_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let a = media_on_disk(tmp.path(), "a.JPG", b"one");
        let b = media_on_disk(tmp.path(), "b.JPG", b"two");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");
        let rd = resolved(2023, 6, 15, 14, 30, 2);

        let pa = plan_in_temp(&a, &rd, None, &out, &index);
        let pb = plan_in_temp(&b, &rd, None, &out, &index);
        assert_eq!(pa.path.file_name().unwrap(), "2023-06-15_14-30-02.jpg");
        assert_eq!(pb.path.file_name().unwrap(), "2023-06-15_14-30-02_001.jpg");
    }

    #[test]
    fn test_template_tokens_and_errors() {
        assert!(NameTemplate::parse("{year}/{unknown}").is_err());
        assert!(NameTemplate::parse("{year").is_err());
        assert!(NameTemplate::parse("year}").is_err());
        assert!(NameTemplate::parse("").is_err());
        assert!(NameTemplate::parse("{year}/{original_name}").is_ok());
    }

    #[test]
    fn test_original_name_token() {
        let tmp = tempfile::tempdir().unwrap();
        let media = media_on_disk(tmp.path(), "holiday.jpg", b"x");
        let index = OccupancyIndex::new(DEFAULT_LOCK_TIMEOUT);
        let out = PathBuf::from("/out");
        let template = NameTemplate::parse("{year}/{original_name}").unwrap();

        let planned = plan(
            &media,
            &resolved(2021, 3, 4, 5, 6, 7),
            None,
            &template,
            &out,
            &index,
        )
        .unwrap();
        assert_eq!(planned.path, PathBuf::from("/out/2021/holiday.jpg"));
    }
}
