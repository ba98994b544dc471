use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Broad media category, rendered by the `{type}` template token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Photo,
    Video,
    Audio,
    Other,
}

impl MediaType {
    pub fn folder_name(self) -> &'static str {
        match self {
            MediaType::Photo => "Photos",
            MediaType::Video => "Videos",
            MediaType::Audio => "Audio",
            MediaType::Other => "Other",
        }
    }
}

/// Camera RAW extensions that mime_guess reports as application/octet-stream.
const RAW_PHOTO_EXTS: &[&str] = &[
    "arw", "cr2", "cr3", "dng", "nef", "orf", "pef", "raf", "raw", "rw2", "srw",
];

/// AVCHD stream containers without a registered MIME type.
const RAW_VIDEO_EXTS: &[&str] = &["mts", "m2ts"];

pub fn detect_media_type(path: &Path) -> MediaType {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if RAW_PHOTO_EXTS.contains(&ext.as_str()) {
            return MediaType::Photo;
        }
        if RAW_VIDEO_EXTS.contains(&ext.as_str()) {
            return MediaType::Video;
        }
    }

    match mime_guess::from_path(path).first() {
        Some(mime) if mime.type_() == mime_guess::mime::IMAGE => MediaType::Photo,
        Some(mime) if mime.type_() == mime_guess::mime::VIDEO => MediaType::Video,
        Some(mime) if mime.type_() == mime_guess::mime::AUDIO => MediaType::Audio,
        _ => MediaType::Other,
    }
}

/// Filesystem timestamps captured when the file was scanned.
#[derive(Debug, Clone, Copy)]
pub struct FileTimes {
    /// Birth time, where the platform reports one.
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

/// One file owned by the pipeline for the duration of a run.
#[derive(Debug)]
pub struct MediaFile {
    pub source_path: PathBuf,
    pub size: u64,
    pub media_type: MediaType,
    pub times: FileTimes,
    checksum: OnceLock<String>,
}

impl MediaFile {
    pub fn new(source_path: PathBuf, size: u64, media_type: MediaType, times: FileTimes) -> Self {
        Self {
            source_path,
            size,
            media_type,
            times,
            checksum: OnceLock::new(),
        }
    }

    /// Build from a path on disk, reading size and timestamps via stat.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let modified = DateTime::<Utc>::from(meta.modified()?);
        let created = meta.created().ok().map(DateTime::<Utc>::from);
        Ok(Self::new(
            path.to_path_buf(),
            meta.len(),
            detect_media_type(path),
            FileTimes { created, modified },
        ))
    }

    pub fn file_name(&self) -> &str {
        self.source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Lowercased extension, or None for extensionless files.
    pub fn extension_lower(&self) -> Option<String> {
        self.source_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// SHA-256 of the content, hex encoded. Hashed on first use, then cached
    /// so identity checks and planning share one read of the file.
    pub fn checksum(&self) -> io::Result<&str> {
        if let Some(hash) = self.checksum.get() {
            return Ok(hash.as_str());
        }
        let hash = hash_file(&self.source_path)?;
        Ok(self.checksum.get_or_init(|| hash).as_str())
    }
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
