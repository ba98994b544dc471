use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::Builder;

use crate::date::ResolvedDate;
use crate::ledger::{OperationRecord, OperationStatus};
use crate::media::MediaFile;
use crate::plan::PlannedDestination;

/// Temp-file naming; the startup sweep deletes orphans matching this shape.
pub const TMP_PREFIX: &str = ".chronosort-";
pub const TMP_SUFFIX: &str = ".tmp";

pub const DEFAULT_RETRY_LIMIT: u32 = 3;

const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Move,
    Copy,
    DryRun,
}

/// Executor policy for one run.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub mode: TransferMode,
    /// Attempts per file before the file is journaled as Failed.
    pub retry_limit: u32,
    /// Wall-clock budget per attempt; expiry counts as a failed attempt.
    pub attempt_deadline: Option<Duration>,
}

/// The terminal record for one file, plus non-fatal warnings.
#[derive(Debug)]
pub struct TransferOutcome {
    pub record: OperationRecord,
    pub warnings: Vec<String>,
}

/// Per-attempt wall-clock budget.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub(crate) fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.started.elapsed() > self.limit {
            bail!("attempt exceeded {:?} transfer deadline", self.limit);
        }
        Ok(())
    }
}

fn check_deadline(deadline: Option<Deadline>) -> anyhow::Result<()> {
    match deadline {
        Some(d) => d.check(),
        None => Ok(()),
    }
}

fn hash_with_deadline(path: &Path, deadline: Option<Deadline>) -> anyhow::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; COPY_BUF_SIZE];
    loop {
        check_deadline(deadline)?;
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copy `source` to `dest` through a hidden temp file in the destination
/// directory, verify the written bytes against `expected`, then rename into
/// place. Any failure leaves no trace at the destination: the temp file is
/// removed on drop and `dest` is only ever created by the final rename.
pub(crate) fn copy_verified(
    source: &Path,
    dest: &Path,
    expected: &str,
    deadline: Option<Deadline>,
) -> anyhow::Result<()> {
    let dest_dir = dest
        .parent()
        .with_context(|| format!("destination {} has no parent directory", dest.display()))?;
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating directory {}", dest_dir.display()))?;

    let mut tmp = Builder::new()
        .prefix(TMP_PREFIX)
        .suffix(TMP_SUFFIX)
        .tempfile_in(dest_dir)
        .with_context(|| format!("creating temp file in {}", dest_dir.display()))?;

    {
        let mut reader = File::open(source)
            .with_context(|| format!("opening source {}", source.display()))?;
        let writer = tmp.as_file_mut();
        let mut buffer = [0u8; COPY_BUF_SIZE];
        loop {
            check_deadline(deadline)?;
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
        }
        writer.sync_all().context("syncing temp file")?;
    }

    // Re-read what actually landed on disk before claiming success
    let written = hash_with_deadline(tmp.path(), deadline)
        .with_context(|| format!("verifying temp copy of {}", source.display()))?;
    if written != expected {
        bail!(
            "checksum mismatch copying {}: expected {}, wrote {}",
            source.display(),
            expected,
            written
        );
    }

    tmp.persist(dest)
        .map_err(|e| anyhow::Error::from(e.error))
        .with_context(|| format!("renaming into {}", dest.display()))?;
    Ok(())
}

/// Execute one planned transfer. The source is never modified on failure;
/// in move mode it is deleted only after the destination is fully in place.
pub fn execute(
    media: &MediaFile,
    planned: &PlannedDestination,
    resolved: &ResolvedDate,
    config: &TransferConfig,
) -> TransferOutcome {
    let mut warnings = Vec::new();

    let checksum = match media.checksum() {
        Ok(c) => c.to_string(),
        Err(e) => {
            return TransferOutcome {
                record: OperationRecord::failed(
                    media.source_path.clone(),
                    planned.path.clone(),
                    String::new(),
                    config.mode,
                    format!("hashing source: {}", e),
                ),
                warnings,
            };
        }
    };

    if config.mode == TransferMode::DryRun {
        return TransferOutcome {
            record: OperationRecord::new(
                media.source_path.clone(),
                planned.path.clone(),
                checksum,
                OperationStatus::Pending,
                config.mode,
            ),
            warnings,
        };
    }

    if planned.duplicate {
        return TransferOutcome {
            record: OperationRecord::new(
                media.source_path.clone(),
                planned.path.clone(),
                checksum,
                OperationStatus::SkippedDuplicate,
                config.mode,
            ),
            warnings,
        };
    }

    let attempts = config.retry_limit.max(1);
    let mut last_error = String::new();
    for _ in 0..attempts {
        let deadline = config.attempt_deadline.map(Deadline::start);
        match copy_verified(&media.source_path, &planned.path, &checksum, deadline) {
            Ok(()) => {
                let mtime = filetime::FileTime::from_unix_time(resolved.timestamp.timestamp(), 0);
                if let Err(e) = filetime::set_file_mtime(&planned.path, mtime) {
                    warnings.push(format!(
                        "could not set mtime on {}: {}",
                        planned.path.display(),
                        e
                    ));
                }
                if config.mode == TransferMode::Move {
                    if let Err(e) = fs::remove_file(&media.source_path) {
                        warnings.push(format!(
                            "destination committed but source {} not removed: {}",
                            media.source_path.display(),
                            e
                        ));
                    }
                }
                return TransferOutcome {
                    record: OperationRecord::new(
                        media.source_path.clone(),
                        planned.path.clone(),
                        checksum,
                        OperationStatus::Committed,
                        config.mode,
                    ),
                    warnings,
                };
            }
            Err(e) => last_error = format!("{:#}", e),
        }
    }

    TransferOutcome {
        record: OperationRecord::failed(
            media.source_path.clone(),
            planned.path.clone(),
            checksum,
            config.mode,
            format!("{} attempts failed, last: {}", attempts, last_error),
        ),
        warnings,
    }
}
