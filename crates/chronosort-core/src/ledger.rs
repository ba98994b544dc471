use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::media;
use crate::transfer::{self, TransferMode};

pub const LEDGER_FILENAME: &str = ".chronosort-ledger.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Committed,
    Failed,
    SkippedDuplicate,
}

fn default_record_mode() -> TransferMode {
    TransferMode::Copy
}

/// One journaled outcome. Records are append-only: a retry of a failed file
/// appends a new record instead of editing the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub checksum: String,
    pub status: OperationStatus,
    #[serde(default = "default_record_mode")]
    pub mode: TransferMode,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationRecord {
    pub fn new(
        source_path: PathBuf,
        dest_path: PathBuf,
        checksum: String,
        status: OperationStatus,
        mode: TransferMode,
    ) -> Self {
        Self {
            source_path,
            dest_path,
            checksum,
            status,
            mode,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(
        source_path: PathBuf,
        dest_path: PathBuf,
        checksum: String,
        mode: TransferMode,
        reason: String,
    ) -> Self {
        Self {
            source_path,
            dest_path,
            checksum,
            status: OperationStatus::Failed,
            mode,
            completed_at: Utc::now(),
            error: Some(reason),
        }
    }
}

struct LedgerInner {
    writer: Option<File>,
    records: Vec<OperationRecord>,
    last_by_checksum: HashMap<String, usize>,
}

/// Append-only journal stored at the destination root. All appends go
/// through one lock, so records never interleave; reads are answered from
/// the in-memory index.
pub struct Ledger {
    path: PathBuf,
    inner: Mutex<LedgerInner>,
}

/// Outcome of an undo pass.
#[derive(Debug, Default)]
pub struct UndoSummary {
    pub restored: u64,
    pub already_restored: u64,
    /// First verification failure that halted the replay, if any.
    pub stopped: Option<String>,
}

impl Ledger {
    /// Open the journal for a real run: existing records are loaded and new
    /// ones will be appended. Creates the destination root if needed.
    pub fn open(dest_root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dest_root)
            .with_context(|| format!("creating destination root {}", dest_root.display()))?;
        let path = dest_root.join(LEDGER_FILENAME);
        let records = read_records(&path)?;
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening ledger {}", path.display()))?;
        Ok(Self::from_parts(path, Some(writer), records))
    }

    /// Load the journal read-only, for dry runs and undo. A missing file is
    /// an empty ledger; nothing is created on disk.
    pub fn load(dest_root: &Path) -> anyhow::Result<Self> {
        let path = dest_root.join(LEDGER_FILENAME);
        let records = read_records(&path)?;
        Ok(Self::from_parts(path, None, records))
    }

    fn from_parts(path: PathBuf, writer: Option<File>, records: Vec<OperationRecord>) -> Self {
        let mut last_by_checksum = HashMap::with_capacity(records.len());
        for (i, rec) in records.iter().enumerate() {
            last_by_checksum.insert(rec.checksum.clone(), i);
        }
        Self {
            path,
            inner: Mutex::new(LedgerInner {
                writer,
                records,
                last_by_checksum,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and index it.
    pub fn record(&self, rec: OperationRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&rec).context("serializing ledger record")?;
        line.push('\n');

        let mut inner = self.inner.lock().unwrap();
        let writer = inner
            .writer
            .as_mut()
            .context("ledger was opened read-only")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        writer
            .sync_data()
            .with_context(|| format!("syncing {}", self.path.display()))?;

        let idx = inner.records.len();
        inner.last_by_checksum.insert(rec.checksum.clone(), idx);
        inner.records.push(rec);
        Ok(())
    }

    /// Latest record for a source checksum, if any.
    pub fn lookup(&self, checksum: &str) -> Option<OperationRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .last_by_checksum
            .get(checksum)
            .map(|&i| inner.records[i].clone())
    }

    /// All Committed records, oldest first.
    pub fn committed(&self) -> Vec<OperationRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| r.status == OperationStatus::Committed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk Committed move records newest first and put each file back at
    /// its recorded source, verifying checksums on both ends. Stops at the
    /// first state it cannot resolve and reports it in the summary.
    pub fn replay_reverse(&self, progress: &crate::ThrottledProgress) -> UndoSummary {
        let mut moves: Vec<(usize, OperationRecord)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.status == OperationStatus::Committed && r.mode == TransferMode::Move
                })
                .map(|(i, r)| (i, r.clone()))
                .collect()
        };
        // Newest first; append order breaks completed_at ties
        moves.sort_by(|(ia, a), (ib, b)| b.completed_at.cmp(&a.completed_at).then(ib.cmp(ia)));

        let mut summary = UndoSummary::default();
        let total = moves.len() as u64;

        for (i, (_, rec)) in moves.iter().enumerate() {
            progress.report(
                "undo",
                i as u64,
                total,
                &rec.dest_path.display().to_string(),
            );
            match undo_one(rec) {
                Ok(UndoStep::Restored) => summary.restored += 1,
                Ok(UndoStep::AlreadyRestored) => summary.already_restored += 1,
                Err(reason) => {
                    summary.stopped = Some(reason);
                    break;
                }
            }
        }
        summary
    }
}

enum UndoStep {
    Restored,
    AlreadyRestored,
}

fn undo_one(rec: &OperationRecord) -> Result<UndoStep, String> {
    let dest = &rec.dest_path;
    let source = &rec.source_path;

    if !dest.exists() {
        // Tolerate a replayed undo: the content may already be home
        if source.exists() && media::hash_file(source).ok().as_deref() == Some(rec.checksum.as_str()) {
            return Ok(UndoStep::AlreadyRestored);
        }
        return Err(format!(
            "{}: destination missing and source does not hold the recorded content",
            dest.display()
        ));
    }

    match media::hash_file(dest) {
        Ok(hash) if hash == rec.checksum => {}
        Ok(_) => {
            return Err(format!(
                "{}: content no longer matches the ledger record",
                dest.display()
            ));
        }
        Err(e) => return Err(format!("{}: cannot verify content: {}", dest.display(), e)),
    }

    if source.exists() {
        match media::hash_file(source) {
            Ok(hash) if hash == rec.checksum => {
                // Both ends already hold the content; drop the copy at dest
                return match fs::remove_file(dest) {
                    Ok(()) => Ok(UndoStep::Restored),
                    Err(e) => Err(format!("{}: cannot remove: {}", dest.display(), e)),
                };
            }
            Ok(_) => {
                return Err(format!(
                    "{}: source already holds different content",
                    source.display()
                ));
            }
            Err(e) => {
                return Err(format!("{}: cannot verify content: {}", source.display(), e))
            }
        }
    }

    transfer::copy_verified(dest, source, &rec.checksum, None)
        .map_err(|e| format!("restoring {}: {:#}", source.display(), e))?;
    fs::remove_file(dest).map_err(|e| format!("{}: cannot remove: {}", dest.display(), e))?;
    Ok(UndoStep::Restored)
}

fn read_records(path: &Path) -> anyhow::Result<Vec<OperationRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<_, _>>()
        .with_context(|| format!("reading {}", path.display()))?;
    let last = lines.len().saturating_sub(1);

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OperationRecord>(line) {
            Ok(rec) => records.push(rec),
            Err(e) => {
                // A torn final line is expected after a hard kill
                if i != last {
                    eprintln!(
                        "warning: skipping malformed ledger line {} in {}: {}",
                        i + 1,
                        path.display(),
                        e
                    );
                }
            }
        }
    }
    Ok(records)
}
