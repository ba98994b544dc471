use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::date::{self, DateSource, ResolverConfig};
use crate::ledger::{Ledger, OperationRecord, OperationStatus};
use crate::media::{self, MediaFile};
use crate::plan::{self, NameTemplate, OccupancyIndex};
use crate::tags::{MetadataSource, TagSet};
use crate::transfer::{self, TransferConfig, TransferMode};
use crate::ThrottledProgress;

/// Token for cooperative cancellation.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns Ok(()) to continue, Err if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            return Err(CancelledError);
        }
        Ok(())
    }
}

/// Error indicating the operation was cancelled.
#[derive(Debug, Clone)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation cancelled")
    }
}

impl std::error::Error for CancelledError {}

/// One failed file and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureNote {
    pub path: PathBuf,
    pub reason: String,
}

pub(crate) struct RunContext<'a> {
    pub metadata: &'a dyn MetadataSource,
    pub resolver: &'a ResolverConfig,
    pub template: &'a NameTemplate,
    pub dest_root: &'a Path,
    pub index: &'a OccupancyIndex,
    pub ledger: &'a Ledger,
    pub transfer: &'a TransferConfig,
    pub resume: bool,
    pub workers: usize,
}

#[derive(Debug, Default)]
pub(crate) struct RunOutput {
    pub committed: u64,
    pub planned: u64,
    pub skipped_duplicate: u64,
    pub resumed: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub failures: Vec<FailureNote>,
    pub warnings: Vec<String>,
    /// Terminal records in source order, for reporting.
    pub records: Vec<OperationRecord>,
    /// How often each date source decided a file's destination.
    pub source_counts: Vec<(DateSource, u64)>,
}

enum FileOutcome {
    Done {
        record: OperationRecord,
        /// None when the file failed before a date was resolved.
        source: Option<DateSource>,
        warnings: Vec<String>,
    },
    Resumed,
}

/// Run the pipeline over `files` on a bounded pool of scoped workers. Every
/// file is isolated: a failure becomes a Failed record, never a run abort.
pub(crate) fn run(
    files: &[MediaFile],
    ctx: &RunContext<'_>,
    cancel: Option<&CancellationToken>,
    progress: &ThrottledProgress<'_>,
) -> RunOutput {
    let total = files.len() as u64;
    let cursor = AtomicUsize::new(0);
    let processed = AtomicU64::new(0);

    let committed = AtomicU64::new(0);
    let planned = AtomicU64::new(0);
    let skipped = AtomicU64::new(0);
    let resumed = AtomicU64::new(0);
    let failed = AtomicU64::new(0);
    let source_counts: Vec<AtomicU64> =
        DateSource::ALL.iter().map(|_| AtomicU64::new(0)).collect();

    let failures: Mutex<Vec<FailureNote>> = Mutex::new(Vec::new());
    let warnings: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let records: Mutex<Vec<(usize, OperationRecord)>> = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for _ in 0..ctx.workers {
            s.spawn(|| loop {
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        break;
                    }
                }
                let i = cursor.fetch_add(1, Ordering::SeqCst);
                if i >= files.len() {
                    break;
                }
                let file = &files[i];

                match process_one(file, ctx) {
                    FileOutcome::Resumed => {
                        resumed.fetch_add(1, Ordering::Relaxed);
                    }
                    FileOutcome::Done {
                        record,
                        source,
                        warnings: mut file_warnings,
                    } => {
                        if ctx.transfer.mode != TransferMode::DryRun {
                            if let Err(e) = ctx.ledger.record(record.clone()) {
                                file_warnings.push(format!(
                                    "could not journal {}: {:#}",
                                    record.source_path.display(),
                                    e
                                ));
                            }
                        }
                        match record.status {
                            OperationStatus::Committed => {
                                committed.fetch_add(1, Ordering::Relaxed);
                            }
                            OperationStatus::Pending => {
                                planned.fetch_add(1, Ordering::Relaxed);
                            }
                            OperationStatus::SkippedDuplicate => {
                                skipped.fetch_add(1, Ordering::Relaxed);
                            }
                            OperationStatus::Failed => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                failures.lock().unwrap().push(FailureNote {
                                    path: record.source_path.clone(),
                                    reason: record
                                        .error
                                        .clone()
                                        .unwrap_or_else(|| "unknown error".to_string()),
                                });
                            }
                        }
                        if let Some(source) = source {
                            if let Some(pos) = DateSource::ALL.iter().position(|s| *s == source) {
                                source_counts[pos].fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        if !file_warnings.is_empty() {
                            warnings.lock().unwrap().extend(file_warnings);
                        }
                        records.lock().unwrap().push((i, record));
                    }
                }

                let current = processed.fetch_add(1, Ordering::Relaxed);
                progress.report("organize", current, total, file.file_name());
            });
        }
    });

    let mut indexed = records.into_inner().unwrap();
    indexed.sort_by_key(|(i, _)| *i);

    RunOutput {
        committed: committed.into_inner(),
        planned: planned.into_inner(),
        skipped_duplicate: skipped.into_inner(),
        resumed: resumed.into_inner(),
        failed: failed.into_inner(),
        cancelled: cancel.map(|t| t.is_cancelled()).unwrap_or(false),
        failures: failures.into_inner().unwrap(),
        warnings: warnings.into_inner().unwrap(),
        records: indexed.into_iter().map(|(_, r)| r).collect(),
        source_counts: DateSource::ALL
            .iter()
            .zip(&source_counts)
            .map(|(s, c)| (*s, c.load(Ordering::Relaxed)))
            .filter(|(_, n)| *n > 0)
            .collect(),
    }
}

fn process_one(file: &MediaFile, ctx: &RunContext<'_>) -> FileOutcome {
    // Checksum doubles as the file's identity for resume and planning
    let checksum = match file.checksum() {
        Ok(c) => c.to_string(),
        Err(e) => {
            return FileOutcome::Done {
                record: OperationRecord::failed(
                    file.source_path.clone(),
                    PathBuf::new(),
                    String::new(),
                    ctx.transfer.mode,
                    format!("hashing source: {}", e),
                ),
                source: None,
                warnings: Vec::new(),
            };
        }
    };

    if ctx.resume {
        if let Some(prev) = ctx.ledger.lookup(&checksum) {
            if prev.status == OperationStatus::Committed
                && prev.dest_path.exists()
                && media::hash_file(&prev.dest_path).ok().as_deref() == Some(checksum.as_str())
            {
                return FileOutcome::Resumed;
            }
        }
    }

    // A failed extractor is not a failed file; the resolver falls back to
    // filename and filesystem sources.
    let tags = match ctx.metadata.get_tags(&file.source_path) {
        Ok(raw) => TagSet::from_raw(&raw),
        Err(_) => TagSet::default(),
    };
    let resolved = date::resolve(&tags, file.times, file.file_name(), ctx.resolver);

    let subsec = tags.subsec_digits();
    let planned = match plan::plan(
        file,
        &resolved,
        subsec.as_deref(),
        ctx.template,
        ctx.dest_root,
        ctx.index,
    ) {
        Ok(planned) => planned,
        Err(e) => {
            return FileOutcome::Done {
                record: OperationRecord::failed(
                    file.source_path.clone(),
                    PathBuf::new(),
                    checksum,
                    ctx.transfer.mode,
                    format!("planning destination: {:#}", e),
                ),
                source: Some(resolved.source),
                warnings: Vec::new(),
            };
        }
    };

    let outcome = transfer::execute(file, &planned, &resolved, ctx.transfer);
    FileOutcome::Done {
        record: outcome.record,
        source: Some(resolved.source),
        warnings: outcome.warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{MetadataUnavailable, RawTags};

    struct FixedCapture;

    impl MetadataSource for FixedCapture {
        fn get_tags(&self, _: &Path) -> Result<RawTags, MetadataUnavailable> {
            Ok([("DateTimeOriginal".to_string(), "2023:06:15 14:30:02".to_string())]
                .into_iter()
                .collect())
        }
    }

    fn noop(_: &str, _: u64, _: u64, _: &str) {}

    #[test]
    fn test_vanished_file_journals_failed_and_run_continues() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let keep = src.path().join("keep.jpg");
        let gone = src.path().join("gone.jpg");
        std::fs::write(&keep, b"keep bytes").unwrap();
        std::fs::write(&gone, b"gone bytes").unwrap();

        let files = vec![
            MediaFile::from_path(&keep).unwrap(),
            MediaFile::from_path(&gone).unwrap(),
        ];
        std::fs::remove_file(&gone).unwrap();

        let resolver = ResolverConfig::default();
        let template = NameTemplate::parse(plan::DEFAULT_TEMPLATE).unwrap();
        let index = OccupancyIndex::new(plan::DEFAULT_LOCK_TIMEOUT);
        let ledger = Ledger::open(dest.path()).unwrap();
        let transfer = TransferConfig {
            mode: TransferMode::Copy,
            retry_limit: 1,
            attempt_deadline: None,
        };
        let ctx = RunContext {
            metadata: &FixedCapture,
            resolver: &resolver,
            template: &template,
            dest_root: dest.path(),
            index: &index,
            ledger: &ledger,
            transfer: &transfer,
            resume: false,
            workers: 2,
        };

        let out = run(&files, &ctx, None, &ThrottledProgress::new(&noop));

        assert_eq!(out.committed, 1);
        assert_eq!(out.failed, 1);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].path, gone);
        assert!(out.failures[0].reason.contains("hashing source"));
        assert_eq!(out.records[1].status, OperationStatus::Failed);
        assert!(dest
            .path()
            .join("Photos/2023/06/2023-06-15_14-30-02.jpg")
            .exists());

        // The failure lands in the journal alongside the commit
        let reloaded = Ledger::load(dest.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.committed().len(), 1);
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }

    #[test]
    fn test_cancelled_error_displays() {
        let err = anyhow::Error::from(CancelledError);
        assert!(err.to_string().contains("cancelled"));
        assert!(err.is::<CancelledError>());
    }
}
