pub mod date;
pub mod ledger;
pub mod media;
pub mod plan;
pub mod runner;
pub mod scan;
pub mod tags;
pub mod transfer;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::date::ResolverConfig;
use crate::ledger::Ledger;
use crate::plan::NameTemplate;
use crate::transfer::TransferConfig;

pub use date::{Confidence, DateSource, ResolvedDate};
pub use ledger::{OperationRecord, OperationStatus, UndoSummary, LEDGER_FILENAME};
pub use plan::{OccupancyIndex, Occupant, PlannedDestination, DEFAULT_TEMPLATE};
pub use runner::{CancellationToken, CancelledError, FailureNote};
pub use tags::{ExifMetadataSource, MetadataSource, MetadataUnavailable, RawTags, TagSet};
pub use transfer::{TransferMode, DEFAULT_RETRY_LIMIT};

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizeOptions {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub mode: TransferMode,
    /// Worker cap; None means one per available core.
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_template")]
    pub template: String,
    /// Resolved dates before this day are treated as corrupt.
    #[serde(default)]
    pub min_date: Option<chrono::NaiveDate>,
    /// Tolerated clock skew into the future.
    #[serde(default)]
    pub skew_tolerance: Option<Duration>,
    /// Date source precedence, highest first; None keeps the default chain.
    #[serde(default)]
    pub date_sources: Option<Vec<DateSource>>,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    /// Wall-clock budget per transfer attempt.
    #[serde(default)]
    pub transfer_timeout: Option<Duration>,
    /// Organize files that are not photo, video, or audio too.
    #[serde(default)]
    pub include_other: bool,
    /// After a move run, remove source directories left empty.
    #[serde(default)]
    pub prune_source: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrganizeResult {
    pub total_files: u64,
    pub committed: u64,
    /// Dry-run previews that would have been committed.
    pub planned: u64,
    pub skipped_duplicate: u64,
    pub resumed: u64,
    pub failed: u64,
    #[serde(default)]
    pub swept_orphans: u64,
    #[serde(default)]
    pub pruned_dirs: u64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub failures: Vec<FailureNote>,
    /// Terminal records in source order.
    #[serde(default)]
    pub records: Vec<OperationRecord>,
    /// How often each date source decided a destination.
    #[serde(default)]
    pub source_counts: Vec<(DateSource, u64)>,
}

/// Control options for run execution (resume, cancellation).
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    /// Whether to skip files the destination ledger already accounts for.
    pub resume: bool,
    /// Cancellation token for cooperative shutdown.
    pub cancel_token: Option<CancellationToken>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Type alias for progress callback
pub type ProgressCallback<'a> = dyn Fn(&str, u64, u64, &str) + Send + Sync + 'a;

/// Throttled progress reporter; emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    last_emit: std::sync::Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            last_emit: std::sync::Mutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap();
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Organize a source tree with the built-in EXIF metadata source.
pub fn organize(
    options: &OrganizeOptions,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<OrganizeResult> {
    organize_with_control(options, &RunControl::default(), progress_callback)
}

/// Organize with resume and cancellation control.
pub fn organize_with_control(
    options: &OrganizeOptions,
    control: &RunControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<OrganizeResult> {
    organize_with_source(options, control, &ExifMetadataSource, progress_callback)
}

/// Organize with a caller-supplied metadata source. This is the seam tests
/// and embedders use to substitute the extractor.
pub fn organize_with_source(
    options: &OrganizeOptions,
    control: &RunControl,
    metadata: &dyn MetadataSource,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<OrganizeResult> {
    let tp = ThrottledProgress::new(progress_callback);

    // Check for cancellation early
    if let Some(ref token) = control.cancel_token {
        token.check()?;
    }

    let template = NameTemplate::parse(&options.template)?;
    let resolver = build_resolver(options)?;
    let transfer_config = TransferConfig {
        mode: options.mode,
        retry_limit: options.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
        attempt_deadline: options.transfer_timeout,
    };
    let workers = worker_count(options.threads);
    let dry_run = options.mode == TransferMode::DryRun;

    // A dry run must leave the destination untouched, ledger included
    let ledger = if dry_run {
        Ledger::load(&options.dest)?
    } else {
        Ledger::open(&options.dest)?
    };

    // Seed destination occupancy: journaled content first, then whatever
    // else is physically present.
    let index = OccupancyIndex::new(plan::DEFAULT_LOCK_TIMEOUT);
    for rec in ledger.committed() {
        if rec.dest_path.exists() {
            index.seed_known(&rec.dest_path, &rec.checksum);
        }
    }
    let swept_orphans = scan::prepare_dest(&options.dest, &index, !dry_run)?;

    let files = scan::scan_source(&options.source, options.include_other, &tp)?;
    let total_files = files.len() as u64;
    if files.is_empty() {
        return Ok(OrganizeResult {
            total_files,
            swept_orphans,
            ..OrganizeResult::default()
        });
    }

    if let Some(ref token) = control.cancel_token {
        token.check()?;
    }

    let ctx = runner::RunContext {
        metadata,
        resolver: &resolver,
        template: &template,
        dest_root: &options.dest,
        index: &index,
        ledger: &ledger,
        transfer: &transfer_config,
        resume: control.resume,
        workers,
    };
    let out = runner::run(&files, &ctx, control.cancel_token.as_ref(), &tp);

    let pruned_dirs = if options.prune_source && options.mode == TransferMode::Move && !out.cancelled
    {
        scan::prune_empty_dirs(&options.source)
    } else {
        0
    };

    Ok(OrganizeResult {
        total_files,
        committed: out.committed,
        planned: out.planned,
        skipped_duplicate: out.skipped_duplicate,
        resumed: out.resumed,
        failed: out.failed,
        swept_orphans,
        pruned_dirs,
        cancelled: out.cancelled,
        warnings: out.warnings,
        failures: out.failures,
        records: out.records,
        source_counts: out.source_counts,
    })
}

/// Reverse the committed moves journaled at `dest_root`, newest first.
pub fn undo(dest_root: &Path, progress_callback: &ProgressCallback) -> anyhow::Result<UndoSummary> {
    let tp = ThrottledProgress::new(progress_callback);
    let ledger = Ledger::load(dest_root)?;
    Ok(ledger.replay_reverse(&tp))
}

fn build_resolver(options: &OrganizeOptions) -> anyhow::Result<ResolverConfig> {
    let mut config = ResolverConfig::default();
    if let Some(min) = options.min_date {
        let midnight = min
            .and_hms_opt(0, 0, 0)
            .context("invalid minimum plausible date")?;
        config.min_plausible = midnight.and_utc();
    }
    if let Some(skew) = options.skew_tolerance {
        config.clock_skew =
            chrono::Duration::from_std(skew).context("clock skew tolerance out of range")?;
    }
    if let Some(sources) = &options.date_sources {
        anyhow::ensure!(!sources.is_empty(), "date source list must not be empty");
        for (i, source) in sources.iter().enumerate() {
            anyhow::ensure!(
                !sources[..i].contains(source),
                "duplicate date source '{}'",
                source
            );
        }
        config.order = sources.clone();
    }
    Ok(config)
}

fn worker_count(requested: Option<usize>) -> usize {
    let available = rayon::current_num_threads().max(1);
    match requested {
        Some(n) => n.clamp(1, available),
        None => available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::fs;

    /// Deterministic stand-in for the EXIF extractor, keyed by file name.
    struct FakeSource {
        by_name: HashMap<String, RawTags>,
    }

    impl FakeSource {
        fn new(entries: &[(&str, &[(&str, &str)])]) -> Self {
            let by_name = entries
                .iter()
                .map(|(name, tags)| {
                    let raw: RawTags = tags
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    (name.to_string(), raw)
                })
                .collect();
            Self { by_name }
        }
    }

    impl MetadataSource for FakeSource {
        fn get_tags(&self, path: &Path) -> Result<RawTags, MetadataUnavailable> {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            self.by_name
                .get(name)
                .cloned()
                .ok_or_else(|| MetadataUnavailable::new("no tags recorded"))
        }
    }

    fn noop(_: &str, _: u64, _: u64, _: &str) {}

    fn options(source: &Path, dest: &Path, mode: TransferMode) -> OrganizeOptions {
        OrganizeOptions {
            source: source.to_path_buf(),
            dest: dest.to_path_buf(),
            mode,
            threads: Some(2),
            template: DEFAULT_TEMPLATE.to_string(),
            min_date: None,
            skew_tolerance: None,
            date_sources: None,
            retry_limit: None,
            transfer_timeout: None,
            include_other: false,
            prune_source: false,
        }
    }

    #[test]
    fn test_exif_date_lands_in_dated_path() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("IMG_0001.jpg"), b"photo bytes").unwrap();

        let fake = FakeSource::new(&[(
            "IMG_0001.jpg",
            &[("DateTimeOriginal", "2023:06:15 14:30:02")],
        )]);
        let result = organize_with_source(
            &options(&src, &dst, TransferMode::Move),
            &RunControl::new(),
            &fake,
            &noop,
        )
        .unwrap();

        assert_eq!(result.committed, 1);
        assert_eq!(result.failed, 0);
        let dest = dst.join("Photos/2023/06/2023-06-15_14-30-02.jpg");
        assert_eq!(fs::read(&dest).unwrap(), b"photo bytes");
        assert!(!src.join("IMG_0001.jpg").exists());
        assert!(dst.join(LEDGER_FILENAME).exists());

        // Destination mtime is stamped from the resolved date
        let meta = fs::metadata(&dest).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        let expected = Utc.with_ymd_and_hms(2023, 6, 15, 14, 30, 2).unwrap();
        assert_eq!(mtime.unix_seconds(), expected.timestamp());

        assert_eq!(
            result.source_counts,
            vec![(DateSource::OriginalCapture, 1)]
        );
    }

    #[test]
    fn test_timestamp_collision_gets_suffix() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.jpg"), b"first shot").unwrap();
        fs::write(src.join("b.jpg"), b"second shot").unwrap();

        let tags: &[(&str, &str)] = &[("DateTimeOriginal", "2023:06:15 14:30:02")];
        let fake = FakeSource::new(&[("a.jpg", tags), ("b.jpg", tags)]);
        let result = organize_with_source(
            &options(&src, &dst, TransferMode::Copy),
            &RunControl::new(),
            &fake,
            &noop,
        )
        .unwrap();

        assert_eq!(result.committed, 2);
        let dir = dst.join("Photos/2023/06");
        assert!(dir.join("2023-06-15_14-30-02.jpg").exists());
        assert!(dir.join("2023-06-15_14-30-02_001.jpg").exists());
    }

    #[test]
    fn test_identical_content_skipped_as_duplicate() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.jpg"), b"same bytes").unwrap();
        fs::write(src.join("b.jpg"), b"same bytes").unwrap();

        let tags: &[(&str, &str)] = &[("DateTimeOriginal", "2023:06:15 14:30:02")];
        let fake = FakeSource::new(&[("a.jpg", tags), ("b.jpg", tags)]);
        let result = organize_with_source(
            &options(&src, &dst, TransferMode::Move),
            &RunControl::new(),
            &fake,
            &noop,
        )
        .unwrap();

        assert_eq!(result.committed, 1);
        assert_eq!(result.skipped_duplicate, 1);
        // The duplicate source is left in place for the user to review
        let remaining: Vec<_> = fs::read_dir(&src)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            fs::read_dir(dst.join("Photos/2023/06")).unwrap().count(),
            1
        );
    }

    #[test]
    fn test_tagless_file_falls_back_to_mtime() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();
        let file = src.join("random.jpg");
        fs::write(&file, b"mystery bytes").unwrap();
        let mtime = Utc.with_ymd_and_hms(2020, 1, 1, 10, 0, 0).unwrap();
        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(mtime.timestamp(), 0))
            .unwrap();

        let fake = FakeSource::new(&[]);
        let mut opts = options(&src, &dst, TransferMode::Copy);
        // Pin the chain to mtime so platform birth times cannot interfere
        opts.date_sources = Some(vec![
            DateSource::OriginalCapture,
            DateSource::CreateDate,
            DateSource::FilenamePattern,
            DateSource::FsModified,
        ]);
        let result =
            organize_with_source(&opts, &RunControl::new(), &fake, &noop).unwrap();

        assert_eq!(result.committed, 1);
        assert!(dst.join("Photos/2020/01/2020-01-01_10-00-00.jpg").exists());
        assert_eq!(result.source_counts, vec![(DateSource::FsModified, 1)]);
    }

    #[test]
    fn test_rerun_without_resume_dedups_via_ledger() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.jpg"), b"payload").unwrap();

        let tags: &[(&str, &str)] = &[("DateTimeOriginal", "2023:06:15 14:30:02")];
        let fake = FakeSource::new(&[("a.jpg", tags)]);
        let opts = options(&src, &dst, TransferMode::Copy);

        let first = organize_with_source(&opts, &RunControl::new(), &fake, &noop).unwrap();
        assert_eq!(first.committed, 1);

        let second = organize_with_source(&opts, &RunControl::new(), &fake, &noop).unwrap();
        assert_eq!(second.committed, 0);
        assert_eq!(second.skipped_duplicate, 1);
        assert_eq!(
            fs::read_dir(dst.join("Photos/2023/06")).unwrap().count(),
            1
        );
    }

    #[test]
    fn test_resume_skips_without_rewriting() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.jpg"), b"payload").unwrap();

        let tags: &[(&str, &str)] = &[("DateTimeOriginal", "2023:06:15 14:30:02")];
        let fake = FakeSource::new(&[("a.jpg", tags)]);
        let opts = options(&src, &dst, TransferMode::Copy);

        organize_with_source(&opts, &RunControl::new(), &fake, &noop).unwrap();
        let resumed = organize_with_source(
            &opts,
            &RunControl::new().with_resume(true),
            &fake,
            &noop,
        )
        .unwrap();

        assert_eq!(resumed.resumed, 1);
        assert_eq!(resumed.committed, 0);
        assert_eq!(resumed.skipped_duplicate, 0);
    }

    #[test]
    fn test_dry_run_reports_without_touching_disk() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.jpg"), b"payload").unwrap();

        let tags: &[(&str, &str)] = &[("DateTimeOriginal", "2023:06:15 14:30:02")];
        let fake = FakeSource::new(&[("a.jpg", tags)]);
        let result = organize_with_source(
            &options(&src, &dst, TransferMode::DryRun),
            &RunControl::new(),
            &fake,
            &noop,
        )
        .unwrap();

        assert_eq!(result.planned, 1);
        assert_eq!(result.committed, 0);
        assert!(!dst.exists());
        assert_eq!(result.records.len(), 1);
        assert_eq!(
            result.records[0].dest_path,
            dst.join("Photos/2023/06/2023-06-15_14-30-02.jpg")
        );
    }

    #[test]
    fn test_undo_restores_moved_tree() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(src.join("camera")).unwrap();
        fs::write(src.join("camera/a.jpg"), b"photo a").unwrap();
        fs::write(src.join("b.jpg"), b"photo b").unwrap();

        let tags_a: &[(&str, &str)] = &[("DateTimeOriginal", "2023:06:15 14:30:02")];
        let tags_b: &[(&str, &str)] = &[("DateTimeOriginal", "2024:01:02 03:04:05")];
        let fake = FakeSource::new(&[("a.jpg", tags_a), ("b.jpg", tags_b)]);
        let mut opts = options(&src, &dst, TransferMode::Move);
        opts.prune_source = true;

        let moved = organize_with_source(&opts, &RunControl::new(), &fake, &noop).unwrap();
        assert_eq!(moved.committed, 2);
        assert!(!src.join("camera").exists());

        let summary = undo(&dst, &noop).unwrap();
        assert_eq!(summary.restored, 2);
        assert!(summary.stopped.is_none());
        assert_eq!(fs::read(src.join("camera/a.jpg")).unwrap(), b"photo a");
        assert_eq!(fs::read(src.join("b.jpg")).unwrap(), b"photo b");
        assert!(!dst.join("Photos/2023/06/2023-06-15_14-30-02.jpg").exists());
    }

    #[test]
    fn test_precancelled_token_stops_before_work() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.jpg"), b"payload").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = organize_with_source(
            &options(&src, &root.path().join("out"), TransferMode::Copy),
            &RunControl::new().with_cancel_token(token),
            &FakeSource::new(&[]),
            &noop,
        )
        .unwrap_err();
        assert!(err.is::<CancelledError>());
    }

    #[test]
    fn test_empty_source_is_a_clean_noop() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        let dst = root.path().join("out");
        fs::create_dir_all(&src).unwrap();

        let result = organize_with_source(
            &options(&src, &dst, TransferMode::Move),
            &RunControl::new(),
            &FakeSource::new(&[]),
            &noop,
        )
        .unwrap();
        assert_eq!(result.total_files, 0);
        assert_eq!(result.committed, 0);
    }

    #[test]
    fn test_bad_template_and_sources_rejected() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("in");
        fs::create_dir_all(&src).unwrap();

        let mut opts = options(&src, &root.path().join("out"), TransferMode::Copy);
        opts.template = "{bogus}".to_string();
        assert!(organize_with_source(&opts, &RunControl::new(), &FakeSource::new(&[]), &noop)
            .is_err());

        let mut opts = options(&src, &root.path().join("out"), TransferMode::Copy);
        opts.date_sources = Some(vec![DateSource::FsModified, DateSource::FsModified]);
        assert!(organize_with_source(&opts, &RunControl::new(), &FakeSource::new(&[]), &noop)
            .is_err());
    }
}
