use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use chronosort_core::{
    CancellationToken, CancelledError, DateSource, OperationStatus, OrganizeOptions,
    OrganizeResult, RunControl, TransferMode, DEFAULT_TEMPLATE,
};

#[derive(Parser)]
#[command(
    name = "chronosort",
    version,
    about = "Organize photos, videos, and audio into date-based folders"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Organize media files from a source tree into the destination layout
    Organize(OrganizeArgs),
    /// Reverse the moves recorded in a destination's ledger
    Undo(UndoArgs),
}

#[derive(Args)]
struct OrganizeArgs {
    /// Directory to scan for media files
    source_dir: PathBuf,

    /// Destination root for the organized layout
    dest_dir: PathBuf,

    /// Transfer mode
    #[arg(long, value_enum, default_value = "copy")]
    mode: ModeArg,

    /// Worker thread count (default: one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Skip files the destination ledger already accounts for
    #[arg(long)]
    resume: bool,

    /// Destination naming template
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    pattern: String,

    /// Treat resolved dates before this day as implausible (YYYY-MM-DD)
    #[arg(long, value_parser = parse_naive_date)]
    min_date: Option<chrono::NaiveDate>,

    /// Accept dates this far into the future, e.g. 1d, 12h, 90m, 30s
    #[arg(long, value_parser = parse_duration)]
    skew_tolerance: Option<Duration>,

    /// Comma-separated date source precedence, highest first
    #[arg(long, value_delimiter = ',', value_parser = parse_date_source)]
    date_sources: Option<Vec<DateSource>>,

    /// Attempts per file transfer before giving up
    #[arg(long)]
    retries: Option<u32>,

    /// Wall-clock budget per transfer attempt, e.g. 30s, 5m
    #[arg(long, value_parser = parse_duration)]
    transfer_timeout: Option<Duration>,

    /// Also organize files that are not photo, video, or audio
    #[arg(long)]
    include_other: bool,

    /// After a move run, remove source directories left empty
    #[arg(long)]
    prune_source: bool,
}

#[derive(Args)]
struct UndoArgs {
    /// Destination root holding the ledger to reverse
    dest_dir: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Move,
    Copy,
    DryRun,
}

impl From<ModeArg> for TransferMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Move => TransferMode::Move,
            ModeArg::Copy => TransferMode::Copy,
            ModeArg::DryRun => TransferMode::DryRun,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Organize(args) => run_organize(args),
        Command::Undo(args) => run_undo(args),
    }
}

fn run_organize(args: OrganizeArgs) -> ExitCode {
    let t_total = Instant::now();

    let token = CancellationToken::new();
    {
        let token = token.clone();
        if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
            eprintln!("Warning: could not install Ctrl-C handler: {}", e);
        }
    }

    let mode = TransferMode::from(args.mode);
    let options = OrganizeOptions {
        source: args.source_dir,
        dest: args.dest_dir.clone(),
        mode,
        threads: args.threads,
        template: args.pattern,
        min_date: args.min_date,
        skew_tolerance: args.skew_tolerance,
        date_sources: args.date_sources,
        retry_limit: args.retries,
        transfer_timeout: args.transfer_timeout,
        include_other: args.include_other,
        prune_source: args.prune_source,
    };
    let control = RunControl::new()
        .with_resume(args.resume)
        .with_cancel_token(token);

    let progress = ProgressRender::new();
    let result = chronosort_core::organize_with_control(
        &options,
        &control,
        &|stage, current, total, message| progress.update(stage, current, total, message),
    );
    progress.finish();

    let result = match result {
        Ok(result) => result,
        Err(e) => return report_error(&e),
    };

    print_summary(&args.dest_dir, &result, mode, t_total.elapsed());

    if result.cancelled {
        ExitCode::from(130)
    } else if result.failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_undo(args: UndoArgs) -> ExitCode {
    let progress = ProgressRender::new();
    let summary = chronosort_core::undo(&args.dest_dir, &|stage, current, total, message| {
        progress.update(stage, current, total, message)
    });
    progress.finish();

    match summary {
        Ok(summary) => {
            eprintln!(
                "Restored {} files, {} already in place",
                summary.restored, summary.already_restored
            );
            if let Some(reason) = &summary.stopped {
                eprintln!("Stopped early: {}", reason);
                eprintln!("Resolve the conflict and re-run undo to continue.");
                return ExitCode::from(1);
            }
            ExitCode::SUCCESS
        }
        Err(e) => report_error(&e),
    }
}

fn report_error(err: &anyhow::Error) -> ExitCode {
    if err.is::<CancelledError>() {
        eprintln!("Interrupted before any files were organized.");
        return ExitCode::from(130);
    }
    eprintln!("Error: {:#}", err);
    ExitCode::from(2)
}

fn print_summary(dest: &Path, result: &OrganizeResult, mode: TransferMode, elapsed: Duration) {
    for warning in &result.warnings {
        eprintln!("Warning: {}", warning);
    }

    if mode == TransferMode::DryRun {
        for rec in &result.records {
            if rec.status == OperationStatus::Pending {
                let rel = pathdiff::diff_paths(&rec.dest_path, dest)
                    .unwrap_or_else(|| rec.dest_path.clone());
                eprintln!("  {} -> {}", rec.source_path.display(), rel.display());
            }
        }
        eprintln!(
            "Dry run: {} files would be organized, {} duplicates skipped, {} failed ({:.2}s)",
            result.planned,
            result.skipped_duplicate,
            result.failed,
            elapsed.as_secs_f64()
        );
    } else {
        eprintln!(
            "Done! {} files scanned: {} organized, {} duplicates skipped, {} resumed, {} failed ({:.2}s)",
            result.total_files,
            result.committed,
            result.skipped_duplicate,
            result.resumed,
            result.failed,
            elapsed.as_secs_f64()
        );
    }

    if !result.source_counts.is_empty() {
        let parts: Vec<String> = result
            .source_counts
            .iter()
            .map(|(source, n)| format!("{} {}", n, source))
            .collect();
        eprintln!("Dates resolved from: {}", parts.join(", "));
    }
    if result.swept_orphans > 0 {
        eprintln!(
            "Swept {} orphaned temp files from the destination",
            result.swept_orphans
        );
    }
    if result.pruned_dirs > 0 {
        eprintln!("Removed {} empty source directories", result.pruned_dirs);
    }
    if !result.failures.is_empty() {
        eprintln!("Failed files:");
        for failure in &result.failures {
            eprintln!("  {}: {}", failure.path.display(), failure.reason);
        }
    }
    if result.cancelled {
        eprintln!("Interrupted. Re-run with --resume to continue where this run stopped.");
    }
}

/// Renders core progress callbacks as one indicatif bar per stage.
struct ProgressRender {
    state: Mutex<Option<(String, u64, ProgressBar)>>,
}

impl ProgressRender {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    fn update(&self, stage: &str, current: u64, total: u64, message: &str) {
        let mut state = self.state.lock().unwrap();
        let stale = match &*state {
            Some((name, len, _)) => name != stage || *len != total,
            None => true,
        };
        if stale {
            if let Some((_, _, old)) = state.take() {
                old.finish_and_clear();
            }
            // Stages report total 0 while the workload is still being counted
            let pb = if total == 0 {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner} {pos} {msg}")
                        .unwrap(),
                );
                pb
            } else {
                let pb = ProgressBar::new(total);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("[{bar:40}] {pos}/{len} {msg}")
                        .unwrap(),
                );
                pb
            };
            *state = Some((stage.to_string(), total, pb));
        }
        if let Some((_, _, pb)) = &*state {
            let pos = if total == 0 { current } else { current + 1 };
            pb.set_position(pos);
            pb.set_message(message.to_string());
        }
    }

    fn finish(&self) {
        if let Some((_, _, pb)) = self.state.lock().unwrap().take() {
            pb.finish_and_clear();
        }
    }
}

fn parse_naive_date(s: &str) -> Result<chrono::NaiveDate, String> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn parse_date_source(s: &str) -> Result<DateSource, String> {
    s.parse()
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    if digits.is_empty() {
        return Err(format!("invalid duration '{}'", s));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    let secs = match unit {
        "s" => Some(value),
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(3600),
        "d" => value.checked_mul(86_400),
        _ => return Err(format!("unknown duration unit '{}'", unit)),
    };
    let secs = secs.ok_or_else(|| format!("duration '{}' is too large", s))?;
    Ok(Duration::from_secs(secs))
}
