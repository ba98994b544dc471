use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::ledger::LEDGER_FILENAME;
use crate::media::{MediaFile, MediaType};
use crate::plan::OccupancyIndex;
use crate::transfer::{TMP_PREFIX, TMP_SUFFIX};
use crate::ThrottledProgress;

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

fn is_orphan_tmp(name: &str) -> bool {
    name.starts_with(TMP_PREFIX) && name.ends_with(TMP_SUFFIX)
}

/// Discover files to organize under the source root. Hidden entries are
/// skipped; unreadable entries are warned about and dropped. The result is
/// sorted by path so visitation order is stable across runs.
pub fn scan_source(
    source: &Path,
    include_other: bool,
    progress: &ThrottledProgress,
) -> anyhow::Result<Vec<MediaFile>> {
    anyhow::ensure!(
        source.is_dir(),
        "source {} is not a directory",
        source.display()
    );

    let mut paths: Vec<PathBuf> = Vec::new();
    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                eprintln!("warning: skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        paths.push(entry.into_path());
        if paths.len() % 256 == 0 {
            progress.report("scan", paths.len() as u64, 0, "Discovering files");
        }
    }

    let total = paths.len() as u64;
    let counter = AtomicU64::new(0);
    let mut files: Vec<MediaFile> = paths
        .par_iter()
        .filter_map(|path| {
            let current = counter.fetch_add(1, Ordering::Relaxed);
            progress.report("scan", current, total, "Reading file metadata");
            match MediaFile::from_path(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    eprintln!("warning: skipping {}: {}", path.display(), e);
                    None
                }
            }
        })
        .filter(|file| include_other || file.media_type != MediaType::Other)
        .collect();

    files.sort_by(|a, b| a.source_path.cmp(&b.source_path));
    Ok(files)
}

/// Walk the destination tree once: delete temp-file orphans left by a hard
/// kill (real runs only) and register every other pre-existing file in the
/// occupancy index. Returns the number of orphans swept.
pub fn prepare_dest(
    dest_root: &Path,
    index: &OccupancyIndex,
    sweep_orphans: bool,
) -> anyhow::Result<u64> {
    if !dest_root.exists() {
        return Ok(0);
    }

    let mut swept = 0u64;
    for entry in WalkDir::new(dest_root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                eprintln!("warning: skipping unreadable destination entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = match entry.file_name().to_str() {
            Some(name) => name,
            None => continue,
        };
        if name == LEDGER_FILENAME {
            continue;
        }
        if is_orphan_tmp(name) {
            if sweep_orphans {
                fs::remove_file(entry.path())
                    .with_context(|| format!("sweeping orphan {}", entry.path().display()))?;
                swept += 1;
            }
            continue;
        }
        index.seed_foreign(entry.path());
    }
    Ok(swept)
}

/// Remove directories left empty under `root`, deepest first. The root
/// itself is kept. Returns how many were removed.
pub fn prune_empty_dirs(root: &Path) -> u64 {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    dirs.sort_by(|a, b| b.components().count().cmp(&a.components().count()));

    let mut removed = 0u64;
    for dir in dirs {
        // remove_dir refuses non-empty directories
        if fs::remove_dir(&dir).is_ok() {
            removed += 1;
        }
    }
    removed
}
