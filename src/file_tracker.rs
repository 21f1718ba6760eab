//! File Tracker (§4.4): identifies files a sub-agent task created or
//! modified under its working root, and packages them for delivery.

use crate::persist::{resolve_within, PersistError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const EXCLUDED_DIR_NAMES: &[&str] = &[
    "temp",
    "tmp",
    "working",
    "cache",
    "drafts",
    "__pycache__",
    ".git",
    "node_modules",
    ".venv",
    ".cache",
];

const EXCLUDED_EXTENSIONS: &[&str] = &["tmp", "log", "pyc", "pyo", "swp", "swo"];

#[derive(Debug, Error)]
pub enum FileTrackerError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FileTrackerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime_secs: i64,
    size: u64,
}

/// One scope per `SubAgentTask`, short-lived: created at task start,
/// dropped once the task reaches a terminal state.
pub struct FileTrackerScope {
    root: PathBuf,
    started_at: DateTime<Utc>,
    baseline: HashMap<PathBuf, FileStamp>,
}

impl FileTrackerScope {
    /// Recursively snapshot every regular, non-excluded file under `root`.
    pub fn start(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let baseline = Self::snapshot(&root)?;
        Ok(Self {
            root,
            started_at: Utc::now(),
            baseline,
        })
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn snapshot(root: &Path) -> Result<HashMap<PathBuf, FileStamp>> {
        let mut out = HashMap::new();
        if !root.exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| !is_excluded_dir(e.path(), root))
        {
            let entry = entry.map_err(|e| {
                FileTrackerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if is_excluded_file(path) {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            let metadata = entry.metadata().map_err(|e| {
                FileTrackerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            out.insert(
                relative,
                FileStamp {
                    mtime_secs: metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or_default(),
                    size: metadata.len(),
                },
            );
        }
        Ok(out)
    }

    /// Rescan and report every path new or changed relative to baseline.
    /// Rejects any resolved path escaping `root` (P4).
    pub fn diff(&self) -> Result<Vec<PathBuf>> {
        let current = Self::snapshot(&self.root)?;
        let mut changed = Vec::new();
        for (relative, stamp) in &current {
            resolve_within(&self.root, relative)?;
            match self.baseline.get(relative) {
                Some(baseline_stamp) if baseline_stamp == stamp => {}
                _ => changed.push(relative.clone()),
            }
        }
        changed.sort();
        Ok(changed)
    }

    /// Recursively delete the contents of the `temp` subdirectory under
    /// root. Called once after diff().
    pub fn cleanup(&self) -> Result<()> {
        let temp_dir = self.root.join("temp");
        if temp_dir.is_dir() {
            for entry in std::fs::read_dir(&temp_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_excluded_dir(path: &Path, root: &Path) -> bool {
    if path == root {
        return false;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| EXCLUDED_DIR_NAMES.contains(&name) || name.starts_with('.'))
}

fn is_excluded_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    if name.starts_with('.') || name.starts_with('~') {
        return true;
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if EXCLUDED_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    const WIP_SUFFIXES: &[&str] = &["_draft", "_temp", "_tmp", "_wip"];
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    if WIP_SUFFIXES.iter().any(|suf| stem.ends_with(suf)) {
        return true;
    }
    if stem.contains("_step") {
        return true;
    }
    if stem.ends_with("_intermediate") {
        return true;
    }
    false
}

/// Delivery policy classification: 0 files is no action, 1..=inline_threshold
/// delivered individually, beyond that packed into a single archive.
pub enum Delivery {
    None,
    Inline(Vec<PathBuf>),
    Archive(Vec<PathBuf>),
}

pub fn classify_delivery(files: Vec<PathBuf>, inline_threshold: usize) -> Delivery {
    if files.is_empty() {
        Delivery::None
    } else if files.len() <= inline_threshold {
        Delivery::Inline(files)
    } else {
        Delivery::Archive(files)
    }
}

/// Pack `files` (relative to `root`) into a single zstd-compressed tar
/// archive at `archive_path`.
pub fn pack_archive(root: &Path, files: &[PathBuf], archive_path: &Path) -> Result<()> {
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let archive_file = std::fs::File::create(archive_path)?;
    let encoder = zstd::Encoder::new(archive_file, 0)?;
    let mut builder = tar::Builder::new(encoder.auto_finish());
    for relative in files {
        let absolute = root.join(relative);
        builder.append_path_with_name(&absolute, relative)?;
    }
    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_is_empty_when_nothing_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

        let scope = FileTrackerScope::start(dir.path()).unwrap();
        assert!(scope.diff().unwrap().is_empty());
        assert!(scope.diff().unwrap().is_empty());
    }

    #[test]
    fn diff_reports_new_and_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let scope = FileTrackerScope::start(dir.path()).unwrap();

        std::fs::write(dir.path().join("a.txt"), "changed").unwrap();
        std::fs::write(dir.path().join("b.txt"), "new").unwrap();

        let mut changed = scope.diff().unwrap();
        changed.sort();
        assert_eq!(changed, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
    }

    #[test]
    fn file_tracker_excludes_known_noise_paths() {
        let dir = tempfile::tempdir().unwrap();
        let scope = FileTrackerScope::start(dir.path()).unwrap();

        std::fs::create_dir_all(dir.path().join("analysis")).unwrap();
        std::fs::write(dir.path().join("analysis/report.md"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join("temp")).unwrap();
        std::fs::write(dir.path().join("temp/scratch.txt"), "x").unwrap();
        std::fs::write(dir.path().join("draft_step1.md"), "x").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();

        let changed = scope.diff().unwrap();
        assert_eq!(changed, vec![PathBuf::from("analysis/report.md")]);

        scope.cleanup().unwrap();
        let temp_entries: Vec<_> = std::fs::read_dir(dir.path().join("temp"))
            .unwrap()
            .collect();
        assert!(temp_entries.is_empty());
    }

    #[test]
    fn step_exclusion_matches_any_suffix() {
        assert!(is_excluded_file(Path::new("draft_step1.md")));
        assert!(is_excluded_file(Path::new("foo_step.md")));
        assert!(is_excluded_file(Path::new("foo_stepABC.md")));
        assert!(!is_excluded_file(Path::new("footsteps.md")));
    }

    #[test]
    fn classify_delivery_thresholds() {
        assert!(matches!(classify_delivery(vec![], 5), Delivery::None));
        assert!(matches!(
            classify_delivery(vec![PathBuf::from("a")], 5),
            Delivery::Inline(_)
        ));
        let many: Vec<PathBuf> = (0..6).map(|i| PathBuf::from(format!("f{i}"))).collect();
        assert!(matches!(classify_delivery(many, 5), Delivery::Archive(_)));
    }
}
