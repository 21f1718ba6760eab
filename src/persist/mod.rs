//! Persistence primitives: single-writer-per-file discipline over a
//! directory tree, per spec §3 "Persistence" and §6 "Persisted-state layout".
//!
//! Every subsystem (Memory Store, Scheduler, Session, Task Manager) goes
//! through this module rather than touching the filesystem directly. Reads
//! and writes to any given path are serialized by a per-path `tokio::Mutex`
//! held in a process-wide lock table, and writes are atomic (write to a
//! sibling temp file, then rename) so a crash mid-write never leaves a
//! torn JSON document behind.

pub mod paths;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

pub use paths::PersistenceRoot;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed record at {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("path escapes root: {0}")]
    PathEscape(PathBuf),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Process-wide table of per-path locks. One entry is created lazily per
/// canonical path the first time it is touched and lives for the process
/// lifetime — cheap, since the number of distinct persisted files is bounded
/// by the number of users and tasks, not by request volume.
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<StdMutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Read a JSON document, returning `Ok(None)` if it does not exist yet.
pub async fn read_json<T: DeserializeOwned>(
    locks: &LockTable,
    path: &Path,
) -> PersistResult<Option<T>> {
    let lock = locks.lock_for(path);
    let _guard = lock.lock().await;
    read_json_unlocked(path)
}

fn read_json_unlocked<T: DeserializeOwned>(path: &Path) -> PersistResult<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|source| PersistError::Deserialize {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PersistError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Atomically overwrite a JSON document: write to `<path>.tmp-<pid>` then
/// rename over the destination, so concurrent readers never observe a
/// partially-written file.
pub async fn write_json_atomic<T: Serialize>(
    locks: &LockTable,
    path: &Path,
    value: &T,
) -> PersistResult<()> {
    let lock = locks.lock_for(path);
    let _guard = lock.lock().await;
    write_json_atomic_unlocked(path, value)
}

fn write_json_atomic_unlocked<T: Serialize>(path: &Path, value: &T) -> PersistResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PersistError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Deserialize {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
    std::fs::write(&tmp_path, &bytes).map_err(|source| PersistError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Append a single line of JSON to a `.jsonl` log, creating the file and its
/// parent directory if needed. Used for `ScheduleOperationLog` and similar
/// append-only histories.
pub async fn append_jsonl<T: Serialize>(
    locks: &LockTable,
    path: &Path,
    value: &T,
) -> PersistResult<()> {
    use std::io::Write;

    let lock = locks.lock_for(path);
    let _guard = lock.lock().await;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PersistError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut line = serde_json::to_vec(value).map_err(|source| PersistError::Deserialize {
        path: path.to_path_buf(),
        source,
    })?;
    line.push(b'\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(&line).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Read every line of a `.jsonl` log. Missing file yields an empty vec.
pub async fn read_jsonl<T: DeserializeOwned>(
    locks: &LockTable,
    path: &Path,
) -> PersistResult<Vec<T>> {
    let lock = locks.lock_for(path);
    let _guard = lock.lock().await;

    let contents = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|source| PersistError::Deserialize {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect()
}

/// Append-only line-oriented log append used by the ChatLog (plain text,
/// not JSON — one line per turn).
pub async fn append_line(locks: &LockTable, path: &Path, line: &str) -> PersistResult<()> {
    use std::io::Write;

    let lock = locks.lock_for(path);
    let _guard = lock.lock().await;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PersistError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    writeln!(file, "{line}").map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Read the last `max_chars` characters of a plain-text log, used by
/// `recover_context` (§4.1). Reads the whole file; logs are bounded by
/// normal conversation volume so this is acceptable.
pub async fn tail_chars(
    locks: &LockTable,
    path: &Path,
    max_chars: usize,
) -> PersistResult<String> {
    let lock = locks.lock_for(path);
    let _guard = lock.lock().await;

    let contents = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if contents.chars().count() <= max_chars {
        return Ok(contents);
    }
    let skip = contents.chars().count() - max_chars;
    Ok(contents.chars().skip(skip).collect())
}

/// Resolve `relative` against `root`, rejecting any path that would escape
/// it (symlink or `..` traversal). Used by the File Tracker and anywhere
/// else user-supplied relative paths touch the filesystem.
pub fn resolve_within(root: &Path, relative: &Path) -> PersistResult<PathBuf> {
    let candidate = root.join(relative);
    let canonical_root = root
        .canonicalize()
        .map_err(|source| PersistError::Io {
            path: root.to_path_buf(),
            source,
        })?;
    // The candidate may not exist yet (e.g. a file about to be written), so
    // canonicalize the deepest existing ancestor and rebuild the tail.
    let mut existing = candidate.clone();
    let mut tail = PathBuf::new();
    while !existing.exists() {
        let Some(parent) = existing.parent() else {
            break;
        };
        if let Some(name) = existing.file_name() {
            tail = Path::new(name).join(&tail);
        }
        existing = parent.to_path_buf();
    }
    let canonical_existing = existing
        .canonicalize()
        .map_err(|source| PersistError::Io {
            path: existing.clone(),
            source,
        })?;
    let resolved = canonical_existing.join(&tail);
    if !resolved.starts_with(&canonical_root) {
        return Err(PersistError::PathEscape(relative.to_path_buf()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Fixture {
        value: u32,
    }

    #[tokio::test]
    async fn round_trips_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thing.json");
        let locks = LockTable::new();

        assert!(read_json::<Fixture>(&locks, &path).await.unwrap().is_none());

        write_json_atomic(&locks, &path, &Fixture { value: 7 })
            .await
            .unwrap();
        let loaded: Fixture = read_json(&locks, &path).await.unwrap().unwrap();
        assert_eq!(loaded, Fixture { value: 7 });
    }

    #[tokio::test]
    async fn appends_jsonl_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let locks = LockTable::new();

        append_jsonl(&locks, &path, &Fixture { value: 1 }).await.unwrap();
        append_jsonl(&locks, &path, &Fixture { value: 2 }).await.unwrap();

        let all: Vec<Fixture> = read_jsonl(&locks, &path).await.unwrap();
        assert_eq!(all, vec![Fixture { value: 1 }, Fixture { value: 2 }]);
    }

    #[test]
    fn rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_within(dir.path(), Path::new("../escape.txt"));
        assert!(matches!(err, Err(PersistError::PathEscape(_))));
    }

    #[test]
    fn allows_nested_nonexistent_path() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_within(dir.path(), Path::new("a/b/c.txt")).unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }
}
