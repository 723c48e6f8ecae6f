//! Durable resume points for paginated report downloads.
//!
//! Layout (file store): `{dir}/{period}__type={entity_type}__report={report}.json`
//!
//! Writes are atomic: serialize to a `.tmp` sibling, fsync, rename into place.
//! A file that cannot be read or parsed is reported as absent; the download
//! restarts from the beginning of the report and the idempotent upserts
//! absorb the repeated rows.

use super::paging::Cursor;
use crate::domain::Period;
use crate::store::json::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub period: Period,
    pub entity_type: u32,
    pub report_id: String,
}

impl CheckpointKey {
    pub fn new(period: Period, entity_type: u32, report_id: impl Into<String>) -> Self {
        Self {
            period,
            entity_type,
            report_id: report_id.into(),
        }
    }

    fn file_name(&self) -> String {
        let report: String = self
            .report_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!(
            "{}__type={}__report={}.json",
            self.period, self.entity_type, report
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub page_size: usize,
    pub cursor: Cursor,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(page_size: usize, cursor: Cursor) -> Self {
        Self {
            page_size,
            cursor,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.cursor.is_done()
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait CheckpointStore {
    /// Stored checkpoint, or `None` when absent or unreadable.
    fn get(&self, key: &CheckpointKey) -> Option<Checkpoint>;

    /// Replace the checkpoint for `key` atomically.
    fn set(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

/// One JSON file per key.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    key: CheckpointKey,
    #[serde(flatten)]
    checkpoint: Checkpoint,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Every readable checkpoint in the directory, ordered by key.
    pub fn list(&self) -> Vec<(CheckpointKey, Checkpoint)> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| read_checkpoint_file(&p).ok())
            .map(|f| (f.key, f.checkpoint))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn read_checkpoint_file(path: &Path) -> Result<CheckpointFile, String> {
    let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, key: &CheckpointKey) -> Option<Checkpoint> {
        let path = self.path_for(key);
        if !path.exists() {
            return None;
        }
        match read_checkpoint_file(&path) {
            Ok(file) if &file.key == key => Some(file.checkpoint),
            Ok(file) => {
                warn!(path = %path.display(), found = ?file.key, "checkpoint key mismatch; ignoring");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint; starting report from scratch");
                None
            }
        }
    }

    fn set(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CheckpointError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let path = self.path_for(key);
        let json = serde_json::to_vec_pretty(&CheckpointFile {
            key: key.clone(),
            checkpoint: checkpoint.clone(),
        })?;
        write_atomic(&path, &json).map_err(io_err(&path))
    }
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<BTreeMap<CheckpointKey, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<CheckpointKey, Checkpoint> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, key: &CheckpointKey) -> Option<Checkpoint> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(report: &str) -> CheckpointKey {
        CheckpointKey::new(Period::new(2025, 6).unwrap(), 1, report)
    }

    #[test]
    fn file_store_round_trip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        assert!(store.get(&key("1")).is_none());

        store
            .set(&key("1"), &Checkpoint::new(5000, Cursor::Offset { skip: 10_000 }))
            .unwrap();
        store
            .set(&key("1"), &Checkpoint::new(2000, Cursor::Offset { skip: 12_000 }))
            .unwrap();

        let cp = store.get(&key("1")).unwrap();
        assert_eq!(cp.page_size, 2000);
        assert_eq!(cp.cursor, Cursor::Offset { skip: 12_000 });
        assert!(store.get(&key("4")).is_none());

        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupted_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let k = key("5");
        fs::write(dir.path().join(k.file_name()), b"{ not json").unwrap();
        assert!(store.get(&k).is_none());

        // And can be overwritten afterwards
        store.set(&k, &Checkpoint::new(100, Cursor::Done)).unwrap();
        assert!(store.get(&k).unwrap().is_terminal());
    }

    #[test]
    fn list_returns_sorted_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.set(&key("5"), &Checkpoint::new(10, Cursor::Done)).unwrap();
        store
            .set(&key("1"), &Checkpoint::new(10, Cursor::Offset { skip: 3 }))
            .unwrap();
        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.report_id, "1");
        assert_eq!(listed[1].0.report_id, "5");
    }

    #[test]
    fn link_cursor_survives_serialization() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let cursor = Cursor::Link {
            token: Some("https://h/odata/IfDataValores?$skiptoken=abc".into()),
            skip: 17,
            variant: 2,
        };
        store.set(&key("1"), &Checkpoint::new(500, cursor.clone())).unwrap();
        assert_eq!(store.get(&key("1")).unwrap().cursor, cursor);
    }

    #[test]
    fn report_ids_are_file_name_safe() {
        assert_eq!(
            key("a/b c").file_name(),
            "2025-06__type=1__report=a_b_c.json"
        );
    }
}
