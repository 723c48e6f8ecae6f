//! File-backed store: one directory per period.
//!
//! Layout:
//! ```text
//! {root}/period=2025-06/facts/00000001.jsonl   one segment per upsert call
//! {root}/period=2025-06/metrics.json          whole table, rewritten atomically
//! {root}/period=2025-06/risk.json             whole table, rewritten atomically
//! ```
//!
//! Segments are written to a `.tmp` sibling and renamed into place, so a
//! batch is either fully visible or absent. A batch spanning several periods
//! stages every segment before the first rename. Loading replays segments in
//! order, later rows overwriting earlier ones; malformed lines are skipped.

use super::{FactStore, StoreError};
use crate::domain::{CanonicalMetricSet, Period, RawFact, RiskAssessment};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const SEGMENT_EXT: &str = "jsonl";
const METRICS_FILE: &str = "metrics.json";
const RISK_FILE: &str = "risk.json";

/// Write `bytes` to `path` via a synced temp file and an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let staged = stage(path, bytes)?;
    staged.commit()
}

/// A synced temp file waiting to be renamed over its target.
struct Staged {
    tmp: PathBuf,
    target: PathBuf,
}

impl Staged {
    fn commit(self) -> io::Result<()> {
        if let Err(e) = fs::rename(&self.tmp, &self.target) {
            self.discard();
            return Err(e);
        }
        sync_parent(&self.target)
    }

    fn discard(self) {
        let _ = fs::remove_file(&self.tmp);
    }
}

fn stage(path: &Path, bytes: &[u8]) -> io::Result<Staged> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let staged = Staged {
        tmp: PathBuf::from(tmp_name),
        target: path.to_path_buf(),
    };

    let written = (|| {
        let mut file = fs::File::create(&staged.tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    })();
    match written {
        Ok(()) => Ok(staged),
        Err(e) => {
            staged.discard();
            Err(e)
        }
    }
}

/// Persist the directory entry created by a rename.
#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

pub struct JsonStore {
    root: PathBuf,
    /// Serializes writers within this process.
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn period_dir(&self, period: Period) -> PathBuf {
        self.root.join(format!("period={period}"))
    }

    fn facts_dir(&self, period: Period) -> PathBuf {
        self.period_dir(period).join("facts")
    }

    /// Segment files in replay order.
    fn segments(&self, period: Period) -> Result<Vec<(u64, PathBuf)>, StoreError> {
        let dir = self.facts_dir(period);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path: dir, source: e }),
        };
        let mut segments: Vec<(u64, PathBuf)> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXT))
            .filter_map(|p| {
                let seq = p.file_stem()?.to_str()?.parse::<u64>().ok()?;
                Some((seq, p))
            })
            .collect();
        segments.sort();
        Ok(segments)
    }

    fn write_segment(&self, period: Period, facts: &[&RawFact]) -> Result<PathBuf, StoreError> {
        let staged = self.stage_segment(period, facts)?;
        let path = staged.target.clone();
        staged.commit().map_err(StoreError::io(&path))?;
        debug!(path = %path.display(), rows = facts.len(), "fact segment written");
        Ok(path)
    }

    fn stage_segment(&self, period: Period, facts: &[&RawFact]) -> Result<Staged, StoreError> {
        let dir = self.facts_dir(period);
        fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;

        let next = self
            .segments(period)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);
        let path = dir.join(format!("{next:08}.{SEGMENT_EXT}"));

        let mut buf = Vec::new();
        for fact in facts {
            serde_json::to_writer(&mut buf, fact)?;
            buf.push(b'\n');
        }
        stage(&path, &buf).map_err(StoreError::io(&path))
    }

    fn load_facts(&self, period: Period) -> Result<BTreeMap<(String, String), RawFact>, StoreError> {
        let mut facts = BTreeMap::new();
        for (_, path) in self.segments(period)? {
            let file = fs::File::open(&path).map_err(StoreError::io(&path))?;
            let mut skipped = 0usize;
            for line in io::BufReader::new(file).lines() {
                let line = line.map_err(StoreError::io(&path))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawFact>(&line) {
                    Ok(fact) if fact.period == period => {
                        facts.insert((fact.entity_id.clone(), fact.raw_label.clone()), fact);
                    }
                    _ => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!(path = %path.display(), skipped, "skipped malformed fact lines");
            }
        }
        Ok(facts)
    }

    /// Rewrite a period's segments as one. Returns the number of facts kept.
    pub fn compact_raw_facts(&self, period: Period) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.segments(period)?;
        if old.len() <= 1 {
            return Ok(self.load_facts(period)?.len());
        }
        let facts = self.load_facts(period)?;
        let rows: Vec<&RawFact> = facts.values().collect();
        // The new segment sorts last, so a crash before cleanup only leaves
        // redundant rows behind.
        self.write_segment(period, &rows)?;
        for (_, path) in old {
            fs::remove_file(&path).map_err(StoreError::io(&path))?;
        }
        Ok(rows.len())
    }

    fn read_table<T: DeserializeOwned>(&self, period: Period, file: &str) -> Result<Vec<T>, StoreError> {
        let path = self.period_dir(period).join(file);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    fn write_table<T: Serialize>(&self, period: Period, file: &str, rows: &[T]) -> Result<(), StoreError> {
        let dir = self.period_dir(period);
        fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
        let path = dir.join(file);
        let json = serde_json::to_vec_pretty(rows)?;
        write_atomic(&path, &json).map_err(StoreError::io(&path))
    }

    /// Merge `rows` into a whole-table file, keyed by entity id.
    fn upsert_table<T, F>(&self, file: &str, rows: &[T], key: F) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: Fn(&T) -> (Period, String),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_period: BTreeMap<Period, Vec<&T>> = BTreeMap::new();
        for row in rows {
            by_period.entry(key(row).0).or_default().push(row);
        }
        for (period, incoming) in by_period {
            let mut table: BTreeMap<String, T> = self
                .read_table::<T>(period, file)?
                .into_iter()
                .map(|row| (key(&row).1, row))
                .collect();
            for row in incoming {
                table.insert(key(row).1, row.clone());
            }
            let ordered: Vec<T> = table.into_values().collect();
            self.write_table(period, file, &ordered)?;
        }
        Ok(())
    }

    /// Periods that have a directory under the root.
    pub fn periods(&self) -> Result<Vec<Period>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.root.clone(),
                    source: e,
                })
            }
        };
        let mut periods: Vec<Period> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name();
                name.to_str()?.strip_prefix("period=")?.parse().ok()
            })
            .collect();
        periods.sort();
        Ok(periods)
    }
}

impl FactStore for JsonStore {
    fn upsert_raw_facts(&self, facts: &[RawFact]) -> Result<(), StoreError> {
        if facts.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_period: BTreeMap<Period, Vec<&RawFact>> = BTreeMap::new();
        for fact in facts {
            by_period.entry(fact.period).or_default().push(fact);
        }
        let mut staged = Vec::with_capacity(by_period.len());
        for (period, rows) in &by_period {
            match self.stage_segment(*period, rows) {
                Ok(segment) => staged.push(segment),
                Err(e) => {
                    staged.into_iter().for_each(Staged::discard);
                    return Err(e);
                }
            }
        }
        for segment in staged {
            let path = segment.target.clone();
            segment.commit().map_err(StoreError::io(&path))?;
            debug!(path = %path.display(), "fact segment written");
        }
        Ok(())
    }

    fn raw_facts(&self, period: Period) -> Result<Vec<RawFact>, StoreError> {
        Ok(self.load_facts(period)?.into_values().collect())
    }

    fn upsert_metric_sets(&self, sets: &[CanonicalMetricSet]) -> Result<(), StoreError> {
        self.upsert_table(METRICS_FILE, sets, |s| (s.period, s.entity_id.clone()))
    }

    fn metric_sets(&self, period: Period) -> Result<Vec<CanonicalMetricSet>, StoreError> {
        self.read_table(period, METRICS_FILE)
    }

    fn upsert_assessments(&self, assessments: &[RiskAssessment]) -> Result<(), StoreError> {
        self.upsert_table(RISK_FILE, assessments, |a| (a.period, a.entity_id.clone()))
    }

    fn assessments(&self, period: Period) -> Result<Vec<RiskAssessment>, StoreError> {
        self.read_table(period, RISK_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Rating;

    fn period() -> Period {
        Period::new(2025, 6).unwrap()
    }

    fn fact(entity: &str, label: &str, value: f64) -> RawFact {
        RawFact {
            period: period(),
            entity_id: entity.into(),
            entity_name: format!("Entity {entity}"),
            raw_label: label.into(),
            value,
        }
    }

    #[test]
    fn later_segments_win_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store
            .upsert_raw_facts(&[fact("1", "1::a", 1.0), fact("2", "1::a", 2.0)])
            .unwrap();
        store.upsert_raw_facts(&[fact("1", "1::a", 10.0)]).unwrap();

        let facts = store.raw_facts(period()).unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].entity_id, "1");
        assert_eq!(facts[0].value, 10.0);
        assert_eq!(store.segments(period()).unwrap().len(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store.upsert_raw_facts(&[fact("1", "1::a", 1.0)]).unwrap();
        let (_, path) = store.segments(period()).unwrap().pop().unwrap();
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("{\"truncated\": \n");
        fs::write(&path, content).unwrap();

        assert_eq!(store.raw_facts(period()).unwrap().len(), 1);
    }

    #[test]
    fn compaction_keeps_latest_values_in_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store.upsert_raw_facts(&[fact("1", "1::a", 1.0)]).unwrap();
        store.upsert_raw_facts(&[fact("1", "1::a", 3.0)]).unwrap();
        store.upsert_raw_facts(&[fact("2", "1::a", 5.0)]).unwrap();

        assert_eq!(store.compact_raw_facts(period()).unwrap(), 2);
        assert_eq!(store.segments(period()).unwrap().len(), 1);
        let facts = store.raw_facts(period()).unwrap();
        assert_eq!(facts[0].value, 3.0);
        assert_eq!(facts[1].value, 5.0);
    }

    #[test]
    fn tables_are_merged_by_entity() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let assess = |id: &str, score: u8| RiskAssessment {
            period: period(),
            entity_id: id.into(),
            entity_name: String::new(),
            score,
            rating: Rating::from_score(score),
            drivers: BTreeMap::new(),
        };
        store.upsert_assessments(&[assess("2", 10), assess("1", 80)]).unwrap();
        store.upsert_assessments(&[assess("2", 50)]).unwrap();

        let rows = store.assessments(period()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity_id, "1");
        assert_eq!(rows[1].score, 50);
        assert_eq!(rows[1].rating, Rating::Medium);
        assert_eq!(store.periods().unwrap(), vec![period()]);
    }

    #[test]
    fn failed_period_leaves_the_rest_of_the_batch_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let later = Period::new(2025, 9).unwrap();
        // A plain file where the period directory should go.
        fs::write(dir.path().join(format!("period={later}")), b"").unwrap();

        let mut stray = fact("2", "1::a", 2.0);
        stray.period = later;
        assert!(store.upsert_raw_facts(&[fact("1", "1::a", 1.0), stray]).is_err());

        assert!(store.raw_facts(period()).unwrap().is_empty());
        let leftovers: Vec<_> = fs::read_dir(store.facts_dir(period())).unwrap().flatten().collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn atomic_write_replaces_content_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.json");
        write_atomic(&path, b"[1]").unwrap();
        write_atomic(&path, b"[1,2]").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[1,2]");
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["table.json"]);
    }

    #[test]
    fn atomic_write_into_missing_directory_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("table.json");
        assert!(write_atomic(&path, b"[]").is_err());
        assert!(!dir.path().join("absent").exists());
    }

    #[test]
    fn missing_period_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nothing-here"));
        assert!(store.raw_facts(period()).unwrap().is_empty());
        assert!(store.metric_sets(period()).unwrap().is_empty());
        assert!(store.periods().unwrap().is_empty());
    }
}
