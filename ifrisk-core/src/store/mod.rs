//! Upsert-by-natural-key row stores.
//!
//! Raw facts are keyed by (period, entity_id, raw_label); a conflicting upsert
//! overwrites only `value` and `entity_name`. Metric sets and assessments are
//! keyed by (period, entity_id) and fully overwritten.

pub mod json;
pub mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use crate::domain::{CanonicalMetricSet, Period, RawFact, RiskAssessment};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt table {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StoreError {
        let path = path.into();
        move |source| StoreError::Io { path, source }
    }
}

/// Sink for every pipeline stage.
///
/// Each upsert call is atomic: after an error, none of the call's rows are
/// visible.
pub trait FactStore {
    fn upsert_raw_facts(&self, facts: &[RawFact]) -> Result<(), StoreError>;

    /// Raw facts of one period, ordered by (entity_id, raw_label).
    fn raw_facts(&self, period: Period) -> Result<Vec<RawFact>, StoreError>;

    fn upsert_metric_sets(&self, sets: &[CanonicalMetricSet]) -> Result<(), StoreError>;

    /// Metric sets of one period, ordered by entity_id.
    fn metric_sets(&self, period: Period) -> Result<Vec<CanonicalMetricSet>, StoreError>;

    fn upsert_assessments(&self, assessments: &[RiskAssessment]) -> Result<(), StoreError>;

    /// Assessments of one period, ordered by entity_id.
    fn assessments(&self, period: Period) -> Result<Vec<RiskAssessment>, StoreError>;
}
