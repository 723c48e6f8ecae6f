//! BTreeMap-backed store for tests and single-process runs.

use super::{FactStore, StoreError};
use crate::domain::{CanonicalMetricSet, Period, RawFact, RiskAssessment};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

type FactKey = (Period, String, String);
type EntityKey = (Period, String);

#[derive(Default)]
struct Tables {
    facts: BTreeMap<FactKey, RawFact>,
    metrics: BTreeMap<EntityKey, CanonicalMetricSet>,
    assessments: BTreeMap<EntityKey, RiskAssessment>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total raw facts across all periods.
    pub fn fact_count(&self) -> usize {
        self.tables().facts.len()
    }
}

fn period_range<V: Clone, K: Ord>(
    map: &BTreeMap<K, V>,
    in_period: impl Fn(&K) -> bool,
) -> Vec<V> {
    map.iter()
        .filter(|(k, _)| in_period(k))
        .map(|(_, v)| v.clone())
        .collect()
}

impl FactStore for MemoryStore {
    fn upsert_raw_facts(&self, facts: &[RawFact]) -> Result<(), StoreError> {
        let mut tables = self.tables();
        for fact in facts {
            let key = (fact.period, fact.entity_id.clone(), fact.raw_label.clone());
            match tables.facts.get_mut(&key) {
                Some(existing) => {
                    existing.value = fact.value;
                    existing.entity_name = fact.entity_name.clone();
                }
                None => {
                    tables.facts.insert(key, fact.clone());
                }
            }
        }
        Ok(())
    }

    fn raw_facts(&self, period: Period) -> Result<Vec<RawFact>, StoreError> {
        Ok(period_range(&self.tables().facts, |k| k.0 == period))
    }

    fn upsert_metric_sets(&self, sets: &[CanonicalMetricSet]) -> Result<(), StoreError> {
        let mut tables = self.tables();
        for set in sets {
            tables
                .metrics
                .insert((set.period, set.entity_id.clone()), set.clone());
        }
        Ok(())
    }

    fn metric_sets(&self, period: Period) -> Result<Vec<CanonicalMetricSet>, StoreError> {
        Ok(period_range(&self.tables().metrics, |k| k.0 == period))
    }

    fn upsert_assessments(&self, assessments: &[RiskAssessment]) -> Result<(), StoreError> {
        let mut tables = self.tables();
        for a in assessments {
            tables
                .assessments
                .insert((a.period, a.entity_id.clone()), a.clone());
        }
        Ok(())
    }

    fn assessments(&self, period: Period) -> Result<Vec<RiskAssessment>, StoreError> {
        Ok(period_range(&self.tables().assessments, |k| k.0 == period))
    }
}
