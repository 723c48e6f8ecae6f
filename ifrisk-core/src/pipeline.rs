//! Per-period stages over a fact store: ingest upstream reports into raw
//! facts, normalize raw facts into metric sets, then score metric sets into
//! assessments.
//!
//! Normalize and score recompute their output from scratch and upsert it, so
//! re-running a stage on unchanged input is a no-op on the stored rows.

use crate::data::checkpoint::CheckpointStore;
use crate::data::fetcher::ResilientFetcher;
use crate::data::identity::IdentityResolver;
use crate::data::ingest::{IngestConfig, IngestProgress, Orchestrator, RunSummary};
use crate::data::upstream::Endpoints;
use crate::domain::{Metric, Period, Rating, RiskAssessment};
use crate::scoring::score;
use crate::semantic::aggregate::aggregate;
use crate::semantic::rules::RuleSet;
use crate::store::{FactStore, StoreError};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialize assessments: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizeReport {
    pub period: Period,
    pub facts_read: usize,
    pub entities: usize,
    /// Entities with a resolved value, per metric.
    pub resolved: BTreeMap<Metric, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReport {
    pub period: Period,
    pub entities: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// BLAKE3 of the serialized assessments, hex.
    pub digest: String,
}

/// Upstream → raw facts for one period.
///
/// Builds the identity map once, then drains every configured report.
/// Individual report failures are in the returned summary.
#[allow(clippy::too_many_arguments)]
pub fn ingest_period(
    fetcher: &ResilientFetcher,
    endpoints: &Endpoints,
    checkpoints: &dyn CheckpointStore,
    store: &dyn FactStore,
    config: &IngestConfig,
    registry_page_size: usize,
    period: Period,
    progress: &dyn IngestProgress,
) -> RunSummary {
    let identities = IdentityResolver::new(fetcher, endpoints, registry_page_size)
        .resolve(period, config.entity_type);
    Orchestrator::new(fetcher, endpoints, checkpoints, store, config).run(period, &identities, progress)
}

/// Raw facts → canonical metric sets for one period.
pub fn normalize_period(
    store: &dyn FactStore,
    rules: &RuleSet,
    period: Period,
) -> Result<NormalizeReport, PipelineError> {
    let facts = store.raw_facts(period)?;
    if facts.is_empty() {
        warn!(%period, "no raw facts stored for period");
    }
    let sets = aggregate(period, &facts, rules);
    store.upsert_metric_sets(&sets)?;

    let mut resolved = BTreeMap::new();
    for metric in Metric::ALL {
        resolved.insert(metric, sets.iter().filter(|s| s.get(metric).is_some()).count());
    }
    info!(%period, facts = facts.len(), entities = sets.len(), "normalized");

    Ok(NormalizeReport {
        period,
        facts_read: facts.len(),
        entities: sets.len(),
        resolved,
    })
}

/// Canonical metric sets → risk assessments for one period.
pub fn score_period(store: &dyn FactStore, period: Period) -> Result<ScoreReport, PipelineError> {
    let sets = store.metric_sets(period)?;
    let assessments: Vec<RiskAssessment> = sets.iter().map(score).collect();
    store.upsert_assessments(&assessments)?;

    let count = |rating: Rating| assessments.iter().filter(|a| a.rating == rating).count();
    let report = ScoreReport {
        period,
        entities: assessments.len(),
        high: count(Rating::High),
        medium: count(Rating::Medium),
        low: count(Rating::Low),
        digest: assessments_digest(&assessments)?,
    };
    info!(%period, entities = report.entities, high = report.high, digest = %report.digest, "scored");
    Ok(report)
}

/// Digest over assessments ordered by entity id.
pub fn assessments_digest(assessments: &[RiskAssessment]) -> Result<String, PipelineError> {
    let mut ordered: Vec<&RiskAssessment> = assessments.iter().collect();
    ordered.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    let bytes = serde_json::to_vec(&ordered)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}
