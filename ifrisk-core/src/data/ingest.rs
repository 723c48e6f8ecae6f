//! Ingestion orchestrator: fetch → transform → batch commit → checkpoint,
//! one report at a time.
//!
//! Ordering contract per report:
//! 1. rows are upserted to the sink in batches;
//! 2. the checkpoint moves to the position after a batch only once the sink
//!    confirmed that batch;
//! 3. the page-end safety-net write records the last committed position,
//!    never the end of a page whose rows are still pending.
//!
//! A crash therefore re-fetches at most the rows of one pending batch, and
//! the idempotent upsert absorbs them.

use super::checkpoint::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore};
use super::fetcher::{FetchError, ResilientFetcher};
use super::identity::IdentityMap;
use super::paging::{Cursor, PageSource, PaginationMode};
use super::upstream::{
    sanitize_report_id, scalar_text, Endpoints, ReportQuery, FIELD_ENTITY_ID, FIELD_LABEL,
    FIELD_REPORT, FIELD_REPORT_ALT, FIELD_VALUE,
};
use crate::domain::records::qualify_label;
use crate::domain::{Period, RawFact};
use crate::store::{FactStore, StoreError};
use crate::text::{cap_with_digest, clean, parse_value, truncate_chars};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Knobs of one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub entity_type: u32,
    pub reports: Vec<String>,
    /// Descending page-size ladder; the first entry is the initial size.
    pub page_sizes: Vec<usize>,
    pub batch_size: usize,
    /// Resume from stored checkpoints; `false` restarts every report.
    pub resume: bool,
    pub pagination: PaginationMode,
    /// Retry a report through the filtered entity set when the function
    /// endpoint returns no rows at all.
    pub link_fallback: bool,
    /// Longer qualified labels are cut and suffixed with a hash of the full text.
    pub label_max_chars: usize,
    pub name_max_chars: usize,
    /// Log the keys and contents of the first row of each report.
    pub debug_sample: bool,
    /// Attempts per batch upsert before the report fails.
    pub commit_attempts: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            entity_type: 1,
            reports: vec!["1".into(), "4".into(), "5".into()],
            page_sizes: vec![5000, 2000, 1000, 500],
            batch_size: 10_000,
            resume: true,
            pagination: PaginationMode::Offset,
            link_fallback: true,
            label_max_chars: 80,
            name_max_chars: 255,
            debug_sample: false,
            commit_attempts: 3,
        }
    }
}

impl IngestConfig {
    /// Page-size ladder starting at `stored` (if given), descending, deduplicated.
    pub fn ladder_from(&self, stored: Option<usize>) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.page_sizes.iter().copied().filter(|&s| s > 0).collect();
        if let Some(s) = stored.filter(|&s| s > 0) {
            sizes.retain(|&x| x < s);
            sizes.push(s);
        }
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        sizes.dedup();
        if sizes.is_empty() {
            sizes.push(IngestConfig::default().page_sizes[0]);
        }
        sizes
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("report {report}: every page size failed ({page_sizes:?}); last error: {last}")]
    Exhausted {
        report: String,
        page_sizes: Vec<usize>,
        #[source]
        last: FetchError,
    },

    #[error("report {report}: request rejected: {source}")]
    Rejected {
        report: String,
        #[source]
        source: FetchError,
    },

    #[error("report {report}: batch commit failed: {source}")]
    Store {
        report: String,
        #[source]
        source: StoreError,
    },

    #[error("report {report}: checkpoint write failed: {source}")]
    Checkpoint {
        report: String,
        #[source]
        source: CheckpointError,
    },
}

/// Why a raw row was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowIssue {
    MissingEntityId,
    MissingLabel,
    BadValue,
}

/// Counters for one drained report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportStats {
    pub report_id: String,
    pub mode: PaginationMode,
    pub rows_downloaded: u64,
    pub skipped_missing_entity: u64,
    pub skipped_missing_label: u64,
    pub skipped_bad_value: u64,
    pub facts_upserted: u64,
    pub unique_entities: usize,
    pub batches_committed: u64,
    pub final_page_size: usize,
}

impl ReportStats {
    fn new(report_id: &str, mode: PaginationMode, page_size: usize) -> Self {
        Self {
            report_id: report_id.to_string(),
            mode,
            rows_downloaded: 0,
            skipped_missing_entity: 0,
            skipped_missing_label: 0,
            skipped_bad_value: 0,
            facts_upserted: 0,
            unique_entities: 0,
            batches_committed: 0,
            final_page_size: page_size,
        }
    }

    fn record(&mut self, issue: RowIssue) {
        match issue {
            RowIssue::MissingEntityId => self.skipped_missing_entity += 1,
            RowIssue::MissingLabel => self.skipped_missing_label += 1,
            RowIssue::BadValue => self.skipped_bad_value += 1,
        }
    }

    pub fn rows_skipped(&self) -> u64 {
        self.skipped_missing_entity + self.skipped_missing_label + self.skipped_bad_value
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Completed(ReportStats),
    /// A terminal checkpoint was found; nothing was fetched.
    AlreadyDrained,
}

/// Progress callbacks for an ingestion run.
pub trait IngestProgress {
    fn on_report_start(&self, report_id: &str, index: usize, total: usize);
    fn on_batch_committed(&self, report_id: &str, rows: usize, position: &Cursor);
    fn on_page_size_degraded(&self, report_id: &str, from: usize, to: usize, cause: &FetchError);
    fn on_report_complete(
        &self,
        report_id: &str,
        index: usize,
        total: usize,
        result: &Result<ReportOutcome, IngestError>,
    );
    fn on_run_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Reports progress through `tracing`.
pub struct LogProgress;

impl IngestProgress for LogProgress {
    fn on_report_start(&self, report_id: &str, index: usize, total: usize) {
        info!(report = report_id, "[{}/{}] ingesting report", index + 1, total);
    }

    fn on_batch_committed(&self, report_id: &str, rows: usize, position: &Cursor) {
        debug!(report = report_id, rows, ?position, "batch committed");
    }

    fn on_page_size_degraded(&self, report_id: &str, from: usize, to: usize, cause: &FetchError) {
        warn!(report = report_id, from, to, error = %cause, "degrading page size");
    }

    fn on_report_complete(
        &self,
        report_id: &str,
        index: usize,
        total: usize,
        result: &Result<ReportOutcome, IngestError>,
    ) {
        match result {
            Ok(ReportOutcome::Completed(stats)) => info!(
                report = report_id,
                rows = stats.rows_downloaded,
                skipped = stats.rows_skipped(),
                upserted = stats.facts_upserted,
                entities = stats.unique_entities,
                batches = stats.batches_committed,
                "[{}/{}] report complete",
                index + 1,
                total
            ),
            Ok(ReportOutcome::AlreadyDrained) => info!(
                report = report_id,
                "[{}/{}] already drained, skipping",
                index + 1,
                total
            ),
            Err(e) => warn!(report = report_id, error = %e, "[{}/{}] report failed", index + 1, total),
        }
    }

    fn on_run_complete(&self, succeeded: usize, failed: usize, total: usize) {
        info!(succeeded, failed, total, "ingestion run complete");
    }
}

/// Result of one run over every configured report.
#[derive(Debug)]
pub struct RunSummary {
    pub period: Period,
    pub entity_type: u32,
    pub total: usize,
    pub succeeded: usize,
    pub already_drained: usize,
    pub failed: usize,
    pub reports: Vec<ReportStats>,
    pub errors: Vec<(String, IngestError)>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn facts_upserted(&self) -> u64 {
        self.reports.iter().map(|r| r.facts_upserted).sum()
    }
}

/// Drives every configured report through fetch, transform and commit.
pub struct Orchestrator<'a> {
    fetcher: &'a ResilientFetcher,
    endpoints: &'a Endpoints,
    checkpoints: &'a dyn CheckpointStore,
    sink: &'a dyn FactStore,
    config: &'a IngestConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        fetcher: &'a ResilientFetcher,
        endpoints: &'a Endpoints,
        checkpoints: &'a dyn CheckpointStore,
        sink: &'a dyn FactStore,
        config: &'a IngestConfig,
    ) -> Self {
        Self {
            fetcher,
            endpoints,
            checkpoints,
            sink,
            config,
        }
    }

    /// Ingest every configured report for `period`. A failing report is
    /// recorded and the run moves on to the next one.
    pub fn run(
        &self,
        period: Period,
        identities: &IdentityMap,
        progress: &dyn IngestProgress,
    ) -> RunSummary {
        let reports = &self.config.reports;
        let total = reports.len();
        let mut summary = RunSummary {
            period,
            entity_type: self.config.entity_type,
            total,
            succeeded: 0,
            already_drained: 0,
            failed: 0,
            reports: Vec::new(),
            errors: Vec::new(),
        };

        for (i, report_id) in reports.iter().enumerate() {
            progress.on_report_start(report_id, i, total);
            let result = self.ingest_report(period, report_id, identities, progress);
            progress.on_report_complete(report_id, i, total, &result);

            match result {
                Ok(ReportOutcome::Completed(stats)) => {
                    summary.succeeded += 1;
                    summary.reports.push(stats);
                }
                Ok(ReportOutcome::AlreadyDrained) => {
                    summary.succeeded += 1;
                    summary.already_drained += 1;
                }
                Err(e) => {
                    summary.failed += 1;
                    summary.errors.push((report_id.clone(), e));
                }
            }
        }

        progress.on_run_complete(summary.succeeded, summary.failed, total);
        summary
    }

    /// Drain one report, resuming from its checkpoint when allowed.
    pub fn ingest_report(
        &self,
        period: Period,
        report_id: &str,
        identities: &IdentityMap,
        progress: &dyn IngestProgress,
    ) -> Result<ReportOutcome, IngestError> {
        let query = ReportQuery::new(period, self.config.entity_type, report_id);
        let key = CheckpointKey::new(period, self.config.entity_type, query.report_id.clone());

        let stored = if self.config.resume {
            self.checkpoints.get(&key)
        } else {
            None
        };
        if stored.as_ref().is_some_and(Checkpoint::is_terminal) {
            return Ok(ReportOutcome::AlreadyDrained);
        }

        // A stored cursor is resumed in the regime that produced it.
        let mode = match stored.as_ref().map(|cp| &cp.cursor) {
            Some(Cursor::Offset { .. }) => PaginationMode::Offset,
            Some(Cursor::Link { .. }) => PaginationMode::Link,
            _ => self.config.pagination,
        };
        let ladder = self.config.ladder_from(stored.as_ref().map(|cp| cp.page_size));
        let source = self.endpoints.report_source(&query, mode);
        let start = match stored {
            Some(cp) => {
                info!(report = %key.report_id, cursor = ?cp.cursor, page_size = cp.page_size, "resuming from checkpoint");
                cp.cursor
            }
            None => source.start(),
        };
        let from_start = start == source.start();

        let mut drain = ReportDrain::new(self, &key, source.as_ref(), &ladder, identities, progress);
        let mut stats = drain.run(start)?;

        if from_start && stats.rows_downloaded == 0 && mode == PaginationMode::Offset && self.config.link_fallback {
            info!(report = %key.report_id, "function endpoint returned no rows; retrying via filtered entity set");
            let link_source = self.endpoints.report_source(&query, PaginationMode::Link);
            let mut drain =
                ReportDrain::new(self, &key, link_source.as_ref(), &ladder, identities, progress);
            stats = drain.run(link_source.start())?;
        }

        self.save_checkpoint(&key, stats.final_page_size, Cursor::Done)?;
        Ok(ReportOutcome::Completed(stats))
    }

    fn save_checkpoint(&self, key: &CheckpointKey, page_size: usize, cursor: Cursor) -> Result<(), IngestError> {
        self.checkpoints
            .set(key, &Checkpoint::new(page_size, cursor))
            .map_err(|source| IngestError::Checkpoint {
                report: key.report_id.clone(),
                source,
            })
    }

    /// Upsert `batch`, retrying the whole call on failure.
    fn commit(&self, report_id: &str, batch: &mut Vec<RawFact>) -> Result<usize, IngestError> {
        let attempts = self.config.commit_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.sink.upsert_raw_facts(batch) {
                Ok(()) => {
                    let n = batch.len();
                    batch.clear();
                    return Ok(n);
                }
                Err(e) if attempt < attempts => {
                    warn!(report = report_id, attempt, error = %e, "batch commit failed; retrying");
                    attempt += 1;
                }
                Err(source) => {
                    return Err(IngestError::Store {
                        report: report_id.to_string(),
                        source,
                    })
                }
            }
        }
    }

    /// Turn one upstream row into a fact, or say why it is unusable.
    pub fn transform_row(
        &self,
        row: &Value,
        period: Period,
        requested_report: &str,
        identities: &IdentityMap,
    ) -> Result<RawFact, RowIssue> {
        let entity_id = scalar_text(row.get(FIELD_ENTITY_ID)).ok_or(RowIssue::MissingEntityId)?;
        let label = clean(scalar_text(row.get(FIELD_LABEL)).as_deref());
        if label.is_empty() {
            return Err(RowIssue::MissingLabel);
        }
        let value = parse_value(row.get(FIELD_VALUE)).ok_or(RowIssue::BadValue)?;

        let report = scalar_text(row.get(FIELD_REPORT))
            .or_else(|| scalar_text(row.get(FIELD_REPORT_ALT)))
            .map(|r| sanitize_report_id(&r))
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| sanitize_report_id(requested_report));

        Ok(RawFact {
            period,
            entity_name: truncate_chars(identities.name_of(&entity_id), self.config.name_max_chars),
            entity_id,
            raw_label: cap_with_digest(&qualify_label(&report, &label), self.config.label_max_chars),
            value,
        })
    }
}

/// State of one pass over a report listing.
struct ReportDrain<'o, 'a> {
    orch: &'o Orchestrator<'a>,
    key: &'o CheckpointKey,
    source: &'o dyn PageSource,
    ladder: &'o [usize],
    identities: &'o IdentityMap,
    progress: &'o dyn IngestProgress,
    stats: ReportStats,
    entities: BTreeSet<String>,
    batch: Vec<RawFact>,
    size_idx: usize,
}

impl<'o, 'a> ReportDrain<'o, 'a> {
    fn new(
        orch: &'o Orchestrator<'a>,
        key: &'o CheckpointKey,
        source: &'o dyn PageSource,
        ladder: &'o [usize],
        identities: &'o IdentityMap,
        progress: &'o dyn IngestProgress,
    ) -> Self {
        Self {
            orch,
            key,
            source,
            ladder,
            identities,
            progress,
            stats: ReportStats::new(&key.report_id, source.mode(), ladder[0]),
            entities: BTreeSet::new(),
            batch: Vec::with_capacity(orch.config.batch_size.clamp(1, 100_000)),
            size_idx: 0,
        }
    }

    fn page_size(&self) -> usize {
        self.ladder[self.size_idx]
    }

    /// Commit the pending batch and checkpoint `position` behind it.
    fn flush(&mut self, position: &Cursor) -> Result<(), IngestError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let n = self.orch.commit(&self.key.report_id, &mut self.batch)?;
        self.stats.facts_upserted += n as u64;
        self.stats.batches_committed += 1;
        if !position.is_done() {
            self.orch
                .save_checkpoint(self.key, self.page_size(), position.clone())?;
        }
        self.progress
            .on_batch_committed(&self.key.report_id, n, position);
        Ok(())
    }

    fn run(&mut self, start: Cursor) -> Result<ReportStats, IngestError> {
        let batch_size = self.orch.config.batch_size.max(1);
        let report_id = self.key.report_id.clone();
        let mut cursor = start;
        let mut sample_logged = false;

        while !cursor.is_done() {
            let page = match self
                .source
                .fetch_page(self.orch.fetcher, &cursor, self.page_size())
            {
                Ok(page) => page,
                Err(e) if e.is_permanent() => match self.source.alternative(&cursor) {
                    Some(next) => {
                        warn!(report = %report_id, error = %e, ?next, "query form rejected; trying the next one");
                        cursor = next;
                        continue;
                    }
                    None => {
                        return Err(IngestError::Rejected {
                            report: report_id,
                            source: e,
                        })
                    }
                },
                Err(e) if self.size_idx + 1 < self.ladder.len() => {
                    let from = self.page_size();
                    self.size_idx += 1;
                    self.progress
                        .on_page_size_degraded(&report_id, from, self.page_size(), &e);
                    continue;
                }
                Err(e) => {
                    // Keep whatever was already transformed before giving up.
                    self.flush(&cursor)?;
                    return Err(IngestError::Exhausted {
                        report: report_id,
                        page_sizes: self.ladder.to_vec(),
                        last: e,
                    });
                }
            };

            if page.rows.is_empty() {
                if let Some(next) = self.source.alternative(&cursor) {
                    info!(report = %report_id, ?next, "query form returned no rows; trying the next one");
                    cursor = next;
                    continue;
                }
            }

            if self.orch.config.debug_sample && !sample_logged {
                if let Some(row) = page.rows.first() {
                    let keys: Vec<&str> = row
                        .as_object()
                        .map(|o| o.keys().map(String::as_str).collect())
                        .unwrap_or_default();
                    info!(report = %report_id, ?keys, row = %row, "sample row");
                    sample_logged = true;
                }
            }

            let already = cursor.skip_in_page();
            for (i, row) in page.rows.iter().enumerate().skip(already) {
                self.stats.rows_downloaded += 1;
                match self
                    .orch
                    .transform_row(row, self.key.period, &report_id, self.identities)
                {
                    Ok(fact) => {
                        self.entities.insert(fact.entity_id.clone());
                        self.batch.push(fact);
                    }
                    Err(issue) => self.stats.record(issue),
                }
                if self.batch.len() >= batch_size {
                    self.flush(&cursor.within_page(i + 1))?;
                }
            }

            // Safety net: record the page end only when nothing is pending.
            if self.batch.is_empty() && !page.next.is_done() {
                self.orch
                    .save_checkpoint(self.key, self.page_size(), page.next.clone())?;
            }
            cursor = page.next;
        }

        self.flush(&Cursor::Done)?;
        self.stats.unique_entities = self.entities.len();
        self.stats.final_page_size = self.page_size();
        Ok(self.stats.clone())
    }
}
