//! Label frequency report for reviewing the rule table.

use super::rules::RuleSet;
use crate::domain::{Metric, RawFact};
use crate::text::clean;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelAudit {
    /// Report-qualified label as stored.
    pub raw_label: String,
    pub count: usize,
    /// Metrics whose patterns hit the unqualified label, in table order.
    pub hits: Vec<Metric>,
}

/// Distinct labels, most frequent first (ties by label), capped at `limit`.
pub fn audit(facts: &[RawFact], rules: &RuleSet, limit: Option<usize>) -> Vec<LabelAudit> {
    let mut counts: BTreeMap<&str, (usize, &RawFact)> = BTreeMap::new();
    for fact in facts {
        counts.entry(fact.raw_label.as_str()).or_insert((0, fact)).0 += 1;
    }

    let mut rows: Vec<LabelAudit> = counts
        .into_iter()
        .map(|(raw_label, (count, fact))| LabelAudit {
            raw_label: raw_label.to_string(),
            count,
            hits: rules.hits(&clean(Some(fact.label()))),
        })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.raw_label.cmp(&b.raw_label)));
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    rows
}
