//! Per-entity candidate selection for one metric rule.
//!
//! Selection order:
//! 1. candidates = facts whose unqualified label matches a pattern and whose
//!    value passes the plausibility range;
//! 2. the first preferred report with any candidate narrows the pool;
//!    otherwise every candidate stays in it;
//! 3. the largest absolute value wins. Equal magnitudes fall back to the
//!    smaller label, then report id, then the larger value, so the pick never
//!    depends on fact order.
//!
//! Step 3 is a heuristic: it assumes the headline figure dominates partial
//! lines with similar labels.

use super::rules::MetricRule;
use crate::domain::RawFact;
use crate::text::clean;
use std::cmp::Ordering;

/// A fact that survived pattern and range filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate<'f> {
    pub report_id: &'f str,
    pub label: &'f str,
    pub value: f64,
}

pub fn candidates<'f>(rule: &MetricRule, facts: &[&'f RawFact]) -> Vec<Candidate<'f>> {
    facts
        .iter()
        .copied()
        .filter(|f| rule.admits(f.value))
        .filter(|f| rule.matches(&clean(Some(f.label()))))
        .map(|f| Candidate {
            report_id: f.report_id(),
            label: f.label(),
            value: f.value,
        })
        .collect()
}

fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.value
        .abs()
        .total_cmp(&a.value.abs())
        .then_with(|| a.label.cmp(b.label))
        .then_with(|| a.report_id.cmp(b.report_id))
        .then_with(|| b.value.total_cmp(&a.value))
}

/// The winning candidate, before fraction rescaling.
pub fn select_candidate<'f>(rule: &MetricRule, facts: &[&'f RawFact]) -> Option<Candidate<'f>> {
    let found = candidates(rule, facts);
    let preferred = rule.preferred_reports.iter().find_map(|report| {
        let pool: Vec<&Candidate> = found.iter().filter(|c| c.report_id == report.as_str()).collect();
        (!pool.is_empty()).then_some(pool)
    });
    let pool = preferred.unwrap_or_else(|| found.iter().collect());
    pool.into_iter().min_by(|a, b| rank(a, b)).copied()
}

/// Resolved metric value for one entity, or `None` when nothing survives.
pub fn resolve(rule: &MetricRule, facts: &[&RawFact]) -> Option<f64> {
    let mut value = select_candidate(rule, facts)?.value;
    if rule.rescale_fraction && value > 0.0 && value < 1.0 {
        value *= 100.0;
    }
    Some(value).filter(|v| v.is_finite())
}
