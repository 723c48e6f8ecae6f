//! Declarative metric rule table.
//!
//! Rules are data: the built-in table is embedded TOML, and an alternate file
//! with the same shape can replace it. Patterns are compiled once when the
//! table is loaded.

use crate::domain::Metric;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUILTIN_RULES: &str = include_str!("default_rules.toml");

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse rule TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("rule {metric}: bad pattern '{pattern}': {source}")]
    Pattern {
        metric: Metric,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule {0}: no patterns")]
    NoPatterns(Metric),

    #[error("rule {0}: listed more than once")]
    Duplicate(Metric),

    #[error("rule {0}: plausibility range is empty")]
    EmptyRange(Metric),
}

/// Accepted value interval. Bounds are exclusive unless marked inclusive;
/// a missing bound is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlausibleRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min_inclusive: bool,
    #[serde(default)]
    pub max_inclusive: bool,
}

impl PlausibleRange {
    pub fn contains(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let above = match self.min {
            Some(min) if self.min_inclusive => value >= min,
            Some(min) => value > min,
            None => true,
        };
        let below = match self.max {
            Some(max) if self.max_inclusive => value <= max,
            Some(max) => value < max,
            None => true,
        };
        above && below
    }

    fn is_empty(&self) -> bool {
        match (self.min, self.max) {
            (Some(min), Some(max)) => min > max || (min == max && !(self.min_inclusive && self.max_inclusive)),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    metric: Metric,
    patterns: Vec<String>,
    #[serde(default)]
    preferred_reports: Vec<String>,
    #[serde(default)]
    range: Option<PlausibleRange>,
    #[serde(default)]
    rescale_fraction: bool,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(rename = "rule", default)]
    rules: Vec<RuleEntry>,
}

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct MetricRule {
    pub metric: Metric,
    patterns: Vec<Regex>,
    pub preferred_reports: Vec<String>,
    pub range: Option<PlausibleRange>,
    /// Values in (0, 1) are fractions and get multiplied by 100 after selection.
    pub rescale_fraction: bool,
}

impl MetricRule {
    /// Whether any pattern hits `label` (already cleaned, unqualified).
    pub fn matches(&self, label: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(label))
    }

    /// Whether `value` passes the plausibility range.
    pub fn admits(&self, value: f64) -> bool {
        value.is_finite() && self.range.map_or(true, |r| r.contains(value))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Regex::as_str)
    }

    fn compile(entry: RuleEntry) -> Result<Self, RuleError> {
        if entry.patterns.is_empty() {
            return Err(RuleError::NoPatterns(entry.metric));
        }
        if entry.range.is_some_and(|r| r.is_empty()) {
            return Err(RuleError::EmptyRange(entry.metric));
        }
        let patterns = entry
            .patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| RuleError::Pattern {
                        metric: entry.metric,
                        pattern: p.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            metric: entry.metric,
            patterns,
            preferred_reports: entry.preferred_reports,
            range: entry.range,
            rescale_fraction: entry.rescale_fraction,
        })
    }
}

/// Ordered rule table.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<MetricRule>,
}

impl RuleSet {
    /// The embedded default table.
    pub fn builtin() -> Result<Self, RuleError> {
        Self::from_toml(BUILTIN_RULES)
    }

    pub fn from_file(path: &Path) -> Result<Self, RuleError> {
        let content = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, RuleError> {
        let file: RuleFile = toml::from_str(content)?;
        let mut seen = BTreeSet::new();
        let mut rules = Vec::with_capacity(file.rules.len());
        for entry in file.rules {
            if !seen.insert(entry.metric) {
                return Err(RuleError::Duplicate(entry.metric));
            }
            rules.push(MetricRule::compile(entry)?);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[MetricRule] {
        &self.rules
    }

    pub fn get(&self, metric: Metric) -> Option<&MetricRule> {
        self.rules.iter().find(|r| r.metric == metric)
    }

    /// Metrics whose patterns hit `label`, in table order.
    pub fn hits(&self, label: &str) -> Vec<Metric> {
        self.rules
            .iter()
            .filter(|r| r.matches(label))
            .map(|r| r.metric)
            .collect()
    }
}
