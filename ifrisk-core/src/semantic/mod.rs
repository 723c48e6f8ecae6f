//! Rule-based mapping of raw labels onto canonical metrics.

pub mod aggregate;
pub mod audit;
pub mod classifier;
pub mod rules;

pub use aggregate::{aggregate, derive_ratios};
pub use audit::{audit, LabelAudit};
pub use classifier::{resolve, select_candidate, Candidate};
pub use rules::{MetricRule, PlausibleRange, RuleError, RuleSet};
