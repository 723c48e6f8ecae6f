//! Domain types for ifrisk

pub mod period;
pub mod records;

pub use period::{Period, PeriodError};
pub use records::{
    qualify_label, CanonicalMetricSet, Driver, Metric, Rating, RawFact, RiskAssessment, RiskInput,
};
