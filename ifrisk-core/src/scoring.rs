//! Deterministic risk score from canonical metrics.
//!
//! Each input maps to a step penalty. Absence costs a small fixed amount
//! (uncertainty, not a bad signal); a present value walks the bands in order
//! and takes the first match. The total is clamped to [0, 100] and rounded.

use crate::domain::{CanonicalMetricSet, Driver, Rating, RiskAssessment, RiskInput};
use std::collections::BTreeMap;

/// Which side of the threshold is worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Worse {
    /// Band hits when `value < threshold`.
    Below,
    /// Band hits when `value > threshold`.
    Above,
}

#[derive(Debug, Clone, Copy)]
struct Bands {
    absent: f64,
    worse: Worse,
    /// (threshold, penalty), worst first.
    steps: &'static [(f64, f64)],
}

impl Bands {
    fn penalty(&self, value: Option<f64>) -> f64 {
        let Some(v) = value.filter(|v| v.is_finite()) else {
            return self.absent;
        };
        self.steps
            .iter()
            .find(|(threshold, _)| match self.worse {
                Worse::Below => v < *threshold,
                Worse::Above => v > *threshold,
            })
            .map_or(0.0, |(_, penalty)| *penalty)
    }
}

fn bands(input: RiskInput) -> Bands {
    match input {
        RiskInput::CapitalRatio => Bands {
            absent: 8.0,
            worse: Worse::Below,
            steps: &[(8.0, 30.0), (10.0, 20.0), (12.0, 10.0)],
        },
        RiskInput::LiquidityRatio => Bands {
            absent: 6.0,
            worse: Worse::Below,
            steps: &[(0.9, 25.0), (1.0, 18.0), (1.1, 10.0)],
        },
        RiskInput::Roa => Bands {
            absent: 5.0,
            worse: Worse::Below,
            steps: &[(-1.0, 20.0), (0.0, 12.0), (0.5, 6.0)],
        },
        RiskInput::NplRatio => Bands {
            absent: 4.0,
            worse: Worse::Above,
            steps: &[(10.0, 18.0), (6.0, 12.0), (4.0, 6.0)],
        },
        RiskInput::Leverage => Bands {
            absent: 4.0,
            worse: Worse::Above,
            steps: &[(20.0, 12.0), (15.0, 8.0), (10.0, 4.0)],
        },
    }
}

/// Penalty for one input value.
pub fn penalty(input: RiskInput, value: Option<f64>) -> f64 {
    bands(input).penalty(value)
}

/// Score one entity. Pure: identical inputs give identical output.
pub fn score(metrics: &CanonicalMetricSet) -> RiskAssessment {
    let mut drivers = BTreeMap::new();
    let mut total = 0.0;
    for input in RiskInput::ALL {
        let value = metrics.input(input).filter(|v| v.is_finite());
        let contribution = penalty(input, value);
        total += contribution;
        drivers.insert(input, Driver { value, contribution });
    }

    let score = total.clamp(0.0, 100.0).round() as u8;
    RiskAssessment {
        period: metrics.period,
        entity_id: metrics.entity_id.clone(),
        entity_name: metrics.entity_name.clone(),
        score,
        rating: Rating::from_score(score),
        drivers,
    }
}
