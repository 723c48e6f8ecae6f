//! Row types flowing between the pipeline stages.
//!
//! Every numeric field is either a finite `f64` or `None`. Constructors and
//! stage code enforce this; nothing downstream re-checks it.

use super::period::Period;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One (entity, period, label, value) observation as published upstream.
///
/// Natural key: `(period, entity_id, raw_label)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    pub period: Period,
    pub entity_id: String,
    pub entity_name: String,
    /// Report-qualified cleaned label: `"<report_id>::<clean_label>"`.
    pub raw_label: String,
    pub value: f64,
}

impl RawFact {
    pub fn key(&self) -> (Period, &str, &str) {
        (self.period, &self.entity_id, &self.raw_label)
    }

    /// Report id prefix of the label, or `""` for unqualified labels.
    pub fn report_id(&self) -> &str {
        split_qualified(&self.raw_label).0
    }

    /// Label without the report qualifier.
    pub fn label(&self) -> &str {
        split_qualified(&self.raw_label).1
    }
}

/// Separator between report id and label in qualified labels.
pub const LABEL_QUALIFIER: &str = "::";

pub fn qualify_label(report_id: &str, clean_label: &str) -> String {
    format!("{report_id}{LABEL_QUALIFIER}{clean_label}")
}

fn split_qualified(label: &str) -> (&str, &str) {
    match label.split_once(LABEL_QUALIFIER) {
        Some((report, rest)) => (report.trim(), rest),
        None => ("", label),
    }
}

/// Canonical metric vocabulary produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CapitalRatio,
    LiquidityRatio,
    NetIncome,
    TotalAssets,
    Equity,
    NplRatio,
    CreditPortfolio,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::CapitalRatio,
        Metric::LiquidityRatio,
        Metric::NetIncome,
        Metric::TotalAssets,
        Metric::Equity,
        Metric::NplRatio,
        Metric::CreditPortfolio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::CapitalRatio => "capital_ratio",
            Metric::LiquidityRatio => "liquidity_ratio",
            Metric::NetIncome => "net_income",
            Metric::TotalAssets => "total_assets",
            Metric::Equity => "equity",
            Metric::NplRatio => "npl_ratio",
            Metric::CreditPortfolio => "credit_portfolio",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric '{s}'"))
    }
}

/// Canonical metrics for one entity in one period.
///
/// Natural key: `(period, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetricSet {
    pub period: Period,
    pub entity_id: String,
    pub entity_name: String,
    pub capital_ratio: Option<f64>,
    pub liquidity_ratio: Option<f64>,
    pub net_income: Option<f64>,
    pub total_assets: Option<f64>,
    pub equity: Option<f64>,
    pub npl_ratio: Option<f64>,
    pub credit_portfolio: Option<f64>,
    /// `net_income / total_assets * 100`
    pub roa: Option<f64>,
    /// `total_assets / equity`
    pub leverage: Option<f64>,
}

impl CanonicalMetricSet {
    pub fn empty(period: Period, entity_id: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self {
            period,
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            capital_ratio: None,
            liquidity_ratio: None,
            net_income: None,
            total_assets: None,
            equity: None,
            npl_ratio: None,
            credit_portfolio: None,
            roa: None,
            leverage: None,
        }
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::CapitalRatio => self.capital_ratio,
            Metric::LiquidityRatio => self.liquidity_ratio,
            Metric::NetIncome => self.net_income,
            Metric::TotalAssets => self.total_assets,
            Metric::Equity => self.equity,
            Metric::NplRatio => self.npl_ratio,
            Metric::CreditPortfolio => self.credit_portfolio,
        }
    }

    /// Store a value, dropping anything non-finite.
    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        let value = value.filter(|v| v.is_finite());
        match metric {
            Metric::CapitalRatio => self.capital_ratio = value,
            Metric::LiquidityRatio => self.liquidity_ratio = value,
            Metric::NetIncome => self.net_income = value,
            Metric::TotalAssets => self.total_assets = value,
            Metric::Equity => self.equity = value,
            Metric::NplRatio => self.npl_ratio = value,
            Metric::CreditPortfolio => self.credit_portfolio = value,
        }
    }

    pub fn input(&self, input: RiskInput) -> Option<f64> {
        match input {
            RiskInput::CapitalRatio => self.capital_ratio,
            RiskInput::LiquidityRatio => self.liquidity_ratio,
            RiskInput::Roa => self.roa,
            RiskInput::NplRatio => self.npl_ratio,
            RiskInput::Leverage => self.leverage,
        }
    }
}

/// The five inputs of the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskInput {
    CapitalRatio,
    LiquidityRatio,
    Roa,
    NplRatio,
    Leverage,
}

impl RiskInput {
    pub const ALL: [RiskInput; 5] = [
        RiskInput::CapitalRatio,
        RiskInput::LiquidityRatio,
        RiskInput::Roa,
        RiskInput::NplRatio,
        RiskInput::Leverage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskInput::CapitalRatio => "capital_ratio",
            RiskInput::LiquidityRatio => "liquidity_ratio",
            RiskInput::Roa => "roa",
            RiskInput::NplRatio => "npl_ratio",
            RiskInput::Leverage => "leverage",
        }
    }
}

impl fmt::Display for RiskInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rating {
    High,
    Medium,
    Low,
}

impl Rating {
    pub fn from_score(score: u8) -> Self {
        if score >= 70 {
            Rating::High
        } else if score >= 40 {
            Rating::Medium
        } else {
            Rating::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::High => "HIGH",
            Rating::Medium => "MEDIUM",
            Rating::Low => "LOW",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explain-trace entry for one scoring input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub value: Option<f64>,
    pub contribution: f64,
}

/// Scored entity for one period. Natural key: `(period, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub period: Period,
    pub entity_id: String,
    pub entity_name: String,
    pub score: u8,
    pub rating: Rating,
    pub drivers: BTreeMap<RiskInput, Driver>,
}
