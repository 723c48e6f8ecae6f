//! Reporting period (year-month) and quarter-end arithmetic.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("invalid period '{0}': expected YYYYMM, YYYY-MM or YYYY-MM-DD")]
    Invalid(String),

    #[error("month out of range in period '{0}'")]
    MonthOutOfRange(String),

    #[error("year out of range in period '{0}': expected 1 to 9999")]
    YearOutOfRange(String),
}

const YEARS: std::ops::RangeInclusive<i32> = 1..=9999;

/// A reporting cutoff identified by year and month.
///
/// Serialized as `YYYY-MM`. Upstream queries use the compact `YYYYMM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodError> {
        if !YEARS.contains(&year) {
            return Err(PeriodError::YearOutOfRange(format!("{year}-{month}")));
        }
        if !(1..=12).contains(&month) {
            return Err(PeriodError::MonthOutOfRange(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Compact upstream form, e.g. `202509`.
    pub fn anomes(&self) -> u32 {
        self.year.unsigned_abs() * 100 + self.month
    }

    /// Last calendar day of the month.
    pub fn ref_date(&self) -> NaiveDate {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|d| d.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    /// The quarter-end period immediately before this one.
    pub fn previous_quarter_end(&self) -> Period {
        match self.month {
            m if m > 9 => Period { year: self.year, month: 9 },
            m if m > 6 => Period { year: self.year, month: 6 },
            m if m > 3 => Period { year: self.year, month: 3 },
            _ => Period { year: self.year - 1, month: 12 },
        }
    }

    /// Most recent quarter-end at or before `today`, then `n - 1` earlier quarter-ends.
    ///
    /// Used to find which period the upstream has published most recently.
    pub fn recent_quarter_ends(today: NaiveDate, n: usize) -> Vec<Period> {
        let month = today.month();
        let start = if month < 3 {
            Period { year: today.year() - 1, month: 12 }
        } else {
            Period { year: today.year(), month: month - month % 3 }
        };

        let mut out = Vec::with_capacity(n);
        let mut cur = start;
        for _ in 0..n {
            out.push(cur);
            cur = cur.previous_quarter_end();
        }
        out
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let digits: String = t.chars().filter(|c| c.is_ascii_digit()).collect();
        let well_formed = match t.len() {
            6 => digits.len() == 6,
            7 => digits.len() == 6 && t.as_bytes()[4] == b'-',
            10 => NaiveDate::parse_from_str(t, "%Y-%m-%d").is_ok(),
            _ => false,
        };
        if !well_formed {
            return Err(PeriodError::Invalid(s.to_string()));
        }
        let year: i32 = digits[0..4]
            .parse()
            .map_err(|_| PeriodError::Invalid(s.to_string()))?;
        let month: u32 = digits[4..6]
            .parse()
            .map_err(|_| PeriodError::Invalid(s.to_string()))?;
        Period::new(year, month).map_err(|e| match e {
            PeriodError::YearOutOfRange(_) => PeriodError::YearOutOfRange(s.to_string()),
            _ => PeriodError::MonthOutOfRange(s.to_string()),
        })
    }
}

impl TryFrom<String> for Period {
    type Error = PeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.to_string()
    }
}
