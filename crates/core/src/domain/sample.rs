use crate::domain::sector::SectorKey;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metrics that have sector distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Per,
    Pbr,
    Roe,
    Psr,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Per, Metric::Pbr, Metric::Roe, Metric::Psr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Per => "per",
            Metric::Pbr => "pbr",
            Metric::Roe => "roe",
            Metric::Psr => "psr",
        }
    }

    /// Values outside `(0, upper]` are treated as outliers and excluded from
    /// aggregation and from the margin-of-safety paths. ROE is in percent.
    pub fn upper_bound(&self) -> f64 {
        match self {
            Metric::Per => 150.0,
            Metric::Pbr => 15.0,
            Metric::Roe => 100.0,
            Metric::Psr => 30.0,
        }
    }

    pub fn in_bounds(&self, v: f64) -> bool {
        v.is_finite() && v > 0.0 && v <= self.upper_bound()
    }

    /// Cheap is good for multiples, high is good for ROE.
    pub fn lower_is_better(&self) -> bool {
        !matches!(self, Metric::Roe)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown metric: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOpinion {
    #[default]
    Unqualified,
    Qualified,
    Adverse,
    Disclaimer,
}

/// Accounting, corporate-event and market-status flags reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFlags {
    /// Consecutive most-recent fiscal years with negative operating cash flow.
    #[serde(default)]
    pub negative_ocf_years: u8,
    #[serde(default)]
    pub audit_opinion: AuditOpinion,
    #[serde(default)]
    pub capital_impairment: bool,
    /// 관리종목 (administrative issue) designation.
    #[serde(default)]
    pub regulatory_watch: bool,
    /// 불성실공시법인 designation.
    #[serde(default)]
    pub disclosure_violation: bool,
    #[serde(default)]
    pub trading_halt: bool,
}

/// One symbol's valuation inputs for a fetch cycle. Ratios are in percent
/// where the market quotes them that way (ROE, debt ratio, current ratio,
/// payout ratio); currency amounts are KRW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub symbol: String,
    pub name: String,
    pub sector_label: String,
    pub sector: SectorKey,
    pub as_of_date: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub roe: Option<f64>,
    pub psr: Option<f64>,
    pub debt_ratio: Option<f64>,
    pub current_ratio: Option<f64>,
    pub market_cap: Option<f64>,
    pub trading_value: Option<f64>,
    pub payout_ratio: Option<f64>,
    #[serde(default)]
    pub flags: RiskFlags,
}

impl MetricSample {
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Per => self.per,
            Metric::Pbr => self.pbr,
            Metric::Roe => self.roe,
            Metric::Psr => self.psr,
        }
    }

    /// ROE as a fraction (0.15 for 15%).
    pub fn roe_decimal(&self) -> Option<f64> {
        self.roe.map(|v| v / 100.0)
    }

    /// Rejects placeholder or broken rows before they reach scoring. PER may be
    /// absent or negative (loss-making companies) but never exactly zero.
    pub fn validate(&self) -> Result<(), DataQualityError> {
        let symbol = self.symbol.as_str();
        if symbol.trim().is_empty() {
            return Err(DataQualityError::new(symbol, DataQualityIssue::Missing("symbol")));
        }

        let pbr = require(symbol, "pbr", self.pbr)?;
        let roe = require(symbol, "roe", self.roe)?;
        if pbr == 0.0 {
            return Err(DataQualityError::new(symbol, DataQualityIssue::Zero("pbr")));
        }

        if let Some(per) = self.per {
            if !per.is_finite() {
                return Err(DataQualityError::new(symbol, DataQualityIssue::NonFinite("per")));
            }
            if per == 0.0 {
                return Err(DataQualityError::new(symbol, DataQualityIssue::Zero("per")));
            }
        }

        for (field, v) in [
            ("psr", self.psr),
            ("debt_ratio", self.debt_ratio),
            ("current_ratio", self.current_ratio),
            ("market_cap", self.market_cap),
            ("trading_value", self.trading_value),
            ("payout_ratio", self.payout_ratio),
        ] {
            if let Some(v) = v {
                if !v.is_finite() {
                    return Err(DataQualityError::new(symbol, DataQualityIssue::NonFinite(field)));
                }
            }
        }

        let core = [self.per, Some(pbr), Some(roe)];
        if core.iter().flatten().any(|v| is_sentinel(*v)) {
            return Err(DataQualityError::new(symbol, DataQualityIssue::Sentinel));
        }
        if let Some(per) = self.per {
            if per == pbr && pbr == roe {
                return Err(DataQualityError::new(symbol, DataQualityIssue::Sentinel));
            }
        }

        Ok(())
    }
}

// Vendor fillers for "not reported".
const SENTINELS: [f64; 4] = [9999.0, 99999.0, 999999.0, 99999.99];

fn is_sentinel(v: f64) -> bool {
    SENTINELS.iter().any(|s| (v.abs() - s).abs() < 1e-9)
}

fn require(symbol: &str, field: &'static str, v: Option<f64>) -> Result<f64, DataQualityError> {
    match v {
        None => Err(DataQualityError::new(symbol, DataQualityIssue::Missing(field))),
        Some(v) if !v.is_finite() => {
            Err(DataQualityError::new(symbol, DataQualityIssue::NonFinite(field)))
        }
        Some(v) => Ok(v),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataQualityIssue {
    Missing(&'static str),
    NonFinite(&'static str),
    Zero(&'static str),
    Sentinel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataQualityError {
    pub symbol: String,
    pub issue: DataQualityIssue,
}

impl DataQualityError {
    pub fn new(symbol: &str, issue: DataQualityIssue) -> Self {
        Self {
            symbol: symbol.to_string(),
            issue,
        }
    }
}

impl fmt::Display for DataQualityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issue {
            DataQualityIssue::Missing(field) => write!(f, "{}: missing {field}", self.symbol),
            DataQualityIssue::NonFinite(field) => {
                write!(f, "{}: non-finite {field}", self.symbol)
            }
            DataQualityIssue::Zero(field) => write!(f, "{}: zero {field}", self.symbol),
            DataQualityIssue::Sentinel => {
                write!(f, "{}: placeholder values in valuation fields", self.symbol)
            }
        }
    }
}

impl std::error::Error for DataQualityError {}


#[cfg(test)]
mod tests {
    use super::fixtures::sample;
    use super::*;

    #[test]
    fn accepts_clean_sample() {
        assert!(sample("005930", SectorKey::Semiconductors).validate().is_ok());
    }

    #[test]
    fn loss_makers_without_per_are_valid() {
        let mut s = sample("000001", SectorKey::Pharma);
        s.per = None;
        s.roe = Some(-4.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_missing_zero_nan_and_sentinels() {
        let mut s = sample("000002", SectorKey::Retail);
        s.roe = None;
        assert_eq!(s.validate().unwrap_err().issue, DataQualityIssue::Missing("roe"));

        let mut s = sample("000002", SectorKey::Retail);
        s.pbr = Some(0.0);
        assert_eq!(s.validate().unwrap_err().issue, DataQualityIssue::Zero("pbr"));

        let mut s = sample("000002", SectorKey::Retail);
        s.per = Some(f64::NAN);
        assert_eq!(s.validate().unwrap_err().issue, DataQualityIssue::NonFinite("per"));

        let mut s = sample("000002", SectorKey::Retail);
        s.per = Some(99999.99);
        assert_eq!(s.validate().unwrap_err().issue, DataQualityIssue::Sentinel);

        let mut s = sample("000002", SectorKey::Retail);
        s.per = Some(1.0);
        s.pbr = Some(1.0);
        s.roe = Some(1.0);
        assert_eq!(s.validate().unwrap_err().issue, DataQualityIssue::Sentinel);
    }

    #[test]
    fn metric_bounds() {
        assert!(Metric::Per.in_bounds(150.0));
        assert!(!Metric::Per.in_bounds(150.1));
        assert!(!Metric::Pbr.in_bounds(0.0));
        assert!(!Metric::Pbr.in_bounds(-1.0));
        assert!(!Metric::Roe.in_bounds(f64::INFINITY));
        assert_eq!("PBR".parse::<Metric>().unwrap(), Metric::Pbr);
    }
}
