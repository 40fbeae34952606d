use crate::domain::sector::SectorKey;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "strong_buy")]
    StrongBuy,
    #[serde(rename = "buy")]
    Buy,
    #[serde(rename = "hold")]
    Hold,
    #[serde(rename = "caution")]
    Caution,
    #[serde(rename = "avoid")]
    Avoid,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "strong_buy",
            Recommendation::Buy => "buy",
            Recommendation::Hold => "hold",
            Recommendation::Caution => "caution",
            Recommendation::Avoid => "avoid",
        }
    }

    pub fn worst() -> Self {
        Recommendation::Avoid
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Recommendation::StrongBuy,
            Recommendation::Buy,
            Recommendation::Hold,
            Recommendation::Caution,
            Recommendation::Avoid,
        ]
        .into_iter()
        .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a symbol ended up with the score it has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Scored,
    /// Failed a hard quality threshold; total forced to zero.
    Rejected { reason: String },
    /// A single severe risk flag short-circuited scoring.
    SevereRisk { flag: String },
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Scored => "scored",
            Verdict::Rejected { .. } => "rejected",
            Verdict::SevereRisk { .. } => "severe_risk",
        }
    }
}

/// Percentile-derived valuation points, each on a 0..=20 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValuationSubScores {
    pub per: f64,
    pub pbr: f64,
    pub roe: f64,
}

impl ValuationSubScores {
    pub fn total(&self) -> f64 {
        self.per + self.pbr + self.roe
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub valuation: ValuationSubScores,
    pub quality: f64,
    pub sector_bonus: f64,
    pub margin_of_safety: f64,
    /// Always `<= 0`.
    pub risk_penalty: f64,
}

impl ComponentScores {
    pub fn sum(&self) -> f64 {
        self.valuation.total()
            + self.quality
            + self.sector_bonus
            + self.margin_of_safety
            + self.risk_penalty
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub symbol: String,
    pub name: String,
    pub sector: SectorKey,
    pub as_of_date: NaiveDate,
    pub components: ComponentScores,
    pub total_score: f64,
    pub max_score: f64,
    pub grade: String,
    pub recommendation: Recommendation,
    pub verdict: Verdict,
    /// 1-based position after ranking; `None` until a batch is ranked.
    pub rank: Option<u32>,
    /// Fallbacks that shaped this score (global distribution used, alternative
    /// valuation path, default regime, ...).
    pub notes: Vec<String>,
    pub scored_at: DateTime<Utc>,
}

impl ScoreResult {
    pub fn percent_of_max(&self) -> f64 {
        if self.max_score <= 0.0 {
            return 0.0;
        }
        (self.total_score / self.max_score).clamp(0.0, 1.0)
    }
}
