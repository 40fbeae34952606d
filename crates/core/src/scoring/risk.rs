use crate::config::override_from_env;
use crate::domain::sample::{AuditOpinion, MetricSample};
use crate::scoring::quality::criteria_for;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// A single penalty at or below this short-circuits scoring.
    pub severe_penalty: f64,
    /// KRW; daily trading value under this is illiquid.
    pub trading_value_floor: f64,
    pub trading_value_hard_floor: f64,
    /// Share of the sector's reject ceiling above which debt is extreme.
    pub extreme_debt_share: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            severe_penalty: -30.0,
            trading_value_floor: 100_000_000.0,
            trading_value_hard_floor: 10_000_000.0,
            extreme_debt_share: 0.75,
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        override_from_env(&mut out.severe_penalty, "RISK_SEVERE_PENALTY");
        override_from_env(&mut out.trading_value_floor, "RISK_TRADING_VALUE_FLOOR");
        override_from_env(&mut out.trading_value_hard_floor, "RISK_TRADING_VALUE_HARD_FLOOR");
        override_from_env(&mut out.extreme_debt_share, "RISK_EXTREME_DEBT_SHARE");
        // Always a penalty, never a bonus.
        out.severe_penalty = -out.severe_penalty.abs();
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskPenalty {
    pub flag: &'static str,
    /// Negative.
    pub points: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub penalties: Vec<RiskPenalty>,
    /// First penalty at or below the severe threshold.
    pub severe: Option<RiskPenalty>,
}

impl RiskAssessment {
    /// Sum of all penalties; never positive.
    pub fn total(&self) -> f64 {
        self.penalties.iter().map(|p| p.points).sum::<f64>().min(0.0)
    }
}

/// Debt ratio (percent) past which the extreme-debt flag fires. Sits below
/// the quality reject ceiling so the penalty reaches scored names. `None` for
/// sectors without a debt ceiling.
pub fn extreme_debt_threshold(sample: &MetricSample, config: &RiskConfig) -> Option<f64> {
    criteria_for(sample.sector)
        .debt_ceiling
        .map(|ceiling| ceiling * config.extreme_debt_share)
}

pub fn assess_risk(sample: &MetricSample, config: &RiskConfig) -> RiskAssessment {
    let flags = &sample.flags;
    let mut penalties = Vec::new();
    let mut push = |flag: &'static str, points: f64| penalties.push(RiskPenalty { flag, points });

    // Accounting.
    match flags.negative_ocf_years {
        0 | 1 => {}
        2 => push("negative_ocf_2y", -10.0),
        _ => push("negative_ocf_3y", -20.0),
    }
    match flags.audit_opinion {
        AuditOpinion::Unqualified => {}
        AuditOpinion::Qualified => push("audit_qualified", -15.0),
        AuditOpinion::Adverse => push("audit_adverse", -40.0),
        AuditOpinion::Disclaimer => push("audit_disclaimer", -40.0),
    }
    if flags.capital_impairment {
        push("capital_impairment", -30.0);
    }
    if let (Some(debt), Some(ceiling)) = (sample.debt_ratio, extreme_debt_threshold(sample, config)) {
        if debt > ceiling {
            push("extreme_debt", -15.0);
        }
    }

    // Corporate events.
    if flags.regulatory_watch {
        push("regulatory_watch", -30.0);
    }
    if flags.disclosure_violation {
        push("disclosure_violation", -10.0);
    }
    if flags.trading_halt {
        push("trading_halt", -40.0);
    }

    // Liquidity.
    match sample.trading_value {
        Some(v) if v < config.trading_value_hard_floor => push("illiquid_severe", -20.0),
        Some(v) if v < config.trading_value_floor => push("illiquid", -10.0),
        _ => {}
    }

    let severe = penalties
        .iter()
        .find(|p| p.points <= config.severe_penalty)
        .cloned();
    RiskAssessment { penalties, severe }
}
