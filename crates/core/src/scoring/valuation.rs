//! Gordon-growth justified multiples and the margin-of-safety score.
//!
//! With sustainable growth `g = ROE * b`:
//!
//! ```text
//! justified P/B = (ROE - g) / (r - g)
//! justified P/E = (1 - b)   / (r - g)
//! ```
//!
//! `g` is kept at least `max(margin_abs, margin_rel * r)` below `r` by
//! lowering `b`, so the denominator never vanishes.

use crate::config::override_from_env;
use crate::domain::sample::Metric;
use crate::scoring::regime::RegimeParameters;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ValuationConfig {
    pub growth_margin_abs: f64,
    pub growth_margin_rel: f64,
    pub mos_points_cap: f64,
    /// Share of the cap available to the price-to-sales path.
    pub alternative_weight: f64,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            growth_margin_abs: 0.02,
            growth_margin_rel: 0.15,
            mos_points_cap: 30.0,
            alternative_weight: 0.5,
        }
    }
}

impl ValuationConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        override_from_env(&mut out.growth_margin_abs, "GROWTH_MARGIN_ABS");
        override_from_env(&mut out.growth_margin_rel, "GROWTH_MARGIN_REL");
        override_from_env(&mut out.mos_points_cap, "MOS_POINTS_CAP");
        out.growth_margin_abs = out.growth_margin_abs.max(0.0);
        out.growth_margin_rel = out.growth_margin_rel.clamp(0.0, 1.0);
        out.mos_points_cap = out.mos_points_cap.max(0.0);
        out
    }

    pub fn growth_margin(&self, required_return: f64) -> f64 {
        self.growth_margin_abs
            .max(self.growth_margin_rel * required_return)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JustifiedMultiples {
    pub required_return: f64,
    pub growth: f64,
    /// Retention actually used; lower than the regime's when growth was clamped.
    pub retention_rate: f64,
    pub growth_clamped: bool,
    pub justified_pb: f64,
    pub justified_pe: f64,
}

/// `None` when ROE is not positive: no multiple can be justified.
pub fn justified_multiples(
    roe_decimal: f64,
    regime: &RegimeParameters,
    config: &ValuationConfig,
) -> Option<JustifiedMultiples> {
    if !(roe_decimal.is_finite() && roe_decimal > 0.0) {
        return None;
    }

    let r = regime.required_return;
    let mut b = regime.retention_rate.clamp(0.0, 1.0);
    let mut g = (roe_decimal * b).max(0.0);

    let ceiling = (r - config.growth_margin(r)).max(0.0);
    let growth_clamped = g > ceiling;
    if growth_clamped {
        g = ceiling;
        b = (g / roe_decimal).clamp(0.0, 1.0);
    }

    let denom = r - g;
    if !(denom > 0.0) {
        return None;
    }

    Some(JustifiedMultiples {
        required_return: r,
        growth: g,
        retention_rate: b,
        growth_clamped,
        justified_pb: (roe_decimal - g) / denom,
        justified_pe: (1.0 - b) / denom,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarginOfSafety {
    pub multiples: JustifiedMultiples,
    pub mos_pb: Option<f64>,
    pub mos_pe: Option<f64>,
    /// Smaller of the available paths, clamped to `[0, 1]`.
    pub fraction: f64,
    pub points: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Valuation {
    Justified(MarginOfSafety),
    /// ROE not positive; score on price-to-sales instead.
    NotApplicable,
}

fn path_mos(justified: f64, actual: Option<f64>, metric: Metric) -> Option<f64> {
    let actual = actual.filter(|v| metric.in_bounds(*v))?;
    Some((justified / actual - 1.0).max(0.0))
}

/// Conservative margin of safety: the smaller of the P/B and P/E margins,
/// each only when its ratio is positive and within bounds.
pub fn margin_of_safety(
    per: Option<f64>,
    pbr: Option<f64>,
    roe_decimal: Option<f64>,
    regime: &RegimeParameters,
    config: &ValuationConfig,
) -> Valuation {
    let Some(multiples) = roe_decimal.and_then(|roe| justified_multiples(roe, regime, config))
    else {
        return Valuation::NotApplicable;
    };

    let mos_pb = path_mos(multiples.justified_pb, pbr, Metric::Pbr);
    let mos_pe = path_mos(multiples.justified_pe, per, Metric::Per);
    let combined = match (mos_pb, mos_pe) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => 0.0,
    };
    let fraction = combined.clamp(0.0, 1.0);

    Valuation::Justified(MarginOfSafety {
        multiples,
        mos_pb,
        mos_pe,
        fraction,
        points: mos_points(fraction, config),
    })
}

/// 0..=100 raw score scaled into the capped contribution.
fn mos_points(fraction: f64, config: &ValuationConfig) -> f64 {
    let raw = (fraction * 100.0).min(100.0);
    raw * config.mos_points_cap / 100.0
}

/// Price-to-sales substitute for loss-makers: cheapness percentile
/// (100 = cheapest) at the configured share of the cap.
pub fn alternative_points(psr_cheapness: f64, config: &ValuationConfig) -> f64 {
    let raw = psr_cheapness.clamp(0.0, 100.0);
    raw * config.mos_points_cap / 100.0 * config.alternative_weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::regime::RegimeSource;

    fn regime(r: f64, b: f64) -> RegimeParameters {
        RegimeParameters {
            required_return: r,
            retention_rate: b,
            source: RegimeSource::Default,
        }
    }

    fn justified(v: Valuation) -> MarginOfSafety {
        match v {
            Valuation::Justified(m) => m,
            Valuation::NotApplicable => panic!("expected a justified valuation"),
        }
    }

    #[test]
    fn price_to_book_path_for_fifteen_percent_roe() {
        let cfg = ValuationConfig::default();
        let m = justified(margin_of_safety(None, Some(1.0), Some(0.15), &regime(0.115, 0.35), &cfg));

        assert!((m.multiples.growth - 0.0525).abs() < 1e-12);
        assert!(!m.multiples.growth_clamped);
        // (0.15 - 0.0525) / (0.115 - 0.0525)
        assert!((m.multiples.justified_pb - 1.56).abs() < 1e-9);
        assert!((m.mos_pb.unwrap() - 0.56).abs() < 1e-9);
        assert!((m.points - 16.8).abs() < 1e-9);
        assert_eq!(m.mos_pe, None);
    }

    #[test]
    fn conservative_minimum_when_both_paths_exist() {
        let cfg = ValuationConfig::default();
        let r = regime(0.115, 0.35);
        // Justified P/E is 0.65 / 0.0625 = 10.4, so PER 12 has no margin.
        let m = justified(margin_of_safety(Some(12.0), Some(1.0), Some(0.15), &r, &cfg));
        assert_eq!(m.mos_pe, Some(0.0));
        assert_eq!(m.fraction, 0.0);
        assert_eq!(m.points, 0.0);

        for (per, pbr) in [(5.0, 1.0), (8.0, 0.6), (9.0, 1.4), (3.0, 0.5)] {
            let m = justified(margin_of_safety(Some(per), Some(pbr), Some(0.15), &r, &cfg));
            let expected = m.mos_pb.unwrap().min(m.mos_pe.unwrap()).clamp(0.0, 1.0);
            assert_eq!(m.fraction, expected);
            assert!(m.fraction >= 0.0);
            assert!(m.points <= cfg.mos_points_cap);
        }
    }

    #[test]
    fn growth_near_required_return_is_clamped_not_exploded() {
        let cfg = ValuationConfig::default();
        let m = justified_multiples(0.15, &regime(0.115, 0.9), &cfg).unwrap();

        assert!(m.growth_clamped);
        assert!((m.growth - 0.095).abs() < 1e-12);
        assert!((m.retention_rate - 0.095 / 0.15).abs() < 1e-12);
        assert!((m.justified_pb - 2.75).abs() < 1e-9);
        assert!(m.justified_pe.is_finite() && m.justified_pe > 0.0);

        let mos = justified(margin_of_safety(Some(10.0), Some(1.0), Some(0.15), &regime(0.115, 0.9), &cfg));
        assert!(mos.points.is_finite());
        assert!((0.0..=30.0).contains(&mos.points));
    }

    #[test]
    fn relative_margin_dominates_for_high_required_return() {
        let cfg = ValuationConfig::default();
        // 15% of 0.20 is 0.03 > 0.02.
        let m = justified_multiples(0.40, &regime(0.20, 1.0), &cfg).unwrap();
        assert!((m.growth - 0.17).abs() < 1e-12);
    }

    #[test]
    fn non_positive_roe_is_not_applicable() {
        let cfg = ValuationConfig::default();
        let r = regime(0.115, 0.35);
        assert_eq!(margin_of_safety(Some(8.0), Some(0.5), Some(0.0), &r, &cfg), Valuation::NotApplicable);
        assert_eq!(margin_of_safety(Some(8.0), Some(0.5), Some(-0.05), &r, &cfg), Valuation::NotApplicable);
        assert_eq!(margin_of_safety(Some(8.0), Some(0.5), None, &r, &cfg), Valuation::NotApplicable);
    }

    #[test]
    fn out_of_bound_ratios_are_ignored() {
        let cfg = ValuationConfig::default();
        let r = regime(0.115, 0.35);
        let m = justified(margin_of_safety(Some(-4.0), Some(20.0), Some(0.15), &r, &cfg));
        assert_eq!(m.mos_pb, None);
        assert_eq!(m.mos_pe, None);
        assert_eq!(m.points, 0.0);
    }

    #[test]
    fn margin_is_capped() {
        let cfg = ValuationConfig::default();
        let m = justified(margin_of_safety(None, Some(0.2), Some(0.15), &regime(0.115, 0.35), &cfg));
        assert_eq!(m.fraction, 1.0);
        assert_eq!(m.points, 30.0);
    }

    #[test]
    fn alternative_path_is_half_weight() {
        let cfg = ValuationConfig::default();
        assert_eq!(alternative_points(100.0, &cfg), 15.0);
        assert_eq!(alternative_points(0.0, &cfg), 0.0);
        assert_eq!(alternative_points(140.0, &cfg), 15.0);
    }
}
