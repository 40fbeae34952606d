//! Hard-reject thresholds, graduated quality points and the sector bonus.

use crate::domain::sample::MetricSample;
use crate::domain::sector::SectorKey;
use serde::Serialize;

pub const ROE_POINTS: f64 = 15.0;
pub const LEVERAGE_POINTS: f64 = 12.0;
pub const LIQUIDITY_POINTS: f64 = 8.0;
pub const SCALE_POINTS: f64 = 8.0;
pub const QUALITY_MAX: f64 = ROE_POINTS + LEVERAGE_POINTS + LIQUIDITY_POINTS + SCALE_POINTS;
pub const SECTOR_BONUS_MAX: f64 = 10.0;

/// Share of a curve's points earned at the "good" threshold.
const GOOD_SHARE: f64 = 0.6;

/// Three-segment piecewise-linear scoring curve: 0 points at `hard`,
/// `GOOD_SHARE * max` at `good`, `max` at `excellent`. Works in either
/// direction (`excellent < hard` means lower is better).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Curve {
    pub hard: f64,
    pub good: f64,
    pub excellent: f64,
    pub max_points: f64,
}

impl Curve {
    pub const fn new(hard: f64, good: f64, excellent: f64, max_points: f64) -> Self {
        Self {
            hard,
            good,
            excellent,
            max_points,
        }
    }

    pub fn points(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        // Flip lower-is-better curves so the thresholds ascend.
        let (v, hard, good, excellent) = if self.excellent < self.hard {
            (-value, -self.hard, -self.good, -self.excellent)
        } else {
            (value, self.hard, self.good, self.excellent)
        };

        let good_points = GOOD_SHARE * self.max_points;
        if v <= hard {
            0.0
        } else if v >= excellent {
            self.max_points
        } else if v <= good {
            good_points * (v - hard) / (good - hard)
        } else {
            good_points + (self.max_points - good_points) * (v - good) / (excellent - good)
        }
    }
}

/// Per-sector thresholds. Financial companies carry customer deposits as
/// liabilities, so their debt and current ratios are not meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorCriteria {
    pub sector: SectorKey,
    /// ROE (percent) below this rejects.
    pub roe_floor: f64,
    /// Debt ratio (percent) above this rejects; `None` skips the check.
    pub debt_ceiling: Option<f64>,
    /// Current ratio (percent) below this rejects; `None` skips the check.
    pub current_floor: Option<f64>,
    pub roe_curve: Curve,
    pub debt_curve: Option<Curve>,
    pub current_curve: Option<Curve>,
    pub scale_curve: Curve,
    pub per_target: f64,
    pub pbr_target: f64,
    pub roe_target: f64,
}

const ROE_CURVE: Curve = Curve::new(0.0, 8.0, 15.0, ROE_POINTS);
const DEBT_CURVE: Curve = Curve::new(200.0, 100.0, 50.0, LEVERAGE_POINTS);
const CURRENT_CURVE: Curve = Curve::new(100.0, 150.0, 200.0, LIQUIDITY_POINTS);
const SCALE_CURVE: Curve = Curve::new(1.0e10, 1.0e11, 1.0e12, SCALE_POINTS);

/// `(sector, per target, pbr target, roe target)` for the bonus.
const BONUS_TARGETS: &[(SectorKey, f64, f64, f64)] = &[
    (SectorKey::Semiconductors, 15.0, 1.8, 12.0),
    (SectorKey::Electronics, 13.0, 1.3, 10.0),
    (SectorKey::Software, 20.0, 2.5, 12.0),
    (SectorKey::Telecom, 10.0, 0.8, 8.0),
    (SectorKey::Media, 15.0, 1.5, 10.0),
    (SectorKey::Banks, 6.0, 0.5, 9.0),
    (SectorKey::Insurance, 7.0, 0.6, 9.0),
    (SectorKey::Securities, 8.0, 0.6, 9.0),
    (SectorKey::Chemicals, 11.0, 0.9, 8.0),
    (SectorKey::Materials, 9.0, 0.7, 7.0),
    (SectorKey::Construction, 7.0, 0.6, 8.0),
    (SectorKey::Machinery, 12.0, 1.1, 9.0),
    (SectorKey::Automobiles, 7.0, 0.7, 10.0),
    (SectorKey::Retail, 10.0, 0.8, 8.0),
    (SectorKey::FoodBeverage, 12.0, 1.2, 9.0),
    (SectorKey::Textiles, 9.0, 0.8, 8.0),
    (SectorKey::Pharma, 25.0, 2.5, 10.0),
    (SectorKey::Utilities, 10.0, 0.5, 6.0),
    (SectorKey::Transportation, 9.0, 0.9, 8.0),
    (SectorKey::Services, 12.0, 1.2, 10.0),
];

const DEFAULT_TARGETS: (f64, f64, f64) = (12.0, 1.2, 10.0);

pub fn criteria_for(sector: SectorKey) -> SectorCriteria {
    let (per_target, pbr_target, roe_target) = BONUS_TARGETS
        .iter()
        .find(|(s, ..)| *s == sector)
        .map(|(_, per, pbr, roe)| (*per, *pbr, *roe))
        .unwrap_or(DEFAULT_TARGETS);

    let mut c = SectorCriteria {
        sector,
        roe_floor: -10.0,
        debt_ceiling: Some(400.0),
        current_floor: Some(50.0),
        roe_curve: ROE_CURVE,
        debt_curve: Some(DEBT_CURVE),
        current_curve: Some(CURRENT_CURVE),
        scale_curve: SCALE_CURVE,
        per_target,
        pbr_target,
        roe_target,
    };

    if sector.is_financial() {
        c.debt_ceiling = None;
        c.current_floor = None;
        c.debt_curve = None;
        c.current_curve = None;
        c.roe_curve = Curve::new(0.0, 7.0, 12.0, ROE_POINTS);
    } else if sector == SectorKey::Utilities {
        c.debt_ceiling = Some(600.0);
        c.debt_curve = Some(Curve::new(300.0, 200.0, 100.0, LEVERAGE_POINTS));
        c.current_curve = Some(Curve::new(60.0, 100.0, 150.0, LIQUIDITY_POINTS));
    } else if matches!(sector, SectorKey::Construction | SectorKey::Transportation) {
        c.debt_ceiling = Some(500.0);
        c.debt_curve = Some(Curve::new(250.0, 150.0, 80.0, LEVERAGE_POINTS));
    }
    c
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QualityScore {
    pub roe: f64,
    pub leverage: f64,
    pub liquidity: f64,
    pub scale: f64,
}

impl QualityScore {
    pub fn total(&self) -> f64 {
        self.roe + self.leverage + self.liquidity + self.scale
    }
}

/// Reason a symbol failed a hard threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection(pub String);

/// Hard thresholds first, then graduated points. Checks whose input is
/// missing are skipped and earn nothing. Skipped-by-sector checks earn the
/// "good" share so financials are not penalised for ratios they don't report
/// meaningfully.
pub fn assess_quality(
    sample: &MetricSample,
    criteria: &SectorCriteria,
) -> Result<QualityScore, Rejection> {
    if let Some(roe) = sample.roe {
        if roe < criteria.roe_floor {
            return Err(Rejection(format!(
                "roe {roe:.1}% below floor {:.1}%",
                criteria.roe_floor
            )));
        }
    }
    if let (Some(debt), Some(ceiling)) = (sample.debt_ratio, criteria.debt_ceiling) {
        if debt > ceiling {
            return Err(Rejection(format!(
                "debt ratio {debt:.0}% above ceiling {ceiling:.0}%"
            )));
        }
    }
    if let (Some(current), Some(floor)) = (sample.current_ratio, criteria.current_floor) {
        if current < floor {
            return Err(Rejection(format!(
                "current ratio {current:.0}% below floor {floor:.0}%"
            )));
        }
    }

    let curve_or_good = |curve: Option<Curve>, value: Option<f64>, max: f64| match curve {
        Some(curve) => value.map(|v| curve.points(v)).unwrap_or(0.0),
        None => GOOD_SHARE * max,
    };

    Ok(QualityScore {
        roe: sample
            .roe
            .map(|v| criteria.roe_curve.points(v))
            .unwrap_or(0.0),
        leverage: curve_or_good(criteria.debt_curve, sample.debt_ratio, LEVERAGE_POINTS),
        liquidity: curve_or_good(criteria.current_curve, sample.current_ratio, LIQUIDITY_POINTS),
        scale: sample
            .market_cap
            .map(|v| criteria.scale_curve.points(v))
            .unwrap_or(0.0),
    })
}

/// Up to 10 points for beating the sector's own targets: 4 for PER, 3 for
/// PBR, 3 for ROE.
pub fn sector_bonus(sample: &MetricSample, criteria: &SectorCriteria) -> f64 {
    let mut bonus: f64 = 0.0;
    if sample.per.is_some_and(|v| v > 0.0 && v <= criteria.per_target) {
        bonus += 4.0;
    }
    if sample.pbr.is_some_and(|v| v > 0.0 && v <= criteria.pbr_target) {
        bonus += 3.0;
    }
    if sample.roe.is_some_and(|v| v >= criteria.roe_target) {
        bonus += 3.0;
    }
    bonus.min(SECTOR_BONUS_MAX)
}
