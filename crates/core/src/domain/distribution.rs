use crate::domain::sample::Metric;
use crate::domain::sector::SectorKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tail breakpoints (p10/p90) are only computed from samples at least this
/// large; smaller sets leave them to the scorer's tail estimate.
pub const TAIL_MIN_SAMPLES: usize = 10;

const GLOBAL_SCOPE_KEY: &str = "__global__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionScope {
    Sector(SectorKey),
    Global,
}

impl DistributionScope {
    pub fn as_db_key(&self) -> &'static str {
        match self {
            DistributionScope::Sector(key) => key.as_str(),
            DistributionScope::Global => GLOBAL_SCOPE_KEY,
        }
    }
}

impl fmt::Display for DistributionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_key())
    }
}

impl FromStr for DistributionScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == GLOBAL_SCOPE_KEY {
            return Ok(DistributionScope::Global);
        }
        Ok(DistributionScope::Sector(s.parse()?))
    }
}

/// Percentile summary of one metric over one scope. Published instances are
/// never mutated; a recomputation produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorDistribution {
    pub scope: DistributionScope,
    pub metric: Metric,
    pub sample_size: usize,
    pub p10: Option<f64>,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: Option<f64>,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub computed_at: DateTime<Utc>,
}

/// Same shape, aggregated across every sector.
pub type GlobalDistribution = SectorDistribution;

impl SectorDistribution {
    /// Summarises `values` after dropping entries outside the metric's bounds.
    /// Returns `None` when nothing survives the filter.
    pub fn from_values(
        scope: DistributionScope,
        metric: Metric,
        values: &[f64],
        computed_at: DateTime<Utc>,
    ) -> Option<Self> {
        let mut kept: Vec<f64> = values
            .iter()
            .copied()
            .filter(|v| metric.in_bounds(*v))
            .collect();
        if kept.is_empty() {
            return None;
        }
        kept.sort_by(|a, b| a.total_cmp(b));

        let n = kept.len();
        let mean = kept.iter().sum::<f64>() / n as f64;
        let std = if n > 1 {
            let var = kept.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        let with_tails = n >= TAIL_MIN_SAMPLES;
        Some(Self {
            scope,
            metric,
            sample_size: n,
            p10: with_tails.then(|| quantile_sorted(&kept, 0.10)),
            p25: quantile_sorted(&kept, 0.25),
            p50: quantile_sorted(&kept, 0.50),
            p75: quantile_sorted(&kept, 0.75),
            p90: with_tails.then(|| quantile_sorted(&kept, 0.90)),
            mean,
            std,
            min: kept[0],
            max: kept[n - 1],
            computed_at,
        })
    }

    pub fn iqr(&self) -> f64 {
        self.p75 - self.p25
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.computed_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) > ttl
    }

    /// Present breakpoints are non-decreasing and every number is finite.
    pub fn is_well_formed(&self) -> bool {
        let mut points = Vec::with_capacity(5);
        points.extend(self.p10);
        points.extend([self.p25, self.p50, self.p75]);
        points.extend(self.p90);
        let ordered = points.windows(2).all(|w| w[0] <= w[1]);
        let finite = points
            .iter()
            .chain([self.mean, self.std, self.min, self.max].iter())
            .all(|v| v.is_finite());
        self.sample_size > 0 && ordered && finite && self.min <= self.max
    }
}

/// Linear-interpolated quantile over an ascending slice (the `(n - 1) * q`
/// convention).
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
