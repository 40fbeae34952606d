//! Value → percentile mapping over breakpoint summaries, with sample-size
//! blending between a sector and the global distribution.

use crate::config::override_from_env;
use crate::domain::distribution::{GlobalDistribution, SectorDistribution};
use std::fmt;

const NEUTRAL: f64 = 50.0;
const IQR_TO_SIGMA: f64 = 1.349;
const Z_NARROW: f64 = 1.96;
const Z_WIDE: f64 = 1.28;
const Z_CENTERLESS: f64 = 1.645;

#[derive(Debug, Clone)]
pub struct BlendConfig {
    /// Below this sector sample size only the global distribution is used.
    pub global_only_below: usize,
    /// From this size on only the sector distribution is used.
    pub sector_only_from: usize,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            global_only_below: 10,
            sector_only_from: 30,
        }
    }
}

impl BlendConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        override_from_env(&mut out.global_only_below, "BLEND_GLOBAL_ONLY_BELOW");
        override_from_env(&mut out.sector_only_from, "BLEND_SECTOR_ONLY_FROM");
        if out.sector_only_from <= out.global_only_below {
            tracing::warn!(
                global_only_below = out.global_only_below,
                sector_only_from = out.sector_only_from,
                "invalid blend thresholds; using defaults"
            );
            return Self::default();
        }
        out
    }

    /// Weight of the sector percentile for a sector of `n` samples.
    pub fn sector_weight(&self, n: usize) -> f64 {
        if n < self.global_only_below {
            0.0
        } else if n >= self.sector_only_from {
            1.0
        } else {
            (n - self.global_only_below) as f64
                / (self.sector_only_from - self.global_only_below) as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentileError {
    /// Zero-width interquartile range.
    Degenerate,
    NoDistribution,
    NonFinite,
}

impl fmt::Display for PercentileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PercentileError::Degenerate => f.write_str("distribution has zero interquartile range"),
            PercentileError::NoDistribution => f.write_str("no distribution available"),
            PercentileError::NonFinite => f.write_str("value is not finite"),
        }
    }
}

impl std::error::Error for PercentileError {}

fn is_degenerate(dist: &SectorDistribution) -> bool {
    let scale = dist.p50.abs().max(1.0);
    !(dist.iqr() > 1e-9 * scale)
}

/// Fills in p10/p90 when the summary omitted them, using a normal
/// approximation around the median. Narrow distributions (small IQR relative
/// to the median) get the wider multiplier.
pub fn tail_breakpoints(dist: &SectorDistribution) -> (f64, f64) {
    let iqr = dist.iqr().max(0.0);
    let sigma = iqr / IQR_TO_SIGMA;
    let z = if dist.p50.abs() < 1e-12 {
        Z_CENTERLESS
    } else {
        let spread = (iqr / dist.p50.abs()).clamp(0.0, 1.0);
        Z_NARROW - (Z_NARROW - Z_WIDE) * spread
    };

    let p10 = dist
        .p10
        .unwrap_or_else(|| dist.p25.min(dist.p50 - z * sigma));
    let p90 = dist
        .p90
        .unwrap_or_else(|| dist.p75.max(dist.p50 + z * sigma));
    (p10, p90)
}

/// Share of the distribution at or below `value`, in `[0, 100]`. Values
/// below p10 score 0 and values above p90 score 100.
pub fn percentile(value: f64, dist: &SectorDistribution) -> Result<f64, PercentileError> {
    if !value.is_finite() {
        return Err(PercentileError::NonFinite);
    }
    if is_degenerate(dist) {
        return Err(PercentileError::Degenerate);
    }

    let (p10, p90) = tail_breakpoints(dist);
    let points = [
        (p10, 10.0),
        (dist.p25, 25.0),
        (dist.p50, 50.0),
        (dist.p75, 75.0),
        (p90, 90.0),
    ];

    if value < p10 {
        return Ok(0.0);
    }
    if value > p90 {
        return Ok(100.0);
    }

    for pair in points.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if value <= x1 {
            if x1 <= x0 {
                return Ok(y0);
            }
            return Ok(y0 + (value - x0) / (x1 - x0) * (y1 - y0));
        }
    }
    Ok(90.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PercentileSource {
    Sector,
    Global,
    Blended { sector_weight: f64 },
    /// Nothing usable; neutral 50.
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendedPercentile {
    pub value: f64,
    pub source: PercentileSource,
}

impl BlendedPercentile {
    fn neutral() -> Self {
        Self {
            value: NEUTRAL,
            source: PercentileSource::Neutral,
        }
    }

    fn global(value: f64) -> Self {
        Self {
            value,
            source: PercentileSource::Global,
        }
    }

    fn sector(value: f64) -> Self {
        Self {
            value,
            source: PercentileSource::Sector,
        }
    }
}

/// Sector percentile blended toward the global one by sector sample size.
/// Degenerate or missing inputs fall back rather than erroring.
pub fn blended_percentile(
    value: f64,
    sector: Option<&SectorDistribution>,
    global: Option<&GlobalDistribution>,
    config: &BlendConfig,
) -> BlendedPercentile {
    let global_pct = global
        .ok_or(PercentileError::NoDistribution)
        .and_then(|g| percentile(value, g));
    let global_or_neutral = || match global_pct {
        Ok(p) => BlendedPercentile::global(p),
        Err(_) => BlendedPercentile::neutral(),
    };

    let Some(sector) = sector.filter(|s| s.sample_size > 0) else {
        return global_or_neutral();
    };
    let w = config.sector_weight(sector.sample_size);
    if w <= 0.0 {
        return global_or_neutral();
    }

    let sector_pct = percentile(value, sector);
    if w >= 1.0 {
        return match sector_pct {
            Ok(p) => BlendedPercentile::sector(p),
            Err(_) => global_or_neutral(),
        };
    }

    match (sector_pct, global_pct) {
        (Ok(s), Ok(g)) => BlendedPercentile {
            value: w * s + (1.0 - w) * g,
            source: PercentileSource::Blended { sector_weight: w },
        },
        (Err(_), Ok(g)) => BlendedPercentile::global(g),
        (Ok(s), Err(_)) => BlendedPercentile::sector(s),
        (Err(_), Err(_)) => BlendedPercentile::neutral(),
    }
}
