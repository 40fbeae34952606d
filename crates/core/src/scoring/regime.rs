//! Required return and retention rate per sector, cached per calendar month.

use crate::config::override_from_env;
use crate::domain::sample::MetricSample;
use crate::domain::sector::SectorKey;
use crate::time::kr_market::month_key;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RegimeConfig {
    pub risk_free_rate: f64,
    pub required_return_min: f64,
    pub required_return_max: f64,
    /// Used for sectors missing from the premium table.
    pub default_premium: f64,
    pub default_retention: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            // KTB 3Y, roughly.
            risk_free_rate: 0.035,
            required_return_min: 0.05,
            required_return_max: 0.20,
            default_premium: 0.08,
            default_retention: 0.35,
        }
    }
}

impl RegimeConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        override_from_env(&mut out.risk_free_rate, "RISK_FREE_RATE");
        override_from_env(&mut out.required_return_min, "REQUIRED_RETURN_MIN");
        override_from_env(&mut out.required_return_max, "REQUIRED_RETURN_MAX");
        if !(out.required_return_min > 0.0 && out.required_return_min < out.required_return_max) {
            tracing::warn!(
                min = out.required_return_min,
                max = out.required_return_max,
                "invalid required return band; using defaults"
            );
            let d = Self::default();
            out.required_return_min = d.required_return_min;
            out.required_return_max = d.required_return_max;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegimeSource {
    SectorTable,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeParameters {
    pub required_return: f64,
    pub retention_rate: f64,
    pub source: RegimeSource,
}

/// `(sector, equity risk premium, typical retention)`.
const SECTOR_TABLE: &[(SectorKey, f64, f64)] = &[
    (SectorKey::Semiconductors, 0.090, 0.70),
    (SectorKey::Electronics, 0.085, 0.65),
    (SectorKey::Software, 0.095, 0.75),
    (SectorKey::Telecom, 0.060, 0.30),
    (SectorKey::Media, 0.090, 0.55),
    (SectorKey::Banks, 0.070, 0.70),
    (SectorKey::Insurance, 0.070, 0.65),
    (SectorKey::Securities, 0.085, 0.60),
    (SectorKey::Chemicals, 0.085, 0.60),
    (SectorKey::Materials, 0.085, 0.55),
    (SectorKey::Construction, 0.095, 0.60),
    (SectorKey::Machinery, 0.085, 0.60),
    (SectorKey::Automobiles, 0.080, 0.65),
    (SectorKey::Retail, 0.075, 0.55),
    (SectorKey::FoodBeverage, 0.065, 0.50),
    (SectorKey::Textiles, 0.085, 0.55),
    (SectorKey::Pharma, 0.100, 0.80),
    (SectorKey::Utilities, 0.055, 0.40),
    (SectorKey::Transportation, 0.085, 0.55),
    (SectorKey::Services, 0.085, 0.60),
];

#[derive(Debug)]
pub struct RegimeCache {
    config: RegimeConfig,
    by_month: Mutex<HashMap<(SectorKey, (i32, u32)), RegimeParameters>>,
}

impl RegimeCache {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            by_month: Mutex::new(HashMap::new()),
        }
    }

    /// Sector parameters for the month containing `as_of_date`.
    pub fn for_sector(&self, sector: SectorKey, as_of_date: NaiveDate) -> RegimeParameters {
        let key = (sector, month_key(as_of_date));
        let mut cache = self.by_month.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(found) = cache.get(&key) {
            return *found;
        }
        let computed = self.compute(sector);
        cache.insert(key, computed);
        computed
    }

    /// Sector parameters with the retention rate taken from the company's own
    /// payout ratio when it has one.
    pub fn for_sample(&self, sample: &MetricSample) -> RegimeParameters {
        let mut params = self.for_sector(sample.sector, sample.as_of_date);
        if let Some(payout) = sample.payout_ratio.filter(|p| p.is_finite() && *p >= 0.0) {
            params.retention_rate = (1.0 - payout / 100.0).clamp(0.0, 1.0);
        }
        params
    }

    fn compute(&self, sector: SectorKey) -> RegimeParameters {
        let c = &self.config;
        let (premium, retention, source) = match SECTOR_TABLE.iter().find(|(s, _, _)| *s == sector) {
            Some((_, premium, retention)) => (*premium, *retention, RegimeSource::SectorTable),
            None => {
                tracing::warn!(
                    %sector,
                    premium = c.default_premium,
                    retention = c.default_retention,
                    "no regime parameters for sector; using defaults"
                );
                (c.default_premium, c.default_retention, RegimeSource::Default)
            }
        };
        RegimeParameters {
            required_return: (c.risk_free_rate + premium)
                .clamp(c.required_return_min, c.required_return_max),
            retention_rate: retention.clamp(0.0, 1.0),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::fixtures::sample;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn unknown_sector_uses_defaults() {
        let cache = RegimeCache::new(RegimeConfig::default());
        let p = cache.for_sector(SectorKey::Other, d(2026, 3, 2));
        assert_eq!(p.source, RegimeSource::Default);
        assert!((p.required_return - 0.115).abs() < 1e-12);
        assert!((p.retention_rate - 0.35).abs() < 1e-12);
    }

    #[test]
    fn required_return_is_clamped() {
        let cache = RegimeCache::new(RegimeConfig {
            risk_free_rate: 0.25,
            ..RegimeConfig::default()
        });
        assert_eq!(cache.for_sector(SectorKey::Banks, d(2026, 3, 2)).required_return, 0.20);

        let cache = RegimeCache::new(RegimeConfig {
            risk_free_rate: -0.10,
            ..RegimeConfig::default()
        });
        assert_eq!(cache.for_sector(SectorKey::Utilities, d(2026, 3, 2)).required_return, 0.05);
    }

    #[test]
    fn payout_ratio_overrides_retention() {
        let cache = RegimeCache::new(RegimeConfig::default());
        let mut s = sample("000001", SectorKey::Banks);
        s.payout_ratio = Some(25.0);
        assert!((cache.for_sample(&s).retention_rate - 0.75).abs() < 1e-12);

        s.payout_ratio = Some(140.0);
        assert_eq!(cache.for_sample(&s).retention_rate, 0.0);
    }

    #[test]
    fn cached_per_month() {
        let cache = RegimeCache::new(RegimeConfig::default());
        cache.for_sector(SectorKey::Pharma, d(2026, 3, 2));
        cache.for_sector(SectorKey::Pharma, d(2026, 3, 31));
        cache.for_sector(SectorKey::Pharma, d(2026, 4, 1));
        assert_eq!(cache.by_month.lock().unwrap().len(), 2);
    }
}
