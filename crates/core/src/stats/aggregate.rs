//! Batch aggregation of metric samples into per-sector and global
//! distributions.

use crate::domain::distribution::{DistributionScope, SectorDistribution};
use crate::domain::sample::{Metric, MetricSample};
use crate::domain::sector::SectorKey;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedStatistics {
    pub sectors: BTreeMap<(SectorKey, Metric), SectorDistribution>,
    pub global: BTreeMap<Metric, SectorDistribution>,
}

impl AggregatedStatistics {
    /// Sector distributions large enough to persist, and the ones dropped.
    pub fn split_retained(
        &self,
        min_samples: usize,
    ) -> (Vec<&SectorDistribution>, Vec<&SectorDistribution>) {
        self.sectors
            .values()
            .partition(|d| d.sample_size >= min_samples)
    }

    pub fn get(&self, scope: DistributionScope, metric: Metric) -> Option<&SectorDistribution> {
        match scope {
            DistributionScope::Sector(sector) => self.sectors.get(&(sector, metric)),
            DistributionScope::Global => self.global.get(&metric),
        }
    }
}

/// One sample per symbol, the most recently fetched one winning. Keeps
/// aggregation independent of input order and duplicates.
pub fn dedupe_latest(samples: &[MetricSample]) -> Vec<&MetricSample> {
    let mut by_symbol: BTreeMap<&str, &MetricSample> = BTreeMap::new();
    for s in samples {
        let key = s.symbol.as_str();
        match by_symbol.get(key) {
            Some(prev) if prev.fetched_at >= s.fetched_at => {}
            _ => {
                by_symbol.insert(key, s);
            }
        }
    }
    by_symbol.into_values().collect()
}

/// Groups by sector and summarises every metric. Sectors of any size are
/// returned; retention is the caller's decision.
pub fn aggregate(samples: &[MetricSample], computed_at: DateTime<Utc>) -> AggregatedStatistics {
    let unique = dedupe_latest(samples);

    let mut by_sector: BTreeMap<SectorKey, Vec<&MetricSample>> = BTreeMap::new();
    for s in &unique {
        by_sector.entry(s.sector).or_default().push(s);
    }

    let mut out = AggregatedStatistics::default();
    for metric in Metric::ALL {
        for (sector, group) in &by_sector {
            let values: Vec<f64> = group.iter().filter_map(|s| s.metric(metric)).collect();
            if let Some(dist) = SectorDistribution::from_values(
                DistributionScope::Sector(*sector),
                metric,
                &values,
                computed_at,
            ) {
                out.sectors.insert((*sector, metric), dist);
            }
        }

        let values: Vec<f64> = unique.iter().filter_map(|s| s.metric(metric)).collect();
        if let Some(dist) =
            SectorDistribution::from_values(DistributionScope::Global, metric, &values, computed_at)
        {
            out.global.insert(metric, dist);
        }
    }
    out
}

/// Summarises one scope from a sample pool.
pub fn aggregate_scope(
    samples: &[MetricSample],
    scope: DistributionScope,
    metric: Metric,
    computed_at: DateTime<Utc>,
) -> Option<SectorDistribution> {
    let values: Vec<f64> = dedupe_latest(samples)
        .into_iter()
        .filter(|s| match scope {
            DistributionScope::Sector(sector) => s.sector == sector,
            DistributionScope::Global => true,
        })
        .filter_map(|s| s.metric(metric))
        .collect();
    SectorDistribution::from_values(scope, metric, &values, computed_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::fixtures::sample;
    use chrono::{Duration, TimeZone};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn pool() -> Vec<MetricSample> {
        let mut out = Vec::new();
        for i in 0..12 {
            let mut s = sample(&format!("B{i:02}"), SectorKey::Banks);
            s.per = Some(4.0 + i as f64 * 0.5);
            s.pbr = Some(0.3 + i as f64 * 0.02);
            out.push(s);
        }
        for (i, per) in [8.0, 9.0, 10.0, 11.0, 12.0].into_iter().enumerate() {
            let mut s = sample(&format!("R{i:02}"), SectorKey::Retail);
            s.per = Some(per);
            out.push(s);
        }
        out
    }

    #[test]
    fn groups_by_sector_and_builds_global() {
        let stats = aggregate(&pool(), at());
        let banks = &stats.sectors[&(SectorKey::Banks, Metric::Per)];
        assert_eq!(banks.sample_size, 12);
        assert!(banks.p10.is_some());

        let retail = &stats.sectors[&(SectorKey::Retail, Metric::Per)];
        assert_eq!(retail.sample_size, 5);
        assert_eq!(retail.p50, 10.0);

        assert_eq!(stats.global[&Metric::Per].sample_size, 17);
        assert!(stats.sectors.values().all(|d| d.is_well_formed()));
    }

    #[test]
    fn retention_split_drops_small_sectors() {
        let stats = aggregate(&pool(), at());
        let (kept, dropped) = stats.split_retained(10);
        assert!(kept.iter().all(|d| d.scope == DistributionScope::Sector(SectorKey::Banks)));
        assert!(dropped
            .iter()
            .all(|d| d.scope == DistributionScope::Sector(SectorKey::Retail)));
        assert!(!dropped.is_empty());
    }

    #[test]
    fn duplicates_keep_latest_fetch_and_order_does_not_matter() {
        let mut samples = pool();
        let mut stale = samples[0].clone();
        stale.per = Some(140.0);
        stale.fetched_at = samples[0].fetched_at - Duration::hours(1);
        samples.push(stale);

        let a = aggregate(&samples, at());
        samples.reverse();
        let b = aggregate(&samples, at());
        assert_eq!(a, b);
        assert_eq!(a.sectors[&(SectorKey::Banks, Metric::Per)].sample_size, 12);
        assert!(a.sectors[&(SectorKey::Banks, Metric::Per)].max < 140.0);
    }

    #[test]
    fn single_scope_matches_batch() {
        let samples = pool();
        let batch = aggregate(&samples, at());
        let one = aggregate_scope(
            &samples,
            DistributionScope::Sector(SectorKey::Banks),
            Metric::Pbr,
            at(),
        )
        .unwrap();
        assert_eq!(&one, &batch.sectors[&(SectorKey::Banks, Metric::Pbr)]);
    }
}
