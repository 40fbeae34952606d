//! Tiered lookup of sector distributions: durable repository, then the
//! snapshot cache from the last refresh, then live aggregation over the
//! samples this process has seen.

use crate::config::override_from_env;
use crate::domain::distribution::{DistributionScope, SectorDistribution};
use crate::domain::sample::{Metric, MetricSample};
use crate::domain::sector::SectorKey;
use crate::stats::aggregate::{aggregate, aggregate_scope};
use crate::stats::repository::DistributionRepository;
use crate::time::SharedClock;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Age after which a distribution counts as stale.
    pub ttl: Duration,
    pub snapshot_ttl: Duration,
    /// Sectors with fewer samples are not persisted.
    pub min_retained_samples: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            snapshot_ttl: Duration::hours(6),
            min_retained_samples: 10,
        }
    }
}

impl StatsConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        let mut ttl_hours = out.ttl.num_hours();
        override_from_env(&mut ttl_hours, "STATS_TTL_HOURS");
        out.ttl = Duration::hours(ttl_hours.max(1));

        let mut snapshot_minutes = out.snapshot_ttl.num_minutes();
        override_from_env(&mut snapshot_minutes, "STATS_SNAPSHOT_TTL_MINUTES");
        out.snapshot_ttl = Duration::minutes(snapshot_minutes.max(1));

        override_from_env(&mut out.min_retained_samples, "STATS_MIN_RETAINED_SAMPLES");
        out.min_retained_samples = out.min_retained_samples.max(1);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionSource {
    Durable,
    Snapshot,
    Live,
}

#[derive(Debug, Clone)]
pub struct DistributionLookup {
    pub distribution: Arc<SectorDistribution>,
    pub source: DistributionSource,
    /// Date the record is versioned under (durable/snapshot) or the requested
    /// date (live).
    pub as_of_date: NaiveDate,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DroppedSector {
    pub sector: SectorKey,
    pub metric: Metric,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub as_of_date: NaiveDate,
    pub samples: usize,
    pub persisted: u64,
    pub dropped: Vec<DroppedSector>,
    pub computed_at: DateTime<Utc>,
}

type ScopeKey = (DistributionScope, Metric);

#[derive(Debug)]
struct Snapshot {
    as_of_date: NaiveDate,
    built_at: DateTime<Utc>,
    entries: HashMap<ScopeKey, Arc<SectorDistribution>>,
}

#[derive(Debug, Default)]
struct LivePool {
    samples: Arc<Vec<MetricSample>>,
    /// Memoized aggregates over `samples`; cleared whenever the pool changes.
    aggregates: HashMap<ScopeKey, Option<Arc<SectorDistribution>>>,
}

pub struct SectorStatisticsStore {
    repo: Arc<dyn DistributionRepository>,
    clock: SharedClock,
    config: StatsConfig,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    live: Mutex<LivePool>,
    global: RwLock<HashMap<(Metric, NaiveDate), DistributionLookup>>,
}

impl SectorStatisticsStore {
    pub fn new(repo: Arc<dyn DistributionRepository>, clock: SharedClock, config: StatsConfig) -> Self {
        Self {
            repo,
            clock,
            config,
            snapshot: RwLock::new(None),
            live: Mutex::new(LivePool::default()),
            global: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Freshest available distribution, or `None` when no tier has data.
    /// Only repository failures are errors.
    pub async fn get(
        &self,
        scope: DistributionScope,
        metric: Metric,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<DistributionLookup>> {
        let now = self.clock.now();

        if let Some((date, dist)) = self.repo.load_latest(scope, metric, as_of_date).await? {
            if dist.sample_size > 0 {
                let stale = dist.is_stale(now, self.config.ttl);
                if stale {
                    tracing::warn!(
                        %scope,
                        %metric,
                        %date,
                        age_hours = dist.age(now).num_hours(),
                        "serving stale sector distribution"
                    );
                } else {
                    tracing::debug!(%scope, %metric, %date, "distribution from durable store");
                }
                return Ok(Some(DistributionLookup {
                    distribution: Arc::new(dist),
                    source: DistributionSource::Durable,
                    as_of_date: date,
                    stale,
                }));
            }
        }

        if let Some(found) = self.from_snapshot(scope, metric, as_of_date, now) {
            tracing::debug!(%scope, %metric, "distribution from snapshot cache");
            return Ok(Some(found));
        }

        let live = self.from_live(scope, metric, now);
        match &live {
            Some(_) => tracing::debug!(%scope, %metric, "distribution from live aggregation"),
            None => tracing::debug!(%scope, %metric, "no distribution in any tier"),
        }
        Ok(live.map(|distribution| DistributionLookup {
            distribution,
            source: DistributionSource::Live,
            as_of_date,
            stale: false,
        }))
    }

    pub async fn get_sector(
        &self,
        sector: SectorKey,
        metric: Metric,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<DistributionLookup>> {
        self.get(DistributionScope::Sector(sector), metric, as_of_date)
            .await
    }

    /// Global distribution; resolved once per `(metric, date)` and then held
    /// until the next refresh.
    pub async fn get_global(
        &self,
        metric: Metric,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<DistributionLookup>> {
        let pinned = self
            .global
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(metric, as_of_date))
            .cloned();
        if pinned.is_some() {
            return Ok(pinned);
        }

        let found = self.get(DistributionScope::Global, metric, as_of_date).await?;
        // Live aggregates move as samples arrive; only pin stable tiers.
        if let Some(f) = &found {
            if f.source != DistributionSource::Live {
                self.global
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert((metric, as_of_date), f.clone());
            }
        }
        Ok(found)
    }

    /// Adds samples to the live pool, replacing earlier samples of the same
    /// symbol.
    pub fn observe_samples(&self, samples: &[MetricSample]) {
        if samples.is_empty() {
            return;
        }
        let incoming: HashSet<&str> = samples.iter().map(|s| s.symbol.as_str()).collect();
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        let mut next: Vec<MetricSample> = live
            .samples
            .iter()
            .filter(|old| !incoming.contains(old.symbol.as_str()))
            .cloned()
            .collect();
        next.extend(samples.iter().cloned());
        live.samples = Arc::new(next);
        live.aggregates.clear();
    }

    pub fn live_sample_count(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .samples
            .len()
    }

    /// Recomputes every distribution from `samples`. Sectors below the
    /// retention threshold are skipped; the global distribution is always
    /// persisted. Caches are swapped, not mutated.
    pub async fn refresh(
        &self,
        samples: Vec<MetricSample>,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<RefreshReport> {
        let computed_at = self.clock.now();
        let stats = aggregate(&samples, computed_at);
        let (retained, dropped) = stats.split_retained(self.config.min_retained_samples);

        let mut to_save: Vec<SectorDistribution> = retained.iter().map(|d| (*d).clone()).collect();
        to_save.extend(stats.global.values().cloned());
        let persisted = self.repo.save_all(as_of_date, &to_save).await?;

        let dropped: Vec<DroppedSector> = dropped
            .iter()
            .filter_map(|d| match d.scope {
                DistributionScope::Sector(sector) => Some(DroppedSector {
                    sector,
                    metric: d.metric,
                    sample_size: d.sample_size,
                }),
                DistributionScope::Global => None,
            })
            .collect();
        for d in &dropped {
            tracing::debug!(
                sector = %d.sector,
                metric = %d.metric,
                sample_size = d.sample_size,
                "sector below retention threshold; not persisted"
            );
        }

        let entries: HashMap<ScopeKey, Arc<SectorDistribution>> = to_save
            .into_iter()
            .map(|d| ((d.scope, d.metric), Arc::new(d)))
            .collect();
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(Snapshot {
            as_of_date,
            built_at: computed_at,
            entries,
        }));
        self.global
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            live.samples = Arc::new(samples);
            live.aggregates.clear();
        }

        let report = RefreshReport {
            as_of_date,
            samples: self.live_sample_count(),
            persisted,
            dropped,
            computed_at,
        };
        tracing::info!(
            %as_of_date,
            samples = report.samples,
            persisted = report.persisted,
            dropped = report.dropped.len(),
            "sector statistics refreshed"
        );
        Ok(report)
    }

    /// True when the durable global PER distribution for the date is missing
    /// or older than the TTL.
    pub async fn needs_refresh(&self, as_of_date: NaiveDate) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let latest = self
            .repo
            .load_latest(DistributionScope::Global, Metric::Per, as_of_date)
            .await?;
        Ok(match latest {
            Some((date, dist)) => date < as_of_date || dist.is_stale(now, self.config.ttl),
            None => true,
        })
    }

    fn from_snapshot(
        &self,
        scope: DistributionScope,
        metric: Metric,
        as_of_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Option<DistributionLookup> {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()?;
        if now - snapshot.built_at > self.config.snapshot_ttl || snapshot.as_of_date > as_of_date {
            return None;
        }
        let dist = snapshot.entries.get(&(scope, metric))?;
        Some(DistributionLookup {
            distribution: Arc::clone(dist),
            source: DistributionSource::Snapshot,
            as_of_date: snapshot.as_of_date,
            stale: dist.is_stale(now, self.config.ttl),
        })
    }

    fn from_live(
        &self,
        scope: DistributionScope,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Option<Arc<SectorDistribution>> {
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = live.aggregates.get(&(scope, metric)) {
            return cached.clone();
        }
        let computed = aggregate_scope(&live.samples, scope, metric, now).map(Arc::new);
        live.aggregates.insert((scope, metric), computed.clone());
        computed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::fixtures::sample;
    use crate::stats::repository::InMemoryDistributionRepository;
    use crate::time::ManualClock;
    use chrono::TimeZone;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryDistributionRepository>, SectorStatisticsStore) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let repo = Arc::new(InMemoryDistributionRepository::new());
        let store = SectorStatisticsStore::new(repo.clone(), clock.clone(), StatsConfig::default());
        (clock, repo, store)
    }

    /// 15 banks plus sector "A" (retail) with PER 8..12.
    fn universe() -> Vec<MetricSample> {
        let mut out = Vec::new();
        for i in 0..15 {
            let mut s = sample(&format!("B{i:02}"), SectorKey::Banks);
            s.per = Some(4.0 + i as f64 * 0.4);
            out.push(s);
        }
        for (i, per) in [8.0, 9.0, 10.0, 11.0, 12.0].into_iter().enumerate() {
            let mut s = sample(&format!("A{i:02}"), SectorKey::Retail);
            s.per = Some(per);
            out.push(s);
        }
        out
    }

    #[tokio::test]
    async fn refresh_persists_retained_sectors_and_global_only() {
        let (_, repo, store) = setup();
        let report = store.refresh(universe(), as_of()).await.unwrap();

        assert!(report
            .dropped
            .iter()
            .any(|d| d.sector == SectorKey::Retail && d.metric == Metric::Per && d.sample_size == 5));
        assert!(repo
            .load_latest(DistributionScope::Sector(SectorKey::Retail), Metric::Per, as_of())
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .load_latest(DistributionScope::Sector(SectorKey::Banks), Metric::Per, as_of())
            .await
            .unwrap()
            .is_some());
        let (_, global) = repo
            .load_latest(DistributionScope::Global, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(global.sample_size, 20);
    }

    #[tokio::test]
    async fn durable_tier_wins_and_staleness_is_reported_not_blocking() {
        let (clock, _, store) = setup();
        store.refresh(universe(), as_of()).await.unwrap();

        let found = store
            .get_sector(SectorKey::Banks, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.source, DistributionSource::Durable);
        assert!(!found.stale);

        clock.advance(Duration::hours(30));
        let found = store
            .get_sector(SectorKey::Banks, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.source, DistributionSource::Durable);
        assert!(found.stale);
        assert!(store.needs_refresh(as_of()).await.unwrap());
    }

    #[tokio::test]
    async fn small_sector_falls_through_to_live_aggregation() {
        let (_, _, store) = setup();
        store.refresh(universe(), as_of()).await.unwrap();

        let found = store
            .get_sector(SectorKey::Retail, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.source, DistributionSource::Live);
        assert_eq!(found.distribution.sample_size, 5);

        assert!(store
            .get_sector(SectorKey::Pharma, Metric::Per, as_of())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn snapshot_serves_when_durable_tier_has_nothing() {
        // A repository that never returns rows, so reads hit the snapshot.
        struct WriteOnly;
        #[async_trait::async_trait]
        impl DistributionRepository for WriteOnly {
            async fn load_latest(
                &self,
                _: DistributionScope,
                _: Metric,
                _: NaiveDate,
            ) -> anyhow::Result<Option<(NaiveDate, SectorDistribution)>> {
                Ok(None)
            }
            async fn save(&self, _: NaiveDate, _: &SectorDistribution) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let store = SectorStatisticsStore::new(Arc::new(WriteOnly), clock.clone(), StatsConfig::default());
        store.refresh(universe(), as_of()).await.unwrap();

        let found = store
            .get_sector(SectorKey::Banks, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.source, DistributionSource::Snapshot);

        clock.advance(Duration::hours(7));
        let found = store
            .get_sector(SectorKey::Banks, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.source, DistributionSource::Live);
    }

    #[tokio::test]
    async fn global_is_pinned_until_next_refresh() {
        let (_, _, store) = setup();
        store.refresh(universe(), as_of()).await.unwrap();
        let first = store.get_global(Metric::Per, as_of()).await.unwrap().unwrap();

        let mut more = universe();
        for i in 0..10 {
            let mut s = sample(&format!("P{i:02}"), SectorKey::Pharma);
            s.per = Some(40.0 + i as f64);
            more.push(s);
        }
        let pinned = store.get_global(Metric::Per, as_of()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first.distribution, &pinned.distribution));

        store.refresh(more, as_of()).await.unwrap();
        let second = store.get_global(Metric::Per, as_of()).await.unwrap().unwrap();
        assert_eq!(second.distribution.sample_size, 30);
        assert_eq!(first.distribution.sample_size, 20);
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let (_, repo, store) = setup();
        repo.set_offline(true);
        assert!(store.refresh(universe(), as_of()).await.is_err());
        assert!(store
            .get_sector(SectorKey::Banks, Metric::Per, as_of())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn observed_samples_feed_live_tier() {
        let (_, _, store) = setup();
        store.observe_samples(&universe());
        let found = store
            .get_sector(SectorKey::Banks, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.source, DistributionSource::Live);
        assert_eq!(found.distribution.sample_size, 15);

        let mut updated = sample("B00", SectorKey::Banks);
        updated.per = Some(100.0);
        store.observe_samples(&[updated]);
        assert_eq!(store.live_sample_count(), 20);
        let found = store
            .get_sector(SectorKey::Banks, Metric::Per, as_of())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.distribution.max, 100.0);
    }
}
