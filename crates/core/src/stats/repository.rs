use crate::domain::distribution::{DistributionScope, SectorDistribution};
use crate::domain::sample::Metric;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Durable, date-versioned distribution storage. One record per
/// `(scope, metric, as_of_date)`; saving the same key again supersedes it.
#[async_trait::async_trait]
pub trait DistributionRepository: Send + Sync {
    /// The record with the greatest `as_of_date <= as_of_date`.
    async fn load_latest(
        &self,
        scope: DistributionScope,
        metric: Metric,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<(NaiveDate, SectorDistribution)>>;

    async fn save(&self, as_of_date: NaiveDate, dist: &SectorDistribution) -> anyhow::Result<()>;

    async fn save_all(
        &self,
        as_of_date: NaiveDate,
        dists: &[SectorDistribution],
    ) -> anyhow::Result<u64> {
        for d in dists {
            self.save(as_of_date, d).await?;
        }
        Ok(dists.len() as u64)
    }
}

type Key = (DistributionScope, Metric, NaiveDate);

/// Process-local repository for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryDistributionRepository {
    rows: RwLock<BTreeMap<Key, SectorDistribution>>,
    #[cfg(test)]
    offline: std::sync::atomic::AtomicBool,
}

impl InMemoryDistributionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every call fail, as an unreachable database would.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline
            .store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_online(&self) -> anyhow::Result<()> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("distribution store unreachable");
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_online(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl DistributionRepository for InMemoryDistributionRepository {
    async fn load_latest(
        &self,
        scope: DistributionScope,
        metric: Metric,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<(NaiveDate, SectorDistribution)>> {
        self.check_online()?;
        let rows = self.rows.read().unwrap_or_else(|p| p.into_inner());
        let found = rows
            .range((scope, metric, NaiveDate::MIN)..=(scope, metric, as_of_date))
            .next_back()
            .map(|((_, _, date), dist)| (*date, dist.clone()));
        Ok(found)
    }

    async fn save(&self, as_of_date: NaiveDate, dist: &SectorDistribution) -> anyhow::Result<()> {
        self.check_online()?;
        let mut rows = self.rows.write().unwrap_or_else(|p| p.into_inner());
        rows.insert((dist.scope, dist.metric, as_of_date), dist.clone());
        Ok(())
    }
}
