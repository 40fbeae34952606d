use crate::domain::distribution::{DistributionScope, SectorDistribution};
use crate::domain::sample::Metric;
use crate::stats::repository::DistributionRepository;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, sqlx::FromRow)]
struct DistributionRow {
    scope: String,
    metric: String,
    as_of_date: NaiveDate,
    sample_size: i64,
    p10: Option<f64>,
    p25: f64,
    p50: f64,
    p75: f64,
    p90: Option<f64>,
    mean: f64,
    std: f64,
    min: f64,
    max: f64,
    computed_at: DateTime<Utc>,
}

impl DistributionRow {
    fn into_domain(self) -> anyhow::Result<(NaiveDate, SectorDistribution)> {
        let scope: DistributionScope = self
            .scope
            .parse()
            .with_context(|| format!("bad scope in sector_distributions: {}", self.scope))?;
        let metric: Metric = self
            .metric
            .parse()
            .with_context(|| format!("bad metric in sector_distributions: {}", self.metric))?;
        let sample_size = usize::try_from(self.sample_size)
            .with_context(|| format!("negative sample_size for {scope}/{metric}"))?;
        Ok((
            self.as_of_date,
            SectorDistribution {
                scope,
                metric,
                sample_size,
                p10: self.p10,
                p25: self.p25,
                p50: self.p50,
                p75: self.p75,
                p90: self.p90,
                mean: self.mean,
                std: self.std,
                min: self.min,
                max: self.max,
                computed_at: self.computed_at,
            },
        ))
    }
}

const SELECT_COLUMNS: &str = "scope, metric, as_of_date, sample_size, p10, p25, p50, p75, p90, \
                              mean, std, min, max, computed_at";

/// `sector_distributions` table.
#[derive(Debug, Clone)]
pub struct PgDistributionRepository {
    pool: sqlx::PgPool,
}

impl PgDistributionRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn upsert_chunk_size() -> usize {
    std::env::var("DISTRIBUTIONS_UPSERT_BATCH")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n >= 1)
        .unwrap_or(100)
}

#[async_trait::async_trait]
impl DistributionRepository for PgDistributionRepository {
    async fn load_latest(
        &self,
        scope: DistributionScope,
        metric: Metric,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<(NaiveDate, SectorDistribution)>> {
        let row: Option<DistributionRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM sector_distributions \
             WHERE scope = $1 AND metric = $2 AND as_of_date <= $3 \
             ORDER BY as_of_date DESC LIMIT 1"
        ))
        .persistent(false)
        .bind(scope.as_db_key())
        .bind(metric.as_str())
        .bind(as_of_date)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("select sector_distributions failed (scope={scope}, metric={metric})"))?;

        row.map(DistributionRow::into_domain).transpose()
    }

    async fn save(&self, as_of_date: NaiveDate, dist: &SectorDistribution) -> anyhow::Result<()> {
        self.save_all(as_of_date, std::slice::from_ref(dist)).await?;
        Ok(())
    }

    async fn save_all(
        &self,
        as_of_date: NaiveDate,
        dists: &[SectorDistribution],
    ) -> anyhow::Result<u64> {
        if dists.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        let mut affected: u64 = 0;
        for (batch_idx, chunk) in dists.chunks(upsert_chunk_size()).enumerate() {
            let t0 = std::time::Instant::now();
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO sector_distributions (scope, metric, as_of_date, sample_size, \
                 p10, p25, p50, p75, p90, mean, std, min, max, computed_at) ",
            );
            qb.push_values(chunk, |mut b, d| {
                b.push_bind(d.scope.as_db_key())
                    .push_bind(d.metric.as_str())
                    .push_bind(as_of_date)
                    .push_bind(d.sample_size as i64)
                    .push_bind(d.p10)
                    .push_bind(d.p25)
                    .push_bind(d.p50)
                    .push_bind(d.p75)
                    .push_bind(d.p90)
                    .push_bind(d.mean)
                    .push_bind(d.std)
                    .push_bind(d.min)
                    .push_bind(d.max)
                    .push_bind(d.computed_at);
            });
            qb.push(
                " ON CONFLICT (scope, metric, as_of_date) DO UPDATE \
                   SET sample_size = EXCLUDED.sample_size, p10 = EXCLUDED.p10, p25 = EXCLUDED.p25, \
                       p50 = EXCLUDED.p50, p75 = EXCLUDED.p75, p90 = EXCLUDED.p90, \
                       mean = EXCLUDED.mean, std = EXCLUDED.std, min = EXCLUDED.min, \
                       max = EXCLUDED.max, computed_at = EXCLUDED.computed_at",
            );

            let res = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("batch upsert sector_distributions failed")?;
            affected += res.rows_affected();

            tracing::debug!(
                %as_of_date,
                batch_idx,
                batch_size = chunk.len(),
                elapsed_ms = t0.elapsed().as_millis(),
                "sector_distributions batch upsert"
            );
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(affected)
    }
}
