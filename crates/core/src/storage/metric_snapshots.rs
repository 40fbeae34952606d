//! Raw per-symbol samples as fetched, one row per `(symbol, as_of_date)`.

use crate::domain::sample::MetricSample;
use anyhow::Context;
use chrono::NaiveDate;
use serde_json::Value;

fn upsert_chunk_size() -> anyhow::Result<usize> {
    let size = std::env::var("METRIC_SNAPSHOTS_UPSERT_BATCH")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200);
    anyhow::ensure!(size >= 1, "METRIC_SNAPSHOTS_UPSERT_BATCH must be >= 1");
    Ok(size)
}

pub async fn upsert_snapshots_atomic(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    samples: &[MetricSample],
) -> anyhow::Result<u64> {
    anyhow::ensure!(!samples.is_empty(), "samples must be non-empty");

    let rows: Vec<(&MetricSample, Value)> = samples
        .iter()
        .map(|s| {
            serde_json::to_value(s)
                .with_context(|| format!("serialize sample failed (symbol={})", s.symbol))
                .map(|v| (s, v))
        })
        .collect::<anyhow::Result<_>>()?;

    let chunk_size = upsert_chunk_size()?;
    let mut tx = pool.begin().await.context("begin transaction failed")?;
    let mut affected: u64 = 0;
    for (batch_idx, chunk) in rows.chunks(chunk_size).enumerate() {
        let t0 = std::time::Instant::now();
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO metric_snapshots (symbol, as_of_date, name, sector, metrics, fetched_at) ",
        );
        qb.push_values(chunk, |mut b, (sample, metrics)| {
            b.push_bind(sample.symbol.trim())
                .push_bind(as_of_date)
                .push_bind(sample.name.trim())
                .push_bind(sample.sector.as_str())
                .push_bind(metrics.clone())
                .push_bind(sample.fetched_at);
        });
        qb.push(
            " ON CONFLICT (symbol, as_of_date) DO UPDATE \
               SET name = EXCLUDED.name, sector = EXCLUDED.sector, \
                   metrics = EXCLUDED.metrics, fetched_at = EXCLUDED.fetched_at",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch upsert metric_snapshots failed")?;
        affected += res.rows_affected();

        tracing::debug!(
            %as_of_date,
            batch_idx,
            batch_size = chunk.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "metric_snapshots batch upsert"
        );
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

/// Samples from the most recent snapshot date at or before `as_of_date`.
/// Rows that no longer deserialize are skipped with a warning.
pub async fn load_latest_snapshot(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
) -> anyhow::Result<Option<(NaiveDate, Vec<MetricSample>)>> {
    let latest: Option<NaiveDate> = sqlx::query_scalar(
        "SELECT max(as_of_date) FROM metric_snapshots WHERE as_of_date <= $1",
    )
    .persistent(false)
    .bind(as_of_date)
    .fetch_one(pool)
    .await
    .context("select latest metric_snapshots date failed")?;
    let Some(date) = latest else {
        return Ok(None);
    };

    let rows: Vec<(String, Value)> = sqlx::query_as(
        "SELECT symbol, metrics FROM metric_snapshots WHERE as_of_date = $1 ORDER BY symbol",
    )
    .persistent(false)
    .bind(date)
    .fetch_all(pool)
    .await
    .context("select metric_snapshots failed")?;

    Ok(Some((date, decode_rows(rows))))
}

fn decode_rows(rows: Vec<(String, Value)>) -> Vec<MetricSample> {
    rows.into_iter()
        .filter_map(|(symbol, metrics)| match serde_json::from_value(metrics) {
            Ok(sample) => Some(sample),
            Err(err) => {
                tracing::warn!(%symbol, error = %err, "undecodable metric snapshot row skipped");
                None
            }
        })
        .collect()
}
