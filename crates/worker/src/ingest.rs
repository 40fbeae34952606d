use anyhow::Context;
use chrono::NaiveDate;
use std::sync::Arc;
use valuesieve_core::config::Settings;
use valuesieve_core::domain::MetricSample;
use valuesieve_core::ingest::kis::KisClient;
use valuesieve_core::ingest::{HttpJsonDataProvider, MetricsProvider, SymbolRef};
use valuesieve_core::pipeline::fetch::{ConcurrencyMode, FetchOutcome, FetchPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    Kis,
    Http,
}

pub fn build_provider(
    settings: &Settings,
    kind: ProviderKind,
) -> anyhow::Result<Arc<dyn MetricsProvider>> {
    Ok(match kind {
        ProviderKind::Kis => Arc::new(KisClient::from_settings(settings)?),
        ProviderKind::Http => Arc::new(HttpJsonDataProvider::from_settings(settings)?),
    })
}

/// Fetches the universe and returns the samples that arrived, sorted by
/// symbol. Skips are logged, not fatal.
pub async fn fetch_universe(
    pipeline: &FetchPipeline,
    symbols: Vec<SymbolRef>,
    as_of_date: NaiveDate,
    mode: ConcurrencyMode,
) -> Vec<MetricSample> {
    let mut samples = Vec::new();
    for (symbol, outcome) in pipeline.fetch_batch(symbols, as_of_date, mode).await {
        match outcome {
            FetchOutcome::Fetched(sample) => samples.push(sample),
            other => tracing::warn!(
                symbol = %symbol.symbol,
                reason = other.skip_reason().unwrap_or_default(),
                "symbol not fetched"
            ),
        }
    }
    samples.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    samples
}

pub async fn persist_snapshot(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    samples: &[MetricSample],
) -> anyhow::Result<u64> {
    if samples.is_empty() {
        tracing::warn!(%as_of_date, "nothing fetched; snapshot not written");
        return Ok(0);
    }
    let written = valuesieve_core::storage::metric_snapshots::upsert_snapshots_atomic(pool, as_of_date, samples)
        .await
        .context("persist metric snapshot failed")?;
    tracing::info!(%as_of_date, written, "metric snapshot persisted");
    Ok(written)
}
