//! Scoring entry points: fetch → validate → risk → quality → percentiles →
//! margin of safety → composite.

use crate::domain::distribution::SectorDistribution;
use crate::domain::sample::{DataQualityError, Metric, MetricSample};
use crate::domain::score::{ComponentScores, ScoreResult, ValuationSubScores};
use crate::domain::sector::SectorKey;
use crate::ingest::types::SymbolRef;
use crate::pipeline::fetch::{ConcurrencyMode, FetchOutcome, FetchPipeline};
use crate::scoring::composite::{self, CompositeConfig, ScoreSubject, VALUATION_SUB_MAX};
use crate::scoring::percentile::{blended_percentile, BlendConfig, PercentileSource};
use crate::scoring::quality::{assess_quality, criteria_for, sector_bonus, Rejection};
use crate::scoring::regime::{RegimeCache, RegimeConfig, RegimeSource};
use crate::scoring::risk::{assess_risk, RiskConfig};
use crate::scoring::valuation::{alternative_points, margin_of_safety, Valuation, ValuationConfig};
use crate::stats::store::{DistributionLookup, RefreshReport, SectorStatisticsStore};
use crate::time::SharedClock;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
pub enum ScoreError {
    /// Skipped this cycle (rate limited or in the failure memo).
    Unavailable { symbol: String, reason: String },
    FetchFailed { symbol: String, reason: String },
    DataQuality(DataQualityError),
    /// The distribution store could not be reached. Fatal for a batch.
    Store(anyhow::Error),
}

impl ScoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScoreError::Store(_))
    }
}

impl fmt::Display for ScoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreError::Unavailable { symbol, reason } => {
                write!(f, "{symbol} unavailable this cycle: {reason}")
            }
            ScoreError::FetchFailed { symbol, reason } => write!(f, "{symbol} fetch failed: {reason}"),
            ScoreError::DataQuality(e) => write!(f, "{e}"),
            ScoreError::Store(e) => write!(f, "distribution store failure: {e:#}"),
        }
    }
}

impl std::error::Error for ScoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScoreError::DataQuality(e) => Some(e),
            ScoreError::Store(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringConfig {
    pub blend: BlendConfig,
    pub regime: RegimeConfig,
    pub valuation: ValuationConfig,
    pub risk: RiskConfig,
    pub composite: CompositeConfig,
}

impl ScoringConfig {
    pub fn from_env() -> Self {
        Self {
            blend: BlendConfig::from_env(),
            regime: RegimeConfig::from_env(),
            valuation: ValuationConfig::from_env(),
            risk: RiskConfig::from_env(),
            composite: CompositeConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    /// Ranked.
    pub results: Vec<ScoreResult>,
    pub skipped: Vec<SkippedSymbol>,
}

pub struct ValuationEngine {
    pipeline: FetchPipeline,
    stats: Arc<SectorStatisticsStore>,
    regimes: RegimeCache,
    config: ScoringConfig,
    clock: SharedClock,
}

impl ValuationEngine {
    pub fn new(
        pipeline: FetchPipeline,
        stats: Arc<SectorStatisticsStore>,
        clock: SharedClock,
        config: ScoringConfig,
    ) -> Self {
        Self {
            pipeline,
            stats,
            regimes: RegimeCache::new(config.regime.clone()),
            config,
            clock,
        }
    }

    pub fn pipeline(&self) -> &FetchPipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> &SectorStatisticsStore {
        &self.stats
    }

    pub async fn score_symbol(
        &self,
        symbol: &SymbolRef,
        as_of_date: NaiveDate,
    ) -> Result<ScoreResult, ScoreError> {
        let sample = match self.pipeline.fetch_one(symbol, as_of_date).await {
            FetchOutcome::Fetched(sample) => sample,
            other => return Err(outcome_error(&symbol.symbol, other)),
        };
        self.stats.observe_samples(std::slice::from_ref(&sample));
        self.score_sample(&sample, as_of_date).await
    }

    /// Fetches and scores every symbol. Per-symbol failures are recorded in
    /// `skipped`; only a store failure aborts the run.
    pub async fn score_batch(
        &self,
        symbols: Vec<SymbolRef>,
        as_of_date: NaiveDate,
        mode: ConcurrencyMode,
    ) -> Result<BatchOutcome, ScoreError> {
        let total = symbols.len();
        let fetched = self.pipeline.fetch_batch(symbols, as_of_date, mode).await;

        let mut samples = Vec::with_capacity(fetched.len());
        let mut out = BatchOutcome::default();
        for (symbol, outcome) in fetched {
            match outcome {
                FetchOutcome::Fetched(sample) => samples.push(sample),
                other => out.skipped.push(SkippedSymbol {
                    reason: outcome_error(&symbol.symbol, other).to_string(),
                    symbol: symbol.symbol,
                }),
            }
        }

        let (results, skipped) = self.score_samples(&samples, as_of_date).await?;
        out.results = results;
        out.skipped.extend(skipped);
        out.skipped.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        tracing::info!(
            %as_of_date,
            total,
            scored = out.results.len(),
            skipped = out.skipped.len(),
            "score batch finished"
        );
        Ok(out)
    }

    /// Scores already-fetched samples (e.g. a persisted snapshot) and ranks
    /// them. The samples also join the live statistics pool.
    pub async fn score_samples(
        &self,
        samples: &[MetricSample],
        as_of_date: NaiveDate,
    ) -> Result<(Vec<ScoreResult>, Vec<SkippedSymbol>), ScoreError> {
        self.stats.observe_samples(samples);

        let mut results = Vec::with_capacity(samples.len());
        let mut skipped = Vec::new();
        for sample in samples {
            match self.score_sample(sample, as_of_date).await {
                Ok(r) => results.push(r),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(symbol = %sample.symbol, error = %e, "symbol skipped");
                    skipped.push(SkippedSymbol {
                        symbol: sample.symbol.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        composite::rank(&mut results);
        Ok((results, skipped))
    }

    pub async fn score_sample(
        &self,
        sample: &MetricSample,
        as_of_date: NaiveDate,
    ) -> Result<ScoreResult, ScoreError> {
        sample.validate().map_err(ScoreError::DataQuality)?;

        let subject = ScoreSubject {
            symbol: sample.symbol.clone(),
            name: sample.name.clone(),
            sector: sample.sector,
            as_of_date,
            scored_at: self.clock.now(),
        };
        let mut notes = Vec::new();

        let risk = assess_risk(sample, &self.config.risk);
        if let Some(severe) = &risk.severe {
            tracing::debug!(symbol = %sample.symbol, flag = severe.flag, "severe risk flag");
            return Ok(composite::severe_risk(subject, severe.flag, risk.total(), notes));
        }

        let criteria = criteria_for(sample.sector);
        let quality = match assess_quality(sample, &criteria) {
            Ok(q) => q,
            Err(Rejection(reason)) => {
                tracing::debug!(symbol = %sample.symbol, %reason, "rejected on quality threshold");
                return Ok(composite::rejected(subject, reason, notes));
            }
        };

        let mut valuation = ValuationSubScores::default();
        for metric in [Metric::Per, Metric::Pbr, Metric::Roe] {
            let points = self
                .goodness_percentile(sample, metric, as_of_date, &mut notes)
                .await?
                .map(|g| g / 100.0 * VALUATION_SUB_MAX)
                .unwrap_or(0.0);
            match metric {
                Metric::Per => valuation.per = points,
                Metric::Pbr => valuation.pbr = points,
                Metric::Roe => valuation.roe = points,
                Metric::Psr => {}
            }
        }

        let regime = self.regimes.for_sample(sample);
        if regime.source == RegimeSource::Default {
            notes.push("regime: default parameters".to_string());
        }
        let margin = match margin_of_safety(
            sample.per,
            sample.pbr,
            sample.roe_decimal(),
            &regime,
            &self.config.valuation,
        ) {
            Valuation::Justified(m) => {
                if m.multiples.growth_clamped {
                    notes.push(format!(
                        "valuation: growth clamped to {:.4} (retention {:.3})",
                        m.multiples.growth, m.multiples.retention_rate
                    ));
                }
                m.points
            }
            Valuation::NotApplicable => {
                notes.push("valuation: roe not positive; price-to-sales path".to_string());
                match self
                    .goodness_percentile(sample, Metric::Psr, as_of_date, &mut notes)
                    .await?
                {
                    Some(g) => alternative_points(g, &self.config.valuation),
                    None => 0.0,
                }
            }
        };

        let components = ComponentScores {
            valuation,
            quality: quality.total(),
            sector_bonus: sector_bonus(sample, &criteria),
            margin_of_safety: margin,
            risk_penalty: risk.total(),
        };
        Ok(composite::compose(subject, components, notes, &self.config.composite))
    }

    /// Percentile oriented so that 100 is best (cheap multiple, high ROE).
    /// `None` when the sample has no usable value for the metric.
    async fn goodness_percentile(
        &self,
        sample: &MetricSample,
        metric: Metric,
        as_of_date: NaiveDate,
        notes: &mut Vec<String>,
    ) -> Result<Option<f64>, ScoreError> {
        let usable = match metric {
            Metric::Roe => sample.metric(metric).filter(|v| v.is_finite()),
            _ => sample.metric(metric).filter(|v| metric.in_bounds(*v)),
        };
        let Some(value) = usable else {
            notes.push(format!("{metric}: no usable value"));
            return Ok(None);
        };

        let sector = self
            .stats
            .get_sector(sample.sector, metric, as_of_date)
            .await
            .map_err(ScoreError::Store)?;
        let global = self
            .stats
            .get_global(metric, as_of_date)
            .await
            .map_err(ScoreError::Store)?;

        if sector.as_ref().is_some_and(|l| l.stale) || global.as_ref().is_some_and(|l| l.stale) {
            notes.push(format!("{metric}: stale distribution"));
        }

        let sector_dist: Option<&SectorDistribution> = sector.as_ref().map(|l| l.distribution.as_ref());
        let global_dist: Option<&SectorDistribution> = global.as_ref().map(|l| l.distribution.as_ref());
        let blended = blended_percentile(value, sector_dist, global_dist, &self.config.blend);

        let n = sector_dist.map(|d| d.sample_size).unwrap_or(0);
        match blended.source {
            PercentileSource::Sector => {}
            PercentileSource::Global => notes.push(format!("{metric}: global distribution (sector n={n})")),
            PercentileSource::Blended { sector_weight } => notes.push(format!(
                "{metric}: blended sector/global (sector n={n}, weight {sector_weight:.2})"
            )),
            PercentileSource::Neutral => notes.push(format!("{metric}: no distribution; neutral")),
        }

        Ok(Some(if metric.lower_is_better() {
            100.0 - blended.value
        } else {
            blended.value
        }))
    }

    pub async fn get_sector_distribution(
        &self,
        sector: SectorKey,
        metric: Metric,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<DistributionLookup>> {
        self.stats.get_sector(sector, metric, as_of_date).await
    }

    /// Recomputes and persists distributions from a snapshot. Samples failing
    /// validation are left out.
    pub async fn refresh_sector_statistics(
        &self,
        samples: Vec<MetricSample>,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<RefreshReport> {
        let total = samples.len();
        let valid: Vec<MetricSample> = samples
            .into_iter()
            .filter(|s| match s.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "sample excluded from statistics");
                    false
                }
            })
            .collect();
        if valid.len() < total {
            tracing::warn!(
                excluded = total - valid.len(),
                total,
                "samples failed validation and were excluded from statistics"
            );
        }
        self.stats.refresh(valid, as_of_date).await
    }
}

fn outcome_error(symbol: &str, outcome: FetchOutcome) -> ScoreError {
    let symbol = symbol.to_string();
    match outcome {
        FetchOutcome::Failed { reason } => ScoreError::FetchFailed { symbol, reason },
        other => ScoreError::Unavailable {
            symbol,
            reason: other.skip_reason().unwrap_or_default(),
        },
    }
}
