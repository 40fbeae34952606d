use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use valuesieve_core::config::Settings;
use valuesieve_core::engine::{BatchOutcome, ScoringConfig, ValuationEngine};
use valuesieve_core::pipeline::failure_memo::{FailureMemo, FailureMemoConfig};
use valuesieve_core::pipeline::fetch::{ConcurrencyMode, FetchConfig, FetchPipeline};
use valuesieve_core::pipeline::rate_limiter::{RateLimitConfig, TokenBucket};
use valuesieve_core::stats::repository::{DistributionRepository, InMemoryDistributionRepository};
use valuesieve_core::stats::store::{SectorStatisticsStore, StatsConfig};
use valuesieve_core::storage::lock::RunKind;
use valuesieve_core::storage::PgDistributionRepository;
use valuesieve_core::time::clock::system_clock;
use valuesieve_core::time::kr_market::MarketCalendar;
use valuesieve_core::time::{Clock, SharedClock};

mod ingest;
mod universe;

#[derive(Debug, Parser)]
#[command(name = "valuesieve_worker")]
struct Args {
    /// Market as-of date (YYYY-MM-DD). Defaults to the latest KRX session
    /// whose valuation data has been published.
    #[arg(long, global = true)]
    as_of_date: Option<String>,

    /// Comma-separated `SYMBOL[:NAME]` list.
    #[arg(long, global = true)]
    symbols: Option<String>,

    /// File with one `SYMBOL[,NAME]` per line.
    #[arg(long, global = true)]
    symbols_file: Option<std::path::PathBuf>,

    /// sequential | bounded | high
    #[arg(long, global = true, default_value = "bounded")]
    concurrency: String,

    #[arg(long, global = true, value_enum, default_value = "kis")]
    provider: ingest::ProviderKind,

    /// Do everything except writing to the database.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch universe metrics, persist the raw snapshot and recompute sector
    /// distributions.
    Refresh,
    /// Score the universe and persist the ranked results.
    Score {
        /// Score the stored metric snapshot instead of fetching again.
        #[arg(long)]
        from_snapshot: bool,

        /// Rows printed on a dry run.
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let res = run(&settings, &args).await;
    if let Err(err) = &res {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(error = %format!("{err:#}"), "worker run failed");
    }
    res
}

async fn run(settings: &Settings, args: &Args) -> anyhow::Result<()> {
    let clock = system_clock();
    let as_of_date = MarketCalendar::from_env().resolve_as_of_date(args.as_of_date.as_deref(), clock.now())?;
    let mode: ConcurrencyMode = args.concurrency.parse()?;

    let pool = if args.dry_run {
        None
    } else {
        let pool = valuesieve_core::storage::connect(settings.require_database_url()?, 5).await?;
        valuesieve_core::storage::migrate(&pool).await?;
        Some(pool)
    };

    let kind = match args.command {
        Command::Refresh => RunKind::Refresh,
        Command::Score { .. } => RunKind::Score,
    };
    if let Some(pool) = &pool {
        let acquired = valuesieve_core::storage::lock::try_acquire_run_lock(pool, kind, as_of_date).await?;
        if !acquired {
            tracing::warn!(%as_of_date, ?kind, "run lock not acquired; another run in progress");
            return Ok(());
        }
    }

    let engine = build_engine(settings, args, pool.clone(), clock.clone())?;
    let source = universe::UniverseSource {
        symbols: args.symbols.clone(),
        symbols_file: args.symbols_file.clone(),
    };

    let res = match &args.command {
        Command::Refresh => refresh(&engine, pool.as_ref(), &source, as_of_date, mode).await,
        Command::Score { from_snapshot, top } => {
            score(&engine, pool.as_ref(), &source, as_of_date, mode, *from_snapshot, *top, clock, args.provider).await
        }
    };

    if let Some(pool) = &pool {
        if let Err(e) = valuesieve_core::storage::lock::release_run_lock(pool, kind, as_of_date).await {
            tracing::warn!(error = %e, "run lock release failed");
        }
    }
    res
}

fn build_engine(
    settings: &Settings,
    args: &Args,
    pool: Option<sqlx::PgPool>,
    clock: SharedClock,
) -> anyhow::Result<ValuationEngine> {
    let provider = ingest::build_provider(settings, args.provider)?;
    let limiter = TokenBucket::shared(provider.provider_name(), &RateLimitConfig::from_env());
    let memo = Arc::new(FailureMemo::new(FailureMemoConfig::from_env(), clock.clone()));
    let pipeline = FetchPipeline::new(provider, limiter, memo, clock.clone(), FetchConfig::from_env());

    let repo: Arc<dyn DistributionRepository> = match pool {
        Some(pool) => Arc::new(PgDistributionRepository::new(pool)),
        None => Arc::new(InMemoryDistributionRepository::new()),
    };
    let stats = Arc::new(SectorStatisticsStore::new(repo, clock.clone(), StatsConfig::from_env()));

    Ok(ValuationEngine::new(pipeline, stats, clock, ScoringConfig::from_env()))
}

async fn refresh(
    engine: &ValuationEngine,
    pool: Option<&sqlx::PgPool>,
    source: &universe::UniverseSource,
    as_of_date: chrono::NaiveDate,
    mode: ConcurrencyMode,
) -> anyhow::Result<()> {
    let symbols = universe::load_universe(source, pool, as_of_date).await?;
    let requested = symbols.len();
    let samples = ingest::fetch_universe(engine.pipeline(), symbols, as_of_date, mode).await;
    anyhow::ensure!(!samples.is_empty(), "no symbol could be fetched for {as_of_date}");

    if let Some(pool) = pool {
        ingest::persist_snapshot(pool, as_of_date, &samples).await?;
    }

    let fetched = samples.len();
    let report = engine.refresh_sector_statistics(samples, as_of_date).await?;
    tracing::info!(
        %as_of_date,
        requested,
        fetched,
        persisted = report.persisted,
        dropped_sectors = report.dropped.len(),
        dry_run = pool.is_none(),
        "refresh finished"
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn score(
    engine: &ValuationEngine,
    pool: Option<&sqlx::PgPool>,
    source: &universe::UniverseSource,
    as_of_date: chrono::NaiveDate,
    mode: ConcurrencyMode,
    from_snapshot: bool,
    top: usize,
    clock: SharedClock,
    provider: ingest::ProviderKind,
) -> anyhow::Result<()> {
    check_stats_freshness(engine.stats(), as_of_date).await;

    let generated_at = clock.now();
    let outcome = score_universe(engine, pool, source, as_of_date, mode, from_snapshot).await;
    let provider_name = if from_snapshot {
        "snapshot"
    } else {
        match provider {
            ingest::ProviderKind::Kis => "kis",
            ingest::ProviderKind::Http => "http",
        }
    };

    let Some(pool) = pool else {
        let outcome = outcome?;
        let shown: Vec<_> = outcome.results.iter().take(top).collect();
        println!("{}", serde_json::to_string_pretty(&shown).context("serialize results failed")?);
        tracing::info!(
            %as_of_date,
            scored = outcome.results.len(),
            skipped = outcome.skipped.len(),
            dry_run = true,
            "score finished"
        );
        return Ok(());
    };

    match outcome {
        Ok(outcome) => {
            let run_id = valuesieve_core::storage::scores::persist_success(
                pool,
                as_of_date,
                generated_at,
                provider_name,
                &outcome,
            )
            .await?;
            tracing::info!(
                %as_of_date,
                %run_id,
                scored = outcome.results.len(),
                skipped = outcome.skipped.len(),
                "persisted score run"
            );
            Ok(())
        }
        Err(err) => {
            let run_id = valuesieve_core::storage::scores::persist_failure(
                pool,
                as_of_date,
                generated_at,
                provider_name,
                &format!("{err:#}"),
            )
            .await?;
            tracing::error!(%as_of_date, %run_id, error = %err, "score run failed");
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsFreshness {
    Fresh,
    Stale,
    /// The repository could not be read.
    Unknown,
}

async fn check_stats_freshness(stats: &SectorStatisticsStore, as_of_date: chrono::NaiveDate) -> StatsFreshness {
    match stats.needs_refresh(as_of_date).await {
        Ok(false) => StatsFreshness::Fresh,
        Ok(true) => {
            tracing::warn!(%as_of_date, "sector statistics missing or stale; run `refresh` first for sector-relative scores");
            StatsFreshness::Stale
        }
        Err(e) => {
            tracing::warn!(%as_of_date, error = %format!("{e:#}"), "sector statistics freshness check failed");
            StatsFreshness::Unknown
        }
    }
}

async fn score_universe(
    engine: &ValuationEngine,
    pool: Option<&sqlx::PgPool>,
    source: &universe::UniverseSource,
    as_of_date: chrono::NaiveDate,
    mode: ConcurrencyMode,
    from_snapshot: bool,
) -> anyhow::Result<BatchOutcome> {
    if from_snapshot {
        let pool = pool.context("--from-snapshot needs a database")?;
        let (date, samples) = valuesieve_core::storage::metric_snapshots::load_latest_snapshot(pool, as_of_date)
            .await?
            .with_context(|| format!("no metric snapshot at or before {as_of_date}"))?;
        tracing::info!(snapshot_date = %date, samples = samples.len(), "scoring stored snapshot");
        let (results, skipped) = engine.score_samples(&samples, as_of_date).await?;
        return Ok(BatchOutcome { results, skipped });
    }

    let symbols = universe::load_universe(source, pool, as_of_date).await?;
    Ok(engine.score_batch(symbols, as_of_date, mode).await?)
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
