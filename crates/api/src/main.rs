use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use valuesieve_core::domain::distribution::{DistributionScope, SectorDistribution};
use valuesieve_core::domain::score::{ComponentScores, Recommendation, ScoreResult, Verdict};
use valuesieve_core::domain::{Metric, SectorKey};
use valuesieve_core::stats::repository::DistributionRepository;
use valuesieve_core::storage::PgDistributionRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = valuesieve_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match valuesieve_core::storage::connect(db_url, 5).await {
            Ok(pool) => match valuesieve_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                sentry_anyhow::capture_anyhow(&e);
                tracing::error!(error = %e, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let state = AppState { pool };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/scores/latest", get(get_latest_scores))
        .route("/scores/:as_of_date", get(get_scores_by_date))
        .route("/scores/:as_of_date/:symbol", get(get_score_by_date_and_symbol))
        .route(
            "/sectors/:sector/distributions/:metric",
            get(get_sector_distribution),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Clone)]
struct AppState {
    pool: Option<PgPool>,
}

#[derive(Debug, Serialize)]
struct ApiScoreRun {
    run_id: Uuid,
    provider: String,
    as_of_date: NaiveDate,
    generated_at: DateTime<Utc>,
    skipped: serde_json::Value,
    items: Vec<ScoreResult>,
}

#[derive(Debug, Serialize)]
struct ApiDistribution {
    as_of_date: NaiveDate,
    distribution: SectorDistribution,
}

#[derive(Debug, Deserialize)]
struct AsOfQuery {
    as_of_date: Option<String>,
}

fn internal(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %format!("{e:#}"), "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn parse_date(s: &str) -> Result<NaiveDate, StatusCode> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)
}

async fn get_latest_scores(State(state): State<AppState>) -> Result<Json<ApiScoreRun>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let run = fetch_run(pool, None)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(run))
}

async fn get_scores_by_date(
    State(state): State<AppState>,
    Path(as_of_date): Path<String>,
) -> Result<Json<ApiScoreRun>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let as_of_date = parse_date(&as_of_date)?;

    let run = fetch_run(pool, Some(as_of_date))
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(run))
}

async fn get_score_by_date_and_symbol(
    State(state): State<AppState>,
    Path((as_of_date, symbol)): Path<(String, String)>,
) -> Result<Json<ScoreResult>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let as_of_date = parse_date(&as_of_date)?;

    let (run_id, ..) = fetch_run_header(pool, Some(as_of_date))
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let item = fetch_item(pool, run_id, as_of_date, symbol.trim())
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(item))
}

async fn get_sector_distribution(
    State(state): State<AppState>,
    Path((sector, metric)): Path<(String, String)>,
    Query(q): Query<AsOfQuery>,
) -> Result<Json<ApiDistribution>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let scope = parse_scope(&sector).ok_or(StatusCode::NOT_FOUND)?;
    let metric: Metric = metric.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    let as_of_date = match q.as_of_date.as_deref() {
        Some(s) => parse_date(s)?,
        None => Utc::now().date_naive(),
    };

    let repo = PgDistributionRepository::new(pool.clone());
    let (as_of_date, distribution) = repo
        .load_latest(scope, metric, as_of_date)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ApiDistribution {
        as_of_date,
        distribution,
    }))
}

/// Canonical sector key, `global`, or any label the sector normaliser knows.
fn parse_scope(raw: &str) -> Option<DistributionScope> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("global") {
        return Some(DistributionScope::Global);
    }
    if let Ok(scope) = raw.parse::<DistributionScope>() {
        return Some(scope);
    }
    match valuesieve_core::domain::normalize_sector(raw) {
        SectorKey::Other => None,
        key => Some(DistributionScope::Sector(key)),
    }
}

type RunHeader = (Uuid, NaiveDate, DateTime<Utc>, String, serde_json::Value);

async fn fetch_run_header(
    pool: &PgPool,
    as_of_date: Option<NaiveDate>,
) -> anyhow::Result<Option<RunHeader>> {
    let row = match as_of_date {
        Some(d) => {
            sqlx::query_as::<_, RunHeader>(
                "SELECT id, as_of_date, generated_at, provider, skipped \
                 FROM score_runs \
                 WHERE status = 'success' AND as_of_date = $1 \
                 ORDER BY generated_at DESC \
                 LIMIT 1",
            )
            .bind(d)
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, RunHeader>(
                "SELECT id, as_of_date, generated_at, provider, skipped \
                 FROM score_runs \
                 WHERE status = 'success' \
                 ORDER BY as_of_date DESC, generated_at DESC \
                 LIMIT 1",
            )
            .fetch_optional(pool)
            .await?
        }
    };
    Ok(row)
}

async fn fetch_run(
    pool: &PgPool,
    as_of_date: Option<NaiveDate>,
) -> anyhow::Result<Option<ApiScoreRun>> {
    let Some((run_id, as_of_date, generated_at, provider, skipped)) =
        fetch_run_header(pool, as_of_date).await?
    else {
        return Ok(None);
    };

    let rows = sqlx::query_as::<_, ItemRow>(&format!(
        "SELECT {ITEM_COLUMNS} FROM score_items WHERE run_id = $1 ORDER BY rank ASC"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    let items = rows
        .into_iter()
        .map(|r| r.into_result(as_of_date))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Some(ApiScoreRun {
        run_id,
        provider,
        as_of_date,
        generated_at,
        skipped,
        items,
    }))
}

async fn fetch_item(
    pool: &PgPool,
    run_id: Uuid,
    as_of_date: NaiveDate,
    symbol: &str,
) -> anyhow::Result<Option<ScoreResult>> {
    let row = sqlx::query_as::<_, ItemRow>(&format!(
        "SELECT {ITEM_COLUMNS} FROM score_items WHERE run_id = $1 AND symbol = $2 LIMIT 1"
    ))
    .bind(run_id)
    .bind(symbol)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.into_result(as_of_date)).transpose()
}

const ITEM_COLUMNS: &str = "rank, symbol, name, sector, total_score, max_score, grade, \
                            recommendation, verdict, components, notes, scored_at";

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    rank: i32,
    symbol: String,
    name: String,
    sector: String,
    total_score: f64,
    max_score: f64,
    grade: String,
    recommendation: String,
    verdict: serde_json::Value,
    components: serde_json::Value,
    notes: Vec<String>,
    scored_at: DateTime<Utc>,
}

impl ItemRow {
    fn into_result(self, as_of_date: NaiveDate) -> anyhow::Result<ScoreResult> {
        let sector: SectorKey = self.sector.parse()?;
        let recommendation = Recommendation::parse(&self.recommendation).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid recommendation in DB for symbol={}: {}",
                self.symbol,
                self.recommendation
            )
        })?;
        let verdict: Verdict = serde_json::from_value(self.verdict)?;
        let components: ComponentScores = serde_json::from_value(self.components)?;
        anyhow::ensure!(self.rank >= 1, "invalid rank in DB for symbol={}", self.symbol);

        Ok(ScoreResult {
            symbol: self.symbol,
            name: self.name,
            sector,
            as_of_date,
            components,
            total_score: self.total_score,
            max_score: self.max_score,
            grade: self.grade,
            recommendation,
            verdict,
            rank: Some(self.rank as u32),
            notes: self.notes,
            scored_at: self.scored_at,
        })
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &valuesieve_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scopes_accept_keys_labels_and_global() {
        assert_eq!(parse_scope("global"), Some(DistributionScope::Global));
        assert_eq!(parse_scope("__global__"), Some(DistributionScope::Global));
        assert_eq!(parse_scope("banks"), Some(DistributionScope::Sector(SectorKey::Banks)));
        assert_eq!(parse_scope("은행"), Some(DistributionScope::Sector(SectorKey::Banks)));
        assert_eq!(parse_scope("no such sector"), None);
    }

    #[test]
    fn stored_rows_rebuild_results() {
        let row = ItemRow {
            rank: 2,
            symbol: "005930".into(),
            name: "삼성전자".into(),
            sector: "semiconductors".into(),
            total_score: 71.5,
            max_score: 143.0,
            grade: "B".into(),
            recommendation: "buy".into(),
            verdict: json!({"kind": "scored"}),
            components: serde_json::to_value(ComponentScores::default()).unwrap(),
            notes: vec!["per: global distribution (sector n=4)".into()],
            scored_at: Utc::now(),
        };
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let r = row.into_result(date).unwrap();
        assert_eq!(r.rank, Some(2));
        assert_eq!(r.recommendation, Recommendation::Buy);
        assert_eq!(r.verdict, Verdict::Scored);
        assert_eq!(r.sector, SectorKey::Semiconductors);
    }
}
