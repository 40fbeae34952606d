use crate::domain::score::ScoreResult;
use crate::engine::BatchOutcome;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

const ITEMS_BATCH: usize = 200;

/// Persists a ranked batch as one run plus its items, atomically.
pub async fn persist_success(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    generated_at: DateTime<Utc>,
    provider: &str,
    outcome: &BatchOutcome,
) -> anyhow::Result<uuid::Uuid> {
    let skipped = serde_json::to_value(&outcome.skipped).context("serialize skipped failed")?;
    let items = outcome
        .results
        .iter()
        .map(ItemRow::from_result)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let run_id = uuid::Uuid::new_v4();
    sqlx::query(
        "INSERT INTO score_runs (id, as_of_date, generated_at, provider, status, error, scored, skipped) \
         VALUES ($1, $2, $3, $4, 'success', NULL, $5, $6)",
    )
    .persistent(false)
    .bind(run_id)
    .bind(as_of_date)
    .bind(generated_at)
    .bind(provider)
    .bind(items.len() as i32)
    .bind(skipped)
    .execute(&mut *tx)
    .await
    .context("insert score_runs failed")?;

    for chunk in items.chunks(ITEMS_BATCH) {
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO score_items (run_id, rank, symbol, name, sector, total_score, max_score, \
             grade, recommendation, verdict, components, notes, scored_at) ",
        );
        qb.push_values(chunk, |mut b, item| {
            b.push_bind(run_id)
                .push_bind(item.rank)
                .push_bind(item.result.symbol.as_str())
                .push_bind(item.result.name.as_str())
                .push_bind(item.result.sector.as_str())
                .push_bind(item.result.total_score)
                .push_bind(item.result.max_score)
                .push_bind(item.result.grade.as_str())
                .push_bind(item.result.recommendation.as_str())
                .push_bind(item.verdict.clone())
                .push_bind(item.components.clone())
                .push_bind(item.result.notes.clone())
                .push_bind(item.result.scored_at);
        });
        qb.build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("insert score_items failed")?;
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(run_id)
}

/// Records a run that aborted before producing results.
pub async fn persist_failure(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    generated_at: DateTime<Utc>,
    provider: &str,
    error: &str,
) -> anyhow::Result<uuid::Uuid> {
    let run_id: uuid::Uuid = sqlx::query_scalar(
        "INSERT INTO score_runs (id, as_of_date, generated_at, provider, status, error) \
         VALUES ($1, $2, $3, $4, 'error', $5) \
         RETURNING id",
    )
    .persistent(false)
    .bind(uuid::Uuid::new_v4())
    .bind(as_of_date)
    .bind(generated_at)
    .bind(provider)
    .bind(error)
    .fetch_one(pool)
    .await
    .context("insert error score_runs failed")?;

    Ok(run_id)
}

struct ItemRow<'a> {
    result: &'a ScoreResult,
    rank: i32,
    verdict: Value,
    components: Value,
}

impl<'a> ItemRow<'a> {
    fn from_result(result: &'a ScoreResult) -> anyhow::Result<Self> {
        let rank = result
            .rank
            .with_context(|| format!("unranked result for {}", result.symbol))?;
        Ok(Self {
            result,
            rank: i32::try_from(rank).context("rank out of range")?,
            verdict: serde_json::to_value(&result.verdict).context("serialize verdict failed")?,
            components: serde_json::to_value(&result.components)
                .context("serialize components failed")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::score::{ComponentScores, Recommendation, Verdict};
    use crate::domain::sector::SectorKey;
    use chrono::TimeZone;

    fn result(rank: Option<u32>) -> ScoreResult {
        ScoreResult {
            symbol: "005930".into(),
            name: "Samsung".into(),
            sector: SectorKey::Semiconductors,
            as_of_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            components: ComponentScores::default(),
            total_score: 0.0,
            max_score: 143.0,
            grade: "F".into(),
            recommendation: Recommendation::Avoid,
            verdict: Verdict::Rejected {
                reason: "debt".into(),
            },
            rank,
            notes: vec![],
            scored_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn items_require_a_rank() {
        assert!(ItemRow::from_result(&result(None)).is_err());
        let r = result(Some(3));
        let row = ItemRow::from_result(&r).unwrap();
        assert_eq!(row.rank, 3);
        assert_eq!(row.verdict["kind"], "rejected");
    }
}
