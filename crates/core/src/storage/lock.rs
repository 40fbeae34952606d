use anyhow::Context;
use chrono::{Datelike, NaiveDate};

/// Worker jobs that must not overlap for one as-of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Refresh,
    Score,
}

impl RunKind {
    fn namespace(self) -> i64 {
        match self {
            // "VSREFR" / "VSSCOR" packed as ASCII.
            RunKind::Refresh => 0x5653_5245_4652,
            RunKind::Score => 0x5653_5343_4F52,
        }
    }
}

fn lock_key(kind: RunKind, as_of_date: NaiveDate) -> i64 {
    kind.namespace() ^ i64::from(as_of_date.num_days_from_ce())
}

/// Session-scoped advisory lock; `false` when another session holds it.
pub async fn try_acquire_run_lock(
    pool: &sqlx::PgPool,
    kind: RunKind,
    as_of_date: NaiveDate,
) -> anyhow::Result<bool> {
    let key = lock_key(kind, as_of_date);
    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(key)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to acquire advisory lock (kind={kind:?}, key={key})"))?;
    Ok(acquired.0)
}

pub async fn release_run_lock(
    pool: &sqlx::PgPool,
    kind: RunKind,
    as_of_date: NaiveDate,
) -> anyhow::Result<()> {
    let key = lock_key(kind, as_of_date);
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .persistent(false)
        .bind(key)
        .execute(pool)
        .await
        .with_context(|| format!("failed to release advisory lock (kind={kind:?}, key={key})"))?;
    Ok(())
}
