use crate::config::override_from_env;
use crate::domain::sample::MetricSample;
use crate::ingest::adapter::normalize_record;
use crate::ingest::error::{ProviderError, ProviderErrorKind};
use crate::ingest::provider::MetricsProvider;
use crate::ingest::types::SymbolRef;
use crate::pipeline::failure_memo::FailureMemo;
use crate::pipeline::rate_limiter::SharedRateLimiter;
use crate::time::SharedClock;
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Total attempts per symbol, first call included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long one attempt may wait for rate-limit tokens.
    pub acquire_timeout: Duration,
    /// Upper bound on a single provider call.
    pub call_timeout: Duration,
    pub bounded_concurrency: usize,
    pub high_concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            acquire_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            bounded_concurrency: 4,
            high_concurrency: 12,
        }
    }
}

/// `None` for negative, non-finite or out-of-range seconds.
fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        override_from_env(&mut out.max_attempts, "FETCH_MAX_ATTEMPTS");
        out.max_attempts = out.max_attempts.max(1);

        let mut base_ms = out.backoff_base.as_millis() as u64;
        override_from_env(&mut base_ms, "FETCH_BACKOFF_BASE_MS");
        out.backoff_base = Duration::from_millis(base_ms);

        let mut max_ms = out.backoff_max.as_millis() as u64;
        override_from_env(&mut max_ms, "FETCH_BACKOFF_MAX_MS");
        out.backoff_max = Duration::from_millis(max_ms.max(base_ms));

        let mut acquire_secs = out.acquire_timeout.as_secs_f64();
        override_from_env(&mut acquire_secs, "FETCH_ACQUIRE_TIMEOUT_SECS");
        match secs_to_duration(acquire_secs) {
            Some(d) => out.acquire_timeout = d,
            None => tracing::warn!(acquire_secs, "invalid FETCH_ACQUIRE_TIMEOUT_SECS; using default"),
        }

        let mut call_secs = out.call_timeout.as_secs();
        override_from_env(&mut call_secs, "FETCH_TIMEOUT_SECS");
        out.call_timeout = Duration::from_secs(call_secs.max(1));

        override_from_env(&mut out.bounded_concurrency, "FETCH_BOUNDED_CONCURRENCY");
        override_from_env(&mut out.high_concurrency, "FETCH_HIGH_CONCURRENCY");
        out.bounded_concurrency = out.bounded_concurrency.max(1);
        out.high_concurrency = out.high_concurrency.max(out.bounded_concurrency);
        out
    }

    /// `base * 2^retry`, capped. `retry` is 0 for the wait after the first failure.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    Sequential,
    #[default]
    Bounded,
    High,
}

impl ConcurrencyMode {
    pub fn permits(&self, config: &FetchConfig) -> usize {
        match self {
            ConcurrencyMode::Sequential => 1,
            ConcurrencyMode::Bounded => config.bounded_concurrency,
            ConcurrencyMode::High => config.high_concurrency,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyMode::Sequential => "sequential",
            ConcurrencyMode::Bounded => "bounded",
            ConcurrencyMode::High => "high",
        }
    }
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConcurrencyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(ConcurrencyMode::Sequential),
            "bounded" | "parallel" => Ok(ConcurrencyMode::Bounded),
            "high" | "high-parallel" => Ok(ConcurrencyMode::High),
            other => anyhow::bail!("unknown concurrency mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(MetricSample),
    /// Failed recently; not attempted this cycle.
    SkippedMemo { reason: String },
    /// No rate-limit tokens within the acquire timeout. Not memoized.
    RateLimited,
    /// Retries exhausted or a non-retryable provider error. Memoized.
    Failed { reason: String },
}

impl FetchOutcome {
    pub fn skip_reason(&self) -> Option<String> {
        match self {
            FetchOutcome::Fetched(_) => None,
            FetchOutcome::SkippedMemo { reason } => Some(format!("recently failed: {reason}")),
            FetchOutcome::RateLimited => Some("rate limited".to_string()),
            FetchOutcome::Failed { reason } => Some(reason.clone()),
        }
    }
}

/// Bounded-concurrency, rate-limited fetcher with retry and a failure memo.
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct FetchPipeline {
    provider: Arc<dyn MetricsProvider>,
    limiter: SharedRateLimiter,
    memo: Arc<FailureMemo>,
    clock: SharedClock,
    config: FetchConfig,
}

impl FetchPipeline {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        limiter: SharedRateLimiter,
        memo: Arc<FailureMemo>,
        clock: SharedClock,
        config: FetchConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            memo,
            clock,
            config,
        }
    }

    pub fn memo(&self) -> &FailureMemo {
        &self.memo
    }

    pub async fn fetch_one(&self, symbol: &SymbolRef, as_of_date: NaiveDate) -> FetchOutcome {
        let code = symbol.symbol.as_str();
        if let Some(reason) = self.memo.reason(code) {
            tracing::debug!(symbol = code, %reason, "skipping symbol in failure memo");
            return FetchOutcome::SkippedMemo { reason };
        }

        let tokens = self.provider.calls_per_fetch();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            if !self.limiter.acquire(tokens, self.config.acquire_timeout).await {
                tracing::warn!(
                    symbol = code,
                    attempt,
                    "rate limiter acquire timed out; skipping symbol this cycle"
                );
                return FetchOutcome::RateLimited;
            }

            let result = match tokio::time::timeout(
                self.config.call_timeout,
                self.provider.fetch_metrics(symbol, as_of_date),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(ProviderError::new(
                    ProviderErrorKind::Timeout,
                    code,
                    format!("no response within {:?}", self.config.call_timeout),
                )),
            };

            let err = match result {
                Ok(raw) => {
                    let sample = normalize_record(&raw, &symbol.name, self.clock.now());
                    return FetchOutcome::Fetched(sample);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                tracing::warn!(symbol = code, error = %err, "provider fetch failed (not retryable)");
                self.memo.record(code, err.to_string());
                return FetchOutcome::Failed {
                    reason: err.to_string(),
                };
            }

            if attempt >= self.config.max_attempts {
                tracing::warn!(
                    symbol = code,
                    attempt,
                    error = %err,
                    "provider fetch failed; retries exhausted"
                );
                self.memo.record(code, err.to_string());
                return FetchOutcome::Failed {
                    reason: err.to_string(),
                };
            }

            let backoff = self.config.backoff(attempt - 1);
            tracing::warn!(symbol = code, attempt, ?backoff, error = %err, "provider fetch failed; retrying");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Fetches every symbol under the mode's in-flight cap. Results come back
    /// in completion order.
    pub async fn fetch_batch(
        &self,
        symbols: Vec<SymbolRef>,
        as_of_date: NaiveDate,
        mode: ConcurrencyMode,
    ) -> Vec<(SymbolRef, FetchOutcome)> {
        let permits = mode.permits(&self.config);
        let semaphore = Arc::new(Semaphore::new(permits));
        let total = symbols.len();
        tracing::info!(total, %mode, permits, provider = self.provider.provider_name(), "fetch batch started");

        let mut tasks = JoinSet::new();
        for symbol in symbols {
            let semaphore = Arc::clone(&semaphore);
            let pipeline = self.clone();
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => pipeline.fetch_one(&symbol, as_of_date).await,
                    Err(_) => FetchOutcome::Failed {
                        reason: "fetch semaphore closed".to_string(),
                    },
                };
                (symbol, outcome)
            });
        }

        let mut out = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => out.push(pair),
                Err(e) => tracing::error!(error = %e, "fetch task panicked"),
            }
        }

        let fetched = out
            .iter()
            .filter(|(_, o)| matches!(o, FetchOutcome::Fetched(_)))
            .count();
        tracing::info!(total, fetched, skipped = total - fetched, "fetch batch finished");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::{payload, ScriptedProvider};
    use crate::pipeline::failure_memo::FailureMemoConfig;
    use crate::pipeline::rate_limiter::{RateLimitConfig, TokenBucket};
    use crate::time::ManualClock;
    use chrono::{TimeZone, Utc};
    use tokio::time::Instant;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn fast_config() -> FetchConfig {
        FetchConfig {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(2),
            bounded_concurrency: 3,
            high_concurrency: 8,
        }
    }

    fn pipeline(provider: Arc<ScriptedProvider>, rate: RateLimitConfig, config: FetchConfig) -> FetchPipeline {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
        ));
        let memo = Arc::new(FailureMemo::new(FailureMemoConfig::default(), clock.clone()));
        FetchPipeline::new(
            provider,
            TokenBucket::shared("test", &rate),
            memo,
            clock,
            config,
        )
    }

    fn roomy_rate() -> RateLimitConfig {
        RateLimitConfig {
            capacity: 100,
            refill_per_sec: 100.0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let c = fast_config();
        assert_eq!(c.backoff(0), Duration::from_millis(100));
        assert_eq!(c.backoff(1), Duration::from_millis(200));
        assert_eq!(c.backoff(3), Duration::from_millis(800));
        assert_eq!(c.backoff(4), Duration::from_secs(1));
        assert_eq!(c.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn acquire_timeout_rejects_unrepresentable_seconds() {
        assert_eq!(secs_to_duration(2.5), Some(Duration::from_millis(2500)));
        assert_eq!(secs_to_duration(-1.0), None);
        assert_eq!(secs_to_duration(f64::NAN), None);
        assert_eq!(secs_to_duration(1e30), None);
    }

    #[test]
    fn concurrency_mode_parsing() {
        assert_eq!("high".parse::<ConcurrencyMode>().unwrap(), ConcurrencyMode::High);
        assert_eq!(" Sequential ".parse::<ConcurrencyMode>().unwrap(), ConcurrencyMode::Sequential);
        assert!("turbo".parse::<ConcurrencyMode>().is_err());
        assert_eq!(ConcurrencyMode::Sequential.permits(&fast_config()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_normalized() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_payload("005930", payload("전기·전자", 11.0, 1.2, 9.5));
        let p = pipeline(provider.clone(), roomy_rate(), fast_config());

        match p.fetch_one(&SymbolRef::new("005930", "삼성전자"), as_of()).await {
            FetchOutcome::Fetched(sample) => {
                assert_eq!(sample.name, "삼성전자");
                assert_eq!(sample.per, Some(11.0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(provider.calls("005930"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_payload("A", payload("Retail", 9.0, 0.8, 10.0));
        provider.fail_next("A", ProviderErrorKind::Server(503), 2);
        let p = pipeline(provider.clone(), roomy_rate(), fast_config());

        let start = Instant::now();
        let outcome = p.fetch_one(&SymbolRef::new("A", "a"), as_of()).await;
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));
        assert_eq!(provider.calls("A"), 3);
        // 100ms + 200ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(!p.memo().contains("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_land_in_memo_and_skip_next_cycle() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_always("B", ProviderErrorKind::Timeout);
        let p = pipeline(provider.clone(), roomy_rate(), fast_config());
        let sym = SymbolRef::new("B", "b");

        assert!(matches!(p.fetch_one(&sym, as_of()).await, FetchOutcome::Failed { .. }));
        assert_eq!(provider.calls("B"), 3);
        assert!(p.memo().contains("B"));

        assert!(matches!(p.fetch_one(&sym, as_of()).await, FetchOutcome::SkippedMemo { .. }));
        assert_eq!(provider.calls("B"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        let p = pipeline(provider.clone(), roomy_rate(), fast_config());
        let outcome = p.fetch_one(&SymbolRef::new("404", "missing"), as_of()).await;
        assert!(matches!(outcome, FetchOutcome::Failed { .. }));
        assert_eq!(provider.calls("404"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_transient() {
        let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_secs(5)));
        provider.set_payload("C", payload("Retail", 9.0, 0.8, 10.0));
        let p = pipeline(provider.clone(), roomy_rate(), fast_config());

        let outcome = p.fetch_one(&SymbolRef::new("C", "c"), as_of()).await;
        match outcome {
            FetchOutcome::Failed { reason } => assert!(reason.contains("Timeout"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(provider.calls("C"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_timeout_skips_without_memo() {
        let provider = Arc::new(ScriptedProvider::new().with_calls_per_fetch(3));
        provider.set_payload("D", payload("Retail", 9.0, 0.8, 10.0));
        provider.set_payload("E", payload("Retail", 9.0, 0.8, 10.0));
        let rate = RateLimitConfig {
            capacity: 3,
            refill_per_sec: 0.1,
        };
        let config = FetchConfig {
            acquire_timeout: Duration::from_secs(1),
            ..fast_config()
        };
        let p = pipeline(provider.clone(), rate, config);

        assert!(matches!(
            p.fetch_one(&SymbolRef::new("D", "d"), as_of()).await,
            FetchOutcome::Fetched(_)
        ));
        assert_eq!(
            p.fetch_one(&SymbolRef::new("E", "e"), as_of()).await,
            FetchOutcome::RateLimited
        );
        assert_eq!(provider.calls("E"), 0);
        assert!(!p.memo().contains("E"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_respects_in_flight_cap() {
        let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(50)));
        let symbols: Vec<SymbolRef> = (0..20)
            .map(|i| {
                let code = format!("{i:06}");
                provider.set_payload(&code, payload("Retail", 9.0 + i as f64 * 0.1, 0.8, 10.0));
                SymbolRef::new(code, format!("n{i}"))
            })
            .collect();
        provider.fail_always("000007", ProviderErrorKind::Client(400));
        let p = pipeline(provider.clone(), roomy_rate(), fast_config());

        let results = p.fetch_batch(symbols, as_of(), ConcurrencyMode::Bounded).await;
        assert_eq!(results.len(), 20);
        assert!(provider.max_in_flight() <= 3);
        assert!(provider.max_in_flight() >= 2);
        let failed: Vec<_> = results
            .iter()
            .filter(|(_, o)| !matches!(o, FetchOutcome::Fetched(_)))
            .map(|(s, _)| s.symbol.as_str())
            .collect();
        assert_eq!(failed, vec!["000007"]);
    }
}
