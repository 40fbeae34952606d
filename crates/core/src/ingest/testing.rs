//! Scripted provider for pipeline and engine tests.

use crate::ingest::error::{ProviderError, ProviderErrorKind};
use crate::ingest::provider::MetricsProvider;
use crate::ingest::types::{RawMetricRecord, SymbolRef};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct ScriptedProvider {
    payloads: Mutex<HashMap<String, Value>>,
    queued_failures: Mutex<HashMap<String, VecDeque<ProviderErrorKind>>>,
    permanent_failures: Mutex<HashMap<String, ProviderErrorKind>>,
    calls: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    calls_per_fetch: u32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            calls_per_fetch: 1,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_calls_per_fetch(mut self, n: u32) -> Self {
        self.calls_per_fetch = n;
        self
    }

    pub fn set_payload(&self, symbol: &str, fields: Value) {
        lock(&self.payloads).insert(symbol.to_string(), fields);
    }

    /// Fails the next `times` calls for `symbol` with `kind`, then serves the payload.
    pub fn fail_next(&self, symbol: &str, kind: ProviderErrorKind, times: usize) {
        lock(&self.queued_failures)
            .entry(symbol.to_string())
            .or_default()
            .extend(std::iter::repeat(kind).take(times));
    }

    pub fn fail_always(&self, symbol: &str, kind: ProviderErrorKind) {
        lock(&self.permanent_failures).insert(symbol.to_string(), kind);
    }

    pub fn calls(&self, symbol: &str) -> u32 {
        lock(&self.calls).get(symbol).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Provider fields for a plain, healthy company.
pub(crate) fn payload(sector: &str, per: f64, pbr: f64, roe: f64) -> Value {
    json!({
        "sector": sector,
        "per": per,
        "pbr": pbr,
        "roe": roe,
        "psr": 1.2,
        "debt_ratio": 80.0,
        "current_ratio": 180.0,
        "market_cap": 500_000_000_000.0_f64,
        "trading_value": 5_000_000_000.0_f64
    })
}

#[async_trait::async_trait]
impl MetricsProvider for ScriptedProvider {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn calls_per_fetch(&self) -> u32 {
        self.calls_per_fetch
    }

    async fn fetch_metrics(
        &self,
        symbol: &SymbolRef,
        as_of_date: NaiveDate,
    ) -> Result<RawMetricRecord, ProviderError> {
        let code = symbol.symbol.as_str();
        *lock(&self.calls).entry(code.to_string()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(kind) = lock(&self.permanent_failures).get(code).copied() {
            return Err(ProviderError::new(kind, code, "scripted permanent failure"));
        }
        if let Some(kind) = lock(&self.queued_failures)
            .get_mut(code)
            .and_then(VecDeque::pop_front)
        {
            return Err(ProviderError::new(kind, code, "scripted failure"));
        }

        let fields = lock(&self.payloads)
            .get(code)
            .cloned()
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Client(404), code, "unknown symbol"))?;

        let mut record = RawMetricRecord::new("scripted", code, as_of_date);
        record.name = Some(symbol.name.clone());
        record.merge_object(&fields);
        Ok(record)
    }
}
