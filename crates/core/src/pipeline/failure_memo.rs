use crate::config::override_from_env;
use crate::time::SharedClock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct FailureMemoConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for FailureMemoConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(1),
            max_entries: 1000,
        }
    }
}

impl FailureMemoConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        let mut ttl_secs = out.ttl.num_seconds();
        override_from_env(&mut ttl_secs, "FAILURE_MEMO_TTL_SECS");
        out.ttl = Duration::seconds(ttl_secs.max(1));
        override_from_env(&mut out.max_entries, "FAILURE_MEMO_MAX");
        out.max_entries = out.max_entries.max(1);
        out
    }
}

#[derive(Debug, Clone)]
struct Entry {
    failed_at: DateTime<Utc>,
    reason: String,
}

/// Negative cache of symbols whose fetch recently exhausted its retries.
/// Entries expire after the TTL; when full, the oldest failure is evicted.
#[derive(Debug)]
pub struct FailureMemo {
    config: FailureMemoConfig,
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
}

impl FailureMemo {
    pub fn new(config: FailureMemoConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Present and not yet expired. Expired entries are dropped on the way.
    pub fn contains(&self, symbol: &str) -> bool {
        self.reason(symbol).is_some()
    }

    pub fn reason(&self, symbol: &str) -> Option<String> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(symbol) {
            Some(e) if !self.expired(e, now) => Some(e.reason.clone()),
            Some(_) => {
                entries.remove(symbol);
                None
            }
            None => None,
        }
    }

    pub fn record(&self, symbol: &str, reason: impl Into<String>) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());

        if !entries.contains_key(symbol) && entries.len() >= self.config.max_entries {
            entries.retain(|_, e| !self.expired(e, now));
            while entries.len() >= self.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by(|a, b| a.1.failed_at.cmp(&b.1.failed_at).then_with(|| a.0.cmp(b.0)))
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        tracing::debug!(symbol = %k, "evicting oldest failure memo entry");
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }

        entries.insert(
            symbol.to_string(),
            Entry {
                failed_at: now,
                reason: reason.into(),
            },
        );
    }

    /// Live entries only.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, e| !self.expired(e, now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now - entry.failed_at > self.config.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn setup(ttl_secs: i64, max: usize) -> (Arc<ManualClock>, FailureMemo) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        ));
        let memo = FailureMemo::new(
            FailureMemoConfig {
                ttl: Duration::seconds(ttl_secs),
                max_entries: max,
            },
            clock.clone(),
        );
        (clock, memo)
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (clock, memo) = setup(60, 10);
        memo.record("005930", "timeout");
        assert!(memo.contains("005930"));
        assert_eq!(memo.reason("005930").as_deref(), Some("timeout"));

        clock.advance(Duration::seconds(60));
        assert!(memo.contains("005930"));

        clock.advance(Duration::seconds(1));
        assert!(!memo.contains("005930"));
        assert!(memo.is_empty());
    }

    #[test]
    fn size_is_bounded_with_oldest_first_eviction() {
        let (clock, memo) = setup(3600, 3);
        for s in ["a", "b", "c", "d", "e"] {
            memo.record(s, "x");
            clock.advance(Duration::seconds(1));
            assert!(memo.len() <= 3);
        }
        assert!(!memo.contains("a"));
        assert!(!memo.contains("b"));
        assert!(memo.contains("c"));
        assert!(memo.contains("e"));
    }

    #[test]
    fn rerecording_refreshes_without_eviction() {
        let (clock, memo) = setup(100, 2);
        memo.record("a", "first");
        memo.record("b", "x");
        clock.advance(Duration::seconds(90));
        memo.record("a", "second");
        assert_eq!(memo.len(), 2);

        clock.advance(Duration::seconds(20));
        assert!(memo.contains("a"));
        assert!(!memo.contains("b"));
        assert_eq!(memo.reason("a").as_deref(), Some("second"));
    }

    #[test]
    fn expired_entries_make_room_before_live_ones_are_evicted() {
        let (clock, memo) = setup(10, 2);
        memo.record("old", "x");
        clock.advance(Duration::seconds(5));
        memo.record("live", "x");
        clock.advance(Duration::seconds(6));
        memo.record("new", "x");
        assert!(memo.contains("live"));
        assert!(memo.contains("new"));
        assert!(!memo.contains("old"));
    }
}
