use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::collections::HashSet;

const KST_OFFSET_SECS: i32 = 9 * 3600;

// Valuation fields (PER/PBR) are published after the close; runs before this
// time (KST) score against the previous session.
const CLOSE_CUTOFF_HOUR_KST: u32 = 16;
const CLOSE_CUTOFF_MINUTE_KST: u32 = 0;

#[derive(Debug, Clone, Default)]
pub struct MarketCalendar {
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    /// Fixed-date holidays plus anything listed in `KR_MARKET_HOLIDAYS`
    /// (`YYYY-MM-DD,YYYY-MM-DD`).
    pub fn from_env() -> Self {
        let mut cal = Self::with_fixed_holidays();
        if let Ok(s) = std::env::var("KR_MARKET_HOLIDAYS") {
            cal.extend_from_list(&s);
        }
        cal
    }

    pub fn with_fixed_holidays() -> Self {
        let mut holidays = HashSet::new();
        for y in 2024..=2030 {
            for (m, d) in [(1, 1), (3, 1), (5, 5), (6, 6), (8, 15), (10, 3), (10, 9), (12, 25), (12, 31)] {
                if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                    holidays.insert(date);
                }
            }
        }
        Self { holidays }
    }

    pub fn extend_from_list(&mut self, s: &str) {
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match NaiveDate::parse_from_str(part, "%Y-%m-%d") {
                Ok(d) => {
                    self.holidays.insert(d);
                }
                Err(err) => {
                    tracing::warn!(value = part, error = %err, "ignoring malformed holiday entry");
                }
            }
        }
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.holidays.contains(&date)
    }

    pub fn previous_business_day(&self, date: NaiveDate) -> NaiveDate {
        self.roll_back(date - Duration::days(1))
    }

    fn roll_back(&self, mut date: NaiveDate) -> NaiveDate {
        while !self.is_business_day(date) {
            date = date - Duration::days(1);
        }
        date
    }

    pub fn resolve_as_of_date(
        &self,
        as_of_date_arg: Option<&str>,
        now_utc: DateTime<Utc>,
    ) -> anyhow::Result<NaiveDate> {
        if let Some(s) = as_of_date_arg {
            return NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("invalid as-of date {s:?}, expected YYYY-MM-DD"));
        }

        let kst = chrono::FixedOffset::east_opt(KST_OFFSET_SECS).context("invalid KST offset")?;
        let now_kst = now_utc.with_timezone(&kst);

        let cutoff_reached =
            (now_kst.hour(), now_kst.minute()) >= (CLOSE_CUTOFF_HOUR_KST, CLOSE_CUTOFF_MINUTE_KST);
        let mut date = now_kst.date_naive();
        if !cutoff_reached {
            date = date - Duration::days(1);
        }

        Ok(self.roll_back(date))
    }
}

/// Calendar month bucket used by monthly caches, e.g. `2026-03`.
pub fn month_key(date: NaiveDate) -> (i32, u32) {
    (date.year(), date.month())
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rolls_back_on_weekend() {
        // 2026-01-03 is Saturday.
        let now = Utc.with_ymd_and_hms(2026, 1, 3, 8, 0, 0).unwrap();
        let d = MarketCalendar::with_fixed_holidays()
            .resolve_as_of_date(None, now)
            .unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
    }

    #[test]
    fn uses_previous_session_before_cutoff() {
        // 2026-01-05 06:00 UTC = 15:00 KST
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 6, 0, 0).unwrap();
        let d = MarketCalendar::with_fixed_holidays()
            .resolve_as_of_date(None, now)
            .unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
    }

    #[test]
    fn uses_same_day_after_cutoff() {
        // 2026-01-05 08:00 UTC = 17:00 KST
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let d = MarketCalendar::with_fixed_holidays()
            .resolve_as_of_date(None, now)
            .unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
    }

    #[test]
    fn explicit_date_wins_and_is_validated() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let cal = MarketCalendar::with_fixed_holidays();
        assert_eq!(
            cal.resolve_as_of_date(Some("2026-02-10"), now).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 10).unwrap()
        );
        assert!(cal.resolve_as_of_date(Some("10/02/2026"), now).is_err());
    }

    #[test]
    fn configured_holidays_are_skipped() {
        let mut cal = MarketCalendar::with_fixed_holidays();
        cal.extend_from_list("2026-02-16, 2026-02-17,bogus");
        let d = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        assert_eq!(
            cal.previous_business_day(d),
            NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
        );
    }
}
