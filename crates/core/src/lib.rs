pub mod domain;
pub mod engine;
pub mod ingest;
pub mod pipeline;
pub mod scoring;
pub mod stats;
pub mod storage;
pub mod time;

pub mod config {
    use anyhow::Context;
    use std::str::FromStr;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub data_provider_base_url: Option<String>,
        pub data_provider_api_key: Option<String>,
        pub kis_appkey: Option<String>,
        pub kis_appsecret: Option<String>,
        pub kis_base_url: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                data_provider_base_url: std::env::var("DATA_PROVIDER_BASE_URL").ok(),
                data_provider_api_key: std::env::var("DATA_PROVIDER_API_KEY").ok(),
                kis_appkey: std::env::var("KIS_APPKEY").ok(),
                kis_appsecret: std::env::var("KIS_APPSECRET").ok(),
                kis_base_url: std::env::var("KIS_BASE_URL").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_data_provider_base_url(&self) -> anyhow::Result<&str> {
            self.data_provider_base_url
                .as_deref()
                .context("DATA_PROVIDER_BASE_URL is required")
        }

        pub fn require_kis_credentials(&self) -> anyhow::Result<(&str, &str)> {
            let appkey = self.kis_appkey.as_deref().context("KIS_APPKEY is required")?;
            let appsecret = self
                .kis_appsecret
                .as_deref()
                .context("KIS_APPSECRET is required")?;
            Ok((appkey, appsecret))
        }
    }

    /// Parses `key` from the environment. Unset or unparsable values yield `None`
    /// so callers keep their defaults.
    pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
    }

    /// Overwrites `slot` when `key` is set to a parsable value.
    pub fn override_from_env<T: FromStr>(slot: &mut T, key: &str) {
        if let Some(v) = env_parse::<T>(key) {
            *slot = v;
        }
    }

    /// Parses `LABEL:percent` lists such as `A+:80,A:70,B:50`.
    pub fn parse_label_thresholds(s: &str) -> Option<Vec<(String, f64)>> {
        let mut out = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (label, pct) = part.rsplit_once(':')?;
            let pct = pct.trim().parse::<f64>().ok()?;
            if !(0.0..=100.0).contains(&pct) {
                return None;
            }
            out.push((label.trim().to_string(), pct / 100.0));
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_label_thresholds() {
            let parsed = parse_label_thresholds("A+:80, A:70,B:50").unwrap();
            assert_eq!(parsed.len(), 3);
            assert_eq!(parsed[0].0, "A+");
            assert!((parsed[0].1 - 0.8).abs() < 1e-12);
            assert!((parsed[2].1 - 0.5).abs() < 1e-12);
        }

        #[test]
        fn rejects_malformed_thresholds() {
            assert!(parse_label_thresholds("A+80").is_none());
            assert!(parse_label_thresholds("A:abc").is_none());
            assert!(parse_label_thresholds("A:120").is_none());
            assert!(parse_label_thresholds(" , ").is_none());
        }
    }
}
