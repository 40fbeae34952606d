use crate::config::{env_parse, Settings};
use crate::ingest::error::{ProviderError, ProviderErrorKind};
use crate::ingest::types::{RawMetricRecord, SymbolRef};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/v1/metrics";

/// An already-authenticated market-data source. Implementations make a single
/// attempt per call; retry, throttling and failure memoization belong to the
/// fetch pipeline.
#[async_trait::async_trait]
pub trait MetricsProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Remote calls one `fetch_metrics` makes; the pipeline reserves this many
    /// rate-limit tokens up front.
    fn calls_per_fetch(&self) -> u32 {
        1
    }

    async fn fetch_metrics(
        &self,
        symbol: &SymbolRef,
        as_of_date: NaiveDate,
    ) -> Result<RawMetricRecord, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct HttpJsonDataProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
}

impl HttpJsonDataProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_data_provider_base_url()?.to_string();
        let api_key = settings.data_provider_api_key.clone();

        let timeout_secs =
            env_parse::<u64>("DATA_PROVIDER_TIMEOUT_SECS").unwrap_or(DEFAULT_TIMEOUT_SECS);

        let path = std::env::var("DATA_PROVIDER_METRICS_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build data provider http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            path,
        })
    }

    fn url(&self, symbol: &str) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!(
            "{}{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_end_matches('/'),
            symbol
        )
    }

    fn headers(&self, symbol: &str) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key).map_err(|e| {
                ProviderError::new(ProviderErrorKind::Client(0), symbol, format!("bad api key header: {e}"))
            })?;
            headers.insert("x-api-key", value);
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl MetricsProvider for HttpJsonDataProvider {
    fn provider_name(&self) -> &'static str {
        "external_http_json"
    }

    async fn fetch_metrics(
        &self,
        symbol: &SymbolRef,
        as_of_date: NaiveDate,
    ) -> Result<RawMetricRecord, ProviderError> {
        let code = symbol.symbol.as_str();
        let res = self
            .http
            .get(self.url(code))
            .headers(self.headers(code)?)
            .query(&[("as_of_date", as_of_date.to_string())])
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, code))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, code))?;

        if !status.is_success() {
            return Err(ProviderError::from_status(status, code, &text));
        }

        parse_metrics_body(&text, symbol, as_of_date)
    }
}

/// Accepts either `{ "fields": {...}, ... }` or a flat object of fields.
fn parse_metrics_body(
    text: &str,
    symbol: &SymbolRef,
    as_of_date: NaiveDate,
) -> Result<RawMetricRecord, ProviderError> {
    let code = symbol.symbol.as_str();
    let raw_json = serde_json::from_str::<Value>(text).map_err(|e| {
        ProviderError::new(ProviderErrorKind::Decode, code, format!("response is not valid JSON: {e}"))
    })?;

    let Value::Object(obj) = &raw_json else {
        return Err(ProviderError::new(
            ProviderErrorKind::Decode,
            code,
            "response is not a JSON object",
        ));
    };

    if let Some(reported) = obj.get("as_of_date").and_then(Value::as_str) {
        if reported != as_of_date.to_string() {
            return Err(ProviderError::new(
                ProviderErrorKind::Decode,
                code,
                format!("provider as_of_date mismatch: expected {as_of_date}, got {reported}"),
            ));
        }
    }

    let mut record = RawMetricRecord::new("external_http_json", code, as_of_date);
    record.name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| Some(symbol.name.clone()));
    match obj.get("fields") {
        Some(fields @ Value::Object(_)) => record.merge_object(fields),
        _ => record.merge_object(&raw_json),
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 27).unwrap()
    }

    #[test]
    fn parses_nested_fields_shape() {
        let body = json!({
            "as_of_date": as_of(),
            "name": "Samsung",
            "fields": {"per": 12.3, "pbr": "1.1", "sector": "전기·전자"}
        })
        .to_string();

        let rec = parse_metrics_body(&body, &SymbolRef::new("005930", "삼성전자"), as_of()).unwrap();
        assert_eq!(rec.name.as_deref(), Some("Samsung"));
        assert_eq!(rec.fields.get("per"), Some(&json!(12.3)));
        assert!(rec.fields.get("name").is_none());
    }

    #[test]
    fn parses_flat_shape_and_falls_back_to_caller_name() {
        let body = json!({"PER": "7.5", "PBR": "0.6"}).to_string();
        let rec = parse_metrics_body(&body, &SymbolRef::new("000660", "SK하이닉스"), as_of()).unwrap();
        assert_eq!(rec.name.as_deref(), Some("SK하이닉스"));
        assert_eq!(rec.fields.get("PER"), Some(&json!("7.5")));
    }

    #[test]
    fn rejects_date_mismatch_and_garbage() {
        let body = json!({"as_of_date": "2026-01-26", "per": 1.0}).to_string();
        let err = parse_metrics_body(&body, &SymbolRef::new("1", "x"), as_of()).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Decode);
        assert!(!err.is_transient());

        let err = parse_metrics_body("<html>", &SymbolRef::new("1", "x"), as_of()).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Decode);

        let err = parse_metrics_body("[1,2]", &SymbolRef::new("1", "x"), as_of()).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Decode);
    }
}
