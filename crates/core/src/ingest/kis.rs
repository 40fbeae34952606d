use crate::config::{env_parse, Settings};
use crate::ingest::error::{ProviderError, ProviderErrorKind};
use crate::ingest::provider::MetricsProvider;
use crate::ingest::types::{RawMetricRecord, SymbolRef};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const PROD_BASE_URL: &str = "https://openapi.koreainvestment.com:9443";

const PRICE_PATH: &str = "/uapi/domestic-stock/v1/quotations/inquire-price";
const PRICE_TR_ID: &str = "FHKST01010100";
const FINANCIAL_RATIO_PATH: &str = "/uapi/domestic-stock/v1/finance/financial-ratio";
const FINANCIAL_RATIO_TR_ID: &str = "FHKST66430300";
const STABILITY_RATIO_PATH: &str = "/uapi/domestic-stock/v1/finance/stability-ratio";
const STABILITY_RATIO_TR_ID: &str = "FHKST66430600";

// Gateway message codes.
const MSG_RATE_EXCEEDED: &str = "EGW00201";
const MSG_TOKEN_EXPIRED: &str = "EGW00123";

/// Korea Investment & Securities Open API client.
///
/// Each `fetch_metrics` call issues three quotation requests (price, financial
/// ratio, stability ratio) and merges their outputs into one raw record.
#[derive(Debug)]
pub struct KisClient {
    http: reqwest::Client,
    base_url: String,
    appkey: String,
    appsecret: String,

    // Token reused for the whole process run; issuance is rate limited by KIS.
    token_cache: tokio::sync::Mutex<Option<CachedToken>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: KisToken,
    fetched_at: DateTime<Utc>,
}

impl KisClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let (appkey, appsecret) = settings.require_kis_credentials()?;
        let base_url = settings
            .kis_base_url
            .clone()
            .unwrap_or_else(|| PROD_BASE_URL.to_string());
        let timeout_secs = env_parse::<u64>("KIS_TIMEOUT_SECS").unwrap_or(30);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build KIS http client")?;

        Ok(Self {
            http,
            base_url,
            appkey: appkey.to_string(),
            appsecret: appsecret.to_string(),
            token_cache: tokio::sync::Mutex::new(None),
        })
    }

    async fn access_token(&self, symbol: &str) -> Result<String, ProviderError> {
        let mut guard = self.token_cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if !cached.token.is_expired_or_stale(cached.fetched_at, Utc::now()) {
                return Ok(cached.token.access_token.clone());
            }
        }

        let fetched_at = Utc::now();
        let token = self.issue_access_token(symbol).await?;
        let access = token.access_token.clone();
        *guard = Some(CachedToken { token, fetched_at });
        Ok(access)
    }

    async fn invalidate_token(&self) {
        *self.token_cache.lock().await = None;
    }

    async fn issue_access_token(&self, symbol: &str) -> Result<KisToken, ProviderError> {
        let url = format!("{}/oauth2/tokenP", self.base_url.trim_end_matches('/'));
        let req = KisTokenRequest {
            grant_type: "client_credentials",
            appkey: &self.appkey,
            appsecret: &self.appsecret,
        };

        let res = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, symbol))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, symbol))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status, symbol, &text));
        }

        serde_json::from_str::<KisToken>(&text).map_err(|e| {
            ProviderError::new(ProviderErrorKind::Decode, symbol, format!("token response: {e}"))
        })
    }

    fn headers(&self, token: &str, tr_id: &'static str, symbol: &str) -> Result<HeaderMap, ProviderError> {
        let bad_header = |e: reqwest::header::InvalidHeaderValue| {
            ProviderError::new(ProviderErrorKind::Client(0), symbol, format!("invalid header: {e}"))
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(bad_header)?,
        );
        headers.insert("appkey", HeaderValue::from_str(&self.appkey).map_err(bad_header)?);
        headers.insert("appsecret", HeaderValue::from_str(&self.appsecret).map_err(bad_header)?);
        headers.insert("tr_id", HeaderValue::from_static(tr_id));
        headers.insert("custtype", HeaderValue::from_static("P"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn get_output(
        &self,
        token: &str,
        path: &str,
        tr_id: &'static str,
        params: &[(&str, &str)],
        symbol: &str,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let res = self
            .http
            .get(url)
            .headers(self.headers(token, tr_id, symbol)?)
            .query(params)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, symbol))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, symbol))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status, symbol, &text));
        }

        let body = serde_json::from_str::<KisEnvelope>(&text).map_err(|e| {
            ProviderError::new(ProviderErrorKind::Decode, symbol, format!("{tr_id} response: {e}"))
        })?;
        body.into_output(symbol)
    }
}

#[async_trait::async_trait]
impl MetricsProvider for KisClient {
    fn provider_name(&self) -> &'static str {
        "kis"
    }

    fn calls_per_fetch(&self) -> u32 {
        3
    }

    async fn fetch_metrics(
        &self,
        symbol: &SymbolRef,
        as_of_date: NaiveDate,
    ) -> Result<RawMetricRecord, ProviderError> {
        let code = symbol.symbol.as_str();
        let token = self.access_token(code).await?;

        let price_params = [("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", code)];
        // Annual statements (FID_DIV_CLS_CODE=0).
        let ratio_params = [
            ("FID_DIV_CLS_CODE", "0"),
            ("fid_cond_mrkt_div_code", "J"),
            ("fid_input_iscd", code),
        ];

        let calls = async {
            let price = self
                .get_output(&token, PRICE_PATH, PRICE_TR_ID, &price_params, code)
                .await?;
            let ratios = self
                .get_output(&token, FINANCIAL_RATIO_PATH, FINANCIAL_RATIO_TR_ID, &ratio_params, code)
                .await?;
            let stability = self
                .get_output(&token, STABILITY_RATIO_PATH, STABILITY_RATIO_TR_ID, &ratio_params, code)
                .await?;
            Ok::<_, ProviderError>((price, ratios, stability))
        };

        let (price, ratios, stability) = match calls.await {
            Ok(v) => v,
            Err(err) => {
                if err.detail.contains(MSG_TOKEN_EXPIRED) {
                    self.invalidate_token().await;
                }
                return Err(err);
            }
        };

        let mut record = RawMetricRecord::new(self.provider_name(), code, as_of_date);
        record.name = Some(symbol.name.clone());
        record.merge_object(&price);
        record.merge_object(latest_period(&ratios));
        record.merge_object(latest_period(&stability));
        Ok(record)
    }
}

static NO_ROWS: Value = Value::Null;

/// Statement endpoints return one row per fiscal period, most recent first.
fn latest_period(output: &Value) -> &Value {
    match output {
        Value::Array(rows) => rows.first().unwrap_or(&NO_ROWS),
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct KisEnvelope {
    #[serde(default)]
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output: Value,
}

impl KisEnvelope {
    fn into_output(self, symbol: &str) -> Result<Value, ProviderError> {
        if self.rt_cd.trim() == "0" {
            return Ok(self.output);
        }
        let kind = match self.msg_cd.trim() {
            MSG_RATE_EXCEEDED => ProviderErrorKind::RateLimited,
            // The retry re-issues the token after invalidation.
            MSG_TOKEN_EXPIRED => ProviderErrorKind::Connection,
            _ => ProviderErrorKind::Client(200),
        };
        Err(ProviderError::new(
            kind,
            symbol,
            format!("{} {}", self.msg_cd.trim(), self.msg1.trim()),
        ))
    }
}

#[derive(Debug, Serialize)]
struct KisTokenRequest<'a> {
    grant_type: &'a str,
    appkey: &'a str,
    appsecret: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KisToken {
    pub access_token: String,
    #[serde(default)]
    pub access_token_token_expired: String,
    #[serde(default)]
    pub expires_in: u64,
}

impl KisToken {
    fn is_expired_or_stale(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::minutes(2);
        if let Some(exp) = parse_kis_expiry_utc(&self.access_token_token_expired) {
            return now + margin >= exp;
        }
        if self.expires_in > 0 {
            let exp = fetched_at + chrono::Duration::seconds(self.expires_in as i64);
            return now + margin >= exp;
        }
        true
    }
}

/// KIS reports expiry as `YYYY-MM-DD HH:MM:SS` in KST.
fn parse_kis_expiry_utc(s: &str) -> Option<DateTime<Utc>> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let naive = chrono::NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S").ok()?;
    let kst = chrono::FixedOffset::east_opt(9 * 3600)?;
    let dt = kst.from_local_datetime(&naive).single()?;
    Some(dt.with_timezone(&Utc))
}
