//! Provider payload normalization.
//!
//! Every vendor field name, numeric encoding and status code is interpreted
//! here and nowhere else. The rest of the crate only sees [`MetricSample`].

use crate::domain::sample::{AuditOpinion, MetricSample, RiskFlags};
use crate::domain::sector::normalize_sector;
use crate::ingest::types::RawMetricRecord;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// `(field name, multiplier)` pairs in priority order. The multiplier brings
/// the vendor's unit to the canonical one (percent for ratios, KRW for money).
type Aliases = &'static [(&'static str, f64)];

const PER: Aliases = &[
    ("per", 1.0),
    ("PER", 1.0),
    ("pe_ratio", 1.0),
    ("peRatio", 1.0),
    ("priceEarnings", 1.0),
];
const PBR: Aliases = &[
    ("pbr", 1.0),
    ("PBR", 1.0),
    ("pb_ratio", 1.0),
    ("pbRatio", 1.0),
    ("priceToBook", 1.0),
];
const ROE: Aliases = &[
    ("roe", 1.0),
    ("ROE", 1.0),
    ("roe_val", 1.0),
    ("return_on_equity_pct", 1.0),
    ("returnOnEquity", 100.0),
];
const PSR: Aliases = &[
    ("psr", 1.0),
    ("PSR", 1.0),
    ("ps_ratio", 1.0),
    ("priceToSales", 1.0),
];
const DEBT_RATIO: Aliases = &[
    ("debt_ratio", 1.0),
    ("lblt_rate", 1.0),
    ("debtRatio", 1.0),
    ("debtToEquity", 100.0),
];
const CURRENT_RATIO: Aliases = &[
    ("current_ratio", 1.0),
    ("crnt_rate", 1.0),
    ("currentRatio", 100.0),
];
const MARKET_CAP: Aliases = &[
    ("market_cap", 1.0),
    ("marketCap", 1.0),
    // KIS reports HTS market cap in units of 100 million KRW.
    ("hts_avls", 100_000_000.0),
];
const TRADING_VALUE: Aliases = &[
    ("trading_value", 1.0),
    ("acml_tr_pbmn", 1.0),
    ("tradingValue", 1.0),
    ("turnover", 1.0),
];
const PAYOUT_RATIO: Aliases = &[
    ("payout_ratio", 1.0),
    ("payoutRatio", 100.0),
    ("dvdn_pout_rate", 1.0),
];

const SECTOR_FIELDS: &[&str] = &["sector", "bstp_kor_isnm", "industry", "sector_name", "sectorName"];
const NAME_FIELDS: &[&str] = &["name", "hts_kor_isnm", "prdt_abrv_name", "company_name"];

// KIS `iscd_stat_cls_code` values.
const KIS_STATUS_ADMIN_ISSUE: &str = "51";
const KIS_STATUS_HALTED: &str = "58";

/// Builds the canonical sample for `raw`. `fallback_name` is used when the
/// payload carries no display name.
pub fn normalize_record(
    raw: &RawMetricRecord,
    fallback_name: &str,
    fetched_at: DateTime<Utc>,
) -> MetricSample {
    let f = &raw.fields;

    let sector_label = first_str(f, SECTOR_FIELDS).unwrap_or_default();
    let name = raw
        .name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| first_str(f, NAME_FIELDS))
        .unwrap_or_else(|| fallback_name.to_string());

    MetricSample {
        symbol: raw.symbol.trim().to_string(),
        name: name.trim().to_string(),
        sector: normalize_sector(&sector_label),
        sector_label,
        as_of_date: raw.as_of_date,
        fetched_at,
        per: first_num(f, PER),
        pbr: first_num(f, PBR),
        roe: first_num(f, ROE),
        psr: first_num(f, PSR).or_else(|| derived_psr(f)),
        debt_ratio: first_num(f, DEBT_RATIO),
        current_ratio: first_num(f, CURRENT_RATIO),
        market_cap: first_num(f, MARKET_CAP),
        trading_value: first_num(f, TRADING_VALUE),
        payout_ratio: first_num(f, PAYOUT_RATIO),
        flags: risk_flags(f),
    }
}

/// Price over sales-per-share when the vendor reports both but no PSR.
fn derived_psr(f: &Map<String, Value>) -> Option<f64> {
    let price = first_num(f, &[("stck_prpr", 1.0), ("price", 1.0)])?;
    let sps = first_num(f, &[("sps", 1.0), ("sales_per_share", 1.0)])?;
    (price > 0.0 && sps > 0.0).then(|| price / sps)
}

fn risk_flags(f: &Map<String, Value>) -> RiskFlags {
    let status = first_str(f, &["iscd_stat_cls_code"]).unwrap_or_default();

    let negative_ocf_years = first_num(f, &[("negative_ocf_years", 1.0), ("negativeOcfYears", 1.0)])
        .map(|v| v.clamp(0.0, u8::MAX as f64) as u8)
        .unwrap_or(0);

    RiskFlags {
        negative_ocf_years,
        audit_opinion: first_str(f, &["audit_opinion", "auditOpinion"])
            .map(|s| parse_audit_opinion(&s))
            .unwrap_or_default(),
        capital_impairment: first_flag(f, &["capital_impairment", "capitalImpairment"]),
        regulatory_watch: first_flag(f, &["regulatory_watch", "admin_issue"])
            || status == KIS_STATUS_ADMIN_ISSUE,
        disclosure_violation: first_flag(f, &["disclosure_violation", "unfaithful_disclosure"]),
        trading_halt: first_flag(f, &["trading_halt", "temp_stop_yn"]) || status == KIS_STATUS_HALTED,
    }
}

pub fn parse_audit_opinion(s: &str) -> AuditOpinion {
    let t = s.trim().to_lowercase();
    if t.contains("부적정") || t.contains("adverse") {
        AuditOpinion::Adverse
    } else if t.contains("의견거절") || t.contains("disclaimer") {
        AuditOpinion::Disclaimer
    } else if t.contains("한정") || (t.contains("qualified") && !t.contains("unqualified")) {
        AuditOpinion::Qualified
    } else {
        AuditOpinion::Unqualified
    }
}

/// Numbers arrive as JSON numbers or strings such as `"1,234.5"`, `"12.3%"`,
/// `"-"` or `""`. Placeholders yield `None`.
pub fn parse_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() || matches!(t, "-" | "N/A" | "n/a" | "null" | "NaN") {
                return None;
            }
            let cleaned: String = t.chars().filter(|c| *c != ',' && *c != '%').collect();
            cleaned.parse::<f64>().ok().filter(|x| x.is_finite())
        }
        _ => None,
    }
}

fn parse_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|x| x != 0),
        Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
            "Y" | "YES" | "TRUE" | "1" => Some(true),
            "N" | "NO" | "FALSE" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn first_num(f: &Map<String, Value>, aliases: Aliases) -> Option<f64> {
    aliases
        .iter()
        .find_map(|(key, scale)| f.get(*key).and_then(parse_number).map(|v| v * scale))
}

fn first_str(f: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match f.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn first_flag(f: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|key| f.get(*key).and_then(parse_flag))
        .unwrap_or(false)
}
