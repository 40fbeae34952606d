use anyhow::Context;
use chrono::NaiveDate;
use std::collections::HashSet;
use valuesieve_core::ingest::SymbolRef;

/// Where the symbol list comes from, in priority order.
#[derive(Debug, Clone, Default)]
pub struct UniverseSource {
    pub symbols: Option<String>,
    pub symbols_file: Option<std::path::PathBuf>,
}

pub async fn load_universe(
    source: &UniverseSource,
    pool: Option<&sqlx::PgPool>,
    as_of_date: NaiveDate,
) -> anyhow::Result<Vec<SymbolRef>> {
    let raw = if let Some(list) = source.symbols.as_deref() {
        parse_symbol_list(list)
    } else if let Some(path) = source.symbols_file.as_deref() {
        let contents = std::fs::read_to_string(path).with_context(|| format!("read symbols file {} failed", path.display()))?;
        parse_symbols_file(&contents)
    } else {
        let pool = pool.context("no --symbols/--symbols-file given and no database to read a universe from")?;
        let (date, samples) = valuesieve_core::storage::metric_snapshots::load_latest_snapshot(pool, as_of_date)
            .await?
            .with_context(|| format!("no metric snapshot at or before {as_of_date} to take a universe from"))?;
        tracing::info!(%date, symbols = samples.len(), "universe taken from stored snapshot");
        samples
            .into_iter()
            .map(|s| SymbolRef::new(s.symbol, s.name))
            .collect()
    };

    let out = finalize(raw);
    anyhow::ensure!(!out.is_empty(), "universe is empty after filtering");
    Ok(out)
}

/// `005930:삼성전자,000660` → symbol refs. A missing name falls back to the
/// symbol.
pub fn parse_symbol_list(s: &str) -> Vec<SymbolRef> {
    s.split(',').filter_map(parse_entry).collect()
}

/// One symbol per line, optionally followed by `,`, tab or `:` and a name.
/// Blank lines and `#` comments are ignored.
pub fn parse_symbols_file(contents: &str) -> Vec<SymbolRef> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> Option<SymbolRef> {
    let entry = entry.trim();
    let (symbol, name) = match entry.split_once([',', '\t', ':']) {
        Some((s, n)) => (s.trim(), n.trim()),
        None => (entry, ""),
    };
    if symbol.is_empty() {
        return None;
    }
    let name = if name.is_empty() { symbol } else { name };
    Some(SymbolRef::new(symbol, name))
}

/// Drops ETF/ETN products and duplicate symbols; output is sorted by symbol.
fn finalize(raw: Vec<SymbolRef>) -> Vec<SymbolRef> {
    let total = raw.len();
    let mut seen = HashSet::new();
    let mut out: Vec<SymbolRef> = raw
        .into_iter()
        .filter(|s| !is_etf_or_etn_name(&s.name))
        .filter(|s| seen.insert(s.symbol.clone()))
        .collect();
    out.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    if out.len() < total {
        tracing::info!(
            total,
            kept = out.len(),
            "dropped ETF/ETN products and duplicates from universe"
        );
    }
    out
}

// Issuer brands that prefix Korean ETF/ETN product names.
const FUND_BRANDS: &[&str] = &[
    "KODEX", "TIGER", "KOSEF", "KBSTAR", "ARIRANG", "HANARO", "SOL", "ACE", "TIMEFOLIO", "PLUS",
    "1Q", "RISE", "TREX", "KINDEX", "FOCUS", "WOORI", "BNK", "마이다스",
];

pub fn is_etf_or_etn_name(name: &str) -> bool {
    let s = name.trim();
    if s.is_empty() {
        return false;
    }

    let upper = s.to_uppercase();
    if upper
        .split(|c: char| !c.is_alphanumeric())
        .any(|tok| tok == "ETF" || tok == "ETN")
    {
        return true;
    }

    // Brand must be the leading word so company names like "SOLUS" survive.
    let first = upper.split_whitespace().next().unwrap_or_default();
    FUND_BRANDS.iter().any(|b| first == *b)
}
