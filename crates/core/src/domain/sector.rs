use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical sector identifier. Vendor labels of every shape collapse onto this
/// closed set through [`normalize_sector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorKey {
    Semiconductors,
    Electronics,
    Software,
    Telecom,
    Media,
    Banks,
    Insurance,
    Securities,
    Chemicals,
    Materials,
    Construction,
    Machinery,
    Automobiles,
    Retail,
    FoodBeverage,
    Textiles,
    Pharma,
    Utilities,
    Transportation,
    Services,
    Other,
}

impl SectorKey {
    pub const ALL: [SectorKey; 21] = [
        SectorKey::Semiconductors,
        SectorKey::Electronics,
        SectorKey::Software,
        SectorKey::Telecom,
        SectorKey::Media,
        SectorKey::Banks,
        SectorKey::Insurance,
        SectorKey::Securities,
        SectorKey::Chemicals,
        SectorKey::Materials,
        SectorKey::Construction,
        SectorKey::Machinery,
        SectorKey::Automobiles,
        SectorKey::Retail,
        SectorKey::FoodBeverage,
        SectorKey::Textiles,
        SectorKey::Pharma,
        SectorKey::Utilities,
        SectorKey::Transportation,
        SectorKey::Services,
        SectorKey::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectorKey::Semiconductors => "semiconductors",
            SectorKey::Electronics => "electronics",
            SectorKey::Software => "software",
            SectorKey::Telecom => "telecom",
            SectorKey::Media => "media",
            SectorKey::Banks => "banks",
            SectorKey::Insurance => "insurance",
            SectorKey::Securities => "securities",
            SectorKey::Chemicals => "chemicals",
            SectorKey::Materials => "materials",
            SectorKey::Construction => "construction",
            SectorKey::Machinery => "machinery",
            SectorKey::Automobiles => "automobiles",
            SectorKey::Retail => "retail",
            SectorKey::FoodBeverage => "food_beverage",
            SectorKey::Textiles => "textiles",
            SectorKey::Pharma => "pharma",
            SectorKey::Utilities => "utilities",
            SectorKey::Transportation => "transportation",
            SectorKey::Services => "services",
            SectorKey::Other => "other",
        }
    }

    /// Balance-sheet leverage is the business model here, so debt and
    /// current-ratio screens do not apply.
    pub fn is_financial(&self) -> bool {
        matches!(
            self,
            SectorKey::Banks | SectorKey::Insurance | SectorKey::Securities
        )
    }
}

impl fmt::Display for SectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectorKey {
    type Err = anyhow::Error;

    /// Strict parse of the canonical name (as stored in the database).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SectorKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown sector key: {s}"))
    }
}

// Exact aliases after folding (lowercase, separators removed).
const EXACT_ALIASES: &[(&str, SectorKey)] = &[
    ("반도체", SectorKey::Semiconductors),
    ("semiconductor", SectorKey::Semiconductors),
    ("semiconductors", SectorKey::Semiconductors),
    ("전기전자", SectorKey::Electronics),
    ("전자장비", SectorKey::Electronics),
    ("ithardware", SectorKey::Electronics),
    ("electronics", SectorKey::Electronics),
    ("it서비스", SectorKey::Software),
    ("소프트웨어", SectorKey::Software),
    ("software", SectorKey::Software),
    ("통신업", SectorKey::Telecom),
    ("통신", SectorKey::Telecom),
    ("telecom", SectorKey::Telecom),
    ("telecommunications", SectorKey::Telecom),
    ("방송서비스", SectorKey::Media),
    ("오락문화", SectorKey::Media),
    ("media", SectorKey::Media),
    ("은행", SectorKey::Banks),
    ("banks", SectorKey::Banks),
    ("bank", SectorKey::Banks),
    ("보험", SectorKey::Insurance),
    ("보험업", SectorKey::Insurance),
    ("insurance", SectorKey::Insurance),
    ("증권", SectorKey::Securities),
    ("securities", SectorKey::Securities),
    ("brokerage", SectorKey::Securities),
    ("화학", SectorKey::Chemicals),
    ("chemicals", SectorKey::Chemicals),
    ("철강금속", SectorKey::Materials),
    ("금속", SectorKey::Materials),
    ("비금속광물", SectorKey::Materials),
    ("종이목재", SectorKey::Materials),
    ("materials", SectorKey::Materials),
    ("건설업", SectorKey::Construction),
    ("건설", SectorKey::Construction),
    ("construction", SectorKey::Construction),
    ("기계", SectorKey::Machinery),
    ("기계장비", SectorKey::Machinery),
    ("machinery", SectorKey::Machinery),
    ("운수장비", SectorKey::Automobiles),
    ("운송장비부품", SectorKey::Automobiles),
    ("자동차", SectorKey::Automobiles),
    ("automobiles", SectorKey::Automobiles),
    ("유통업", SectorKey::Retail),
    ("유통", SectorKey::Retail),
    ("retail", SectorKey::Retail),
    ("음식료품", SectorKey::FoodBeverage),
    ("음식료담배", SectorKey::FoodBeverage),
    ("foodbeverage", SectorKey::FoodBeverage),
    ("섬유의복", SectorKey::Textiles),
    ("섬유의류", SectorKey::Textiles),
    ("textiles", SectorKey::Textiles),
    ("의약품", SectorKey::Pharma),
    ("제약", SectorKey::Pharma),
    ("의료정밀", SectorKey::Pharma),
    ("의료정밀기기", SectorKey::Pharma),
    ("pharma", SectorKey::Pharma),
    ("healthcare", SectorKey::Pharma),
    ("전기가스업", SectorKey::Utilities),
    ("전기가스", SectorKey::Utilities),
    ("utilities", SectorKey::Utilities),
    ("운수창고업", SectorKey::Transportation),
    ("운송창고", SectorKey::Transportation),
    ("transportation", SectorKey::Transportation),
    ("서비스업", SectorKey::Services),
    ("일반서비스", SectorKey::Services),
    ("services", SectorKey::Services),
];

// Substring fallbacks, checked in order. More specific keywords come first.
const KEYWORD_ALIASES: &[(&str, SectorKey)] = &[
    ("반도체", SectorKey::Semiconductors),
    ("semicon", SectorKey::Semiconductors),
    ("은행", SectorKey::Banks),
    ("bank", SectorKey::Banks),
    ("보험", SectorKey::Insurance),
    ("증권", SectorKey::Securities),
    ("바이오", SectorKey::Pharma),
    ("제약", SectorKey::Pharma),
    ("pharm", SectorKey::Pharma),
    ("소프트", SectorKey::Software),
    ("software", SectorKey::Software),
    ("통신", SectorKey::Telecom),
    ("화학", SectorKey::Chemicals),
    ("chemical", SectorKey::Chemicals),
    ("철강", SectorKey::Materials),
    ("steel", SectorKey::Materials),
    ("건설", SectorKey::Construction),
    ("자동차", SectorKey::Automobiles),
    ("auto", SectorKey::Automobiles),
    ("조선", SectorKey::Automobiles),
    ("기계", SectorKey::Machinery),
    ("전자", SectorKey::Electronics),
    ("전기가스", SectorKey::Utilities),
    ("에너지", SectorKey::Utilities),
    ("유통", SectorKey::Retail),
    ("음식", SectorKey::FoodBeverage),
    ("food", SectorKey::FoodBeverage),
    ("섬유", SectorKey::Textiles),
    ("운수", SectorKey::Transportation),
    ("운송", SectorKey::Transportation),
    ("서비스", SectorKey::Services),
];

fn fold_label(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '·' | '/' | '-' | '_' | '&' | '.' | ','))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Maps a raw vendor label onto the canonical sector set. Pure and
/// deterministic; unknown or empty labels map to [`SectorKey::Other`].
pub fn normalize_sector(raw: &str) -> SectorKey {
    let folded = fold_label(raw);
    if folded.is_empty() {
        return SectorKey::Other;
    }

    if let Ok(key) = folded.parse::<SectorKey>() {
        return key;
    }

    if let Some((_, key)) = EXACT_ALIASES.iter().find(|(alias, _)| *alias == folded) {
        return *key;
    }

    KEYWORD_ALIASES
        .iter()
        .find(|(kw, _)| folded.contains(kw))
        .map(|(_, key)| *key)
        .unwrap_or(SectorKey::Other)
}
