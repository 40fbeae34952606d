use crate::config::parse_label_thresholds;
use crate::domain::score::{ComponentScores, Recommendation, ScoreResult, Verdict};
use crate::domain::sector::SectorKey;
use crate::scoring::quality::{QUALITY_MAX, SECTOR_BONUS_MAX};
use chrono::{DateTime, NaiveDate, Utc};
use std::cmp::Ordering;

pub const VALUATION_SUB_MAX: f64 = 20.0;
pub const MOS_MAX: f64 = 30.0;
/// 3 × 20 valuation + 43 quality + 10 bonus + 30 margin of safety.
pub const MAX_SCORE: f64 = 3.0 * VALUATION_SUB_MAX + QUALITY_MAX + SECTOR_BONUS_MAX + MOS_MAX;

const LOWEST_GRADE: &str = "F";

#[derive(Debug, Clone)]
pub struct CompositeConfig {
    /// `(grade, min fraction of max)`, highest first.
    pub grades: Vec<(String, f64)>,
    pub recommendations: Vec<(Recommendation, f64)>,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            grades: [("A+", 0.80), ("A", 0.70), ("B+", 0.60), ("B", 0.50), ("C", 0.40), ("D", 0.30)]
                .into_iter()
                .map(|(g, t)| (g.to_string(), t))
                .collect(),
            recommendations: vec![
                (Recommendation::StrongBuy, 0.70),
                (Recommendation::Buy, 0.55),
                (Recommendation::Hold, 0.40),
                (Recommendation::Caution, 0.25),
            ],
        }
    }
}

impl CompositeConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Ok(raw) = std::env::var("GRADE_THRESHOLDS") {
            match parse_label_thresholds(&raw) {
                Some(grades) => out.grades = grades,
                None => tracing::warn!(value = %raw, "invalid GRADE_THRESHOLDS; using defaults"),
            }
        }
        if let Ok(raw) = std::env::var("RECOMMENDATION_THRESHOLDS") {
            let parsed = parse_label_thresholds(&raw).and_then(|pairs| {
                pairs
                    .into_iter()
                    .map(|(label, t)| Recommendation::parse(&label).map(|r| (r, t)))
                    .collect::<Option<Vec<_>>>()
            });
            match parsed {
                Some(recs) => out.recommendations = recs,
                None => tracing::warn!(value = %raw, "invalid RECOMMENDATION_THRESHOLDS; using defaults"),
            }
        }
        out.normalize();
        out
    }

    fn normalize(&mut self) {
        self.grades
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        self.recommendations
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    }

    pub fn grade_for(&self, fraction: f64) -> String {
        self.grades
            .iter()
            .find(|(_, t)| fraction >= *t)
            .map(|(g, _)| g.clone())
            .unwrap_or_else(|| LOWEST_GRADE.to_string())
    }

    pub fn recommendation_for(&self, fraction: f64) -> Recommendation {
        self.recommendations
            .iter()
            .find(|(_, t)| fraction >= *t)
            .map(|(r, _)| *r)
            .unwrap_or(Recommendation::worst())
    }
}

/// Header fields shared by every outcome.
#[derive(Debug, Clone)]
pub struct ScoreSubject {
    pub symbol: String,
    pub name: String,
    pub sector: SectorKey,
    pub as_of_date: NaiveDate,
    pub scored_at: DateTime<Utc>,
}

impl ScoreSubject {
    fn into_result(
        self,
        components: ComponentScores,
        total_score: f64,
        grade: String,
        recommendation: Recommendation,
        verdict: Verdict,
        notes: Vec<String>,
    ) -> ScoreResult {
        ScoreResult {
            symbol: self.symbol,
            name: self.name,
            sector: self.sector,
            as_of_date: self.as_of_date,
            components,
            total_score,
            max_score: MAX_SCORE,
            grade,
            recommendation,
            verdict,
            rank: None,
            notes,
            scored_at: self.scored_at,
        }
    }
}

/// Sums the components (clamped to `[0, MAX_SCORE]`) and maps the share of
/// the maximum onto grade and recommendation.
pub fn compose(
    subject: ScoreSubject,
    components: ComponentScores,
    notes: Vec<String>,
    config: &CompositeConfig,
) -> ScoreResult {
    let total = components.sum().clamp(0.0, MAX_SCORE);
    let fraction = total / MAX_SCORE;
    let grade = config.grade_for(fraction);
    let recommendation = config.recommendation_for(fraction);
    subject.into_result(components, total, grade, recommendation, Verdict::Scored, notes)
}

/// Zero score with the worst tier.
pub fn rejected(subject: ScoreSubject, reason: String, notes: Vec<String>) -> ScoreResult {
    subject.into_result(
        ComponentScores::default(),
        0.0,
        LOWEST_GRADE.to_string(),
        Recommendation::worst(),
        Verdict::Rejected { reason },
        notes,
    )
}

pub fn severe_risk(
    subject: ScoreSubject,
    flag: &str,
    risk_penalty: f64,
    notes: Vec<String>,
) -> ScoreResult {
    let components = ComponentScores {
        risk_penalty,
        ..ComponentScores::default()
    };
    subject.into_result(
        components,
        0.0,
        LOWEST_GRADE.to_string(),
        Recommendation::worst(),
        Verdict::SevereRisk {
            flag: flag.to_string(),
        },
        notes,
    )
}

/// Total desc, then margin of safety desc, then symbol asc. Ranks start at 1.
pub fn rank(results: &mut [ScoreResult]) {
    results.sort_by(|a, b| {
        b.total_score
            .total_cmp(&a.total_score)
            .then_with(|| {
                b.components
                    .margin_of_safety
                    .total_cmp(&a.components.margin_of_safety)
            })
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = Some(i as u32 + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::score::ValuationSubScores;
    use chrono::TimeZone;

    fn subject(symbol: &str) -> ScoreSubject {
        ScoreSubject {
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            sector: SectorKey::Retail,
            as_of_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            scored_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        }
    }

    fn components(total_ish: f64, mos: f64) -> ComponentScores {
        ComponentScores {
            valuation: ValuationSubScores {
                per: 0.0,
                pbr: 0.0,
                roe: 0.0,
            },
            quality: total_ish - mos,
            sector_bonus: 0.0,
            margin_of_safety: mos,
            risk_penalty: 0.0,
        }
    }

    #[test]
    fn max_score_is_143() {
        assert_eq!(MAX_SCORE, 143.0);
    }

    #[test]
    fn grades_follow_thresholds() {
        let cfg = CompositeConfig::default();
        assert_eq!(cfg.grade_for(0.85), "A+");
        assert_eq!(cfg.grade_for(0.80), "A+");
        assert_eq!(cfg.grade_for(0.79), "A");
        assert_eq!(cfg.grade_for(0.45), "C");
        assert_eq!(cfg.grade_for(0.10), "F");
        assert_eq!(cfg.recommendation_for(0.72), Recommendation::StrongBuy);
        assert_eq!(cfg.recommendation_for(0.41), Recommendation::Hold);
        assert_eq!(cfg.recommendation_for(0.05), Recommendation::Avoid);
    }

    #[test]
    fn custom_thresholds_are_respected() {
        let mut cfg = CompositeConfig {
            grades: vec![("Low".into(), 0.1), ("Top".into(), 0.9)],
            recommendations: vec![(Recommendation::Buy, 0.5)],
        };
        cfg.normalize();
        assert_eq!(cfg.grade_for(0.95), "Top");
        assert_eq!(cfg.grade_for(0.5), "Low");
        assert_eq!(cfg.recommendation_for(0.6), Recommendation::Buy);
        assert_eq!(cfg.recommendation_for(0.4), Recommendation::Avoid);
    }

    #[test]
    fn compose_clamps_and_grades() {
        let cfg = CompositeConfig::default();
        let mut c = components(20.0, 5.0);
        c.risk_penalty = -60.0;
        let r = compose(subject("X"), c, vec![], &cfg);
        assert_eq!(r.total_score, 0.0);
        assert_eq!(r.recommendation, Recommendation::Avoid);

        let r = compose(subject("Y"), components(0.75 * MAX_SCORE, 10.0), vec![], &cfg);
        assert_eq!(r.grade, "A");
        assert_eq!(r.recommendation, Recommendation::StrongBuy);
        assert_eq!(r.verdict, Verdict::Scored);
    }

    #[test]
    fn ranking_is_deterministic() {
        let cfg = CompositeConfig::default();
        let mut results = vec![
            compose(subject("C"), components(50.0, 10.0), vec![], &cfg),
            compose(subject("A"), components(50.0, 10.0), vec![], &cfg),
            compose(subject("B"), components(50.0, 20.0), vec![], &cfg),
            compose(subject("D"), components(70.0, 0.0), vec![], &cfg),
            rejected(subject("E"), "debt".into(), vec![]),
        ];
        rank(&mut results);
        let order: Vec<String> = results.iter().map(|r| r.symbol.clone()).collect();
        assert_eq!(order, vec!["D", "B", "A", "C", "E"]);
        assert_eq!(results[0].rank, Some(1));
        assert_eq!(results[4].rank, Some(5));

        results.reverse();
        rank(&mut results);
        let again: Vec<String> = results.iter().map(|r| r.symbol.clone()).collect();
        assert_eq!(again, order);
    }

    #[test]
    fn severe_risk_forces_worst_tier() {
        let r = severe_risk(subject("Z"), "trading_halt", -40.0, vec![]);
        assert_eq!(r.total_score, 0.0);
        assert_eq!(r.recommendation, Recommendation::Avoid);
        assert_eq!(r.components.risk_penalty, -40.0);
        assert!(matches!(r.verdict, Verdict::SevereRisk { .. }));
    }
}
