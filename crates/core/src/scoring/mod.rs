pub mod composite;
pub mod percentile;
pub mod quality;
pub mod regime;
pub mod risk;
pub mod valuation;

pub use composite::{rank, CompositeConfig, ScoreSubject, MAX_SCORE};
pub use percentile::{blended_percentile, percentile, BlendConfig, BlendedPercentile, PercentileError};
pub use quality::{criteria_for, SectorCriteria};
pub use regime::{RegimeCache, RegimeConfig, RegimeParameters};
pub use risk::{assess_risk, RiskConfig};
pub use valuation::{margin_of_safety, Valuation, ValuationConfig};
