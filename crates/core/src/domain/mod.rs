pub mod distribution;
pub mod sample;
pub mod score;
pub mod sector;

pub use distribution::{DistributionScope, GlobalDistribution, SectorDistribution};
pub use sample::{Metric, MetricSample, RiskFlags};
pub use score::{Recommendation, ScoreResult, Verdict};
pub use sector::{normalize_sector, SectorKey};
