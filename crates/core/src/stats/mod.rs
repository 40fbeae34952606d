pub mod aggregate;
pub mod repository;
pub mod store;

pub use aggregate::{aggregate, AggregatedStatistics};
pub use repository::{DistributionRepository, InMemoryDistributionRepository};
pub use store::{
    DistributionLookup, DistributionSource, RefreshReport, SectorStatisticsStore, StatsConfig,
};
