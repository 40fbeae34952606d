pub mod adapter;
pub mod error;
pub mod kis;
pub mod provider;
pub mod types;

pub use adapter::normalize_record;
pub use error::{ProviderError, ProviderErrorKind};
pub use provider::{HttpJsonDataProvider, MetricsProvider};
pub use types::{RawMetricRecord, SymbolRef};

#[cfg(test)]
pub(crate) mod testing;
