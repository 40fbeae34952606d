pub mod failure_memo;
pub mod fetch;
pub mod rate_limiter;

pub use failure_memo::{FailureMemo, FailureMemoConfig};
pub use fetch::{ConcurrencyMode, FetchConfig, FetchOutcome, FetchPipeline};
pub use rate_limiter::{RateLimitConfig, SharedRateLimiter, TokenBucket};
