pub mod clock;
pub mod kr_market;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
