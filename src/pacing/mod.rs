pub mod call_class;
pub mod manager;
pub mod state;

pub use call_class::{CallClass, resource_key};
pub use manager::{PaceManager, PaceStats};
pub use state::{PaceLimits, RateLimitState};
