pub mod context;
pub mod handle;
pub mod identity;
pub mod pool;
pub mod session;

mod envelope;
mod worker;

pub use context::GatewayContext;
pub use handle::{ConnectionHandle, HandleConfig, HandleState, HandleStats, StopReason};
pub use identity::{ConnectionIdentity, IdentityAllocator};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use session::{Endpoint, GatewaySession, SessionError, SessionFactory};

// Everything that owns a gateway session lives here; callers only see handles.
