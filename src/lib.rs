pub mod admin;
pub mod cancellation;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod pacing;

pub use cancellation::{CancellationCoordinator, CancellationToken};
pub use classifier::{ErrorCategory, ErrorClassifier, ErrorInfo};
pub use config::GatewayConfig;
pub use errors::GatewayError;
pub use gateway::{
    ConnectionHandle, ConnectionPool, GatewayContext, GatewaySession, SessionError, SessionFactory,
};
pub use pacing::{CallClass, PaceManager};
