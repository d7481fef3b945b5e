pub mod cli;
pub mod config;
pub mod types;

pub use cli::{CliConfig, Command};
pub use config::{ConfigError, GatewayConfig};
pub use types::LogLevel;
