use std::fmt;
use std::time::Duration;

use super::identity::ConnectionIdentity;

// -----------------------------------------------------------------------------
// ----- Endpoint --------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4002,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// -----------------------------------------------------------------------------
// ----- GatewaySession --------------------------------------------------------

/// One physical session to the gateway.
///
/// Implementations are not expected to be thread-safe: a session is created,
/// used and torn down on a single worker thread. `is_connected` is only
/// advisory; after a host sleep/wake it can report `true` while the transport
/// is dead, which is what `probe` is for.
pub trait GatewaySession {
    fn connect(
        &mut self,
        endpoint: &Endpoint,
        identity: ConnectionIdentity,
        timeout: Duration,
    ) -> Result<(), SessionError>;

    /// Must be safe to call whatever `is_connected` says.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Trivial round trip (e.g. asking the gateway for its clock).
    fn probe(&mut self, timeout: Duration) -> Result<(), SessionError>;
}

/// Builds sessions. Called on the worker thread that will own the session.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: GatewaySession + 'static;

    fn create(&self, identity: ConnectionIdentity) -> Self::Session;
}

// -----------------------------------------------------------------------------
// ----- SessionError ----------------------------------------------------------

/// Failure reported by a session. Gateway-reported errors carry the
/// gateway's numeric code; transport failures don't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub code: Option<i32>,
    pub message: String,
}

impl SessionError {
    /// Code used for classification when the gateway gave none.
    pub const NO_CODE: i32 = -1;

    pub fn gateway(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn code_or_default(&self) -> i32 {
        self.code.unwrap_or(Self::NO_CODE)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "gateway error {code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for SessionError {}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
