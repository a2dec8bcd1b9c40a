//! Common types for the XMPP client core.

use serde::{Deserialize, Serialize};

/// Connection state in the client session lifecycle.
///
/// Transitions move forward through `connect`/`login` and fall back to
/// `Failed` on error or `Disconnected` on `disconnect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; the initial and terminal state
    Disconnected,
    /// Transport connection attempt in progress
    Connecting,
    /// Transport up, stream header exchanged, not yet authenticated
    Connected,
    /// SASL exchange in progress
    Authenticating,
    /// Authenticated and resource-bound; the session is usable
    Authenticated,
    /// A fatal error ended the session; only `disconnect()` is valid
    Failed,
}

impl ConnectionState {
    /// Whether the session has completed authentication.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnectionState::Authenticated)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Transport endpoint supplied by the caller at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server hostname (also used as the stream `to` domain)
    pub host: String,
    /// Server port
    pub port: u16,
}

impl ConnectionConfig {
    /// Create a new connection config.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}
