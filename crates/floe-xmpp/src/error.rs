//! Error types for the XMPP client core.

use jid::BareJid;
use thiserror::Error;

use crate::types::ConnectionState;

/// XMPP client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network failure. Fatal to the current connection; the core never
    /// retries on its own.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the supplied credentials. Fatal; the caller may
    /// retry with new credentials on a fresh connection.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed handshake data or an operation issued in a state where the
    /// protocol does not allow it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A stanza that could not be decoded. Inbound occurrences are dropped
    /// and logged; the connection survives.
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),

    /// Operation requires an authenticated connection.
    #[error("not authenticated (connection state: {state})")]
    NotAuthenticated {
        /// The state the connection was in when the operation was attempted
        state: ConnectionState,
    },

    /// Groupchat operation without a joined room membership.
    #[error("not joined to room {room}")]
    NotJoined {
        /// The room the operation targeted
        room: BareJid,
    },

    /// The server rejected a room join; no membership was created.
    #[error("failed to join room {room}: {condition}")]
    RoomJoin {
        /// The room that rejected the join
        room: BareJid,
        /// The rejection condition reported by the room
        condition: RoomJoinCondition,
    },

    /// A second blocking waiter was registered while one was outstanding.
    #[error("another call is already waiting for the next event")]
    ConcurrentWait,

    /// The connection was closed while the operation was pending.
    #[error("connection closed")]
    Disconnected,
}

impl ClientError {
    /// Create a new transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new malformed-stanza error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedStanza(msg.into())
    }

    /// Whether the error is fatal to the connection (as opposed to a
    /// per-operation failure the caller can correct and reissue).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Auth(_) | Self::Protocol(_) | Self::Disconnected
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(error: std::io::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

/// Room join rejection conditions (XEP-0045 §7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomJoinCondition {
    /// The requested nickname is already in use (`conflict`)
    NicknameConflict,
    /// The room has reached its occupant limit (`service-unavailable`)
    RoomFull,
    /// The user is banned from the room (`forbidden`)
    Banned,
    /// The room is members-only and the user is not on the member list
    /// (`registration-required`)
    MembersOnly,
    /// Any other condition element reported by the room
    Other(String),
}

impl RoomJoinCondition {
    /// Map an XMPP error condition element name to a join condition.
    pub fn from_condition_name(name: &str) -> Self {
        match name {
            "conflict" => Self::NicknameConflict,
            "service-unavailable" => Self::RoomFull,
            "forbidden" => Self::Banned,
            "registration-required" => Self::MembersOnly,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for RoomJoinCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NicknameConflict => write!(f, "nickname conflict"),
            Self::RoomFull => write!(f, "room full"),
            Self::Banned => write!(f, "banned"),
            Self::MembersOnly => write!(f, "members only"),
            Self::Other(condition) => write!(f, "{}", condition),
        }
    }
}
