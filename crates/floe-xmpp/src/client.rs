//! Public session facade.
//!
//! `XmppClient` composes the connection state machine, the stanza codec,
//! event dispatch, and room membership into the operation surface callers
//! use. Preconditions are checked here and every failure comes back as a
//! [`ClientError`] value.

use std::sync::Arc;

use jid::{BareJid, FullJid, Jid};
use tokio_util::sync::CancellationToken;

use crate::auth::Credentials;
use crate::connection::Connection;
use crate::dispatch::{Event, EventListener};
use crate::error::ClientError;
use crate::muc::RoomMembership;
use crate::stanza;
use crate::transport::{TcpConnector, TransportConnector};
use crate::types::{ConnectionConfig, ConnectionState};

/// A single-connection XMPP client.
///
/// All methods take `&self`; lifecycle ordering is enforced by the
/// connection state machine, and outbound writes are serialized
/// internally, so the client can be shared across tasks.
pub struct XmppClient {
    connection: Connection,
}

impl XmppClient {
    /// Create a client that connects over plain TCP.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(TcpConnector))
    }

    /// Create a client with a custom transport collaborator (TLS,
    /// WebSocket, in-memory test transport).
    pub fn with_connector(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            connection: Connection::new(connector),
        }
    }

    /// Open the transport and exchange stream headers with the server.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.connection
            .connect(ConnectionConfig::new(host, port), cancel)
            .await
    }

    /// Authenticate and bind a resource; returns the bound full JID.
    pub async fn login(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<FullJid, ClientError> {
        self.connection.login(credentials, cancel).await
    }

    /// Send a point-to-point message (type `normal`).
    pub async fn send_direct_message(&self, to: &str, body: &str) -> Result<(), ClientError> {
        self.connection.require_authenticated()?;
        let to: Jid = to
            .parse()
            .map_err(|e| ClientError::protocol(format!("invalid recipient JID '{}': {}", to, e)))?;
        self.connection
            .send_stanza(&stanza::direct_message(to, body))
            .await
    }

    /// Join a chat room under the given nickname.
    ///
    /// Suspends until the server confirms the join or rejects it. Joining
    /// a room this client already occupies returns the existing
    /// membership without another exchange.
    pub async fn join_room(
        &self,
        room: &str,
        nickname: &str,
        cancel: &CancellationToken,
    ) -> Result<RoomMembership, ClientError> {
        self.connection.require_authenticated()?;
        let room = parse_room(room)?;

        if let Some(existing) = self.connection.rooms().membership(&room) {
            if existing.joined {
                return Ok(existing);
            }
        }

        let occupant = room.with_resource_str(nickname).map_err(|e| {
            ClientError::protocol(format!("invalid nickname '{}': {}", nickname, e))
        })?;

        let pending = self
            .connection
            .rooms()
            .begin_join(room.clone(), nickname.to_string())?;

        if let Err(error) = self
            .connection
            .send_stanza(&stanza::join_presence(&occupant))
            .await
        {
            self.connection.rooms().abort_join(&room);
            return Err(error);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.connection.rooms().abort_join(&room);
                Err(ClientError::transport("room join cancelled by caller"))
            }
            outcome = pending => match outcome {
                Ok(result) => result,
                Err(_) => Err(ClientError::Disconnected),
            },
        }
    }

    /// Leave a chat room. Idempotent: leaving a room that is not joined
    /// is a no-op.
    pub async fn leave_room(&self, room: &str) -> Result<(), ClientError> {
        self.connection.require_authenticated()?;
        let room = parse_room(room)?;

        let Some(membership) = self.connection.rooms().remove(&room) else {
            return Ok(());
        };

        let occupant = room.with_resource_str(&membership.nickname).map_err(|e| {
            ClientError::protocol(format!("invalid nickname '{}': {}", membership.nickname, e))
        })?;
        self.connection
            .send_stanza(&stanza::leave_presence(&occupant))
            .await
    }

    /// Send a groupchat message to a joined room.
    pub async fn send_group_message(&self, room: &str, body: &str) -> Result<(), ClientError> {
        self.connection.require_authenticated()?;
        let room = parse_room(room)?;

        if !self.connection.rooms().is_joined(&room) {
            return Err(ClientError::NotJoined { room });
        }

        self.connection
            .send_stanza(&stanza::group_message(&room, body))
            .await
    }

    /// Wait for the next inbound message event.
    ///
    /// At most one caller may wait at a time; a concurrent second call
    /// fails with [`ClientError::ConcurrentWait`]. Disconnection wakes the
    /// waiter with [`ClientError::Disconnected`].
    pub async fn next_event(&self) -> Result<Event, ClientError> {
        self.connection.require_authenticated()?;
        let pending = self.connection.dispatcher().reserve_waiter()?;
        match pending.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    /// Register a callback invoked for every inbound message event.
    /// Every listener sees every event (fan-out), in arrival order.
    pub fn register_listener(&self, listener: impl EventListener) {
        self.connection.dispatcher().register(Box::new(listener));
    }

    /// Close the connection. Valid in any state and idempotent.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.connection.disconnect().await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The bound full JID, once authenticated.
    pub fn jid(&self) -> Option<FullJid> {
        self.connection.jid()
    }

    /// Rooms this client currently occupies.
    pub fn joined_rooms(&self) -> Vec<RoomMembership> {
        self.connection.rooms().joined_rooms()
    }
}

impl Default for XmppClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_room(room: &str) -> Result<BareJid, ClientError> {
    room.parse()
        .map_err(|e| ClientError::protocol(format!("invalid room JID '{}': {}", room, e)))
}
