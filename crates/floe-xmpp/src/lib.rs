//! # floe-xmpp
//!
//! A minimal, self-contained XMPP client core built directly on a raw byte
//! stream: the RFC 6120 client handshake (stream header, SASL PLAIN,
//! resource binding), stanza framing and typed encode/decode, an ordered
//! inbound event dispatcher, and XEP-0045 group chat membership.
//!
//! ## Architecture
//!
//! - **Transport seam**: [`transport::TransportConnector`] yields owned
//!   reader/writer halves; TLS or WebSocket variants plug in there.
//! - **Codec**: [`parser::XmlParser`] frames the inbound stream
//!   incrementally; [`stanza::Stanza`] is the typed, immutable stanza form.
//! - **State machine**: one [`XmppClient`] owns one connection with the
//!   lifecycle Disconnected -> Connecting -> Connected -> Authenticating ->
//!   Authenticated, falling to Failed on error.
//! - **Dispatch**: a single loop per connection delivers inbound messages
//!   to one blocking waiter and any number of listeners, in arrival order.
//!
//! Every operation returns a [`ClientError`] value on failure; the core
//! never panics on protocol input and never manipulates the caller's task
//! as an error side channel.

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod muc;
pub mod parser;
pub mod stanza;
pub mod transport;

mod connection;
mod error;
mod types;

pub use auth::Credentials;
pub use client::XmppClient;
pub use dispatch::{Event, EventKind, EventListener};
pub use error::{ClientError, RoomJoinCondition};
pub use muc::RoomMembership;
pub use parser::{ns, StreamFeatures, StreamHeader};
pub use stanza::Stanza;
pub use types::{ConnectionConfig, ConnectionState};
