//! Inbound event dispatch.
//!
//! One dispatch loop per connection consumes the framed inbound stream in
//! arrival order. Message stanzas become [`Event`]s delivered to the single
//! blocking waiter (if one is outstanding) and to every registered
//! listener - fan-out, nothing is stolen or duplicated. Presence stanzas
//! feed the room registry; everything else only updates internal state.
//!
//! Listeners run sequentially on the dispatch task, so a callback is never
//! re-entered and observes events in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use jid::{BareJid, Jid};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use xmpp_parsers::message::{Message, MessageType};

use crate::error::ClientError;
use crate::muc::RoomRegistry;
use crate::parser::{StreamItem, XmlParser};
use crate::stanza::{self, Stanza};
use crate::transport::TransportReader;
use crate::types::ConnectionState;

/// An inbound message delivered to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Sender of the message. For group messages this is the occupant JID
    /// (`room@domain/nick`).
    pub from: Option<Jid>,
    /// Message body text
    pub body: String,
    /// Whether this was a direct or a group message
    pub kind: EventKind,
}

/// Routing class of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Point-to-point message (normal/chat/headline)
    Direct,
    /// Groupchat message from a joined room
    Group(BareJid),
}

/// Consumer callback for inbound events.
///
/// Implemented for any `Fn(&Event)` closure. Invoked once per qualifying
/// inbound message, on the connection's dispatch task.
pub trait EventListener: Send + Sync + 'static {
    /// Handle one inbound event.
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Shared fan-out state: the listener set and the single waiter slot.
pub(crate) struct Dispatcher {
    listeners: Mutex<Vec<Box<dyn EventListener>>>,
    waiter: Mutex<Option<oneshot::Sender<Result<Event, ClientError>>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            waiter: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a callback listener. Listeners receive every qualifying
    /// event in registration order.
    pub fn register(&self, listener: Box<dyn EventListener>) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Reserve the blocking-waiter slot.
    ///
    /// Only one waiter may be outstanding; a waiter whose receiver was
    /// dropped (cancelled `next_event` call) does not count.
    pub fn reserve_waiter(
        &self,
    ) -> Result<oneshot::Receiver<Result<Event, ClientError>>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Disconnected);
        }

        let mut slot = self.waiter.lock().expect("waiter lock poisoned");
        if let Some(existing) = slot.as_ref() {
            if !existing.is_closed() {
                return Err(ClientError::ConcurrentWait);
            }
        }

        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(rx)
    }

    /// Deliver one event to the waiter (if any) and all listeners.
    pub fn deliver(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if let Some(waiter) = self.waiter.lock().expect("waiter lock poisoned").take() {
            let _ = waiter.send(Ok(event.clone()));
        }

        let listeners = self.listeners.lock().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
    }

    /// Close the dispatcher: wake a pending waiter with
    /// [`ClientError::Disconnected`] and refuse all further delivery.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(waiter) = self.waiter.lock().expect("waiter lock poisoned").take() {
            let _ = waiter.send(Err(ClientError::Disconnected));
        }
    }
}

/// Run the inbound dispatch loop until disconnect, EOF, or a fatal stream
/// error. Owns the transport reader and the framing parser.
pub(crate) async fn run_dispatch_loop(
    mut reader: Box<dyn TransportReader>,
    mut parser: XmlParser,
    dispatcher: Arc<Dispatcher>,
    rooms: Arc<RoomRegistry>,
    state: Arc<Mutex<ConnectionState>>,
    shutdown: CancellationToken,
) {
    let terminal = 'session: loop {
        // Drain everything already buffered before reading again
        loop {
            match parser.next_item() {
                Ok(Some(item)) => {
                    if let Some(terminal) = handle_item(item, &dispatcher, &rooms) {
                        break 'session terminal;
                    }
                }
                Ok(None) => break,
                // The offending frame was consumed; the stream survives
                Err(ClientError::MalformedStanza(error)) => {
                    warn!(error = %error, "dropping malformed inbound stanza")
                }
                // Unrecoverable framing (e.g. runaway element)
                Err(error) => {
                    warn!(error = %error, "inbound stream is unrecoverable");
                    break 'session ConnectionState::Failed;
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break 'session ConnectionState::Disconnected,
            chunk = reader.recv() => match chunk {
                Ok(Some(bytes)) => parser.feed(&bytes),
                Ok(None) => {
                    debug!("transport closed by peer");
                    break 'session ConnectionState::Failed;
                }
                Err(error) => {
                    warn!(error = %error, "transport read failed");
                    break 'session ConnectionState::Failed;
                }
            },
        }
    };

    let mut current = state.lock().expect("state lock poisoned");
    // A deliberate disconnect has already set the state; only record
    // failures the connection did not ask for.
    if !matches!(*current, ConnectionState::Disconnected) {
        *current = terminal;
    }
    drop(current);

    dispatcher.close();
    rooms.close();
}

/// Handle one framed item. Returns the terminal state when the stream is
/// over.
fn handle_item(
    item: StreamItem,
    dispatcher: &Dispatcher,
    rooms: &RoomRegistry,
) -> Option<ConnectionState> {
    match item {
        StreamItem::Stanza(element) => {
            match Stanza::from_element(element) {
                Ok(Stanza::Message(message)) => handle_message(*message, dispatcher, rooms),
                Ok(Stanza::Presence(presence)) => rooms.handle_presence(&presence),
                Ok(Stanza::Iq(iq)) => {
                    debug!(id = %iq.id, "ignoring inbound iq");
                }
                Ok(Stanza::Unknown(element)) => {
                    debug!(element = element.name(), "ignoring unknown stanza");
                }
                Err(error) => warn!(error = %error, "dropping malformed inbound stanza"),
            }
            None
        }
        StreamItem::StreamEnd => {
            debug!("peer closed the stream");
            Some(ConnectionState::Failed)
        }
        StreamItem::StreamError(condition) => {
            warn!(condition = %condition, "stream error from server");
            Some(ConnectionState::Failed)
        }
        // Handshake-phase items have no business mid-session
        StreamItem::Features(_) | StreamItem::SaslSuccess | StreamItem::SaslFailure(_) => {
            debug!("ignoring handshake item in established session");
            None
        }
    }
}

/// Route an inbound message stanza to consumers.
fn handle_message(message: Message, dispatcher: &Dispatcher, rooms: &RoomRegistry) {
    let Some(body) = stanza::message_body(&message) else {
        debug!("skipping message without body");
        return;
    };
    let body = body.to_string();

    let kind = match message.type_ {
        MessageType::Groupchat => {
            let Some(room) = message.from.as_ref().map(|j| j.to_bare()) else {
                debug!("skipping groupchat message without sender");
                return;
            };
            if !rooms.is_joined(&room) {
                warn!(room = %room, "dropping groupchat message from room we have not joined");
                return;
            }
            EventKind::Group(room)
        }
        MessageType::Error => {
            debug!("skipping error message");
            return;
        }
        MessageType::Chat | MessageType::Normal | MessageType::Headline => EventKind::Direct,
    };

    dispatcher.deliver(Event {
        from: message.from.clone(),
        body,
        kind,
    });
}
