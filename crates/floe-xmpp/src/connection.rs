//! Connection state machine and RFC 6120 client handshake.
//!
//! A `Connection` owns exactly one transport (reader/writer halves). During
//! `connect`/`login` the reader is driven sequentially under the control
//! lock; once the session is authenticated the reader moves into the
//! dispatch loop and only serialized writes remain on this side.

use std::sync::{Arc, Mutex};

use jid::FullJid;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::{self, Credentials};
use crate::dispatch::{run_dispatch_loop, Dispatcher};
use crate::error::ClientError;
use crate::muc::RoomRegistry;
use crate::parser::{ns, StreamFeatures, StreamHeader, StreamItem, XmlParser};
use crate::stanza::Stanza;
use crate::transport::{TransportConnector, TransportReader, TransportWriter};
use crate::types::{ConnectionConfig, ConnectionState};

/// Inbound machinery used sequentially during the handshake. The reader
/// and parser move into the dispatch loop at login completion.
struct ControlIo {
    reader: Option<Box<dyn TransportReader>>,
    parser: XmlParser,
    features: Option<StreamFeatures>,
}

impl ControlIo {
    fn empty() -> Self {
        Self {
            reader: None,
            parser: XmlParser::new(),
            features: None,
        }
    }
}

/// A single logical XMPP connection and its state machine.
pub(crate) struct Connection {
    connector: Arc<dyn TransportConnector>,
    state: Arc<Mutex<ConnectionState>>,
    config: Mutex<Option<ConnectionConfig>>,
    jid: Mutex<Option<FullJid>>,
    control: AsyncMutex<ControlIo>,
    writer: AsyncMutex<Option<Box<dyn TransportWriter>>>,
    dispatcher: Arc<Dispatcher>,
    rooms: Arc<RoomRegistry>,
    shutdown: Mutex<CancellationToken>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create a disconnected connection using the given transport
    /// collaborator.
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            connector,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            config: Mutex::new(None),
            jid: Mutex::new(None),
            control: AsyncMutex::new(ControlIo::empty()),
            writer: AsyncMutex::new(None),
            dispatcher: Arc::new(Dispatcher::new()),
            rooms: Arc::new(RoomRegistry::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            dispatch_task: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// Record a failure without clobbering a concurrent `disconnect()`.
    fn fail_unless_disconnected(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != ConnectionState::Disconnected {
            *state = ConnectionState::Failed;
        }
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .clone()
    }

    /// The bound full JID, available once authenticated.
    pub fn jid(&self) -> Option<FullJid> {
        self.jid.lock().expect("jid lock poisoned").clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Fail with [`ClientError::NotAuthenticated`] unless the session is
    /// usable.
    pub fn require_authenticated(&self) -> Result<(), ClientError> {
        let state = self.state();
        if state.is_authenticated() {
            Ok(())
        } else {
            Err(ClientError::NotAuthenticated { state })
        }
    }

    /// Open the transport and exchange stream headers.
    ///
    /// Disconnected -> Connecting -> Connected; `Failed` on error with the
    /// error returned to the caller. No retries.
    #[instrument(name = "xmpp.connection.connect", skip(self, cancel), fields(host = %config.host, port = config.port))]
    pub async fn connect(
        &self,
        config: ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                other => {
                    return Err(ClientError::protocol(format!(
                        "connect is only valid when disconnected (state: {})",
                        other
                    )))
                }
            }
        }

        match self.open_stream(&config, cancel).await {
            Ok(()) => {
                *self.config.lock().expect("config lock poisoned") = Some(config);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "connect failed");
                self.fail_unless_disconnected();
                Err(error)
            }
        }
    }

    async fn open_stream(
        &self,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let (reader, writer) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ClientError::transport("connect cancelled by caller"));
            }
            connected = self.connector.connect(&config.host, config.port) => connected?,
        };

        *self.writer.lock().await = Some(writer);
        *self.shutdown.lock().expect("shutdown lock poisoned") = CancellationToken::new();

        let mut io = self.control.lock().await;
        io.reader = Some(reader);
        io.parser.reset();
        io.features = None;

        self.start_stream(&mut io, &config.host, cancel).await?;
        Ok(())
    }

    /// Send our stream header, then read the server header and its
    /// features. Used on initial connect and on the post-SASL restart.
    async fn start_stream(
        &self,
        io: &mut ControlIo,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamHeader, ClientError> {
        let header = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='{}' xmlns:stream='{}' to='{}' version='1.0'>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            domain
        );
        self.write_raw(header.as_bytes()).await?;

        loop {
            if io.parser.has_stream_header() {
                break;
            }
            self.fill_buffer(io, cancel).await?;
        }
        let server_header = io.parser.take_stream_header()?;
        debug!(
            id = ?server_header.id,
            from = ?server_header.from,
            "received server stream header"
        );

        let features = loop {
            match self.next_handshake_item(io, cancel).await? {
                StreamItem::Features(features) => break features,
                StreamItem::StreamError(condition) => {
                    return Err(ClientError::protocol(format!(
                        "stream error during negotiation: {}",
                        condition
                    )))
                }
                StreamItem::StreamEnd => {
                    return Err(ClientError::transport("stream closed during negotiation"))
                }
                other => {
                    debug!(item = ?other, "ignoring unexpected pre-feature item");
                }
            }
        };

        io.features = Some(features);
        Ok(server_header)
    }

    /// Authenticate with SASL PLAIN, restart the stream, and bind a
    /// resource. Connected -> Authenticating -> Authenticated.
    #[instrument(name = "xmpp.connection.login", skip(self, credentials, cancel))]
    pub async fn login(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<FullJid, ClientError> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                ConnectionState::Connected => *state = ConnectionState::Authenticating,
                other => {
                    return Err(ClientError::protocol(format!(
                        "login requires a connected session (state: {})",
                        other
                    )))
                }
            }
        }

        match self.authenticate(credentials, cancel).await {
            Ok(jid) => {
                *self.jid.lock().expect("jid lock poisoned") = Some(jid.clone());
                self.set_state(ConnectionState::Authenticated);
                self.spawn_dispatch().await;
                info!(jid = %jid, "session established");
                Ok(jid)
            }
            Err(error) => {
                warn!(error = %error, "login failed");
                self.fail_unless_disconnected();
                Err(error)
            }
        }
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<FullJid, ClientError> {
        let domain = self
            .config
            .lock()
            .expect("config lock poisoned")
            .as_ref()
            .map(|c| c.host.clone())
            .ok_or_else(|| ClientError::protocol("no connection configuration"))?;

        let mut io = self.control.lock().await;

        let features = io
            .features
            .clone()
            .ok_or_else(|| ClientError::protocol("no stream features received"))?;
        auth::require_plain(&features)?;

        self.write_raw(auth::plain_auth_xml(credentials).as_bytes())
            .await?;

        loop {
            match self.next_handshake_item(&mut io, cancel).await? {
                StreamItem::SaslSuccess => break,
                StreamItem::SaslFailure(condition) => {
                    return Err(ClientError::auth(condition));
                }
                StreamItem::StreamError(condition) => {
                    return Err(ClientError::protocol(format!(
                        "stream error during authentication: {}",
                        condition
                    )))
                }
                StreamItem::StreamEnd => {
                    return Err(ClientError::transport("stream closed during authentication"))
                }
                other => {
                    debug!(item = ?other, "ignoring unexpected item during SASL");
                }
            }
        }

        // RFC 6120 requires a stream restart after successful SASL
        self.start_stream(&mut io, &domain, cancel).await?;

        let jid = self.bind_resource(&mut io, cancel).await?;
        Ok(jid)
    }

    /// Request server-assigned resource binding and parse the bound JID.
    async fn bind_resource(
        &self,
        io: &mut ControlIo,
        cancel: &CancellationToken,
    ) -> Result<FullJid, ClientError> {
        if !io.features.as_ref().map(|f| f.bind).unwrap_or(false) {
            return Err(ClientError::protocol(
                "server does not offer resource binding",
            ));
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = format!(
            "<iq type='set' id='{}'><bind xmlns='{}'/></iq>",
            request_id,
            ns::BIND
        );
        self.write_raw(request.as_bytes()).await?;

        loop {
            match self.next_handshake_item(io, cancel).await? {
                StreamItem::Stanza(element) if element.name() == "iq" => {
                    if element.attr("id") != Some(request_id.as_str()) {
                        debug!("ignoring unrelated iq during bind");
                        continue;
                    }
                    if element.attr("type") != Some("result") {
                        return Err(ClientError::protocol("resource binding rejected"));
                    }

                    let jid_text = element
                        .get_child("bind", ns::BIND)
                        .and_then(|bind| bind.get_child("jid", ns::BIND))
                        .map(|jid| jid.text())
                        .ok_or_else(|| {
                            ClientError::protocol("bind result carries no JID")
                        })?;

                    let jid: FullJid = jid_text.trim().parse().map_err(|e| {
                        ClientError::protocol(format!("invalid bound JID '{}': {}", jid_text, e))
                    })?;

                    debug!(jid = %jid, "resource bound");
                    return Ok(jid);
                }
                StreamItem::StreamError(condition) => {
                    return Err(ClientError::protocol(format!(
                        "stream error during binding: {}",
                        condition
                    )))
                }
                StreamItem::StreamEnd => {
                    return Err(ClientError::transport("stream closed during binding"))
                }
                other => {
                    debug!(item = ?other, "ignoring unexpected item during bind");
                }
            }
        }
    }

    /// Hand the reader and any buffered bytes to the dispatch loop.
    async fn spawn_dispatch(&self) {
        let mut io = self.control.lock().await;
        let Some(reader) = io.reader.take() else {
            return;
        };
        let parser = std::mem::take(&mut io.parser);
        drop(io);

        let token = self.shutdown_token();
        let task = tokio::spawn(run_dispatch_loop(
            reader,
            parser,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.rooms),
            Arc::clone(&self.state),
            token,
        ));
        *self
            .dispatch_task
            .lock()
            .expect("dispatch task lock poisoned") = Some(task);
    }

    /// Read transport bytes into the handshake parser.
    async fn fill_buffer(
        &self,
        io: &mut ControlIo,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let shutdown = self.shutdown_token();
        let reader = io
            .reader
            .as_mut()
            .ok_or_else(|| ClientError::protocol("no transport attached"))?;

        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ClientError::transport("operation cancelled by caller"));
            }
            _ = shutdown.cancelled() => {
                return Err(ClientError::Disconnected);
            }
            chunk = reader.recv() => chunk?,
        };

        match chunk {
            Some(bytes) => {
                io.parser.feed(&bytes);
                Ok(())
            }
            None => Err(ClientError::transport("connection closed during handshake")),
        }
    }

    /// Next framed item during the handshake.
    async fn next_handshake_item(
        &self,
        io: &mut ControlIo,
        cancel: &CancellationToken,
    ) -> Result<StreamItem, ClientError> {
        loop {
            match io.parser.next_item() {
                Ok(Some(item)) => return Ok(item),
                Ok(None) => self.fill_buffer(io, cancel).await?,
                // Handshake elements must parse; this is not a droppable stanza
                Err(error) => {
                    return Err(ClientError::protocol(format!(
                        "malformed handshake element: {}",
                        error
                    )))
                }
            }
        }
    }

    /// Encode and send one stanza. Requires an authenticated session; the
    /// whole stanza is written under the writer lock, so concurrent sends
    /// never interleave bytes.
    pub async fn send_stanza(&self, stanza: &Stanza) -> Result<(), ClientError> {
        self.require_authenticated()?;
        let bytes = stanza.to_bytes()?;
        self.write_raw(&bytes).await
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::Disconnected)?;
        writer.send(bytes).await
    }

    /// Tear the connection down. Valid from any state and idempotent:
    /// every step tolerates already-released resources.
    #[instrument(name = "xmpp.connection.disconnect", skip(self))]
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let previous = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let previous = *state;
            *state = ConnectionState::Disconnected;
            previous
        };

        self.shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .cancel();

        let task = self
            .dispatch_task
            .lock()
            .expect("dispatch task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // Best-effort goodbye; the peer may already be gone
            let _ = writer.send(b"</stream:stream>").await;
            let _ = writer.close().await;
        }

        let mut io = self.control.lock().await;
        io.reader = None;
        io.parser.reset();
        io.features = None;
        drop(io);

        self.dispatcher.close();
        self.rooms.close();
        self.jid.lock().expect("jid lock poisoned").take();

        if previous != ConnectionState::Disconnected {
            info!("connection closed");
        }
        Ok(())
    }
}
