//! Test utilities for driving the client against a scripted server.
//!
//! The mock transport plays the server side of the stream in-memory: each
//! script step matches a substring of an outbound write and, when it
//! matches, queues the server's response bytes for the client to read.
//! Everything the client writes is captured for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use floe_xmpp::transport::{TransportConnector, TransportReader, TransportWriter};
use floe_xmpp::{ClientError, Credentials, XmppClient};

pub const TEST_DOMAIN: &str = "example.com";
pub const TEST_JID: &str = "alice@example.com/floe";
pub const TEST_ROOM: &str = "chill@muc.example.com";
pub const TEST_NICK: &str = "flurry";

/// What the server does when a script step matches.
pub enum ScriptAction {
    /// Queue these bytes verbatim
    Respond(Vec<String>),
    /// Answer a resource-bind request, echoing the client's request id
    ReflectBind { jid: String },
}

/// One step of the server script: when an outbound write contains
/// `expect`, the action runs and the step is consumed.
pub struct ScriptStep {
    pub expect: &'static str,
    pub action: ScriptAction,
}

impl ScriptStep {
    pub fn respond(expect: &'static str, responses: Vec<String>) -> Self {
        Self {
            expect,
            action: ScriptAction::Respond(responses),
        }
    }

    pub fn reflect_bind(jid: &str) -> Self {
        Self {
            expect: "<bind",
            action: ScriptAction::ReflectBind {
                jid: jid.to_string(),
            },
        }
    }
}

enum Inbound {
    Data(Vec<u8>),
    Eof,
}

struct Shared {
    writes: Mutex<Vec<Vec<u8>>>,
    script: Mutex<VecDeque<ScriptStep>>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

/// Handle kept by the test to inspect writes and inject inbound data.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

#[allow(dead_code)] // each integration test binary uses a subset
impl MockHandle {
    /// Everything the client has written, one entry per transport write.
    pub fn writes(&self) -> Vec<String> {
        self.shared
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|w| String::from_utf8_lossy(w).to_string())
            .collect()
    }

    /// Writes containing the given substring.
    pub fn writes_containing(&self, needle: &str) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|w| w.contains(needle))
            .collect()
    }

    /// Queue raw server bytes for the client to read.
    pub fn inject(&self, xml: &str) {
        let _ = self
            .shared
            .inbound
            .send(Inbound::Data(xml.as_bytes().to_vec()));
    }

    /// Append a step to the server script.
    pub fn push_step(&self, step: ScriptStep) {
        self.shared.script.lock().unwrap().push_back(step);
    }

    /// Simulate the server dropping the connection.
    pub fn close(&self) {
        let _ = self.shared.inbound.send(Inbound::Eof);
    }
}

/// Transport connector backed by the scripted mock. Supports a single
/// connection per instance.
pub struct MockConnector {
    shared: Arc<Shared>,
    reader_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl MockConnector {
    pub fn with_script(script: Vec<ScriptStep>) -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            writes: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            inbound: tx,
        });
        let handle = MockHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                reader_rx: Mutex::new(Some(rx)),
            },
            handle,
        )
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), ClientError> {
        let rx = self
            .reader_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ClientError::transport("mock transport already connected"))?;

        Ok((
            Box::new(MockReader { rx }),
            Box::new(MockWriter {
                shared: Arc::clone(&self.shared),
            }),
        ))
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl std::fmt::Debug for MockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockReader").finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportReader for MockReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        match self.rx.recv().await {
            Some(Inbound::Data(bytes)) => Ok(Some(bytes)),
            Some(Inbound::Eof) | None => Ok(None),
        }
    }
}

struct MockWriter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MockWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWriter").finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportWriter for MockWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.shared.writes.lock().unwrap().push(data.to_vec());

        let written = String::from_utf8_lossy(data).to_string();
        let step = {
            let mut script = self.shared.script.lock().unwrap();
            match script.front() {
                Some(step) if written.contains(step.expect) => script.pop_front(),
                _ => None,
            }
        };

        if let Some(step) = step {
            let responses = match step.action {
                ScriptAction::Respond(responses) => responses,
                ScriptAction::ReflectBind { jid } => {
                    let id = extract_attr(&written, "id").unwrap_or_else(|| "bind-1".to_string());
                    vec![bind_result(&id, &jid)]
                }
            };
            for response in responses {
                let _ = self
                    .shared
                    .inbound
                    .send(Inbound::Data(response.into_bytes()));
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Server stream header for a (re)started stream.
pub fn server_header(id: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' id='{id}' \
         from='{TEST_DOMAIN}' version='1.0'>"
    )
}

pub fn features_sasl_plain() -> String {
    "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
     <mechanism>PLAIN</mechanism></mechanisms></stream:features>"
        .to_string()
}

pub fn features_bind() -> String {
    "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>"
        .to_string()
}

pub fn sasl_success() -> String {
    "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>".to_string()
}

#[allow(dead_code)]
pub fn sasl_failure(condition: &str) -> String {
    format!("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><{condition}/></failure>")
}

pub fn bind_result(request_id: &str, jid: &str) -> String {
    format!(
        "<iq type='result' id='{request_id}'>\
         <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>{jid}</jid></bind></iq>"
    )
}

/// MUC self-presence confirming a join (status code 110).
pub fn muc_self_presence(room: &str, nick: &str) -> String {
    format!(
        "<presence from='{room}/{nick}'>\
         <x xmlns='http://jabber.org/protocol/muc#user'>\
         <item affiliation='member' role='participant'/>\
         <status code='110'/></x></presence>"
    )
}

/// MUC error presence rejecting a join.
#[allow(dead_code)]
pub fn muc_join_error(room: &str, nick: &str, condition: &str) -> String {
    format!(
        "<presence from='{room}/{nick}' type='error'>\
         <error type='cancel'>\
         <{condition} xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></presence>"
    )
}

/// The script for a successful connect + login exchange.
pub fn login_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::respond(
            "<stream:stream",
            vec![server_header("s1"), features_sasl_plain()],
        ),
        ScriptStep::respond("<auth ", vec![sasl_success()]),
        ScriptStep::respond("<stream:stream", vec![server_header("s2"), features_bind()]),
        ScriptStep::reflect_bind(TEST_JID),
    ]
}

/// Extract an attribute value from captured XML.
pub fn extract_attr(xml: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{name}={quote}");
        if let Some(start) = xml.find(&pattern) {
            let rest = &xml[start + pattern.len()..];
            if let Some(end) = rest.find(quote) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

/// Build a connected, logged-in client plus its mock handle.
#[allow(dead_code)]
pub async fn logged_in_client() -> (XmppClient, MockHandle, CancellationToken) {
    let (connector, handle) = MockConnector::with_script(login_script());
    let client = XmppClient::with_connector(Arc::new(connector));
    let cancel = CancellationToken::new();

    client
        .connect(TEST_DOMAIN, 5222, &cancel)
        .await
        .expect("connect should succeed");
    client
        .login(&Credentials::new("alice", "secret"), &cancel)
        .await
        .expect("login should succeed");

    (client, handle, cancel)
}

/// Join the standard test room on an already logged-in client. The mock
/// reflects the join presence with a status-110 self-presence.
#[allow(dead_code)]
pub async fn join_test_room(client: &XmppClient, handle: &MockHandle, cancel: &CancellationToken) {
    handle.push_step(ScriptStep::respond(
        "http://jabber.org/protocol/muc",
        vec![muc_self_presence(TEST_ROOM, TEST_NICK)],
    ));

    client
        .join_room(TEST_ROOM, TEST_NICK, cancel)
        .await
        .expect("join should succeed");
}
