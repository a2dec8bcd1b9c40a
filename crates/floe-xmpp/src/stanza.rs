//! Typed stanza encoding and decoding.
//!
//! Stanzas are immutable value objects once decoded. Decoding is pure: it
//! never blocks and never touches connection state.

use minidom::Element;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::{Body, Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use jid::{BareJid, FullJid, Jid};

use crate::error::ClientError;
use crate::parser::{self, ns};

/// A decoded protocol stanza.
///
/// Unknown top-level elements decode into [`Stanza::Unknown`] rather than
/// failing, so protocol extensions this core does not understand pass
/// through harmlessly.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    /// `<message/>`
    Message(Box<Message>),
    /// `<presence/>`
    Presence(Box<Presence>),
    /// `<iq/>`
    Iq(Box<Iq>),
    /// Any other top-level element
    Unknown(Element),
}

impl Stanza {
    /// Decode a stanza from raw bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, ClientError> {
        let xml = std::str::from_utf8(raw)
            .map_err(|e| ClientError::malformed(format!("invalid UTF-8 stanza bytes: {}", e)))?;
        if xml.trim().is_empty() {
            return Err(ClientError::malformed("stanza payload is empty"));
        }

        let element = parser::parse_fragment(xml)?;
        Self::from_element(element)
    }

    /// Decode a stanza from an already-framed element.
    pub fn from_element(element: Element) -> Result<Self, ClientError> {
        match element.name() {
            "message" => Message::try_from(element)
                .map(|message| Stanza::Message(Box::new(message)))
                .map_err(|e| {
                    ClientError::malformed(format!("failed to parse <message/> stanza: {}", e))
                }),
            "presence" => Presence::try_from(element)
                .map(|presence| Stanza::Presence(Box::new(presence)))
                .map_err(|e| {
                    ClientError::malformed(format!("failed to parse <presence/> stanza: {}", e))
                }),
            "iq" => Iq::try_from(element)
                .map(|iq| Stanza::Iq(Box::new(iq)))
                .map_err(|e| ClientError::malformed(format!("failed to parse <iq/> stanza: {}", e))),
            _ => Ok(Stanza::Unknown(element)),
        }
    }

    /// Encode the stanza to bytes: one well-formed element, deterministic
    /// for a given value.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClientError> {
        let element = self.to_element();
        let mut payload = Vec::new();
        element.write_to(&mut payload).map_err(|e| {
            ClientError::malformed(format!("failed to serialize <{}/> stanza: {}", self.name(), e))
        })?;
        Ok(payload)
    }

    /// The stanza as a minidom element.
    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => (**message).clone().into(),
            Stanza::Presence(presence) => (**presence).clone().into(),
            Stanza::Iq(iq) => (**iq).clone().into(),
            Stanza::Unknown(element) => element.clone(),
        }
    }

    /// The stanza element name, for routing and tracing.
    pub fn name(&self) -> &str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
            Stanza::Unknown(element) => element.name(),
        }
    }
}

/// Build a point-to-point message stanza (type `normal`).
pub fn direct_message(to: Jid, body: &str) -> Stanza {
    let mut message = Message::new(Some(to));
    message.id = Some(uuid::Uuid::new_v4().to_string());
    message.type_ = MessageType::Normal;
    message
        .bodies
        .insert(String::new(), Body(body.to_string()));
    Stanza::Message(Box::new(message))
}

/// Build a groupchat message stanza addressed to the room's bare JID.
pub fn group_message(room: &BareJid, body: &str) -> Stanza {
    let mut message = Message::new(Some(Jid::from(room.clone())));
    message.id = Some(uuid::Uuid::new_v4().to_string());
    message.type_ = MessageType::Groupchat;
    message
        .bodies
        .insert(String::new(), Body(body.to_string()));
    Stanza::Message(Box::new(message))
}

/// Build a MUC join presence: available presence to `room/nick` carrying
/// the `<x xmlns='http://jabber.org/protocol/muc'/>` join marker.
pub fn join_presence(occupant: &FullJid) -> Stanza {
    let mut presence = Presence::new(PresenceType::None);
    presence.to = Some(Jid::from(occupant.clone()));
    presence
        .payloads
        .push(Element::builder("x", ns::MUC).build());
    Stanza::Presence(Box::new(presence))
}

/// Build a MUC leave presence: unavailable presence to `room/nick`.
pub fn leave_presence(occupant: &FullJid) -> Stanza {
    let mut presence = Presence::new(PresenceType::Unavailable);
    presence.to = Some(Jid::from(occupant.clone()));
    Stanza::Presence(Box::new(presence))
}

/// The first body text of a message, if any.
pub fn message_body(message: &Message) -> Option<&str> {
    message.bodies.values().next().map(|body| body.0.as_str())
}
