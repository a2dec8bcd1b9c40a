//! SASL PLAIN authentication for the client handshake.
//!
//! Only the PLAIN initial response is produced here; mechanism negotiation
//! beyond checking the server's offer, and any stronger mechanisms, are out
//! of scope for this core.

use base64::prelude::*;

use crate::error::ClientError;
use crate::parser::{ns, StreamFeatures};

/// Login credentials. Immutable once supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Local part of the JID
    pub username: String,
    /// Account password
    pub password: String,
}

impl Credentials {
    /// Create new credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Encode the SASL PLAIN initial response: base64 of
    /// `authzid NUL authcid NUL password` with an empty authzid.
    pub fn to_sasl_plain(&self) -> String {
        let mut raw = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        raw.push(0);
        raw.extend_from_slice(self.username.as_bytes());
        raw.push(0);
        raw.extend_from_slice(self.password.as_bytes());
        BASE64_STANDARD.encode(raw)
    }
}

/// Build the `<auth/>` element for a PLAIN exchange.
pub fn plain_auth_xml(credentials: &Credentials) -> String {
    format!(
        "<auth xmlns='{}' mechanism='PLAIN'>{}</auth>",
        ns::SASL,
        credentials.to_sasl_plain()
    )
}

/// Check that the server's advertised mechanisms include PLAIN.
pub fn require_plain(features: &StreamFeatures) -> Result<(), ClientError> {
    if features.offers_plain() {
        Ok(())
    } else {
        Err(ClientError::auth(format!(
            "server does not offer PLAIN (offered: {:?})",
            features.mechanisms
        )))
    }
}
