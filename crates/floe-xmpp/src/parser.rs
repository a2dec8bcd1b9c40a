//! Incremental XML framing for the client side of an XMPP stream.
//!
//! XMPP uses a single long-lived XML document per session, so the inbound
//! byte stream has to be parsed incrementally: partial data is buffered
//! until a complete top-level element is available. The unclosed
//! `<stream:stream>` header and the stream-level SASL/feature elements are
//! handled here; complete stanza elements are handed to [`crate::stanza`]
//! for typed decoding.

use minidom::Element;

use crate::error::ClientError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// MUC join namespace
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    /// MUC user protocol namespace
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
}

/// Parsed stream header information (the server's response header).
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'id' attribute (stream ID assigned by the server)
    pub id: Option<String>,
    /// The 'from' attribute (server domain)
    pub from: Option<String>,
    /// The 'to' attribute
    pub to: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from the raw opening tag.
    ///
    /// Stream headers are intentionally incomplete XML (the closing tag
    /// arrives at session end), so attributes are extracted from the tag
    /// text directly.
    pub fn parse(tag: &str) -> Result<Self, ClientError> {
        if !tag.contains("<stream:stream") && !tag.contains("<stream ") {
            return Err(ClientError::protocol("no stream:stream element found"));
        }

        Ok(StreamHeader {
            id: extract_attribute(tag, "id"),
            from: extract_attribute(tag, "from"),
            to: extract_attribute(tag, "to"),
            version: extract_attribute(tag, "version"),
        })
    }

    /// Validate the stream header per RFC 6120.
    pub fn validate(&self) -> Result<(), ClientError> {
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(ClientError::protocol(format!(
                    "unsupported XMPP version: {}",
                    version
                )));
            }
        }
        Ok(())
    }
}

/// Stream features offered by the server after a (re)started stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// SASL mechanisms advertised in `<mechanisms>`
    pub mechanisms: Vec<String>,
    /// Whether resource binding is offered
    pub bind: bool,
}

impl StreamFeatures {
    /// Extract the features this client cares about from the raw
    /// `<stream:features>` element text.
    pub fn parse(xml: &str) -> Self {
        let mut mechanisms = Vec::new();
        let mut rest = xml;
        while let Some(start) = rest.find("<mechanism>") {
            let after = &rest[start + "<mechanism>".len()..];
            match after.find("</mechanism>") {
                Some(end) => {
                    mechanisms.push(after[..end].trim().to_string());
                    rest = &after[end..];
                }
                None => break,
            }
        }

        StreamFeatures {
            mechanisms,
            bind: xml.contains("<bind"),
        }
    }

    /// Whether the server offers the PLAIN SASL mechanism.
    pub fn offers_plain(&self) -> bool {
        self.mechanisms.iter().any(|m| m == "PLAIN")
    }
}

/// One framed item from the inbound stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// `<stream:features>` after a stream (re)start
    Features(StreamFeatures),
    /// SASL `<success/>`
    SaslSuccess,
    /// SASL `<failure>` with the child condition element name
    SaslFailure(String),
    /// A stream-level `<stream:error>` condition; fatal
    StreamError(String),
    /// A complete top-level stanza element
    Stanza(Element),
    /// `</stream:stream>` - the peer closed the stream
    StreamEnd,
}

/// Upper bound on bytes buffered without producing a complete element.
/// Past this the stream is unrecoverable (e.g. mismatched tags from a
/// broken peer) and framing reports a fatal protocol error.
const MAX_BUFFERED_BYTES: usize = 256 * 1024;

/// Incremental framing parser for the inbound XMPP byte stream.
///
/// Accumulates raw bytes and yields complete top-level elements. Only the
/// valid UTF-8 prefix of the buffer is ever scanned, so multi-byte
/// characters split across reads are handled correctly.
pub struct XmlParser {
    buffer: Vec<u8>,
}

impl XmlParser {
    /// Create a new framing parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
        }
    }

    /// Feed raw bytes into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The valid UTF-8 prefix of the buffer.
    fn valid_prefix(&self) -> &str {
        match std::str::from_utf8(&self.buffer) {
            Ok(s) => s,
            Err(e) => {
                // Safe: valid_up_to() is a proven UTF-8 boundary
                std::str::from_utf8(&self.buffer[..e.valid_up_to()]).unwrap_or("")
            }
        }
    }

    /// Check if a complete stream header opening tag is buffered.
    pub fn has_stream_header(&self) -> bool {
        let data = self.valid_prefix();
        match data.find("<stream:stream").or_else(|| data.find("<stream ")) {
            Some(start) => data[start..].contains('>'),
            None => false,
        }
    }

    /// Extract and consume the stream header (and any preceding XML
    /// declaration) from the buffer.
    pub fn take_stream_header(&mut self) -> Result<StreamHeader, ClientError> {
        let data = self.valid_prefix();
        let start = data
            .find("<stream:stream")
            .or_else(|| data.find("<stream "))
            .ok_or_else(|| ClientError::protocol("no stream:stream element found"))?;
        let end = data[start..]
            .find('>')
            .map(|i| start + i + 1)
            .ok_or_else(|| ClientError::protocol("incomplete stream header"))?;

        let header = StreamHeader::parse(&data[start..end])?;
        header.validate()?;
        self.buffer.drain(..end);
        Ok(header)
    }

    /// Parse and consume the next complete top-level item from the buffer.
    ///
    /// Returns `Ok(None)` when no complete element is buffered yet. A
    /// buffered element that fails parsing consumes its bytes and returns
    /// a [`ClientError::MalformedStanza`], so one bad stanza never wedges
    /// the stream; an element that never completes within
    /// [`MAX_BUFFERED_BYTES`] is a fatal [`ClientError::Protocol`].
    pub fn next_item(&mut self) -> Result<Option<StreamItem>, ClientError> {
        let data = self.valid_prefix();

        let skip = data.len() - data.trim_start().len();
        let trimmed = &data[skip..];

        if trimmed.is_empty() {
            return Ok(None);
        }

        // The peer closing its side of the stream
        if trimmed.starts_with("</") {
            return match trimmed.find('>') {
                Some(end) => {
                    self.buffer.drain(..skip + end + 1);
                    Ok(Some(StreamItem::StreamEnd))
                }
                None => Ok(None),
            };
        }

        let Some(frame_len) = scan_complete_element(trimmed) else {
            if self.buffer.len() > MAX_BUFFERED_BYTES {
                return Err(ClientError::protocol(
                    "inbound element exceeds the size limit without completing",
                ));
            }
            return Ok(None);
        };

        let frame = trimmed[..frame_len].to_string();
        self.buffer.drain(..skip + frame_len);

        Ok(Some(classify_frame(&frame)?))
    }

    /// Clear all buffered data.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the byte length of the first complete element at the start of
/// `data`, tracking nesting depth and quoted attribute values.
///
/// Returns `None` if the element is still incomplete.
fn scan_complete_element(data: &str) -> Option<usize> {
    let bytes = data.as_bytes();
    let len = bytes.len();
    let mut depth: i32 = 0;
    let mut i = 0;

    while i < len {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }

        let closing = i + 1 < len && bytes[i + 1] == b'/';

        // Scan to the matching '>' of this tag, honoring quoted attributes
        let mut j = i + 1;
        let mut quote: Option<u8> = None;
        let mut tag_end = None;
        while j < len {
            let b = bytes[j];
            match quote {
                Some(q) => {
                    if b == q {
                        quote = None;
                    }
                }
                None => {
                    if b == b'"' || b == b'\'' {
                        quote = Some(b);
                    } else if b == b'>' {
                        tag_end = Some(j);
                        break;
                    }
                }
            }
            j += 1;
        }

        let tag_end = tag_end?;
        let self_closing = tag_end > 0 && bytes[tag_end - 1] == b'/';

        if closing {
            depth -= 1;
            if depth <= 0 {
                return Some(tag_end + 1);
            }
        } else if self_closing {
            if depth == 0 {
                return Some(tag_end + 1);
            }
        } else {
            depth += 1;
        }

        i = tag_end + 1;
    }

    None
}

/// Classify a complete framed element by its root tag name.
fn classify_frame(frame: &str) -> Result<StreamItem, ClientError> {
    let name = root_element_name(frame);

    match name {
        "stream:features" => Ok(StreamItem::Features(StreamFeatures::parse(frame))),
        "success" => Ok(StreamItem::SaslSuccess),
        "failure" => Ok(StreamItem::SaslFailure(
            first_child_name(frame).unwrap_or_else(|| "not-authorized".to_string()),
        )),
        "stream:error" => Ok(StreamItem::StreamError(
            first_child_name(frame).unwrap_or_else(|| "undefined-condition".to_string()),
        )),
        _ => Ok(StreamItem::Stanza(parse_fragment(frame)?)),
    }
}

/// The root element name of a framed element.
fn root_element_name(frame: &str) -> &str {
    let inner = frame.trim_start().trim_start_matches('<');
    let end = inner
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(inner.len());
    &inner[..end]
}

/// The name of the first child element inside a framed element, used to
/// extract SASL failure and stream error conditions.
fn first_child_name(frame: &str) -> Option<String> {
    let after_root = &frame[frame.find('>')? + 1..];
    let child_start = after_root.find('<')?;
    let inner = &after_root[child_start + 1..];
    if inner.starts_with('/') {
        return None;
    }
    let end = inner.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    Some(inner[..end].to_string())
}

/// Parse a framed stanza element into a minidom [`Element`].
///
/// Stanzas on the wire usually inherit `jabber:client` from the stream
/// root, which a standalone fragment parse cannot see, so the namespace is
/// injected when the opening tag does not declare one.
pub fn parse_fragment(xml: &str) -> Result<Element, ClientError> {
    let xml = xml.trim();
    let tag_end = xml
        .find('>')
        .ok_or_else(|| ClientError::malformed("fragment has no opening tag"))?;

    let owned;
    let to_parse = if xml[..tag_end].contains("xmlns") {
        xml
    } else {
        let insert_at = if xml.as_bytes()[tag_end - 1] == b'/' {
            tag_end - 1
        } else {
            tag_end
        };
        owned = format!(
            "{} xmlns='{}'{}",
            &xml[..insert_at],
            ns::JABBER_CLIENT,
            &xml[insert_at..]
        );
        &owned
    };

    to_parse
        .parse::<Element>()
        .map_err(|e| ClientError::malformed(format!("failed to parse element: {}", e)))
}

/// Extract an attribute value from an XML tag string.
pub(crate) fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    // Try both single and double quotes
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(xml: &str) -> XmlParser {
        let mut parser = XmlParser::new();
        parser.feed(xml.as_bytes());
        parser
    }

    #[test]
    fn parses_server_stream_header() {
        let mut parser = feed_all(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' id='str-1' \
             from='example.com' version='1.0'>",
        );

        assert!(parser.has_stream_header());
        let header = parser.take_stream_header().unwrap();
        assert_eq!(header.id, Some("str-1".to_string()));
        assert_eq!(header.from, Some("example.com".to_string()));
        assert_eq!(header.version, Some("1.0".to_string()));
    }

    #[test]
    fn rejects_unsupported_stream_version() {
        let mut parser = feed_all("<stream:stream id='x' version='0.9'>");
        let error = parser.take_stream_header().expect_err("must fail");
        assert!(matches!(error, ClientError::Protocol(_)));
    }

    #[test]
    fn frames_features_after_header() {
        let mut parser = feed_all(
            "<stream:stream id='s' version='1.0'>\
             <stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism>\
             </mechanisms></stream:features>",
        );
        parser.take_stream_header().unwrap();

        let item = parser.next_item().unwrap().expect("features framed");
        let StreamItem::Features(features) = item else {
            panic!("expected features, got {:?}", item);
        };
        assert_eq!(features.mechanisms, vec!["PLAIN", "SCRAM-SHA-1"]);
        assert!(features.offers_plain());
        assert!(!features.bind);
    }

    #[test]
    fn bind_feature_is_detected() {
        let features = StreamFeatures::parse(
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
        );
        assert!(features.bind);
        assert!(features.mechanisms.is_empty());
    }

    #[test]
    fn frames_element_split_across_feeds() {
        let mut parser = XmlParser::new();
        parser.feed(b"<message xmlns='jabber:client' to='bob@example.com'><bo");
        assert!(parser.next_item().unwrap().is_none());

        parser.feed(b"dy>Hello!</body></message>");
        let item = parser.next_item().unwrap().expect("message framed");
        assert!(matches!(item, StreamItem::Stanza(_)));
        assert!(parser.next_item().unwrap().is_none());
    }

    #[test]
    fn framing_ignores_angle_bracket_inside_attribute() {
        let mut parser =
            feed_all("<message xmlns='jabber:client' id='a>b'><body>x</body></message>");
        let item = parser.next_item().unwrap().expect("message framed");
        let StreamItem::Stanza(element) = item else {
            panic!("expected stanza");
        };
        assert_eq!(element.attr("id"), Some("a>b"));
    }

    #[test]
    fn frames_self_closing_and_nested_elements() {
        let mut parser = feed_all(
            "<presence xmlns='jabber:client' from='a@b'/>\
             <iq xmlns='jabber:client' type='result' id='1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>a@b/r</jid></bind></iq>",
        );

        let first = parser.next_item().unwrap().expect("presence framed");
        assert!(matches!(first, StreamItem::Stanza(_)));
        let second = parser.next_item().unwrap().expect("iq framed");
        assert!(matches!(second, StreamItem::Stanza(_)));
    }

    #[test]
    fn classifies_sasl_outcomes() {
        let mut parser = feed_all(
            "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>\
             <failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        );

        assert!(matches!(
            parser.next_item().unwrap(),
            Some(StreamItem::SaslSuccess)
        ));
        let failure = parser.next_item().unwrap().expect("failure framed");
        let StreamItem::SaslFailure(condition) = failure else {
            panic!("expected sasl failure");
        };
        assert_eq!(condition, "not-authorized");
    }

    #[test]
    fn classifies_stream_end_and_error() {
        let mut parser = feed_all(
            "<stream:error><system-shutdown \
             xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error></stream:stream>",
        );

        let error = parser.next_item().unwrap().expect("stream error framed");
        let StreamItem::StreamError(condition) = error else {
            panic!("expected stream error");
        };
        assert_eq!(condition, "system-shutdown");

        assert!(matches!(
            parser.next_item().unwrap(),
            Some(StreamItem::StreamEnd)
        ));
    }

    #[test]
    fn fragment_without_namespace_is_parsed_in_client_namespace() {
        let element = parse_fragment("<message to='bob@example.com'><body>hi</body></message>")
            .expect("fragment should parse");
        assert!(element.is("message", ns::JABBER_CLIENT));
    }

    #[test]
    fn fragment_self_closing_without_namespace() {
        let element = parse_fragment("<presence from='a@b/r'/>").expect("fragment should parse");
        assert!(element.is("presence", ns::JABBER_CLIENT));
        assert_eq!(element.attr("from"), Some("a@b/r"));
    }

    #[test]
    fn malformed_fragment_is_an_error() {
        let error = parse_fragment("<message><body></message>").expect_err("must fail");
        assert!(matches!(error, ClientError::MalformedStanza(_)));
    }

    #[test]
    fn multibyte_character_split_across_feeds() {
        let xml = "<message xmlns='jabber:client'><body>héllo</body></message>";
        let bytes = xml.as_bytes();
        // Split inside the two-byte 'é'
        let split = xml.find('é').unwrap() + 1;

        let mut parser = XmlParser::new();
        parser.feed(&bytes[..split]);
        assert!(parser.next_item().unwrap().is_none());
        parser.feed(&bytes[split..]);
        assert!(matches!(
            parser.next_item().unwrap(),
            Some(StreamItem::Stanza(_))
        ));
    }
}
