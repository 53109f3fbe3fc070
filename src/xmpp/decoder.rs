//! Streaming depth-1 element decoder.
//!
//! Transport bytes are fed into an internal buffer and parsed with quick-xml.
//! A parse attempt that runs out of bytes mid-element leaves the decoder
//! exactly as it was, so the caller can feed more data and retry; this is how
//! the decoder rides on top of arbitrary TCP fragmentation.
//!
//! Namespace handling deliberately mirrors XMPP practice rather than the full
//! XML Namespaces recommendation: prefix bindings live in one flat map for the lifetime
//! of the decoder, and a later `xmlns:foo` declaration shadows an earlier one
//! globally. The default namespace is tracked with a per-element stack.

use std::collections::HashMap;
use std::mem;

use quick_xml::errors::Error as XmlError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use super::element::{Element, GenericElement, QName, StreamHeader};
use super::stack::NsStack;
use super::{NS_STREAM, XML_NAMESPACE};

/// Upper bound on buffered, not-yet-decoded bytes. Typical stanzas are a few
/// KB; anything approaching this limit is malformed or hostile input.
const MAX_BUFFERED_BYTES: usize = 1_024 * 1_024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed xml: {0}")]
    Malformed(String),
    #[error("xml re-serialization failed: {0}")]
    Serialize(String),
    #[error("element exceeds the {} byte decode buffer", MAX_BUFFERED_BYTES)]
    BufferOverflow,
}

/// Depth-1 XMPP element decoder.
#[derive(Debug, Default)]
pub struct ElementDecoder {
    buf: Vec<u8>,
    header: String,
    default_ns: String,
    prefix_map: HashMap<String, String>,
    ns_stack: NsStack,
}

/// Rollback point for an incomplete parse attempt.
struct NsSnapshot {
    header: String,
    default_ns: String,
    prefix_map: HashMap<String, String>,
    ns_stack: NsStack,
}

impl ElementDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends transport bytes to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The last XML declaration seen on this stream, verbatim.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Drains and returns all buffered bytes that have not been decoded yet.
    /// Used when the proxy drops out of element decoding into raw byte copy.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        mem::take(&mut self.buf)
    }

    /// Decodes the next depth-1 element from the buffer. Returns `Ok(None)`
    /// when the buffered bytes do not yet contain a complete element.
    pub fn next_element(&mut self) -> Result<Option<Element>, DecodeError> {
        let input = mem::take(&mut self.buf);
        let snapshot = self.snapshot();
        match self.parse_attempt(&input) {
            Ok(Some((element, consumed))) => {
                self.buf = input;
                self.buf.drain(..consumed);
                Ok(Some(element))
            }
            Ok(None) => {
                self.restore(snapshot);
                self.buf = input;
                if self.buf.len() > MAX_BUFFERED_BYTES {
                    return Err(DecodeError::BufferOverflow);
                }
                Ok(None)
            }
            Err(err) => {
                self.buf = input;
                Err(err)
            }
        }
    }

    /// One pass over the buffered bytes. Returns the decoded element and the
    /// number of input bytes it consumed, or `None` when the input ends
    /// before an element is complete.
    fn parse_attempt(&mut self, input: &[u8]) -> Result<Option<(Element, usize)>, DecodeError> {
        let mut reader = Reader::from_reader(input);
        // Empty tags traverse as start+end so one code path covers both, and
        // end-name checking stays off: framing is done by name matching here.
        reader.config_mut().expand_empty_elements = true;
        reader.config_mut().check_end_names = false;
        reader.config_mut().allow_unmatched_ends = true;

        let mut writer = Writer::new(Vec::new());
        let mut stop_name: Option<QName> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let start = start.into_owned();
                    write_event(&mut writer, Event::Start(start.clone()))?;

                    // xmlns declarations take effect before the element's own
                    // name is resolved, so self-declared prefixes work.
                    self.register_namespaces(&start);

                    let mut name = QName::from_raw(start.name().as_ref());
                    self.translate(&mut name, true);
                    self.ns_stack.push(name.space.clone());

                    if name.space == NS_STREAM && name.local == "stream" {
                        let consumed = reader.buffer_position() as usize;
                        let stream = StreamHeader::from_start(start);
                        return Ok(Some((Element::Stream(stream), consumed)));
                    }

                    if stop_name.is_none() {
                        stop_name = Some(name);
                    }
                }
                Ok(Event::End(end)) => {
                    let end = end.into_owned();
                    write_event(&mut writer, Event::End(end.clone()))?;

                    let mut name = QName::from_raw(end.name().as_ref());
                    self.translate(&mut name, true);
                    self.ns_stack.pop();
                    self.default_ns = self
                        .ns_stack
                        .peek()
                        .cloned()
                        .unwrap_or_default();

                    if name.space == NS_STREAM && name.local == "stream" {
                        let consumed = reader.buffer_position() as usize;
                        return Ok(Some((Element::StreamEnd, consumed)));
                    }

                    if stop_name.as_ref() == Some(&name) {
                        let consumed = reader.buffer_position() as usize;
                        let xml = String::from_utf8_lossy(&writer.into_inner()).into_owned();
                        let element = Element::Generic(GenericElement::new(name, xml));
                        return Ok(Some((element, consumed)));
                    }
                }
                Ok(Event::Decl(decl)) => {
                    // Capture the XML declaration (plus anything buffered
                    // before it) as the stream header; it is not emitted as
                    // an element of its own.
                    write_event(&mut writer, Event::Decl(decl.into_owned()))?;
                    let bytes = mem::take(writer.get_mut());
                    self.header = String::from_utf8_lossy(&bytes).into_owned();
                }
                Ok(Event::Eof) => return Ok(None),
                Ok(other) => {
                    // Character data, CDATA, comments, doctype, entity refs
                    // and foreign processing instructions pass through into
                    // the element buffer untouched.
                    write_event(&mut writer, other.into_owned())?;
                }
                // A syntax error on a byte stream that can still grow means
                // the buffer ends inside a tag; wait for more data.
                Err(XmlError::Syntax(_)) => return Ok(None),
                Err(err) => return Err(DecodeError::Malformed(err.to_string())),
            }
        }
    }

    fn register_namespaces(&mut self, start: &BytesStart<'_>) {
        for attr in start.attributes().flatten() {
            let key = QName::from_raw(attr.key.as_ref());
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            if key.space == "xmlns" {
                self.prefix_map.insert(key.local, value);
            } else if key.space.is_empty() && key.local == "xmlns" {
                self.default_ns = value;
            }
        }
    }

    /// Resolves a raw name against the current namespace context, as
    /// described by <https://www.w3.org/TR/REC-xml-names/>. An unrecognized
    /// prefix is kept as the space rather than reported as an error.
    fn translate(&self, name: &mut QName, is_element: bool) {
        if name.space == "xmlns" {
            return;
        }
        if name.space.is_empty() && !is_element {
            return;
        }
        if name.space == "xml" {
            name.space = XML_NAMESPACE.to_string();
        }
        if name.space.is_empty() && name.local == "xmlns" {
            return;
        }
        if let Some(uri) = self.prefix_map.get(&name.space) {
            name.space = uri.clone();
        } else if name.space.is_empty() {
            name.space = self.default_ns.clone();
        }
    }

    fn snapshot(&self) -> NsSnapshot {
        NsSnapshot {
            header: self.header.clone(),
            default_ns: self.default_ns.clone(),
            prefix_map: self.prefix_map.clone(),
            ns_stack: self.ns_stack.clone(),
        }
    }

    fn restore(&mut self, snapshot: NsSnapshot) {
        self.header = snapshot.header;
        self.default_ns = snapshot.default_ns;
        self.prefix_map = snapshot.prefix_map;
        self.ns_stack = snapshot.ns_stack;
    }
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), DecodeError> {
    writer
        .write_event(event)
        .map_err(|err| DecodeError::Serialize(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::{NS_CLIENT, NS_SASL, NS_TLS};

    fn decoder_with(input: &str) -> ElementDecoder {
        let mut decoder = ElementDecoder::new();
        decoder.feed(input.as_bytes());
        decoder
    }

    fn next(decoder: &mut ElementDecoder) -> Element {
        decoder
            .next_element()
            .expect("decode error")
            .expect("expected a complete element")
    }

    #[test]
    fn session_decodes_to_stream_elements_and_end() {
        let mut decoder = decoder_with(
            "<?xml version=\"1.0\"?>\
             <stream:stream xmlns=\"jabber:client\" \
             xmlns:stream=\"http://etherx.jabber.org/streams\" \
             to=\"example.org\" version=\"1.0\">\
             <starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>\
             <auth xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\">AGp1bGlldA==</auth>\
             </stream:stream>",
        );

        let opener = next(&mut decoder);
        assert!(matches!(opener, Element::Stream(_)));
        assert_eq!(opener.name(), QName::new(NS_STREAM, "stream"));

        let starttls = next(&mut decoder);
        assert_eq!(starttls.name(), QName::new(NS_TLS, "starttls"));

        let auth = next(&mut decoder);
        assert_eq!(auth.name(), QName::new(NS_SASL, "auth"));
        assert!(auth.xml().contains("AGp1bGlldA=="));

        assert!(matches!(next(&mut decoder), Element::StreamEnd));
        assert!(decoder.next_element().unwrap().is_none());
    }

    #[test]
    fn stream_opener_is_returned_before_it_closes() {
        let mut decoder = decoder_with(
            "<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
             from=\"example.org\" id=\"s1\" version=\"1.0\">",
        );
        let Element::Stream(header) = next(&mut decoder) else {
            panic!("expected stream opener");
        };
        assert_eq!(header.from, "example.org");
        assert_eq!(header.id, "s1");
        assert!(!header.xml().contains("</"));
    }

    #[test]
    fn xml_declaration_is_captured_not_emitted() {
        let mut decoder = decoder_with(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\">",
        );
        assert!(matches!(next(&mut decoder), Element::Stream(_)));
        assert_eq!(decoder.header(), "<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    }

    #[test]
    fn prefixed_element_resolves_declared_namespace() {
        let mut decoder = decoder_with("<a:x xmlns:a=\"urn:ex\"><a:y/></a:x>");
        let element = next(&mut decoder);
        assert_eq!(element.name(), QName::new("urn:ex", "x"));

        // Re-parsing the serialized form yields the same resolved name.
        let mut reparse = ElementDecoder::new();
        reparse.feed(element.xml().as_bytes());
        let again = reparse.next_element().unwrap().unwrap();
        assert_eq!(again.name(), QName::new("urn:ex", "x"));
    }

    #[test]
    fn empty_element_expands_to_start_end_pair() {
        let mut decoder = decoder_with("\n<iq/>");
        let element = next(&mut decoder);
        assert_eq!(element.xml(), "\n<iq></iq>");
    }

    #[test]
    fn default_namespace_applies_to_unprefixed_children() {
        let mut decoder = decoder_with(
            "<stream:stream xmlns=\"jabber:client\" \
             xmlns:stream=\"http://etherx.jabber.org/streams\">\
             <message to=\"a@b\"><body>hi</body></message>",
        );
        assert!(matches!(next(&mut decoder), Element::Stream(_)));
        let message = next(&mut decoder);
        assert_eq!(message.name(), QName::new(NS_CLIENT, "message"));
        assert!(message.xml().contains("<body>hi</body>"));
    }

    #[test]
    fn later_prefix_declaration_shadows_earlier_one_globally() {
        let mut decoder = decoder_with(
            "<a:x xmlns:a=\"urn:one\"></a:x>\
             <a:y xmlns:a=\"urn:two\"></a:y>\
             <a:z></a:z>",
        );
        assert_eq!(next(&mut decoder).name(), QName::new("urn:one", "x"));
        assert_eq!(next(&mut decoder).name(), QName::new("urn:two", "y"));
        // No declaration in scope: the flat prefix map keeps the last binding.
        assert_eq!(next(&mut decoder).name(), QName::new("urn:two", "z"));
    }

    #[test]
    fn unknown_prefix_is_used_as_namespace() {
        let mut decoder = decoder_with("<foo:ping></foo:ping>");
        assert_eq!(next(&mut decoder).name(), QName::new("foo", "ping"));
    }

    #[test]
    fn incremental_feeds_resume_cleanly() {
        let input = "<presence from=\"a@b/c\"><status>away</status></presence>";
        let mut decoder = ElementDecoder::new();
        let (left, right) = input.split_at(19);
        decoder.feed(left.as_bytes());
        assert!(decoder.next_element().unwrap().is_none());
        decoder.feed(right.as_bytes());
        let element = next(&mut decoder);
        assert_eq!(element.name(), QName::new("", "presence"));
        assert!(element.xml().contains("<status>away</status>"));
    }

    #[test]
    fn single_byte_feeds_decode_identically() {
        let input = "<iq type=\"get\" id=\"1\"><ping xmlns=\"urn:xmpp:ping\"/></iq>";
        let mut decoder = ElementDecoder::new();
        let mut decoded = None;
        for byte in input.as_bytes() {
            decoder.feed(&[*byte]);
            if let Some(element) = decoder.next_element().unwrap() {
                decoded = Some(element);
            }
        }
        let element = decoded.expect("element should complete on the last byte");
        assert_eq!(element.name(), QName::new("", "iq"));
        assert!(element.xml().contains("urn:xmpp:ping"));
    }

    #[test]
    fn nested_children_stay_inside_one_element() {
        let mut decoder = decoder_with(
            "<iq type=\"result\"><query xmlns=\"jabber:iq:roster\">\
             <item jid=\"u@example.com\"></item></query></iq>",
        );
        let element = next(&mut decoder);
        assert_eq!(element.name(), QName::new("", "iq"));
        assert!(element.xml().contains("</query>"));
        assert!(element.xml().ends_with("</iq>"));
        assert!(decoder.next_element().unwrap().is_none());
    }

    #[test]
    fn entities_survive_round_trip() {
        let mut decoder = decoder_with("<message><body>a &amp; b &lt;c&gt;</body></message>");
        let element = next(&mut decoder);
        assert!(element.xml().contains("a &amp; b &lt;c&gt;"));
    }

    #[test]
    fn take_remaining_returns_undecoded_bytes() {
        let mut decoder = decoder_with("<presence></presence>raw-tail-bytes");
        assert!(decoder.next_element().unwrap().is_some());
        assert_eq!(decoder.take_remaining(), b"raw-tail-bytes");
        assert!(decoder.take_remaining().is_empty());
    }

    #[test]
    fn stream_end_with_prefix_registered_by_opener() {
        let mut decoder = decoder_with(
            "<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\">\
             </stream:stream>",
        );
        assert!(matches!(next(&mut decoder), Element::Stream(_)));
        assert!(matches!(next(&mut decoder), Element::StreamEnd));
    }

    #[test]
    fn oversized_unparseable_input_errors_out() {
        let mut decoder = ElementDecoder::new();
        decoder.feed(b"<open>");
        let filler = vec![b'x'; MAX_BUFFERED_BYTES + 16];
        decoder.feed(&filler);
        assert!(matches!(
            decoder.next_element(),
            Err(DecodeError::BufferOverflow)
        ));
    }
}
