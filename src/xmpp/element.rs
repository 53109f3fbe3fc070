//! Element model for a decoded XMPP stream.
//!
//! The decoder emits exactly three kinds of values: the stream opener (which
//! is never closed in-band, since `<stream:stream>` wraps the whole session),
//! the stream closer, and fully buffered depth-1 elements carried with their
//! raw serialized XML so they can be forwarded byte-faithfully.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Writer;

use super::NS_STREAM;

/// A resolved qualified name: namespace URI plus local name.
///
/// Before resolution the `space` field holds the raw prefix as it appeared on
/// the wire; the decoder's translation step replaces it with the bound URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QName {
    pub space: String,
    pub local: String,
}

impl QName {
    pub fn new(space: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            local: local.into(),
        }
    }

    /// Splits a raw qualified name (`prefix:local`) into its parts. A name
    /// without a colon has an empty space.
    pub fn from_raw(raw: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(raw);
        match raw.split_once(':') {
            Some((prefix, local)) => Self::new(prefix, local),
            None => Self::new("", raw.into_owned()),
        }
    }
}

/// A single decoded element of the stream.
#[derive(Debug, Clone)]
pub enum Element {
    /// The `<stream:stream …>` opener. Carries only its start tag.
    Stream(StreamHeader),
    /// The matching stream closer.
    StreamEnd,
    /// Any other depth-1 element, fully buffered.
    Generic(GenericElement),
}

impl Element {
    pub fn name(&self) -> QName {
        match self {
            Element::Stream(_) => QName::new(NS_STREAM, "stream"),
            Element::StreamEnd => QName::new(NS_STREAM, "streamend"),
            Element::Generic(e) => e.name().clone(),
        }
    }

    /// The on-wire serialization of this element.
    pub fn xml(&self) -> String {
        match self {
            Element::Stream(s) => s.xml(),
            Element::StreamEnd => "</stream>".to_string(),
            Element::Generic(e) => e.xml().to_string(),
        }
    }
}

/// The stream opener, with the session attributes lifted out for inspection
/// and rewriting. The raw start tag is kept so serialization reproduces every
/// attribute the peer sent, in order, with only the known values overridden.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub from: String,
    pub to: String,
    pub id: String,
    pub version: String,
    raw: BytesStart<'static>,
}

impl StreamHeader {
    pub fn from_start(raw: BytesStart<'static>) -> Self {
        let mut header = Self {
            from: String::new(),
            to: String::new(),
            id: String::new(),
            version: String::new(),
            raw,
        };
        for attr in header.raw.attributes().flatten() {
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            match attr.key.local_name().as_ref() {
                b"id" => header.id = value,
                b"from" => header.from = value,
                b"to" => header.to = value,
                b"version" => header.version = value,
                _ => {}
            }
        }
        header
    }

    /// Re-emits the start tag with the current `from`/`to`/`id`/`version`
    /// values substituted in place. Attributes absent from the original tag
    /// are not invented, and no closing tag is ever produced.
    pub fn xml(&self) -> String {
        let name = String::from_utf8_lossy(self.raw.name().as_ref()).into_owned();
        let mut tag = BytesStart::new(name);
        for attr in self.raw.attributes().flatten() {
            let replacement = match attr.key.local_name().as_ref() {
                b"id" => Some(&self.id),
                b"from" => Some(&self.from),
                b"to" => Some(&self.to),
                b"version" => Some(&self.version),
                _ => None,
            };
            match replacement {
                Some(value) => {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    tag.push_attribute((key.as_str(), value.as_str()));
                }
                None => tag.push_attribute(attr),
            }
        }
        let mut writer = Writer::new(Vec::new());
        if writer.write_event(Event::Start(tag)).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&writer.into_inner()).into_owned()
    }
}

/// Any depth-1 element, carried as its resolved name plus raw XML.
#[derive(Debug, Clone)]
pub struct GenericElement {
    name: QName,
    xml: String,
}

impl GenericElement {
    pub fn new(name: QName, xml: String) -> Self {
        Self { name, xml }
    }

    pub fn name(&self) -> &QName {
        &self.name
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_from_raw_splits_prefix() {
        assert_eq!(
            QName::from_raw(b"stream:features"),
            QName::new("stream", "features")
        );
        assert_eq!(QName::from_raw(b"iq"), QName::new("", "iq"));
        assert_eq!(QName::from_raw(b"xmlns:a"), QName::new("xmlns", "a"));
    }

    #[test]
    fn stream_end_serializes_as_bare_close_tag() {
        assert_eq!(Element::StreamEnd.xml(), "</stream>");
        assert_eq!(
            Element::StreamEnd.name(),
            QName::new(NS_STREAM, "streamend")
        );
    }

    fn stream_from(tag: &str) -> StreamHeader {
        let raw = BytesStart::from_content(tag.to_string(), "stream:stream".len());
        StreamHeader::from_start(raw)
    }

    #[test]
    fn stream_header_captures_session_attributes() {
        let header = stream_from(
            "stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             from='example.org' id='abc123' version='1.0'",
        );
        assert_eq!(header.from, "example.org");
        assert_eq!(header.id, "abc123");
        assert_eq!(header.version, "1.0");
        assert_eq!(header.to, "");
    }

    #[test]
    fn stream_header_xml_overrides_to_in_place() {
        let mut header = stream_from(
            "stream:stream xmlns='jabber:client' to='old.example' version='1.0'",
        );
        header.to = "new.example".to_string();
        let xml = header.xml();
        assert!(xml.starts_with("<stream:stream"));
        assert!(xml.contains(r#"to="new.example""#));
        assert!(xml.contains(r#"version="1.0""#));
        assert!(xml.contains(r#"xmlns="jabber:client""#));
        assert!(!xml.contains("old.example"));
        assert!(!xml.contains("</"));
    }

    #[test]
    fn stream_header_xml_preserves_unknown_attributes_and_order() {
        let header = stream_from(
            "stream:stream xmlns='jabber:client' xml:lang='en' to='a.example'",
        );
        let xml = header.xml();
        let xmlns = xml.find("xmlns=").unwrap();
        let lang = xml.find("xml:lang=").unwrap();
        let to = xml.find("to=").unwrap();
        assert!(xmlns < lang && lang < to, "attribute order changed: {xml}");
    }

    #[test]
    fn stream_header_does_not_invent_missing_to() {
        let mut header = stream_from("stream:stream xmlns='jabber:client'");
        header.to = "somewhere.example".to_string();
        assert!(!header.xml().contains("to="));
    }
}
