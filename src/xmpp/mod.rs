//! XMPP stream decoding: depth-1 element extraction, namespace resolution,
//! and declarative routing of decoded elements.

pub mod decoder;
pub mod element;
pub mod router;
pub mod stack;

/// Namespace of the outer `<stream:stream>` wrapper (RFC 6120 §4).
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
/// Namespace of the STARTTLS negotiation elements (RFC 6120 §5).
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// Default namespace of client-to-server stanzas.
pub const NS_CLIENT: &str = "jabber:client";
/// Namespace of the SASL negotiation elements (RFC 6120 §6).
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// The `xml:` prefix is implicitly bound to this URI in every document.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
