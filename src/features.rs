//! Stream feature advertisements (`<stream:features/>`).

use serde::Serialize;

use crate::codec::Element;

pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
pub const NS_COMPRESS_PROTOCOL: &str = "http://jabber.org/protocol/compress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartTls {
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Session {
    pub optional: bool,
}

/// Features advertised for one stream generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamFeatures {
    pub starttls: Option<StartTls>,
    pub mechanisms: Vec<String>,
    pub compression_methods: Vec<String>,
    pub bind: bool,
    pub session: Option<Session>,
    /// `(name, namespace)` of every advertised feature not listed above.
    pub other: Vec<(String, String)>,
}

impl StreamFeatures {
    pub fn from_element(features: &Element) -> Self {
        let mut out = StreamFeatures::default();
        for child in features.children() {
            let ns = child.ns().unwrap_or_default();
            match (child.name(), ns) {
                ("starttls", NS_TLS) => {
                    out.starttls = Some(StartTls {
                        required: child.find("required", NS_TLS).is_some(),
                    });
                }
                ("mechanisms", NS_SASL) => {
                    out.mechanisms = child
                        .children()
                        .filter(|m| m.is("mechanism", NS_SASL))
                        .map(|m| m.text_content().trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect();
                }
                ("compression", NS_COMPRESS_FEATURE) => {
                    out.compression_methods = child
                        .children()
                        .filter(|m| m.is("method", NS_COMPRESS_FEATURE))
                        .map(|m| m.text_content().trim().to_string())
                        .collect();
                }
                ("bind", NS_BIND) => out.bind = true,
                ("session", NS_SESSION) => {
                    out.session = Some(Session {
                        optional: child.find("optional", NS_SESSION).is_some(),
                    });
                }
                (name, ns) => out.other.push((name.to_string(), ns.to_string())),
            }
        }
        out
    }

    pub fn offers_mechanism(&self, name: &str) -> bool {
        self.mechanisms.iter().any(|m| m.eq_ignore_ascii_case(name))
    }

    pub fn offers_compression(&self, method: &str) -> bool {
        self.compression_methods.iter().any(|m| m == method)
    }

    pub fn requires_session(&self) -> bool {
        self.session.is_some_and(|s| !s.optional)
    }
}
