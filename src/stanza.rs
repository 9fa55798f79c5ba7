//! Stanzas: the `iq`, `message` and `presence` units routed to collectors and listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::codec::{Element, NS_CLIENT};
use crate::error::StanzaError;
use crate::jid::Jid;

pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
}

impl StanzaKind {
    pub fn element_name(self) -> &'static str {
        match self {
            StanzaKind::Iq => "iq",
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Element,
}

impl Stanza {
    /// Classify a top-level element; `None` for non-stanza units.
    pub fn from_element(element: Element) -> Option<Stanza> {
        if element.ns().is_some_and(|ns| ns != NS_CLIENT) {
            return None;
        }
        let kind = match element.name() {
            "iq" => StanzaKind::Iq,
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            _ => return None,
        };
        Some(Stanza { kind, element })
    }

    fn build(kind: StanzaKind, stanza_type: Option<&str>) -> Stanza {
        let mut element = Element::new(kind.element_name(), NS_CLIENT);
        if let Some(t) = stanza_type {
            element.set_attr("type", t);
        }
        Stanza { kind, element }
    }

    fn iq(stanza_type: &str, to: Option<&Jid>, payload: Option<Element>) -> Stanza {
        let mut stanza = Self::build(StanzaKind::Iq, Some(stanza_type));
        stanza.set_id(&next_id());
        if let Some(to) = to {
            stanza.set_to(to);
        }
        if let Some(payload) = payload {
            stanza.element.push(payload);
        }
        stanza
    }

    pub fn iq_get(to: Option<&Jid>, payload: Element) -> Stanza {
        Self::iq("get", to, Some(payload))
    }

    pub fn iq_set(to: Option<&Jid>, payload: Element) -> Stanza {
        Self::iq("set", to, Some(payload))
    }

    /// An empty result answering `request`, addressed back to its sender.
    pub fn iq_result(request: &Stanza) -> Stanza {
        let mut stanza = Self::build(StanzaKind::Iq, Some("result"));
        if let Some(id) = request.id() {
            stanza.set_id(id);
        }
        if let Some(from) = request.element.get_attr("from") {
            stanza.element.set_attr("to", from);
        }
        stanza
    }

    pub fn presence_available() -> Stanza {
        Self::build(StanzaKind::Presence, None)
    }

    pub fn presence_unavailable() -> Stanza {
        Self::build(StanzaKind::Presence, Some("unavailable"))
    }

    pub fn chat_message(to: &Jid, body: &str) -> Stanza {
        let mut stanza = Self::build(StanzaKind::Message, Some("chat"));
        stanza.set_id(&next_id());
        stanza.set_to(to);
        stanza
            .element
            .push(Element::new("body", NS_CLIENT).text(body));
        stanza
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn id(&self) -> Option<&str> {
        self.element.get_attr("id")
    }

    pub fn set_id(&mut self, id: &str) {
        self.element.set_attr("id", id);
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.element.get_attr("type")
    }

    pub fn from(&self) -> Option<Jid> {
        self.element.get_attr("from").and_then(|f| f.parse().ok())
    }

    pub fn to(&self) -> Option<Jid> {
        self.element.get_attr("to").and_then(|t| t.parse().ok())
    }

    pub fn set_to(&mut self, to: &Jid) {
        self.element.set_attr("to", to.to_string());
    }

    /// First child payload element, ignoring any `<error/>`.
    pub fn payload(&self) -> Option<&Element> {
        self.element.children().find(|c| c.name() != "error")
    }

    pub fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }

    /// The embedded error condition of an error-typed stanza.
    pub fn error(&self) -> Option<StanzaError> {
        if !self.is_error() {
            return None;
        }
        let Some(error) = self.element.find("error", NS_CLIENT) else {
            return Some(StanzaError {
                error_type: "cancel".to_string(),
                condition: "undefined-condition".to_string(),
                text: None,
            });
        };
        let condition = error
            .children()
            .find(|c| c.ns() == Some(NS_STANZAS) && c.name() != "text")
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = error
            .find("text", NS_STANZAS)
            .map(|t| t.text_content())
            .filter(|t| !t.is_empty());
        Some(StanzaError {
            error_type: error.get_attr("type").unwrap_or("cancel").to_string(),
            condition,
            text,
        })
    }
}

fn id_prefix() -> &'static str {
    static PREFIX: OnceLock<String> = OnceLock::new();
    PREFIX.get_or_init(|| {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let mut seed = (u64::from(nanos) << 20) ^ u64::from(std::process::id());
        let alphabet = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut prefix = String::with_capacity(5);
        for _ in 0..5 {
            prefix.push(alphabet[(seed % 36) as usize] as char);
            seed /= 36;
        }
        prefix
    })
}

/// Unique stanza id: a per-process prefix plus a monotonic counter.
pub fn next_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{}-{}", id_prefix(), COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Stanza {
        Stanza::from_element(Element::parse(xml, NS_CLIENT).unwrap()).unwrap()
    }

    #[test]
    fn test_ids_are_unique_and_share_prefix() {
        let a = next_id();
        let b = next_id();
        assert_ne!(a, b);
        assert_eq!(a.split('-').next(), b.split('-').next());
    }

    #[test]
    fn test_classification() {
        assert_eq!(parse("<message/>").kind(), StanzaKind::Message);
        assert_eq!(parse("<presence type='unavailable'/>").kind(), StanzaKind::Presence);
        assert!(Stanza::from_element(
            Element::parse("<r xmlns='urn:xmpp:sm:3'/>", NS_CLIENT).unwrap()
        )
        .is_none());
        assert!(Stanza::from_element(
            Element::parse("<iq xmlns='jabber:server'/>", NS_CLIENT).unwrap()
        )
        .is_none());
    }

    #[test]
    fn test_error_condition_extraction() {
        let stanza = parse(
            "<iq type='error' id='q1' from='pubsub.example.com'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>gone</text></error></iq>",
        );
        let err = stanza.error().unwrap();
        assert_eq!(err.condition, "item-not-found");
        assert_eq!(err.error_type, "cancel");
        assert_eq!(err.text.as_deref(), Some("gone"));
    }

    #[test]
    fn test_result_stanza_has_no_error() {
        assert!(parse("<iq type='result' id='q1'/>").error().is_none());
    }

    #[test]
    fn test_iq_result_answers_request() {
        let request = parse("<iq type='get' id='ping-1' from='example.com'><ping xmlns='urn:xmpp:ping'/></iq>");
        let reply = Stanza::iq_result(&request);
        assert_eq!(reply.id(), Some("ping-1"));
        assert_eq!(reply.element().get_attr("to"), Some("example.com"));
        assert_eq!(reply.stanza_type(), Some("result"));
        assert_eq!(request.payload().unwrap().name(), "ping");
    }

    #[test]
    fn test_iq_get_gets_fresh_id() {
        let to: Jid = "example.com".parse().unwrap();
        let iq = Stanza::iq_get(Some(&to), Element::new("query", "jabber:iq:version"));
        assert!(iq.id().is_some());
        assert_eq!(iq.to(), Some(to));
        assert_eq!(iq.payload().unwrap().ns(), Some("jabber:iq:version"));
    }
}
