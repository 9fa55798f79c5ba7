//! Predicates selecting inbound stanzas for collectors and listeners.

use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaKind};

pub trait StanzaFilter: Send + Sync {
    fn accept(&self, stanza: &Stanza) -> bool;
}

impl<F> StanzaFilter for F
where
    F: Fn(&Stanza) -> bool + Send + Sync,
{
    fn accept(&self, stanza: &Stanza) -> bool {
        self(stanza)
    }
}

/// Matches on the `id` attribute.
#[derive(Debug, Clone)]
pub struct IdFilter(pub String);

impl StanzaFilter for IdFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.id() == Some(self.0.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KindFilter(pub StanzaKind);

impl StanzaFilter for KindFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.kind() == self.0
    }
}

/// Matches the sender. A bare address also matches any full address under it.
#[derive(Debug, Clone)]
pub struct FromFilter(pub Jid);

impl StanzaFilter for FromFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        match stanza.from() {
            Some(from) if self.0.is_bare() => from.to_bare() == self.0,
            Some(from) => from == self.0,
            None => false,
        }
    }
}

/// Matches the `result` or `error` reply to one IQ request.
///
/// When the request was addressed to someone, the reply must come from that address.
/// When it had no `to`, the server answers on behalf of the account, so an absent
/// sender, the own bare or full address, or the service domain are all accepted.
#[derive(Debug, Clone)]
pub struct IqReplyFilter {
    id: String,
    to: Option<Jid>,
    local: Option<Jid>,
    server: Option<Jid>,
}

impl IqReplyFilter {
    pub fn new(request: &Stanza, local: Option<Jid>, service_domain: &str) -> Self {
        Self {
            id: request.id().unwrap_or_default().to_string(),
            to: request.to(),
            local,
            server: Jid::domain_jid(service_domain).ok(),
        }
    }

    fn sender_matches(&self, from: Option<Jid>) -> bool {
        let own_bare = self.local.as_ref().map(Jid::to_bare);
        match (&self.to, from) {
            (Some(to), Some(from)) => {
                &from == to || (own_bare.as_ref() == Some(to) && Some(&from) == self.local.as_ref())
            }
            (Some(to), None) => own_bare.as_ref() == Some(to),
            (None, None) => true,
            (None, Some(from)) => {
                Some(&from) == self.local.as_ref()
                    || Some(&from) == own_bare.as_ref()
                    || Some(&from) == self.server.as_ref()
            }
        }
    }
}

impl StanzaFilter for IqReplyFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.kind() == StanzaKind::Iq
            && matches!(stanza.stanza_type(), Some("result") | Some("error"))
            && stanza.id() == Some(self.id.as_str())
            && self.sender_matches(stanza.from())
    }
}

/// All inner filters must accept.
#[derive(Default)]
pub struct AndFilter(pub Vec<Box<dyn StanzaFilter>>);

impl AndFilter {
    pub fn with(mut self, filter: impl StanzaFilter + 'static) -> Self {
        self.0.push(Box::new(filter));
        self
    }
}

impl StanzaFilter for AndFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.0.iter().all(|f| f.accept(stanza))
    }
}

/// Any inner filter may accept.
#[derive(Default)]
pub struct OrFilter(pub Vec<Box<dyn StanzaFilter>>);

impl OrFilter {
    pub fn with(mut self, filter: impl StanzaFilter + 'static) -> Self {
        self.0.push(Box::new(filter));
        self
    }
}

impl StanzaFilter for OrFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.0.iter().any(|f| f.accept(stanza))
    }
}
