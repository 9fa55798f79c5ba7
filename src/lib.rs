//! XMPP client connection engine.
//!
//! One [`XmppConnection`] owns a byte transport, a writer loop and a reader loop, drives
//! stream negotiation (STARTTLS, SASL, compression, resource binding), correlates replies
//! through [`StanzaCollector`]s and reports asynchronous failures to [`ConnectionListener`]s.

pub mod codec;
pub mod collector;
pub mod config;
pub mod connection;
pub mod error;
pub mod features;
pub mod filter;
pub mod jid;
pub mod listeners;
pub mod negotiation;
pub mod reader;
pub mod sasl;
pub mod stanza;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod test_server;

pub use collector::StanzaCollector;
pub use config::{ConnectionConfig, ConnectionConfigBuilder, ParseErrorAction, SecurityMode};
pub use connection::{ConnectionState, XmppConnection, XmppConnectionBuilder};
pub use error::{Error, Result};
pub use features::StreamFeatures;
pub use filter::StanzaFilter;
pub use jid::Jid;
pub use listeners::ConnectionListener;
pub use negotiation::NegotiationState;
pub use stanza::{Stanza, StanzaKind};
