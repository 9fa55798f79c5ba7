//! Error taxonomy for the connection engine.
//!
//! Every failure the engine can report maps onto one [`Error`] variant. The enum is
//! `Clone` so that a single asynchronous failure can be handed to the blocked caller,
//! to negotiation waiters and to every registered connection listener.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::transport::XmppEndpoint;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Resolution or socket failure, aggregated across every attempted address.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Server requirements conflict with the local configuration.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The authenticator or the server rejected the credentials.
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// A negotiation step or a collector wait exceeded its bound.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// Server-sent stream error or malformed input.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// API misuse.
    #[error(transparent)]
    State(#[from] StateError),

    /// A correlated reply carried an error condition.
    #[error(transparent)]
    Stanza(#[from] StanzaError),

    /// I/O failure on an established transport.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// True for failures that leave the transport unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) | Error::Negotiation(_)
        )
    }
}

/// One address that could not be reached, with its cause.
#[derive(Debug, Clone)]
pub struct FailedAddress {
    pub address: XmppEndpoint,
    pub cause: Arc<std::io::Error>,
}

impl fmt::Display for FailedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}:{}' failed because: {}",
            self.address.host, self.address.port, self.cause
        )
    }
}

/// Every address was tried and none could be connected.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("The following addresses failed: {}", join_failures(.0))]
    AllAddressesFailed(Vec<FailedAddress>),

    #[error("no address to connect to for '{0}'")]
    NoAddresses(String),
}

impl ConnectionError {
    /// Failed addresses in attempt order (empty for non-aggregate variants).
    pub fn failures(&self) -> &[FailedAddress] {
        match self {
            ConnectionError::AllAddressesFailed(failures) => failures,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[FailedAddress]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("TLS required by server but not allowed by connection configuration")]
    TlsRequiredByServer,

    #[error("TLS required by connection configuration but not offered by server")]
    TlsRequiredByClient,

    #[error("TLS negotiation has failed")]
    TlsFailed,

    #[error("TLS handshake failed with {host}: {reason}")]
    TlsHandshake { host: String, reason: String },

    #[error("server did not advertise resource binding")]
    BindNotOffered,

    #[error("stream compression could not be established: {0}")]
    Compression(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("no authenticator configured")]
    NoAuthenticator,

    #[error("no usable SASL mechanism among {offered:?}")]
    NoMechanism { offered: Vec<String> },

    #[error("SASL authentication failed: {condition}{}", .text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    Rejected {
        condition: String,
        text: Option<String>,
    },

    #[error("SASL mechanism error: {0}")]
    Mechanism(String),
}

/// A bounded wait expired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no response within {}ms while {operation}", .after.as_millis())]
pub struct TimeoutError {
    pub operation: String,
    pub after: Duration,
}

impl TimeoutError {
    pub fn new(operation: impl Into<String>, after: Duration) -> Self {
        Self {
            operation: operation.into(),
            after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("stream error: {condition}{}", .text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    StreamError {
        condition: String,
        text: Option<String>,
    },

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("inbound buffer exceeded {limit} bytes without a complete unit")]
    BufferOverflow { limit: usize },

    #[error("stream closed by server")]
    StreamClosed,

    #[error("connection closed by peer")]
    Eof,

    #[error("no stream features received from server")]
    NoFeatures,

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("compression may only be negotiated after authentication")]
    CompressionBeforeAuthentication,

    #[error("{action} is not valid in negotiation state {state}")]
    InvalidNegotiationStep { action: &'static str, state: String },

    #[error("stanza collector already cancelled")]
    CollectorCancelled,
}

/// Error condition embedded in an error-typed stanza.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition} ({error_type}){}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
pub struct StanzaError {
    /// `cancel`, `continue`, `modify`, `auth` or `wait`.
    pub error_type: String,
    /// Defined condition element name, e.g. `item-not-found`.
    pub condition: String,
    pub text: Option<String>,
}
