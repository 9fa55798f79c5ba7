//! SASL collaborators and the `<auth/>` exchange driver.
//!
//! Mechanism algorithms are supplied by the application through [`SaslMechanism`]; the
//! engine only frames their payloads and interprets the server's verdict.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::Element;
use crate::error::{AuthenticationError, Error, ProtocolError, Result, TimeoutError};
use crate::features::NS_SASL;

/// What the user authenticates with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { username: String, password: String },
    Anonymous,
}

impl Credentials {
    /// Username is trimmed and lower-cased before it reaches any mechanism.
    pub fn password(username: &str, password: &str) -> Self {
        Credentials::Password {
            username: username.trim().to_lowercase(),
            password: password.to_string(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Password { username, .. } => Some(username),
            Credentials::Anonymous => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// One SASL mechanism instance, used for a single authentication attempt.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    /// Payload sent with `<auth/>`; `None` when the mechanism waits for a challenge.
    fn initial_response(&mut self) -> std::result::Result<Option<Vec<u8>>, AuthenticationError>;

    fn respond(&mut self, challenge: &[u8]) -> std::result::Result<Vec<u8>, AuthenticationError>;

    /// Check additional data carried by `<success/>`.
    fn verify_success(&mut self, _additional_data: &[u8]) -> std::result::Result<(), AuthenticationError> {
        Ok(())
    }
}

/// Chooses a mechanism for the advertised names and the given credentials.
pub trait Authenticator: Send + Sync {
    fn select(
        &self,
        offered: &[String],
        credentials: &Credentials,
        service_domain: &str,
    ) -> std::result::Result<Box<dyn SaslMechanism>, AuthenticationError>;
}

type MechanismFactory = Arc<dyn Fn(&Credentials, &str) -> Box<dyn SaslMechanism> + Send + Sync>;

/// Authenticator over registered mechanism factories, in preference order.
///
/// `ANONYMOUS` is only chosen for anonymous credentials and never for password ones.
#[derive(Clone, Default)]
pub struct MechanismRegistry {
    factories: Vec<(String, MechanismFactory)>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Credentials, &str) -> Box<dyn SaslMechanism> + Send + Sync + 'static,
    {
        self.factories.push((name.to_ascii_uppercase(), Arc::new(factory)));
        self
    }
}

impl Authenticator for MechanismRegistry {
    fn select(
        &self,
        offered: &[String],
        credentials: &Credentials,
        service_domain: &str,
    ) -> std::result::Result<Box<dyn SaslMechanism>, AuthenticationError> {
        let anonymous = matches!(credentials, Credentials::Anonymous);
        self.factories
            .iter()
            .filter(|(name, _)| (name == "ANONYMOUS") == anonymous)
            .find(|(name, _)| offered.iter().any(|o| o.eq_ignore_ascii_case(name)))
            .map(|(_, factory)| factory(credentials, service_domain))
            .ok_or_else(|| AuthenticationError::NoMechanism {
                offered: offered.to_vec(),
            })
    }
}

/// Inbound SASL units, in the order the server sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslEvent {
    Challenge(Vec<u8>),
    Success(Vec<u8>),
    Failure { condition: String, text: Option<String> },
}

fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        STANDARD.encode(data)
    }
}

fn decode_payload(text: &str) -> std::result::Result<Vec<u8>, ProtocolError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(text)
        .map_err(|e| ProtocolError::Malformed(format!("invalid base64 in SASL payload: {e}")))
}

pub fn auth_element(mechanism: &str, initial: Option<&[u8]>) -> Element {
    let el = Element::new("auth", NS_SASL).attr("mechanism", mechanism);
    match initial {
        Some(data) => el.text(encode_payload(data)),
        None => el,
    }
}

pub fn response_element(data: &[u8]) -> Element {
    Element::new("response", NS_SASL).text(encode_payload(data))
}

/// Interpret a unit in the SASL namespace. `Ok(None)` for names that carry no verdict.
pub fn parse_sasl_event(el: &Element) -> std::result::Result<Option<SaslEvent>, ProtocolError> {
    let event = match el.name() {
        "challenge" => SaslEvent::Challenge(decode_payload(&el.text_content())?),
        "success" => SaslEvent::Success(decode_payload(&el.text_content())?),
        "failure" => SaslEvent::Failure {
            condition: el
                .children()
                .find(|c| c.name() != "text")
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "not-authorized".to_string()),
            text: el
                .find("text", NS_SASL)
                .map(|t| t.text_content())
                .filter(|t| !t.is_empty()),
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Drive one authentication exchange to a verdict.
///
/// `send` queues an outbound unit; `events` yields the server's SASL units. Each wait for
/// the server is bounded by `reply_timeout`.
pub async fn run_exchange(
    mechanism: &mut dyn SaslMechanism,
    send: &(dyn Fn(Element) -> Result<()> + Send + Sync),
    events: &mut mpsc::UnboundedReceiver<SaslEvent>,
    reply_timeout: Duration,
) -> Result<()> {
    let initial = mechanism.initial_response()?;
    debug!(mechanism = mechanism.name(), "Starting SASL authentication");
    send(auth_element(mechanism.name(), initial.as_deref()))?;

    loop {
        let event = tokio::time::timeout(reply_timeout, events.recv())
            .await
            .map_err(|_| TimeoutError::new("waiting for SASL response", reply_timeout))?
            .ok_or(Error::State(crate::error::StateError::NotConnected))?;
        match event {
            SaslEvent::Challenge(data) => {
                let response = mechanism.respond(&data)?;
                send(response_element(&response))?;
            }
            SaslEvent::Success(data) => {
                mechanism.verify_success(&data)?;
                return Ok(());
            }
            SaslEvent::Failure { condition, text } => {
                return Err(AuthenticationError::Rejected { condition, text }.into());
            }
        }
    }
}
