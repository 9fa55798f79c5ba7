//! Stream negotiation state machine.
//!
//! [`Negotiator`] is pure: it consumes events surfaced by the reader loop and calls made by
//! the lifecycle, and answers with [`Action`]s for the loops to carry out. [`Negotiation`]
//! wraps it for sharing between tasks and publishes a [`NegotiationSnapshot`] after every
//! step so waiters can re-check their condition on each change.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::{Element, StreamHeader};
use crate::config::SecurityMode;
use crate::error::{Error, NegotiationError, Result, StateError, TimeoutError};
use crate::features::{StreamFeatures, NS_COMPRESS_PROTOCOL, NS_TLS};
use crate::jid::Jid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    StreamOpened,
    TlsNegotiating,
    TlsActive,
    Authenticating,
    Authenticated,
    CompressionNegotiating,
    CompressionActive,
    ResourceBinding,
    Established,
    Failed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Work the loops must perform on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Queue a unit on the writer.
    Send(Element),
    /// Quiesce both loops and run the TLS handshake on the transport.
    UpgradeTls,
    /// Quiesce both loops and wrap the transport with this compression method.
    ActivateCompression(String),
    /// Send a fresh stream header.
    RestartStream,
}

/// Outcome of the most recent compression attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    Pending,
    Active,
    Refused,
}

#[derive(Debug)]
pub struct Negotiator {
    security: SecurityMode,
    state: NegotiationState,
    history: Vec<NegotiationState>,
    features: Option<StreamFeatures>,
    stream_id: Option<String>,
    tls_active: bool,
    authenticated: bool,
    compression_method: Option<String>,
    compression: Option<CompressionOutcome>,
    failure: Option<Error>,
}

impl Negotiator {
    /// `tls_active` is true when the transport was encrypted before the first header.
    pub fn new(security: SecurityMode, tls_active: bool) -> Self {
        Self {
            security,
            state: NegotiationState::StreamOpened,
            history: Vec::new(),
            features: None,
            stream_id: None,
            tls_active,
            authenticated: false,
            compression_method: None,
            compression: None,
            failure: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[NegotiationState] {
        &self.history
    }

    pub fn features(&self) -> Option<&StreamFeatures> {
        self.features.as_ref()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.tls_active
    }

    /// SASL succeeded on this connection, even if binding has not.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    fn enter(&mut self, state: NegotiationState) {
        if self.history.last() != Some(&state) || state == NegotiationState::StreamOpened {
            self.history.push(state);
        }
        debug!(from = %self.state, to = %state, "Negotiation transition");
        self.state = state;
    }

    fn invalid(&self, action: &'static str) -> Error {
        StateError::InvalidNegotiationStep {
            action,
            state: self.state.to_string(),
        }
        .into()
    }

    /// True once features of the current generation allow authentication to begin.
    pub fn ready_for_authentication(&self) -> bool {
        self.state == NegotiationState::StreamOpened && !self.authenticated && self.features.is_some()
    }

    /// True once post-authentication features of the current generation are known.
    pub fn ready_for_binding(&self) -> bool {
        self.authenticated
            && self.features.is_some()
            && matches!(
                self.state,
                NegotiationState::Authenticated | NegotiationState::StreamOpened
            )
    }

    /// A new server stream header arrived; previous features are void.
    pub fn on_stream_opened(&mut self, header: &StreamHeader) {
        if self.state == NegotiationState::Failed {
            return;
        }
        self.features = None;
        if let Some(id) = &header.id {
            self.stream_id = Some(id.clone());
        }
        match self.state {
            NegotiationState::Authenticated => {}
            _ => {
                if self.history.is_empty() || self.state != NegotiationState::StreamOpened {
                    self.enter(NegotiationState::StreamOpened);
                }
            }
        }
    }

    pub fn on_features(&mut self, features: StreamFeatures) -> Vec<Action> {
        if self.state == NegotiationState::Failed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        let pre_auth = self.state == NegotiationState::StreamOpened && !self.authenticated;
        if pre_auth && !self.tls_active {
            match (features.starttls, self.security) {
                (Some(tls), SecurityMode::Disabled) if tls.required => {
                    self.fail(NegotiationError::TlsRequiredByServer.into());
                    self.features = Some(features);
                    return actions;
                }
                (Some(_), SecurityMode::Disabled) => {}
                (Some(_), _) => {
                    self.enter(NegotiationState::TlsNegotiating);
                    actions.push(Action::Send(Element::new("starttls", NS_TLS)));
                }
                (None, SecurityMode::Required) => {
                    self.fail(NegotiationError::TlsRequiredByClient.into());
                    self.features = Some(features);
                    return actions;
                }
                (None, _) => {}
            }
        }
        self.features = Some(features);
        actions
    }

    pub fn on_tls_proceed(&mut self) -> Vec<Action> {
        if self.state != NegotiationState::TlsNegotiating {
            debug!(state = %self.state, "Ignoring <proceed/> outside TLS negotiation");
            return Vec::new();
        }
        vec![Action::UpgradeTls]
    }

    pub fn on_tls_failure(&mut self) {
        if self.state == NegotiationState::TlsNegotiating {
            self.fail(NegotiationError::TlsFailed.into());
        }
    }

    pub fn tls_established(&mut self) -> Vec<Action> {
        if self.state != NegotiationState::TlsNegotiating {
            return Vec::new();
        }
        self.tls_active = true;
        self.features = None;
        self.enter(NegotiationState::TlsActive);
        info!("TLS established");
        vec![Action::RestartStream]
    }

    /// Returns the offered mechanism names.
    pub fn begin_authentication(&mut self) -> Result<Vec<String>> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if self.authenticated {
            return Err(StateError::AlreadyAuthenticated.into());
        }
        if !self.ready_for_authentication() {
            return Err(self.invalid("authentication"));
        }
        let mechanisms = self
            .features
            .as_ref()
            .map(|f| f.mechanisms.clone())
            .unwrap_or_default();
        self.enter(NegotiationState::Authenticating);
        Ok(mechanisms)
    }

    pub fn on_sasl_success(&mut self) -> Vec<Action> {
        if self.state != NegotiationState::Authenticating {
            return Vec::new();
        }
        self.authenticated = true;
        self.features = None;
        self.enter(NegotiationState::Authenticated);
        vec![Action::RestartStream]
    }

    /// The server rejected the credentials; the stream stays usable for another attempt.
    pub fn on_sasl_failure(&mut self) {
        if self.state == NegotiationState::Authenticating {
            self.enter(NegotiationState::StreamOpened);
        }
    }

    pub fn begin_compression(&mut self, method: &str) -> Result<Vec<Action>> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if !self.authenticated {
            return Err(StateError::CompressionBeforeAuthentication.into());
        }
        if self.state != NegotiationState::Authenticated || self.features.is_none() {
            return Err(self.invalid("compression"));
        }
        self.compression_method = Some(method.to_string());
        self.compression = Some(CompressionOutcome::Pending);
        self.enter(NegotiationState::CompressionNegotiating);
        let request = Element::new("compress", NS_COMPRESS_PROTOCOL)
            .child(Element::unqualified("method").text(method));
        Ok(vec![Action::Send(request)])
    }

    pub fn on_compressed(&mut self) -> Vec<Action> {
        match (&self.state, &self.compression_method) {
            (NegotiationState::CompressionNegotiating, Some(method)) => {
                vec![Action::ActivateCompression(method.clone())]
            }
            _ => {
                debug!(state = %self.state, "Ignoring <compressed/> outside compression negotiation");
                Vec::new()
            }
        }
    }

    /// Compression refused or failed to activate: continue uncompressed.
    pub fn on_compression_failure(&mut self, reason: &str) {
        if self.state == NegotiationState::CompressionNegotiating {
            warn!(reason, "Stream compression not established, continuing uncompressed");
            self.compression = Some(CompressionOutcome::Refused);
            self.enter(NegotiationState::Authenticated);
        }
    }

    pub fn compression_established(&mut self) -> Vec<Action> {
        if self.state != NegotiationState::CompressionNegotiating {
            return Vec::new();
        }
        self.features = None;
        self.compression = Some(CompressionOutcome::Active);
        self.enter(NegotiationState::CompressionActive);
        vec![Action::RestartStream]
    }

    pub fn compression_outcome(&self) -> Option<CompressionOutcome> {
        self.compression
    }

    /// Returns whether the server demands a legacy session after binding.
    pub fn begin_binding(&mut self) -> Result<bool> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if !self.ready_for_binding() {
            return Err(self.invalid("resource binding"));
        }
        let features = self.features.as_ref();
        if !features.is_some_and(|f| f.bind) {
            let err: Error = NegotiationError::BindNotOffered.into();
            self.fail(err.clone());
            return Err(err);
        }
        let session = features.is_some_and(|f| f.requires_session());
        self.enter(NegotiationState::ResourceBinding);
        Ok(session)
    }

    pub fn established(&mut self, jid: &Jid) {
        if self.state == NegotiationState::ResourceBinding {
            info!(jid = %jid, "Session established");
            self.enter(NegotiationState::Established);
        }
    }

    /// Terminal; the first recorded failure wins.
    pub fn fail(&mut self, err: Error) {
        if self.failure.is_none() {
            warn!(state = %self.state, error = %err, "Negotiation failed");
            self.failure = Some(err);
        }
        if self.state != NegotiationState::Failed {
            self.enter(NegotiationState::Failed);
        }
    }
}

/// What waiters observe after each step.
#[derive(Debug, Clone)]
pub struct NegotiationSnapshot {
    pub state: NegotiationState,
    pub ready_for_authentication: bool,
    pub ready_for_binding: bool,
    pub features: Option<StreamFeatures>,
    pub compression: Option<CompressionOutcome>,
    pub failure: Option<Error>,
}

impl NegotiationSnapshot {
    fn of(n: &Negotiator) -> Self {
        Self {
            state: n.state,
            ready_for_authentication: n.ready_for_authentication(),
            ready_for_binding: n.ready_for_binding(),
            features: n.features.clone(),
            compression: n.compression,
            failure: n.failure.clone(),
        }
    }
}

/// A [`Negotiator`] shared by the reader loop and the lifecycle.
pub struct Negotiation {
    inner: Mutex<Negotiator>,
    tx: watch::Sender<NegotiationSnapshot>,
}

impl Negotiation {
    pub fn new(negotiator: Negotiator) -> Self {
        let (tx, _) = watch::channel(NegotiationSnapshot::of(&negotiator));
        Self {
            inner: Mutex::new(negotiator),
            tx,
        }
    }

    /// Run one step under the lock and publish the resulting snapshot.
    pub fn step<T>(&self, f: impl FnOnce(&mut Negotiator) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let out = f(&mut guard);
        let snapshot = NegotiationSnapshot::of(&guard);
        drop(guard);
        self.tx.send_replace(snapshot);
        out
    }

    pub fn read<T>(&self, f: impl FnOnce(&Negotiator) -> T) -> T {
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&guard)
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        self.tx.borrow().clone()
    }

    /// Wait until `pred` holds or negotiation fails, bounded by `timeout`.
    ///
    /// The predicate is re-evaluated on every published change, so a wake-up that does not
    /// satisfy it simply keeps waiting. Expiry records the timeout as the negotiation failure.
    pub async fn wait_until(
        &self,
        operation: &str,
        timeout: Duration,
        pred: impl Fn(&NegotiationSnapshot) -> bool,
    ) -> Result<NegotiationSnapshot> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.failure.is_some() || pred(s)),
        )
        .await;
        match waited {
            Ok(Ok(snapshot)) => {
                let snapshot = snapshot.clone();
                match snapshot.failure {
                    Some(err) => Err(err),
                    None => Ok(snapshot),
                }
            }
            Ok(Err(_)) => Err(StateError::NotConnected.into()),
            Err(_) => {
                let err: Error = TimeoutError::new(operation, timeout).into();
                self.step(|n| n.fail(err.clone()));
                Err(err)
            }
        }
    }
}
