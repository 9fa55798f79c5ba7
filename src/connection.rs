//! Connection lifecycle: connect, login, shutdown, error notification and reconnection.
//!
//! All lifecycle transitions are serialised by one async mutex. Per stream generation the
//! connection runs a writer task, a reader task, a listener-dispatch task and a supervisor
//! that turns the first asynchronous loop failure into [`XmppConnection::notify_error`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::codec::{Element, StreamHeader};
use crate::collector::{PendingTable, StanzaCollector};
use crate::config::ConnectionConfig;
use crate::error::{AuthenticationError, ConnectionError, Error, ProtocolError, Result, StateError};
use crate::features::{StreamFeatures, NS_BIND, NS_SESSION};
use crate::filter::{IqReplyFilter, StanzaFilter};
use crate::jid::Jid;
use crate::listeners::{spawn_dispatcher, ConnectionListener, ListenerRegistry};
use crate::negotiation::{Action, CompressionOutcome, Negotiation, NegotiationState, Negotiator};
use crate::reader::{spawn_reader, ReaderContext, ReaderHandle, SaslEventSlot};
use crate::sasl::{self, Credentials};
use crate::stanza::Stanza;
use crate::transport::{self, compression, dns, BoxedStream, ConnectionMode, XmppEndpoint};
use crate::writer::{spawn_writer, FailureReporter, WriterConfig, WriterHandle};

/// How long a graceful shutdown waits for queued output and the server's closing tag.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// How long the error path lets the writer flush before aborting it.
const ERROR_DRAIN: Duration = Duration::from_millis(100);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Authenticated,
    Anonymous,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone)]
struct LoginInfo {
    credentials: Credentials,
    resource: String,
}

/// One stream generation: the tasks bound to one transport.
struct Live {
    generation: u64,
    endpoint: XmppEndpoint,
    negotiation: Arc<Negotiation>,
    writer: WriterHandle,
    writer_task: JoinHandle<()>,
    reader: ReaderHandle,
    authenticated: bool,
}

#[derive(Default)]
struct Lifecycle {
    live: Option<Live>,
    generation: u64,
    was_authenticated: bool,
    /// The last generation ended through the error path.
    abrupt: bool,
    login: Option<LoginInfo>,
}

/// What `send` and the accessors need without taking the lifecycle lock.
#[derive(Default)]
struct Session {
    writer: Option<WriterHandle>,
    negotiation: Option<Arc<Negotiation>>,
    user: Option<Jid>,
    stream_id: Option<String>,
}

struct Inner {
    conn_id: u64,
    config: ConnectionConfig,
    lifecycle: Mutex<Lifecycle>,
    /// Generation of the running loops, 0 when none.
    live_generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    collectors: Arc<PendingTable>,
    stanza_listeners: Arc<ListenerRegistry>,
    connection_listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    session: RwLock<Session>,
    sasl_events: SaslEventSlot,
}

impl Inner {
    fn session<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        match self.session.read() {
            Ok(s) => f(&s),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn session_mut<T>(&self, f: impl FnOnce(&mut Session) -> T) -> T {
        match self.session.write() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn set_sasl_events(&self, tx: Option<mpsc::UnboundedSender<sasl::SaslEvent>>) {
        match self.sasl_events.lock() {
            Ok(mut slot) => *slot = tx,
            Err(poisoned) => *poisoned.into_inner() = tx,
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        match self.connection_listeners.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(conn_id = self.conn_id, from = %previous, to = %state, "Connection state changed");
        }
    }
}

type CreationHook = Box<dyn FnOnce(&XmppConnection) + Send>;

/// Builds an [`XmppConnection`], running every creation hook once on the new connection.
pub struct XmppConnectionBuilder {
    config: ConnectionConfig,
    listeners: Vec<Arc<dyn ConnectionListener>>,
    hooks: Vec<CreationHook>,
}

impl XmppConnectionBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            listeners: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn connection_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Attach an extension or any other per-connection setup.
    pub fn on_creation(mut self, hook: impl FnOnce(&XmppConnection) + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn build(self) -> XmppConnection {
        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(ConnectionState::Unconnected);
        let connection = XmppConnection {
            inner: Arc::new(Inner {
                conn_id,
                config: self.config,
                lifecycle: Mutex::new(Lifecycle::default()),
                live_generation: AtomicU64::new(0),
                state,
                collectors: Arc::new(PendingTable::new()),
                stanza_listeners: Arc::new(ListenerRegistry::new()),
                connection_listeners: RwLock::new(self.listeners),
                session: RwLock::new(Session::default()),
                sasl_events: Arc::new(std::sync::Mutex::new(None)),
            }),
        };
        debug!(conn_id, hooks = self.hooks.len(), "Connection created");
        for hook in self.hooks {
            hook(&connection);
        }
        connection
    }
}

/// Handle to one client connection. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct XmppConnection {
    inner: Arc<Inner>,
}

impl XmppConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        XmppConnectionBuilder::new(config).build()
    }

    pub fn builder(config: ConnectionConfig) -> XmppConnectionBuilder {
        XmppConnectionBuilder::new(config)
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.conn_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.live_generation.load(Ordering::Acquire) != 0
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Authenticated | ConnectionState::Anonymous
        )
    }

    /// Full JID confirmed by the server at bind time.
    pub fn user(&self) -> Option<Jid> {
        self.inner.session(|s| s.user.clone())
    }

    /// Stream id from the most recent server header.
    pub fn stream_id(&self) -> Option<String> {
        self.inner.session(|s| {
            s.negotiation
                .as_ref()
                .and_then(|n| n.read(|n| n.stream_id().map(str::to_string)))
                .or_else(|| s.stream_id.clone())
        })
    }

    pub fn is_secure(&self) -> bool {
        self.inner
            .session(|s| s.negotiation.as_ref().is_some_and(|n| n.read(|n| n.is_secure())))
    }

    /// Features of the current stream generation.
    pub fn features(&self) -> Option<StreamFeatures> {
        self.inner
            .session(|s| s.negotiation.as_ref().and_then(|n| n.snapshot().features))
    }

    /// Negotiation states entered on the current transport, in order.
    pub fn negotiation_history(&self) -> Vec<NegotiationState> {
        self.inner.session(|s| {
            s.negotiation
                .as_ref()
                .map(|n| n.read(|n| n.history().to_vec()))
                .unwrap_or_default()
        })
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        match self.inner.connection_listeners.write() {
            Ok(mut l) => l.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Standing subscription; sees every matching stanza, collectors notwithstanding.
    pub fn add_stanza_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        callback: impl Fn(&Stanza) + Send + Sync + 'static,
    ) {
        self.inner.stanza_listeners.add(filter, Arc::new(callback));
    }

    /// Register a collector. Create it before sending the request it waits for.
    pub fn create_collector(&self, filter: impl StanzaFilter + 'static) -> StanzaCollector {
        StanzaCollector::new(&self.inner.collectors, filter)
    }

    /// Queue a stanza for delivery in submission order.
    pub fn send(&self, stanza: Stanza) -> Result<()> {
        let writer = self
            .inner
            .session(|s| s.writer.clone())
            .ok_or(StateError::NotConnected)?;
        writer.send(stanza.into_element())
    }

    /// Send an IQ request and wait for its result, bounded by the reply timeout.
    pub async fn send_iq_and_await(&self, iq: Stanza) -> Result<Stanza> {
        let filter = IqReplyFilter::new(&iq, self.user(), self.inner.config.xmpp_domain());
        let mut collector = self.create_collector(filter);
        self.send(iq)?;
        collector.next_result(self.inner.config.reply_timeout()).await
    }

    fn notify(&self, f: impl Fn(&dyn ConnectionListener)) {
        for listener in self.inner.listeners() {
            f(listener.as_ref());
        }
    }

    /// Open the transport and negotiate up to the point where authentication can begin.
    ///
    /// After an abrupt loss of a previously authenticated connection, the last login is
    /// replayed once and `reconnection_successful` is fired.
    pub async fn connect(&self) -> Result<()> {
        let mut lc = self.inner.lifecycle.lock().await;
        if lc.live.is_some() {
            return Err(StateError::AlreadyConnected.into());
        }
        let previous = self.state();
        self.inner.set_state(ConnectionState::Connecting);

        let live = match self.open(&mut lc).await {
            Ok(live) => live,
            Err(e) => {
                error!(conn_id = self.inner.conn_id, error = %e, "Connect failed");
                self.inner.set_state(previous);
                return Err(e);
            }
        };
        info!(conn_id = self.inner.conn_id, endpoint = %live.endpoint, generation = live.generation,
            secure = live.negotiation.read(|n| n.is_secure()), "Connected");
        lc.live = Some(live);
        self.inner.set_state(ConnectionState::Connected);

        let relogin = match (lc.abrupt && lc.was_authenticated, lc.login.clone()) {
            (true, Some(login)) => {
                info!(conn_id = self.inner.conn_id, "Re-authenticating after connection loss");
                Some(self.login_locked(&mut lc, login).await)
            }
            _ => None,
        };
        lc.abrupt = false;
        drop(lc);

        self.notify(|l| l.connected());
        match relogin {
            Some(Ok(_)) => {
                self.notify(|l| l.authenticated(true));
                self.notify(|l| l.reconnection_successful());
                Ok(())
            }
            Some(Err(e)) => {
                warn!(conn_id = self.inner.conn_id, error = %e, "Re-authentication failed");
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Connect a transport, start the loops, and wait for the first usable features.
    async fn open(&self, lc: &mut Lifecycle) -> Result<Live> {
        let config = &self.inner.config;
        let endpoints = dns::endpoints_for(config.server(), config.xmpp_domain()).await;
        if endpoints.is_empty() {
            return Err(ConnectionError::NoAddresses(config.xmpp_domain().to_string()).into());
        }
        let (stream, endpoint) =
            transport::connect_any(&endpoints, config.socket_factory(), config.tls()).await?;

        let live = self.start_generation(lc, stream, endpoint);
        let ready = live
            .negotiation
            .wait_until("waiting for stream features", config.startup_timeout(), |s| {
                s.ready_for_authentication
            })
            .await;
        match ready {
            Ok(_) => Ok(live),
            Err(e) => {
                self.teardown(live, None, false).await;
                Err(e)
            }
        }
    }

    fn start_generation(&self, lc: &mut Lifecycle, stream: BoxedStream, endpoint: XmppEndpoint) -> Live {
        lc.generation += 1;
        let generation = lc.generation;
        let conn_id = self.inner.conn_id;
        let config = &self.inner.config;

        let negotiation = Arc::new(Negotiation::new(Negotiator::new(
            config.security_mode(),
            endpoint.mode == ConnectionMode::DirectTls,
        )));
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let reporter = FailureReporter::new(err_tx);
        let (read, write) = tokio::io::split(stream);

        let header = StreamHeader {
            to: Some(config.xmpp_domain().to_string()),
            version: Some("1.0".to_string()),
            lang: config.lang().map(str::to_string),
            ..Default::default()
        };
        let (writer, writer_task) = spawn_writer(
            WriterConfig {
                conn_id,
                codec: config.codec().clone(),
                header,
            },
            write,
            reporter.clone(),
        );
        let (dispatch, _dispatch_task) = spawn_dispatcher(self.inner.stanza_listeners.clone(), conn_id);
        let reader = spawn_reader(
            ReaderContext {
                conn_id,
                codec: config.codec().clone(),
                negotiation: negotiation.clone(),
                writer: writer.clone(),
                collectors: self.inner.collectors.clone(),
                dispatch,
                sasl_events: self.inner.sasl_events.clone(),
                parse_error_callback: config.parse_error_callback().clone(),
                tls: config.tls().clone(),
                tls_name: config.xmpp_domain().to_string(),
                compression_handlers: config.compression_handlers().to_vec(),
                reporter,
            },
            read,
        );
        self.spawn_supervisor(generation, negotiation.clone(), err_rx);

        self.inner.live_generation.store(generation, Ordering::Release);
        self.inner.session_mut(|s| {
            s.writer = Some(writer.clone());
            s.negotiation = Some(negotiation.clone());
            s.stream_id = None;
        });
        if let Err(e) = writer.open_stream() {
            warn!(conn_id, error = %e, "Could not queue stream header");
        }

        Live {
            generation,
            endpoint,
            negotiation,
            writer,
            writer_task,
            reader,
            authenticated: false,
        }
    }

    /// Waits for the generation's first loop failure and routes it to the error path.
    fn spawn_supervisor(&self, generation: u64, negotiation: Arc<Negotiation>, mut errors: mpsc::UnboundedReceiver<Error>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let span = tracing::debug_span!("supervisor", conn_id = self.inner.conn_id, generation);
        tokio::spawn(
            async move {
                let Some(err) = errors.recv().await else {
                    return;
                };
                negotiation.step(|n| n.fail(err.clone()));
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.live_generation.load(Ordering::Acquire) == generation {
                    // Unblock waiters before contending for the lifecycle lock.
                    inner.collectors.fail_all(StateError::NotConnected.into());
                    inner.set_sasl_events(None);
                }
                XmppConnection { inner }.notify_error_for(Some(generation), err).await;
            }
            .instrument(span),
        );
    }

    /// Authenticate, optionally compress, bind a resource and, if configured, announce
    /// presence. Returns the server-confirmed full JID.
    pub async fn login(&self, username: &str, password: &str, resource: Option<&str>) -> Result<Jid> {
        let info = LoginInfo {
            credentials: Credentials::password(username, password),
            resource: resource.unwrap_or(self.inner.config.resource()).to_string(),
        };
        self.login_with(info).await
    }

    pub async fn login_anonymously(&self) -> Result<Jid> {
        let info = LoginInfo {
            credentials: Credentials::Anonymous,
            resource: self.inner.config.resource().to_string(),
        };
        self.login_with(info).await
    }

    async fn login_with(&self, info: LoginInfo) -> Result<Jid> {
        let mut lc = self.inner.lifecycle.lock().await;
        let jid = self.login_locked(&mut lc, info).await?;
        drop(lc);
        self.notify(|l| l.authenticated(false));
        Ok(jid)
    }

    async fn login_locked(&self, lc: &mut Lifecycle, info: LoginInfo) -> Result<Jid> {
        let config = &self.inner.config;
        let conn_id = self.inner.conn_id;
        let Some(live) = lc.live.as_mut() else {
            return Err(StateError::NotConnected.into());
        };
        if live.authenticated {
            return Err(StateError::AlreadyAuthenticated.into());
        }
        let negotiation = live.negotiation.clone();
        // A failed bind leaves SASL done; the server will not offer mechanisms again.
        if negotiation.read(|n| n.is_authenticated()) {
            return Err(StateError::AlreadyAuthenticated.into());
        }
        let writer = live.writer.clone();
        let reply_timeout = config.reply_timeout();

        let snapshot = negotiation
            .wait_until("waiting for stream features", reply_timeout, |s| s.ready_for_authentication)
            .await?;
        let offered = snapshot.features.map(|f| f.mechanisms).unwrap_or_default();
        let authenticator = config
            .authenticator()
            .ok_or(AuthenticationError::NoAuthenticator)?;
        let mut mechanism = authenticator.select(&offered, &info.credentials, config.xmpp_domain())?;
        negotiation.step(|n| n.begin_authentication())?;
        info!(conn_id, mechanism = mechanism.name(), user = ?info.credentials.username(), "Authenticating");

        let (tx, mut events) = mpsc::unbounded_channel();
        self.inner.set_sasl_events(Some(tx));
        let send = |el: Element| writer.send(el);
        let exchange = sasl::run_exchange(mechanism.as_mut(), &send, &mut events, reply_timeout).await;
        self.inner.set_sasl_events(None);
        if let Err(e) = exchange {
            warn!(conn_id, error = %e, "Authentication failed");
            negotiation.step(|n| n.on_sasl_failure());
            return Err(e);
        }

        let snapshot = negotiation
            .wait_until("waiting for post-authentication features", reply_timeout, |s| s.ready_for_binding)
            .await?;

        if config.compression_enabled() {
            let offered = snapshot.features.map(|f| f.compression_methods).unwrap_or_default();
            match compression::select_handler(config.compression_handlers(), &offered) {
                Some(handler) => {
                    let actions = negotiation.step(|n| n.begin_compression(handler.method()))?;
                    for action in actions {
                        if let Action::Send(el) = action {
                            writer.send(el)?;
                        }
                    }
                    let done = negotiation
                        .wait_until("waiting for stream compression", reply_timeout, |s| match s.compression {
                            Some(CompressionOutcome::Active) => s.ready_for_binding,
                            Some(CompressionOutcome::Refused) => true,
                            _ => false,
                        })
                        .await?;
                    debug!(conn_id, outcome = ?done.compression, "Compression negotiation finished");
                }
                None => debug!(conn_id, offered = ?offered, "No common compression method"),
            }
        }

        let session_required = negotiation.step(|n| n.begin_binding())?;
        let jid = self.bind(&writer, &info.resource).await?;
        if session_required {
            let request = Stanza::iq_set(None, Element::new("session", NS_SESSION));
            self.await_reply(&writer, request, None).await?;
        }
        negotiation.step(|n| n.established(&jid));
        live.authenticated = true;

        let anonymous = matches!(info.credentials, Credentials::Anonymous);
        lc.was_authenticated = true;
        lc.login = Some(info);
        let stream_id = negotiation.read(|n| n.stream_id().map(str::to_string));
        self.inner.session_mut(|s| {
            s.user = Some(jid.clone());
            s.stream_id = stream_id;
        });
        self.inner.set_state(if anonymous {
            ConnectionState::Anonymous
        } else {
            ConnectionState::Authenticated
        });
        info!(conn_id, jid = %jid, "Logged in");

        if config.send_presence() {
            writer.send(Stanza::presence_available().into_element())?;
        }
        Ok(jid)
    }

    async fn await_reply(&self, writer: &WriterHandle, request: Stanza, local: Option<Jid>) -> Result<Stanza> {
        let filter = IqReplyFilter::new(&request, local, self.inner.config.xmpp_domain());
        let mut collector = self.create_collector(filter);
        writer.send(request.into_element())?;
        collector.next_result(self.inner.config.reply_timeout()).await
    }

    async fn bind(&self, writer: &WriterHandle, resource: &str) -> Result<Jid> {
        let mut payload = Element::new("bind", NS_BIND);
        if !resource.is_empty() {
            payload.push(Element::new("resource", NS_BIND).text(resource));
        }
        let reply = self.await_reply(writer, Stanza::iq_set(None, payload), None).await?;
        let jid = reply
            .payload()
            .and_then(|bind| bind.find("jid", NS_BIND))
            .map(|jid| jid.text_content())
            .ok_or_else(|| ProtocolError::Unexpected("bind result without <jid/>".to_string()))?;
        jid.parse::<Jid>()
            .map_err(|e| Error::from(ProtocolError::Unexpected(e.to_string())))
    }

    /// Orderly close: best-effort final presence, stream close, transport close.
    /// Every step runs even if an earlier one fails.
    pub async fn shutdown(&self, final_presence: Option<Stanza>) {
        let mut lc = self.inner.lifecycle.lock().await;
        let Some(live) = lc.live.take() else {
            debug!(conn_id = self.inner.conn_id, "Shutdown with no active stream");
            return;
        };
        let presence = if live.authenticated { final_presence } else { None };
        self.teardown(live, presence, true).await;
        lc.abrupt = false;
        self.inner.set_state(ConnectionState::Disconnected);
        drop(lc);
        self.notify(|l| l.connection_closed());
    }

    /// Shut down with unavailable presence and forget the stored login.
    pub async fn disconnect(&self) {
        self.shutdown(Some(Stanza::presence_unavailable())).await;
        let mut lc = self.inner.lifecycle.lock().await;
        lc.login = None;
        lc.was_authenticated = false;
    }

    /// Report an asynchronous failure of the current stream.
    ///
    /// Idempotent: once the loops of a generation are torn down, further reports are
    /// no-ops, so error listeners fire once per failure.
    pub async fn notify_error(&self, cause: Error) {
        self.notify_error_for(None, cause).await;
    }

    async fn notify_error_for(&self, generation: Option<u64>, cause: Error) {
        let mut lc = self.inner.lifecycle.lock().await;
        let current = match &lc.live {
            Some(live) if generation.map_or(true, |g| g == live.generation) => live.generation,
            _ => {
                debug!(conn_id = self.inner.conn_id, error = %cause, "Ignoring error for a stream that is already down");
                return;
            }
        };
        let Some(live) = lc.live.take() else {
            return;
        };
        error!(conn_id = self.inner.conn_id, generation = current, error = %cause, "Connection lost");
        live.negotiation.step(|n| n.fail(cause.clone()));
        self.teardown(live, None, false).await;
        lc.abrupt = true;
        self.inner.set_state(ConnectionState::Error);
        drop(lc);
        self.notify(|l| l.connection_closed_on_error(&cause));
    }

    /// Stop both loops of a generation and release everything bound to it.
    async fn teardown(&self, mut live: Live, final_presence: Option<Stanza>, graceful: bool) {
        self.inner.live_generation.store(0, Ordering::Release);
        self.inner.session_mut(|s| {
            s.writer = None;
        });
        self.inner.set_sasl_events(None);

        if let Some(presence) = final_presence {
            if let Err(e) = live.writer.send(presence.into_element()) {
                debug!(error = %e, "Final presence not sent");
            }
        }
        live.reader.begin_close();
        if let Err(e) = live.writer.shutdown() {
            debug!(error = %e, "Writer already stopped");
        }
        let drain = if graceful { SHUTDOWN_GRACE } else { ERROR_DRAIN };
        if tokio::time::timeout(drain, &mut live.writer_task).await.is_err() {
            warn!(generation = live.generation, "Writer did not stop in time, aborting");
            live.writer_task.abort();
        }
        if graceful && !live.reader.join(SHUTDOWN_GRACE).await {
            debug!(generation = live.generation, "No closing tag from server");
        }
        live.reader.shutdown();
        self.inner.collectors.fail_all(StateError::NotConnected.into());
        debug!(conn_id = self.inner.conn_id, generation = live.generation, "Stream torn down");
    }
}
