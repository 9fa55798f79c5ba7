//! Reader loop: the only task that reads from the transport.
//!
//! Each inbound unit is classified and routed: stream-level events drive the
//! [`Negotiation`], SASL verdicts go to the waiting login, stanzas go first to the
//! [`PendingTable`] and then, independently, to the listener dispatch queue. TLS and
//! compression activation happen here as well, because the reader is the task that
//! observes `<proceed/>` and `<compressed/>` and owns the read half that must be rejoined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::codec::{Codec, DecodeError, Element, Frame, NS_STREAMS};
use crate::collector::PendingTable;
use crate::config::{ParseErrorAction, ParseErrorCallback, UnparseableUnit};
use crate::error::{Error, NegotiationError, ProtocolError, Result, StateError};
use crate::features::{StreamFeatures, NS_COMPRESS_PROTOCOL, NS_SASL, NS_TLS};
use crate::negotiation::{Action, Negotiation};
use crate::sasl::{parse_sasl_event, SaslEvent};
use crate::stanza::Stanza;
use crate::transport::{tls, BoxedStream, CompressionHandler, TlsSettings};
use crate::writer::{FailureReporter, WriterCommand, WriterHandle};

/// Inbound buffer ceiling without a complete unit.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const READ_CHUNK: usize = 8192;

pub type TransportReadHalf = ReadHalf<BoxedStream>;

/// Where the reader forwards SASL units while a login is in progress.
pub type SaslEventSlot = Arc<Mutex<Option<mpsc::UnboundedSender<SaslEvent>>>>;

pub struct ReaderContext {
    pub conn_id: u64,
    pub codec: Arc<dyn Codec>,
    pub negotiation: Arc<Negotiation>,
    pub writer: WriterHandle,
    pub collectors: Arc<PendingTable>,
    pub dispatch: mpsc::UnboundedSender<Stanza>,
    pub sasl_events: SaslEventSlot,
    pub parse_error_callback: ParseErrorCallback,
    pub tls: TlsSettings,
    /// Name the STARTTLS certificate is verified against.
    pub tls_name: String,
    pub compression_handlers: Vec<Arc<dyn CompressionHandler>>,
    pub reporter: FailureReporter,
}

pub struct ReaderHandle {
    cancel: CancellationToken,
    closing: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    /// From now on EOF, close tags and errors are expected and not reported.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Wait for the loop to end on its own, at most `grace`.
    pub async fn join(&mut self, grace: std::time::Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        let done = tokio::time::timeout(grace, task).await.is_ok();
        if done {
            self.task = None;
        }
        done
    }

    /// Stop reading now. Later failures are discarded.
    pub fn shutdown(&mut self) {
        self.begin_close();
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn spawn_reader(ctx: ReaderContext, half: TransportReadHalf) -> ReaderHandle {
    let cancel = CancellationToken::new();
    let closing = Arc::new(AtomicBool::new(false));
    let span = tracing::debug_span!("reader", conn_id = ctx.conn_id);
    let reader = Reader {
        ctx,
        cancel: cancel.clone(),
        closing: closing.clone(),
    };
    let task = tokio::spawn(reader.run(half).instrument(span));
    ReaderHandle {
        cancel,
        closing,
        task: Some(task),
    }
}

enum Upgrade {
    Tls,
    Compression(String),
}

enum Flow {
    Continue,
    Upgrade(Upgrade),
    Stop,
}

struct Reader {
    ctx: ReaderContext,
    cancel: CancellationToken,
    closing: Arc<AtomicBool>,
}

impl Reader {
    fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn fail(&self, err: Error) {
        if self.closing() {
            debug!(error = %err, "Discarding reader error after shutdown");
            return;
        }
        self.ctx.reporter.report(err);
    }

    async fn run(self, mut half: TransportReadHalf) {
        let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            loop {
                let frame = match self.ctx.codec.decode(&mut buffer) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(DecodeError::Malformed { raw, reason }) => {
                        if self.closing() {
                            debug!(reason = %reason, "Discarding unparseable unit after shutdown");
                            continue;
                        }
                        let unit = UnparseableUnit { raw, reason };
                        match (self.ctx.parse_error_callback)(&unit) {
                            ParseErrorAction::Continue => continue,
                            ParseErrorAction::Disconnect => {
                                self.fail(ProtocolError::Malformed(unit.reason).into());
                                return;
                            }
                        }
                    }
                    Err(DecodeError::Syntax(reason)) => {
                        self.fail(ProtocolError::Malformed(reason).into());
                        return;
                    }
                };

                match self.handle_frame(frame) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => return,
                    Ok(Flow::Upgrade(upgrade)) => {
                        if !buffer.is_empty() {
                            warn!(bytes = buffer.len(), "Discarding bytes received before transport upgrade");
                            buffer.clear();
                        }
                        half = match self.upgrade(half, upgrade).await {
                            Ok(half) => half,
                            Err(e) => {
                                self.ctx.negotiation.step(|n| n.fail(e.clone()));
                                self.fail(e);
                                return;
                            }
                        };
                    }
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            }

            if buffer.len() > MAX_BUFFER_SIZE {
                self.fail(
                    ProtocolError::BufferOverflow {
                        limit: MAX_BUFFER_SIZE,
                    }
                    .into(),
                );
                return;
            }

            let read = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Reader cancelled");
                    return;
                }
                read = half.read(&mut chunk) => read,
            };

            match read {
                Ok(0) => {
                    if self.closing() {
                        debug!("Transport closed");
                    } else {
                        info!("Connection closed by server (EOF)");
                        self.fail(ProtocolError::Eof.into());
                    }
                    return;
                }
                Ok(n) => {
                    debug!(target: "fluux_connection::wire", bytes = n, "RECV {}", String::from_utf8_lossy(&chunk[..n]));
                    buffer.extend_from_slice(&chunk[..n]);
                }
                Err(e) => {
                    if !self.closing() {
                        warn!(error = %e, "Read failed");
                    }
                    self.fail(e.into());
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame) -> Result<Flow> {
        match frame {
            Frame::StreamOpen(header) => {
                debug!(id = ?header.id, from = ?header.from, "Stream opened by server");
                self.ctx.negotiation.step(|n| n.on_stream_opened(&header));
                Ok(Flow::Continue)
            }
            Frame::Close => {
                if self.closing() {
                    debug!("Server closed the stream");
                } else {
                    info!("Server closed the stream unexpectedly");
                    self.fail(ProtocolError::StreamClosed.into());
                }
                Ok(Flow::Stop)
            }
            Frame::Element(el) => self.handle_element(el),
        }
    }

    fn handle_element(&self, el: Element) -> Result<Flow> {
        let name = el.name().to_string();
        let ns = el.ns().unwrap_or_default().to_string();
        match (name.as_str(), ns.as_str()) {
            ("features", NS_STREAMS) => {
                let features = StreamFeatures::from_element(&el);
                debug!(features = ?features, "Stream features received");
                let actions = self.ctx.negotiation.step(|n| n.on_features(features));
                self.apply(actions)
            }
            ("error", NS_STREAMS) => {
                let err = stream_error(&el);
                warn!(error = %err, "Stream error from server");
                self.fail(err.into());
                Ok(Flow::Stop)
            }
            ("proceed", NS_TLS) => {
                let actions = self.ctx.negotiation.step(|n| n.on_tls_proceed());
                self.apply(actions)
            }
            ("failure", NS_TLS) => {
                self.ctx.negotiation.step(|n| n.on_tls_failure());
                Ok(Flow::Continue)
            }
            ("compressed", NS_COMPRESS_PROTOCOL) => {
                let actions = self.ctx.negotiation.step(|n| n.on_compressed());
                self.apply(actions)
            }
            ("failure", NS_COMPRESS_PROTOCOL) => {
                let reason = el
                    .children()
                    .next()
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "failure".to_string());
                self.ctx.negotiation.step(|n| n.on_compression_failure(&reason));
                Ok(Flow::Continue)
            }
            (_, NS_SASL) => self.handle_sasl(&el),
            _ => {
                match Stanza::from_element(el) {
                    Some(stanza) => self.route(stanza),
                    None => debug!(name = %name, ns = %ns, "Ignoring unexpected top-level element"),
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_sasl(&self, el: &Element) -> Result<Flow> {
        let Some(event) = parse_sasl_event(el)? else {
            debug!(name = el.name(), "Ignoring SASL element");
            return Ok(Flow::Continue);
        };
        let success = matches!(event, SaslEvent::Success(_));

        let forwarded = match self.ctx.sasl_events.lock() {
            Ok(slot) => slot.as_ref().map(|tx| tx.send(event).is_ok()),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|tx| tx.send(event).is_ok()),
        };
        if forwarded != Some(true) {
            debug!("SASL unit received with no login in progress");
        }

        if success {
            let actions = self.ctx.negotiation.step(|n| n.on_sasl_success());
            return self.apply(actions);
        }
        Ok(Flow::Continue)
    }

    /// Collector first, then every listener, each independently.
    fn route(&self, stanza: Stanza) {
        let collected = self.ctx.collectors.deliver(&stanza);
        debug!(kind = ?stanza.kind(), id = ?stanza.id(), collected, "Stanza received");
        if self.ctx.dispatch.send(stanza).is_err() {
            debug!("Listener dispatch closed");
        }
    }

    fn apply(&self, actions: Vec<Action>) -> Result<Flow> {
        let mut flow = Flow::Continue;
        for action in actions {
            match action {
                Action::Send(el) => self.ctx.writer.send(el)?,
                Action::RestartStream => self.ctx.writer.open_stream()?,
                Action::UpgradeTls => flow = Flow::Upgrade(Upgrade::Tls),
                Action::ActivateCompression(method) => flow = Flow::Upgrade(Upgrade::Compression(method)),
            }
        }
        Ok(flow)
    }

    /// Quiesce the writer, rejoin the transport, layer it, and resume both loops on it.
    async fn upgrade(&self, read: TransportReadHalf, upgrade: Upgrade) -> Result<TransportReadHalf> {
        let (release_tx, release_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        self.ctx.writer.command(WriterCommand::Quiesce {
            release: release_tx,
            resume: resume_rx,
        })?;
        let write = release_rx
            .await
            .map_err(|_| Error::State(StateError::NotConnected))?;
        let stream = read.unsplit(write);

        let (stream, actions) = match upgrade {
            Upgrade::Tls => {
                info!(server_name = %self.ctx.tls_name, "Starting TLS handshake");
                let stream = tls::upgrade_to_tls(stream, &self.ctx.tls_name, &self.ctx.tls)
                    .await
                    .map_err(|e| NegotiationError::TlsHandshake {
                        host: self.ctx.tls_name.clone(),
                        reason: e.to_string(),
                    })?;
                (stream, self.ctx.negotiation.step(|n| n.tls_established()))
            }
            Upgrade::Compression(method) => {
                let handler = self
                    .ctx
                    .compression_handlers
                    .iter()
                    .find(|h| h.method() == method)
                    .ok_or_else(|| NegotiationError::Compression(format!("no handler for '{method}'")))?;
                let stream = handler
                    .wrap(stream)
                    .map_err(|e| NegotiationError::Compression(e.to_string()))?;
                info!(method = %method, "Stream compression active");
                (stream, self.ctx.negotiation.step(|n| n.compression_established()))
            }
        };

        let (read, write) = tokio::io::split(stream);
        if resume_tx.send(write).is_err() {
            return Err(StateError::NotConnected.into());
        }
        self.apply(actions)?;
        Ok(read)
    }
}

fn stream_error(el: &Element) -> ProtocolError {
    const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    let condition = el
        .children()
        .find(|c| c.ns() == Some(NS_STREAM_ERRORS) && c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = el
        .find("text", NS_STREAM_ERRORS)
        .map(|t| t.text_content())
        .filter(|t| !t.is_empty());
    ProtocolError::StreamError { condition, text }
}
