//! Writer loop: the only task that writes to the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::codec::{Codec, Element, StreamHeader};
use crate::error::{Error, Result, StateError};
use crate::transport::BoxedStream;

pub type TransportWriteHalf = WriteHalf<BoxedStream>;

pub enum WriterCommand {
    /// Write a fresh stream header.
    OpenStream,
    Send(Element),
    /// Write the close tag if a stream is open, shut the write side down, and stop.
    Shutdown,
    /// Flush, hand the write half back through `release`, and wait for its replacement.
    Quiesce {
        release: oneshot::Sender<TransportWriteHalf>,
        resume: oneshot::Receiver<TransportWriteHalf>,
    },
}

/// Reports the first loop failure of one stream generation.
#[derive(Clone)]
pub struct FailureReporter {
    reported: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Error>,
}

impl FailureReporter {
    pub fn new(tx: mpsc::UnboundedSender<Error>) -> Self {
        Self {
            reported: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Returns false when a failure was already reported for this generation.
    pub fn report(&self, err: Error) -> bool {
        if self.reported.swap(true, Ordering::AcqRel) {
            debug!(error = %err, "Ignoring failure after the first");
            return false;
        }
        let _ = self.tx.send(err);
        true
    }
}

/// Caller side of the writer loop.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl WriterHandle {
    /// Queue without waiting; delivery order is submission order.
    pub fn send(&self, element: Element) -> Result<()> {
        self.command(WriterCommand::Send(element))
    }

    pub fn open_stream(&self) -> Result<()> {
        self.command(WriterCommand::OpenStream)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(WriterCommand::Shutdown)
    }

    pub fn command(&self, cmd: WriterCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| Error::State(StateError::NotConnected))
    }
}

pub struct WriterConfig {
    pub conn_id: u64,
    pub codec: Arc<dyn Codec>,
    pub header: StreamHeader,
}

pub fn spawn_writer(
    config: WriterConfig,
    half: TransportWriteHalf,
    reporter: FailureReporter,
) -> (WriterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let span = tracing::debug_span!("writer", conn_id = config.conn_id);
    let task = tokio::spawn(run_writer(config, half, rx, reporter).instrument(span));
    (WriterHandle { tx }, task)
}

async fn write_unit(half: &mut TransportWriteHalf, data: &str) -> std::io::Result<()> {
    debug!(target: "fluux_connection::wire", bytes = data.len(), "SENT {}", data);
    half.write_all(data.as_bytes()).await?;
    half.flush().await
}

async fn run_writer(
    config: WriterConfig,
    mut half: TransportWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    reporter: FailureReporter,
) {
    let mut stream_open = false;

    while let Some(cmd) = rx.recv().await {
        let result = match cmd {
            WriterCommand::OpenStream => {
                stream_open = true;
                write_unit(&mut half, &config.codec.stream_open(&config.header)).await
            }
            WriterCommand::Send(element) => write_unit(&mut half, &config.codec.encode(&element)).await,
            WriterCommand::Shutdown => {
                if stream_open {
                    let _ = write_unit(&mut half, &config.codec.stream_close()).await;
                }
                let _ = half.shutdown().await;
                info!("Writer stopped");
                return;
            }
            WriterCommand::Quiesce { release, resume } => {
                if let Err(e) = half.flush().await {
                    reporter.report(e.into());
                    return;
                }
                if release.send(half).is_err() {
                    return;
                }
                match resume.await {
                    Ok(replacement) => {
                        debug!("Writer resumed on new transport");
                        half = replacement;
                        stream_open = false;
                        Ok(())
                    }
                    Err(_) => {
                        debug!("Transport upgrade abandoned, writer exiting");
                        return;
                    }
                }
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Write failed");
            reporter.report(e.into());
            return;
        }
    }
    debug!("Writer queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{XmlCodec, NS_CLIENT};
    use tokio::io::AsyncReadExt;

    fn config() -> WriterConfig {
        WriterConfig {
            conn_id: 7,
            codec: Arc::new(XmlCodec::default()),
            header: StreamHeader {
                to: Some("example.com".into()),
                ..Default::default()
            },
        }
    }

    async fn read_all(mut peer: tokio::io::DuplexStream) -> String {
        let mut out = String::new();
        peer.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_fifo_order_and_close_tag() {
        let (client, peer) = tokio::io::duplex(4096);
        let boxed: BoxedStream = Box::new(client);
        let (_read, write) = tokio::io::split(boxed);
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_writer(config(), write, FailureReporter::new(err_tx));

        handle.open_stream().unwrap();
        handle.send(Element::new("presence", NS_CLIENT)).unwrap();
        handle
            .send(Element::new("message", NS_CLIENT).attr("id", "m1"))
            .unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();
        drop(_read);

        let written = read_all(peer).await;
        let presence = written.find("<presence/>").unwrap();
        let message = written.find("<message id='m1'/>").unwrap();
        assert!(written.starts_with("<?xml version='1.0'?><stream:stream to='example.com'"));
        assert!(presence < message);
        assert!(written.ends_with("</stream:stream>"));
        assert!(handle.send(Element::new("presence", NS_CLIENT)).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_without_open_stream_writes_nothing() {
        let (client, peer) = tokio::io::duplex(64);
        let boxed: BoxedStream = Box::new(client);
        let (read, write) = tokio::io::split(boxed);
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_writer(config(), write, FailureReporter::new(err_tx));
        handle.shutdown().unwrap();
        task.await.unwrap();
        drop(read);
        assert_eq!(read_all(peer).await, "");
    }

    #[tokio::test]
    async fn test_write_failure_reported_once() {
        let (client, peer) = tokio::io::duplex(64);
        drop(peer);
        let boxed: BoxedStream = Box::new(client);
        let (_read, write) = tokio::io::split(boxed);
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let reporter = FailureReporter::new(err_tx);
        let (handle, task) = spawn_writer(config(), write, reporter.clone());
        handle.open_stream().unwrap();
        task.await.unwrap();

        assert!(err_rx.recv().await.is_some());
        assert!(!reporter.report(StateError::NotConnected.into()));
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_quiesce_hands_back_and_resumes() {
        let (client, mut peer) = tokio::io::duplex(4096);
        let boxed: BoxedStream = Box::new(client);
        let (read, write) = tokio::io::split(boxed);
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_writer(config(), write, FailureReporter::new(err_tx));

        handle.send(Element::new("starttls", "urn:ietf:params:xml:ns:xmpp-tls")).unwrap();
        let (release_tx, release_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        handle
            .command(WriterCommand::Quiesce {
                release: release_tx,
                resume: resume_rx,
            })
            .unwrap();
        let write = release_rx.await.unwrap();

        let mut buf = vec![0u8; 128];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
        );

        let stream = read.unsplit(write);
        let (read, write) = tokio::io::split(stream);
        resume_tx.send(write).ok().unwrap();
        handle.send(Element::new("presence", NS_CLIENT)).unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();
        drop(read);

        let rest = read_all(peer).await;
        assert_eq!(rest, "<presence/>");
    }
}
