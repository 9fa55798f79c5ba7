//! Scripted in-process XMPP server for connection tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::PrivatePkcs8KeyDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::codec::{Codec, Element, Frame, XmlCodec};
use crate::error::AuthenticationError;
use crate::features::{NS_BIND, NS_COMPRESS_FEATURE, NS_COMPRESS_PROTOCOL, NS_SASL, NS_SESSION, NS_TLS};
use crate::sasl::{Authenticator, Credentials, MechanismRegistry, SaslMechanism};
use crate::transport::compression::{CompressionHandler, ZlibCompression};
use crate::transport::BoxedStream;

pub const TEST_PASSWORD: &str = "secret";
const SERVICE_DOMAIN: &str = "chat.example.com";
const ECHO_NS: &str = "urn:test:echo";

/// What the server offers and how it misbehaves.
#[derive(Debug, Clone, Default)]
pub struct ServerScript {
    /// Offer STARTTLS; `Some(true)` marks it required.
    pub starttls: Option<bool>,
    /// Offer `zlib` after authentication and deflate once it is accepted.
    pub compression: bool,
    pub refuse_compression: bool,
    pub require_session: bool,
    /// Drop the first connection shortly after answering the bind request.
    pub drop_after_bind: bool,
    /// Answer the bind request with a `not-allowed` error.
    pub bind_error: bool,
    /// Answer any message with a `conflict` stream error.
    pub stream_error_on_message: bool,
    /// Send the stream header but never any features.
    pub withhold_features: bool,
    /// Start TLS as soon as the socket is accepted.
    pub direct_tls: bool,
}

pub struct TestServer {
    port: u16,
    log: Arc<Mutex<Vec<String>>>,
    cert_der: Vec<u8>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(script: ServerScript) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let certified = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        let cert_der = certified.cert.der().to_vec();
        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![certified.cert.der().clone()],
            PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into(),
        )
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let log = Arc::new(Mutex::new(Vec::new()));

        let accepted = Arc::new(AtomicUsize::new(0));
        let server_log = log.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                let session = ServerSession {
                    stream: Box::new(stream),
                    buffer: Vec::new(),
                    codec: XmlCodec::default(),
                    script: script.clone(),
                    acceptor: acceptor.clone(),
                    log: server_log.clone(),
                    index,
                };
                tokio::spawn(session.run());
            }
        });

        TestServer {
            port,
            log,
            cert_der,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn certificate_der(&self) -> Vec<u8> {
        self.cert_der.clone()
    }

    /// Units the server acted on, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Next {
    Restart,
    Close,
}

struct ServerSession {
    stream: BoxedStream,
    buffer: Vec<u8>,
    codec: XmlCodec,
    script: ServerScript,
    acceptor: TlsAcceptor,
    log: Arc<Mutex<Vec<String>>>,
    index: usize,
}

#[derive(Default)]
struct Progress {
    tls: bool,
    user: Option<String>,
    pending_user: Option<String>,
    compressed: bool,
}

impl ServerSession {
    fn record(&self, event: impl Into<String>) {
        self.log.lock().unwrap().push(event.into());
    }

    async fn write(&mut self, data: &str) -> std::io::Result<()> {
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(_) => return None,
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            }
        }
    }

    async fn run(mut self) {
        let mut progress = Progress::default();
        if self.script.direct_tls {
            let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::duplex(1).0));
            let Ok(tls) = self.acceptor.accept(plain).await else {
                return;
            };
            self.stream = Box::new(tls);
            progress.tls = true;
            self.record("tls accepted");
        }
        loop {
            match self.next_frame().await {
                Some(Frame::StreamOpen(_)) => {}
                _ => return,
            }
            let header = format!(
                "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s{}-{}' from='example.com' version='1.0'>",
                self.index,
                self.log.lock().unwrap().len()
            );
            if self.script.withhold_features {
                if self.write(&header).await.is_ok() {
                    while self.next_frame().await.is_some() {}
                }
                return;
            }
            let features = self.features(&progress);
            if self.write(&header).await.is_err() || self.write(&features).await.is_err() {
                return;
            }
            match self.serve_stream(&mut progress).await {
                Some(Next::Restart) => continue,
                Some(Next::Close) | None => return,
            }
        }
    }

    fn features(&self, progress: &Progress) -> String {
        let mut features = Element::new("features", "http://etherx.jabber.org/streams");
        let tls_required = self.script.starttls == Some(true);
        if let (Some(required), false) = (self.script.starttls, progress.tls) {
            let mut starttls = Element::new("starttls", NS_TLS);
            if required {
                starttls.push(Element::new("required", NS_TLS));
            }
            features.push(starttls);
        }
        if progress.user.is_none() {
            if !(tls_required && !progress.tls) {
                let mut mechanisms = Element::new("mechanisms", NS_SASL);
                for name in ["X-TEST", "ANONYMOUS"] {
                    mechanisms.push(Element::new("mechanism", NS_SASL).text(name));
                }
                features.push(mechanisms);
            }
        } else {
            if self.script.compression && !progress.compressed {
                features.push(
                    Element::new("compression", NS_COMPRESS_FEATURE)
                        .child(Element::new("method", NS_COMPRESS_FEATURE).text("zlib")),
                );
            }
            features.push(Element::new("bind", NS_BIND));
            if self.script.require_session {
                features.push(Element::new("session", NS_SESSION));
            }
        }
        format!(
            "<stream:features>{}</stream:features>",
            features
                .children()
                .map(|c| c.to_xml(Some("jabber:client")))
                .collect::<String>()
        )
    }

    async fn serve_stream(&mut self, progress: &mut Progress) -> Option<Next> {
        loop {
            let el = match self.next_frame().await? {
                Frame::Close => {
                    self.record("close");
                    let _ = self.write("</stream:stream>").await;
                    let _ = self.stream.shutdown().await;
                    return Some(Next::Close);
                }
                Frame::StreamOpen(_) => return None,
                Frame::Element(el) => el,
            };
            let name = el.name().to_string();
            let ns = el.ns().unwrap_or_default().to_string();
            match (name.as_str(), ns.as_str()) {
                ("starttls", NS_TLS) => {
                    self.record("starttls");
                    self.write(&format!("<proceed xmlns='{NS_TLS}'/>")).await.ok()?;
                    let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::duplex(1).0));
                    let tls = self.acceptor.accept(plain).await.ok()?;
                    self.stream = Box::new(tls);
                    self.buffer.clear();
                    progress.tls = true;
                    return Some(Next::Restart);
                }
                ("auth", NS_SASL) => {
                    let mechanism = el.get_attr("mechanism").unwrap_or_default().to_string();
                    self.record(format!("auth {mechanism}"));
                    if mechanism == "ANONYMOUS" {
                        progress.user = Some("anon".to_string());
                        self.write(&format!("<success xmlns='{NS_SASL}'/>")).await.ok()?;
                        return Some(Next::Restart);
                    }
                    let username = decode(&el.text_content());
                    progress.pending_user = Some(username.to_lowercase());
                    let challenge = STANDARD.encode("nonce");
                    self.write(&format!("<challenge xmlns='{NS_SASL}'>{challenge}</challenge>"))
                        .await
                        .ok()?;
                }
                ("response", NS_SASL) => {
                    if decode(&el.text_content()) == TEST_PASSWORD {
                        progress.user = progress.pending_user.take();
                        self.write(&format!("<success xmlns='{NS_SASL}'/>")).await.ok()?;
                        return Some(Next::Restart);
                    }
                    self.record("auth rejected");
                    self.write(&format!("<failure xmlns='{NS_SASL}'><not-authorized/></failure>"))
                        .await
                        .ok()?;
                }
                ("compress", NS_COMPRESS_PROTOCOL) => {
                    self.record("compress");
                    if self.script.refuse_compression {
                        self.write(&format!(
                            "<failure xmlns='{NS_COMPRESS_PROTOCOL}'><unsupported-method/></failure>"
                        ))
                        .await
                        .ok()?;
                    } else {
                        self.write(&format!("<compressed xmlns='{NS_COMPRESS_PROTOCOL}'/>"))
                            .await
                            .ok()?;
                        let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::duplex(1).0));
                        self.stream = ZlibCompression.wrap(plain).ok()?;
                        self.buffer.clear();
                        progress.compressed = true;
                        return Some(Next::Restart);
                    }
                }
                ("iq", _) => self.answer_iq(&el, progress).await?,
                ("message", _) if self.script.stream_error_on_message => {
                    self.record("message");
                    let _ = self
                        .write("<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error></stream:stream>")
                        .await;
                    return Some(Next::Close);
                }
                (other, _) => self.record(other.to_string()),
            }
        }
    }

    /// Returns `None` when the connection should be dropped.
    async fn answer_iq(&mut self, iq: &Element, progress: &Progress) -> Option<()> {
        let id = iq.get_attr("id").unwrap_or_default().to_string();
        let Some(payload) = iq.children().next() else {
            return Some(());
        };
        let payload_name = payload.name().to_string();
        let payload_ns = payload.ns().unwrap_or_default().to_string();
        self.record(format!("{payload_name} {id}"));

        let reply = match (payload_name.as_str(), payload_ns.as_str()) {
            ("bind", NS_BIND) if self.script.bind_error => format!(
                "<iq type='error' id='{id}'><error type='cancel'><not-allowed xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
            ),
            ("bind", NS_BIND) => {
                let resource = payload
                    .find("resource", NS_BIND)
                    .map(|r| r.text_content())
                    .unwrap_or_else(|| "generated".to_string());
                let local = progress.user.clone().unwrap_or_default();
                format!(
                    "<iq type='result' id='{id}'><bind xmlns='{NS_BIND}'><jid>{local}@{SERVICE_DOMAIN}/{resource}-srv</jid></bind></iq>"
                )
            }
            ("session", NS_SESSION) | ("query", ECHO_NS) => format!("<iq type='result' id='{id}'/>"),
            ("missing", ECHO_NS) => format!(
                "<iq type='error' id='{id}'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
            ),
            _ => return Some(()),
        };
        self.write(&reply).await.ok()?;

        if payload_name == "bind" && self.script.drop_after_bind && self.index == 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.record("drop");
            return None;
        }
        Some(())
    }
}

fn decode(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return String::new();
    }
    STANDARD
        .decode(text)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Sends the username with `<auth/>` and the password in answer to the challenge.
struct XTest {
    username: String,
    password: String,
}

impl SaslMechanism for XTest {
    fn name(&self) -> &str {
        "X-TEST"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, AuthenticationError> {
        Ok(Some(self.username.as_bytes().to_vec()))
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthenticationError> {
        if challenge != b"nonce" {
            return Err(AuthenticationError::Mechanism("unexpected challenge".to_string()));
        }
        Ok(self.password.as_bytes().to_vec())
    }
}

struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, AuthenticationError> {
        Ok(Some(Vec::new()))
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthenticationError> {
        Ok(Vec::new())
    }
}

pub fn test_authenticator() -> Arc<dyn Authenticator> {
    Arc::new(
        MechanismRegistry::new()
            .register("X-TEST", |credentials, _| {
                let (username, password) = match credentials {
                    Credentials::Password { username, password } => (username.clone(), password.clone()),
                    Credentials::Anonymous => (String::new(), String::new()),
                };
                Box::new(XTest { username, password })
            })
            .register("ANONYMOUS", |_, _| Box::new(Anonymous)),
    )
}
