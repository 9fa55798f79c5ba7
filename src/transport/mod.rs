//! Byte transport: socket creation, address fallback, TLS and compression layers.

pub mod compression;
pub mod dns;
pub mod tls;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{error, info};

use crate::error::{ConnectionError, FailedAddress};

pub use compression::{CompressionHandler, ZlibCompression};
pub use dns::{ConnectionMode, ParsedServer, XmppEndpoint};
pub use tls::TlsSettings;

/// Default bound on a single TCP connect.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// A transport whose concrete layering (plain, TLS, compressed) is erased.
pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Opens plain byte channels to endpoints.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, endpoint: &XmppEndpoint) -> io::Result<BoxedStream>;
}

#[derive(Debug, Clone)]
pub struct TcpSocketFactory {
    pub connect_timeout: Duration,
}

impl Default for TcpSocketFactory {
    fn default() -> Self {
        Self {
            connect_timeout: TCP_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(&self, endpoint: &XmppEndpoint) -> io::Result<BoxedStream> {
        let addr = (endpoint.host.as_str(), endpoint.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("TCP connect timed out after {}s", self.connect_timeout.as_secs()),
                )
            })??;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

async fn open_endpoint(
    endpoint: &XmppEndpoint,
    factory: &Arc<dyn SocketFactory>,
    tls: &TlsSettings,
) -> io::Result<BoxedStream> {
    let stream = factory.connect(endpoint).await?;
    match endpoint.mode {
        ConnectionMode::Tcp => Ok(stream),
        ConnectionMode::DirectTls => tls::upgrade_to_tls(stream, endpoint.tls_name(), tls).await,
    }
}

/// Try each endpoint in order and return the first that connects.
///
/// Direct-TLS endpoints are wrapped before returning; a failed handshake counts as that
/// endpoint's failure. When nothing connects, every attempt is reported in order.
pub async fn connect_any(
    endpoints: &[XmppEndpoint],
    factory: &Arc<dyn SocketFactory>,
    tls: &TlsSettings,
) -> Result<(BoxedStream, XmppEndpoint), ConnectionError> {
    let mut failures = Vec::new();

    for endpoint in endpoints {
        let started = Instant::now();
        match open_endpoint(endpoint, factory, tls).await {
            Ok(stream) => {
                info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                    connect_ms = started.elapsed().as_millis() as u64, "Connected");
                return Ok((stream, endpoint.clone()));
            }
            Err(e) => {
                error!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                    error = %e, error_kind = ?e.kind(), "Connect attempt failed");
                failures.push(FailedAddress {
                    address: endpoint.clone(),
                    cause: Arc::new(e),
                });
            }
        }
    }

    if failures.is_empty() {
        return Err(ConnectionError::NoAddresses(String::new()));
    }
    Err(ConnectionError::AllAddressesFailed(failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Records every attempt and only succeeds for listed hosts.
    struct ScriptedFactory {
        reachable: Vec<String>,
        attempts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SocketFactory for ScriptedFactory {
        async fn connect(&self, endpoint: &XmppEndpoint) -> io::Result<BoxedStream> {
            self.attempts.lock().unwrap().push(endpoint.host.clone());
            if self.reachable.contains(&endpoint.host) {
                let (client, _server) = tokio::io::duplex(64);
                Ok(Box::new(client))
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, format!("{} refused", endpoint.host)))
            }
        }
    }

    fn endpoints(hosts: &[&str]) -> Vec<XmppEndpoint> {
        hosts
            .iter()
            .map(|h| XmppEndpoint::new(h, 5222, ConnectionMode::Tcp))
            .collect()
    }

    #[tokio::test]
    async fn test_connect_any_stops_at_first_reachable() {
        let factory = Arc::new(ScriptedFactory {
            reachable: vec!["b".into(), "c".into()],
            attempts: Mutex::new(Vec::new()),
        });
        let dyn_factory: Arc<dyn SocketFactory> = factory.clone();
        let (_, endpoint) = connect_any(&endpoints(&["a", "b", "c"]), &dyn_factory, &TlsSettings::default())
            .await
            .unwrap();
        assert_eq!(endpoint.host, "b");
        assert_eq!(*factory.attempts.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_connect_any_aggregates_every_failure_in_order() {
        let factory: Arc<dyn SocketFactory> = Arc::new(ScriptedFactory {
            reachable: vec![],
            attempts: Mutex::new(Vec::new()),
        });
        let err = match connect_any(&endpoints(&["a", "b", "c"]), &factory, &TlsSettings::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected failure"),
        };
        let hosts: Vec<_> = err.failures().iter().map(|f| f.address.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
        let text = err.to_string();
        assert!(text.contains("'a:5222' failed because: a refused"));
        assert!(text.find("'b:5222'").unwrap() < text.find("'c:5222'").unwrap());
    }

    #[tokio::test]
    async fn test_tcp_factory_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let factory = TcpSocketFactory::default();
        let endpoint = XmppEndpoint::new("127.0.0.1", port, ConnectionMode::Tcp);
        assert!(factory.connect(&endpoint).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_factory_reports_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let factory = TcpSocketFactory::default();
        let endpoint = XmppEndpoint::new("127.0.0.1", port, ConnectionMode::Tcp);
        assert!(factory.connect(&endpoint).await.is_err());
    }
}
