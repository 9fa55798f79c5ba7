//! rustls client setup for STARTTLS upgrades and direct-TLS endpoints.

use std::io;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, warn};

use super::BoxedStream;

/// Trust configuration for outbound TLS.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Load the platform trust store.
    pub native_roots: bool,
    /// Additional trust anchors (DER), e.g. a private CA or a test certificate.
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// Skip certificate verification entirely. Development only.
    pub dangerous_accept_any_certificate: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            native_roots: true,
            extra_roots: Vec::new(),
            dangerous_accept_any_certificate: false,
        }
    }
}

/// Install the ring provider as the process default (first call wins).
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Verifier that accepts every certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub fn create_tls_connector(settings: &TlsSettings) -> io::Result<TlsConnector> {
    init_crypto_provider();

    if settings.dangerous_accept_any_certificate {
        warn!("TLS certificate verification DISABLED");
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    if settings.native_roots {
        let native = rustls_native_certs::load_native_certs();
        if native.certs.is_empty() {
            warn!(errors = native.errors.len(), "No system root certificates found");
        }
        let (added, ignored) = root_store.add_parsable_certificates(native.certs);
        if ignored > 0 {
            warn!(added, ignored, "Some system root certificates could not be parsed");
        }
    }
    for cert in &settings.extra_roots {
        root_store
            .add(cert.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid trust anchor: {e}")))?;
    }
    if root_store.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no trust anchors available; install CA certificates or configure extra roots",
        ));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn classify(detail: &str) -> &'static str {
    if detail.contains("ertificate") {
        "certificate_error"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") {
        "connection_refused"
    } else {
        "other"
    }
}

/// Run a client handshake over `stream`, verifying the peer as `host`.
pub async fn upgrade_to_tls(stream: BoxedStream, host: &str, settings: &TlsSettings) -> io::Result<BoxedStream> {
    let connector = create_tls_connector(settings)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid server name: {e}")))?;

    match connector.connect(server_name, stream).await {
        Ok(tls) => Ok(Box::new(tls)),
        Err(e) => {
            let detail = e.to_string();
            error!(host, error = %e, error_class = classify(&detail), "TLS handshake failed");
            Err(e)
        }
    }
}
