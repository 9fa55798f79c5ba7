//! Connection configuration.
//!
//! [`ConnectionConfig`] is immutable once built. The serialisable subset can be loaded
//! from TOML; collaborators (authenticator, socket factory, compression handlers, codec)
//! are attached on the builder.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::codec::{Codec, XmlCodec};
use crate::sasl::Authenticator;
use crate::transport::{CompressionHandler, SocketFactory, TcpSocketFactory, TlsSettings, ZlibCompression, TCP_CONNECT_TIMEOUT};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESOURCE: &str = "fluux";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Local TLS policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Refuse to continue without TLS.
    Required,
    /// Use TLS when the server offers it.
    #[default]
    Opportunistic,
    /// Never negotiate TLS; fails if the server requires it.
    Disabled,
}

/// A unit the codec could not parse.
#[derive(Debug, Clone)]
pub struct UnparseableUnit {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorAction {
    Continue,
    Disconnect,
}

pub type ParseErrorCallback = Arc<dyn Fn(&UnparseableUnit) -> ParseErrorAction + Send + Sync>;

/// Treats any unparseable unit as fatal for the connection.
pub fn disconnect_on_parse_error() -> ParseErrorCallback {
    Arc::new(|unit: &UnparseableUnit| {
        warn!(reason = %unit.reason, "Unparseable unit, closing connection");
        ParseErrorAction::Disconnect
    })
}

/// Logs and skips unparseable units.
pub fn log_and_continue() -> ParseErrorCallback {
    Arc::new(|unit: &UnparseableUnit| {
        warn!(reason = %unit.reason, raw = %unit.raw, "Skipping unparseable unit");
        ParseErrorAction::Continue
    })
}

#[derive(Clone)]
pub struct ConnectionConfig {
    xmpp_domain: String,
    server: String,
    security_mode: SecurityMode,
    compression_enabled: bool,
    compression_handlers: Vec<Arc<dyn CompressionHandler>>,
    reply_timeout: Duration,
    startup_timeout: Duration,
    send_presence: bool,
    resource: String,
    lang: Option<String>,
    socket_factory: Arc<dyn SocketFactory>,
    tls: TlsSettings,
    authenticator: Option<Arc<dyn Authenticator>>,
    parse_error_callback: ParseErrorCallback,
    codec: Arc<dyn Codec>,
}

impl ConnectionConfig {
    pub fn builder(xmpp_domain: &str) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(xmpp_domain)
    }

    pub fn xmpp_domain(&self) -> &str {
        &self.xmpp_domain
    }

    /// Explicit server input; empty means DNS SRV on the domain.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    pub fn compression_handlers(&self) -> &[Arc<dyn CompressionHandler>] {
        &self.compression_handlers
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn send_presence(&self) -> bool {
        self.send_presence
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    pub fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.socket_factory
    }

    pub fn tls(&self) -> &TlsSettings {
        &self.tls
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    pub fn parse_error_callback(&self) -> &ParseErrorCallback {
        &self.parse_error_callback
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("xmpp_domain", &self.xmpp_domain)
            .field("server", &self.server)
            .field("security_mode", &self.security_mode)
            .field("compression_enabled", &self.compression_enabled)
            .field(
                "compression_methods",
                &self.compression_handlers.iter().map(|h| h.method()).collect::<Vec<_>>(),
            )
            .field("reply_timeout", &self.reply_timeout)
            .field("startup_timeout", &self.startup_timeout)
            .field("send_presence", &self.send_presence)
            .field("resource", &self.resource)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// TOML representation of the serialisable settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    domain: String,
    #[serde(default)]
    server: String,
    #[serde(default)]
    security: SecurityMode,
    #[serde(default)]
    compression: bool,
    reply_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    startup_timeout_ms: Option<u64>,
    send_presence: Option<bool>,
    resource: Option<String>,
    lang: Option<String>,
    #[serde(default)]
    tls: FileTlsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTlsConfig {
    native_roots: Option<bool>,
    #[serde(default)]
    dangerous_accept_any_certificate: bool,
}

pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
    connect_timeout: Duration,
    custom_socket_factory: bool,
}

impl ConnectionConfigBuilder {
    pub fn new(xmpp_domain: &str) -> Self {
        Self {
            config: ConnectionConfig {
                xmpp_domain: xmpp_domain.trim().to_ascii_lowercase(),
                server: String::new(),
                security_mode: SecurityMode::default(),
                compression_enabled: false,
                compression_handlers: vec![Arc::new(ZlibCompression)],
                reply_timeout: DEFAULT_REPLY_TIMEOUT,
                startup_timeout: DEFAULT_STARTUP_TIMEOUT,
                send_presence: true,
                resource: DEFAULT_RESOURCE.to_string(),
                lang: None,
                socket_factory: Arc::new(TcpSocketFactory::default()),
                tls: TlsSettings::default(),
                authenticator: None,
                parse_error_callback: disconnect_on_parse_error(),
                codec: Arc::new(XmlCodec::default()),
            },
            connect_timeout: TCP_CONNECT_TIMEOUT,
            custom_socket_factory: false,
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(input)?;
        if file.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("domain must not be empty".to_string()));
        }
        let mut builder = Self::new(&file.domain)
            .server(&file.server)
            .security_mode(file.security)
            .compression(file.compression)
            .dangerous_accept_any_certificate(file.tls.dangerous_accept_any_certificate);
        if let Some(ms) = file.reply_timeout_ms {
            builder = builder.reply_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = file.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = file.startup_timeout_ms {
            builder = builder.startup_timeout(Duration::from_millis(ms));
        }
        if let Some(send) = file.send_presence {
            builder = builder.send_presence(send);
        }
        if let Some(resource) = &file.resource {
            builder = builder.resource(resource);
        }
        if let Some(lang) = &file.lang {
            builder = builder.lang(lang);
        }
        if let Some(native) = file.tls.native_roots {
            builder = builder.native_roots(native);
        }
        Ok(builder)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn server(mut self, server: &str) -> Self {
        self.config.server = server.trim().to_string();
        self
    }

    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.config.security_mode = mode;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression_enabled = enabled;
        self
    }

    /// Registers another method; `zlib` is registered by default and tried first.
    pub fn compression_handler(mut self, handler: Arc<dyn CompressionHandler>) -> Self {
        self.config.compression_handlers.push(handler);
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn send_presence(mut self, send: bool) -> Self {
        self.config.send_presence = send;
        self
    }

    pub fn resource(mut self, resource: &str) -> Self {
        self.config.resource = resource.to_string();
        self
    }

    pub fn lang(mut self, lang: &str) -> Self {
        self.config.lang = Some(lang.to_string());
        self
    }

    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.config.socket_factory = factory;
        self.custom_socket_factory = true;
        self
    }

    pub fn native_roots(mut self, enabled: bool) -> Self {
        self.config.tls.native_roots = enabled;
        self
    }

    pub fn trust_anchor_der(mut self, der: Vec<u8>) -> Self {
        self.config.tls.extra_roots.push(der.into());
        self
    }

    pub fn dangerous_accept_any_certificate(mut self, enabled: bool) -> Self {
        self.config.tls.dangerous_accept_any_certificate = enabled;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.config.authenticator = Some(authenticator);
        self
    }

    pub fn parse_error_callback(mut self, callback: ParseErrorCallback) -> Self {
        self.config.parse_error_callback = callback;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn build(mut self) -> ConnectionConfig {
        if !self.custom_socket_factory {
            self.config.socket_factory = Arc::new(TcpSocketFactory {
                connect_timeout: self.connect_timeout,
            });
        }
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::builder(" Example.COM ").build();
        assert_eq!(config.xmpp_domain(), "example.com");
        assert_eq!(config.server(), "");
        assert_eq!(config.security_mode(), SecurityMode::Opportunistic);
        assert_eq!(config.reply_timeout(), Duration::from_secs(5));
        assert!(config.send_presence());
        assert!(!config.compression_enabled());
        let methods: Vec<&str> = config.compression_handlers().iter().map(|h| h.method()).collect();
        assert_eq!(methods, vec!["zlib"]);
        assert!(config.authenticator().is_none());
        assert!(config.tls().native_roots);
    }

    #[test]
    fn test_from_toml() {
        let config = ConnectionConfigBuilder::from_toml_str(
            r#"
            domain = "example.com"
            server = "tcp://127.0.0.1:5222"
            security = "required"
            compression = true
            reply_timeout_ms = 2500
            resource = "probe"

            [tls]
            native_roots = false
            "#,
        )
        .unwrap()
        .build();
        assert_eq!(config.server(), "tcp://127.0.0.1:5222");
        assert_eq!(config.security_mode(), SecurityMode::Required);
        assert!(config.compression_enabled());
        assert_eq!(config.reply_timeout(), Duration::from_millis(2500));
        assert_eq!(config.resource(), "probe");
        assert!(!config.tls().native_roots);
    }

    #[test]
    fn test_toml_rejects_unknown_keys_and_empty_domain() {
        assert!(matches!(
            ConnectionConfigBuilder::from_toml_str("domain = \"a\"\nbogus = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ConnectionConfigBuilder::from_toml_str("domain = \" \""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_error_policies() {
        let unit = UnparseableUnit {
            raw: "<x>".into(),
            reason: "bad".into(),
        };
        assert_eq!(disconnect_on_parse_error()(&unit), ParseErrorAction::Disconnect);
        assert_eq!(log_and_continue()(&unit), ParseErrorAction::Continue);
    }
}
