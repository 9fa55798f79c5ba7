//! Server address selection: explicit endpoint parsing and SRV record lookup.
//!
//! A server input string (`tls://host:port`, `tcp://host:port?domain=d`, `host:port`)
//! names one endpoint directly. Otherwise the XMPP domain is resolved through
//! `_xmpps-client._tcp` (direct TLS) then `_xmpp-client._tcp` (STARTTLS) SRV records,
//! falling back to `domain:5222` when neither exists.

use std::fmt;
use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP, upgraded in-band through STARTTLS when negotiated.
    Tcp,
    /// TLS from the first byte.
    DirectTls,
}

/// One address to attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain served at this address when it differs from `host` (SRV targets).
    /// Certificates are verified against the domain, not the SRV target (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl XmppEndpoint {
    pub fn new(host: &str, port: u16, mode: ConnectionMode) -> Self {
        Self {
            host: host.to_string(),
            port,
            mode,
            domain: None,
        }
    }

    /// Name used for SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Display for XmppEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedServer {
    /// Connect to exactly this endpoint.
    Direct(XmppEndpoint),
    /// Resolve this domain through SRV.
    Domain(String),
}

fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (
            host_port,
            query
                .split('&')
                .find_map(|kv| kv.strip_prefix("domain="))
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        ),
        None => (input, None),
    }
}

fn split_port(host_port: &str) -> (&str, Option<u16>) {
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.trim_start_matches('[').trim_end_matches(']'), Some(port)),
            Err(_) => (host_port, None),
        },
        None => (host_port, None),
    }
}

/// Parse a server input string.
///
/// - `tls://host[:port][?domain=d]` direct TLS, default port 5223
/// - `tcp://host[:port][?domain=d]` STARTTLS, default port 5222
/// - `host:port` direct (5223 means TLS, anything else STARTTLS)
/// - anything else is a domain for SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    let schemes = [
        ("tls://", ConnectionMode::DirectTls, 5223),
        ("tcp://", ConnectionMode::Tcp, 5222),
    ];
    for (scheme, mode, default_port) in schemes {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let (host_port, domain) = split_domain_param(rest);
            let (host, port) = split_port(host_port);
            return ParsedServer::Direct(XmppEndpoint {
                host: host.to_string(),
                port: port.unwrap_or(default_port),
                mode,
                domain,
            });
        }
    }

    if let (host, Some(port)) = split_port(trimmed) {
        let mode = if port == 5223 {
            ConnectionMode::DirectTls
        } else {
            ConnectionMode::Tcp
        };
        return ParsedServer::Direct(XmppEndpoint::new(host, port, mode));
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// SRV target as it appears in a record, before ordering.
#[derive(Debug, Clone)]
struct SrvTarget {
    host: String,
    port: u16,
    priority: u16,
    weight: u16,
}

/// RFC 2782 order: priority ascending, then weight descending. A `.` target means the
/// service is explicitly unavailable and is dropped.
fn order_srv_targets(mut targets: Vec<SrvTarget>) -> Vec<SrvTarget> {
    targets.retain(|t| !t.host.is_empty());
    targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    targets
}

async fn lookup_srv(
    resolver: &TokioAsyncResolver,
    domain: &str,
    service: &str,
    mode: ConnectionMode,
) -> Vec<XmppEndpoint> {
    let srv_name = format!("{service}.{domain}");
    let started = Instant::now();
    let targets = match resolver.srv_lookup(srv_name.as_str()).await {
        Ok(lookup) => lookup
            .iter()
            .map(|r| SrvTarget {
                host: r.target().to_string().trim_end_matches('.').to_string(),
                port: r.port(),
                priority: r.priority(),
                weight: r.weight(),
            })
            .collect(),
        Err(e) => {
            info!(domain, srv = %srv_name, lookup_ms = elapsed_ms(started), error = %e, "SRV lookup failed");
            return Vec::new();
        }
    };

    let endpoints: Vec<XmppEndpoint> = order_srv_targets(targets)
        .into_iter()
        .map(|t| {
            info!(domain, host = %t.host, port = t.port, priority = t.priority,
                weight = t.weight, mode = ?mode, "SRV record");
            XmppEndpoint {
                host: t.host,
                port: t.port,
                mode,
                domain: Some(domain.to_string()),
            }
        })
        .collect();
    info!(domain, srv = %srv_name, count = endpoints.len(), lookup_ms = elapsed_ms(started), "SRV resolved");
    endpoints
}

/// Resolve every candidate endpoint for `domain`, in attempt order.
pub async fn resolve_xmpp_server(domain: &str) -> Vec<XmppEndpoint> {
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system DNS config: {}, falling back to default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints =
        lookup_srv(&resolver, domain, "_xmpps-client._tcp", ConnectionMode::DirectTls).await;
    endpoints.extend(lookup_srv(&resolver, domain, "_xmpp-client._tcp", ConnectionMode::Tcp).await);

    if endpoints.is_empty() {
        warn!(domain, resolve_total_ms = elapsed_ms(started),
            "No SRV records found, using fallback: {}:5222 (STARTTLS)", domain);
        endpoints.push(XmppEndpoint::new(domain, 5222, ConnectionMode::Tcp));
    } else {
        info!(domain, total = endpoints.len(), resolve_total_ms = elapsed_ms(started),
            "SRV resolution complete");
    }
    endpoints
}

/// Endpoints for a server input, resolving through DNS when it names only a domain.
/// An empty input resolves `xmpp_domain`.
pub async fn endpoints_for(server_input: &str, xmpp_domain: &str) -> Vec<XmppEndpoint> {
    let input = if server_input.trim().is_empty() {
        xmpp_domain
    } else {
        server_input
    };
    match parse_server_input(input) {
        ParsedServer::Direct(endpoint) => {
            info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                domain = ?endpoint.domain, "Using explicit endpoint");
            vec![endpoint]
        }
        ParsedServer::Domain(domain) => resolve_xmpp_server(&domain).await,
    }
}
