// fluux-probe: connect to an XMPP service, negotiate the stream and print what it offers.

use fluux_connection::config::ConnectionConfigBuilder;
use fluux_connection::{ConnectionConfig, XmppConnection};

fn print_startup_diagnostics() {
    eprintln!("fluux-probe v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("---");
}

fn print_help() {
    eprintln!("fluux-probe v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-probe [OPTIONS] <DOMAIN> [SERVER]");
    eprintln!();
    eprintln!("SERVER is tls://host:port, tcp://host:port[?domain=d] or host:port.");
    eprintln!("Without it, the domain is resolved through DNS SRV.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("      --config=PATH     Load connection settings from a TOML file");
    eprintln!("      --json            Print the advertised features as JSON");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

/// Always log to a daily-rotating file; add stderr output on request.
fn init_tracing(verbose_level: Option<&str>, log_file_path: Option<&str>) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = match log_file_path {
        Some(path) => std::path::PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("com.processone.fluux")
            .join("logs"),
    };
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();
    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_connection=info,fluux_probe=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-probe.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_connection=debug,fluux_connection::wire=debug,info")
        } else {
            EnvFilter::new("fluux_connection=info,fluux_connection::wire=off,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
    eprintln!("Log file: {}", log_dir.display());
    guard
}

async fn probe(config: ConnectionConfig, json: bool) -> Result<(), fluux_connection::Error> {
    let connection = XmppConnection::new(config);
    connection.connect().await?;

    let features = connection.features().unwrap_or_default();
    if json {
        let report = serde_json::json!({
            "domain": connection.config().xmpp_domain(),
            "secure": connection.is_secure(),
            "stream_id": connection.stream_id(),
            "negotiation": connection
                .negotiation_history()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
            "features": features,
        });
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{}", out),
            Err(e) => tracing::error!("Could not serialize report: {}", e),
        }
    } else {
        println!("Domain:      {}", connection.config().xmpp_domain());
        println!("Secure:      {}", connection.is_secure());
        println!("Stream id:   {}", connection.stream_id().unwrap_or_default());
        println!("Mechanisms:  {}", features.mechanisms.join(", "));
        println!("Compression: {}", features.compression_methods.join(", "));
        println!("Bind:        {}", features.bind);
        for (name, ns) in &features.other {
            println!("Other:       {} ({})", name, ns);
        }
    }

    connection.shutdown(None).await;
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }

    let dangerous_insecure_tls = args.iter().any(|arg| arg == "--dangerous-insecure-tls");
    if dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    // --verbose / -v (no XMPP packets) or --verbose=xmpp (with packets)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let log_file_path = args.iter().find_map(|arg| arg.strip_prefix("--log-file="));
    let config_path = args.iter().find_map(|arg| arg.strip_prefix("--config="));
    let json = args.iter().any(|arg| arg == "--json");
    let positional: Vec<&String> = args.iter().skip(1).filter(|arg| !arg.starts_with('-')).collect();

    let _guard = init_tracing(verbose_level, log_file_path);
    if verbose_level.is_some() || log_file_path.is_some() {
        print_startup_diagnostics();
    }

    let builder = match (config_path, positional.first()) {
        (Some(path), _) => match ConnectionConfigBuilder::from_toml_file(path) {
            Ok(builder) => builder,
            Err(e) => {
                eprintln!("Error: could not load '{}': {}", path, e);
                std::process::exit(2);
            }
        },
        (None, Some(domain)) => ConnectionConfig::builder(domain),
        (None, None) => {
            print_help();
            std::process::exit(2);
        }
    };
    let server = positional.get(if config_path.is_some() { 0 } else { 1 });
    let builder = match server {
        Some(server) => builder.server(server),
        None => builder,
    };
    let builder = if dangerous_insecure_tls {
        builder.dangerous_accept_any_certificate(true)
    } else {
        builder
    };
    let config = builder.build();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: could not start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(probe(config, json)) {
        tracing::error!("Probe failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
