//! h2tunnel - Expose a TCP service reachable only through an HTTP/2 CONNECT proxy
//!
//! Listens locally and turns every accepted connection into one CONNECT stream
//! on the backend.

use anyhow::{Context, Result};
use clap::Parser;
use h2tunnel_core::{DebugSink, TunnelConfig, TunnelListener};
use h2tunnel_transport::{BackendTarget, H2Config, H2Transport, KEY_LOG_ENV};
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// h2tunnel - Tunnel local TCP clients through an HTTP/2 CONNECT proxy
#[derive(Parser, Debug)]
#[command(name = "h2tunnel")]
#[command(about = "h2tunnel - Tunnel local TCP clients through an HTTP/2 CONNECT proxy")]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("H2TUNNEL_COMMIT"), ", built ", env!("H2TUNNEL_BUILD_DATE"), ")"))]
#[command(long_about = r#"
Accepts TCP connections locally and forwards each one over its own HTTP/2
CONNECT stream to the backend (for example an Envoy listener). Unless disabled,
a PROXY protocol v1 line carrying the client port is sent ahead of the
client's first bytes.

EXAMPLES:
  # Expose a MySQL server behind Envoy on the default local port
  h2tunnel --backend https://envoy.example.com:443

  # Listen on another port, talk to a cleartext HTTP/2 proxy
  h2tunnel --backend http://127.0.0.1:10000 --port 13306

ENVIRONMENT VARIABLES:
  H2TUNNEL_BACKEND   Backend URL
  H2TUNNEL_LISTEN    Local listen address
  H2TUNNEL_TARGET    CONNECT target
  SSLKEYLOGFILE      Write TLS session secrets (NSS key log format)
  RUST_LOG           Override the log filter
"#)]
struct Cli {
    /// URL of the HTTP/2 proxy (https:// or http:// for cleartext h2)
    #[arg(long, env = "H2TUNNEL_BACKEND")]
    backend: String,

    /// Local address to listen on
    #[arg(long, env = "H2TUNNEL_LISTEN", default_value = "127.0.0.1:3306")]
    listen: SocketAddr,

    /// Port to listen on (overrides the port of --listen)
    #[arg(short, long)]
    port: Option<u16>,

    /// Authority sent in the CONNECT request and used as the PROXY destination
    #[arg(long, env = "H2TUNNEL_TARGET", default_value = "127.0.0.1:3306")]
    target: SocketAddrV4,

    /// Do not prepend a PROXY protocol v1 line
    #[arg(long)]
    no_proxy_header: bool,

    /// Enable debug logging, including per read/write byte counts
    #[arg(short, long)]
    debug: bool,

    /// Skip backend certificate verification (development only)
    #[arg(long)]
    insecure: bool,

    /// PEM bundle of CA certificates to trust instead of the webpki roots
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Seconds between HTTP/2 PING health checks (0 disables)
    #[arg(long, default_value = "60")]
    read_idle_timeout: u64,

    /// TCP connect timeout towards the backend in seconds
    #[arg(long, default_value = "5")]
    connect_timeout: u64,
}

fn setup_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn build_h2_config(cli: &Cli, debug: DebugSink) -> Result<H2Config> {
    let read_idle_timeout = match cli.read_idle_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let mut config = H2Config::client_default()
        .with_read_idle_timeout(read_idle_timeout)
        .with_connect_timeout(Duration::from_secs(cli.connect_timeout))
        .with_key_log_from_env()
        .with_debug(debug);

    if cli.insecure {
        config = config.with_insecure_skip_verify();
    }
    if let Some(path) = &cli.ca_cert {
        config = config
            .with_ca_cert(path)
            .with_context(|| format!("Failed to load CA bundle {}", path.display()))?;
    }

    config.validate().context("Invalid HTTP/2 configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.debug);

    let backend = BackendTarget::parse(&cli.backend)
        .with_context(|| format!("Invalid --backend '{}'", cli.backend))?;

    let debug = DebugSink::new(cli.debug);
    let h2_config = build_h2_config(&cli, debug)?;

    info!("Backend: {}", backend);
    info!("CONNECT target: {}", cli.target);
    if cli.insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
    }
    if let Some(path) = &h2_config.key_log_path {
        warn!("Writing TLS secrets to {} ({} is set)", path.display(), KEY_LOG_ENV);
    }
    if cli.no_proxy_header {
        info!("PROXY header disabled");
    }

    let transport = Arc::new(
        H2Transport::new(Arc::new(h2_config)).context("Failed to create HTTP/2 transport")?,
    );

    let mut listen = cli.listen;
    if let Some(port) = cli.port {
        listen.set_port(port);
    }

    let tunnel_config = TunnelConfig {
        target: cli.target,
        proxy_header: !cli.no_proxy_header,
        debug,
    };

    let listener = TunnelListener::bind(listen, backend, transport, tunnel_config).await?;

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = listener.serve() => {
            if let Err(e) = &result {
                error!("Listener stopped: {}", e);
            }
            result.context("Tunnel listener failed")
        }
    }
}
