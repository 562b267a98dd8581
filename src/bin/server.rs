//! wsdog egress endpoint
//!
//! Serves a decoy 404 page over HTTP, accepts tunnel WebSockets on the
//! configured path, and opens the outbound TCP connection each tunnel asks
//! for.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use wsdog::{
    config::{generate_example_config, Config, ServerConfig},
    crypto::FrameCodec,
    server::EgressServer,
    session::EgressFactory,
    transport::TcpConnector,
};

#[cfg(feature = "tls")]
use anyhow::anyhow;

/// wsdog egress endpoint - encrypted WebSocket in, TCP out
#[derive(Parser, Debug)]
#[command(name = "wsdog-server")]
#[command(about = "wsdog egress endpoint - terminates encrypted WebSocket tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Shared secret
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    key: Option<String>,

    /// Cipher (aes-128-gcm, aes-192-gcm, aes-256-gcm, none)
    #[arg(short, long, env = "METHOD")]
    method: Option<String>,

    /// Listen host
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// WebSocket path
    #[arg(long, env = "SERVER_PATH")]
    path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

impl Args {
    /// Layer flags and environment over the file configuration
    fn apply(self, config: &mut Config) {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        if let Some(key) = self.key {
            server.key = key;
        }
        if let Some(method) = self.method {
            server.method = method;
        }
        if let Some(host) = self.host {
            server.host = host;
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(path) = self.path {
            server.path = path;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        println!("{}", example);
        return Ok(());
    }

    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    wsdog::logging::init(&config.logging).context("Failed to initialize logging")?;

    let server_config = config.server.unwrap_or_default();
    let cipher = server_config.cipher().context("Invalid cipher")?;
    let codec = Arc::new(
        FrameCodec::new(&server_config.key, cipher).context("Failed to build cipher")?,
    );

    let connector = TcpConnector::new(server_config.connect_timeout());
    let path = server_config.normalized_path();
    let handshake_timeout = server_config.handshake_timeout();

    info!("wsdog server v{}", wsdog::VERSION);
    info!("Tunnel path: {} ({})", path, codec.kind());

    let factory = EgressFactory::new(codec, connector).with_handshake_timeout(handshake_timeout);
    let server = EgressServer::new(factory, path, server_config.max_connections)
        .with_handshake_timeout(handshake_timeout);

    #[cfg(feature = "tls")]
    let server = match (&server_config.tls_cert, &server_config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            rustls::crypto::ring::default_provider()
                .install_default()
                .ok();

            let certs = load_certs(cert_path).context("Failed to load TLS certificate")?;
            let key = load_private_key(key_path).context("Failed to load TLS private key")?;

            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("Failed to build TLS server config")?;

            info!("TLS enabled with cert: {}", cert_path);
            server.with_tls(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config)))
        }
        _ => {
            info!("TLS disabled (no tls_cert/tls_key configured)");
            server
        }
    };

    #[cfg(not(feature = "tls"))]
    if server_config.tls_cert.is_some() {
        tracing::warn!("tls_cert is set but this build has no TLS support; serving plain HTTP");
    }

    let listen_addr = server_config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", listen_addr))?;

    tokio::select! {
        result = Arc::new(server).serve(listener) => {
            result.context("Listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Load TLS certificate chain from PEM file
#[cfg(feature = "tls")]
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).with_context(|| format!("Failed to open cert file: {}", path))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse PEM certificates")?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load TLS private key from PEM file
#[cfg(feature = "tls")]
fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).with_context(|| format!("Failed to open key file: {}", path))?,
    );
    rustls_pemfile::private_key(&mut file)
        .context("Failed to parse PEM private key")?
        .ok_or_else(|| anyhow!("No private key found in {}", path))
}
