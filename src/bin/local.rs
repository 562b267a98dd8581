//! wsdog local endpoint
//!
//! Listens for SOCKS5 clients and carries each CONNECT through its own
//! encrypted WebSocket to the egress endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use wsdog::{
    config::{generate_example_config, ClientConfig, Config},
    crypto::FrameCodec,
    server::serve_local,
    session::InitiatorFactory,
    transport::WsDialer,
};

/// wsdog local endpoint - SOCKS5 in, encrypted WebSocket out
#[derive(Parser, Debug)]
#[command(name = "wsdog-local")]
#[command(about = "wsdog local endpoint - SOCKS5 over an encrypted WebSocket tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Tunnel URL (ws:// or wss://)
    #[arg(short, long, env = "URL")]
    url: Option<String>,

    /// Shared secret
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    key: Option<String>,

    /// Cipher (aes-128-gcm, aes-192-gcm, aes-256-gcm, none)
    #[arg(short, long, env = "METHOD")]
    method: Option<String>,

    /// Inactivity timeout in seconds
    #[arg(short, long, env = "TIMEOUT")]
    timeout: Option<u64>,

    /// SOCKS5 listen host
    #[arg(long, env = "LOCAL_HOST")]
    local_host: Option<String>,

    /// SOCKS5 listen port
    #[arg(short = 'p', long, env = "LOCAL_PORT")]
    local_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

impl Args {
    /// Layer flags and environment over the file configuration
    fn apply(self, config: &mut Config) {
        let client = config.client.get_or_insert_with(ClientConfig::default);
        if let Some(url) = self.url {
            client.url = url;
        }
        if let Some(key) = self.key {
            client.key = key;
        }
        if let Some(method) = self.method {
            client.method = method;
        }
        if let Some(timeout) = self.timeout {
            client.timeout = timeout;
        }
        if let Some(host) = self.local_host {
            client.local_host = host;
        }
        if let Some(port) = self.local_port {
            client.local_port = port;
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

    #[cfg(feature = "tls")]
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let client = config.client.unwrap_or_default();
    let cipher = client.cipher().context("Invalid cipher")?;
    let codec = Arc::new(FrameCodec::new(&client.key, cipher).context("Failed to build cipher")?);

    let dialer = WsDialer::new(client.url.clone(), client.connect_timeout());

    info!("wsdog local v{}", wsdog::VERSION);
    info!("Tunnel: {} ({})", dialer.url(), codec.kind());

    let factory = Arc::new(InitiatorFactory::new(codec, dialer, client.session_settings()));

    let listen_addr = client.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", listen_addr))?;

    tokio::select! {
        result = serve_local(listener, factory) => {
            result.context("Listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
