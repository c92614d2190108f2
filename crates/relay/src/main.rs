//! Fleet Relay - WebSocket endpoint for fleet agents

use anyhow::Result;
use clap::Parser;
use fleet_relay::{load_acceptor, RelayServer};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fleet-relay")]
#[command(about = "WebSocket relay for validator fleet agents", version)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Plaintext WebSocket port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Also serve TLS WebSocket connections
    #[arg(long)]
    ssl: bool,

    /// TLS WebSocket port
    #[arg(long, default_value_t = 8443)]
    ssl_port: u16,

    /// PEM certificate chain
    #[arg(long, default_value = "./certs/cert.pem")]
    cert: PathBuf,

    /// PEM private key (PKCS#8, RSA or EC)
    #[arg(long, default_value = "./certs/key.pem")]
    key: PathBuf,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fleet-relay");

    let server = RelayServer::default();
    let mut listeners = Vec::new();

    let plain = format!("{}:{}", args.host, args.port);
    match TcpListener::bind(&plain).await {
        Ok(listener) => {
            let server = server.clone();
            listeners.push(tokio::spawn(async move { server.serve(listener, None).await }));
        }
        Err(e) => error!(addr = %plain, error = %e, "Failed to bind WebSocket listener"),
    }

    if args.ssl {
        match load_acceptor(&args.cert, &args.key) {
            Ok(acceptor) => {
                let secure = format!("{}:{}", args.host, args.ssl_port);
                match TcpListener::bind(&secure).await {
                    Ok(listener) => {
                        let server = server.clone();
                        listeners.push(tokio::spawn(async move {
                            server.serve(listener, Some(acceptor)).await
                        }));
                    }
                    Err(e) => error!(addr = %secure, error = %e, "Failed to bind TLS listener"),
                }
            }
            Err(e) => error!(error = %e, "TLS disabled, could not load certificate"),
        }
    }

    if listeners.is_empty() {
        anyhow::bail!("no listener could be started");
    }

    server.start_sweeps().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.shutdown().await;

    for listener in listeners {
        match listener.await {
            Ok(Err(e)) => warn!(error = %e, "Listener failed"),
            Err(e) => warn!(error = %e, "Listener task panicked"),
            Ok(Ok(())) => {}
        }
    }

    let stats = server.stats();
    info!(
        event = "relay_stopped",
        total_received = stats.total_received,
        uptime_secs = stats.uptime_secs,
        "Relay stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_arguments() {
        let args = Args::try_parse_from(["fleet-relay"]).unwrap();
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 8080);
        assert!(!args.ssl);
        assert_eq!(args.ssl_port, 8443);
        assert_eq!(args.cert, PathBuf::from("./certs/cert.pem"));
        assert!(!args.debug);
    }

    #[test]
    fn test_ssl_arguments() {
        let args = Args::try_parse_from([
            "fleet-relay",
            "--ssl",
            "--ssl-port",
            "9443",
            "--key",
            "/etc/relay/key.pem",
            "--debug",
        ])
        .unwrap();
        assert!(args.ssl);
        assert_eq!(args.ssl_port, 9443);
        assert_eq!(args.key, PathBuf::from("/etc/relay/key.pem"));
        assert!(args.debug);
    }
}
