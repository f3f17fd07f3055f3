use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

use backhaul_server::{load_allow_list, FileConfig, Server, ServerConfig};

/// Public endpoint of the backhaul reverse tunnel.
#[derive(Parser, Debug)]
#[command(name = "backhauld")]
#[command(about = "Expose services running behind NAT through a reverse HTTP/2 tunnel")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "backhauld.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();
    let config = FileConfig::load(&args.config).resolve()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!("control listener: {}", config.control_addr);

    let tls = backhaul_common::load_server_config(
        &config.cert_file,
        &config.key_file,
        &config.ca_file,
    )
    .context("failed to load control TLS configuration")?;

    let server = Server::new(ServerConfig {
        tls: Arc::new(tls),
        auto_subscribe: config.auto_subscribe,
        sni_addr: config.sni_addr.clone(),
        debounce: config.debounce,
        subscription_listener: None,
    })
    .await
    .context("failed to create server")?;

    if let Some(path) = &config.allow_list {
        load_allow_list(&server, path)
            .with_context(|| format!("failed to load allow-list {}", path.display()))?;
    }

    let control = {
        let server = server.clone();
        let addr = config.control_addr.clone();
        tokio::spawn(async move { server.start(&addr).await })
    };

    if let Some(addr) = &config.http_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind http ingress {addr}"))?;
        let server = server.clone();
        tokio::spawn(async move { server.serve_http(listener).await });
    }

    if let Some(addr) = &config.https_addr {
        let cert = config
            .https_cert_file
            .as_ref()
            .expect("validated by config resolve");
        let key = config
            .https_key_file
            .as_ref()
            .expect("validated by config resolve");
        let cert_pem = std::fs::read_to_string(cert)?;
        let key_pem = std::fs::read_to_string(key)?;
        let tls = backhaul_common::load_server_config_no_client_auth(&cert_pem, &key_pem)
            .context("failed to load https ingress TLS configuration")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind https ingress {addr}"))?;
        let server = server.clone();
        let acceptor = TlsAcceptor::from(Arc::new(tls));
        tokio::spawn(async move { server.serve_https(listener, acceptor).await });
    }

    // SIGHUP re-reads the allow-list so new clients can be enrolled without
    // a restart.
    #[cfg(unix)]
    if let Some(path) = config.allow_list.clone() {
        let server = server.clone();
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(hup) => hup,
                Err(e) => {
                    tracing::warn!("failed to install SIGHUP handler: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                if let Err(e) = load_allow_list(&server, &path) {
                    tracing::warn!("allow-list reload failed: {}", e);
                }
            }
        });
    }

    tokio::select! {
        result = control => {
            tracing::error!("control listener stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            server.stop();
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
