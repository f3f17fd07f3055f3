use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use backhaul::{Client, ClientConfig, ClientFileConfig, DispatchProxy, HttpProxy, TcpProxy};
use backhaul_proto::{Identity, Protocol, Tunnel};

/// Tunnel client: exposes local services through a backhaul server.
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Expose local services through a reverse HTTP/2 tunnel")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "backhaul.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print this client's identifier, derived from its certificate
    Id,
    /// List tunnel names declared in the configuration
    List,
    /// Start the named tunnels
    Start {
        /// Tunnel names from the configuration
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Start every declared tunnel
    StartAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();
    let config = ClientFileConfig::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                config
                    .log_level
                    .clone()
                    .unwrap_or_else(|| "backhaul=info,backhaul_common=info".to_string()),
            )
        }))
        .init();

    match cli.command {
        Commands::Id => {
            let pem = std::fs::read_to_string(&config.cert_file).with_context(|| {
                format!("failed to read {}", config.cert_file.display())
            })?;
            let der = rustls_pemfile::certs(&mut pem.as_bytes())
                .next()
                .context("no certificate found")?
                .context("failed to parse certificate")?;
            println!("{}", Identity::from_cert_der(&der));
            Ok(())
        }
        Commands::List => {
            let mut names: Vec<&String> = config.tunnels.keys().collect();
            names.sort();
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Start { names } => {
            let mut tunnels = HashMap::new();
            for name in names {
                let tunnel = config
                    .tunnels
                    .get(&name)
                    .with_context(|| format!("no tunnel named {name:?}"))?;
                tunnels.insert(name, tunnel.clone());
            }
            start(&config, tunnels).await
        }
        Commands::StartAll => start(&config, config.tunnels.clone()).await,
    }
}

async fn start(config: &ClientFileConfig, tunnels: HashMap<String, Tunnel>) -> Result<()> {
    let tls = backhaul_common::load_client_config(
        &config.cert_file,
        &config.key_file,
        &config.ca_file,
    )
    .context("failed to load client TLS configuration")?;

    let client = Client::new(ClientConfig {
        server_addr: config.server_addr.clone(),
        tls: Arc::new(tls),
        backoff: Some(Box::new(config.backoff.build())),
        proxy: Arc::new(build_proxy(&tunnels)),
        tunnels,
    })?;

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.start().await })
    };

    tokio::select! {
        result = runner => {
            result?.context("tunnel terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c");
            client.stop();
        }
    }

    Ok(())
}

/// Maps each tunnel's public name to its local backend and wires the
/// protocol dispatcher.
fn build_proxy(tunnels: &HashMap<String, Tunnel>) -> DispatchProxy {
    let mut http_map = HashMap::new();
    let mut tcp_map = HashMap::new();

    for tunnel in tunnels.values() {
        if tunnel.local_addr.is_empty() {
            continue;
        }
        match tunnel.protocol {
            Protocol::Http => {
                http_map.insert(tunnel.host.clone(), tunnel.local_addr.clone());
            }
            Protocol::Sni => {
                tcp_map.insert(tunnel.host.clone(), tunnel.local_addr.clone());
            }
            Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6 | Protocol::Unix => {
                tcp_map.insert(tunnel.addr.clone(), tunnel.local_addr.clone());
            }
        }
    }

    DispatchProxy::new()
        .with_http(HttpProxy::new_multi(http_map))
        .with_tcp(TcpProxy::new_multi(tcp_map))
}
