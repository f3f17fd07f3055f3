//! Client configuration, parsed from TOML.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use backhaul_proto::Tunnel;

use crate::backoff::ExponentialBackoff;

/// Client configuration file.
///
/// ```toml
/// server_addr = "tunnel.example.com:5223"
/// cert_file = "client.crt"
/// key_file = "client.key"
/// ca_file = "ca.crt"
///
/// [backoff]
/// interval_ms = 500
/// multiplier = 1.5
/// max_interval_ms = 60000
/// max_elapsed_ms = 900000
///
/// [tunnels.web]
/// protocol = "http"
/// host = "foo.example.com"
/// auth = "user:password"
/// local_addr = "127.0.0.1:8080"
///
/// [tunnels.ssh]
/// protocol = "tcp"
/// addr = "0.0.0.0:2222"
/// local_addr = "127.0.0.1:22"
/// ```
#[derive(Debug, Deserialize)]
pub struct ClientFileConfig {
    /// Tunnel server address (`host:port`).
    pub server_addr: String,

    /// Client certificate and key; their digest is this client's identity.
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    /// CA used to verify the server certificate.
    pub ca_file: PathBuf,

    /// Reconnect schedule; defaults apply when the section is missing.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Tunnels to request, keyed by name.
    pub tunnels: HashMap<String, Tunnel>,

    /// Default tracing filter, overridable with `RUST_LOG`.
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Total retry budget; 0 retries forever.
    pub max_elapsed_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            interval_ms: 500,
            multiplier: 1.5,
            max_interval_ms: 60_000,
            max_elapsed_ms: 15 * 60 * 1000,
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.interval_ms),
            self.multiplier,
            Duration::from_millis(self.max_interval_ms),
            (self.max_elapsed_ms > 0).then(|| Duration::from_millis(self.max_elapsed_ms)),
        )
    }
}

impl ClientFileConfig {
    pub fn load(path: &str) -> anyhow::Result<ClientFileConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))?;
        let config: ClientFileConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse {path}: {e}"))?;
        if config.tunnels.is_empty() {
            anyhow::bail!("{path} declares no tunnels");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::Protocol;

    #[test]
    fn parses_full_config() {
        let config: ClientFileConfig = toml::from_str(
            r#"
            server_addr = "tunnel.example.com:5223"
            cert_file = "client.crt"
            key_file = "client.key"
            ca_file = "ca.crt"

            [backoff]
            interval_ms = 100
            multiplier = 2.0
            max_interval_ms = 5000
            max_elapsed_ms = 0

            [tunnels.web]
            protocol = "http"
            host = "foo.example.com"
            auth = "user:password"
            local_addr = "127.0.0.1:8080"

            [tunnels.ssh]
            protocol = "tcp"
            addr = "0.0.0.0:2222"
            local_addr = "127.0.0.1:22"
            "#,
        )
        .unwrap();

        assert_eq!(config.server_addr, "tunnel.example.com:5223");
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels["web"].protocol, Protocol::Http);
        assert_eq!(config.tunnels["web"].auth, "user:password");
        assert_eq!(config.tunnels["ssh"].protocol, Protocol::Tcp);
        assert_eq!(config.backoff.interval_ms, 100);
    }

    #[test]
    fn backoff_defaults_when_missing() {
        let config: ClientFileConfig = toml::from_str(
            r#"
            server_addr = "t:1"
            cert_file = "c"
            key_file = "k"
            ca_file = "a"
            [tunnels.t]
            protocol = "tcp"
            addr = "0.0.0.0:0"
            "#,
        )
        .unwrap();
        assert_eq!(config.backoff.interval_ms, 500);
    }
}
