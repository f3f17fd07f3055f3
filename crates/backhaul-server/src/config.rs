//! Server configuration with environment variable priority.
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (`BACKHAUL_*`)
//! 2. Config file (`backhauld.toml`)
//! 3. Defaults, where one exists

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const ENV_PREFIX: &str = "BACKHAUL";

/// Raw configuration as parsed from TOML; every field optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    /// Address of the mTLS control listener clients dial.
    pub control_addr: Option<String>,

    /// Public plain-HTTP ingress address; unset disables it.
    pub http_addr: Option<String>,

    /// Public HTTPS ingress address; unset disables it.
    pub https_addr: Option<String>,

    /// Shared SNI muxer address; unset disables `sni` tunnels.
    pub sni_addr: Option<String>,

    /// Control-plane server certificate, key, and the CA that client
    /// certificates must chain to.
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,

    /// Certificate pair for the public HTTPS ingress.
    pub https_cert_file: Option<String>,
    pub https_key_file: Option<String>,

    /// Subscribe any authenticated client on arrival.
    pub auto_subscribe: Option<bool>,

    /// Properties file (or directory of them) pre-enrolling
    /// `host=identifier` pairs. Reloaded on SIGHUP.
    pub allow_list: Option<String>,

    /// Milliseconds to hold disconnect log lines; 0 logs immediately.
    pub debounce_ms: Option<u64>,

    /// Default tracing filter, overridable with `RUST_LOG`.
    pub log_level: Option<String>,
}

/// Fully resolved configuration the binary runs with.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub control_addr: String,
    pub http_addr: Option<String>,
    pub https_addr: Option<String>,
    pub sni_addr: Option<String>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub https_cert_file: Option<PathBuf>,
    pub https_key_file: Option<PathBuf>,
    pub auto_subscribe: bool,
    pub allow_list: Option<PathBuf>,
    pub debounce: Duration,
    pub log_level: String,
}

fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

impl FileConfig {
    /// Loads the TOML file when it exists; missing or broken files fall back
    /// to defaults with a warning.
    pub fn load(path: &str) -> FileConfig {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        tracing::info!("loaded config from {}", path);
                        return config;
                    }
                    Err(e) => tracing::warn!("failed to parse {}: {}", path, e),
                },
                Err(e) => tracing::warn!("failed to read {}: {}", path, e),
            }
        }
        FileConfig::default()
    }

    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        let control_addr = get_env("CONTROL_ADDR")
            .or(self.control_addr)
            .unwrap_or_else(|| "0.0.0.0:5223".to_string());

        let http_addr = get_env("HTTP_ADDR").or(self.http_addr);
        let https_addr = get_env("HTTPS_ADDR").or(self.https_addr);
        let sni_addr = get_env("SNI_ADDR").or(self.sni_addr);

        let cert_file = get_env("CERT_FILE").or(self.cert_file).ok_or_else(|| {
            anyhow::anyhow!("server certificate required: set BACKHAUL_CERT_FILE or cert_file")
        })?;
        let key_file = get_env("KEY_FILE").or(self.key_file).ok_or_else(|| {
            anyhow::anyhow!("server key required: set BACKHAUL_KEY_FILE or key_file")
        })?;
        let ca_file = get_env("CA_FILE").or(self.ca_file).ok_or_else(|| {
            anyhow::anyhow!("client CA required: set BACKHAUL_CA_FILE or ca_file")
        })?;

        let https_cert_file = get_env("HTTPS_CERT_FILE").or(self.https_cert_file);
        let https_key_file = get_env("HTTPS_KEY_FILE").or(self.https_key_file);
        if https_addr.is_some() && (https_cert_file.is_none() || https_key_file.is_none()) {
            anyhow::bail!("https_addr requires https_cert_file and https_key_file");
        }

        let auto_subscribe = get_env("AUTO_SUBSCRIBE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(self.auto_subscribe)
            .unwrap_or(false);

        let allow_list = get_env("ALLOW_LIST").or(self.allow_list);

        let debounce_ms = get_env("DEBOUNCE_MS")
            .and_then(|v| v.parse().ok())
            .or(self.debounce_ms)
            .unwrap_or(0);

        let log_level = get_env("LOG_LEVEL")
            .or(self.log_level)
            .unwrap_or_else(|| "backhaul_server=info,backhaul_common=info".to_string());

        Ok(ResolvedConfig {
            control_addr,
            http_addr,
            https_addr,
            sni_addr,
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: ca_file.into(),
            https_cert_file: https_cert_file.map(Into::into),
            https_key_file: https_key_file.map(Into::into),
            auto_subscribe,
            allow_list: allow_list.map(Into::into),
            debounce: Duration::from_millis(debounce_ms),
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_resolves_with_defaults() {
        let config: FileConfig = toml::from_str(
            r#"
            cert_file = "server.crt"
            key_file = "server.key"
            ca_file = "ca.crt"
            "#,
        )
        .unwrap();
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.control_addr, "0.0.0.0:5223");
        assert!(!resolved.auto_subscribe);
        assert!(resolved.http_addr.is_none());
        assert!(resolved.debounce.is_zero());
    }

    #[test]
    fn https_requires_certificates() {
        let config: FileConfig = toml::from_str(
            r#"
            cert_file = "server.crt"
            key_file = "server.key"
            ca_file = "ca.crt"
            https_addr = "0.0.0.0:443"
            "#,
        )
        .unwrap();
        assert!(config.resolve().is_err());
    }
}
