use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of a tunnel, selecting how the server exposes it publicly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Routed by the public HTTP(S) plane via the `Host` header.
    #[default]
    Http,
    /// Server binds a TCP listener at the requested address.
    Tcp,
    /// TCP restricted to IPv4 addresses.
    Tcp4,
    /// TCP restricted to IPv6 addresses.
    Tcp6,
    /// Server binds a Unix domain socket.
    Unix,
    /// Routed by the shared SNI muxer via the TLS server name.
    Sni,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Tcp4 => "tcp4",
            Protocol::Tcp6 => "tcp6",
            Protocol::Unix => "unix",
            Protocol::Sni => "sni",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            "tcp4" => Ok(Protocol::Tcp4),
            "tcp6" => Ok(Protocol::Tcp6),
            "unix" => Ok(Protocol::Unix),
            "sni" => Ok(Protocol::Sni),
            other => Err(format!("unsupported protocol {other:?}")),
        }
    }
}

/// A single routing rule exported by a client.
///
/// During the handshake the client sends its tunnels as a JSON map keyed by
/// tunnel name; on success the server proxies matching public traffic down
/// the control connection. The JSON uses PascalCase keys on the wire while
/// config files may use the lowercase aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunnel {
    #[serde(rename = "Protocol", alias = "protocol")]
    pub protocol: Protocol,

    /// HTTP request host, required for `http` and `sni` tunnels.
    #[serde(rename = "Host", alias = "host", skip_serializing_if = "String::is_empty")]
    pub host: String,

    /// `user:password` guarding an HTTP tunnel, empty for none.
    #[serde(rename = "Auth", alias = "auth", skip_serializing_if = "String::is_empty")]
    pub auth: String,

    /// Public address the server listens on, required for `tcp`-family and
    /// `unix` tunnels.
    #[serde(rename = "Addr", alias = "addr", skip_serializing_if = "String::is_empty")]
    pub addr: String,

    /// Address of the backend service on the client side.
    #[serde(
        rename = "LocalAddr",
        alias = "local_addr",
        skip_serializing_if = "String::is_empty"
    )]
    pub local_addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn handshake_body_uses_pascal_case() {
        let tunnel = Tunnel {
            protocol: Protocol::Http,
            host: "foo.example".into(),
            auth: "user:password".into(),
            local_addr: "127.0.0.1:8080".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&tunnel).unwrap();
        assert!(json.contains(r#""Protocol":"http""#), "{json}");
        assert!(json.contains(r#""Host":"foo.example""#), "{json}");
        assert!(!json.contains("Addr\":\"\""), "{json}");
    }

    #[test]
    fn decodes_wire_map() {
        let body = r#"{
            "web": {"Protocol": "http", "Host": "foo.example", "Auth": "u:p"},
            "ssh": {"Protocol": "tcp", "Addr": "0.0.0.0:2222"}
        }"#;
        let tunnels: HashMap<String, Tunnel> = serde_json::from_str(body).unwrap();
        assert_eq!(tunnels["web"].protocol, Protocol::Http);
        assert_eq!(tunnels["web"].auth, "u:p");
        assert_eq!(tunnels["ssh"].protocol, Protocol::Tcp);
        assert_eq!(tunnels["ssh"].addr, "0.0.0.0:2222");
    }

    #[test]
    fn accepts_lowercase_aliases() {
        let body = r#"{"protocol": "sni", "host": "tls.example"}"#;
        let tunnel: Tunnel = serde_json::from_str(body).unwrap();
        assert_eq!(tunnel.protocol, Protocol::Sni);
        assert_eq!(tunnel.host, "tls.example");
    }
}
