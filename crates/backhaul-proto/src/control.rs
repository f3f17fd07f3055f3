use std::fmt;
use std::str::FromStr;

use http::header::{HeaderMap, HeaderValue};
use thiserror::Error;

/// Carries a server-side rejection reason back to the client during the
/// handshake.
pub const HEADER_ERROR: &str = "x-error";

pub const HEADER_ACTION: &str = "x-action";
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";
pub const HEADER_FORWARDED_HOST: &str = "x-forwarded-host";
pub const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("missing headers: {0:?}")]
    MissingHeaders(Vec<&'static str>),

    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

/// What the client should do with an incoming stream.
///
/// A single action exists today; the header leaves room for more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Proxy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy" => Ok(Action::Proxy),
            other => Err(ControlError::UnknownAction(other.to_string())),
        }
    }
}

/// Per-stream metadata sent from server to client ahead of the payload.
///
/// The message travels as HTTP headers on the reverse HTTP/2 request; based
/// on it the client routes the stream to a backend service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: Action,
    /// Public hostname or listener address that received the ingress.
    pub forwarded_host: String,
    /// `http`, `https`, or the network name (`tcp`, `unix`, ...).
    pub forwarded_proto: String,
    /// Public caller's address, possibly a chain of addresses.
    pub remote_addr: String,
}

impl ControlMessage {
    /// Reads a control message from request headers, reporting every missing
    /// required header at once.
    pub fn read_from(headers: &HeaderMap) -> Result<ControlMessage, ControlError> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let action = get(HEADER_ACTION);
        let forwarded_host = get(HEADER_FORWARDED_HOST);
        let forwarded_proto = get(HEADER_FORWARDED_PROTO);
        let remote_addr = get(HEADER_FORWARDED_FOR);

        let mut missing = Vec::new();
        if action.is_empty() {
            missing.push(HEADER_ACTION);
        }
        if forwarded_host.is_empty() {
            missing.push(HEADER_FORWARDED_HOST);
        }
        if forwarded_proto.is_empty() {
            missing.push(HEADER_FORWARDED_PROTO);
        }
        if !missing.is_empty() {
            return Err(ControlError::MissingHeaders(missing));
        }

        Ok(ControlMessage {
            action: action.parse()?,
            forwarded_host,
            forwarded_proto,
            remote_addr,
        })
    }

    /// Writes the message onto request headers, verbatim.
    pub fn write_to(&self, headers: &mut HeaderMap) {
        let set = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        set(headers, HEADER_ACTION, self.action.as_str());
        set(headers, HEADER_FORWARDED_HOST, &self.forwarded_host);
        set(headers, HEADER_FORWARDED_PROTO, &self.forwarded_proto);
        if !self.remote_addr.is_empty() {
            set(headers, HEADER_FORWARDED_FOR, &self.remote_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ControlMessage {
        ControlMessage {
            action: Action::Proxy,
            forwarded_host: "foo.example:8080".into(),
            forwarded_proto: "https".into(),
            remote_addr: "203.0.113.7:41812".into(),
        }
    }

    #[test]
    fn write_read_is_identity() {
        let msg = sample();
        let mut headers = HeaderMap::new();
        msg.write_to(&mut headers);
        assert_eq!(ControlMessage::read_from(&headers), Ok(msg));
    }

    #[test]
    fn reports_all_missing_headers() {
        let headers = HeaderMap::new();
        assert_eq!(
            ControlMessage::read_from(&headers),
            Err(ControlError::MissingHeaders(vec![
                HEADER_ACTION,
                HEADER_FORWARDED_HOST,
                HEADER_FORWARDED_PROTO,
            ]))
        );
    }

    #[test]
    fn reports_partially_missing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ACTION, HeaderValue::from_static("proxy"));
        headers.insert(HEADER_FORWARDED_PROTO, HeaderValue::from_static("tcp"));
        assert_eq!(
            ControlMessage::read_from(&headers),
            Err(ControlError::MissingHeaders(vec![HEADER_FORWARDED_HOST]))
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        let mut headers = HeaderMap::new();
        let msg = sample();
        msg.write_to(&mut headers);
        headers.insert(HEADER_ACTION, HeaderValue::from_static("replay"));
        assert_eq!(
            ControlMessage::read_from(&headers),
            Err(ControlError::UnknownAction("replay".into()))
        );
    }

    #[test]
    fn remote_addr_is_optional() {
        let mut msg = sample();
        msg.remote_addr = String::new();
        let mut headers = HeaderMap::new();
        msg.write_to(&mut headers);
        assert_eq!(ControlMessage::read_from(&headers), Ok(msg));
    }
}
