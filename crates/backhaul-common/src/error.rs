use thiserror::Error;

/// Common errors for tunnel plumbing.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    #[error("connection closed")]
    ConnectionClosed,
}
