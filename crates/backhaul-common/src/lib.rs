//! Plumbing shared by the backhaul server and client: TLS configuration
//! loading, OS-level TCP keepalive, and flow-controlled copies between HTTP/2
//! streams and sockets.

use std::time::Duration;

mod error;
mod keepalive;
mod stream;
mod tls;

pub use error::TunnelError;
pub use keepalive::set_keepalive;
pub use stream::{copy_reader_to_send, copy_recv_to_writer, send_all};
pub use tls::{
    load_client_config, load_client_config_from_pem, load_server_config,
    load_server_config_from_pem, load_server_config_no_client_auth,
};

/// General purpose timeout: handshakes, error notifications, proxy-stream
/// completion after one direction finished.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for connection-pool liveness pings.
pub const PING_TIMEOUT: Duration = Duration::from_millis(500);
