use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// How long a connection may sit idle before keepalive probes start.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(15 * 60);

/// Interval between unanswered probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Probes sent before the connection is declared dead.
#[cfg(not(any(target_os = "openbsd", target_os = "windows")))]
const KEEPALIVE_RETRIES: u32 = 8;

/// Enables OS-level TCP keepalive on a stream.
///
/// Control connections and proxied ingress sockets are long-lived and mostly
/// idle; without probes a silently vanished peer would hold pool and registry
/// entries until the next write fails.
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);

    #[cfg(not(any(target_os = "openbsd", target_os = "windows")))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
