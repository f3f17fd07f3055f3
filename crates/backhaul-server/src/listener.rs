use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use backhaul_proto::Protocol;

use crate::sni::{SniListener, SniStream};

/// Handle to a bound public listener, kept in the registry item that owns it.
///
/// Closing the guard (or dropping it) cancels the accept loop, which in turn
/// drops the socket. This is what makes "clearing a registry item closes its
/// listeners" hold without the registry touching sockets directly.
pub struct ListenerGuard {
    addr: String,
    network: &'static str,
    token: CancellationToken,
}

impl ListenerGuard {
    pub(crate) fn new(addr: String, network: &'static str) -> ListenerGuard {
        ListenerGuard {
            addr,
            network,
            token: CancellationToken::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn network(&self) -> &'static str {
        self.network
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A public ingress listener of any supported kind.
pub(crate) enum Ingress {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
    Sni(SniListener),
}

impl Ingress {
    /// Binds a listener for a `tcp`-family or `unix` tunnel. SNI listeners
    /// come from the muxer instead.
    pub(crate) async fn bind(protocol: Protocol, addr: &str) -> io::Result<Ingress> {
        match protocol {
            Protocol::Tcp => Ok(Ingress::Tcp(TcpListener::bind(addr).await?)),
            Protocol::Tcp4 | Protocol::Tcp6 => {
                let want_v4 = protocol == Protocol::Tcp4;
                let mut last_err = None;
                for candidate in lookup_host(addr).await? {
                    if candidate.is_ipv4() != want_v4 {
                        continue;
                    }
                    match TcpListener::bind(candidate).await {
                        Ok(listener) => return Ok(Ingress::Tcp(listener)),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no {protocol} address for {addr:?}"),
                    )
                }))
            }
            #[cfg(unix)]
            Protocol::Unix => Ok(Ingress::Unix(UnixListener::bind(addr)?)),
            #[cfg(not(unix))]
            Protocol::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix tunnels are not supported on this platform",
            )),
            Protocol::Http | Protocol::Sni => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("protocol {protocol} does not bind a listener"),
            )),
        }
    }

    /// Accepts one connection, returning the stream, the peer address and the
    /// SNI server name when the listener is SNI-backed.
    pub(crate) async fn accept(&mut self) -> io::Result<(IngressStream, String, Option<String>)> {
        match self {
            Ingress::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((IngressStream::Tcp(stream), peer.to_string(), None))
            }
            #[cfg(unix)]
            Ingress::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((IngressStream::Unix(stream), format!("{peer:?}"), None))
            }
            Ingress::Sni(listener) => {
                let conn = listener.accept().await?;
                let peer = conn.peer.to_string();
                let host = conn.host.clone();
                Ok((IngressStream::Sni(conn.stream), peer, Some(host)))
            }
        }
    }

    pub(crate) fn local_addr(&self) -> String {
        match self {
            Ingress::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            Ingress::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_default(),
            Ingress::Sni(listener) => listener.host().to_string(),
        }
    }

    pub(crate) fn network(&self) -> &'static str {
        match self {
            Ingress::Tcp(_) => "tcp",
            #[cfg(unix)]
            Ingress::Unix(_) => "unix",
            // SNI virtual listeners sit on the shared TCP socket.
            Ingress::Sni(_) => "tcp",
        }
    }
}

/// A connection accepted from an [`Ingress`] listener.
pub(crate) enum IngressStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Sni(SniStream),
}

impl IngressStream {
    /// OS keepalive where the transport supports it.
    pub(crate) fn set_keepalive(&self) -> io::Result<()> {
        match self {
            IngressStream::Tcp(stream) => backhaul_common::set_keepalive(stream),
            #[cfg(unix)]
            IngressStream::Unix(_) => Ok(()),
            IngressStream::Sni(stream) => backhaul_common::set_keepalive(stream.get_ref()),
        }
    }
}

impl AsyncRead for IngressStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IngressStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            IngressStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            IngressStream::Sni(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IngressStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IngressStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            IngressStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            IngressStream::Sni(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IngressStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            IngressStream::Unix(s) => Pin::new(s).poll_flush(cx),
            IngressStream::Sni(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IngressStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            IngressStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            IngressStream::Sni(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
