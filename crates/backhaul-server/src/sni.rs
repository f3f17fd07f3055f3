use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use backhaul_common::DEFAULT_TIMEOUT;

/// A ClientHello larger than this is not something we route.
const MAX_CLIENT_HELLO: usize = 16 * 1024;

/// Per-host queue depth before accepts start getting dropped.
const BACKLOG: usize = 64;

/// Shared TLS-aware listener.
///
/// Accepted connections have their ClientHello peeked (never terminated) and
/// are demultiplexed by server name onto per-host virtual listeners obtained
/// from [`SniMux::listen`]. Connections that match no registered host are
/// closed.
pub struct SniMux {
    inner: Arc<MuxInner>,
    shutdown: CancellationToken,
}

struct MuxInner {
    routes: Mutex<HashMap<String, mpsc::Sender<SniConn>>>,
    addr: SocketAddr,
}

/// A connection routed to one host's virtual listener.
pub(crate) struct SniConn {
    pub stream: SniStream,
    pub host: String,
    pub peer: SocketAddr,
}

/// Virtual listener for a single SNI host.
pub struct SniListener {
    host: String,
    rx: mpsc::Receiver<SniConn>,
    inner: Arc<MuxInner>,
}

impl SniMux {
    /// Binds the shared listener and starts the demultiplexing loop.
    pub async fn bind(addr: &str) -> io::Result<SniMux> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let inner = Arc::new(MuxInner {
            routes: Mutex::new(HashMap::new()),
            addr: local,
        });
        let shutdown = CancellationToken::new();

        let mux_inner = inner.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let inner = mux_inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = route(inner, stream, peer).await {
                                tracing::debug!(peer = %peer, error = %e, "sni route failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sni accept failed");
                    }
                }
            }
        });

        Ok(SniMux { inner, shutdown })
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Registers a host and returns its virtual listener. Fails when the host
    /// already has one.
    pub fn listen(&self, host: &str) -> io::Result<SniListener> {
        let mut routes = self.inner.routes.lock();
        if routes.contains_key(host) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("sni host {host:?} already bound"),
            ));
        }
        let (tx, rx) = mpsc::channel(BACKLOG);
        routes.insert(host.to_string(), tx);
        Ok(SniListener {
            host: host.to_string(),
            rx,
            inner: self.inner.clone(),
        })
    }
}

impl Drop for SniMux {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl SniListener {
    pub(crate) async fn accept(&mut self) -> io::Result<SniConn> {
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "sni muxer closed")
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for SniListener {
    fn drop(&mut self) {
        self.inner.routes.lock().remove(&self.host);
    }
}

/// Reads enough of the ClientHello to learn the server name, then hands the
/// connection (with the peeked bytes replayed) to the matching listener.
async fn route(inner: Arc<MuxInner>, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(1024);

    let host = timeout(DEFAULT_TIMEOUT, async {
        loop {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before client hello",
                ));
            }
            match peek_client_hello(&buf) {
                Peek::NeedMore if buf.len() < MAX_CLIENT_HELLO => continue,
                Peek::NeedMore | Peek::Invalid => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "not a routable client hello",
                    ));
                }
                Peek::NoServerName => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "client hello carries no server name",
                    ));
                }
                Peek::ServerName(host) => return Ok(host),
            }
        }
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client hello timed out"))??;

    let tx = inner.routes.lock().get(&host).cloned();
    let Some(tx) = tx else {
        tracing::debug!(host = %host, peer = %peer, "connection for unknown sni host");
        return Ok(());
    };

    let conn = SniConn {
        stream: SniStream {
            buffered: buf,
            inner: stream,
        },
        host,
        peer,
    };
    if tx.send(conn).await.is_err() {
        tracing::debug!(peer = %peer, "sni listener went away");
    }
    Ok(())
}

enum Peek {
    /// The record seen so far is a valid prefix; keep reading.
    NeedMore,
    /// Not a TLS handshake record at all.
    Invalid,
    ServerName(String),
    NoServerName,
}

/// Walks a TLS ClientHello without terminating TLS, looking for the
/// server_name extension (type 0).
fn peek_client_hello(data: &[u8]) -> Peek {
    // Record header: content_type(1) version(2) length(2); handshake is 0x16.
    if !data.is_empty() && data[0] != 0x16 {
        return Peek::Invalid;
    }
    if data.len() < 5 {
        return Peek::NeedMore;
    }
    let record_len = usize::from(u16::from_be_bytes([data[3], data[4]]));
    if data.len() < 5 + record_len {
        return Peek::NeedMore;
    }
    let hello = &data[5..5 + record_len];

    let mut r = Reader(hello);
    // Handshake header: msg_type(1) length(3); ClientHello is 1.
    match r.u8() {
        Some(1) => {}
        _ => return Peek::Invalid,
    }
    if r.skip(3).is_none() || r.skip(2).is_none() || r.skip(32).is_none() {
        return Peek::Invalid;
    }
    // session_id, cipher_suites, compression_methods.
    let Some(session_id_len) = r.u8() else {
        return Peek::Invalid;
    };
    if r.skip(usize::from(session_id_len)).is_none() {
        return Peek::Invalid;
    }
    let Some(cipher_suites_len) = r.u16() else {
        return Peek::Invalid;
    };
    if r.skip(usize::from(cipher_suites_len)).is_none() {
        return Peek::Invalid;
    }
    let Some(compression_len) = r.u8() else {
        return Peek::Invalid;
    };
    if r.skip(usize::from(compression_len)).is_none() {
        return Peek::Invalid;
    }

    let Some(ext_total) = r.u16().map(usize::from) else {
        return Peek::NoServerName;
    };
    let Some(mut exts) = r.take(ext_total).map(Reader) else {
        return Peek::Invalid;
    };

    while let (Some(ext_type), Some(ext_len)) = (exts.u16(), exts.u16().map(usize::from)) {
        let Some(body) = exts.take(ext_len) else {
            return Peek::Invalid;
        };
        if ext_type != 0 {
            continue;
        }
        // server_name_list: length(2), then entries of type(1) length(2) name.
        let mut names = Reader(body);
        let _ = names.u16();
        while let (Some(name_type), Some(name_len)) = (names.u8(), names.u16().map(usize::from)) {
            let Some(name) = names.take(name_len) else {
                return Peek::Invalid;
            };
            if name_type == 0 {
                return match std::str::from_utf8(name) {
                    Ok(host) => Peek::ServerName(host.to_string()),
                    Err(_) => Peek::Invalid,
                };
            }
        }
        return Peek::NoServerName;
    }

    Peek::NoServerName
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&first, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(first)
    }

    fn u16(&mut self) -> Option<u16> {
        let value = u16::from_be_bytes(self.0.get(..2)?.try_into().ok()?);
        self.0 = &self.0[2..];
        Some(value)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let taken = self.0.get(..n)?;
        self.0 = &self.0[n..];
        Some(taken)
    }
}

/// A routed connection with the peeked ClientHello bytes replayed in front of
/// the live socket, so the tunnel client sees the TLS stream from its first
/// byte.
pub(crate) struct SniStream {
    buffered: BytesMut,
    inner: TcpStream,
}

impl SniStream {
    pub(crate) fn get_ref(&self) -> &TcpStream {
        &self.inner
    }
}

impl AsyncRead for SniStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SniStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ClientHello with the given server name.
    fn client_hello(name: &str) -> Vec<u8> {
        let name = name.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&(name.len() as u16 + 3).to_be_bytes()); // list len
        sni.push(0); // host_name
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut exts = Vec::new();
        exts.extend_from_slice(&0u16.to_be_bytes()); // server_name extension
        exts.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![1]; // ClientHello
        hs.extend_from_slice(&[0, 0, 0]);
        let len = (body.len() as u32).to_be_bytes();
        hs[1..4].copy_from_slice(&len[1..4]);
        hs.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    #[test]
    fn extracts_server_name() {
        let hello = client_hello("tls.example");
        match peek_client_hello(&hello) {
            Peek::ServerName(host) => assert_eq!(host, "tls.example"),
            _ => panic!("expected server name"),
        }
    }

    #[test]
    fn asks_for_more_on_partial_record() {
        let hello = client_hello("tls.example");
        for cut in [1, 4, 20, hello.len() - 1] {
            assert!(matches!(peek_client_hello(&hello[..cut]), Peek::NeedMore));
        }
    }

    #[test]
    fn rejects_non_tls_bytes() {
        assert!(matches!(
            peek_client_hello(b"GET / HTTP/1.1\r\n"),
            Peek::Invalid
        ));
    }

    #[tokio::test]
    async fn routes_by_server_name_and_replays_bytes() {
        let mux = SniMux::bind("127.0.0.1:0").await.unwrap();
        let mut listener = mux.listen("tls.example").unwrap();

        let addr = mux.addr();
        let hello = client_hello("tls.example");
        let sent = hello.clone();
        tokio::spawn(async move {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut conn, &sent)
                .await
                .unwrap();
            // Hold the socket open until the test finishes reading.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        });

        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.host, "tls.example");

        let mut replayed = vec![0u8; hello.len()];
        tokio::io::AsyncReadExt::read_exact(&mut conn.stream, &mut replayed)
            .await
            .unwrap();
        assert_eq!(replayed, hello);
    }

    #[tokio::test]
    async fn listen_refuses_duplicate_host() {
        let mux = SniMux::bind("127.0.0.1:0").await.unwrap();
        let _first = mux.listen("dup.example").unwrap();
        assert!(mux.listen("dup.example").is_err());
    }
}
