use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use http::{Response, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use backhaul_common::{copy_reader_to_send, copy_recv_to_writer, send_all, DEFAULT_TIMEOUT};
use backhaul_proto::ControlMessage;

/// The reverse channel of a proxy stream, wrapping the HTTP/2 response.
///
/// An adapter either starts a plain `200` byte stream (TCP-style traffic) or
/// sends a full status/header response whose body it then writes (HTTP
/// traffic).
pub struct DownStream {
    respond: SendResponse<Bytes>,
}

impl DownStream {
    pub(crate) fn new(respond: SendResponse<Bytes>) -> DownStream {
        DownStream { respond }
    }

    /// Sends response headers and returns the body writer.
    pub fn send_response(
        mut self,
        response: Response<()>,
    ) -> Result<SendStream<Bytes>, h2::Error> {
        self.respond.send_response(response, false)
    }

    /// Starts a plain `200` stream for raw byte traffic.
    pub fn start(self) -> Result<SendStream<Bytes>, h2::Error> {
        self.send_response(Response::new(()))
    }

    /// Ends the stream with a status and no body. The status is advisory;
    /// the server logs it but public TCP peers just see the stream close.
    pub fn reject(mut self, status: StatusCode) {
        let response = Response::builder()
            .status(status)
            .body(())
            .expect("static response is valid");
        let _ = self.respond.send_response(response, true);
    }
}

/// Handles proxy streams arriving over the tunnel.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Transfers data between the tunnel stream and a local backend. `up` is
    /// the forward direction (public caller to backend), `down` the reverse.
    async fn proxy(&self, down: DownStream, up: RecvStream, msg: ControlMessage);
}

/// Looks up the backend address for a forwarded host: exact `host:port`
/// match first, then bare port, then `0.0.0.0:port`, then bare host, then
/// the default.
fn local_addr_for<'a>(
    default: &'a str,
    map: &'a HashMap<String, String>,
    forwarded_host: &str,
) -> Option<&'a str> {
    if map.is_empty() {
        return (!default.is_empty()).then_some(default);
    }

    if let Some(addr) = map.get(forwarded_host) {
        return Some(addr);
    }
    if let Some((host, port)) = forwarded_host.rsplit_once(':') {
        if let Some(addr) = map.get(port) {
            return Some(addr);
        }
        if let Some(addr) = map.get(&format!("0.0.0.0:{port}")) {
            return Some(addr);
        }
        if let Some(addr) = map.get(host) {
            return Some(addr);
        }
    }
    (!default.is_empty()).then_some(default)
}

/// Forwards raw TCP streams to a local backend.
pub struct TcpProxy {
    local_addr: String,
    local_addr_map: HashMap<String, String>,
}

impl TcpProxy {
    /// Direct proxy: every stream goes to `local_addr`.
    pub fn new(local_addr: impl Into<String>) -> TcpProxy {
        TcpProxy {
            local_addr: local_addr.into(),
            local_addr_map: HashMap::new(),
        }
    }

    /// Dispatching proxy: streams go to different backends based on the
    /// forwarded host.
    pub fn new_multi(local_addr_map: HashMap<String, String>) -> TcpProxy {
        TcpProxy {
            local_addr: String::new(),
            local_addr_map,
        }
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    async fn proxy(&self, down: DownStream, mut up: RecvStream, msg: ControlMessage) {
        match msg.forwarded_proto.as_str() {
            "tcp" | "tcp4" | "tcp6" | "unix" => {}
            other => {
                tracing::warn!("tcp proxy got unsupported protocol {}", other);
                down.reject(StatusCode::BAD_REQUEST);
                return;
            }
        }

        let Some(target) = local_addr_for(&self.local_addr, &self.local_addr_map, &msg.forwarded_host)
        else {
            tracing::warn!("no backend for {}", msg.forwarded_host);
            down.reject(StatusCode::BAD_GATEWAY);
            return;
        };

        let local = match timeout(DEFAULT_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => {
                tracing::warn!("dial {} failed: {}", target, e);
                down.reject(StatusCode::BAD_GATEWAY);
                return;
            }
            Err(_) => {
                tracing::warn!("dial {} timed out", target);
                down.reject(StatusCode::BAD_GATEWAY);
                return;
            }
        };
        if let Err(e) = backhaul_common::set_keepalive(&local) {
            tracing::debug!("TCP keepalive for backend connection failed: {}", e);
        }

        let mut reverse_stream = match down.start() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("failed to open reverse stream: {}", e);
                return;
            }
        };

        let (mut read_half, mut write_half) = local.into_split();

        let reverse = tokio::spawn(async move {
            match copy_reader_to_send(&mut read_half, &mut reverse_stream).await {
                Ok(n) => tracing::trace!("returned {} bytes", n),
                Err(e) => tracing::debug!("reverse copy ended: {}", e),
            }
        });

        match copy_recv_to_writer(&mut up, &mut write_half).await {
            Ok(n) => tracing::trace!("forwarded {} bytes", n),
            Err(e) => tracing::debug!("forward copy ended: {}", e),
        }
        // Forward direction done: half-close towards the backend, let the
        // reverse direction finish on its own.
        let _ = write_half.shutdown().await;
        let _ = reverse.await;
    }
}

/// Forwards tunneled HTTP traffic to a local HTTP/1.1 backend.
///
/// The forward bytes of an HTTP proxy stream are a serialized HTTP/1.1
/// request. The adapter relays them to the backend verbatim, parses the
/// backend's response head, and replays status, headers and a
/// framing-decoded body up the tunnel stream.
pub struct HttpProxy {
    local_addr: String,
    local_addr_map: HashMap<String, String>,
}

impl HttpProxy {
    pub fn new(local_addr: impl Into<String>) -> HttpProxy {
        HttpProxy {
            local_addr: local_addr.into(),
            local_addr_map: HashMap::new(),
        }
    }

    pub fn new_multi(local_addr_map: HashMap<String, String>) -> HttpProxy {
        HttpProxy {
            local_addr: String::new(),
            local_addr_map,
        }
    }
}

#[async_trait]
impl Proxy for HttpProxy {
    async fn proxy(&self, down: DownStream, mut up: RecvStream, msg: ControlMessage) {
        match msg.forwarded_proto.as_str() {
            "http" | "https" => {}
            other => {
                tracing::warn!("http proxy got unsupported protocol {}", other);
                down.reject(StatusCode::BAD_REQUEST);
                return;
            }
        }

        let Some(target) = local_addr_for(&self.local_addr, &self.local_addr_map, &msg.forwarded_host)
        else {
            tracing::warn!("no backend for {}", msg.forwarded_host);
            down.reject(StatusCode::BAD_GATEWAY);
            return;
        };

        let local = match timeout(DEFAULT_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => {
                tracing::warn!("dial {} failed: {}", target, e);
                down.reject(StatusCode::BAD_GATEWAY);
                return;
            }
            Err(_) => {
                tracing::warn!("dial {} timed out", target);
                down.reject(StatusCode::BAD_GATEWAY);
                return;
            }
        };

        let (read_half, mut write_half) = local.into_split();

        // Pump the serialized request towards the backend while we wait for
        // its response head.
        let forward = tokio::spawn(async move {
            if let Err(e) = copy_recv_to_writer(&mut up, &mut write_half).await {
                tracing::debug!("request copy ended: {}", e);
            }
            let _ = write_half.shutdown().await;
        });

        if let Err(e) = relay_response(read_half, down).await {
            tracing::warn!("relaying response from {} failed: {}", target, e);
        }
        let _ = forward.await;
    }
}

/// Reads the backend's HTTP/1.1 response and replays it up the tunnel.
async fn relay_response<R>(mut backend: R, down: DownStream) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head = loop {
        if backend.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed before response head",
            ));
        }
        if let Some(head) = parse_response_head(&mut buf)? {
            break head;
        }
    };

    let mut response = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        response = response.header(name.as_str(), value.as_slice());
    }
    let response = response
        .body(())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut stream = down
        .send_response(response)
        .map_err(io::Error::other)?;

    let result = match head.framing {
        Framing::Length(n) => relay_exact(&mut backend, &mut buf, &mut stream, n).await,
        Framing::Chunked => relay_chunked(&mut backend, &mut buf, &mut stream).await,
        Framing::Eof => relay_to_eof(&mut backend, &mut buf, &mut stream).await,
    };
    if result.is_ok() {
        stream
            .send_data(Bytes::new(), true)
            .map_err(io::Error::other)?;
    }
    result
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    framing: Framing,
}

enum Framing {
    Length(u64),
    Chunked,
    Eof,
}

/// Tries to parse a complete response head out of `buf`, consuming it on
/// success.
fn parse_response_head(buf: &mut BytesMut) -> io::Result<Option<ResponseHead>> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);

    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad response head: {e}"),
            ))
        }
    };

    let status = parsed.code.unwrap_or(502);
    let headers: Vec<(String, Vec<u8>)> = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_ascii_lowercase(), h.value.to_vec()))
        .collect();

    let mut framing = Framing::Eof;
    for (name, value) in &headers {
        if name == "transfer-encoding" {
            let value = String::from_utf8_lossy(value);
            if value.to_ascii_lowercase().contains("chunked") {
                framing = Framing::Chunked;
                break;
            }
        }
        if name == "content-length" {
            if let Ok(n) = String::from_utf8_lossy(value).trim().parse() {
                framing = Framing::Length(n);
            }
        }
    }
    // Bodiless statuses.
    if status == 204 || status == 304 || (100..200).contains(&status) {
        framing = Framing::Length(0);
    }

    buf.advance(consumed);
    Ok(Some(ResponseHead {
        status,
        headers,
        framing,
    }))
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
    )
}

async fn relay_exact<R>(
    backend: &mut R,
    buf: &mut BytesMut,
    stream: &mut SendStream<Bytes>,
    mut remaining: u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while remaining > 0 {
        if buf.is_empty() && backend.read_buf(buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed mid-body",
            ));
        }
        let n = (buf.len() as u64).min(remaining) as usize;
        let chunk = buf.split_to(n).freeze();
        send_all(stream, chunk).await.map_err(io::Error::other)?;
        remaining -= n as u64;
    }
    Ok(())
}

async fn relay_to_eof<R>(
    backend: &mut R,
    buf: &mut BytesMut,
    stream: &mut SendStream<Bytes>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let chunk = buf.split().freeze();
            send_all(stream, chunk).await.map_err(io::Error::other)?;
        }
        if backend.read_buf(buf).await? == 0 {
            return Ok(());
        }
    }
}

/// Decodes a chunked body, forwarding only the payload bytes.
async fn relay_chunked<R>(
    backend: &mut R,
    buf: &mut BytesMut,
    stream: &mut SendStream<Bytes>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = read_line(backend, buf).await?;
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_text, 16).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad chunk size {size_text:?}"),
            )
        })?;

        if size == 0 {
            // Trailer section: lines until the empty one.
            loop {
                if read_line(backend, buf).await?.is_empty() {
                    return Ok(());
                }
            }
        }

        relay_exact(backend, buf, stream, size).await?;

        let crlf = read_line(backend, buf).await?;
        if !crlf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing chunk delimiter",
            ));
        }
    }
}

async fn read_line<R>(backend: &mut R, buf: &mut BytesMut) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(at) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(at + 1);
            let line = &line[..line.len() - 1];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            return String::from_utf8(line.to_vec()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "non-utf8 chunk header")
            });
        }
        if backend.read_buf(buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed mid-chunk",
            ));
        }
    }
}

/// Combines protocol-specific proxies behind one dispatcher, routing by the
/// control message's forwarded protocol.
#[derive(Default)]
pub struct DispatchProxy {
    http: Option<Box<dyn Proxy>>,
    tcp: Option<Box<dyn Proxy>>,
}

impl DispatchProxy {
    pub fn new() -> DispatchProxy {
        DispatchProxy::default()
    }

    pub fn with_http(mut self, proxy: impl Proxy + 'static) -> DispatchProxy {
        self.http = Some(Box::new(proxy));
        self
    }

    pub fn with_tcp(mut self, proxy: impl Proxy + 'static) -> DispatchProxy {
        self.tcp = Some(Box::new(proxy));
        self
    }
}

#[async_trait]
impl Proxy for DispatchProxy {
    async fn proxy(&self, down: DownStream, up: RecvStream, msg: ControlMessage) {
        let proxy = match msg.forwarded_proto.as_str() {
            "http" | "https" => self.http.as_ref(),
            "tcp" | "tcp4" | "tcp6" | "unix" => self.tcp.as_ref(),
            _ => None,
        };
        match proxy {
            Some(proxy) => proxy.proxy(down, up, msg).await,
            None => {
                tracing::warn!("no proxy for protocol {}", msg.forwarded_proto);
                down.reject(StatusCode::BAD_REQUEST);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_lookup_precedence() {
        let mut map = HashMap::new();
        map.insert("foo.example:8080".to_string(), "127.0.0.1:1".to_string());
        map.insert("9090".to_string(), "127.0.0.1:2".to_string());
        map.insert("0.0.0.0:7070".to_string(), "127.0.0.1:3".to_string());
        map.insert("bar.example".to_string(), "127.0.0.1:4".to_string());

        assert_eq!(
            local_addr_for("", &map, "foo.example:8080"),
            Some("127.0.0.1:1")
        );
        assert_eq!(
            local_addr_for("", &map, "anything.example:9090"),
            Some("127.0.0.1:2")
        );
        assert_eq!(
            local_addr_for("", &map, "anything.example:7070"),
            Some("127.0.0.1:3")
        );
        assert_eq!(
            local_addr_for("", &map, "bar.example:5555"),
            Some("127.0.0.1:4")
        );
        assert_eq!(local_addr_for("", &map, "unknown.example:1234"), None);
        assert_eq!(
            local_addr_for("fallback:1", &HashMap::new(), "whatever"),
            Some("fallback:1")
        );
    }

    #[test]
    fn parses_response_head_and_framing() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 201 Created\r\ncontent-length: 5\r\nx-test: yes\r\n\r\nhello"[..],
        );
        let head = parse_response_head(&mut buf).unwrap().unwrap();
        assert_eq!(head.status, 201);
        assert!(matches!(head.framing, Framing::Length(5)));
        assert_eq!(&buf[..], b"hello");
        assert!(head
            .headers
            .iter()
            .any(|(name, value)| name == "x-test" && value == b"yes"));
    }

    #[test]
    fn partial_head_asks_for_more() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-"[..]);
        assert!(parse_response_head(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn chunked_bodies_are_decoded() {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = std::io::Cursor::new(&raw[..]);
        let mut buf = BytesMut::new();

        // Collect what relay_chunked would forward by replaying its framing
        // logic against an in-memory reader.
        let mut collected = Vec::new();
        loop {
            let line = read_line(&mut reader, &mut buf).await.unwrap();
            let size = u64::from_str_radix(line.trim(), 16).unwrap();
            if size == 0 {
                break;
            }
            while (buf.len() as u64) < size {
                reader.read_buf(&mut buf).await.unwrap();
            }
            collected.extend_from_slice(&buf.split_to(size as usize));
            read_line(&mut reader, &mut buf).await.unwrap();
        }
        assert_eq!(collected, b"hello world");
    }
}
