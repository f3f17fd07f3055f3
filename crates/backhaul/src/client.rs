use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use http::{Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use backhaul_common::{send_all, set_keepalive, DEFAULT_TIMEOUT};
use backhaul_proto::{ControlMessage, Tunnel, HEADER_ERROR};

use crate::backoff::Backoff;
use crate::proxy::{DownStream, Proxy};

/// Two serve loops ending this close together are treated as a fatal
/// misconfiguration rather than a network hiccup.
const FLAP_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backoff limit exceeded: {0}")]
    BackoffExhausted(String),

    #[error("server error: {0}")]
    ServerRejected(String),

    #[error("connection is being cut")]
    ConnectionCut,

    #[error("client already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration of the tunnel [`Client`].
pub struct ClientConfig {
    /// TCP address of the tunnel server.
    pub server_addr: String,
    /// TLS configuration presenting the client certificate the identity is
    /// derived from.
    pub tls: Arc<rustls::ClientConfig>,
    /// Retry schedule for dialing. `None` means a failed dial is fatal.
    pub backoff: Option<Box<dyn Backoff>>,
    /// Tunnels requested from the server during the handshake.
    pub tunnels: HashMap<String, Tunnel>,
    /// Handles proxy streams pushed down the tunnel.
    pub proxy: Arc<dyn Proxy>,
}

/// The private side of the tunnel.
///
/// The client dials the server over mTLS and then answers as an HTTP/2
/// *server* on that connection: the public server opens `CONNECT` for the
/// handshake and `PUT` streams for proxied traffic.
pub struct Client {
    server_addr: String,
    tls: TlsConnector,
    backoff: Mutex<Option<Box<dyn Backoff>>>,
    tunnels: HashMap<String, Tunnel>,
    proxy: Arc<dyn Proxy>,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    current: Option<CancellationToken>,
    server_error: Option<String>,
    last_disconnect: Option<Instant>,
    stopped: bool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Arc<Client>, ClientError> {
        if config.server_addr.is_empty() {
            return Err(ClientError::Config("missing server_addr".to_string()));
        }
        if config.tunnels.is_empty() {
            return Err(ClientError::Config("missing tunnels".to_string()));
        }

        Ok(Arc::new(Client {
            server_addr: config.server_addr,
            tls: TlsConnector::from(config.tls),
            backoff: Mutex::new(config.backoff),
            tunnels: config.tunnels,
            proxy: config.proxy,
            state: Mutex::new(ConnState::default()),
        }))
    }

    /// Connects and serves until a fatal error.
    ///
    /// Dial failures are retried per the backoff schedule. A server-reported
    /// rejection, an exhausted backoff, or a connection that keeps being cut
    /// right after establishment all terminate the loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        tracing::info!("client starting");

        loop {
            if self.state.lock().stopped {
                return Ok(());
            }
            let conn = self.connect().await?;

            let token = CancellationToken::new();
            {
                let mut state = self.state.lock();
                if state.current.is_some() {
                    return Err(ClientError::AlreadyStarted);
                }
                state.current = Some(token.clone());
            }

            self.serve(conn, token).await;
            tracing::info!("disconnected");

            let fatal = {
                let mut state = self.state.lock();
                if state.stopped {
                    return Ok(());
                }
                let now = Instant::now();
                let mut fatal = state
                    .server_error
                    .take()
                    .map(ClientError::ServerRejected);
                if fatal.is_none() {
                    if let Some(last) = state.last_disconnect {
                        if now.duration_since(last) < FLAP_WINDOW {
                            fatal = Some(ClientError::ConnectionCut);
                        }
                    }
                }
                state.current = None;
                state.last_disconnect = Some(now);
                fatal
            };

            if let Some(e) = fatal {
                return Err(e);
            }
        }
    }

    /// Closes the current connection; a concurrent [`start`] observes the
    /// closed transport and exits its serve loop. In-flight streams are cut.
    ///
    /// [`start`]: Client::start
    pub fn stop(&self) {
        tracing::info!("client stopping");
        let mut state = self.state.lock();
        state.stopped = true;
        if let Some(token) = state.current.take() {
            token.cancel();
        }
    }

    async fn connect(&self) -> Result<TlsStream<TcpStream>, ClientError> {
        loop {
            let error = match self.dial().await {
                Ok(conn) => {
                    if let Some(backoff) = self.backoff.lock().as_mut() {
                        backoff.reset();
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!("dial {} failed: {}", self.server_addr, e);
                    e
                }
            };

            let delay = match self.backoff.lock().as_mut() {
                None => return Err(error),
                Some(backoff) => backoff.next_backoff(),
            };
            match delay {
                Some(delay) => {
                    tracing::info!("retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(ClientError::BackoffExhausted(error.to_string())),
            }
        }
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>, ClientError> {
        tracing::info!("dialing {}", self.server_addr);

        let tcp = timeout(DEFAULT_TIMEOUT, TcpStream::connect(&self.server_addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
            })??;
        set_keepalive(&tcp)?;

        let host = self
            .server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.server_addr)
            .trim_matches(['[', ']']);
        let domain = ServerName::try_from(host.to_string())
            .map_err(|_| ClientError::Config(format!("invalid server name {host:?}")))?;

        Ok(self.tls.connect(domain, tcp).await?)
    }

    /// Hosts the HTTP/2 server side of the tunnel until the connection ends.
    async fn serve(self: &Arc<Self>, conn: TlsStream<TcpStream>, token: CancellationToken) {
        let mut connection = match h2::server::handshake(conn).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("tunnel handshake failed: {}", e);
                return;
            }
        };

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return,
                accepted = connection.accept() => accepted,
            };
            match accepted {
                Some(Ok((request, respond))) => {
                    let client = self.clone();
                    tokio::spawn(async move {
                        client.handle_stream(request, respond).await;
                    });
                }
                Some(Err(e)) => {
                    tracing::debug!("tunnel connection ended: {}", e);
                    return;
                }
                None => return,
            }
        }
    }

    /// Dispatches one server-initiated stream by method: `CONNECT` carries
    /// the handshake (or an error notification), `PUT` a proxied ingress.
    async fn handle_stream(
        self: Arc<Self>,
        request: Request<RecvStream>,
        mut respond: SendResponse<Bytes>,
    ) {
        let method = request.method().clone();
        if method == Method::CONNECT {
            if let Some(error) = request.headers().get(HEADER_ERROR) {
                let reason = String::from_utf8_lossy(error.as_bytes()).into_owned();
                tracing::warn!("server rejected tunnel: {}", reason);
                self.state.lock().server_error = Some(reason);
                let _ = respond.send_response(Response::new(()), true);
            } else {
                self.handle_handshake(respond);
            }
        } else if method == Method::PUT {
            self.handle_proxy(request, respond).await;
        } else {
            tracing::debug!("unexpected {} stream", method);
            send_status(&mut respond, StatusCode::BAD_REQUEST);
        }
    }

    fn handle_handshake(&self, mut respond: SendResponse<Bytes>) {
        tracing::info!("handshake");

        let body = match serde_json::to_vec(&self.tunnels) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("failed to encode tunnels: {}", e);
                send_status(&mut respond, StatusCode::INTERNAL_SERVER_ERROR);
                return;
            }
        };

        let response = Response::new(());
        match respond.send_response(response, false) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    if let Err(e) = send_all(&mut stream, Bytes::from(body)).await {
                        tracing::warn!("failed to send tunnel list: {}", e);
                        return;
                    }
                    let _ = stream.send_data(Bytes::new(), true);
                });
            }
            Err(e) => tracing::warn!("handshake response failed: {}", e),
        }
    }

    async fn handle_proxy(&self, request: Request<RecvStream>, mut respond: SendResponse<Bytes>) {
        let (parts, body) = request.into_parts();
        let msg = match ControlMessage::read_from(&parts.headers) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("bad control message: {}", e);
                send_status(&mut respond, StatusCode::BAD_REQUEST);
                return;
            }
        };

        tracing::debug!(
            "proxying {} stream for {}",
            msg.forwarded_proto,
            msg.forwarded_host
        );
        self.proxy.proxy(DownStream::new(respond), body, msg).await;
    }

    /// Tunnel definitions this client announces, keyed by name.
    pub fn tunnels(&self) -> &HashMap<String, Tunnel> {
        &self.tunnels
    }
}

fn send_status(respond: &mut SendResponse<Bytes>, status: StatusCode) {
    let response = Response::builder()
        .status(status)
        .body(())
        .expect("static response is valid");
    let _ = respond.send_response(response, true);
}
