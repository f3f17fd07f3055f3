use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use h2::RecvStream;
use http::{header, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use backhaul_common::{
    copy_reader_to_send, copy_recv_to_writer, send_all, set_keepalive, DEFAULT_TIMEOUT,
};
use backhaul_proto::{
    Action, Auth, ControlMessage, Identity, IdentityError, Protocol, Tunnel, HEADER_ERROR,
};

use crate::listener::{Ingress, IngressStream, ListenerGuard};
use crate::pool::{ConnPool, PoolError};
use crate::registry::{HostAuth, Registry, RegistryError, RegistryItem};
use crate::sni::SniMux;

/// Upper bound on the JSON tunnel list received during the handshake.
const HANDSHAKE_BODY_LIMIT: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("client not subscribed")]
    NotSubscribed,

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Certificate(#[from] IdentityError),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("listener failed for tunnel {name}: {source}")]
    Listener { name: String, source: io::Error },

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    #[error(transparent)]
    Tunnel(#[from] backhaul_common::TunnelError),
}

impl From<http::Error> for ServerError {
    fn from(e: http::Error) -> Self {
        ServerError::Proxy(e.to_string())
    }
}

/// Hooks into subscription decisions, consulted when auto-subscribe is off.
pub trait SubscriptionListener: Send + Sync {
    /// May grant admission to an identity that is not yet subscribed, given
    /// the certificates the peer presented.
    fn can_subscribe(&self, identity: Identity, chain: &[CertificateDer<'static>]) -> bool;

    /// Called once an identity has been subscribed.
    fn subscribed(&self, _identity: Identity) {}

    /// Called before an identity is unsubscribed.
    fn unsubscribed(&self, _identity: Identity) {}
}

/// Configuration for [`Server`].
pub struct ServerConfig {
    /// TLS for the control listener; must require client certificates.
    pub tls: Arc<rustls::ServerConfig>,
    /// Subscribe every authenticated client on arrival. When off, only
    /// pre-enrolled identities (or ones granted by the subscription listener)
    /// may connect.
    pub auto_subscribe: bool,
    /// Address of the shared SNI muxer; `None` disables `sni` tunnels.
    pub sni_addr: Option<String>,
    /// How long to hold disconnect log lines, aggregating mass reconnects.
    /// Zero logs immediately.
    pub debounce: Duration,
    pub subscription_listener: Option<Arc<dyn SubscriptionListener>>,
}

/// The public side of the tunnel: accepts control connections, installs
/// tunnels, and forwards public ingress down to clients.
pub struct Server {
    registry: Registry,
    pool: ConnPool,
    tls_acceptor: TlsAcceptor,
    auto_subscribe: bool,
    debounce: Duration,
    subscription_listener: Option<Arc<dyn SubscriptionListener>>,
    sni: Option<SniMux>,
    shutdown: CancellationToken,
    pending_disconnects: Mutex<Vec<Identity>>,
    weak: Weak<Server>,
}

impl Server {
    /// Creates a new server, binding the SNI muxer when configured.
    pub async fn new(config: ServerConfig) -> Result<Arc<Server>, ServerError> {
        let sni = match &config.sni_addr {
            Some(addr) => Some(SniMux::bind(addr).await?),
            None => None,
        };

        let server = Arc::new_cyclic(|weak: &Weak<Server>| {
            let on_disconnect = weak.clone();
            let pool = ConnPool::new(Arc::new(move |identity| {
                if let Some(server) = on_disconnect.upgrade() {
                    server.disconnected(identity);
                }
            }));

            Server {
                registry: Registry::new(),
                pool,
                tls_acceptor: TlsAcceptor::from(config.tls.clone()),
                auto_subscribe: config.auto_subscribe,
                debounce: config.debounce,
                subscription_listener: config.subscription_listener.clone(),
                sni,
                shutdown: CancellationToken::new(),
                pending_disconnects: Mutex::new(Vec::new()),
                weak: weak.clone(),
            }
        });

        Ok(server)
    }

    /// Binds the control listener and runs the accept loop until [`stop`].
    ///
    /// [`stop`]: Server::stop
    pub async fn start(self: &Arc<Self>, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run(listener).await
    }

    /// Accept loop over an already bound control listener.
    pub async fn run(self: &Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!("control listener started on {}", addr);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("control listener on {} closed", addr);
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = set_keepalive(&stream) {
                        tracing::warn!("TCP keepalive for control connection failed: {}", e);
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_client(stream, peer).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("accept of control connection failed: {}", e);
                }
            }
        }
    }

    /// Stops the accept loops. In-flight streams are cut, not drained.
    pub fn stop(&self) {
        tracing::info!("server stopping");
        self.shutdown.cancel();
    }

    /// Measures round-trip time to a connected client.
    pub async fn ping(&self, identity: Identity) -> Result<Duration, PoolError> {
        self.pool.ping(identity).await
    }

    pub fn is_subscribed(&self, identity: Identity) -> bool {
        self.registry.is_subscribed(identity)
    }

    pub fn subscribe(&self, identity: Identity) {
        self.registry.subscribe(identity);
    }

    /// Pre-enrolls a host for an identity, as the allow-list file does.
    pub fn register_tunnel(&self, host: &str, identity: Identity) {
        self.registry.register_tunnel(host, identity);
    }

    /// Identity currently routing a public host, if any.
    pub fn subscriber(&self, host_port: &str) -> Option<Identity> {
        self.registry.subscriber(host_port).map(|(id, _)| id)
    }

    /// `(network, address)` of every listener installed for an identity.
    pub fn listeners(&self, identity: Identity) -> Vec<(String, String)> {
        self.registry.client_listeners(identity)
    }

    /// Bound address of the SNI muxer, when configured.
    pub fn sni_addr(&self) -> Option<SocketAddr> {
        self.sni.as_ref().map(|mux| mux.addr())
    }

    /// Removes a client: disconnects it and drops its registry entry.
    pub async fn unsubscribe(&self, identity: Identity) {
        if let Some(hook) = &self.subscription_listener {
            hook.unsubscribed(identity);
        }
        self.pool.delete(identity).await;
        if let Some(item) = self.registry.unsubscribe(identity) {
            close_listeners(identity, &item);
        }
    }

    // ---- control plane ----------------------------------------------------

    async fn handle_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!("control connection from {}", peer);

        let tls = match self.tls_acceptor.accept(stream).await {
            Ok(tls) => tls,
            Err(e) => {
                tracing::debug!("TLS handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let certs: Vec<CertificateDer<'static>> = {
            let (_, conn) = tls.get_ref();
            conn.peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default()
        };

        let identity = match Identity::from_peer_certs(&certs) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::debug!("certificate error from {}: {}", peer, e);
                return;
            }
        };

        if self.auto_subscribe {
            self.registry.subscribe(identity);
            if let Some(hook) = &self.subscription_listener {
                hook.subscribed(identity);
            }
        } else if !self.registry.is_subscribed(identity) {
            let granted = self
                .subscription_listener
                .as_ref()
                .map(|hook| hook.can_subscribe(identity, &certs))
                .unwrap_or(false);
            if granted {
                self.registry.subscribe(identity);
                if let Some(hook) = &self.subscription_listener {
                    hook.subscribed(identity);
                }
            } else {
                tracing::debug!("unknown client {} from {}", identity, peer);
                return;
            }
        }

        // From here the pool owns the connection; any rejection must evict
        // it and try to tell the client why.
        if let Err(e) = self.pool.add(tls, identity).await {
            tracing::info!("rejected {}: {}", identity, e);
            return;
        }

        // Taking over a dead predecessor unsubscribed the identity in
        // auto-subscribe mode; restore the entry before installing.
        if self.auto_subscribe {
            self.registry.subscribe(identity);
        }

        match self.finish_handshake(identity).await {
            Ok(reconnected) => {
                if reconnected {
                    tracing::debug!("client {} reconnected", identity);
                } else {
                    tracing::info!("client {} connected", identity);
                }
            }
            Err(e) => {
                tracing::info!("rejected {}: {}", identity, e);
                self.notify_error(&e, identity).await;
                self.pool.delete(identity).await;
            }
        }
    }

    async fn finish_handshake(&self, identity: Identity) -> Result<bool, ServerError> {
        let tunnels = self.exchange_tunnels(identity).await?;

        if tunnels.is_empty() {
            return Err(ServerError::HandshakeFailed("no tunnels".to_string()));
        }
        check_tunnels(self.auto_subscribe, &self.registry, &tunnels, identity)?;
        self.install_tunnels(tunnels, identity).await?;

        // A reconnect within the debounce window cancels its pending
        // disconnect log line.
        let mut pending = self.pending_disconnects.lock();
        let reconnected = match pending.iter().position(|id| *id == identity) {
            Some(at) => {
                pending.swap_remove(at);
                true
            }
            None => false,
        };
        Ok(reconnected)
    }

    /// Issues the reverse `CONNECT` and decodes the client's tunnel list.
    async fn exchange_tunnels(
        &self,
        identity: Identity,
    ) -> Result<HashMap<String, Tunnel>, ServerError> {
        let send_request = self.pool.get(identity).await?;

        timeout(DEFAULT_TIMEOUT, async {
            let mut send_request = send_request.ready().await?;
            let request = Request::builder()
                .method(Method::CONNECT)
                .uri(connect_uri(identity))
                .body(())?;
            let (response, _) = send_request.send_request(request, true)?;
            let response = response.await?;

            if response.status() != StatusCode::OK {
                return Err(ServerError::HandshakeFailed(format!(
                    "status {}",
                    response.status()
                )));
            }

            let mut body = response.into_body();
            let mut buf = BytesMut::new();
            while let Some(chunk) = body.data().await {
                let chunk = chunk?;
                if buf.len() + chunk.len() > HANDSHAKE_BODY_LIMIT {
                    return Err(ServerError::HandshakeFailed(
                        "tunnel list too large".to_string(),
                    ));
                }
                buf.extend_from_slice(&chunk);
                body.flow_control().release_capacity(chunk.len())?;
            }

            if buf.is_empty() {
                return Err(ServerError::HandshakeFailed("empty tunnel list".to_string()));
            }

            serde_json::from_slice(&buf)
                .map_err(|e| ServerError::HandshakeFailed(format!("bad tunnel list: {e}")))
        })
        .await
        .map_err(|_| ServerError::HandshakeFailed("handshake timed out".to_string()))?
    }

    /// Installs the tunnel set atomically: binds listeners first, then claims
    /// the hosts. On any failure everything bound so far is closed and the
    /// registry is untouched.
    async fn install_tunnels(
        &self,
        tunnels: HashMap<String, Tunnel>,
        identity: Identity,
    ) -> Result<(), ServerError> {
        let mut item = RegistryItem::default();
        let mut ingresses: Vec<(Ingress, CancellationToken)> = Vec::new();

        for (name, tunnel) in &tunnels {
            match tunnel.protocol {
                Protocol::Http => {
                    item.hosts.push(HostAuth {
                        host: tunnel.host.clone(),
                        auth: Auth::parse(&tunnel.auth),
                    });
                }
                Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6 | Protocol::Unix => {
                    let ingress = Ingress::bind(tunnel.protocol, &tunnel.addr)
                        .await
                        .map_err(|source| ServerError::Listener {
                            name: name.clone(),
                            source,
                        })?;
                    tracing::debug!(
                        "opened {} listener {} for {}",
                        ingress.network(),
                        ingress.local_addr(),
                        identity
                    );
                    let guard = ListenerGuard::new(ingress.local_addr(), ingress.network());
                    ingresses.push((ingress, guard.token()));
                    item.listeners.push(guard);
                }
                Protocol::Sni => {
                    let mux = self.sni.as_ref().ok_or_else(|| {
                        ServerError::HandshakeFailed(format!(
                            "sni muxer not configured, cannot install tunnel {name}"
                        ))
                    })?;
                    let listener =
                        mux.listen(&tunnel.host)
                            .map_err(|source| ServerError::Listener {
                                name: name.clone(),
                                source,
                            })?;
                    tracing::debug!("added sni vhost {} for {}", tunnel.host, identity);
                    let guard = ListenerGuard::new(tunnel.host.clone(), "tcp");
                    ingresses.push((Ingress::Sni(listener), guard.token()));
                    item.listeners.push(guard);
                }
            }
        }

        // Dropping `item` and `ingresses` on the error paths above and here
        // is the rollback: guards cancel, sockets close, the host index was
        // never touched.
        self.registry.set(item, identity)?;

        for (ingress, token) in ingresses {
            let server = self.arc_self();
            tokio::spawn(async move {
                server.listen(ingress, identity, token).await;
            });
        }

        Ok(())
    }

    /// Eviction callback from the pool: tear down whatever the identity had
    /// installed and log the disconnect, debounced.
    fn disconnected(&self, identity: Identity) {
        if self.debounce.is_zero() {
            tracing::info!("client {} disconnected", identity);
        } else {
            let mut pending = self.pending_disconnects.lock();
            pending.push(identity);
            if pending.len() == 1 {
                let server = self.arc_self();
                let debounce = self.debounce;
                tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    let drained: Vec<Identity> =
                        std::mem::take(&mut *server.pending_disconnects.lock());
                    for identity in drained {
                        tracing::info!("client {} disconnected", identity);
                    }
                });
            }
        }

        let item = if self.auto_subscribe {
            self.registry.unsubscribe(identity)
        } else {
            self.registry.clear(identity)
        };
        if let Some(item) = item {
            close_listeners(identity, &item);
        }
    }

    /// Tries to tell the client why it is being rejected: a `CONNECT` whose
    /// `x-error` header carries the reason.
    async fn notify_error(&self, error: &ServerError, identity: Identity) {
        let Ok(send_request) = self.pool.get(identity).await else {
            return;
        };

        let result = timeout(DEFAULT_TIMEOUT, async {
            let mut send_request = send_request.ready().await?;
            let reason = error.to_string().replace(['\r', '\n'], " ");
            let request = Request::builder()
                .method(Method::CONNECT)
                .uri(connect_uri(identity))
                .header(HEADER_ERROR, reason)
                .body(())?;
            let (response, _) = send_request.send_request(request, true)?;
            let _ = response.await;
            Ok::<_, ServerError>(())
        })
        .await;

        if !matches!(result, Ok(Ok(()))) {
            tracing::debug!("error notification to {} failed", identity);
        }
    }

    // ---- public ingress ---------------------------------------------------

    /// Serves public plain-HTTP ingress on a listener.
    pub async fn serve_http(self: &Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!("http ingress on {}", addr);
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let Ok((stream, peer)) = accepted else {
                continue;
            };
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_public_connection(stream, peer, false).await;
            });
        }
    }

    /// Serves public HTTPS ingress, terminating TLS with the given acceptor.
    pub async fn serve_https(
        self: &Arc<Self>,
        listener: TcpListener,
        tls: TlsAcceptor,
    ) -> io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!("https ingress on {}", addr);
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let Ok((stream, peer)) = accepted else {
                continue;
            };
            let server = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls.accept(stream).await {
                    Ok(stream) => server.serve_public_connection(stream, peer, true).await,
                    Err(e) => tracing::debug!("public TLS handshake from {} failed: {}", peer, e),
                }
            });
        }
    }

    async fn serve_public_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr, tls: bool)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let server = self.clone();
            async move { server.handle_http(req, peer, tls).await }
        });
        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            tracing::debug!("public connection from {} ended: {}", peer, e);
        }
    }

    /// The public HTTP handler: route by host, enforce tunnel auth, forward
    /// down the tunnel and stream the response back.
    pub async fn handle_http(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        tls: bool,
    ) -> Result<Response<PublicBody>, Infallible> {
        if req.method() == Method::TRACE {
            return Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            ));
        }

        match self.round_trip(req, peer, tls).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let mut builder = Response::builder().status(parts.status);
                for (name, value) in &parts.headers {
                    builder = builder.header(name, value);
                }
                Ok(builder
                    .body(FlowBody::new(body).boxed())
                    .unwrap_or_else(|_| {
                        text_response(StatusCode::BAD_GATEWAY, "bad tunnel response")
                    }))
            }
            Err(e @ ServerError::Unauthorized) => {
                let mut response = text_response(StatusCode::UNAUTHORIZED, &e.to_string());
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    header::HeaderValue::from_static("Basic realm=\"backhaul\""),
                );
                Ok(response)
            }
            Err(e @ ServerError::NotSubscribed) => {
                Ok(text_response(StatusCode::NOT_FOUND, &e.to_string()))
            }
            Err(e) => {
                tracing::debug!("round trip for {} failed: {}", peer, e);
                Ok(text_response(StatusCode::BAD_GATEWAY, &e.to_string()))
            }
        }
    }

    async fn round_trip(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        tls: bool,
    ) -> Result<Response<RecvStream>, ServerError> {
        let host = request_host(&req).ok_or(ServerError::NotSubscribed)?;
        let (identity, auth) = self
            .registry
            .subscriber(&host)
            .ok_or(ServerError::NotSubscribed)?;

        let (mut parts, body) = req.into_parts();

        if let Some(auth) = auth {
            let header = parts
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if !auth.verify_basic(header) {
                return Err(ServerError::Unauthorized);
            }
            parts.headers.remove(header::AUTHORIZATION);
        }

        append_forwarded_for(&mut parts.headers, peer);
        let scheme = if tls { "https" } else { "http" };
        if !parts.headers.contains_key("x-forwarded-host") {
            if let Ok(value) = header::HeaderValue::from_str(&host) {
                parts.headers.insert("x-forwarded-host", value);
            }
            if let Ok(value) = header::HeaderValue::from_str(scheme) {
                parts.headers.insert("x-forwarded-proto", value);
            }
        }

        let msg = ControlMessage {
            action: Action::Proxy,
            forwarded_host: host,
            forwarded_proto: scheme.to_string(),
            remote_addr: peer.to_string(),
        };

        self.proxy_http(identity, Request::from_parts(parts, body), &msg)
            .await
    }

    /// Opens the `PUT` stream for an HTTP ingress and pumps the serialized
    /// public request into it; the HTTP/2 response is the backend's reply.
    async fn proxy_http(
        &self,
        identity: Identity,
        req: Request<Incoming>,
        msg: &ControlMessage,
    ) -> Result<Response<RecvStream>, ServerError> {
        tracing::debug!("proxy http {} -> {}", msg.forwarded_host, identity);

        let send_request = self.pool.get(identity).await?;
        let mut send_request = send_request.ready().await?;
        let request = put_request(identity, msg)?;
        let (response, mut forward) = send_request.send_request(request, false)?;

        let (parts, body) = req.into_parts();
        tokio::spawn(async move {
            if let Err(e) = write_http1_request(parts, body, &mut forward).await {
                tracing::debug!("forward copy failed: {}", e);
            }
        });

        Ok(response.await?)
    }

    /// Per-listener accept loop for TCP/Unix/SNI ingress.
    async fn listen(self: Arc<Self>, mut ingress: Ingress, identity: Identity, token: CancellationToken) {
        let addr = ingress.local_addr();
        let network = ingress.network();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("listener {} for {} closed", addr, identity);
                    return;
                }
                accepted = ingress.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer, sni_host)) => {
                    if let Err(e) = stream.set_keepalive() {
                        tracing::warn!("TCP keepalive for proxied connection failed: {}", e);
                    }
                    let msg = ControlMessage {
                        action: Action::Proxy,
                        forwarded_host: sni_host.unwrap_or_else(|| addr.clone()),
                        forwarded_proto: network.to_string(),
                        remote_addr: peer,
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.proxy_conn(identity, stream, msg).await {
                            tracing::debug!("proxy for {} failed: {}", identity, e);
                        }
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    tracing::debug!("listener {} for {} went away", addr, identity);
                    return;
                }
                Err(e) => {
                    tracing::warn!("accept on {} failed: {}", addr, e);
                }
            }
        }
    }

    /// Streams one accepted socket through the tunnel: the request body is
    /// the forward direction, the response body the reverse one. Both run
    /// concurrently; once either finishes the other has the default timeout
    /// to complete.
    async fn proxy_conn(
        &self,
        identity: Identity,
        stream: IngressStream,
        msg: ControlMessage,
    ) -> Result<(), ServerError> {
        tracing::debug!("proxy conn {} -> {}", msg.forwarded_host, identity);

        let send_request = self.pool.get(identity).await?;
        let mut send_request = send_request.ready().await?;
        let request = put_request(identity, &msg)?;
        let (response, mut forward_stream) = send_request.send_request(request, false)?;

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let mut forward = tokio::spawn(async move {
            match copy_reader_to_send(&mut read_half, &mut forward_stream).await {
                Ok(n) => tracing::trace!("forwarded {} bytes to client", n),
                Err(e) => tracing::debug!("forward copy ended: {}", e),
            }
        });

        let reverse = async {
            let response = response.await?;
            let mut body = response.into_body();
            let n = copy_recv_to_writer(&mut body, &mut write_half).await?;
            // Half-close towards the public peer once the client is done.
            let _ = write_half.shutdown().await;
            tracing::trace!("returned {} bytes to user", n);
            Ok::<_, ServerError>(())
        };
        tokio::pin!(reverse);

        let result = tokio::select! {
            r = &mut reverse => {
                if timeout(DEFAULT_TIMEOUT, &mut forward).await.is_err() {
                    forward.abort();
                }
                r
            }
            _ = &mut forward => {
                match timeout(DEFAULT_TIMEOUT, &mut reverse).await {
                    Ok(r) => r,
                    Err(_) => Err(ServerError::Proxy(
                        "response stalled after forward completed".to_string(),
                    )),
                }
            }
        };

        tracing::debug!("proxy conn {} -> {} done", msg.forwarded_host, identity);
        result
    }

    fn arc_self(&self) -> Arc<Server> {
        self.weak.upgrade().expect("server dropped while in use")
    }
}

fn close_listeners(identity: Identity, item: &RegistryItem) {
    for listener in &item.listeners {
        tracing::debug!(
            "closing {} listener {} for {}",
            listener.network(),
            listener.addr(),
            identity
        );
        listener.close();
    }
}

/// Authority-form URI targeting a pooled client, used for `CONNECT`.
fn connect_uri(identity: Identity) -> Uri {
    Uri::builder()
        .authority(identity.to_string())
        .build()
        .expect("identity is a valid authority")
}

/// `PUT https://<identity>/` carrying a control message.
fn put_request(identity: Identity, msg: &ControlMessage) -> Result<Request<()>, ServerError> {
    let mut request = Request::builder()
        .method(Method::PUT)
        .uri(format!("https://{identity}/"))
        .body(())?;
    msg.write_to(request.headers_mut());
    Ok(request)
}

/// Subscription policy for a requested tunnel set: with auto-subscribe the
/// tunnels must be new to the registry; in strict mode they must be
/// pre-enrolled.
fn check_tunnels(
    auto_subscribe: bool,
    registry: &Registry,
    tunnels: &HashMap<String, Tunnel>,
    identity: Identity,
) -> Result<(), ServerError> {
    for (name, tunnel) in tunnels {
        let key = tunnel_key(tunnel);
        if auto_subscribe == registry.has_tunnel(key, identity) {
            return Err(ServerError::HandshakeFailed(format!(
                "tunnel {name} ({key}) not allowed for {identity}"
            )));
        }
    }
    Ok(())
}

/// The key a tunnel is enrolled and policy-checked under: its host, or for
/// host-less tunnels (`tcp`-family, `unix`) the public address it binds.
fn tunnel_key(tunnel: &Tunnel) -> &str {
    if tunnel.host.is_empty() {
        &tunnel.addr
    } else {
        &tunnel.host
    }
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.headers().get(header::HOST) {
        return host.to_str().ok().map(|h| h.to_string());
    }
    req.uri().authority().map(|a| a.to_string())
}

/// Appends the public peer to any existing `X-Forwarded-For` chain.
fn append_forwarded_for(headers: &mut http::HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = header::HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Serializes the public request as HTTP/1.1 (request line, headers, body)
/// into the tunnel stream, then half-closes it.
///
/// hyper hands the body out already de-chunked, so when the request was sent
/// with `transfer-encoding: chunked` the body is re-chunked to keep the
/// serialized request self-framing.
async fn write_http1_request(
    parts: http::request::Parts,
    mut body: Incoming,
    stream: &mut h2::SendStream<Bytes>,
) -> Result<(), ServerError> {
    let chunked = parts
        .headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

    let mut head = BytesMut::new();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", parts.method, path).as_bytes());

    if !parts.headers.contains_key(header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            head.extend_from_slice(format!("host: {authority}\r\n").as_bytes());
        }
    }
    for (name, value) in &parts.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    send_all(stream, head.freeze()).await?;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ServerError::Proxy(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            if data.is_empty() {
                continue;
            }
            if chunked {
                send_all(
                    stream,
                    Bytes::from(format!("{:x}\r\n", data.len()).into_bytes()),
                )
                .await?;
                send_all(stream, data).await?;
                send_all(stream, Bytes::from_static(b"\r\n")).await?;
            } else {
                send_all(stream, data).await?;
            }
        }
    }
    if chunked {
        send_all(stream, Bytes::from_static(b"0\r\n\r\n")).await?;
    }
    stream.send_data(Bytes::new(), true)?;
    Ok(())
}

pub type PublicBody = BoxBody<Bytes, io::Error>;

fn text_response(status: StatusCode, text: &str) -> Response<PublicBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("x-content-type-options", "nosniff")
        .body(
            Full::new(Bytes::from(format!("{text}\n")))
                .map_err(io::Error::other)
                .boxed(),
        )
        .expect("static response is valid")
}

/// Streams a tunnel response body out as a hyper body, releasing HTTP/2
/// flow-control capacity as chunks are consumed.
struct FlowBody {
    inner: RecvStream,
}

impl FlowBody {
    fn new(inner: RecvStream) -> FlowBody {
        FlowBody { inner }
    }
}

impl hyper::body::Body for FlowBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        match ready!(this.inner.poll_data(cx)) {
            Some(Ok(chunk)) => {
                let _ = this.inner.flow_control().release_capacity(chunk.len());
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(io::Error::other(e)))),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    fn http_tunnel(host: &str) -> Tunnel {
        Tunnel {
            protocol: Protocol::Http,
            host: host.to_string(),
            ..Default::default()
        }
    }

    fn tcp_tunnel(addr: &str) -> Tunnel {
        Tunnel {
            protocol: Protocol::Tcp,
            addr: addr.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn tunnel_key_prefers_host_over_addr() {
        assert_eq!(tunnel_key(&http_tunnel("foo.example")), "foo.example");
        assert_eq!(tunnel_key(&tcp_tunnel("0.0.0.0:2222")), "0.0.0.0:2222");

        let mut both = tcp_tunnel("0.0.0.0:2222");
        both.host = "named.example".to_string();
        assert_eq!(tunnel_key(&both), "named.example");
    }

    #[test]
    fn request_host_from_header_then_authority() {
        let req = Request::builder()
            .uri("/path")
            .header(header::HOST, "foo.example:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("foo.example:8080".to_string()));

        let req = Request::builder()
            .uri("https://bar.example/path")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("bar.example".to_string()));

        let req = Request::builder().uri("/path").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let peer: SocketAddr = "203.0.113.7:41812".parse().unwrap();

        let mut headers = http::HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers["x-forwarded-for"], "203.0.113.7");

        let mut headers = http::HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            header::HeaderValue::from_static("198.51.100.1"),
        );
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers["x-forwarded-for"], "198.51.100.1, 203.0.113.7");
    }

    #[test]
    fn auto_subscribe_rejects_tunnels_already_installed() {
        let registry = Registry::new();
        registry.subscribe(ident(1));
        registry
            .set(
                RegistryItem {
                    hosts: vec![HostAuth {
                        host: "taken.test".to_string(),
                        auth: None,
                    }],
                    listeners: vec![],
                },
                ident(1),
            )
            .unwrap();

        let mut tunnels = HashMap::new();
        tunnels.insert("web".to_string(), http_tunnel("taken.test"));
        assert!(check_tunnels(true, &registry, &tunnels, ident(1)).is_err());

        let mut fresh = HashMap::new();
        fresh.insert("web".to_string(), http_tunnel("fresh.test"));
        assert!(check_tunnels(true, &registry, &fresh, ident(1)).is_ok());
    }

    #[test]
    fn strict_mode_requires_enrollment() {
        let registry = Registry::new();
        registry.register_tunnel("pre.test", ident(1));
        registry.register_tunnel("0.0.0.0:2222", ident(1));

        let mut tunnels = HashMap::new();
        tunnels.insert("web".to_string(), http_tunnel("pre.test"));
        assert!(check_tunnels(false, &registry, &tunnels, ident(1)).is_ok());
        // A different identity cannot claim the same enrollment.
        assert!(check_tunnels(false, &registry, &tunnels, ident(2)).is_err());

        // Host-less tunnels are enrolled under their public address.
        let mut raw = HashMap::new();
        raw.insert("ssh".to_string(), tcp_tunnel("0.0.0.0:2222"));
        assert!(check_tunnels(false, &registry, &raw, ident(1)).is_ok());

        let mut unknown = HashMap::new();
        unknown.insert("ssh".to_string(), tcp_tunnel("0.0.0.0:9999"));
        assert!(check_tunnels(false, &registry, &unknown, ident(1)).is_err());
    }
}
