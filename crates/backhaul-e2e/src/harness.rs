//! In-process server and client harness for end-to-end tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use h2::RecvStream;
use http::Response;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use backhaul::{Backoff, Client, ClientConfig, ClientError, DownStream, Proxy};
use backhaul_common::send_all;
use backhaul_proto::{ControlMessage, Identity, Tunnel};
use backhaul_server::{Server, ServerConfig, SubscriptionListener};

use crate::certificates::TestCertificates;

/// Options for [`TestServer::start_with`].
pub struct TestServerOptions {
    pub auto_subscribe: bool,
    pub sni_addr: Option<String>,
    /// Bind the control listener here instead of an ephemeral port, for
    /// restart tests.
    pub control_addr: Option<SocketAddr>,
    /// Reuse an existing certificate set, for restart tests.
    pub certs: Option<Arc<TestCertificates>>,
    /// Admission hook for strict-mode tests.
    pub subscription_listener: Option<Arc<dyn SubscriptionListener>>,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        TestServerOptions {
            auto_subscribe: true,
            sni_addr: None,
            control_addr: None,
            certs: None,
            subscription_listener: None,
        }
    }
}

/// A running in-process tunnel server with a public HTTP plane.
pub struct TestServer {
    pub server: Arc<Server>,
    pub control_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub certs: Arc<TestCertificates>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        TestServer::start_with(TestServerOptions::default()).await
    }

    pub async fn start_with(options: TestServerOptions) -> TestServer {
        let certs = options
            .certs
            .unwrap_or_else(|| Arc::new(TestCertificates::generate()));

        let tls = backhaul_common::load_server_config_from_pem(
            &certs.server_cert_pem,
            &certs.server_key_pem,
            &certs.ca_cert_pem,
        )
        .expect("failed to build server TLS config");

        let server = Server::new(ServerConfig {
            tls: Arc::new(tls),
            auto_subscribe: options.auto_subscribe,
            sni_addr: options.sni_addr,
            debounce: Duration::ZERO,
            subscription_listener: options.subscription_listener,
        })
        .await
        .expect("failed to create server");

        let control_bind = options
            .control_addr
            .unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
        // Restart tests rebind a just-freed port; give the old socket a
        // moment to go away.
        let control_listener = {
            let mut attempts = 0;
            loop {
                match TcpListener::bind(control_bind).await {
                    Ok(listener) => break listener,
                    Err(_) if attempts < 20 => {
                        attempts += 1;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => panic!("failed to bind control listener: {e}"),
                }
            }
        };
        let control_addr = control_listener.local_addr().unwrap();

        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind http listener");
        let http_addr = http_listener.local_addr().unwrap();

        {
            let server = server.clone();
            tokio::spawn(async move { server.run(control_listener).await });
        }
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve_http(http_listener).await });
        }

        TestServer {
            server,
            control_addr,
            http_addr,
            certs,
        }
    }

    /// TLS config for the first client identity.
    pub fn client_tls(&self) -> rustls::ClientConfig {
        backhaul_common::load_client_config_from_pem(
            &self.certs.client_cert_pem,
            &self.certs.client_key_pem,
            &self.certs.ca_cert_pem,
        )
        .expect("failed to build client TLS config")
    }

    /// TLS config for the second client identity.
    pub fn second_client_tls(&self) -> rustls::ClientConfig {
        backhaul_common::load_client_config_from_pem(
            &self.certs.second_client_cert_pem,
            &self.certs.second_client_key_pem,
            &self.certs.ca_cert_pem,
        )
        .expect("failed to build client TLS config")
    }

    /// Waits until a host is routable, or panics.
    pub async fn wait_routed(&self, host: &str) {
        for _ in 0..100 {
            if self.server.subscriber(host).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("host {host:?} never became routable");
    }

    /// Waits until the identity has a bound listener and returns its address.
    pub async fn wait_listener(&self, identity: Identity) -> String {
        for _ in 0..100 {
            if let Some((_, addr)) = self.server.listeners(identity).into_iter().next() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("identity {identity} never bound a listener");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
    }
}

/// A tunnel client running on its own task.
pub struct TestClient {
    pub client: Arc<Client>,
    handle: JoinHandle<Result<(), ClientError>>,
}

impl TestClient {
    /// Starts a client for the first test identity with a small retry
    /// schedule.
    pub fn start(
        server: &TestServer,
        tunnels: HashMap<String, Tunnel>,
        proxy: Arc<dyn Proxy>,
    ) -> TestClient {
        TestClient::start_with(
            server.client_tls(),
            server.control_addr,
            tunnels,
            proxy,
            Some(Box::new(ScriptedBackoff::repeating(
                Duration::from_millis(50),
            ))),
        )
    }

    pub fn start_with(
        tls: rustls::ClientConfig,
        control_addr: SocketAddr,
        tunnels: HashMap<String, Tunnel>,
        proxy: Arc<dyn Proxy>,
        backoff: Option<Box<dyn Backoff>>,
    ) -> TestClient {
        let client = Client::new(ClientConfig {
            server_addr: control_addr.to_string(),
            tls: Arc::new(tls),
            backoff,
            tunnels,
            proxy,
        })
        .expect("failed to create client");

        let handle = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };

        TestClient { client, handle }
    }

    /// Waits for the client loop to finish.
    pub async fn join(mut self) -> Result<(), ClientError> {
        (&mut self.handle).await.expect("client task panicked")
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.client.stop();
        self.handle.abort();
    }
}

/// Proxy that echoes every stream's bytes straight back, for TCP tests.
pub struct EchoProxy;

#[async_trait]
impl Proxy for EchoProxy {
    async fn proxy(&self, down: DownStream, mut up: RecvStream, _msg: ControlMessage) {
        let mut stream = match down.start() {
            Ok(stream) => stream,
            Err(_) => return,
        };
        while let Some(chunk) = up.data().await {
            let Ok(chunk) = chunk else { return };
            let _ = up.flow_control().release_capacity(chunk.len());
            if send_all(&mut stream, chunk).await.is_err() {
                return;
            }
        }
        let _ = stream.send_data(Bytes::new(), true);
    }
}

/// Backoff following a fixed script of delays, optionally repeating one
/// delay forever.
pub struct ScriptedBackoff {
    delays: Vec<Duration>,
    repeating: bool,
    at: usize,
}

impl ScriptedBackoff {
    /// Yields the given delays in order, then gives up.
    pub fn new(delays: Vec<Duration>) -> ScriptedBackoff {
        ScriptedBackoff {
            delays,
            repeating: false,
            at: 0,
        }
    }

    /// Yields the same delay forever.
    pub fn repeating(delay: Duration) -> ScriptedBackoff {
        ScriptedBackoff {
            delays: vec![delay],
            repeating: true,
            at: 0,
        }
    }
}

impl Backoff for ScriptedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.repeating {
            return Some(self.delays[0]);
        }
        let delay = self.delays.get(self.at).copied();
        self.at += 1;
        delay
    }

    fn reset(&mut self) {
        self.at = 0;
    }
}

/// Connects a client that completes the tunnel handshake and then never
/// drives its connection again: the socket stays open but pings go
/// unanswered. Simulates a peer whose process died without closing TCP.
pub async fn connect_unresponsive_client(
    server: &TestServer,
    tunnels: &HashMap<String, Tunnel>,
) {
    let connector = TlsConnector::from(Arc::new(server.client_tls()));
    let tcp = TcpStream::connect(server.control_addr)
        .await
        .expect("failed to dial control listener");
    let domain = rustls::pki_types::ServerName::try_from(server.control_addr.ip().to_string())
        .expect("ip server name");
    let tls = connector.connect(domain, tcp).await.expect("TLS handshake");

    let mut conn = h2::server::handshake(tls).await.expect("h2 handshake");

    // Answer the server's CONNECT with the tunnel list.
    if let Some(Ok((request, mut respond))) = conn.accept().await {
        assert_eq!(request.method(), http::Method::CONNECT);
        let body = serde_json::to_vec(tunnels).unwrap();
        let mut stream = respond
            .send_response(Response::new(()), false)
            .expect("send handshake response");
        stream.send_data(Bytes::from(body), false).unwrap();
        stream.send_data(Bytes::new(), true).unwrap();
    }

    // Keep driving the connection briefly so the queued response actually
    // reaches the wire, then park it un-polled.
    let _ = timeout(Duration::from_millis(300), conn.accept()).await;
    tokio::spawn(async move {
        let _parked = conn;
        std::future::pending::<()>().await
    });
}
