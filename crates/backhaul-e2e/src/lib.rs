//! End-to-end test utilities for the backhaul tunnel.
//!
//! Provides runtime-generated certificates, an in-process server/client
//! harness, and mock HTTP/TCP backends, so the whole tunnel path can be
//! exercised without external infrastructure.

pub mod certificates;
pub mod harness;
pub mod mock_service;
pub mod mock_tcp_service;

pub use certificates::TestCertificates;
pub use harness::{
    connect_unresponsive_client, EchoProxy, ScriptedBackoff, TestClient, TestServer,
    TestServerOptions,
};
pub use mock_service::{MockHttpService, RecordedRequest};
pub use mock_tcp_service::{MockTcpService, RecordedConnection};

/// Installs the crypto provider and test logging once per process.
pub fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = tracing_subscriber::fmt()
        .with_env_filter("backhaul=debug,backhaul_server=debug,backhaul_e2e=debug")
        .with_test_writer()
        .try_init();
}
