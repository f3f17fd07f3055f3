//! TCP and SNI tunnel end-to-end tests.

use std::collections::HashMap;
use std::sync::Arc;

use backhaul::TcpProxy;
use backhaul_e2e::{init_test, EchoProxy, MockTcpService, TestClient, TestServer, TestServerOptions};
use backhaul_proto::{Protocol, Tunnel};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn tcp_tunnel(local_addr: &str) -> HashMap<String, Tunnel> {
    let mut tunnels = HashMap::new();
    tunnels.insert(
        "raw".to_string(),
        Tunnel {
            protocol: Protocol::Tcp,
            addr: "127.0.0.1:0".to_string(),
            local_addr: local_addr.to_string(),
            ..Default::default()
        },
    );
    tunnels
}

#[tokio::test]
async fn tcp_echo_through_backend() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;

    let _client = TestClient::start(
        &server,
        tcp_tunnel(&mock.addr_string()),
        Arc::new(TcpProxy::new(mock.addr_string())),
    );

    let public_addr = server
        .wait_listener(server.certs.client_identity())
        .await;

    let mut conn = TcpStream::connect(&public_addr).await.unwrap();
    conn.write_all(b"ABCDE").await.unwrap();

    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ABCDE");

    drop(conn);
    // Backend records once its connection closes.
    for _ in 0..100 {
        if !mock.connections().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(mock.connections()[0].received, b"ABCDE");
}

#[tokio::test]
async fn tcp_echo_with_trickled_writes() {
    init_test();

    let server = TestServer::start().await;

    let _client = TestClient::start(&server, tcp_tunnel(""), Arc::new(EchoProxy));

    let public_addr = server
        .wait_listener(server.certs.client_identity())
        .await;

    let payload = b"this is a test";
    let conn = TcpStream::connect(&public_addr).await.unwrap();
    let (mut reader, mut writer) = conn.into_split();

    let write = tokio::spawn(async move {
        for &byte in payload {
            writer.write_all(&[byte]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        writer.shutdown().await.unwrap();
    });

    let mut echoed = Vec::new();
    reader.read_to_end(&mut echoed).await.unwrap();
    write.await.unwrap();

    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn sni_connections_are_routed_by_server_name() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        sni_addr: Some("127.0.0.1:0".to_string()),
        ..Default::default()
    })
    .await;

    let mut tunnels = HashMap::new();
    tunnels.insert(
        "tls".to_string(),
        Tunnel {
            protocol: Protocol::Sni,
            host: "tls.test".to_string(),
            ..Default::default()
        },
    );

    let _client = TestClient::start(&server, tunnels, Arc::new(EchoProxy));
    server.wait_listener(server.certs.client_identity()).await;

    let sni_addr = server.server.sni_addr().unwrap();
    let hello = client_hello_for("tls.test");

    let mut conn = TcpStream::connect(sni_addr).await.unwrap();
    conn.write_all(&hello).await.unwrap();
    conn.shutdown().await.unwrap();

    // The echo proxy returns the raw TLS bytes, ClientHello included.
    let mut echoed = Vec::new();
    conn.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, hello);
}

/// Minimal TLS ClientHello carrying only the server_name extension.
fn client_hello_for(name: &str) -> Vec<u8> {
    let name = name.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&(name.len() as u16 + 3).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut exts = Vec::new();
    exts.extend_from_slice(&0u16.to_be_bytes());
    exts.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    exts.extend_from_slice(&sni);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut handshake = vec![1, 0, 0, 0];
    let len = (body.len() as u32).to_be_bytes();
    handshake[1..4].copy_from_slice(&len[1..4]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
