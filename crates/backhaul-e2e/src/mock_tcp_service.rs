//! Echo TCP backend for end-to-end tests.
//!
//! Plays the local service behind a `tcp` tunnel: echoes received bytes back
//! and records them per connection for assertions.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Bytes received on one accepted connection.
#[derive(Clone, Debug)]
pub struct RecordedConnection {
    pub received: Vec<u8>,
    pub peer: SocketAddr,
}

/// An echoing TCP service on an ephemeral port.
pub struct MockTcpService {
    addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedConnection>>>,
}

impl MockTcpService {
    pub async fn start() -> MockTcpService {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock tcp service");
        let addr = listener.local_addr().unwrap();
        let connections: Arc<RwLock<Vec<RecordedConnection>>> = Arc::new(RwLock::new(Vec::new()));

        let recorded = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    echo(stream, peer, recorded).await;
                });
            }
        });

        MockTcpService { addr, connections }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn connections(&self) -> Vec<RecordedConnection> {
        self.connections.read().clone()
    }
}

async fn echo(mut stream: TcpStream, peer: SocketAddr, recorded: Arc<RwLock<Vec<RecordedConnection>>>) {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                received.extend_from_slice(&buf[..n]);
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    recorded.write().push(RecordedConnection { received, peer });
}
