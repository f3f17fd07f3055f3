use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;

use backhaul_common::PING_TIMEOUT;
use backhaul_proto::Identity;

/// Invoked when a pooled connection goes away for any reason: transport
/// failure, takeover by a fresh connection, or explicit deletion. The server
/// uses it to tear down the identity's registry item and listeners.
pub type DisconnectListener = Arc<dyn Fn(Identity) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client not connected")]
    NotConnected,

    #[error("client already connected")]
    AlreadyConnected,

    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(#[from] h2::Error),
}

/// A live reverse connection: the HTTP/2 client handle over a TLS stream the
/// remote peer dialed. The pool owns the connection exclusively from `add`
/// until eviction; the driver task is the only place the socket is dropped.
struct ConnEntry {
    send_request: SendRequest<Bytes>,
    ping: Mutex<PingPong>,
    shutdown: CancellationToken,
    generation: u64,
}

/// Identity-keyed pool of reverse HTTP/2 connections.
///
/// This is the server's only path to a client: a request "to"
/// `https://<identity>` is a new stream on the pooled connection. At most one
/// live connection per identity is held; a second arrival wins only when the
/// incumbent fails a liveness ping.
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    conns: RwLock<HashMap<Identity, ConnEntry>>,
    listener: DisconnectListener,
    generation: AtomicU64,
}

impl ConnPool {
    pub fn new(listener: DisconnectListener) -> Self {
        ConnPool {
            inner: Arc::new(PoolInner {
                conns: RwLock::new(HashMap::new()),
                listener,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the HTTP/2 client handle for an identity, if a live connection
    /// is pooled. Callers drive `ready()` themselves under their own
    /// deadlines.
    pub async fn get(&self, identity: Identity) -> Result<SendRequest<Bytes>, PoolError> {
        let conns = self.inner.conns.read().await;
        match conns.get(&identity) {
            Some(entry) if !entry.shutdown.is_cancelled() => Ok(entry.send_request.clone()),
            _ => Err(PoolError::NotConnected),
        }
    }

    /// Installs a freshly accepted control connection.
    ///
    /// If the identity already has a pooled connection it is pinged first:
    /// only a pong within the ping timeout keeps the incumbent, rejecting
    /// the new arrival with [`PoolError::AlreadyConnected`]. A ping that
    /// errors or times out marks the incumbent dead; it is evicted (firing
    /// the disconnect listener) and replaced.
    pub async fn add(
        &self,
        conn: TlsStream<TcpStream>,
        identity: Identity,
    ) -> Result<(), PoolError> {
        let mut conns = self.inner.conns.write().await;

        if conns.contains_key(&identity) {
            let alive = {
                let entry = &conns[&identity];
                let mut ping = entry.ping.lock().await;
                matches!(timeout(PING_TIMEOUT, ping.ping(Ping::opaque())).await, Ok(Ok(_)))
            };
            if alive {
                return Err(PoolError::AlreadyConnected);
            }
            if let Some(stale) = conns.remove(&identity) {
                stale.shutdown.cancel();
                (self.inner.listener)(identity);
            }
        }

        let (send_request, mut connection) = h2::client::Builder::new().handshake(conn).await?;
        let ping = connection
            .ping_pong()
            .expect("ping handle is taken once per connection");

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();

        // The driver owns the socket. It ends when the transport breaks or
        // when the pool cancels it; a broken transport reports back so the
        // entry is evicted (mark-dead).
        let pool = Arc::downgrade(&self.inner);
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!(identity = %identity, error = %e, "tunnel transport failed");
                    }
                    mark_dead(pool, identity, generation).await;
                }
            }
        });

        conns.insert(
            identity,
            ConnEntry {
                send_request,
                ping: Mutex::new(ping),
                shutdown,
                generation,
            },
        );

        Ok(())
    }

    /// Evicts and closes the identity's connection. Idempotent.
    pub async fn delete(&self, identity: Identity) {
        let mut conns = self.inner.conns.write().await;
        if let Some(entry) = conns.remove(&identity) {
            entry.shutdown.cancel();
            (self.inner.listener)(identity);
        }
    }

    /// Round-trip liveness probe.
    pub async fn ping(&self, identity: Identity) -> Result<Duration, PoolError> {
        let conns = self.inner.conns.read().await;
        let entry = conns.get(&identity).ok_or(PoolError::NotConnected)?;
        let mut ping = entry.ping.lock().await;
        let start = Instant::now();
        timeout(PING_TIMEOUT, ping.ping(Ping::opaque()))
            .await
            .map_err(|_| PoolError::NotConnected)?
            .map_err(PoolError::Handshake)?;
        Ok(start.elapsed())
    }
}

/// Removes an entry after its transport broke, unless a newer connection
/// already took the slot.
async fn mark_dead(pool: Weak<PoolInner>, identity: Identity, generation: u64) {
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let mut conns = pool.conns.write().await;
    match conns.get(&identity) {
        Some(entry) if entry.generation == generation => {
            conns.remove(&identity);
            drop(conns);
            (pool.listener)(identity);
        }
        _ => {}
    }
}
