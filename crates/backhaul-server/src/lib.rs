//! The public side of the backhaul reverse tunnel.
//!
//! The server accepts long-lived mTLS control connections from clients,
//! inverts the HTTP/2 roles over them, and turns every public ingress event
//! (an HTTP request to a routed host, a connection to a bound listener, a TLS
//! SNI match) into a stream pushed down the owning client's tunnel.
//!
//! The crate exposes the pieces individually so the server can be embedded,
//! for instance in tests.

mod allowlist;
mod config;
mod listener;
mod pool;
mod registry;
mod server;
mod sni;

pub use allowlist::load_allow_list;
pub use config::{FileConfig, ResolvedConfig};
pub use listener::ListenerGuard;
pub use pool::{DisconnectListener, PoolError};
pub use registry::{HostAuth, Registry, RegistryError, RegistryItem};
pub use server::{PublicBody, Server, ServerConfig, ServerError, SubscriptionListener};
pub use sni::{SniListener, SniMux};
