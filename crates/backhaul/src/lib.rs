//! The private side of the backhaul reverse tunnel.
//!
//! A [`Client`] dials the public server over mutually-authenticated TLS and
//! then hosts the HTTP/2 *server* role on that single connection. The public
//! server opens a `CONNECT` stream to collect this client's tunnel
//! definitions, and one `PUT` stream per public ingress event; a [`Proxy`]
//! implementation carries each of those streams to a local backend.

mod backoff;
mod client;
mod config;
mod proxy;

pub use backoff::{Backoff, ExponentialBackoff};
pub use client::{Client, ClientConfig, ClientError};
pub use config::{BackoffConfig, ClientFileConfig};
pub use proxy::{DispatchProxy, DownStream, HttpProxy, Proxy, TcpProxy};
