use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use backhaul_proto::{Auth, Identity};

use crate::listener::ListenerGuard;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client not subscribed")]
    NotSubscribed,

    #[error("attempt to overwrite registry item")]
    AlreadyInstalled,

    #[error("missing auth user for host {0:?}")]
    MissingAuthUser(String),

    #[error("host {0:?} is occupied")]
    HostOccupied(String),
}

/// Host and authentication info for one routable HTTP host.
#[derive(Debug)]
pub struct HostAuth {
    pub host: String,
    pub auth: Option<Auth>,
}

/// Everything one identity exposes: routable hosts and bound listeners.
#[derive(Default)]
pub struct RegistryItem {
    pub hosts: Vec<HostAuth>,
    pub listeners: Vec<ListenerGuard>,
}

/// A subscribed identity either has no tunnels installed yet (the state right
/// after admission) or a fully installed item. Ingress never observes a
/// half-installed set.
enum Entry {
    Subscribed,
    Installed(RegistryItem),
}

struct HostInfo {
    identity: Identity,
    auth: Option<Auth>,
}

/// Per-identity routing state plus the reverse `host → identity` index.
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    items: HashMap<Identity, Entry>,
    hosts: HashMap<String, HostInfo>,
    /// Pre-enrolled hosts (`host → identity`), fed by the allow-list. Strict
    /// admission requires a match here.
    allowed: HashMap<String, Identity>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Admits an identity. Idempotent; an existing entry is untouched.
    pub fn subscribe(&self, identity: Identity) {
        let mut inner = self.inner.write();
        if inner.items.contains_key(&identity) {
            return;
        }
        tracing::debug!(identity = %identity, "subscribe");
        inner.items.insert(identity, Entry::Subscribed);
    }

    pub fn is_subscribed(&self, identity: Identity) -> bool {
        self.inner.read().items.contains_key(&identity)
    }

    /// Looks up the identity routing a public host. The port component of
    /// `host_port` is ignored; the hostname match is exact.
    pub fn subscriber(&self, host_port: &str) -> Option<(Identity, Option<Auth>)> {
        let inner = self.inner.read();
        inner
            .hosts
            .get(trim_port(host_port))
            .map(|info| (info.identity, info.auth.clone()))
    }

    /// Atomically installs an item for a subscribed identity.
    ///
    /// Fails without any change to the host index when the identity is
    /// unknown, already has an installed item, claims an occupied host, or
    /// sets auth without a user.
    pub fn set(&self, item: RegistryItem, identity: Identity) -> Result<(), RegistryError> {
        tracing::debug!(identity = %identity, "set registry item");
        let mut inner = self.inner.write();

        match inner.items.get(&identity) {
            None => return Err(RegistryError::NotSubscribed),
            Some(Entry::Installed(_)) => return Err(RegistryError::AlreadyInstalled),
            Some(Entry::Subscribed) => {}
        }

        for host in &item.hosts {
            if let Some(auth) = &host.auth {
                if auth.user.is_empty() {
                    return Err(RegistryError::MissingAuthUser(host.host.clone()));
                }
            }
            if inner.hosts.contains_key(trim_port(&host.host)) {
                return Err(RegistryError::HostOccupied(host.host.clone()));
            }
        }

        for host in &item.hosts {
            inner.hosts.insert(
                trim_port(&host.host).to_string(),
                HostInfo {
                    identity,
                    auth: host.auth.clone(),
                },
            );
        }

        inner.items.insert(identity, Entry::Installed(item));
        Ok(())
    }

    /// Replaces an installed item with the subscribed sentinel, dropping its
    /// hosts from the index. Returns the item so the caller can close its
    /// listeners. `None` when nothing was installed.
    pub fn clear(&self, identity: Identity) -> Option<RegistryItem> {
        tracing::debug!(identity = %identity, "clear registry item");
        let mut inner = self.inner.write();

        match inner.items.get(&identity) {
            Some(Entry::Installed(_)) => {}
            _ => return None,
        }

        let Some(Entry::Installed(item)) = inner.items.insert(identity, Entry::Subscribed) else {
            unreachable!("checked installed above");
        };
        for host in &item.hosts {
            inner.hosts.remove(trim_port(&host.host));
        }
        Some(item)
    }

    /// Removes the identity entirely, returning any installed item.
    pub fn unsubscribe(&self, identity: Identity) -> Option<RegistryItem> {
        let mut inner = self.inner.write();
        let entry = inner.items.remove(&identity)?;
        tracing::debug!(identity = %identity, "unsubscribe");

        match entry {
            Entry::Subscribed => None,
            Entry::Installed(item) => {
                for host in &item.hosts {
                    inner.hosts.remove(trim_port(&host.host));
                }
                Some(item)
            }
        }
    }

    /// Pre-enrolls a host for an identity and subscribes it. Used by the
    /// allow-list in strict (non auto-subscribe) mode.
    pub fn register_tunnel(&self, host: &str, identity: Identity) {
        let mut inner = self.inner.write();
        inner
            .allowed
            .insert(trim_port(host).to_string(), identity);
        inner.items.entry(identity).or_insert(Entry::Subscribed);
    }

    /// Network and address of every listener an identity has installed.
    pub fn client_listeners(&self, identity: Identity) -> Vec<(String, String)> {
        let inner = self.inner.read();
        match inner.items.get(&identity) {
            Some(Entry::Installed(item)) => item
                .listeners
                .iter()
                .map(|l| (l.network().to_string(), l.addr().to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether `identity` owns `host`, either by pre-enrollment or by a live
    /// installation.
    pub fn has_tunnel(&self, host_port: &str, identity: Identity) -> bool {
        let inner = self.inner.read();
        let host = trim_port(host_port);
        inner.allowed.get(host) == Some(&identity)
            || inner
                .hosts
                .get(host)
                .is_some_and(|info| info.identity == identity)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

/// Strips the port component so `foo.example`, `foo.example:80` and
/// `foo.example:8443` index identically. IPv6 literals keep their brackets'
/// contents.
fn trim_port(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match host_port.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty()
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => host_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    fn host(h: &str) -> HostAuth {
        HostAuth {
            host: h.to_string(),
            auth: None,
        }
    }

    #[test]
    fn subscribe_is_idempotent() {
        let r = Registry::new();
        r.subscribe(ident(1));
        r.subscribe(ident(1));
        assert!(r.is_subscribed(ident(1)));
        assert!(!r.is_subscribed(ident(2)));
    }

    #[test]
    fn set_requires_subscription() {
        let r = Registry::new();
        let item = RegistryItem {
            hosts: vec![host("a.example")],
            listeners: vec![],
        };
        assert_eq!(r.set(item, ident(1)), Err(RegistryError::NotSubscribed));
        assert!(r.subscriber("a.example").is_none());
    }

    #[test]
    fn set_refuses_overwrite() {
        let r = Registry::new();
        r.subscribe(ident(1));
        r.set(RegistryItem::default(), ident(1)).unwrap();
        assert_eq!(
            r.set(RegistryItem::default(), ident(1)),
            Err(RegistryError::AlreadyInstalled)
        );
    }

    #[test]
    fn set_rejects_occupied_host_without_side_effects() {
        let r = Registry::new();
        r.subscribe(ident(1));
        r.subscribe(ident(2));
        r.set(
            RegistryItem {
                hosts: vec![host("shared.example")],
                listeners: vec![],
            },
            ident(1),
        )
        .unwrap();

        let err = r
            .set(
                RegistryItem {
                    hosts: vec![host("new.example"), host("shared.example:443")],
                    listeners: vec![],
                },
                ident(2),
            )
            .unwrap_err();
        assert_eq!(err, RegistryError::HostOccupied("shared.example:443".into()));

        // The failed install must not leave new.example routable.
        assert!(r.subscriber("new.example").is_none());
        assert_eq!(r.subscriber("shared.example").unwrap().0, ident(1));
    }

    #[test]
    fn set_rejects_auth_without_user() {
        let r = Registry::new();
        r.subscribe(ident(1));
        let err = r
            .set(
                RegistryItem {
                    hosts: vec![HostAuth {
                        host: "a.example".into(),
                        auth: Auth::parse(":password-only"),
                    }],
                    listeners: vec![],
                },
                ident(1),
            )
            .unwrap_err();
        assert_eq!(err, RegistryError::MissingAuthUser("a.example".into()));
    }

    #[test]
    fn subscriber_trims_port() {
        let r = Registry::new();
        r.subscribe(ident(1));
        r.set(
            RegistryItem {
                hosts: vec![host("foo.example"), host("bar.example:80")],
                listeners: vec![],
            },
            ident(1),
        )
        .unwrap();

        for probe in [
            "foo.example",
            "foo.example:80",
            "foo.example:443",
            "foo.example:8080",
            "bar.example",
            "bar.example:8443",
        ] {
            let (id, auth) = r.subscriber(probe).expect(probe);
            assert_eq!(id, ident(1));
            assert!(auth.is_none());
        }
    }

    #[test]
    fn clear_returns_item_and_frees_hosts() {
        let r = Registry::new();
        r.subscribe(ident(1));
        r.set(
            RegistryItem {
                hosts: vec![host("a.example")],
                listeners: vec![],
            },
            ident(1),
        )
        .unwrap();

        let item = r.clear(ident(1)).unwrap();
        assert_eq!(item.hosts.len(), 1);
        assert!(r.subscriber("a.example").is_none());
        // Still subscribed, back at the sentinel state.
        assert!(r.is_subscribed(ident(1)));
        assert!(r.clear(ident(1)).is_none());

        // The host can be installed again.
        r.set(
            RegistryItem {
                hosts: vec![host("a.example")],
                listeners: vec![],
            },
            ident(1),
        )
        .unwrap();
    }

    #[test]
    fn unsubscribe_removes_entry() {
        let r = Registry::new();
        r.subscribe(ident(1));
        r.set(
            RegistryItem {
                hosts: vec![host("a.example")],
                listeners: vec![],
            },
            ident(1),
        )
        .unwrap();

        assert!(r.unsubscribe(ident(1)).is_some());
        assert!(!r.is_subscribed(ident(1)));
        assert!(r.subscriber("a.example").is_none());
        assert!(r.unsubscribe(ident(1)).is_none());
    }

    #[test]
    fn register_tunnel_backs_strict_admission() {
        let r = Registry::new();
        r.register_tunnel("pre.example:443", ident(1));

        assert!(r.is_subscribed(ident(1)));
        assert!(r.has_tunnel("pre.example", ident(1)));
        assert!(r.has_tunnel("pre.example:80", ident(1)));
        assert!(!r.has_tunnel("pre.example", ident(2)));
        assert!(!r.has_tunnel("other.example", ident(1)));
    }

    #[test]
    fn trim_port_handles_shapes() {
        assert_eq!(trim_port("foo.example"), "foo.example");
        assert_eq!(trim_port("foo.example:80"), "foo.example");
        assert_eq!(trim_port("[::1]:80"), "::1");
        assert_eq!(trim_port("[::1]"), "::1");
        assert_eq!(trim_port("127.0.0.1:8080"), "127.0.0.1");
    }
}
