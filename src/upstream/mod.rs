//! Upstream DNS clients and the address grammar that builds them.
//!
//! Each comma-separated element of an upstream list has the form
//! `[*...]<host>[:<port>][@tcp|@tcp-tls|@dot|@doh]`:
//!
//! - leading `*` characters pick a proxy registry slot,
//! - `@tcp-tls` (or `@dot`) selects DNS over TLS, default port 853,
//! - `@tcp` selects plain TCP, no suffix means UDP, default port 53,
//! - `@doh` builds a DNS-over-HTTPS client for `https://<host>/dns-query`.

mod direct;
mod doh;
mod system;

pub use direct::{DirectClient, ProxiedClient};
pub use doh::DohClient;
pub use system::SystemResolverClient;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::{debug, warn};

use crate::dialer::{self, ProxyRegistry};
use crate::error::Result;

/// A resolver endpoint a query can be forwarded to.
///
/// Implementations are immutable after construction and shared across
/// concurrent queries. Dropping the `exchange` future aborts in-flight I/O
/// and releases any connection it opened.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and wait for the matching response.
    async fn exchange(&self, request: &Message) -> Result<Message>;

    /// Label used in logs.
    fn name(&self) -> &str;
}

pub type SharedUpstream = Arc<dyn Upstream>;

/// Transport of a non-DoH upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Udp,
    Tcp,
    TcpTls,
}

impl Network {
    pub const fn default_port(self) -> u16 {
        match self {
            Network::Udp | Network::Tcp => 53,
            Network::TcpTls => 853,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Udp => "udp",
            Network::Tcp => "tcp",
            Network::TcpTls => "tcp-tls",
        })
    }
}

/// Parsed form of one upstream list element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSpec {
    Dns {
        address: String,
        network: Network,
        tls_server_name: Option<String>,
        proxy_slot: usize,
    },
    Doh {
        host: String,
        proxy_slot: usize,
    },
}

impl UpstreamSpec {
    /// Parse one address element; `None` for malformed input.
    pub fn parse(item: &str) -> Option<Self> {
        let (proxy_slot, rest) = dialer::split_slot(item.trim());
        let rest = rest.to_ascii_lowercase();

        if let Some(host) = rest.strip_suffix("@doh") {
            if host.is_empty() {
                return None;
            }
            return Some(UpstreamSpec::Doh {
                host: host.to_string(),
                proxy_slot,
            });
        }

        let (address, network) = if let Some(a) = rest.strip_suffix("@tcp-tls") {
            (a, Network::TcpTls)
        } else if let Some(a) = rest.strip_suffix("@dot") {
            (a, Network::TcpTls)
        } else if let Some(a) = rest.strip_suffix("@tcp") {
            (a, Network::Tcp)
        } else {
            (rest.as_str(), Network::Udp)
        };
        let address = address.split('@').next().unwrap_or_default();
        let address = with_default_port(address, network.default_port())?;

        let tls_server_name = match network {
            Network::TcpTls => Some(dialer::split_host_port(&address).ok()?.0.to_string()),
            _ => None,
        };

        Some(UpstreamSpec::Dns {
            address,
            network,
            tls_server_name,
            proxy_slot,
        })
    }
}

fn with_default_port(address: &str, port: u16) -> Option<String> {
    if address.is_empty() {
        return None;
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port).to_string());
    }
    if !address.contains(':') || address.ends_with(']') {
        return Some(format!("{}:{}", address, port));
    }
    match dialer::split_host_port(address) {
        Ok((host, _)) if !host.is_empty() => Some(address.to_string()),
        _ => None,
    }
}

/// Shared resources needed to turn specs into clients.
#[derive(Clone)]
pub struct UpstreamContext {
    pub registry: Arc<ProxyRegistry>,
    pub tls: Arc<rustls::ClientConfig>,
    pub timeout: Duration,
}

impl UpstreamContext {
    /// Build the client for one parsed spec.
    pub fn build(&self, spec: UpstreamSpec) -> Result<SharedUpstream> {
        match spec {
            UpstreamSpec::Doh { host, proxy_slot } => {
                debug!(address = %host, "found DNS over HTTPS");
                let proxy = self.proxy_entry(proxy_slot).map(|entry| entry.url.clone());
                Ok(Arc::new(DohClient::new(&host, proxy.as_ref(), self.timeout)?))
            }
            UpstreamSpec::Dns {
                address,
                network,
                tls_server_name,
                proxy_slot,
            } => {
                debug!(network = %network, address = %address, "found DNS");
                match self.proxy_entry(proxy_slot) {
                    Some(entry) => Ok(Arc::new(ProxiedClient::new(
                        address,
                        network,
                        tls_server_name,
                        proxy_slot,
                        entry.dialer.clone(),
                        self.tls.clone(),
                    ))),
                    None => Ok(Arc::new(DirectClient::new(
                        address,
                        network,
                        tls_server_name,
                        self.tls.clone(),
                    ))),
                }
            }
        }
    }

    fn proxy_entry(&self, slot: usize) -> Option<&dialer::ProxyEntry> {
        if slot == 0 {
            return None;
        }
        let entry = self.registry.get(slot);
        match entry {
            Some(_) => debug!(proxy = slot, "use proxy"),
            None => warn!(
                proxy = slot,
                configured = self.registry.len(),
                "proxy slot not configured, using direct connection"
            ),
        }
        entry
    }

    /// Parse a comma-separated upstream list, preserving order.
    ///
    /// Malformed elements are skipped; an empty list yields no clients and
    /// the caller decides what to substitute.
    pub fn parse_upstreams(&self, list: &str) -> Vec<SharedUpstream> {
        let mut clients = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some(spec) = UpstreamSpec::parse(item) else {
                warn!(address = item, "skipping malformed upstream address");
                continue;
            };
            match self.build(spec) {
                Ok(client) => clients.push(client),
                Err(e) => warn!(address = item, error = %e, "skipping upstream"),
            }
        }
        clients
    }
}
