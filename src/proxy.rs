//! DNS forwarder orchestration.
//!
//! Builds the upstream tiers, routing table and cache from a
//! [`ProxyConfig`], binds transports and runs the server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cache::DnsCache;
use crate::dialer::{self, ProxyRegistry};
use crate::error::Result;
use crate::hosts;
use crate::resolver::Resolver;
use crate::routing::{Router, RoutingTable, Tier};
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};
use crate::upstream::{SharedUpstream, SystemResolverClient, UpstreamContext};
use crate::watch::{self, ExcludeWatcher};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the forwarder.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub bind_addr: SocketAddr,
    /// Comma-separated primary upstream list
    pub primary: String,
    /// Comma-separated backup upstream list
    pub backup: String,
    /// Comma-separated proxy URLs, addressed by 1-based slot
    pub proxies: String,
    /// Exclude-list file; names listed there go backup-first
    pub exclude: Option<PathBuf>,
    /// Hosts file whose entries shadow every upstream
    pub hosts: Option<PathBuf>,
    /// Try the next tier when one fails
    pub fallback: bool,
    /// Budget for each tier of a query
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 53)),
            primary: String::new(),
            backup: String::new(),
            proxies: String::new(),
            exclude: None,
            hosts: None,
            fallback: false,
            timeout: Duration::from_secs(5),
        }
    }
}

/// A started server. Transports keep running until the process exits.
pub struct Server {
    local_addr: SocketAddr,
    resolver: Arc<Resolver>,
    _watcher: Option<ExcludeWatcher>,
}

impl Server {
    /// Bind both transports and start serving.
    ///
    /// Failing to bind UDP is the only fatal error. Without a TCP listener
    /// the server answers over UDP alone; bad upstreams, proxies, exclude
    /// lists and hosts files are logged and skipped.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        let udp = UdpTransport::bind(config.bind_addr).await?;
        let local_addr = udp.local_addr()?;
        let tcp = match TcpTransport::bind(local_addr).await {
            Ok(tcp) => Some(tcp),
            Err(e) => {
                error!(addr = %local_addr, error = %e, "TCP bind failed, serving UDP only");
                None
            }
        };

        let tls = dialer::tls_config()?;
        let registry = Arc::new(ProxyRegistry::parse(&config.proxies, &tls));
        let ctx = UpstreamContext {
            registry,
            tls,
            timeout: config.timeout,
        };

        let system: SharedUpstream = Arc::new(SystemResolverClient::new());
        let mut primary = ctx.parse_upstreams(&config.primary);
        if primary.is_empty() {
            info!("no primary upstream configured, using system resolver");
            primary.push(system.clone());
        }
        let backup = ctx.parse_upstreams(&config.backup);
        log_tier("primary", &primary);
        log_tier("backup", &backup);

        let table = RoutingTable::new(
            Tier::new("primary", primary),
            Tier::new("backup", backup),
            Tier::new("system", vec![system]),
        );
        let router = Arc::new(Router::new(table));
        let watcher = match &config.exclude {
            Some(path) => start_exclude(&router, path.clone()).await,
            None => None,
        };

        let cache = Arc::new(DnsCache::new());
        if let Some(path) = &config.hosts {
            match hosts::load_file(path, &cache).await {
                Ok(n) => info!(file = %path.display(), names = n, "hosts loaded"),
                Err(e) => error!(file = %path.display(), error = %e, "failed to load hosts"),
            }
        }

        let resolver = Arc::new(Resolver::new(cache, router, config.fallback, config.timeout));
        udp.start(resolver.clone());
        if let Some(tcp) = tcp {
            tcp.start(resolver.clone());
        }
        info!(
            addr = %local_addr,
            fallback = config.fallback,
            timeout = ?config.timeout,
            "listening"
        );

        Ok(Self {
            local_addr,
            resolver,
            _watcher: watcher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }
}

fn log_tier(label: &str, clients: &[SharedUpstream]) {
    let names: Vec<_> = clients.iter().map(|c| c.name()).collect();
    info!(tier = label, clients = %names.join(", "), "upstreams");
}

async fn start_exclude(router: &Arc<Router>, path: PathBuf) -> Option<ExcludeWatcher> {
    if let Err(e) = router.reload(&path).await {
        error!(file = %path.display(), error = %e, "failed to load exclude list");
    }
    match watch::spawn(router.clone(), path) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "exclude list will not be reloaded");
            None
        }
    }
}

/// Run the forwarder with the given configuration.
///
/// Logs a stats line every minute. Runs indefinitely.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let server = Server::start(config).await?;
    let resolver = server.resolver().clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = resolver.stats_snapshot_and_reset();
            info!(
                uptime = stats.uptime_secs,
                cache = resolver.cache_len(),
                requests = stats.requests,
                forwarded = stats.forwarded,
                cached = stats.cached,
                failed = stats.failed,
                avg_response_ms = format_args!("{:.2}", stats.avg_response_ms),
                "stats"
            );
        }
    });

    std::future::pending::<()>().await;

    Ok(())
}
