//! DNS query resolution logic.
//!
//! Handles the per-request pipeline:
//! 1. Cache lookup (hosts entries live here too)
//! 2. Pick the chain for the query name from the routing table
//! 3. Race each tier of the chain in turn, each under a fresh timeout
//!
//! Transports handle the actual I/O, the resolver handles decisions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use tracing::{debug, error};

use crate::cache::DnsCache;
use crate::dns;
use crate::race::race;
use crate::routing::Router;
use crate::stats::{Stats, StatsSnapshot};

/// Shared state of the forwarder, one per server.
pub struct Resolver {
    cache: Arc<DnsCache>,
    router: Arc<Router>,
    stats: Stats,
    fallback: bool,
    timeout: Duration,
}

impl Resolver {
    pub fn new(
        cache: Arc<DnsCache>,
        router: Arc<Router>,
        fallback: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            router,
            stats: Stats::new(),
            fallback,
            timeout,
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Resolve one request.
    ///
    /// Returns `None` when every tier failed: the caller then writes
    /// nothing and the client sees a timeout instead of a SERVFAIL.
    pub async fn handle(&self, request: &Message) -> Option<Message> {
        let start = Instant::now();
        let question = dns::first_name(request);

        if let Some(cached) = self.cache.get(request) {
            debug!(question = %question, answers = cached.answers().len(), "cached");
            self.stats.record_cached(start.elapsed());
            return Some(cached);
        }

        let table = self.router.snapshot();
        let chain = table.select(&question);
        let tiers = if self.fallback {
            &chain.tiers[..]
        } else {
            &chain.tiers[..chain.tiers.len().min(1)]
        };

        for (stage, tier) in tiers.iter().enumerate() {
            // Each stage gets its own budget so a slow tier cannot starve the next.
            match tokio::time::timeout(self.timeout, race(&tier.clients, request)).await {
                Ok(Ok(answer)) => {
                    debug!(
                        question = %question,
                        chain = %chain.kind,
                        dns = %answer.upstream,
                        answers = answer.message.answers().len(),
                        "uncached"
                    );
                    self.cache.set(request.queries(), &answer.message);
                    self.stats.record_forwarded(start.elapsed());
                    return Some(answer.message);
                }
                Ok(Err(e)) => error!(
                    question = %question,
                    chain = %chain.kind,
                    tier = tier.label,
                    stage,
                    timeout = e.is_timeout(),
                    error = %e,
                    "request failed"
                ),
                Err(_) => error!(
                    question = %question,
                    chain = %chain.kind,
                    tier = tier.label,
                    stage,
                    timeout = true,
                    "request timed out"
                ),
            }
        }

        self.stats.record_failed(start.elapsed());
        None
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
