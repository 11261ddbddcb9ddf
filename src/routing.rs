//! Domain routing between the primary-first and backup-first chains.
//!
//! Names matching an exclude-list pattern (the pattern itself or any
//! subdomain of it) are resolved backup-first; everything else goes
//! primary-first. The active table is immutable and replaced wholesale on
//! reload, so a query always sees one consistent pattern set.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::dns;
use crate::error::Result;
use crate::upstream::SharedUpstream;

/// A set of upstreams raced together.
#[derive(Clone)]
pub struct Tier {
    pub label: &'static str,
    pub clients: Arc<[SharedUpstream]>,
}

impl Tier {
    pub fn new(label: &'static str, clients: Vec<SharedUpstream>) -> Self {
        Self {
            label,
            clients: clients.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    PrimaryFirst,
    BackupFirst,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChainKind::PrimaryFirst => "primary-first",
            ChainKind::BackupFirst => "backup-first",
        })
    }
}

/// Tiers tried in order until one answers.
#[derive(Clone)]
pub struct Chain {
    pub kind: ChainKind,
    pub tiers: Arc<[Tier]>,
}

pub struct RoutingTable {
    default_chain: Chain,
    excluded_chain: Chain,
    patterns: FxHashSet<String>,
}

impl RoutingTable {
    /// Table with no exclude patterns; `system` closes both chains.
    pub fn new(primary: Tier, backup: Tier, system: Tier) -> Self {
        Self {
            default_chain: Chain {
                kind: ChainKind::PrimaryFirst,
                tiers: vec![primary.clone(), backup.clone(), system.clone()].into(),
            },
            excluded_chain: Chain {
                kind: ChainKind::BackupFirst,
                tiers: vec![backup, primary, system].into(),
            },
            patterns: FxHashSet::default(),
        }
    }

    /// Same chains, different pattern set.
    pub fn with_patterns(&self, patterns: FxHashSet<String>) -> Self {
        Self {
            default_chain: self.default_chain.clone(),
            excluded_chain: self.excluded_chain.clone(),
            patterns,
        }
    }

    /// Whether `name` equals or is a subdomain of an exclude pattern.
    pub fn is_excluded(&self, name: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let name = dns::fqdn(name);
        let mut current = name.as_str();

        loop {
            if self.patterns.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) if pos + 1 < current.len() => current = &current[pos + 1..],
                _ => return self.patterns.contains("."),
            }
        }
    }

    pub fn select(&self, name: &str) -> &Chain {
        if self.is_excluded(name) {
            &self.excluded_chain
        } else {
            &self.default_chain
        }
    }

    pub fn patterns(&self) -> &FxHashSet<String> {
        &self.patterns
    }
}

/// Parse exclude-list text: one pattern per line, `#` starts a comment.
pub fn parse_exclude_list(text: &str) -> FxHashSet<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                return None;
            }
            Some(dns::fqdn(line))
        })
        .collect()
}

/// Owner of the active routing table.
///
/// Queries read a snapshot without locking; reloads are serialized with
/// each other by `reload_lock` and publish a complete new table.
pub struct Router {
    table: ArcSwap<RoutingTable>,
    reload_lock: Mutex<()>,
}

impl Router {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Re-read the exclude list and swap in a table built from it.
    ///
    /// A read failure leaves the current table active.
    pub async fn reload(&self, path: &Path) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        let text = tokio::fs::read_to_string(path).await?;
        self.replace(parse_exclude_list(&text));
        Ok(())
    }

    /// Drop every pattern so all names use the primary-first chain.
    pub async fn clear(&self) {
        let _guard = self.reload_lock.lock().await;
        self.replace(FxHashSet::default());
    }

    fn replace(&self, patterns: FxHashSet<String>) {
        let current = self.table.load();
        for pattern in current.patterns().difference(&patterns) {
            debug!(pattern = %pattern, "remove");
        }
        for pattern in patterns.difference(current.patterns()) {
            debug!(pattern = %pattern, "add");
        }
        info!(patterns = patterns.len(), "exclude list applied");

        let next = current.with_patterns(patterns);
        self.table.store(Arc::new(next));
    }
}
