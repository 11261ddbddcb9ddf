//! DNS response cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::sync::RwLock;
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use tokio::time::Instant;

use crate::dns::{self, QuestionKey};

/// Minimum lifetime of any cached response.
pub const MIN_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    message: Message,
    /// `None` for hosts-derived entries, which never expire.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// TTL-based DNS cache keyed by question signature.
///
/// Entries are stored as message templates; every hit hands out a copy
/// re-stamped with the caller's transaction id.
pub struct DnsCache {
    entries: RwLock<FxHashMap<QuestionKey, CacheEntry>>,
    min_ttl: Duration,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_min_ttl(MIN_TTL)
    }

    pub fn with_min_ttl(min_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            min_ttl,
        }
    }

    /// Look up a cached response for `request`, rewritten to its id.
    ///
    /// Expired entries are dropped lazily here.
    pub fn get(&self, request: &Message) -> Option<Message> {
        let key = QuestionKey::from_message(request);
        let now = Instant::now();

        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            match entries.get(&key) {
                Some(entry) if entry.is_live(now) => {
                    return Some(dns::with_id(&entry.message, request.id()));
                }
                Some(_) => {}
                None => return None,
            }
        }

        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        if entries.get(&key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(&key);
        }
        None
    }

    /// Store an upstream response for `queries`.
    ///
    /// Negative responses live for the floor TTL; otherwise the first
    /// answer's TTL is used, raised to the floor.
    pub fn set(&self, queries: &[Query], message: &Message) {
        let ttl = self.ttl_for(message);
        self.insert(queries, message, Some(Instant::now() + ttl));
    }

    /// Store an entry that never expires.
    pub fn set_permanent(&self, queries: &[Query], message: &Message) {
        self.insert(queries, message, None);
    }

    fn insert(&self, queries: &[Query], message: &Message, expires_at: Option<Instant>) {
        let key = QuestionKey::from_queries(queries);
        if key.is_empty() {
            return;
        }

        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        entries.insert(
            key,
            CacheEntry {
                message: message.clone(),
                expires_at,
            },
        );
    }

    fn ttl_for(&self, message: &Message) -> Duration {
        match message.answers().first() {
            None => self.min_ttl,
            Some(record) => Duration::from_secs(u64::from(record.ttl())).max(self.min_ttl),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}
