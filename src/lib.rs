//! proxydns - a DNS forwarder that races upstream tiers.
//!
//! Queries are answered from the cache (hosts entries included), otherwise
//! raced across the primary upstreams, then the backup upstreams, then the
//! system resolver. Names in the exclude list try backup first.

pub mod cache;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod hosts;
pub mod proxy;
pub mod race;
pub mod resolver;
pub mod routing;
pub mod selftest;
pub mod stats;
pub mod transport;
pub mod upstream;
pub mod watch;

pub use error::{Error, Result};
