//! Error types for the forwarder.

use hickory_proto::rr::RecordType;
use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving, dialing or configuring upstreams.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS wire-format encode/decode error.
    #[error("DNS message error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// DNS-over-HTTPS transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// DNS-over-HTTPS server answered with something other than 200.
    #[error("DoH server returned {0}")]
    Status(reqwest::StatusCode),

    /// TLS setup or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Forward proxy refused or broke the tunnel.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Exchange did not finish before its deadline.
    #[error("timed out")]
    Timeout,

    /// Upstream answered with a message that does not match the request.
    #[error("unexpected response: {0}")]
    Response(String),

    /// The system resolver cannot synthesise answers for this type.
    #[error("not supported query type for local lookup: {0}")]
    UnsupportedQueryType(RecordType),

    /// Platform resolver lookup failed.
    #[error("system lookup failed: {0}")]
    System(String),

    /// A tier was raced with no clients in it.
    #[error("no DNS clients")]
    NoClients,

    /// Every client in a tier failed; carries the last failure seen.
    #[error("all {attempts} DNS clients failed, last error: {last}")]
    AllFailed { attempts: usize, last: Box<Error> },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("self-test failed: {0}")]
    SelfTest(String),
}

impl Error {
    /// True for deadline expiry, which is logged differently from transport failures.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            Error::Http(e) => e.is_timeout(),
            Error::AllFailed { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}
