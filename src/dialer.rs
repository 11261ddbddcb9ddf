//! Forward-proxy dialers and the proxy registry.
//!
//! Upstream address strings select a registry slot with leading `*`
//! characters: `*1.1.1.1@tcp` goes through the first proxy, `**...`
//! through the second, and so on.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, error};
use url::Url;

use crate::error::{Error, Result};

const MAX_CONNECT_RESPONSE: usize = 8192;
const SOCKS5_DEFAULT_PORT: u16 = 1080;

/// Byte stream returned by a dialer.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens stream connections to `host:port` targets.
///
/// Dropping the returned future aborts the dial and closes any socket it
/// had opened, so callers can bound it with a timeout or a race.
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    async fn dial(&self, target: &str) -> Result<BoxedStream>;
}

/// TLS client configuration shared by DoT upstreams and HTTPS proxies.
pub fn tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(format!("failed to create TLS config: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Run a TLS client handshake over an established stream.
pub async fn tls_handshake<S>(
    config: &Arc<rustls::ClientConfig>,
    server_name: &str,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = rustls_pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {}: {}", server_name, e)))?;
    tokio_rustls::TlsConnector::from(config.clone())
        .connect(name, stream)
        .await
        .map_err(|e| Error::Tls(format!("handshake with {} failed: {}", server_name, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

#[derive(Clone)]
struct Credentials {
    username: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Dialer tunnelling through an HTTP(S) CONNECT or SOCKS5 proxy.
#[derive(Debug)]
pub struct ProxyDialer {
    kind: ProxyKind,
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    tls: Arc<rustls::ClientConfig>,
}

impl ProxyDialer {
    pub fn from_url(url: &Url, tls: Arc<rustls::ClientConfig>) -> Result<Self> {
        let kind = match url.scheme() {
            "http" => ProxyKind::Http,
            "https" => ProxyKind::Https,
            "socks5" | "socks5h" => ProxyKind::Socks5,
            other => {
                return Err(Error::Config(format!("unsupported proxy scheme: {}", other)));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("proxy url has no host: {}", url)))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(SOCKS5_DEFAULT_PORT);
        let credentials = (!url.username().is_empty()).then(|| Credentials {
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        });

        Ok(Self {
            kind,
            host,
            port,
            credentials,
            tls,
        })
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial(&self, target: &str) -> Result<BoxedStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let credentials = self.credentials.as_ref();

        match self.kind {
            ProxyKind::Http => {
                let mut stream = tcp;
                http_connect(&mut stream, target, credentials).await?;
                Ok(Box::new(stream))
            }
            ProxyKind::Https => {
                let mut stream = tls_handshake(&self.tls, &self.host, tcp).await?;
                http_connect(&mut stream, target, credentials).await?;
                Ok(Box::new(stream))
            }
            ProxyKind::Socks5 => Ok(Box::new(socks5_connect(tcp, target, credentials).await?)),
        }
    }
}

/// Issue an HTTP CONNECT and consume the proxy's response header.
async fn http_connect<S>(
    stream: &mut S,
    target: &str,
    credentials: Option<&Credentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(c) = credentials {
        let token = BASE64_STANDARD.encode(format!("{}:{}", c.username, c.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte at a time so nothing past the header is taken from the tunnel.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(Error::Proxy("CONNECT response header too large".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let code = status_line.split_whitespace().nth(1);
    match code {
        Some("200") => Ok(()),
        _ => Err(Error::Proxy(format!("CONNECT {} refused: {}", target, status_line))),
    }
}

/// Negotiate a SOCKS5 CONNECT to `target` over `stream`.
async fn socks5_connect<S>(
    stream: S,
    target: &str,
    credentials: Option<&Credentials>,
) -> Result<Socks5Stream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connected = match credentials {
        Some(c) => {
            let (user, pass) = (c.username.as_str(), c.password.as_str());
            Socks5Stream::connect_with_password_and_socket(stream, target, user, pass).await
        }
        None => Socks5Stream::connect_with_socket(stream, target).await,
    };
    connected.map_err(|e| Error::Proxy(format!("SOCKS5 CONNECT {} failed: {}", target, e)))
}

/// Split `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("missing port in address {}", addr)))?;
    let port = port
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in address {}", addr)))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

/// One configured forward proxy.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub url: Url,
    pub dialer: Arc<dyn Dialer>,
}

/// Ordered list of proxies, addressed by 1-based slot.
///
/// Built once at startup and only read afterwards.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    entries: Vec<ProxyEntry>,
}

impl ProxyRegistry {
    pub fn new(entries: Vec<ProxyEntry>) -> Self {
        Self { entries }
    }

    /// Parse a comma-separated proxy list, skipping invalid entries.
    pub fn parse(list: &str, tls: &Arc<rustls::ClientConfig>) -> Self {
        let mut entries = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let url = match Url::parse(item) {
                Ok(url) => url,
                Err(e) => {
                    error!(proxy = item, error = %e, "failed to parse proxy url");
                    continue;
                }
            };
            let dialer = match ProxyDialer::from_url(&url, tls.clone()) {
                Ok(dialer) => dialer,
                Err(e) => {
                    error!(proxy = item, error = %e, "failed to parse proxy");
                    continue;
                }
            };
            debug!(index = entries.len() + 1, proxy = %url, "proxy list");
            entries.push(ProxyEntry {
                url,
                dialer: Arc::new(dialer),
            });
        }
        Self { entries }
    }

    /// Entry for a 1-based slot; `0` or out of range means direct.
    pub fn get(&self, slot: usize) -> Option<&ProxyEntry> {
        slot.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Count and strip the leading `*` slot selector of an address spec.
pub fn split_slot(spec: &str) -> (usize, &str) {
    let rest = spec.trim_start_matches('*');
    (spec.len() - rest.len(), rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn tls() -> Arc<rustls::ClientConfig> {
        tls_config().unwrap()
    }

    #[test]
    fn split_slot_counts_stars() {
        assert_eq!(split_slot("1.1.1.1"), (0, "1.1.1.1"));
        assert_eq!(split_slot("*1.1.1.1@tcp"), (1, "1.1.1.1@tcp"));
        assert_eq!(split_slot("***dns.example"), (3, "dns.example"));
    }

    #[test]
    fn split_host_port_handles_ipv6() {
        assert_eq!(split_host_port("[::1]:53").unwrap(), ("::1", 53));
        assert_eq!(split_host_port("dns.example:853").unwrap(), ("dns.example", 853));
        assert!(split_host_port("dns.example").is_err());
    }

    #[test]
    fn registry_skips_invalid_entries() {
        let registry = ProxyRegistry::parse(
            "http://127.0.0.1:8080, not a url, ftp://host:21, socks5://user:pw@127.0.0.1",
            &tls(),
        );

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().url.scheme(), "http");
        assert_eq!(registry.get(2).unwrap().url.scheme(), "socks5");
        assert!(registry.get(0).is_none());
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn dialer_defaults_ports() {
        let dialer = |url: &str| ProxyDialer::from_url(&Url::parse(url).unwrap(), tls()).unwrap();
        let socks = dialer("socks5://10.0.0.1");
        let https = dialer("https://proxy.example");

        assert_eq!(socks.port, SOCKS5_DEFAULT_PORT);
        assert_eq!(https.port, 443);
        assert_eq!(https.kind(), ProxyKind::Https);
    }

    #[tokio::test]
    async fn http_connect_accepts_200() {
        let (mut client, mut server) = duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\ntunnel")
                .await
                .unwrap();
            request
        });

        http_connect(&mut client, "9.9.9.9:53", None).await.unwrap();
        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT 9.9.9.9:53 HTTP/1.1\r\n"));

        let mut rest = [0u8; 6];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"tunnel");
    }

    #[tokio::test]
    async fn http_connect_sends_basic_auth_and_rejects_407() {
        let (mut client, mut server) = duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        let credentials = Credentials {
            username: "user".into(),
            password: "pass".into(),
        };

        let err = http_connect(&mut client, "9.9.9.9:53", Some(&credentials))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Proxy(_)));
        let request = proxy.await.unwrap();
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn socks5_connect_with_domain_target() {
        let (client, mut server) = duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut head = [0u8; 2];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], 0x05);
            let mut methods = vec![0u8; head[1] as usize];
            server.read_exact(&mut methods).await.unwrap();
            assert!(methods.contains(&0x00));
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut host = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut host).await.unwrap();
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();
            host
        });

        socks5_connect(client, "dns.example:853", None).await.unwrap();
        let host = proxy.await.unwrap();
        assert_eq!(&host[..11], b"dns.example");
        assert_eq!(&host[11..], &853u16.to_be_bytes());
    }

    #[tokio::test]
    async fn socks5_reports_connect_failure() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut head = [0u8; 2];
            server.read_exact(&mut head).await.unwrap();
            let mut methods = vec![0u8; head[1] as usize];
            server.read_exact(&mut methods).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_connect(client, "1.1.1.1:53", None).await.unwrap_err();
        assert!(matches!(err, Error::Proxy(_)));
    }
}
