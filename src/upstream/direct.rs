//! Plain DNS upstreams over UDP, TCP and TLS, directly or through a proxy.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::{Network, Upstream};
use crate::dialer::{self, Dialer};
use crate::dns;
use crate::error::{Error, Result};

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Upstream reached over a direct socket.
pub struct DirectClient {
    address: String,
    network: Network,
    tls_server_name: Option<String>,
    tls: Arc<rustls::ClientConfig>,
}

impl DirectClient {
    pub fn new(
        address: String,
        network: Network,
        tls_server_name: Option<String>,
        tls: Arc<rustls::ClientConfig>,
    ) -> Self {
        Self {
            address,
            network,
            tls_server_name,
            tls,
        }
    }
}

#[async_trait]
impl Upstream for DirectClient {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        debug!(dns = %self.address, question = %dns::first_name(request), "direct");
        match self.network {
            Network::Udp => exchange_udp(&self.address, request).await,
            Network::Tcp => {
                let mut stream = TcpStream::connect(self.address.as_str()).await?;
                exchange_stream(&mut stream, request).await
            }
            Network::TcpTls => {
                let tcp = TcpStream::connect(self.address.as_str()).await?;
                let server_name = self.tls_server_name.as_deref().unwrap_or_default();
                let mut stream = dialer::tls_handshake(&self.tls, server_name, tcp).await?;
                exchange_stream(&mut stream, request).await
            }
        }
    }

    fn name(&self) -> &str {
        &self.address
    }
}

/// Upstream reached through a forward proxy from the registry.
///
/// Proxy tunnels are stream-only, so UDP upstreams are spoken to over TCP
/// once the tunnel is up.
pub struct ProxiedClient {
    address: String,
    network: Network,
    tls_server_name: Option<String>,
    dialer: Arc<dyn Dialer>,
    tls: Arc<rustls::ClientConfig>,
    name: String,
}

impl ProxiedClient {
    pub fn new(
        address: String,
        network: Network,
        tls_server_name: Option<String>,
        proxy_slot: usize,
        dialer: Arc<dyn Dialer>,
        tls: Arc<rustls::ClientConfig>,
    ) -> Self {
        let name = format!("{}[proxy {}]", address, proxy_slot);
        Self {
            address,
            network,
            tls_server_name,
            dialer,
            tls,
            name,
        }
    }
}

#[async_trait]
impl Upstream for ProxiedClient {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        debug!(dns = %self.name, question = %dns::first_name(request), "proxy");
        let mut stream = self.dialer.dial(&self.address).await?;
        match self.network {
            Network::TcpTls => {
                let server_name = self.tls_server_name.as_deref().unwrap_or_default();
                let mut stream = dialer::tls_handshake(&self.tls, server_name, stream).await?;
                exchange_stream(&mut stream, request).await
            }
            Network::Udp | Network::Tcp => exchange_stream(&mut stream, request).await,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Send a query over UDP and wait for the reply carrying the same id.
async fn exchange_udp(address: &str, request: &Message) -> Result<Message> {
    let addr = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| Error::Response(format!("no addresses found for {}", address)))?;

    let bind_addr = if addr.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    socket.send(&request.to_vec()?).await?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    loop {
        let len = socket.recv(&mut buf).await?;
        let response = match Message::from_vec(&buf[..len]) {
            Ok(response) => response,
            Err(e) => {
                debug!(dns = address, error = %e, "ignoring undecodable reply");
                continue;
            }
        };
        if response.id() == request.id() {
            return Ok(response);
        }
        debug!(
            dns = address,
            expected = request.id(),
            got = response.id(),
            "ignoring reply with mismatched id"
        );
    }
}

/// Send a length-prefixed query over a stream and read one reply.
async fn exchange_stream<S>(stream: &mut S, request: &Message) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let query = request.to_vec()?;
    let len = u16::try_from(query.len())
        .map_err(|_| Error::Response("DNS query too large".into()))?;
    let mut msg = Vec::with_capacity(2 + query.len());
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(&query);
    stream.write_all(&msg).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await?;

    let response = Message::from_vec(&buf)?;
    if response.id() != request.id() {
        return Err(Error::Response(format!(
            "id mismatch: expected {}, got {}",
            request.id(),
            response.id()
        )));
    }
    Ok(response)
}
