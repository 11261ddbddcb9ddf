//! UDP transport for DNS queries.
//!
//! Every datagram is resolved in its own task; responses go back to the
//! sender from the listening socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{MAX_DNS_PACKET_SIZE, Protocol, decode_query, encode_response};
use crate::dns;
use crate::resolver::Resolver;

/// DNS header length; anything shorter is not a query.
const HEADER_LEN: usize = 12;

/// UDP listener for the forwarder.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the receive loop.
    pub fn start(self, resolver: Arc<Resolver>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver))
    }
}

async fn run(socket: Arc<UdpSocket>, resolver: Arc<Resolver>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "UDP recv error");
                continue;
            }
        };

        if len < HEADER_LEN {
            continue;
        }

        tokio::spawn(handle_query(
            socket.clone(),
            resolver.clone(),
            buf[..len].to_vec(),
            src,
        ));
    }
}

async fn handle_query(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    query: Vec<u8>,
    src: SocketAddr,
) {
    let Some(request) = decode_query(Protocol::Udp, &query) else {
        return;
    };
    debug!(
        protocol = %Protocol::Udp,
        remote = %src,
        question = %dns::first_name(&request),
        "request"
    );

    let Some(response) = resolver.handle(&request).await else {
        return;
    };
    let Some(bytes) = encode_response(Protocol::Udp, &response) else {
        return;
    };
    if let Err(e) = socket.send_to(&bytes, src).await {
        error!(remote = %src, error = %e, "UDP response error");
    }
}
