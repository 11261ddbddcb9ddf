//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently. Messages are prefixed
//! with a 2-byte length, and a client may send several on one connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{Protocol, decode_query, encode_response};
use crate::dns;
use crate::resolver::Resolver;

/// TCP listener for the forwarder.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop; each connection gets its own task.
    pub fn start(self, resolver: Arc<Resolver>) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, resolver))
    }
}

async fn run_accept_loop(listener: TcpListener, resolver: Arc<Resolver>) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, resolver.clone()));
            }
            Err(e) => {
                error!(error = %e, "TCP accept error");
            }
        }
    }
}

/// Serve queries from one connection until the client closes it.
///
/// A query that gets no answer ends the connection, mirroring the silence
/// of the UDP side.
async fn handle_connection(mut client: TcpStream, peer: SocketAddr, resolver: Arc<Resolver>) {
    while let Some(query) = read_dns_message(&mut client).await {
        let Some(request) = decode_query(Protocol::Tcp, &query) else {
            return;
        };
        debug!(
            protocol = %Protocol::Tcp,
            remote = %peer,
            question = %dns::first_name(&request),
            "request"
        );

        let Some(response) = resolver.handle(&request).await else {
            return;
        };
        let Some(bytes) = encode_response(Protocol::Tcp, &response) else {
            return;
        };
        let Ok(len) = u16::try_from(bytes.len()) else {
            return;
        };
        if client.write_all(&len.to_be_bytes()).await.is_err()
            || client.write_all(&bytes).await.is_err()
        {
            return;
        }
    }
}

/// Read one length-prefixed DNS message, without its prefix.
async fn read_dns_message(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.ok()?;

    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf).await.ok()?;

    Some(buf)
}
