//! Inbound DNS transports.
//!
//! Provides UDP and TCP listeners that decode client queries, hand them to
//! the resolver and write back whatever it answers.

pub mod tcp;
pub mod udp;

use std::fmt;

use hickory_proto::op::Message;
use tracing::{debug, warn};

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        })
    }
}

/// Decode a client query, logging and dropping garbage.
fn decode_query(protocol: Protocol, data: &[u8]) -> Option<Message> {
    match Message::from_vec(data) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!(protocol = %protocol, error = %e, "dropping undecodable query");
            None
        }
    }
}

fn encode_response(protocol: Protocol, message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(protocol = %protocol, error = %e, "failed to encode response");
            None
        }
    }
}
