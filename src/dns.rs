//! DNS message helpers on top of the hickory-proto codec.

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};

use crate::error::Result;

/// Default TTL for records synthesised without an upstream TTL.
pub const SYNTHESIZED_TTL: u32 = 3600;

/// One (name, type, class) tuple of a question section.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Signature {
    name: String,
    qtype: RecordType,
    qclass: DNSClass,
}

/// Cache key derived from the full question section of a message.
///
/// Names are compared case-insensitively and the transaction id plays no
/// part, so retries with a fresh id land on the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuestionKey(Vec<Signature>);

impl QuestionKey {
    pub fn from_queries(queries: &[Query]) -> Self {
        Self(
            queries
                .iter()
                .map(|q| Signature {
                    name: fqdn(&q.name().to_ascii()),
                    qtype: q.query_type(),
                    qclass: q.query_class(),
                })
                .collect(),
        )
    }

    pub fn from_message(message: &Message) -> Self {
        Self::from_queries(message.queries())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Lower-case a domain and make it fully qualified.
pub fn fqdn(domain: &str) -> String {
    let mut domain = domain.trim().to_ascii_lowercase();
    if !domain.ends_with('.') {
        domain.push('.');
    }
    domain
}

/// Parse a textual domain into a fully qualified `Name`.
pub fn parse_name(domain: &str) -> Result<Name> {
    let mut name = Name::from_ascii(fqdn(domain))?;
    name.set_fqdn(true);
    Ok(name)
}

/// Name of the first question, or `<empty>` for question-less messages.
pub fn first_name(message: &Message) -> String {
    message
        .queries()
        .first()
        .map(|q| fqdn(&q.name().to_ascii()))
        .unwrap_or_else(|| "<empty>".to_string())
}

/// Build a recursive query for a single question.
pub fn new_query(id: u16, name: Name, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));
    message
}

/// Start a response echoing the id and questions of `request`.
pub fn response_to(request: &Message) -> Message {
    let mut message = Message::new();
    message
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .add_queries(request.queries().iter().cloned());
    message
}

/// Copy of `message` stamped with transaction id `id`.
pub fn with_id(message: &Message, id: u16) -> Message {
    let mut copy = message.clone();
    copy.set_id(id);
    copy
}
