//! Upstream backed by the host's own resolver configuration.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::{debug, warn};

use super::Upstream;
use crate::dns;
use crate::error::{Error, Result};

/// Answers queries through the platform resolver.
///
/// Address lookups go through the OS (`getaddrinfo`, honouring
/// `/etc/hosts`); CNAME, TXT, PTR, MX, NS and SRV go to the nameservers of
/// the system resolver configuration. Every other type is rejected.
pub struct SystemResolverClient {
    resolver: TokioResolver,
}

impl SystemResolverClient {
    pub fn new() -> Self {
        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                warn!(error = %e, "failed to read system resolver configuration, using defaults");
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };
        Self { resolver }
    }

    async fn lookup_addresses(&self, request: &Message, rtype: RecordType) -> Result<Message> {
        let name = request.queries()[0].name().clone();
        let host = name.to_ascii();
        let host = host.trim_end_matches('.');

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::System(e.to_string()))?
        {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }

        let mut response = dns::response_to(request);
        for ip in ips {
            let rdata = match (rtype, ip) {
                (RecordType::A, IpAddr::V4(v4)) => RData::A(A(v4)),
                (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(name.clone(), dns::SYNTHESIZED_TTL, rdata));
        }
        Ok(response)
    }

    async fn lookup_records(&self, request: &Message, rtype: RecordType) -> Result<Message> {
        let name = request.queries()[0].name().clone();
        let lookup = self
            .resolver
            .lookup(name, rtype)
            .await
            .map_err(|e| Error::System(e.to_string()))?;

        let mut response = dns::response_to(request);
        for record in lookup.record_iter() {
            response.add_answer(record.clone());
        }
        Ok(response)
    }
}

impl Default for SystemResolverClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Upstream for SystemResolverClient {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        let Some(query) = request.queries().first() else {
            return Err(Error::Response("query has no question".into()));
        };
        debug!(question = %dns::first_name(request), "system DNS");

        match query.query_type() {
            rtype @ (RecordType::A | RecordType::AAAA) => {
                self.lookup_addresses(request, rtype).await
            }
            rtype @ (RecordType::CNAME
            | RecordType::TXT
            | RecordType::PTR
            | RecordType::MX
            | RecordType::NS
            | RecordType::SRV) => self.lookup_records(request, rtype).await,
            other => Err(Error::UnsupportedQueryType(other)),
        }
    }

    fn name(&self) -> &str {
        "system"
    }
}
