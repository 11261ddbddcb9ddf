//! Static hosts file loading.
//!
//! Each `<ip> <name> [<name>...]` row becomes a permanent cache entry, so
//! mapped names are answered locally and never reach an upstream.

use std::net::IpAddr;
use std::path::Path;

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::cache::DnsCache;
use crate::dns;
use crate::error::Result;

/// Addresses per name, split by family, in file order.
#[derive(Debug, Default)]
pub struct Hosts {
    ipv4: FxHashMap<String, Vec<IpAddr>>,
    ipv6: FxHashMap<String, Vec<IpAddr>>,
    order: Vec<(RecordType, String)>,
}

impl Hosts {
    /// Parse hosts-file text. Malformed rows are logged and skipped.
    pub fn parse(text: &str) -> Self {
        let mut hosts = Hosts::default();
        for (index, row) in text.lines().enumerate() {
            let line = index + 1;
            let fields: Vec<&str> = row
                .split('#')
                .next()
                .unwrap_or_default()
                .split_whitespace()
                .collect();
            match fields.len() {
                0 => continue,
                1 => {
                    warn!(line, row, "illegal hosts row");
                    continue;
                }
                _ => {}
            }
            let Ok(ip) = fields[0].parse::<IpAddr>() else {
                warn!(line, row, "illegal hosts row");
                continue;
            };
            for name in &fields[1..] {
                hosts.add(dns::fqdn(name), ip);
            }
        }
        hosts
    }

    fn add(&mut self, name: String, ip: IpAddr) {
        let (map, rtype) = match ip {
            IpAddr::V4(_) => (&mut self.ipv4, RecordType::A),
            IpAddr::V6(_) => (&mut self.ipv6, RecordType::AAAA),
        };
        let ips = map.entry(name.clone()).or_insert_with(|| {
            self.order.push((rtype, name));
            Vec::new()
        });
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    /// One synthesised response per (name, family).
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.order.len());
        for (rtype, name) in &self.order {
            let map = match rtype {
                RecordType::AAAA => &self.ipv6,
                _ => &self.ipv4,
            };
            let Some(ips) = map.get(name) else {
                continue;
            };
            let Ok(owner) = dns::parse_name(name) else {
                warn!(name = %name, "failed to create record");
                continue;
            };

            let mut response = dns::response_to(&dns::new_query(0, owner.clone(), *rtype));
            for ip in ips {
                let rdata = match ip {
                    IpAddr::V4(v4) => RData::A(A(*v4)),
                    IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
                };
                response.add_answer(Record::from_rdata(owner.clone(), dns::SYNTHESIZED_TTL, rdata));
            }
            messages.push(response);
        }
        messages
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert every mapping into `cache` as a permanent entry.
    pub fn install(&self, cache: &DnsCache) -> usize {
        let messages = self.messages();
        for message in &messages {
            debug!(
                question = %dns::first_name(message),
                answers = message.answers().len(),
                "hosts entry"
            );
            cache.set_permanent(message.queries(), message);
        }
        messages.len()
    }
}

/// Read a hosts file and install its entries into `cache`.
pub async fn load_file(path: &Path, cache: &DnsCache) -> Result<usize> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(Hosts::parse(&text).install(cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn query(id: u16, name: &str, rtype: RecordType) -> Message {
        dns::new_query(id, dns::parse_name(name).unwrap(), rtype)
    }

    #[test]
    fn parse_groups_by_family() {
        let hosts = Hosts::parse(
            "127.0.0.1 localhost\n\
             ::1 localhost ip6-localhost\n\
             10.0.0.1 a.example b.example # comment\n\
             10.0.0.2 a.example\n",
        );

        assert_eq!(
            hosts.ipv4["a.example."],
            [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]
        );
        assert_eq!(hosts.ipv6["localhost."], [IpAddr::V6(Ipv6Addr::LOCALHOST)]);
        assert_eq!(hosts.len(), 5);
    }

    #[test]
    fn parse_skips_malformed_rows() {
        let hosts = Hosts::parse(
            "# only comment\n\n1.2.3.4\nnot-an-ip host.example\n  1.2.3.4\t \tdns.test.com\t \t\n",
        );

        assert_eq!(hosts.len(), 1);
        assert!(hosts.ipv4.contains_key("dns.test.com."));
    }

    #[test]
    fn install_answers_without_upstream() {
        let cache = DnsCache::new();
        let installed = Hosts::parse("1.2.3.4 test.example\n").install(&cache);
        assert_eq!(installed, 1);

        let hit = cache.get(&query(321, "Test.Example", RecordType::A)).unwrap();
        assert_eq!(hit.id(), 321);
        assert_eq!(hit.answers().len(), 1);
        let expected = Record::from_rdata(
            dns::parse_name("test.example").unwrap(),
            dns::SYNTHESIZED_TTL,
            RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
        );
        assert_eq!(hit.answers()[0], expected);

        assert!(cache.get(&query(1, "test.example", RecordType::AAAA)).is_none());
    }

    #[tokio::test]
    async fn load_file_reads_from_disk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "fe80::1 v6.example\n").unwrap();
        let cache = DnsCache::new();

        let installed = load_file(file.path(), &cache).await.unwrap();

        assert_eq!(installed, 1);
        assert!(cache.get(&query(1, "v6.example", RecordType::AAAA)).is_some());
    }
}
