//! Racing a query across every client of a tier.

use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::upstream::SharedUpstream;

/// Winning response of a race.
#[derive(Debug)]
pub struct Answer {
    pub message: Message,
    /// Name of the client that answered first.
    pub upstream: String,
}

/// Send `request` to all `clients` at once and return the first success.
///
/// Completion order decides the winner; list order carries no priority.
/// Losing attempts are aborted when the winner is returned, and all of
/// them are aborted if the returned future is dropped (e.g. by a timeout).
pub async fn race(clients: &[SharedUpstream], request: &Message) -> Result<Answer> {
    if clients.is_empty() {
        return Err(Error::NoClients);
    }

    let request = Arc::new(request.clone());
    let mut attempts = JoinSet::new();
    for client in clients {
        let client = client.clone();
        let request = request.clone();
        attempts.spawn(async move {
            let result = client.exchange(&request).await;
            (client, result)
        });
    }

    let mut last = None;
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok((client, Ok(message))) => {
                return Ok(Answer {
                    message,
                    upstream: client.name().to_string(),
                });
            }
            Ok((client, Err(e))) => {
                debug!(dns = client.name(), error = %e, "exchange failed");
                last = Some(e);
            }
            Err(e) => {
                last = Some(Error::Response(format!("exchange task failed: {}", e)));
            }
        }
    }

    Err(Error::AllFailed {
        attempts: clients.len(),
        last: Box::new(last.unwrap_or(Error::NoClients)),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dns;
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted upstream for tests.
    pub struct MockUpstream {
        pub name: String,
        pub delay: Duration,
        pub answer: Option<Ipv4Addr>,
        pub calls: AtomicUsize,
        pub finished: AtomicUsize,
    }

    impl MockUpstream {
        pub fn ok(name: &str, ip: Ipv4Addr, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                delay,
                answer: Some(ip),
                calls: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }

        pub fn failing(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                delay,
                answer: None,
                calls: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl crate::upstream::Upstream for MockUpstream {
        async fn exchange(&self, request: &Message) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);

            let Some(ip) = self.answer else {
                return Err(Error::Response(format!("{} refused", self.name)));
            };
            let mut response = dns::response_to(request);
            response.add_answer(Record::from_rdata(
                request.queries()[0].name().clone(),
                60,
                RData::A(A(ip)),
            ));
            Ok(response)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    pub fn request(id: u16, name: &str) -> Message {
        dns::new_query(id, dns::parse_name(name).unwrap(), RecordType::A)
    }

    #[tokio::test]
    async fn no_clients_is_an_error() {
        let err = race(&[], &request(1, "example.com")).await.unwrap_err();

        assert!(matches!(err, Error::NoClients));
    }

    #[tokio::test]
    async fn success_beats_immediate_failure() {
        let bad = MockUpstream::failing("bad", Duration::ZERO);
        let good = MockUpstream::ok("good", Ipv4Addr::new(192, 0, 2, 7), Duration::from_millis(20));
        let clients: Vec<SharedUpstream> = vec![bad.clone(), good.clone()];

        let answer = race(&clients, &request(3, "example.com")).await.unwrap();

        assert_eq!(answer.upstream, "good");
        assert_eq!(answer.message.id(), 3);
        assert_eq!(answer.message.answers().len(), 1);
        assert_eq!(bad.calls(), 1);
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_success_wins_and_losers_are_aborted() {
        let fast = MockUpstream::ok("fast", Ipv4Addr::new(192, 0, 2, 1), Duration::from_millis(10));
        let slow = MockUpstream::ok("slow", Ipv4Addr::new(192, 0, 2, 2), Duration::from_secs(10));
        let clients: Vec<SharedUpstream> = vec![slow.clone(), fast.clone()];

        let answer = race(&clients, &request(1, "example.com")).await.unwrap();
        assert_eq!(answer.upstream, "fast");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(slow.calls(), 1);
        assert_eq!(slow.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let clients: Vec<SharedUpstream> = vec![
            MockUpstream::failing("a", Duration::ZERO),
            MockUpstream::failing("b", Duration::from_millis(5)),
        ];

        let err = race(&clients, &request(1, "example.com")).await.unwrap_err();

        assert!(matches!(err, Error::AllFailed { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_race_aborts_attempts() {
        let slow = MockUpstream::ok("slow", Ipv4Addr::new(192, 0, 2, 2), Duration::from_secs(10));
        let clients: Vec<SharedUpstream> = vec![slow.clone()];

        let timed = tokio::time::timeout(
            Duration::from_secs(1),
            race(&clients, &request(1, "example.com")),
        )
        .await;
        assert!(timed.is_err());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(slow.finished.load(Ordering::SeqCst), 0);
    }
}
