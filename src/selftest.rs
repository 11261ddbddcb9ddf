//! Smoke test of a live forwarder.
//!
//! Starts a server on an ephemeral loopback port with the system resolver
//! as its only upstream and a one-line hosts table, then checks that a real
//! name and the hosts name both come back with answers.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tracing::{info, warn};

use crate::dns;
use crate::error::{Error, Result};
use crate::hosts::Hosts;
use crate::proxy::{ProxyConfig, Server};
use crate::upstream::{DirectClient, Network, Upstream};

const TEST_HOSTS: &str = "  1.2.3.4\t \tdns.test.com\t \t\n";

const ATTEMPTS: usize = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Run the self-test; `Ok` means both queries were answered as expected.
pub async fn run(timeout: Duration) -> Result<()> {
    let config = ProxyConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        timeout,
        ..ProxyConfig::default()
    };
    let server = Server::start(config).await?;
    Hosts::parse(TEST_HOSTS).install(server.resolver().cache());

    let client = DirectClient::new(
        server.local_addr().to_string(),
        Network::Udp,
        None,
        crate::dialer::tls_config()?,
    );
    let deadline = timeout + Duration::from_secs(1);

    query(&client, deadline, "github.com", None).await?;
    query(&client, deadline, "dns.test.com", Some("1.2.3.4")).await?;

    info!("self-test passed");
    Ok(())
}

async fn query(
    client: &DirectClient,
    deadline: Duration,
    name: &str,
    expected: Option<&str>,
) -> Result<()> {
    let request = dns::new_query(query_id(name), dns::parse_name(name)?, RecordType::A);

    let mut last = Error::SelfTest(format!("{name}: no attempts made"));
    for attempt in 1..=ATTEMPTS {
        match attempt_once(client, deadline, &request, expected).await {
            Ok(answers) => {
                info!(question = name, answers = %answers, "self-test answer");
                return Ok(());
            }
            Err(e) => {
                warn!(question = name, attempt, error = %e, "self-test attempt failed");
                last = e;
            }
        }
        if attempt < ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    Err(last)
}

async fn attempt_once(
    client: &DirectClient,
    deadline: Duration,
    request: &Message,
    expected: Option<&str>,
) -> Result<String> {
    let response = tokio::time::timeout(deadline, client.exchange(request))
        .await
        .map_err(|_| Error::Timeout)??;
    check_answers(&response, expected)
}

/// Render the answer section, failing when it is empty or lacks `expected`.
fn check_answers(response: &Message, expected: Option<&str>) -> Result<String> {
    if response.answers().is_empty() {
        return Err(Error::SelfTest("no result".into()));
    }
    let rendered = response
        .answers()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    match expected {
        Some(want) if !rendered.contains(want) => {
            Err(Error::SelfTest(format!("not expected result: {rendered}")))
        }
        _ => Ok(rendered),
    }
}

/// Fixed per-name transaction id so retries of one question look alike.
fn query_id(name: &str) -> u16 {
    name.bytes().fold(0x5a5a_u16, |acc, b| acc.rotate_left(5) ^ u16::from(b))
}
