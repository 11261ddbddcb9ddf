//! DNS over HTTPS upstream.

use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use super::Upstream;
use crate::dns;
use crate::error::{Error, Result};

const DNS_MESSAGE: &str = "application/dns-message";

/// Posts wire-format queries to `https://<host>/dns-query`.
pub struct DohClient {
    url: String,
    /// Configured transport, proxy-aware when a registry slot was given.
    http: reqwest::Client,
    /// Plain transport for the single retry after a transport failure.
    direct: reqwest::Client,
    name: String,
}

impl DohClient {
    pub fn new(host: &str, proxy: Option<&Url>, timeout: Duration) -> Result<Self> {
        Self::with_url(
            format!("https://{}/dns-query", host),
            format!("{}[DoH]", host),
            proxy,
            timeout,
        )
    }

    pub(crate) fn with_url(
        url: String,
        name: String,
        proxy: Option<&Url>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        let http = builder.build()?;
        let direct = reqwest::Client::builder()
            .use_rustls_tls()
            .no_proxy()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            url,
            http,
            direct,
            name,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        body: Vec<u8>,
    ) -> reqwest::Result<reqwest::Response> {
        client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE)
            .body(body)
            .send()
            .await
    }
}

#[async_trait]
impl Upstream for DohClient {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        debug!(dns = %self.name, question = %dns::first_name(request), "DoH");
        let body = request.to_vec()?;

        let response = match self.post(&self.http, body.clone()).await {
            Ok(response) => response,
            Err(e) => {
                debug!(dns = %self.name, error = %e, "DoH request failed, retrying without proxy");
                // Report the first failure if the retry fails as well.
                self.post(&self.direct, body).await.map_err(|_| e)?
            }
        };

        if response.status() != StatusCode::OK {
            return Err(Error::Status(response.status()));
        }
        let bytes = response.bytes().await?;
        Ok(Message::from_vec(&bytes)?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Captured {
        head: String,
        body: Vec<u8>,
    }

    /// Serve one HTTP request; reply with `status` and a DNS answer to the body.
    async fn serve_once(status: &'static str) -> (String, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/dns-query", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let n = conn.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
            let length: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse().unwrap())
                .unwrap_or(0);
            while buf.len() < header_end + length {
                let n = conn.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = buf[header_end..header_end + length].to_vec();

            let query = Message::from_vec(&body).unwrap();
            let mut response = dns::response_to(&query);
            response.add_answer(Record::from_rdata(
                query.queries()[0].name().clone(),
                60,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 53))),
            ));
            let reply = response.to_vec().unwrap();
            let header = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {DNS_MESSAGE}\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n",
                reply.len()
            );
            conn.write_all(header.as_bytes()).await.unwrap();
            conn.write_all(&reply).await.unwrap();

            Captured { head, body }
        });

        (url, handle)
    }

    fn request(id: u16) -> Message {
        dns::new_query(id, dns::parse_name("example.com").unwrap(), RecordType::A)
    }

    fn client(url: String, proxy: Option<&Url>) -> DohClient {
        DohClient::with_url(url, "test[DoH]".into(), proxy, TIMEOUT).unwrap()
    }

    #[test]
    fn builds_dns_query_url() {
        let client = DohClient::new("dns.example", None, TIMEOUT).unwrap();

        assert_eq!(client.url(), "https://dns.example/dns-query");
        assert_eq!(client.name(), "dns.example[DoH]");
    }

    #[test]
    fn accepts_socks_proxy() {
        let proxy = Url::parse("socks5://127.0.0.1:1080").unwrap();

        assert!(DohClient::new("dns.example", Some(&proxy), TIMEOUT).is_ok());
    }

    #[tokio::test]
    async fn exchange_posts_wire_format() {
        let (url, server) = serve_once("200 OK").await;

        let response = client(url, None).exchange(&request(77)).await.unwrap();
        let captured = server.await.unwrap();

        assert!(captured.head.starts_with("post /dns-query http/1.1\r\n"));
        assert!(captured.head.contains("content-type: application/dns-message\r\n"));
        assert_eq!(Message::from_vec(&captured.body).unwrap().id(), 77);
        assert_eq!(response.id(), 77);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn non_200_is_a_status_error() {
        let (url, server) = serve_once("503 Service Unavailable").await;

        let err = client(url, None).exchange(&request(1)).await.unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, Error::Status(StatusCode::SERVICE_UNAVAILABLE)));
    }

    #[tokio::test]
    async fn dead_proxy_retries_directly_once() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = Url::parse(&format!("http://{}", dead.local_addr().unwrap())).unwrap();
        drop(dead);
        let (url, server) = serve_once("200 OK").await;

        let response = client(url, Some(&proxy)).exchange(&request(9)).await.unwrap();
        server.await.unwrap();

        assert_eq!(response.id(), 9);
    }
}
