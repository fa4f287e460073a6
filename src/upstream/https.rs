use crate::upstream::bootstrap::Bootstrap;
use crate::upstream::{normalize_host_port, Upstream};
use anyhow::{Context, Result};
use hickory_proto::op::Message;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use url::{Host, Url};

const DNS_MESSAGE: &str = "application/dns-message";

/// DNS-over-HTTPS (RFC 8484 POST).
pub struct DnsOverHttps {
    address: String,
    url: Url,
    /// Fixed server address taken from a DNS stamp, bypassing bootstrap.
    connect_addr: Option<String>,
    bootstrap: Arc<Bootstrap>,
    timeout: Duration,
    client: RwLock<Option<reqwest::Client>>,
}

impl DnsOverHttps {
    pub fn new(address: &str, url: Url, connect_addr: Option<String>, bootstrap: Arc<Bootstrap>, timeout: Duration) -> Self {
        Self { address: address.to_string(), url, connect_addr, bootstrap, timeout, client: RwLock::new(None) }
    }

    async fn client(&self) -> Result<reqwest::Client> {
        let cached = self.client.read().clone();
        if let Some(client) = cached {
            return Ok(client);
        }

        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(Host::Domain(domain)) = self.url.host() {
            let port = self.url.port_or_known_default().unwrap_or(443);
            let addr = match &self.connect_addr {
                Some(addr) => normalize_host_port(addr, port).parse::<SocketAddr>()
                    .with_context(|| format!("invalid server address {} for {}", addr, self.address))?,
                None => self.bootstrap.resolve(domain, port).await?,
            };
            builder = builder.resolve(domain, addr);
        }
        let client = builder.build()?;

        let mut guard = self.client.write();
        Ok(guard.get_or_insert(client).clone())
    }
}

#[async_trait::async_trait]
impl Upstream for DnsOverHttps {
    async fn exchange(&self, req: &Message) -> Result<Message> {
        let client = self.client().await
            .with_context(|| format!("couldn't create HTTP client for {}", self.address))?;
        let body = req.to_vec()?;

        let resp = client.post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE)
            .body(body)
            .send()
            .await
            .with_context(|| format!("couldn't do a POST request to '{}'", self.address))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            anyhow::bail!("got an unexpected HTTP status code {} from '{}'", status.as_u16(), self.address);
        }
        let buf = resp.bytes().await
            .with_context(|| format!("couldn't read body contents for '{}'", self.address))?;
        if buf.is_empty() {
            anyhow::bail!("got unexpected empty body from '{}'", self.address);
        }
        Message::from_vec(&buf)
            .with_context(|| format!("couldn't unpack DNS response from '{}'", self.address))
    }

    fn address(&self) -> &str { &self.address }
}
