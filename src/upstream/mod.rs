//! Upstream resolvers and the policy that picks one of them per query.

pub mod bootstrap;
pub mod dnscrypt;
pub mod https;
pub mod plain;
pub mod stamp;
pub mod tls;

use anyhow::{Context, Result};
use hickory_proto::op::Message;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use url::{Host, Url};

use self::bootstrap::Bootstrap;

/// Per-exchange timeout shared by all protocols.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    async fn exchange(&self, req: &Message) -> Result<Message>;
    /// The address exactly as it was configured.
    fn address(&self) -> &str;
}

/// Upstream list plus domain-specific overrides.
#[derive(Clone, Default)]
pub struct UpstreamConfig {
    pub upstreams: Vec<Arc<dyn Upstream>>,
    /// Lowercase domain (no trailing dot) -> upstreams. An empty list means "use the default list".
    pub domain_reserved: HashMap<String, Vec<Arc<dyn Upstream>>>,
}

impl UpstreamConfig {
    pub fn new(upstreams: Vec<Arc<dyn Upstream>>) -> Self {
        Self { upstreams, domain_reserved: HashMap::new() }
    }

    /// Parses upstream lines (`addr` or `[/domain/.../]addr`), skipping comments.
    pub fn parse(lines: &[String], bootstrap: &[String], timeout: Duration) -> Result<Self> {
        let bootstrap = Arc::new(Bootstrap::new(bootstrap, timeout)?);
        let mut conf = UpstreamConfig::default();

        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') { continue; }

            if let Some(rest) = line.strip_prefix("[/") {
                let end = rest.find("/]").ok_or_else(|| anyhow::anyhow!("wrong upstream format: {}", line))?;
                let domains: Vec<String> = rest[..end].split('/')
                    .filter(|d| !d.is_empty())
                    .map(|d| d.trim_end_matches('.').to_lowercase())
                    .collect();
                if domains.is_empty() { anyhow::bail!("wrong upstream format: {}", line); }
                let addr = rest[end + 2..].trim();

                if addr == "#" {
                    for d in domains { conf.domain_reserved.entry(d).or_default(); }
                    continue;
                }
                let up = get_upstream(addr, &bootstrap, timeout)?;
                for d in domains { conf.domain_reserved.entry(d).or_default().push(up.clone()); }
                continue;
            }

            conf.upstreams.push(get_upstream(line, &bootstrap, timeout)?);
        }
        Ok(conf)
    }

    /// Upstreams responsible for `host`: the longest reserved suffix wins, otherwise the default list.
    pub fn upstreams_for(&self, host: &str) -> &[Arc<dyn Upstream>] {
        if self.domain_reserved.is_empty() { return &self.upstreams; }

        let host = host.trim_end_matches('.').to_lowercase();
        let mut current = host.as_str();
        loop {
            if let Some(list) = self.domain_reserved.get(current) {
                if list.is_empty() { return &self.upstreams; }
                return list;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return &self.upstreams,
            }
        }
    }

    pub fn is_empty(&self) -> bool { self.upstreams.is_empty() }
}

/// Picks the upstream for one query: the only one, or a uniformly random one.
pub fn choose(upstreams: &[Arc<dyn Upstream>]) -> Option<Arc<dyn Upstream>> {
    match upstreams.len() {
        0 => None,
        1 => Some(upstreams[0].clone()),
        n => Some(upstreams[rand::thread_rng().gen_range(0..n)].clone()),
    }
}

/// Builds the strategy matching the address scheme.
pub fn get_upstream(address: &str, bootstrap: &Arc<Bootstrap>, timeout: Duration) -> Result<Arc<dyn Upstream>> {
    if !address.contains("://") {
        return Ok(Arc::new(plain::PlainDns::new(address, normalize_host_port(address, 53), false, timeout)));
    }

    if address.starts_with("sdns://") {
        return stamp::upstream_from_stamp(address, bootstrap, timeout);
    }

    let url = Url::parse(address).with_context(|| format!("Failed to parse {}", address))?;
    match url.scheme() {
        "dns" | "udp" => {
            let server = url_host_port(&url, 53)?;
            Ok(Arc::new(plain::PlainDns::new(address, server, false, timeout)))
        }
        "tcp" => {
            let server = url_host_port(&url, 53)?;
            Ok(Arc::new(plain::PlainDns::new(address, server, true, timeout)))
        }
        "tls" => {
            let host = url_host(&url)?;
            let port = url.port().unwrap_or(853);
            Ok(Arc::new(tls::DnsOverTls::new(address, host.clone(), host, port, bootstrap.clone(), timeout)))
        }
        "https" => Ok(Arc::new(https::DnsOverHttps::new(address, url, None, bootstrap.clone(), timeout))),
        other => anyhow::bail!("unsupported upstream scheme '{}' in {}", other, address),
    }
}

fn url_host(url: &Url) -> Result<String> {
    match url.host() {
        Some(Host::Domain(d)) => Ok(d.to_string()),
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        None => anyhow::bail!("no host in upstream address {}", url),
    }
}

fn url_host_port(url: &Url, default_port: u16) -> Result<String> {
    let host = url.host().ok_or_else(|| anyhow::anyhow!("no host in upstream address {}", url))?;
    Ok(format!("{}:{}", host, url.port().unwrap_or(default_port)))
}

/// `1.2.3.4` -> `1.2.3.4:53`, `::1` -> `[::1]:53`, `host:5353` stays as is.
pub(crate) fn normalize_host_port(addr: &str, default_port: u16) -> String {
    if addr.parse::<SocketAddr>().is_ok() { return addr.to_string(); }
    if let Ok(ip) = addr.parse::<IpAddr>() { return SocketAddr::new(ip, default_port).to_string(); }
    if addr.starts_with('[') && addr.ends_with(']') { return format!("{}:{}", addr, default_port); }
    match addr.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{}:{}", addr, default_port),
    }
}

/// Writes one DNS message with the 2-byte length prefix used by TCP and TLS transports.
pub(crate) async fn write_framed<W: AsyncWrite + Unpin>(w: &mut W, msg: &[u8]) -> Result<()> {
    let len = u16::try_from(msg.len()).map_err(|_| anyhow::anyhow!("message too large: {} bytes", msg.len()))?;
    let mut req = Vec::with_capacity(msg.len() + 2);
    req.extend_from_slice(&len.to_be_bytes());
    req.extend_from_slice(msg);
    w.write_all(&req).await?;
    w.flush().await?;
    Ok(())
}

pub(crate) async fn read_framed<R: AsyncRead + Unpin>(r: &mut R, limit: Duration) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    timeout(limit, r.read_exact(&mut len_buf)).await??;
    let resp_len = u16::from_be_bytes(len_buf) as usize;
    let mut resp = vec![0u8; resp_len];
    timeout(limit, r.read_exact(&mut resp)).await??;
    Ok(resp)
}
