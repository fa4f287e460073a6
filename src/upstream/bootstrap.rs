//! Resolves the host names of encrypted upstreams through plain DNS servers.

use crate::types::fqdn;
use crate::upstream::plain::PlainDns;
use crate::upstream::{normalize_host_port, Upstream};
use anyhow::Result;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{RData, RecordType};
use std::net::{IpAddr, SocketAddr};
use tokio::time::Duration;

pub struct Bootstrap {
    resolvers: Vec<PlainDns>,
}

impl Bootstrap {
    /// Every bootstrap entry must be a plain IP address (optionally with a port).
    pub fn new(addrs: &[String], timeout: Duration) -> Result<Self> {
        let mut resolvers = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let server = normalize_host_port(addr.trim(), 53);
            if server.parse::<SocketAddr>().is_err() {
                anyhow::bail!("bootstrap DNS must be an IP address, got '{}'", addr);
            }
            resolvers.push(PlainDns::new(addr, server, false, timeout));
        }
        Ok(Self { resolvers })
    }

    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        if self.resolvers.is_empty() {
            return tokio::net::lookup_host((host, port)).await?
                .next()
                .ok_or_else(|| anyhow::anyhow!("system resolver returned nothing for {}", host));
        }

        let mut req = Message::new();
        req.set_id(rand::random()).set_recursion_desired(true);
        req.add_query(Query::query(fqdn(host)?, RecordType::A));

        let mut last_err = None;
        for resolver in &self.resolvers {
            match resolver.exchange(&req).await {
                Ok(reply) => {
                    let ip = reply.answers().iter().find_map(|r| match r.data() {
                        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                        _ => None,
                    });
                    if let Some(ip) = ip {
                        tracing::debug!("Bootstrap {} resolved {} to {}", resolver.address(), host, ip);
                        return Ok(SocketAddr::new(ip, port));
                    }
                }
                Err(e) => {
                    tracing::debug!("Bootstrap {} failed for {}: {:#}", resolver.address(), host, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e.context(format!("failed to resolve {} through bootstrap DNS", host))),
            None => anyhow::bail!("bootstrap DNS has no A records for {}", host),
        }
    }
}
