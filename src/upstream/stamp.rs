//! `sdns://` DNS stamps.

use crate::upstream::bootstrap::Bootstrap;
use crate::upstream::dnscrypt::DnsCrypt;
use crate::upstream::https::DnsOverHttps;
use crate::upstream::plain::PlainDns;
use crate::upstream::tls::DnsOverTls;
use crate::upstream::{normalize_host_port, Upstream};
use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::sync::Arc;
use tokio::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampProto {
    Plain,
    DnsCrypt,
    DoH,
    DoT,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub proto: StampProto,
    pub props: u64,
    pub server_addr: String,
    pub server_pk: Vec<u8>,
    pub hashes: Vec<Vec<u8>>,
    /// Provider name for DNSCrypt, host name for DoH and DoT.
    pub provider_name: String,
    pub path: String,
}

struct Reader<'a> {
    bin: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self.bin.get(self.pos).ok_or_else(|| anyhow::anyhow!("stamp is too short"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.bin.len() { anyhow::bail!("stamp is too short"); }
        let out = &self.bin[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn lp(&mut self) -> Result<&'a [u8]> {
        let len = self.byte()? as usize;
        self.take(len)
    }

    fn lp_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.lp()?.to_vec())?)
    }

    /// Variable-length set: the high bit of each length byte says another item follows.
    fn vlp(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut items = Vec::new();
        loop {
            let len = self.byte()?;
            let item = self.take((len & 0x7f) as usize)?;
            if !item.is_empty() { items.push(item.to_vec()); }
            if len & 0x80 == 0 { return Ok(items); }
        }
    }
}

impl Stamp {
    pub fn parse(s: &str) -> Result<Stamp> {
        let encoded = s.strip_prefix("sdns://").ok_or_else(|| anyhow::anyhow!("stamps are expected to start with sdns://"))?;
        let bin = URL_SAFE_NO_PAD.decode(encoded).context("invalid stamp encoding")?;
        let mut r = Reader { bin: &bin, pos: 0 };

        let proto = match r.byte()? {
            0x00 => StampProto::Plain,
            0x01 => StampProto::DnsCrypt,
            0x02 => StampProto::DoH,
            0x03 => StampProto::DoT,
            other => anyhow::bail!("unsupported stamp protocol {:#04x}", other),
        };
        let mut props = [0u8; 8];
        props.copy_from_slice(r.take(8)?);

        let mut stamp = Stamp {
            proto,
            props: u64::from_le_bytes(props),
            server_addr: r.lp_string()?,
            server_pk: Vec::new(),
            hashes: Vec::new(),
            provider_name: String::new(),
            path: String::new(),
        };
        match proto {
            StampProto::Plain => {}
            StampProto::DnsCrypt => {
                stamp.server_pk = r.lp()?.to_vec();
                stamp.provider_name = r.lp_string()?;
                if stamp.server_pk.len() != 32 { anyhow::bail!("unsupported public key length {}", stamp.server_pk.len()); }
            }
            StampProto::DoH => {
                stamp.hashes = r.vlp()?;
                stamp.provider_name = r.lp_string()?;
                stamp.path = r.lp_string()?;
            }
            StampProto::DoT => {
                stamp.hashes = r.vlp()?;
                stamp.provider_name = r.lp_string()?;
            }
        }
        Ok(stamp)
    }
}

/// `[::1]:53` -> (`::1`, Some(53)), `1.2.3.4` -> (`1.2.3.4`, None).
fn split_host_port(addr: &str) -> (String, Option<u16>) {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host.to_string(), tail.strip_prefix(':').and_then(|p| p.parse().ok()));
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (addr.to_string(), None),
        },
        _ => (addr.to_string(), None),
    }
}

pub fn upstream_from_stamp(address: &str, bootstrap: &Arc<Bootstrap>, timeout: Duration) -> Result<Arc<dyn Upstream>> {
    let stamp = Stamp::parse(address).with_context(|| format!("Failed to parse {}", address))?;
    match stamp.proto {
        StampProto::Plain => {
            Ok(Arc::new(PlainDns::new(address, normalize_host_port(&stamp.server_addr, 53), false, timeout)))
        }
        StampProto::DnsCrypt => {
            let mut pk = [0u8; 32];
            pk.copy_from_slice(&stamp.server_pk);
            let server = normalize_host_port(&stamp.server_addr, 443);
            Ok(Arc::new(DnsCrypt::new(address, server, stamp.provider_name, pk, timeout)))
        }
        StampProto::DoH => {
            let path = if stamp.path.is_empty() { "/dns-query" } else { stamp.path.as_str() };
            let url = Url::parse(&format!("https://{}{}", stamp.provider_name, path))
                .with_context(|| format!("invalid DoH stamp host '{}'", stamp.provider_name))?;
            let connect_addr = (!stamp.server_addr.is_empty()).then(|| stamp.server_addr.clone());
            Ok(Arc::new(DnsOverHttps::new(address, url, connect_addr, bootstrap.clone(), timeout)))
        }
        StampProto::DoT => {
            let (sni_host, host_port) = split_host_port(&stamp.provider_name);
            let (connect_host, addr_port) = if stamp.server_addr.is_empty() {
                (sni_host.clone(), None)
            } else {
                split_host_port(&stamp.server_addr)
            };
            let port = addr_port.or(host_port).unwrap_or(853);
            Ok(Arc::new(DnsOverTls::new(address, sni_host, connect_host, port, bootstrap.clone(), timeout)))
        }
    }
}
