//! DHCP lease tables used to answer `<host>.lan` and reverse lookups for leased addresses.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub hostname: String,
    pub ip: Ipv4Addr,
}

#[derive(Default)]
struct Tables {
    host_to_ip: HashMap<String, Ipv4Addr>,
    ip_to_host: HashMap<IpAddr, String>,
}

#[derive(Default)]
pub struct LeaseTable {
    tables: RwLock<Tables>,
}

fn is_hostname_ok(host: &str) -> bool {
    host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

impl LeaseTable {
    pub fn new() -> Self { Self::default() }

    /// Swaps both tables for the given lease set.
    pub fn update(&self, leases: &[Lease]) {
        let mut t = Tables::default();
        for l in leases {
            if l.hostname.is_empty() || !is_hostname_ok(&l.hostname) {
                tracing::debug!("DHCP: skipping invalid hostname {:?}", l.hostname);
                continue;
            }
            let host = l.hostname.to_lowercase();
            t.ip_to_host.insert(IpAddr::V4(l.ip), host.clone());
            t.host_to_ip.insert(host, l.ip);
        }
        tracing::debug!("DHCP: added {} A/PTR entries", t.ip_to_host.len());
        *self.tables.write() = t;
    }

    pub fn ip_of(&self, host: &str) -> Option<Ipv4Addr> {
        self.tables.read().host_to_ip.get(&host.to_lowercase()).copied()
    }

    pub fn host_of(&self, ip: IpAddr) -> Option<String> {
        self.tables.read().ip_to_host.get(&ip).cloned()
    }
}

/// Parses `4.3.2.1.in-addr.arpa` or a nibble-format `ip6.arpa` name.
pub fn unreverse_addr(arpa: &str) -> Option<IpAddr> {
    let arpa = arpa.trim_end_matches('.').to_lowercase();
    if let Some(rest) = arpa.strip_suffix(".in-addr.arpa") {
        let mut octets: Vec<u8> = rest.split('.').map(|p| p.parse::<u8>().ok()).collect::<Option<_>>()?;
        if octets.len() != 4 { return None; }
        octets.reverse();
        return Some(IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])));
    }
    if let Some(rest) = arpa.strip_suffix(".ip6.arpa") {
        let nibbles: Vec<u8> = rest.split('.').map(|p| {
            if p.len() != 1 { return None; }
            u8::from_str_radix(p, 16).ok()
        }).collect::<Option<_>>()?;
        if nibbles.len() != 32 { return None; }
        let mut bytes = [0u8; 16];
        let forward: Vec<u8> = nibbles.into_iter().rev().collect();
        for (i, pair) in forward.chunks(2).enumerate() {
            bytes[i] = (pair[0] << 4) | pair[1];
        }
        return Some(IpAddr::V6(Ipv6Addr::from(bytes)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_lookup() {
        let table = LeaseTable::new();
        table.update(&[
            Lease { hostname: "NAS".into(), ip: Ipv4Addr::new(192, 168, 1, 10) },
            Lease { hostname: "bad host".into(), ip: Ipv4Addr::new(192, 168, 1, 11) },
            Lease { hostname: "".into(), ip: Ipv4Addr::new(192, 168, 1, 12) },
        ]);
        assert_eq!(table.ip_of("nas"), Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(table.host_of("192.168.1.10".parse().unwrap()).as_deref(), Some("nas"));
        assert!(table.host_of("192.168.1.11".parse().unwrap()).is_none());

        table.update(&[]);
        assert!(table.ip_of("nas").is_none());
    }

    #[test]
    fn reverse_names() {
        assert_eq!(unreverse_addr("10.1.168.192.in-addr.arpa."), Some("192.168.1.10".parse().unwrap()));
        assert_eq!(
            unreverse_addr("1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa"),
            Some("2001:db8::1".parse().unwrap())
        );
        assert!(unreverse_addr("1.168.192.in-addr.arpa").is_none());
        assert!(unreverse_addr("example.com").is_none());
    }
}
