//! Client allow/deny lists and blocked query names, checked before the pipeline runs.

use anyhow::{Context, Result};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

#[derive(Debug, Default)]
struct ClientList {
    ips: HashSet<IpAddr>,
    nets: Vec<IpNet>,
}

impl ClientList {
    fn parse(entries: &[String]) -> Result<Self> {
        let mut list = ClientList::default();
        for e in entries {
            let e = e.trim();
            if e.is_empty() { continue; }
            if let Ok(ip) = e.parse::<IpAddr>() {
                list.ips.insert(ip);
                continue;
            }
            let net = e.parse::<IpNet>().with_context(|| format!("invalid client address or CIDR '{}'", e))?;
            list.nets.push(net);
        }
        Ok(list)
    }

    fn is_empty(&self) -> bool { self.ips.is_empty() && self.nets.is_empty() }

    /// Returns the matching list entry.
    fn matches(&self, ip: IpAddr) -> Option<String> {
        if self.ips.contains(&ip) { return Some(ip.to_string()); }
        self.nets.iter().find(|n| n.contains(&ip)).map(|n| n.to_string())
    }
}

#[derive(Debug, Default)]
pub struct Access {
    allowed: ClientList,
    disallowed: ClientList,
    /// Exact names, lowercase, no trailing dot.
    blocked_hosts: HashSet<String>,
    /// Suffixes from `*.domain` and `||domain^` entries.
    blocked_suffixes: Vec<String>,
}

impl Access {
    pub fn new(allowed: &[String], disallowed: &[String], blocked_hosts: &[String]) -> Result<Self> {
        let mut access = Access {
            allowed: ClientList::parse(allowed)?,
            disallowed: ClientList::parse(disallowed)?,
            ..Default::default()
        };
        for h in blocked_hosts {
            let h = h.trim().trim_end_matches('.').to_lowercase();
            if h.is_empty() { continue; }
            if let Some(s) = h.strip_prefix("*.") {
                access.blocked_suffixes.push(s.to_string());
            } else if let Some(s) = h.strip_prefix("||").and_then(|s| s.strip_suffix('^')) {
                access.blocked_hosts.insert(s.to_string());
                access.blocked_suffixes.push(s.to_string());
            } else {
                access.blocked_hosts.insert(h);
            }
        }
        Ok(access)
    }

    /// With an allow list, anything outside it is blocked; otherwise only the deny list applies.
    pub fn is_blocked_ip(&self, ip: IpAddr) -> (bool, String) {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        if !self.allowed.is_empty() {
            return match self.allowed.matches(ip) {
                Some(_) => (false, String::new()),
                None => (true, String::new()),
            };
        }
        match self.disallowed.matches(ip) {
            Some(rule) => (true, rule),
            None => (false, String::new()),
        }
    }

    pub fn is_blocked_domain(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        if self.blocked_hosts.contains(&host) { return true; }
        self.blocked_suffixes.iter().any(|s| host.len() > s.len() && host.ends_with(s.as_str()) && host.as_bytes()[host.len() - s.len() - 1] == b'.')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn allow_list_blocks_everything_else() {
        let a = Access::new(&strings(&["127.0.0.1", "192.168.1.0/24"]), &strings(&["192.168.1.5"]), &[]).unwrap();
        assert_eq!(a.is_blocked_ip("127.0.0.1".parse().unwrap()), (false, String::new()));
        assert_eq!(a.is_blocked_ip("192.168.1.5".parse().unwrap()), (false, String::new()));
        assert_eq!(a.is_blocked_ip("10.0.0.1".parse().unwrap()), (true, String::new()));
    }

    #[test]
    fn deny_list_reports_rule() {
        let a = Access::new(&[], &strings(&["10.0.0.7", "172.16.0.0/12", "2001:db8::/32"]), &[]).unwrap();
        assert_eq!(a.is_blocked_ip("10.0.0.7".parse().unwrap()), (true, "10.0.0.7".to_string()));
        assert_eq!(a.is_blocked_ip("172.20.1.1".parse().unwrap()), (true, "172.16.0.0/12".to_string()));
        assert_eq!(a.is_blocked_ip("::ffff:10.0.0.7".parse().unwrap()), (true, "10.0.0.7".to_string()));
        assert!(a.is_blocked_ip("2001:db8::1".parse().unwrap()).0);
        assert!(!a.is_blocked_ip("8.8.8.8".parse().unwrap()).0);
    }

    #[test]
    fn blocked_domains() {
        let a = Access::new(&[], &[], &strings(&["version.bind", "*.tracker.test", "||ads.test^"])).unwrap();
        assert!(a.is_blocked_domain("VERSION.BIND."));
        assert!(!a.is_blocked_domain("bind"));
        assert!(a.is_blocked_domain("x.tracker.test"));
        assert!(!a.is_blocked_domain("tracker.test"));
        assert!(a.is_blocked_domain("ads.test"));
        assert!(a.is_blocked_domain("cdn.ads.test"));
        assert!(!a.is_blocked_domain("badads.test"));
    }

    #[test]
    fn invalid_entry() {
        assert!(Access::new(&strings(&["not-an-ip"]), &[], &[]).is_err());
    }
}
