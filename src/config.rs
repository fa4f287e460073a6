//! Corefile-style configuration for dnsguard

use crate::types::BlockingMode;
use crate::upstream::{UpstreamConfig, DEFAULT_TIMEOUT};
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;

pub const DEFAULT_UPSTREAM: &str = "https://dns10.quad9.net/dns-query";
pub const DEFAULT_BOOTSTRAP: &[&str] = &["9.9.9.10", "149.112.112.10", "2620:fe::10", "2620:fe::fe:10"];
pub const DEFAULT_BLOCKED_HOSTS: &[&str] = &["version.bind", "id.server", "hostname.bind"];

#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<Directive>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilteringConfig {
    pub rule_files: Vec<String>,
    pub rules: Vec<String>,
    /// (domain, IP or CNAME target)
    pub rewrites: Vec<(String, String)>,
    pub safe_search: bool,
    pub safe_browsing: bool,
    pub parental: bool,
    pub safe_browsing_domains: Vec<String>,
    pub parental_domains: Vec<String>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_host: IpAddr,
    pub port: u16,

    pub upstream_dns: Vec<String>,
    pub bootstrap_dns: Vec<String>,
    pub upstream_timeout: Duration,
    /// Prebuilt upstreams used instead of parsing `upstream_dns`.
    pub upstream_config: Option<Arc<UpstreamConfig>>,

    pub protection_enabled: bool,
    pub blocking_mode: BlockingMode,
    pub blocked_response_ttl: u32,
    pub parental_block_host: String,
    pub safebrowsing_block_host: String,
    pub filtering: FilteringConfig,

    pub enable_dnssec: bool,
    pub aaaa_disabled: bool,
    pub refuse_any: bool,
    pub cache_enabled: bool,

    pub ratelimit: u32,
    pub ratelimit_whitelist: Vec<String>,
    /// 0 means unbounded.
    pub max_goroutines: usize,

    pub allowed_clients: Vec<String>,
    pub disallowed_clients: Vec<String>,
    pub blocked_hosts: Vec<String>,

    pub querylog_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 53,
            upstream_dns: Vec::new(),
            bootstrap_dns: DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
            upstream_timeout: DEFAULT_TIMEOUT,
            upstream_config: None,
            protection_enabled: true,
            blocking_mode: BlockingMode::Default,
            blocked_response_ttl: 10,
            parental_block_host: "family-block.dns.adguard.com".to_string(),
            safebrowsing_block_host: "standard-block.dns.adguard.com".to_string(),
            filtering: FilteringConfig::default(),
            enable_dnssec: false,
            aaaa_disabled: false,
            refuse_any: false,
            cache_enabled: true,
            ratelimit: 0,
            ratelimit_whitelist: Vec::new(),
            max_goroutines: 0,
            allowed_clients: Vec::new(),
            disallowed_clients: Vec::new(),
            blocked_hosts: DEFAULT_BLOCKED_HOSTS.iter().map(|s| s.to_string()).collect(),
            querylog_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr { SocketAddr::new(self.bind_host, self.port) }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReloadConfig {
    pub interval: Duration,
    pub jitter: Duration,
}

#[derive(Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// Metrics listen address.
    pub prometheus: Option<String>,
    pub reload: Option<ReloadConfig>,
}

#[derive(Debug, PartialEq)]
enum Token { Text(String), OpenBrace, CloseBrace, Newline }

struct ServerBlock { name: String, directives: Vec<Directive> }

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let tokens = Self::lex(content);
        let mut blocks = Self::parse_tokens(&tokens)?;
        if blocks.len() > 1 {
            tracing::warn!("Only the first server block is used, ignoring {} more", blocks.len() - 1);
        }
        if blocks.is_empty() { anyhow::bail!("no server block found in configuration"); }
        let block = blocks.swap_remove(0);

        let mut cfg = Config { server: ServerConfig::default(), prometheus: None, reload: None };
        if let Some(idx) = block.name.rfind(':') {
            cfg.server.port = block.name[idx + 1..].parse()
                .with_context(|| format!("invalid port in server block '{}'", block.name))?;
        }
        for d in &block.directives {
            cfg.apply(d).with_context(|| format!("invalid directive '{}'", d.name))?;
        }
        Ok(cfg)
    }

    fn apply(&mut self, d: &Directive) -> Result<()> {
        let s = &mut self.server;
        match d.name.as_str() {
            "upstream" => s.upstream_dns.extend(d.args.iter().cloned()),
            "upstream_file" => {
                let path = first_arg(d)?;
                let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read upstream file {}", path))?;
                s.upstream_dns.extend(text.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()));
            }
            "bootstrap" => s.bootstrap_dns = d.args.clone(),
            "upstream_timeout" => s.upstream_timeout = parse_duration(first_arg(d)?)?,
            "protection" => s.protection_enabled = flag(d)?,
            "blocking_mode" => s.blocking_mode = BlockingMode::parse(first_arg(d)?, &d.args[1..])?,
            "blocked_response_ttl" => s.blocked_response_ttl = first_arg(d)?.parse()?,
            "parental_block_host" => s.parental_block_host = first_arg(d)?.to_string(),
            "safebrowsing_block_host" => s.safebrowsing_block_host = first_arg(d)?.to_string(),
            "dnssec" => s.enable_dnssec = flag(d)?,
            "aaaa_disabled" => s.aaaa_disabled = flag(d)?,
            "refuse_any" => s.refuse_any = flag(d)?,
            "cache" => s.cache_enabled = flag(d)?,
            "querylog" => s.querylog_enabled = flag(d)?,
            "max_goroutines" => s.max_goroutines = first_arg(d)?.parse()?,
            "ratelimit" => {
                s.ratelimit = first_arg(d)?.parse()?;
                for sub in &d.block {
                    match sub.name.as_str() {
                        "whitelist" => s.ratelimit_whitelist.extend(sub.args.iter().cloned()),
                        other => anyhow::bail!("unknown ratelimit option '{}'", other),
                    }
                }
            }
            "access" => {
                for sub in &d.block {
                    match sub.name.as_str() {
                        "allowed" => s.allowed_clients.extend(sub.args.iter().cloned()),
                        "disallowed" => s.disallowed_clients.extend(sub.args.iter().cloned()),
                        "blocked_hosts" => s.blocked_hosts = sub.args.clone(),
                        other => anyhow::bail!("unknown access option '{}'", other),
                    }
                }
            }
            "filter" => {
                let f = &mut s.filtering;
                for sub in &d.block {
                    match sub.name.as_str() {
                        "rules" => f.rule_files.extend(sub.args.iter().cloned()),
                        "rule" => f.rules.push(sub.args.join(" ")),
                        "rewrite" => {
                            if sub.args.len() != 2 { anyhow::bail!("rewrite needs a domain and an answer"); }
                            f.rewrites.push((sub.args[0].clone(), sub.args[1].clone()));
                        }
                        "safesearch" => f.safe_search = true,
                        "safebrowsing" => { f.safe_browsing = true; f.safe_browsing_domains.extend(sub.args.iter().cloned()); }
                        "parental" => { f.parental = true; f.parental_domains.extend(sub.args.iter().cloned()); }
                        other => anyhow::bail!("unknown filter option '{}'", other),
                    }
                }
            }
            "prometheus" => {
                let mut addr = d.args.first().cloned().unwrap_or_else(|| ":9153".to_string());
                if !addr.contains(':') { addr = format!(":{}", addr); }
                if addr.starts_with(':') { addr = format!("0.0.0.0{}", addr); }
                self.prometheus = Some(addr);
            }
            "reload" => {
                let mut interval = Duration::from_secs(30);
                let mut jitter = Duration::from_secs(15);
                if let Some(a) = d.args.first() { interval = parse_duration(a)?.max(Duration::from_secs(2)); }
                if let Some(a) = d.args.get(1) { jitter = parse_duration(a)?.max(Duration::from_secs(1)); }
                if jitter > interval / 2 { jitter = interval / 2; }
                self.reload = Some(ReloadConfig { interval, jitter });
            }
            other => anyhow::bail!("unknown directive '{}'", other),
        }
        Ok(())
    }

    fn lex(input: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == '\n' { tokens.push(Token::Newline); chars.next(); }
            else if c.is_whitespace() { chars.next(); }
            else if c == '#' { while let Some(&c) = chars.peek() { if c == '\n' { break; } chars.next(); } }
            else if c == '{' { tokens.push(Token::OpenBrace); chars.next(); }
            else if c == '}' { tokens.push(Token::CloseBrace); chars.next(); }
            else if c == '"' {
                chars.next();
                let mut s = String::new();
                while let Some(&c) = chars.peek() { if c == '"' { chars.next(); break; } s.push(c); chars.next(); }
                tokens.push(Token::Text(s));
            } else {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '{' || c == '}' || c == '"' { break; }
                    s.push(c); chars.next();
                }
                tokens.push(Token::Text(s));
            }
        }
        tokens
    }

    fn parse_tokens(tokens: &[Token]) -> Result<Vec<ServerBlock>> {
        let mut i = 0;
        let mut blocks = Vec::new();
        let mut names = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Text(s) => { names.push(s.clone()); i += 1; }
                Token::OpenBrace => {
                    i += 1;
                    let (directives, next_i) = Self::parse_block(tokens, i)?;
                    i = next_i;
                    if names.is_empty() { anyhow::bail!("server block without a name"); }
                    for name in names.drain(..) { blocks.push(ServerBlock { name, directives: directives.clone() }); }
                }
                Token::Newline => { i += 1; names.clear(); }
                Token::CloseBrace => anyhow::bail!("unexpected '}}'"),
            }
        }
        Ok(blocks)
    }

    /// Parse a block body starting at position i, up to and including its closing brace
    fn parse_block(tokens: &[Token], mut i: usize) -> Result<(Vec<Directive>, usize)> {
        let mut directives = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Newline => { i += 1; }
                Token::CloseBrace => { i += 1; return Ok((directives, i)); }
                Token::Text(name) => {
                    let name = name.clone(); i += 1;
                    let mut args = Vec::new();
                    let mut block = Vec::new();
                    while i < tokens.len() {
                        match &tokens[i] {
                            Token::Text(arg) => { args.push(arg.clone()); i += 1; }
                            Token::OpenBrace => {
                                i += 1;
                                let (sub_block, next_i) = Self::parse_block(tokens, i)?;
                                block = sub_block; i = next_i; break;
                            }
                            Token::Newline | Token::CloseBrace => { break; }
                        }
                    }
                    directives.push(Directive { name, args, block });
                }
                Token::OpenBrace => anyhow::bail!("unexpected '{{'"),
            }
        }
        anyhow::bail!("missing closing '}}'")
    }
}

fn first_arg(d: &Directive) -> Result<&str> {
    d.args.first().map(|s| s.as_str()).ok_or_else(|| anyhow::anyhow!("'{}' needs an argument", d.name))
}

fn flag(d: &Directive) -> Result<bool> {
    match d.args.first().map(|s| s.to_lowercase()).as_deref() {
        None | Some("on") | Some("true") | Some("yes") => Ok(true),
        Some("off") | Some("false") | Some("no") => Ok(false),
        Some(other) => anyhow::bail!("expected on or off, got '{}'", other),
    }
}

pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") { Ok(Duration::from_millis(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('s') { Ok(Duration::from_secs(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('m') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 60)) }
    else if let Some(stripped) = s.strip_suffix('h') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 3600)) }
    else { anyhow::bail!("invalid duration '{}'", s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COREFILE: &str = r#"
# home resolver
.:5353 {
    upstream tls://dns.quad9.net https://dns10.quad9.net/dns-query
    upstream "[/lan/]192.168.1.1"
    bootstrap 9.9.9.10
    upstream_timeout 5s
    blocking_mode custom_ip 10.0.0.1 ::1
    blocked_response_ttl 60
    dnssec
    aaaa_disabled off
    refuse_any on
    ratelimit 20 {
        whitelist 127.0.0.1
    }
    max_goroutines 300
    access {
        allowed 192.168.1.0/24 127.0.0.1
        blocked_hosts version.bind
    }
    filter {
        rule "||ads.example.com^"
        rewrite nas.home 192.168.1.10
        safesearch
        parental adult.test
    }
    querylog off
    prometheus :9253
    reload 10s 2s
}
"#;

    #[test]
    fn full_corefile() {
        let cfg = Config::parse(COREFILE).unwrap();
        let s = &cfg.server;
        assert_eq!(s.port, 5353);
        assert_eq!(s.upstream_dns, vec!["tls://dns.quad9.net", "https://dns10.quad9.net/dns-query", "[/lan/]192.168.1.1"]);
        assert_eq!(s.bootstrap_dns, vec!["9.9.9.10"]);
        assert_eq!(s.upstream_timeout, Duration::from_secs(5));
        assert_eq!(s.blocking_mode, BlockingMode::CustomIp { ipv4: Ipv4Addr::new(10, 0, 0, 1), ipv6: "::1".parse().unwrap() });
        assert_eq!(s.blocked_response_ttl, 60);
        assert!(s.enable_dnssec);
        assert!(!s.aaaa_disabled);
        assert!(s.refuse_any);
        assert_eq!(s.ratelimit, 20);
        assert_eq!(s.ratelimit_whitelist, vec!["127.0.0.1"]);
        assert_eq!(s.max_goroutines, 300);
        assert_eq!(s.allowed_clients, vec!["192.168.1.0/24", "127.0.0.1"]);
        assert_eq!(s.blocked_hosts, vec!["version.bind"]);
        assert_eq!(s.filtering.rules, vec!["||ads.example.com^"]);
        assert_eq!(s.filtering.rewrites, vec![("nas.home".to_string(), "192.168.1.10".to_string())]);
        assert!(s.filtering.safe_search);
        assert!(s.filtering.parental);
        assert_eq!(s.filtering.parental_domains, vec!["adult.test"]);
        assert!(!s.querylog_enabled);
        assert_eq!(cfg.prometheus.as_deref(), Some("0.0.0.0:9253"));
        assert_eq!(cfg.reload, Some(ReloadConfig { interval: Duration::from_secs(10), jitter: Duration::from_secs(2) }));
    }

    #[test]
    fn defaults() {
        let cfg = Config::parse(".:53 {\n}\n").unwrap();
        let s = &cfg.server;
        assert!(s.protection_enabled);
        assert!(s.cache_enabled);
        assert!(s.upstream_dns.is_empty());
        assert_eq!(s.bootstrap_dns.len(), 4);
        assert_eq!(s.blocked_hosts, vec!["version.bind", "id.server", "hostname.bind"]);
        assert_eq!(s.safebrowsing_block_host, "standard-block.dns.adguard.com");
        assert!(cfg.prometheus.is_none());
    }

    #[test]
    fn errors() {
        assert!(Config::parse("").is_err());
        assert!(Config::parse(".:53 {\n  bogus 1\n}\n").is_err());
        assert!(Config::parse(".:53 {\n  blocking_mode custom_ip 10.0.0.1\n}\n").is_err());
        assert!(Config::parse(".:53 {\n  dnssec maybe\n}\n").is_err());
        assert!(Config::parse(".:53 {\n  upstream 8.8.8.8\n").is_err());
        assert!(Config::parse(".:abc {\n}\n").is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
    }
}
