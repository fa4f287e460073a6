//! Rule-list filtering engine.
//!
//! Understands the common subset of adblock and hosts syntax:
//! `||example.org^`, `@@||example.org^`, `/regex/`, `0.0.0.0 example.org` and bare
//! `example.org`. Lines starting with `!` or `#` are comments.

use crate::config::FilteringConfig;
use crate::filtering::{FilterResult, FilteringEngine, Reason, RequestFilteringSettings};
use anyhow::{Context, Result};
use hickory_proto::rr::RecordType;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Hosts redirected for safe search.
const SAFE_SEARCH: &[(&str, &str)] = &[
    ("www.google.com", "216.239.38.120"),
    ("google.com", "216.239.38.120"),
    ("www.youtube.com", "216.239.38.119"),
    ("m.youtube.com", "216.239.38.119"),
    ("youtube.com", "216.239.38.119"),
    ("www.bing.com", "204.79.197.220"),
    ("bing.com", "204.79.197.220"),
    ("yandex.ru", "213.180.193.56"),
    ("www.yandex.ru", "213.180.193.56"),
];

#[derive(Debug, Clone)]
struct Rule {
    text: String,
    filter_id: i64,
}

#[derive(Default)]
pub struct RuleFilter {
    settings: RequestFilteringSettings,
    blocked: HashMap<String, Rule>,
    allowed: HashMap<String, Rule>,
    hosts: HashMap<String, Vec<(IpAddr, Rule)>>,
    regexes: Vec<(Regex, Rule)>,
    /// Domain -> IP or CNAME target, in configuration order.
    rewrites: Vec<(String, String)>,
    safe_browsing: HashSet<String>,
    parental: HashSet<String>,
}

fn suffix_match<'a, T>(map: &'a HashMap<String, T>, host: &str) -> Option<&'a T> {
    let mut current = host;
    loop {
        if let Some(v) = map.get(current) { return Some(v); }
        match current.find('.') {
            Some(pos) => current = &current[pos + 1..],
            None => return None,
        }
    }
}

fn suffix_contains(set: &HashSet<String>, host: &str) -> Option<String> {
    let mut current = host;
    loop {
        if set.contains(current) { return Some(current.to_string()); }
        match current.find('.') {
            Some(pos) => current = &current[pos + 1..],
            None => return None,
        }
    }
}

impl RuleFilter {
    pub fn new(settings: RequestFilteringSettings) -> Self {
        Self { settings, ..Self::default() }
    }

    pub fn from_config(conf: &FilteringConfig) -> Result<Self> {
        let mut filter = RuleFilter::new(RequestFilteringSettings {
            filtering_enabled: true,
            safe_search_enabled: conf.safe_search,
            safe_browsing_enabled: conf.safe_browsing,
            parental_enabled: conf.parental,
        });

        let mut filter_id = 0;
        filter.add_rules(&conf.rules.join("\n"), filter_id);
        for path in &conf.rule_files {
            filter_id += 1;
            let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read filter list {}", path))?;
            let n = filter.add_rules(&text, filter_id);
            tracing::info!("[filter] Loaded {} rules from {} (id {})", n, path, filter_id);
        }
        for (domain, answer) in &conf.rewrites {
            filter.add_rewrite(domain, answer);
        }
        for d in &conf.safe_browsing_domains { filter.safe_browsing.insert(d.trim_end_matches('.').to_lowercase()); }
        for d in &conf.parental_domains { filter.parental.insert(d.trim_end_matches('.').to_lowercase()); }
        Ok(filter)
    }

    /// Adds every rule line of `text`, returning how many were understood.
    pub fn add_rules(&mut self, text: &str, filter_id: i64) -> usize {
        let mut count = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('#') { continue; }
            if self.add_rule(line, filter_id) {
                count += 1;
            } else {
                tracing::debug!("[filter] Skipping unsupported rule: {}", line);
            }
        }
        count
    }

    fn add_rule(&mut self, line: &str, filter_id: i64) -> bool {
        let rule = Rule { text: line.to_string(), filter_id };

        if let Some(rest) = line.strip_prefix("@@||") {
            let Some(domain) = rest.strip_suffix('^') else { return false };
            self.allowed.insert(domain.to_lowercase(), rule);
            return true;
        }
        if let Some(rest) = line.strip_prefix("||") {
            let Some(domain) = rest.strip_suffix('^') else { return false };
            self.blocked.insert(domain.to_lowercase(), rule);
            return true;
        }
        if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
            return match Regex::new(&format!("(?i){}", &line[1..line.len() - 1])) {
                Ok(re) => { self.regexes.push((re, rule)); true }
                Err(_) => false,
            };
        }

        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else { return false };
        if let Ok(ip) = first.parse::<IpAddr>() {
            let mut added = false;
            for host in parts.take_while(|p| !p.starts_with('#')) {
                self.hosts.entry(host.to_lowercase()).or_default().push((ip, rule.clone()));
                added = true;
            }
            return added;
        }
        if parts.next().is_none() && first.contains('.') && first.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_') {
            self.blocked.insert(first.to_lowercase(), rule);
            return true;
        }
        false
    }

    pub fn add_rewrite(&mut self, domain: &str, answer: &str) {
        self.rewrites.push((domain.trim_end_matches('.').to_lowercase(), answer.trim_end_matches('.').to_string()));
    }

    fn process_rewrites(&self, host: &str, qtype: RecordType) -> FilterResult {
        let mut res = FilterResult::default();
        let mut host = host.to_string();

        if let Some((_, target)) = self.rewrites.iter().find(|(d, a)| *d == host && a.parse::<IpAddr>().is_err()) {
            tracing::debug!("Rewrite: CNAME for {} is {}", host, target);
            host = target.to_lowercase();
            res.canon_name = Some(target.clone());
            res.reason = Reason::Rewrite;
        }

        for (domain, answer) in &self.rewrites {
            if *domain != host { continue; }
            let Ok(ip) = answer.parse::<IpAddr>() else { continue };
            match (qtype, ip) {
                (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_)) => res.ip_list.push(ip),
                _ => {}
            }
        }
        if !res.ip_list.is_empty() {
            res.reason = Reason::Rewrite;
        }
        res
    }

    fn match_host(&self, host: &str, qtype: RecordType) -> FilterResult {
        let hit = |reason: Reason, rule: &Rule, ip: Option<IpAddr>| FilterResult {
            reason,
            rule: rule.text.clone(),
            filter_id: rule.filter_id,
            ip,
            ..FilterResult::default()
        };

        if let Some(rule) = suffix_match(&self.allowed, host) {
            return hit(Reason::NotFilteredWhiteList, rule, None);
        }
        if let Some(entries) = self.hosts.get(host) {
            let wanted_v6 = qtype == RecordType::AAAA;
            let (ip, rule) = entries.iter()
                .find(|(ip, _)| ip.is_ipv6() == wanted_v6)
                .unwrap_or(&entries[0]);
            return hit(Reason::FilteredBlackList, rule, Some(*ip));
        }
        if let Some(rule) = suffix_match(&self.blocked, host) {
            return hit(Reason::FilteredBlackList, rule, None);
        }
        if let Some((_, rule)) = self.regexes.iter().find(|(re, _)| re.is_match(host)) {
            return hit(Reason::FilteredBlackList, rule, None);
        }
        FilterResult::default()
    }
}

impl FilteringEngine for RuleFilter {
    fn settings(&self) -> RequestFilteringSettings { self.settings }

    fn check_host(&self, host: &str, qtype: RecordType, setts: &RequestFilteringSettings) -> Result<FilterResult> {
        if host.is_empty() { return Ok(FilterResult::default()); }
        let host = host.to_lowercase();

        let res = self.process_rewrites(&host, qtype);
        if res.reason == Reason::Rewrite { return Ok(res); }

        if setts.filtering_enabled {
            let res = self.match_host(&host, qtype);
            if res.reason != Reason::NotFilteredNotFound { return Ok(res); }
        }

        if setts.safe_search_enabled {
            if let Some((_, ip)) = SAFE_SEARCH.iter().find(|(h, _)| *h == host) {
                return Ok(FilterResult {
                    reason: Reason::FilteredSafeSearch,
                    rule: host.clone(),
                    ip: ip.parse().ok(),
                    ..FilterResult::default()
                });
            }
        }
        if setts.safe_browsing_enabled {
            if let Some(rule) = suffix_contains(&self.safe_browsing, &host) {
                return Ok(FilterResult { reason: Reason::FilteredSafeBrowsing, rule, ..FilterResult::default() });
            }
        }
        if setts.parental_enabled {
            if let Some(rule) = suffix_contains(&self.parental, &host) {
                return Ok(FilterResult { reason: Reason::FilteredParental, rule, ..FilterResult::default() });
            }
        }
        Ok(FilterResult::default())
    }

    fn check_host_rules(&self, host: &str, qtype: RecordType, setts: &RequestFilteringSettings) -> Result<FilterResult> {
        if !setts.filtering_enabled || host.is_empty() { return Ok(FilterResult::default()); }
        Ok(self.match_host(&host.to_lowercase(), qtype))
    }
}
