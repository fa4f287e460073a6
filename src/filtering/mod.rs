//! Filtering verdicts and the engine interface the pipeline consumes.

pub mod rules;

pub use rules::RuleFilter;

use anyhow::Result;
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use std::net::IpAddr;

/// Why a host was (or was not) filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reason {
    #[default]
    NotFilteredNotFound,
    NotFilteredWhiteList,
    FilteredBlackList,
    FilteredSafeBrowsing,
    FilteredParental,
    FilteredSafeSearch,
    FilteredInvalid,
    Rewrite,
}

impl Reason {
    pub fn is_filtered(&self) -> bool {
        match self {
            Reason::FilteredBlackList
            | Reason::FilteredSafeBrowsing
            | Reason::FilteredParental
            | Reason::FilteredSafeSearch
            | Reason::FilteredInvalid => true,
            Reason::NotFilteredNotFound | Reason::NotFilteredWhiteList | Reason::Rewrite => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::NotFilteredNotFound => "NotFilteredNotFound",
            Reason::NotFilteredWhiteList => "NotFilteredWhiteList",
            Reason::FilteredBlackList => "FilteredBlackList",
            Reason::FilteredSafeBrowsing => "FilteredSafeBrowsing",
            Reason::FilteredParental => "FilteredParental",
            Reason::FilteredSafeSearch => "FilteredSafeSearch",
            Reason::FilteredInvalid => "FilteredInvalid",
            Reason::Rewrite => "Rewrite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterResult {
    pub reason: Reason,
    /// Original rule text.
    pub rule: String,
    pub filter_id: i64,
    /// Address from a hosts-style rule or the safe-search table.
    pub ip: Option<IpAddr>,
    /// Rewrite answers.
    pub ip_list: Vec<IpAddr>,
    /// Rewrite CNAME target.
    pub canon_name: Option<String>,
}

impl FilterResult {
    pub fn is_filtered(&self) -> bool { self.reason.is_filtered() }
}

/// Per-client filtering switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFilteringSettings {
    pub filtering_enabled: bool,
    pub safe_search_enabled: bool,
    pub safe_browsing_enabled: bool,
    pub parental_enabled: bool,
}

impl Default for RequestFilteringSettings {
    fn default() -> Self {
        Self { filtering_enabled: true, safe_search_enabled: false, safe_browsing_enabled: false, parental_enabled: false }
    }
}

pub trait FilteringEngine: Send + Sync {
    /// Engine-wide defaults, before per-client overrides.
    fn settings(&self) -> RequestFilteringSettings;

    /// Rewrites, filter lists, then safe search, safe browsing and parental control.
    fn check_host(&self, host: &str, qtype: RecordType, setts: &RequestFilteringSettings) -> Result<FilterResult>;

    /// Filter lists only. Used for names and addresses found in upstream answers.
    fn check_host_rules(&self, host: &str, qtype: RecordType, setts: &RequestFilteringSettings) -> Result<FilterResult>;

    /// Scans CNAME, A and AAAA answers; the first filtered match wins.
    fn check_host_response(&self, resp: &Message, setts: &RequestFilteringSettings) -> Result<Option<FilterResult>> {
        let qtype = resp.queries().first().map(|q| q.query_type()).unwrap_or(RecordType::A);
        for answer in resp.answers() {
            let host = match answer.data() {
                Some(RData::CNAME(cname)) => {
                    let target = cname.0.to_ascii();
                    target.strip_suffix('.').unwrap_or(&target).to_string()
                }
                Some(RData::A(a)) => a.0.to_string(),
                Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
                _ => continue,
            };
            tracing::debug!("Checking {} record {} for {}", answer.record_type(), host, answer.name());

            let res = self.check_host_rules(&host, qtype, setts)?;
            if res.is_filtered() {
                return Ok(Some(res));
            }
        }
        Ok(None)
    }
}
