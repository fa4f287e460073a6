//! Synthesized responses: blocked, NXDOMAIN, SERVFAIL, rewrites.

use crate::config::ServerConfig;
use crate::filtering::{FilterResult, Reason};
use crate::types::{make_reply, BlockingMode};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, PTR, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const DEFAULT_BLOCKED_RESPONSE_TTL: u32 = 3600;

/// What to answer a filtered request with.
#[derive(Debug)]
pub enum BlockResponse {
    Ready(Message),
    /// The block page is a host name; resolve it and answer via [`Responder::gen_blocked_host_reply`].
    Redirect(String),
}

pub struct Responder<'a> {
    conf: &'a ServerConfig,
}

fn question_name(req: &Message) -> Name {
    req.queries().first().map(|q| q.name().clone()).unwrap_or_else(Name::root)
}

fn question_type(req: &Message) -> Option<RecordType> {
    req.queries().first().map(|q| q.query_type())
}

impl<'a> Responder<'a> {
    pub fn new(conf: &'a ServerConfig) -> Self { Self { conf } }

    fn ttl(&self) -> u32 { self.conf.blocked_response_ttl }

    /// Reply shell with RA set.
    pub fn make_response(&self, req: &Message) -> Message {
        let mut resp = make_reply(req);
        resp.set_recursion_available(true);
        resp
    }

    pub fn gen_server_failure(&self, req: &Message) -> Message {
        let mut resp = self.make_response(req);
        resp.set_response_code(ResponseCode::ServFail);
        resp
    }

    pub fn make_response_refused(&self, req: &Message) -> Message {
        let mut resp = self.make_response(req);
        resp.set_response_code(ResponseCode::Refused);
        resp
    }

    pub fn gen_a_answer(&self, req: &Message, ip: Ipv4Addr) -> Record {
        Record::from_rdata(question_name(req), self.ttl(), RData::A(A(ip)))
    }

    pub fn gen_aaaa_answer(&self, req: &Message, ip: Ipv6Addr) -> Record {
        Record::from_rdata(question_name(req), self.ttl(), RData::AAAA(AAAA(ip)))
    }

    pub fn gen_a_record(&self, req: &Message, ip: Ipv4Addr) -> Message {
        let mut resp = self.make_response(req);
        resp.add_answer(self.gen_a_answer(req, ip));
        resp
    }

    pub fn gen_aaaa_record(&self, req: &Message, ip: Ipv6Addr) -> Message {
        let mut resp = self.make_response(req);
        resp.add_answer(self.gen_aaaa_answer(req, ip));
        resp
    }

    /// Answers with `ip` when its family matches the question, otherwise an empty NOERROR.
    pub fn gen_response_with_ip(&self, req: &Message, ip: IpAddr) -> Message {
        match (question_type(req), ip) {
            (Some(RecordType::A), IpAddr::V4(v4)) => self.gen_a_record(req, v4),
            (Some(RecordType::A), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => self.gen_a_record(req, v4),
                None => self.make_response(req),
            },
            (Some(RecordType::AAAA), IpAddr::V6(v6)) if v6.to_ipv4_mapped().is_none() => self.gen_aaaa_record(req, v6),
            _ => self.make_response(req),
        }
    }

    /// 0.0.0.0 for A, :: for AAAA, empty NOERROR for anything else.
    pub fn make_response_null_ip(&self, req: &Message) -> Message {
        match question_type(req) {
            Some(RecordType::A) => self.gen_a_record(req, Ipv4Addr::UNSPECIFIED),
            Some(RecordType::AAAA) => self.gen_aaaa_record(req, Ipv6Addr::UNSPECIFIED),
            _ => self.make_response(req),
        }
    }

    pub fn gen_nxdomain(&self, req: &Message) -> Message {
        let mut resp = self.make_response(req);
        resp.set_response_code(ResponseCode::NXDomain);
        resp.add_name_server(self.gen_soa(req));
        resp
    }

    /// Negative-caching SOA for the question's zone.
    pub fn gen_soa(&self, req: &Message) -> Record {
        let zone = question_name(req);
        let zone_str = zone.to_ascii();
        let mut mbox = String::from("hostmaster.");
        if !zone_str.is_empty() && !zone_str.starts_with('.') {
            mbox.push_str(&zone_str);
        }
        let rname = Name::from_ascii(&mbox).unwrap_or_else(|_| Name::root());
        let mname = Name::from_ascii("fake-for-negative-caching.adguard.com.").unwrap_or_else(|_| Name::root());

        let ttl = if self.ttl() == 0 { DEFAULT_BLOCKED_RESPONSE_TTL } else { self.ttl() };
        let soa = SOA::new(mname, rname, 100500, 1800, 900, 604800, 86400);
        Record::from_rdata(zone, ttl, RData::SOA(soa))
    }

    pub fn gen_cname_answer(&self, req: &Message, target: Name) -> Record {
        Record::from_rdata(question_name(req), self.ttl(), RData::CNAME(CNAME(target)))
    }

    pub fn gen_ptr_answer(&self, req: &Message, host: Name) -> Record {
        Record::from_rdata(question_name(req), self.ttl(), RData::PTR(PTR(host)))
    }

    /// Response for a filtered request according to the verdict and the blocking mode.
    pub fn gen_block_response(&self, req: &Message, result: &FilterResult) -> BlockResponse {
        let qtype = question_type(req);
        if !matches!(qtype, Some(RecordType::A) | Some(RecordType::AAAA)) {
            if self.conf.blocking_mode == BlockingMode::NullIp {
                return BlockResponse::Ready(self.make_response(req));
            }
            return BlockResponse::Ready(self.gen_nxdomain(req));
        }

        match result.reason {
            Reason::FilteredSafeBrowsing => self.gen_blocked_host(req, &self.conf.safebrowsing_block_host),
            Reason::FilteredParental => self.gen_blocked_host(req, &self.conf.parental_block_host),
            _ => {
                if result.reason == Reason::FilteredSafeSearch {
                    if let Some(ip) = result.ip {
                        return BlockResponse::Ready(self.gen_response_with_ip(req, ip));
                    }
                }
                let resp = match self.conf.blocking_mode {
                    BlockingMode::NullIp => self.make_response_null_ip(req),
                    BlockingMode::CustomIp { ipv4, ipv6 } => match qtype {
                        Some(RecordType::A) => self.gen_a_record(req, ipv4),
                        _ => self.gen_aaaa_record(req, ipv6),
                    },
                    BlockingMode::NxDomain => self.gen_nxdomain(req),
                    BlockingMode::Refused => self.make_response_refused(req),
                    BlockingMode::Default => match result.ip {
                        Some(ip) => self.gen_response_with_ip(req, ip),
                        None => self.make_response_null_ip(req),
                    },
                };
                BlockResponse::Ready(resp)
            }
        }
    }

    fn gen_blocked_host(&self, req: &Message, host: &str) -> BlockResponse {
        match host.parse::<IpAddr>() {
            Ok(ip) => BlockResponse::Ready(self.gen_response_with_ip(req, ip)),
            Err(_) => BlockResponse::Redirect(host.to_string()),
        }
    }

    /// Answers of the block-page lookup, renamed to the original question.
    pub fn gen_blocked_host_reply(&self, req: &Message, resolved: &Message) -> Message {
        let name = question_name(req);
        let mut resp = self.make_response(req);
        for answer in resolved.answers() {
            let mut a = answer.clone();
            a.set_name(name.clone());
            resp.add_answer(a);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fqdn;
    use hickory_proto::op::Query;

    fn request(name: &str, qtype: RecordType) -> Message {
        let mut m = Message::new();
        m.set_id(99).set_recursion_desired(true);
        m.add_query(Query::query(fqdn(name).unwrap(), qtype));
        m
    }

    fn conf(mode: BlockingMode) -> ServerConfig {
        ServerConfig { blocking_mode: mode, blocked_response_ttl: 10, ..ServerConfig::default() }
    }

    fn blocked() -> FilterResult {
        FilterResult { reason: Reason::FilteredBlackList, rule: "||ads.example.com^".into(), ..FilterResult::default() }
    }

    fn ready(resp: BlockResponse) -> Message {
        match resp {
            BlockResponse::Ready(m) => m,
            BlockResponse::Redirect(h) => panic!("unexpected redirect to {}", h),
        }
    }

    #[test]
    fn null_ip_mode() {
        let c = conf(BlockingMode::NullIp);
        let r = Responder::new(&c);

        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::A), &blocked()));
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::UNSPECIFIED))));
        assert_eq!(resp.answers()[0].ttl(), 10);

        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::AAAA), &blocked()));
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].data(), Some(&RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED))));

        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::MX), &blocked()));
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
    }

    #[test]
    fn nxdomain_mode_has_soa() {
        let c = conf(BlockingMode::NxDomain);
        let resp = ready(Responder::new(&c).gen_block_response(&request("ads.example.com", RecordType::A), &blocked()));
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert!(resp.recursion_available());
        assert_eq!(resp.name_servers().len(), 1);
        match resp.name_servers()[0].data() {
            Some(RData::SOA(soa)) => {
                assert_eq!(soa.rname().to_ascii(), "hostmaster.ads.example.com.");
                assert_eq!(soa.serial(), 100500);
                assert_eq!(soa.minimum(), 86400);
            }
            other => panic!("expected SOA, got {:?}", other),
        }
    }

    #[test]
    fn soa_ttl_defaults_when_unset() {
        let c = conf(BlockingMode::NxDomain);
        let c = ServerConfig { blocked_response_ttl: 0, ..c };
        let soa = Responder::new(&c).gen_soa(&Message::new());
        assert_eq!(soa.ttl(), DEFAULT_BLOCKED_RESPONSE_TTL);
        let Some(RData::SOA(soa)) = soa.data() else { panic!("expected SOA") };
        assert_eq!(soa.rname().to_ascii(), "hostmaster.");
    }

    #[test]
    fn default_mode_uses_rule_ip_or_null_ip() {
        let c = conf(BlockingMode::Default);
        let r = Responder::new(&c);

        let with_ip = FilterResult { ip: Some("10.0.0.1".parse().unwrap()), ..blocked() };
        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::A), &with_ip));
        assert_eq!(resp.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::new(10, 0, 0, 1)))));

        // IPv4 rule address does not fit an AAAA question
        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::AAAA), &with_ip));
        assert!(resp.answers().is_empty());

        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::A), &blocked()));
        assert_eq!(resp.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::UNSPECIFIED))));

        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::TXT), &blocked()));
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn custom_ip_and_refused_modes() {
        let c = conf(BlockingMode::CustomIp { ipv4: Ipv4Addr::new(192, 168, 0, 1), ipv6: "fd00::1".parse().unwrap() });
        let r = Responder::new(&c);
        let resp = ready(r.gen_block_response(&request("ads.example.com", RecordType::AAAA), &blocked()));
        assert_eq!(resp.answers()[0].data(), Some(&RData::AAAA(AAAA("fd00::1".parse().unwrap()))));

        let c = conf(BlockingMode::Refused);
        let resp = ready(Responder::new(&c).gen_block_response(&request("ads.example.com", RecordType::A), &blocked()));
        assert_eq!(resp.response_code(), ResponseCode::Refused);
    }

    #[test]
    fn safebrowsing_redirects_to_block_host() {
        let c = ServerConfig { safebrowsing_block_host: "standard-block.dns.adguard.com".into(), ..conf(BlockingMode::Default) };
        let r = Responder::new(&c);
        let res = FilterResult { reason: Reason::FilteredSafeBrowsing, ..FilterResult::default() };
        let req = request("malware.example", RecordType::A);
        match r.gen_block_response(&req, &res) {
            BlockResponse::Redirect(host) => assert_eq!(host, "standard-block.dns.adguard.com"),
            BlockResponse::Ready(_) => panic!("expected redirect"),
        }

        let mut resolved = Message::new();
        resolved.add_answer(Record::from_rdata(fqdn("standard-block.dns.adguard.com").unwrap(), 30, RData::A(A(Ipv4Addr::new(94, 140, 14, 35)))));
        let reply = r.gen_blocked_host_reply(&req, &resolved);
        assert_eq!(reply.id(), 99);
        assert_eq!(reply.answers()[0].name().to_ascii(), "malware.example.");

        let c = ServerConfig { parental_block_host: "1.2.3.4".into(), ..conf(BlockingMode::Default) };
        let res = FilterResult { reason: Reason::FilteredParental, ..FilterResult::default() };
        let resp = ready(Responder::new(&c).gen_block_response(&req, &res));
        assert_eq!(resp.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))));
    }

    #[test]
    fn safe_search_ip_wins_over_blocking_mode() {
        let c = conf(BlockingMode::NxDomain);
        let res = FilterResult { reason: Reason::FilteredSafeSearch, ip: Some("216.239.38.120".parse().unwrap()), ..FilterResult::default() };
        let resp = ready(Responder::new(&c).gen_block_response(&request("www.google.com", RecordType::A), &res));
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::new(216, 239, 38, 120)))));
    }

    #[test]
    fn server_failure_sets_ra() {
        let c = conf(BlockingMode::Default);
        let resp = Responder::new(&c).gen_server_failure(&request("x.example", RecordType::A));
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert!(resp.recursion_available());
        assert_eq!(resp.id(), 99);
    }
}
