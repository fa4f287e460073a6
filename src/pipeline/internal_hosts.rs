use crate::dhcp::unreverse_addr;
use crate::pipeline::{DnsContext, Outcome, Stage};
use crate::types::fqdn;
use hickory_proto::rr::RecordType;

const LOCAL_SUFFIX: &str = ".lan.";

/// Answers A/AAAA for `<host>.lan` from the DHCP leases. AAAA gets an empty answer.
pub struct InternalHosts;

#[async_trait::async_trait]
impl Stage for InternalHosts {
    fn name(&self) -> &'static str { "internal_hosts" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        let Some(q) = ctx.req.queries().first() else { return Outcome::Continue };
        let qtype = q.query_type();
        if ctx.resp.is_some() || !matches!(qtype, RecordType::A | RecordType::AAAA) {
            return Outcome::Continue;
        }

        let name = q.name().to_ascii().to_lowercase();
        let Some(host) = name.strip_suffix(LOCAL_SUFFIX) else { return Outcome::Continue };
        let Some(ip) = ctx.services.leases.ip_of(host) else { return Outcome::Continue };
        tracing::debug!("internal record: {} -> {}", name, ip);

        let responder = ctx.responder();
        let mut resp = responder.make_response(&ctx.req);
        if qtype == RecordType::A {
            resp.add_answer(responder.gen_a_answer(&ctx.req, ip));
        }
        ctx.resp = Some(resp);
        Outcome::Continue
    }
}

/// Answers PTR for addresses leased by the DHCP server.
pub struct InternalIpAddrs;

#[async_trait::async_trait]
impl Stage for InternalIpAddrs {
    fn name(&self) -> &'static str { "internal_ip_addrs" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        let Some(q) = ctx.req.queries().first() else { return Outcome::Continue };
        if ctx.resp.is_some() || q.query_type() != RecordType::PTR {
            return Outcome::Continue;
        }

        let arpa = q.name().to_ascii();
        let Some(ip) = unreverse_addr(&arpa) else { return Outcome::Continue };
        let Some(host) = ctx.services.leases.host_of(ip) else { return Outcome::Continue };
        let Ok(target) = fqdn(&host) else { return Outcome::Continue };
        tracing::debug!("reverse-lookup: {} -> {}", arpa, host);

        let responder = ctx.responder();
        let mut resp = responder.make_response(&ctx.req);
        resp.add_answer(responder.gen_ptr_answer(&ctx.req, target));
        ctx.resp = Some(resp);
        Outcome::Continue
    }
}
