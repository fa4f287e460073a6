use crate::cache::ResponseCache;
use crate::pipeline::{DnsContext, Outcome, Stage};
use crate::stats::{rcode_to_str, UPSTREAM_REQUEST_DURATION};
use crate::types::{first_question, host_of};
use crate::upstream::{choose, UpstreamConfig};
use anyhow::{Context, Result};
use hickory_proto::op::{Edns, Message};
use std::time::Instant;

const EDNS_UDP_SIZE: u16 = 4096;

/// Answers from the cache, otherwise from one of the upstreams responsible for the question.
/// Returns the response and the address of the upstream used, empty on a cache hit.
pub async fn exchange(upstreams: &UpstreamConfig, cache: Option<&ResponseCache>, req: &Message) -> Result<(Message, String)> {
    if let Some(resp) = cache.and_then(|c| c.get(req)) {
        return Ok((resp, String::new()));
    }

    let host = first_question(req).map(|q| host_of(q.name())).unwrap_or_default();
    let upstream = choose(upstreams.upstreams_for(&host))
        .ok_or_else(|| anyhow::anyhow!("no upstream configured for '{}'", host))?;

    let start = Instant::now();
    let resp = upstream.exchange(req).await
        .with_context(|| format!("upstream {} failed to resolve '{}'", upstream.address(), host))?;
    UPSTREAM_REQUEST_DURATION
        .with_label_values(&[rcode_to_str(resp.response_code()), upstream.address()])
        .observe(start.elapsed().as_secs_f64());

    if let Some(cache) = cache {
        cache.set(&resp);
    }
    Ok((resp, upstream.address().to_string()))
}

/// Forces the DO bit when DNSSEC is enabled. Returns true when the client had set it already.
pub fn request_dnssec(req: &mut Message) -> bool {
    if let Some(edns) = req.extensions_mut() {
        if edns.dnssec_ok() { return true; }
        edns.set_dnssec_ok(true);
        return false;
    }
    tracing::debug!("adding OPT record with DNSSEC flag");
    let mut edns = Edns::new();
    edns.set_max_payload(EDNS_UDP_SIZE);
    edns.set_dnssec_ok(true);
    req.set_edns(edns);
    false
}

pub struct Resolve;

#[async_trait::async_trait]
impl Stage for Resolve {
    fn name(&self) -> &'static str { "upstream" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        if ctx.resp.is_some() {
            return Outcome::Continue;
        }

        let custom = ctx.services.clients.as_ref().and_then(|c| c.custom_upstream(ctx.client.ip()));
        if custom.is_some() {
            tracing::debug!("using custom upstreams for {}", ctx.client.ip());
        }
        let upstreams = custom.unwrap_or_else(|| ctx.state.upstreams.clone());

        if ctx.state.conf.enable_dnssec {
            ctx.orig_req_dnssec = request_dnssec(&mut ctx.req);
        }

        let cache = ctx.state.conf.cache_enabled.then_some(&ctx.services.cache);
        match exchange(&upstreams, cache, &ctx.req).await {
            Ok((resp, addr)) => {
                ctx.resp = Some(resp);
                ctx.upstream_addr = addr;
                ctx.response_from_upstream = true;
                Outcome::Continue
            }
            Err(e) => ctx.fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fqdn;
    use crate::upstream::tests::NamedUpstream;
    use crate::upstream::Upstream;
    use hickory_proto::op::Query;
    use hickory_proto::rr::RecordType;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn query(name: &str) -> Message {
        let mut m = Message::new();
        m.add_query(Query::query(fqdn(name).unwrap(), RecordType::A));
        m
    }

    #[test]
    fn dnssec_flag_handling() {
        let mut req = query("example.com");
        assert!(!request_dnssec(&mut req));
        assert!(req.extensions().as_ref().unwrap().dnssec_ok());
        assert_eq!(req.extensions().as_ref().unwrap().max_payload(), 4096);

        let mut req = query("example.com");
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        req.set_edns(edns);
        assert!(!request_dnssec(&mut req));
        assert!(req.extensions().as_ref().unwrap().dnssec_ok());
        assert_eq!(req.extensions().as_ref().unwrap().max_payload(), 1232);

        assert!(request_dnssec(&mut req));
    }

    #[tokio::test]
    async fn domain_reserved_upstream_is_used() {
        let default = NamedUpstream::new("default:53");
        let lan = NamedUpstream::new("lan:53");
        let mut conf = UpstreamConfig::new(vec![default.clone() as Arc<dyn Upstream>]);
        conf.domain_reserved.insert("lan".to_string(), vec![lan.clone() as Arc<dyn Upstream>]);

        let (_, addr) = exchange(&conf, None, &query("nas.lan")).await.unwrap();
        assert_eq!(addr, "lan:53");
        let (_, addr) = exchange(&conf, None, &query("example.com")).await.unwrap();
        assert_eq!(addr, "default:53");
        assert_eq!(lan.calls.load(Ordering::Relaxed), 1);
        assert_eq!(default.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn empty_upstream_list_is_an_error() {
        let conf = UpstreamConfig::default();
        assert!(exchange(&conf, None, &query("example.com")).await.is_err());
    }
}
