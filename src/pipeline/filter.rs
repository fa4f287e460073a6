use crate::filtering::{FilterResult, Reason};
use crate::msg::BlockResponse;
use crate::pipeline::upstream::exchange;
use crate::pipeline::{DnsContext, Outcome, Stage};
use crate::types::{fqdn, host_of, replace_question};
use anyhow::{Context, Result};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::RecordType;
use std::net::IpAddr;

/// Block response for `res`. A block page given as a host name is resolved
/// through the upstreams; failing that the client gets SERVFAIL.
async fn gen_filter_message(ctx: &DnsContext, res: &FilterResult) -> Message {
    let responder = ctx.responder();
    match responder.gen_block_response(&ctx.req, res) {
        BlockResponse::Ready(resp) => resp,
        BlockResponse::Redirect(host) => match resolve_block_host(ctx, &host).await {
            Ok(resolved) => responder.gen_blocked_host_reply(&ctx.req, &resolved),
            Err(e) => {
                tracing::debug!("couldn't look up the IP of the block host {}: {:#}", host, e);
                responder.gen_server_failure(&ctx.req)
            }
        },
    }
}

async fn resolve_block_host(ctx: &DnsContext, host: &str) -> Result<Message> {
    let qtype = ctx.qtype().unwrap_or(RecordType::A);
    let mut req = Message::new();
    req.set_id(rand::random()).set_recursion_desired(true);
    req.add_query(Query::query(fqdn(host)?, qtype));

    let cache = ctx.state.conf.cache_enabled.then_some(&ctx.services.cache);
    let (resp, _) = exchange(&ctx.state.upstreams, cache, &req).await?;
    Ok(resp)
}

/// Direct answer for a rewrite with addresses: optional CNAME, then the
/// addresses matching the question type under the canonical name.
fn gen_rewrite_response(ctx: &DnsContext, host: &str, res: &FilterResult) -> Result<Message> {
    let responder = ctx.responder();
    let mut resp = responder.make_response(&ctx.req);
    let qtype = ctx.qtype();

    let mut name = fqdn(host)?;
    if let Some(canon) = &res.canon_name {
        name = fqdn(canon)?;
        resp.add_answer(responder.gen_cname_answer(&ctx.req, name.clone()));
    }

    for ip in &res.ip_list {
        let mut record = match (qtype, ip) {
            (Some(RecordType::A), IpAddr::V4(v4)) => responder.gen_a_answer(&ctx.req, *v4),
            (Some(RecordType::AAAA), IpAddr::V6(v6)) => responder.gen_aaaa_answer(&ctx.req, *v6),
            _ => continue,
        };
        record.set_name(name.clone());
        resp.add_answer(record);
    }
    Ok(resp)
}

/// Checks the question against the filtering engine before anything is resolved.
pub struct FilteringBeforeRequest;

#[async_trait::async_trait]
impl Stage for FilteringBeforeRequest {
    fn name(&self) -> &'static str { "filtering_before_request" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        if ctx.resp.is_some() || !ctx.protection_enabled {
            return Outcome::Continue;
        }
        let Some(filter) = ctx.state.filter.clone() else { return Outcome::Continue };
        let Some(q) = ctx.req.queries().first().cloned() else { return Outcome::Continue };

        let mut setts = filter.settings();
        setts.filtering_enabled = true;
        if let Some(clients) = &ctx.services.clients {
            clients.filtering_settings(ctx.client.ip(), &mut setts);
        }
        ctx.setts = setts;

        let host = host_of(q.name());
        let res = match filter.check_host(&host, q.query_type(), &ctx.setts)
            .with_context(|| format!("filter failed to check host '{}'", host))
        {
            Ok(res) => res,
            Err(e) => return ctx.fail(e),
        };

        if res.is_filtered() {
            tracing::debug!("host {} is filtered, reason {}, rule {:?}", host, res.reason.as_str(), res.rule);
            let resp = gen_filter_message(ctx, &res).await;
            ctx.resp = Some(resp);
        } else if res.reason == Reason::Rewrite && !res.ip_list.is_empty() {
            match gen_rewrite_response(ctx, &host, &res) {
                Ok(resp) => ctx.resp = Some(resp),
                Err(e) => return ctx.fail(e),
            }
        } else if res.reason == Reason::Rewrite {
            if let Some(canon) = &res.canon_name {
                let name = match fqdn(canon) {
                    Ok(n) => n,
                    Err(e) => return ctx.fail(e),
                };
                // 改为解析规范名，原问题留到响应阶段还原
                let mut rewritten = q.clone();
                rewritten.set_name(name);
                ctx.orig_question = Some(q);
                replace_question(&mut ctx.req, rewritten);
            }
        }

        ctx.result = res;
        Outcome::Continue
    }
}

/// Restores rewritten questions and checks upstream answers against the filter lists.
pub struct FilteringAfterResponse;

#[async_trait::async_trait]
impl Stage for FilteringAfterResponse {
    fn name(&self) -> &'static str { "filtering_after_response" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        match ctx.result.reason {
            Reason::Rewrite => {
                let Some(orig) = ctx.orig_question.take() else { return Outcome::Continue };
                replace_question(&mut ctx.req, orig.clone());

                let cname = match ctx.result.canon_name.as_deref().map(fqdn) {
                    Some(Ok(target)) => Some(ctx.responder().gen_cname_answer(&ctx.req, target)),
                    Some(Err(e)) => return ctx.fail(e),
                    None => None,
                };
                if let Some(resp) = ctx.resp.as_mut() {
                    replace_question(resp, orig);
                    if let (Some(cname), false) = (cname, resp.answers().is_empty()) {
                        let mut answers = vec![cname];
                        answers.extend(resp.take_answers());
                        resp.insert_answers(answers);
                    }
                }
            }
            Reason::NotFilteredWhiteList => {}
            Reason::NotFilteredNotFound
            | Reason::FilteredBlackList
            | Reason::FilteredSafeBrowsing
            | Reason::FilteredParental
            | Reason::FilteredSafeSearch
            | Reason::FilteredInvalid => {
                if !ctx.protection_enabled || !ctx.response_from_upstream {
                    return Outcome::Continue;
                }
                let Some(filter) = ctx.state.filter.clone() else { return Outcome::Continue };
                let Some(resp) = ctx.resp.as_ref() else { return Outcome::Continue };

                match filter.check_host_response(resp, &ctx.setts) {
                    Err(e) => return ctx.fail(e.context("filter failed to check the response")),
                    Ok(Some(res)) => {
                        tracing::debug!("matched {} by response: rule {:?}", ctx.req.queries().first().map(|q| host_of(q.name())).unwrap_or_default(), res.rule);
                        let blocked = gen_filter_message(ctx, &res).await;
                        ctx.orig_resp = ctx.resp.replace(blocked);
                        ctx.result = res;
                    }
                    Ok(None) => ctx.result = FilterResult::default(),
                }
            }
        }
        Outcome::Continue
    }
}
