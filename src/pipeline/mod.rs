//! Per-query processing pipeline.
//!
//! Stages run strictly in order over one [`DnsContext`]. A stage either lets the
//! query continue, finishes it early, or fails it. The logging stage is not part
//! of the chain: it runs after every query, whatever the outcome.

pub mod dnssec;
pub mod filter;
pub mod initial;
pub mod internal_hosts;
pub mod log;
pub mod upstream;

use crate::dns_server::{ServerState, Services};
use crate::filtering::{FilterResult, RequestFilteringSettings};
use crate::msg::Responder;
use crate::types::{replace_question, Proto};
use anyhow::Result;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::RecordType;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Go on with the next stage.
    Continue,
    /// Stop here; the response (if any) is final.
    Finish,
    /// Stop here; `DnsContext::err` holds the cause.
    Error,
}

#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process(&self, ctx: &mut DnsContext) -> Outcome;
}

/// State of one query. Owned by the task handling it.
pub struct DnsContext {
    /// Configuration snapshot taken when the query arrived.
    pub state: Arc<ServerState>,
    pub services: Arc<Services>,
    pub req: Message,
    pub resp: Option<Message>,
    pub client: SocketAddr,
    pub proto: Proto,
    pub start_time: Instant,
    pub setts: RequestFilteringSettings,
    pub result: FilterResult,
    /// Upstream response replaced by a block triggered by its content.
    pub orig_resp: Option<Message>,
    /// Question as asked, saved when a CNAME rewrite changes it.
    pub orig_question: Option<Query>,
    pub err: Option<anyhow::Error>,
    pub protection_enabled: bool,
    /// Set when `resp` holds upstream data, cached or fresh.
    pub response_from_upstream: bool,
    /// The client asked for DNSSEC records itself.
    pub orig_req_dnssec: bool,
    /// Address of the upstream that answered; empty for cache hits and local answers.
    pub upstream_addr: String,
}

impl DnsContext {
    pub fn new(state: Arc<ServerState>, services: Arc<Services>, req: Message, client: SocketAddr, proto: Proto) -> Self {
        let protection_enabled = state.conf.protection_enabled && state.filter.is_some();
        Self {
            state,
            services,
            req,
            resp: None,
            client,
            proto,
            start_time: Instant::now(),
            setts: RequestFilteringSettings::default(),
            result: FilterResult::default(),
            orig_resp: None,
            orig_question: None,
            err: None,
            protection_enabled,
            response_from_upstream: false,
            orig_req_dnssec: false,
            upstream_addr: String::new(),
        }
    }

    pub fn responder(&self) -> Responder<'_> { Responder::new(&self.state.conf) }

    pub fn qtype(&self) -> Option<RecordType> {
        self.req.queries().first().map(|q| q.query_type())
    }

    pub fn fail(&mut self, err: anyhow::Error) -> Outcome {
        self.err = Some(err);
        Outcome::Error
    }
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    log: log::QueryLogAndStats,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            stages: vec![
                Box::new(initial::Initial),
                Box::new(internal_hosts::InternalHosts),
                Box::new(internal_hosts::InternalIpAddrs),
                Box::new(filter::FilteringBeforeRequest),
                Box::new(upstream::Resolve),
                Box::new(dnssec::DnssecAfterResponse),
                Box::new(filter::FilteringAfterResponse),
            ],
            log: log::QueryLogAndStats,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self { Self::default() }

    /// Runs every stage, then the logging stage. On error the response is
    /// already replaced by SERVFAIL when this returns.
    pub async fn run(&self, ctx: &mut DnsContext) -> Result<()> {
        let mut outcome = Outcome::Continue;
        for stage in &self.stages {
            outcome = stage.process(ctx).await;
            tracing::trace!("stage {} -> {:?}", stage.name(), outcome);
            if outcome != Outcome::Continue { break; }
        }

        if outcome == Outcome::Error {
            if let Some(q) = ctx.orig_question.take() {
                replace_question(&mut ctx.req, q);
            }
            ctx.resp = Some(ctx.responder().gen_server_failure(&ctx.req));
        }

        self.log.process(ctx).await;

        match (outcome, ctx.err.take()) {
            (Outcome::Error, Some(e)) => Err(e),
            (Outcome::Error, None) => Err(anyhow::anyhow!("pipeline stage failed without an error")),
            _ => Ok(()),
        }
    }
}
