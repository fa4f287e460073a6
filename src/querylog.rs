//! Query log sink. Entries are handed off to a background writer and never block the query path.

use crate::filtering::FilterResult;
use crate::stats::rcode_to_str;
use crate::types::{host_of, first_question};
use hickory_proto::op::Message;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::Duration;

const QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub question: String,
    pub qtype: String,
    pub rcode: String,
    pub answers: usize,
    /// Upstream answer data replaced by a response-based block.
    pub orig_answers: Vec<String>,
    pub reason: &'static str,
    pub rule: String,
    pub elapsed: Duration,
    pub client: SocketAddr,
    /// Empty when served from cache or answered locally.
    pub upstream: String,
}

impl LogEntry {
    pub fn new(
        req: &Message,
        resp: Option<&Message>,
        orig_resp: Option<&Message>,
        result: &FilterResult,
        elapsed: Duration,
        client: SocketAddr,
        upstream: &str,
    ) -> Self {
        let (question, qtype) = match first_question(req) {
            Some(q) => (host_of(q.name()), q.query_type().to_string()),
            None => (String::new(), String::new()),
        };
        Self {
            question,
            qtype,
            rcode: resp.map(|r| rcode_to_str(r.response_code())).unwrap_or("-").to_string(),
            answers: resp.map(|r| r.answers().len()).unwrap_or(0),
            orig_answers: orig_resp
                .map(|r| r.answers().iter().filter_map(|a| a.data().map(|d| d.to_string())).collect())
                .unwrap_or_default(),
            reason: result.reason.as_str(),
            rule: result.rule.clone(),
            elapsed,
            client,
            upstream: upstream.to_string(),
        }
    }
}

pub trait QueryLog: Send + Sync {
    /// `orig_resp` is the upstream response when the filter replaced it.
    fn log_request(
        &self,
        req: &Message,
        resp: Option<&Message>,
        orig_resp: Option<&Message>,
        result: &FilterResult,
        elapsed: Duration,
        client: SocketAddr,
        upstream: &str,
    );
}

/// Writes entries through the `querylog` tracing target from a background task.
pub struct TracingQueryLog {
    tx: mpsc::Sender<LogEntry>,
}

impl TracingQueryLog {
    /// Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(QUEUE_SIZE);
        tokio::spawn(async move {
            while let Some(e) = rx.recv().await {
                tracing::info!(
                    target: "querylog",
                    "{} {} {} {} answers={} orig={:?} reason={} rule={:?} upstream={} elapsed={:?}",
                    e.client.ip(), e.question, e.qtype, e.rcode, e.answers, e.orig_answers, e.reason, e.rule, e.upstream, e.elapsed
                );
            }
        });
        Self { tx }
    }
}

impl QueryLog for TracingQueryLog {
    fn log_request(
        &self,
        req: &Message,
        resp: Option<&Message>,
        orig_resp: Option<&Message>,
        result: &FilterResult,
        elapsed: Duration,
        client: SocketAddr,
        upstream: &str,
    ) {
        let entry = LogEntry::new(req, resp, orig_resp, result, elapsed, client, upstream);
        if let Err(e) = self.tx.try_send(entry) {
            tracing::debug!("querylog queue full, dropping entry: {}", e);
        }
    }
}
