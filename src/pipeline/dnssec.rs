use crate::pipeline::{DnsContext, Outcome, Stage};
use hickory_proto::op::Message;
use hickory_proto::rr::{Record, RecordType};

fn without_rrsig(records: Vec<Record>) -> (Vec<Record>, usize) {
    let before = records.len();
    let kept: Vec<Record> = records.into_iter().filter(|r| r.record_type() != RecordType::RRSIG).collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Removes RRSIG records from the answer and authority sections. Returns how many were dropped.
pub fn strip_rrsig(resp: &mut Message) -> usize {
    let (answers, a) = without_rrsig(resp.take_answers());
    resp.insert_answers(answers);
    let (ns, n) = without_rrsig(resp.take_name_servers());
    resp.insert_name_servers(ns);
    a + n
}

/// Hides signatures fetched only because DNSSEC was forced upstream.
pub struct DnssecAfterResponse;

#[async_trait::async_trait]
impl Stage for DnssecAfterResponse {
    fn name(&self) -> &'static str { "dnssec" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        if !ctx.response_from_upstream || !ctx.state.conf.enable_dnssec || ctx.orig_req_dnssec {
            return Outcome::Continue;
        }
        let Some(resp) = ctx.resp.as_mut() else { return Outcome::Continue };
        if resp.extensions().as_ref().is_some_and(|e| !e.dnssec_ok()) {
            return Outcome::Continue;
        }

        let removed = strip_rrsig(resp);
        if removed > 0 {
            tracing::debug!("removed {} RRSIG records from response", removed);
        }
        Outcome::Continue
    }
}
