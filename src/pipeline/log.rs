use crate::filtering::Reason;
use crate::pipeline::{DnsContext, Outcome, Stage};
use crate::stats::{rcode_to_str, DNS_REQUESTS_TOTAL, DNS_REQUEST_DURATION, DNS_RESPONSES_TOTAL};
use chrono::Utc;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

/// Hands every finished query to the query log and the stats sink.
pub struct QueryLogAndStats;

#[async_trait::async_trait]
impl Stage for QueryLogAndStats {
    fn name(&self) -> &'static str { "querylog_and_stats" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        let elapsed = ctx.start_time.elapsed();
        let qtype = ctx.qtype().unwrap_or(RecordType::Unknown(0));
        let rcode = ctx.resp.as_ref().map(|r| r.response_code());

        DNS_REQUESTS_TOTAL.with_label_values(&[ctx.proto.as_str(), &qtype.to_string()]).inc();
        DNS_REQUEST_DURATION.with_label_values(&[ctx.proto.as_str()]).observe(elapsed.as_secs_f64());
        if let Some(rcode) = rcode {
            DNS_RESPONSES_TOTAL.with_label_values(&[rcode_to_str(rcode)]).inc();
        }

        let conf = &ctx.state.conf;
        let should_log = !(qtype == RecordType::ANY && conf.refuse_any);
        if conf.querylog_enabled && should_log {
            if let Some(log) = &ctx.services.query_log {
                log.log_request(&ctx.req, ctx.resp.as_ref(), ctx.orig_resp.as_ref(), &ctx.result, elapsed, ctx.client, &ctx.upstream_addr);
            }
        }

        if let Some(stats) = &ctx.services.stats {
            let now = Utc::now();
            stats.increment("queries", now);
            match ctx.result.reason {
                Reason::FilteredBlackList | Reason::FilteredInvalid => stats.increment("filtered", now),
                Reason::FilteredSafeBrowsing => stats.increment("safebrowsing", now),
                Reason::FilteredParental => stats.increment("parental", now),
                Reason::FilteredSafeSearch => stats.increment("safesearch", now),
                Reason::NotFilteredNotFound | Reason::NotFilteredWhiteList | Reason::Rewrite => {}
            }
            if ctx.err.is_some() || rcode == Some(ResponseCode::ServFail) {
                stats.increment("errors", now);
            }
            stats.observe("processing_time", elapsed.as_secs_f64(), now);
        }

        Outcome::Continue
    }
}
