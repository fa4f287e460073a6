use crate::pipeline::{DnsContext, Outcome, Stage};
use hickory_proto::rr::RecordType;

/// Firefox checks this name before enabling its own DoH; NXDOMAIN keeps it off.
const DOH_CANARY: &str = "use-application-dns.net.";

/// AAAA suppression, the request hook and the DoH canary.
pub struct Initial;

#[async_trait::async_trait]
impl Stage for Initial {
    fn name(&self) -> &'static str { "initial" }

    async fn process(&self, ctx: &mut DnsContext) -> Outcome {
        let Some(q) = ctx.req.queries().first().cloned() else {
            return ctx.fail(anyhow::anyhow!("request has no question"));
        };
        let qtype = q.query_type();

        if ctx.state.conf.aaaa_disabled && qtype == RecordType::AAAA {
            tracing::debug!("AAAA disabled, empty answer for {}", q.name());
            ctx.resp = Some(ctx.responder().make_response(&ctx.req));
            return Outcome::Finish;
        }

        if let Some(hook) = ctx.services.on_request.clone() {
            hook(&ctx.req, ctx.client);
        }

        if matches!(qtype, RecordType::A | RecordType::AAAA) && q.name().to_ascii().eq_ignore_ascii_case(DOH_CANARY) {
            ctx.resp = Some(ctx.responder().gen_nxdomain(&ctx.req));
            return Outcome::Finish;
        }

        Outcome::Continue
    }
}
