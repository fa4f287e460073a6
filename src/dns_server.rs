use crate::access::Access;
use crate::cache::ResponseCache;
use crate::config::{ServerConfig, DEFAULT_UPSTREAM};
use crate::dhcp::{Lease, LeaseTable};
use crate::filtering::{FilteringEngine, RequestFilteringSettings};
use crate::listener::Listener;
use crate::msg::Responder;
use crate::pipeline::{upstream, DnsContext, Pipeline};
use crate::querylog::QueryLog;
use crate::ratelimit::RateLimiter;
use crate::stats::{Stats, DROPPED_TOTAL};
use crate::types::{fqdn, host_of, Proto};
use crate::upstream::UpstreamConfig;
use anyhow::{Context, Result};
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Per-client lookups supplied by the clients registry.
pub trait Clients: Send + Sync {
    /// Applies the client's own filtering switches on top of the engine defaults.
    fn filtering_settings(&self, _client: IpAddr, _setts: &mut RequestFilteringSettings) {}
    /// Upstreams replacing the global list for this client.
    fn custom_upstream(&self, _client: IpAddr) -> Option<Arc<UpstreamConfig>> { None }
}

pub type OnRequest = Arc<dyn Fn(&Message, SocketAddr) + Send + Sync>;

/// Everything derived from one `ServerConfig`. Swapped as a whole on reconfiguration.
#[derive(Clone)]
pub struct ServerState {
    pub conf: ServerConfig,
    pub upstreams: Arc<UpstreamConfig>,
    pub filter: Option<Arc<dyn FilteringEngine>>,
    pub access: Arc<Access>,
    pub ratelimit: Arc<RateLimiter>,
}

impl ServerState {
    pub fn prepare(mut conf: ServerConfig, filter: Option<Arc<dyn FilteringEngine>>) -> Result<Self> {
        let upstreams = match conf.upstream_config.clone() {
            Some(u) if !u.is_empty() => u,
            Some(u) => {
                let mut u = (*u).clone();
                u.upstreams = default_upstreams(&conf)?.upstreams;
                Arc::new(u)
            }
            None => {
                if conf.upstream_dns.is_empty() {
                    tracing::info!("no upstreams specified, using {}", DEFAULT_UPSTREAM);
                    conf.upstream_dns = vec![DEFAULT_UPSTREAM.to_string()];
                }
                let mut u = UpstreamConfig::parse(&conf.upstream_dns, &conf.bootstrap_dns, conf.upstream_timeout)
                    .context("failed to parse upstream servers")?;
                if u.is_empty() {
                    u.upstreams = default_upstreams(&conf)?.upstreams;
                }
                Arc::new(u)
            }
        };

        let access = Arc::new(Access::new(&conf.allowed_clients, &conf.disallowed_clients, &conf.blocked_hosts)
            .context("failed to parse access settings")?);
        let ratelimit = Arc::new(RateLimiter::new(conf.ratelimit, &conf.ratelimit_whitelist));

        Ok(Self { conf, upstreams, filter, access, ratelimit })
    }
}

fn default_upstreams(conf: &ServerConfig) -> Result<UpstreamConfig> {
    UpstreamConfig::parse(&[DEFAULT_UPSTREAM.to_string()], &conf.bootstrap_dns, conf.upstream_timeout)
}

/// Collaborators that outlive reconfiguration.
#[derive(Default)]
pub struct Services {
    pub cache: ResponseCache,
    pub leases: LeaseTable,
    pub clients: Option<Arc<dyn Clients>>,
    pub query_log: Option<Arc<dyn QueryLog>>,
    pub stats: Option<Arc<dyn Stats>>,
    pub on_request: Option<OnRequest>,
}

pub struct Server {
    state: RwLock<Arc<ServerState>>,
    services: Arc<Services>,
    pipeline: Pipeline,
    listener: AsyncMutex<Option<Listener>>,
}

pub struct ServerBuilder {
    conf: ServerConfig,
    filter: Option<Arc<dyn FilteringEngine>>,
    services: Services,
}

impl ServerBuilder {
    pub fn filter(mut self, filter: Arc<dyn FilteringEngine>) -> Self { self.filter = Some(filter); self }
    pub fn query_log(mut self, log: Arc<dyn QueryLog>) -> Self { self.services.query_log = Some(log); self }
    pub fn stats(mut self, stats: Arc<dyn Stats>) -> Self { self.services.stats = Some(stats); self }
    pub fn clients(mut self, clients: Arc<dyn Clients>) -> Self { self.services.clients = Some(clients); self }
    pub fn on_request(mut self, hook: OnRequest) -> Self { self.services.on_request = Some(hook); self }

    pub fn build(self) -> Result<Arc<Server>> {
        let state = ServerState::prepare(self.conf, self.filter)?;
        Ok(Arc::new(Server {
            state: RwLock::new(Arc::new(state)),
            services: Arc::new(self.services),
            pipeline: Pipeline::new(),
            listener: AsyncMutex::new(None),
        }))
    }
}

impl Server {
    pub fn builder(conf: ServerConfig) -> ServerBuilder {
        ServerBuilder { conf, filter: None, services: Services::default() }
    }

    fn snapshot(&self) -> Arc<ServerState> { self.state.read().clone() }

    pub fn config(&self) -> ServerConfig { self.snapshot().conf.clone() }

    pub fn cache(&self) -> &ResponseCache { &self.services.cache }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() { anyhow::bail!("DNS server is already started"); }

        let conf = self.config();
        *listener = Some(Listener::bind(self.clone(), conf.listen_addr(), conf.max_goroutines).await?);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(l) = self.listener.lock().await.take() {
            l.shutdown().await;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool { self.listener.lock().await.is_some() }

    /// Where the listener is bound, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr())
    }

    /// Stops the listener, swaps the configuration and starts again if it was running.
    /// An invalid configuration leaves the current one in place.
    pub async fn reconfigure(self: &Arc<Self>, conf: ServerConfig) -> Result<()> {
        let filter = self.snapshot().filter.clone();
        self.reconfigure_with(conf, filter).await
    }

    pub async fn reconfigure_with(self: &Arc<Self>, conf: ServerConfig, filter: Option<Arc<dyn FilteringEngine>>) -> Result<()> {
        let state = ServerState::prepare(conf, filter).context("couldn't apply the new configuration")?;

        let mut listener = self.listener.lock().await;
        let was_running = match listener.take() {
            Some(l) => { l.shutdown().await; true }
            None => false,
        };
        *self.state.write() = Arc::new(state);
        tracing::info!("DNS server reconfigured");

        if was_running {
            let conf = self.config();
            *listener = Some(Listener::bind(self.clone(), conf.listen_addr(), conf.max_goroutines).await
                .context("couldn't restart the DNS server")?);
        }
        Ok(())
    }

    pub fn protection_enabled(&self) -> bool { self.snapshot().conf.protection_enabled }

    /// Toggles filtering without touching the listener.
    pub fn set_protection_enabled(&self, enabled: bool) {
        let mut state = self.state.write();
        let mut next = (**state).clone();
        next.conf.protection_enabled = enabled;
        *state = Arc::new(next);
        tracing::info!("protection {}", if enabled { "enabled" } else { "disabled" });
    }

    pub async fn set_upstream_dns(self: &Arc<Self>, upstreams: Vec<String>) -> Result<()> {
        let mut conf = self.config();
        conf.upstream_dns = upstreams;
        conf.upstream_config = None;
        self.reconfigure(conf).await?;
        self.services.cache.clear();
        Ok(())
    }

    pub fn on_dhcp_lease_changed(&self, leases: &[Lease]) {
        self.services.leases.update(leases);
    }

    pub fn is_blocked_ip(&self, ip: IpAddr) -> (bool, String) {
        self.snapshot().access.is_blocked_ip(ip)
    }

    /// Unfiltered, unlogged resolution through the upstreams.
    pub async fn exchange(&self, req: &Message) -> Result<Message> {
        let state = self.snapshot();
        let cache = state.conf.cache_enabled.then_some(&self.services.cache);
        let (resp, _) = upstream::exchange(&state.upstreams, cache, req).await?;
        Ok(resp)
    }

    /// A and AAAA addresses of `host`, looked up concurrently.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let name = fqdn(host)?;
        let query = |qtype| {
            let mut req = Message::new();
            req.set_id(rand::random()).set_recursion_desired(true);
            req.add_query(Query::query(name.clone(), qtype));
            req
        };
        let (req_a, req_aaaa) = (query(RecordType::A), query(RecordType::AAAA));
        let (a, aaaa) = futures::join!(self.exchange(&req_a), self.exchange(&req_aaaa));

        let mut ips = Vec::new();
        let mut last_err = None;
        for res in [a, aaaa] {
            match res {
                Ok(resp) => ips.extend(resp.answers().iter().filter_map(|r| match r.data() {
                    Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })),
                Err(e) => last_err = Some(e),
            }
        }
        match (ips.is_empty(), last_err) {
            (true, Some(e)) => Err(e.context(format!("couldn't resolve {}", host))),
            _ => Ok(ips),
        }
    }

    /// Entry point for one inbound request. `None` means the request is dropped without reply.
    pub async fn handle_dns_request(&self, req: Message, client: SocketAddr, proto: Proto) -> Option<Message> {
        let state = self.snapshot();
        let ip = client.ip();

        let (blocked, rule) = state.access.is_blocked_ip(ip);
        if blocked {
            tracing::trace!("client {} is blocked by settings {}", ip, rule);
            DROPPED_TOTAL.with_label_values(&["client"]).inc();
            return None;
        }
        if state.ratelimit.is_ratelimited(ip) {
            tracing::debug!("client {} is rate limited", ip);
            DROPPED_TOTAL.with_label_values(&["ratelimit"]).inc();
            return None;
        }

        let responder = Responder::new(&state.conf);
        if req.queries().len() != 1 {
            tracing::debug!("request from {} has {} questions", client, req.queries().len());
            return Some(responder.gen_server_failure(&req));
        }
        let q = &req.queries()[0];
        let host = host_of(q.name());
        if state.access.is_blocked_domain(&host) {
            tracing::trace!("domain {} is blocked by settings", host);
            DROPPED_TOTAL.with_label_values(&["domain"]).inc();
            return None;
        }
        if state.conf.refuse_any && q.query_type() == RecordType::ANY {
            let mut resp = responder.make_response(&req);
            resp.set_response_code(ResponseCode::NotImp);
            return Some(resp);
        }

        let mut ctx = DnsContext::new(state.clone(), self.services.clone(), req, client, proto);
        if let Err(e) = self.pipeline.run(&mut ctx).await {
            tracing::warn!("failed to process request for {} from {}: {:#}", host, client, e);
        }
        ctx.resp
    }
}
