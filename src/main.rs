//! dnsguard - a filtering DNS forwarding proxy

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use dnsguard::config::Config;
use dnsguard::filtering::{FilteringEngine, RuleFilter};
use dnsguard::querylog::TracingQueryLog;
use dnsguard::stats::{serve_metrics, PrometheusStats};
use dnsguard::{reload, Server};
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// 本地时区时间戳
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "dnsguard")]
#[command(about = "A filtering DNS forwarding proxy", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "Corefile")]
    config: String,

    /// Bind address; the port is taken from the server block name.
    #[arg(long, default_value = "0.0.0.0:53")]
    address: String,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("dnsguard-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs").context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::new("logs/dnsguard.log", RollingConditionBasic::new().daily(), 30)?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting dnsguard version {} on {} worker threads", env!("CARGO_PKG_VERSION"), cores);

    let bind: SocketAddr = args.address.parse().with_context(|| format!("invalid --address '{}'", args.address))?;
    let path = std::fs::canonicalize(&args.config)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| args.config.clone());
    info!("Using configuration {}", path);

    let mut cfg = Config::load(&path)?;
    cfg.server.bind_host = bind.ip();

    let filter: Arc<dyn FilteringEngine> = Arc::new(RuleFilter::from_config(&cfg.server.filtering)?);
    let server = Server::builder(cfg.server.clone())
        .filter(filter)
        .stats(Arc::new(PrometheusStats))
        .query_log(Arc::new(TracingQueryLog::start()))
        .build()?;

    if let Some(addr) = cfg.prometheus.clone() {
        serve_metrics(addr);
    }
    if let Some(reload_conf) = cfg.reload.clone() {
        reload::spawn(server.clone(), path.clone(), reload_conf, bind.ip());
    }

    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await
}
