//! Hot reload: watches the configuration file and reconfigures the server when it changes.

use crate::config::{Config, ReloadConfig};
use crate::dns_server::Server;
use crate::filtering::{FilteringEngine, RuleFilter};
use crate::stats::{RELOAD_FAILED_TOTAL, RELOAD_VERSION_INFO};
use anyhow::Result;
use rand::Rng;
use sha2::{Digest, Sha512};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

pub fn hash_file(path: &str) -> Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha512::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

/// `interval` shifted by a uniform offset in `[-jitter, +jitter]`.
fn next_sleep(interval: Duration, jitter: Duration) -> Duration {
    let j = jitter.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(-j..=j);
    if offset >= 0 {
        interval + Duration::from_millis(offset as u64)
    } else {
        interval.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
    }
}

async fn apply(server: &Arc<Server>, path: &str, bind_host: IpAddr) -> Result<()> {
    let mut cfg = Config::load(path)?;
    cfg.server.bind_host = bind_host;
    let filter: Arc<dyn FilteringEngine> = Arc::new(RuleFilter::from_config(&cfg.server.filtering)?);
    server.reconfigure_with(cfg.server, Some(filter)).await
}

pub fn spawn(server: Arc<Server>, path: String, conf: ReloadConfig, bind_host: IpAddr) -> tokio::task::JoinHandle<()> {
    let mut current_hash = hash_file(&path).unwrap_or_default();
    RELOAD_VERSION_INFO.with_label_values(&["sha512", &current_hash]).set(1.0);
    tracing::info!("[reload] Watching changes for {} (Interval: {:?}, Jitter: {:?})", path, conf.interval, conf.jitter);

    tokio::spawn(async move {
        loop {
            sleep(next_sleep(conf.interval, conf.jitter)).await;

            let new_hash = match hash_file(&path) {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!("[reload] Failed to read {}: {}", path, e);
                    RELOAD_FAILED_TOTAL.inc();
                    continue;
                }
            };
            if new_hash == current_hash { continue; }

            tracing::info!("[reload] Config change detected, new SHA512: {}", new_hash);
            match apply(&server, &path, bind_host).await {
                Ok(()) => {
                    RELOAD_VERSION_INFO.with_label_values(&["sha512", &current_hash]).set(0.0);
                    RELOAD_VERSION_INFO.with_label_values(&["sha512", &new_hash]).set(1.0);
                    current_hash = new_hash;
                }
                Err(e) => {
                    // 保留旧哈希，文件修正后会再次尝试
                    tracing::error!("[reload] Failed to apply {}: {:#}", path, e);
                    RELOAD_FAILED_TOTAL.inc();
                }
            }
        }
    })
}
