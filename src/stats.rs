use chrono::{DateTime, Utc};
use hickory_proto::op::ResponseCode;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_gauge_vec,
    GaugeVec, HistogramVec, IntCounter, IntCounterVec,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsguard_dns_requests_total",
        "Counter of DNS requests per protocol and query type.",
        &["proto", "type"]
    ).unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsguard_dns_responses_total",
        "Counter of response status codes.",
        &["rcode"]
    ).unwrap();

    pub static ref DNS_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "dnsguard_dns_request_duration_seconds",
        "Histogram of the time (in seconds) each request took.",
        &["proto"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref CACHE_HITS_TOTAL: IntCounter = register_int_counter!(
        "dnsguard_cache_hits_total",
        "The count of response cache hits."
    ).unwrap();

    pub static ref CACHE_MISSES_TOTAL: IntCounter = register_int_counter!(
        "dnsguard_cache_misses_total",
        "The count of response cache misses."
    ).unwrap();

    pub static ref UPSTREAM_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "dnsguard_upstream_request_duration_seconds",
        "Histogram of the time each upstream exchange took.",
        &["rcode", "to"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref POOL_CONN_HITS: IntCounterVec = register_int_counter_vec!(
        "dnsguard_upstream_conn_cache_hits_total",
        "Counter of connection pool hits per upstream and protocol.",
        &["proto", "to"]
    ).unwrap();

    pub static ref POOL_CONN_MISSES: IntCounterVec = register_int_counter_vec!(
        "dnsguard_upstream_conn_cache_misses_total",
        "Counter of connection pool misses per upstream and protocol.",
        &["proto", "to"]
    ).unwrap();

    pub static ref DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsguard_dropped_requests_total",
        "Counter of requests dropped before processing.",
        &["reason"]
    ).unwrap();

    pub static ref STATS_COUNTERS: IntCounterVec = register_int_counter_vec!(
        "dnsguard_stats_total",
        "Query statistics: total, filtered per reason, errors.",
        &["name"]
    ).unwrap();

    pub static ref STATS_HISTOGRAMS: HistogramVec = register_histogram_vec!(
        "dnsguard_stats_seconds",
        "Query statistics histograms.",
        &["name"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "dnsguard_build_info",
        "A metric with a constant '1' value labeled by version.",
        &["version"]
    ).unwrap();

    pub static ref RELOAD_VERSION_INFO: GaugeVec = register_gauge_vec!(
        "dnsguard_reload_version_info",
        "Record the hash value during reload.",
        &["hash", "value"]
    ).unwrap();

    pub static ref RELOAD_FAILED_TOTAL: IntCounter = register_int_counter!(
        "dnsguard_reload_failed_total",
        "Counter of the number of failed reload attempts."
    ).unwrap();
}

/// Aggregate statistics sink fed by the logging stage.
pub trait Stats: Send + Sync {
    fn increment(&self, counter: &str, at: DateTime<Utc>);
    fn observe(&self, histogram: &str, value: f64, at: DateTime<Utc>);
}

/// Stats backed by the process-wide prometheus registry.
pub struct PrometheusStats;

impl Stats for PrometheusStats {
    fn increment(&self, counter: &str, _at: DateTime<Utc>) {
        STATS_COUNTERS.with_label_values(&[counter]).inc();
    }

    fn observe(&self, histogram: &str, value: f64, _at: DateTime<Utc>) {
        STATS_HISTOGRAMS.with_label_values(&[histogram]).observe(value);
    }
}

pub fn rcode_to_str(rcode: ResponseCode) -> &'static str {
    match rcode {
        ResponseCode::NoError => "NOERROR",
        ResponseCode::FormErr => "FORMERR",
        ResponseCode::ServFail => "SERVFAIL",
        ResponseCode::NXDomain => "NXDOMAIN",
        ResponseCode::NotImp => "NOTIMP",
        ResponseCode::Refused => "REFUSED",
        _ => "UNKNOWN",
    }
}

/// Serves the registry in text format on `addr`.
pub fn serve_metrics(addr: String) -> tokio::task::JoinHandle<()> {
    BUILD_INFO.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("[prometheus] Failed to bind metrics listener on {}: {}", addr, e);
                return;
            }
        };
        tracing::info!("[prometheus] Serving metrics on {}", addr);

        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let Ok(Ok(n)) = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf)).await else { return };
                if n == 0 || !buf.starts_with(b"GET ") { return; }

                use prometheus::Encoder;
                let encoder = prometheus::TextEncoder::new();
                let mut body = vec![];
                if encoder.encode(&prometheus::gather(), &mut body).is_err() { return; }

                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let mut response = header.into_bytes();
                response.extend_from_slice(&body);
                let _ = tokio::time::timeout(std::time::Duration::from_secs(2), stream.write_all(&response)).await;
                let _ = stream.flush().await;
                // 发送 FIN，告诉客户端数据已发完
                let _ = stream.shutdown().await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_stats_count() {
        let before = STATS_COUNTERS.with_label_values(&["test_counter"]).get();
        PrometheusStats.increment("test_counter", Utc::now());
        PrometheusStats.increment("test_counter", Utc::now());
        assert_eq!(STATS_COUNTERS.with_label_values(&["test_counter"]).get(), before + 2);

        PrometheusStats.observe("test_histogram", 0.02, Utc::now());
        assert_eq!(STATS_HISTOGRAMS.with_label_values(&["test_histogram"]).get_sample_count(), 1);
    }

    #[test]
    fn rcode_names() {
        assert_eq!(rcode_to_str(ResponseCode::NXDomain), "NXDOMAIN");
        assert_eq!(rcode_to_str(ResponseCode::YXDomain), "UNKNOWN");
    }
}
