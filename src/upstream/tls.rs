use crate::stats::{POOL_CONN_HITS, POOL_CONN_MISSES};
use crate::upstream::bootstrap::Bootstrap;
use crate::upstream::{read_framed, write_framed, Upstream};
use anyhow::{Context, Result};
use hickory_proto::op::Message;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Duration};
use tokio_rustls::{client::TlsStream, rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName}, TlsConnector};

const MAX_IDLE_CONNS: usize = 16;
const IDLE_EXPIRE: Duration = Duration::from_secs(30);

struct IdleConnection {
    stream: TlsStream<TcpStream>,
    expires_at: Instant,
}

/// Idle TLS connections to a single resolver.
pub struct TlsPool {
    address: String,
    sni_host: String,
    connect_host: String,
    port: u16,
    bootstrap: Arc<Bootstrap>,
    timeout: Duration,
    connector: TlsConnector,
    idle: AsyncMutex<Vec<IdleConnection>>,
}

impl TlsPool {
    fn new(address: &str, sni_host: &str, connect_host: &str, port: u16, bootstrap: Arc<Bootstrap>, timeout: Duration, tls_config: Arc<ClientConfig>) -> Self {
        Self {
            address: address.to_string(),
            sni_host: sni_host.to_string(),
            connect_host: connect_host.to_string(),
            port,
            bootstrap,
            timeout,
            connector: TlsConnector::from(tls_config),
            idle: AsyncMutex::new(Vec::new()),
        }
    }

    /// An idle unexpired connection when there is one, otherwise a new one. The flag tells which.
    async fn get(&self) -> Result<(TlsStream<TcpStream>, bool)> {
        let now = Instant::now();
        {
            let mut idle = self.idle.lock().await;
            while let Some(conn) = idle.pop() {
                if conn.expires_at > now {
                    POOL_CONN_HITS.with_label_values(&["tls", &self.address]).inc();
                    return Ok((conn.stream, true));
                }
            }
        }
        POOL_CONN_MISSES.with_label_values(&["tls", &self.address]).inc();
        Ok((self.dial().await?, false))
    }

    async fn put(&self, stream: TlsStream<TcpStream>) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_CONNS {
            idle.push(IdleConnection { stream, expires_at: Instant::now() + IDLE_EXPIRE });
        }
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>> {
        tracing::debug!("Establishing new TLS connection to {}", self.address);
        let addr = self.bootstrap.resolve(&self.connect_host, self.port).await?;
        let domain = ServerName::try_from(self.sni_host.as_str())
            .map_err(|_| anyhow::anyhow!("invalid TLS server name '{}'", self.sni_host))?;
        let tcp = timeout(self.timeout, TcpStream::connect(addr)).await
            .map_err(|_| anyhow::anyhow!("dial timeout"))??;
        let tls = timeout(self.timeout, self.connector.connect(domain, tcp)).await
            .map_err(|_| anyhow::anyhow!("TLS handshake timeout"))??;
        Ok(tls)
    }
}

fn client_config() -> ClientConfig {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));
    ClientConfig::builder().with_safe_defaults().with_root_certificates(root_store).with_no_client_auth()
}

/// DNS-over-TLS. The pool is created on first use.
pub struct DnsOverTls {
    address: String,
    sni_host: String,
    connect_host: String,
    port: u16,
    bootstrap: Arc<Bootstrap>,
    timeout: Duration,
    tls_config: Arc<ClientConfig>,
    pool: RwLock<Option<Arc<TlsPool>>>,
}

impl DnsOverTls {
    pub fn new(address: &str, sni_host: String, connect_host: String, port: u16, bootstrap: Arc<Bootstrap>, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            sni_host,
            connect_host,
            port,
            bootstrap,
            timeout,
            tls_config: Arc::new(client_config()),
            pool: RwLock::new(None),
        }
    }

    #[cfg(test)]
    fn with_tls_config(mut self, config: ClientConfig) -> Self {
        self.tls_config = Arc::new(config);
        self
    }

    fn pool(&self) -> Arc<TlsPool> {
        if let Some(pool) = self.pool.read().as_ref() {
            return pool.clone();
        }
        let mut guard = self.pool.write();
        // 拿到写锁后再检查一次，可能已经被其他任务初始化
        if let Some(pool) = guard.as_ref() {
            return pool.clone();
        }
        let pool = Arc::new(TlsPool::new(&self.address, &self.sni_host, &self.connect_host, self.port, self.bootstrap.clone(), self.timeout, self.tls_config.clone()));
        *guard = Some(pool.clone());
        pool
    }

    async fn exchange_on(&self, stream: &mut TlsStream<TcpStream>, packet: &[u8]) -> Result<Message> {
        write_framed(stream, packet).await
            .with_context(|| format!("Failed to send a request to {}", self.address))?;
        let resp = read_framed(stream, self.timeout).await
            .with_context(|| format!("Failed to read a response from {}", self.address))?;
        Ok(Message::from_vec(&resp)?)
    }
}

#[async_trait::async_trait]
impl Upstream for DnsOverTls {
    async fn exchange(&self, req: &Message) -> Result<Message> {
        let pool = self.pool();
        let packet = req.to_vec()?;

        let (mut stream, reused) = pool.get().await
            .with_context(|| format!("Failed to get a connection from TLSPool to {}", self.address))?;
        match self.exchange_on(&mut stream, &packet).await {
            Ok(reply) => {
                pool.put(stream).await;
                Ok(reply)
            }
            Err(e) if reused => {
                // 复用的连接可能已被服务端关闭，换一条新连接重试一次
                tracing::debug!("Pooled TLS connection to {} failed: {:#}, redialing", self.address, e);
                drop(stream);
                let mut fresh = pool.dial().await
                    .with_context(|| format!("Failed to get a connection from TLSPool to {}", self.address))?;
                let reply = self.exchange_on(&mut fresh, &packet).await?;
                pool.put(fresh).await;
                Ok(reply)
            }
            Err(e) => Err(e),
        }
    }

    fn address(&self) -> &str { &self.address }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{fqdn, make_reply};
    use crate::upstream::DEFAULT_TIMEOUT;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
    use tokio_rustls::TlsAcceptor;

    // test CA 及其签发的 localhost 证书（DER, base64）
    const CA_CERT: &str = "MIIBnTCCAUOgAwIBAgIUTHx9D41/gXparZWqciGpbOB17KIwCgYIKoZIzj0EAwIwGzEZMBcGA1UEAwwQZG5zZ3VhcmQgdGVzdCBDQTAgFw0yNjEwMTQxMDEwMjFaGA8yMTI2MDkyMDEwMTAyMVowGzEZMBcGA1UEAwwQZG5zZ3VhcmQgdGVzdCBDQTBZMBMGByqGSM49AgEGCCqGSM49AwEHA0IABHyhfBUzyuRenQBorqQUjEd3N7CgPrB78yRGh+7YSRdG+T56osfjdfuOg7hkyKmWSNKdFdDUorO9hE3vnaj1e8CjYzBhMB0GA1UdDgQWBBT5mtfn0HW6gGvrRV9mc+9M/LU5LDAfBgNVHSMEGDAWgBT5mtfn0HW6gGvrRV9mc+9M/LU5LDAPBgNVHRMBAf8EBTADAQH/MA4GA1UdDwEB/wQEAwICBDAKBggqhkjOPQQDAgNIADBFAiEAgTdM/xv1vLH+scDTwW5ypHlczja/Rwvahd3oKqYa3rwCIFq9DyYO69zge41i6IA8mJ0z53SaBisUo0ghrufmq3As";
    const LEAF_CERT: &str = "MIIBvDCCAWOgAwIBAgIUTwD2tzNlp2fy95HaIWNjpXyoE4UwCgYIKoZIzj0EAwIwGzEZMBcGA1UEAwwQZG5zZ3VhcmQgdGVzdCBDQTAgFw0yNjEwMTQxMDEwMjFaGA8yMTI2MDkyMDEwMTAyMVowFDESMBAGA1UEAwwJbG9jYWxob3N0MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE74QQ+jhv410yHGrQk163ismLFpbH0koCHgfT4lQVNjcgPoWKfGiih4N0DxXaPKMiegnBg2yZ5Om9gE+rB9PCo6OBiTCBhjAJBgNVHRMEAjAAMA4GA1UdDwEB/wQEAwIHgDATBgNVHSUEDDAKBggrBgEFBQcDATAUBgNVHREEDTALgglsb2NhbGhvc3QwHQYDVR0OBBYEFCk8DsuxZnFdLVlzUAPPgY3etPIcMB8GA1UdIwQYMBaAFPma1+fQdbqAa+tFX2Zz70z8tTksMAoGCCqGSM49BAMCA0cAMEQCIBQ8q5FrWlsHplaikJZ24CezuL7Drp4AVSp5gFOse0LiAiBP+N69G2FZbPYWAq8u8eg0lY1Fd1XWjRHX58x+Q2l/2w==";
    const LEAF_KEY: &str = "MIGHAgEAMBMGByqGSM49AgEGCCqGSM49AwEHBG0wawIBAQQgTUMwPUi2FpS7Rs5/RAHjKIbfTFH3v0q7748WPaT4iuKhRANCAATvhBD6OG/jXTIcatCTXreKyYsWlsfSSgIeB9PiVBU2NyA+hYp8aKKHg3QPFdo8oyJ6CcGDbJnk6b2AT6sH08Kj";

    fn test_client_config() -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(&Certificate(STANDARD.decode(CA_CERT).unwrap())).unwrap();
        ClientConfig::builder().with_safe_defaults().with_root_certificates(roots).with_no_client_auth()
    }

    fn test_server_config() -> ServerConfig {
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![Certificate(STANDARD.decode(LEAF_CERT).unwrap())], PrivateKey(STANDARD.decode(LEAF_KEY).unwrap()))
            .unwrap()
    }

    /// Answers `per_conn` queries on each accepted connection, then closes it.
    async fn serve_tls(listener: TcpListener, per_conn: usize, accepted: Arc<AtomicUsize>) {
        let acceptor = TlsAcceptor::from(Arc::new(test_server_config()));
        loop {
            let (tcp, _) = listener.accept().await.unwrap();
            accepted.fetch_add(1, Ordering::SeqCst);
            let mut tls = acceptor.accept(tcp).await.unwrap();
            for _ in 0..per_conn {
                let Ok(packet) = read_framed(&mut tls, Duration::from_secs(5)).await else { break };
                let req = Message::from_vec(&packet).unwrap();
                let mut resp = make_reply(&req);
                resp.add_answer(Record::from_rdata(req.queries()[0].name().clone(), 60, RData::A(A(Ipv4Addr::new(10, 0, 0, 53)))));
                write_framed(&mut tls, &resp.to_vec().unwrap()).await.unwrap();
            }
            let _ = tls.shutdown().await;
        }
    }

    fn query(id: u16) -> Message {
        let mut req = Message::new();
        req.set_id(id).set_recursion_desired(true);
        req.add_query(Query::query(fqdn("example.com").unwrap(), RecordType::A));
        req
    }

    fn upstream() -> DnsOverTls {
        let bs = Arc::new(Bootstrap::new(&[], DEFAULT_TIMEOUT).unwrap());
        DnsOverTls::new("tls://1.1.1.1", "1.1.1.1".into(), "1.1.1.1".into(), 853, bs, DEFAULT_TIMEOUT)
    }

    #[test]
    fn pool_is_created_once() {
        let up = upstream();
        assert!(up.pool.read().is_none());
        let first = up.pool();
        let second = up.pool();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unreachable_resolver_reports_pool_context() {
        let bs = Arc::new(Bootstrap::new(&[], DEFAULT_TIMEOUT).unwrap());
        // nothing listens on port 9 of loopback
        let up = DnsOverTls::new("tls://127.0.0.1:9", "127.0.0.1".into(), "127.0.0.1".into(), 9, bs, Duration::from_millis(500));
        let mut req = Message::new();
        req.add_query(hickory_proto::op::Query::query(crate::types::fqdn("example.com").unwrap(), hickory_proto::rr::RecordType::A));
        let err = up.exchange(&req).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to get a connection from TLSPool to tls://127.0.0.1:9"));
    }

    #[tokio::test]
    async fn pooled_connection_is_reused_and_redialed_when_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_tls(listener, 2, accepted.clone()));

        let address = format!("tls://localhost:{}", port);
        let bs = Arc::new(Bootstrap::new(&[], DEFAULT_TIMEOUT).unwrap());
        let up = DnsOverTls::new(&address, "localhost".into(), "127.0.0.1".into(), port, bs, Duration::from_secs(2))
            .with_tls_config(test_client_config());
        let hits = || POOL_CONN_HITS.with_label_values(&["tls", &address]).get();

        let reply = up.exchange(&query(1)).await.unwrap();
        assert_eq!(reply.id(), 1);
        assert_eq!(hits(), 0);

        let reply = up.exchange(&query(2)).await.unwrap();
        assert_eq!(reply.id(), 2);
        assert_eq!(hits(), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        // the server has closed the pooled connection after two answers
        let reply = up.exchange(&query(3)).await.unwrap();
        assert_eq!(reply.id(), 3);
        assert_eq!(reply.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::new(10, 0, 0, 53)))));
        assert_eq!(hits(), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(up.pool().idle.lock().await.len(), 1);
    }
}
