use crate::dns_server::Server;
use crate::types::{make_reply, Proto};
use anyhow::{Context, Result};
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const MIN_UDP_PAYLOAD: usize = 512;
const MAX_UDP_PAYLOAD: usize = 1232;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound UDP and TCP sockets plus their accept loops.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Optional bound on concurrently processed queries.
#[derive(Clone)]
struct Limiter(Option<Arc<Semaphore>>);

impl Limiter {
    async fn acquire(&self) -> Option<Option<OwnedSemaphorePermit>> {
        match &self.0 {
            None => Some(None),
            Some(sem) => sem.clone().acquire_owned().await.ok().map(Some),
        }
    }
}

impl Listener {
    pub async fn bind(server: Arc<Server>, addr: SocketAddr, max_concurrent: usize) -> Result<Self> {
        let udp = Arc::new(UdpSocket::bind(addr).await.with_context(|| format!("Failed to bind UDP {}", addr))?);
        let local_addr = udp.local_addr()?;
        // TCP 与 UDP 共用同一端口（端口为 0 时取 UDP 实际分配的端口）
        let tcp = TcpListener::bind(local_addr).await.with_context(|| format!("Failed to bind TCP {}", local_addr))?;
        tracing::info!("DNS server listening on {} (udp, tcp)", local_addr);

        let limiter = Limiter((max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(serve_udp(server.clone(), udp, limiter.clone(), shutdown_rx.clone())),
            tokio::spawn(serve_tcp(server, tcp, limiter, shutdown_rx)),
        ];
        Ok(Self { local_addr, shutdown_tx, tasks })
    }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Stops accepting and waits for both loops to exit; in-flight queries finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for t in self.tasks {
            let _ = t.await;
        }
        tracing::info!("DNS server on {} stopped", self.local_addr);
    }
}

fn udp_size_limit(req: &Message) -> usize {
    req.extensions().as_ref()
        .map(|e| (e.max_payload() as usize).max(MIN_UDP_PAYLOAD))
        .unwrap_or(MIN_UDP_PAYLOAD)
        .min(MAX_UDP_PAYLOAD)
}

/// Wire bytes for a UDP reply; too large answers become an empty reply with TC set.
fn encode_udp(req: &Message, resp: &Message) -> Option<Vec<u8>> {
    let bytes = match resp.to_vec() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Failed to encode response: {}", e);
            return None;
        }
    };
    if bytes.len() <= udp_size_limit(req) { return Some(bytes); }

    let mut truncated = make_reply(req);
    truncated.set_response_code(resp.response_code())
        .set_recursion_available(resp.recursion_available())
        .set_truncated(true);
    truncated.to_vec().ok()
}

/// Prefixes a TCP reply with its 2-byte length.
fn frame_tcp(bytes: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| anyhow::anyhow!("response too large for TCP: {} bytes", bytes.len()))?;
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

async fn serve_udp(server: Arc<Server>, socket: Arc<UdpSocket>, limiter: Limiter, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (size, src) = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!("UDP read error: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };

        let req = match Message::from_vec(&buf[..size]) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Dropping unparseable packet from {}: {}", src, e);
                continue;
            }
        };

        let Some(permit) = limiter.acquire().await else { return };
        let server = server.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let Some(resp) = server.handle_dns_request(req.clone(), src, Proto::Udp).await else { return };
            if let Some(bytes) = encode_udp(&req, &resp) {
                if let Err(e) = socket.send_to(&bytes, src).await {
                    tracing::debug!("Failed to send UDP response to {}: {}", src, e);
                }
            }
        });
    }
}

async fn serve_tcp(server: Arc<Server>, listener: TcpListener, limiter: Limiter, mut shutdown: watch::Receiver<bool>) {
    loop {
        let (stream, src) = tokio::select! {
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!("TCP accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };
        let server = server.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_conn(server, stream, src, limiter).await {
                tracing::debug!("TCP connection from {} closed: {:#}", src, e);
            }
        });
    }
}

/// Serves queries on one connection until the client closes it or goes idle.
async fn handle_tcp_conn(server: Arc<Server>, mut stream: TcpStream, src: SocketAddr, limiter: Limiter) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut query)).await.context("read timeout")??;

        let req = match Message::from_vec(&query) {
            Ok(m) => m,
            Err(e) => anyhow::bail!("unparseable query: {}", e),
        };

        let Some(_permit) = limiter.acquire().await else { return Ok(()) };
        let Some(resp) = server.handle_dns_request(req, src, Proto::Tcp).await else { continue };
        let framed = frame_tcp(&resp.to_vec()?)?;
        stream.write_all(&framed).await?;
    }
}
