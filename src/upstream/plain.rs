use crate::upstream::{read_framed, write_framed, Upstream};
use anyhow::{Context, Result};
use hickory_proto::op::Message;
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};

/// Plain DNS over UDP, retried once over TCP when the reply is truncated.
pub struct PlainDns {
    address: String,
    server: String,
    prefer_tcp: bool,
    timeout: Duration,
}

impl PlainDns {
    pub fn new(address: &str, server: String, prefer_tcp: bool, timeout: Duration) -> Self {
        Self { address: address.to_string(), server, prefer_tcp, timeout }
    }

    async fn server_addr(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.server.parse::<SocketAddr>() { return Ok(addr); }
        lookup_host(&self.server).await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no addresses found for {}", self.server))
    }

    async fn exchange_udp(&self, req: &Message, packet: &[u8]) -> Result<Message> {
        let addr = self.server_addr().await?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        socket.send(packet).await?;

        let mut buf = vec![0u8; 65535];
        timeout(self.timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                match Message::from_vec(&buf[..len]) {
                    Ok(reply) if reply.id() == req.id() => return Ok::<Message, anyhow::Error>(reply),
                    // 丢弃 ID 不匹配或无法解析的迟到报文
                    Ok(_) | Err(_) => continue,
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("i/o timeout"))?
    }

    async fn exchange_tcp(&self, packet: &[u8]) -> Result<Message> {
        let mut stream = timeout(self.timeout, TcpStream::connect(&self.server)).await
            .map_err(|_| anyhow::anyhow!("dial timeout"))??;
        write_framed(&mut stream, packet).await?;
        let resp = read_framed(&mut stream, self.timeout).await?;
        Ok(Message::from_vec(&resp)?)
    }
}

#[async_trait::async_trait]
impl Upstream for PlainDns {
    async fn exchange(&self, req: &Message) -> Result<Message> {
        let packet = req.to_vec()?;
        if self.prefer_tcp {
            return self.exchange_tcp(&packet).await
                .with_context(|| format!("TCP exchange with {} failed", self.address));
        }

        let reply = self.exchange_udp(req, &packet).await
            .with_context(|| format!("UDP exchange with {} failed", self.address))?;
        if reply.truncated() {
            tracing::debug!("Truncated message was received from {}, retrying over TCP, question: {:?}", self.address, req.queries().first());
            return self.exchange_tcp(&packet).await
                .with_context(|| format!("TCP exchange with {} failed", self.address));
        }
        Ok(reply)
    }

    fn address(&self) -> &str { &self.address }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{fqdn, make_reply};
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn query(name: &str) -> Message {
        let mut m = Message::new();
        m.set_id(0xbeef).set_recursion_desired(true);
        m.add_query(Query::query(fqdn(name).unwrap(), RecordType::A));
        m
    }

    fn answer(req: &Message, ip: Ipv4Addr, truncated: bool) -> Vec<u8> {
        let mut resp = make_reply(req);
        resp.set_truncated(truncated);
        if !truncated {
            resp.add_answer(Record::from_rdata(req.queries()[0].name().clone(), 60, RData::A(A(ip))));
        }
        resp.to_vec().unwrap()
    }

    #[tokio::test]
    async fn udp_exchange() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, src) = server.recv_from(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf[..n]).unwrap();
            server.send_to(&answer(&req, Ipv4Addr::new(1, 2, 3, 4), false), src).await.unwrap();
        });

        let up = PlainDns::new(&addr.to_string(), addr.to_string(), false, Duration::from_secs(2));
        let reply = up.exchange(&query("example.com")).await.unwrap();
        assert_eq!(reply.id(), 0xbeef);
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn truncated_udp_reply_falls_back_to_tcp() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind(addr).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, src) = udp.recv_from(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf[..n]).unwrap();
            udp.send_to(&answer(&req, Ipv4Addr::UNSPECIFIED, true), src).await.unwrap();
        });
        tokio::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            let packet = read_framed(&mut stream, Duration::from_secs(2)).await.unwrap();
            let req = Message::from_vec(&packet).unwrap();
            write_framed(&mut stream, &answer(&req, Ipv4Addr::new(5, 6, 7, 8), false)).await.unwrap();
        });

        let up = PlainDns::new("dns://test", addr.to_string(), false, Duration::from_secs(2));
        let reply = up.exchange(&query("big.example.com")).await.unwrap();
        assert!(!reply.truncated());
        assert_eq!(reply.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::new(5, 6, 7, 8)))));
    }

    #[tokio::test]
    async fn udp_timeout_is_an_error() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let up = PlainDns::new(&addr.to_string(), addr.to_string(), false, Duration::from_millis(200));
        let err = up.exchange(&query("example.com")).await.unwrap_err();
        assert!(format!("{:#}", err).contains(&addr.to_string()));
        drop(silent);
    }
}
