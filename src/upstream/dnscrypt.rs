//! DNSCrypt v2 client.

use crate::types::fqdn;
use crate::upstream::plain::PlainDns;
use crate::upstream::{read_framed, write_framed, Upstream};
use anyhow::{Context, Result};
use crypto_box::aead::{AeadInPlace, Nonce, OsRng, Tag};
use crypto_box::{ChaChaBox, PublicKey, SalsaBox, SecretKey};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{RData, RecordType};
use rand::RngCore;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use std::net::SocketAddr;
use std::sync::Arc;

const CERT_MAGIC: &[u8; 4] = b"DNSC";
const RESOLVER_MAGIC: [u8; 8] = [0x72, 0x36, 0x66, 0x6e, 0x76, 0x57, 0x6a, 0x38];
const CERT_MIN_LEN: usize = 124;
const HALF_NONCE: usize = 12;
const TAG_LEN: usize = 16;
const MIN_UDP_QUESTION: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsVersion {
    XSalsa20Poly1305,
    XChacha20Poly1305,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cert {
    pub es_version: EsVersion,
    pub resolver_pk: [u8; 32],
    pub client_magic: [u8; 8],
    pub serial: u32,
    pub not_before: u32,
    pub not_after: u32,
}

impl Cert {
    /// Parses and verifies one certificate against the provider key.
    pub fn parse(bin: &[u8], provider_pk: &VerifyingKey) -> Result<Cert> {
        if bin.len() < CERT_MIN_LEN { anyhow::bail!("certificate is too short: {} bytes", bin.len()); }
        if &bin[..4] != CERT_MAGIC { anyhow::bail!("invalid certificate magic"); }

        let es_version = match u16::from_be_bytes([bin[4], bin[5]]) {
            1 => EsVersion::XSalsa20Poly1305,
            2 => EsVersion::XChacha20Poly1305,
            v => anyhow::bail!("unsupported encryption system {}", v),
        };
        if bin[6] != 0 || bin[7] != 0 { anyhow::bail!("unsupported certificate minor version"); }

        let mut sig = [0u8; 64];
        sig.copy_from_slice(&bin[8..72]);
        provider_pk.verify(&bin[72..], &Signature::from_bytes(&sig))
            .map_err(|_| anyhow::anyhow!("incorrect certificate signature"))?;

        let be32 = |at: usize| u32::from_be_bytes([bin[at], bin[at + 1], bin[at + 2], bin[at + 3]]);
        let mut resolver_pk = [0u8; 32];
        resolver_pk.copy_from_slice(&bin[72..104]);
        let mut client_magic = [0u8; 8];
        client_magic.copy_from_slice(&bin[104..112]);
        Ok(Cert { es_version, resolver_pk, client_magic, serial: be32(112), not_before: be32(116), not_after: be32(120) })
    }

    pub fn is_valid_at(&self, now: u32) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

enum Cipher {
    Salsa(SalsaBox),
    ChaCha(ChaChaBox),
}

fn seal_with<A: AeadInPlace>(cipher: &A, nonce: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let mut buf = plain.to_vec();
    let tag = cipher.encrypt_in_place_detached(Nonce::<A>::from_slice(nonce), b"", &mut buf)
        .map_err(|_| anyhow::anyhow!("encryption failed"))?;
    let mut out = Vec::with_capacity(TAG_LEN + buf.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&buf);
    Ok(out)
}

fn open_with<A: AeadInPlace>(cipher: &A, nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < TAG_LEN { anyhow::bail!("encrypted message is too short"); }
    let (tag, body) = sealed.split_at(TAG_LEN);
    let mut buf = body.to_vec();
    cipher.decrypt_in_place_detached(Nonce::<A>::from_slice(nonce), b"", &mut buf, Tag::<A>::from_slice(tag))
        .map_err(|_| anyhow::anyhow!("decryption failed"))?;
    Ok(buf)
}

impl Cipher {
    fn new(es: EsVersion, resolver_pk: &PublicKey, secret: &SecretKey) -> Self {
        match es {
            EsVersion::XSalsa20Poly1305 => Cipher::Salsa(SalsaBox::new(resolver_pk, secret)),
            EsVersion::XChacha20Poly1305 => Cipher::ChaCha(ChaChaBox::new(resolver_pk, secret)),
        }
    }

    fn seal(&self, nonce: &[u8; 24], plain: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Salsa(c) => seal_with(c, nonce, plain),
            Cipher::ChaCha(c) => seal_with(c, nonce, plain),
        }
    }

    fn open(&self, nonce: &[u8; 24], sealed: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Salsa(c) => open_with(c, nonce, sealed),
            Cipher::ChaCha(c) => open_with(c, nonce, sealed),
        }
    }
}

/// ISO/IEC 7816-4 padding up to a multiple of 64 bytes and at least `min_len`.
pub fn pad(packet: &[u8], min_len: usize) -> Vec<u8> {
    let mut out = packet.to_vec();
    out.push(0x80);
    while out.len() < min_len || out.len() % 64 != 0 {
        out.push(0);
    }
    out
}

pub fn unpad(packet: &[u8]) -> Result<&[u8]> {
    let end = packet.iter().rposition(|&b| b != 0).ok_or_else(|| anyhow::anyhow!("invalid padding"))?;
    if packet[end] != 0x80 { anyhow::bail!("invalid padding"); }
    Ok(&packet[..end])
}

struct Session {
    cert: Cert,
    cipher: Cipher,
    client_pk: [u8; 32],
}

impl Session {
    fn new(cert: Cert) -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let client_pk = *secret.public_key().as_bytes();
        let cipher = Cipher::new(cert.es_version, &PublicKey::from(cert.resolver_pk), &secret);
        Self { cert, cipher, client_pk }
    }

    fn encrypt(&self, packet: &[u8], min_len: usize) -> Result<(Vec<u8>, [u8; HALF_NONCE])> {
        let mut client_nonce = [0u8; HALF_NONCE];
        rand::thread_rng().fill_bytes(&mut client_nonce);
        let mut nonce = [0u8; 24];
        nonce[..HALF_NONCE].copy_from_slice(&client_nonce);

        let sealed = self.cipher.seal(&nonce, &pad(packet, min_len))?;
        let mut out = Vec::with_capacity(8 + 32 + HALF_NONCE + sealed.len());
        out.extend_from_slice(&self.cert.client_magic);
        out.extend_from_slice(&self.client_pk);
        out.extend_from_slice(&client_nonce);
        out.extend_from_slice(&sealed);
        Ok((out, client_nonce))
    }

    fn decrypt(&self, packet: &[u8], client_nonce: &[u8; HALF_NONCE]) -> Result<Message> {
        if packet.len() < 8 + 24 + TAG_LEN { anyhow::bail!("response is too short"); }
        if packet[..8] != RESOLVER_MAGIC { anyhow::bail!("invalid response magic"); }
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&packet[8..32]);
        if &nonce[..HALF_NONCE] != client_nonce { anyhow::bail!("unexpected nonce in response"); }

        let plain = self.cipher.open(&nonce, &packet[32..])?;
        Ok(Message::from_vec(unpad(&plain)?)?)
    }
}

pub struct DnsCrypt {
    address: String,
    server: String,
    provider_name: String,
    provider_pk: [u8; 32],
    timeout: Duration,
    session: RwLock<Option<Arc<Session>>>,
}

fn unix_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}

impl DnsCrypt {
    pub fn new(address: &str, server: String, provider_name: String, provider_pk: [u8; 32], timeout: Duration) -> Self {
        Self { address: address.to_string(), server, provider_name, provider_pk, timeout, session: RwLock::new(None) }
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let now = unix_now();
        if let Some(s) = self.session.read().await.as_ref() {
            if s.cert.not_after >= now { return Ok(s.clone()); }
        }
        let mut guard = self.session.write().await;
        if let Some(s) = guard.as_ref() {
            if s.cert.not_after >= now { return Ok(s.clone()); }
        }
        let session = Arc::new(Session::new(self.fetch_cert().await?));
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn fetch_cert(&self) -> Result<Cert> {
        tracing::debug!("Fetching DNSCrypt certificate for {} from {}", self.provider_name, self.server);
        let provider_pk = VerifyingKey::from_bytes(&self.provider_pk)
            .map_err(|_| anyhow::anyhow!("invalid provider public key"))?;

        let mut req = Message::new();
        req.set_id(rand::random()).set_recursion_desired(true);
        req.add_query(Query::query(fqdn(&self.provider_name)?, RecordType::TXT));
        let resolver = PlainDns::new(&self.address, self.server.clone(), false, self.timeout);
        let reply = resolver.exchange(&req).await?;

        let now = unix_now();
        let mut best: Option<Cert> = None;
        for record in reply.answers() {
            let Some(RData::TXT(txt)) = record.data() else { continue };
            let bin: Vec<u8> = txt.txt_data().iter().flat_map(|chunk| chunk.iter().copied()).collect();
            match Cert::parse(&bin, &provider_pk) {
                Ok(cert) if cert.is_valid_at(now) => {
                    if best.as_ref().map_or(true, |b| cert.serial > b.serial) { best = Some(cert); }
                }
                Ok(cert) => tracing::debug!("Skipping DNSCrypt certificate {} outside its validity period", cert.serial),
                Err(e) => tracing::debug!("Skipping DNSCrypt certificate: {:#}", e),
            }
        }
        best.ok_or_else(|| anyhow::anyhow!("no valid DNSCrypt certificate for {}", self.provider_name))
    }

    async fn server_addr(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.server.parse::<SocketAddr>() { return Ok(addr); }
        lookup_host(&self.server).await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no addresses found for {}", self.server))
    }

    async fn exchange_udp(&self, session: &Session, packet: &[u8]) -> Result<Message> {
        let (query, nonce) = session.encrypt(packet, MIN_UDP_QUESTION)?;
        let addr = self.server_addr().await?;
        let socket = UdpSocket::bind(if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;
        socket.connect(addr).await?;
        socket.send(&query).await?;

        let mut buf = vec![0u8; 65535];
        let len = match timeout(self.timeout, socket.recv(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                // 服务端可能已轮换密钥，下次请求重新获取证书
                *self.session.write().await = None;
                anyhow::bail!("i/o timeout");
            }
        };
        session.decrypt(&buf[..len], &nonce)
    }

    async fn exchange_tcp(&self, session: &Session, packet: &[u8]) -> Result<Message> {
        let (query, nonce) = session.encrypt(packet, 0)?;
        let mut stream = timeout(self.timeout, TcpStream::connect(&self.server)).await
            .map_err(|_| anyhow::anyhow!("dial timeout"))??;
        write_framed(&mut stream, &query).await?;
        let resp = read_framed(&mut stream, self.timeout).await?;
        session.decrypt(&resp, &nonce)
    }
}

#[async_trait::async_trait]
impl Upstream for DnsCrypt {
    async fn exchange(&self, req: &Message) -> Result<Message> {
        let session = self.session().await
            .with_context(|| format!("failed to fetch certificate info from {}", self.address))?;
        let packet = req.to_vec()?;

        let reply = self.exchange_udp(&session, &packet).await
            .with_context(|| format!("DNSCrypt exchange with {} failed", self.address))?;
        if reply.truncated() {
            tracing::debug!("Truncated message was received from {}, retrying over TCP", self.address);
            return self.exchange_tcp(&session, &packet).await
                .with_context(|| format!("DNSCrypt TCP exchange with {} failed", self.address));
        }
        Ok(reply)
    }

    fn address(&self) -> &str { &self.address }
}
