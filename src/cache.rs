//! Response cache keyed on the question, with TTLs recomputed on every hit.

use crate::stats::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
use crate::types::make_reply;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Record, RecordType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub qtype: u16,
    pub qclass: u16,
    /// Lowercased, with the trailing dot.
    pub name: String,
}

impl CacheKey {
    pub fn of(msg: &Message) -> Option<CacheKey> {
        let q = msg.queries().first()?;
        Some(CacheKey {
            qtype: u16::from(q.query_type()),
            qclass: u16::from(q.query_class()),
            name: q.name().to_ascii().to_lowercase(),
        })
    }
}

#[derive(Clone)]
struct CacheEntry {
    response: Message,
    cached_at: Instant,
}

#[derive(Default)]
pub struct ResponseCache {
    items: RwLock<HashMap<CacheKey, CacheEntry>>,
}

/// Minimum TTL over answer, authority and non-OPT additional records; 0 when there are none.
pub fn lowest_ttl(msg: &Message) -> u32 {
    msg.answers().iter()
        .chain(msg.name_servers())
        .chain(msg.additionals().iter().filter(|r| r.record_type() != RecordType::OPT))
        .map(|r| r.ttl())
        .min()
        .unwrap_or(0)
}

impl ResponseCache {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, req: &Message) -> Option<Message> {
        self.get_at(req, Instant::now())
    }

    pub fn get_at(&self, req: &Message, now: Instant) -> Option<Message> {
        let key = CacheKey::of(req)?;
        let entry = self.items.read().get(&key).cloned();
        let Some(entry) = entry else {
            CACHE_MISSES_TOTAL.inc();
            return None;
        };

        let ttl = lowest_ttl(&entry.response);
        let elapsed = now.saturating_duration_since(entry.cached_at);
        if ttl == 0 || elapsed.as_secs_f64() >= ttl as f64 {
            let mut items = self.items.write();
            // 只删除仍是同一条的过期记录，避免误删刚写入的新记录
            if items.get(&key).is_some_and(|e| e.cached_at == entry.cached_at) {
                items.remove(&key);
            }
            CACHE_MISSES_TOTAL.inc();
            return None;
        }

        let remaining = (ttl as f64 - elapsed.as_secs_f64()).round().max(0.0) as u32;
        CACHE_HITS_TOTAL.inc();
        Some(from_entry(req, &entry.response, remaining))
    }

    pub fn set(&self, resp: &Message) {
        self.set_at(resp, Instant::now());
    }

    pub fn set_at(&self, resp: &Message, now: Instant) {
        if resp.truncated() || resp.queries().len() != 1 { return; }
        if !matches!(resp.response_code(), ResponseCode::NoError | ResponseCode::NXDomain) { return; }
        if lowest_ttl(resp) == 0 { return; }
        let Some(key) = CacheKey::of(resp) else { return };

        self.items.write().insert(key, CacheEntry { response: resp.clone(), cached_at: now });
    }

    pub fn clear(&self) { self.items.write().clear(); }

    pub fn len(&self) -> usize { self.items.read().len() }

    pub fn is_empty(&self) -> bool { self.items.read().is_empty() }
}

fn with_ttl(record: &Record, ttl: u32) -> Record {
    let mut r = record.clone();
    r.set_ttl(ttl);
    r
}

fn from_entry(req: &Message, cached: &Message, ttl: u32) -> Message {
    let mut resp = make_reply(req);
    resp.set_response_code(cached.response_code())
        .set_authoritative(false)
        .set_authentic_data(cached.authentic_data())
        .set_recursion_available(cached.recursion_available());

    for r in cached.answers() { resp.add_answer(with_ttl(r, ttl)); }
    for r in cached.name_servers() { resp.add_name_server(with_ttl(r, ttl)); }
    for r in cached.additionals().iter().filter(|r| r.record_type() != RecordType::OPT) {
        resp.add_additional(with_ttl(r, ttl));
    }
    resp
}
