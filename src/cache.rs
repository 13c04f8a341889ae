//! Two-tier DNS response caching using moka.
//!
//! The general tier is keyed by (qname, qtype, qclass); the subnet tier adds
//! the client network carried in ECS, so answers tailored to one subnet are
//! never served to another. TTLs are clamped at insert time and decremented
//! on retrieval; entries whose TTL has fully elapsed are invisible.

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use moka::future::Cache;
use moka::Expiry;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::ecs::mask_ip;

/// Cache key: (normalized qname, qtype, qclass)
type CacheKey = (String, u16, u16);

/// TTL clamping bounds in seconds; 0 disables a bound
#[derive(Debug, Clone, Copy, Default)]
pub struct TtlBounds {
    pub min_ttl: u32,
    pub max_ttl: u32,
}

impl TtlBounds {
    fn clamp(&self, ttl: u32) -> u32 {
        let mut ttl = ttl;
        if self.min_ttl > 0 {
            ttl = ttl.max(self.min_ttl);
        }
        if self.max_ttl > 0 {
            ttl = ttl.min(self.max_ttl);
        }
        ttl
    }
}

/// A stored answer with its insertion time and effective lifetime
#[derive(Clone)]
struct CacheEntry {
    answer: Message,
    ttl_secs: u32,
    inserted_at: Instant,
}

impl CacheEntry {
    /// Build an entry from a response, or `None` when it must not be cached.
    ///
    /// Record TTLs in the stored answer are clamped to the configured bounds;
    /// the entry lifetime is the minimum clamped TTL.
    fn build(response: &Message, bounds: TtlBounds) -> Option<Self> {
        let ttl_secs = cachable_ttl(response, bounds)?;

        Some(Self {
            answer: rebuild_with_ttls(response, |ttl| bounds.clamp(ttl)),
            ttl_secs,
            inserted_at: Instant::now(),
        })
    }

    /// Deep copy with the id rewritten to the request's and record TTLs
    /// decremented by the time the entry spent in the cache. `None` once the
    /// lifetime has fully elapsed.
    fn to_response(&self, request: &Message) -> Option<Message> {
        let elapsed = self.inserted_at.elapsed().as_secs();
        if elapsed >= u64::from(self.ttl_secs) {
            return None;
        }

        let elapsed = elapsed as u32;
        let mut response = rebuild_with_ttls(&self.answer, |ttl| ttl.saturating_sub(elapsed));
        response.set_id(request.id());
        Some(response)
    }
}

/// Per-entry expiry driven by the stored TTL
struct AnswerExpiry;

impl Expiry<CacheKey, CacheEntry> for AnswerExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(Duration::from_secs(u64::from(value.ttl_secs)))
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl CacheStats {
    /// Hit rate percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// General response cache
pub struct DnsCache {
    cache: Cache<CacheKey, CacheEntry>,
    bounds: TtlBounds,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DnsCache {
    pub fn new(max_entries: u64, bounds: TtlBounds) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(AnswerExpiry)
            .build();

        Self {
            cache,
            bounds,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up the cached answer for a query, rewriting the message id and
    /// the remaining TTLs.
    pub async fn get(&self, request: &Message) -> Option<Message> {
        let key = request_key(request)?;

        if let Some(entry) = self.cache.get(&key).await {
            if let Some(response) = entry.to_response(request) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!("Cache HIT: {} type {}", key.0, key.1);
                return Some(response);
            }
            // expired but not yet evicted
            self.cache.invalidate(&key).await;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!("Cache MISS: {} type {}", key.0, key.1);
        None
    }

    /// Store a response if it is cachable
    pub async fn set(&self, response: &Message) {
        let Some(key) = request_key(response) else {
            return;
        };
        let Some(entry) = CacheEntry::build(response, self.bounds) else {
            return;
        };

        trace!("Caching {} type {} for {}s", key.0, key.1, entry.ttl_secs);
        self.cache.insert(key, entry).await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}

/// One subnet-tier record: an answer valid for `network/mask`
#[derive(Clone)]
struct SubnetEntry {
    network: IpAddr,
    mask: u8,
    entry: CacheEntry,
}

impl SubnetEntry {
    fn remaining(&self) -> Duration {
        let lifetime = Duration::from_secs(u64::from(self.entry.ttl_secs));
        lifetime.saturating_sub(self.entry.inserted_at.elapsed())
    }
}

/// Container expiry: a key lives as long as its longest-lived entry
struct SubnetExpiry;

impl Expiry<CacheKey, Arc<Vec<SubnetEntry>>> for SubnetExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Arc<Vec<SubnetEntry>>,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.iter().map(|e| e.remaining()).max()
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Arc<Vec<SubnetEntry>>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.iter().map(|e| e.remaining()).max()
    }
}

/// Subnet-partitioned response cache.
///
/// Every key holds an ordered list of (network, mask, answer) tuples, longest
/// prefix first, so aggregated answers (scope shorter than the source we
/// sent) serve broader client sets.
pub struct SubnetCache {
    cache: Cache<CacheKey, Arc<Vec<SubnetEntry>>>,
    bounds: TtlBounds,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SubnetCache {
    pub fn new(max_entries: u64, bounds: TtlBounds) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(SubnetExpiry)
            .build();

        Self {
            cache,
            bounds,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Longest-prefix lookup for a client address.
    ///
    /// Returns the answer and the mask that actually matched.
    pub async fn get_with_subnet(
        &self,
        request: &Message,
        ip: IpAddr,
        mask: u8,
    ) -> Option<(Message, u8)> {
        let key = request_key(request)?;

        if let Some(entries) = self.cache.get(&key).await {
            for stored in entries.iter() {
                if stored.mask > mask {
                    continue;
                }
                if mask_ip(ip, stored.mask) != stored.network {
                    continue;
                }
                if let Some(response) = stored.entry.to_response(request) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        "Subnet cache HIT: {} for {}/{}",
                        key.0,
                        stored.network,
                        stored.mask
                    );
                    return Some((response, stored.mask));
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response under `ip/mask` if it is cachable.
    ///
    /// Entries are immutable once inserted; storing the same network again
    /// replaces the whole tuple.
    pub async fn set_with_subnet(&self, response: &Message, ip: IpAddr, mask: u8) {
        let Some(key) = request_key(response) else {
            return;
        };
        let Some(entry) = CacheEntry::build(response, self.bounds) else {
            return;
        };

        let network = mask_ip(ip, mask);
        let mut entries: Vec<SubnetEntry> = self
            .cache
            .get(&key)
            .await
            .map(|existing| {
                existing
                    .iter()
                    .filter(|e| !(e.mask == mask && e.network == network))
                    .filter(|e| !e.remaining().is_zero())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        entries.push(SubnetEntry {
            network,
            mask,
            entry,
        });
        entries.sort_by(|a, b| b.mask.cmp(&a.mask));

        trace!("Caching {} for {}/{}", key.0, network, mask);
        self.cache.insert(key, Arc::new(entries)).await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}

/// Build the cache key from a message's first question.
///
/// The name is lowercased into trailing-dot form so semantically identical
/// queries share an entry. ANY queries are never keyed.
fn request_key(message: &Message) -> Option<CacheKey> {
    let query = message.queries().first()?;
    if query.query_type() == RecordType::ANY {
        return None;
    }

    let mut name = query.name().to_string().to_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }

    Some((name, query.query_type().into(), query.query_class().into()))
}

/// Effective TTL for a response, or `None` when it must not be cached.
///
/// Positive answers and NXDOMAIN-with-SOA are cachable; SERVFAIL, REFUSED and
/// answerless NOERROR responses are not.
fn cachable_ttl(response: &Message, bounds: TtlBounds) -> Option<u32> {
    match response.response_code() {
        ResponseCode::NoError => {
            let min_ttl = response.answers().iter().map(|r| r.ttl()).min()?;
            Some(bounds.clamp(min_ttl))
        }
        ResponseCode::NXDomain => {
            let min_soa_ttl = response
                .name_servers()
                .iter()
                .filter(|r| r.record_type() == RecordType::SOA)
                .map(|r| r.ttl())
                .min()?;
            Some(bounds.clamp(min_soa_ttl))
        }
        _ => None,
    }
}

/// Deep-copy a message, mapping answer and authority TTLs through `f`.
/// Additionals and the OPT record are carried unchanged.
fn rebuild_with_ttls(message: &Message, f: impl Fn(u32) -> u32) -> Message {
    let mut rebuilt = Message::new();
    rebuilt.set_id(message.id());
    rebuilt.set_message_type(message.message_type());
    rebuilt.set_op_code(message.op_code());
    rebuilt.set_authoritative(message.authoritative());
    rebuilt.set_truncated(message.truncated());
    rebuilt.set_recursion_desired(message.recursion_desired());
    rebuilt.set_recursion_available(message.recursion_available());
    rebuilt.set_response_code(message.response_code());

    for query in message.queries() {
        rebuilt.add_query(query.clone());
    }
    for record in message.answers() {
        let mut record = record.clone();
        let ttl = record.ttl();
        record.set_ttl(f(ttl));
        rebuilt.add_answer(record);
    }
    for record in message.name_servers() {
        let mut record = record.clone();
        let ttl = record.ttl();
        record.set_ttl(f(ttl));
        rebuilt.add_name_server(record);
    }
    for record in message.additionals() {
        rebuilt.add_additional(record.clone());
    }
    if let Some(edns) = message.extensions().clone() {
        rebuilt.set_edns(edns);
    }

    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::SOA;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn create_test_query(domain: &str) -> Message {
        let mut message = Message::new();
        message.set_id(1234);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);

        let name = Name::from_str(domain).unwrap();
        message.add_query(Query::query(name, RecordType::A));

        message
    }

    fn create_test_response(domain: &str, ip: Ipv4Addr, ttl: u32) -> Message {
        let mut response = create_test_query(domain);
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NoError);

        let name = Name::from_str(domain).unwrap();
        response.add_answer(Record::from_rdata(name, ttl, RData::A(ip.into())));

        response
    }

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let cache = DnsCache::new(100, TtlBounds::default());
        let query = create_test_query("example.com.");

        assert!(cache.get(&query).await.is_none());

        let response = create_test_response("example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);
        cache.set(&response).await;

        let hit = cache.get(&query).await.expect("should be cached");
        assert_eq!(hit.id(), query.id());
        assert_eq!(hit.answers().len(), 1);
        assert_eq!(hit.answers()[0].ttl(), 300);

        // Different query type misses
        let mut aaaa = Message::new();
        aaaa.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::AAAA,
        ));
        assert!(cache.get(&aaaa).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_cache_key_is_case_insensitive() {
        let cache = DnsCache::new(100, TtlBounds::default());

        let response = create_test_response("Example.COM.", Ipv4Addr::new(1, 2, 3, 4), 300);
        cache.set(&response).await;

        let query = create_test_query("example.com.");
        assert!(cache.get(&query).await.is_some());
    }

    #[tokio::test]
    async fn test_cache_id_rewrite() {
        let cache = DnsCache::new(100, TtlBounds::default());

        let response = create_test_response("example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);
        cache.set(&response).await;

        let mut query = create_test_query("example.com.");
        query.set_id(4321);
        let hit = cache.get(&query).await.unwrap();
        assert_eq!(hit.id(), 4321);
    }

    #[tokio::test]
    async fn test_ttl_clamping() {
        let bounds = TtlBounds {
            min_ttl: 20,
            max_ttl: 40,
        };
        let cache = DnsCache::new(100, bounds);
        let query = create_test_query("example.com.");

        let response = create_test_response("example.com.", Ipv4Addr::new(1, 2, 3, 4), 10);
        cache.set(&response).await;
        let hit = cache.get(&query).await.unwrap();
        assert_eq!(hit.answers()[0].ttl(), 20);

        let response = create_test_response("example.com.", Ipv4Addr::new(1, 2, 3, 4), 60);
        cache.set(&response).await;
        let hit = cache.get(&query).await.unwrap();
        assert_eq!(hit.answers()[0].ttl(), 40);
    }

    #[tokio::test]
    async fn test_servfail_not_cached() {
        let cache = DnsCache::new(100, TtlBounds::default());

        let mut response = create_test_response("example.com.", Ipv4Addr::new(1, 2, 3, 4), 300);
        response.set_response_code(ResponseCode::ServFail);
        cache.set(&response).await;

        let query = create_test_query("example.com.");
        assert!(cache.get(&query).await.is_none());
    }

    #[tokio::test]
    async fn test_answerless_noerror_not_cached() {
        let cache = DnsCache::new(100, TtlBounds::default());

        let mut response = create_test_query("example.com.");
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NoError);
        cache.set(&response).await;

        let query = create_test_query("example.com.");
        assert!(cache.get(&query).await.is_none());
    }

    #[tokio::test]
    async fn test_nxdomain_with_soa_cached() {
        let cache = DnsCache::new(100, TtlBounds::default());

        let mut response = create_test_query("missing.example.com.");
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NXDomain);

        let soa = SOA::new(
            Name::from_str("ns1.example.com.").unwrap(),
            Name::from_str("admin.example.com.").unwrap(),
            1,
            3600,
            600,
            86400,
            60,
        );
        response.add_name_server(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            60,
            RData::SOA(soa),
        ));
        cache.set(&response).await;

        let query = create_test_query("missing.example.com.");
        let hit = cache.get(&query).await.expect("negative answer should be cached");
        assert_eq!(hit.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn test_any_never_cached() {
        let cache = DnsCache::new(100, TtlBounds::default());

        let mut response = Message::new();
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NoError);
        let name = Name::from_str("example.com.").unwrap();
        response.add_query(Query::query(name.clone(), RecordType::ANY));
        response.add_answer(Record::from_rdata(
            name,
            300,
            RData::A(Ipv4Addr::new(1, 2, 3, 4).into()),
        ));
        cache.set(&response).await;

        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_subnet_partitioning() {
        let cache = SubnetCache::new(100, TtlBounds::default());
        let query = create_test_query("host.");

        let answer_a = create_test_response("host.", Ipv4Addr::new(4, 3, 2, 1), 60);
        cache
            .set_with_subnet(&answer_a, "1.2.3.0".parse().unwrap(), 24)
            .await;

        let answer_b = create_test_response("host.", Ipv4Addr::new(4, 3, 2, 2), 60);
        cache
            .set_with_subnet(&answer_b, "2.2.3.0".parse().unwrap(), 24)
            .await;

        // Another client in the first /24 sees the first answer
        let (hit, mask) = cache
            .get_with_subnet(&query, "1.2.3.77".parse().unwrap(), 24)
            .await
            .expect("same subnet should hit");
        assert_eq!(mask, 24);
        assert_eq!(hit.answers()[0].data().clone(), RData::A(Ipv4Addr::new(4, 3, 2, 1).into()));

        let (hit, _) = cache
            .get_with_subnet(&query, "2.2.3.99".parse().unwrap(), 24)
            .await
            .expect("other subnet should hit its own entry");
        assert_eq!(hit.answers()[0].data().clone(), RData::A(Ipv4Addr::new(4, 3, 2, 2).into()));

        // A third subnet has no entry
        assert!(cache
            .get_with_subnet(&query, "3.0.0.1".parse().unwrap(), 24)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_subnet_longest_prefix_wins() {
        let cache = SubnetCache::new(100, TtlBounds::default());
        let query = create_test_query("host.");

        // An aggregated /16 answer and a narrower /24 one
        let wide = create_test_response("host.", Ipv4Addr::new(10, 0, 0, 1), 60);
        cache
            .set_with_subnet(&wide, "1.2.0.0".parse().unwrap(), 16)
            .await;

        let narrow = create_test_response("host.", Ipv4Addr::new(10, 0, 0, 2), 60);
        cache
            .set_with_subnet(&narrow, "1.2.3.0".parse().unwrap(), 24)
            .await;

        let (hit, mask) = cache
            .get_with_subnet(&query, "1.2.3.50".parse().unwrap(), 24)
            .await
            .unwrap();
        assert_eq!(mask, 24);
        assert_eq!(hit.answers()[0].data().clone(), RData::A(Ipv4Addr::new(10, 0, 0, 2).into()));

        // A client outside the /24 but inside the /16 gets the aggregate
        let (hit, mask) = cache
            .get_with_subnet(&query, "1.2.4.50".parse().unwrap(), 24)
            .await
            .unwrap();
        assert_eq!(mask, 16);
        assert_eq!(hit.answers()[0].data().clone(), RData::A(Ipv4Addr::new(10, 0, 0, 1).into()));
    }

    #[tokio::test]
    async fn test_subnet_scope_zero_matches_everyone() {
        let cache = SubnetCache::new(100, TtlBounds::default());
        let query = create_test_query("host.");

        let answer = create_test_response("host.", Ipv4Addr::new(10, 0, 0, 1), 60);
        cache
            .set_with_subnet(&answer, "1.2.3.0".parse().unwrap(), 0)
            .await;

        let (_, mask) = cache
            .get_with_subnet(&query, "9.9.9.9".parse().unwrap(), 24)
            .await
            .expect("scope 0 entries apply to every client");
        assert_eq!(mask, 0);
    }
}
