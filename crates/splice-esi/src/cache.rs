use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;

use crate::include::FetchError;
use crate::metrics::MetricsObserver;
use crate::recency::RecencyList;
use crate::singleflight::{FlightTable, Role};
use crate::EsiConfig;

/// Fallback TTL in seconds for responses without a usable `Cache-Control`.
pub(crate) const DEFAULT_TTL: u64 = 300;

/// Hard bound on the number of cached fragments.
pub(crate) const MAX_ENTRIES: usize = 1000;

/// One cached fragment payload.
#[derive(Debug, Clone)]
pub(crate) struct FragmentEntry {
    /// Fully processed fragment body, as it will be spliced on a hit.
    pub data: Bytes,
    pub expires_at: Instant,
}

impl FragmentEntry {
    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// What a fragment fetch hands back to the cache layer: the fully processed
/// body plus the response facts that decide cacheability.
#[derive(Debug, Clone)]
pub(crate) struct FetchedFragment {
    pub body: Bytes,
    /// Status of the response the body came from. `None` for a silent
    /// failure, which is spliced but never stored.
    pub status: Option<u16>,
    pub cache_control: Option<String>,
}

/// Snapshot of cache state and counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub stampede_waits: u64,
}

struct CacheInner {
    map: HashMap<String, u32>,
    lru: RecencyList,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// URL-keyed fragment cache: bounded LRU with TTLs derived from upstream
/// `Cache-Control`, plus a single-flight table so concurrent misses on one
/// key collapse into a single fetch.
///
/// `get` promotes the entry it returns, which mutates the recency list, so
/// lookups take the write lock unconditionally. The in-flight table lives
/// beside the cache so a miss can fetch without holding the cache lock.
pub(crate) struct FragmentCache {
    inner: RwLock<CacheInner>,
    flights: FlightTable,
    observer: Option<Arc<dyn MetricsObserver>>,
    stampede_waits: AtomicU64,
    minimum_ttl: u64,
    ttl_jitter: u64,
}

impl FragmentCache {
    pub(crate) fn new(config: &EsiConfig, observer: Option<Arc<dyn MetricsObserver>>) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                map: HashMap::with_capacity(MAX_ENTRIES),
                lru: RecencyList::new(MAX_ENTRIES),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            flights: FlightTable::default(),
            observer,
            stampede_waits: AtomicU64::new(0),
            minimum_ttl: config.minimum_cache_ttl,
            ttl_jitter: config.cache_ttl_jitter,
        }
    }

    /// Look up a fragment. A present, unexpired entry is promoted to the
    /// front of the recency list. An expired entry reads as a miss and is
    /// left in place for the next `put` to overwrite or LRU pressure to
    /// reclaim.
    pub(crate) fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.write();

        let Some(&index) = inner.map.get(key) else {
            inner.misses += 1;
            self.observe(|o| o.on_cache_miss());
            return None;
        };

        let expired = inner
            .lru
            .occupant(index)
            .expect("map entry points at a resident slot")
            .entry
            .is_expired();
        if expired {
            inner.misses += 1;
            self.observe(|o| o.on_cache_miss());
            return None;
        }

        let data = inner
            .lru
            .occupant(index)
            .expect("map entry points at a resident slot")
            .entry
            .data
            .clone();
        inner.lru.touch(index);
        inner.hits += 1;
        self.observe(|o| o.on_cache_hit());
        Some(data)
    }

    /// Store a fragment. The TTL derives from the response's
    /// `Cache-Control`; a derived TTL of 0 means uncacheable and the store
    /// is skipped. Overwrites promote; inserts evict from the tail while
    /// over the entry bound.
    pub(crate) fn put(&self, key: &str, data: Bytes, cache_control: Option<&str>) {
        let ttl = self.shape_ttl(parse_ttl(cache_control));
        if ttl == 0 {
            return;
        }

        let entry = FragmentEntry {
            data,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        };

        let mut inner = self.inner.write();

        if let Some(&index) = inner.map.get(key) {
            inner
                .lru
                .occupant_mut(index)
                .expect("map entry points at a resident slot")
                .entry = entry;
            inner.lru.touch(index);
            return;
        }

        while inner.lru.len() >= MAX_ENTRIES {
            let Some(evicted) = inner.lru.evict_oldest() else {
                break;
            };
            inner.map.remove(&evicted.key);
            inner.evictions += 1;
            self.observe(|o| o.on_cache_eviction());
            tracing::debug!(key = %evicted.key, "evicted least recently used fragment");
        }

        if let Some(index) = inner.lru.admit(key.to_string(), entry) {
            inner.map.insert(key.to_string(), index);
        }
    }

    /// Fetch-through lookup with stampede protection.
    ///
    /// Fast path: a cache hit returns immediately. On a miss, the first
    /// caller for the key runs `fetch` while later callers block on the
    /// same result. The fetched body is stored only when the response was
    /// a plain `200 OK`.
    pub(crate) async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Bytes, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedFragment, FetchError>>,
    {
        if let Some(data) = self.get(key) {
            return Ok(data);
        }

        match self.flights.join_or_lead(key) {
            Role::Leader(leader) => {
                let outcome = match fetch().await {
                    Ok(fragment) => {
                        if fragment.status == Some(200) {
                            self.put(key, fragment.body.clone(), fragment.cache_control.as_deref());
                        }
                        Ok(fragment.body)
                    }
                    Err(err) => Err(err),
                };
                leader.complete(outcome.clone());
                outcome
            }
            Role::Waiter(flight) => {
                self.stampede_waits.fetch_add(1, Ordering::Relaxed);
                self.observe(|o| o.on_stampede_wait());
                flight.wait().await
            }
        }
    }

    /// Snapshot of entry count, total payload bytes and counters.
    pub(crate) fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let total_bytes: u64 = inner.lru.iter().map(|o| o.entry.data.len() as u64).sum();
        CacheStats {
            entries: inner.map.len(),
            total_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            stampede_waits: self.stampede_waits.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry. Counters are left running. Intended for tests.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.write();
        inner.map = HashMap::with_capacity(MAX_ENTRIES);
        inner.lru = RecencyList::new(MAX_ENTRIES);
    }

    fn observe(&self, event: impl FnOnce(&dyn MetricsObserver)) {
        if let Some(observer) = &self.observer {
            event(observer.as_ref());
        }
    }

    /// Apply the configured floor and jitter to a derived TTL. Both only
    /// apply to cacheable responses; TTL 0 stays 0.
    fn shape_ttl(&self, ttl: u64) -> u64 {
        if ttl == 0 {
            return 0;
        }
        let mut ttl = ttl.max(self.minimum_ttl);
        if self.ttl_jitter > 0 {
            ttl += rand::thread_rng().gen_range(0..=self.ttl_jitter);
        }
        ttl
    }
}

/// Derive a TTL in seconds from a `Cache-Control` header value.
///
/// `no-cache` and `no-store` make the response uncacheable regardless of
/// any `max-age`. A well-formed `max-age=N` is honored exactly, including
/// `max-age=0` (uncacheable). A missing header or malformed `max-age`
/// falls back to the default TTL.
pub(crate) fn parse_ttl(cache_control: Option<&str>) -> u64 {
    let Some(value) = cache_control else {
        return DEFAULT_TTL;
    };
    if value.is_empty() {
        return DEFAULT_TTL;
    }

    let mut max_age = None;
    for directive in value.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        if directive == "no-cache" || directive == "no-store" {
            return 0;
        }
        if let Some(raw) = directive.strip_prefix("max-age=") {
            if let Ok(secs) = raw.trim().parse::<u64>() {
                max_age = Some(secs);
            }
        }
    }

    max_age.unwrap_or(DEFAULT_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> FragmentCache {
        FragmentCache::new(&EsiConfig::default(), None)
    }

    fn body(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn parse_ttl_table() {
        let cases: &[(Option<&str>, u64)] = &[
            (Some("max-age=3600"), 3600),
            (Some("public, max-age=7200, must-revalidate"), 7200),
            (None, DEFAULT_TTL),
            (Some(""), DEFAULT_TTL),
            (Some("no-cache"), 0),
            (Some("no-store"), 0),
            (Some("no-store, max-age=600"), 0),
            (Some("max-age=invalid"), DEFAULT_TTL),
            (Some("max-age=0"), 0),
        ];
        for (header, expected) in cases {
            assert_eq!(
                parse_ttl(*header),
                *expected,
                "Cache-Control: {header:?}"
            );
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let cache = cache();
        cache.put("http://o/a", body("<p>a</p>"), Some("max-age=60"));

        assert_eq!(cache.get("http://o/a"), Some(body("<p>a</p>")));
        assert_eq!(cache.get("http://o/missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 8);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn uncacheable_ttl_skips_store() {
        let cache = cache();
        cache.put("k", body("x"), Some("no-store"));
        cache.put("k2", body("x"), Some("max-age=0"));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn expired_entry_reads_as_miss_but_stays() {
        let cache = cache();
        cache.put("k", body("x"), Some("max-age=60"));
        {
            let mut inner = cache.inner.write();
            let index = inner.map["k"];
            inner.lru.occupant_mut(index).unwrap().entry.expires_at =
                Instant::now() - Duration::from_secs(1);
        }

        assert_eq!(cache.get("k"), None);
        // Left in place for the next put to overwrite.
        assert_eq!(cache.stats().entries, 1);

        cache.put("k", body("fresh"), Some("max-age=60"));
        assert_eq!(cache.get("k"), Some(body("fresh")));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn overwrite_promotes_without_growing() {
        let cache = cache();
        cache.put("a", body("1"), Some("max-age=60"));
        cache.put("b", body("2"), Some("max-age=60"));
        cache.put("a", body("3"), Some("max-age=60"));

        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.get("a"), Some(body("3")));
    }

    #[test]
    fn evicts_least_recently_used_beyond_bound() {
        let cache = cache();
        for i in 0..MAX_ENTRIES {
            cache.put(&format!("k{i}"), body("x"), Some("max-age=600"));
        }
        // Touch k0 so it is the most recently used.
        assert!(cache.get("k0").is_some());

        cache.put("overflow", body("x"), Some("max-age=600"));

        let stats = cache.stats();
        assert_eq!(stats.entries, MAX_ENTRIES);
        assert_eq!(stats.evictions, 1);
        // k1 was the tail; k0 survived because it was promoted.
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k0").is_some());
        assert!(cache.get("overflow").is_some());
    }

    #[test]
    fn map_and_list_stay_in_sync_under_churn() {
        let cache = cache();
        for i in 0..(MAX_ENTRIES * 2) {
            cache.put(&format!("k{i}"), body("x"), Some("max-age=600"));
        }
        let inner = cache.inner.read();
        assert_eq!(inner.map.len(), inner.lru.len());
        assert!(inner.map.len() <= MAX_ENTRIES);
        for (key, &index) in &inner.map {
            assert_eq!(&inner.lru.occupant(index).unwrap().key, key);
        }
    }

    #[test]
    fn minimum_ttl_raises_but_never_lowers() {
        let config = EsiConfig {
            minimum_cache_ttl: 100,
            ..Default::default()
        };
        let cache = FragmentCache::new(&config, None);
        assert_eq!(cache.shape_ttl(10), 100);
        assert_eq!(cache.shape_ttl(500), 500);
        assert_eq!(cache.shape_ttl(0), 0);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let config = EsiConfig {
            cache_ttl_jitter: 30,
            ..Default::default()
        };
        let cache = FragmentCache::new(&config, None);
        for _ in 0..50 {
            let shaped = cache.shape_ttl(60);
            assert!((60..=90).contains(&shaped), "shaped TTL {shaped}");
        }
        assert_eq!(cache.shape_ttl(0), 0);
    }

    #[test]
    fn reset_clears_entries() {
        let cache = cache();
        cache.put("a", body("1"), Some("max-age=60"));
        cache.reset();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test]
    async fn get_or_fetch_stores_only_200() {
        let cache = cache();

        let fetched = cache
            .get_or_fetch("k", || async {
                Ok(FetchedFragment {
                    body: body("fail"),
                    status: Some(500),
                    cache_control: Some("max-age=300".into()),
                })
            })
            .await
            .unwrap();
        assert_eq!(fetched, body("fail"));
        assert_eq!(cache.stats().entries, 0);

        let fetched = cache
            .get_or_fetch("k", || async {
                Ok(FetchedFragment {
                    body: body("ok"),
                    status: Some(200),
                    cache_control: Some("max-age=300".into()),
                })
            })
            .await
            .unwrap();
        assert_eq!(fetched, body("ok"));
        assert_eq!(cache.stats().entries, 1);

        // Third call is a pure hit; the fetch closure must not run.
        let fetched = cache
            .get_or_fetch("k", || async { panic!("cache hit must not fetch") })
            .await
            .unwrap();
        assert_eq!(fetched, body("ok"));
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let cache = Arc::new(cache());
        let fetches = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", || {
                        let fetches = Arc::clone(&fetches);
                        async move {
                            fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(FetchedFragment {
                                body: body("shared"),
                                status: Some(200),
                                cache_control: None,
                            })
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), body("shared"));
        }
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert!(stats.stampede_waits > 0);
    }
}
