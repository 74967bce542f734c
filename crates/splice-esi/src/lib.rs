//! Edge-Side Include (ESI) processing engine.
//!
//! An origin emits HTML containing `<esi:…>` directives; a host hands the
//! buffered response body to [`Processor::process`], which expands them —
//! most importantly by fetching remote fragment URLs concurrently and
//! splicing their (recursively processed) bodies back into the document.
//! Fragments are cached in a bounded LRU keyed by absolute URL, with TTLs
//! derived from upstream `Cache-Control` and concurrent misses on one URL
//! collapsed into a single origin fetch.
//!
//! The transform is best-effort by design: fetch and markup failures never
//! escape `process`, they degrade to empty substitutions or untouched
//! spans.
//!
//! ```no_run
//! use splice_esi::{EsiConfig, Processor, RequestContext};
//!
//! # async fn example() {
//! let processor = Processor::new(EsiConfig::default());
//! let ctx = RequestContext::new(
//!     url::Url::parse("https://shop.example/cart").unwrap(),
//!     http::HeaderMap::new(),
//! );
//! let body = br#"<html><esi:include src="/fragments/header"/></html>"#.to_vec();
//! let transformed = processor.process(body, &ctx).await;
//! # let _ = transformed;
//! # }
//! ```

mod cache;
mod config;
mod evaluators;
mod expr;
mod include;
mod metrics;
mod process;
mod recency;
mod scanner;
mod singleflight;
mod vars;

use std::sync::Arc;

use http::HeaderMap;
use url::Url;

use crate::cache::FragmentCache;

pub use crate::cache::CacheStats;
pub use crate::config::EsiConfig;
pub use crate::metrics::MetricsObserver;
pub use crate::scanner::has_opened_tags;

/// The client request a document is being processed for: its URL (fragment
/// resolution, same-origin checks, variable lookup) and its headers
/// (forwarding policy, variable lookup).
///
/// Recursive fragment processing builds a fresh context from the fragment's
/// own URL and the headers that were sent to fetch it, so nested `src`
/// attributes resolve against the fragment, not the outermost client
/// request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    url: Url,
    headers: HeaderMap,
}

impl RequestContext {
    pub fn new(url: Url, headers: HeaderMap) -> Self {
        Self { url, headers }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// The ESI engine: configuration, the shared fragment cache with its
/// in-flight table, and the HTTP client used for fragment fetches.
///
/// Hosts construct one `Processor` at startup and share it (behind an
/// `Arc`) across requests; the fragment cache is only as global as the
/// value holding it.
pub struct Processor {
    pub(crate) config: EsiConfig,
    pub(crate) cache: FragmentCache,
    pub(crate) client: reqwest::Client,
}

impl Processor {
    pub fn new(config: EsiConfig) -> Self {
        Self::build(config, None)
    }

    /// Like [`Processor::new`], with a metrics observer receiving the
    /// cache's counter events.
    pub fn with_observer(config: EsiConfig, observer: Arc<dyn MetricsObserver>) -> Self {
        Self::build(config, Some(observer))
    }

    fn build(config: EsiConfig, observer: Option<Arc<dyn MetricsObserver>>) -> Self {
        // Sibling includes fetch in parallel; keep enough warm connections
        // per fragment host.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .build()
            .expect("fragment http client");

        Self {
            cache: FragmentCache::new(&config, observer),
            config,
            client,
        }
    }

    /// Snapshot of cache entry count, payload bytes and counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached fragment. Intended for tests.
    pub fn reset_cache(&self) {
        self.cache.reset()
    }
}
