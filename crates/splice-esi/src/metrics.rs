/// Counter events emitted by the fragment cache.
///
/// Implementations are registered once at startup and must be safe for many
/// concurrent callers; the default methods make every event optional.
pub trait MetricsObserver: Send + Sync {
    /// A fragment was served from the cache.
    fn on_cache_hit(&self) {}

    /// A fragment was not in the cache (or had expired).
    fn on_cache_miss(&self) {}

    /// A fragment was evicted to stay within the entry bound.
    fn on_cache_eviction(&self) {}

    /// A caller blocked on another caller's in-flight fetch of the same
    /// fragment.
    fn on_stampede_wait(&self) {}
}
