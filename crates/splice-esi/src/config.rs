use http::HeaderMap;
use url::Url;

/// Processor configuration. Set once when the host constructs the
/// [`Processor`](crate::Processor); read-only during request handling.
#[derive(Debug, Clone, Default)]
pub struct EsiConfig {
    /// Floor applied to TTLs derived from upstream `Cache-Control`, in
    /// seconds. The floor only ever raises a TTL; 0 disables it.
    pub minimum_cache_ttl: u64,

    /// Maximum random jitter in seconds added to each derived TTL. Spreads
    /// out expirations of fragments stored at the same moment. 0 disables
    /// it.
    pub cache_ttl_jitter: u64,

    /// When set, fragment URLs resolve against this base instead of the
    /// active request's URL. Lets fragments be fetched from an internal
    /// endpoint that bypasses CDN/WAF rules.
    pub base_url: Option<Url>,

    /// Custom headers set verbatim on every fragment request, after the
    /// forwarded client headers (so they win any collision).
    pub headers: HeaderMap,
}

/// Resolve a raw `src`/`alt` attribute into the absolute fragment URL.
///
/// Resolution happens against the configured base URL when present,
/// otherwise against the active request's URL. A value that cannot be
/// parsed as a URL reference passes through unresolved; the HTTP client
/// rejects it later, surfacing as a fetch error.
pub(crate) fn resolve_fragment_url(raw: &str, base_url: Option<&Url>, request_url: &Url) -> String {
    let base = base_url.unwrap_or(request_url);
    match base.join(raw) {
        Ok(resolved) => {
            if base_url.is_some() {
                tracing::debug!(fragment = raw, resolved = %resolved, "fragment URL resolved against configured base");
            }
            resolved.to_string()
        }
        Err(_) => raw.to_string(),
    }
}
