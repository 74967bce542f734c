use std::sync::LazyLock;
use std::time::Instant;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CACHE_CONTROL, COOKIE};
use regex::bytes::Regex;
use url::Url;

use crate::cache::FetchedFragment;
use crate::config::resolve_fragment_url;
use crate::{Processor, RequestContext};

static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"src="?(.+?)"?( |/>)"#).unwrap());
static ALT_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"alt="?(.+?)"?( |/>)"#).unwrap());
static ONERROR_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"onerror="?(.+?)"?( |/>)"#).unwrap());

/// Content-negotiation hints, safe to pass to any origin.
const HEADERS_SAFE: [HeaderName; 2] = [ACCEPT, ACCEPT_LANGUAGE];

/// Credentials, forwarded only same-origin (same scheme, host and port).
const HEADERS_UNSAFE: [HeaderName; 2] = [COOKIE, AUTHORIZATION];

/// Why a fragment could not be fetched. Never escapes `process`; a failed
/// include is spliced as empty bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum FetchError {
    #[error("fragment request failed: {0}")]
    Request(String),
    #[error("fragment responded with status {0}")]
    Status(u16),
    #[error("fragment fetch was abandoned")]
    Abandoned,
}

/// Parsed attributes of one `<esi:include …/>` site.
///
/// `src`/`alt` tolerate quoted or unquoted values and an optional space
/// before `/>`. `silent` is true iff `onerror="continue"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IncludeDirective {
    pub src: String,
    pub alt: Option<String>,
    pub silent: bool,
}

impl IncludeDirective {
    /// Parse the directive out of the full site markup. Returns `None`
    /// when the required `src` attribute is missing.
    pub(crate) fn parse(site: &[u8]) -> Option<Self> {
        let src = SRC_ATTR
            .captures(site)
            .map(|c| String::from_utf8_lossy(&c[1]).into_owned())?;

        let alt = ALT_ATTR
            .captures(site)
            .map(|c| String::from_utf8_lossy(&c[1]).into_owned());

        let silent = ONERROR_ATTR
            .captures(site)
            .is_some_and(|c| &c[1] == b"continue");

        Some(Self { src, alt, silent })
    }
}

/// Exact comparison of scheme, host and port. Default ports normalize, so
/// `http://a` and `http://a:80` share an origin.
pub(crate) fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

struct SentRequest {
    response: reqwest::Response,
    /// Headers that went out on the wire; nested includes inherit them.
    headers: HeaderMap,
}

impl Processor {
    /// Execute one include site: resolve, fetch through the cache's
    /// single-flight, and hand back the processed fragment body. `None`
    /// means the site is replaced with empty bytes.
    pub(crate) async fn fetch_content(
        &self,
        directive: &IncludeDirective,
        ctx: &RequestContext,
    ) -> Option<Bytes> {
        let key = resolve_fragment_url(&directive.src, self.config.base_url.as_ref(), ctx.url());

        let result = self
            .cache
            .get_or_fetch(&key, || self.fetch_fragment(&key, directive, ctx))
            .await;

        match result {
            Ok(body) => Some(body),
            Err(err) => {
                tracing::debug!(url = %key, error = %err, "include fetch failed, splicing empty");
                None
            }
        }
    }

    /// The fetch that runs exactly once per key under single-flight:
    /// primary URL, alt fallback, full body read, recursive processing
    /// with the fragment's own request as context.
    async fn fetch_fragment(
        &self,
        key: &str,
        directive: &IncludeDirective,
        ctx: &RequestContext,
    ) -> Result<FetchedFragment, FetchError> {
        let started = Instant::now();

        let mut attempt = self.send_fragment_request(key, ctx).await;

        let failed = match &attempt {
            Ok(sent) => sent.response.status().as_u16() >= 400,
            Err(_) => true,
        };
        if failed {
            if let Some(alt) = &directive.alt {
                let alt_key = resolve_fragment_url(alt, self.config.base_url.as_ref(), ctx.url());
                attempt = self.send_fragment_request(&alt_key, ctx).await;
            }
        }

        let sent = match attempt {
            Ok(sent) if sent.response.status().as_u16() < 400 => sent,
            Ok(_) if directive.silent => return Ok(FetchedFragment::empty()),
            Ok(sent) => return Err(FetchError::Status(sent.response.status().as_u16())),
            Err(_) if directive.silent => return Ok(FetchedFragment::empty()),
            Err(err) => return Err(err),
        };

        let status = sent.response.status().as_u16();
        let cache_control = sent
            .response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let fragment_url = sent.response.url().clone();

        let raw = sent
            .response
            .bytes()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        tracing::info!(
            url = %fragment_url,
            status,
            duration_ms = started.elapsed().as_millis() as u64,
            "fragment fetch completed"
        );

        // Nested includes resolve relative to the fragment's URL, not the
        // outermost client request.
        let sub_ctx = RequestContext::new(fragment_url, sent.headers);
        let processed = self.process_inner(raw.to_vec(), &sub_ctx).await;

        Ok(FetchedFragment {
            body: Bytes::from(processed),
            status: Some(status),
            cache_control,
        })
    }

    async fn send_fragment_request(
        &self,
        url: &str,
        ctx: &RequestContext,
    ) -> Result<SentRequest, FetchError> {
        let headers = self.fragment_headers(url, ctx);
        let response = self
            .client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(SentRequest { response, headers })
    }

    /// Header forwarding policy: safelist first, credentials only
    /// same-origin, configured custom headers last so they win collisions.
    fn fragment_headers(&self, url: &str, ctx: &RequestContext) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for name in HEADERS_SAFE {
            if let Some(value) = ctx.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }

        if let Ok(target) = Url::parse(url) {
            if same_origin(&target, ctx.url()) {
                for name in HEADERS_UNSAFE {
                    if let Some(value) = ctx.headers().get(&name) {
                        headers.insert(name, value.clone());
                    }
                }
            }
        }

        for (name, value) in self.config.headers.iter() {
            headers.insert(name, value.clone());
        }

        headers
    }
}

impl FetchedFragment {
    /// Silent-failure substitute: spliced into the document, never stored.
    fn empty() -> Self {
        Self {
            body: Bytes::new(),
            status: None,
            cache_control: None,
        }
    }
}
