//! Built-in variable lookup for `<esi:vars>` interpolation and `choose`
//! test expressions.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::RequestContext;

/// Matches `$(NAME)` and `$(NAME{key})` references.
static VAR_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\(([A-Za-z0-9_]+)(?:\{([^}]*)\})?\)").unwrap());

/// Replace every variable reference in `body` with its value. Unknown
/// variables substitute as empty strings.
pub(crate) fn substitute(body: &[u8], ctx: &RequestContext) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut last = 0;

    for caps in VAR_REF.captures_iter(body) {
        let whole = caps.get(0).unwrap();
        out.extend_from_slice(&body[last..whole.start()]);

        let name = std::str::from_utf8(caps.get(1).unwrap().as_bytes()).unwrap_or("");
        let key = caps
            .get(2)
            .and_then(|m| std::str::from_utf8(m.as_bytes()).ok());
        out.extend_from_slice(lookup(name, key, ctx).as_bytes());

        last = whole.end();
    }

    out.extend_from_slice(&body[last..]);
    out
}

/// Resolve one variable reference against the request context.
pub(crate) fn lookup(name: &str, key: Option<&str>, ctx: &RequestContext) -> String {
    match name {
        "HTTP_HOST" => {
            let host = ctx.url().host_str().unwrap_or_default();
            match ctx.url().port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            }
        }
        "QUERY_STRING" => match key {
            None => ctx.url().query().unwrap_or_default().to_string(),
            Some(param) => ctx
                .url()
                .query_pairs()
                .find(|(name, _)| name.as_ref() == param)
                .map(|(_, value)| value.into_owned())
                .unwrap_or_default(),
        },
        "HTTP_COOKIE" => {
            let raw = header_value(ctx, "cookie");
            match key {
                None => raw,
                Some(wanted) => raw
                    .split(';')
                    .filter_map(|pair| pair.trim().split_once('='))
                    .find(|(name, _)| *name == wanted)
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_default(),
            }
        }
        "HTTP_ACCEPT_LANGUAGE" => {
            let raw = header_value(ctx, "accept-language");
            match key {
                None => raw,
                // Keyed form answers "does the client accept this language".
                Some(tag) => {
                    let tag = tag.to_ascii_lowercase();
                    let accepted = raw
                        .split(',')
                        .map(|part| part.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
                        .any(|lang| lang == tag || lang.split('-').next() == Some(tag.as_str()));
                    accepted.to_string()
                }
            }
        }
        other => match other.strip_prefix("HTTP_") {
            Some(header) => header_value(ctx, &header.replace('_', "-").to_ascii_lowercase()),
            None => String::new(),
        },
    }
}

fn header_value(ctx: &RequestContext, name: &str) -> String {
    ctx.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderMap, HeaderValue};
    use url::Url;

    fn ctx() -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("splice-test"));
        headers.insert("cookie", HeaderValue::from_static("session=abc; theme=dark"));
        headers.insert(
            "accept-language",
            HeaderValue::from_static("da, en-GB;q=0.8, en;q=0.7"),
        );
        RequestContext::new(
            Url::parse("http://shop.example:8080/search?q=boots&page=3").unwrap(),
            headers,
        )
    }

    #[test]
    fn substitutes_host_and_query() {
        let ctx = ctx();
        let out = substitute(b"host=$(HTTP_HOST) q=$(QUERY_STRING{q}) all=$(QUERY_STRING)", &ctx);
        assert_eq!(
            out,
            b"host=shop.example:8080 q=boots all=q=boots&page=3".to_vec()
        );
    }

    #[test]
    fn substitutes_generic_headers() {
        let ctx = ctx();
        assert_eq!(
            substitute(b"ua=$(HTTP_USER_AGENT)", &ctx),
            b"ua=splice-test".to_vec()
        );
    }

    #[test]
    fn cookie_lookup_by_name() {
        let ctx = ctx();
        assert_eq!(lookup("HTTP_COOKIE", Some("theme"), &ctx), "dark");
        assert_eq!(lookup("HTTP_COOKIE", Some("absent"), &ctx), "");
        assert_eq!(
            lookup("HTTP_COOKIE", None, &ctx),
            "session=abc; theme=dark"
        );
    }

    #[test]
    fn accept_language_membership() {
        let ctx = ctx();
        assert_eq!(lookup("HTTP_ACCEPT_LANGUAGE", Some("da"), &ctx), "true");
        assert_eq!(lookup("HTTP_ACCEPT_LANGUAGE", Some("en-GB"), &ctx), "true");
        assert_eq!(lookup("HTTP_ACCEPT_LANGUAGE", Some("en"), &ctx), "true");
        assert_eq!(lookup("HTTP_ACCEPT_LANGUAGE", Some("fr"), &ctx), "false");
    }

    #[test]
    fn unknown_variables_are_empty() {
        let ctx = ctx();
        assert_eq!(substitute(b"[$(NO_SUCH_VAR)]", &ctx), b"[]".to_vec());
        assert_eq!(substitute(b"[$(HTTP_X_ABSENT)]", &ctx), b"[]".to_vec());
    }

    #[test]
    fn non_references_pass_through() {
        let ctx = ctx();
        assert_eq!(
            substitute(b"price is $100 (really)", &ctx),
            b"price is $100 (really)".to_vec()
        );
    }
}
