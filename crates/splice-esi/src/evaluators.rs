//! Structural rewrites for the non-include dialect: erase, passthrough,
//! conditional selection and variable interpolation. No network I/O
//! happens here.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::scanner::{find_literal, TagKind};
use crate::{expr, vars, RequestContext};

static WHEN_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<esi:when\s+test="([^"]*)"\s*>(.*?)</esi:when>"#).unwrap());
static OTHERWISE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<esi:otherwise\s*>(.*?)</esi:otherwise>").unwrap());

/// Evaluate one non-include tag. `tag` starts at the `<esi:` opening and
/// runs to the end of the buffer. Returns the replacement bytes and the
/// number of input bytes consumed, or `None` when the tag has no close
/// (the span is then left intact).
pub(crate) fn evaluate(
    kind: TagKind,
    tag: &[u8],
    ctx: &RequestContext,
) -> Option<(Vec<u8>, usize)> {
    match kind {
        TagKind::Comment => erase(tag, b"/>"),
        TagKind::Remove => erase(tag, b"</esi:remove>"),
        TagKind::Vars => evaluate_vars(tag, ctx),
        TagKind::Choose => evaluate_choose(tag, ctx),
        // Include runs in the planner pass; try has no evaluator yet.
        TagKind::Include | TagKind::Try | TagKind::Escape => None,
    }
}

/// Consume up to and including `close`; emit nothing.
fn erase(tag: &[u8], close: &[u8]) -> Option<(Vec<u8>, usize)> {
    let (_, close_end) = find_literal(tag, close, 0)?;
    Some((Vec::new(), close_end))
}

fn evaluate_vars(tag: &[u8], ctx: &RequestContext) -> Option<(Vec<u8>, usize)> {
    let (_, body_start) = find_literal(tag, b">", 0)?;
    let (close_start, close_end) = find_literal(tag, b"</esi:vars>", body_start)?;
    let substituted = vars::substitute(&tag[body_start..close_start], ctx);
    Some((substituted, close_end))
}

/// Emit the body of the first `<esi:when>` whose test is satisfied, or of
/// `<esi:otherwise>` when none is, or nothing at all.
fn evaluate_choose(tag: &[u8], ctx: &RequestContext) -> Option<(Vec<u8>, usize)> {
    let (close_start, close_end) = find_literal(tag, b"</esi:choose>", 0)?;
    let inner = &tag[..close_start];

    for caps in WHEN_BLOCK.captures_iter(inner) {
        let test = String::from_utf8_lossy(&caps[1]);
        if expr::evaluate(&test, ctx) {
            return Some((caps[2].to_vec(), close_end));
        }
    }

    if let Some(caps) = OTHERWISE_BLOCK.captures(inner) {
        return Some((caps[1].to_vec(), close_end));
    }

    Some((Vec::new(), close_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderMap, HeaderValue};
    use url::Url;

    fn ctx() -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("group=advanced"));
        RequestContext::new(
            Url::parse("https://shop.example/?tier=pro").unwrap(),
            headers,
        )
    }

    fn eval(kind: TagKind, tag: &[u8]) -> Option<(Vec<u8>, usize)> {
        evaluate(kind, tag, &ctx())
    }

    #[test]
    fn comment_erases_through_close() {
        let tag = br#"<esi:comment text="internal note"/>trailing"#;
        let (out, consumed) = eval(TagKind::Comment, tag).unwrap();
        assert!(out.is_empty());
        assert_eq!(&tag[consumed..], b"trailing");
    }

    #[test]
    fn remove_erases_body_and_markup() {
        let tag = b"<esi:remove><p>hidden</p></esi:remove>kept";
        let (out, consumed) = eval(TagKind::Remove, tag).unwrap();
        assert!(out.is_empty());
        assert_eq!(&tag[consumed..], b"kept");
    }

    #[test]
    fn unterminated_tag_is_not_consumed() {
        assert_eq!(eval(TagKind::Remove, b"<esi:remove>forever"), None);
        assert_eq!(eval(TagKind::Comment, b"<esi:comment text=\"x\""), None);
        assert_eq!(eval(TagKind::Choose, b"<esi:choose>..."), None);
    }

    #[test]
    fn vars_substitutes_body() {
        let tag = b"<esi:vars>tier=$(QUERY_STRING{tier})</esi:vars>rest";
        let (out, consumed) = eval(TagKind::Vars, tag).unwrap();
        assert_eq!(out, b"tier=pro".to_vec());
        assert_eq!(&tag[consumed..], b"rest");
    }

    #[test]
    fn choose_takes_first_satisfied_when() {
        let tag = br#"<esi:choose><esi:when test="$(HTTP_COOKIE{group}) == 'basic'">A</esi:when><esi:when test="$(HTTP_COOKIE{group}) == 'advanced'">B</esi:when><esi:otherwise>C</esi:otherwise></esi:choose>"#;
        let (out, consumed) = eval(TagKind::Choose, tag).unwrap();
        assert_eq!(out, b"B".to_vec());
        assert_eq!(consumed, tag.len());
    }

    #[test]
    fn choose_falls_back_to_otherwise() {
        let tag = br#"<esi:choose><esi:when test="1 == 2">A</esi:when><esi:otherwise>C</esi:otherwise></esi:choose>"#;
        let (out, _) = eval(TagKind::Choose, tag).unwrap();
        assert_eq!(out, b"C".to_vec());
    }

    #[test]
    fn choose_without_match_or_otherwise_is_empty() {
        let tag = br#"<esi:choose><esi:when test="1 == 2">A</esi:when></esi:choose>"#;
        let (out, _) = eval(TagKind::Choose, tag).unwrap();
        assert!(out.is_empty());
    }
}
