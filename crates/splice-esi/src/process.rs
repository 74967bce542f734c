use std::future::Future;
use std::pin::Pin;

use futures::future;

use crate::evaluators;
use crate::include::IncludeDirective;
use crate::scanner::{self, Construct, TagKind};
use crate::{Processor, RequestContext};

/// One planned `<esi:include>` site: parsed directive plus the byte span
/// `[position, position + length)` it occupies in the buffer.
struct IncludeSite {
    directive: IncludeDirective,
    position: usize,
    length: usize,
}

impl Processor {
    /// Expand all ESI markup in `body` and return the transformed buffer.
    ///
    /// Sibling includes are fetched concurrently through the shared
    /// fragment cache; every other recognized tag is evaluated in a second,
    /// sequential pass. This never fails: markup problems leave the span
    /// intact and fetch failures splice empty bytes.
    pub async fn process(&self, body: Vec<u8>, ctx: &RequestContext) -> Vec<u8> {
        self.process_inner(body, ctx).await
    }

    /// Boxed so fragment bodies can recurse back into the driver.
    pub(crate) fn process_inner<'a>(
        &'a self,
        body: Vec<u8>,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Vec<u8>> + Send + 'a>> {
        Box::pin(async move {
            let sites = collect_includes(&body);
            let body = if sites.is_empty() {
                body
            } else {
                self.expand_includes(body, sites, ctx).await
            };
            self.evaluate_tags(body, ctx)
        })
    }

    /// Fan out one fetch per sibling include, then splice the results in
    /// descending position order so earlier offsets stay valid.
    async fn expand_includes(
        &self,
        mut buf: Vec<u8>,
        sites: Vec<IncludeSite>,
        ctx: &RequestContext,
    ) -> Vec<u8> {
        let results = future::join_all(
            sites
                .iter()
                .map(|site| self.fetch_content(&site.directive, ctx)),
        )
        .await;

        for (site, result) in sites.iter().zip(results).rev() {
            let end = (site.position + site.length).min(buf.len());
            let replacement = result.unwrap_or_default();
            buf.splice(site.position..end, replacement.iter().copied());
        }

        buf
    }

    /// Sequential pass over the (now include-free at this level) buffer,
    /// replacing each remaining recognized tag with its evaluator output.
    /// Offsets are recomputed after every substitution.
    fn evaluate_tags(&self, mut buf: Vec<u8>, ctx: &RequestContext) -> Vec<u8> {
        let mut pointer = 0;

        while pointer < buf.len() {
            let Some(found) = scanner::next_construct(&buf[pointer..]) else {
                break;
            };

            match found {
                Construct::Escape { start, inner_start } => {
                    let abs_start = pointer + start;
                    let abs_inner = pointer + inner_start;
                    let Some((close_start, close_end)) =
                        scanner::find_literal(&buf, b"-->", abs_inner)
                    else {
                        // Unterminated escape: leave the span intact.
                        break;
                    };
                    let inner: Vec<u8> = buf[abs_inner..close_start].to_vec();
                    let inner_len = inner.len();
                    buf.splice(abs_start..close_end, inner);
                    pointer = abs_start + inner_len;
                }
                Construct::Tag {
                    start,
                    name_end,
                    kind,
                } => {
                    let abs_start = pointer + start;
                    let abs_name_end = pointer + name_end;

                    let Some(kind) = kind else {
                        // Tag-like opening with no recognized name.
                        pointer = abs_name_end;
                        continue;
                    };

                    if matches!(kind, TagKind::Include | TagKind::Try) {
                        // Includes were handled by the planner pass; try is
                        // recognized but passed through unchanged.
                        pointer = abs_name_end;
                        continue;
                    }

                    match evaluators::evaluate(kind, &buf[abs_start..], ctx) {
                        Some((replacement, consumed)) => {
                            let replacement_len = replacement.len();
                            buf.splice(abs_start..abs_start + consumed, replacement);
                            pointer = abs_start + replacement_len;
                        }
                        // Unterminated tag: span left intact, processing of
                        // that span halts.
                        None => break,
                    }
                }
            }
        }

        buf
    }
}

/// One linear pass collecting every top-level `<esi:include …/>` site.
/// Sites with unparseable attributes or no `/>` are dropped (their markup
/// stays). Escaped regions are skipped whole, so includes inside
/// `<!--esi … -->` are never planned.
fn collect_includes(buf: &[u8]) -> Vec<IncludeSite> {
    let mut sites = Vec::new();
    let mut pointer = 0;

    while pointer < buf.len() {
        let Some(found) = scanner::next_construct(&buf[pointer..]) else {
            break;
        };

        match found {
            Construct::Escape { inner_start, .. } => {
                let abs_inner = pointer + inner_start;
                pointer = match scanner::find_literal(buf, b"-->", abs_inner) {
                    Some((_, close_end)) => close_end,
                    None => abs_inner,
                };
            }
            Construct::Tag {
                start,
                name_end,
                kind,
            } => {
                let abs_start = pointer + start;
                let abs_name_end = pointer + name_end;

                if kind != Some(TagKind::Include) {
                    pointer = abs_name_end;
                    continue;
                }

                let Some((_, close_end)) = scanner::find_literal(buf, b"/>", abs_name_end) else {
                    pointer = abs_name_end;
                    continue;
                };

                match IncludeDirective::parse(&buf[abs_start..close_end]) {
                    Some(directive) => {
                        sites.push(IncludeSite {
                            directive,
                            position: abs_start,
                            length: close_end - abs_start,
                        });
                        // Jump past the close so sibling spans stay disjoint.
                        pointer = close_end;
                    }
                    None => pointer = abs_name_end,
                }
            }
        }
    }

    sites
}
