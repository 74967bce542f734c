use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use splice_esi::{has_opened_tags, Processor, RequestContext};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub esi: Processor,
    pub client: HttpClient,
    pub upstream_url: String,
}

/// Main proxy handler. Forwards the request upstream, buffers the response
/// body, and expands ESI markup before writing it downstream when the
/// response qualifies.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_headers = req.headers().clone();

    let upstream_uri = format!(
        "{}{}",
        state.upstream_url.trim_end_matches('/'),
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );

    let mut upstream_req = Request::builder().method(&method).uri(&upstream_uri);
    for (key, value) in request_headers.iter() {
        // The client sets Host from the upstream URI; hop-by-hop headers
        // stay on this hop.
        let k = key.as_str();
        if k == "host" || k == "transfer-encoding" || k == "connection" {
            continue;
        }
        upstream_req = upstream_req.header(key, value);
    }

    let upstream_req = match upstream_req.body(req.into_body()) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream request");
            return bad_gateway();
        }
    };

    let upstream_resp = match state.client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, upstream = %upstream_uri, "upstream request failed");
            return bad_gateway();
        }
    };

    let status = upstream_resp.status();
    let headers = upstream_resp.headers().clone();

    // Read the full response body
    let body_bytes = match upstream_resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read upstream response body");
            return bad_gateway();
        }
    };

    let transform = status == StatusCode::OK
        && is_html(&headers)
        && has_opened_tags(&body_bytes);

    let body_bytes = if transform {
        let ctx = request_context(&uri, &request_headers);
        let processed = state.esi.process(body_bytes.to_vec(), &ctx).await;

        tracing::debug!(
            uri = %uri,
            latency_us = start.elapsed().as_micros() as u64,
            "expanded ESI markup"
        );
        bytes::Bytes::from(processed)
    } else {
        body_bytes
    };

    let mut response = Response::builder().status(status);
    for (key, value) in headers.iter() {
        // Splicing changes the length; let the server recompute it.
        let k = key.as_str();
        if k == "transfer-encoding" || k == "connection" || k == "content-length" {
            continue;
        }
        response = response.header(key, value);
    }

    match response.body(Body::from(body_bytes)) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to build downstream response");
            bad_gateway()
        }
    }
}

/// The processor's request context: the URL the client actually asked for,
/// reconstructed from the Host header, plus the client's headers.
fn request_context(uri: &Uri, headers: &HeaderMap) -> RequestContext {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let url = Url::parse(&format!("http://{host}{path_and_query}"))
        .unwrap_or_else(|_| Url::parse("http://localhost/").expect("static URL parses"));

    RequestContext::new(url, headers.clone())
}

/// Only HTML and XHTML bodies are candidates for ESI expansion.
fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/html") || ct.contains("application/xhtml+xml"))
}

fn bad_gateway() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from("Bad Gateway"))
        .expect("static response builds")
}
