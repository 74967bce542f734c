use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use rand::Rng;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Envelope page the proxy expands: one fast include, one slow include,
/// one broken include with an alt, and one silent failure.
async fn envelope() -> impl IntoResponse {
    let page = r#"<html>
<head><title>splice demo</title></head>
<body>
  <esi:include src="/fragments/header"/>
  <main>
    <esi:include src="/fragments/recommendations"/>
    <esi:include src="/fragments/broken" alt="/fragments/header"/>
    <esi:include src="/fragments/broken" onerror="continue"/>
  </main>
  <esi:vars>served for $(HTTP_HOST)</esi:vars>
</body>
</html>"#;

    ([(CONTENT_TYPE, "text/html; charset=utf-8")], Html(page))
}

async fn header_fragment() -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "text/html"),
            (CACHE_CONTROL, "max-age=60"),
        ],
        "<header>splice demo shop</header>",
    )
}

async fn recommendations_fragment() -> impl IntoResponse {
    // Simulate upstream latency (5-20ms)
    let delay = rand::thread_rng().gen_range(5..=20);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    (
        [
            (CONTENT_TYPE, "text/html"),
            (CACHE_CONTROL, "max-age=5"),
        ],
        format!("<ul><li>picked in {delay}ms</li></ul>"),
    )
}

async fn broken_fragment() -> impl IntoResponse {
    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/", get(envelope))
        .route("/fragments/header", get(header_fragment))
        .route("/fragments/recommendations", get(recommendations_fragment))
        .route("/fragments/broken", get(broken_fragment))
        .route("/health", get(health));

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "demo backend starting");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
