use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use splice_esi::MetricsObserver;

use crate::proxy::AppState;

/// Combined state for the metrics/admin router.
#[derive(Clone)]
pub struct MetricsState {
    pub app: Arc<AppState>,
    pub prometheus: PrometheusHandle,
}

/// Bridges the processor's cache counter events into the Prometheus
/// recorder installed at startup.
pub struct PrometheusObserver;

impl MetricsObserver for PrometheusObserver {
    fn on_cache_hit(&self) {
        metrics::counter!("esi_cache_hits_total").increment(1);
    }

    fn on_cache_miss(&self) {
        metrics::counter!("esi_cache_misses_total").increment(1);
    }

    fn on_cache_eviction(&self) {
        metrics::counter!("esi_cache_evictions_total").increment(1);
    }

    fn on_stampede_wait(&self) {
        metrics::counter!("esi_cache_stampede_waits_total").increment(1);
    }
}

/// GET /metrics — Prometheus exposition.
pub async fn prometheus_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    state.prometheus.render()
}

/// GET /api/stats — one-shot JSON snapshot of the fragment cache.
pub async fn stats_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let stats = state.app.esi.cache_stats();
    let total = stats.hits + stats.misses;
    Json(serde_json::json!({
        "entries": stats.entries,
        "total_bytes": stats.total_bytes,
        "hits": stats.hits,
        "misses": stats.misses,
        "hit_rate": if total > 0 { stats.hits as f64 / total as f64 } else { 0.0 },
        "evictions": stats.evictions,
        "stampede_waits": stats.stampede_waits,
    }))
}
