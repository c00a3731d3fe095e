use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

/// Counters shared between the reconcile loop and the HTTP endpoint.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Reconcile cycles started.
    pub reconcile_total: AtomicU64,
    /// Reconcile cycles that ended in an error.
    pub reconcile_errors: AtomicU64,
    /// Allocation requests grown.
    pub attach_total: AtomicU64,
    /// Allocation requests shrunk.
    pub detach_total: AtomicU64,
    /// Allocation requests created.
    pub create_total: AtomicU64,
    /// Shrinks postponed by the no-removal grace period.
    pub detach_deferred_total: AtomicU64,
    /// Reschedule conditions written to claims.
    pub reschedule_total: AtomicU64,
    /// Writes retried after a conflict.
    pub conflict_retries_total: AtomicU64,
    /// Node label patches applied.
    pub label_patches_total: AtomicU64,
}

impl SharedMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: &AtomicU64) {
    out.push_str(&format!(
        "# HELP dds_scaler_{name} {help}\n# TYPE dds_scaler_{name} counter\ndds_scaler_{name} {}\n",
        value.load(Ordering::Relaxed)
    ));
}

/// GET /metrics in Prometheus text format.
pub async fn metrics_handler(State(metrics): State<Arc<SharedMetrics>>) -> impl IntoResponse {
    let m = &metrics;
    let mut body = String::new();
    counter(&mut body, "reconcile_total", "Reconcile cycles started.", &m.reconcile_total);
    counter(&mut body, "reconcile_errors", "Reconcile cycles failed.", &m.reconcile_errors);
    counter(&mut body, "attach_total", "Allocation requests grown.", &m.attach_total);
    counter(&mut body, "detach_total", "Allocation requests shrunk.", &m.detach_total);
    counter(&mut body, "create_total", "Allocation requests created.", &m.create_total);
    counter(
        &mut body,
        "detach_deferred_total",
        "Shrinks deferred by the no-removal grace period.",
        &m.detach_deferred_total,
    );
    counter(
        &mut body,
        "reschedule_total",
        "Reschedule signals written to claims.",
        &m.reschedule_total,
    );
    counter(
        &mut body,
        "conflict_retries_total",
        "Writes retried after a conflict.",
        &m.conflict_retries_total,
    );
    counter(
        &mut body,
        "label_patches_total",
        "Node label patches applied.",
        &m.label_patches_total,
    );
    (axum::http::StatusCode::OK, body)
}

/// GET /healthz, simple liveness probe.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

pub fn router(metrics: Arc<SharedMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exposition_includes_every_counter() {
        let metrics = Arc::new(SharedMetrics::default());
        SharedMetrics::inc(&metrics.create_total);
        SharedMetrics::inc(&metrics.create_total);

        let resp = metrics_handler(State(metrics)).await.into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("dds_scaler_create_total 2\n"));
        assert!(text.contains("# TYPE dds_scaler_detach_deferred_total counter"));
        assert!(text.contains("dds_scaler_label_patches_total 0\n"));
    }
}
