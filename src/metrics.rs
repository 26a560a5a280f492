// SPDX-License-Identifier: MIT
//! Prometheus metrics — one counter (`<app>_hss_worker_restarts`) and the
//! `GET /metrics` server that exposes it in Prometheus text format.
//!
//! This is ambient infrastructure, not core dispatch logic, but it's wired
//! the way the teacher codebase wires its own REST metrics route: a small
//! Axum router bound to its own listener, reading shared state through
//! `State`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tracing::{info, warn};

/// Process-wide metrics registry plus the one counter the core touches.
pub struct Metrics {
    registry: Registry,
    pub worker_restarts: IntCounter,
}

impl Metrics {
    /// `metric_name` should come from `StabilizerConfig::restart_metric_name`.
    pub fn new(metric_name: &str) -> anyhow::Result<Arc<Self>> {
        let registry = Registry::new();
        let worker_restarts = IntCounter::new(metric_name, "forced worker restarts (timeout-driven)")?;
        registry.register(Box::new(worker_restarts.clone()))?;
        Ok(Arc::new(Self {
            registry,
            worker_restarts,
        }))
    }

    fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buf) {
            return format!("# encode error: {e}\n");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Start the metrics server on `bind`. Returns immediately; failures to
/// bind are logged as a warning and the process keeps running without
/// metrics — this is an optional subsystem, not core.
pub fn spawn(bind: String, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let router = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(metrics);

        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(l) => l,
            Err(e) => {
                warn!(bind = %bind, err = %e, "metrics server failed to bind — continuing without metrics");
                return;
            }
        };
        info!(bind = %bind, "metrics server listening");
        if let Err(e) = axum::serve(listener, router).await {
            warn!(err = %e, "metrics server exited");
        }
    });
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (StatusCode::OK, metrics.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_starts_at_zero_and_increments() {
        let metrics = Metrics::new("test_hss_worker_restarts").unwrap();
        assert_eq!(metrics.worker_restarts.get(), 0);
        metrics.worker_restarts.inc();
        assert_eq!(metrics.worker_restarts.get(), 1);
    }

    #[test]
    fn render_includes_metric_name() {
        let metrics = Metrics::new("test_hss_worker_restarts_2").unwrap();
        metrics.worker_restarts.inc();
        let text = metrics.render();
        assert!(text.contains("test_hss_worker_restarts_2"));
        assert!(text.contains('1'));
    }
}
