// SPDX-License-Identifier: MIT
//! Demo backend — a minimal worker program to point the stabilizer at when
//! no real backend is configured.
//!
//! Ambient, outside the core: it exists purely so `--demo` gives a runnable
//! end-to-end example without requiring the operator to supply their own
//! flaky server. It replies `ok` on the fast path and occasionally stalls
//! past any reasonable timeout, so the rest of the system has something to
//! stabilize against.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{info, warn};

/// Every Nth request stalls long enough to blow past a typical timeout,
/// exercising the stabilizer's restart path.
const STALL_EVERY: u64 = 7;
const STALL_FOR: Duration = Duration::from_secs(30);

struct DemoState {
    requests: AtomicU64,
}

/// Start the demo backend on `bind`. Like the metrics server, a bind
/// failure here is logged and swallowed rather than treated as fatal —
/// `--demo` is a convenience, not a required subsystem.
pub fn spawn(bind: String) {
    tokio::spawn(async move {
        let state = Arc::new(DemoState {
            requests: AtomicU64::new(0),
        });
        let router = Router::new()
            .route("/{*path}", get(handle).post(handle))
            .route("/", get(handle).post(handle))
            .with_state(state);

        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(l) => l,
            Err(e) => {
                warn!(bind = %bind, err = %e, "demo backend failed to bind — continuing without it");
                return;
            }
        };
        info!(bind = %bind, "demo backend listening");
        if let Err(e) = axum::serve(listener, router).await {
            warn!(err = %e, "demo backend exited");
        }
    });
}

async fn handle(State(state): State<Arc<DemoState>>) -> impl IntoResponse {
    let n = state.requests.fetch_add(1, Ordering::SeqCst) + 1;
    if n % STALL_EVERY == 0 {
        warn!(request = n, "demo backend stalling");
        tokio::time::sleep(STALL_FOR).await;
    }
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stalls_on_the_configured_cadence() {
        let hits: Vec<u64> = (1..=21).filter(|n| n % STALL_EVERY == 0).collect();
        assert_eq!(hits, vec![7, 14, 21]);
    }
}
