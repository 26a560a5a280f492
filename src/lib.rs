pub mod config;
pub mod demo;
pub mod dispatch;
pub mod metrics;
pub mod pool;
pub mod port;
pub mod supervisor;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use config::StabilizerConfig;
use metrics::Metrics;
use pool::PermitPool;
use worker::Worker;

/// Shared application state injected into every dispatch handler.
///
/// Mirrors the teacher daemon's `AppContext`: one `Arc`-wrapped bag of
/// collaborators, built once at startup and cloned cheaply per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<StabilizerConfig>,
    pub pool: PermitPool,
    /// port -> currently installed worker. Written once per restart by the
    /// supervisor. The dispatcher keeps the worker it acquired as a local
    /// value across the whole request instead of re-deriving it from this
    /// index (see DESIGN.md's Open Question #1), so nothing in the request
    /// path reads this map today; it's kept as the data model's canonical
    /// port->worker record for inspection and any future consumer.
    pub workers: Arc<RwLock<HashMap<u16, Arc<Worker>>>>,
    pub http: reqwest::Client,
    pub metrics: Arc<Metrics>,
}
