use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hss_stabilizer::config::StabilizerConfig;
use hss_stabilizer::metrics::Metrics;
use hss_stabilizer::pool::PermitPool;
use hss_stabilizer::{demo, dispatch, metrics, supervisor, AppState};

#[derive(Parser)]
#[command(
    name = "stabilizer",
    about = "Reverse-proxy front that stabilizes a flaky backend behind a pool of supervised worker subprocesses",
    version
)]
struct Args {
    /// Front HTTP server bind address.
    #[arg(long, env = "STABILIZER_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Number of worker subprocesses to keep alive (N).
    #[arg(long, short = 'n', env = "STABILIZER_WORKERS", default_value_t = 8)]
    workers: usize,

    /// Permits (concurrent in-flight requests) per worker (C).
    #[arg(long, short = 'c', env = "STABILIZER_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Default per-request deadline, e.g. "10s", "1m".
    #[arg(long, env = "STABILIZER_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Request header that can override the per-request timeout. Empty
    /// disables the override.
    #[arg(long, env = "STABILIZER_HEADER", default_value = "X-Stabilize-Timeout")]
    header: String,

    /// Prometheus metrics server bind address. Empty disables it.
    #[arg(long, env = "STABILIZER_PROMETHEUS", default_value = "0.0.0.0:6060")]
    prometheus: String,

    /// Prefix for exported metric names. Empty means no prefix.
    #[arg(long, env = "STABILIZER_PROMETHEUS_APP_NAME", default_value = "")]
    prometheus_app_name: String,

    /// Start the ambient demo backend instead of requiring one.
    #[arg(long, env = "STABILIZER_DEMO")]
    demo: bool,

    /// Demo backend bind address, used only when `--demo` is set.
    #[arg(long, env = "STABILIZER_DEMO_LISTEN", default_value = "0.0.0.0:8090")]
    demo_listen: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "STABILIZER_LOG", default_value = "info")]
    log: String,

    /// The backend command and its arguments, e.g. `-- mybackend --port {{.Port}}`.
    /// `{{.Port}}` is substituted with each worker's allocated loopback port.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log);

    // `--demo` starts an independent, standalone flaky backend on
    // `demo-listen` for kicking the tires — it is never itself the dispatch
    // target, so the wrapped command is still required regardless. Point
    // the wrapped command at the demo backend's address to try it out.
    let command = match supervisor::command_spec(args.command) {
        Some(c) => c,
        None => {
            eprintln!("error: no backend command given (pass one after `--`)");
            std::process::exit(2);
        }
    };

    let config = Arc::new(StabilizerConfig {
        listen: args.listen,
        workers: args.workers.max(1),
        concurrency: args.concurrency.max(1),
        timeout: args.timeout,
        header: args.header,
        prometheus: args.prometheus,
        prometheus_app_name: args.prometheus_app_name,
        command,
        demo: args.demo,
        demo_listen: args.demo_listen,
    });

    let metrics = Metrics::new(&config.restart_metric_name()).context("failed to initialize metrics registry")?;
    let pool = PermitPool::new(config.pool_capacity());
    let workers = Arc::new(RwLock::new(HashMap::new()));
    let shutdown = CancellationToken::new();

    if !config.prometheus.is_empty() {
        metrics::spawn(config.prometheus.clone(), metrics.clone());
    }
    if config.demo {
        demo::spawn(config.demo_listen.clone());
    }

    let sup = supervisor::Supervisor::new(config.clone(), pool.clone(), workers.clone(), shutdown.clone());
    sup.ensure(config.workers);

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .tcp_keepalive(Duration::from_secs(30))
        // Loopback traffic to workers is always plaintext; this is reserved
        // in case a future worker transport needs TLS.
        .build()
        .context("failed to build outbound HTTP client")?;

    let state = Arc::new(AppState {
        config: config.clone(),
        pool,
        workers,
        http,
        metrics,
    });

    let router = axum::Router::new()
        .fallback(dispatch::dispatch)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    info!(listen = %config.listen, workers = config.workers, concurrency = config.concurrency, "stabilizer starting");

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind front listener on {}", config.listen))?;

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await;

    result.context("front server exited with an error")
}

/// Initialize the tracing subscriber. Stdout only — this front door has no
/// log-rotation requirement, unlike a long-lived host daemon.
fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .init();
}
