// SPDX-License-Identifier: MIT
//! Stabilizer configuration — built once from CLI flags/env vars, then shared
//! read-only (`Arc<StabilizerConfig>`) by the supervisor and dispatcher.

use std::time::Duration;

/// Token substituted, wherever it appears in an argument, with the worker's
/// allocated port (decimal, no padding).
pub const PORT_PLACEHOLDER: &str = "{{.Port}}";

/// The wrapped backend command and its argument template.
///
/// Immutable after construction — each worker substitutes its own port into
/// a fresh copy via [`CommandSpec::args_for_port`], it never mutates this.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Render the argument list for a specific worker port.
    ///
    /// Replaces every occurrence of [`PORT_PLACEHOLDER`] inside each argument
    /// with `port` as a decimal string. A single pass is sufficient and
    /// idempotent: the substituted port string never itself contains the
    /// placeholder token.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

/// All configuration the stabilizer needs after flags/env have been parsed.
#[derive(Debug, Clone)]
pub struct StabilizerConfig {
    /// Front HTTP server bind address, e.g. `0.0.0.0:8080`.
    pub listen: String,
    /// N — number of live worker subprocesses to maintain.
    pub workers: usize,
    /// C — permits (concurrent in-flight requests) per worker.
    pub concurrency: usize,
    /// Default per-request deadline when no override header is present.
    pub timeout: Duration,
    /// Request header name that can override the per-request timeout.
    /// Empty disables the override entirely.
    pub header: String,
    /// Prometheus metrics server bind address. Empty disables it.
    pub prometheus: String,
    /// Prefix prepended to exported metric names (and, were this extended,
    /// to app identity). Empty means no prefix.
    pub prometheus_app_name: String,
    /// The wrapped backend command.
    pub command: CommandSpec,
    /// Demo backend toggle + bind address (ambient, unrelated to the core).
    pub demo: bool,
    pub demo_listen: String,
}

impl StabilizerConfig {
    /// Pool capacity: N * C.
    pub fn pool_capacity(&self) -> usize {
        self.workers * self.concurrency
    }

    /// The metric name for the restart counter, with the configured prefix.
    pub fn restart_metric_name(&self) -> String {
        if self.prometheus_app_name.is_empty() {
            "hss_worker_restarts".to_string()
        } else {
            format!("{}_hss_worker_restarts", self.prometheus_app_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_every_occurrence() {
        let cmd = CommandSpec::new(
            "backend".into(),
            vec![
                "--port".into(),
                "{{.Port}}".into(),
                "--log".into(),
                "p-{{.Port}}.log".into(),
            ],
        );
        let args = cmd.args_for_port(54321);
        assert_eq!(args, vec!["--port", "54321", "--log", "p-54321.log"]);
    }

    #[test]
    fn substitution_is_idempotent_after_first_pass() {
        let cmd = CommandSpec::new("backend".into(), vec!["{{.Port}}".into()]);
        let once = cmd.args_for_port(9000);
        // Re-running substitution against the *original* template again
        // yields the same result; the already-substituted string contains
        // no placeholder token to re-substitute.
        let again = cmd.args_for_port(9000);
        assert_eq!(once, again);
        assert!(!once[0].contains(PORT_PLACEHOLDER));
    }

    #[test]
    fn restart_metric_name_respects_prefix() {
        let mut cfg = sample_config();
        assert_eq!(cfg.restart_metric_name(), "hss_worker_restarts");
        cfg.prometheus_app_name = "acme".into();
        assert_eq!(cfg.restart_metric_name(), "acme_hss_worker_restarts");
    }

    fn sample_config() -> StabilizerConfig {
        StabilizerConfig {
            listen: ":8080".into(),
            workers: 8,
            concurrency: 10,
            timeout: Duration::from_secs(10),
            header: "X-Stabilize-Timeout".into(),
            prometheus: ":6060".into(),
            prometheus_app_name: String::new(),
            command: CommandSpec::new("true".into(), vec![]),
            demo: false,
            demo_listen: ":8090".into(),
        }
    }
}
