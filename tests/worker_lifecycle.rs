//! End-to-end tests against real subprocesses (via `/bin/sh`), exercising
//! the parts that an in-crate unit test can't: actual process spawn, group
//! signaling, and port-placeholder substitution landing in a real argv.

use hss_stabilizer::config::CommandSpec;
use hss_stabilizer::supervisor::{self, Supervisor};
use hss_stabilizer::worker::Worker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn worker_reports_dead_after_natural_exit() {
    let parent = CancellationToken::new();
    let command = CommandSpec::new("/bin/sh".into(), vec!["-c".into(), "exit 0".into()]);
    let worker = Worker::spawn(&parent, 1, &command);

    tokio::time::timeout(Duration::from_secs(5), worker.wait_done())
        .await
        .expect("worker should reap promptly after exiting");
    assert!(worker.is_dead());
    assert!(worker.pid() > 0);
}

#[tokio::test]
async fn cancel_kills_a_long_running_worker() {
    let parent = CancellationToken::new();
    let command = CommandSpec::new("/bin/sh".into(), vec!["-c".into(), "sleep 300".into()]);
    let worker = Worker::spawn(&parent, 2, &command);

    assert!(!worker.is_dead());
    worker.cancel();

    tokio::time::timeout(Duration::from_secs(5), worker.wait_done())
        .await
        .expect("cancelled worker should be reaped promptly, not linger for the full sleep");
    assert!(worker.is_dead());
}

#[tokio::test]
async fn port_placeholder_reaches_the_spawned_argv() {
    let parent = CancellationToken::new();
    // Echo the substituted port back on stdout; we can't capture stdout
    // through the worker API directly, so instead assert indirectly: a
    // command that only succeeds when given a numeric, non-empty argument
    // fails (non-zero exit, still reaped cleanly) if substitution produced
    // the literal placeholder text instead of a port number.
    let command = CommandSpec::new(
        "/bin/sh".into(),
        vec!["-c".into(), "case \"$1\" in ''|*[!0-9]*) exit 1;; *) exit 0;; esac".into(), "sh".into(), "{{.Port}}".into()],
    );
    let worker = Worker::spawn(&parent, 54321, &command);
    worker.wait_done().await;
    assert!(worker.is_dead());
}

#[tokio::test]
async fn supervisor_keeps_n_workers_installed() {
    let config = Arc::new(hss_stabilizer::config::StabilizerConfig {
        listen: "127.0.0.1:0".into(),
        workers: 3,
        concurrency: 2,
        timeout: Duration::from_secs(5),
        header: String::new(),
        prometheus: String::new(),
        prometheus_app_name: String::new(),
        command: supervisor::command_spec(vec!["/bin/sh".into(), "-c".into(), "sleep 300".into()])
            .unwrap(),
        demo: false,
        demo_listen: String::new(),
    });
    let pool = hss_stabilizer::pool::PermitPool::new(config.pool_capacity());
    let workers = Arc::new(RwLock::new(HashMap::new()));
    let shutdown = CancellationToken::new();

    let sup = Supervisor::new(config.clone(), pool.clone(), workers.clone(), shutdown.clone());
    sup.ensure(config.workers);

    // Give the replenishment loops time to spawn, install, and publish.
    for _ in 0..50 {
        if workers.read().await.len() == 3 && pool.len() == config.pool_capacity() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(workers.read().await.len(), 3);
    assert_eq!(pool.len(), config.pool_capacity());

    shutdown.cancel();
}
