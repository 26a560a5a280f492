// SPDX-License-Identifier: MIT
//! Permit pool — the bounded admission queue that multiplexes inbound
//! requests onto a fixed population of workers with bounded concurrency.
//!
//! Capacity is N*C: N workers times C permits each. The pool is the single
//! source of admission control; there is no separate counter. Rather than
//! try to purge permits when a worker dies (expensive and racy — other
//! producers may still be pushing, other consumers may be mid-pop), a
//! permit is just an `Arc<Worker>` and `acquire` filters out dead ones as it
//! draws them.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::worker::Worker;

/// Sleep applied after discarding a dead-worker permit, so a dying worker's
/// C queued permits don't spin the acquirer hot before a replacement
/// publishes fresh ones.
const DEAD_PERMIT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct PermitPool {
    tx: async_channel::Sender<Arc<Worker>>,
    rx: async_channel::Receiver<Arc<Worker>>,
}

impl PermitPool {
    /// `capacity` should be `workers * concurrency` (N*C).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Publish one permit for `worker`. Blocks while the pool is full —
    /// callers that need this to respect a worker's death mid-publish
    /// should race it against `worker.wait_done()` (see `supervisor`).
    pub async fn publish(&self, worker: Arc<Worker>) -> Result<(), PoolClosed> {
        self.tx.send(worker).await.map_err(|_| PoolClosed)
    }

    /// Draw the next live worker from the pool, discarding and backing off
    /// on any permits for workers that have already died.
    pub async fn acquire(&self) -> Arc<Worker> {
        loop {
            // The pool only ever closes if every sender is dropped, which
            // doesn't happen while the supervisor is running; a closed
            // channel here would mean shutdown is in progress.
            let worker = match self.rx.recv().await {
                Ok(w) => w,
                Err(_) => {
                    tokio::time::sleep(DEAD_PERMIT_BACKOFF).await;
                    continue;
                }
            };
            if worker.is_dead() {
                debug!(port = worker.port, "discarding permit for dead worker");
                tokio::time::sleep(DEAD_PERMIT_BACKOFF).await;
                continue;
            }
            return worker;
        }
    }

    /// Return a permit to the pool without blocking the caller. A permit
    /// for a dead worker is fine to release — it's filtered on next
    /// acquire.
    pub fn release(&self, worker: Arc<Worker>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(worker).await;
        });
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("permit pool is closed")]
pub struct PoolClosed;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn fake_worker(port: u16) -> Arc<Worker> {
        // Workers only become observably "alive" via their cancellation
        // token; build one directly for pool-level unit tests rather than
        // spawning a real subprocess.
        Worker::for_test(port, CancellationToken::new())
    }

    #[tokio::test]
    async fn acquire_filters_dead_permits() {
        let pool = PermitPool::new(4);
        let dead = fake_worker(1);
        dead.cancel();
        let alive = fake_worker(2);

        pool.publish(dead).await.unwrap();
        pool.publish(alive.clone()).await.unwrap();

        let acquired = pool.acquire().await;
        assert_eq!(acquired.port, alive.port);
    }

    #[tokio::test]
    async fn release_round_trips() {
        let pool = PermitPool::new(1);
        let worker = fake_worker(3);
        pool.publish(worker.clone()).await.unwrap();

        let acquired = pool.acquire().await;
        pool.release(acquired);

        // release() is asynchronous — poll briefly for it to land.
        for _ in 0..50 {
            if pool.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.len(), 1);
    }
}
