//! Dispatch queue and worker pool — bounded-concurrency admission of due
//! tasks into execution.
//!
//! A single bounded `mpsc` channel buffers `{task_id}` events; a fixed
//! pool of workers drains it at a rate capped by a ticker shared across
//! all of them. When the queue is full the event is still executed —
//! detached, unrate-limited, with a warning log — so a clogged queue can
//! never silently drop a cron fire. `reload` tears down and rebuilds the
//! pool cooperatively: in-flight executions are never interrupted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 100,
            interval_ms: 200,
        }
    }
}

pub type RunFn = Arc<dyn Fn(i64) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Pool {
    sender: mpsc::Sender<i64>,
    stop: mpsc::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    ticker_handle: JoinHandle<()>,
}

/// Owns the dispatch queue and worker pool as one rebuildable unit.
pub struct Dispatcher {
    inner: Mutex<Pool>,
    run: RunFn,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, run: RunFn) -> Self {
        let pool = Self::spawn_pool(config, run.clone());
        Self {
            inner: Mutex::new(pool),
            run,
        }
    }

    fn spawn_pool(config: DispatchConfig, run: RunFn) -> Pool {
        let (tx, rx) = mpsc::channel::<i64>(config.queue_capacity.max(1));
        let (stop_tx, _stop_rx) = mpsc::channel::<()>(1);
        let rx = Arc::new(Mutex::new(rx));

        // One ticker shared by the whole pool: it is the sole producer of
        // start tokens, so the aggregate task-start rate across every
        // worker is capped at one per `interval`, not per-worker.
        let (token_tx, token_rx) = mpsc::channel::<()>(1);
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let ticker_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if token_tx.send(()).await.is_err() {
                    break;
                }
            }
        });
        let token_rx = Arc::new(Mutex::new(token_rx));

        let mut handles = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count.max(1) {
            let rx = rx.clone();
            let token_rx = token_rx.clone();
            let run = run.clone();
            let stop_tx_for_worker = stop_tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    let got_token = {
                        let mut guard = token_rx.lock().await;
                        guard.recv().await
                    };
                    if got_token.is_none() {
                        break;
                    }
                    let next = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match next {
                        Some(task_id) => run(task_id).await,
                        None => break,
                    }
                }
                drop(stop_tx_for_worker);
            });
            handles.push(handle);
        }

        Pool {
            sender: tx,
            stop: stop_tx,
            handles,
            ticker_handle,
        }
    }

    /// Enqueue a dispatch event. Falls back to detached direct execution
    /// if the queue is full, per the preserved "never drop a fire" policy.
    pub async fn enqueue(&self, task_id: i64) {
        let sender = {
            let guard = self.inner.lock().await;
            guard.sender.clone()
        };
        match sender.try_send(task_id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task_id)) => {
                tracing::warn!(task_id, "dispatch queue full, falling back to direct execution");
                let run = self.run.clone();
                tokio::spawn(async move { run(task_id).await });
            }
            Err(mpsc::error::TrySendError::Closed(task_id)) => {
                tracing::warn!(task_id, "dispatch queue closed during reload, running directly");
                let run = self.run.clone();
                tokio::spawn(async move { run(task_id).await });
            }
        }
    }

    /// Stop all current workers cooperatively and rebuild the queue,
    /// ticker, and pool under `config`. In-flight executions are not
    /// interrupted: they keep running under the old worker task until
    /// the command they're awaiting completes, then that worker task
    /// exits on its own once the channel closes under it.
    pub async fn reload(&self, config: DispatchConfig) {
        let mut guard = self.inner.lock().await;
        let old = std::mem::replace(&mut *guard, Self::spawn_pool(config, self.run.clone()));
        drop(old.sender);
        drop(old.stop);
        old.ticker_handle.abort();
        for handle in old.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn enqueued_events_are_eventually_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_for_run = counter.clone();
        let run: RunFn = Arc::new(move |_task_id| {
            let counter = counter_for_run.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let dispatcher = Dispatcher::new(
            DispatchConfig {
                worker_count: 2,
                queue_capacity: 10,
                interval_ms: 5,
            },
            run,
        );
        for i in 0..5 {
            dispatcher.enqueue(i).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn queue_full_falls_back_to_direct_execution() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_for_run = counter.clone();
        // A worker_count of 0 workers would never drain; use 1 slow worker
        // and a capacity-1 queue to force overflow deterministically.
        let run: RunFn = Arc::new(move |_task_id| {
            let counter = counter_for_run.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let dispatcher = Dispatcher::new(
            DispatchConfig {
                worker_count: 1,
                queue_capacity: 1,
                interval_ms: 500,
            },
            run,
        );
        for i in 0..5 {
            dispatcher.enqueue(i).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }
}
