//! Agent connection registry — one owning handle per connected agent.
//!
//! Generalizes the teacher's WebSocket node registry (itself grounded in
//! the sibling example pack's node gateway): a single `RwLock`-guarded map
//! from agent id to an opaque handle holding only a bounded outbound
//! channel and a liveness timestamp. No other task ever touches the
//! underlying transport directly — only the connection's own writer pump
//! drains the channel, so there is exactly one place that can observe
//! "is this connection closed?".

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::protocol::Frame;

pub struct AgentHandle {
    pub ip: IpAddr,
    pub sink: mpsc::Sender<Frame>,
    pub last_ping: Arc<StdMutex<DateTime<Utc>>>,
    /// Signals the owning connection's read loop to close immediately.
    /// Without this, displacing the registry entry only rebinds future
    /// lookups — the prior socket's read loop would otherwise run until
    /// its own idle timeout, able to keep reporting results in the
    /// meantime.
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<i64, AgentHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new connection for `agent_id`, cancelling and returning
    /// the displaced handle (if any) so the caller can log/await it.
    pub async fn register(&self, agent_id: i64, handle: AgentHandle) -> Option<AgentHandle> {
        let displaced = self.inner.write().await.insert(agent_id, handle);
        if let Some(prior) = &displaced {
            prior.cancel.cancel();
        }
        displaced
    }

    pub async fn remove(&self, agent_id: i64) {
        self.inner.write().await.remove(&agent_id);
    }

    /// Best-effort send: protocol messages are idempotent/replaceable, so
    /// a full buffer silently drops rather than blocking the caller.
    pub async fn send_to(&self, agent_id: i64, frame: Frame) -> bool {
        let guard = self.inner.read().await;
        match guard.get(&agent_id) {
            Some(handle) => handle.sink.try_send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn broadcast(&self, frame: Frame) {
        let guard = self.inner.read().await;
        for handle in guard.values() {
            let _ = handle.sink.try_send(frame.clone());
        }
    }

    pub async fn touch(&self, agent_id: i64) {
        let guard = self.inner.read().await;
        if let Some(handle) = guard.get(&agent_id) {
            *handle.last_ping.lock().expect("last_ping poisoned") = Utc::now();
        }
    }

    pub async fn is_connected(&self, agent_id: i64) -> bool {
        self.inner.read().await.contains_key(&agent_id)
    }

    /// Find every connection whose last ping predates `idle_secs`, remove
    /// them, and return their agent ids so the caller can mark them
    /// offline and close the underlying sockets.
    pub async fn sweep_stale(&self, idle_secs: i64) -> Vec<i64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(idle_secs);
        let mut guard = self.inner.write().await;
        let stale: Vec<i64> = guard
            .iter()
            .filter(|(_, h)| *h.last_ping.lock().expect("last_ping poisoned") < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            guard.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(ip: &str) -> (AgentHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (
            AgentHandle {
                ip: ip.parse().unwrap(),
                sink: tx,
                last_ping: Arc::new(StdMutex::new(Utc::now())),
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn registering_a_second_connection_displaces_the_first() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle("10.0.0.1");
        let (h2, _rx2) = handle("10.0.0.2");
        assert!(registry.register(1, h1).await.is_none());
        let displaced = registry.register(1, h2).await;
        assert!(displaced.is_some());
        assert!(registry.is_connected(1).await);
    }

    #[tokio::test]
    async fn displacement_cancels_the_prior_connection() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle("10.0.0.1");
        let cancel = h1.cancel.clone();
        let (h2, _rx2) = handle("10.0.0.2");
        registry.register(1, h1).await;
        assert!(!cancel.is_cancelled());
        let displaced = registry.register(1, h2).await.expect("first connection displaced");
        assert!(displaced.cancel.is_cancelled());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_connections() {
        let registry = ConnectionRegistry::new();
        let (fresh, _rx) = handle("10.0.0.3");
        let (stale, _rx2) = handle("10.0.0.4");
        *stale.last_ping.lock().unwrap() = Utc::now() - chrono::Duration::seconds(1000);
        *fresh.last_ping.lock().unwrap() = Utc::now();
        registry.register(1, fresh).await;
        registry.register(2, stale).await;
        let removed = registry.sweep_stale(120).await;
        assert_eq!(removed, vec![2]);
        assert!(registry.is_connected(1).await);
        assert!(!registry.is_connected(2).await);
    }
}
