use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use weft_core::types::NodeId;
use weft_core::value::DataValue;

/// Pending user-input requests, answered from outside the run.
#[derive(Default)]
pub struct UserInputBroker {
    pending: tokio::sync::Mutex<HashMap<NodeId, oneshot::Sender<Vec<String>>>>,
}

impl UserInputBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request for `node_id` and return the receiver to await.
    /// A second request for the same node replaces the first.
    pub async fn request(&self, node_id: NodeId) -> oneshot::Receiver<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(node_id, tx);
        rx
    }

    /// Answer a pending request. Returns true if one was found.
    pub async fn respond(&self, node_id: &NodeId, answers: Vec<String>) -> bool {
        let entry = self.pending.lock().await.remove(node_id);
        match entry {
            Some(tx) => {
                // The node may have been aborted in the meantime.
                let _ = tx.send(answers);
                true
            }
            None => false,
        }
    }

    pub async fn pending_requests(&self) -> Vec<NodeId> {
        self.pending.lock().await.keys().cloned().collect()
    }

    /// Drop the request for `node_id` once its receiver is gone. A newer
    /// request for the same node is kept.
    pub async fn withdraw(&self, node_id: &NodeId) {
        let mut pending = self.pending.lock().await;
        if pending.get(node_id).is_some_and(|tx| tx.is_closed()) {
            pending.remove(node_id);
        }
    }

    /// Forget requests left over from a previous run.
    pub async fn clear(&self) {
        self.pending.lock().await.clear();
    }
}

/// Named user events between nodes and the host.
///
/// An event raised while nobody waits is held until the next waiter for
/// that name; a later raise replaces it.
#[derive(Default)]
pub struct UserEventHub {
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    waiters: HashMap<String, Vec<oneshot::Sender<DataValue>>>,
    unclaimed: HashMap<String, DataValue>,
}

impl UserEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, name: &str, value: DataValue) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let waiters = state.waiters.remove(name).unwrap_or_default();

        let mut delivered = false;
        for tx in waiters {
            delivered |= tx.send(value.clone()).is_ok();
        }
        if !delivered {
            debug!(event = name, "No waiters for user event, holding it");
            state.unclaimed.insert(name.to_string(), value);
        }
    }

    pub fn wait(&self, name: &str) -> oneshot::Receiver<DataValue> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.unclaimed.remove(name) {
            Some(value) => {
                let _ = tx.send(value);
            }
            None => state.waiters.entry(name.to_string()).or_default().push(tx),
        }
        rx
    }

    /// Forget held events and waiters from a previous run.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiters.clear();
        state.unclaimed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_respond_resolves_request() {
        let broker = UserInputBroker::new();
        let rx = broker.request(NodeId::from("n")).await;
        assert_eq!(broker.pending_requests().await, vec![NodeId::from("n")]);

        assert!(broker.respond(&NodeId::from("n"), vec!["yes".into()]).await);
        assert_eq!(rx.await.unwrap(), vec!["yes".to_string()]);
        assert!(broker.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_respond_unknown_node() {
        let broker = UserInputBroker::new();
        assert!(!broker.respond(&NodeId::from("missing"), Vec::new()).await);
    }

    #[tokio::test]
    async fn test_withdraw_drops_abandoned_request_only() {
        let broker = UserInputBroker::new();
        let abandoned = broker.request(NodeId::from("n")).await;
        let _live = broker.request(NodeId::from("m")).await;
        drop(abandoned);

        broker.withdraw(&NodeId::from("n")).await;
        broker.withdraw(&NodeId::from("m")).await;
        assert_eq!(broker.pending_requests().await, vec![NodeId::from("m")]);

        broker.clear().await;
        assert!(broker.pending_requests().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_raise_and_wait_never_lose_event() {
        let hub = std::sync::Arc::new(UserEventHub::new());
        for i in 0..500 {
            let name = format!("e{i}");
            let waiter = {
                let hub = hub.clone();
                let name = name.clone();
                tokio::spawn(async move { hub.wait(&name).await })
            };
            let raiser = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.raise(&name, DataValue::number(i as f64)) })
            };
            raiser.await.unwrap();
            let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
                .await
                .expect("waiter never woke")
                .unwrap()
                .unwrap();
            assert_eq!(got, DataValue::number(i as f64));
        }
    }

    #[tokio::test]
    async fn test_event_reaches_every_waiter() {
        let hub = UserEventHub::new();
        let a = hub.wait("go");
        let b = hub.wait("go");
        hub.raise("go", DataValue::number(1.0));
        assert_eq!(a.await.unwrap(), DataValue::number(1.0));
        assert_eq!(b.await.unwrap(), DataValue::number(1.0));
    }

    #[tokio::test]
    async fn test_event_raised_early_is_held() {
        let hub = UserEventHub::new();
        hub.raise("go", DataValue::string("first"));
        hub.raise("go", DataValue::string("second"));
        assert_eq!(hub.wait("go").await.unwrap(), DataValue::string("second"));

        hub.reset();
        hub.raise("other", DataValue::boolean(true));
        hub.reset();
        let mut rx = hub.wait("other");
        assert!(rx.try_recv().is_err());
    }
}
