use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use koukoku_core::ids::SubscriberId;
use tokio::sync::mpsc;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// A WebSocket subscriber of the record feed.
pub struct FeedClient {
    pub id: SubscriberId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl FeedClient {
    fn new(id: SubscriberId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// All connected feed subscribers.
pub struct ClientRegistry {
    clients: DashMap<SubscriberId, Arc<FeedClient>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a subscriber and return its id and outbound queue.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(FeedClient::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &SubscriberId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Queue `message` for every connected subscriber. A subscriber whose
    /// queue is full misses this message. Returns how many accepted it.
    pub fn broadcast(&self, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.clients.iter() {
            let client = entry.value();
            if !client.is_connected() {
                continue;
            }
            match client.tx.try_send(message.to_owned()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = %client.id,
                        "feed queue full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    fn get(&self, id: &SubscriberId) -> Option<Arc<FeedClient>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove subscribers that stopped answering pings.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<SubscriberId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(subscriber = %id, "cleaned up dead subscriber");
        }
        dead.len()
    }
}

/// Drive one feed socket: forward queued records, ping periodically, track
/// pongs. The feed is push-only; inbound text is ignored.
pub async fn handle_ws_connection(
    socket: WebSocket,
    id: SubscriberId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(subscriber = %writer_id, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_id = id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_id) {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Text(text) => {
                    tracing::debug!(subscriber = %reader_id, len = text.len(), "ignoring inbound text");
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&id);
    tracing::info!(subscriber = %id, "feed subscriber disconnected");
}

/// Periodically drop dead subscribers.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "dead subscriber cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("sub_"));
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let registry = ClientRegistry::new(32);
        let (_a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();

        assert_eq!(registry.broadcast("hello"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert_eq!(rx_b.try_recv().unwrap(), "hello");
    }

    #[test]
    fn broadcast_skips_full_queue() {
        let registry = ClientRegistry::new(1);
        let (_slow, _rx_slow) = registry.register();

        assert_eq!(registry.broadcast("one"), 1);
        assert_eq!(registry.broadcast("two"), 0);
    }

    #[test]
    fn broadcast_skips_closed_receiver() {
        let registry = ClientRegistry::new(4);
        let (_gone, rx) = registry.register();
        drop(rx);
        assert_eq!(registry.broadcast("hello"), 0);
    }

    #[test]
    fn pong_tracking() {
        let (tx, _rx) = mpsc::channel(1);
        let client = FeedClient::new(SubscriberId::new(), tx);
        assert!(client.is_alive());
        client.record_pong();
        assert!(client.is_alive());
    }

    #[test]
    fn cleanup_removes_expired() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();

        registry.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 0);
    }
}
