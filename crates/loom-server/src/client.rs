//! Connected observer registry. Each WebSocket client gets a bounded send
//! queue and is bound to one session; delivery to a slow or dead client
//! drops messages rather than blocking the pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use loom_core::ids::SessionId;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct ClientHandle {
    pub id: ClientId,
    session: RwLock<Option<SessionId>>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl ClientHandle {
    pub fn bind_session(&self, session_id: SessionId) {
        *self.session.write() = Some(session_id);
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        now_secs().saturating_sub(self.last_pong.load(Ordering::Relaxed))
            < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
    queue_size: usize,
}

impl ClientRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            clients: DashMap::new(),
            queue_size,
        }
    }

    pub fn register(&self) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let handle = Arc::new(ClientHandle {
            id: ClientId::new(),
            session: RwLock::new(None),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        });
        self.clients.insert(handle.id.clone(), Arc::clone(&handle));
        (handle, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, handle)) = self.clients.remove(id) {
            handle.mark_disconnected();
        }
    }

    /// Send to one client. Returns false when the client is gone or its
    /// queue is full; the message is dropped either way.
    pub fn send_to(&self, id: &ClientId, message: &str) -> bool {
        let Some(handle) = self.clients.get(id) else {
            return false;
        };
        match handle.tx.try_send(message.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(client_id = %id, "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver to every connected client bound to the session. Returns how
    /// many clients received it.
    pub fn broadcast_to_session(&self, session_id: &SessionId, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.clients.iter() {
            let handle = entry.value();
            if handle.is_connected() && handle.session().as_ref() == Some(session_id) {
                if handle.tx.try_send(message.to_string()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Drop clients that stopped answering pings.
    pub fn sweep_dead(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();
        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "swept dead client");
        }
        dead.len()
    }
}

/// Periodic dead-client sweep.
pub fn start_sweeper(registry: Arc<ClientRegistry>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let swept = registry.sweep_dead();
            if swept > 0 {
                tracing::info!(swept, "dead client sweep");
            }
        }
    })
}
