//! The emit boundary between pipeline logic and transport.
//!
//! The orchestrator receives two explicit channels: unicast delivery to the
//! originating observer and multicast delivery to every observer of the
//! session. The transport is best-effort; a failed emit is logged and never
//! aborts the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use loom_core::events::SessionEvent;

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &SessionEvent) -> Result<(), EmitError>;
}

/// The two delivery channels handed to the orchestrator.
#[derive(Clone)]
pub struct Emitter {
    unicast: Arc<dyn EventSink>,
    multicast: Arc<dyn EventSink>,
}

impl Emitter {
    pub fn new(unicast: Arc<dyn EventSink>, multicast: Arc<dyn EventSink>) -> Self {
        Self { unicast, multicast }
    }

    /// Deliver to the originating observer only.
    pub async fn unicast(&self, event: SessionEvent) {
        if let Err(e) = self.unicast.deliver(&event).await {
            warn!(event_type = event.event_type(), error = %e, "unicast emit failed");
        }
    }

    /// Deliver to every observer of the session.
    pub async fn multicast(&self, event: SessionEvent) {
        if let Err(e) = self.multicast.deliver(&event).await {
            warn!(event_type = event.event_type(), error = %e, "multicast emit failed");
        }
    }
}

/// Channel-backed sink for tests and in-process observers.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event: &SessionEvent) -> Result<(), EmitError> {
        self.tx
            .send(event.clone())
            .map_err(|e| EmitError::Delivery(e.to_string()))
    }
}
