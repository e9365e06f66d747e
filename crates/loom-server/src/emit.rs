//! Transport-side implementations of the engine's emit boundary: unicast to
//! the originating observer's queue, multicast to every observer of the
//! session.

use std::sync::Arc;

use async_trait::async_trait;

use loom_core::events::SessionEvent;
use loom_core::ids::SessionId;
use loom_engine::emit::{EmitError, Emitter, EventSink};

use crate::client::{ClientId, ClientRegistry};

fn serialize(event: &SessionEvent) -> Result<String, EmitError> {
    serde_json::to_string(event).map_err(|e| EmitError::Delivery(e.to_string()))
}

struct ClientSink {
    registry: Arc<ClientRegistry>,
    client_id: ClientId,
}

#[async_trait]
impl EventSink for ClientSink {
    async fn deliver(&self, event: &SessionEvent) -> Result<(), EmitError> {
        let json = serialize(event)?;
        if self.registry.send_to(&self.client_id, &json) {
            Ok(())
        } else {
            Err(EmitError::Delivery(format!(
                "client {} unreachable",
                self.client_id
            )))
        }
    }
}

struct SessionSink {
    registry: Arc<ClientRegistry>,
    session_id: SessionId,
}

#[async_trait]
impl EventSink for SessionSink {
    async fn deliver(&self, event: &SessionEvent) -> Result<(), EmitError> {
        let json = serialize(event)?;
        // Zero reachable observers is fine; session state is independent of
        // any one of them.
        self.registry.broadcast_to_session(&self.session_id, &json);
        Ok(())
    }
}

/// Build the two emit channels for one observer of one session.
pub fn emitter_for(
    registry: &Arc<ClientRegistry>,
    client_id: ClientId,
    session_id: SessionId,
) -> Emitter {
    Emitter::new(
        Arc::new(ClientSink {
            registry: Arc::clone(registry),
            client_id,
        }),
        Arc::new(SessionSink {
            registry: Arc::clone(registry),
            session_id,
        }),
    )
}
