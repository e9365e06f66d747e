//! Inbound WebSocket frame dispatch.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use loom_core::events::SessionEvent;
use loom_engine::emit::Emitter;
use loom_engine::{Session, AGENT_TIMEOUT};

use crate::server::AppState;

const NODE_ANSWER_FALLBACK: &str = "I couldn't find anything helpful about that node right now.";

/// Messages a client may send, discriminated by `type`. Anything else is a
/// validation failure: an `error` event goes back and no state is mutated.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    UserMessage {
        content: String,
    },
    NodeQuery {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(default)]
        question: String,
    },
}

pub async fn handle_frame(state: &AppState, session: &Arc<Session>, emitter: &Emitter, raw: &str) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            emitter
                .unicast(SessionEvent::Error {
                    message: format!("malformed message: {e}"),
                })
                .await;
            return;
        }
    };

    match frame {
        ClientFrame::UserMessage { content } => {
            let content = content.trim();
            if content.is_empty() {
                emitter
                    .unicast(SessionEvent::Error {
                        message: "empty message".into(),
                    })
                    .await;
                return;
            }
            info!(
                session_id = %session.id,
                preview = %content.chars().take(80).collect::<String>(),
                "user message"
            );
            state
                .orchestrator
                .process_message(session, content, emitter)
                .await;
        }

        ClientFrame::NodeQuery { node_id, question } => {
            let node = session.graph.lock().get_node(&node_id).cloned();
            let answer = match node {
                None => "I couldn't find information about that node.".to_string(),
                Some(node) => {
                    let node_json = serde_json::to_value(&node).unwrap_or_default();
                    match tokio::time::timeout(
                        AGENT_TIMEOUT,
                        state.agents.reflector.answer_node(&node_json, &question),
                    )
                    .await
                    {
                        Ok(Ok(answer)) => answer,
                        Ok(Err(e)) => {
                            warn!(session_id = %session.id, error = %e, "node answer failed");
                            NODE_ANSWER_FALLBACK.to_string()
                        }
                        Err(_) => NODE_ANSWER_FALLBACK.to_string(),
                    }
                }
            };
            emitter
                .unicast(SessionEvent::NodeAnswer { node_id, answer })
                .await;
        }
    }
}
