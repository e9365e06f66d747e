//! Axum server: WebSocket event stream plus the small HTTP surface
//! (health, scenario list, graph fetch, session export).

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use loom_agents::contracts::AgentSuite;
use loom_core::events::SessionEvent;
use loom_core::ids::SessionId;
use loom_engine::{Orchestrator, SessionRegistry};

use crate::client::{self, ClientHandle, ClientRegistry, HEARTBEAT_INTERVAL};
use crate::emit::emitter_for;
use crate::export;
use crate::handlers;

pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9091,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub agents: AgentSuite,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/scenarios", get(scenarios_handler))
        .route("/graph/{session_id}", get(graph_handler))
        .route("/export/{session_id}/json", get(export_json_handler))
        .route("/export/{session_id}/markdown", get(export_markdown_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle keeping the background tasks alive.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let sweeper = client::start_sweeper(
        Arc::clone(&state.clients),
        std::time::Duration::from_secs(60),
    );

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let port = listener.local_addr()?.port();

    tracing::info!(port, "server started");
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port,
        _server: server,
        _sweeper: sweeper,
    })
}

pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _sweeper: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    session: Option<String>,
    scenario: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: WsParams) {
    let session_id = SessionId::from_raw(params.session.unwrap_or_else(|| "default".into()));
    let session = state
        .sessions
        .get_or_create(&session_id, params.scenario.as_deref());

    let (client, outbound_rx) = state.clients.register();
    client.bind_session(session_id.clone());
    tracing::info!(client_id = %client.id, session_id = %session_id, "observer connected");

    let emitter = emitter_for(&state.clients, client.id.clone(), session_id);
    emitter
        .unicast(SessionEvent::ScenarioLoaded {
            scenario: session.scenario.as_ref().map(|s| s.summary()),
            graph_data: session.snapshot(),
            triggered_breakthroughs: session.triggered_snapshot(),
        })
        .await;

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_outbound(ws_tx, outbound_rx, Arc::clone(&client)));

    // Inbound frames are handled in order; a disconnect mid-pipeline stops
    // future unicast delivery but never aborts in-flight graph mutations.
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            WsMessage::Text(text) => {
                handlers::handle_frame(&state, &session, &emitter, text.as_str()).await;
            }
            WsMessage::Pong(_) => client.record_pong(),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.clients.unregister(&client.id);
    tracing::info!(client_id = %client.id, "observer disconnected");
}

async fn write_outbound(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<String>,
    client: Arc<ClientHandle>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    client.mark_disconnected();
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn scenarios_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sessions.scenarios().list())
}

async fn graph_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = state
        .sessions
        .get_or_create(&SessionId::from_raw(session_id), None);
    Json(session.snapshot())
}

async fn export_json_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = state
        .sessions
        .get_or_create(&SessionId::from_raw(session_id), None);
    Json(export::export_json(&session))
}

async fn export_markdown_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = state
        .sessions
        .get_or_create(&SessionId::from_raw(session_id), None);
    (
        [("content-type", "text/markdown; charset=utf-8")],
        export::export_markdown(&session),
    )
}
