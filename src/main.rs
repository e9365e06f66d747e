use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use secrecy::SecretString;

use loom_agents::anthropic::{AnthropicAgents, AnthropicConfig};
use loom_agents::contracts::AgentSuite;
use loom_agents::mock::MockAgents;
use loom_engine::{Orchestrator, ScenarioSet, SessionRegistry};
use loom_server::{start, AppState, ClientRegistry, ServerConfig};
use loom_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "loom", about = "Session-scoped knowledge-graph dialogue server")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9091)]
    port: u16,

    /// Directory for per-session graph records and logs. Defaults to ~/.loom.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Use scripted agents instead of the Anthropic API.
    #[arg(long)]
    mock_agents: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    let _log_sink = loom_telemetry::init(&TelemetryConfig {
        default_filter: "info".into(),
        log_db_path: Some(data_dir.join("logs.db")),
    });
    tracing::info!(data_dir = %data_dir.display(), "starting loom");

    let agents = build_agents(cli.mock_agents);
    let state = AppState {
        sessions: Arc::new(SessionRegistry::new(
            ScenarioSet::builtin(),
            Some(data_dir.join("sessions")),
        )),
        clients: Arc::new(ClientRegistry::new(256)),
        orchestrator: Arc::new(Orchestrator::new(agents.clone())),
        agents,
    };

    let handle = start(
        ServerConfig {
            port: cli.port,
            max_send_queue: 256,
        },
        state,
    )
    .await
    .expect("failed to start server");
    tracing::info!(port = handle.port, "loom ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("shutting down");
}

fn build_agents(force_mock: bool) -> AgentSuite {
    if force_mock {
        tracing::info!("using scripted agents (--mock-agents)");
        return MockAgents::new().suite();
    }

    match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            let mut config = AnthropicConfig::new(SecretString::from(key));
            if let Ok(model) = std::env::var("ANTHROPIC_MODEL") {
                if !model.trim().is_empty() {
                    config.model = model;
                }
            }
            match AnthropicAgents::new(config) {
                Ok(agents) => {
                    let agents: Arc<AnthropicAgents> = Arc::new(agents);
                    return AgentSuite {
                        listener: agents.clone(),
                        learner: agents.clone(),
                        reflector: agents.clone(),
                        guardian: agents.clone(),
                        analyzer: agents.clone(),
                        voices: agents.clone(),
                        insight: agents,
                    };
                }
                Err(e) => {
                    tracing::warn!(error = %e, "anthropic client unavailable, using scripted agents");
                }
            }
        }
        _ => {
            tracing::warn!("ANTHROPIC_API_KEY not set, using scripted agents");
        }
    }
    MockAgents::new().suite()
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".loom")
}
