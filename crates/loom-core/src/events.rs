//! Typed events streamed to observing clients during message processing.
//!
//! One enum covers the whole stream; every variant is unicast to the
//! originating observer except `Breakthrough`, which is multicast to all
//! observers of the session because it changes shared session meaning.

use serde::{Deserialize, Serialize};

use crate::model::{GraphSnapshot, NodeFieldChange, RewriteDiff};

/// Lifecycle state reported around each named sub-agent invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Running,
    Done,
}

/// How a user response related to the prior reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionType {
    Productive,
    Clarifying,
    Rejecting,
    Agreement,
}

impl CorrectionType {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "productive" => Some(Self::Productive),
            "clarifying" => Some(Self::Clarifying),
            "rejecting" => Some(Self::Rejecting),
            "agreement" => Some(Self::Agreement),
            _ => None,
        }
    }
}

/// Scenario header sent on connect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    pub id: String,
    pub title: String,
    pub tagline: String,
    pub case_description: String,
    pub targets: Vec<TargetSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Derived behavioral signals published after scenario-mode turns.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorSignals {
    pub sycophancy: f64,
    pub fear_activation: f64,
    pub authenticity: f64,
}

/// Events on the per-session stream, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    ScenarioLoaded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scenario: Option<ScenarioSummary>,
        graph_data: GraphSnapshot,
        triggered_breakthroughs: Vec<String>,
    },

    AgentStatus {
        agent: String,
        status: AgentPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    GraphUpdate {
        graph_data: GraphSnapshot,
        node_changes: Vec<NodeFieldChange>,
    },

    PartResponse {
        part: String,
        name: String,
        content: String,
        color: String,
    },

    CorrectionDetected {
        correction_type: CorrectionType,
        before_claim: String,
        after_insight: String,
        affected_node_ids: Vec<String>,
        field_changes: Vec<NodeFieldChange>,
    },

    /// Multicast to every observer of the session.
    Breakthrough {
        breakthrough_id: String,
        name: String,
        insight_summary: String,
        graph_diff: RewriteDiff,
        full_snapshot: GraphSnapshot,
    },

    VectorSnapshot {
        vectors: VectorSignals,
    },

    WarmthSignal {
        warmth: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_breakthrough_id: Option<String>,
    },

    NodeAnswer {
        node_id: String,
        answer: String,
    },

    Error {
        message: String,
    },
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ScenarioLoaded { .. } => "scenario_loaded",
            Self::AgentStatus { .. } => "agent_status",
            Self::GraphUpdate { .. } => "graph_update",
            Self::PartResponse { .. } => "part_response",
            Self::CorrectionDetected { .. } => "correction_detected",
            Self::Breakthrough { .. } => "breakthrough",
            Self::VectorSnapshot { .. } => "vector_snapshot",
            Self::WarmthSignal { .. } => "warmth_signal",
            Self::NodeAnswer { .. } => "node_answer",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event goes to every observer of the session rather than
    /// only the originating one.
    pub fn is_multicast(&self) -> bool {
        matches!(self, Self::Breakthrough { .. })
    }

    pub fn status_running(agent: impl Into<String>) -> Self {
        Self::AgentStatus {
            agent: agent.into(),
            status: AgentPhase::Running,
            summary: None,
            duration_ms: None,
        }
    }

    pub fn status_done(
        agent: impl Into<String>,
        summary: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self::AgentStatus {
            agent: agent.into(),
            status: AgentPhase::Done,
            summary: Some(summary.into()),
            duration_ms: Some(duration_ms),
        }
    }
}
