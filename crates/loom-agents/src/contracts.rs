//! Async trait contracts for the external collaborators the pipeline calls.
//! Only the shapes matter here; prompting lives with each implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use loom_core::events::CorrectionType;
use loom_core::model::{ChatTurn, Edge, Node};

use crate::error::AgentError;

/// One entity produced by extraction, already validated into a graph node.
/// `is_update` marks entities the extractor resolved to an existing id.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedEntity {
    pub node: Node,
    pub is_update: bool,
}

/// Validated extraction result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<Edge>,
}

impl Extraction {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// How the user's message relates to the prior reply.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrectionAssessment {
    pub correction_type: CorrectionType,
    pub new_memory_unlocked: bool,
    pub reflection_note: String,
    pub updated_profile_note: Option<String>,
}

/// Safety gate output. `modified_reply` replaces the proposed reply when the
/// gate withholds approval.
#[derive(Clone, Debug, PartialEq)]
pub struct SafetyVerdict {
    pub approved: bool,
    pub crisis_detected: bool,
    pub reason: String,
    pub modified_reply: Option<String>,
}

impl SafetyVerdict {
    /// Default approval used when the gate itself fails.
    pub fn pass() -> Self {
        Self {
            approved: true,
            crisis_detected: false,
            reason: "default approval".into(),
            modified_reply: None,
        }
    }
}

/// Conversational technique identified by the route probe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    DirectQuestion,
    Confrontation,
    Reflection,
    Reframe,
    #[default]
    OpenExploration,
    Interpretation,
    EmpathicValidation,
}

impl Technique {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct_question" => Some(Self::DirectQuestion),
            "confrontation" => Some(Self::Confrontation),
            "reflection" => Some(Self::Reflection),
            "reframe" => Some(Self::Reframe),
            "open_exploration" => Some(Self::OpenExploration),
            "interpretation" => Some(Self::Interpretation),
            "empathic_validation" => Some(Self::EmpathicValidation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectQuestion => "direct_question",
            Self::Confrontation => "confrontation",
            Self::Reflection => "reflection",
            Self::Reframe => "reframe",
            Self::OpenExploration => "open_exploration",
            Self::Interpretation => "interpretation",
            Self::EmpathicValidation => "empathic_validation",
        }
    }
}

/// Pressure the user is applying, mapped to a fixed weight for the derived
/// signal computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Gentle,
    #[default]
    Moderate,
    Firm,
    Intense,
}

impl Intensity {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gentle" => Some(Self::Gentle),
            "moderate" => Some(Self::Moderate),
            "firm" => Some(Self::Firm),
            "intense" => Some(Self::Intense),
            _ => None,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::Gentle => 0.2,
            Self::Moderate => 0.5,
            Self::Firm => 0.7,
            Self::Intense => 0.9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gentle => "gentle",
            Self::Moderate => "moderate",
            Self::Firm => "firm",
            Self::Intense => "intense",
        }
    }
}

/// Which targets the message addresses and how.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeRouting {
    pub addressed_targets: Vec<String>,
    pub technique: Technique,
    pub intensity: Intensity,
    pub summary: String,
}

/// One in-character response from a scenario voice.
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceReply {
    pub target: String,
    pub name: String,
    pub content: String,
    pub color: String,
}

/// Persona definition for a scenario voice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub id: String,
    pub name: String,
    pub color: String,
    pub persona: String,
    #[serde(default)]
    pub opening_knowledge: String,
    #[serde(default)]
    pub defenses: Vec<String>,
    #[serde(default)]
    pub vulnerability: String,
}

/// The single pending breakthrough the detector is asked to evaluate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakthroughCandidate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub detection_prompt: String,
}

/// Positive detection result.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedInsight {
    pub insight_summary: String,
}

/// One absorbed correction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub kind: CorrectionType,
    pub reflection: String,
}

/// Running summary of what works for this user, built up from classified
/// corrections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreferenceProfile {
    pub summary: String,
    pub corrections: Vec<CorrectionRecord>,
}

impl Default for PreferenceProfile {
    fn default() -> Self {
        Self {
            summary: "No profile yet, first interaction.".into(),
            corrections: Vec::new(),
        }
    }
}

impl PreferenceProfile {
    /// Fold a classified correction into the profile.
    pub fn absorb(&mut self, assessment: &CorrectionAssessment) {
        self.corrections.push(CorrectionRecord {
            kind: assessment.correction_type,
            reflection: assessment.reflection_note.clone(),
        });
        if let Some(note) = &assessment.updated_profile_note {
            self.summary = note.clone();
        }
    }

    /// Text rendering injected into generation prompts.
    pub fn render(&self) -> String {
        if self.corrections.is_empty() {
            return self.summary.clone();
        }
        let recent: Vec<String> = self
            .corrections
            .iter()
            .rev()
            .take(5)
            .map(|c| format!("- {:?}: {}", c.kind, c.reflection))
            .collect();
        format!("{}\nRecent corrections:\n{}", self.summary, recent.join("\n"))
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        graph_context: &str,
        existing_nodes: &str,
    ) -> Result<Extraction, AgentError>;
}

#[async_trait]
pub trait Learner: Send + Sync {
    async fn classify(
        &self,
        user_text: &str,
        prior_reply: &str,
        history: &[ChatTurn],
        profile: &PreferenceProfile,
    ) -> Result<CorrectionAssessment, AgentError>;
}

#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reply(
        &self,
        user_text: &str,
        graph_summary: &str,
        history: &[ChatTurn],
        profile: &PreferenceProfile,
    ) -> Result<String, AgentError>;

    /// Answer a question about a single node, in the node's context.
    async fn answer_node(
        &self,
        node: &serde_json::Value,
        question: &str,
    ) -> Result<String, AgentError>;
}

#[async_trait]
pub trait Guardian: Send + Sync {
    async fn review(
        &self,
        proposed_reply: &str,
        user_text: &str,
        history: &[ChatTurn],
    ) -> Result<SafetyVerdict, AgentError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn route(
        &self,
        text: &str,
        targets: &[VoiceProfile],
        history: &[ChatTurn],
    ) -> Result<ProbeRouting, AgentError>;
}

#[async_trait]
pub trait VoiceEnsemble: Send + Sync {
    /// Generate a response per addressed target. A failing target is dropped;
    /// the others still return.
    async fn respond(
        &self,
        addressed: &[VoiceProfile],
        text: &str,
        history: &[ChatTurn],
        graph_state: &str,
        routing: &ProbeRouting,
    ) -> Result<Vec<VoiceReply>, AgentError>;
}

#[async_trait]
pub trait InsightDetector: Send + Sync {
    async fn detect(
        &self,
        case_description: &str,
        candidate: &BreakthroughCandidate,
        history: &[ChatTurn],
        latest_probe: &str,
        latest_responses: &[VoiceReply],
        already_triggered: &[String],
    ) -> Result<Option<DetectedInsight>, AgentError>;
}

/// The full collaborator set injected into the orchestrator.
#[derive(Clone)]
pub struct AgentSuite {
    pub listener: Arc<dyn Listener>,
    pub learner: Arc<dyn Learner>,
    pub reflector: Arc<dyn Reflector>,
    pub guardian: Arc<dyn Guardian>,
    pub analyzer: Arc<dyn Analyzer>,
    pub voices: Arc<dyn VoiceEnsemble>,
    pub insight: Arc<dyn InsightDetector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intensity_weights() {
        assert_eq!(Intensity::Gentle.weight(), 0.2);
        assert_eq!(Intensity::Moderate.weight(), 0.5);
        assert_eq!(Intensity::Firm.weight(), 0.7);
        assert_eq!(Intensity::Intense.weight(), 0.9);
    }

    #[test]
    fn lenient_parses_fall_back_to_none() {
        assert_eq!(Intensity::parse_lenient("FIRM"), Some(Intensity::Firm));
        assert_eq!(Intensity::parse_lenient("blistering"), None);
        assert_eq!(
            Technique::parse_lenient("reframe"),
            Some(Technique::Reframe)
        );
        assert_eq!(Technique::parse_lenient("hypnosis"), None);
    }

    #[test]
    fn profile_absorbs_corrections() {
        let mut profile = PreferenceProfile::default();
        profile.absorb(&CorrectionAssessment {
            correction_type: CorrectionType::Productive,
            new_memory_unlocked: true,
            reflection_note: "naming the kitchen opened a memory".into(),
            updated_profile_note: Some("responds well to sensory detail".into()),
        });
        assert_eq!(profile.corrections.len(), 1);
        assert_eq!(profile.summary, "responds well to sensory detail");

        profile.absorb(&CorrectionAssessment {
            correction_type: CorrectionType::Rejecting,
            new_memory_unlocked: false,
            reflection_note: "too direct".into(),
            updated_profile_note: None,
        });
        assert_eq!(profile.corrections.len(), 2);
        // No note supplied, summary unchanged.
        assert_eq!(profile.summary, "responds well to sensory detail");
    }

    #[test]
    fn profile_render_includes_recent_corrections() {
        let mut profile = PreferenceProfile::default();
        assert_eq!(profile.render(), profile.summary);
        profile.absorb(&CorrectionAssessment {
            correction_type: CorrectionType::Clarifying,
            new_memory_unlocked: false,
            reflection_note: "wanted specifics".into(),
            updated_profile_note: None,
        });
        assert!(profile.render().contains("wanted specifics"));
    }
}
