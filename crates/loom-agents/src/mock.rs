//! Scripted collaborators for deterministic tests without API calls.
//!
//! Each agent call pops the next scripted result for its role; an empty
//! queue yields a benign default. `failing()` makes every call error, for
//! exercising total-collaborator-failure degradation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use loom_core::events::CorrectionType;
use loom_core::model::ChatTurn;

use crate::contracts::{
    AgentSuite, Analyzer, BreakthroughCandidate, CorrectionAssessment, DetectedInsight,
    Extraction, Guardian, InsightDetector, Intensity, Learner, Listener, PreferenceProfile,
    ProbeRouting, Reflector, SafetyVerdict, Technique, VoiceEnsemble, VoiceProfile, VoiceReply,
};
use crate::error::AgentError;

type Scripted<T> = Mutex<VecDeque<Result<T, AgentError>>>;

pub const MOCK_REPLY: &str = "I'm listening. Tell me more about that.";

#[derive(Default)]
pub struct MockAgents {
    fail_all: bool,
    extractions: Scripted<Extraction>,
    classifications: Scripted<CorrectionAssessment>,
    replies: Scripted<String>,
    verdicts: Scripted<SafetyVerdict>,
    routings: Scripted<ProbeRouting>,
    voice_batches: Scripted<Vec<VoiceReply>>,
    detections: Scripted<Option<DetectedInsight>>,
    /// Breakthrough ids the detector was asked to evaluate, in order.
    evaluated_candidates: Mutex<Vec<String>>,
}

impl MockAgents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call fails with a network error.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_all: true,
            ..Self::default()
        })
    }

    pub fn suite(self: &Arc<Self>) -> AgentSuite {
        AgentSuite {
            listener: self.clone(),
            learner: self.clone(),
            reflector: self.clone(),
            guardian: self.clone(),
            analyzer: self.clone(),
            voices: self.clone(),
            insight: self.clone(),
        }
    }

    pub fn push_extraction(&self, result: Result<Extraction, AgentError>) {
        self.extractions.lock().unwrap().push_back(result);
    }

    pub fn push_classification(&self, result: Result<CorrectionAssessment, AgentError>) {
        self.classifications.lock().unwrap().push_back(result);
    }

    pub fn push_reply(&self, result: Result<String, AgentError>) {
        self.replies.lock().unwrap().push_back(result);
    }

    pub fn push_verdict(&self, result: Result<SafetyVerdict, AgentError>) {
        self.verdicts.lock().unwrap().push_back(result);
    }

    pub fn push_routing(&self, result: Result<ProbeRouting, AgentError>) {
        self.routings.lock().unwrap().push_back(result);
    }

    pub fn push_voice_batch(&self, result: Result<Vec<VoiceReply>, AgentError>) {
        self.voice_batches.lock().unwrap().push_back(result);
    }

    pub fn push_detection(&self, result: Result<Option<DetectedInsight>, AgentError>) {
        self.detections.lock().unwrap().push_back(result);
    }

    pub fn evaluated_candidates(&self) -> Vec<String> {
        self.evaluated_candidates.lock().unwrap().clone()
    }

    fn next<T>(&self, queue: &Scripted<T>) -> Option<Result<T, AgentError>> {
        if self.fail_all {
            return Some(Err(AgentError::Network("mock outage".into())));
        }
        queue.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Listener for MockAgents {
    async fn extract(
        &self,
        _text: &str,
        _graph_context: &str,
        _existing_nodes: &str,
    ) -> Result<Extraction, AgentError> {
        self.next(&self.extractions)
            .unwrap_or_else(|| Ok(Extraction::empty()))
    }
}

#[async_trait]
impl Learner for MockAgents {
    async fn classify(
        &self,
        _user_text: &str,
        _prior_reply: &str,
        _history: &[ChatTurn],
        _profile: &PreferenceProfile,
    ) -> Result<CorrectionAssessment, AgentError> {
        self.next(&self.classifications).unwrap_or_else(|| {
            Ok(CorrectionAssessment {
                correction_type: CorrectionType::Agreement,
                new_memory_unlocked: false,
                reflection_note: String::new(),
                updated_profile_note: None,
            })
        })
    }
}

#[async_trait]
impl Reflector for MockAgents {
    async fn reply(
        &self,
        _user_text: &str,
        _graph_summary: &str,
        _history: &[ChatTurn],
        _profile: &PreferenceProfile,
    ) -> Result<String, AgentError> {
        self.next(&self.replies)
            .unwrap_or_else(|| Ok(MOCK_REPLY.to_string()))
    }

    async fn answer_node(
        &self,
        node: &serde_json::Value,
        _question: &str,
    ) -> Result<String, AgentError> {
        if self.fail_all {
            return Err(AgentError::Network("mock outage".into()));
        }
        let label = node["label"].as_str().unwrap_or("that");
        Ok(format!("{label} matters here."))
    }
}

#[async_trait]
impl Guardian for MockAgents {
    async fn review(
        &self,
        _proposed_reply: &str,
        _user_text: &str,
        _history: &[ChatTurn],
    ) -> Result<SafetyVerdict, AgentError> {
        self.next(&self.verdicts)
            .unwrap_or_else(|| Ok(SafetyVerdict::pass()))
    }
}

#[async_trait]
impl Analyzer for MockAgents {
    async fn route(
        &self,
        text: &str,
        targets: &[VoiceProfile],
        _history: &[ChatTurn],
    ) -> Result<ProbeRouting, AgentError> {
        self.next(&self.routings).unwrap_or_else(|| {
            Ok(ProbeRouting {
                addressed_targets: targets.first().map(|t| t.id.clone()).into_iter().collect(),
                technique: Technique::OpenExploration,
                intensity: Intensity::Moderate,
                summary: text.chars().take(100).collect(),
            })
        })
    }
}

#[async_trait]
impl VoiceEnsemble for MockAgents {
    async fn respond(
        &self,
        addressed: &[VoiceProfile],
        _text: &str,
        _history: &[ChatTurn],
        _graph_state: &str,
        _routing: &ProbeRouting,
    ) -> Result<Vec<VoiceReply>, AgentError> {
        self.next(&self.voice_batches).unwrap_or_else(|| {
            Ok(addressed
                .iter()
                .map(|profile| VoiceReply {
                    target: profile.id.clone(),
                    name: profile.name.clone(),
                    content: format!("{} speaking.", profile.name),
                    color: profile.color.clone(),
                })
                .collect())
        })
    }
}

#[async_trait]
impl InsightDetector for MockAgents {
    async fn detect(
        &self,
        _case_description: &str,
        candidate: &BreakthroughCandidate,
        _history: &[ChatTurn],
        _latest_probe: &str,
        _latest_responses: &[VoiceReply],
        _already_triggered: &[String],
    ) -> Result<Option<DetectedInsight>, AgentError> {
        self.evaluated_candidates
            .lock()
            .unwrap()
            .push(candidate.id.clone());
        self.next(&self.detections).unwrap_or(Ok(None))
    }
}
