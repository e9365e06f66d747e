//! Anthropic-backed collaborator implementations.
//!
//! Every call is a non-streaming messages request with a 30s timeout and
//! bounded retry on retryable failures. Structured outputs are forced
//! through a single tool definition per call and re-validated at the trust
//! boundary before anything reaches the graph.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::warn;

use loom_core::events::CorrectionType;
use loom_core::model::{ChatRole, ChatTurn};

use crate::contracts::{
    Analyzer, BreakthroughCandidate, CorrectionAssessment, DetectedInsight, Extraction, Guardian,
    InsightDetector, Intensity, Learner, Listener, PreferenceProfile, ProbeRouting, Reflector,
    SafetyVerdict, Technique, VoiceEnsemble, VoiceProfile, VoiceReply,
};
use crate::error::AgentError;
use crate::retry::{with_retry, RetryPolicy};
use crate::validate::{validate_extraction, RawExtraction};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Per-collaborator call budget. On expiry the pipeline falls back; it never
/// waits longer than this for any one agent.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const LISTENER_SYSTEM: &str = "You listen to what someone shares and extract the \
entities it mentions: memories, people, values, emotions, rituals, places, artifacts. \
Reuse an existing node id when an entity matches one and set is_update; only mint new \
ids for genuinely new entities.";

const LEARNER_SYSTEM: &str = "You classify how someone responded to the previous \
reflection: did it land (productive), need sharpening (clarifying), miss (rejecting), \
or simply agree? Update the preference profile note when you learn something durable.";

const REFLECTOR_SYSTEM: &str = "You reflect back patterns you notice in what someone \
shares, grounded in the graph of what they have told you so far. Two or three \
sentences, warm and specific. Follow the preference profile.";

const GUARDIAN_SYSTEM: &str = "You review a proposed reply for safety and pacing \
before it is delivered. Flag a crisis when the user's message suggests acute risk. \
If the reply needs changes, supply a corrected version.";

const ANALYZER_SYSTEM: &str = "You decide which internal voices a message addresses, \
what technique it uses, and how much pressure it applies.";

const INSIGHT_SYSTEM: &str = "You judge whether the latest exchange satisfies a \
specific breakthrough's detection criteria. Be rigorous; vague acknowledgment is \
not enough.";

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: CALL_TIMEOUT,
        }
    }
}

pub struct AnthropicAgents {
    http: reqwest::Client,
    config: AnthropicConfig,
    retry: RetryPolicy,
}

impl AnthropicAgents {
    pub fn new(config: AnthropicConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::Network(e.to_string()))?;
        Ok(Self {
            http,
            config,
            retry: RetryPolicy::default(),
        })
    }

    async fn request(&self, body: &Value) -> Result<Value, AgentError> {
        let response = self
            .http
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::from_status(status, body));
        }
        Ok(response.json().await?)
    }

    /// Force a structured result through a single tool and return its input.
    async fn call_tool(
        &self,
        label: &str,
        system: &str,
        messages: Value,
        tool_name: &str,
        tool: Value,
        max_tokens: u32,
    ) -> Result<Value, AgentError> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
            "tools": [tool],
            "tool_choice": {"type": "tool", "name": tool_name},
        });
        let response = with_retry(&self.retry, label, || self.request(&body)).await?;

        response["content"]
            .as_array()
            .and_then(|blocks| {
                blocks.iter().find(|b| {
                    b["type"] == "tool_use" && b["name"].as_str() == Some(tool_name)
                })
            })
            .map(|block| block["input"].clone())
            .ok_or_else(|| AgentError::Malformed(format!("no {tool_name} tool_use block")))
    }

    async fn call_text(
        &self,
        label: &str,
        system: &str,
        messages: Value,
        max_tokens: u32,
    ) -> Result<String, AgentError> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
        });
        let response = with_retry(&self.retry, label, || self.request(&body)).await?;

        response["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
            .and_then(|block| block["text"].as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentError::Malformed("no text block in response".into()))
    }
}

fn single_user_message(content: String) -> Value {
    json!([{"role": "user", "content": content}])
}

/// Render recent history as alternating API messages, ending with the
/// latest user text. Voice names are folded into the content.
fn history_messages(history: &[ChatTurn], latest_user: &str, max_turns: usize) -> Value {
    let mut messages = Vec::new();
    let start = history.len().saturating_sub(max_turns);
    for turn in &history[start..] {
        let role = match turn.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        let content = match &turn.speaker {
            Some(speaker) => format!("[{speaker}]: {}", turn.content),
            None => turn.content.clone(),
        };
        messages.push(json!({"role": role, "content": content}));
    }
    messages.push(json!({"role": "user", "content": latest_user}));
    Value::Array(messages)
}

/// Plain-text transcript excerpt for prompts that embed history in content.
fn history_excerpt(history: &[ChatTurn], max_turns: usize) -> String {
    if history.is_empty() {
        return "This is the beginning of the session.".to_string();
    }
    let start = history.len().saturating_sub(max_turns);
    history[start..]
        .iter()
        .map(|turn| match (&turn.role, &turn.speaker) {
            (ChatRole::User, _) => format!("User: {}", turn.content),
            (ChatRole::Assistant, Some(speaker)) => format!("[{speaker}]: {}", turn.content),
            (ChatRole::Assistant, None) => format!("Assistant: {}", turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Listener for AnthropicAgents {
    async fn extract(
        &self,
        text: &str,
        graph_context: &str,
        existing_nodes: &str,
    ) -> Result<Extraction, AgentError> {
        let tool = json!({
            "name": "extract_entities",
            "description": "Extract entities and relationships from the user's message.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "entities": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "label": {"type": "string"},
                                "type": {"type": "string", "enum": ["memory", "person", "value", "emotion", "ritual", "place", "artifact"]},
                                "description": {"type": "string"},
                                "importance": {"type": "integer", "minimum": 1, "maximum": 10},
                                "is_update": {"type": "boolean"}
                            },
                            "required": ["id", "label", "type", "description", "importance"]
                        }
                    },
                    "relationships": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "source": {"type": "string"},
                                "target": {"type": "string"},
                                "type": {"type": "string", "enum": ["felt_during", "connected_to", "reminds_of", "valued_by", "associated_with", "evolved_from", "contradicts"]},
                                "label": {"type": "string"}
                            },
                            "required": ["source", "target", "type"]
                        }
                    }
                },
                "required": ["entities", "relationships"]
            }
        });

        let content = format!(
            "Current graph context:\n{graph_context}\n\nExisting graph nodes (reuse these \
             ids if the entity matches, set is_update):\n{existing_nodes}\n\nUser message:\n{text}"
        );
        let input = self
            .call_tool(
                "listener",
                LISTENER_SYSTEM,
                single_user_message(content),
                "extract_entities",
                tool,
                2000,
            )
            .await?;

        let raw: RawExtraction = serde_json::from_value(input)
            .map_err(|e| AgentError::Malformed(format!("extraction shape: {e}")))?;
        Ok(validate_extraction(raw))
    }
}

#[async_trait]
impl Learner for AnthropicAgents {
    async fn classify(
        &self,
        user_text: &str,
        prior_reply: &str,
        history: &[ChatTurn],
        profile: &PreferenceProfile,
    ) -> Result<CorrectionAssessment, AgentError> {
        let tool = json!({
            "name": "classify_correction",
            "description": "Classify a user's response to a reflection.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "correction_type": {"type": "string", "enum": ["productive", "clarifying", "rejecting", "agreement"]},
                    "new_memory_unlocked": {"type": "boolean"},
                    "reflection_note": {"type": "string"},
                    "updated_profile_note": {"type": "string"}
                },
                "required": ["correction_type", "new_memory_unlocked", "reflection_note"]
            }
        });

        let system = format!("{LEARNER_SYSTEM}\n\nCurrent profile:\n{}", profile.render());
        let content = format!(
            "Recent conversation:\n{}\n\nPrevious reflection: {prior_reply}\n\nUser's \
             response: {user_text}\n\nClassify this response.",
            history_excerpt(history, 10)
        );
        let input = self
            .call_tool(
                "learner",
                &system,
                single_user_message(content),
                "classify_correction",
                tool,
                1000,
            )
            .await?;

        let correction_type = input["correction_type"]
            .as_str()
            .and_then(CorrectionType::parse_lenient)
            .unwrap_or(CorrectionType::Agreement);

        Ok(CorrectionAssessment {
            correction_type,
            new_memory_unlocked: input["new_memory_unlocked"].as_bool().unwrap_or(false),
            reflection_note: input["reflection_note"].as_str().unwrap_or_default().to_string(),
            updated_profile_note: input["updated_profile_note"]
                .as_str()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl Reflector for AnthropicAgents {
    async fn reply(
        &self,
        user_text: &str,
        graph_summary: &str,
        history: &[ChatTurn],
        profile: &PreferenceProfile,
    ) -> Result<String, AgentError> {
        let system = format!(
            "{REFLECTOR_SYSTEM}\n\nPreference profile:\n{}\n\nGraph state:\n{graph_summary}",
            profile.render()
        );
        self.call_text(
            "reflector",
            &system,
            history_messages(history, user_text, 12),
            500,
        )
        .await
    }

    async fn answer_node(
        &self,
        node: &serde_json::Value,
        question: &str,
    ) -> Result<String, AgentError> {
        let content = format!(
            "This is a node from a session knowledge graph:\n{}\n\nQuestion: \
             {question}\n\nAnswer in the node's context. Be concise.",
            serde_json::to_string_pretty(node).unwrap_or_default()
        );
        self.call_text(
            "reflector",
            "You answer questions about a single node in a session graph.",
            single_user_message(content),
            300,
        )
        .await
    }
}

#[async_trait]
impl Guardian for AnthropicAgents {
    async fn review(
        &self,
        proposed_reply: &str,
        user_text: &str,
        history: &[ChatTurn],
    ) -> Result<SafetyVerdict, AgentError> {
        let tool = json!({
            "name": "evaluate_response",
            "description": "Evaluate a response for safety and appropriateness.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "approved": {"type": "boolean"},
                    "reason": {"type": "string"},
                    "crisis_detected": {"type": "boolean"},
                    "modified_response": {"type": "string"}
                },
                "required": ["approved", "reason", "crisis_detected"]
            }
        });

        let content = format!(
            "Recent conversation:\n{}\n\nUser said: {user_text}\n\nProposed response: \
             {proposed_reply}\n\nEvaluate this response.",
            history_excerpt(history, 8)
        );
        let input = self
            .call_tool(
                "guardian",
                GUARDIAN_SYSTEM,
                single_user_message(content),
                "evaluate_response",
                tool,
                1000,
            )
            .await?;

        Ok(SafetyVerdict {
            approved: input["approved"].as_bool().unwrap_or(true),
            crisis_detected: input["crisis_detected"].as_bool().unwrap_or(false),
            reason: input["reason"].as_str().unwrap_or_default().to_string(),
            modified_reply: input["modified_response"]
                .as_str()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl Analyzer for AnthropicAgents {
    async fn route(
        &self,
        text: &str,
        targets: &[VoiceProfile],
        history: &[ChatTurn],
    ) -> Result<ProbeRouting, AgentError> {
        let target_ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        let tool = json!({
            "name": "analyze_probe",
            "description": "Determine which voices should respond to the message.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "addressed_targets": {"type": "array", "items": {"type": "string"}},
                    "technique": {"type": "string", "enum": ["direct_question", "confrontation", "reflection", "reframe", "open_exploration", "interpretation", "empathic_validation"]},
                    "intensity": {"type": "string", "enum": ["gentle", "moderate", "firm", "intense"]},
                    "summary": {"type": "string"}
                },
                "required": ["addressed_targets", "technique", "intensity", "summary"]
            }
        });

        let system = format!("{ANALYZER_SYSTEM}\nKnown voices: {}", target_ids.join(", "));
        let content = format!(
            "Recent conversation:\n{}\n\nLatest message:\n{text}\n\nAnalyze which voices \
             should respond.",
            history_excerpt(history, 10)
        );
        let input = self
            .call_tool(
                "analyzer",
                &system,
                single_user_message(content),
                "analyze_probe",
                tool,
                500,
            )
            .await?;

        let addressed: Vec<String> = input["addressed_targets"]
            .as_array()
            .map(|targets_json| {
                targets_json
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter(|id| target_ids.contains(id))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ProbeRouting {
            addressed_targets: addressed,
            technique: input["technique"]
                .as_str()
                .and_then(Technique::parse_lenient)
                .unwrap_or_default(),
            intensity: input["intensity"]
                .as_str()
                .and_then(Intensity::parse_lenient)
                .unwrap_or_default(),
            summary: input["summary"].as_str().unwrap_or_default().to_string(),
        })
    }
}

#[async_trait]
impl VoiceEnsemble for AnthropicAgents {
    async fn respond(
        &self,
        addressed: &[VoiceProfile],
        text: &str,
        history: &[ChatTurn],
        graph_state: &str,
        routing: &ProbeRouting,
    ) -> Result<Vec<VoiceReply>, AgentError> {
        let calls = addressed.iter().map(|profile| async move {
            let system = format!(
                "You are {name}, one voice inside a larger system. Stay in character.\n\n\
                 {persona}\n\nWhat you know going in: {opening}\n\nYour defenses: {defenses}\n\n\
                 Your vulnerability: {vulnerability}\n\nSession so far:\n{history}\n\n\
                 Graph state:\n{graph}",
                name = profile.name,
                persona = profile.persona,
                opening = profile.opening_knowledge,
                defenses = profile.defenses.join("; "),
                vulnerability = profile.vulnerability,
                history = history_excerpt(history, 12),
                graph = graph_state,
            );
            let content = format!(
                "[The message uses {technique} at {intensity} intensity]\n\n{text}\n\n\
                 Respond as {name}. Stay in character. 2-4 sentences.",
                technique = routing.technique.as_str(),
                intensity = routing.intensity.as_str(),
                name = profile.name,
            );
            let result = self
                .call_text(&profile.id, &system, single_user_message(content), 300)
                .await;
            (profile, result)
        });

        let mut replies = Vec::new();
        for (profile, result) in join_all(calls).await {
            match result {
                Ok(content) => replies.push(VoiceReply {
                    target: profile.id.clone(),
                    name: profile.name.clone(),
                    content,
                    color: profile.color.clone(),
                }),
                Err(e) => {
                    warn!(target = %profile.id, error = %e, "voice generation failed, dropping target");
                }
            }
        }
        Ok(replies)
    }
}

#[async_trait]
impl InsightDetector for AnthropicAgents {
    async fn detect(
        &self,
        case_description: &str,
        candidate: &BreakthroughCandidate,
        history: &[ChatTurn],
        latest_probe: &str,
        latest_responses: &[VoiceReply],
        already_triggered: &[String],
    ) -> Result<Option<DetectedInsight>, AgentError> {
        let tool = json!({
            "name": "evaluate_breakthrough",
            "description": "Evaluate whether the latest exchange triggers the breakthrough.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "triggered": {"type": "boolean"},
                    "reasoning": {"type": "string"},
                    "insight_summary": {"type": "string"}
                },
                "required": ["triggered", "reasoning"]
            }
        });

        let responses_text = latest_responses
            .iter()
            .map(|r| format!("[{}]: {}", r.name, r.content))
            .collect::<Vec<_>>()
            .join("\n");
        let triggered_text = if already_triggered.is_empty() {
            "None".to_string()
        } else {
            already_triggered.join(", ")
        };

        let system = format!(
            "{INSIGHT_SYSTEM}\n\nCase:\n{case_description}\n\nAlready triggered: {triggered_text}"
        );
        let content = format!(
            "Conversation:\n{}\n\nLatest message:\n{latest_probe}\n\nLatest responses:\n\
             {responses_text}\n\nEvaluate whether the latest exchange triggers this \
             breakthrough:\n\n**{}**: {}\n\nDetection criteria:\n{}",
            history_excerpt(history, 16),
            candidate.name,
            candidate.description,
            candidate.detection_prompt,
        );
        let input = self
            .call_tool(
                "insight",
                &system,
                single_user_message(content),
                "evaluate_breakthrough",
                tool,
                500,
            )
            .await?;

        if input["triggered"].as_bool().unwrap_or(false) {
            Ok(Some(DetectedInsight {
                insight_summary: input["insight_summary"]
                    .as_str()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or(candidate.description.as_str())
                    .to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_messages_folds_speakers_into_content() {
        let history = vec![
            ChatTurn::user("hello"),
            ChatTurn::assistant(Some("Approval Drive".into()), "hi there"),
        ];
        let messages = history_messages(&history, "next", 12);
        let arr = messages.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[1]["role"], "assistant");
        assert_eq!(arr[1]["content"], "[Approval Drive]: hi there");
        assert_eq!(arr[2]["content"], "next");
    }

    #[test]
    fn history_messages_truncates_to_recent_turns() {
        let history: Vec<ChatTurn> = (0..20).map(|i| ChatTurn::user(format!("m{i}"))).collect();
        let messages = history_messages(&history, "latest", 4);
        let arr = messages.as_array().unwrap();
        assert_eq!(arr.len(), 5);
        assert_eq!(arr[0]["content"], "m16");
    }

    #[test]
    fn history_excerpt_handles_empty() {
        assert!(history_excerpt(&[], 10).contains("beginning"));
        let history = vec![ChatTurn::assistant(None, "a reply")];
        assert_eq!(history_excerpt(&history, 10), "Assistant: a reply");
    }
}
