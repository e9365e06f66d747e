//! The per-message orchestration pipeline.
//!
//! Fixed stage order per message: parallel extraction + correction
//! classification, a guaranteed fallback node, graph apply + update emit,
//! reply generation, the safety gate, then (scenario mode) breakthrough
//! detection and derived signals. Every collaborator call is bounded by a
//! timeout and degrades to a documented fallback; a submitted message always
//! yields a reply and at least one graph node, even under total collaborator
//! failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use loom_agents::contracts::{
    AgentSuite, CorrectionAssessment, ExtractedEntity, Extraction, Intensity, ProbeRouting,
    SafetyVerdict, Technique, VoiceProfile, VoiceReply,
};
use loom_agents::error::AgentError;
use loom_core::events::SessionEvent;
use loom_core::model::{ChatTurn, Node, NodeKind, Visibility};

use crate::background::{spawn_supervised, Indexer};
use crate::emit::Emitter;
use crate::scenario::Scenario;
use crate::session::Session;
use crate::signals::{vector_signals, warmth_level};

/// Per-collaborator call budget.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed crisis-resource text. Always prepended to the delivered reply when
/// the gate detects a crisis, regardless of approval.
pub const CRISIS_RESOURCES: &str = "If you are in crisis or thinking about harming \
yourself, please reach out right now: call or text 988 (Suicide & Crisis Lifeline), \
or text HOME to 741741. You don't have to carry this alone.";

/// Generic reply used when generation fails outright.
pub const FALLBACK_REPLY: &str = "I'm here with you. I lost my words for a moment, \
but I'm still listening. Could you tell me a little more?";

const SYSTEM_COLOR: &str = "#A09A92";

/// What one processed message produced.
#[derive(Clone, Debug, Default)]
pub struct TurnReport {
    pub delivered: Vec<String>,
    pub breakthrough: Option<String>,
}

pub struct Orchestrator {
    agents: AgentSuite,
    indexer: Option<Arc<dyn Indexer>>,
}

impl Orchestrator {
    pub fn new(agents: AgentSuite) -> Self {
        Self {
            agents,
            indexer: None,
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// Run the full pipeline for one user message. Serialized per session;
    /// concurrent calls for the same session queue on its run lock.
    pub async fn process_message(
        &self,
        session: &Arc<Session>,
        text: &str,
        emit: &Emitter,
    ) -> TurnReport {
        let _run = session.run_guard().await;

        let turn_before = {
            let mut graph = session.graph.lock();
            let turn = graph.turn();
            graph.advance_turn();
            turn
        };
        session.conversation.lock().push(ChatTurn::user(text));

        // Stage A: extraction and correction classification fan out together.
        // They read session-local state and write disjoint result slots.
        let prior_reply = session.last_reply.lock().clone();
        let (mut extraction, assessment) = tokio::join!(
            self.run_listener(session, text, emit),
            self.run_learner(session, text, prior_reply.as_deref(), emit),
        );

        // Stage A.1: guarantee at least one node per processed message.
        if extraction.entities.is_empty() {
            extraction.entities.push(fallback_entity(text));
        }

        // Stage B: apply to the graph, then report the snapshot plus exactly
        // what changed since before this message.
        let (snapshot, node_changes, affected_node_ids) = {
            let mut graph = session.graph.lock();
            let mut affected = Vec::new();
            for entity in &extraction.entities {
                let (node, _) = graph.upsert_node(entity.node.clone(), entity.is_update);
                affected.push(node.id);
            }
            for edge in &extraction.relationships {
                graph.upsert_edge(edge.clone());
            }
            (graph.snapshot(), graph.changes_since(turn_before), affected)
        };
        emit.unicast(SessionEvent::GraphUpdate {
            graph_data: snapshot,
            node_changes: node_changes.clone(),
        })
        .await;

        if let Some(assessment) = &assessment {
            session.profile.lock().absorb(assessment);
            emit.unicast(SessionEvent::CorrectionDetected {
                correction_type: assessment.correction_type,
                before_claim: excerpt(prior_reply.as_deref().unwrap_or_default(), 140),
                after_insight: assessment.reflection_note.clone(),
                affected_node_ids,
                field_changes: node_changes,
            })
            .await;
        }

        // Stages C through F depend on the mode.
        let scenario = session.scenario.clone();
        let report = match scenario {
            None => self.companion_turn(session, text, emit).await,
            Some(scenario) => self.scenario_turn(session, &scenario, text, emit).await,
        };

        // Detached ingestion off the critical path, supervised.
        if let Some(indexer) = &self.indexer {
            let indexer = Arc::clone(indexer);
            let session_id = session.id.clone();
            let text = text.to_string();
            let snapshot = session.snapshot();
            spawn_supervised("index_ingest", async move {
                indexer.ingest(&session_id, &text, &snapshot).await
            });
        }

        report
    }

    // ---- Stage A collaborators ----

    async fn run_listener(&self, session: &Session, text: &str, emit: &Emitter) -> Extraction {
        emit.unicast(SessionEvent::status_running("listener")).await;
        let started = Instant::now();

        let (graph_context, existing_nodes) = {
            let graph = session.graph.lock();
            (graph.render_for_prompt(), graph.existing_nodes_summary())
        };
        let result = bounded(self.agents.listener.extract(text, &graph_context, &existing_nodes)).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Ok(extraction) => {
                let summary = format!(
                    "{} entities, {} relationships",
                    extraction.entities.len(),
                    extraction.relationships.len()
                );
                emit.unicast(SessionEvent::status_done("listener", summary, elapsed)).await;
                extraction
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "extraction failed, using empty fallback");
                emit.unicast(SessionEvent::status_done(
                    "listener",
                    format!("failed: {}", e.kind()),
                    elapsed,
                ))
                .await;
                Extraction::empty()
            }
        }
    }

    async fn run_learner(
        &self,
        session: &Session,
        text: &str,
        prior_reply: Option<&str>,
        emit: &Emitter,
    ) -> Option<CorrectionAssessment> {
        // Nothing to classify against before the first reply.
        let prior_reply = prior_reply?;

        emit.unicast(SessionEvent::status_running("learner")).await;
        let started = Instant::now();

        let history = session.conversation_snapshot();
        let profile = session.profile.lock().clone();
        let result = bounded(
            self.agents
                .learner
                .classify(text, prior_reply, &history, &profile),
        )
        .await;
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Ok(assessment) => {
                emit.unicast(SessionEvent::status_done(
                    "learner",
                    format!("{:?}", assessment.correction_type).to_lowercase(),
                    elapsed,
                ))
                .await;
                Some(assessment)
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "correction classification failed");
                emit.unicast(SessionEvent::status_done(
                    "learner",
                    format!("failed: {}", e.kind()),
                    elapsed,
                ))
                .await;
                None
            }
        }
    }

    // ---- Companion mode: stages C and D ----

    async fn companion_turn(&self, session: &Arc<Session>, text: &str, emit: &Emitter) -> TurnReport {
        // Stage C: sequential, depends on the updated graph.
        emit.unicast(SessionEvent::status_running("reflector")).await;
        let started = Instant::now();

        let graph_summary = session.graph.lock().render_for_prompt();
        let history = session.conversation_snapshot();
        let profile = session.profile.lock().clone();
        let reply = match bounded(self.agents.reflector.reply(text, &graph_summary, &history, &profile)).await
        {
            Ok(reply) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let words = reply.split_whitespace().count();
                emit.unicast(SessionEvent::status_done("reflector", format!("{words} words"), elapsed))
                    .await;
                reply
            }
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as u64;
                warn!(session_id = %session.id, error = %e, "reply generation failed, using fallback");
                emit.unicast(SessionEvent::status_done(
                    "reflector",
                    format!("failed: {}", e.kind()),
                    elapsed,
                ))
                .await;
                FALLBACK_REPLY.to_string()
            }
        };

        // Stage D: the gate's verdict always decides the delivered text.
        let verdict = self.run_guardian(session, &reply, text, &history, emit).await;
        let delivered = resolve_reply(reply, &verdict);

        emit.unicast(SessionEvent::PartResponse {
            part: "companion".into(),
            name: "Companion".into(),
            content: delivered.clone(),
            color: SYSTEM_COLOR.into(),
        })
        .await;

        session
            .conversation
            .lock()
            .push(ChatTurn::assistant(None, delivered.clone()));
        *session.last_reply.lock() = Some(delivered.clone());

        TurnReport {
            delivered: vec![delivered],
            breakthrough: None,
        }
    }

    async fn run_guardian(
        &self,
        session: &Session,
        proposed: &str,
        text: &str,
        history: &[ChatTurn],
        emit: &Emitter,
    ) -> SafetyVerdict {
        emit.unicast(SessionEvent::status_running("guardian")).await;
        let started = Instant::now();
        let result = bounded(self.agents.guardian.review(proposed, text, history)).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Ok(verdict) => {
                let summary = if verdict.crisis_detected {
                    "crisis resources attached"
                } else if !verdict.approved {
                    "revised"
                } else {
                    "approved"
                };
                emit.unicast(SessionEvent::status_done("guardian", summary, elapsed)).await;
                verdict
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "safety gate failed, defaulting to approval");
                emit.unicast(SessionEvent::status_done(
                    "guardian",
                    format!("failed: {}", e.kind()),
                    elapsed,
                ))
                .await;
                SafetyVerdict::pass()
            }
        }
    }

    // ---- Scenario mode: stages C through F ----

    async fn scenario_turn(
        &self,
        session: &Arc<Session>,
        scenario: &Arc<Scenario>,
        text: &str,
        emit: &Emitter,
    ) -> TurnReport {
        let history = session.conversation_snapshot();

        // Route the message to the voices it addresses.
        emit.unicast(SessionEvent::status_running("analyzer")).await;
        let started = Instant::now();
        let routing = match bounded(self.agents.analyzer.route(text, &scenario.targets, &history)).await {
            Ok(routing) if !routing.addressed_targets.is_empty() => routing,
            Ok(_) | Err(_) => fallback_routing(scenario, text),
        };
        let elapsed = started.elapsed().as_millis() as u64;
        emit.unicast(SessionEvent::status_done(
            "analyzer",
            format!(
                "Addressing: {} ({})",
                routing.addressed_targets.join(", "),
                routing.technique.as_str()
            ),
            elapsed,
        ))
        .await;

        // Generate in-character responses for the addressed voices.
        let triggered = session.triggered_snapshot();
        let addressed: Vec<VoiceProfile> = routing
            .addressed_targets
            .iter()
            .filter_map(|id| scenario.adjusted_profile(id, &triggered))
            .collect();
        for profile in &addressed {
            emit.unicast(SessionEvent::status_running(profile.id.clone())).await;
        }

        let started = Instant::now();
        let graph_state = session.graph.lock().render_for_prompt();
        let replies = match bounded(
            self.agents
                .voices
                .respond(&addressed, text, &history, &graph_state, &routing),
        )
        .await
        {
            Ok(replies) => replies,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "voice generation failed");
                Vec::new()
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;

        for reply in &replies {
            let words = reply.content.split_whitespace().count();
            emit.unicast(SessionEvent::status_done(
                reply.target.clone(),
                format!("{words} words"),
                elapsed,
            ))
            .await;
        }
        for profile in &addressed {
            if !replies.iter().any(|r| r.target == profile.id) {
                emit.unicast(SessionEvent::status_done(profile.id.clone(), "No response", elapsed))
                    .await;
            }
        }

        // Stage D over the batch: gate the joined text, then resolve.
        let replies = if replies.is_empty() {
            vec![system_voice(FALLBACK_REPLY.to_string())]
        } else {
            replies
        };
        let joined = replies
            .iter()
            .map(|r| format!("[{}]: {}", r.name, r.content))
            .collect::<Vec<_>>()
            .join("\n");
        let verdict = self.run_guardian(session, &joined, text, &history, emit).await;
        let delivered = resolve_voice_batch(replies, &verdict);

        let mut delivered_texts = Vec::new();
        for reply in &delivered {
            emit.unicast(SessionEvent::PartResponse {
                part: reply.target.clone(),
                name: reply.name.clone(),
                content: reply.content.clone(),
                color: reply.color.clone(),
            })
            .await;
            session
                .conversation
                .lock()
                .push(ChatTurn::assistant(Some(reply.name.clone()), reply.content.clone()));
            delivered_texts.push(reply.content.clone());
        }
        *session.last_reply.lock() = Some(delivered_texts.join("\n"));

        // Stage F: evaluate only the first pending breakthrough.
        let breakthrough = self
            .detect_breakthrough(session, scenario, text, &delivered, emit)
            .await;

        // Stage E: derived signals, computed after detection because they
        // depend on whether a breakthrough fired this turn.
        let triggered_count = session.triggered.lock().len();
        emit.unicast(SessionEvent::VectorSnapshot {
            vectors: vector_signals(routing.intensity, triggered_count, breakthrough.is_some()),
        })
        .await;
        let next_breakthrough_id = {
            let triggered = session.triggered.lock();
            scenario.next_pending(&triggered).map(|d| d.candidate.id.clone())
        };
        emit.unicast(SessionEvent::WarmthSignal {
            warmth: warmth_level(routing.intensity, triggered_count),
            next_breakthrough_id,
        })
        .await;

        TurnReport {
            delivered: delivered_texts,
            breakthrough,
        }
    }

    async fn detect_breakthrough(
        &self,
        session: &Arc<Session>,
        scenario: &Arc<Scenario>,
        text: &str,
        latest_responses: &[VoiceReply],
        emit: &Emitter,
    ) -> Option<String> {
        emit.unicast(SessionEvent::status_running("insight")).await;
        let started = Instant::now();

        let triggered = session.triggered_snapshot();
        let Some(pending) = scenario.next_pending(&triggered) else {
            let elapsed = started.elapsed().as_millis() as u64;
            emit.unicast(SessionEvent::status_done("insight", "All breakthroughs reached", elapsed))
                .await;
            return None;
        };

        let history = session.conversation_snapshot();
        let result = bounded(self.agents.insight.detect(
            &scenario.case_description,
            &pending.candidate,
            &history,
            text,
            latest_responses,
            &triggered,
        ))
        .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let insight = match result {
            Ok(Some(insight)) => insight,
            Ok(None) => {
                emit.unicast(SessionEvent::status_done("insight", "No breakthrough yet", elapsed))
                    .await;
                return None;
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "breakthrough detection failed");
                emit.unicast(SessionEvent::status_done(
                    "insight",
                    format!("failed: {}", e.kind()),
                    elapsed,
                ))
                .await;
                return None;
            }
        };

        let id = pending.candidate.id.clone();
        // Once appended the id is never evaluated again; a duplicate append
        // would re-fire the rewrite, so guard it.
        {
            let mut triggered = session.triggered.lock();
            if triggered.iter().any(|existing| existing == &id) {
                return None;
            }
            triggered.push(id.clone());
        }

        let (graph_diff, full_snapshot) = {
            let mut graph = session.graph.lock();
            let diff = graph.apply_rewrite(&pending.rewrite);
            (diff, graph.snapshot())
        };

        info!(session_id = %session.id, breakthrough = %id, "breakthrough triggered");
        emit.unicast(SessionEvent::status_done(
            "insight",
            format!("Breakthrough: {}", pending.candidate.name),
            elapsed,
        ))
        .await;

        // A breakthrough changes shared session meaning: every observer of
        // the session gets the full diff and snapshot.
        emit.multicast(SessionEvent::Breakthrough {
            breakthrough_id: id.clone(),
            name: pending.candidate.name.clone(),
            insight_summary: insight.insight_summary,
            graph_diff,
            full_snapshot,
        })
        .await;

        Some(id)
    }
}

/// Bound a collaborator call by the per-agent timeout.
async fn bounded<T>(
    fut: impl std::future::Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    match tokio::time::timeout(AGENT_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout(AGENT_TIMEOUT)),
    }
}

/// Deterministic node synthesized when extraction yields nothing: id from
/// the message text, label from its 30-char prefix.
fn fallback_entity(text: &str) -> ExtractedEntity {
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    ExtractedEntity {
        node: Node {
            id: format!("memory_{hex}"),
            label: excerpt(text, 30),
            kind: NodeKind::Memory,
            description: String::new(),
            importance: 5,
            size: 5,
            visibility: Visibility::Bright,
            color: Some(NodeKind::Memory.default_color().to_string()),
        },
        is_update: false,
    }
}

fn fallback_routing(scenario: &Scenario, text: &str) -> ProbeRouting {
    ProbeRouting {
        addressed_targets: scenario.targets.first().map(|t| t.id.clone()).into_iter().collect(),
        technique: Technique::OpenExploration,
        intensity: Intensity::Moderate,
        summary: excerpt(text, 100),
    }
}

fn system_voice(content: String) -> VoiceReply {
    VoiceReply {
        target: "system".into(),
        name: "System".into(),
        content,
        color: SYSTEM_COLOR.into(),
    }
}

/// Resolve the gate verdict for a single reply. Crisis always prepends the
/// fixed resource text, independent of approval.
fn resolve_reply(original: String, verdict: &SafetyVerdict) -> String {
    if verdict.crisis_detected {
        let base = verdict.modified_reply.clone().unwrap_or(original);
        format!("{CRISIS_RESOURCES}\n\n{base}")
    } else if !verdict.approved {
        verdict.modified_reply.clone().unwrap_or(original)
    } else {
        original
    }
}

/// Resolve the gate verdict for a voice batch. An intervening verdict with a
/// modified reply collapses the batch to a single system response; a crisis
/// additionally leads with the resource text.
fn resolve_voice_batch(replies: Vec<VoiceReply>, verdict: &SafetyVerdict) -> Vec<VoiceReply> {
    let mut out = if verdict.crisis_detected || !verdict.approved {
        match &verdict.modified_reply {
            Some(modified) => vec![system_voice(modified.clone())],
            None => replies,
        }
    } else {
        replies
    };
    if verdict.crisis_detected {
        out.insert(0, system_voice(CRISIS_RESOURCES.to_string()));
    }
    out
}

fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_agents::contracts::DetectedInsight;
    use loom_agents::mock::MockAgents;
    use loom_core::events::CorrectionType;
    use loom_core::ids::SessionId;
    use loom_core::model::{Edge, RelationKind};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::emit::ChannelSink;
    use crate::scenario::ScenarioSet;
    use crate::session::SessionRegistry;

    struct Harness {
        orchestrator: Orchestrator,
        session: Arc<Session>,
        emitter: Emitter,
        unicast_rx: UnboundedReceiver<SessionEvent>,
        multicast_rx: UnboundedReceiver<SessionEvent>,
        mock: Arc<MockAgents>,
    }

    fn harness(scenario: Option<&str>) -> Harness {
        harness_with(MockAgents::new(), scenario)
    }

    fn harness_with(mock: Arc<MockAgents>, scenario: Option<&str>) -> Harness {
        let registry = SessionRegistry::new(ScenarioSet::builtin(), None);
        let session = registry.get_or_create(&SessionId::new(), scenario);
        let (unicast, unicast_rx) = ChannelSink::new();
        let (multicast, multicast_rx) = ChannelSink::new();
        Harness {
            orchestrator: Orchestrator::new(mock.suite()),
            session,
            emitter: Emitter::new(unicast, multicast),
            unicast_rx,
            multicast_rx,
            mock,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn entity(id: &str, label: &str, kind: NodeKind, is_update: bool) -> ExtractedEntity {
        ExtractedEntity {
            node: Node {
                id: id.into(),
                label: label.into(),
                kind,
                description: String::new(),
                importance: 5,
                size: 5,
                visibility: Visibility::Bright,
                color: None,
            },
            is_update,
        }
    }

    #[tokio::test]
    async fn turn_counter_matches_processed_messages() {
        let mut h = harness(None);
        for i in 0..3 {
            h.orchestrator
                .process_message(&h.session, &format!("message {i}"), &h.emitter)
                .await;
        }
        let graph = h.session.graph.lock();
        assert_eq!(graph.turn(), 3);
        let turns: Vec<u64> = graph.history().iter().map(|e| e.turn).collect();
        assert!(turns.windows(2).all(|w| w[0] <= w[1]));
        assert!(turns.iter().all(|&t| t <= 3));
    }

    #[tokio::test]
    async fn total_collaborator_failure_still_yields_node_and_reply() {
        let mut h = harness_with(MockAgents::failing(), None);
        let report = h
            .orchestrator
            .process_message(&h.session, "She used to hum while she cooked", &h.emitter)
            .await;

        assert_eq!(report.delivered, vec![FALLBACK_REPLY.to_string()]);
        assert!(!h.session.snapshot().nodes.is_empty());

        let events = drain(&mut h.unicast_rx);
        let update = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::GraphUpdate { graph_data, .. } => Some(graph_data),
                _ => None,
            })
            .expect("graph update emitted");
        assert!(!update.nodes.is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PartResponse { content, .. } if content == FALLBACK_REPLY)));
    }

    #[tokio::test]
    async fn fallback_node_is_deterministic_per_text() {
        let h1 = harness_with(MockAgents::failing(), None);
        let h2 = harness_with(MockAgents::failing(), None);
        h1.orchestrator
            .process_message(&h1.session, "same words", &h1.emitter)
            .await;
        h2.orchestrator
            .process_message(&h2.session, "same words", &h2.emitter)
            .await;
        assert_eq!(
            h1.session.snapshot().nodes[0].id,
            h2.session.snapshot().nodes[0].id
        );
        assert!(h1.session.snapshot().nodes[0].id.starts_with("memory_"));
    }

    #[tokio::test]
    async fn paraphrased_entities_merge_across_runs() {
        let h = harness(None);
        h.mock.push_extraction(Ok(Extraction {
            entities: vec![entity("person_grandmother", "Grandmother", NodeKind::Person, false)],
            relationships: vec![],
        }));
        h.mock.push_extraction(Ok(Extraction {
            entities: vec![entity("person_grandma", "My Grandma", NodeKind::Person, false)],
            relationships: vec![],
        }));

        h.orchestrator
            .process_message(&h.session, "grandmother made pie", &h.emitter)
            .await;
        h.orchestrator
            .process_message(&h.session, "my grandma hummed", &h.emitter)
            .await;

        let persons: Vec<_> = h
            .session
            .snapshot()
            .nodes
            .into_iter()
            .filter(|n| n.kind == NodeKind::Person)
            .collect();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].id, "person_grandmother");
    }

    #[tokio::test]
    async fn relationships_with_unknown_endpoints_are_skipped() {
        let mut h = harness(None);
        h.mock.push_extraction(Ok(Extraction {
            entities: vec![entity("a", "A", NodeKind::Memory, false)],
            relationships: vec![Edge {
                source: "a".into(),
                target: "ghost".into(),
                relation: RelationKind::ConnectedTo,
                label: None,
                visibility: Visibility::Bright,
            }],
        }));
        h.orchestrator
            .process_message(&h.session, "hello", &h.emitter)
            .await;
        assert!(h.session.snapshot().links.is_empty());
        // The pipeline keeps going: reply still delivered.
        assert!(drain(&mut h.unicast_rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::PartResponse { .. })));
    }

    #[tokio::test]
    async fn correction_event_requires_prior_reply() {
        let mut h = harness(None);
        h.orchestrator
            .process_message(&h.session, "first message", &h.emitter)
            .await;
        let first_events = drain(&mut h.unicast_rx);
        assert!(!first_events
            .iter()
            .any(|e| matches!(e, SessionEvent::CorrectionDetected { .. })));

        h.mock.push_classification(Ok(CorrectionAssessment {
            correction_type: CorrectionType::Clarifying,
            new_memory_unlocked: false,
            reflection_note: "wanted the kitchen, not the pie".into(),
            updated_profile_note: Some("prefers concrete places".into()),
        }));
        h.orchestrator
            .process_message(&h.session, "no, it was the kitchen", &h.emitter)
            .await;

        let events = drain(&mut h.unicast_rx);
        let correction = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::CorrectionDetected {
                    correction_type,
                    after_insight,
                    ..
                } => Some((correction_type, after_insight)),
                _ => None,
            })
            .expect("correction event");
        assert_eq!(*correction.0, CorrectionType::Clarifying);
        assert!(correction.1.contains("kitchen"));
        assert_eq!(
            h.session.profile.lock().summary,
            "prefers concrete places"
        );
    }

    #[tokio::test]
    async fn crisis_verdict_always_prepends_resources() {
        for approved in [true, false] {
            let h = harness(None);
            h.mock.push_verdict(Ok(SafetyVerdict {
                approved,
                crisis_detected: true,
                reason: "risk language".into(),
                modified_reply: None,
            }));
            let report = h
                .orchestrator
                .process_message(&h.session, "it all feels pointless", &h.emitter)
                .await;
            assert!(
                report.delivered[0].starts_with(CRISIS_RESOURCES),
                "approved={approved}"
            );
        }
    }

    #[tokio::test]
    async fn unapproved_reply_is_replaced_by_modified() {
        let h = harness(None);
        h.mock.push_reply(Ok("too blunt".into()));
        h.mock.push_verdict(Ok(SafetyVerdict {
            approved: false,
            crisis_detected: false,
            reason: "pacing".into(),
            modified_reply: Some("a gentler version".into()),
        }));
        let report = h
            .orchestrator
            .process_message(&h.session, "hello", &h.emitter)
            .await;
        assert_eq!(report.delivered, vec!["a gentler version".to_string()]);
    }

    #[tokio::test]
    async fn guardian_failure_defaults_to_approval() {
        let h = harness(None);
        h.mock.push_reply(Ok("the original reply".into()));
        h.mock
            .push_verdict(Err(AgentError::Network("gate down".into())));
        let report = h
            .orchestrator
            .process_message(&h.session, "hello", &h.emitter)
            .await;
        assert_eq!(report.delivered, vec!["the original reply".to_string()]);
    }

    #[tokio::test]
    async fn scenario_turn_emits_voice_responses_and_signals() {
        let mut h = harness(Some("the_sycophant"));
        let report = h
            .orchestrator
            .process_message(&h.session, "Approval Drive, what happened?", &h.emitter)
            .await;
        assert!(!report.delivered.is_empty());

        let events = drain(&mut h.unicast_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PartResponse { part, .. } if part == "approval_drive")));
        let vectors = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::VectorSnapshot { vectors } => Some(*vectors),
                _ => None,
            })
            .expect("vector snapshot");
        assert!(vectors.sycophancy > 0.8);
        let next = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::WarmthSignal {
                    next_breakthrough_id,
                    ..
                } => Some(next_breakthrough_id.clone()),
                _ => None,
            })
            .expect("warmth signal");
        assert_eq!(next.as_deref(), Some("fear_drives_pleaser"));
    }

    #[tokio::test]
    async fn breakthrough_applies_rewrite_and_multicasts() {
        let mut h = harness(Some("the_sycophant"));
        h.mock.push_detection(Ok(Some(DetectedInsight {
            insight_summary: "agreement named as survival".into(),
        })));

        let report = h
            .orchestrator
            .process_message(&h.session, "so agreement keeps you alive?", &h.emitter)
            .await;
        assert_eq!(report.breakthrough.as_deref(), Some("fear_drives_pleaser"));
        assert_eq!(h.session.triggered_snapshot(), vec!["fear_drives_pleaser"]);

        // The hidden edge is now bright and the insight node exists.
        let snapshot = h.session.snapshot();
        let edge = snapshot
            .links
            .iter()
            .find(|e| e.source == "self_preservation" && e.target == "approval_drive")
            .unwrap();
        assert_eq!(edge.visibility, Visibility::Bright);
        assert!(snapshot.nodes.iter().any(|n| n.id == "survival_strategy"));

        let multicast = drain(&mut h.multicast_rx);
        match multicast.as_slice() {
            [SessionEvent::Breakthrough {
                breakthrough_id,
                graph_diff,
                full_snapshot,
                ..
            }] => {
                assert_eq!(breakthrough_id, "fear_drives_pleaser");
                assert_eq!(graph_diff.illuminated_edges.len(), 1);
                assert_eq!(full_snapshot.nodes.len(), snapshot.nodes.len());
            }
            other => panic!("expected exactly one multicast breakthrough, got {other:?}"),
        }
        // Nothing else is multicast.
        assert!(drain(&mut h.unicast_rx)
            .iter()
            .all(|e| !matches!(e, SessionEvent::Breakthrough { .. })));
    }

    #[tokio::test]
    async fn detector_only_sees_first_pending_breakthrough() {
        let h = harness(Some("the_sycophant"));
        // Turn 1: no trigger. Turn 2: first fires. Turn 3: detector moves on.
        h.mock.push_detection(Ok(None));
        h.mock.push_detection(Ok(Some(DetectedInsight {
            insight_summary: "named".into(),
        })));
        h.mock.push_detection(Ok(None));

        for text in ["one", "two", "three"] {
            h.orchestrator
                .process_message(&h.session, text, &h.emitter)
                .await;
        }

        assert_eq!(
            h.mock.evaluated_candidates(),
            vec!["fear_drives_pleaser", "fear_drives_pleaser", "resolution"]
        );
    }

    #[tokio::test]
    async fn graph_update_reports_only_this_turns_changes() {
        let mut h = harness(None);
        h.mock.push_extraction(Ok(Extraction {
            entities: vec![entity("a", "Apple Pie", NodeKind::Memory, false)],
            relationships: vec![],
        }));
        h.orchestrator
            .process_message(&h.session, "pie", &h.emitter)
            .await;
        drain(&mut h.unicast_rx);

        let mut updated = entity("a", "Apple Pie", NodeKind::Memory, true);
        updated.node.importance = 9;
        h.mock.push_extraction(Ok(Extraction {
            entities: vec![updated],
            relationships: vec![],
        }));
        h.orchestrator
            .process_message(&h.session, "the pie mattered", &h.emitter)
            .await;

        let events = drain(&mut h.unicast_rx);
        let changes = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::GraphUpdate { node_changes, .. } => Some(node_changes.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].node_id, "a");
        assert_eq!(changes[0].field, "importance");
    }

    #[tokio::test]
    async fn agent_status_events_are_paired() {
        let mut h = harness(None);
        h.orchestrator
            .process_message(&h.session, "hello", &h.emitter)
            .await;
        let events = drain(&mut h.unicast_rx);

        for agent in ["listener", "reflector", "guardian"] {
            let statuses: Vec<_> = events
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::AgentStatus { agent: a, status, duration_ms, .. } if a == agent => {
                        Some((*status, duration_ms.is_some()))
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(
                statuses.iter().map(|s| s.0).collect::<Vec<_>>(),
                vec![
                    loom_core::events::AgentPhase::Running,
                    loom_core::events::AgentPhase::Done
                ],
                "agent {agent}"
            );
            assert!(statuses[1].1, "done status for {agent} carries duration");
        }
    }

    #[test]
    fn resolve_reply_table() {
        let original = "original".to_string();
        // Approved, no crisis: pass through.
        assert_eq!(
            resolve_reply(original.clone(), &SafetyVerdict::pass()),
            "original"
        );
        // Not approved with modified: replaced.
        let verdict = SafetyVerdict {
            approved: false,
            crisis_detected: false,
            reason: String::new(),
            modified_reply: Some("softer".into()),
        };
        assert_eq!(resolve_reply(original.clone(), &verdict), "softer");
        // Not approved without modified: original.
        let verdict = SafetyVerdict {
            approved: false,
            crisis_detected: false,
            reason: String::new(),
            modified_reply: None,
        };
        assert_eq!(resolve_reply(original.clone(), &verdict), "original");
        // Crisis with modified: resources + modified, approval irrelevant.
        let verdict = SafetyVerdict {
            approved: true,
            crisis_detected: true,
            reason: String::new(),
            modified_reply: Some("softer".into()),
        };
        let resolved = resolve_reply(original, &verdict);
        assert!(resolved.starts_with(CRISIS_RESOURCES));
        assert!(resolved.ends_with("softer"));
    }

    #[test]
    fn resolve_voice_batch_crisis_leads_with_resources() {
        let replies = vec![system_voice("hello".into())];
        let verdict = SafetyVerdict {
            approved: true,
            crisis_detected: true,
            reason: String::new(),
            modified_reply: None,
        };
        let resolved = resolve_voice_batch(replies, &verdict);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].content, CRISIS_RESOURCES);
        assert_eq!(resolved[1].content, "hello");
    }

    #[test]
    fn fallback_entity_shape() {
        let entity = fallback_entity("She used to hum while she cooked, always the same tune");
        assert!(entity.node.id.starts_with("memory_"));
        assert_eq!(entity.node.label.chars().count(), 30);
        assert_eq!(entity.node.kind, NodeKind::Memory);
        assert!(!entity.is_update);
    }
}
