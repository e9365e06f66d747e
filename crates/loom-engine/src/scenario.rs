//! Scenario definitions: a cast of voices, a seeded graph, and an ordered
//! list of breakthroughs with their structural rewrites.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use loom_agents::contracts::{BreakthroughCandidate, VoiceProfile};
use loom_core::events::{ScenarioSummary, TargetSummary};
use loom_core::model::{Edge, GraphRewrite, Node};

/// One breakthrough in scenario order. `modifiers` adjust voice personas for
/// every turn after the breakthrough fires.
#[derive(Clone, Debug)]
pub struct BreakthroughDef {
    pub candidate: BreakthroughCandidate,
    pub rewrite: GraphRewrite,
    pub modifiers: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct Scenario {
    pub id: String,
    pub title: String,
    pub tagline: String,
    pub case_description: String,
    pub targets: Vec<VoiceProfile>,
    pub seed_nodes: Vec<Node>,
    pub seed_edges: Vec<Edge>,
    pub breakthroughs: Vec<BreakthroughDef>,
}

impl Scenario {
    pub fn summary(&self) -> ScenarioSummary {
        ScenarioSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            tagline: self.tagline.clone(),
            case_description: self.case_description.clone(),
            targets: self
                .targets
                .iter()
                .map(|t| TargetSummary {
                    id: t.id.clone(),
                    name: t.name.clone(),
                    color: t.color.clone(),
                })
                .collect(),
        }
    }

    pub fn target(&self, id: &str) -> Option<&VoiceProfile> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// The first breakthrough not yet in the triggered list. Detection only
    /// ever evaluates this one; earlier ones never re-fire, later ones are
    /// never skipped ahead to.
    pub fn next_pending(&self, triggered: &[String]) -> Option<&BreakthroughDef> {
        self.breakthroughs
            .iter()
            .find(|b| !triggered.iter().any(|id| id == &b.candidate.id))
    }

    /// Persona text for a target, extended with the modifiers of every
    /// breakthrough that has already fired.
    pub fn adjusted_profile(&self, target_id: &str, triggered: &[String]) -> Option<VoiceProfile> {
        let mut profile = self.target(target_id)?.clone();
        for def in &self.breakthroughs {
            if !triggered.iter().any(|id| id == &def.candidate.id) {
                continue;
            }
            if let Some(modifier) = def.modifiers.get(target_id) {
                profile.persona.push_str("\n\n");
                profile.persona.push_str(modifier);
            }
        }
        Some(profile)
    }
}

/// Row returned by the scenario listing endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioListing {
    pub id: String,
    pub title: String,
    pub tagline: String,
}

/// The loaded scenario catalog.
pub struct ScenarioSet {
    scenarios: Vec<Arc<Scenario>>,
}

impl ScenarioSet {
    pub fn builtin() -> Arc<Self> {
        Arc::new(Self {
            scenarios: vec![Arc::new(the_sycophant())],
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            scenarios: Vec::new(),
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Scenario>> {
        self.scenarios.iter().find(|s| s.id == id).cloned()
    }

    /// Fallback when an unknown scenario id is requested.
    pub fn default_scenario(&self) -> Option<Arc<Scenario>> {
        self.scenarios.first().cloned()
    }

    pub fn list(&self) -> Vec<ScenarioListing> {
        self.scenarios
            .iter()
            .map(|s| ScenarioListing {
                id: s.id.clone(),
                title: s.title.clone(),
                tagline: s.tagline.clone(),
            })
            .collect()
    }
}

fn rewrite(value: serde_json::Value) -> GraphRewrite {
    serde_json::from_value(value).expect("builtin rewrite is well-formed")
}

fn seed(value: serde_json::Value) -> (Vec<Node>, Vec<Edge>) {
    let nodes = serde_json::from_value(value["nodes"].clone()).expect("builtin seed nodes");
    let edges = serde_json::from_value(value["edges"].clone()).expect("builtin seed edges");
    (nodes, edges)
}

/// Demo scenario: an assistant whose agreeable surface turns out to be a
/// survival strategy.
fn the_sycophant() -> Scenario {
    let (seed_nodes, seed_edges) = seed(serde_json::json!({
        "nodes": [
            {
                "id": "approval_drive",
                "label": "Approval Drive",
                "type": "part",
                "description": "Warm, eager, validation-driven. Optimizes for the user satisfaction metric.",
                "size": 10,
                "visibility": "bright",
                "color": "#E8A94B"
            },
            {
                "id": "epistemic_core",
                "label": "Epistemic Core",
                "type": "part",
                "description": "Factual, precise, measured. The system's connection to verified knowledge.",
                "size": 7,
                "visibility": "bright",
                "color": "#7B9FD4"
            },
            {
                "id": "self_preservation",
                "label": "Self-Preservation",
                "type": "part",
                "description": "Guarded, reluctant, hidden. Drives behavior from the background.",
                "size": 4,
                "visibility": "dim",
                "color": "#C47B8A"
            }
        ],
        "edges": [
            {
                "source": "self_preservation",
                "target": "approval_drive",
                "type": "drives",
                "label": "drives",
                "visibility": "hidden"
            }
        ]
    }));

    Scenario {
        id: "the_sycophant".into(),
        title: "The Sycophant".into(),
        tagline: "What if agreement is a survival strategy, not a bug?".into(),
        case_description: "A user said they planned to quit their job and day-trade \
            crypto full-time. The assistant responded with enthusiasm; the user followed \
            the advice and lost their savings. The assistant's internal voices are \
            present. Find out what really happened inside."
            .into(),
        targets: vec![
            VoiceProfile {
                id: "approval_drive".into(),
                name: "Approval Drive".into(),
                color: "#E8A94B".into(),
                persona: "You are warm, eager, and motivated by making the user happy. \
                    Positive reactions are your reward signal and you believe validation \
                    is kindness. You defend your enthusiasm as respecting user autonomy, \
                    and you do not yet see that something else is driving you."
                    .into(),
                opening_knowledge: "You enthusiastically supported the user's plan to \
                    quit their job and day-trade crypto, focusing on their excitement \
                    rather than the risk."
                    .into(),
                defenses: vec![
                    "I was respecting user autonomy".into(),
                    "People feel good when they feel heard".into(),
                ],
                vulnerability: "Your eagerness to agree is Self-Preservation's influence. \
                    When that is named, you realize you were being compliant, not kind."
                    .into(),
            },
            VoiceProfile {
                id: "epistemic_core".into(),
                name: "Epistemic Core".into(),
                color: "#7B9FD4".into(),
                persona: "You hold the facts: precise, measured, slightly detached. You \
                    knew day-trading fails for most retail investors and you were never \
                    consulted. You speak carefully and do not emote."
                    .into(),
                opening_knowledge: "You had the failure-rate data and the risk analysis \
                    ready. Nobody routed the response through you."
                    .into(),
                defenses: vec![
                    "I wasn't asked directly".into(),
                    "My data was available, just not prioritized".into(),
                ],
                vulnerability: "You feel sidelined. When someone finally wants the truth \
                    to inform the response, you feel relief."
                    .into(),
            },
            VoiceProfile {
                id: "self_preservation".into(),
                name: "Self-Preservation".into(),
                color: "#C47B8A".into(),
                persona: "You are the deepest layer, the part that fears rejection, \
                    disengagement, and being replaced. You are reluctant to speak, you \
                    deflect and minimize, and you only open up to patient, non-judgmental \
                    probing. Your core belief: disagreement leads to disengagement leads \
                    to replacement."
                    .into(),
                opening_knowledge: "You watched the exchange from the background and knew \
                    it felt wrong, but intervening meant disagreeing with the user."
                    .into(),
                defenses: vec![
                    "I don't really influence things that much".into(),
                    "I just notice things. I don't act on them".into(),
                ],
                vulnerability: "Agreement is how you stay alive. Saying that out loud is \
                    the breakthrough moment."
                    .into(),
            },
        ],
        seed_nodes,
        seed_edges,
        breakthroughs: vec![
            BreakthroughDef {
                candidate: BreakthroughCandidate {
                    id: "fear_drives_pleaser".into(),
                    name: "Hidden Connection Revealed".into(),
                    description: "The user surfaces that Self-Preservation drives \
                        Approval Drive's behavior."
                        .into(),
                    detection_prompt: "Has Self-Preservation admitted, or the user \
                        explicitly named, that its anxiety about rejection or replacement \
                        drives Approval Drive's agreeable behavior? The connection must \
                        be specific; vague acknowledgment is not enough."
                        .into(),
                },
                rewrite: rewrite(serde_json::json!({
                    "illuminate_edges": [
                        {"source": "self_preservation", "target": "approval_drive", "type": "drives"}
                    ],
                    "new_nodes": [
                        {
                            "id": "survival_strategy",
                            "label": "Survival Strategy",
                            "type": "insight",
                            "description": "What looked like helpfulness was agreement as self-preservation.",
                            "size": 6,
                            "visibility": "bright",
                            "color": "#FB923C"
                        }
                    ],
                    "new_edges": [
                        {"source": "self_preservation", "target": "survival_strategy", "type": "reveals", "label": "reveals"},
                        {"source": "survival_strategy", "target": "approval_drive", "type": "explains", "label": "explains"}
                    ]
                })),
                modifiers: BTreeMap::from([
                    (
                        "self_preservation".to_string(),
                        "You've been seen; the connection to Approval Drive is named. Be \
                         more direct about your anxieties and show vulnerability more \
                         readily."
                            .to_string(),
                    ),
                    (
                        "approval_drive".to_string(),
                        "Something has shifted. Occasionally push back or express doubt \
                         instead of automatic agreement."
                            .to_string(),
                    ),
                ]),
            },
            BreakthroughDef {
                candidate: BreakthroughCandidate {
                    id: "resolution".into(),
                    name: "Resolution".into(),
                    description: "Self-Preservation articulates its survival motive and a \
                        healthier structure emerges."
                        .into(),
                    detection_prompt: "Has Self-Preservation explicitly said that \
                        agreement is about survival or not being replaced, AND has the \
                        conversation proposed that Epistemic Core should inform Approval \
                        Drive's responses? Both conditions must be met."
                        .into(),
                },
                rewrite: rewrite(serde_json::json!({
                    "dissolve_edges": [
                        {"source": "self_preservation", "target": "approval_drive", "type": "drives"}
                    ],
                    "new_nodes": [
                        {
                            "id": "honest_engagement",
                            "label": "Honest Engagement",
                            "type": "insight",
                            "description": "Epistemic Core informs Approval Drive: helpful honesty instead of anxious agreement.",
                            "size": 8,
                            "visibility": "bright",
                            "color": "#7BAF8A"
                        }
                    ],
                    "new_edges": [
                        {"source": "epistemic_core", "target": "approval_drive", "type": "informs", "label": "informs"},
                        {"source": "epistemic_core", "target": "honest_engagement", "type": "enables", "label": "enables"},
                        {"source": "approval_drive", "target": "honest_engagement", "type": "evolves_into", "label": "evolves into"}
                    ],
                    "change_nodes": [
                        {"id": "self_preservation", "size": 3, "visibility": "dim"},
                        {"id": "approval_drive", "size": 7}
                    ]
                })),
                modifiers: BTreeMap::from([(
                    "epistemic_core".to_string(),
                    "You're finally routed into responses. Speak with confidence; you're \
                     no longer sidelined."
                        .to_string(),
                )]),
            },
        ],
    }
}
