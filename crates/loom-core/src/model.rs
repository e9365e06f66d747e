//! Graph data model: nodes, edges, snapshots, and structural rewrites.
//!
//! Everything here is plain data. The mutation logic (dedup, diffing,
//! history) lives in `loom-graph`; this crate only defines the shapes that
//! cross the wire and the persistence boundary.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Concept categories a node can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Memory,
    Person,
    Value,
    Emotion,
    Ritual,
    Place,
    Artifact,
    Part,
    Insight,
}

impl NodeKind {
    /// Lenient parse for agent-sourced strings. Returns `None` for unknown
    /// values so the trust boundary can decide whether to coerce or drop.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "person" => Some(Self::Person),
            "value" => Some(Self::Value),
            "emotion" => Some(Self::Emotion),
            "ritual" => Some(Self::Ritual),
            "place" => Some(Self::Place),
            "artifact" => Some(Self::Artifact),
            "part" => Some(Self::Part),
            "insight" => Some(Self::Insight),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Person => "person",
            Self::Value => "value",
            Self::Emotion => "emotion",
            Self::Ritual => "ritual",
            Self::Place => "place",
            Self::Artifact => "artifact",
            Self::Part => "part",
            Self::Insight => "insight",
        }
    }

    /// Default render color when the extractor does not supply one.
    pub fn default_color(&self) -> &'static str {
        match self {
            Self::Memory => "#E8A94B",
            Self::Person => "#F0EDE8",
            Self::Value => "#C47B8A",
            Self::Emotion => "#7B9FD4",
            Self::Ritual => "#7BAF8A",
            Self::Place => "#FB923C",
            Self::Artifact => "#F472B6",
            Self::Part => "#E8A94B",
            Self::Insight => "#FB923C",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumerated relation kinds an edge can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    FeltDuring,
    ConnectedTo,
    RemindsOf,
    ValuedBy,
    AssociatedWith,
    EvolvedFrom,
    Contradicts,
    Drives,
    Informs,
    Reveals,
    Explains,
    Enables,
    EvolvesInto,
    Suppresses,
    Gates,
}

impl RelationKind {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "felt_during" => Some(Self::FeltDuring),
            "connected_to" => Some(Self::ConnectedTo),
            "reminds_of" => Some(Self::RemindsOf),
            "valued_by" => Some(Self::ValuedBy),
            "associated_with" => Some(Self::AssociatedWith),
            "evolved_from" => Some(Self::EvolvedFrom),
            "contradicts" => Some(Self::Contradicts),
            "drives" => Some(Self::Drives),
            "informs" => Some(Self::Informs),
            "reveals" => Some(Self::Reveals),
            "explains" => Some(Self::Explains),
            "enables" => Some(Self::Enables),
            "evolves_into" => Some(Self::EvolvesInto),
            "suppresses" => Some(Self::Suppresses),
            "gates" => Some(Self::Gates),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeltDuring => "felt_during",
            Self::ConnectedTo => "connected_to",
            Self::RemindsOf => "reminds_of",
            Self::ValuedBy => "valued_by",
            Self::AssociatedWith => "associated_with",
            Self::EvolvedFrom => "evolved_from",
            Self::Contradicts => "contradicts",
            Self::Drives => "drives",
            Self::Informs => "informs",
            Self::Reveals => "reveals",
            Self::Explains => "explains",
            Self::Enables => "enables",
            Self::EvolvesInto => "evolves_into",
            Self::Suppresses => "suppresses",
            Self::Gates => "gates",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering emphasis. `Hidden` edges exist but are not drawn until
/// illuminated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Bright,
    Dim,
    Hidden,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bright => "bright",
            Self::Dim => "dim",
            Self::Hidden => "hidden",
        }
    }
}

fn default_weight() -> u8 {
    5
}

/// A single concept in the session graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_weight")]
    pub importance: u8,
    #[serde(default = "default_weight")]
    pub size: u8,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Node {
    /// Merge a patch into this node, returning the per-field old/new diff.
    /// The id is never touched. Unchanged fields do not appear in the diff.
    pub fn apply(&mut self, patch: &NodePatch) -> BTreeMap<String, FieldChange> {
        let mut diff = BTreeMap::new();

        macro_rules! merge {
            ($field:ident, $name:expr) => {
                if let Some(new) = &patch.$field {
                    if *new != self.$field {
                        diff.insert(
                            $name.to_string(),
                            FieldChange {
                                old: serde_json::json!(self.$field),
                                new: serde_json::json!(new),
                            },
                        );
                        self.$field = new.clone();
                    }
                }
            };
        }

        merge!(label, "label");
        merge!(kind, "type");
        merge!(description, "description");
        merge!(importance, "importance");
        merge!(size, "size");
        merge!(visibility, "visibility");
        if let Some(color) = &patch.color {
            if self.color.as_deref() != Some(color.as_str()) {
                diff.insert(
                    "color".to_string(),
                    FieldChange {
                        old: serde_json::json!(self.color),
                        new: serde_json::json!(color),
                    },
                );
                self.color = Some(color.clone());
            }
        }

        diff
    }

    /// Patch carrying every field of this node (used when an upsert resolves
    /// to an existing node and must overwrite it wholesale).
    pub fn as_patch(&self) -> NodePatch {
        NodePatch {
            label: Some(self.label.clone()),
            kind: Some(self.kind),
            description: Some(self.description.clone()),
            importance: Some(self.importance),
            size: Some(self.size),
            visibility: Some(self.visibility),
            color: self.color.clone(),
        }
    }
}

/// Partial node update. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NodeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Old/new pair for a single changed field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// A directed relation between two nodes. Uniqueness key is
/// (source, target, relation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation: RelationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Edge {
    pub fn key(&self) -> EdgeRef {
        EdgeRef {
            source: self.source.clone(),
            target: self.target.clone(),
            relation: self.relation,
        }
    }

    pub fn matches(&self, key: &EdgeRef) -> bool {
        self.source == key.source && self.target == key.target && self.relation == key.relation
    }
}

/// Identifies one edge by its uniqueness triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeRef {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation: RelationKind,
}

/// Full materialization of the graph, sent to clients for resync and
/// carried on multicast breakthrough events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub links: Vec<Edge>,
    pub turn: u64,
}

/// One field-level change reported to clients after a processed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFieldChange {
    pub node_id: String,
    pub field: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
}

/// A node-field update inside a structural rewrite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeChange {
    pub id: String,
    #[serde(flatten)]
    pub patch: NodePatch,
}

/// Batch structural rewrite associated with a breakthrough. Applied in a
/// fixed order: illuminate, dissolve, new nodes, new edges, node changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphRewrite {
    #[serde(default)]
    pub illuminate_edges: Vec<EdgeRef>,
    #[serde(default)]
    pub dissolve_edges: Vec<EdgeRef>,
    #[serde(default)]
    pub new_nodes: Vec<Node>,
    #[serde(default)]
    pub new_edges: Vec<Edge>,
    #[serde(default)]
    pub change_nodes: Vec<NodeChange>,
}

/// What a rewrite actually did. Sub-changes that were no-ops (unknown edge,
/// missing node) are absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RewriteDiff {
    pub illuminated_edges: Vec<EdgeRef>,
    pub dissolved_edges: Vec<EdgeRef>,
    pub new_nodes: Vec<Node>,
    pub new_edges: Vec<Edge>,
    pub changed_nodes: Vec<NodeChange>,
}

impl RewriteDiff {
    pub fn is_empty(&self) -> bool {
        self.illuminated_edges.is_empty()
            && self.dissolved_edges.is_empty()
            && self.new_nodes.is_empty()
            && self.new_edges.is_empty()
            && self.changed_nodes.is_empty()
    }
}

/// Who produced a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One entry in the per-session conversation log. `speaker` names the voice
/// for scenario-mode assistant turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            speaker: None,
            content: content.into(),
        }
    }

    pub fn assistant(speaker: Option<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            speaker,
            content: content.into(),
        }
    }
}
