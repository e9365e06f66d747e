//! Canonical per-session graph state with dedup, field-level diffing, and
//! breakthrough-driven structural rewrites.
//!
//! All operations are synchronous and take effect in memory immediately.
//! Durability is write-through per mutating call but best-effort: a failed
//! write is logged and never rolls back or blocks the mutation.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use loom_core::ids::SessionId;
use loom_core::model::{
    Edge, EdgeRef, GraphRewrite, GraphSnapshot, Node, NodeFieldChange, NodePatch, RewriteDiff,
};

use crate::history::{HistoryAction, HistoryEntry};
use crate::persist::{self, PersistedGraph};
use crate::similarity::label_similarity;

/// Minimum label similarity for two same-kind nodes to be treated as one
/// entity.
pub const SIMILARITY_THRESHOLD: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

pub struct GraphStore {
    session_id: SessionId,
    data_dir: Option<PathBuf>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    history: Vec<HistoryEntry>,
    turn: u64,
}

impl GraphStore {
    /// Open the store for a session, loading the durable record if one
    /// exists. A corrupt or unreadable record is logged and replaced by an
    /// empty graph rather than failing session creation.
    pub fn open(session_id: SessionId, data_dir: &Path) -> Self {
        let record = match persist::load(data_dir, &session_id) {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to load graph record, starting empty");
                PersistedGraph::default()
            }
        };
        Self {
            session_id,
            data_dir: Some(data_dir.to_owned()),
            nodes: record.nodes,
            edges: record.edges,
            history: record.history,
            turn: record.turn,
        }
    }

    /// Store without a durable record (tests).
    pub fn in_memory(session_id: SessionId) -> Self {
        Self {
            session_id,
            data_dir: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            history: Vec::new(),
            turn: 0,
        }
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Advance the turn counter. Called exactly once per fully processed
    /// message, before any of that message's mutations.
    pub fn advance_turn(&mut self) {
        self.turn += 1;
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ---- Node operations ----

    /// Insert or merge a node. When the id is unknown and `is_update` is not
    /// set, a fuzzy label match against same-kind nodes may resolve the
    /// entity to an existing node instead of inserting a duplicate.
    pub fn upsert_node(&mut self, node: Node, is_update: bool) -> (Node, UpsertOutcome) {
        if let Some(idx) = self.nodes.iter().position(|n| n.id == node.id) {
            return (self.merge_at(idx, &node), UpsertOutcome::Updated);
        }

        if !is_update {
            if let Some(idx) = self.best_fuzzy_match(&node) {
                debug!(
                    session_id = %self.session_id,
                    incoming = %node.id,
                    matched = %self.nodes[idx].id,
                    "fuzzy-matched entity to existing node"
                );
                return (self.merge_at(idx, &node), UpsertOutcome::Updated);
            }
        }

        self.insert_node(node)
    }

    /// Merge fields into an existing node. Returns `None` without touching
    /// anything when the id is unknown.
    pub fn update_node(&mut self, id: &str, patch: NodePatch) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| n.id == id)?;
        let diff = self.nodes[idx].apply(&patch);
        if !diff.is_empty() {
            self.history.push(HistoryEntry {
                turn: self.turn,
                action: HistoryAction::UpdateNode {
                    node_id: id.to_string(),
                    changes: diff,
                },
            });
        }
        self.persist();
        Some(self.nodes[idx].clone())
    }

    /// Delete a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let Some(idx) = self.nodes.iter().position(|n| n.id == id) else {
            return false;
        };
        self.nodes.remove(idx);
        self.edges.retain(|e| e.source != id && e.target != id);
        self.history.push(HistoryEntry {
            turn: self.turn,
            action: HistoryAction::RemoveNode {
                node_id: id.to_string(),
            },
        });
        self.persist();
        true
    }

    // ---- Edge operations ----

    /// Insert or overwrite an edge keyed by (source, target, relation).
    /// Both endpoints must already exist; an edge referencing an unknown
    /// node is rejected as a no-op. Overwrites never log history; re-applying
    /// identical attributes changes nothing.
    pub fn upsert_edge(&mut self, edge: Edge) -> bool {
        if self.get_node(&edge.source).is_none() || self.get_node(&edge.target).is_none() {
            warn!(
                session_id = %self.session_id,
                source = %edge.source,
                target = %edge.target,
                "edge references unknown node, skipping"
            );
            return false;
        }

        let key = edge.key();
        if let Some(existing) = self.edges.iter_mut().find(|e| e.matches(&key)) {
            if *existing == edge {
                return true;
            }
            *existing = edge;
            self.persist();
            return true;
        }

        self.history.push(HistoryEntry {
            turn: self.turn,
            action: HistoryAction::CreateEdge { edge: key },
        });
        self.edges.push(edge);
        self.persist();
        true
    }

    /// Remove an edge. Idempotent: unknown triples are a no-op.
    pub fn remove_edge(&mut self, key: &EdgeRef) -> bool {
        let Some(idx) = self.edges.iter().position(|e| e.matches(key)) else {
            return false;
        };
        self.edges.remove(idx);
        self.history.push(HistoryEntry {
            turn: self.turn,
            action: HistoryAction::RemoveEdge { edge: key.clone() },
        });
        self.persist();
        true
    }

    /// Reveal a previously hidden edge without deleting it. Idempotent on
    /// unknown triples.
    pub fn illuminate_edge(&mut self, key: &EdgeRef) -> bool {
        let Some(edge) = self.edges.iter_mut().find(|e| e.matches(key)) else {
            return false;
        };
        edge.visibility = loom_core::model::Visibility::Bright;
        self.history.push(HistoryEntry {
            turn: self.turn,
            action: HistoryAction::IlluminateEdge { edge: key.clone() },
        });
        self.persist();
        true
    }

    // ---- Structural rewrites ----

    /// Apply a breakthrough rewrite in fixed order: illuminate, dissolve,
    /// new nodes, new edges, node changes. A dissolved edge cannot reappear
    /// as "new" earlier in the batch, and new nodes exist before edges that
    /// reference them. Returns exactly what was applied.
    pub fn apply_rewrite(&mut self, rewrite: &GraphRewrite) -> RewriteDiff {
        let mut diff = RewriteDiff::default();

        for key in &rewrite.illuminate_edges {
            if self.illuminate_edge(key) {
                diff.illuminated_edges.push(key.clone());
            }
        }
        for key in &rewrite.dissolve_edges {
            if self.remove_edge(key) {
                diff.dissolved_edges.push(key.clone());
            }
        }
        for node in &rewrite.new_nodes {
            // Rewrite node ids are authoritative; no fuzzy resolution here.
            let applied = if let Some(idx) = self.nodes.iter().position(|n| n.id == node.id) {
                self.merge_at(idx, node)
            } else {
                self.insert_node(node.clone()).0
            };
            diff.new_nodes.push(applied);
        }
        for edge in &rewrite.new_edges {
            if self.upsert_edge(edge.clone()) {
                diff.new_edges.push(edge.clone());
            }
        }
        for change in &rewrite.change_nodes {
            if self.update_node(&change.id, change.patch.clone()).is_some() {
                diff.changed_nodes.push(change.clone());
            }
        }

        diff
    }

    // ---- Seeding ----

    /// Load a scenario's initial nodes and edges. Only applies to an empty
    /// store; seeding writes no history and does not advance the turn.
    pub fn seed(&mut self, nodes: Vec<Node>, edges: Vec<Edge>) {
        if !self.nodes.is_empty() {
            return;
        }
        self.nodes = nodes;
        self.edges = edges;
        self.persist();
    }

    // ---- Queries ----

    /// Field-level changes whose owning history entry has turn strictly
    /// greater than `since_turn`.
    pub fn changes_since(&self, since_turn: u64) -> Vec<NodeFieldChange> {
        let mut changes = Vec::new();
        for entry in &self.history {
            if entry.turn <= since_turn {
                continue;
            }
            if let HistoryAction::UpdateNode { node_id, changes: fields } = &entry.action {
                for (field, change) in fields {
                    changes.push(NodeFieldChange {
                        node_id: node_id.clone(),
                        field: field.clone(),
                        old_value: change.old.clone(),
                        new_value: change.new.clone(),
                    });
                }
            }
        }
        changes
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            links: self.edges.clone(),
            turn: self.turn,
        }
    }

    /// Deterministic, insertion-ordered rendering fed to generation agents.
    pub fn render_for_prompt(&self) -> String {
        if self.nodes.is_empty() {
            return "Graph is empty.".to_string();
        }
        let mut lines = vec!["Nodes:".to_string()];
        for n in &self.nodes {
            lines.push(format!(
                "  - {}: \"{}\" (type={}, size={}, visibility={})",
                n.id,
                n.label,
                n.kind,
                n.size,
                n.visibility.as_str()
            ));
        }
        if !self.edges.is_empty() {
            lines.push("Edges:".to_string());
            for e in &self.edges {
                lines.push(format!(
                    "  - {} --{}--> {} (visibility={})",
                    e.source,
                    e.relation,
                    e.target,
                    e.visibility.as_str()
                ));
            }
        }
        lines.join("\n")
    }

    /// Compact node listing given to the extractor so it can reuse ids.
    pub fn existing_nodes_summary(&self) -> String {
        if self.nodes.is_empty() {
            return "No nodes yet.".to_string();
        }
        self.nodes
            .iter()
            .map(|n| format!("- {}: {} ({})", n.id, n.label, n.kind))
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ---- Internals ----

    fn insert_node(&mut self, node: Node) -> (Node, UpsertOutcome) {
        self.history.push(HistoryEntry {
            turn: self.turn,
            action: HistoryAction::CreateNode {
                node_id: node.id.clone(),
            },
        });
        self.nodes.push(node.clone());
        self.persist();
        (node, UpsertOutcome::Created)
    }

    fn merge_at(&mut self, idx: usize, incoming: &Node) -> Node {
        let patch = incoming.as_patch();
        let node_id = self.nodes[idx].id.clone();
        let diff = self.nodes[idx].apply(&patch);
        if !diff.is_empty() {
            self.history.push(HistoryEntry {
                turn: self.turn,
                action: HistoryAction::UpdateNode {
                    node_id,
                    changes: diff,
                },
            });
        }
        self.persist();
        self.nodes[idx].clone()
    }

    fn best_fuzzy_match(&self, node: &Node) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, candidate) in self.nodes.iter().enumerate() {
            if candidate.kind != node.kind {
                continue;
            }
            let score = label_similarity(&candidate.label, &node.label);
            if score >= SIMILARITY_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn persist(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let record = PersistedGraph {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            history: self.history.clone(),
            turn: self.turn,
        };
        if let Err(e) = persist::save(dir, &self.session_id, &record) {
            warn!(session_id = %self.session_id, error = %e, "graph write failed, in-memory state remains authoritative");
        }
    }
}
