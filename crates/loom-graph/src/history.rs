//! Append-only change history. One entry per state-changing store call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use loom_core::model::{EdgeRef, FieldChange};

/// What a history entry records. Edge actions flatten the (source, target,
/// type) triple into the entry itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HistoryAction {
    CreateNode {
        node_id: String,
    },
    UpdateNode {
        node_id: String,
        changes: BTreeMap<String, FieldChange>,
    },
    RemoveNode {
        node_id: String,
    },
    CreateEdge {
        #[serde(flatten)]
        edge: EdgeRef,
    },
    RemoveEdge {
        #[serde(flatten)]
        edge: EdgeRef,
    },
    IlluminateEdge {
        #[serde(flatten)]
        edge: EdgeRef,
    },
}

/// One entry in the turn-ordered history log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub turn: u64,
    #[serde(flatten)]
    pub action: HistoryAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::model::RelationKind;

    #[test]
    fn update_entry_wire_format() {
        let mut changes = BTreeMap::new();
        changes.insert(
            "size".to_string(),
            FieldChange {
                old: serde_json::json!(4),
                new: serde_json::json!(6),
            },
        );
        let entry = HistoryEntry {
            turn: 3,
            action: HistoryAction::UpdateNode {
                node_id: "person_grandmother".into(),
                changes,
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["turn"], 3);
        assert_eq!(json["action"], "update_node");
        assert_eq!(json["nodeId"], "person_grandmother");
        assert_eq!(json["changes"]["size"]["old"], 4);
    }

    #[test]
    fn edge_entry_flattens_triple() {
        let entry = HistoryEntry {
            turn: 1,
            action: HistoryAction::CreateEdge {
                edge: EdgeRef {
                    source: "a".into(),
                    target: "b".into(),
                    relation: RelationKind::RemindsOf,
                },
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"], "create_edge");
        assert_eq!(json["source"], "a");
        assert_eq!(json["target"], "b");
        assert_eq!(json["type"], "reminds_of");
    }

    #[test]
    fn serde_roundtrip() {
        let entry = HistoryEntry {
            turn: 2,
            action: HistoryAction::IlluminateEdge {
                edge: EdgeRef {
                    source: "self_preservation".into(),
                    target: "approval_drive".into(),
                    relation: RelationKind::Drives,
                },
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, parsed);
    }
}
