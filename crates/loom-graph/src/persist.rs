//! Durable record for one session's graph: full-snapshot overwrite on every
//! mutating call. Persistence is a best-effort side channel; in-memory state
//! stays authoritative when a write fails.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use loom_core::ids::SessionId;
use loom_core::model::{Edge, Node};

use crate::error::StoreError;
use crate::history::HistoryEntry;

/// The on-disk shape: `{nodes, edges, history, turn}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub turn: u64,
}

pub fn record_path(data_dir: &Path, session_id: &SessionId) -> PathBuf {
    data_dir.join(format!("{session_id}.json"))
}

pub fn load(data_dir: &Path, session_id: &SessionId) -> Result<Option<PersistedGraph>, StoreError> {
    let path = record_path(data_dir, session_id);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

pub fn save(
    data_dir: &Path,
    session_id: &SessionId,
    record: &PersistedGraph,
) -> Result<(), StoreError> {
    std::fs::create_dir_all(data_dir)?;
    let bytes = serde_json::to_vec_pretty(record)?;
    std::fs::write(record_path(data_dir, session_id), bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::model::{NodeKind, Visibility};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("loom-graph-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = temp_dir();
        let loaded = load(&dir, &SessionId::from_raw("absent")).unwrap();
        assert!(loaded.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = temp_dir();
        let sid = SessionId::from_raw("roundtrip");
        let record = PersistedGraph {
            nodes: vec![Node {
                id: "n1".into(),
                label: "Apple Pie".into(),
                kind: NodeKind::Memory,
                description: "famous pie".into(),
                importance: 7,
                size: 5,
                visibility: Visibility::Bright,
                color: None,
            }],
            edges: vec![],
            history: vec![],
            turn: 4,
        };
        save(&dir, &sid, &record).unwrap();

        let loaded = load(&dir, &sid).unwrap().unwrap();
        assert_eq!(loaded.turn, 4);
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.nodes[0].label, "Apple Pie");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_sections_default() {
        let record: PersistedGraph = serde_json::from_str(r#"{"turn": 2}"#).unwrap();
        assert_eq!(record.turn, 2);
        assert!(record.nodes.is_empty());
        assert!(record.history.is_empty());
    }
}
