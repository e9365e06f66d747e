//! Per-session state and the process-wide registry.
//!
//! Every piece of conversational state lives on an explicit `Session` owned
//! by the registry, keyed by session id: no process-wide mutable profile or
//! conversation log, so nothing leaks across sessions. Pipeline runs for one
//! session are serialized through its run lock; different sessions never
//! contend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use loom_agents::contracts::PreferenceProfile;
use loom_core::ids::SessionId;
use loom_core::model::{ChatTurn, GraphSnapshot};
use loom_graph::GraphStore;

use crate::scenario::{Scenario, ScenarioSet};

pub struct Session {
    pub id: SessionId,
    pub scenario: Option<Arc<Scenario>>,
    pub graph: Mutex<GraphStore>,
    pub conversation: Mutex<Vec<ChatTurn>>,
    pub profile: Mutex<PreferenceProfile>,
    pub triggered: Mutex<Vec<String>>,
    pub last_reply: Mutex<Option<String>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(
        id: SessionId,
        scenario: Option<Arc<Scenario>>,
        data_dir: Option<&Path>,
    ) -> Arc<Self> {
        let mut graph = match data_dir {
            Some(dir) => GraphStore::open(id.clone(), dir),
            None => GraphStore::in_memory(id.clone()),
        };
        if let Some(scenario) = &scenario {
            graph.seed(scenario.seed_nodes.clone(), scenario.seed_edges.clone());
        }

        Arc::new(Self {
            id,
            scenario,
            graph: Mutex::new(graph),
            conversation: Mutex::new(Vec::new()),
            profile: Mutex::new(PreferenceProfile::default()),
            triggered: Mutex::new(Vec::new()),
            last_reply: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Serializes pipeline runs for this session. Turn numbering and fuzzy
    /// dedup are not safe under concurrent mutation of one store.
    pub async fn run_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.lock().snapshot()
    }

    pub fn conversation_snapshot(&self) -> Vec<ChatTurn> {
        self.conversation.lock().clone()
    }

    pub fn triggered_snapshot(&self) -> Vec<String> {
        self.triggered.lock().clone()
    }
}

/// Process-wide map from session id to session, created lazily on first
/// contact.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    scenarios: Arc<ScenarioSet>,
    data_dir: Option<PathBuf>,
}

impl SessionRegistry {
    pub fn new(scenarios: Arc<ScenarioSet>, data_dir: Option<PathBuf>) -> Self {
        Self {
            sessions: DashMap::new(),
            scenarios,
            data_dir,
        }
    }

    /// Get an existing session or create one. A scenario id selects scenario
    /// mode (unknown ids fall back to the default scenario); `None` creates
    /// a plain companion session. The scenario choice of an existing session
    /// is never changed by later calls.
    pub fn get_or_create(&self, id: &SessionId, scenario_id: Option<&str>) -> Arc<Session> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| {
                let scenario = scenario_id
                    .and_then(|sid| self.scenarios.get(sid).or_else(|| self.scenarios.default_scenario()));
                info!(
                    session_id = %id,
                    scenario = scenario.as_ref().map(|s| s.id.as_str()).unwrap_or("none"),
                    "session created"
                );
                Session::new(id.clone(), scenario, self.data_dir.as_deref())
            })
            .clone()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn scenarios(&self) -> &Arc<ScenarioSet> {
        &self.scenarios
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(ScenarioSet::builtin(), None)
    }

    #[test]
    fn same_id_returns_same_session() {
        let reg = registry();
        let id = SessionId::from_raw("alpha");
        let a = reg.get_or_create(&id, None);
        let b = reg.get_or_create(&id, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn sessions_are_isolated() {
        let reg = registry();
        let a = reg.get_or_create(&SessionId::from_raw("a"), None);
        let b = reg.get_or_create(&SessionId::from_raw("b"), None);

        a.conversation.lock().push(ChatTurn::user("only in a"));
        assert!(b.conversation.lock().is_empty());
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn scenario_session_seeds_graph() {
        let reg = registry();
        let session = reg.get_or_create(&SessionId::from_raw("s"), Some("the_sycophant"));
        assert!(session.scenario.is_some());
        let snapshot = session.snapshot();
        assert_eq!(snapshot.nodes.len(), 3);
        assert_eq!(snapshot.links.len(), 1);
    }

    #[test]
    fn unknown_scenario_falls_back_to_default() {
        let reg = registry();
        let session = reg.get_or_create(&SessionId::from_raw("s"), Some("bogus"));
        assert_eq!(session.scenario.as_ref().unwrap().id, "the_sycophant");
    }

    #[test]
    fn companion_session_has_no_scenario() {
        let reg = registry();
        let session = reg.get_or_create(&SessionId::from_raw("c"), None);
        assert!(session.scenario.is_none());
        assert!(session.snapshot().nodes.is_empty());
    }

    #[test]
    fn scenario_choice_is_sticky() {
        let reg = registry();
        let id = SessionId::from_raw("sticky");
        let first = reg.get_or_create(&id, Some("the_sycophant"));
        let second = reg.get_or_create(&id, None);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.scenario.is_some());
    }
}
