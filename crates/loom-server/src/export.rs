//! Session export: the graph plus transcript, as JSON or markdown.

use loom_core::model::{ChatRole, Visibility};
use loom_engine::Session;

pub fn export_json(session: &Session) -> serde_json::Value {
    serde_json::json!({
        "graph": session.snapshot(),
        "conversation": session.conversation_snapshot(),
        "breakthroughs": session.triggered_snapshot(),
    })
}

pub fn export_markdown(session: &Session) -> String {
    let snapshot = session.snapshot();
    let conversation = session.conversation_snapshot();
    let triggered = session.triggered_snapshot();

    let mut lines = vec![format!("# Session — {}\n", session.id)];
    if let Some(scenario) = &session.scenario {
        lines.push(format!("**Scenario:** {}\n", scenario.title));
        lines.push(format!(
            "**Breakthroughs:** {}/{}\n",
            triggered.len(),
            scenario.breakthroughs.len()
        ));
    }

    lines.push("\n## Graph State\n".into());
    for node in &snapshot.nodes {
        lines.push(format!(
            "- **{}** ({}, {}) — {}",
            node.label,
            node.kind,
            node.visibility.as_str(),
            node.description
        ));
    }

    if !snapshot.links.is_empty() {
        lines.push("\n## Relationships\n".into());
        for edge in &snapshot.links {
            let vis = match edge.visibility {
                Visibility::Bright => "bright",
                Visibility::Dim => "dim",
                Visibility::Hidden => "hidden",
            };
            lines.push(format!(
                "- {} —{}→ {} ({})",
                edge.source, edge.relation, edge.target, vis
            ));
        }
    }

    if !conversation.is_empty() {
        lines.push("\n## Transcript\n".into());
        for turn in &conversation {
            match (&turn.role, &turn.speaker) {
                (ChatRole::User, _) => lines.push(format!("**User:** {}\n", turn.content)),
                (ChatRole::Assistant, Some(speaker)) => {
                    lines.push(format!("**[{speaker}]:** {}\n", turn.content))
                }
                (ChatRole::Assistant, None) => {
                    lines.push(format!("**Companion:** {}\n", turn.content))
                }
            }
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::ids::SessionId;
    use loom_core::model::ChatTurn;
    use loom_engine::{ScenarioSet, SessionRegistry};

    #[test]
    fn json_export_carries_all_sections() {
        let registry = SessionRegistry::new(ScenarioSet::builtin(), None);
        let session = registry.get_or_create(&SessionId::from_raw("e"), Some("the_sycophant"));
        session.conversation.lock().push(ChatTurn::user("hello"));

        let value = export_json(&session);
        assert_eq!(value["graph"]["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(value["conversation"].as_array().unwrap().len(), 1);
        assert!(value["breakthroughs"].as_array().unwrap().is_empty());
    }

    #[test]
    fn markdown_export_renders_transcript_and_graph() {
        let registry = SessionRegistry::new(ScenarioSet::builtin(), None);
        let session = registry.get_or_create(&SessionId::from_raw("m"), Some("the_sycophant"));
        session.conversation.lock().push(ChatTurn::user("who spoke?"));
        session
            .conversation
            .lock()
            .push(ChatTurn::assistant(Some("Approval Drive".into()), "I did."));

        let md = export_markdown(&session);
        assert!(md.contains("# Session — m"));
        assert!(md.contains("**Scenario:** The Sycophant"));
        assert!(md.contains("**Approval Drive**"));
        assert!(md.contains("**User:** who spoke?"));
        assert!(md.contains("**[Approval Drive]:** I did."));
    }
}
