//! Trust boundary for agent-sourced JSON. Extraction output is parsed
//! leniently, then coerced into typed graph entities: unknown node kinds are
//! coerced to `memory`, relationships with unknown kinds or missing fields
//! are dropped, and numeric fields are clamped into range.

use serde::Deserialize;
use tracing::warn;

use loom_core::model::{Edge, Node, NodeKind, RelationKind, Visibility};

use crate::contracts::{ExtractedEntity, Extraction};

/// Extraction output as the model actually returns it: optional everything,
/// enum fields as free strings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub relationships: Vec<RawRelation>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawEntity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub importance: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub is_update: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawRelation {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(rename = "type", default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Coerce a raw extraction into typed entities and relationships.
pub fn validate_extraction(raw: RawExtraction) -> Extraction {
    let mut entities = Vec::new();
    for raw_entity in raw.entities {
        match validate_entity(raw_entity) {
            Some(entity) => entities.push(entity),
            None => warn!("dropping extracted entity without a usable label"),
        }
    }

    let mut relationships = Vec::new();
    for raw_relation in raw.relationships {
        match validate_relation(raw_relation) {
            Some(edge) => relationships.push(edge),
            None => warn!("dropping relationship with unknown kind or missing endpoint"),
        }
    }

    Extraction {
        entities,
        relationships,
    }
}

fn validate_entity(raw: RawEntity) -> Option<ExtractedEntity> {
    let label = raw.label.as_deref().map(str::trim).filter(|l| !l.is_empty())?;

    let kind = match raw.kind.as_deref() {
        Some(s) => NodeKind::parse_lenient(s).unwrap_or_else(|| {
            warn!(kind = s, "unknown node kind, coercing to memory");
            NodeKind::Memory
        }),
        None => NodeKind::Memory,
    };

    let id = raw
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}_{}", kind, slug(label)));

    let importance = clamp_weight(raw.importance, 5);
    let size = clamp_weight(raw.size, importance);

    Some(ExtractedEntity {
        node: Node {
            id,
            label: label.to_string(),
            kind,
            description: raw.description.unwrap_or_default(),
            importance,
            size,
            visibility: Visibility::Bright,
            color: Some(
                raw.color
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| kind.default_color().to_string()),
            ),
        },
        is_update: raw.is_update.unwrap_or(false),
    })
}

fn validate_relation(raw: RawRelation) -> Option<Edge> {
    let source = raw.source.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    let target = raw.target.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    let relation = RelationKind::parse_lenient(raw.relation.as_deref()?)?;

    Some(Edge {
        source: source.to_string(),
        target: target.to_string(),
        relation,
        label: raw.label.filter(|l| !l.trim().is_empty()),
        visibility: Visibility::Bright,
    })
}

fn clamp_weight(value: Option<i64>, default: u8) -> u8 {
    match value {
        Some(v) => v.clamp(1, 10) as u8,
        None => default,
    }
}

fn slug(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
