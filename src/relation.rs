//! Relation definitions and the graph output model.

use crate::record::{Attributes, Record};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Declares how one record is projected into a graph edge.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationDefinition {
    pub from: NodeDefinition,
    pub to: NodeDefinition,
    #[serde(default)]
    pub edge: Option<EdgeDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Record field holding the node ID
    pub id: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Ordered overrides, the first rule matching the ID wins
    #[serde(default, alias = "varTypes")]
    pub type_rules: Vec<TypeRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeRule {
    #[serde(deserialize_with = "deserialize_regex")]
    pub regex: Regex,
    pub group: String,
    pub search: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EdgeDefinition {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Derives a relation definition for every record type a source returns.
///
/// A typed record keeps its value under a key named after its type, e.g.
/// `{"type": "ip-src", "ip-src": "1.2.3.4", "event": 42}`, so the inferred
/// definition for `ip-src` only projects records of that type.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationInference {
    /// Record field holding the type name
    pub type_field: String,
    /// Type name → group and search kind, other types use their own name
    #[serde(default)]
    pub groups: HashMap<String, String>,
    #[serde(default)]
    pub from_attributes: Vec<String>,
    pub to: NodeDefinition,
    #[serde(default)]
    pub edge: Option<EdgeDefinition>,
}

impl RelationInference {
    pub fn infer(&self, record: &Record) -> Option<RelationDefinition> {
        let kind = record.lookup(&self.type_field)?.as_str().filter(|k| !k.is_empty())?;
        let group = self.groups.get(kind).map_or(kind, String::as_str);
        Some(RelationDefinition {
            from: NodeDefinition {
                id: kind.to_string(),
                group: group.to_string(),
                search: group.to_string(),
                attributes: self.from_attributes.clone(),
                type_rules: Vec::new(),
            },
            to: self.to.clone(),
            edge: self.edge.clone(),
        })
    }
}

fn deserialize_regex<'de, D>(deserializer: D) -> Result<Regex, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern = String::deserialize(deserializer)?;
    Regex::new(&pattern).map_err(serde::de::Error::custom)
}

impl NodeDefinition {
    /// Group, search kind and label for the given node ID
    pub fn classify(&self, id: &str) -> (&str, &str, Option<&str>) {
        match self.type_rules.iter().find(|rule| rule.regex.is_match(id)) {
            Some(rule) => (
                rule.group.as_str(),
                rule.search.as_str(),
                rule.label.as_deref().filter(|l| !l.is_empty()),
            ),
            None => (self.group.as_str(), self.search.as_str(), None),
        }
    }
}

/// The relation definitions of one backend.
///
/// Readers take a snapshot; [`RelationSet::append`] publishes a new copy so a
/// snapshot never changes under a running search.
#[derive(Debug, Default)]
pub struct RelationSet {
    current: RwLock<Arc<Vec<RelationDefinition>>>,
}

impl RelationSet {
    pub fn new(definitions: Vec<RelationDefinition>) -> Self {
        Self {
            current: RwLock::new(Arc::new(definitions)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<RelationDefinition>> {
        Arc::clone(&self.current.read())
    }

    /// Whether a definition with the same from/to ID fields exists
    pub fn contains(&self, definition: &RelationDefinition) -> bool {
        self.current.read().iter().any(|d| same_endpoints(d, definition))
    }

    /// Appends definitions whose from/to ID fields are not known yet and
    /// returns how many were added. Existing ones are never replaced.
    pub fn append(&self, definitions: impl IntoIterator<Item = RelationDefinition>) -> usize {
        let mut current = self.current.write();
        let mut next = Vec::clone(&current);
        let known = next.len();
        for definition in definitions {
            if !next.iter().any(|d| same_endpoints(d, &definition)) {
                next.push(definition);
            }
        }

        let added = next.len() - known;
        if added > 0 {
            *current = Arc::new(next);
        }
        added
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same_endpoints(a: &RelationDefinition, b: &RelationDefinition) -> bool {
    a.from.id == b.from.id && a.to.id == b.to.id
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Value,
    pub group: String,
    pub search: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

/// The output unit: `from → to`, an optional edge and the producing backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelation {
    pub from: GraphNode,
    pub to: GraphNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<GraphEdge>,
    pub source: String,
}
