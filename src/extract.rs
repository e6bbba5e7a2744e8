//! Projection of raw records into graph relations, with deduplication.

use crate::record::{value_to_string, Record};
use crate::relation::{GraphEdge, GraphNode, GraphRelation, NodeDefinition, RelationDefinition};
use serde_json::Value;
use std::collections::HashMap;

/// `(fromIdField, fromId, toIdField, toId)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationKey {
    pub from_field: String,
    pub from_id: String,
    pub to_field: String,
    pub to_id: String,
}

/// Projects one record through one definition. `None` when either endpoint
/// ID is missing or null.
pub fn project(definition: &RelationDefinition, source: &str, record: &Record) -> Option<(RelationKey, GraphRelation)> {
    let from_id = record.lookup(&definition.from.id)?;
    let to_id = record.lookup(&definition.to.id)?;

    let key = RelationKey {
        from_field: definition.from.id.clone(),
        from_id: value_to_string(from_id),
        to_field: definition.to.id.clone(),
        to_id: value_to_string(to_id),
    };

    let from = project_node(&definition.from, from_id, &key.from_id, record);
    let to = project_node(&definition.to, to_id, &key.to_id, record);

    let edge = definition.edge.as_ref().and_then(|edge| {
        let static_label = edge.label.as_deref().filter(|l| !l.is_empty());
        if static_label.is_none() && edge.attributes.is_empty() {
            return None;
        }
        // A type rule label on an endpoint overrides the declared one
        let label = to
            .label
            .clone()
            .or_else(|| from.label.clone())
            .or_else(|| static_label.map(str::to_string));
        let attributes = (!edge.attributes.is_empty()).then(|| record.copy_present(&edge.attributes));
        Some(GraphEdge { label, attributes })
    });

    Some((
        key,
        GraphRelation {
            from,
            to,
            edge,
            source: source.to_string(),
        },
    ))
}

fn project_node(definition: &NodeDefinition, id: &Value, id_text: &str, record: &Record) -> GraphNode {
    let (group, search, label) = definition.classify(id_text);
    GraphNode {
        id: id.clone(),
        group: group.to_string(),
        search: search.to_string(),
        label: label.map(str::to_string),
        attributes: (!definition.attributes.is_empty()).then(|| record.copy_present(&definition.attributes)),
    }
}

/// Unique relations collected so far.
///
/// A relation whose key is already known is only kept when its attributes
/// differ from every relation stored under that key.
#[derive(Debug, Default)]
pub struct RelationCollector {
    relations: Vec<GraphRelation>,
    keys: Vec<RelationKey>,
    index: HashMap<RelationKey, Vec<usize>>,
}

impl RelationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the relation was added
    pub fn insert(&mut self, key: RelationKey, relation: GraphRelation) -> bool {
        if let Some(positions) = self.index.get(&key) {
            if positions.iter().any(|&i| same_attributes(&self.relations[i], &relation)) {
                return false;
            }
        }

        let position = self.relations.len();
        self.index.entry(key.clone()).or_default().push(position);
        self.keys.push(key);
        self.relations.push(relation);
        true
    }

    /// Moves every relation of `other` in, keeping the uniqueness rules
    pub fn merge(&mut self, other: RelationCollector) -> usize {
        other
            .keys
            .into_iter()
            .zip(other.relations)
            .map(|(key, relation)| self.insert(key, relation))
            .filter(|added| *added)
            .count()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn relations(&self) -> &[GraphRelation] {
        &self.relations
    }

    pub fn into_relations(self) -> Vec<GraphRelation> {
        self.relations
    }
}

fn same_attributes(a: &GraphRelation, b: &GraphRelation) -> bool {
    a.from.attributes == b.from.attributes
        && a.to.attributes == b.to.attributes
        && a.edge.as_ref().and_then(|e| e.attributes.as_ref()) == b.edge.as_ref().and_then(|e| e.attributes.as_ref())
}

/// Evaluates every definition against the record independently.
/// Returns how many new relations were collected.
pub fn extract_relations(
    source: &str,
    definitions: &[RelationDefinition],
    record: &Record,
    collector: &mut RelationCollector,
) -> usize {
    let mut added = 0;
    for (key, relation) in definitions.iter().filter_map(|d| project(d, source, record)) {
        if collector.insert(key, relation) {
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: Value) -> RelationDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn record(value: Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    fn ip_domain() -> RelationDefinition {
        definition(json!({
            "from": { "id": "ip", "group": "ip", "search": "ip", "attributes": ["asn"] },
            "to": { "id": "domain", "group": "domain", "search": "domain" }
        }))
    }

    #[test]
    fn test_projection_with_type_rules_and_edge_label() {
        let def = definition(json!({
            "from": {
                "id": "ip", "group": "ip", "search": "ip",
                "varTypes": [ { "regex": ":", "group": "ipv6", "search": "ip", "label": "v6" } ]
            },
            "to": { "id": "geo.city", "group": "city", "search": "city", "attributes": ["geo.country"] },
            "edge": { "label": "located", "attributes": ["seen"] }
        }));
        let rec = record(json!({ "ip": "::1", "geo": { "city": "Riga", "country": "LV" }, "seen": 3 }));

        let (key, relation) = project(&def, "geoip", &rec).unwrap();

        assert_eq!(key.from_id, "::1");
        assert_eq!(key.to_field, "geo.city");
        assert_eq!(relation.from.group, "ipv6");
        assert_eq!(relation.from.label.as_deref(), Some("v6"));
        assert_eq!(relation.to.attributes, Some(json!({ "geo.country": "LV" }).as_object().unwrap().clone()));
        let edge = relation.edge.unwrap();
        assert_eq!(edge.label.as_deref(), Some("v6"));
        assert_eq!(edge.attributes, Some(json!({ "seen": 3 }).as_object().unwrap().clone()));
        assert_eq!(relation.source, "geoip");
    }

    #[test]
    fn test_missing_or_null_endpoint_produces_nothing() {
        assert!(project(&ip_domain(), "s", &record(json!({ "ip": "1.2.3.4" }))).is_none());
        assert!(project(&ip_domain(), "s", &record(json!({ "ip": "1.2.3.4", "domain": null }))).is_none());
    }

    #[test]
    fn test_edge_requires_label_or_attributes() {
        let def = definition(json!({
            "from": { "id": "a" }, "to": { "id": "b" }, "edge": { "label": "" }
        }));
        let (_, relation) = project(&def, "s", &record(json!({ "a": 1, "b": 2 }))).unwrap();
        assert!(relation.edge.is_none());
    }

    #[test]
    fn test_identical_relations_from_two_backends_collapse() {
        let def = ip_domain();
        let mut collector = RelationCollector::new();
        let rec = record(json!({ "ip": "1.2.3.4", "domain": "evil.com", "asn": 64500 }));

        assert_eq!(extract_relations("first", std::slice::from_ref(&def), &rec, &mut collector), 1);
        assert_eq!(extract_relations("second", std::slice::from_ref(&def), &rec, &mut collector), 0);
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn test_differing_attributes_are_kept() {
        let def = ip_domain();
        let mut collector = RelationCollector::new();

        extract_relations("first", std::slice::from_ref(&def), &record(json!({ "ip": "1.2.3.4", "domain": "evil.com", "asn": 1 })), &mut collector);
        extract_relations("second", std::slice::from_ref(&def), &record(json!({ "ip": "1.2.3.4", "domain": "evil.com", "asn": 2 })), &mut collector);
        extract_relations("third", std::slice::from_ref(&def), &record(json!({ "ip": "1.2.3.4", "domain": "evil.com", "asn": 1 })), &mut collector);

        assert_eq!(collector.len(), 2);
    }

    #[test]
    fn test_one_record_feeds_several_definitions() {
        let defs = vec![
            ip_domain(),
            definition(json!({
                "from": { "id": "category", "group": "category", "search": "category" },
                "to": { "id": "comment", "group": "comment", "search": "comment" }
            })),
            definition(json!({
                "from": { "id": "comment", "group": "comment", "search": "comment" },
                "to": { "id": "ip", "group": "ip", "search": "ip" }
            })),
        ];
        let rec = record(json!({ "ip": "1.2.3.4", "comment": "ssh brute force", "category": "attack" }));
        let mut collector = RelationCollector::new();

        assert_eq!(extract_relations("abuse", &defs, &rec, &mut collector), 2);
    }

    #[test]
    fn test_merge_keeps_uniqueness() {
        let def = ip_domain();
        let rec = record(json!({ "ip": "1.2.3.4", "domain": "evil.com" }));
        let other_rec = record(json!({ "ip": "5.6.7.8", "domain": "evil.com" }));

        let mut a = RelationCollector::new();
        extract_relations("a", std::slice::from_ref(&def), &rec, &mut a);
        let mut b = RelationCollector::new();
        extract_relations("b", std::slice::from_ref(&def), &rec, &mut b);
        extract_relations("b", std::slice::from_ref(&def), &other_rec, &mut b);

        assert_eq!(a.merge(b), 1);
        assert_eq!(a.len(), 2);
        assert_eq!(a.relations()[0].source, "a");
    }
}
