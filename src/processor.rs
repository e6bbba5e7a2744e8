//! Post-processing transforms applied to the merged relation list.

use crate::error::ProcessorError;
use crate::relation::{GraphNode, GraphRelation};
use crate::record::value_to_string;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Transforms the list in place. On error the list may be partially
    /// transformed.
    fn process(&self, relations: &mut Vec<GraphRelation>) -> Result<(), ProcessorError>;
}

/// Processor configuration, tagged by the `plugin` field
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "plugin", rename_all = "lowercase")]
pub enum ProcessorDefinition {
    Taxonomy {
        name: String,
        field: String,
        #[serde(default)]
        group: Option<String>,
        /// Node value → taxonomy entry
        taxonomy: BTreeMap<String, String>,
    },
    Modify {
        name: String,
        #[serde(default)]
        group: Option<String>,
        modify: Vec<ModifyRule>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModifyRule {
    pub field: String,
    pub regex: String,
    #[serde(default)]
    pub replacement: String,
}

impl ProcessorDefinition {
    pub fn build(self) -> Result<Box<dyn PostProcessor>, ProcessorError> {
        match self {
            ProcessorDefinition::Taxonomy { name, field, group, taxonomy } => Ok(Box::new(TaxonomyProcessor {
                name,
                field,
                group,
                taxonomy,
            })),
            ProcessorDefinition::Modify { name, group, modify } => {
                let rules = modify
                    .into_iter()
                    .map(|rule| {
                        Regex::new(&rule.regex)
                            .map(|regex| CompiledRule {
                                field: rule.field,
                                regex,
                                replacement: rule.replacement,
                            })
                            .map_err(|e| ProcessorError {
                                plugin: name.clone(),
                                message: format!("invalid regex '{}': {}", rule.regex, e),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Box::new(ModifyProcessor { name, group, rules }))
            }
        }
    }
}

/// Value of `field` on a node: one of the node's own fields or an attribute
fn node_value(node: &GraphNode, field: &str) -> Option<String> {
    match field {
        "id" => Some(value_to_string(&node.id)),
        "group" => Some(node.group.clone()),
        "search" => Some(node.search.clone()),
        "label" => node.label.clone(),
        _ => node
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get(field))
            .map(value_to_string),
    }
}

/// Links nodes whose field value has a taxonomy entry to a `taxonomy` node
pub struct TaxonomyProcessor {
    name: String,
    field: String,
    group: Option<String>,
    taxonomy: BTreeMap<String, String>,
}

impl PostProcessor for TaxonomyProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, relations: &mut Vec<GraphRelation>) -> Result<(), ProcessorError> {
        let mut added = Vec::new();
        for relation in relations.iter() {
            for node in [&relation.from, &relation.to] {
                if self.group.as_ref().is_some_and(|g| *g != node.group) {
                    continue;
                }
                let Some(value) = node_value(node, &self.field) else {
                    continue;
                };
                if let Some(entry) = self.taxonomy.get(&value) {
                    added.push(GraphRelation {
                        from: GraphNode {
                            id: Value::String(value),
                            group: node.group.clone(),
                            search: node.search.clone(),
                            label: None,
                            attributes: None,
                        },
                        to: GraphNode {
                            id: Value::String(entry.clone()),
                            group: "taxonomy".to_string(),
                            search: "taxonomy".to_string(),
                            label: None,
                            attributes: None,
                        },
                        edge: None,
                        source: self.name.clone(),
                    });
                }
            }
        }
        relations.extend(added);
        Ok(())
    }
}

struct CompiledRule {
    field: String,
    regex: Regex,
    replacement: String,
}

/// Regex replacement over node IDs and attributes
pub struct ModifyProcessor {
    name: String,
    group: Option<String>,
    rules: Vec<CompiledRule>,
}

impl ModifyProcessor {
    fn modify_node(&self, rule: &CompiledRule, node: &mut GraphNode) -> Result<(), ProcessorError> {
        if self.group.as_ref().is_some_and(|g| *g != node.group) {
            return Ok(());
        }
        if rule.field == "id" {
            node.id = Value::String(self.replace(rule, &node.id)?);
        }
        if let Some(value) = node.attributes.as_mut().and_then(|attrs| attrs.get_mut(&rule.field)) {
            *value = Value::String(self.replace(rule, value)?);
        }
        Ok(())
    }

    fn replace(&self, rule: &CompiledRule, value: &Value) -> Result<String, ProcessorError> {
        match value {
            Value::String(s) => Ok(rule.regex.replace_all(s, rule.replacement.as_str()).into_owned()),
            Value::Number(_) | Value::Bool(_) => {
                Ok(rule.regex.replace_all(&value_to_string(value), rule.replacement.as_str()).into_owned())
            }
            other => Err(ProcessorError {
                plugin: self.name.clone(),
                message: format!("can't modify non-scalar '{}' value {}", rule.field, other),
            }),
        }
    }
}

impl PostProcessor for ModifyProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, relations: &mut Vec<GraphRelation>) -> Result<(), ProcessorError> {
        for relation in relations.iter_mut() {
            for rule in &self.rules {
                self.modify_node(rule, &mut relation.from)?;
                self.modify_node(rule, &mut relation.to)?;
                // Edges have no group, so a group filter skips them
                if self.group.is_none() {
                    if let Some(value) = relation
                        .edge
                        .as_mut()
                        .and_then(|edge| edge.attributes.as_mut())
                        .and_then(|attrs| attrs.get_mut(&rule.field))
                    {
                        *value = Value::String(self.replace(rule, value)?);
                    }
                }
            }
        }
        Ok(())
    }
}
