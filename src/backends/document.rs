//! In-memory document collection evaluating Mongo-style filters.

use crate::compiler::{DocumentQuery, NativeQuery, SortKey};
use crate::error::ExecutionError;
use crate::executor::{record_fields, Executor, RecordStream};
use crate::record::Record;
use async_trait::async_trait;
use futures::StreamExt;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

/// A compiled filter document
#[derive(Debug)]
pub enum DocumentFilter {
    All(Vec<DocumentFilter>),
    Any(Vec<DocumentFilter>),
    Field { path: String, conditions: Vec<Condition> },
}

#[derive(Debug)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Gt(Value),
    Lte(Value),
    Gte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Not(Vec<Condition>),
}

fn decode_error(message: impl Into<String>) -> ExecutionError {
    ExecutionError::Decode(message.into())
}

impl DocumentFilter {
    pub fn compile(filter: &Value) -> Result<Self, ExecutionError> {
        let object = filter
            .as_object()
            .ok_or_else(|| decode_error(format!("filter must be an object, got {}", filter)))?;

        let mut clauses = Vec::with_capacity(object.len());
        for (key, value) in object {
            let clause = match key.as_str() {
                "$and" => DocumentFilter::All(Self::compile_list(value)?),
                "$or" => DocumentFilter::Any(Self::compile_list(value)?),
                op if op.starts_with('$') => return Err(decode_error(format!("unknown top-level operator {}", op))),
                path => DocumentFilter::Field {
                    path: path.to_string(),
                    conditions: compile_conditions(value)?,
                },
            };
            clauses.push(clause);
        }

        Ok(match clauses.len() {
            1 => clauses.remove(0),
            _ => DocumentFilter::All(clauses),
        })
    }

    fn compile_list(value: &Value) -> Result<Vec<DocumentFilter>, ExecutionError> {
        value
            .as_array()
            .ok_or_else(|| decode_error("$and/$or expect an array"))?
            .iter()
            .map(Self::compile)
            .collect()
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            DocumentFilter::All(filters) => filters.iter().all(|f| f.matches(record)),
            DocumentFilter::Any(filters) => filters.iter().any(|f| f.matches(record)),
            DocumentFilter::Field { path, conditions } => {
                let value = record.lookup(path);
                conditions.iter().all(|c| c.matches(value))
            }
        }
    }
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn compile_conditions(value: &Value) -> Result<Vec<Condition>, ExecutionError> {
    let Value::Object(map) = value else {
        return Ok(vec![Condition::Eq(value.clone())]);
    };
    if !is_operator_object(map) {
        return Ok(vec![Condition::Eq(value.clone())]);
    }

    let mut conditions = Vec::with_capacity(map.len());
    for (op, operand) in map {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$gt" => Condition::Gt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$in" => Condition::In(array(operand)?),
            "$nin" => Condition::Nin(array(operand)?),
            "$exists" => Condition::Exists(operand.as_bool().unwrap_or(true)),
            "$regex" => Condition::Regex(compile_regex(operand, map.get("$options"))?),
            "$options" => continue,
            "$not" => Condition::Not(compile_conditions(operand)?),
            other => return Err(decode_error(format!("unknown operator {}", other))),
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn array(value: &Value) -> Result<Vec<Value>, ExecutionError> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| decode_error(format!("expected an array, got {}", value)))
}

fn compile_regex(pattern: &Value, options: Option<&Value>) -> Result<Regex, ExecutionError> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| decode_error(format!("$regex expects a string, got {}", pattern)))?;
    let case_insensitive = options.and_then(Value::as_str).is_some_and(|o| o.contains('i'));
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| decode_error(e.to_string()))
}

impl Condition {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Condition::Eq(expected) => value.is_some_and(|v| values_equal(v, expected)),
            Condition::Ne(expected) => !value.is_some_and(|v| values_equal(v, expected)),
            Condition::Lt(bound) => compare(value, bound) == Some(Ordering::Less),
            Condition::Gt(bound) => compare(value, bound) == Some(Ordering::Greater),
            Condition::Lte(bound) => matches!(compare(value, bound), Some(Ordering::Less | Ordering::Equal)),
            Condition::Gte(bound) => matches!(compare(value, bound), Some(Ordering::Greater | Ordering::Equal)),
            Condition::In(items) => value.is_some_and(|v| items.iter().any(|item| values_equal(v, item))),
            Condition::Nin(items) => !value.is_some_and(|v| items.iter().any(|item| values_equal(v, item))),
            Condition::Exists(expected) => value.is_some() == *expected,
            Condition::Regex(regex) => value.and_then(Value::as_str).is_some_and(|s| regex.is_match(s)),
            Condition::Not(conditions) => !conditions.iter().all(|c| c.matches(value)),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between values of the same kind, `None` otherwise
fn compare(value: Option<&Value>, bound: &Value) -> Option<Ordering> {
    match (value?, bound) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting: missing < numbers < strings < everything else
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) if rank(a) == rank(b) => {
            compare(Some(x), y).unwrap_or_else(|| x.to_string().cmp(&y.to_string()))
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    records.sort_by(|a, b| {
        keys.iter()
            .map(|key| {
                let ordering = sort_order(a.lookup(&key.field), b.lookup(&key.field));
                if key.direction < 0 {
                    ordering.reverse()
                } else {
                    ordering
                }
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

pub struct DocumentExecutor {
    documents: Vec<Record>,
}

impl DocumentExecutor {
    pub fn new(documents: Vec<Record>) -> Self {
        Self { documents }
    }

    /// Loads a JSON array of objects
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ExecutionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let documents: Vec<Record> =
            serde_json::from_str(&content).map_err(|e| decode_error(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), documents = documents.len(), "loaded document collection");
        Ok(Self::new(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn run(&self, query: &DocumentQuery) -> Result<Vec<Record>, ExecutionError> {
        let filter = DocumentFilter::compile(&query.filter)?;
        let mut found: Vec<Record> = self.documents.iter().filter(|d| filter.matches(d)).cloned().collect();
        if !query.sort.is_empty() {
            sort_records(&mut found, &query.sort);
        }
        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        Ok(found.into_iter().skip(skip).take(limit).collect())
    }
}

#[async_trait]
impl Executor for DocumentExecutor {
    async fn execute(&self, query: &NativeQuery) -> Result<RecordStream, ExecutionError> {
        let NativeQuery::Document(query) = query else {
            return Err(ExecutionError::Unsupported(query.to_string()));
        };
        let found = self.run(query)?;
        Ok(futures::stream::iter(found.into_iter().map(Ok)).boxed())
    }

    async fn fields(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(record_fields(&self.documents))
    }
}
