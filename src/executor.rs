//! The backend execution contract.

use crate::compiler::NativeQuery;
use crate::error::ExecutionError;
use crate::record::Record;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// Records of one native query, in backend order. Dropping the stream stops
/// the backend iteration.
pub type RecordStream = BoxStream<'static, Result<Record, ExecutionError>>;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, query: &NativeQuery) -> Result<RecordStream, ExecutionError>;

    /// Physical field names, for autocomplete
    async fn fields(&self) -> Result<Vec<String>, ExecutionError>;
}

/// Sorted, de-duplicated field paths of the given records. Nested objects
/// contribute dotted paths.
pub(crate) fn record_fields<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<String> {
    let mut fields = Vec::new();
    for record in records {
        for (key, value) in record.iter() {
            collect_paths(key, value, &mut fields);
        }
    }
    fields.sort();
    fields.dedup();
    fields
}

fn collect_paths(prefix: &str, value: &Value, fields: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                collect_paths(&format!("{}.{}", prefix, key), nested, fields);
            }
        }
        _ => fields.push(prefix.to_string()),
    }
}
