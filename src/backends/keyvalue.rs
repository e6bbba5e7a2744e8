//! Key-value store probed by a single field, standing in for lookup APIs.

use crate::compiler::NativeQuery;
use crate::error::ExecutionError;
use crate::executor::{record_fields, Executor, RecordStream};
use crate::record::{value_to_string, Record};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub struct KeyValueExecutor {
    field: String,
    entries: HashMap<String, Vec<Record>>,
}

impl KeyValueExecutor {
    /// Indexes `records` by their value of `field`. Records without it are
    /// unreachable and dropped.
    pub fn new(field: impl Into<String>, records: Vec<Record>) -> Self {
        let field = field.into();
        let mut entries: HashMap<String, Vec<Record>> = HashMap::new();
        for record in records {
            if let Some(key) = record.lookup(&field).map(value_to_string) {
                entries.entry(key).or_default().push(record);
            }
        }
        Self { field, entries }
    }

    pub fn from_json_file(path: impl AsRef<Path>, field: impl Into<String>) -> Result<Self, ExecutionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let records: Vec<Record> = serde_json::from_str(&content)
            .map_err(|e| ExecutionError::Decode(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(field, records))
    }
}

#[async_trait]
impl Executor for KeyValueExecutor {
    async fn execute(&self, query: &NativeQuery) -> Result<RecordStream, ExecutionError> {
        let NativeQuery::Lookup { field, value } = query else {
            return Err(ExecutionError::Unsupported(query.to_string()));
        };
        if *field != self.field {
            return Err(ExecutionError::Unsupported(format!("lookup by '{}', indexed by '{}'", field, self.field)));
        }

        let found = self.entries.get(value).cloned().unwrap_or_default();
        tracing::trace!(field = %field, value = %value, found = found.len(), "key lookup");
        Ok(futures::stream::iter(found.into_iter().map(Ok)).boxed())
    }

    async fn fields(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(record_fields(self.entries.values().flatten()))
    }
}
