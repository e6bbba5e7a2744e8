//! Relational backend over an embedded SQLite database.

use crate::compiler::NativeQuery;
use crate::error::ExecutionError;
use crate::executor::{Executor, RecordStream};
use crate::record::Record;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Number, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Rows buffered between the blocking reader and the consumer
const ROW_BUFFER: usize = 64;

pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteExecutor {
    /// Opens the database at `path` (`:memory:` for a private in-memory
    /// one) and runs the optional seed script.
    pub fn open(path: impl AsRef<Path>, table: impl Into<String>, seed: Option<&str>) -> Result<Self, ExecutionError> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        if let Some(seed) = seed {
            conn.execute_batch(seed)?;
        }
        tracing::debug!(path = %path.display(), "opened sqlite backend");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.into(),
        })
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(n) => Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(text) | ValueRef::Blob(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
    }
}

/// Reads every row of `statement`, sending each as a record. Stops as soon
/// as the receiving side is gone.
fn stream_rows(conn: &Connection, statement: &str, tx: &mpsc::Sender<Result<Record, ExecutionError>>) -> Result<(), ExecutionError> {
    let mut stmt = conn.prepare(statement)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (i, column) in columns.iter().enumerate() {
            record.insert(column.clone(), to_json(row.get_ref(i)?));
        }
        if tx.blocking_send(Ok(record)).is_err() {
            tracing::debug!("sqlite consumer gone, stopping iteration");
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn execute(&self, query: &NativeQuery) -> Result<RecordStream, ExecutionError> {
        let NativeQuery::Sql { statement } = query else {
            return Err(ExecutionError::Unsupported(query.to_string()));
        };

        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        let conn = Arc::clone(&self.conn);
        let statement = statement.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            if let Err(e) = stream_rows(&conn, &statement, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn fields(&self) -> Result<Vec<String>, ExecutionError> {
        let conn = Arc::clone(&self.conn);
        let statement = format!("SELECT * FROM \"{}\" LIMIT 1", self.table.replace('"', "\"\""));
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let stmt = conn.prepare(&statement)?;
            let mut fields: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            fields.sort();
            Ok(fields)
        })
        .await
        .map_err(|e| ExecutionError::Backend(e.to_string()))?
    }
}
