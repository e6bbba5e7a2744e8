//! Concrete backends and the factory building them from configuration.

pub mod document;
pub mod keyvalue;
pub mod sqlite;

use crate::compiler::QueryCompiler;
use crate::config::{BackendKind, SourceConfig};
use crate::document_compiler::DocumentCompiler;
use crate::error::ExecutionError;
use crate::executor::Executor;
use crate::lookup_compiler::LookupCompiler;
use crate::sql_compiler::SqlCompiler;

pub use document::DocumentExecutor;
pub use keyvalue::KeyValueExecutor;
pub use sqlite::SqliteExecutor;

/// Compiler and executor pair of one configured source
pub fn build_backend(source: &SourceConfig) -> Result<(Box<dyn QueryCompiler>, Box<dyn Executor>), ExecutionError> {
    match &source.backend {
        BackendKind::Sqlite { path, table, seed, dialect } => Ok((
            Box::new(SqlCompiler::new(table.clone(), *dialect)),
            Box::new(SqliteExecutor::open(path, table.clone(), seed.as_deref())?),
        )),
        BackendKind::Document { path } => Ok((
            Box::new(DocumentCompiler::new()),
            Box::new(DocumentExecutor::from_json_file(path)?),
        )),
        BackendKind::KeyValue { path, field } => Ok((
            Box::new(LookupCompiler::new(field.clone())),
            Box::new(KeyValueExecutor::from_json_file(path, field.clone())?),
        )),
    }
}
